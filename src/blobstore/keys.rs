//! Deterministic storage keys
//!
//! Key layout:
//! - videos:      `{workspace}/{project}/source.{ext}`
//! - transcripts: `{workspace}/{project}/transcript.srt` / `.json`
//! - renders:     `{workspace}/{project}/{clip}.mp4`
//! - thumbs:      `{workspace}/{project}/{clip}.jpg`

use uuid::Uuid;

pub fn source(workspace_id: Uuid, project_id: Uuid, ext: &str) -> String {
    format!("{}/{}/source.{}", workspace_id, project_id, ext)
}

pub fn transcript_srt(workspace_id: Uuid, project_id: Uuid) -> String {
    format!("{}/{}/transcript.srt", workspace_id, project_id)
}

pub fn transcript_json(workspace_id: Uuid, project_id: Uuid) -> String {
    format!("{}/{}/transcript.json", workspace_id, project_id)
}

pub fn render(workspace_id: Uuid, project_id: Uuid, clip_id: Uuid) -> String {
    format!("{}/{}/{}.mp4", workspace_id, project_id, clip_id)
}

pub fn thumb(workspace_id: Uuid, project_id: Uuid, clip_id: Uuid) -> String {
    format!("{}/{}/{}.jpg", workspace_id, project_id, clip_id)
}

/// Extracts the clip id from a render key, when the final segment follows
/// the `{clipId}.mp4` pattern. Used by the orphan sweep.
pub fn clip_id_from_render_key(key: &str) -> Option<Uuid> {
    let file = key.rsplit('/').next()?;
    let stem = file.strip_suffix(".mp4")?;
    Uuid::parse_str(stem).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let ws = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
        let project = Uuid::parse_str("22222222-2222-2222-2222-222222222222").unwrap();
        let clip = Uuid::parse_str("33333333-3333-3333-3333-333333333333").unwrap();

        assert_eq!(
            source(ws, project, "mp4"),
            "11111111-1111-1111-1111-111111111111/22222222-2222-2222-2222-222222222222/source.mp4"
        );
        assert!(render(ws, project, clip).ends_with("33333333-3333-3333-3333-333333333333.mp4"));
        assert!(thumb(ws, project, clip).ends_with(".jpg"));
    }

    #[test]
    fn test_clip_id_round_trip() {
        let ws = Uuid::new_v4();
        let project = Uuid::new_v4();
        let clip = Uuid::new_v4();
        let key = render(ws, project, clip);
        assert_eq!(clip_id_from_render_key(&key), Some(clip));
    }

    #[test]
    fn test_clip_id_rejects_foreign_keys() {
        assert_eq!(clip_id_from_render_key("ws/project/source.mp4"), None);
        assert_eq!(clip_id_from_render_key("ws/project/clip.jpg"), None);
        assert_eq!(clip_id_from_render_key(""), None);
    }
}
