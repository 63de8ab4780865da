//! Highlight detection
//!
//! Groups transcript segments into candidate windows, scores them against
//! requested keywords, consolidates against existing clips (overlap and
//! near-duplicate removal), and inserts the winners atomically. The pure
//! kernels live at the top of the module so the laws are testable without
//! any I/O.

use tracing::info;

use crate::cancel::CancelToken;
use crate::error::{Result, WorkerError};
use crate::media::{Transcript, TranscriptSegment};
use crate::models::payload::decode;
use crate::models::{HighlightDetectPayload, Job, JobKind, NewClip, UsageMetric};
use crate::plan::Plan;
use crate::stage::PipelineStage;

use super::WorkerContext;

/// Absolute ceiling on clips per detection run.
const HARD_MAX_CLIPS: u32 = 30;
/// Candidate windows are capped at this many seconds.
const MAX_CANDIDATE_LEN_S: f64 = 60.0;
/// Runs shorter than this are rejected.
const MIN_CANDIDATE_LEN_S: f64 = 10.0;
/// Confidence assumed for segments that carry none.
const DEFAULT_CONFIDENCE: f64 = 0.75;
/// Start/end proximity that makes two windows near-duplicates.
const NEAR_DUPLICATE_S: f64 = 1.5;

/// A scored candidate window.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub start_s: f64,
    pub end_s: f64,
    pub confidence: f64,
    pub keyword_hits: u32,
    pub score: f64,
    pub title: String,
}

impl Candidate {
    pub fn duration_s(&self) -> f64 {
        self.end_s - self.start_s
    }

    fn overlaps(&self, start_s: f64, end_s: f64) -> bool {
        self.start_s < end_s && start_s < self.end_s
    }

    fn near_duplicate_of(&self, start_s: f64, end_s: f64) -> bool {
        let start_close = (self.start_s - start_s).abs() <= NEAR_DUPLICATE_S;
        let end_close = (self.end_s - end_s).abs() <= NEAR_DUPLICATE_S;
        (start_close && end_close) || start_close
    }
}

/// Maximum clips for one detection run.
///
/// Baseline grows with source duration, the soft cap derives from the
/// monthly clip budget, the request override (floored, ignored when
/// non-positive or non-finite) and plan's per-project cap clamp the result
/// into `[1, 30]`. Non-decreasing in duration for a fixed plan.
pub fn compute_max_clips(duration_ms: f64, plan: Plan, request_override: Option<f64>) -> u32 {
    let limits = plan.limits();
    let soft_cap = ((limits.clips_per_month / 20) as u32).max(3);

    let minutes = duration_ms / 60_000.0;
    let baseline: u32 = if minutes <= 1.0 {
        2
    } else if minutes <= 5.0 {
        (2 + minutes.floor() as u32).min(6)
    } else if minutes <= 15.0 {
        (6 + ((minutes - 5.0) / 2.0).floor() as u32).min(10)
    } else {
        (10 + ((minutes - 15.0) / 5.0).floor() as u32).min(soft_cap)
    };

    let mut max_clips = baseline;
    if let Some(raw) = request_override {
        if raw.is_finite() && raw >= 1.0 {
            max_clips = raw.floor() as u32;
        }
    }

    max_clips
        .min(limits.clips_per_project)
        .min(soft_cap)
        .min(HARD_MAX_CLIPS)
        .max(1)
}

/// Groups segments into runs separated by silence and scores each run.
pub fn build_candidates(
    segments: &[TranscriptSegment],
    keywords: &[String],
    min_gap_sec: f64,
) -> Vec<Candidate> {
    let mut runs: Vec<Vec<&TranscriptSegment>> = Vec::new();
    for segment in segments {
        match runs.last_mut() {
            Some(run) if segment.start - run.last().expect("non-empty run").end <= min_gap_sec => {
                run.push(segment);
            }
            _ => runs.push(vec![segment]),
        }
    }

    runs.into_iter()
        .filter_map(|run| candidate_from_run(&run, keywords))
        .collect()
}

fn candidate_from_run(run: &[&TranscriptSegment], keywords: &[String]) -> Option<Candidate> {
    let first = run.first()?;
    let last = run.last()?;

    let start_s = first.start;
    let end_s = last.end.min(start_s + MAX_CANDIDATE_LEN_S);
    if end_s - start_s < MIN_CANDIDATE_LEN_S {
        return None;
    }

    let confidence = run
        .iter()
        .map(|s| s.confidence.unwrap_or(DEFAULT_CONFIDENCE))
        .sum::<f64>()
        / run.len() as f64;

    let text: String = run
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let lowered = text.to_lowercase();
    let matched: Vec<&String> = keywords
        .iter()
        .filter(|kw| !kw.trim().is_empty() && lowered.contains(&kw.to_lowercase()))
        .collect();
    let keyword_hits = matched.len() as u32;

    let title = derive_title(&text, matched.first().map(|kw| kw.as_str()));

    Some(Candidate {
        start_s,
        end_s,
        confidence,
        keyword_hits,
        score: keyword_hits as f64 + confidence,
        title,
    })
}

fn derive_title(text: &str, keyword: Option<&str>) -> String {
    let sentence = text
        .split_inclusive(['.', '!', '?'])
        .next()
        .unwrap_or("")
        .trim()
        .trim_end_matches(['.', '!', '?'])
        .trim();
    if !sentence.is_empty() {
        let mut title: String = sentence.chars().take(80).collect();
        if sentence.chars().count() > 80 {
            title.push('…');
        }
        return title;
    }
    if let Some(keyword) = keyword {
        if !keyword.trim().is_empty() {
            return keyword.trim().to_string();
        }
    }
    "Highlight".to_string()
}

/// Greedy consolidation against already-persisted clip windows.
///
/// Candidates are taken in `(score desc, duration asc)` order; a candidate
/// survives when it neither time-overlaps nor near-duplicates anything kept
/// or existing. Output, sorted by start, is strictly non-overlapping.
pub fn consolidate(
    mut candidates: Vec<Candidate>,
    existing: &[(f64, f64)],
    max_clips: u32,
) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.duration_s().total_cmp(&b.duration_s()))
    });

    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if kept.len() >= max_clips as usize {
            break;
        }
        let blocked = existing
            .iter()
            .copied()
            .chain(kept.iter().map(|c| (c.start_s, c.end_s)))
            .any(|(start, end)| {
                candidate.overlaps(start, end) || candidate.near_duplicate_of(start, end)
            });
        if !blocked {
            kept.push(candidate);
        }
    }
    kept
}

pub async fn handle(job: &Job, ctx: &WorkerContext, cancel: &CancelToken) -> Result<()> {
    let payload: HighlightDetectPayload = decode(job.kind, &job.payload)?;

    let project = ctx
        .store
        .get_project(payload.project_id)
        .await?
        .ok_or(WorkerError::NotFound {
            entity: "project",
            id: payload.project_id.to_string(),
        })?;

    if project
        .pipeline_stage
        .is_at_least(PipelineStage::ClipsGenerated)
    {
        info!(project_id = %project.id, "Clips already generated, skipping");
        return Ok(());
    }

    // Load and parse the transcript artifact.
    let json_key = crate::blobstore::keys::transcript_json(project.workspace_id, project.id);
    let tmp = crate::tempfiles::JobTempDir::create(&ctx.temp_root, job.id).await?;
    let local = tmp.file("transcript.json");
    let transcript: Transcript = {
        let result = async {
            ctx.blobs
                .download(&ctx.buckets.transcripts, &json_key, &local)
                .await?;
            let bytes = tokio::fs::read(&local).await?;
            let transcript: Transcript = serde_json::from_slice(&bytes)?;
            Ok::<_, WorkerError>(transcript)
        }
        .await;
        tmp.cleanup().await;
        result?
    };
    cancel.bail_if_cancelled()?;

    let plan = ctx.admission.resolve_plan(job.workspace_id).await?;
    let max_clips = compute_max_clips(
        transcript.duration_sec * 1000.0,
        plan,
        payload.max_clips,
    );

    ctx.admission
        .assert_within_usage(job.workspace_id, UsageMetric::Clips, max_clips as i64)
        .await?;

    let candidates = build_candidates(
        &transcript.segments,
        &payload.keywords,
        payload.min_gap_sec,
    );
    let existing: Vec<(f64, f64)> = ctx
        .store
        .list_clips(project.id)
        .await?
        .iter()
        .map(|c| (c.start_s, c.end_s))
        .collect();
    let accepted = consolidate(candidates, &existing, max_clips);

    if accepted.is_empty() {
        let advanced = ctx
            .store
            .advance_stage(project.id, PipelineStage::ClipsGenerated, ctx.clock.now())
            .await?;
        info!(project_id = %project.id, advanced, "No new highlight candidates survived consolidation");
        return Ok(());
    }

    let new_clips: Vec<NewClip> = accepted
        .iter()
        .map(|c| NewClip {
            project_id: project.id,
            workspace_id: project.workspace_id,
            start_s: c.start_s,
            end_s: c.end_s,
            confidence: c.confidence,
            title: c.title.clone(),
            keywords_hit: c.keyword_hits as i32,
        })
        .collect();
    let inserted = ctx.store.insert_clips(&new_clips, ctx.clock.now()).await?;

    ctx.admission
        .record_usage(job.workspace_id, UsageMetric::Clips, inserted.len() as i64)
        .await?;

    // Advance before enqueueing renders so dependents only ever observe a
    // project that has reached CLIPS_GENERATED.
    let advanced = ctx
        .store
        .advance_stage(project.id, PipelineStage::ClipsGenerated, ctx.clock.now())
        .await?;

    for clip in &inserted {
        ctx.queue
            .enqueue(
                JobKind::ClipRender,
                serde_json::json!({ "clipId": clip.id }),
                job.workspace_id,
                None,
            )
            .await?;
    }

    info!(
        project_id = %project.id,
        candidates_inserted = inserted.len(),
        max_clips,
        advanced,
        "Highlight detection complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testutil::{test_context, TestHarness};
    use crate::models::ClipStatus;
    use serde_json::json;

    fn segment(start: f64, end: f64, text: &str, confidence: Option<f64>) -> TranscriptSegment {
        TranscriptSegment {
            start,
            end,
            text: text.into(),
            confidence,
        }
    }

    #[test]
    fn test_max_clips_basic_plan_ten_minutes() {
        // 10 min on basic: duration baseline 8, clamped by clips_per_project=3.
        assert_eq!(compute_max_clips(600_000.0, Plan::Basic, None), 3);
    }

    #[test]
    fn test_max_clips_duration_buckets() {
        let plan = Plan::Premium; // clips_per_project 30, softCap 225 -> duration rules
        assert_eq!(compute_max_clips(30_000.0, plan, None), 2);
        assert_eq!(compute_max_clips(3.0 * 60_000.0, plan, None), 5);
        assert_eq!(compute_max_clips(5.0 * 60_000.0, plan, None), 6);
        assert_eq!(compute_max_clips(9.0 * 60_000.0, plan, None), 8);
        assert_eq!(compute_max_clips(15.0 * 60_000.0, plan, None), 10);
        assert_eq!(compute_max_clips(100.0 * 60_000.0, plan, None), 27);
        // Hard ceiling of 30.
        assert_eq!(compute_max_clips(1_000.0 * 60_000.0, plan, None), 30);
    }

    #[test]
    fn test_max_clips_monotone_in_duration() {
        let mut prev = 0;
        for minutes in 0..240 {
            let clips = compute_max_clips(minutes as f64 * 60_000.0, Plan::Premium, None);
            assert!(clips >= prev, "regressed at {} min", minutes);
            assert!(clips <= HARD_MAX_CLIPS);
            prev = clips;
        }
    }

    #[test]
    fn test_max_clips_override_rules() {
        let plan = Plan::Premium;
        // Fractional override floors.
        assert_eq!(compute_max_clips(600_000.0, plan, Some(4.9)), 4);
        // Non-positive and non-finite overrides are ignored.
        assert_eq!(compute_max_clips(600_000.0, plan, Some(0.0)), 8);
        assert_eq!(compute_max_clips(600_000.0, plan, Some(-3.0)), 8);
        assert_eq!(compute_max_clips(600_000.0, plan, Some(f64::NAN)), 8);
        assert_eq!(compute_max_clips(600_000.0, plan, Some(f64::INFINITY)), 8);
        // Override still clamps to the hard ceiling.
        assert_eq!(compute_max_clips(600_000.0, plan, Some(500.0)), 30);
    }

    #[test]
    fn test_build_candidates_grouping_and_scoring() {
        let segments = vec![
            segment(0.0, 8.0, "Welcome to the monad deep dive.", Some(0.9)),
            segment(8.5, 20.0, "Today we cover rust pipelines.", Some(0.7)),
            // 5s gap starts a new run.
            segment(25.0, 32.0, "short tail", Some(0.9)),
        ];
        let keywords = vec!["rust".to_string(), "absent".to_string()];
        let candidates = build_candidates(&segments, &keywords, 2.0);

        // Second run is only 7s long and gets rejected.
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!(c.start_s, 0.0);
        assert_eq!(c.end_s, 20.0);
        assert_eq!(c.keyword_hits, 1);
        assert!((c.confidence - 0.8).abs() < 1e-9);
        assert!((c.score - 1.8).abs() < 1e-9);
        assert_eq!(c.title, "Welcome to the monad deep dive");
    }

    #[test]
    fn test_candidate_window_capped_at_sixty_seconds() {
        let segments = vec![segment(10.0, 200.0, "one long ramble", None)];
        let candidates = build_candidates(&segments, &[], 2.0);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].end_s, 70.0);
        assert_eq!(candidates[0].confidence, DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_title_fallbacks() {
        assert_eq!(derive_title("", Some("keyword")), "keyword");
        assert_eq!(derive_title("", None), "Highlight");
        assert_eq!(derive_title("Hello there. More text.", None), "Hello there");
    }

    #[test]
    fn test_consolidation_scenario() {
        // Literal scenario: overlapping (5,15) loses to the higher-scored
        // (0,10); the disjoint (20,30) survives.
        let candidate = |start_s: f64, end_s: f64, score: f64| Candidate {
            start_s,
            end_s,
            confidence: score,
            keyword_hits: 0,
            score,
            title: String::new(),
        };
        let kept = consolidate(
            vec![
                candidate(0.0, 10.0, 0.9),
                candidate(5.0, 15.0, 0.8),
                candidate(20.0, 30.0, 0.7),
            ],
            &[],
            5,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!((kept[0].start_s, kept[0].end_s), (0.0, 10.0));
        assert_eq!((kept[1].start_s, kept[1].end_s), (20.0, 30.0));
    }

    #[test]
    fn test_consolidation_rejects_near_duplicates_of_existing() {
        let candidate = |start_s: f64, end_s: f64| Candidate {
            start_s,
            end_s,
            confidence: 0.9,
            keyword_hits: 0,
            score: 0.9,
            title: String::new(),
        };
        // Starts within 1.5s of an existing clip: rejected even without
        // overlap.
        let kept = consolidate(vec![candidate(101.0, 120.0)], &[(100.0, 100.5)], 5);
        assert!(kept.is_empty());
    }

    #[test]
    fn test_consolidation_output_is_non_overlapping() {
        let candidate = |start_s: f64, end_s: f64, score: f64| Candidate {
            start_s,
            end_s,
            confidence: score,
            keyword_hits: 0,
            score,
            title: String::new(),
        };
        let mut kept = consolidate(
            vec![
                candidate(0.0, 30.0, 0.5),
                candidate(10.0, 25.0, 0.9),
                candidate(26.0, 50.0, 0.8),
                candidate(40.0, 70.0, 0.7),
            ],
            &[],
            10,
        );
        kept.sort_by(|a, b| a.start_s.total_cmp(&b.start_s));
        for pair in kept.windows(2) {
            assert!(pair[0].end_s <= pair[1].start_s);
        }
    }

    #[tokio::test]
    async fn test_handler_inserts_clips_and_enqueues_renders() {
        let harness = TestHarness::new();
        let ctx = test_context(&harness);
        let project = harness.project_at(PipelineStage::Transcribed);

        let transcript = Transcript {
            segments: vec![
                segment(0.0, 20.0, "First big moment here.", Some(0.9)),
                segment(100.0, 130.0, "Second distinct moment.", Some(0.8)),
            ],
            duration_sec: 600.0,
        };
        harness.blobs.put(
            "transcripts",
            &crate::blobstore::keys::transcript_json(project.workspace_id, project.id),
            serde_json::to_vec(&transcript).unwrap(),
        );

        let job = harness.job(
            JobKind::HighlightDetect,
            project.workspace_id,
            json!({"projectId": project.id, "keywords": [], "minGapSec": 2.0}),
        );
        handle(&job, &ctx, &CancelToken::never()).await.unwrap();

        let clips = harness.store.list_clips(project.id).await.unwrap();
        assert_eq!(clips.len(), 2);
        assert!(clips.iter().all(|c| c.status == ClipStatus::Proposed));

        let renders = harness.queued_jobs(JobKind::ClipRender);
        assert_eq!(renders.len(), 2);

        let after = harness.store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(after.pipeline_stage, PipelineStage::ClipsGenerated);
    }

    #[tokio::test]
    async fn test_handler_skips_when_stage_reached() {
        let harness = TestHarness::new();
        let ctx = test_context(&harness);
        let project = harness.project_at(PipelineStage::ClipsGenerated);

        let job = harness.job(
            JobKind::HighlightDetect,
            project.workspace_id,
            json!({"projectId": project.id, "keywords": [], "minGapSec": 2.0}),
        );
        handle(&job, &ctx, &CancelToken::never()).await.unwrap();
        assert!(harness.queued_jobs(JobKind::ClipRender).is_empty());
    }

    #[tokio::test]
    async fn test_rerun_dedupes_against_existing_clips() {
        let harness = TestHarness::new();
        let ctx = test_context(&harness);
        let project = harness.project_at(PipelineStage::Transcribed);

        // A clip from a previous (partially failed) run already covers 0-20.
        harness.clip(&project, 0.0, 20.0, ClipStatus::Proposed);

        let transcript = Transcript {
            segments: vec![
                segment(0.0, 20.0, "First big moment here.", Some(0.9)),
                segment(100.0, 130.0, "Second distinct moment.", Some(0.8)),
            ],
            duration_sec: 600.0,
        };
        harness.blobs.put(
            "transcripts",
            &crate::blobstore::keys::transcript_json(project.workspace_id, project.id),
            serde_json::to_vec(&transcript).unwrap(),
        );

        let job = harness.job(
            JobKind::HighlightDetect,
            project.workspace_id,
            json!({"projectId": project.id, "keywords": [], "minGapSec": 2.0}),
        );
        handle(&job, &ctx, &CancelToken::never()).await.unwrap();

        let clips = harness.store.list_clips(project.id).await.unwrap();
        assert_eq!(clips.len(), 2, "only the non-overlapping window was added");
    }
}
