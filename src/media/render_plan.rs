//! Render command construction
//!
//! Pure argument builders for the vertical clip profile: the source is
//! scaled to cover 1080x1920 and blurred as the background, the original
//! frame is fit on top, audio is normalized with loudnorm. Keeping this
//! pure lets tests pin the exact command without spawning ffmpeg.

use std::path::Path;

/// Output canvas.
pub const RENDER_WIDTH: u32 = 1080;
pub const RENDER_HEIGHT: u32 = 1920;
pub const RENDER_FPS: u32 = 30;

/// Arguments for rendering one clip window out of a source file.
pub fn render_args(
    input: &Path,
    start_s: f64,
    end_s: f64,
    subtitles: Option<&Path>,
    output: &Path,
) -> Vec<String> {
    let duration = (end_s - start_s).max(0.0);

    let mut filter = format!(
        "[0:v]scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h},boxblur=20:5[bg];\
         [0:v]scale={w}:{h}:force_original_aspect_ratio=decrease[fg];\
         [bg][fg]overlay=(W-w)/2:(H-h)/2[comp]",
        w = RENDER_WIDTH,
        h = RENDER_HEIGHT,
    );
    let video_label = if let Some(subs) = subtitles {
        filter.push_str(&format!(
            ";[comp]subtitles={}[v]",
            escape_filter_path(subs)
        ));
        "[v]"
    } else {
        "[comp]"
    };

    let mut args: Vec<String> = Vec::new();
    args.extend(str_args(&["-hide_banner", "-nostdin", "-y"]));
    args.extend(["-ss".into(), format_seconds(start_s)]);
    args.extend(["-i".into(), input.display().to_string()]);
    args.extend(["-t".into(), format_seconds(duration)]);
    args.extend(["-filter_complex".into(), filter]);
    args.extend(["-map".into(), video_label.into()]);
    args.extend(str_args(&["-map", "0:a?"]));
    args.extend(str_args(&["-r", "30"]));
    args.extend(str_args(&["-c:v", "libx264", "-preset", "veryfast", "-crf", "20"]));
    args.extend(str_args(&["-pix_fmt", "yuv420p"]));
    args.extend(str_args(&["-c:a", "aac", "-b:a", "160k"]));
    args.extend(str_args(&["-af", "loudnorm=I=-16:TP=-1.5:LRA=11"]));
    args.extend(str_args(&["-movflags", "+faststart"]));
    args.push(output.display().to_string());
    args
}

/// Arguments for extracting a single thumbnail frame.
pub fn thumbnail_args(input: &Path, at_s: f64, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    args.extend(str_args(&["-hide_banner", "-nostdin", "-y"]));
    args.extend(["-ss".into(), format_seconds(at_s)]);
    args.extend(["-i".into(), input.display().to_string()]);
    args.extend(str_args(&["-frames:v", "1", "-q:v", "3"]));
    args.push(output.display().to_string());
    args
}

fn str_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn format_seconds(seconds: f64) -> String {
    format!("{:.3}", seconds)
}

/// ffmpeg filter arguments need `:` and `'` escaped inside path values.
fn escape_filter_path(path: &Path) -> String {
    path.display()
        .to_string()
        .replace('\\', "\\\\")
        .replace(':', "\\:")
        .replace('\'', "\\'")
}
