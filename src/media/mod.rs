//! Media ports: download, transcode, transcribe
//!
//! Thin, cancellable wrappers around the external binaries and the
//! transcription provider. Handlers stay I/O-free except through these.

pub mod downloader;
pub mod render_plan;
pub mod transcoder;
pub mod transcriber;

pub use downloader::{validate_source_url, SourceDownloader, YtDlpDownloader};
pub use transcoder::{FfmpegTranscoder, TranscodeOutput, TranscodeRequest, Transcoder};
pub use transcriber::{
    HttpTranscriber, Transcriber, Transcript, TranscriptSegment, TranscriptionResult,
};
