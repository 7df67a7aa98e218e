//! Merging the start and end segments of a bookend video.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reel_core::retry::{ErrorClass, Retryable};
use serde::Deserialize;

/// Default crossfade between the two segments.
pub const DEFAULT_CROSSFADE: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum SpliceError {
    #[error("ffprobe/ffmpeg binary not found: {0}")]
    NotFound(std::io::Error),

    /// Carries the tool's stderr verbatim.
    #[error("{stderr}")]
    ExecutionFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("failed to parse ffprobe output: {0}")]
    ParseError(String),

    #[error("video file not found: {0}")]
    VideoNotFound(String),

    /// A scene id or artifact path that would leave the output folder.
    #[error("path escapes the output folder: {0:?}")]
    OutsideOutputDir(String),
}

/// A failed merge fails identically on retry.
impl Retryable for SpliceError {
    fn error_class(&self) -> ErrorClass {
        ErrorClass::Terminal
    }
}

/// Merges two rendered segments into one video.
///
/// Paths are artifact paths as reported by the server (`subfolder/name`).
/// Returns the path of the merged file.
#[async_trait]
pub trait VideoSplicer: Send + Sync + 'static {
    async fn splice(&self, scene_id: &str, start: &str, end: &str) -> Result<String, SpliceError>;
}

/// Crossfades the segments with `ffmpeg -filter_complex xfade`.
#[derive(Debug, Clone)]
pub struct FfmpegSplicer {
    output_dir: PathBuf,
    crossfade: Duration,
}

impl FfmpegSplicer {
    /// * `output_dir` - the server's output folder, where artifact paths
    ///   resolve and the merged file is written.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            crossfade: DEFAULT_CROSSFADE,
        }
    }

    pub fn with_crossfade(mut self, crossfade: Duration) -> Self {
        self.crossfade = crossfade;
        self
    }

    fn resolve(&self, artifact: &str) -> Result<PathBuf, SpliceError> {
        let relative = Path::new(artifact);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(SpliceError::OutsideOutputDir(artifact.to_string()));
        }
        let path = self.output_dir.join(relative);
        if !path.exists() {
            return Err(SpliceError::VideoNotFound(path.to_string_lossy().to_string()));
        }
        Ok(path)
    }
}

#[async_trait]
impl VideoSplicer for FfmpegSplicer {
    async fn splice(&self, scene_id: &str, start: &str, end: &str) -> Result<String, SpliceError> {
        let output = self.output_dir.join(output_name(scene_id)?);
        let start = self.resolve(start)?;
        let end = self.resolve(end)?;

        let start_secs = probe_duration(&start).await?;
        let filter = xfade_filter(start_secs, self.crossfade);
        tracing::info!(scene_id, start_secs, %filter, "Splicing bookend segments");

        let result = tokio::process::Command::new("ffmpeg")
            .args(["-y", "-v", "error", "-i"])
            .arg(&start)
            .arg("-i")
            .arg(&end)
            .args(["-filter_complex", filter.as_str(), "-map", "[v]"])
            .args(["-c:v", "libx264", "-pix_fmt", "yuv420p"])
            .arg(&output)
            .output()
            .await
            .map_err(SpliceError::NotFound)?;

        if !result.status.success() {
            return Err(SpliceError::ExecutionFailed {
                exit_code: result.status.code(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        Ok(output.to_string_lossy().to_string())
    }
}

/// `<scene>_bookend.mp4`; the scene id must be a single file name part.
fn output_name(scene_id: &str) -> Result<String, SpliceError> {
    if scene_id.is_empty() || scene_id.contains(['/', '\\', '\0']) {
        return Err(SpliceError::OutsideOutputDir(scene_id.to_string()));
    }
    Ok(format!("{scene_id}_bookend.mp4"))
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

async fn probe_duration(path: &Path) -> Result<f64, SpliceError> {
    let output = tokio::process::Command::new("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_format"])
        .arg(path)
        .output()
        .await
        .map_err(SpliceError::NotFound)?;

    if !output.status.success() {
        return Err(SpliceError::ExecutionFailed {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    parse_duration(&String::from_utf8_lossy(&output.stdout))
}

/// Format duration in seconds from `ffprobe -show_format` JSON.
fn parse_duration(stdout: &str) -> Result<f64, SpliceError> {
    let probe: ProbeOutput = serde_json::from_str(stdout)
        .map_err(|e| SpliceError::ParseError(format!("{e}: {stdout}")))?;
    probe
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .ok_or_else(|| SpliceError::ParseError(format!("no duration in: {stdout}")))
}

/// `xfade` graph starting the fade `crossfade` before the first segment
/// ends. Segments shorter than the fade start it at zero.
fn xfade_filter(start_secs: f64, crossfade: Duration) -> String {
    let fade = crossfade.as_secs_f64().min(start_secs);
    let offset = (start_secs - fade).max(0.0);
    format!("[0:v][1:v]xfade=transition=fade:duration={fade:.3}:offset={offset:.3},format=yuv420p[v]")
}
