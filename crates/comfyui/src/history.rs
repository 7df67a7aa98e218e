//! Classification of `GET /history/{prompt_id}` responses.
//!
//! ComfyUI only adds a prompt to its history once execution has finished
//! or failed, so an empty object is the normal answer while a job is still
//! queued or running.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a prompt stands according to one history response.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryState {
    /// The prompt id key is absent: not started or still running.
    NotRegistered,
    /// Registered but neither outputs nor failure details yet.
    Pending { status_str: Option<String> },
    Completed { outputs: Vec<OutputFile> },
    Failed { reason: String },
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("Malformed history response: {0}")]
pub struct HistoryFormatError(pub String);

/// Kind of file a node produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMedia {
    Video,
    /// Animated image (gif/webp) from a video-combine node.
    Animation,
    Image,
}

/// One output file reference, as accepted by `GET /view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputFile {
    pub node_id: String,
    pub filename: String,
    pub subfolder: String,
    /// `output` or `temp`.
    pub folder_type: String,
    pub media: OutputMedia,
}

impl OutputFile {
    /// `subfolder/filename`, or just `filename` at the output root.
    pub fn relative_path(&self) -> String {
        if self.subfolder.is_empty() {
            self.filename.clone()
        } else {
            format!("{}/{}", self.subfolder, self.filename)
        }
    }
}

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "mkv"];

#[derive(Deserialize)]
struct RawFile {
    filename: String,
    #[serde(default)]
    subfolder: String,
    #[serde(rename = "type", default = "default_folder_type")]
    folder_type: String,
    #[serde(default)]
    format: Option<String>,
}

fn default_folder_type() -> String {
    "output".to_string()
}

/// Classify a history response body for `prompt_id`.
///
/// Failure details are checked before outputs so a prompt that produced
/// partial outputs and then crashed is reported as failed.
pub fn classify_history(prompt_id: &str, body: &Value) -> Result<HistoryState, HistoryFormatError> {
    let map = body
        .as_object()
        .ok_or_else(|| HistoryFormatError("expected a JSON object".to_string()))?;

    let Some(entry) = map.get(prompt_id) else {
        return Ok(HistoryState::NotRegistered);
    };

    if let Some(reason) = failure_reason(entry) {
        return Ok(HistoryState::Failed { reason });
    }

    let status = entry.get("status");
    let completed = status
        .and_then(|s| s.get("completed"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let outputs = entry.get("outputs").and_then(Value::as_object);

    match outputs {
        Some(o) if !o.is_empty() || completed => Ok(HistoryState::Completed {
            outputs: extract_outputs(entry.get("outputs").unwrap_or(&Value::Null)),
        }),
        None if completed => Ok(HistoryState::Completed { outputs: vec![] }),
        _ => Ok(HistoryState::Pending {
            status_str: status
                .and_then(|s| s.get("status_str"))
                .and_then(Value::as_str)
                .map(str::to_string),
        }),
    }
}

fn failure_reason(entry: &Value) -> Option<String> {
    if let Some(details) = entry.get("exception_details").filter(|d| !d.is_null()) {
        return Some(describe_exception(details));
    }

    let status = entry.get("status")?;
    if status.get("status_str").and_then(Value::as_str) != Some("error") {
        return None;
    }
    let from_messages = status
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|msgs| {
            msgs.iter().find_map(|m| match m.as_array().map(Vec::as_slice) {
                Some([kind, data]) if kind.as_str() == Some("execution_error") => {
                    Some(describe_exception(data))
                }
                _ => None,
            })
        });
    Some(from_messages.unwrap_or_else(|| "Execution failed".to_string()))
}

fn describe_exception(details: &Value) -> String {
    if let Some(s) = details.as_str() {
        return s.to_string();
    }
    let message = details
        .get("exception_message")
        .and_then(Value::as_str)
        .unwrap_or("Execution failed")
        .trim();
    match details.get("node_type").and_then(Value::as_str) {
        Some(node) => format!("{node}: {message}"),
        None => message.to_string(),
    }
}

/// Every file listed under an `outputs` object. Nodes are visited in
/// numeric id order (`"9"` before `"10"`); non-numeric ids come last.
pub fn extract_outputs(outputs: &Value) -> Vec<OutputFile> {
    let Some(nodes) = outputs.as_object() else {
        return vec![];
    };
    let mut nodes: Vec<_> = nodes.iter().collect();
    nodes.sort_by(|(a, _), (b, _)| node_order(a).cmp(&node_order(b)));

    let mut files = Vec::new();
    for (node_id, node_out) in nodes {
        for key in ["videos", "gifs", "images"] {
            let Some(list) = node_out.get(key).and_then(Value::as_array) else {
                continue;
            };
            for item in list {
                let Ok(raw) = serde_json::from_value::<RawFile>(item.clone()) else {
                    continue;
                };
                let media = media_for(key, &raw);
                files.push(OutputFile {
                    node_id: node_id.clone(),
                    filename: raw.filename,
                    subfolder: raw.subfolder,
                    folder_type: raw.folder_type,
                    media,
                });
            }
        }
    }
    files
}

fn node_order(id: &str) -> (u64, &str) {
    (id.parse().unwrap_or(u64::MAX), id)
}

fn media_for(key: &str, raw: &RawFile) -> OutputMedia {
    let is_video_file = raw
        .format
        .as_deref()
        .is_some_and(|f| f.starts_with("video/"))
        || raw
            .filename
            .rsplit_once('.')
            .is_some_and(|(_, ext)| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
    match key {
        "videos" => OutputMedia::Video,
        "gifs" if is_video_file => OutputMedia::Video,
        "gifs" => OutputMedia::Animation,
        _ if is_video_file => OutputMedia::Video,
        _ => OutputMedia::Image,
    }
}

/// The file to treat as a video render's artifact: the first real video,
/// else the first animation.
pub fn primary_video(files: &[OutputFile]) -> Option<&OutputFile> {
    files
        .iter()
        .find(|f| f.media == OutputMedia::Video)
        .or_else(|| files.iter().find(|f| f.media == OutputMedia::Animation))
}

/// First still image, for keyframe renders.
pub fn primary_image(files: &[OutputFile]) -> Option<&OutputFile> {
    files.iter().find(|f| f.media == OutputMedia::Image)
}
