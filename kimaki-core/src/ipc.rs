//! IPC types shared between worker processes and the kimakid host.
//!
//! Workers insert rows into the `ipc_requests` table. The host dispatcher
//! claims them, runs the kind-specific handler and writes the JSON response
//! back into the same row, which the worker polls for.
//!
//! Request kinds:
//! - **file_upload**: ask the user to upload files into the thread
//! - **action_buttons**: show up to three quick-reply buttons in the thread

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MAX_ACTION_BUTTONS: usize = 3;
pub const MAX_BUTTON_LABEL_CHARS: usize = 80;
pub const DEFAULT_MAX_FILES: u32 = 5;
pub const MAX_FILES_LIMIT: u32 = 10;

/// Lifecycle of a request row: `pending → processing → completed | cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpcStatus {
    Pending,
    Processing,
    Completed,
    Cancelled,
}

impl IpcStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IpcStatus::Pending => "pending",
            IpcStatus::Processing => "processing",
            IpcStatus::Completed => "completed",
            IpcStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for IpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IpcStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(IpcStatus::Pending),
            "processing" => Ok(IpcStatus::Processing),
            "completed" => Ok(IpcStatus::Completed),
            "cancelled" => Ok(IpcStatus::Cancelled),
            other => Err(anyhow::anyhow!("unknown IPC status `{other}`")),
        }
    }
}

/// Dispatch discriminator. Unknown values are valid rows but get rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcRequestKind {
    FileUpload,
    ActionButtons,
    Unknown(String),
}

impl IpcRequestKind {
    pub fn parse(value: &str) -> Self {
        match value {
            "file_upload" => IpcRequestKind::FileUpload,
            "action_buttons" => IpcRequestKind::ActionButtons,
            other => IpcRequestKind::Unknown(other.to_string()),
        }
    }
}

/// One cross-process call from a worker to the bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub request_type: String,
    pub session_id: String,
    pub thread_id: String,
    /// Kind-specific arguments, JSON text.
    pub payload: String,
    /// Terminal result, JSON text. Written once.
    pub response: Option<String>,
    pub status: IpcStatus,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    pub claimed_at: Option<i64>,
    pub updated_at: i64,
}

impl IpcRequest {
    pub fn kind(&self) -> IpcRequestKind {
        IpcRequestKind::parse(&self.request_type)
    }
}

/// Fields a worker supplies when creating a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIpcRequest {
    #[serde(rename = "type")]
    pub request_type: String,
    pub session_id: String,
    pub thread_id: String,
    #[serde(default)]
    pub payload: Value,
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadPayload {
    pub prompt: Option<String>,
    /// Kept loose so a non-numeric value falls back to the default.
    pub max_files: Option<Value>,
    pub directory: Option<String>,
}

impl FileUploadPayload {
    pub fn max_files(&self) -> u32 {
        clamp_max_files(self.max_files.as_ref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionButtonsPayload {
    /// Raw entries; each one is validated on its own by `normalize_buttons`.
    pub buttons: Option<Value>,
    pub directory: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonColor {
    White,
    Blue,
    Green,
    Red,
}

impl ButtonColor {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "white" => Some(ButtonColor::White),
            "blue" => Some(ButtonColor::Blue),
            "green" => Some(ButtonColor::Green),
            "red" => Some(ButtonColor::Red),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionButton {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<ButtonColor>,
}

/// Clamp `maxFiles` into `[1, MAX_FILES_LIMIT]`. Absent or non-numeric values
/// use `DEFAULT_MAX_FILES`.
pub fn clamp_max_files(value: Option<&Value>) -> u32 {
    let Some(number) = value.and_then(Value::as_f64) else {
        return DEFAULT_MAX_FILES;
    };
    if !number.is_finite() {
        return DEFAULT_MAX_FILES;
    }
    number.trunc().clamp(1.0, f64::from(MAX_FILES_LIMIT)) as u32
}

/// Validate and normalize raw button entries.
///
/// Entries without a non-empty label are dropped, unknown colors are dropped
/// from otherwise valid entries, labels are truncated, and only the first
/// `MAX_ACTION_BUTTONS` valid entries are kept.
pub fn normalize_buttons(raw: Option<&Value>) -> Vec<ActionButton> {
    let Some(entries) = raw.and_then(Value::as_array) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(normalize_button)
        .take(MAX_ACTION_BUTTONS)
        .collect()
}

fn normalize_button(entry: &Value) -> Option<ActionButton> {
    let label = entry.get("label")?.as_str()?.trim();
    if label.is_empty() {
        return None;
    }
    let label: String = label.chars().take(MAX_BUTTON_LABEL_CHARS).collect();
    let color = entry
        .get("color")
        .and_then(Value::as_str)
        .and_then(ButtonColor::parse);
    Some(ActionButton { label, color })
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// JSON body written to `ipc_requests.response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IpcResponse {
    Error {
        error: String,
    },
    Files {
        #[serde(rename = "filePaths")]
        file_paths: Vec<String>,
    },
    Ack {
        ok: bool,
    },
}

impl IpcResponse {
    pub fn error(message: impl Into<String>) -> Self {
        IpcResponse::Error {
            error: message.into(),
        }
    }

    pub fn files(file_paths: Vec<String>) -> Self {
        IpcResponse::Files { file_paths }
    }

    pub fn ack() -> Self {
        IpcResponse::Ack { ok: true }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, IpcResponse::Error { .. })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"error":"unserializable response"}"#.into())
    }
}
