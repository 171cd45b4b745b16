use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const PING_FRAME: &str = r#"{"type":"ping"}"#;
pub const PONG_FRAME: &str = r#"{"type":"pong"}"#;

/// Closed set of event-channel tags. The backend emits snake_case, the dashboard
/// contract uses camelCase; both decode to the same variant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum EnvelopeKind {
    Chat,
    #[serde(alias = "file_update")]
    FileUpdate,
    #[serde(alias = "code_update")]
    CodeUpdate,
    #[serde(alias = "task_assigned")]
    TaskAssigned,
    #[serde(alias = "review_request")]
    ReviewRequest,
    #[serde(alias = "review_result")]
    ReviewResult,
    #[serde(alias = "test_result")]
    TestResult,
    #[serde(alias = "terminal_output")]
    TerminalOutput,
    #[serde(alias = "approval_request")]
    ApprovalRequest,
    #[serde(alias = "approval_response")]
    ApprovalResponse,
    #[serde(alias = "agent_status")]
    AgentStatus,
    Thought,
    Debate,
    #[serde(alias = "system", alias = "system_notice")]
    SystemNotice,
    #[serde(alias = "mission_complete")]
    MissionComplete,
    Connection,
    Ping,
    Pong,
    #[serde(other)]
    Unknown,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::FileUpdate => "fileUpdate",
            Self::CodeUpdate => "codeUpdate",
            Self::TaskAssigned => "taskAssigned",
            Self::ReviewRequest => "reviewRequest",
            Self::ReviewResult => "reviewResult",
            Self::TestResult => "testResult",
            Self::TerminalOutput => "terminalOutput",
            Self::ApprovalRequest => "approvalRequest",
            Self::ApprovalResponse => "approvalResponse",
            Self::AgentStatus => "agentStatus",
            Self::Thought => "thought",
            Self::Debate => "debate",
            Self::SystemNotice => "systemNotice",
            Self::MissionComplete => "missionComplete",
            Self::Connection => "connection",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_id"
    )]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub sender: String,
    #[serde(default, alias = "sender_role", deserialize_with = "nullable")]
    pub sender_role: String,
    #[serde(default, deserialize_with = "nullable")]
    pub content: String,
    #[serde(default, deserialize_with = "object_or_empty")]
    pub data: Map<String, Value>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: f64,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_id"
    )]
    pub channel: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "lenient_mentions"
    )]
    pub mentions: Vec<String>,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind) -> Self {
        Self {
            kind,
            id: None,
            sender: String::new(),
            sender_role: String::new(),
            content: String::new(),
            data: Map::new(),
            timestamp: now_seconds(),
            channel: None,
            mentions: Vec::new(),
        }
    }

    pub fn from_user(kind: EnvelopeKind, content: impl Into<String>) -> Self {
        Self {
            sender: "user".to_string(),
            sender_role: "User".to_string(),
            content: content.into(),
            ..Self::new(kind)
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        if let Value::Object(map) = data {
            self.data = map;
        }
        self
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// What a decoded event-channel frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Ping,
    Pong,
    Envelope(Envelope),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn decode_inbound(text: &str, max_frame_bytes: usize) -> Result<InboundFrame, FrameError> {
    if text.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: text.len(),
            max: max_frame_bytes,
        });
    }
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|err| FrameError::Decode(err.to_string()))?;
    Ok(match envelope.kind {
        EnvelopeKind::Ping => InboundFrame::Ping,
        EnvelopeKind::Pong => InboundFrame::Pong,
        _ => InboundFrame::Envelope(envelope),
    })
}

pub fn encode_envelope(envelope: &Envelope, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded =
        serde_json::to_string(envelope).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Strings and numbers become an id; anything else is treated as absent.
fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(crate::id_from_value(&Value::deserialize(deserializer)?))
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Value::deserialize(deserializer)?.as_f64().unwrap_or_default())
}

/// Null or non-string entries are skipped, a non-array is empty.
fn lenient_mentions<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Array(items) => Ok(crate::string_list(items.iter())),
        _ => Ok(Vec::new()),
    }
}

fn object_or_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}
