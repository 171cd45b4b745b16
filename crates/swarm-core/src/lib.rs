pub mod envelope;
pub mod terminal_wire;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub use envelope::{
    decode_inbound, encode_envelope, Envelope, EnvelopeKind, FrameError, InboundFrame,
    DEFAULT_MAX_FRAME_BYTES, PING_FRAME, PONG_FRAME,
};
pub use terminal_wire::{classify_server_text, ClientFrame, ServerFrame, ServerMessage, Viewport};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default, deserialize_with = "deserialize_deps")]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

impl Task {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            description: String::new(),
            status: TaskStatus::default(),
            assignee: None,
            priority: TaskPriority::default(),
            dependencies: Vec::new(),
            tags: Vec::new(),
            extra: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    InReview,
    Done,
    Blocked,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Todo
    }
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Todo,
        TaskStatus::InProgress,
        TaskStatus::InReview,
        TaskStatus::Done,
        TaskStatus::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::InReview => "in_review",
            TaskStatus::Done => "done",
            TaskStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "todo" | "pending" => Ok(TaskStatus::Todo),
            "in_progress" | "in-progress" | "inprogress" => Ok(TaskStatus::InProgress),
            "in_review" | "in-review" | "inreview" | "review" => Ok(TaskStatus::InReview),
            "done" => Ok(TaskStatus::Done),
            "blocked" => Ok(TaskStatus::Blocked),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Medium
    }
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            other => Err(format!("Unknown priority: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub emoji: String,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

impl Agent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: String::new(),
            status: AgentStatus::default(),
            color: String::new(),
            emoji: String::new(),
            extra: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Thinking,
    Acting,
    Waiting,
    Paused,
    Stopped,
    Killed,
    #[serde(other)]
    Unknown,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Thinking => "thinking",
            AgentStatus::Acting => "acting",
            AgentStatus::Waiting => "waiting",
            AgentStatus::Paused => "paused",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Killed => "killed",
            AgentStatus::Unknown => "unknown",
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, AgentStatus::Thinking | AgentStatus::Acting)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "idle" => Ok(AgentStatus::Idle),
            "thinking" => Ok(AgentStatus::Thinking),
            "acting" => Ok(AgentStatus::Acting),
            "waiting" => Ok(AgentStatus::Waiting),
            "paused" => Ok(AgentStatus::Paused),
            "stopped" => Ok(AgentStatus::Stopped),
            "killed" => Ok(AgentStatus::Killed),
            other => Err(format!("Unknown agent status: {other}")),
        }
    }
}

/// Task board counts as reported by the backend when a mission finishes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MissionSummary {
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub todo: u32,
    #[serde(default)]
    pub in_progress: u32,
    #[serde(default)]
    pub in_review: u32,
    #[serde(default)]
    pub done: u32,
    #[serde(default)]
    pub blocked: u32,
}

/// Coerce an id given as a string or a number into a non-empty String.
pub fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Deserialize an ID that can be either a string or a number into a String
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    id_from_value(&val)
        .ok_or_else(|| serde::de::Error::custom("expected non-empty string or number for id"))
}

fn deserialize_deps<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v: Option<Vec<Value>> = Option::deserialize(deserializer)?;
    Ok(string_list(v.unwrap_or_default().iter()))
}

pub fn string_list<'a>(values: impl Iterator<Item = &'a Value>) -> Vec<String> {
    let mut out = Vec::new();
    for val in values {
        if let Some(s) = val.as_str() {
            out.push(s.to_string());
        } else if let Some(i) = val.as_i64() {
            out.push(i.to_string());
        } else if let Some(u) = val.as_u64() {
            out.push(u.to_string());
        }
    }
    out
}
