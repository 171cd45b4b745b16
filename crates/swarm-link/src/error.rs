use thiserror::Error;

use crate::session::SessionId;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("invalid base url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("no async runtime available: {0}")]
    NoRuntime(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("frame error: {0}")]
    Frame(#[from] swarm_core::FrameError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("session channel could not be opened: {0}")]
    Dial(String),
}
