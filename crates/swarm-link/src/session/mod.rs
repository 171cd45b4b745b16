//! Interactive session channels and the manager that multiplexes them.

mod buffer;
mod channel;
mod manager;

use std::fmt;

use serde::Serialize;
use swarm_core::Viewport;

pub use buffer::OutputBuffer;
pub use channel::{ChannelPeer, PeerLink, SessionDialer, SessionTransport, WsDialer};
pub use manager::SessionManager;

/// Manager-local session id; never reused within one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(u64);

impl SessionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Opening,
    Open,
    /// The remote process ended; shown as terminated until killed.
    Exited,
    /// The channel dropped or never opened; awaiting user action.
    Disconnected,
    Closed,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Exited => "exited",
            Self::Disconnected => "disconnected",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub remote_id: Option<String>,
    pub state: ChannelState,
    pub viewport: Viewport,
    pub active: bool,
    /// Output arrived while the session was in the background.
    pub unseen: bool,
}
