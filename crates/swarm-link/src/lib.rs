//! Real-time coordination core for the swarm dashboard: the reconnecting event
//! transport, interactive session channels and the task/agent reconciler.

pub mod config;
pub mod error;
pub mod listeners;
pub mod machine;
pub mod poller;
pub mod reconciler;
pub mod session;
pub mod transport;

pub use config::LinkConfig;
pub use error::{LinkError, SessionError};
pub use listeners::{DispatchReport, ListenerId, ListenerRegistry, Topic};
pub use machine::{Backoff, ConnectionMachine, ConnectionState, LinkStatus, ReconnectPolicy};
pub use poller::{poll_once, MissionPoller, MissionSnapshot, PollOutcome};
pub use reconciler::{
    BoardView, Bucket, EntityReconciler, IngestOutcome, ReconcilerEffect, ReconcilerHandle,
    StatusCounts,
};
pub use session::{
    ChannelPeer, ChannelState, OutputBuffer, PeerLink, SessionDialer, SessionId, SessionManager,
    SessionSummary, SessionTransport, WsDialer,
};
pub use transport::{FrameOutcome, TransportClient};
