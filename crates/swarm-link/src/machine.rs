//! Connection lifecycle of the event channel, kept free of I/O so every
//! transition can be driven and checked directly.
//!
//! ```text
//! Disconnected --connect--> Connecting --open--> Connected
//!      ^                        |                    |
//!      | give up                | dial failed        | close / error
//!      |                        v                    v
//!      +------------------ Reconnecting <------------+
//!                               |
//!                               +--timer--> Connecting
//! ```

use std::fmt;
use std::time::Duration;

pub const DEFAULT_BASE_DELAY_MS: u64 = 2_000;
pub const DEFAULT_DELAY_CAP: u32 = 5;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the connectivity indicator shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub attempts: u32,
    pub gave_up: bool,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            gave_up: false,
        }
    }
}

/// Linear backoff: `base_delay * min(attempt, cap)`, at most `max_attempts` retries in a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub cap: u32,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            cap: DEFAULT_DELAY_CAP,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.min(self.cap))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Retry { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempts: u32,
    gave_up: bool,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempts: 0,
            gave_up: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            state: self.state,
            attempts: self.attempts,
            gave_up: self.gave_up,
        }
    }

    /// Explicit `connect()`. Returns false when a cycle is already in flight.
    pub fn request_connect(&mut self) -> bool {
        if self.state != ConnectionState::Disconnected {
            return false;
        }
        if self.gave_up {
            self.gave_up = false;
            self.attempts = 0;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    /// Backoff timer fired.
    pub fn retry_due(&mut self) {
        if self.state == ConnectionState::Reconnecting {
            self.state = ConnectionState::Connecting;
        }
    }

    pub fn opened(&mut self) {
        self.state = ConnectionState::Connected;
        self.attempts = 0;
    }

    /// Socket closed, errored, or could not be constructed.
    pub fn lost(&mut self) -> Backoff {
        if self.attempts < self.policy.max_attempts {
            self.attempts += 1;
            self.state = ConnectionState::Reconnecting;
            Backoff::Retry {
                attempt: self.attempts,
                delay: self.policy.delay_for(self.attempts),
            }
        } else {
            self.state = ConnectionState::Disconnected;
            self.gave_up = true;
            Backoff::GiveUp {
                attempts: self.attempts,
            }
        }
    }

    /// Explicit `close()`. The next `connect()` gets the full retry budget.
    pub fn closed(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.attempts = 0;
        self.gave_up = false;
    }
}
