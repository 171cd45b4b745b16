use std::time::Duration;

use swarm_core::{Viewport, DEFAULT_MAX_FRAME_BYTES};
use url::Url;

use crate::error::LinkError;
use crate::machine::ReconnectPolicy;

pub const DEFAULT_HEARTBEAT_SECS: u64 = 25;
pub const DEFAULT_POLL_SECS: u64 = 5;
pub const DEFAULT_OUTPUT_BUFFER_BYTES: usize = 256 * 1024;

const EVENT_PATH: &str = "/ws";
const TERMINAL_PATH: &str = "/ws/terminal";

#[derive(Clone, Debug)]
pub struct LinkConfig {
    base_url: Url,
    pub reconnect: ReconnectPolicy,
    pub heartbeat_interval: Duration,
    pub max_frame_bytes: usize,
    pub viewport: Viewport,
    pub output_buffer_bytes: usize,
    pub poll_interval: Duration,
}

impl LinkConfig {
    /// Accepts `http(s)://host[:port]` or `ws(s)://host[:port]`; any path is ignored.
    pub fn new(base_url: &str) -> Result<Self, LinkError> {
        let trimmed = base_url.trim();
        let parsed = Url::parse(trimmed).map_err(|err| LinkError::InvalidUrl {
            url: trimmed.to_string(),
            reason: err.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https" | "ws" | "wss") {
            return Err(LinkError::InvalidUrl {
                url: trimmed.to_string(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }
        if parsed.host_str().is_none() {
            return Err(LinkError::InvalidUrl {
                url: trimmed.to_string(),
                reason: "missing host".to_string(),
            });
        }
        Ok(Self {
            base_url: parsed,
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            viewport: Viewport::default(),
            output_buffer_bytes: DEFAULT_OUTPUT_BUFFER_BYTES,
            poll_interval: Duration::from_secs(DEFAULT_POLL_SECS),
        })
    }

    pub fn event_url(&self) -> Url {
        self.endpoint(socket_scheme(self.base_url.scheme()), EVENT_PATH)
    }

    pub fn terminal_url(&self) -> Url {
        self.endpoint(socket_scheme(self.base_url.scheme()), TERMINAL_PATH)
    }

    pub fn api_url(&self, path: &str) -> Url {
        let path = format!("/api/{}", path.trim_start_matches('/'));
        self.endpoint(http_scheme(self.base_url.scheme()), &path)
    }

    fn endpoint(&self, scheme: &str, path: &str) -> Url {
        let mut url = self.base_url.clone();
        // http, https, ws and wss are all "special" schemes, so switching between them is allowed.
        let _ = url.set_scheme(scheme);
        url.set_path(path);
        url.set_query(None);
        url.set_fragment(None);
        url
    }
}

fn socket_scheme(scheme: &str) -> &'static str {
    match scheme {
        "https" | "wss" => "wss",
        _ => "ws",
    }
}

fn http_scheme(scheme: &str) -> &'static str {
    match scheme {
        "https" | "wss" => "https",
        _ => "http",
    }
}
