use serde_json::Value;
use swarm_core::{Envelope, EnvelopeKind, Viewport};
use tracing::{debug, info, warn};

use super::channel::{SessionDialer, SessionTransport, WsDialer};
use super::{SessionId, SessionSummary};
use crate::config::{LinkConfig, DEFAULT_OUTPUT_BUFFER_BYTES};
use crate::error::SessionError;

struct Session {
    id: SessionId,
    transport: SessionTransport,
    /// Last viewport pushed to this session's channel.
    viewport: Viewport,
    /// `written` mark at the time the session was last in front.
    seen: u64,
}

/// Owns every interactive session and the single "active" pointer.
///
/// While the session view is visible there is always at least one session and
/// exactly one of them is active.
pub struct SessionManager<D: SessionDialer = WsDialer> {
    dialer: D,
    sessions: Vec<Session>,
    active: Option<SessionId>,
    next_id: u64,
    visible: bool,
    viewport: Viewport,
    buffer_bytes: usize,
}

impl SessionManager<WsDialer> {
    pub fn from_config(config: &LinkConfig) -> Self {
        let dialer = WsDialer::new(config);
        let mut manager = Self::new(dialer, config.viewport);
        manager.buffer_bytes = config.output_buffer_bytes;
        manager
    }
}

impl<D: SessionDialer> SessionManager<D> {
    pub fn new(dialer: D, viewport: Viewport) -> Self {
        Self {
            dialer,
            sessions: Vec::new(),
            active: None,
            next_id: 0,
            visible: false,
            viewport,
            buffer_bytes: DEFAULT_OUTPUT_BUFFER_BYTES,
        }
    }

    /// Opens a new session and makes it active. A dial failure still yields a
    /// session, shown as disconnected.
    pub fn create_session(&mut self) -> SessionId {
        self.next_id += 1;
        let id = SessionId(self.next_id);
        let transport = match self.dialer.dial(self.viewport) {
            Ok(transport) => transport,
            Err(err) => {
                warn!("session_create_failed: id={id} err={err}");
                SessionTransport::failed(self.buffer_bytes, self.viewport, &err.to_string())
            }
        };
        self.leave_active();
        self.sessions.push(Session {
            id,
            seen: transport.written(),
            transport,
            viewport: self.viewport,
        });
        self.active = Some(id);
        info!(event = "session_created", id = id.get());
        id
    }

    /// Moves the active pointer; background channels are left untouched.
    pub fn switch_to(&mut self, id: SessionId) -> Result<(), SessionError> {
        let index = self.index_of(id).ok_or(SessionError::NotFound(id))?;
        if self.active == Some(id) {
            return Ok(());
        }
        self.leave_active();
        self.active = Some(id);

        let viewport = self.viewport;
        let session = &mut self.sessions[index];
        if session.viewport != viewport {
            session.transport.resize(viewport);
            session.viewport = viewport;
        }
        session.seen = session.transport.written();
        debug!("session_switched: id={id}");
        Ok(())
    }

    /// Closes and removes a session, then reselects or recreates as needed.
    pub fn kill(&mut self, id: SessionId) -> Result<(), SessionError> {
        let index = self.index_of(id).ok_or(SessionError::NotFound(id))?;
        let mut session = self.sessions.remove(index);
        session.transport.close();
        info!(event = "session_killed", id = id.get());

        if self.active != Some(id) {
            return Ok(());
        }
        self.active = None;
        if self.sessions.is_empty() {
            if self.visible {
                self.create_session();
            }
            return Ok(());
        }
        let next = self.sessions[index.saturating_sub(1)].id;
        self.switch_to(next)
    }

    /// Viewport measurement changed. Only the active session is told now.
    pub fn resize(&mut self, viewport: Viewport) {
        self.viewport = viewport;
        let Some(active) = self.active else {
            return;
        };
        if let Some(session) = self.sessions.iter_mut().find(|s| s.id == active) {
            if session.viewport != viewport {
                session.transport.resize(viewport);
                session.viewport = viewport;
            }
        }
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
        if visible && self.sessions.is_empty() {
            self.create_session();
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Sends typed input to the active session.
    pub fn send_input(&self, data: &str) -> bool {
        self.active_transport()
            .map(|transport| transport.send_input(data))
            .unwrap_or(false)
    }

    /// Copies a backend-executed command and its output into the active
    /// session's display. Never written to the channel.
    pub fn mirror(&self, envelope: &Envelope) -> bool {
        if envelope.kind != EnvelopeKind::TerminalOutput {
            return false;
        }
        let Some(transport) = self.active_transport() else {
            return false;
        };
        let text = mirror_text(envelope);
        if text.is_empty() {
            return false;
        }
        transport.annotate(&text);
        true
    }

    pub fn active(&self) -> Option<SessionId> {
        self.active
    }

    pub fn active_transport(&self) -> Option<&SessionTransport> {
        let active = self.active?;
        self.transport(active)
    }

    pub fn transport(&self, id: SessionId) -> Option<&SessionTransport> {
        self.sessions
            .iter()
            .find(|session| session.id == id)
            .map(|session| &session.transport)
    }

    /// Sessions in creation order.
    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.sessions
            .iter()
            .map(|session| {
                let active = self.active == Some(session.id);
                SessionSummary {
                    id: session.id,
                    remote_id: session.transport.remote_id(),
                    state: session.transport.state(),
                    viewport: session.viewport,
                    active,
                    unseen: !active && session.transport.written() > session.seen,
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    /// Closes every channel and forgets every session.
    pub fn shutdown(&mut self) {
        for mut session in self.sessions.drain(..) {
            session.transport.close();
        }
        self.active = None;
    }

    fn leave_active(&mut self) {
        let Some(active) = self.active else {
            return;
        };
        if let Some(session) = self.sessions.iter_mut().find(|s| s.id == active) {
            session.seen = session.transport.written();
        }
    }

    fn index_of(&self, id: SessionId) -> Option<usize> {
        self.sessions.iter().position(|session| session.id == id)
    }
}

impl<D: SessionDialer> Drop for SessionManager<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn mirror_text(envelope: &Envelope) -> String {
    let field = |key: &str| {
        envelope
            .data
            .get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    };

    let mut text = String::new();
    if let Some(command) = field("command") {
        text.push_str("$ ");
        text.push_str(command);
        text.push_str("\r\n");
    }
    let mut body = false;
    for key in ["stdout", "stderr"] {
        if let Some(output) = field(key) {
            push_lines(&mut text, output);
            body = true;
        }
    }
    if !body && !envelope.content.is_empty() {
        push_lines(&mut text, &envelope.content);
    }
    text
}

fn push_lines(out: &mut String, text: &str) {
    for line in text.lines() {
        out.push_str(line);
        out.push_str("\r\n");
    }
}
