use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::{SinkExt, StreamExt};
use swarm_core::{classify_server_text, ClientFrame, ServerFrame, ServerMessage, Viewport};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use super::buffer::OutputBuffer;
use super::ChannelState;
use crate::config::LinkConfig;
use crate::error::SessionError;

#[derive(Debug)]
struct ChannelShared {
    state: ChannelState,
    viewport: Viewport,
    buffer: OutputBuffer,
    remote_id: Option<String>,
    exit_code: Option<i32>,
}

fn lock(shared: &Mutex<ChannelShared>) -> MutexGuard<'_, ChannelShared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ChannelDriver {
    shutdown: watch::Sender<bool>,
    _task: JoinHandle<()>,
}

/// One interactive session's duplex byte channel.
///
/// A channel is never reopened: once it exits or drops, it stays in that state
/// until the owning session is killed.
pub struct SessionTransport {
    shared: Arc<Mutex<ChannelShared>>,
    outbound: Option<mpsc::UnboundedSender<ClientFrame>>,
    driver: Option<ChannelDriver>,
}

impl SessionTransport {
    /// Builds a transport plus the far end a driver uses to feed it.
    pub fn pair(buffer_bytes: usize, viewport: Viewport) -> (Self, ChannelPeer) {
        let shared = Arc::new(Mutex::new(ChannelShared {
            state: ChannelState::Opening,
            viewport,
            buffer: OutputBuffer::new(buffer_bytes),
            remote_id: None,
            exit_code: None,
        }));
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            shared: shared.clone(),
            outbound: Some(tx),
            driver: None,
        };
        let peer = ChannelPeer {
            link: PeerLink { shared },
            outbound: rx,
        };
        (transport, peer)
    }

    /// A session whose channel could not be constructed.
    pub fn failed(buffer_bytes: usize, viewport: Viewport, reason: &str) -> Self {
        let mut buffer = OutputBuffer::new(buffer_bytes);
        buffer.push(&format!("[session could not be opened: {reason}]\r\n"));
        Self {
            shared: Arc::new(Mutex::new(ChannelShared {
                state: ChannelState::Disconnected,
                viewport,
                buffer,
                remote_id: None,
                exit_code: None,
            })),
            outbound: None,
            driver: None,
        }
    }

    fn bind_driver(&mut self, shutdown: watch::Sender<bool>, task: JoinHandle<()>) {
        self.driver = Some(ChannelDriver {
            shutdown,
            _task: task,
        });
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.shared).state
    }

    pub fn viewport(&self) -> Viewport {
        lock(&self.shared).viewport
    }

    pub fn remote_id(&self) -> Option<String> {
        lock(&self.shared).remote_id.clone()
    }

    pub fn exit_code(&self) -> Option<i32> {
        lock(&self.shared).exit_code
    }

    pub fn written(&self) -> u64 {
        lock(&self.shared).buffer.written()
    }

    /// Snapshot of the retained output.
    pub fn output(&self) -> String {
        lock(&self.shared).buffer.as_str().to_string()
    }

    /// Writes locally into the display buffer; nothing goes over the channel.
    pub fn annotate(&self, text: &str) {
        lock(&self.shared).buffer.push(text);
    }

    /// Forwards typed input verbatim. Dropped unless the channel is open.
    pub fn send_input(&self, data: &str) -> bool {
        self.send(ClientFrame::Input {
            data: data.to_string(),
        })
    }

    /// Records the viewport and tells the backend when the channel is open.
    pub fn resize(&self, viewport: Viewport) -> bool {
        lock(&self.shared).viewport = viewport;
        self.send(ClientFrame::resize(viewport))
    }

    fn send(&self, frame: ClientFrame) -> bool {
        if self.state() != ChannelState::Open {
            return false;
        }
        match &self.outbound {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    pub fn close(&mut self) {
        {
            let mut shared = lock(&self.shared);
            if shared.state == ChannelState::Closed {
                return;
            }
            shared.state = ChannelState::Closed;
        }
        self.outbound = None;
        if let Some(driver) = self.driver.take() {
            let _ = driver.shutdown.send(true);
        }
    }
}

impl Drop for SessionTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Driver-side handle that applies server frames to a [`SessionTransport`].
#[derive(Clone)]
pub struct PeerLink {
    shared: Arc<Mutex<ChannelShared>>,
}

impl PeerLink {
    pub fn opened(&self) {
        let mut shared = lock(&self.shared);
        if shared.state == ChannelState::Opening {
            shared.state = ChannelState::Open;
        }
    }

    pub fn viewport(&self) -> Viewport {
        lock(&self.shared).viewport
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared).state == ChannelState::Closed
    }

    /// Applies one server text frame; returns a frame to write back, if any.
    pub fn receive(&self, text: &str) -> Option<ClientFrame> {
        match classify_server_text(text) {
            ServerMessage::Frame(ServerFrame::Output { data }) => {
                lock(&self.shared).buffer.push(&data);
                None
            }
            ServerMessage::Frame(ServerFrame::Session { session_id }) => {
                let mut shared = lock(&self.shared);
                if shared.state == ChannelState::Opening {
                    shared.state = ChannelState::Open;
                }
                if session_id.is_some() {
                    shared.remote_id = session_id;
                }
                None
            }
            ServerMessage::Frame(ServerFrame::Exit { code }) => {
                let mut shared = lock(&self.shared);
                if shared.state != ChannelState::Closed {
                    shared.state = ChannelState::Exited;
                }
                shared.exit_code = code;
                None
            }
            ServerMessage::Frame(ServerFrame::Ping) => Some(ClientFrame::Pong),
            ServerMessage::Raw(text) => {
                lock(&self.shared).buffer.push(&text);
                None
            }
            ServerMessage::Unrecognized(reason) => {
                debug!("session_frame_ignored: {reason}");
                None
            }
        }
    }

    /// Remote side went away. Exit and explicit close take precedence.
    pub fn disconnected(&self) {
        let mut shared = lock(&self.shared);
        if matches!(shared.state, ChannelState::Opening | ChannelState::Open) {
            shared.state = ChannelState::Disconnected;
        }
    }
}

pub struct ChannelPeer {
    pub link: PeerLink,
    pub outbound: mpsc::UnboundedReceiver<ClientFrame>,
}

/// Opens the channel behind a new session.
pub trait SessionDialer {
    fn dial(&self, viewport: Viewport) -> Result<SessionTransport, SessionError>;
}

/// Dials `<ws-scheme>://<host>/ws/terminal` with tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsDialer {
    url: Url,
    buffer_bytes: usize,
}

impl WsDialer {
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            url: config.terminal_url(),
            buffer_bytes: config.output_buffer_bytes,
        }
    }
}

impl SessionDialer for WsDialer {
    fn dial(&self, viewport: Viewport) -> Result<SessionTransport, SessionError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| SessionError::Dial(err.to_string()))?;
        let (mut transport, peer) = SessionTransport::pair(self.buffer_bytes, viewport);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = runtime.spawn(run_channel(self.url.clone(), peer, shutdown_rx));
        transport.bind_driver(shutdown_tx, task);
        Ok(transport)
    }
}

async fn run_channel(url: Url, peer: ChannelPeer, mut shutdown: watch::Receiver<bool>) {
    let ChannelPeer {
        link,
        mut outbound,
    } = peer;

    let dial = tokio::select! {
        _ = shutdown.changed() => return,
        result = connect_async(url.as_str()) => result,
    };
    let socket = match dial {
        Ok((socket, _)) => socket,
        Err(err) => {
            warn!("session_connect_error: {err}");
            link.disconnected();
            return;
        }
    };
    if link.is_closed() {
        return;
    }
    link.opened();
    info!(event = "session_channel_open", url = %url);

    let (mut write, mut read) = socket.split();
    let initial = ClientFrame::resize(link.viewport());
    if let Err(err) = write.send(Message::Text(initial.to_text())).await {
        warn!("session_write_error: {err}");
        link.disconnected();
        return;
    }

    loop {
        let outgoing = tokio::select! {
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return;
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => link.receive(&text),
                Some(Ok(Message::Binary(bytes))) => link.receive(&String::from_utf8_lossy(&bytes)),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => None,
                Some(Err(err)) => {
                    warn!("session_socket_error: {err}");
                    break;
                }
            },
            Some(frame) = outbound.recv() => Some(frame),
        };
        if let Some(frame) = outgoing {
            if let Err(err) = write.send(Message::Text(frame.to_text())).await {
                warn!("session_write_error: {err}");
                break;
            }
        }
    }

    info!(event = "session_channel_closed", url = %url);
    link.disconnected();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_is_forwarded_only_while_open() {
        let (transport, mut peer) = SessionTransport::pair(1024, Viewport::default());
        assert!(!transport.send_input("ls\r"));
        peer.link.opened();
        assert!(transport.send_input("ls\r"));
        assert_eq!(
            peer.outbound.try_recv().expect("frame"),
            ClientFrame::Input {
                data: "ls\r".to_string()
            }
        );
    }

    #[test]
    fn server_frames_update_buffer_and_state() {
        let (transport, peer) = SessionTransport::pair(1024, Viewport::default());
        peer.link
            .receive(r#"{"type":"session","session_id":"pty-7"}"#);
        assert_eq!(transport.state(), ChannelState::Open);
        assert_eq!(transport.remote_id().as_deref(), Some("pty-7"));

        peer.link.receive(r#"{"type":"output","data":"hi\r\n"}"#);
        peer.link.receive("plain text frame");
        assert_eq!(transport.output(), "hi\r\nplain text frame");

        assert_eq!(
            peer.link.receive(r#"{"type":"ping"}"#),
            Some(ClientFrame::Pong)
        );
        assert_eq!(peer.link.receive(r#"{"type":"mystery"}"#), None);

        peer.link.receive(r#"{"type":"exit","code":0}"#);
        peer.link.disconnected();
        assert_eq!(transport.state(), ChannelState::Exited);
        assert_eq!(transport.exit_code(), Some(0));
    }

    #[test]
    fn remote_drop_marks_disconnected_but_close_wins() {
        let (mut transport, peer) = SessionTransport::pair(1024, Viewport::default());
        peer.link.opened();
        peer.link.disconnected();
        assert_eq!(transport.state(), ChannelState::Disconnected);

        transport.close();
        peer.link.disconnected();
        assert_eq!(transport.state(), ChannelState::Closed);
        assert!(!transport.send_input("x"));
    }

    #[test]
    fn resize_is_remembered_even_when_not_sent() {
        let (transport, mut peer) = SessionTransport::pair(1024, Viewport::default());
        assert!(!transport.resize(Viewport::new(80, 24)));
        assert_eq!(transport.viewport(), Viewport::new(80, 24));
        assert_eq!(peer.link.viewport(), Viewport::new(80, 24));
        assert!(peer.outbound.try_recv().is_err());
    }

    #[test]
    fn failed_session_is_disconnected_with_a_marker() {
        let transport = SessionTransport::failed(1024, Viewport::default(), "refused");
        assert_eq!(transport.state(), ChannelState::Disconnected);
        assert!(transport.output().contains("refused"));
        assert!(!transport.send_input("x"));
    }

    #[test]
    fn dialing_without_runtime_is_an_error() {
        let config = LinkConfig::new("http://127.0.0.1:9").expect("config");
        let dialer = WsDialer::new(&config);
        assert!(matches!(
            dialer.dial(Viewport::default()),
            Err(SessionError::Dial(_))
        ));
    }
}
