use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::{SinkExt, StreamExt};
use swarm_core::{decode_inbound, encode_envelope, Envelope, InboundFrame, PING_FRAME, PONG_FRAME};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::listeners::{DispatchReport, ListenerId, ListenerRegistry, Topic};
use crate::machine::{Backoff, ConnectionMachine, ConnectionState, LinkStatus};

type EventSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Result of feeding one raw text frame through the dispatch pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Heartbeat request; the contained frame must be written back.
    Reply(String),
    /// Heartbeat acknowledgement; nothing forwarded.
    Ack,
    Dispatched(DispatchReport),
    Dropped,
}

#[derive(Debug)]
enum SocketEnd {
    Shutdown,
    Closed,
    Error(String),
}

struct LinkCore {
    machine: ConnectionMachine,
    /// Bumped on every connect/close so a superseded driver cannot touch state.
    generation: u64,
}

struct Shared {
    core: Mutex<LinkCore>,
    status_tx: watch::Sender<LinkStatus>,
    listeners: ListenerRegistry,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    max_frame_bytes: usize,
}

impl Shared {
    fn core(&self) -> MutexGuard<'_, LinkCore> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<String>>> {
        self.outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition<R>(
        &self,
        generation: u64,
        apply: impl FnOnce(&mut ConnectionMachine) -> R,
    ) -> Option<R> {
        let mut core = self.core();
        if core.generation != generation {
            return None;
        }
        let result = apply(&mut core.machine);
        self.status_tx.send_replace(core.machine.status());
        Some(result)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.core().generation == generation
    }

    fn install_outbound(&self, generation: u64, tx: mpsc::UnboundedSender<String>) {
        if self.is_current(generation) {
            *self.outbound() = Some(tx);
        }
    }

    fn clear_outbound(&self, generation: u64) {
        if self.is_current(generation) {
            *self.outbound() = None;
        }
    }

    fn receive(&self, text: &str) -> FrameOutcome {
        match decode_inbound(text, self.max_frame_bytes) {
            Ok(InboundFrame::Ping) => FrameOutcome::Reply(PONG_FRAME.to_string()),
            Ok(InboundFrame::Pong) => FrameOutcome::Ack,
            Ok(InboundFrame::Envelope(envelope)) => {
                FrameOutcome::Dispatched(self.listeners.dispatch(&envelope))
            }
            Err(err) => {
                warn!("event_frame_decode_error: {err}");
                FrameOutcome::Dropped
            }
        }
    }
}

struct Driver {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Reconnecting event-channel client with a typed listener registry.
///
/// Construct one per dashboard and hand out `Arc<TransportClient>` to consumers.
/// All socket work happens on a single driver task; listeners run on that task in
/// frame arrival order.
pub struct TransportClient {
    config: LinkConfig,
    shared: Arc<Shared>,
    driver: Mutex<Option<Driver>>,
}

impl TransportClient {
    pub fn new(config: LinkConfig) -> Self {
        let machine = ConnectionMachine::new(config.reconnect);
        let (status_tx, _) = watch::channel(machine.status());
        let shared = Arc::new(Shared {
            core: Mutex::new(LinkCore {
                machine,
                generation: 0,
            }),
            status_tx,
            listeners: ListenerRegistry::new(),
            outbound: Mutex::new(None),
            max_frame_bytes: config.max_frame_bytes,
        });
        Self {
            config,
            shared,
            driver: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Starts a connect cycle. A no-op while one is already in flight.
    pub fn connect(&self) -> Result<(), LinkError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| LinkError::NoRuntime(err.to_string()))?;
        let mut driver = self.driver();
        let generation = {
            let mut core = self.shared.core();
            if !core.machine.request_connect() {
                return Ok(());
            }
            core.generation += 1;
            self.shared.status_tx.send_replace(core.machine.status());
            core.generation
        };

        if let Some(previous) = driver.take() {
            previous.task.abort();
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = runtime.spawn(run_link(
            self.shared.clone(),
            self.config.clone(),
            shutdown_rx,
            generation,
        ));
        *driver = Some(Driver {
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Closes the socket and cancels the heartbeat and any pending backoff timer.
    pub fn close(&self) {
        if let Some(driver) = self.driver().take() {
            let _ = driver.shutdown.send(true);
            driver.task.abort();
        }
        {
            let mut core = self.shared.core();
            core.generation += 1;
            core.machine.closed();
            self.shared.status_tx.send_replace(core.machine.status());
        }
        *self.shared.outbound() = None;
    }

    /// Best effort: returns false (and drops the envelope) unless connected.
    pub fn send(&self, envelope: &Envelope) -> bool {
        if self.state() != ConnectionState::Connected {
            debug!(
                "event_send_skipped: state={} kind={}",
                self.state(),
                envelope.kind.as_str()
            );
            return false;
        }
        let text = match encode_envelope(envelope, self.config.max_frame_bytes) {
            Ok(text) => text,
            Err(err) => {
                warn!("event_encode_error: {err}");
                return false;
            }
        };
        match self.shared.outbound().as_ref() {
            Some(tx) => tx.send(text).is_ok(),
            None => false,
        }
    }

    pub fn on<F>(&self, topic: Topic, handler: F) -> ListenerId
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.listeners.on(topic, handler)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.listeners.off(id)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.core().machine.state()
    }

    pub fn link_status(&self) -> LinkStatus {
        self.shared.core().machine.status()
    }

    /// Connectivity indicator feed.
    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Runs one raw text frame through the same pipeline the socket reader uses.
    pub fn receive_frame(&self, text: &str) -> FrameOutcome {
        self.shared.receive(text)
    }

    fn driver(&self) -> MutexGuard<'_, Option<Driver>> {
        self.driver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        if let Some(driver) = self.driver().take() {
            let _ = driver.shutdown.send(true);
            driver.task.abort();
        }
    }
}

async fn run_link(
    shared: Arc<Shared>,
    config: LinkConfig,
    mut shutdown: watch::Receiver<bool>,
    generation: u64,
) {
    let url = config.event_url();
    loop {
        let dial = tokio::select! {
            _ = shutdown.changed() => return,
            result = connect_async(url.as_str()) => result,
        };

        match dial {
            Ok((socket, _)) => {
                let end = run_connected(&shared, &config, socket, &mut shutdown, generation).await;
                match end {
                    SocketEnd::Shutdown => return,
                    SocketEnd::Closed => info!(event = "link_closed", url = %url),
                    SocketEnd::Error(err) => warn!("link_socket_error: {err}"),
                }
            }
            Err(err) => warn!("link_connect_error: {err}"),
        }

        let Some(backoff) = shared.transition(generation, |m| m.lost()) else {
            return;
        };
        match backoff {
            Backoff::Retry { attempt, delay } => {
                info!(
                    event = "link_reconnect_scheduled",
                    attempt,
                    delay_ms = delay.as_millis() as u64
                );
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if shared.transition(generation, |m| m.retry_due()).is_none() {
                    return;
                }
            }
            Backoff::GiveUp { attempts } => {
                error!(event = "link_gave_up", attempts);
                return;
            }
        }
    }
}

async fn run_connected(
    shared: &Shared,
    config: &LinkConfig,
    socket: EventSocket,
    shutdown: &mut watch::Receiver<bool>,
    generation: u64,
) -> SocketEnd {
    let (mut write, mut read) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    shared.install_outbound(generation, out_tx);
    if shared.transition(generation, |m| m.opened()).is_none() {
        return SocketEnd::Shutdown;
    }
    info!(event = "link_connected", url = %config.event_url());

    let period = config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let end = loop {
        let reply = tokio::select! {
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                break SocketEnd::Shutdown;
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => inbound_reply(shared, generation, &text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => inbound_reply(shared, generation, &text),
                    Err(_) => {
                        warn!("event_frame_binary_dropped");
                        None
                    }
                },
                Some(Ok(Message::Close(_))) | None => break SocketEnd::Closed,
                Some(Ok(_)) => None,
                Some(Err(err)) => break SocketEnd::Error(err.to_string()),
            },
            Some(text) = out_rx.recv() => Some(text),
            _ = heartbeat.tick() => Some(PING_FRAME.to_string()),
        };

        if let Some(text) = reply {
            if let Err(err) = write.send(Message::Text(text)).await {
                break SocketEnd::Error(err.to_string());
            }
        }
    };

    shared.clear_outbound(generation);
    drop(write);
    drop(read);
    end
}

fn inbound_reply(shared: &Shared, generation: u64, text: &str) -> Option<String> {
    if !shared.is_current(generation) {
        return None;
    }
    match shared.receive(text) {
        FrameOutcome::Reply(reply) => Some(reply),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use swarm_core::EnvelopeKind;

    fn client() -> TransportClient {
        TransportClient::new(LinkConfig::new("http://127.0.0.1:9").expect("config"))
    }

    #[test]
    fn ping_frame_is_answered_and_not_forwarded() {
        let client = client();
        let hits = Arc::new(StdMutex::new(0usize));
        let counter = hits.clone();
        client.on(Topic::Message, move |_| {
            *counter.lock().expect("lock") += 1;
            Ok(())
        });

        assert_eq!(
            client.receive_frame(r#"{"type":"ping"}"#),
            FrameOutcome::Reply(PONG_FRAME.to_string())
        );
        assert_eq!(client.receive_frame(r#"{"type":"pong"}"#), FrameOutcome::Ack);
        assert_eq!(*hits.lock().expect("lock"), 0);
    }

    #[test]
    fn malformed_frame_is_dropped_and_dispatch_continues() {
        let client = client();
        let kinds = Arc::new(StdMutex::new(Vec::new()));
        let log = kinds.clone();
        client.on(Topic::Message, move |envelope| {
            log.lock().expect("lock").push(envelope.kind);
            Ok(())
        });

        assert_eq!(client.receive_frame("{not json"), FrameOutcome::Dropped);
        assert_eq!(
            client.receive_frame(r#"{"type":"thought","content":"planning"}"#),
            FrameOutcome::Dispatched(DispatchReport {
                delivered: 1,
                failed: 0
            })
        );
        assert_eq!(*kinds.lock().expect("lock"), vec![EnvelopeKind::Thought]);
    }

    #[test]
    fn send_is_a_silent_no_op_while_disconnected() {
        let client = client();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.send(&Envelope::from_user(EnvelopeKind::Chat, "hello")));
    }

    #[test]
    fn connect_without_runtime_is_an_error_and_leaves_state_untouched() {
        let client = client();
        assert!(matches!(client.connect(), Err(LinkError::NoRuntime(_))));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn close_returns_to_disconnected_and_connect_is_idempotent() {
        let client = client();
        let mut status = client.status();
        client.connect().expect("connect");
        client.connect().expect("second connect is a no-op");
        assert_ne!(client.state(), ConnectionState::Disconnected);
        status.changed().await.ok();

        client.close();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.link_status().gave_up);
    }
}
