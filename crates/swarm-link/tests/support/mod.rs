#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Clone)]
struct BackendState {
    push: broadcast::Sender<String>,
    kick: broadcast::Sender<()>,
    event_received: Arc<Mutex<Vec<String>>>,
    terminal_received: Arc<Mutex<Vec<String>>>,
    event_connections: Arc<AtomicUsize>,
    terminal_opened: Arc<AtomicUsize>,
    terminal_closed: Arc<AtomicUsize>,
    mission: Arc<Mutex<Value>>,
    mission_requests: Arc<AtomicUsize>,
}

/// In-process stand-in for the swarm backend: `/ws`, `/ws/terminal` and
/// `/api/missions/current` on an ephemeral loopback port.
pub struct FakeBackend {
    pub addr: SocketAddr,
    state: BackendState,
    task: JoinHandle<()>,
}

impl FakeBackend {
    pub async fn start() -> Self {
        let (push, _) = broadcast::channel(64);
        let (kick, _) = broadcast::channel(4);
        let state = BackendState {
            push,
            kick,
            event_received: Arc::new(Mutex::new(Vec::new())),
            terminal_received: Arc::new(Mutex::new(Vec::new())),
            event_connections: Arc::new(AtomicUsize::new(0)),
            terminal_opened: Arc::new(AtomicUsize::new(0)),
            terminal_closed: Arc::new(AtomicUsize::new(0)),
            mission: Arc::new(Mutex::new(json!({"status": "no_active_mission"}))),
            mission_requests: Arc::new(AtomicUsize::new(0)),
        };

        let app = Router::new()
            .route("/ws", get(event_ws))
            .route("/ws/terminal", get(terminal_ws))
            .route("/api/missions/current", get(current_mission))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake backend");
        let addr = listener.local_addr().expect("local addr");
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { addr, state, task }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Sends a raw frame to every connected event client.
    pub fn push(&self, frame: &str) {
        let _ = self.state.push.send(frame.to_string());
    }

    /// Drops every event connection from the server side.
    pub fn kick(&self) {
        let _ = self.state.kick.send(());
    }

    pub fn set_mission(&self, mission: Value) {
        *self.state.mission.lock().expect("mission lock") = mission;
    }

    pub fn mission_requests(&self) -> usize {
        self.state.mission_requests.load(Ordering::SeqCst)
    }

    pub fn event_connections(&self) -> usize {
        self.state.event_connections.load(Ordering::SeqCst)
    }

    pub fn event_received(&self) -> Vec<String> {
        self.state.event_received.lock().expect("lock").clone()
    }

    pub fn terminal_received(&self) -> Vec<String> {
        self.state.terminal_received.lock().expect("lock").clone()
    }

    pub fn terminal_opened(&self) -> usize {
        self.state.terminal_opened.load(Ordering::SeqCst)
    }

    pub fn terminal_closed(&self) -> usize {
        self.state.terminal_closed.load(Ordering::SeqCst)
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn current_mission(State(state): State<BackendState>) -> Json<Value> {
    state.mission_requests.fetch_add(1, Ordering::SeqCst);
    Json(state.mission.lock().expect("mission lock").clone())
}

async fn event_ws(ws: WebSocketUpgrade, State(state): State<BackendState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_event_socket(socket, state))
}

async fn handle_event_socket(socket: WebSocket, state: BackendState) {
    state.event_connections.fetch_add(1, Ordering::SeqCst);
    let mut push = state.push.subscribe();
    let mut kick = state.kick.subscribe();
    let (mut write, mut read) = socket.split();

    let hello = json!({
        "type": "connection",
        "sender": "system",
        "sender_role": "System",
        "content": "Connected to swarm",
        "data": {
            "status": "connected",
            "mission_active": false,
            "agents": [
                {"id": "orchestrator", "role": "Orchestrator", "status": "idle", "emoji": "🧠", "color": "#8b5cf6"},
                {"id": "developer", "role": "Developer", "status": "thinking", "emoji": "💻", "color": "#10b981"}
            ]
        },
        "timestamp": 1_700_000_000.0
    });
    if write.send(Message::Text(hello.to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let is_ping = text.contains(r#""type":"ping""#);
                    state.event_received.lock().expect("lock").push(text);
                    if is_ping && write.send(Message::Text(r#"{"type":"pong"}"#.to_string())).await.is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            },
            Ok(frame) = push.recv() => {
                if write.send(Message::Text(frame)).await.is_err() {
                    return;
                }
            }
            Ok(()) = kick.recv() => {
                let _ = write.send(Message::Close(None)).await;
                return;
            }
        }
    }
}

async fn terminal_ws(ws: WebSocketUpgrade, State(state): State<BackendState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_terminal_socket(socket, state))
}

async fn handle_terminal_socket(socket: WebSocket, state: BackendState) {
    let number = state.terminal_opened.fetch_add(1, Ordering::SeqCst) + 1;
    let (mut write, mut read) = socket.split();
    let opening = [
        json!({"type": "session", "session_id": format!("pty-{number}")}).to_string(),
        json!({"type": "ping"}).to_string(),
    ];
    for frame in opening {
        if write.send(Message::Text(frame)).await.is_err() {
            state.terminal_closed.fetch_add(1, Ordering::SeqCst);
            return;
        }
    }

    while let Some(Ok(message)) = read.next().await {
        let Message::Text(text) = message else {
            if matches!(message, Message::Close(_)) {
                break;
            }
            continue;
        };
        state.terminal_received.lock().expect("lock").push(text.clone());
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        if frame["type"] != "input" {
            continue;
        }
        let data = frame["data"].as_str().unwrap_or_default().to_string();
        let replies = match data.as_str() {
            "exit\r" => vec![json!({"type": "exit", "code": 0}).to_string()],
            "raw\r" => vec!["plain bytes, not json".to_string()],
            _ => vec![json!({"type": "output", "data": data}).to_string()],
        };
        for reply in replies {
            if write.send(Message::Text(reply)).await.is_err() {
                break;
            }
        }
    }
    state.terminal_closed.fetch_add(1, Ordering::SeqCst);
}

/// Polls `check` until it holds, failing the test after a few seconds.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// A loopback address nothing is listening on.
pub async fn dead_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    format!("http://{addr}")
}
