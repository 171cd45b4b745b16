use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use swarm_core::{Envelope, EnvelopeKind, TaskStatus, Viewport};
use swarm_link::{
    BoardView, LinkConfig, LinkStatus, MissionPoller, ReconcilerHandle, SessionManager, Topic,
    TransportClient, WsDialer,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_URL: &str = "http://127.0.0.1:8000";
const SESSION_FLUSH_MS: u64 = 100;

#[derive(Parser, Debug)]
#[command(name = "swarm-watch")]
struct Args {
    /// Backend base url; falls back to SWARM_URL.
    #[arg(long, default_value = "")]
    url: String,
    /// Drive one interactive session from stdin instead of sending chat.
    #[arg(long, default_value_t = false)]
    shell: bool,
    #[arg(long, default_value_t = false)]
    no_poll: bool,
    #[arg(long, default_value_t = false)]
    verbose: bool,
    #[arg(long, default_value = "")]
    log_level: String,
    #[arg(long, default_value_t = 25)]
    heartbeat_secs: u64,
    #[arg(long, default_value_t = 120)]
    cols: u16,
    #[arg(long, default_value_t = 30)]
    rows: u16,
}

#[derive(Debug, Clone)]
struct Config {
    url: String,
    shell: bool,
    poll: bool,
    log_level: String,
    log_stdout: bool,
    heartbeat: Duration,
    viewport: Viewport,
}

type Sessions = Arc<Mutex<SessionManager<WsDialer>>>;

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config(Args::parse());
    init_logging(&config);

    let mut link = LinkConfig::new(&config.url)
        .with_context(|| format!("invalid backend url '{}'", config.url))?;
    link.heartbeat_interval = config.heartbeat;
    link.viewport = config.viewport;

    let transport = Arc::new(TransportClient::new(link.clone()));
    let board = ReconcilerHandle::new();
    board.attach(&transport);

    transport.on(Topic::Kind(EnvelopeKind::Chat), |envelope| {
        print_line(&chat_line(envelope))
    });
    transport.on(Topic::Kind(EnvelopeKind::SystemNotice), |envelope| {
        print_line(&format!("* {}", envelope.content))
    });

    let sessions: Option<Sessions> = if config.shell {
        let mut manager = SessionManager::from_config(&link);
        manager.set_visible(true);
        let sessions = Arc::new(Mutex::new(manager));
        let mirror = sessions.clone();
        transport.on(Topic::Kind(EnvelopeKind::TerminalOutput), move |envelope| {
            let manager = mirror
                .lock()
                .map_err(|_| anyhow::anyhow!("session manager lock poisoned"))?;
            manager.mirror(envelope);
            Ok(())
        });
        Some(sessions)
    } else {
        None
    };

    let mut poller = if config.poll {
        Some(MissionPoller::spawn(&link, board.clone())?)
    } else {
        None
    };

    transport.connect()?;
    info!(event = "swarm_watch_start", url = %config.url, shell = config.shell);

    let result = run(&config, &transport, &board, sessions.as_ref()).await;

    if let Some(poller) = poller.as_mut() {
        poller.stop();
    }
    if let Some(sessions) = sessions {
        if let Ok(mut manager) = sessions.lock() {
            manager.shutdown();
        }
    }
    transport.close();
    info!(event = "swarm_watch_stop");
    result
}

async fn run(
    config: &Config,
    transport: &TransportClient,
    board: &ReconcilerHandle,
    sessions: Option<&Sessions>,
) -> Result<()> {
    let mut status = transport.status();
    let mut views = board.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut flush = tokio::time::interval(Duration::from_millis(SESSION_FLUSH_MS));
    let mut printed: u64 = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            changed = status.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let current = *status.borrow_and_update();
                print_line(&status_line(&current))?;
            }
            changed = views.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let view = views.borrow_and_update().clone();
                print_line(&board_summary(&view))?;
            }
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => handle_line(config, transport, sessions, &line)?,
                None => stdin_open = false,
            },
            _ = flush.tick(), if sessions.is_some() => {
                if let Some(sessions) = sessions {
                    printed = flush_session_output(sessions, printed)?;
                }
            }
        }
    }
}

fn handle_line(
    config: &Config,
    transport: &TransportClient,
    sessions: Option<&Sessions>,
    line: &str,
) -> Result<()> {
    if let (true, Some(sessions)) = (config.shell, sessions) {
        let manager = sessions
            .lock()
            .map_err(|_| anyhow::anyhow!("session manager lock poisoned"))?;
        if !manager.send_input(&format!("{line}\r")) {
            warn!("session_input_dropped: session is not open");
        }
        return Ok(());
    }
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(());
    }
    if !transport.send(&Envelope::from_user(EnvelopeKind::Chat, trimmed)) {
        print_line("! not connected; message dropped")?;
    }
    Ok(())
}

/// Prints output the active session produced since the last flush.
fn flush_session_output(sessions: &Sessions, printed: u64) -> Result<u64> {
    let manager = sessions
        .lock()
        .map_err(|_| anyhow::anyhow!("session manager lock poisoned"))?;
    let Some(transport) = manager.active_transport() else {
        return Ok(printed);
    };
    let written = transport.written();
    if written <= printed {
        return Ok(written);
    }
    let output = transport.output();
    let fresh = (written - printed).min(output.len() as u64) as usize;
    let mut start = output.len() - fresh;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    let mut stdout = io::stdout().lock();
    stdout.write_all(output[start..].as_bytes())?;
    stdout.flush()?;
    Ok(written)
}

fn print_line(line: &str) -> Result<()> {
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{line}")?;
    Ok(())
}

fn chat_line(envelope: &Envelope) -> String {
    let who = if envelope.sender_role.is_empty() {
        envelope.sender.as_str()
    } else {
        envelope.sender_role.as_str()
    };
    format!("[{who}] {}", envelope.content)
}

fn status_line(status: &LinkStatus) -> String {
    if status.gave_up {
        return format!(
            "link: gave up after {} attempts (restart to retry)",
            status.attempts
        );
    }
    if status.attempts > 0 {
        return format!("link: {} (attempt {})", status.state, status.attempts);
    }
    format!("link: {}", status.state)
}

fn board_summary(view: &BoardView) -> String {
    let counts = TaskStatus::ALL
        .iter()
        .map(|status| format!("{}={}", status.as_str(), view.counts.get(*status)))
        .collect::<Vec<_>>()
        .join(" ");
    let marker = if view.completed { " complete" } else { "" };
    format!(
        "board: {}% of {} tasks{marker} | {counts} | agents {} ({} busy)",
        view.percent(),
        view.total,
        view.agents.len(),
        view.busy_agents()
    )
}

fn load_config(args: Args) -> Config {
    Config {
        url: resolve_url(&args.url),
        shell: args.shell,
        poll: !args.no_poll,
        log_level: resolve_log_level(&args.log_level),
        log_stdout: args.verbose || env_true("SWARM_LOG_STDOUT"),
        heartbeat: Duration::from_secs(args.heartbeat_secs.max(1)),
        viewport: Viewport::new(args.cols, args.rows),
    }
}

fn resolve_url(url_flag: &str) -> String {
    if !url_flag.trim().is_empty() {
        return url_flag.trim().to_string();
    }
    if let Ok(value) = std::env::var("SWARM_URL") {
        if !value.trim().is_empty() {
            return value.trim().to_string();
        }
    }
    DEFAULT_URL.to_string()
}

fn resolve_log_level(level_flag: &str) -> String {
    if !level_flag.trim().is_empty() {
        return level_flag.trim().to_string();
    }
    if let Ok(value) = std::env::var("SWARM_LOG_LEVEL") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    "info".to_string()
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_stdout {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_core::AgentStatus;
    use swarm_link::{ConnectionState, EntityReconciler};

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["swarm-watch"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn flags_take_precedence_over_defaults() {
        let config = load_config(args(&[
            "--url",
            " https://swarm.example.com ",
            "--log-level",
            "debug",
            "--cols",
            "0",
            "--rows",
            "50",
            "--no-poll",
            "--shell",
        ]));
        assert_eq!(config.url, "https://swarm.example.com");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.viewport, Viewport::new(1, 50));
        assert!(!config.poll);
        assert!(config.shell);
    }

    #[test]
    fn status_line_reports_attempts_and_give_up() {
        let mut status = LinkStatus::default();
        assert_eq!(status_line(&status), "link: disconnected");
        status.state = ConnectionState::Reconnecting;
        status.attempts = 2;
        assert_eq!(status_line(&status), "link: reconnecting (attempt 2)");
        status.state = ConnectionState::Disconnected;
        status.gave_up = true;
        assert!(status_line(&status).contains("gave up after 2"));
    }

    #[test]
    fn board_summary_lists_every_bucket() {
        let mut reconciler = EntityReconciler::new();
        reconciler.seed(
            &[
                serde_json::json!({"id": "1", "status": "done"}),
                serde_json::json!({"id": "2", "status": "in_review"}),
            ],
            &[serde_json::json!({"id": "developer", "status": "acting"})],
        );
        let view = reconciler.view();
        assert_eq!(view.agents[0].status, AgentStatus::Acting);
        assert_eq!(
            board_summary(&view),
            "board: 50% of 2 tasks | todo=0 in_progress=0 in_review=1 done=1 blocked=0 | agents 1 (1 busy)"
        );
    }

    #[test]
    fn chat_line_prefers_role() {
        let envelope = Envelope::from_user(EnvelopeKind::Chat, "ship it");
        assert_eq!(chat_line(&envelope), "[User] ship it");
    }
}
