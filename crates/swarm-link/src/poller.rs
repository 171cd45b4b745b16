use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::reconciler::ReconcilerHandle;

const MISSION_PATH: &str = "missions/current";
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// `GET /api/missions/current` body. Fields other than these are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MissionSnapshot {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub tasks: Vec<Value>,
    #[serde(default)]
    pub agents: Vec<Value>,
}

impl MissionSnapshot {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Seeded { changed: bool },
    NoActiveMission,
}

/// Periodic REST refresh of the board. While the mission is complete the
/// timer is parked until a mission reset; `stop()` ends it for good.
pub struct MissionPoller {
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl MissionPoller {
    pub fn spawn(config: &LinkConfig, handle: ReconcilerHandle) -> Result<Self, LinkError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| LinkError::NoRuntime(err.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        let url = config.api_url(MISSION_PATH);
        let period = config.poll_interval;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = runtime.spawn(run_poller(client, url, period, handle, shutdown_rx));
        Ok(Self {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for MissionPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One fetch-and-seed round.
pub async fn poll_once(
    client: &reqwest::Client,
    url: &Url,
    handle: &ReconcilerHandle,
) -> Result<PollOutcome, LinkError> {
    let snapshot: MissionSnapshot = client
        .get(url.clone())
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    if !snapshot.is_active() {
        return Ok(PollOutcome::NoActiveMission);
    }
    let changed = handle.seed(&snapshot.tasks, &snapshot.agents);
    Ok(PollOutcome::Seeded { changed })
}

async fn run_poller(
    client: reqwest::Client,
    url: Url,
    period: Duration,
    handle: ReconcilerHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut paused = handle.polling_paused();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(event = "mission_poller_started", url = %url);

    loop {
        if *paused.borrow_and_update() {
            // No ticks while the mission is complete; a reset wakes us.
            debug!("mission_poller_paused");
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = paused.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if !*paused.borrow() {
                debug!("mission_poller_resumed");
                ticker.reset_immediately();
            }
            continue;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            changed = paused.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }
        match poll_once(&client, &url, &handle).await {
            Ok(PollOutcome::Seeded { changed }) => debug!("mission_poll_seeded: changed={changed}"),
            Ok(PollOutcome::NoActiveMission) => debug!("mission_poll_idle"),
            Err(err) => warn!("mission_poll_error: {err}"),
        }
    }
    info!(event = "mission_poller_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_tolerates_missing_fields() {
        let idle: MissionSnapshot =
            serde_json::from_str(r#"{"status":"no_active_mission"}"#).expect("idle");
        assert!(!idle.is_active());
        assert!(idle.tasks.is_empty());

        let active: MissionSnapshot = serde_json::from_str(
            r#"{"status":"active","goal":"ship","tasks":[{"id":"T1"}],"agents":[],"token_usage":{}}"#,
        )
        .expect("active");
        assert!(active.is_active());
        assert_eq!(active.tasks.len(), 1);
        assert_eq!(active.goal.as_deref(), Some("ship"));
    }

    #[test]
    fn spawn_requires_a_runtime() {
        let config = LinkConfig::new("http://127.0.0.1:9").expect("config");
        assert!(matches!(
            MissionPoller::spawn(&config, ReconcilerHandle::new()),
            Err(LinkError::NoRuntime(_))
        ));
    }

    #[tokio::test]
    async fn stop_ends_the_poller() {
        let config = LinkConfig::new("http://127.0.0.1:9").expect("config");
        let mut poller = MissionPoller::spawn(&config, ReconcilerHandle::new()).expect("spawn");
        assert!(poller.is_running());
        poller.stop();
        assert!(!poller.is_running());
    }
}
