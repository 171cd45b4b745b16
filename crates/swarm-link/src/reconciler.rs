//! Folds task and agent envelopes into keyed collections and derives the board.

use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::{Map, Value};
use swarm_core::{
    id_from_value, string_list, Agent, AgentStatus, Envelope, EnvelopeKind, MissionSummary, Task,
    TaskPriority, TaskStatus,
};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::listeners::{ListenerId, Topic};
use crate::transport::TransportClient;

const MISSION_STARTED_MARKER: &str = "Mission started";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerEffect {
    /// The mission finished; periodic REST polling should stop.
    StopPolling,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub changed: bool,
    pub effect: Option<ReconcilerEffect>,
}

impl IngestOutcome {
    fn changed(changed: bool) -> Self {
        Self {
            changed,
            effect: None,
        }
    }
}

/// Owns the task and agent collections. Consumers only ever see [`BoardView`]s.
#[derive(Debug, Default, Clone)]
pub struct EntityReconciler {
    tasks: Vec<Task>,
    agents: Vec<Agent>,
    summary: Option<MissionSummary>,
    completed: bool,
}

impl EntityReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, envelope: &Envelope) -> IngestOutcome {
        match envelope.kind {
            EnvelopeKind::TaskAssigned => IngestOutcome::changed(self.merge_task_payload(&envelope.data)),
            EnvelopeKind::AgentStatus => IngestOutcome::changed(self.apply_agent_event(envelope)),
            EnvelopeKind::Connection => {
                let changed = match envelope.data.get("agents") {
                    Some(Value::Array(agents)) => self.merge_agent_list(agents, &envelope.sender_role),
                    _ => false,
                };
                IngestOutcome::changed(changed)
            }
            EnvelopeKind::MissionComplete => {
                if let Some(Value::Array(tasks)) = envelope.data.get("tasks") {
                    self.merge_task_list(tasks);
                }
                self.summary = envelope
                    .data
                    .get("summary")
                    .and_then(|value| serde_json::from_value(value.clone()).ok());
                self.completed = true;
                info!(event = "mission_complete", tasks = self.tasks.len());
                IngestOutcome {
                    changed: true,
                    effect: Some(ReconcilerEffect::StopPolling),
                }
            }
            EnvelopeKind::SystemNotice if is_mission_reset(envelope) => {
                let changed = !self.tasks.is_empty() || self.completed || self.summary.is_some();
                self.reset_mission();
                info!(event = "mission_reset", agents = self.agents.len());
                IngestOutcome::changed(changed)
            }
            _ => IngestOutcome::default(),
        }
    }

    /// Bulk-loads a REST snapshot through the same merge path as envelopes.
    pub fn seed(&mut self, tasks: &[Value], agents: &[Value]) -> bool {
        let tasks_changed = self.merge_task_list(tasks);
        let agents_changed = self.merge_agent_list(agents, "");
        tasks_changed || agents_changed
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn agent(&self, id: &str) -> Option<&Agent> {
        self.agents.iter().find(|agent| agent.id == id)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Recomputed from scratch on every call.
    pub fn view(&self) -> BoardView {
        BoardView::build(&self.tasks, &self.agents, self.completed, self.summary.clone())
    }

    fn reset_mission(&mut self) {
        self.tasks.clear();
        self.summary = None;
        self.completed = false;
    }

    fn merge_task_payload(&mut self, data: &Map<String, Value>) -> bool {
        if let Some(Value::Array(tasks)) = data.get("tasks") {
            return self.merge_task_list(tasks);
        }
        self.merge_task(data)
    }

    fn merge_task_list(&mut self, tasks: &[Value]) -> bool {
        let mut changed = false;
        for value in tasks {
            if let Value::Object(fields) = value {
                changed |= self.merge_task(fields);
            }
        }
        changed
    }

    fn merge_task(&mut self, fields: &Map<String, Value>) -> bool {
        let Some(id) = fields
            .get("id")
            .or_else(|| fields.get("task_id"))
            .and_then(id_from_value)
        else {
            debug!("task_update_ignored: missing id");
            return false;
        };

        let (index, inserted) = match self.tasks.iter().position(|task| task.id == id) {
            Some(index) => (index, false),
            None => {
                self.tasks.push(Task::new(id));
                (self.tasks.len() - 1, true)
            }
        };
        let task = &mut self.tasks[index];
        let before = task.clone();
        for (key, value) in fields {
            apply_task_field(task, key, value);
        }
        inserted || before != *task
    }

    fn apply_agent_event(&mut self, envelope: &Envelope) -> bool {
        if envelope.data_str("event") == Some("agent_killed") {
            let Some(id) = envelope.data.get("id").and_then(id_from_value) else {
                return false;
            };
            let before = self.agents.len();
            self.agents.retain(|agent| agent.id != id);
            let removed = self.agents.len() != before;
            if removed {
                info!(event = "agent_removed", id = %id);
            }
            return removed;
        }
        self.merge_agent(&envelope.data, &envelope.sender_role)
    }

    fn merge_agent_list(&mut self, agents: &[Value], default_role: &str) -> bool {
        let mut changed = false;
        for value in agents {
            if let Value::Object(fields) = value {
                changed |= self.merge_agent(fields, default_role);
            }
        }
        changed
    }

    fn merge_agent(&mut self, fields: &Map<String, Value>, default_role: &str) -> bool {
        let Some(id) = fields
            .get("id")
            .or_else(|| fields.get("agent_id"))
            .and_then(id_from_value)
        else {
            debug!("agent_update_ignored: missing id");
            return false;
        };

        let (index, inserted) = match self.agents.iter().position(|agent| agent.id == id) {
            Some(index) => (index, false),
            None => {
                let mut agent = Agent::new(id);
                agent.role = default_role.to_string();
                self.agents.push(agent);
                (self.agents.len() - 1, true)
            }
        };
        let agent = &mut self.agents[index];
        let before = agent.clone();
        for (key, value) in fields {
            apply_agent_field(agent, key, value);
        }
        inserted || before != *agent
    }
}

fn apply_task_field(task: &mut Task, key: &str, value: &Value) {
    match key {
        "id" | "task_id" => {}
        "title" => {
            if let Some(title) = value.as_str() {
                task.title = title.to_string();
            }
        }
        "description" => {
            if let Some(description) = value.as_str() {
                task.description = description.to_string();
            }
        }
        "status" => {
            if let Some(status) = value.as_str().and_then(|s| TaskStatus::from_str(s).ok()) {
                task.status = status;
            }
        }
        "assignee" => match value {
            Value::Null => task.assignee = None,
            Value::String(assignee) if assignee.trim().is_empty() => task.assignee = None,
            Value::String(assignee) => task.assignee = Some(assignee.clone()),
            _ => {}
        },
        "priority" => {
            if let Some(priority) = value.as_str().and_then(|s| TaskPriority::from_str(s).ok()) {
                task.priority = priority;
            }
        }
        "dependencies" => {
            if let Value::Array(items) = value {
                task.dependencies = string_list(items.iter());
            }
        }
        "tags" => {
            if let Value::Array(items) = value {
                task.tags = string_list(items.iter());
            }
        }
        other => {
            task.extra.insert(other.to_string(), value.clone());
        }
    }
}

fn apply_agent_field(agent: &mut Agent, key: &str, value: &Value) {
    let text = value.as_str();
    match key {
        "id" | "agent_id" | "event" => {}
        "role" => {
            if let Some(role) = text {
                agent.role = role.to_string();
            }
        }
        "status" => {
            if let Some(status) = text {
                agent.status = AgentStatus::from_str(status).unwrap_or(AgentStatus::Unknown);
            }
        }
        "color" => {
            if let Some(color) = text {
                agent.color = color.to_string();
            }
        }
        "emoji" => {
            if let Some(emoji) = text {
                agent.emoji = emoji.to_string();
            }
        }
        other => {
            agent.extra.insert(other.to_string(), value.clone());
        }
    }
}

fn is_mission_reset(envelope: &Envelope) -> bool {
    matches!(
        envelope.data_str("event"),
        Some("mission_reset") | Some("mission_started")
    ) || envelope.content.contains(MISSION_STARTED_MARKER)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    pub status: TaskStatus,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub todo: usize,
    pub in_progress: usize,
    pub in_review: usize,
    pub done: usize,
    pub blocked: usize,
}

impl StatusCounts {
    pub fn get(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Todo => self.todo,
            TaskStatus::InProgress => self.in_progress,
            TaskStatus::InReview => self.in_review,
            TaskStatus::Done => self.done,
            TaskStatus::Blocked => self.blocked,
        }
    }

    pub fn sum(&self) -> usize {
        self.todo + self.in_progress + self.in_review + self.done + self.blocked
    }

    fn bump(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Todo => self.todo += 1,
            TaskStatus::InProgress => self.in_progress += 1,
            TaskStatus::InReview => self.in_review += 1,
            TaskStatus::Done => self.done += 1,
            TaskStatus::Blocked => self.blocked += 1,
        }
    }
}

/// Read-only kanban snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoardView {
    /// One bucket per status, in board order.
    pub buckets: Vec<Bucket>,
    pub counts: StatusCounts,
    pub total: usize,
    /// `done / total` in `0.0..=1.0`; pinned to 1.0 once the mission completed.
    pub progress: f64,
    pub completed: bool,
    pub summary: Option<MissionSummary>,
    pub agents: Vec<Agent>,
}

impl Default for BoardView {
    fn default() -> Self {
        Self::build(&[], &[], false, None)
    }
}

impl BoardView {
    fn build(
        tasks: &[Task],
        agents: &[Agent],
        completed: bool,
        summary: Option<MissionSummary>,
    ) -> Self {
        let mut counts = StatusCounts::default();
        let buckets = TaskStatus::ALL
            .iter()
            .map(|status| Bucket {
                status: *status,
                tasks: tasks
                    .iter()
                    .filter(|task| task.status == *status)
                    .cloned()
                    .collect(),
            })
            .collect();
        for task in tasks {
            counts.bump(task.status);
        }
        let total = tasks.len();
        let progress = if completed {
            1.0
        } else if total == 0 {
            0.0
        } else {
            counts.done as f64 / total as f64
        };
        Self {
            buckets,
            counts,
            total,
            progress,
            completed,
            summary,
            agents: agents.to_vec(),
        }
    }

    pub fn bucket(&self, status: TaskStatus) -> &[Task] {
        self.buckets
            .iter()
            .find(|bucket| bucket.status == status)
            .map(|bucket| bucket.tasks.as_slice())
            .unwrap_or(&[])
    }

    pub fn tasks_for(&self, assignee: &str) -> Vec<&Task> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.tasks.iter())
            .filter(|task| task.assignee.as_deref() == Some(assignee))
            .collect()
    }

    pub fn percent(&self) -> u8 {
        (self.progress * 100.0).round().clamp(0.0, 100.0) as u8
    }

    pub fn busy_agents(&self) -> usize {
        self.agents.iter().filter(|agent| agent.status.is_busy()).count()
    }
}

struct HandleInner {
    reconciler: Mutex<EntityReconciler>,
    view_tx: watch::Sender<BoardView>,
    polling_paused: watch::Sender<bool>,
}

/// Shared owner of an [`EntityReconciler`] that publishes views on change.
#[derive(Clone)]
pub struct ReconcilerHandle {
    inner: Arc<HandleInner>,
}

impl Default for ReconcilerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconcilerHandle {
    pub fn new() -> Self {
        let (view_tx, _) = watch::channel(BoardView::default());
        let (polling_paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(HandleInner {
                reconciler: Mutex::new(EntityReconciler::new()),
                view_tx,
                polling_paused,
            }),
        }
    }

    /// Registers on the transport's generic topic. Attach before any other
    /// consumer so every listener observes the already-merged state.
    pub fn attach(&self, transport: &TransportClient) -> ListenerId {
        let handle = self.clone();
        transport.on(Topic::Message, move |envelope| {
            handle.ingest(envelope);
            Ok(())
        })
    }

    pub fn ingest(&self, envelope: &Envelope) -> IngestOutcome {
        let mut reconciler = self.lock();
        let outcome = reconciler.ingest(envelope);
        if outcome.changed {
            self.inner.view_tx.send_replace(reconciler.view());
        }
        if envelope.kind == EnvelopeKind::SystemNotice && outcome.changed {
            self.inner.polling_paused.send_replace(false);
        }
        if outcome.effect == Some(ReconcilerEffect::StopPolling) {
            self.inner.polling_paused.send_replace(true);
        }
        outcome
    }

    pub fn seed(&self, tasks: &[Value], agents: &[Value]) -> bool {
        let mut reconciler = self.lock();
        let changed = reconciler.seed(tasks, agents);
        if changed {
            self.inner.view_tx.send_replace(reconciler.view());
        }
        changed
    }

    pub fn view(&self) -> BoardView {
        self.inner.view_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BoardView> {
        self.inner.view_tx.subscribe()
    }

    /// True once the mission completed; cleared by a mission reset.
    pub fn polling_paused(&self) -> watch::Receiver<bool> {
        self.inner.polling_paused.subscribe()
    }

    pub fn with_reconciler<R>(&self, read: impl FnOnce(&EntityReconciler) -> R) -> R {
        read(&self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, EntityReconciler> {
        self.inner
            .reconciler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
