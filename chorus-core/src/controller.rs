//! Per-agent controller (spec.md §4.6): a state machine driven by
//! mention-triggered wakeups, with retry-with-backoff, inbox acknowledgment
//! discipline, and prompt assembly. One controller owns one agent; it holds a
//! non-owning `Arc` handle to the shared channel store (spec.md §3.7, §9
//! "Back-references").

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::channel::{ChannelStore, InboxEntry, InboxPriority, ReadFilter};
use crate::event_log::EventLog;

/// The `send` contract every backend (subprocess or in-process SDK) must
/// satisfy (spec.md §6.3). The controller never branches on backend kind —
/// only the scheduler does, when wiring up the MCP URL.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn send(&self, message: &str, system: Option<&str>) -> Result<BackendReply, BackendError>;
}

#[derive(Debug, Clone, Default)]
pub struct BackendReply {
    pub content: String,
    pub usage: Option<serde_json::Value>,
    pub tool_calls: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend invocation failed: {0}")]
    Failed(String),
    #[error("backend invocation timed out after {0:?}")]
    Timeout(Duration),
    #[error("backend invocation cancelled")]
    Cancelled,
}

/// spec.md §3.7 `state ∈ {starting, idle, running, failed}`, plus `stopping`/
/// `stopped` for cancellation (spec.md §5 "Cancellation and timeouts").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Starting,
    Idle,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// How many of the most recent public channel messages to include in the
/// "## Recent Activity" prompt section (spec.md §4.6 step 3, "a bounded
/// window").
pub const RECENT_ACTIVITY_WINDOW: usize = 20;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub backoff_multiplier: f64,
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            backoff_cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// `backoffMs * backoffMultiplier^(attempt-1)`, capped (spec.md §4.6).
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi((attempt.saturating_sub(1)) as i32);
        let millis = (self.backoff.as_millis() as f64 * factor).min(self.backoff_cap.as_millis() as f64);
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

pub struct AgentController {
    name: String,
    workflow_name: String,
    resolved_system_prompt: String,
    project_dir: std::path::PathBuf,
    backend: Arc<dyn Backend>,
    store: Arc<ChannelStore>,
    event_log: Arc<EventLog>,
    state: Mutex<ControllerState>,
    pending_wake: AtomicBool,
    notify: Notify,
    retry_attempt: AtomicU32,
    poll_interval: Duration,
    retry_policy: RetryPolicy,
}

impl AgentController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        workflow_name: impl Into<String>,
        resolved_system_prompt: impl Into<String>,
        project_dir: std::path::PathBuf,
        backend: Arc<dyn Backend>,
        store: Arc<ChannelStore>,
        event_log: Arc<EventLog>,
        poll_interval: Duration,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            workflow_name: workflow_name.into(),
            resolved_system_prompt: resolved_system_prompt.into(),
            project_dir,
            backend,
            store,
            event_log,
            state: Mutex::new(ControllerState::Starting),
            pending_wake: AtomicBool::new(false),
            notify: Notify::new(),
            retry_attempt: AtomicU32::new(0),
            poll_interval,
            retry_policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> ControllerState {
        *self.state.lock().await
    }

    async fn set_state(&self, next: ControllerState) {
        let mut guard = self.state.lock().await;
        if *guard != next {
            info!(agent = %self.name, from = ?*guard, to = ?next, "controller state transition");
        }
        *guard = next;
    }

    /// Edge-triggered wake (spec.md §4.6 "Wake semantics"): if idle, the
    /// controller runs on the next tick; if already running, the bit is
    /// remembered and coalesces into exactly one more run after the current
    /// one completes.
    pub fn wake(&self) {
        self.pending_wake.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Drives the controller until `cancel` is signalled (spec.md §5
    /// "Controllers accept a cancel signal"). Combines the edge-triggered
    /// wake with a poll-interval liveness floor (spec.md §4.6 "Polling").
    pub async fn run(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        self.set_state(ControllerState::Idle).await;
        loop {
            if *cancel.borrow() {
                break;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break;
                    }
                }
            }
            if *cancel.borrow() {
                break;
            }
            if matches!(self.state().await, ControllerState::Failed) {
                continue;
            }
            self.tick().await;
        }
        self.set_state(ControllerState::Stopped).await;
    }

    /// One run-loop iteration (spec.md §4.6 "Run loop").
    async fn tick(&self) {
        let had_pending = self.pending_wake.swap(false, Ordering::SeqCst);
        let inbox = match self.store.get_inbox(&self.name).await {
            Ok(i) => i,
            Err(e) => {
                warn!(agent = %self.name, error = %e, "controller: failed to read inbox");
                return;
            }
        };

        // Controller idempotence (spec.md §8): an empty inbox with no pending
        // wake performs no channel writes at all.
        if inbox.is_empty() && !had_pending {
            self.set_state(ControllerState::Idle).await;
            return;
        }

        self.set_state(ControllerState::Running).await;
        let tentative_ack_id = inbox.last().map(|e| e.id.clone());
        let prompt = self.assemble_prompt(&inbox).await;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            debug!(agent = %self.name, attempt, "controller: invoking backend");
            match self.backend.send(&prompt, Some(&self.resolved_system_prompt)).await {
                Ok(reply) => {
                    self.event_log.output(&self.name, reply.content).await;
                    if let Some(id) = &tentative_ack_id {
                        if let Err(e) = self.store.ack_inbox(&self.name, id).await {
                            warn!(agent = %self.name, error = %e, "controller: failed to ack inbox");
                        }
                    }
                    self.retry_attempt.store(0, Ordering::SeqCst);
                    break;
                }
                Err(e) => {
                    if attempt >= self.retry_policy.max_attempts {
                        let msg = format!(
                            "agent {} failed after {} attempts: {}",
                            self.name, attempt, e
                        );
                        warn!(agent = %self.name, error = %e, attempt, "controller: terminal failure");
                        self.event_log.system(&self.name, msg).await;
                        self.set_state(ControllerState::Failed).await;
                        return;
                    }
                    self.retry_attempt.store(attempt, Ordering::SeqCst);
                    let delay = self.retry_policy.delay_for(attempt);
                    warn!(agent = %self.name, error = %e, attempt, delay_ms = delay.as_millis() as u64, "controller: retrying after backoff");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.set_state(ControllerState::Idle).await;
        // Coalesced wake: a mention that arrived mid-run is remembered; nudge
        // the run loop so it re-ticks immediately instead of waiting a full
        // poll interval.
        if self.pending_wake.load(Ordering::SeqCst) {
            self.notify.notify_one();
        }
    }

    async fn assemble_prompt(&self, inbox: &[InboxEntry]) -> String {
        let mut sorted = inbox.to_vec();
        sorted.sort_by(|a, b| priority_rank(b.priority).cmp(&priority_rank(a.priority)));

        let mut out = String::new();
        out.push_str(&format!(
            "You are agent @{} participating in workflow \"{}\".\n\n",
            self.name, self.workflow_name
        ));

        out.push_str("## Inbox\n");
        if sorted.is_empty() {
            out.push_str("(no new messages)\n");
        } else {
            for entry in &sorted {
                out.push_str(&format!("From @{}: {}\n", entry.from, entry.content));
            }
        }
        out.push('\n');

        out.push_str("## Recent Activity\n");
        match self
            .store
            .read_channel(&ReadFilter {
                limit: Some(RECENT_ACTIVITY_WINDOW),
                agent: Some(self.name.clone()),
                ..Default::default()
            })
            .await
        {
            Ok(recent) => {
                for msg in &recent {
                    out.push_str(&format!("@{}: {}\n", msg.from, msg.content));
                }
            }
            Err(e) => {
                warn!(agent = %self.name, error = %e, "controller: failed to read recent activity");
            }
        }
        out.push('\n');

        out.push_str(&format!("Working on: {}\n", self.project_dir.display()));

        let attempt = self.retry_attempt.load(Ordering::SeqCst);
        if attempt > 0 {
            out.push_str(&format!(
                "\nThis is retry attempt {} of {}.\n",
                attempt + 1,
                self.retry_policy.max_attempts
            ));
        }

        out
    }
}

fn priority_rank(p: InboxPriority) -> u8 {
    match p {
        InboxPriority::DirectMessage => 2,
        InboxPriority::Mention => 1,
        InboxPriority::SystemMention => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use crate::storage::MemoryStorage;
    use std::sync::atomic::AtomicU32 as StdAtomicU32;

    struct ScriptedBackend {
        replies: Mutex<Vec<Result<BackendReply, BackendError>>>,
        invocations: StdAtomicU32,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<Result<BackendReply, BackendError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                invocations: StdAtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        async fn send(&self, _message: &str, _system: Option<&str>) -> Result<BackendReply, BackendError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock().await;
            if replies.is_empty() {
                return Err(BackendError::Failed("no more scripted replies".to_string()));
            }
            replies.remove(0)
        }
    }

    fn controller(backend: Arc<dyn Backend>, store: Arc<ChannelStore>) -> Arc<AgentController> {
        Arc::new(AgentController::new(
            "bob",
            "test-workflow",
            "you are bob",
            std::path::PathBuf::from("/tmp/bob"),
            backend,
            store.clone(),
            Arc::new(EventLog::new(store)),
            Duration::from_millis(20),
            RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(1),
                backoff_multiplier: 1.0,
                backoff_cap: Duration::from_millis(10),
            },
        ))
    }

    fn store() -> Arc<ChannelStore> {
        Arc::new(ChannelStore::new(
            Arc::new(MemoryStorage::new()),
            vec!["alice".to_string(), "bob".to_string()],
            2_000,
            false,
        ))
    }

    #[tokio::test]
    async fn idempotent_with_empty_inbox_and_no_wake() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let ctl = controller(backend.clone(), store.clone());
        ctl.tick().await;
        assert_eq!(backend.invocations.load(Ordering::SeqCst), 0);
        assert_eq!(ctl.state().await, ControllerState::Idle);
    }

    #[tokio::test]
    async fn successful_run_acks_inbox_and_returns_idle() {
        let store = store();
        store
            .append_message("alice", "@bob hi", None, MessageKind::Message, None, None)
            .await
            .unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(BackendReply {
            content: "@alice hello".to_string(),
            usage: None,
            tool_calls: None,
        })]));
        let ctl = controller(backend.clone(), store.clone());
        ctl.tick().await;
        assert_eq!(backend.invocations.load(Ordering::SeqCst), 1);
        assert_eq!(ctl.state().await, ControllerState::Idle);
        assert!(store.get_inbox("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_then_success_invokes_backend_three_times() {
        let store = store();
        let triggering = store
            .append_message("alice", "@bob do it", None, MessageKind::Message, None, None)
            .await
            .unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(BackendError::Failed("transient 1".to_string())),
            Err(BackendError::Failed("transient 2".to_string())),
            Ok(BackendReply {
                content: "@alice done".to_string(),
                usage: None,
                tool_calls: None,
            }),
        ]));
        let ctl = controller(backend.clone(), store.clone());
        ctl.tick().await;
        assert_eq!(backend.invocations.load(Ordering::SeqCst), 3);
        assert_eq!(ctl.state().await, ControllerState::Idle);
        let state = store.get_inbox("bob").await.unwrap();
        assert!(state.is_empty());

        // Acked to the original triggering message, no duplicate outbound sends.
        let sent = store
            .read_channel(&ReadFilter::default())
            .await
            .unwrap();
        let outbound: Vec<_> = sent.iter().filter(|m| m.from == "bob").collect();
        assert_eq!(outbound.len(), 1);
        let _ = triggering;
    }

    #[tokio::test]
    async fn exhausted_retries_transition_to_failed() {
        let store = store();
        store
            .append_message("alice", "@bob do it", None, MessageKind::Message, None, None)
            .await
            .unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(BackendError::Failed("e1".to_string())),
            Err(BackendError::Failed("e2".to_string())),
            Err(BackendError::Failed("e3".to_string())),
        ]));
        let ctl = controller(backend.clone(), store.clone());
        ctl.tick().await;
        assert_eq!(ctl.state().await, ControllerState::Failed);
        let entries = store.read_channel(&ReadFilter::default()).await.unwrap();
        assert!(entries.iter().any(|m| m.kind == MessageKind::System));
    }

    #[tokio::test]
    async fn wake_runs_with_empty_inbox() {
        let store = store();
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(BackendReply {
            content: "@alice kicked".to_string(),
            usage: None,
            tool_calls: None,
        })]));
        let ctl = controller(backend.clone(), store.clone());
        ctl.wake();
        ctl.tick().await;
        assert_eq!(backend.invocations.load(Ordering::SeqCst), 1);
    }
}
