//! Workflow scheduler (spec.md §4.7): the outermost loop. Boots the context
//! store and controllers, runs setup tasks, writes the kickoff message, wires
//! mention fan-out, performs debounced global idle detection, and tears down
//! with the context's persistence policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::channel::{ChannelError, ChannelStore};
use crate::controller::{AgentController, ControllerState};
use crate::event_log::EventLog;
use crate::message::MessageKind;
use crate::proposal::ProposalManager;
use crate::workflow::{run_setup_tasks, Kickoff, SetupTask, SetupTaskError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Setup(#[from] SetupTaskError),
}

/// The mention fan-out callback (spec.md §4.7 step 4): whenever an agent
/// posts a message mentioning another, the MCP tool surface invokes this so
/// the scheduler can wake the target controller. Implemented by
/// `WorkflowScheduler`; the MCP tool layer holds only this trait object, not
/// the concrete scheduler (spec.md §9 "Back-references" — non-owning handle).
pub trait MentionSink: Send + Sync {
    fn notify_mention(&self, target: &str);
}

/// Owns every controller and the MCP server's shared state for one workflow
/// run (spec.md §3.7 "Ownership").
pub struct WorkflowScheduler {
    store: Arc<ChannelStore>,
    event_log: Arc<EventLog>,
    proposals: Arc<ProposalManager>,
    controllers: HashMap<String, Arc<AgentController>>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    poll_interval: Duration,
    debounce_interval: Duration,
}

impl WorkflowScheduler {
    pub fn new(
        store: Arc<ChannelStore>,
        event_log: Arc<EventLog>,
        proposals: Arc<ProposalManager>,
        controllers: HashMap<String, Arc<AgentController>>,
        poll_interval: Duration,
        debounce_interval: Duration,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            store,
            event_log,
            proposals,
            controllers,
            cancel_tx,
            cancel_rx,
            poll_interval,
            debounce_interval,
        }
    }

    pub fn store(&self) -> Arc<ChannelStore> {
        self.store.clone()
    }

    pub fn event_log(&self) -> Arc<EventLog> {
        self.event_log.clone()
    }

    pub fn proposals(&self) -> Arc<ProposalManager> {
        self.proposals.clone()
    }

    pub fn controller(&self, agent: &str) -> Option<Arc<AgentController>> {
        self.controllers.get(agent).cloned()
    }

    /// Executes `workflow.setup` sequentially (spec.md §4.7 step 2).
    pub async fn run_setup(&self, tasks: &[SetupTask]) -> Result<HashMap<String, String>, SetupTaskError> {
        run_setup_tasks(tasks).await
    }

    /// Writes the kickoff message, marks the run-epoch floor, and wakes every
    /// mentioned agent (spec.md §4.7 step 3).
    pub async fn kickoff(&self, kickoff: &Kickoff) -> Result<(), ChannelError> {
        let msg = self
            .store
            .append_message(
                kickoff.from.clone(),
                kickoff.content.clone(),
                None,
                MessageKind::System,
                None,
                None,
            )
            .await?;
        self.store.mark_run_start().await?;
        for target in &msg.mentions {
            self.wake(target);
        }
        Ok(())
    }

    /// Wakes the named agent's controller, if one exists for this workflow.
    /// Kicks issued while a controller is `stopping`/`stopped` are silently
    /// discarded (spec.md §5 "Kicks issued while a controller is `stopping`
    /// are discarded") because `wake()` on a controller past `Running` simply
    /// has no one left to observe the pending bit before shutdown.
    pub fn wake(&self, agent: &str) {
        if let Some(ctl) = self.controllers.get(agent) {
            ctl.wake();
        }
    }

    /// Spawns one task per controller (spec.md §5 "one lightweight
    /// task/goroutine per agent controller").
    pub fn spawn_controllers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.controllers
            .values()
            .map(|ctl| {
                let ctl = ctl.clone();
                let cancel_rx = self.cancel_rx.clone();
                tokio::spawn(async move { ctl.run(cancel_rx).await })
            })
            .collect()
    }

    /// Debounced global idle detection (spec.md §4.7 step 5): the predicate
    /// (every controller idle, every inbox empty) must hold continuously for
    /// the full debounce window; any violation resets the window.
    pub async fn wait_for_idle(&self) {
        let check_interval = std::cmp::min(self.poll_interval, Duration::from_millis(50));
        let mut holding_since: Option<Instant> = None;
        loop {
            if self.all_failed().await {
                return;
            }
            if self.idle_predicate_holds().await {
                let start = *holding_since.get_or_insert_with(Instant::now);
                if start.elapsed() >= self.debounce_interval {
                    info!("workflow idle detected");
                    return;
                }
            } else {
                holding_since = None;
            }
            tokio::time::sleep(check_interval).await;
        }
    }

    async fn idle_predicate_holds(&self) -> bool {
        for ctl in self.controllers.values() {
            if ctl.state().await != ControllerState::Idle {
                return false;
            }
        }
        for name in self.controllers.keys() {
            match self.store.get_inbox(name).await {
                Ok(inbox) if inbox.is_empty() => {}
                _ => return false,
            }
        }
        true
    }

    /// Scheduler-level failure policy (spec.md §4.7 "Shutdown"): stop when
    /// every controller has reached the terminal `failed` state, since no
    /// agent remains to respond.
    async fn all_failed(&self) -> bool {
        if self.controllers.is_empty() {
            return false;
        }
        for ctl in self.controllers.values() {
            if ctl.state().await != ControllerState::Failed {
                return false;
            }
        }
        true
    }

    /// Stops every controller, drains their tasks, and applies the context's
    /// persistence policy (spec.md §4.7 step 6): `destroy()` is a no-op for
    /// bind (persistent) contexts.
    pub async fn shutdown(&self, handles: Vec<JoinHandle<()>>) -> Result<(), ChannelError> {
        let _ = self.cancel_tx.send(true);
        for handle in handles {
            let _ = handle.await;
        }
        self.store.destroy().await
    }

    /// Runs the whole lifecycle: optional kickoff, controller spawn, idle
    /// wait, shutdown. `kickoff` is `None` when the workflow has no kickoff
    /// template and instead waits for an external wake (spec.md §4.7 step 3).
    pub async fn run(self: Arc<Self>, kickoff: Option<Kickoff>) -> Result<(), SchedulerError> {
        if let Some(k) = kickoff {
            self.kickoff(&k).await?;
        }
        let handles = self.spawn_controllers();
        self.wait_for_idle().await;
        self.shutdown(handles).await?;
        Ok(())
    }
}

impl MentionSink for WorkflowScheduler {
    fn notify_mention(&self, target: &str) {
        self.wake(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{Backend, BackendError, BackendReply, RetryPolicy};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use tokio::sync::Mutex as TokioMutex;

    /// Stands in for a backend that, mid-run, calls the `channel_send` MCP
    /// tool (owned by the `chorus-mcp` crate in the full system; here we
    /// simulate its effect directly against the store plus a mention sink,
    /// since `chorus-core` has no MCP dependency).
    struct ToolCallingBackend {
        agent: &'static str,
        store: Arc<ChannelStore>,
        mention_sink: Arc<dyn MentionSink>,
        /// Fires exactly once so the two mock agents exchange one message
        /// each and then fall silent, letting the workflow reach idle.
        outbound: Option<(&'static str, &'static str)>,
        fired: std::sync::atomic::AtomicBool,
        calls: TokioMutex<u32>,
    }

    #[async_trait]
    impl Backend for ToolCallingBackend {
        async fn send(&self, _message: &str, _system: Option<&str>) -> Result<BackendReply, BackendError> {
            *self.calls.lock().await += 1;
            if !self.fired.swap(true, std::sync::atomic::Ordering::SeqCst) {
                if let Some((to, text)) = self.outbound {
                    let content = format!("@{to} {text}");
                    let msg = self
                        .store
                        .smart_send(self.agent, content, None)
                        .await
                        .map_err(|e| BackendError::Failed(e.to_string()))?;
                    for target in &msg.mentions {
                        self.mention_sink.notify_mention(target);
                    }
                }
            }
            Ok(BackendReply {
                content: "ok".to_string(),
                usage: None,
                tool_calls: None,
            })
        }
    }

    /// A `MentionSink` that forwards into a controller map built after the
    /// backends (breaks the controller/backend construction cycle).
    struct DeferredMentionSink {
        controllers: std::sync::Mutex<HashMap<String, Arc<AgentController>>>,
    }

    impl MentionSink for DeferredMentionSink {
        fn notify_mention(&self, target: &str) {
            if let Ok(guard) = self.controllers.lock() {
                if let Some(ctl) = guard.get(target) {
                    ctl.wake();
                }
            }
        }
    }

    fn build_scheduler() -> (Arc<WorkflowScheduler>, Arc<ChannelStore>) {
        let store = Arc::new(ChannelStore::new(
            Arc::new(MemoryStorage::new()),
            vec!["alice".to_string(), "bob".to_string()],
            2_000,
            false,
        ));
        let event_log = Arc::new(EventLog::new(store.clone()));
        let proposals = Arc::new(ProposalManager::new());

        let mention_sink: Arc<DeferredMentionSink> = Arc::new(DeferredMentionSink {
            controllers: std::sync::Mutex::new(HashMap::new()),
        });

        // alice replies once to bob; bob replies once back to alice, then
        // both fall silent and the conversation terminates.
        let alice_backend = Arc::new(ToolCallingBackend {
            agent: "alice",
            store: store.clone(),
            mention_sink: mention_sink.clone() as Arc<dyn MentionSink>,
            outbound: Some(("bob", "what is X?")),
            fired: std::sync::atomic::AtomicBool::new(false),
            calls: TokioMutex::new(0),
        });
        let bob_backend = Arc::new(ToolCallingBackend {
            agent: "bob",
            store: store.clone(),
            mention_sink: mention_sink.clone() as Arc<dyn MentionSink>,
            outbound: Some(("alice", "X is Y")),
            fired: std::sync::atomic::AtomicBool::new(false),
            calls: TokioMutex::new(0),
        });

        let mut controllers = HashMap::new();
        controllers.insert(
            "alice".to_string(),
            Arc::new(AgentController::new(
                "alice",
                "kickoff-test",
                "you are alice",
                std::path::PathBuf::from("/tmp/alice"),
                alice_backend as Arc<dyn Backend>,
                store.clone(),
                event_log.clone(),
                Duration::from_millis(10),
                RetryPolicy::default(),
            )),
        );
        controllers.insert(
            "bob".to_string(),
            Arc::new(AgentController::new(
                "bob",
                "kickoff-test",
                "you are bob",
                std::path::PathBuf::from("/tmp/bob"),
                bob_backend as Arc<dyn Backend>,
                store.clone(),
                event_log.clone(),
                Duration::from_millis(10),
                RetryPolicy::default(),
            )),
        );

        {
            let mut guard = mention_sink.controllers.lock().unwrap();
            for (name, ctl) in &controllers {
                guard.insert(name.clone(), ctl.clone());
            }
        }

        let scheduler = Arc::new(WorkflowScheduler::new(
            store.clone(),
            event_log,
            proposals,
            controllers,
            Duration::from_millis(10),
            Duration::from_millis(40),
        ));
        (scheduler, store)
    }

    #[tokio::test]
    async fn kickoff_single_reply_reaches_idle() {
        let (scheduler, store) = build_scheduler();
        let kickoff = Kickoff {
            content: "@alice ask @bob about X".to_string(),
            from: "system".to_string(),
        };

        // Each mock agent's single canned reply also mentions its peer, so
        // the conversation is self-terminating: alice -> bob -> alice(idle).
        // We only assert the scheduler reaches idle within the debounce
        // window and the channel holds the expected message shape.
        let run = tokio::time::timeout(
            Duration::from_secs(5),
            Arc::clone(&scheduler).run(Some(kickoff)),
        );
        run.await.unwrap().unwrap();

        let entries = store
            .read_channel(&crate::channel::ReadFilter::default())
            .await
            .unwrap();
        assert!(entries.iter().any(|m| m.from == "system"));
        assert!(entries.iter().any(|m| m.from == "alice"));
        assert!(entries.iter().any(|m| m.from == "bob"));
    }

    #[tokio::test]
    async fn wake_discarded_for_unknown_agent_is_noop() {
        let (scheduler, _store) = build_scheduler();
        // Waking a name with no controller must not panic.
        scheduler.wake("nobody");
    }
}
