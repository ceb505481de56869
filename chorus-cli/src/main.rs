//! `chorus`: boots one workflow run end to end — loads the workflow file,
//! resolves configuration, stands up the channel store and MCP server, spawns
//! one controller per agent, runs setup/kickoff, and waits for the workflow to
//! reach idle before tearing everything down (spec.md §4.7).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use clap::Parser;
use tracing::info;

use chorus_core::channel::ReadFilter;
use chorus_core::{
    AgentController, BackendKind, ChannelStore, DiskStorage, EventLog, MemoryStorage,
    MentionSink, ProposalManager, RetryPolicy, Storage, WorkflowScheduler,
};
use chorus_config::{ContextMode, SchedulerConfig};
use chorus_mcp::{McpServer, ToolContext};

use chorus_cli::backend::SubprocessBackend;
use chorus_cli::workflow_file;

const APP_NAME: &str = "chorus";

#[derive(Debug, Parser)]
#[command(name = "chorus", about = "Run a multi-agent workflow")]
struct Args {
    /// Path to a resolved workflow JSON file.
    workflow: PathBuf,

    /// Override the context directory (implies disk-backed, persistent storage).
    #[arg(long)]
    context_dir: Option<PathBuf>,

    /// Print the final channel transcript to stdout once the run reaches idle.
    #[arg(long)]
    print_transcript: bool,
}

/// Forwards mentions into whichever controllers exist by the time the wake
/// fires. Needed because the MCP tool layer's `mention_sink` is constructed
/// before the controllers are (the controllers' backends need the MCP URL,
/// which needs the server, which needs the tool context, which needs a
/// mention sink) — see `WorkflowScheduler`'s own test harness for the same
/// pattern (chorus-core/src/scheduler.rs).
struct DeferredMentionSink {
    controllers: StdMutex<HashMap<String, Arc<AgentController>>>,
}

impl DeferredMentionSink {
    fn new() -> Self {
        Self {
            controllers: StdMutex::new(HashMap::new()),
        }
    }

    fn populate(&self, controllers: &HashMap<String, Arc<AgentController>>) {
        let mut guard = self.controllers.lock().unwrap();
        for (name, ctl) in controllers {
            guard.insert(name.clone(), ctl.clone());
        }
    }
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    chorus_config::load_and_apply(APP_NAME, None).ok();
    #[cfg(feature = "tracing-init")]
    let _tracing_guard = chorus_config::init_tracing(APP_NAME);

    let mut config = SchedulerConfig::resolve(APP_NAME)?;
    if let Some(dir) = args.context_dir.clone() {
        config.context_mode = ContextMode::Bind(dir);
    }

    let workflow = workflow_file::load(&args.workflow)?;
    let valid_agents = workflow.valid_agent_names();

    let (storage, persistent): (Arc<dyn Storage>, bool) = match &config.context_mode {
        ContextMode::Ephemeral => (Arc::new(MemoryStorage::new()), false),
        ContextMode::Bind(dir) => (Arc::new(DiskStorage::new(dir.clone())), true),
    };

    let store = Arc::new(ChannelStore::new(
        storage,
        valid_agents,
        config.message_length_threshold,
        persistent,
    ));
    let event_log = Arc::new(EventLog::new(store.clone()));
    let proposals = Arc::new(ProposalManager::new());

    let mention_sink = Arc::new(DeferredMentionSink::new());

    let tools = ToolContext {
        store: store.clone(),
        proposals: proposals.clone(),
        mention_sink: mention_sink.clone() as Arc<dyn MentionSink>,
        event_log: event_log.clone(),
    };
    let bind_addr: SocketAddr = format!("{}:{}", config.mcp_bind_addr, config.mcp_port).parse()?;
    let mcp_server = McpServer::bind(bind_addr, tools).await?;
    let mcp_url = mcp_server.mcp_url();
    info!(url = %mcp_url, "mcp server listening");

    let retry_policy = RetryPolicy {
        max_attempts: config.retry_max_attempts,
        backoff: config.retry_backoff,
        backoff_multiplier: config.retry_backoff_multiplier,
        backoff_cap: config.retry_backoff_cap,
    };

    let mut controllers = HashMap::new();
    for decl in &workflow.agents {
        let backend: Arc<dyn chorus_core::Backend> = match &decl.backend_kind {
            BackendKind::Subprocess { program, args } => Arc::new(SubprocessBackend::new(
                program.clone(),
                args.clone(),
                mcp_url.clone(),
                decl.name.clone(),
                decl.timeout,
            )),
            BackendKind::InProcess => {
                anyhow::bail!(
                    "agent {} declares an in-process backend, which this binary does not embed \
                     (wiring a specific in-process SDK is left to the caller)",
                    decl.name
                );
            }
        };
        let controller = Arc::new(AgentController::new(
            decl.name.clone(),
            args.workflow.display().to_string(),
            decl.resolved_system_prompt.clone(),
            decl.project_dir.clone(),
            backend,
            store.clone(),
            event_log.clone(),
            config.poll_interval,
            retry_policy.clone(),
        ));
        controllers.insert(decl.name.clone(), controller);
    }
    mention_sink.populate(&controllers);

    let scheduler = Arc::new(WorkflowScheduler::new(
        store.clone(),
        event_log,
        proposals,
        controllers,
        config.poll_interval,
        config.debounce_interval,
    ));

    if !workflow.setup.is_empty() {
        info!(count = workflow.setup.len(), "running setup tasks");
        scheduler.run_setup(&workflow.setup).await?;
    }

    scheduler.clone().run(workflow.kickoff.clone()).await?;

    if args.print_transcript {
        let entries = store.read_channel(&ReadFilter::default()).await?;
        for msg in entries {
            println!("@{}: {}", msg.from, msg.content);
        }
    }

    mcp_server.shutdown().await;
    Ok(())
}
