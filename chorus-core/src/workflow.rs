//! The narrow interfaces the core consumes from its external collaborators
//! (spec.md §1, §9): workflow file parsing, variable interpolation, and
//! specific-agent CLI subprocess wiring are out of scope, but the scheduler
//! still needs a concrete shape to drive. `ParsedWorkflow` is that shape: an
//! already-resolved declaration (names, prompts, setup commands, kickoff
//! text) with no knowledge of whatever file format or templating produced it.

use std::collections::HashMap;
use std::time::Duration;

/// One agent's declaration within a workflow (spec.md §4.6 "Inputs to a run").
#[derive(Debug, Clone)]
pub struct AgentDeclaration {
    pub name: String,
    pub resolved_system_prompt: String,
    pub tools: Vec<String>,
    pub max_steps: Option<u32>,
    pub workspace_dir: std::path::PathBuf,
    pub project_dir: std::path::PathBuf,
    pub backend_kind: BackendKind,
    pub timeout: Option<Duration>,
}

/// Which `Backend` variant the scheduler wires up for an agent (spec.md §9
/// "Subprocess-vs-in-process backends"). The controller never branches on
/// this; only the scheduler does, when configuring the MCP URL.
#[derive(Debug, Clone)]
pub enum BackendKind {
    /// `program` is spawned with the MCP URL injected into its environment;
    /// `args` are passed through, with `{prompt}` substituted by the caller
    /// before spawn (variable interpolation is the external parser's job —
    /// by the time this reaches the scheduler, `args` are final).
    Subprocess { program: String, args: Vec<String> },
    /// An in-process SDK client; opaque to the core beyond the `Backend`
    /// trait contract.
    InProcess,
}

/// A setup task: a shell command to run sequentially before kickoff
/// (spec.md §4.7 step 2; SPEC_FULL.md §4.7 supplement — the scheduler runs an
/// already-resolved command, it does not parse or interpolate it).
#[derive(Debug, Clone)]
pub struct SetupTask {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
}

/// Result of running one setup task.
#[derive(Debug, Clone)]
pub struct SetupTaskResult {
    pub name: String,
    pub stdout: String,
    pub exit_code: i32,
}

/// The kickoff message template, already interpolated by the external parser
/// (spec.md §4.7 step 3). `None` means the workflow has no kickoff and the
/// scheduler waits for an external wake (e.g. a user message) instead.
#[derive(Debug, Clone)]
pub struct Kickoff {
    pub content: String,
    pub from: String,
}

/// A fully-resolved workflow: everything the scheduler needs to boot
/// controllers and run setup/kickoff, with no remaining parsing to do.
#[derive(Debug, Clone)]
pub struct ParsedWorkflow {
    pub agents: Vec<AgentDeclaration>,
    pub setup: Vec<SetupTask>,
    pub kickoff: Option<Kickoff>,
}

impl ParsedWorkflow {
    pub fn valid_agent_names(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.name.clone()).collect()
    }

    pub fn agent(&self, name: &str) -> Option<&AgentDeclaration> {
        self.agents.iter().find(|a| a.name == name)
    }
}

/// Runs `workflow.setup` sequentially via `tokio::process::Command`, collecting
/// trimmed stdout into a variable table (SPEC_FULL.md §4.7 supplement). A
/// non-zero exit aborts the remaining tasks and returns what ran so far plus
/// the failing result, mirroring spec.md §4.7 step 2 "A non-zero exit aborts
/// the workflow".
pub async fn run_setup_tasks(
    tasks: &[SetupTask],
) -> Result<HashMap<String, String>, SetupTaskError> {
    let mut vars = HashMap::new();
    for task in tasks {
        let output = tokio::process::Command::new(&task.command)
            .args(&task.args)
            .envs(vars.iter())
            .output()
            .await
            .map_err(|e| SetupTaskError::Spawn {
                task: task.name.clone(),
                source: e,
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            return Err(SetupTaskError::NonZeroExit {
                task: task.name.clone(),
                code: output.status.code().unwrap_or(-1),
            });
        }
        vars.insert(task.name.clone(), stdout);
    }
    Ok(vars)
}

#[derive(Debug, thiserror::Error)]
pub enum SetupTaskError {
    #[error("setup task {task}: failed to spawn: {source}")]
    Spawn {
        task: String,
        #[source]
        source: std::io::Error,
    },
    #[error("setup task {task} exited with code {code}")]
    NonZeroExit { task: String, code: i32 },
}
