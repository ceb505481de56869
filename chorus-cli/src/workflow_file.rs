//! The thinnest possible reader for a `ParsedWorkflow` (spec.md §1 Non-goal:
//! "workflow file parsing and variable interpolation" is out of scope). This
//! module reads a JSON document whose shape already matches
//! [`chorus_core::ParsedWorkflow`] field-for-field — no templating, no
//! `{variable}` interpolation, no YAML front matter. A real workflow-authoring
//! format (and the interpolation engine that resolves it down to this shape)
//! is the external collaborator's job; this binary only needs something
//! already resolved to drive the scheduler.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use chorus_core::{AgentDeclaration, BackendKind, Kickoff, ParsedWorkflow, SetupTask};

#[derive(Debug, Error)]
pub enum WorkflowFileError {
    #[error("read workflow file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse workflow file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("workflow declares no agents")]
    NoAgents,
}

#[derive(Debug, Deserialize)]
struct AgentFile {
    name: String,
    system_prompt: String,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    max_steps: Option<u32>,
    #[serde(default)]
    workspace_dir: Option<PathBuf>,
    #[serde(default)]
    project_dir: Option<PathBuf>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    backend: BackendFile,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BackendFile {
    Subprocess { program: String, #[serde(default)] args: Vec<String> },
    InProcess,
}

#[derive(Debug, Deserialize)]
struct SetupTaskFile {
    name: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct KickoffFile {
    content: String,
    #[serde(default = "default_kickoff_from")]
    from: String,
}

fn default_kickoff_from() -> String {
    "system".to_string()
}

#[derive(Debug, Deserialize)]
struct WorkflowFile {
    agents: Vec<AgentFile>,
    #[serde(default)]
    setup: Vec<SetupTaskFile>,
    #[serde(default)]
    kickoff: Option<KickoffFile>,
}

/// Reads and validates a workflow JSON file into a [`ParsedWorkflow`] ready
/// for [`chorus_core::WorkflowScheduler`].
pub fn load(path: &Path) -> Result<ParsedWorkflow, WorkflowFileError> {
    let text = std::fs::read_to_string(path).map_err(|e| WorkflowFileError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    let file: WorkflowFile = serde_json::from_str(&text).map_err(|e| WorkflowFileError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    if file.agents.is_empty() {
        return Err(WorkflowFileError::NoAgents);
    }

    let agents = file
        .agents
        .into_iter()
        .map(|a| AgentDeclaration {
            name: a.name,
            resolved_system_prompt: a.system_prompt,
            tools: a.tools,
            max_steps: a.max_steps,
            workspace_dir: a.workspace_dir.unwrap_or_else(|| PathBuf::from(".")),
            project_dir: a.project_dir.unwrap_or_else(|| PathBuf::from(".")),
            backend_kind: match a.backend {
                BackendFile::Subprocess { program, args } => BackendKind::Subprocess { program, args },
                BackendFile::InProcess => BackendKind::InProcess,
            },
            timeout: a.timeout_ms.map(Duration::from_millis),
        })
        .collect();

    let setup = file
        .setup
        .into_iter()
        .map(|t| SetupTask {
            name: t.name,
            command: t.command,
            args: t.args,
        })
        .collect();

    let kickoff = file.kickoff.map(|k| Kickoff {
        content: k.content,
        from: k.from,
    });

    Ok(ParsedWorkflow {
        agents,
        setup,
        kickoff,
    })
}
