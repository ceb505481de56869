//! The one `Backend` variant this binary actually wires up: a CLI subprocess
//! spawned per invocation with the MCP URL and agent identity injected into
//! its environment, the prompt written to its stdin, and its stdout read back
//! as the reply (spec.md §4.6 step 4, §6.3). Wiring a *specific* agent CLI
//! (Claude Code, Codex, etc.) is a Non-goal (spec.md §1); this is the generic
//! shape every such wrapper would sit behind.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use chorus_core::controller::{Backend, BackendError, BackendReply};

/// Spawns `program` with `args` for every `send` call (spec.md §9
/// "Subprocess-vs-in-process backends share the `Backend` contract"). The
/// controller never sees this type directly; it only sees `Arc<dyn Backend>`.
pub struct SubprocessBackend {
    program: String,
    args: Vec<String>,
    mcp_url: String,
    agent_name: String,
    timeout: Option<Duration>,
}

impl SubprocessBackend {
    pub fn new(program: String, args: Vec<String>, mcp_url: String, agent_name: String, timeout: Option<Duration>) -> Self {
        Self {
            program,
            args,
            mcp_url,
            agent_name,
            timeout,
        }
    }

    async fn send_inner(&self, message: &str, system: Option<&str>) -> Result<BackendReply, BackendError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("CHORUS_MCP_URL", &self.mcp_url)
            .env("CHORUS_AGENT_NAME", &self.agent_name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(system) = system {
            cmd.env("CHORUS_SYSTEM_PROMPT", system);
        }

        let mut child = cmd.spawn().map_err(|e| BackendError::Failed(format!(
            "failed to spawn {}: {e}",
            self.program
        )))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(message.as_bytes())
                .await
                .map_err(|e| BackendError::Failed(format!("failed to write prompt to stdin: {e}")))?;
            // Dropping closes stdin so a well-behaved subprocess sees EOF.
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BackendError::Failed(format!("subprocess wait failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::Failed(format!(
                "{} exited with {}: {}",
                self.program, output.status, stderr
            )));
        }

        Ok(BackendReply {
            content: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            usage: None,
            tool_calls: None,
        })
    }
}

#[async_trait]
impl Backend for SubprocessBackend {
    async fn send(&self, message: &str, system: Option<&str>) -> Result<BackendReply, BackendError> {
        let fut = self.send_inner(message, system);
        match self.timeout {
            Some(d) => tokio::time::timeout(d, fut)
                .await
                .map_err(|_| BackendError::Timeout(d))?,
            None => fut.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_stdin_to_stdout_via_cat() {
        let backend = SubprocessBackend::new(
            "cat".to_string(),
            vec![],
            "http://127.0.0.1:0/mcp".to_string(),
            "alice".to_string(),
            None,
        );
        let reply = backend.send("hello there", None).await.unwrap();
        assert_eq!(reply.content, "hello there");
    }

    #[tokio::test]
    async fn nonzero_exit_is_backend_error() {
        let backend = SubprocessBackend::new(
            "false".to_string(),
            vec![],
            "http://127.0.0.1:0/mcp".to_string(),
            "alice".to_string(),
            None,
        );
        let err = backend.send("hi", None).await.unwrap_err();
        assert!(matches!(err, BackendError::Failed(_)));
    }

    #[tokio::test]
    async fn timeout_triggers_on_slow_subprocess() {
        let backend = SubprocessBackend::new(
            "sleep".to_string(),
            vec!["5".to_string()],
            "http://127.0.0.1:0/mcp".to_string(),
            "alice".to_string(),
            Some(Duration::from_millis(50)),
        );
        let err = backend.send("hi", None).await.unwrap_err();
        assert!(matches!(err, BackendError::Timeout(_)));
    }
}
