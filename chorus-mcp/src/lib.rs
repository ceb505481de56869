//! MCP tool surface and session-multiplexed HTTP transport (spec.md §4,
//! §4.4, §4.5): the interface agents call back into while a workflow runs.

pub mod error;
pub mod session;
pub mod tools;
pub mod transport;

pub use error::McpError;
pub use session::{agent_from_session_id, new_session_id, SessionTable};
pub use tools::{ToolContext, TOOL_NAMES};
pub use transport::{router, McpState};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A running MCP server bound to loopback (spec.md §4.5, §9 "ephemeral
/// port: bind to port 0 and read back the OS-assigned port"). Held by the
/// scheduler/CLI for the lifetime of the workflow run; dropped (or
/// explicitly [`McpServer::shutdown`]) at teardown.
pub struct McpServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
    shutdown_tx: oneshot::Sender<()>,
}

impl McpServer {
    /// Binds `bind_addr` (port `0` yields an OS-assigned ephemeral port) and
    /// spawns the axum server on the current runtime.
    pub async fn bind(bind_addr: SocketAddr, tools: ToolContext) -> std::io::Result<Self> {
        let state = McpState {
            tools: Arc::new(tools),
            sessions: Arc::new(SessionTable::new()),
        };
        let listener = TcpListener::bind(bind_addr).await?;
        let addr = listener.local_addr()?;
        let app = router(state);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "mcp server exited with error");
            }
        });
        Ok(Self {
            addr,
            handle,
            shutdown_tx,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The URL agents are given to reach this server (spec.md §6.3 "the MCP
    /// URL injected into its environment").
    pub fn mcp_url(&self) -> String {
        format!("http://{}/mcp", self.addr)
    }

    /// Signals graceful shutdown and waits for in-flight requests (an
    /// in-progress `channel_send`/ack persist, in particular) to finish
    /// before the serve loop exits. The workflow scheduler calls this during
    /// teardown once every controller has stopped.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}
