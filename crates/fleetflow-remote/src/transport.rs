//! Transport abstraction used by the executor

use crate::error::Result;
use crate::ssh::SshTarget;
use async_trait::async_trait;

/// Exit code and captured output of one remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn new(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// An authenticated channel to one remote host.
///
/// Implementations report transport-level failures as
/// [`RemoteError::Connection`](crate::RemoteError::Connection) so callers can
/// tell them apart from commands that ran and failed.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Human-readable target, e.g. `deploy@203.0.113.10:22`
    fn target(&self) -> String;

    /// Establish the connection (single attempt)
    async fn connect(&mut self) -> Result<()>;

    /// Run a fully rendered shell command
    async fn execute(&mut self, command: &str) -> Result<CommandOutput>;

    /// Release the connection. Must be idempotent.
    async fn disconnect(&mut self) -> Result<()>;
}

/// Opens a fresh transport for a target.
///
/// Every executor gets its own transport; connections are never shared.
pub trait TransportFactory: Send + Sync {
    fn open(&self, target: &SshTarget) -> Box<dyn RemoteTransport>;
}
