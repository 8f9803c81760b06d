//! FleetFlow Remote Execution
//!
//! Runs provisioning commands on remote hosts over SSH.
//!
//! # Guarantees
//!
//! - **Quoting**: `@name` parameters are substituted as single shell tokens
//! - **Sanitization**: a template referencing an unknown parameter fails
//!   before any network I/O
//! - **Redaction**: command text, parameters and output are scanned for
//!   secrets before they are logged
//! - **Retries**: transient connection failures are retried transparently;
//!   failing commands are retried only under [`RetryPolicy::AllowRetries`]
//!
//! # Example
//!
//! ```ignore
//! use fleetflow_remote::{
//!     CommandParameters, ExecutorOptions, RemoteCommandExecutor, RetryPolicy, Sensitivity,
//!     SshTarget,
//! };
//!
//! let mut executor = RemoteCommandExecutor::ssh(
//!     SshTarget::new("203.0.113.10").with_user("deploy"),
//!     ExecutorOptions::default(),
//! );
//! executor.connect().await?;
//!
//! let mut params = CommandParameters::new();
//! params.insert("image".into(), "nginx:1.27".into());
//! executor
//!     .execute_command(
//!         RetryPolicy::AllowRetries,
//!         Sensitivity::ContainsNoSensitiveData,
//!         "docker pull @image",
//!         Some(&params),
//!     )
//!     .await?;
//! executor.dispose().await?;
//! ```

pub mod error;
pub mod executor;
pub mod sanitize;
pub mod secrets;
pub mod ssh;
pub mod transport;

// Re-exports
pub use error::{RemoteError, Result};
pub use executor::{ExecutorOptions, RemoteCommandExecutor, RetryPolicy, Sensitivity};
pub use sanitize::{CommandParameters, render_command, shell_escape};
pub use secrets::SecretScanner;
pub use ssh::{SshTarget, SshTransport, SshTransportFactory};
pub use transport::{CommandOutput, RemoteTransport, TransportFactory};
