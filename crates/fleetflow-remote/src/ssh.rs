//! OpenSSH client transport
//!
//! Wraps the system `ssh` binary. Each transport owns a control-master socket,
//! so every command issued through one executor reuses a single
//! authenticated connection that no other executor can see.

use crate::error::{RemoteError, Result};
use crate::transport::{CommandOutput, RemoteTransport, TransportFactory};
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Exit status `ssh` uses for its own (connection) failures
const SSH_CONNECTION_FAILURE: i32 = 255;

/// SSH destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl SshTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: "root".to_string(),
            identity_file: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// `user@host` as passed to `ssh`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Transport backed by the OpenSSH client
pub struct SshTransport {
    target: SshTarget,
    control_path: PathBuf,
    connected: bool,
}

impl SshTransport {
    pub fn new(target: SshTarget) -> Self {
        let control_path = std::env::temp_dir().join(format!(
            "fleetflow-ssh-{}",
            uuid::Uuid::new_v4().simple()
        ));
        Self {
            target,
            control_path,
            connected: false,
        }
    }

    fn option_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.target.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-p".to_string(),
            self.target.port.to_string(),
        ];
        if let Some(identity) = &self.target.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.option_args());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    fn exit_args(&self) -> Vec<String> {
        let mut args = self.option_args();
        args.push("-O".to_string());
        args.push("exit".to_string());
        args.push(self.target.destination());
        args
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    fn target(&self) -> String {
        self.target.to_string()
    }

    async fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }

        let mut cmd = self.command();
        cmd.arg("-o")
            .arg("ControlMaster=auto")
            .arg("-o")
            .arg("ControlPersist=yes")
            .arg(self.target.destination())
            .arg("true");

        tracing::debug!("Opening SSH control connection to {}", self.target);

        // Spawn failures are local (Io), not transient connection failures
        let output = cmd.output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RemoteError::Connection(format!(
                "{}: {}",
                self.target,
                stderr.trim()
            )));
        }

        self.connected = true;
        Ok(())
    }

    async fn execute(&mut self, command: &str) -> Result<CommandOutput> {
        let mut cmd = self.command();
        cmd.arg(self.target.destination()).arg(command);

        let output = cmd.output().await?;
        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if exit_code == SSH_CONNECTION_FAILURE {
            self.connected = false;
            return Err(RemoteError::Connection(format!(
                "{}: {}",
                self.target,
                stderr.trim()
            )));
        }

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }

        Ok(CommandOutput::new(exit_code, text))
    }

    async fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;

        let status = Command::new("ssh")
            .args(self.exit_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        if let Err(e) = status {
            tracing::debug!("Failed to close SSH control connection to {}: {}", self.target, e);
        }
        if self.control_path.exists() {
            let _ = tokio::fs::remove_file(&self.control_path).await;
        }

        tracing::debug!("Closed SSH control connection to {}", self.target);
        Ok(())
    }
}

impl Drop for SshTransport {
    fn drop(&mut self) {
        if self.connected {
            // Synchronous best-effort cleanup; the async path is disconnect()
            let _ = std::process::Command::new("ssh")
                .args(self.exit_args())
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
    }
}

/// Opens [`SshTransport`]s
#[derive(Debug, Clone, Default)]
pub struct SshTransportFactory;

impl TransportFactory for SshTransportFactory {
    fn open(&self, target: &SshTarget) -> Box<dyn crate::transport::RemoteTransport> {
        Box::new(SshTransport::new(target.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorOptions, RemoteCommandExecutor};
    use serial_test::serial;

    #[test]
    fn test_target_display() {
        let target = SshTarget::new("203.0.113.10")
            .with_user("deploy")
            .with_port(2222);
        assert_eq!(target.to_string(), "deploy@203.0.113.10:2222");
        assert_eq!(target.destination(), "deploy@203.0.113.10");
    }

    #[test]
    fn test_option_args_include_identity() {
        let target = SshTarget::new("host").with_identity_file("/keys/id_ed25519");
        let transport = SshTransport::new(target);
        let args = transport.option_args();
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/keys/id_ed25519"));
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "22"));
    }

    #[test]
    fn test_control_paths_are_unique() {
        let a = SshTransport::new(SshTarget::new("host"));
        let b = SshTransport::new(SshTarget::new("host"));
        assert_ne!(a.control_path, b.control_path);
    }

    #[test]
    #[serial]
    fn test_missing_ssh_binary_is_not_retried() {
        temp_env::with_var("PATH", Some("/nonexistent"), || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let options = ExecutorOptions {
                    connect_retry_delay: Duration::from_millis(1),
                    ..ExecutorOptions::default()
                };
                let mut executor =
                    RemoteCommandExecutor::ssh(SshTarget::new("203.0.113.10"), options);

                let result = tokio::time::timeout(Duration::from_secs(5), executor.connect())
                    .await
                    .expect("connect kept retrying a local spawn failure");
                let err = result.unwrap_err();
                assert!(matches!(err, RemoteError::Io(_)));
                assert!(!err.is_transient());

                assert!(matches!(
                    executor.try_connect().await,
                    Err(RemoteError::Io(_))
                ));
            });
        });
    }
}
