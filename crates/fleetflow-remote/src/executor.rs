//! Remote command executor
//!
//! Runs shell commands on one target with a retry policy and secret hygiene:
//! parameters are shell-quoted, and nothing reaches the log before it has
//! been through the [`SecretScanner`].

use crate::error::{RemoteError, Result};
use crate::sanitize::{CommandParameters, render_command};
use crate::secrets::{REDACTED, SecretScanner};
use crate::ssh::{SshTarget, SshTransport};
use crate::transport::{CommandOutput, RemoteTransport};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::time::Duration;
use tokio::time::sleep;

/// What to do when a command exits non-zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Re-run the same command until it succeeds
    AllowRetries,
    /// Fail on the first non-zero exit code
    ProhibitRetries,
}

/// Whether command text may appear in error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensitivity {
    /// The template is safe to expose (parameter values never are)
    ContainsNoSensitiveData,
    /// Only the exit code is exposed
    ContainsSensitiveData,
}

/// Executor timing and retry limits
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Delay between connection attempts
    pub connect_retry_delay: Duration,

    /// Delay between attempts of a failing command under `AllowRetries`
    pub command_retry_delay: Duration,

    /// Upper bound on attempts under `AllowRetries` (`None` = until success)
    pub max_command_attempts: Option<u32>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            connect_retry_delay: Duration::from_secs(5),
            command_retry_delay: Duration::from_secs(5),
            max_command_attempts: None,
        }
    }
}

/// Executes commands on a single remote target.
///
/// The executor owns its transport; it is released by [`dispose`](Self::dispose).
pub struct RemoteCommandExecutor {
    transport: Box<dyn RemoteTransport>,
    scanner: SecretScanner,
    options: ExecutorOptions,
    disposed: bool,
}

impl RemoteCommandExecutor {
    pub fn new(transport: Box<dyn RemoteTransport>, options: ExecutorOptions) -> Self {
        Self {
            transport,
            scanner: SecretScanner::new(),
            options,
            disposed: false,
        }
    }

    /// Executor over the system OpenSSH client
    pub fn ssh(target: SshTarget, options: ExecutorOptions) -> Self {
        Self::new(Box::new(SshTransport::new(target)), options)
    }

    /// Register a runtime secret so it is masked in all subsequent logs
    pub fn add_known_secret(&mut self, secret: impl Into<String>) {
        self.scanner.add_known_secret(secret);
    }

    pub fn target(&self) -> String {
        self.transport.target()
    }

    /// Connect, retrying transient connection failures indefinitely
    pub async fn connect(&mut self) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.try_connect().await {
                Ok(true) => {
                    if attempt > 1 {
                        tracing::info!(
                            "Connected to {} after {} attempts",
                            self.transport.target(),
                            attempt
                        );
                    }
                    return Ok(());
                }
                Ok(false) => sleep(self.options.connect_retry_delay).await,
                Err(e) => return Err(e),
            }
        }
    }

    /// Single connection attempt.
    ///
    /// Returns `Ok(false)` on a transient failure, so callers that must not
    /// block can poll it.
    pub async fn try_connect(&mut self) -> Result<bool> {
        if self.disposed {
            return Err(RemoteError::Disposed);
        }
        match self.transport.connect().await {
            Ok(()) => Ok(true),
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    "Connection to {} failed, will retry: {}",
                    self.transport.target(),
                    self.scanner.scan(&e.to_string())
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Render `template` with `parameters` and run it on the target.
    ///
    /// Returns the captured output of the successful run.
    pub async fn execute_command(
        &mut self,
        retry_policy: RetryPolicy,
        sensitivity: Sensitivity,
        template: &str,
        parameters: Option<&CommandParameters>,
    ) -> Result<String> {
        if self.disposed {
            return Err(RemoteError::Disposed);
        }

        let command = render_command(template, parameters)?;

        tracing::debug!(
            host = %self.transport.target(),
            command = %self.scanner.scan(template),
            parameters = ?loggable_parameters(&self.scanner, parameters, sensitivity),
            "Executing remote command"
        );

        let mut attempt: u32 = 0;
        loop {
            let output = match self.transport.execute(&command).await {
                Ok(output) => output,
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        "Lost connection to {} while executing, reconnecting",
                        self.transport.target()
                    );
                    self.connect().await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            attempt += 1;

            tracing::trace!(
                exit_code = output.exit_code,
                output = %self.scanner.scan(&output.output),
                "Remote command finished"
            );

            if output.success() {
                return Ok(output.output);
            }

            let exhausted = match retry_policy {
                RetryPolicy::ProhibitRetries => true,
                RetryPolicy::AllowRetries => self
                    .options
                    .max_command_attempts
                    .is_some_and(|max| attempt >= max),
            };

            if exhausted {
                return Err(self.execution_error(&output, sensitivity, template));
            }

            tracing::warn!(
                "Remote command exited with {} (attempt {}), retrying: {}",
                output.exit_code,
                attempt,
                self.scanner.scan(output.output.trim())
            );
            sleep(self.options.command_retry_delay).await;
        }
    }

    /// Write `contents` to `path` on the target.
    ///
    /// The payload travels base64-encoded inside a quoted token, so binary
    /// data and shell metacharacters are safe.
    pub async fn write_file(
        &mut self,
        path: &str,
        contents: &[u8],
        sensitivity: Sensitivity,
    ) -> Result<()> {
        let mut parameters = CommandParameters::new();
        parameters.insert("path".to_string(), path.to_string());
        parameters.insert("payload".to_string(), BASE64.encode(contents));

        if sensitivity == Sensitivity::ContainsSensitiveData {
            if let Some(payload) = parameters.get("payload") {
                self.scanner.add_known_secret(payload.clone());
            }
            if let Ok(text) = std::str::from_utf8(contents) {
                self.scanner.add_known_secret(text.trim());
            }
        }

        self.execute_command(
            RetryPolicy::AllowRetries,
            sensitivity,
            "mkdir -p \"$(dirname @path)\" && printf '%s' @payload | base64 -d > @path",
            Some(&parameters),
        )
        .await?;
        Ok(())
    }

    /// Release the connection. Safe to call more than once.
    pub async fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        self.transport.disconnect().await
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn execution_error(
        &self,
        output: &CommandOutput,
        sensitivity: Sensitivity,
        template: &str,
    ) -> RemoteError {
        let command = match sensitivity {
            Sensitivity::ContainsNoSensitiveData => Some(template.to_string()),
            Sensitivity::ContainsSensitiveData => None,
        };
        RemoteError::Execution {
            exit_code: output.exit_code,
            command,
        }
    }
}

/// Parameters as they may appear in the debug log.
///
/// Sensitive commands log parameter names only.
fn loggable_parameters(
    scanner: &SecretScanner,
    parameters: Option<&CommandParameters>,
    sensitivity: Sensitivity,
) -> Vec<(String, String)> {
    let Some(parameters) = parameters else {
        return Vec::new();
    };
    let mut pairs: Vec<_> = parameters
        .iter()
        .map(|(name, value)| {
            let value = match sensitivity {
                Sensitivity::ContainsNoSensitiveData => scanner.scan(value),
                Sensitivity::ContainsSensitiveData => REDACTED.to_string(),
            };
            (name.clone(), value)
        })
        .collect();
    pairs.sort();
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parameters() -> CommandParameters {
        let mut parameters = CommandParameters::new();
        parameters.insert("username".to_string(), "deploy".to_string());
        parameters.insert("password".to_string(), "pw".to_string());
        parameters
    }

    #[test]
    fn test_sensitive_parameters_fully_masked() {
        let scanner = SecretScanner::new().with_known_secret("pw");
        let logged = loggable_parameters(
            &scanner,
            Some(&parameters()),
            Sensitivity::ContainsSensitiveData,
        );
        assert_eq!(
            logged,
            vec![
                ("password".to_string(), REDACTED.to_string()),
                ("username".to_string(), REDACTED.to_string()),
            ]
        );
    }

    #[test]
    fn test_plain_parameters_scanned() {
        let scanner = SecretScanner::new();
        let logged = loggable_parameters(
            &scanner,
            Some(&parameters()),
            Sensitivity::ContainsNoSensitiveData,
        );
        assert_eq!(logged[1], ("username".to_string(), "deploy".to_string()));
        assert!(loggable_parameters(&scanner, None, Sensitivity::ContainsSensitiveData).is_empty());
    }
}
