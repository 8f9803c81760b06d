//! Remote execution error types

use thiserror::Error;

/// Remote execution errors
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The command template references a parameter that was not supplied.
    #[error("Command sanitization failed: no value supplied for parameter '@{placeholder}'")]
    Sanitization { placeholder: String },

    /// The remote command returned a non-zero exit code.
    ///
    /// `command` holds the unsubstituted template, and is `None` when the
    /// command was classified as sensitive.
    #[error("{}", execution_message(.exit_code, .command))]
    Execution {
        exit_code: i32,
        command: Option<String>,
    },

    /// Transport-level connection failure (transient).
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Executor is disposed")]
    Disposed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Whether this error is a transient transport failure
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Connection(_))
    }
}

fn execution_message(exit_code: &i32, command: &Option<String>) -> String {
    match command {
        Some(command) => format!("Command `{}` failed with exit code {}", command, exit_code),
        None => format!("Remote command failed with exit code {}", exit_code),
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;
