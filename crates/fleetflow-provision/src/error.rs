//! Provisioning error types

use fleetflow_remote::RemoteError;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by states, flows and the mediator
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Domain-specific failure raised by a state
    #[error("{state}: {message}")]
    StateUpdate { state: String, message: String },

    #[error("Unknown flow state '{state}' in flow '{flow}'")]
    UnknownFlowState { flow: String, state: String },

    #[error("Initial state of flow '{0}' requested after it advanced past its first sub-flow")]
    FlowAlreadyAdvanced(String),

    #[error("Flow '{0}' has no sub-flows")]
    EmptyFlow(String),

    #[error("Superseded by a newer request for '{key}'")]
    Superseded { key: String },

    #[error("State panicked: {0}")]
    Panicked(String),

    #[error("Job was disposed before its flow completed")]
    Disposed,

    #[error("Remote execution error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Mediator error: {0}")]
    Mediator(#[from] anyhow::Error),
}

impl ProvisionError {
    pub fn state_update(state: impl Into<String>, message: impl Into<String>) -> Self {
        ProvisionError::StateUpdate {
            state: state.into(),
            message: message.into(),
        }
    }

    pub fn unknown_state(flow: impl Into<String>, state: impl Into<String>) -> Self {
        ProvisionError::UnknownFlowState {
            flow: flow.into(),
            state: state.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Text of a caught panic payload
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Classification of a job's terminal failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// A state raised a domain-specific update error; kept as-is
    StateUpdate,
    /// Any other error, wrapped as a generic update failure
    StateUpdateFailed,
    /// Evicted from its queue before it ever ran
    Superseded,
}

/// Terminal failure attached to a job
#[derive(Debug, Clone)]
pub struct JobError {
    kind: JobErrorKind,
    cause: Arc<ProvisionError>,
}

impl JobError {
    /// Classify an error that escaped a state or flow
    pub fn classify(error: ProvisionError) -> Self {
        let kind = match &error {
            ProvisionError::StateUpdate { .. } => JobErrorKind::StateUpdate,
            ProvisionError::Superseded { .. } => JobErrorKind::Superseded,
            _ => JobErrorKind::StateUpdateFailed,
        };
        Self {
            kind,
            cause: Arc::new(error),
        }
    }

    pub fn superseded(key: impl Into<String>) -> Self {
        Self::classify(ProvisionError::Superseded { key: key.into() })
    }

    pub fn kind(&self) -> JobErrorKind {
        self.kind
    }

    /// The original error
    pub fn cause(&self) -> &ProvisionError {
        &self.cause
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            JobErrorKind::StateUpdateFailed => write!(f, "State update failed: {}", self.cause),
            JobErrorKind::StateUpdate | JobErrorKind::Superseded => write!(f, "{}", self.cause),
        }
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_error_kept_as_is() {
        let err = JobError::classify(ProvisionError::state_update(
            "create-instance",
            "quota exceeded",
        ));
        assert_eq!(err.kind(), JobErrorKind::StateUpdate);
        assert_eq!(err.to_string(), "create-instance: quota exceeded");
    }

    #[test]
    fn test_other_errors_wrapped() {
        let err = JobError::classify(ProvisionError::Remote(RemoteError::Execution {
            exit_code: 1,
            command: Some("false".into()),
        }));
        assert_eq!(err.kind(), JobErrorKind::StateUpdateFailed);
        assert!(err.to_string().starts_with("State update failed: "));
        assert!(matches!(err.cause(), ProvisionError::Remote(_)));
    }

    #[test]
    fn test_superseded() {
        let err = JobError::superseded("web-01");
        assert_eq!(err.kind(), JobErrorKind::Superseded);
        assert!(err.to_string().contains("web-01"));
    }
}
