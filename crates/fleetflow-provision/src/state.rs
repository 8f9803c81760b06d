//! State contract
//!
//! A state is one resumable step of a workflow. The orchestrator calls
//! [`State::initialize`] exactly once, then polls [`State::update`] until it
//! reports [`StateProgress::Succeeded`]. Errors are never retried by the
//! state itself; they end the owning job.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of one `update` poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateProgress {
    InProgress,
    Succeeded,
}

#[async_trait]
pub trait State: Send + Sync {
    /// Short human-readable description, used while the job is in progress
    fn description(&self) -> String;

    /// Idempotent setup.
    ///
    /// Must tolerate work left behind by an earlier, interrupted attempt.
    async fn initialize(&mut self) -> Result<()>;

    /// Advance the step. Must not block indefinitely; long external
    /// operations return `InProgress` and are polled again later.
    async fn update(&mut self) -> Result<StateProgress>;

    /// Release resources the state owns. Must be safe to call repeatedly.
    async fn dispose(&mut self) {}
}
