//! Jobs: live instances of a flow
//!
//! A job owns the flow, its current state and a resource scope. Only the
//! orchestrator drives it; everyone else inspects it through the shared
//! [`Job`] handle.

use crate::error::{JobError, JobErrorKind, ProvisionError, Result, panic_message};
use crate::flow::{FlowContext, StateFlow};
use crate::state::{State, StateProgress};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Id of the pre-completed sentinel job
    pub const COMPLETED: JobId = JobId(Uuid::nil());

    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }

    pub fn is_completed_sentinel(&self) -> bool {
        *self == Self::COMPLETED
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(JobId)
    }
}

/// Terminal or running outcome of a job
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Running,
    Succeeded,
    Failed(JobError),
}

impl JobOutcome {
    pub fn is_ended(&self) -> bool {
        !matches!(self, JobOutcome::Running)
    }
}

/// Resources held for the lifetime of a job (database session, API client …).
///
/// Released exactly once when the job ends, whatever the outcome.
#[async_trait]
pub trait ResourceScope: Send + Sync {
    async fn release(&mut self);
}

/// Creates one scope per scheduled job
pub trait ScopeFactory: Send + Sync {
    fn create_scope(&self) -> Box<dyn ResourceScope>;
}

/// Scope that holds nothing
#[derive(Debug, Default)]
pub struct NoopScope;

#[async_trait]
impl ResourceScope for NoopScope {
    async fn release(&mut self) {}
}

#[derive(Debug, Default)]
pub struct NoopScopeFactory;

impl ScopeFactory for NoopScopeFactory {
    fn create_scope(&self) -> Box<dyn ResourceScope> {
        Box::new(NoopScope)
    }
}

/// What one poll of a job did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobPoll {
    /// The current state is still working
    InProgress,
    /// The current state succeeded and the next one is now current
    Advanced,
    /// The last state succeeded; the flow is done
    Completed,
}

/// Type-erased flow driver so jobs of different flows share one queue
#[async_trait]
trait JobExecution: Send + Sync {
    fn description(&self) -> String;

    async fn poll(&mut self) -> Result<JobPoll>;

    async fn dispose(&mut self);
}

struct FlowExecution<F: StateFlow> {
    flow: F,
    context: FlowContext,
    current: F::State,
    initialized: bool,
}

#[async_trait]
impl<F: StateFlow> JobExecution for FlowExecution<F> {
    fn description(&self) -> String {
        self.current.description()
    }

    async fn poll(&mut self) -> Result<JobPoll> {
        if !self.initialized {
            self.current.initialize().await?;
            self.initialized = true;
        }

        if self.current.update().await? == StateProgress::InProgress {
            return Ok(JobPoll::InProgress);
        }

        match self.flow.next_state(&self.context, &self.current).await? {
            None => Ok(JobPoll::Completed),
            Some(mut next) => {
                if let Err(e) = next.initialize().await {
                    next.dispose().await;
                    return Err(e);
                }
                let mut previous = std::mem::replace(&mut self.current, next);
                previous.dispose().await;
                Ok(JobPoll::Advanced)
            }
        }
    }

    async fn dispose(&mut self) {
        self.current.dispose().await;
    }
}

struct Execution {
    driver: Box<dyn JobExecution>,
    scope: Box<dyn ResourceScope>,
}

#[derive(Debug, Clone)]
struct JobStatus {
    outcome: JobOutcome,
    description: String,
    ended_at: Option<DateTime<Utc>>,
}

/// Serializable view of a job, for status polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub key: String,
    pub flow: String,
    pub status: JobStatusKind,
    pub description: String,
    pub error: Option<String>,
    pub error_kind: Option<JobErrorKind>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatusKind {
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for JobStatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatusKind::Running => write!(f, "running"),
            JobStatusKind::Succeeded => write!(f, "succeeded"),
            JobStatusKind::Failed => write!(f, "failed"),
        }
    }
}

static COMPLETED_JOB: LazyLock<Arc<Job>> = LazyLock::new(|| {
    let now = Utc::now();
    Arc::new(Job {
        id: JobId::COMPLETED,
        key: String::new(),
        flow_name: "completed".to_string(),
        created_at: now,
        status: RwLock::new(JobStatus {
            outcome: JobOutcome::Succeeded,
            description: "Completed".to_string(),
            ended_at: Some(now),
        }),
        execution: Mutex::new(None),
    })
});

/// A scheduled run of a flow
pub struct Job {
    id: JobId,
    key: String,
    flow_name: String,
    created_at: DateTime<Utc>,
    status: RwLock<JobStatus>,
    execution: Mutex<Option<Execution>>,
}

impl Job {
    /// Build a job and compute its initial state.
    ///
    /// The initial state is initialized later, right before its first
    /// update. If the flow cannot produce an initial state the scope is
    /// released and no job exists.
    pub(crate) async fn create<F>(
        key: impl Into<String>,
        flow: F,
        context: FlowContext,
        mut scope: Box<dyn ResourceScope>,
    ) -> Result<Arc<Job>>
    where
        F: StateFlow + 'static,
    {
        let initial = match flow.initial_state(&context).await {
            Ok(state) => state,
            Err(e) => {
                scope.release().await;
                return Err(e);
            }
        };

        let description = initial.description();
        let flow_name = flow.name().to_string();
        let driver = FlowExecution {
            flow,
            context,
            current: initial,
            initialized: false,
        };

        Ok(Arc::new(Job {
            id: JobId::new(),
            key: key.into(),
            flow_name,
            created_at: Utc::now(),
            status: RwLock::new(JobStatus {
                outcome: JobOutcome::Running,
                description,
                ended_at: None,
            }),
            execution: Mutex::new(Some(Execution {
                driver: Box::new(driver),
                scope,
            })),
        }))
    }

    /// The synthetic, always-succeeded job
    pub fn completed() -> Arc<Job> {
        COMPLETED_JOB.clone()
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Idempotency key the job was scheduled under
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.read_status().ended_at
    }

    pub fn outcome(&self) -> JobOutcome {
        self.read_status().outcome.clone()
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self.read_status().outcome, JobOutcome::Succeeded)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.read_status().outcome, JobOutcome::Failed(_))
    }

    pub fn is_ended(&self) -> bool {
        self.read_status().outcome.is_ended()
    }

    /// Terminal failure, if the job failed
    pub fn error(&self) -> Option<JobError> {
        match &self.read_status().outcome {
            JobOutcome::Failed(error) => Some(error.clone()),
            _ => None,
        }
    }

    /// Description of the current state
    pub fn description(&self) -> String {
        self.read_status().description.clone()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let status = self.read_status();
        let (kind, error, error_kind) = match &status.outcome {
            JobOutcome::Running => (JobStatusKind::Running, None, None),
            JobOutcome::Succeeded => (JobStatusKind::Succeeded, None, None),
            JobOutcome::Failed(e) => (JobStatusKind::Failed, Some(e.to_string()), Some(e.kind())),
        };
        JobSnapshot {
            id: self.id,
            key: self.key.clone(),
            flow: self.flow_name.clone(),
            status: kind,
            description: status.description.clone(),
            error,
            error_kind,
            created_at: self.created_at,
            ended_at: status.ended_at,
        }
    }

    /// Poll the current state once, advancing the flow when it succeeds
    pub(crate) async fn poll(&self) -> Result<JobPoll> {
        let mut execution = self.execution.lock().await;
        // Disposed from outside while still running
        let Some(execution) = execution.as_mut() else {
            return Err(ProvisionError::Disposed);
        };

        let result = execution.driver.poll().await;
        let description = execution.driver.description();
        self.write_status().description = description;
        result
    }

    /// Dispose the job and record success
    pub(crate) async fn succeed(&self) {
        self.finish(JobOutcome::Succeeded).await;
    }

    /// Dispose the job and record the failure
    pub(crate) async fn fail(&self, error: JobError) {
        self.finish(JobOutcome::Failed(error)).await;
    }

    async fn finish(&self, outcome: JobOutcome) {
        self.dispose().await;

        let mut status = self.write_status();
        if !status.outcome.is_ended() {
            status.outcome = outcome;
            status.ended_at = Some(Utc::now());
        }
    }

    /// Release the current state's resources and the job's scope.
    ///
    /// Only the first call does anything. A running job disposed this way
    /// fails on its next poll. Panics in cleanup are logged, not propagated.
    pub async fn dispose(&self) {
        let taken = self.execution.lock().await.take();
        let Some(mut execution) = taken else {
            return;
        };

        if let Err(panic) = AssertUnwindSafe(execution.driver.dispose())
            .catch_unwind()
            .await
        {
            tracing::error!(
                job_id = %self.id,
                key = %self.key,
                "State panicked while disposing: {}",
                panic_message(panic.as_ref())
            );
        }
        if let Err(panic) = AssertUnwindSafe(execution.scope.release())
            .catch_unwind()
            .await
        {
            tracing::error!(
                job_id = %self.id,
                key = %self.key,
                "Resource scope panicked while releasing: {}",
                panic_message(panic.as_ref())
            );
        }
        tracing::debug!(job_id = %self.id, key = %self.key, "Disposed job");
    }

    fn read_status(&self) -> std::sync::RwLockReadGuard<'_, JobStatus> {
        self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_status(&self) -> std::sync::RwLockWriteGuard<'_, JobStatus> {
        self.status.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.read_status();
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("flow", &self.flow_name)
            .field("outcome", &status.outcome)
            .field("description", &status.description)
            .finish()
    }
}
