//! Provisioning service: the orchestrator
//!
//! Jobs are registered by id and queued by idempotency key. A background
//! loop spawns one drain worker per key with pending work, so distinct keys
//! progress in parallel while jobs of one key run strictly one at a time.

use crate::error::{JobError, ProvisionError, Result, panic_message};
use crate::flow::{FlowContext, StateFlow};
use crate::job::{Job, JobId, JobPoll, NoopScopeFactory, ScopeFactory};
use crate::queue::JobQueue;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use fleetflow_config::ProvisionConfig;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type SharedQueue = Arc<Mutex<JobQueue>>;

/// Timing settings of the service
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Main loop interval
    pub poll_interval: Duration,
    /// Wait between `update` polls of an in-progress state
    pub state_poll_interval: Duration,
    /// How long ended jobs stay reachable by id
    pub job_retention: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            state_poll_interval: Duration::from_secs(1),
            job_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl From<&ProvisionConfig> for ServiceOptions {
    fn from(config: &ProvisionConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            state_poll_interval: config.state_poll_interval(),
            job_retention: config.job_retention(),
        }
    }
}

pub struct ProvisioningService {
    options: ServiceOptions,
    context: FlowContext,
    scopes: Arc<dyn ScopeFactory>,
    jobs: DashMap<JobId, Arc<Job>>,
    queues: DashMap<String, SharedQueue>,
    active: DashSet<String>,
}

/// Marks a key as being drained; unmarks it when the worker ends, even on abort
struct ActiveKey {
    service: Arc<ProvisioningService>,
    key: String,
}

impl Drop for ActiveKey {
    fn drop(&mut self) {
        self.service.active.remove(&self.key);
    }
}

impl ProvisioningService {
    pub fn new(options: ServiceOptions, context: FlowContext) -> Self {
        Self {
            options,
            context,
            scopes: Arc::new(NoopScopeFactory),
            jobs: DashMap::new(),
            queues: DashMap::new(),
            active: DashSet::new(),
        }
    }

    pub fn from_config(config: &ProvisionConfig, context: FlowContext) -> Self {
        Self::new(ServiceOptions::from(config), context)
    }

    /// Use `scopes` to create the per-job resource scope
    pub fn with_scope_factory(mut self, scopes: Arc<dyn ScopeFactory>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    /// Create a job for `flow` and queue it under `key`.
    ///
    /// Returns as soon as the job is queued. If `key` already has a pending
    /// job behind the running one, that pending job is superseded.
    pub async fn schedule_job<F>(&self, key: impl Into<String>, flow: F) -> Result<Arc<Job>>
    where
        F: StateFlow + 'static,
    {
        let key = key.into();
        let scope = self.scopes.create_scope();
        let job = Job::create(key.clone(), flow, self.context.clone(), scope).await?;

        self.jobs.insert(job.id(), job.clone());
        let evicted = {
            // Enqueue under the map entry so the main loop cannot drop the queue in between
            let entry = self.queues.entry(key.clone()).or_default();
            let mut queue = lock(entry.value());
            queue.enqueue(job.clone())
        };

        info!(
            job_id = %job.id(),
            key = %key,
            flow = %job.flow_name(),
            "Scheduled job"
        );

        if let Some(evicted) = evicted {
            warn!(
                job_id = %evicted.id(),
                key = %key,
                superseded_by = %job.id(),
                "Superseded pending job"
            );
            evicted.fail(JobError::superseded(key)).await;
        }

        Ok(job)
    }

    /// Look up a job by id. The nil id always resolves to the completed sentinel.
    pub fn get_job_by_id(&self, id: JobId) -> Option<Arc<Job>> {
        if id.is_completed_sentinel() {
            return Some(Job::completed());
        }
        self.jobs.get(&id).map(|job| job.value().clone())
    }

    pub fn completed_job(&self) -> Arc<Job> {
        Job::completed()
    }

    /// Number of jobs queued under `key`, running one included
    pub fn queue_depth(&self, key: &str) -> usize {
        self.queues
            .get(key)
            .map(|queue| lock(queue.value()).len())
            .unwrap_or(0)
    }

    /// Keys currently being drained by a worker
    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.active.iter().map(|key| key.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Number of jobs reachable by id
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Forget jobs that ended longer ago than the retention period
    pub fn purge_expired_jobs(&self) -> usize {
        let now = Utc::now();
        let retention = self.options.job_retention;
        let before = self.jobs.len();

        self.jobs.retain(|_, job| match job.ended_at() {
            Some(ended_at) => (now - ended_at)
                .to_std()
                .map(|age| age < retention)
                .unwrap_or(true),
            None => true,
        });

        let purged = before.saturating_sub(self.jobs.len());
        if purged > 0 {
            debug!(purged, "Purged expired jobs");
        }
        purged
    }

    /// Run the main loop until `cancel` fires.
    ///
    /// Workers in flight finish their current `update` and stop; this returns
    /// once all of them have.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            poll_interval_ms = self.options.poll_interval.as_millis() as u64,
            "Provisioning service started"
        );
        let mut workers = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }

            while let Some(result) = workers.try_join_next() {
                if let Err(e) = result {
                    error!("Drain worker aborted: {}", e);
                }
            }

            self.purge_expired_jobs();

            for (key, queue) in self.pending_queues() {
                if !self.active.insert(key.clone()) {
                    continue;
                }
                let guard = ActiveKey {
                    service: self.clone(),
                    key: key.clone(),
                };
                debug!(key = %key, "Spawning drain worker");
                workers.spawn(self.clone().drain(key, queue, cancel.clone(), guard));
            }

            self.queues
                .retain(|key, queue| self.active.contains(key) || !lock(queue).is_empty());
        }

        info!(workers = workers.len(), "Provisioning service stopping");
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Drain worker aborted: {}", e);
            }
        }
        info!("Provisioning service stopped");
    }

    /// Keys with queued jobs and no worker
    fn pending_queues(&self) -> Vec<(String, SharedQueue)> {
        self.queues
            .iter()
            .filter(|entry| !self.active.contains(entry.key()) && !lock(entry.value()).is_empty())
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    async fn drain(
        self: Arc<Self>,
        key: String,
        queue: SharedQueue,
        cancel: CancellationToken,
        _guard: ActiveKey,
    ) {
        loop {
            if cancel.is_cancelled() {
                debug!(key = %key, "Drain worker cancelled");
                break;
            }

            let head = { lock(&queue).peek().cloned() };
            let Some(job) = head else {
                break;
            };

            if job.is_ended() {
                remove_head(&queue, &job);
                continue;
            }

            match AssertUnwindSafe(job.poll()).catch_unwind().await {
                Ok(Ok(JobPoll::InProgress)) => {
                    debug!(
                        job_id = %job.id(),
                        key = %key,
                        state = %job.description(),
                        "State in progress"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.options.state_poll_interval) => {}
                    }
                }
                Ok(Ok(JobPoll::Advanced)) => {
                    info!(
                        job_id = %job.id(),
                        key = %key,
                        state = %job.description(),
                        "Advanced to next state"
                    );
                }
                Ok(Ok(JobPoll::Completed)) => {
                    job.succeed().await;
                    remove_head(&queue, &job);
                    info!(job_id = %job.id(), key = %key, "Job succeeded");
                }
                Ok(Err(e)) => self.fail_job(&queue, &job, e).await,
                Err(panic) => {
                    let e = ProvisionError::Panicked(panic_message(panic.as_ref()));
                    self.fail_job(&queue, &job, e).await;
                }
            }
        }
    }

    async fn fail_job(&self, queue: &SharedQueue, job: &Arc<Job>, e: ProvisionError) {
        let state = job.description();
        let error = JobError::classify(e);
        error!(
            job_id = %job.id(),
            key = %job.key(),
            state = %state,
            "Job failed: {}",
            error
        );
        job.fail(error).await;
        remove_head(queue, job);
    }
}

/// Dequeue `job` if it is still the head
fn remove_head(queue: &SharedQueue, job: &Arc<Job>) {
    let mut queue = lock(queue);
    if queue.peek().is_some_and(|head| Arc::ptr_eq(head, job)) {
        queue.dequeue();
    }
}

fn lock(queue: &SharedQueue) -> MutexGuard<'_, JobQueue> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}
