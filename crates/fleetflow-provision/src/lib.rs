//! FleetFlow Provisioning Engine
//!
//! Runs long, multi-step server workflows as resumable state machines.
//!
//! - A [`State`] is one step, polled with `update()` until it succeeds.
//! - A [`StateFlow`] decides which state follows which.
//! - A [`Job`] is one run of a flow under an idempotency key.
//! - The [`ProvisioningService`] drains one queue per key: keys run in
//!   parallel, jobs of a key run one after another, and a failing or
//!   panicking job only fails itself.
//!
//! A key holds at most two jobs. Scheduling a third replaces the pending
//! one, which ends as [`JobErrorKind::Superseded`].

pub mod error;
pub mod flow;
pub mod flows;
pub mod job;
pub mod mediator;
pub mod queue;
pub mod service;
pub mod state;

pub use error::{JobError, JobErrorKind, ProvisionError, Result};
pub use flow::{AggregateFlow, FlowContext, StateFactory, StateFlow};
pub use flows::{DeployComposeFlow, DeploySpec, ProvisionInstanceFlow, ProvisionSpec, ServerState};
pub use job::{
    Job, JobId, JobOutcome, JobSnapshot, JobStatusKind, NoopScope, NoopScopeFactory,
    ResourceScope, ScopeFactory,
};
pub use mediator::{InstanceInfo, InstanceRequest, InstanceStatus, Mediator, RegistryCredentials};
pub use queue::JobQueue;
pub use service::{ProvisioningService, ServiceOptions};
pub use state::{State, StateProgress};
