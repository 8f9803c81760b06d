//! State flows
//!
//! A flow decides which state comes next. Flows work over a closed enum of
//! states, so the transition table is an exhaustive `match`; a state the flow
//! does not own yields [`ProvisionError::UnknownFlowState`].

use crate::error::{ProvisionError, Result};
use crate::mediator::Mediator;
use crate::state::State;
use async_trait::async_trait;
use fleetflow_config::ProvisionConfig;
use fleetflow_remote::{
    ExecutorOptions, RemoteCommandExecutor, SshTarget, SshTransportFactory, TransportFactory,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Builds the resources states need (remote executors) from shared settings
#[derive(Clone)]
pub struct StateFactory {
    transports: Arc<dyn TransportFactory>,
    executor_options: ExecutorOptions,
    ssh_user: String,
    ssh_port: u16,
    identity_file: Option<PathBuf>,
    connect_timeout: Duration,
}

impl StateFactory {
    pub fn new(transports: Arc<dyn TransportFactory>, executor_options: ExecutorOptions) -> Self {
        Self {
            transports,
            executor_options,
            ssh_user: "root".to_string(),
            ssh_port: 22,
            identity_file: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Factory using the system OpenSSH client and the configured defaults
    pub fn from_config(config: &ProvisionConfig) -> Self {
        let options = ExecutorOptions {
            connect_retry_delay: config.remote.connect_retry_delay(),
            command_retry_delay: config.remote.command_retry_delay(),
            max_command_attempts: config.remote.max_command_attempts,
        };
        Self {
            transports: Arc::new(SshTransportFactory),
            executor_options: options,
            ssh_user: config.ssh.user.clone(),
            ssh_port: config.ssh.port,
            identity_file: config.ssh.identity_file.clone(),
            connect_timeout: config.ssh.connect_timeout(),
        }
    }

    /// SSH target for `host` with the configured user, port and key
    pub fn target(&self, host: &str) -> SshTarget {
        let target = SshTarget::new(host)
            .with_user(self.ssh_user.clone())
            .with_port(self.ssh_port)
            .with_connect_timeout(self.connect_timeout);
        match &self.identity_file {
            Some(identity) => target.with_identity_file(identity.clone()),
            None => target,
        }
    }

    /// A new executor with its own connection to `host`
    pub fn executor(&self, host: &str) -> RemoteCommandExecutor {
        let target = self.target(host);
        RemoteCommandExecutor::new(self.transports.open(&target), self.executor_options.clone())
    }
}

/// Everything a flow may use to build states
#[derive(Clone)]
pub struct FlowContext {
    pub mediator: Arc<dyn Mediator>,
    pub states: StateFactory,
}

impl FlowContext {
    pub fn new(mediator: Arc<dyn Mediator>, states: StateFactory) -> Self {
        Self { mediator, states }
    }
}

#[async_trait]
pub trait StateFlow: Send + Sync {
    type State: State + 'static;

    /// Flow name, for logs and errors
    fn name(&self) -> &str;

    /// Build the first state
    async fn initial_state(&self, ctx: &FlowContext) -> Result<Self::State>;

    /// The state after `current` succeeded, or `None` when the flow is done
    async fn next_state(
        &mut self,
        ctx: &FlowContext,
        current: &Self::State,
    ) -> Result<Option<Self::State>>;
}

/// Runs sub-flows one after another as a single flow
pub struct AggregateFlow<S> {
    name: String,
    flows: Vec<Box<dyn StateFlow<State = S>>>,
    current: usize,
}

impl<S: State + 'static> AggregateFlow<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flows: Vec::new(),
            current: 0,
        }
    }

    /// Append a sub-flow
    pub fn then(mut self, flow: impl StateFlow<State = S> + 'static) -> Self {
        self.flows.push(Box::new(flow));
        self
    }

    /// Index of the active sub-flow
    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

#[async_trait]
impl<S: State + 'static> StateFlow for AggregateFlow<S> {
    type State = S;

    fn name(&self) -> &str {
        &self.name
    }

    async fn initial_state(&self, ctx: &FlowContext) -> Result<S> {
        if self.current != 0 {
            return Err(ProvisionError::FlowAlreadyAdvanced(self.name.clone()));
        }
        let first = self
            .flows
            .first()
            .ok_or_else(|| ProvisionError::EmptyFlow(self.name.clone()))?;
        first.initial_state(ctx).await
    }

    async fn next_state(&mut self, ctx: &FlowContext, current: &S) -> Result<Option<S>> {
        let index = self.current;
        let flow = self
            .flows
            .get_mut(index)
            .ok_or_else(|| ProvisionError::EmptyFlow(self.name.clone()))?;

        if let Some(next) = flow.next_state(ctx, current).await? {
            return Ok(Some(next));
        }

        if index + 1 < self.flows.len() {
            self.current = index + 1;
            let next_flow = &self.flows[self.current];
            tracing::debug!(
                "Flow '{}' finished sub-flow {}, continuing with '{}'",
                self.name,
                index,
                next_flow.name()
            );
            return next_flow.initial_state(ctx).await.map(Some);
        }

        Ok(None)
    }
}
