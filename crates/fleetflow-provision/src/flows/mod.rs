//! Built-in server flows
//!
//! Both flows work over [`ServerState`], so they can be chained with
//! [`AggregateFlow`](crate::flow::AggregateFlow) into "provision, then deploy".

mod deploy_compose;
mod provision_instance;

pub use deploy_compose::{
    DeployComposeFlow, DeployFile, DeploySpec, RegistryLogin, RunCompose, TransferFiles,
};
pub use provision_instance::{
    CompleteSetup, CreateInstance, InstallBaseline, ProvisionInstanceFlow, ProvisionSpec,
    WaitForSsh,
};

use crate::error::Result;
use crate::flow::AggregateFlow;
use crate::state::{State, StateProgress};
use async_trait::async_trait;
use fleetflow_remote::RemoteCommandExecutor;

/// Every state a server flow can be in
pub enum ServerState {
    CreateInstance(CreateInstance),
    WaitForSsh(WaitForSsh),
    InstallBaseline(InstallBaseline),
    CompleteSetup(CompleteSetup),
    RegistryLogin(RegistryLogin),
    TransferFiles(TransferFiles),
    RunCompose(RunCompose),
}

impl ServerState {
    /// Stable state name, used in errors and logs
    pub fn name(&self) -> &'static str {
        match self {
            ServerState::CreateInstance(_) => "create-instance",
            ServerState::WaitForSsh(_) => "wait-for-ssh",
            ServerState::InstallBaseline(_) => "install-baseline",
            ServerState::CompleteSetup(_) => "complete-setup",
            ServerState::RegistryLogin(_) => "registry-login",
            ServerState::TransferFiles(_) => "transfer-files",
            ServerState::RunCompose(_) => "run-compose",
        }
    }

    fn as_state_mut(&mut self) -> &mut dyn State {
        match self {
            ServerState::CreateInstance(s) => s,
            ServerState::WaitForSsh(s) => s,
            ServerState::InstallBaseline(s) => s,
            ServerState::CompleteSetup(s) => s,
            ServerState::RegistryLogin(s) => s,
            ServerState::TransferFiles(s) => s,
            ServerState::RunCompose(s) => s,
        }
    }

    fn as_state(&self) -> &dyn State {
        match self {
            ServerState::CreateInstance(s) => s,
            ServerState::WaitForSsh(s) => s,
            ServerState::InstallBaseline(s) => s,
            ServerState::CompleteSetup(s) => s,
            ServerState::RegistryLogin(s) => s,
            ServerState::TransferFiles(s) => s,
            ServerState::RunCompose(s) => s,
        }
    }
}

#[async_trait]
impl State for ServerState {
    fn description(&self) -> String {
        self.as_state().description()
    }

    async fn initialize(&mut self) -> Result<()> {
        self.as_state_mut().initialize().await
    }

    async fn update(&mut self) -> Result<StateProgress> {
        self.as_state_mut().update().await
    }

    async fn dispose(&mut self) {
        self.as_state_mut().dispose().await
    }
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ServerState").field(&self.name()).finish()
    }
}

/// Provision a server, then deploy onto it
pub fn provision_and_deploy(
    provision: ProvisionSpec,
    deploy: DeploySpec,
) -> AggregateFlow<ServerState> {
    AggregateFlow::new(format!("up:{}", provision.name))
        .then(ProvisionInstanceFlow::new(provision))
        .then(DeployComposeFlow::new(deploy))
}

/// Release an executor owned by a state, logging instead of failing
pub(crate) async fn release_executor(executor: &mut RemoteCommandExecutor) {
    if let Err(e) = executor.dispose().await {
        tracing::warn!("Failed to close connection to {}: {}", executor.target(), e);
    }
}
