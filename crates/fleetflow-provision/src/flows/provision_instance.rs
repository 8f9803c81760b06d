use super::{ServerState, release_executor};
use crate::error::{ProvisionError, Result};
use crate::flow::{FlowContext, StateFlow};
use crate::mediator::{InstanceInfo, InstanceRequest, InstanceStatus, Mediator};
use crate::state::{State, StateProgress};
use async_trait::async_trait;
use fleetflow_remote::{CommandParameters, RemoteCommandExecutor, RetryPolicy, Sensitivity};
use std::sync::Arc;

const FLOW_NAME: &str = "provision-instance";

/// What server to create and how to prepare it
#[derive(Debug, Clone, Default)]
pub struct ProvisionSpec {
    pub name: String,
    pub plan: Option<String>,
    pub disk_size: Option<i32>,
    pub os_type: Option<String>,
    pub ssh_keys: Vec<String>,
    pub tags: Vec<String>,
    /// Extra apt packages installed after the container runtime
    pub packages: Vec<String>,
}

impl ProvisionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    fn request(&self) -> InstanceRequest {
        InstanceRequest {
            name: self.name.clone(),
            plan: self.plan.clone(),
            disk_size: self.disk_size,
            os_type: self.os_type.clone(),
            ssh_keys: self.ssh_keys.clone(),
            tags: self.tags.clone(),
        }
    }
}

/// Creates the instance (or adopts an existing one with the same name) and
/// waits until it is running with an address.
pub struct CreateInstance {
    mediator: Arc<dyn Mediator>,
    request: InstanceRequest,
    instance: Option<InstanceInfo>,
}

impl CreateInstance {
    pub fn new(mediator: Arc<dyn Mediator>, request: InstanceRequest) -> Self {
        Self {
            mediator,
            request,
            instance: None,
        }
    }

    pub fn instance(&self) -> Option<&InstanceInfo> {
        self.instance.as_ref()
    }
}

#[async_trait]
impl State for CreateInstance {
    fn description(&self) -> String {
        match &self.instance {
            Some(instance) => format!(
                "Waiting for instance {} ({:?})",
                instance.name, instance.status
            ),
            None => format!("Creating instance {}", self.request.name),
        }
    }

    async fn initialize(&mut self) -> Result<()> {
        self.instance = self.mediator.find_instance(&self.request.name).await?;
        if let Some(instance) = &self.instance {
            tracing::info!(
                "Instance {} already exists (id {}), adopting it",
                instance.name,
                instance.id
            );
        }
        Ok(())
    }

    async fn update(&mut self) -> Result<StateProgress> {
        let instance = match &self.instance {
            None => {
                let created = self.mediator.create_instance(&self.request).await?;
                tracing::info!("Created instance {} (id {})", created.name, created.id);
                created
            }
            Some(existing) => self.mediator.describe_instance(&existing.id).await?,
        };

        if matches!(
            instance.status,
            InstanceStatus::Stopped | InstanceStatus::Terminated
        ) {
            return Err(ProvisionError::state_update(
                "create-instance",
                format!("instance {} is {:?}", instance.name, instance.status),
            ));
        }

        let reachable = instance.is_reachable();
        self.instance = Some(instance);
        Ok(if reachable {
            StateProgress::Succeeded
        } else {
            StateProgress::InProgress
        })
    }
}

/// Polls until the instance accepts SSH connections
pub struct WaitForSsh {
    executor: RemoteCommandExecutor,
    instance: InstanceInfo,
    attempts: u32,
}

impl WaitForSsh {
    pub fn new(executor: RemoteCommandExecutor, instance: InstanceInfo) -> Self {
        Self {
            executor,
            instance,
            attempts: 0,
        }
    }
}

#[async_trait]
impl State for WaitForSsh {
    fn description(&self) -> String {
        format!(
            "Waiting for SSH on {} (attempt {})",
            self.executor.target(),
            self.attempts
        )
    }

    async fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    async fn update(&mut self) -> Result<StateProgress> {
        self.attempts += 1;
        if self.executor.try_connect().await? {
            tracing::info!("SSH is up on {}", self.instance.name);
            Ok(StateProgress::Succeeded)
        } else {
            Ok(StateProgress::InProgress)
        }
    }

    async fn dispose(&mut self) {
        release_executor(&mut self.executor).await;
    }
}

/// Installs the container runtime and extra packages, one step per update
pub struct InstallBaseline {
    executor: RemoteCommandExecutor,
    instance: InstanceInfo,
    steps: Vec<(&'static str, CommandParameters)>,
    completed: usize,
}

impl InstallBaseline {
    pub fn new(executor: RemoteCommandExecutor, instance: InstanceInfo, packages: &[String]) -> Self {
        let mut steps: Vec<(&'static str, CommandParameters)> = vec![
            (
                "command -v docker >/dev/null 2>&1 || (curl -fsSL https://get.docker.com | sh)",
                CommandParameters::new(),
            ),
            ("systemctl enable --now docker", CommandParameters::new()),
        ];
        for package in packages {
            let mut params = CommandParameters::new();
            params.insert("package".to_string(), package.clone());
            steps.push((
                "DEBIAN_FRONTEND=noninteractive apt-get install -y @package",
                params,
            ));
        }

        Self {
            executor,
            instance,
            steps,
            completed: 0,
        }
    }
}

#[async_trait]
impl State for InstallBaseline {
    fn description(&self) -> String {
        format!(
            "Installing baseline on {} ({}/{})",
            self.instance.name,
            self.completed,
            self.steps.len()
        )
    }

    async fn initialize(&mut self) -> Result<()> {
        self.executor.connect().await?;
        Ok(())
    }

    async fn update(&mut self) -> Result<StateProgress> {
        let Some((template, params)) = self.steps.get(self.completed) else {
            return Ok(StateProgress::Succeeded);
        };

        self.executor
            .execute_command(
                RetryPolicy::AllowRetries,
                Sensitivity::ContainsNoSensitiveData,
                template,
                Some(params),
            )
            .await?;
        self.completed += 1;

        Ok(if self.completed == self.steps.len() {
            StateProgress::Succeeded
        } else {
            StateProgress::InProgress
        })
    }

    async fn dispose(&mut self) {
        release_executor(&mut self.executor).await;
    }
}

/// Records the instance as ready for deployments
pub struct CompleteSetup {
    mediator: Arc<dyn Mediator>,
    instance: InstanceInfo,
}

impl CompleteSetup {
    pub fn new(mediator: Arc<dyn Mediator>, instance: InstanceInfo) -> Self {
        Self { mediator, instance }
    }
}

#[async_trait]
impl State for CompleteSetup {
    fn description(&self) -> String {
        format!("Completing setup of {}", self.instance.name)
    }

    async fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    async fn update(&mut self) -> Result<StateProgress> {
        self.mediator.mark_instance_ready(&self.instance).await?;
        Ok(StateProgress::Succeeded)
    }
}

/// Create a server and bring it to a deployable baseline
pub struct ProvisionInstanceFlow {
    spec: ProvisionSpec,
}

impl ProvisionInstanceFlow {
    pub fn new(spec: ProvisionSpec) -> Self {
        Self { spec }
    }
}

fn reachable_address(instance: &InstanceInfo) -> Result<&str> {
    instance.address.as_deref().ok_or_else(|| {
        ProvisionError::state_update(
            "wait-for-ssh",
            format!("instance {} has no address", instance.name),
        )
    })
}

#[async_trait]
impl StateFlow for ProvisionInstanceFlow {
    type State = ServerState;

    fn name(&self) -> &str {
        FLOW_NAME
    }

    async fn initial_state(&self, ctx: &FlowContext) -> Result<ServerState> {
        Ok(ServerState::CreateInstance(CreateInstance::new(
            ctx.mediator.clone(),
            self.spec.request(),
        )))
    }

    async fn next_state(
        &mut self,
        ctx: &FlowContext,
        current: &ServerState,
    ) -> Result<Option<ServerState>> {
        let next = match current {
            ServerState::CreateInstance(state) => {
                let instance = state.instance().cloned().ok_or_else(|| {
                    ProvisionError::state_update("create-instance", "no instance was created")
                })?;
                let executor = ctx.states.executor(reachable_address(&instance)?);
                ServerState::WaitForSsh(WaitForSsh::new(executor, instance))
            }
            ServerState::WaitForSsh(state) => {
                let instance = state.instance.clone();
                let executor = ctx.states.executor(reachable_address(&instance)?);
                ServerState::InstallBaseline(InstallBaseline::new(
                    executor,
                    instance,
                    &self.spec.packages,
                ))
            }
            ServerState::InstallBaseline(state) => ServerState::CompleteSetup(CompleteSetup::new(
                ctx.mediator.clone(),
                state.instance.clone(),
            )),
            ServerState::CompleteSetup(_) => return Ok(None),
            other => return Err(ProvisionError::unknown_state(FLOW_NAME, other.name())),
        };
        Ok(Some(next))
    }
}
