use super::{ServerState, release_executor};
use crate::error::{ProvisionError, Result};
use crate::flow::{FlowContext, StateFlow};
use crate::mediator::RegistryCredentials;
use crate::state::{State, StateProgress};
use async_trait::async_trait;
use fleetflow_remote::{CommandParameters, RemoteCommandExecutor, RetryPolicy, Sensitivity};

const FLOW_NAME: &str = "deploy-compose";

/// A file placed in the remote project directory before `docker compose up`
#[derive(Clone)]
pub struct DeployFile {
    /// Path relative to the project directory
    pub path: String,
    pub contents: Vec<u8>,
    /// Redact the contents from logs and errors (`.env` files and the like)
    pub sensitive: bool,
}

impl DeployFile {
    pub fn new(path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
            sensitive: false,
        }
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

impl std::fmt::Debug for DeployFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployFile")
            .field("path", &self.path)
            .field("bytes", &self.contents.len())
            .field("sensitive", &self.sensitive)
            .finish()
    }
}

/// Which server to deploy to and what
#[derive(Debug, Clone)]
pub struct DeploySpec {
    /// Instance name, resolved to an address through the mediator
    pub server: String,
    /// Compose project name
    pub project: String,
    /// Project directory on the server
    pub remote_dir: String,
    pub compose_file: String,
    pub files: Vec<DeployFile>,
}

impl DeploySpec {
    pub fn new(server: impl Into<String>, project: impl Into<String>) -> Self {
        let project = project.into();
        Self {
            server: server.into(),
            remote_dir: format!("/opt/fleetflow/{}", project),
            project,
            compose_file: "compose.yaml".to_string(),
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, file: DeployFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn with_remote_dir(mut self, remote_dir: impl Into<String>) -> Self {
        self.remote_dir = remote_dir.into();
        self
    }
}

/// Logs the server's container runtime into the private registry
pub struct RegistryLogin {
    executor: RemoteCommandExecutor,
    host: String,
    credentials: RegistryCredentials,
}

impl RegistryLogin {
    pub fn new(
        mut executor: RemoteCommandExecutor,
        host: String,
        credentials: RegistryCredentials,
    ) -> Self {
        executor.add_known_secret(credentials.password.clone());
        Self {
            executor,
            host,
            credentials,
        }
    }
}

#[async_trait]
impl State for RegistryLogin {
    fn description(&self) -> String {
        format!("Logging in to {} on {}", self.credentials.server, self.host)
    }

    async fn initialize(&mut self) -> Result<()> {
        self.executor.connect().await?;
        Ok(())
    }

    async fn update(&mut self) -> Result<StateProgress> {
        let mut params = CommandParameters::new();
        params.insert("server".to_string(), self.credentials.server.clone());
        params.insert("username".to_string(), self.credentials.username.clone());
        params.insert("password".to_string(), self.credentials.password.clone());

        self.executor
            .execute_command(
                RetryPolicy::AllowRetries,
                Sensitivity::ContainsSensitiveData,
                "printf '%s' @password | docker login @server --username @username --password-stdin",
                Some(&params),
            )
            .await?;
        Ok(StateProgress::Succeeded)
    }

    async fn dispose(&mut self) {
        release_executor(&mut self.executor).await;
    }
}

/// Uploads deployment files, one per update
pub struct TransferFiles {
    executor: RemoteCommandExecutor,
    host: String,
    remote_dir: String,
    files: Vec<DeployFile>,
    transferred: usize,
}

impl TransferFiles {
    pub fn new(
        executor: RemoteCommandExecutor,
        host: String,
        remote_dir: String,
        files: Vec<DeployFile>,
    ) -> Self {
        Self {
            executor,
            host,
            remote_dir,
            files,
            transferred: 0,
        }
    }
}

#[async_trait]
impl State for TransferFiles {
    fn description(&self) -> String {
        format!(
            "Transferring files to {}:{} ({}/{})",
            self.host,
            self.remote_dir,
            self.transferred,
            self.files.len()
        )
    }

    async fn initialize(&mut self) -> Result<()> {
        self.executor.connect().await?;
        Ok(())
    }

    async fn update(&mut self) -> Result<StateProgress> {
        if let Some(file) = self.files.get(self.transferred) {
            let path = format!(
                "{}/{}",
                self.remote_dir.trim_end_matches('/'),
                file.path.trim_start_matches('/')
            );
            let sensitivity = if file.sensitive {
                Sensitivity::ContainsSensitiveData
            } else {
                Sensitivity::ContainsNoSensitiveData
            };
            self.executor
                .write_file(&path, &file.contents, sensitivity)
                .await?;
            self.transferred += 1;
            tracing::debug!("Transferred {} to {}", path, self.host);
        }

        Ok(if self.transferred >= self.files.len() {
            StateProgress::Succeeded
        } else {
            StateProgress::InProgress
        })
    }

    async fn dispose(&mut self) {
        release_executor(&mut self.executor).await;
    }
}

/// Pulls images and (re)starts the compose project
pub struct RunCompose {
    executor: RemoteCommandExecutor,
    host: String,
    remote_dir: String,
    project: String,
    compose_file: String,
}

impl RunCompose {
    pub fn new(
        executor: RemoteCommandExecutor,
        host: String,
        remote_dir: String,
        project: String,
        compose_file: String,
    ) -> Self {
        Self {
            executor,
            host,
            remote_dir,
            project,
            compose_file,
        }
    }
}

#[async_trait]
impl State for RunCompose {
    fn description(&self) -> String {
        format!("Starting {} on {}", self.project, self.host)
    }

    async fn initialize(&mut self) -> Result<()> {
        self.executor.connect().await?;
        Ok(())
    }

    async fn update(&mut self) -> Result<StateProgress> {
        let mut params = CommandParameters::new();
        params.insert("dir".to_string(), self.remote_dir.clone());
        params.insert("project".to_string(), self.project.clone());
        params.insert("file".to_string(), self.compose_file.clone());

        self.executor
            .execute_command(
                RetryPolicy::AllowRetries,
                Sensitivity::ContainsNoSensitiveData,
                "cd @dir && docker compose -p @project -f @file pull && docker compose -p @project -f @file up -d --remove-orphans",
                Some(&params),
            )
            .await?;
        tracing::info!("Deployed {} on {}", self.project, self.host);
        Ok(StateProgress::Succeeded)
    }

    async fn dispose(&mut self) {
        release_executor(&mut self.executor).await;
    }
}

/// Deploy a compose project onto an existing server
pub struct DeployComposeFlow {
    spec: DeploySpec,
}

impl DeployComposeFlow {
    pub fn new(spec: DeploySpec) -> Self {
        Self { spec }
    }

    fn transfer(&self, ctx: &FlowContext, host: &str) -> ServerState {
        ServerState::TransferFiles(TransferFiles::new(
            ctx.states.executor(host),
            host.to_string(),
            self.spec.remote_dir.clone(),
            self.spec.files.clone(),
        ))
    }
}

#[async_trait]
impl StateFlow for DeployComposeFlow {
    type State = ServerState;

    fn name(&self) -> &str {
        FLOW_NAME
    }

    async fn initial_state(&self, ctx: &FlowContext) -> Result<ServerState> {
        let instance = ctx
            .mediator
            .find_instance(&self.spec.server)
            .await?
            .ok_or_else(|| {
                ProvisionError::state_update(
                    "deploy",
                    format!("server {} not found", self.spec.server),
                )
            })?;
        let host = instance.address.ok_or_else(|| {
            ProvisionError::state_update(
                "deploy",
                format!("server {} has no address", self.spec.server),
            )
        })?;

        match ctx.mediator.registry_credentials().await? {
            Some(credentials) => Ok(ServerState::RegistryLogin(RegistryLogin::new(
                ctx.states.executor(&host),
                host,
                credentials,
            ))),
            None => Ok(self.transfer(ctx, &host)),
        }
    }

    async fn next_state(
        &mut self,
        ctx: &FlowContext,
        current: &ServerState,
    ) -> Result<Option<ServerState>> {
        let next = match current {
            ServerState::RegistryLogin(state) => self.transfer(ctx, &state.host),
            ServerState::TransferFiles(state) => ServerState::RunCompose(RunCompose::new(
                ctx.states.executor(&state.host),
                state.host.clone(),
                self.spec.remote_dir.clone(),
                self.spec.project.clone(),
                self.spec.compose_file.clone(),
            )),
            ServerState::RunCompose(_) => return Ok(None),
            other => return Err(ProvisionError::unknown_state(FLOW_NAME, other.name())),
        };
        Ok(Some(next))
    }
}
