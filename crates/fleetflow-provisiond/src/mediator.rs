//! Mediator backed by Sakura Cloud (usacloud) and the local environment

use crate::usacloud::{CreateServerConfig, ServerInfo, Usacloud, parse_plan};
use async_trait::async_trait;
use fleetflow_config::{ProvisionConfig, RegistryConfig};
use fleetflow_provision::{
    InstanceInfo, InstanceRequest, InstanceStatus, Mediator, RegistryCredentials,
};

/// Tag added to servers that finished baseline setup
pub const READY_TAG: &str = "fleetflow-ready";

/// Tag added to every server this tool creates
pub const MANAGED_TAG: &str = "fleetflow";

pub struct SakuraMediator {
    usacloud: Usacloud,
    registry: RegistryConfig,
}

impl SakuraMediator {
    pub fn new(config: &ProvisionConfig) -> Self {
        Self {
            usacloud: Usacloud::new(config.cloud.zone.clone()),
            registry: config.registry.clone(),
        }
    }
}

fn to_instance(server: &ServerInfo) -> InstanceInfo {
    let status = match server.instance_status.as_deref() {
        Some("up") => InstanceStatus::Running,
        Some("down") => InstanceStatus::Stopped,
        Some(_) => InstanceStatus::Pending,
        None => InstanceStatus::Unknown,
    };
    InstanceInfo {
        id: server.id.clone(),
        name: server.name.clone(),
        status,
        address: server.ip_address(),
    }
}

/// Registry credentials from the configured server and token variable.
///
/// `None` when no registry is configured.
pub fn credentials_from_env(registry: &RegistryConfig) -> anyhow::Result<Option<RegistryCredentials>> {
    let Some(server) = &registry.server else {
        return Ok(None);
    };
    let token = std::env::var(&registry.token_env).map_err(|_| {
        anyhow::anyhow!(
            "レジストリ {} の認証トークンが見つかりません: 環境変数 {} を設定してください",
            server,
            registry.token_env
        )
    })?;
    Ok(Some(RegistryCredentials::from_token(server.clone(), &token)?))
}

#[async_trait]
impl Mediator for SakuraMediator {
    async fn find_instance(&self, name: &str) -> anyhow::Result<Option<InstanceInfo>> {
        let server = self.usacloud.find_server(name).await?;
        Ok(server.as_ref().map(to_instance))
    }

    async fn create_instance(&self, request: &InstanceRequest) -> anyhow::Result<InstanceInfo> {
        let (core, memory) = parse_plan(request.plan.as_deref());
        let mut tags = request.tags.clone();
        if !tags.iter().any(|t| t == MANAGED_TAG) {
            tags.push(MANAGED_TAG.to_string());
        }

        let config = CreateServerConfig {
            name: request.name.clone(),
            core,
            memory,
            disk_size: request.disk_size,
            os_type: request.os_type.clone(),
            ssh_key_ids: request.ssh_keys.clone(),
            tags,
        };
        let server = self.usacloud.create_server(&config).await?;
        tracing::info!("Created server {} ({})", server.name, server.id);

        // Boots right after creation
        let mut instance = to_instance(&server);
        if instance.status == InstanceStatus::Stopped {
            instance.status = InstanceStatus::Pending;
        }
        Ok(instance)
    }

    async fn describe_instance(&self, id: &str) -> anyhow::Result<InstanceInfo> {
        let server = self.usacloud.read_server(id).await?;
        if server.is_down() {
            tracing::warn!("Server {} is down, booting it", server.name);
            self.usacloud.power_on(id).await?;
            let mut instance = to_instance(&server);
            instance.status = InstanceStatus::Pending;
            return Ok(instance);
        }
        Ok(to_instance(&server))
    }

    async fn mark_instance_ready(&self, instance: &InstanceInfo) -> anyhow::Result<()> {
        let server = self.usacloud.read_server(&instance.id).await?;
        if server.tags.iter().any(|t| t == READY_TAG) {
            return Ok(());
        }
        let mut tags = server.tags.clone();
        tags.push(READY_TAG.to_string());
        self.usacloud.set_tags(&instance.id, &tags).await?;
        Ok(())
    }

    async fn registry_credentials(&self) -> anyhow::Result<Option<RegistryCredentials>> {
        credentials_from_env(&self.registry)
    }
}
