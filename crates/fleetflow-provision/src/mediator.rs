//! Mediator: the dispatch handle states use to reach cloud and domain logic
//!
//! The engine never talks to a cloud provider or a database directly.
//! States issue commands and queries through this trait; the daemon (or a
//! test) decides what answers them.

use crate::error::{ProvisionError, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Request to create a compute instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceRequest {
    pub name: String,
    pub plan: Option<String>,
    pub disk_size: Option<i32>,
    pub os_type: Option<String>,
    pub ssh_keys: Vec<String>,
    pub tags: Vec<String>,
}

impl InstanceRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Lifecycle status of an instance as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Stopped,
    Terminated,
    Unknown,
}

/// Provider view of one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: String,
    pub name: String,
    pub status: InstanceStatus,
    pub address: Option<String>,
}

impl InstanceInfo {
    /// Running and has an address we can SSH to
    pub fn is_reachable(&self) -> bool {
        self.status == InstanceStatus::Running && self.address.is_some()
    }
}

/// Container registry login
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub server: String,
    pub username: String,
    pub password: String,
}

impl RegistryCredentials {
    /// Decode a base64 `user:password` authorization token
    pub fn from_token(server: impl Into<String>, token: &str) -> Result<Self> {
        let decoded = BASE64
            .decode(token.trim())
            .map_err(|e| ProvisionError::state_update("registry-login", format!("invalid registry token: {}", e)))?;
        let decoded = String::from_utf8(decoded).map_err(|_| {
            ProvisionError::state_update("registry-login", "registry token is not valid UTF-8")
        })?;
        let (username, password) = decoded.split_once(':').ok_or_else(|| {
            ProvisionError::state_update("registry-login", "registry token must be user:password")
        })?;

        Ok(Self {
            server: server.into(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[async_trait]
pub trait Mediator: Send + Sync {
    /// Look up an instance by name (used to make creation idempotent)
    async fn find_instance(&self, name: &str) -> anyhow::Result<Option<InstanceInfo>>;

    async fn create_instance(&self, request: &InstanceRequest) -> anyhow::Result<InstanceInfo>;

    async fn describe_instance(&self, id: &str) -> anyhow::Result<InstanceInfo>;

    /// Record that the instance finished baseline setup
    async fn mark_instance_ready(&self, instance: &InstanceInfo) -> anyhow::Result<()>;

    /// Registry credentials, if deployments should log in first
    async fn registry_credentials(&self) -> anyhow::Result<Option<RegistryCredentials>>;
}
