//! usacloud CLI wrapper
//!
//! Server lookups and creation on Sakura Cloud through the usacloud CLI.

use serde::{Deserialize, Serialize};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum UsacloudError {
    #[error("usacloud command failed: {0}")]
    CommandFailed(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, UsacloudError>;

/// usacloud CLI wrapper
pub struct Usacloud {
    zone: String,
}

impl Usacloud {
    pub fn new(zone: impl Into<String>) -> Self {
        Self { zone: zone.into() }
    }

    /// Run a usacloud command and return stdout
    async fn run_command(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("usacloud");
        cmd.arg("--zone").arg(&self.zone);
        cmd.args(args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::debug!("Running: usacloud --zone {} {}", self.zone, args.join(" "));

        let output = cmd.output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(UsacloudError::CommandFailed(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Get server by name
    pub async fn find_server(&self, name: &str) -> Result<Option<ServerInfo>> {
        let output = self
            .run_command(&["server", "list", "--names", name, "--output-type", "json"])
            .await?;

        if output.trim().is_empty() || output.trim() == "[]" {
            return Ok(None);
        }

        let servers: Vec<ServerInfo> = serde_json::from_str(&output)?;
        Ok(servers.into_iter().find(|s| s.name == name))
    }

    /// Get server by ID
    pub async fn read_server(&self, id: &str) -> Result<ServerInfo> {
        let output = self
            .run_command(&["server", "read", id, "--output-type", "json"])
            .await?;

        parse_single(&output)
    }

    /// Create a server; it boots after creation
    pub async fn create_server(&self, config: &CreateServerConfig) -> Result<ServerInfo> {
        let core_str = config.core.to_string();
        let memory_str = config.memory.to_string();
        let disk_size_str = config.disk_size.map(|d| d.to_string());

        let mut args = vec![
            "server",
            "create",
            "--name",
            config.name.as_str(),
            "--cpu",
            core_str.as_str(),
            "--memory",
            memory_str.as_str(),
            "--output-type",
            "json",
            "--yes",
        ];

        if let Some(ref disk_size) = disk_size_str {
            args.push("--disk-size");
            args.push(disk_size.as_str());
        }

        if let Some(ref os) = config.os_type {
            args.push("--os-type");
            args.push(os.as_str());
        }

        for id in &config.ssh_key_ids {
            args.push("--disk-edit-ssh-key-ids");
            args.push(id.as_str());
        }

        for tag in &config.tags {
            args.push("--tags");
            args.push(tag.as_str());
        }

        let output = self.run_command(&args).await?;
        parse_single(&output)
    }

    /// Power on a server
    pub async fn power_on(&self, id: &str) -> Result<()> {
        self.run_command(&["server", "boot", id, "--yes"]).await?;
        Ok(())
    }

    /// Replace the tags of a server
    pub async fn set_tags(&self, id: &str, tags: &[String]) -> Result<()> {
        let joined = tags.join(",");
        self.run_command(&["server", "update", id, "--tags", joined.as_str(), "--yes"])
            .await?;
        Ok(())
    }
}

/// `server read`/`create` print either one object or a one-element array
fn parse_single(output: &str) -> Result<ServerInfo> {
    let trimmed = output.trim();
    if trimmed.starts_with('[') {
        let servers: Vec<ServerInfo> = serde_json::from_str(trimmed)?;
        servers
            .into_iter()
            .next()
            .ok_or_else(|| UsacloudError::CommandFailed("usacloud returned no server".to_string()))
    } else {
        Ok(serde_json::from_str(trimmed)?)
    }
}

/// Server information from usacloud
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "InstanceStatus")]
    pub instance_status: Option<String>,

    #[serde(rename = "Interfaces")]
    pub interfaces: Option<Vec<InterfaceInfo>>,

    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,
}

impl ServerInfo {
    /// Get the first IP address
    pub fn ip_address(&self) -> Option<String> {
        self.interfaces
            .as_ref()?
            .iter()
            .find_map(|i| i.ip_address.clone())
    }

    /// Check if server is running
    pub fn is_running(&self) -> bool {
        self.instance_status.as_deref() == Some("up")
    }

    pub fn is_down(&self) -> bool {
        self.instance_status.as_deref() == Some("down")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceInfo {
    #[serde(rename = "IPAddress")]
    pub ip_address: Option<String>,
}

/// Configuration for creating a server
#[derive(Debug, Clone)]
pub struct CreateServerConfig {
    pub name: String,
    pub core: i32,
    pub memory: i32,
    pub disk_size: Option<i32>,
    pub os_type: Option<String>,
    pub ssh_key_ids: Vec<String>,
    pub tags: Vec<String>,
}

/// Parse plan string like "2core-4gb" to (core, memory_gb)
pub fn parse_plan(plan: Option<&str>) -> (i32, i32) {
    if let Some(p) = plan {
        let parts: Vec<&str> = p.split('-').collect();
        if parts.len() == 2 {
            let core = parts[0]
                .trim_end_matches("core")
                .parse::<i32>()
                .unwrap_or(1);
            let memory = parts[1].trim_end_matches("gb").parse::<i32>().unwrap_or(1);
            return (core, memory);
        }
    }
    (1, 1)
}
