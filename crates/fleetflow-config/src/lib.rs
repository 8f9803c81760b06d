pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 設定ファイルを直接指定する環境変数
pub const CONFIG_ENV_VAR: &str = "FLEET_PROVISION_CONFIG";

const CANDIDATES: [&str; 2] = ["provision.local.yaml", "provision.yaml"];

/// プロビジョニングエンジンの設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// メインループの間隔（ミリ秒）
    pub poll_interval_ms: u64,

    /// ステートが InProgress を返した後の再ポーリング間隔（ミリ秒）
    pub state_poll_interval_ms: u64,

    /// 終了したジョブを ID で参照できる期間（秒）
    pub job_retention_secs: u64,

    pub ssh: SshConfig,
    pub remote: RemoteConfig,
    pub registry: RegistryConfig,
    pub cloud: CloudConfig,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            state_poll_interval_ms: 1000,
            job_retention_secs: 24 * 60 * 60,
            ssh: SshConfig::default(),
            remote: RemoteConfig::default(),
            registry: RegistryConfig::default(),
            cloud: CloudConfig::default(),
        }
    }
}

impl ProvisionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn state_poll_interval(&self) -> Duration {
        Duration::from_millis(self.state_poll_interval_ms)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    /// 値の整合性を確認
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms は 1 以上を指定してください".to_string(),
            ));
        }
        if self.state_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "state_poll_interval_ms は 1 以上を指定してください".to_string(),
            ));
        }
        if self.remote.max_command_attempts == Some(0) {
            return Err(ConfigError::Invalid(
                "remote.max_command_attempts は 1 以上を指定してください".to_string(),
            ));
        }
        Ok(())
    }
}

/// SSH 接続のデフォルト
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: 22,
            identity_file: None,
            connect_timeout_secs: 10,
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// リモートコマンド実行のリトライ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub connect_retry_delay_ms: u64,
    pub command_retry_delay_ms: u64,
    /// AllowRetries 時の最大試行回数（未指定なら成功するまで）
    pub max_command_attempts: Option<u32>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            connect_retry_delay_ms: 5000,
            command_retry_delay_ms: 5000,
            max_command_attempts: None,
        }
    }
}

impl RemoteConfig {
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn command_retry_delay(&self) -> Duration {
        Duration::from_millis(self.command_retry_delay_ms)
    }
}

/// コンテナレジストリの認証情報の取得先
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// レジストリのホスト（例: ghcr.io）
    pub server: Option<String>,
    /// base64(`user:password`) のトークンを読む環境変数名
    pub token_env: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            server: None,
            token_env: "FLEET_REGISTRY_TOKEN".to_string(),
        }
    }
}

/// サーバー作成時のデフォルト（さくらのクラウド）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub zone: String,
    pub plan: Option<String>,
    pub disk_size: Option<i32>,
    pub os_type: Option<String>,
    pub ssh_keys: Vec<String>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            zone: "tk1a".to_string(),
            plan: None,
            disk_size: None,
            os_type: Some("ubuntu".to_string()),
            ssh_keys: Vec::new(),
        }
    }
}

/// 設定ファイルを探す
///
/// 以下の優先順位で検索:
/// 1. 環境変数 FLEET_PROVISION_CONFIG (直接パス指定、存在しなければエラー)
/// 2. カレントディレクトリ: provision.local.yaml, provision.yaml
/// 3. ./.fleetflow/ ディレクトリ内: 同様の順序
/// 4. ~/.config/fleetflow/provision.yaml (グローバル設定)
///
/// どこにもなければ `Ok(None)`（デフォルト設定を使う）
pub fn find_config_file() -> Result<Option<PathBuf>> {
    // 1. 環境変数で直接指定
    if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(Some(path));
        }
        return Err(ConfigError::ConfigFileNotFound { path });
    }

    let current_dir = std::env::current_dir()?;

    // 2. カレントディレクトリで検索
    if let Some(path) = find_in(&current_dir) {
        return Ok(Some(path));
    }

    // 3. ./.fleetflow/ ディレクトリで検索
    let flow_dir = current_dir.join(".fleetflow");
    if flow_dir.is_dir() {
        if let Some(path) = find_in(&flow_dir) {
            return Ok(Some(path));
        }
    }

    // 4. グローバル設定ファイル
    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("fleetflow").join("provision.yaml");
        if global_config.exists() {
            return Ok(Some(global_config));
        }
    }

    Ok(None)
}

fn find_in(dir: &Path) -> Option<PathBuf> {
    CANDIDATES
        .iter()
        .map(|filename| dir.join(filename))
        .find(|path| path.exists())
}

/// 設定を読み込む（ファイルがなければデフォルト）
pub fn load_config() -> Result<ProvisionConfig> {
    match find_config_file()? {
        Some(path) => load_config_from(&path),
        None => {
            tracing::debug!("設定ファイルが見つからないためデフォルト設定を使用します");
            Ok(ProvisionConfig::default())
        }
    }
}

/// 指定したファイルから設定を読み込む
pub fn load_config_from(path: &Path) -> Result<ProvisionConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: ProvisionConfig =
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    config.validate()?;

    tracing::debug!("設定を読み込みました: {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    #[test]
    fn test_defaults() {
        let config = ProvisionConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.remote.max_command_attempts, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("provision.yaml");
        fs::write(
            &path,
            "poll_interval_ms: 250\nssh:\n  user: deploy\nremote:\n  max_command_attempts: 5\n",
        )
        .unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.state_poll_interval_ms, 1000);
        assert_eq!(config.ssh.user, "deploy");
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.remote.max_command_attempts, Some(5));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("provision.yaml");
        fs::write(&path, "poll_interval_ms: 0\n").unwrap();

        assert!(matches!(
            load_config_from(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_parse_error_reports_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("provision.yaml");
        fs::write(&path, "poll_interval_ms: [not, a, number]\n").unwrap();

        match load_config_from(&path) {
            Err(ConfigError::Parse { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("Expected parse error, got {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_find_config_file_env_var() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.yaml");
        fs::write(&config_path, "job_retention_secs: 60\n").unwrap();

        temp_env::with_var(CONFIG_ENV_VAR, Some(config_path.as_os_str()), || {
            assert_eq!(find_config_file().unwrap(), Some(config_path.clone()));
            assert_eq!(load_config().unwrap().job_retention_secs, 60);
        });
    }

    #[test]
    #[serial]
    fn test_find_config_file_env_var_missing() {
        temp_env::with_var(CONFIG_ENV_VAR, Some("/nonexistent/provision.yaml"), || {
            assert!(matches!(
                find_config_file(),
                Err(ConfigError::ConfigFileNotFound { .. })
            ));
        });
    }

    #[test]
    #[serial]
    fn test_local_file_priority() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        fs::write(temp_dir.path().join("provision.yaml"), "poll_interval_ms: 10\n").unwrap();
        fs::write(
            temp_dir.path().join("provision.local.yaml"),
            "poll_interval_ms: 20\n",
        )
        .unwrap();

        std::env::set_current_dir(&temp_dir).unwrap();

        temp_env::with_var_unset(CONFIG_ENV_VAR, || {
            let found = find_config_file().unwrap().unwrap();
            // provision.local.yaml が優先される
            assert!(found.ends_with("provision.local.yaml"));
            assert_eq!(load_config().unwrap().poll_interval_ms, 20);
        });

        std::env::set_current_dir(original_dir).unwrap();
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_flow_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        let flow_dir = temp_dir.path().join(".fleetflow");
        fs::create_dir(&flow_dir).unwrap();
        fs::write(flow_dir.join("provision.yaml"), "poll_interval_ms: 30\n").unwrap();

        std::env::set_current_dir(&temp_dir).unwrap();

        temp_env::with_var_unset(CONFIG_ENV_VAR, || {
            let found = find_config_file().unwrap().unwrap();
            assert!(found.ends_with(".fleetflow/provision.yaml"));
        });

        std::env::set_current_dir(original_dir).unwrap();
    }
}
