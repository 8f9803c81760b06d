use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(
        "設定ファイル {} が見つかりません\n\nヒント:\n  • FLEET_PROVISION_CONFIG のパスを確認してください",
        .path.display()
    )]
    ConfigFileNotFound { path: PathBuf },

    #[error("設定ファイル {} の解析に失敗しました: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("設定値が不正です: {0}")]
    Invalid(String),

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
