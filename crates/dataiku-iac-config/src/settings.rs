//! ユーザー設定
//!
//! `~/.config/dataiku-iac/settings.yaml` から読み込み、
//! `DATAIKU_IAC_*` 環境変数で上書きします。
//!
//! ```yaml
//! state_dir: .dataiku-iac/state
//! workers: 4
//! entry_timeout_ms: 300000
//! lease_ms: 900000
//! retry:
//!   max_attempts: 3
//!   initial_delay_ms: 500
//! dss:
//!   url: https://dss.example.com
//!   api_key_env: DKU_API_KEY
//! ```

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// 設定ファイル名
pub const SETTINGS_FILE: &str = "settings.yaml";

/// dataiku-iac のユーザー設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 状態ファイルの保存先（相対パスはプロジェクトルート基準）
    pub state_dir: PathBuf,
    /// 並列実行するエントリの上限
    pub workers: usize,
    /// エントリあたりの最大実行時間（ミリ秒）
    pub entry_timeout_ms: u64,
    /// ロックのリース期間（ミリ秒）
    pub lease_ms: u64,
    /// 一時的エラーのリトライ設定
    pub retry: RetrySettings,
    /// DSS接続設定
    pub dss: DssSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".dataiku-iac/state"),
            workers: 4,
            entry_timeout_ms: 300_000, // 5分
            lease_ms: 900_000,         // 15分
            retry: RetrySettings::default(),
            dss: DssSettings::default(),
        }
    }
}

/// リトライ設定（exponential backoff）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// 最大試行回数（初回を含む）
    pub max_attempts: u32,
    /// 初期待機時間（ミリ秒）
    pub initial_delay_ms: u64,
    /// 最大待機時間（ミリ秒）
    pub max_delay_ms: u64,
    /// Exponential倍率
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetrySettings {
    /// 指定回数目の待機時間を計算
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis((delay as u64).min(self.max_delay_ms))
    }
}

/// DSS接続設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DssSettings {
    /// DSSのベースURL
    pub url: Option<String>,
    /// APIキーを読み出す環境変数名
    pub api_key_env: String,
}

impl Default for DssSettings {
    fn default() -> Self {
        Self {
            url: None,
            api_key_env: "DKU_API_KEY".to_string(),
        }
    }
}

impl Settings {
    /// グローバル設定ファイルを読み込む（存在しなければデフォルト）
    pub fn load() -> Result<Self> {
        let path = crate::get_config_dir()?.join(SETTINGS_FILE);
        Self::load_from(&path)
    }

    /// 指定パスの設定ファイルを読み込み、環境変数の上書きを適用
    #[tracing::instrument(skip(path), fields(path = %path.display()))]
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let settings: Settings =
                serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
            info!("Loaded settings file");
            settings
        } else {
            debug!("Settings file not found, using defaults");
            Settings::default()
        };

        settings.apply_env_overrides()?;
        settings.validate()?;
        Ok(settings)
    }

    /// DATAIKU_IAC_* 環境変数で上書き
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(dir) = env_var("DATAIKU_IAC_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(v) = env_parsed("DATAIKU_IAC_WORKERS")? {
            self.workers = v;
        }
        if let Some(v) = env_parsed("DATAIKU_IAC_ENTRY_TIMEOUT_MS")? {
            self.entry_timeout_ms = v;
        }
        if let Some(v) = env_parsed("DATAIKU_IAC_LEASE_MS")? {
            self.lease_ms = v;
        }
        if let Some(v) = env_parsed("DATAIKU_IAC_RETRY_MAX_ATTEMPTS")? {
            self.retry.max_attempts = v;
        }
        if let Some(url) = env_var("DATAIKU_IAC_DSS_URL") {
            self.dss.url = Some(url);
        }
        Ok(())
    }

    /// 値の範囲チェック
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(invalid("workers", self.workers));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", self.retry.max_attempts));
        }
        if self.retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier", self.retry.multiplier));
        }
        Ok(())
    }

    pub fn entry_timeout(&self) -> Duration {
        Duration::from_millis(self.entry_timeout_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    /// 状態ディレクトリをプロジェクトルート基準で解決
    pub fn resolve_state_dir(&self, project_root: &Path) -> PathBuf {
        if self.state_dir.is_absolute() {
            self.state_dir.clone()
        } else {
            project_root.join(&self.state_dir)
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_var(key) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        None => Ok(None),
    }
}

fn invalid(key: &str, value: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&temp_dir.path().join("settings.yaml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    #[serial]
    fn test_load_partial_yaml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("settings.yaml");
        std::fs::write(
            &path,
            "workers: 8\nretry:\n  max_attempts: 5\ndss:\n  url: https://dss.example.com\n",
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.workers, 8);
        assert_eq!(settings.retry.max_attempts, 5);
        // 未指定の項目はデフォルト
        assert_eq!(settings.retry.initial_delay_ms, 500);
        assert_eq!(settings.dss.url.as_deref(), Some("https://dss.example.com"));
        assert_eq!(settings.dss.api_key_env, "DKU_API_KEY");
    }

    #[test]
    #[serial]
    fn test_invalid_yaml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("settings.yaml");
        std::fs::write(&path, "workers: [not, a, number]\n").unwrap();

        let result = Settings::load_from(&path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        let temp_dir = tempfile::tempdir().unwrap();
        temp_env::with_vars(
            [
                ("DATAIKU_IAC_WORKERS", Some("2")),
                ("DATAIKU_IAC_STATE_DIR", Some("/var/lib/dataiku-iac")),
                ("DATAIKU_IAC_DSS_URL", Some("https://dss.internal")),
            ],
            || {
                let settings = Settings::load_from(&temp_dir.path().join("none.yaml")).unwrap();
                assert_eq!(settings.workers, 2);
                assert_eq!(settings.state_dir, PathBuf::from("/var/lib/dataiku-iac"));
                assert_eq!(settings.dss.url.as_deref(), Some("https://dss.internal"));
            },
        );
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_number() {
        let temp_dir = tempfile::tempdir().unwrap();
        temp_env::with_var("DATAIKU_IAC_WORKERS", Some("many"), || {
            let result = Settings::load_from(&temp_dir.path().join("none.yaml"));
            assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
        });
    }

    #[test]
    #[serial]
    fn test_zero_workers_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("settings.yaml");
        std::fs::write(&path, "workers: 0\n").unwrap();
        assert!(matches!(
            Settings::load_from(&path),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_delay_for_attempt() {
        let retry = RetrySettings {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            multiplier: 2.0,
        };
        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(800));
        // 上限で頭打ち
        assert_eq!(retry.delay_for_attempt(10), Duration::from_millis(1000));
    }

    #[test]
    fn test_resolve_state_dir() {
        let settings = Settings::default();
        assert_eq!(
            settings.resolve_state_dir(Path::new("/work/analytics")),
            PathBuf::from("/work/analytics/.dataiku-iac/state")
        );
    }
}
