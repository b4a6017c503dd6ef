//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! A missing config file is not an error; the service starts on defaults plus
//! whatever the environment supplies. `ADMIN_TOKEN`, `API_TOKEN` and
//! `API_KEYS` override the file so secrets need not be written to disk.

use common::Secret;
use key_pool::ReactivationSettings;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Keys supplied at startup. Never written to the state file.
    pub api_keys: Vec<String>,
    /// Bearer token for `/admin/api`. Empty disables the check.
    pub admin_token: Secret<String>,
    /// Bearer token for `/v1`. Empty disables the check.
    pub api_token: Secret<String>,
    /// Where user-added keys are persisted.
    pub state_file: PathBuf,
    pub proxy: ProxyConfig,
    pub auto_reactivation: ReactivationSettings,
}

/// HTTP proxy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
    pub timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub max_connections: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8980)),
            upstream_url: "https://api-inference.modelscope.cn".to_string(),
            timeout_secs: 30,
            probe_timeout_secs: 10,
            max_connections: 1000,
        }
    }
}

impl ProxyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            admin_token: Secret::default(),
            api_token: Secret::default(),
            state_file: PathBuf::from("state.json"),
            proxy: ProxyConfig::default(),
            auto_reactivation: ReactivationSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let mut config: Config = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(e.into()),
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("ADMIN_TOKEN") {
            self.admin_token = Secret::new(token);
        }
        if let Ok(token) = std::env::var("API_TOKEN") {
            self.api_token = Secret::new(token);
        }
        if let Ok(keys) = std::env::var("API_KEYS") {
            self.api_keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_owned)
                .collect();
        }
    }

    /// Check proxy settings. Reactivation settings are validated by the
    /// scheduler so a bad policy never blocks startup.
    pub fn validate(&self) -> common::Result<()> {
        let url = &self.proxy.upstream_url;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {url}"
            )));
        }

        if self.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.proxy.probe_timeout_secs == 0 {
            return Err(common::Error::Config(
                "probe_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Write the config as TOML, replacing `path` atomically.
    pub async fn save(&self, path: &Path) -> common::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        let dir = match path.parent() {
            Some(d) if !d.as_os_str().is_empty() => d,
            _ => Path::new("."),
        };
        let tmp_path = dir.join(format!(".config.tmp.{}", std::process::id()));
        tokio::fs::write(&tmp_path, contents).await?;

        // Tokens live in this file
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("key-balancer.toml")
    }
}
