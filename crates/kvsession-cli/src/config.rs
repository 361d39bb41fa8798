//! Server configuration loading.
//!
//! An explicit `--config` path wins. Otherwise `config/kvsession/{env}.toml`
//! is preferred over `config/kvsession.toml`, and built-in defaults apply when
//! neither exists. The payload secret may come from the environment instead of
//! the file.

use anyhow::Context;
use kvsession_core::SessionConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable holding the payload secret.
pub const SECRET_ENV_VAR: &str = "KVSESSION_SECRET_KEY";
/// Environment variable naming the deployment environment.
pub const ENV_VAR: &str = "KVSESSION_ENV";
/// Environment used when none is given.
pub const DEFAULT_ENV: &str = "development";

#[derive(Debug, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}

/// Find the config file to load, relative to `base`.
pub fn locate(explicit: Option<&Path>, base: &Path, env: &str) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let dir = base.join("config");
    [
        dir.join("kvsession").join(format!("{env}.toml")),
        dir.join("kvsession.toml"),
    ]
    .into_iter()
    .find(|candidate| candidate.is_file())
}

/// Load and validate the configuration.
///
/// `secret_from_env` fills in `session.secret_key` when the file leaves it out.
pub async fn load(path: Option<&Path>, secret_from_env: Option<String>) -> anyhow::Result<AppConfig> {
    let mut config = match path {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
            toml::from_str::<AppConfig>(&raw)
                .with_context(|| format!("Invalid config file '{}'", path.display()))?
        }
        None => AppConfig::default(),
    };

    if config.session.secret_key.is_none() {
        config.session.secret_key = secret_from_env.filter(|secret| !secret.is_empty());
    }
    config.session.validate()?;
    Ok(config)
}
