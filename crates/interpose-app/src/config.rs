//! Configuration loading.
//!
//! Defaults come from [`ProxyConfig::default`], a JSON file may replace any
//! subset of them, and command-line flags win over both.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use interpose_proxy::ProxyConfig;

/// Values given on the command line.
#[derive(Debug, Default)]
pub struct Overrides {
    pub listen: Option<SocketAddr>,
    pub ca: Option<PathBuf>,
    pub insecure: bool,
}

/// Loads the configuration file, or the defaults when `path` is `None`.
pub fn load(path: Option<&Path>) -> anyhow::Result<ProxyConfig> {
    let Some(path) = path else {
        return Ok(ProxyConfig::default());
    };

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config = serde_json::from_str(&contents)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    tracing::debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Applies command-line overrides and checks the result.
pub fn resolve(mut config: ProxyConfig, overrides: Overrides) -> anyhow::Result<ProxyConfig> {
    if let Some(listen) = overrides.listen {
        config.addr = listen;
    }
    if let Some(ca) = overrides.ca {
        config.ca_path = ca;
    }
    if overrides.insecure {
        config.dialer.insecure_skip_verify = true;
    }

    if config.backlog <= 0 {
        bail!("backlog must be positive, got {}", config.backlog);
    }
    if config.ca_name.trim().is_empty() {
        bail!("ca_name must not be empty");
    }
    if config.leaf_cache_capacity == 0 {
        bail!("leaf_cache_capacity must be positive");
    }
    Ok(config)
}
