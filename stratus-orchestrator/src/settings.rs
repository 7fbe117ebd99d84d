use anyhow::Context;
use std::net::SocketAddr;
use std::time::Duration;
use stratus_providers::retry::DEFAULT_MAX_RETRIES;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8001";
const DEFAULT_PROVIDER: &str = "mock";

/// Orchestrator configuration, read from the environment (and `.env`).
///
/// - ORCHESTRATOR_BIND_ADDR: HTTP listen address (default 0.0.0.0:8001)
/// - PROVIDER: control-plane provider (default "mock")
/// - CONTROL_PLANE_MAX_RETRIES: retry budget per control-plane call (default 3)
/// - PROVISION_TIMEOUT_SECS: deadline per provisioning request (unset/0 = none)
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    pub provider: String,
    pub max_retries: u32,
    pub provision_timeout: Option<Duration>,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let bind_addr = var("ORCHESTRATOR_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse::<SocketAddr>()
            .context("ORCHESTRATOR_BIND_ADDR must be a socket address")?;
        let provider = var("PROVIDER")
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_string())
            .to_lowercase();
        let max_retries = match var("CONTROL_PLANE_MAX_RETRIES") {
            Some(v) => v
                .parse::<u32>()
                .context("CONTROL_PLANE_MAX_RETRIES must be a non-negative integer")?,
            None => DEFAULT_MAX_RETRIES,
        };
        let provision_timeout = match var("PROVISION_TIMEOUT_SECS") {
            Some(v) => {
                let secs = v
                    .parse::<u64>()
                    .context("PROVISION_TIMEOUT_SECS must be a number of seconds")?;
                Some(Duration::from_secs(secs)).filter(|d| !d.is_zero())
            }
            None => None,
        };

        Ok(Self {
            bind_addr,
            provider,
            max_retries,
            provision_timeout,
        })
    }
}
