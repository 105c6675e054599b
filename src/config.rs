//! TOML configuration of a ring node.
//!
//! Every section is optional. Missing values fall back to the constants in
//! [`crate::gval`].

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::chord_util::GeneralError;
use crate::gval;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address other nodes use to reach this one. Also the bind address.
    pub listen_ip: String,
    /// Listening port. `0` picks an ephemeral port; the node id is derived
    /// from the port actually bound.
    pub port: u16,
    /// `host:port` of a running node to join through. Absent starts a new ring.
    pub bootstrap: Option<String>,
    pub max_successors: usize,
    pub max_forward_hops: u8,
    pub rpc: RpcConfig,
    pub maintenance: MaintenanceConfig,
    pub log: LogConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_ip: "127.0.0.1".to_string(),
            port: 5000,
            bootstrap: None,
            max_successors: gval::MAX_SUCCESSORS,
            max_forward_hops: gval::MAX_FORWARD_HOPS,
            rpc: RpcConfig::default(),
            maintenance: MaintenanceConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// `[rpc]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Connect, read and write timeout of one attempt.
    pub timeout_ms: u64,
    /// Attempts per call before the peer is reported unreachable.
    pub retries: u32,
    /// Backoff before retry `n` is `base_delay_ms * 2^n`.
    pub base_delay_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: gval::RPC_TIMEOUT_MILLIS,
            retries: gval::RPC_RETRY_CNT_LIMIT,
            base_delay_ms: gval::RPC_RETRY_BASE_DELAY_MILLIS,
        }
    }
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    // a forwarded request waits for the whole chain of hops behind it
    pub fn response_timeout(&self) -> Duration {
        self.timeout() * 4
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << attempt.min(16)))
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.clamp(1, gval::PING_TIMEOUT_MILLIS))
    }
}

/// `[maintenance]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub stabilize_interval_ms: u64,
    pub fix_fingers_interval_ms: u64,
    pub update_successors_interval_ms: u64,
    /// Attempts of one cycle that fails on an unreachable peer.
    pub cycle_retries: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            stabilize_interval_ms: gval::STABILIZE_INTERVAL_MILLIS,
            fix_fingers_interval_ms: gval::FIX_FINGERS_INTERVAL_MILLIS,
            update_successors_interval_ms: gval::UPDATE_SUCCESSORS_INTERVAL_MILLIS,
            cycle_retries: gval::MAINTENANCE_CYCLE_RETRY_CNT,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter (e.g. `"info"`, `"debug"`). `RUST_LOG` wins if set.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load config from a TOML file, or the defaults if no path given.
    pub fn load(path: Option<&Path>) -> Result<Self, GeneralError> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                Self::from_toml(&content)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(s: &str) -> Result<Self, GeneralError> {
        let config: NodeConfig =
            toml::from_str(s).map_err(|e| GeneralError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GeneralError> {
        if self.listen_ip.is_empty() {
            return Err(GeneralError::Config("listen_ip must not be empty".to_string()));
        }
        if self.max_successors == 0 {
            return Err(GeneralError::Config("max_successors must be at least 1".to_string()));
        }
        // a request carries its hop count in a u8 and must be able to exceed the limit
        if self.max_forward_hops == u8::MAX {
            return Err(GeneralError::Config(format!(
                "max_forward_hops must be below {}",
                u8::MAX
            )));
        }
        if let Some(bootstrap) = &self.bootstrap {
            parse_host_port(bootstrap)?;
        }
        Ok(())
    }
}

/// Splits `"host:port"`.
pub fn parse_host_port(addr: &str) -> Result<(String, u16), GeneralError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| GeneralError::Config(format!("expected host:port, got {:?}", addr)))?;
    if host.is_empty() {
        return Err(GeneralError::Config(format!("missing host in {:?}", addr)));
    }
    let port = port
        .parse::<u16>()
        .map_err(|e| GeneralError::Config(format!("bad port in {:?}: {}", addr, e)))?;
    Ok((host.to_string(), port))
}
