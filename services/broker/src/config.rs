use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;
use wharf_broker::SessionConfig;
use wharf_common::DomainConfig;
use wharf_consensus::ClusterConfig;

// Broker service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Admin command HTTP listener bind address.
    pub admin_bind: SocketAddr,
    // Cluster identity and partition count.
    pub cluster: ClusterConfig,
    // Domains registered at startup.
    pub domains: Vec<DomainConfig>,
    // Deadline for an Open to be answered by the authority.
    pub open_timeout_ms: u64,
    // Deadline for a Configure to be answered by the authority.
    pub configure_timeout_ms: u64,
    // Deadline for a Close to be answered by the authority.
    pub close_timeout_ms: u64,
    // Delay between reopen attempts rejected with a retryable error.
    pub reopen_retry_interval_ms: u64,
    // Reopen attempts before a parked handle is left alone.
    pub reopen_max_attempts: u32,
}

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_REOPEN_RETRY_INTERVAL_MS: u64 = 1_000;
const DEFAULT_REOPEN_MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Deserialize)]
struct BrokerConfigOverride {
    metrics_bind: Option<String>,
    admin_bind: Option<String>,
    cluster_id: Option<String>,
    node_id: Option<String>,
    partitions: Option<u32>,
    domains: Option<Vec<DomainConfig>>,
    open_timeout_ms: Option<u64>,
    configure_timeout_ms: Option<u64>,
    close_timeout_ms: Option<u64>,
    reopen_retry_interval_ms: Option<u64>,
    reopen_max_attempts: Option<u32>,
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        let metrics_bind = std::env::var("WHARF_BROKER_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse WHARF_BROKER_METRICS_BIND")?;
        let admin_bind = std::env::var("WHARF_ADMIN_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8081".to_string())
            .parse()
            .with_context(|| "parse WHARF_ADMIN_BIND")?;
        let mut cluster = ClusterConfig::default();
        if let Ok(value) = std::env::var("WHARF_CLUSTER_ID") {
            cluster.cluster_id = value;
        }
        if let Ok(value) = std::env::var("WHARF_NODE_ID") {
            cluster.node_id = value;
        }
        if let Some(value) = std::env::var("WHARF_PARTITIONS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
        {
            cluster.partitions = value;
        }
        let reopen_max_attempts = std::env::var("WHARF_REOPEN_MAX_ATTEMPTS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(DEFAULT_REOPEN_MAX_ATTEMPTS);
        Ok(Self {
            metrics_bind,
            admin_bind,
            cluster,
            domains: Vec::new(),
            open_timeout_ms: env_u64("WHARF_OPEN_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS),
            configure_timeout_ms: env_u64(
                "WHARF_CONFIGURE_TIMEOUT_MS",
                DEFAULT_REQUEST_TIMEOUT_MS,
            ),
            close_timeout_ms: env_u64("WHARF_CLOSE_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS),
            reopen_retry_interval_ms: env_u64(
                "WHARF_REOPEN_RETRY_INTERVAL_MS",
                DEFAULT_REOPEN_RETRY_INTERVAL_MS,
            ),
            reopen_max_attempts,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("WHARF_BROKER_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read WHARF_BROKER_CONFIG: {path}"))?;
            let override_cfg: BrokerConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse broker config yaml")?;
            config.apply(override_cfg)?;
        }
        Ok(config)
    }

    fn apply(&mut self, override_cfg: BrokerConfigOverride) -> Result<()> {
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.admin_bind {
            self.admin_bind = value.parse().with_context(|| "parse admin_bind")?;
        }
        if let Some(value) = override_cfg.cluster_id {
            self.cluster.cluster_id = value;
        }
        if let Some(value) = override_cfg.node_id {
            self.cluster.node_id = value;
        }
        if let Some(value) = override_cfg.partitions
            && value > 0
        {
            self.cluster.partitions = value;
        }
        if let Some(domains) = override_cfg.domains {
            let mut seen = std::collections::HashSet::new();
            for domain in &domains {
                if !seen.insert(domain.name.as_str()) {
                    bail!("domain '{}' configured twice", domain.name);
                }
            }
            self.domains = domains;
        }
        if let Some(value) = override_cfg.open_timeout_ms
            && value > 0
        {
            self.open_timeout_ms = value;
        }
        if let Some(value) = override_cfg.configure_timeout_ms
            && value > 0
        {
            self.configure_timeout_ms = value;
        }
        if let Some(value) = override_cfg.close_timeout_ms
            && value > 0
        {
            self.close_timeout_ms = value;
        }
        if let Some(value) = override_cfg.reopen_retry_interval_ms
            && value > 0
        {
            self.reopen_retry_interval_ms = value;
        }
        if let Some(value) = override_cfg.reopen_max_attempts {
            self.reopen_max_attempts = value;
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            open_timeout: Duration::from_millis(self.open_timeout_ms),
            configure_timeout: Duration::from_millis(self.configure_timeout_ms),
            close_timeout: Duration::from_millis(self.close_timeout_ms),
            reopen_retry_interval: Duration::from_millis(self.reopen_retry_interval_ms),
            reopen_max_attempts: self.reopen_max_attempts,
        }
    }
}
