pub mod types;

pub use types::*;

use anyhow::Result;
use std::path::Path;

fn load_from_file<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(toml::from_str(&content)?),
            Some("json") => Ok(serde_json::from_str(&content)?),
            Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
            None => anyhow::bail!("config file has no extension, use .toml or .json"),
        }
    } else {
        tracing::info!(
            "config file not found at {}, using defaults",
            path.display()
        );
        Ok(T::default())
    }
}

impl LbConfig {
    pub fn load(path: &Path, cli: &LbCliOverrides) -> Result<Self> {
        let mut config: LbConfig = load_from_file(path)?;
        config.apply_env_overrides();
        config.apply_cli_overrides(cli);
        config.validate()?;
        tracing::info!("loaded LB configuration");
        Ok(config)
    }

    fn apply_cli_overrides(&mut self, cli: &LbCliOverrides) {
        if let Some(v) = cli.node_port {
            self.private_interface.node_port = v;
        }
        if let Some(v) = cli.api_port {
            self.private_interface.api_port = v;
        }
        if let Some(ref v) = cli.net_interface_private {
            self.private_interface.net_interface_private = v.clone();
        }
        if let Some(v) = cli.clients_port {
            self.public_interface.clients_port = v;
        }
        if let Some(ref v) = cli.net_interface_public {
            self.public_interface.net_interface_public = v.clone();
        }
        if let Some(v) = cli.checks_before_routing {
            self.node_health.checks_before_routing = v;
        }
        if let Some(ref v) = cli.checks_timeout {
            self.node_health.checks_timeout = v.clone();
        }
        if let Some(v) = cli.black_list_after_fails {
            self.node_health.black_list_after_fails = v;
        }
        if let Some(ref v) = cli.black_list_expiry {
            self.node_health.black_list_expiry = v.clone();
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GALE_LB_NODE_PORT") {
            if let Ok(n) = v.parse() {
                self.private_interface.node_port = n;
            }
        }
        if let Ok(v) = std::env::var("GALE_LB_API_PORT") {
            if let Ok(n) = v.parse() {
                self.private_interface.api_port = n;
            }
        }
        if let Ok(v) = std::env::var("GALE_LB_NET_INTERFACE_PRIVATE") {
            self.private_interface.net_interface_private = v;
        }
        if let Ok(v) = std::env::var("GALE_LB_CLIENTS_PORT") {
            if let Ok(n) = v.parse() {
                self.public_interface.clients_port = n;
            }
        }
        if let Ok(v) = std::env::var("GALE_LB_NET_INTERFACE_PUBLIC") {
            self.public_interface.net_interface_public = v;
        }
        if let Ok(v) = std::env::var("GALE_LB_CHECKS_BEFORE_ROUTING") {
            if let Ok(n) = v.parse() {
                self.node_health.checks_before_routing = n;
            }
        }
        if let Ok(v) = std::env::var("GALE_LB_CHECKS_TIMEOUT") {
            self.node_health.checks_timeout = v;
        }
        if let Ok(v) = std::env::var("GALE_LB_BLACK_LIST_AFTER_FAILS") {
            if let Ok(n) = v.parse() {
                self.node_health.black_list_after_fails = n;
            }
        }
        if let Ok(v) = std::env::var("GALE_LB_BLACK_LIST_EXPIRY") {
            self.node_health.black_list_expiry = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let timeout = self.node_health.checks_timeout_duration()?;
        if timeout < std::time::Duration::from_secs(1) {
            return Err(crate::error::GaleError::Configuration(
                "node_health.checks_timeout must be at least 1s".to_string(),
            )
            .into());
        }
        self.node_health.black_list_expiry_duration()?;
        if self.node_health.checks_before_routing == 0 {
            return Err(crate::error::GaleError::Configuration(
                "node_health.checks_before_routing must be at least 1".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

impl NodeConfig {
    pub fn load(path: &Path, cli: &NodeCliOverrides) -> Result<Self> {
        let mut config: NodeConfig = load_from_file(path)?;
        config.apply_env_overrides();
        if let Some(ref v) = cli.load_balancer_addresses {
            if let Some(addresses) = parse_lb_addresses(v) {
                config.load_balancer.addresses = addresses;
            }
        }
        config.validate()?;
        tracing::info!("loaded node configuration");
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GALE_NODE_LB_ADDRESSES") {
            if let Some(addresses) = parse_lb_addresses(&v) {
                self.load_balancer.addresses = addresses;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.load_balancer.addresses.is_empty() {
            return Err(crate::error::GaleError::Configuration(
                "node config requires at least one load_balancer address".to_string(),
            )
            .into());
        }
        for addr in &self.load_balancer.addresses {
            if addr.hostname.is_none() && addr.ip.is_none() {
                return Err(crate::error::GaleError::Configuration(
                    "load_balancer address requires hostname or ip".to_string(),
                )
                .into());
            }
        }
        Ok(())
    }
}

/// Parses comma-separated `host:port` pairs, e.g. "lb1:7070,lb2:7070".
fn parse_lb_addresses(raw: &str) -> Option<Vec<LbAddress>> {
    let addresses: Vec<LbAddress> = raw
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|entry| {
            let (host, port) = entry.trim().rsplit_once(':')?;
            let port: u16 = port.parse().ok()?;
            Some(LbAddress {
                hostname: Some(host.to_string()),
                ip: None,
                port,
            })
        })
        .collect();
    if addresses.is_empty() {
        None
    } else {
        Some(addresses)
    }
}
