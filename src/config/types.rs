use serde::{Deserialize, Serialize};

/// LB-side configuration — interfaces, ports, and node-health policy.
/// Field names mirror `private_interface.*` / `public_interface.*` /
/// `node_health.*` exactly so config files round-trip through CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbConfig {
    #[serde(default)]
    pub private_interface: PrivateInterfaceConfig,

    #[serde(default)]
    pub public_interface: PublicInterfaceConfig,

    #[serde(default)]
    pub node_health: NodeHealthConfig,
}

impl Default for LbConfig {
    fn default() -> Self {
        Self {
            private_interface: PrivateInterfaceConfig::default(),
            public_interface: PublicInterfaceConfig::default(),
            node_health: NodeHealthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateInterfaceConfig {
    /// Port the control server (`LBNodeManager`) listens on.
    #[serde(default = "default_node_port")]
    pub node_port: u16,

    /// Port the introspection HTTP API listens on.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Network interface facing the backend fleet, used for ARP resolution
    /// and optionally to bind the control server. Empty means "any".
    #[serde(default)]
    pub net_interface_private: String,
}

impl Default for PrivateInterfaceConfig {
    fn default() -> Self {
        Self {
            node_port: default_node_port(),
            api_port: default_api_port(),
            net_interface_private: String::new(),
        }
    }
}

fn default_node_port() -> u16 {
    7070
}

fn default_api_port() -> u16 {
    5555
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicInterfaceConfig {
    /// Port clients connect to (consumed by the out-of-scope forwarding
    /// fast-path; recorded here only so config round-trips).
    #[serde(default = "default_clients_port")]
    pub clients_port: u16,

    /// Network interface facing clients. Empty means "any".
    #[serde(default)]
    pub net_interface_public: String,
}

impl Default for PublicInterfaceConfig {
    fn default() -> Self {
        Self {
            clients_port: default_clients_port(),
            net_interface_public: String::new(),
        }
    }
}

fn default_clients_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHealthConfig {
    #[serde(default = "default_checks_before_routing")]
    pub checks_before_routing: u32,

    /// Serialized with `humantime` syntax ("10s", "1m"); minimum enforced at
    /// validation time is 1s.
    #[serde(default = "default_checks_timeout")]
    pub checks_timeout: String,

    /// Negative disables blacklisting entirely.
    #[serde(default = "default_black_list_after_fails")]
    pub black_list_after_fails: i64,

    #[serde(default = "default_black_list_expiry")]
    pub black_list_expiry: String,
}

impl Default for NodeHealthConfig {
    fn default() -> Self {
        Self {
            checks_before_routing: default_checks_before_routing(),
            checks_timeout: default_checks_timeout(),
            black_list_after_fails: default_black_list_after_fails(),
            black_list_expiry: default_black_list_expiry(),
        }
    }
}

fn default_checks_before_routing() -> u32 {
    3
}

fn default_checks_timeout() -> String {
    "10s".to_string()
}

fn default_black_list_after_fails() -> i64 {
    -1
}

fn default_black_list_expiry() -> String {
    "60s".to_string()
}

impl NodeHealthConfig {
    pub fn checks_timeout_duration(&self) -> anyhow::Result<std::time::Duration> {
        let d: std::time::Duration = self.checks_timeout.parse::<humantime::Duration>()?.into();
        Ok(d)
    }

    pub fn black_list_expiry_duration(&self) -> anyhow::Result<std::time::Duration> {
        let d: std::time::Duration = self.black_list_expiry.parse::<humantime::Duration>()?.into();
        Ok(d)
    }
}

// ---------------------------------------------------------------------------
// Node-side configuration.
// ---------------------------------------------------------------------------

/// Backend-agent configuration: the LB targets this node dials into.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub load_balancer: LoadBalancerTargets,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBalancerTargets {
    #[serde(default)]
    pub addresses: Vec<LbAddress>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbAddress {
    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub ip: Option<String>,

    pub port: u16,
}

impl LbAddress {
    /// The string a tonic client dials: `hostname:port` if set, else `ip:port`.
    pub fn dial_target(&self) -> anyhow::Result<String> {
        let host = self
            .hostname
            .clone()
            .or_else(|| self.ip.clone())
            .ok_or_else(|| anyhow::anyhow!("load_balancer address requires hostname or ip"))?;
        Ok(format!("http://{host}:{port}", port = self.port))
    }
}

// ---------------------------------------------------------------------------
// CLI flag overrides — every config key is also bindable as a `--flag`
// (spec §6). Each field is `None` unless the operator passed the flag, so
// applying these never clobbers a value only set in the config file or env.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct LbCliOverrides {
    pub node_port: Option<u16>,
    pub api_port: Option<u16>,
    pub net_interface_private: Option<String>,
    pub clients_port: Option<u16>,
    pub net_interface_public: Option<String>,
    pub checks_before_routing: Option<u32>,
    pub checks_timeout: Option<String>,
    pub black_list_after_fails: Option<i64>,
    pub black_list_expiry: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeCliOverrides {
    /// Comma-separated `host:port` pairs, same syntax as `GALE_NODE_LB_ADDRESSES`.
    pub load_balancer_addresses: Option<String>,
}
