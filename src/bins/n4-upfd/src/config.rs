//! UPF Configuration
//!
//! YAML configuration of the N4 daemon. Every section has defaults so a
//! partial file, or no file at all, yields a runnable configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "/etc/n4-upfd/upf.yaml";

/// Default TEID pool size
pub const DEFAULT_TEID_POOL_SIZE: u32 = 65_535;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
}

/// PFCP (N4) endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PfcpConf {
    pub address: IpAddr,
    pub port: u16,
    /// Node ID announced to the SMF; IPv4, IPv6 or FQDN.
    /// Falls back to `address` when unset.
    pub node_id: Option<String>,
}

impl Default for PfcpConf {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 7)),
            port: n4_pfcp::PFCP_UDP_PORT,
            node_id: None,
        }
    }
}

/// N3 (GTP-U) interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct N3Conf {
    pub address: Ipv4Addr,
    /// Address handed to the SMF in F-TEIDs and resource information,
    /// for deployments behind NAT. Defaults to `address`.
    pub advertised_address: Option<Ipv4Addr>,
}

impl Default for N3Conf {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::new(127, 0, 0, 7),
            advertised_address: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConf {
    pub interval_secs: u64,
    pub max_missed: u32,
}

impl Default for HeartbeatConf {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            max_missed: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConf {
    pub level: String,
}

impl Default for LoggingConf {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpfConfig {
    pub pfcp: PfcpConf,
    pub n3: N3Conf,
    pub teid_pool_size: u32,
    pub heartbeat: HeartbeatConf,
    /// Period of usage reports; 0 disables them
    pub usage_report_interval_secs: u64,
    pub logging: LoggingConf,
}

impl Default for UpfConfig {
    fn default() -> Self {
        Self {
            pfcp: PfcpConf::default(),
            n3: N3Conf::default(),
            teid_pool_size: DEFAULT_TEID_POOL_SIZE,
            heartbeat: HeartbeatConf::default(),
            usage_report_interval_secs: 0,
            logging: LoggingConf::default(),
        }
    }
}

impl UpfConfig {
    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path`; a missing file yields the defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_yaml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No configuration at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::ParseError(format!(
                "{}: {e}",
                path.display()
            ))),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.teid_pool_size == 0 || self.teid_pool_size == u32::MAX {
            return Err(ConfigError::ValidationError(format!(
                "`teid_pool_size` must be in [1, {}]",
                u32::MAX - 1
            )));
        }
        if self.heartbeat.interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "`heartbeat.interval_secs` must be positive".to_string(),
            ));
        }
        if self.heartbeat.max_missed == 0 {
            return Err(ConfigError::ValidationError(
                "`heartbeat.max_missed` must be positive".to_string(),
            ));
        }
        if matches!(self.pfcp.node_id.as_deref(), Some("")) {
            return Err(ConfigError::ValidationError(
                "`pfcp.node_id` must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Node ID string announced to the SMF
    pub fn node_id(&self) -> String {
        self.pfcp
            .node_id
            .clone()
            .unwrap_or_else(|| self.pfcp.address.to_string())
    }

    /// N3 address placed in F-TEIDs handed to the SMF
    pub fn advertised_n3_address(&self) -> Ipv4Addr {
        self.n3.advertised_address.unwrap_or(self.n3.address)
    }
}
