//! Daemon configuration
//!
//! Loaded once at startup from a YAML file. The subnet sets decide how
//! physical interface addresses are classified at init; an empty set means
//! every address qualifies for that category.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::Deserialize;
use uuid::Uuid;

use cnci_common::{CnciError, CnciResult};

/// Default bound on waiting for a device reservation to become ready.
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(6);

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/cncid")
}

/// Startup configuration for one concentrator.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// The tenant this concentrator serves.
    pub tenant_uuid: Uuid,
    /// Identity of this concentrator instance.
    pub concentrator_uuid: Uuid,
    /// Subnets whose addresses mark an interface as management.
    #[serde(default)]
    pub management_subnets: Vec<Ipv4Net>,
    /// Subnets whose addresses mark an interface as compute.
    #[serde(default)]
    pub compute_subnets: Vec<Ipv4Net>,
    /// Override for the readiness wait bound, in seconds.
    #[serde(default)]
    pub api_timeout_secs: Option<u64>,
    /// Directory for DHCP runtime files.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Config {
    /// Loads and parses the YAML configuration file.
    pub fn from_yaml_file(path: &Path) -> CnciResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CnciError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parses YAML configuration text.
    pub fn from_yaml(raw: &str) -> CnciResult<Self> {
        serde_yaml::from_str(raw).map_err(|e| CnciError::config(e.to_string()))
    }

    /// The readiness wait bound, defaulting to six seconds.
    pub fn api_timeout(&self) -> Duration {
        self.api_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_API_TIMEOUT)
    }
}
