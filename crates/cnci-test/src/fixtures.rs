//! Reusable fixtures for concentrator tests

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use ipnet::Ipv4Net;
use uuid::Uuid;

use cncid::concentrator::Concentrator;
use cncid::config::Config;
use cncid::types::Neighbor;

use crate::{FakeDhcp, FakeKernel};

/// Address carried by the fixture's compute interface.
pub const LOCAL_COMPUTE_ADDR: &str = "10.0.0.1";

/// Parses a subnet literal.
pub fn subnet(s: &str) -> Ipv4Net {
    s.parse().expect("valid subnet literal")
}

/// Parses an address literal.
pub fn ip(s: &str) -> Ipv4Addr {
    s.parse().expect("valid address literal")
}

/// Builds a neighbor entry.
pub fn neighbor(physical: &str, net: &str, tunnel: &str, tunnel_id: u32) -> Neighbor {
    Neighbor {
        physical_ip: ip(physical),
        subnet: subnet(net),
        tunnel_ip: ip(tunnel),
        tunnel_id,
    }
}

/// A configuration with no subnet restrictions and a short API timeout.
pub fn test_config() -> Config {
    Config {
        tenant_uuid: Uuid::new_v4(),
        concentrator_uuid: Uuid::new_v4(),
        management_subnets: Vec::new(),
        compute_subnets: Vec::new(),
        api_timeout_secs: Some(1),
        state_dir: PathBuf::from("/tmp/cncid-test"),
    }
}

/// A concentrator wired to fakes, with one addressed physical interface,
/// already initialized.
pub async fn ready_concentrator() -> (Arc<FakeKernel>, Arc<FakeDhcp>, Concentrator) {
    let kernel = Arc::new(FakeKernel::new());
    kernel.seed_physical("eth0", &[&format!("{}/24", LOCAL_COMPUTE_ADDR)]);

    let dhcp = Arc::new(FakeDhcp::new());
    let concentrator = Concentrator::new(test_config(), kernel.clone(), dhcp.clone());
    concentrator
        .init()
        .await
        .expect("fixture init cannot fail");

    (kernel, dhcp, concentrator)
}
