//! Alias encoding and kernel device-name generation
//!
//! Aliases are the durable identity of a device: they are written into the
//! kernel's ifalias attribute and parsed back out of it on rebuild, so the
//! encoding must be reversible and stable across restarts. Kernel names only
//! need to be unique on the local host and are generated fresh each time.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use rand::Rng;

use cnci_common::{CnciError, CnciResult};

use crate::types::{BRIDGE_ALIAS_PREFIX, GRETAP_ALIAS_PREFIX};

/// Maximum attempts before the name generator gives up.
const MAX_NAME_ATTEMPTS: usize = 10;

/// Kernel interface names are limited to IFNAMSIZ - 1 bytes.
const MAX_IFNAME_LEN: usize = 15;

/// Separator between the subnet and peer parts of a subnet-tunnel alias.
const GRETAP_ALIAS_SEP: &str = "##";

/// Renders a subnet for embedding in an alias: `a.b.c.d/n` -> `a.b.c.d+n`.
pub fn encode_subnet(subnet: &Ipv4Net) -> String {
    subnet.to_string().replace('/', "+")
}

/// Inverse of [`encode_subnet`].
pub fn decode_subnet(encoded: &str) -> Option<Ipv4Net> {
    encoded.replace('+', "/").parse().ok()
}

/// Alias of the bridge carrying a tenant subnet.
pub fn bridge_alias(subnet: &Ipv4Net) -> String {
    format!("{}{}", BRIDGE_ALIAS_PREFIX, encode_subnet(subnet))
}

/// Alias of the GRE tap stitching `subnet` to one remote compute node.
pub fn gretap_alias(subnet: &Ipv4Net, peer_ip: Ipv4Addr) -> String {
    format!(
        "{}{}{}{}",
        GRETAP_ALIAS_PREFIX,
        encode_subnet(subnet),
        GRETAP_ALIAS_SEP,
        peer_ip
    )
}

/// Extracts the subnet from a bridge alias, if it is one.
pub fn parse_bridge_alias(alias: &str) -> Option<Ipv4Net> {
    decode_subnet(alias.strip_prefix(BRIDGE_ALIAS_PREFIX)?)
}

/// Extracts `(subnet, peer_ip)` from a subnet-tunnel alias, if it is one.
pub fn parse_gretap_alias(alias: &str) -> Option<(Ipv4Net, Ipv4Addr)> {
    let body = alias.strip_prefix(GRETAP_ALIAS_PREFIX)?;
    let (subnet_part, peer_part) = body.split_once(GRETAP_ALIAS_SEP)?;
    let subnet = decode_subnet(subnet_part)?;
    let peer = peer_part.parse().ok()?;
    Some((subnet, peer))
}

/// Picks a kernel device name derived from `base` that is not yet reserved.
///
/// The base is truncated so that the suffixed candidate fits IFNAMSIZ.
/// Fails with [`CnciError::NameExhausted`] after a bounded number of
/// attempts, which only happens if the random space around `base` is
/// saturated.
pub fn pick_device_name(base: &str, reserved: &HashSet<String>) -> CnciResult<String> {
    let mut rng = rand::thread_rng();
    let stem: String = base.chars().take(MAX_IFNAME_LEN - 8).collect();

    for _ in 0..MAX_NAME_ATTEMPTS {
        let candidate = format!("{}{:08x}", stem, rng.gen::<u32>());
        if !reserved.contains(&candidate) {
            return Ok(candidate);
        }
    }

    Err(CnciError::NameExhausted {
        base: base.to_string(),
    })
}
