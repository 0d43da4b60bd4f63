//! Core type definitions and constants for the concentrator

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Kernel name of the point-to-multipoint GRE tunnel reaching peer
/// concentrators. A single instance exists per process, so it carries no
/// alias.
pub const PEER_TUNNEL_NAME: &str = "cncitun";

/// Prefix length of the address carried by the peer tunnel.
pub const PEER_TUNNEL_PREFIX_LEN: u8 = 18;

/// Alias prefix for tenant subnet bridges.
pub const BRIDGE_ALIAS_PREFIX: &str = "br_";

/// Alias prefix for subnet GRE tunnels.
pub const GRETAP_ALIAS_PREFIX: &str = "gre_";

/// Base kernel name for generated bridge devices.
pub const BRIDGE_NAME_BASE: &str = "cncibr";

/// Base kernel name for generated subnet tunnel devices.
pub const GRETAP_NAME_BASE: &str = "cncigt";

/// Kind of kernel link, as reported by link enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// An L2 bridge.
    Bridge,
    /// An L2-over-GRE tap device.
    GreTap,
    /// An L3 GRE tunnel.
    GreTun,
    /// A tap device handed to an instance.
    Vnic,
    /// A physical interface with no `info_kind`.
    Physical,
    /// The loopback device.
    Loopback,
    /// Anything else (veth, dummy, ...).
    Other,
}

impl LinkKind {
    /// Maps the kernel's `info_kind` / `link_type` strings onto a kind.
    pub fn from_kernel(info_kind: Option<&str>, link_type: Option<&str>) -> Self {
        match info_kind {
            Some("bridge") => LinkKind::Bridge,
            Some("gretap") => LinkKind::GreTap,
            Some("gre") => LinkKind::GreTun,
            Some("tun") => LinkKind::Vnic,
            Some(_) => LinkKind::Other,
            None => {
                if link_type == Some("loopback") {
                    LinkKind::Loopback
                } else {
                    LinkKind::Physical
                }
            }
        }
    }
}

/// A peer concentrator as reported by the controller.
///
/// The local concentrator recognises itself by matching `physical_ip`
/// against its own primary compute address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    /// Address of the peer on the physical compute network.
    pub physical_ip: Ipv4Addr,
    /// The tenant subnet the peer concentrates.
    pub subnet: Ipv4Net,
    /// The peer's address inside the tunnel overlay.
    pub tunnel_ip: Ipv4Addr,
    /// GRE key identifying the tenant on the peer tunnel.
    pub tunnel_id: u32,
}

/// A physical interface discovered at init, with its IPv4 addresses.
#[derive(Debug, Clone)]
pub struct PhysicalInterface {
    /// Kernel device name.
    pub name: String,
    /// Kernel interface index.
    pub index: u32,
    /// IPv4 addresses configured on the device.
    pub addrs: Vec<Ipv4Net>,
}
