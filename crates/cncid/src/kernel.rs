//! Kernel adapter: the seam between the topology core and the host
//!
//! Everything the concentrator does to the host network stack goes through
//! the [`NetKernel`] trait. The production implementation, [`ShellKernel`],
//! drives `ip(8)` and parses its JSON output; the test harness substitutes
//! an in-memory fake.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::Deserialize;

use cnci_common::{shell, CnciError, CnciResult};

use crate::commands;
use crate::types::LinkKind;

/// One kernel link as seen by enumeration.
#[derive(Debug, Clone)]
pub struct KernelLink {
    /// Kernel device name.
    pub name: String,
    /// The ifalias attribute, empty when unset.
    pub alias: String,
    /// Device kind.
    pub kind: LinkKind,
    /// Kernel interface index.
    pub index: u32,
}

/// One neighbor-table entry on a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelNeighbor {
    /// Destination address inside the overlay.
    pub dst: Ipv4Addr,
    /// Link-layer address; on GRE devices this is the peer's IPv4 endpoint.
    pub lladdr: Option<Ipv4Addr>,
    /// True when the entry is in state PERMANENT.
    pub permanent: bool,
}

/// One IPv4 route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRoute {
    /// Destination prefix; host routes carry /32.
    pub dst: Ipv4Net,
    /// Gateway, if any.
    pub via: Option<Ipv4Addr>,
    /// Output device, if any.
    pub dev: Option<String>,
}

/// Host network operations consumed by the topology core.
#[async_trait]
pub trait NetKernel: Send + Sync {
    /// Enumerates all links with their alias, kind and index.
    async fn link_list(&self) -> CnciResult<Vec<KernelLink>>;

    /// Looks up a single link by kernel name.
    async fn link_by_name(&self, name: &str) -> CnciResult<Option<KernelLink>>;

    /// Looks up a single link by its alias attribute.
    async fn link_by_alias(&self, alias: &str) -> CnciResult<Option<KernelLink>> {
        let links = self.link_list().await?;
        Ok(links.into_iter().find(|l| l.alias == alias))
    }

    /// Creates an L2 bridge and records its alias.
    async fn bridge_create(&self, name: &str, alias: &str) -> CnciResult<()>;

    /// Creates an L2-over-GRE tap keyed by the subnet identifier and records
    /// its alias.
    async fn gretap_create(
        &self,
        name: &str,
        alias: &str,
        local: Ipv4Addr,
        remote: Ipv4Addr,
        key: u32,
    ) -> CnciResult<()>;

    /// Creates the point-to-multipoint L3 GRE tunnel. No alias: a single
    /// instance exists per process.
    async fn gretun_create(&self, name: &str, local: Ipv4Addr, key: u32) -> CnciResult<()>;

    /// Creates a generic tap device and records its alias.
    async fn tap_create(&self, name: &str, alias: &str) -> CnciResult<()>;

    /// Brings a link up.
    async fn link_enable(&self, name: &str) -> CnciResult<()>;

    /// Attaches a link to a bridge.
    async fn link_attach(&self, name: &str, master: &str) -> CnciResult<()>;

    /// Deletes a link.
    async fn link_destroy(&self, name: &str) -> CnciResult<()>;

    /// Lists the IPv4 addresses on a link.
    async fn addr_list(&self, name: &str) -> CnciResult<Vec<Ipv4Net>>;

    /// Adds an IPv4 address to a link.
    async fn addr_add(&self, name: &str, addr: &Ipv4Net) -> CnciResult<()>;

    /// Removes an IPv4 address from a link.
    async fn addr_del(&self, name: &str, addr: &Ipv4Net) -> CnciResult<()>;

    /// Lists the neighbor table of a link.
    async fn neigh_list(&self, name: &str) -> CnciResult<Vec<KernelNeighbor>>;

    /// Installs a PERMANENT neighbor entry. Replaces an existing entry for
    /// the same destination.
    async fn neigh_add(&self, name: &str, dst: Ipv4Addr, lladdr: Ipv4Addr) -> CnciResult<()>;

    /// Removes a neighbor entry.
    async fn neigh_del(&self, name: &str, dst: Ipv4Addr) -> CnciResult<()>;

    /// Lists the IPv4 routing table.
    async fn route_list(&self) -> CnciResult<Vec<KernelRoute>>;

    /// Installs or replaces a device route.
    async fn route_add_dev(&self, dst: &Ipv4Net, dev: &str) -> CnciResult<()>;

    /// Installs or replaces a gateway route.
    async fn route_add_via(&self, dst: &Ipv4Net, via: Ipv4Addr) -> CnciResult<()>;

    /// Removes a route.
    async fn route_del(&self, dst: &Ipv4Net) -> CnciResult<()>;

    /// Enables host IPv4 forwarding. May be a no-op on pre-configured hosts.
    async fn enable_forwarding(&self) -> CnciResult<()>;

    /// Whether a link is a physical interface eligible for management or
    /// compute classification.
    fn link_is_physical(&self, link: &KernelLink) -> bool {
        matches!(link.kind, LinkKind::Physical)
    }
}

// ---------------------------------------------------------------------------
// JSON records produced by `ip -json`
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct JsonLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    ifalias: Option<String>,
    #[serde(default)]
    link_type: Option<String>,
    #[serde(default)]
    linkinfo: Option<JsonLinkInfo>,
}

#[derive(Debug, Deserialize)]
struct JsonLinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonAddrEntry {
    #[serde(default)]
    addr_info: Vec<JsonAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct JsonAddrInfo {
    family: String,
    local: String,
    prefixlen: u8,
}

#[derive(Debug, Deserialize)]
struct JsonNeigh {
    dst: String,
    #[serde(default)]
    lladdr: Option<String>,
    #[serde(default)]
    state: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct JsonRoute {
    dst: String,
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    dev: Option<String>,
}

fn parse_json<'a, T: Deserialize<'a>>(context: &str, raw: &'a str) -> CnciResult<T> {
    serde_json::from_str(raw)
        .map_err(|e| CnciError::kernel(context, "-", format!("unparseable ip output: {}", e)))
}

fn parse_links(raw: &str) -> CnciResult<Vec<KernelLink>> {
    let entries: Vec<JsonLink> = parse_json("link list", raw)?;
    Ok(entries
        .into_iter()
        .map(|l| KernelLink {
            kind: LinkKind::from_kernel(
                l.linkinfo.as_ref().and_then(|i| i.info_kind.as_deref()),
                l.link_type.as_deref(),
            ),
            name: l.ifname,
            alias: l.ifalias.unwrap_or_default(),
            index: l.ifindex,
        })
        .collect())
}

fn parse_addrs(raw: &str) -> CnciResult<Vec<Ipv4Net>> {
    let entries: Vec<JsonAddrEntry> = parse_json("addr list", raw)?;
    let mut addrs = Vec::new();
    for entry in entries {
        for info in entry.addr_info {
            if info.family != "inet" {
                continue;
            }
            if let Ok(local) = info.local.parse::<Ipv4Addr>() {
                if let Ok(net) = Ipv4Net::new(local, info.prefixlen) {
                    addrs.push(net);
                }
            }
        }
    }
    Ok(addrs)
}

fn parse_neighbors(raw: &str) -> CnciResult<Vec<KernelNeighbor>> {
    let entries: Vec<JsonNeigh> = parse_json("neigh list", raw)?;
    Ok(entries
        .into_iter()
        .filter_map(|n| {
            let dst = n.dst.parse().ok()?;
            Some(KernelNeighbor {
                dst,
                lladdr: n.lladdr.and_then(|l| l.parse().ok()),
                permanent: n.state.iter().any(|s| s == "PERMANENT"),
            })
        })
        .collect())
}

fn parse_routes(raw: &str) -> CnciResult<Vec<KernelRoute>> {
    let entries: Vec<JsonRoute> = parse_json("route list", raw)?;
    Ok(entries
        .into_iter()
        .filter_map(|r| {
            let dst = if r.dst == "default" {
                "0.0.0.0/0".parse().ok()?
            } else if r.dst.contains('/') {
                r.dst.parse().ok()?
            } else {
                // Host route rendered without a prefix length.
                Ipv4Net::new(r.dst.parse().ok()?, 32).ok()?
            };
            Some(KernelRoute {
                dst,
                via: r.gateway.and_then(|g| g.parse().ok()),
                dev: r.dev,
            })
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Production implementation
// ---------------------------------------------------------------------------

/// [`NetKernel`] implementation over `ip(8)` and `sysctl(8)`.
#[derive(Debug, Default)]
pub struct ShellKernel;

impl ShellKernel {
    /// Creates a new shell-backed kernel adapter.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NetKernel for ShellKernel {
    async fn link_list(&self) -> CnciResult<Vec<KernelLink>> {
        let raw = shell::exec_or_throw(&commands::build_link_list_cmd()).await?;
        parse_links(&raw)
    }

    async fn link_by_name(&self, name: &str) -> CnciResult<Option<KernelLink>> {
        match shell::exec_or_throw(&commands::build_link_show_cmd(name)).await {
            Ok(raw) => Ok(parse_links(&raw)?.into_iter().next()),
            // `ip link show dev X` exits non-zero when the device is absent.
            Err(CnciError::ShellCommandFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn bridge_create(&self, name: &str, alias: &str) -> CnciResult<()> {
        shell::exec_or_throw(&commands::build_add_bridge_cmd(name)).await?;
        shell::exec_or_throw(&commands::build_set_alias_cmd(name, alias)).await?;
        Ok(())
    }

    async fn gretap_create(
        &self,
        name: &str,
        alias: &str,
        local: Ipv4Addr,
        remote: Ipv4Addr,
        key: u32,
    ) -> CnciResult<()> {
        shell::exec_or_throw(&commands::build_add_gretap_cmd(name, local, remote, key)).await?;
        shell::exec_or_throw(&commands::build_set_alias_cmd(name, alias)).await?;
        Ok(())
    }

    async fn gretun_create(&self, name: &str, local: Ipv4Addr, key: u32) -> CnciResult<()> {
        shell::exec_or_throw(&commands::build_add_gretun_cmd(name, local, key)).await?;
        Ok(())
    }

    async fn tap_create(&self, name: &str, alias: &str) -> CnciResult<()> {
        shell::exec_or_throw(&commands::build_add_tap_cmd(name)).await?;
        shell::exec_or_throw(&commands::build_set_alias_cmd(name, alias)).await?;
        Ok(())
    }

    async fn link_enable(&self, name: &str) -> CnciResult<()> {
        shell::exec_or_throw(&commands::build_link_up_cmd(name)).await?;
        Ok(())
    }

    async fn link_attach(&self, name: &str, master: &str) -> CnciResult<()> {
        shell::exec_or_throw(&commands::build_set_master_cmd(name, master)).await?;
        Ok(())
    }

    async fn link_destroy(&self, name: &str) -> CnciResult<()> {
        shell::exec_or_throw(&commands::build_link_del_cmd(name)).await?;
        Ok(())
    }

    async fn addr_list(&self, name: &str) -> CnciResult<Vec<Ipv4Net>> {
        let raw = shell::exec_or_throw(&commands::build_addr_list_cmd(name)).await?;
        parse_addrs(&raw)
    }

    async fn addr_add(&self, name: &str, addr: &Ipv4Net) -> CnciResult<()> {
        shell::exec_or_throw(&commands::build_addr_add_cmd(name, addr)).await?;
        Ok(())
    }

    async fn addr_del(&self, name: &str, addr: &Ipv4Net) -> CnciResult<()> {
        shell::exec_or_throw(&commands::build_addr_del_cmd(name, addr)).await?;
        Ok(())
    }

    async fn neigh_list(&self, name: &str) -> CnciResult<Vec<KernelNeighbor>> {
        let raw = shell::exec_or_throw(&commands::build_neigh_list_cmd(name)).await?;
        parse_neighbors(&raw)
    }

    async fn neigh_add(&self, name: &str, dst: Ipv4Addr, lladdr: Ipv4Addr) -> CnciResult<()> {
        shell::exec_or_throw(&commands::build_neigh_add_cmd(name, dst, lladdr)).await?;
        Ok(())
    }

    async fn neigh_del(&self, name: &str, dst: Ipv4Addr) -> CnciResult<()> {
        shell::exec_or_throw(&commands::build_neigh_del_cmd(name, dst)).await?;
        Ok(())
    }

    async fn route_list(&self) -> CnciResult<Vec<KernelRoute>> {
        let raw = shell::exec_or_throw(&commands::build_route_list_cmd()).await?;
        parse_routes(&raw)
    }

    async fn route_add_dev(&self, dst: &Ipv4Net, dev: &str) -> CnciResult<()> {
        shell::exec_or_throw(&commands::build_route_add_dev_cmd(dst, dev)).await?;
        Ok(())
    }

    async fn route_add_via(&self, dst: &Ipv4Net, via: Ipv4Addr) -> CnciResult<()> {
        shell::exec_or_throw(&commands::build_route_add_via_cmd(dst, via)).await?;
        Ok(())
    }

    async fn route_del(&self, dst: &Ipv4Net) -> CnciResult<()> {
        shell::exec_or_throw(&commands::build_route_del_cmd(dst)).await?;
        Ok(())
    }

    async fn enable_forwarding(&self) -> CnciResult<()> {
        shell::exec_or_throw(&commands::build_enable_forwarding_cmd()).await?;
        Ok(())
    }
}
