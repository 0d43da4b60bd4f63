//! The concentrator: one per tenant, owner of the overlay topology
//!
//! Operations arrive concurrently from command-handling workers. Each one
//! takes a short critical section on the topology store to reserve or look
//! up entries, performs kernel work outside the lock, and synchronizes with
//! concurrent callers through per-link readiness gates.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use ipnet::Ipv4Net;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cnci_common::{CnciError, CnciResult};

use crate::config::Config;
use crate::devices::{Bridge, GreTap};
use crate::dhcp::{DhcpHandle, DhcpLauncher};
use crate::kernel::{KernelLink, NetKernel};
use crate::naming::{bridge_alias, gretap_alias, parse_bridge_alias, parse_gretap_alias};
use crate::topology::{
    LinkSnapshot, RebuiltBridge, RebuiltLink, Topology, UNREADY_INDEX,
};
use crate::types::{
    LinkKind, PhysicalInterface, BRIDGE_ALIAS_PREFIX, GRETAP_ALIAS_PREFIX,
};

/// How long shutdown waits for an in-flight reservation before tearing its
/// device down anyway.
const SHUTDOWN_GATE_WAIT: Duration = Duration::from_secs(1);

/// Physical interfaces classified at init.
#[derive(Debug, Clone)]
struct Interfaces {
    management: Vec<PhysicalInterface>,
    compute: Vec<PhysicalInterface>,
}

/// The per-tenant concentrator.
pub struct Concentrator {
    config: Config,
    kernel: Arc<dyn NetKernel>,
    dhcp: Arc<dyn DhcpLauncher>,
    topology: Topology,
    api_timeout: Duration,
    interfaces: OnceLock<Interfaces>,
}

impl Concentrator {
    /// Builds a concentrator around the given adapters. No host state is
    /// touched until [`Concentrator::init`].
    pub fn new(config: Config, kernel: Arc<dyn NetKernel>, dhcp: Arc<dyn DhcpLauncher>) -> Self {
        let api_timeout = config.api_timeout();
        Self {
            config,
            kernel,
            dhcp,
            topology: Topology::new(),
            api_timeout,
            interfaces: OnceLock::new(),
        }
    }

    pub(crate) fn kernel(&self) -> &dyn NetKernel {
        self.kernel.as_ref()
    }

    /// The topology store, exposed for invariant inspection.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The primary compute address, used as the local endpoint of every
    /// tunnel. Fails before init.
    pub fn compute_address(&self) -> CnciResult<Ipv4Addr> {
        let interfaces = self
            .interfaces
            .get()
            .ok_or_else(|| CnciError::config("concentrator not initialized"))?;
        interfaces
            .compute
            .iter()
            .flat_map(|iface| iface.addrs.first())
            .map(|net| net.addr())
            .next()
            .ok_or_else(|| CnciError::config("no compute address available"))
    }

    /// Discovers and classifies the physical interfaces, rebuilds the
    /// topology from live kernel state, and enables forwarding. Idempotent
    /// per process: repeated calls are no-ops.
    pub async fn init(&self) -> CnciResult<()> {
        if self.interfaces.get().is_some() {
            debug!("init called again, ignoring");
            return Ok(());
        }

        let links = self.kernel.link_list().await?;
        let mut physical = Vec::new();
        for link in links.iter().filter(|l| self.kernel.link_is_physical(l)) {
            let addrs = self.kernel.addr_list(&link.name).await?;
            physical.push(PhysicalInterface {
                name: link.name.clone(),
                index: link.index,
                addrs,
            });
        }

        let interfaces = classify_interfaces(
            &physical,
            &self.config.management_subnets,
            &self.config.compute_subnets,
        )?;
        info!(
            management = interfaces.management.len(),
            compute = interfaces.compute.len(),
            tenant = %self.config.tenant_uuid,
            "Concentrator initialized"
        );
        let _ = self.interfaces.set(interfaces);

        self.rebuild_topology().await?;
        self.kernel.enable_forwarding().await?;
        Ok(())
    }

    /// Binds a remote subnet to its local bridge through a keyed GRE tap,
    /// creating the bridge (and its DHCP instance) on first reference.
    ///
    /// Returns the bridge's kernel name except on the one path where the
    /// bridge already existed and only the tunnel was created: there the
    /// caller has no new interface to configure upstream and receives
    /// `None`.
    pub async fn add_remote_subnet(
        &self,
        subnet: Ipv4Net,
        subnet_key: u32,
        peer_ip: Ipv4Addr,
    ) -> CnciResult<Option<String>> {
        validate_subnet(&subnet)?;
        validate_key(subnet_key)?;
        validate_peer(peer_ip)?;
        let local = self.compute_address()?;

        let br_alias = bridge_alias(&subnet);
        let gre_alias = gretap_alias(&subnet, peer_ip);
        let handle = DhcpHandle::new(&br_alias, self.config.tenant_uuid, subnet);

        let reservation = self
            .topology
            .reserve_subnet(&br_alias, &gre_alias, handle.clone())?;

        if reservation.bridge_new {
            match self
                .create_bridge(&br_alias, &reservation.bridge_name, &handle)
                .await
            {
                Ok(index) => self.topology.complete_link(&br_alias, index),
                Err(e) => {
                    // Release both gates so no waiter is stranded on the
                    // gre, then drop the gre reservation that never reached
                    // the kernel.
                    self.topology.fail_link(&br_alias);
                    if reservation.gre_new {
                        self.topology.fail_link(&gre_alias);
                        self.topology.rollback_gre(&gre_alias, &br_alias);
                    }
                    return Err(e);
                }
            }
        }

        if reservation.gre_new {
            match self
                .create_gretap(
                    &gre_alias,
                    &reservation.gre_name,
                    local,
                    peer_ip,
                    subnet_key,
                )
                .await
            {
                Ok(index) => self.topology.complete_link(&gre_alias, index),
                Err(e) => {
                    self.topology.fail_link(&gre_alias);
                    return Err(e);
                }
            }
        }

        // Uniform path: pick the final identities up through the gates even
        // when this caller did the work itself.
        let bridge = self.await_link(&br_alias).await?;
        let gre = self.await_link(&gre_alias).await?;

        let tap = GreTap::new(&gre_alias, &gre.kernel_name, local, peer_ip, subnet_key);
        tap.attach(self.kernel(), &bridge.kernel_name).await?;

        debug!(subnet = %subnet, peer = %peer_ip, "Remote subnet bound");
        if reservation.bridge_new || !reservation.gre_new {
            Ok(Some(bridge.kernel_name))
        } else {
            Ok(None)
        }
    }

    /// Unbinds a remote subnet: the GRE tap is destroyed, the bridge and
    /// its DHCP instance are deliberately retained so instance churn within
    /// the subnet does not flap leases. Deleting an unknown tunnel succeeds.
    pub async fn del_remote_subnet(
        &self,
        subnet: Ipv4Net,
        subnet_key: u32,
        peer_ip: Ipv4Addr,
    ) -> CnciResult<()> {
        validate_subnet(&subnet)?;
        validate_key(subnet_key)?;
        validate_peer(peer_ip)?;
        let local = self.compute_address()?;

        let br_alias = bridge_alias(&subnet);
        let gre_alias = gretap_alias(&subnet, peer_ip);

        let Some(reserved) = self.topology.begin_release_gre(&gre_alias, &br_alias) else {
            debug!(alias = %gre_alias, "Tunnel already absent");
            return Ok(());
        };

        if !reserved.ready.wait(self.api_timeout).await {
            self.topology.undo_release_gre(&br_alias);
            return Err(CnciError::timeout(&gre_alias));
        }

        // Exactly one deleter claims the entry; a racing delete undoes its
        // refcount decrement and reports success.
        let Some(current) = self.topology.finish_release_gre(&gre_alias) else {
            self.topology.undo_release_gre(&br_alias);
            return Ok(());
        };

        if current.index == UNREADY_INDEX {
            debug!(alias = %gre_alias, "Reservation never materialized, nothing to destroy");
            return Ok(());
        }

        let tap = GreTap::new(&gre_alias, &current.kernel_name, local, peer_ip, subnet_key);
        tap.destroy(self.kernel()).await?;

        debug!(subnet = %subnet, peer = %peer_ip, "Remote subnet unbound");
        Ok(())
    }

    /// Reconstructs the topology store from live kernel state. Aliases are
    /// the only durable carrier of identity; refcounts are derived by
    /// counting tunnels per bridge. A tunnel whose bridge is missing makes
    /// the rebuild fail.
    pub async fn rebuild_topology(&self) -> CnciResult<()> {
        let links = self.kernel.link_list().await?;
        let plan = plan_rebuild(self.config.tenant_uuid, &links)?;

        // DHCP may have survived the previous process; attach where
        // possible, restart where not.
        for bridge in &plan.bridges {
            let name = &plan.bridge_names[&bridge.alias];
            self.dhcp.start_or_attach(name, &bridge.dhcp).await?;
        }

        info!(
            links = plan.links.len(),
            bridges = plan.bridges.len(),
            "Topology rebuilt from kernel state"
        );
        self.topology.reset_with(plan.links, plan.bridges);
        Ok(())
    }

    /// Stops every DHCP instance and destroys every managed device. Every
    /// teardown is attempted; the last error seen is returned.
    pub async fn shutdown(&self) -> CnciResult<()> {
        let snapshot = self.topology.snapshot_for_shutdown();
        let mut last_err = None;

        for handle in &snapshot.dhcp {
            if let Err(e) = self.dhcp.stop(handle).await {
                warn!(bridge = %handle.bridge_alias, error = %e, "DHCP stop failed");
                last_err = Some(e);
            }
        }

        for (alias, reserved) in &snapshot.links {
            if !reserved.ready.wait(SHUTDOWN_GATE_WAIT).await {
                warn!(alias = %alias, "Tearing down link that never became ready");
            }
            let current = self
                .topology
                .link_snapshot(alias)
                .unwrap_or_else(|| reserved.clone());
            let failed_reservation =
                current.ready.is_open() && current.index == UNREADY_INDEX;
            if !failed_reservation {
                if let Err(e) = self.kernel.link_destroy(&current.kernel_name).await {
                    warn!(alias = %alias, error = %e, "Device destroy failed");
                    last_err = Some(e);
                }
            }
            self.topology.remove_link(alias);
        }

        info!("Concentrator shut down");
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn create_bridge(
        &self,
        alias: &str,
        name: &str,
        handle: &DhcpHandle,
    ) -> CnciResult<u32> {
        let mut bridge = Bridge::new(alias, name);
        bridge.create(self.kernel()).await?;
        bridge.enable(self.kernel()).await?;
        bridge.get_device(self.kernel()).await?;
        self.dhcp.start_or_attach(&bridge.name, handle).await?;
        Ok(bridge.index)
    }

    async fn create_gretap(
        &self,
        alias: &str,
        name: &str,
        local: Ipv4Addr,
        remote: Ipv4Addr,
        key: u32,
    ) -> CnciResult<u32> {
        let mut tap = GreTap::new(alias, name, local, remote, key);
        tap.create(self.kernel()).await?;
        tap.enable(self.kernel()).await?;
        tap.get_device(self.kernel()).await?;
        Ok(tap.index)
    }

    /// Waits for a reserved link's gate and returns its final identity. A
    /// gate released without an index means its creator failed.
    async fn await_link(&self, alias: &str) -> CnciResult<LinkSnapshot> {
        let reserved = self
            .topology
            .link_snapshot(alias)
            .ok_or_else(|| CnciError::timeout(alias))?;
        if !reserved.ready.wait(self.api_timeout).await {
            return Err(CnciError::timeout(alias));
        }
        let current = self
            .topology
            .link_snapshot(alias)
            .ok_or_else(|| CnciError::timeout(alias))?;
        if current.index == UNREADY_INDEX {
            return Err(CnciError::timeout(alias));
        }
        Ok(current)
    }
}

fn validate_subnet(subnet: &Ipv4Net) -> CnciResult<()> {
    if subnet.addr().is_unspecified() {
        return Err(CnciError::invalid_input("subnet", "unspecified network"));
    }
    Ok(())
}

fn validate_key(key: u32) -> CnciResult<()> {
    if key == 0 {
        return Err(CnciError::invalid_input("subnet_key", "must be non-zero"));
    }
    Ok(())
}

fn validate_peer(peer_ip: Ipv4Addr) -> CnciResult<()> {
    if peer_ip.is_unspecified() {
        return Err(CnciError::invalid_input("peer_ip", "unspecified address"));
    }
    Ok(())
}

fn contained_addrs(iface: &PhysicalInterface, subnets: &[Ipv4Net]) -> Vec<Ipv4Net> {
    iface
        .addrs
        .iter()
        .filter(|addr| {
            subnets.is_empty() || subnets.iter().any(|subnet| subnet.contains(&addr.addr()))
        })
        .copied()
        .collect()
}

/// Splits the discovered physical interfaces into management and compute
/// sets according to the configured subnets.
fn classify_interfaces(
    physical: &[PhysicalInterface],
    management_subnets: &[Ipv4Net],
    compute_subnets: &[Ipv4Net],
) -> CnciResult<Interfaces> {
    let addressed = physical.iter().filter(|i| !i.addrs.is_empty()).count();
    if management_subnets.is_empty() && compute_subnets.is_empty() && addressed > 1 {
        return Err(CnciError::config(
            "multiple physical interfaces carry addresses; \
             management and compute subnets must be configured",
        ));
    }

    let pick = |subnets: &[Ipv4Net]| -> Vec<PhysicalInterface> {
        physical
            .iter()
            .filter_map(|iface| {
                let addrs = contained_addrs(iface, subnets);
                if addrs.is_empty() {
                    None
                } else {
                    Some(PhysicalInterface {
                        name: iface.name.clone(),
                        index: iface.index,
                        addrs,
                    })
                }
            })
            .collect()
    };

    let management = pick(management_subnets);
    if management.is_empty() {
        return Err(CnciError::config(format!(
            "no management interface matches {:?}",
            management_subnets
        )));
    }
    let compute = pick(compute_subnets);
    if compute.is_empty() {
        return Err(CnciError::config(format!(
            "no compute interface matches {:?}",
            compute_subnets
        )));
    }

    Ok(Interfaces {
        management,
        compute,
    })
}

#[derive(Debug)]
struct RebuildPlan {
    links: Vec<RebuiltLink>,
    bridges: Vec<RebuiltBridge>,
    bridge_names: HashMap<String, String>,
}

/// Derives the store contents from enumerated kernel links. Pure so the
/// scan logic is testable without a host.
fn plan_rebuild(tenant: Uuid, links: &[KernelLink]) -> CnciResult<RebuildPlan> {
    let mut plan = RebuildPlan {
        links: Vec::new(),
        bridges: Vec::new(),
        bridge_names: HashMap::new(),
    };

    for link in links.iter().filter(|l| !l.alias.is_empty()) {
        plan.links.push(RebuiltLink {
            alias: link.alias.clone(),
            kernel_name: link.name.clone(),
            index: link.index,
        });
    }

    for link in links {
        if link.kind == LinkKind::Bridge && link.alias.starts_with(BRIDGE_ALIAS_PREFIX) {
            let subnet = parse_bridge_alias(&link.alias).ok_or_else(|| {
                CnciError::inconsistent(&link.alias, "undecodable bridge alias")
            })?;
            plan.bridges.push(RebuiltBridge {
                alias: link.alias.clone(),
                dhcp: DhcpHandle::new(&link.alias, tenant, subnet),
                tunnel_refcount: 0,
            });
            plan.bridge_names
                .insert(link.alias.clone(), link.name.clone());
        }
    }

    for link in links {
        if link.kind == LinkKind::GreTap && link.alias.starts_with(GRETAP_ALIAS_PREFIX) {
            let (subnet, _peer) = parse_gretap_alias(&link.alias).ok_or_else(|| {
                CnciError::inconsistent(&link.alias, "undecodable tunnel alias")
            })?;
            let wanted = bridge_alias(&subnet);
            let bridge = plan
                .bridges
                .iter_mut()
                .find(|b| b.alias == wanted)
                .ok_or_else(|| {
                    CnciError::inconsistent(&link.alias, "no bridge for subnet tunnel")
                })?;
            bridge.tunnel_refcount += 1;
        }
    }

    Ok(plan)
}
