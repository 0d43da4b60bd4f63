//! Topology store: the in-memory model of bridges, tunnels and names
//!
//! Three tables under a single mutex. The mutex is held only for table
//! mutation; all kernel work happens outside it. A freshly reserved link
//! carries a closed [`ReadyGate`]: the caller that reserved it performs the
//! kernel work, records the final index and opens the gate, while concurrent
//! callers that found the entry already present await the gate and then
//! re-read the entry. An entry whose gate is open but whose index is still
//! the sentinel marks a failed creation; the next reservation for that alias
//! revives it with a fresh kernel name.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use tracing::warn;

use cnci_common::CnciResult;

use crate::dhcp::DhcpHandle;
use crate::gate::ReadyGate;
use crate::naming::pick_device_name;
use crate::types::{BRIDGE_NAME_BASE, GRETAP_NAME_BASE};

/// Sentinel index of a link whose device does not (yet) exist.
pub const UNREADY_INDEX: u32 = 0;

/// One logical link. `kernel_name` and `index` are final once `ready` opens
/// with a non-sentinel index, and never change afterwards.
#[derive(Debug)]
pub struct LinkInfo {
    pub kernel_name: String,
    pub index: u32,
    pub ready: ReadyGate,
}

impl LinkInfo {
    fn is_dead(&self) -> bool {
        self.ready.is_open() && self.index == UNREADY_INDEX
    }
}

/// Bookkeeping for one subnet bridge.
#[derive(Debug)]
pub struct BridgeInfo {
    /// Number of subnet tunnels bound to this bridge.
    pub tunnel_refcount: u32,
    /// The DHCP instance serving the bridge.
    pub dhcp: DhcpHandle,
}

/// A read-only copy of a link entry, safe to use outside the lock.
#[derive(Debug, Clone)]
pub struct LinkSnapshot {
    pub kernel_name: String,
    pub index: u32,
    pub ready: ReadyGate,
}

/// The outcome of [`Topology::reserve_subnet`].
#[derive(Debug)]
pub struct SubnetReservation {
    /// True when this caller must create the bridge device.
    pub bridge_new: bool,
    /// True when this caller must create the gre device.
    pub gre_new: bool,
    pub bridge_name: String,
    pub gre_name: String,
    pub bridge_ready: ReadyGate,
    pub gre_ready: ReadyGate,
}

/// A link recovered from live kernel state during rebuild.
#[derive(Debug)]
pub struct RebuiltLink {
    pub alias: String,
    pub kernel_name: String,
    pub index: u32,
}

/// A bridge recovered during rebuild, refcount already derived.
#[derive(Debug)]
pub struct RebuiltBridge {
    pub alias: String,
    pub dhcp: DhcpHandle,
    pub tunnel_refcount: u32,
}

/// Snapshot handed to shutdown; devices are mutated outside the lock.
#[derive(Debug)]
pub struct ShutdownSnapshot {
    pub links: Vec<(String, LinkSnapshot)>,
    pub dhcp: Vec<DhcpHandle>,
}

#[derive(Default)]
struct Tables {
    links: HashMap<String, LinkInfo>,
    bridges: HashMap<String, BridgeInfo>,
    names: HashSet<String>,
}

/// The concurrency-safe topology store.
#[derive(Default)]
pub struct Topology {
    tables: Mutex<Tables>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().expect("topology mutex poisoned")
    }

    /// Looks up both aliases and reserves whatever is missing, handing the
    /// caller fresh kernel names and closed gates for the entries it must
    /// create. When the gre is new its bridge's refcount is incremented.
    /// Leaves the store untouched on any error path.
    pub fn reserve_subnet(
        &self,
        bridge_alias: &str,
        gre_alias: &str,
        dhcp: DhcpHandle,
    ) -> CnciResult<SubnetReservation> {
        let mut t = self.lock();

        let bridge_inserted = !t.links.contains_key(bridge_alias);
        let bridge_revived = t
            .links
            .get(bridge_alias)
            .map(|info| info.is_dead())
            .unwrap_or(false);
        let bridge_new = bridge_inserted || bridge_revived;

        if bridge_revived {
            let old = t.links.remove(bridge_alias).expect("checked above");
            t.names.remove(&old.kernel_name);
        }
        if bridge_new {
            let name = pick_device_name(BRIDGE_NAME_BASE, &t.names)?;
            t.names.insert(name.clone());
            t.links.insert(
                bridge_alias.to_string(),
                LinkInfo {
                    kernel_name: name,
                    index: UNREADY_INDEX,
                    ready: ReadyGate::new(),
                },
            );
        }
        if !t.bridges.contains_key(bridge_alias) {
            t.bridges.insert(
                bridge_alias.to_string(),
                BridgeInfo {
                    tunnel_refcount: 0,
                    dhcp,
                },
            );
        }

        let gre_inserted = !t.links.contains_key(gre_alias);
        let gre_revived = t
            .links
            .get(gre_alias)
            .map(|info| info.is_dead())
            .unwrap_or(false);
        let gre_new = gre_inserted || gre_revived;

        if gre_revived {
            let old = t.links.remove(gre_alias).expect("checked above");
            t.names.remove(&old.kernel_name);
        }
        if gre_new {
            let name = match pick_device_name(GRETAP_NAME_BASE, &t.names) {
                Ok(name) => name,
                Err(e) => {
                    // Undo the bridge reservation so the store stays
                    // consistent; a revived gre entry is simply gone, which
                    // the refcount already accounts for.
                    if bridge_new {
                        if let Some(info) = t.links.remove(bridge_alias) {
                            t.names.remove(&info.kernel_name);
                        }
                    }
                    if bridge_inserted {
                        t.bridges.remove(bridge_alias);
                    }
                    if gre_revived {
                        if let Some(b) = t.bridges.get_mut(bridge_alias) {
                            b.tunnel_refcount = b.tunnel_refcount.saturating_sub(1);
                        }
                    }
                    return Err(e);
                }
            };
            t.names.insert(name.clone());
            t.links.insert(
                gre_alias.to_string(),
                LinkInfo {
                    kernel_name: name,
                    index: UNREADY_INDEX,
                    ready: ReadyGate::new(),
                },
            );
            // A revived entry was already counted by its first reservation.
            if gre_inserted {
                if let Some(b) = t.bridges.get_mut(bridge_alias) {
                    b.tunnel_refcount += 1;
                }
            }
        }

        let bridge = &t.links[bridge_alias];
        let gre = &t.links[gre_alias];
        Ok(SubnetReservation {
            bridge_new,
            gre_new,
            bridge_name: bridge.kernel_name.clone(),
            gre_name: gre.kernel_name.clone(),
            bridge_ready: bridge.ready.clone(),
            gre_ready: gre.ready.clone(),
        })
    }

    /// Records the final kernel index for a reserved link and releases its
    /// waiters. Success path of the creator.
    pub fn complete_link(&self, alias: &str, index: u32) {
        let mut t = self.lock();
        match t.links.get_mut(alias) {
            Some(info) => {
                info.index = index;
                info.ready.open();
            }
            None => warn!(alias = alias, "complete_link on unknown alias"),
        }
    }

    /// Releases waiters without recording an index; they observe the
    /// sentinel and treat the reservation as failed. Failure path of the
    /// creator.
    pub fn fail_link(&self, alias: &str) {
        let t = self.lock();
        if let Some(info) = t.links.get(alias) {
            info.ready.open();
        }
    }

    /// Copies one link entry out of the store.
    pub fn link_snapshot(&self, alias: &str) -> Option<LinkSnapshot> {
        let t = self.lock();
        t.links.get(alias).map(|info| LinkSnapshot {
            kernel_name: info.kernel_name.clone(),
            index: info.index,
            ready: info.ready.clone(),
        })
    }

    /// Drops a gre reservation that never reached the kernel, restoring the
    /// bridge's refcount. Used when bridge creation fails underneath it.
    pub fn rollback_gre(&self, gre_alias: &str, bridge_alias: &str) {
        let mut t = self.lock();
        if let Some(info) = t.links.remove(gre_alias) {
            t.names.remove(&info.kernel_name);
            match t.bridges.get_mut(bridge_alias) {
                Some(b) => b.tunnel_refcount = b.tunnel_refcount.saturating_sub(1),
                None => warn!(alias = bridge_alias, "rollback with no bridge entry"),
            }
        }
    }

    /// First half of a subnet delete: decrements the bridge refcount and
    /// returns the gre entry for the caller to wait on. `None` means the
    /// gre was never present and the delete is a no-op.
    pub fn begin_release_gre(
        &self,
        gre_alias: &str,
        bridge_alias: &str,
    ) -> Option<LinkSnapshot> {
        let mut t = self.lock();
        let snap = t.links.get(gre_alias).map(|info| LinkSnapshot {
            kernel_name: info.kernel_name.clone(),
            index: info.index,
            ready: info.ready.clone(),
        })?;
        match t.bridges.get_mut(bridge_alias) {
            Some(b) => b.tunnel_refcount = b.tunnel_refcount.saturating_sub(1),
            // Tolerated: a crash may have left a tunnel whose bridge entry
            // was never rebuilt.
            None => warn!(alias = bridge_alias, "deleting tunnel with no bridge entry"),
        }
        Some(snap)
    }

    /// Restores the refcount when a delete aborts between begin and finish.
    pub fn undo_release_gre(&self, bridge_alias: &str) {
        let mut t = self.lock();
        if let Some(b) = t.bridges.get_mut(bridge_alias) {
            b.tunnel_refcount += 1;
        }
    }

    /// Second half of a subnet delete: drops the gre from the link and name
    /// tables. Returns the removed entry, or `None` when a concurrent delete
    /// already claimed it; exactly one caller observes `Some` and owns the
    /// device teardown.
    pub fn finish_release_gre(&self, gre_alias: &str) -> Option<LinkSnapshot> {
        let mut t = self.lock();
        let info = t.links.remove(gre_alias)?;
        t.names.remove(&info.kernel_name);
        Some(LinkSnapshot {
            kernel_name: info.kernel_name,
            index: info.index,
            ready: info.ready,
        })
    }

    /// Removes a link and any bridge bookkeeping attached to its alias.
    pub fn remove_link(&self, alias: &str) {
        let mut t = self.lock();
        if let Some(info) = t.links.remove(alias) {
            t.names.remove(&info.kernel_name);
        }
        t.bridges.remove(alias);
    }

    /// Returns the current bridges and links for shutdown to tear down
    /// outside the lock.
    pub fn snapshot_for_shutdown(&self) -> ShutdownSnapshot {
        let t = self.lock();
        ShutdownSnapshot {
            links: t
                .links
                .iter()
                .map(|(alias, info)| {
                    (
                        alias.clone(),
                        LinkSnapshot {
                            kernel_name: info.kernel_name.clone(),
                            index: info.index,
                            ready: info.ready.clone(),
                        },
                    )
                })
                .collect(),
            dhcp: t.bridges.values().map(|b| b.dhcp.clone()).collect(),
        }
    }

    /// Replaces all three tables with state recovered from the kernel.
    /// Recovered links are final, so their gates start open.
    pub fn reset_with(&self, links: Vec<RebuiltLink>, bridges: Vec<RebuiltBridge>) {
        let mut t = self.lock();
        *t = Tables::default();
        for link in links {
            let ready = ReadyGate::new();
            ready.open();
            t.names.insert(link.kernel_name.clone());
            t.links.insert(
                link.alias,
                LinkInfo {
                    kernel_name: link.kernel_name,
                    index: link.index,
                    ready,
                },
            );
        }
        for bridge in bridges {
            t.bridges.insert(
                bridge.alias,
                BridgeInfo {
                    tunnel_refcount: bridge.tunnel_refcount,
                    dhcp: bridge.dhcp,
                },
            );
        }
    }

    // Introspection, used by operations and by tests asserting the store
    // invariants.

    pub fn link_count(&self) -> usize {
        self.lock().links.len()
    }

    pub fn bridge_count(&self) -> usize {
        self.lock().bridges.len()
    }

    pub fn name_count(&self) -> usize {
        self.lock().names.len()
    }

    pub fn has_link(&self, alias: &str) -> bool {
        self.lock().links.contains_key(alias)
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.lock().names.contains(name)
    }

    pub fn bridge_refcount(&self, alias: &str) -> Option<u32> {
        self.lock().bridges.get(alias).map(|b| b.tunnel_refcount)
    }

    pub fn dhcp_handles(&self) -> Vec<DhcpHandle> {
        self.lock().bridges.values().map(|b| b.dhcp.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const BR: &str = "br_10.1.0.0+24";
    const GRE: &str = "gre_10.1.0.0+24##10.0.0.7";

    fn handle() -> DhcpHandle {
        DhcpHandle::new(BR, Uuid::new_v4(), "10.1.0.0/24".parse().unwrap())
    }

    #[test]
    fn test_reserve_fresh_subnet() {
        let topo = Topology::new();
        let res = topo.reserve_subnet(BR, GRE, handle()).unwrap();

        assert!(res.bridge_new);
        assert!(res.gre_new);
        assert_ne!(res.bridge_name, res.gre_name);
        assert!(!res.bridge_ready.is_open());
        assert_eq!(topo.link_count(), 2);
        assert_eq!(topo.name_count(), 2);
        assert_eq!(topo.bridge_refcount(BR), Some(1));
    }

    #[test]
    fn test_reserve_existing_subnet() {
        let topo = Topology::new();
        let first = topo.reserve_subnet(BR, GRE, handle()).unwrap();
        topo.complete_link(BR, 5);
        topo.complete_link(GRE, 6);

        let second = topo.reserve_subnet(BR, GRE, handle()).unwrap();
        assert!(!second.bridge_new);
        assert!(!second.gre_new);
        assert_eq!(second.bridge_name, first.bridge_name);
        // Refcount unchanged: the gre was already counted.
        assert_eq!(topo.bridge_refcount(BR), Some(1));
    }

    #[test]
    fn test_second_gre_increments_refcount() {
        let topo = Topology::new();
        topo.reserve_subnet(BR, GRE, handle()).unwrap();
        topo.reserve_subnet(BR, "gre_10.1.0.0+24##10.0.0.8", handle())
            .unwrap();
        assert_eq!(topo.bridge_refcount(BR), Some(2));
        assert_eq!(topo.link_count(), 3);
    }

    #[test]
    fn test_release_cycle() {
        let topo = Topology::new();
        topo.reserve_subnet(BR, GRE, handle()).unwrap();
        topo.complete_link(BR, 5);
        topo.complete_link(GRE, 6);

        let snap = topo.begin_release_gre(GRE, BR).unwrap();
        assert_eq!(snap.index, 6);
        assert_eq!(topo.bridge_refcount(BR), Some(0));

        let removed = topo.finish_release_gre(GRE).unwrap();
        assert_eq!(removed.kernel_name, snap.kernel_name);
        assert!(topo.finish_release_gre(GRE).is_none());
        assert!(!topo.has_link(GRE));
        assert!(!topo.has_name(&snap.kernel_name));
        // Bridge survives the delete.
        assert!(topo.has_link(BR));
        assert_eq!(topo.bridge_count(), 1);
    }

    #[test]
    fn test_release_absent_gre_is_none() {
        let topo = Topology::new();
        assert!(topo.begin_release_gre(GRE, BR).is_none());
    }

    #[test]
    fn test_failed_bridge_is_revived() {
        let topo = Topology::new();
        let first = topo.reserve_subnet(BR, GRE, handle()).unwrap();
        // Creator fails: both gates release, gre reservation rolls back.
        topo.fail_link(BR);
        topo.fail_link(GRE);
        topo.rollback_gre(GRE, BR);
        assert_eq!(topo.bridge_refcount(BR), Some(0));

        let second = topo.reserve_subnet(BR, GRE, handle()).unwrap();
        assert!(second.bridge_new);
        assert!(second.gre_new);
        assert_ne!(second.bridge_name, first.bridge_name);
        assert!(!second.bridge_ready.is_open());
        // The dead name was unreserved.
        assert!(!topo.has_name(&first.bridge_name));
        assert_eq!(topo.bridge_refcount(BR), Some(1));
    }

    #[test]
    fn test_failed_gre_revival_keeps_refcount() {
        let topo = Topology::new();
        topo.reserve_subnet(BR, GRE, handle()).unwrap();
        topo.complete_link(BR, 5);
        topo.fail_link(GRE);

        let retry = topo.reserve_subnet(BR, GRE, handle()).unwrap();
        assert!(!retry.bridge_new);
        assert!(retry.gre_new);
        assert_eq!(topo.bridge_refcount(BR), Some(1));
    }

    #[test]
    fn test_reset_with_opens_gates() {
        let topo = Topology::new();
        topo.reset_with(
            vec![
                RebuiltLink {
                    alias: BR.to_string(),
                    kernel_name: "cncibr01".to_string(),
                    index: 5,
                },
                RebuiltLink {
                    alias: GRE.to_string(),
                    kernel_name: "cncigt01".to_string(),
                    index: 6,
                },
            ],
            vec![RebuiltBridge {
                alias: BR.to_string(),
                dhcp: handle(),
                tunnel_refcount: 1,
            }],
        );

        let snap = topo.link_snapshot(BR).unwrap();
        assert!(snap.ready.is_open());
        assert_eq!(snap.index, 5);
        assert_eq!(topo.name_count(), 2);
        assert_eq!(topo.bridge_refcount(BR), Some(1));
    }

    #[test]
    fn test_snapshot_for_shutdown() {
        let topo = Topology::new();
        topo.reserve_subnet(BR, GRE, handle()).unwrap();
        let snap = topo.snapshot_for_shutdown();
        assert_eq!(snap.links.len(), 2);
        assert_eq!(snap.dhcp.len(), 1);
    }

    #[test]
    fn test_remove_link_clears_all_tables() {
        let topo = Topology::new();
        topo.reserve_subnet(BR, GRE, handle()).unwrap();
        topo.remove_link(GRE);
        topo.remove_link(BR);
        assert_eq!(topo.link_count(), 0);
        assert_eq!(topo.bridge_count(), 0);
        assert_eq!(topo.name_count(), 0);
    }
}
