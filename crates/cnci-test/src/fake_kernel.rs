//! In-memory host network stack
//!
//! Implements the kernel seam against plain data structures so topology
//! operations can run without privileges or a real host. Failure injection
//! is keyed by operation name, optionally narrowed to one device; every
//! call attempt is counted so tests can assert exactly which kernel
//! mutations an operation performed.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use async_trait::async_trait;
use ipnet::Ipv4Net;

use cnci_common::{CnciError, CnciResult};
use cncid::kernel::{KernelLink, KernelNeighbor, KernelRoute, NetKernel};
use cncid::types::LinkKind;

/// One fake link and everything attached to it.
#[derive(Debug, Clone)]
pub struct FakeLink {
    pub name: String,
    pub alias: String,
    pub kind: LinkKind,
    pub index: u32,
    pub up: bool,
    pub master: Option<String>,
    pub addrs: Vec<Ipv4Net>,
    pub neighbors: Vec<KernelNeighbor>,
}

#[derive(Default)]
struct HostState {
    links: Vec<FakeLink>,
    routes: Vec<KernelRoute>,
    next_index: u32,
    op_counts: HashMap<String, u32>,
    fail_ops: HashSet<String>,
}

impl HostState {
    fn find(&self, name: &str) -> Option<&FakeLink> {
        self.links.iter().find(|l| l.name == name)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut FakeLink> {
        self.links.iter_mut().find(|l| l.name == name)
    }

    fn record(&mut self, op: &str, name: &str) -> CnciResult<()> {
        *self.op_counts.entry(op.to_string()).or_insert(0) += 1;
        if self.fail_ops.contains(op) || self.fail_ops.contains(&format!("{}:{}", op, name)) {
            return Err(CnciError::kernel(op, name, "injected failure"));
        }
        Ok(())
    }

    fn add_link(&mut self, name: &str, alias: &str, kind: LinkKind) -> CnciResult<()> {
        if self.find(name).is_some() {
            return Err(CnciError::kernel("create", name, "File exists"));
        }
        self.next_index += 1;
        self.links.push(FakeLink {
            name: name.to_string(),
            alias: alias.to_string(),
            kind,
            index: self.next_index,
            up: false,
            master: None,
            addrs: Vec::new(),
            neighbors: Vec::new(),
        });
        Ok(())
    }
}

/// The fake host.
#[derive(Default)]
pub struct FakeKernel {
    state: Mutex<HostState>,
}

impl FakeKernel {
    pub fn new() -> Self {
        let kernel = Self::default();
        kernel.lock().next_index = 1; // index 1 is the loopback's
        kernel
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().expect("fake kernel mutex poisoned")
    }

    /// Seeds a physical interface carrying the given addresses.
    pub fn seed_physical(&self, name: &str, addrs: &[&str]) {
        let mut s = self.lock();
        s.next_index += 1;
        let index = s.next_index;
        s.links.push(FakeLink {
            name: name.to_string(),
            alias: String::new(),
            kind: LinkKind::Physical,
            index,
            up: true,
            master: None,
            addrs: addrs.iter().map(|a| a.parse().unwrap()).collect(),
            neighbors: Vec::new(),
        });
    }

    /// Seeds an arbitrary pre-existing link, as a crashed process would
    /// have left it.
    pub fn seed_link(&self, name: &str, alias: &str, kind: LinkKind) {
        let mut s = self.lock();
        s.next_index += 1;
        let index = s.next_index;
        s.links.push(FakeLink {
            name: name.to_string(),
            alias: alias.to_string(),
            kind,
            index,
            up: true,
            master: None,
            addrs: Vec::new(),
            neighbors: Vec::new(),
        });
    }

    /// Makes future calls of `op` fail; narrow to one device with
    /// `fail_on(op, Some(name))`.
    pub fn fail_on(&self, op: &str, name: Option<&str>) {
        let key = match name {
            Some(name) => format!("{}:{}", op, name),
            None => op.to_string(),
        };
        self.lock().fail_ops.insert(key);
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.lock().fail_ops.clear();
    }

    /// How many times `op` was attempted.
    pub fn op_count(&self, op: &str) -> u32 {
        self.lock().op_counts.get(op).copied().unwrap_or(0)
    }

    pub fn link(&self, name: &str) -> Option<FakeLink> {
        self.lock().find(name).cloned()
    }

    pub fn link_with_alias(&self, alias: &str) -> Option<FakeLink> {
        self.lock().links.iter().find(|l| l.alias == alias).cloned()
    }

    pub fn link_count(&self) -> usize {
        self.lock().links.len()
    }

    pub fn master_of(&self, name: &str) -> Option<String> {
        self.lock().find(name).and_then(|l| l.master.clone())
    }

    pub fn addrs(&self, name: &str) -> Vec<Ipv4Net> {
        self.lock()
            .find(name)
            .map(|l| l.addrs.clone())
            .unwrap_or_default()
    }

    pub fn neighbors(&self, name: &str) -> Vec<KernelNeighbor> {
        self.lock()
            .find(name)
            .map(|l| l.neighbors.clone())
            .unwrap_or_default()
    }

    pub fn routes(&self) -> Vec<KernelRoute> {
        self.lock().routes.clone()
    }
}

#[async_trait]
impl NetKernel for FakeKernel {
    async fn link_list(&self) -> CnciResult<Vec<KernelLink>> {
        let mut s = self.lock();
        s.record("link_list", "-")?;
        Ok(s.links
            .iter()
            .map(|l| KernelLink {
                name: l.name.clone(),
                alias: l.alias.clone(),
                kind: l.kind,
                index: l.index,
            })
            .collect())
    }

    async fn link_by_name(&self, name: &str) -> CnciResult<Option<KernelLink>> {
        let mut s = self.lock();
        s.record("link_by_name", name)?;
        Ok(s.find(name).map(|l| KernelLink {
            name: l.name.clone(),
            alias: l.alias.clone(),
            kind: l.kind,
            index: l.index,
        }))
    }

    async fn bridge_create(&self, name: &str, alias: &str) -> CnciResult<()> {
        let mut s = self.lock();
        s.record("bridge_create", name)?;
        s.add_link(name, alias, LinkKind::Bridge)
    }

    async fn gretap_create(
        &self,
        name: &str,
        alias: &str,
        _local: Ipv4Addr,
        _remote: Ipv4Addr,
        _key: u32,
    ) -> CnciResult<()> {
        let mut s = self.lock();
        s.record("gretap_create", name)?;
        s.add_link(name, alias, LinkKind::GreTap)
    }

    async fn gretun_create(&self, name: &str, _local: Ipv4Addr, _key: u32) -> CnciResult<()> {
        let mut s = self.lock();
        s.record("gretun_create", name)?;
        s.add_link(name, "", LinkKind::GreTun)
    }

    async fn tap_create(&self, name: &str, alias: &str) -> CnciResult<()> {
        let mut s = self.lock();
        s.record("tap_create", name)?;
        s.add_link(name, alias, LinkKind::Vnic)
    }

    async fn link_enable(&self, name: &str) -> CnciResult<()> {
        let mut s = self.lock();
        s.record("link_enable", name)?;
        match s.find_mut(name) {
            Some(link) => {
                link.up = true;
                Ok(())
            }
            None => Err(CnciError::kernel("enable", name, "Cannot find device")),
        }
    }

    async fn link_attach(&self, name: &str, master: &str) -> CnciResult<()> {
        let mut s = self.lock();
        s.record("link_attach", name)?;
        if s.find(master).is_none() {
            return Err(CnciError::kernel("attach", master, "Cannot find device"));
        }
        match s.find_mut(name) {
            Some(link) => {
                link.master = Some(master.to_string());
                Ok(())
            }
            None => Err(CnciError::kernel("attach", name, "Cannot find device")),
        }
    }

    async fn link_destroy(&self, name: &str) -> CnciResult<()> {
        let mut s = self.lock();
        s.record("link_destroy", name)?;
        let before = s.links.len();
        s.links.retain(|l| l.name != name);
        if s.links.len() == before {
            return Err(CnciError::kernel("destroy", name, "Cannot find device"));
        }
        Ok(())
    }

    async fn addr_list(&self, name: &str) -> CnciResult<Vec<Ipv4Net>> {
        let mut s = self.lock();
        s.record("addr_list", name)?;
        s.find(name)
            .map(|l| l.addrs.clone())
            .ok_or_else(|| CnciError::kernel("addr list", name, "Cannot find device"))
    }

    async fn addr_add(&self, name: &str, addr: &Ipv4Net) -> CnciResult<()> {
        let mut s = self.lock();
        s.record("addr_add", name)?;
        match s.find_mut(name) {
            Some(link) => {
                if !link.addrs.contains(addr) {
                    link.addrs.push(*addr);
                }
                Ok(())
            }
            None => Err(CnciError::kernel("addr add", name, "Cannot find device")),
        }
    }

    async fn addr_del(&self, name: &str, addr: &Ipv4Net) -> CnciResult<()> {
        let mut s = self.lock();
        s.record("addr_del", name)?;
        match s.find_mut(name) {
            Some(link) => {
                link.addrs.retain(|a| a != addr);
                Ok(())
            }
            None => Err(CnciError::kernel("addr del", name, "Cannot find device")),
        }
    }

    async fn neigh_list(&self, name: &str) -> CnciResult<Vec<KernelNeighbor>> {
        let mut s = self.lock();
        s.record("neigh_list", name)?;
        s.find(name)
            .map(|l| l.neighbors.clone())
            .ok_or_else(|| CnciError::kernel("neigh list", name, "Cannot find device"))
    }

    async fn neigh_add(&self, name: &str, dst: Ipv4Addr, lladdr: Ipv4Addr) -> CnciResult<()> {
        let mut s = self.lock();
        s.record("neigh_add", name)?;
        match s.find_mut(name) {
            Some(link) => {
                link.neighbors.retain(|n| n.dst != dst);
                link.neighbors.push(KernelNeighbor {
                    dst,
                    lladdr: Some(lladdr),
                    permanent: true,
                });
                Ok(())
            }
            None => Err(CnciError::kernel("neigh add", name, "Cannot find device")),
        }
    }

    async fn neigh_del(&self, name: &str, dst: Ipv4Addr) -> CnciResult<()> {
        let mut s = self.lock();
        s.record("neigh_del", name)?;
        match s.find_mut(name) {
            Some(link) => {
                let before = link.neighbors.len();
                link.neighbors.retain(|n| n.dst != dst);
                if link.neighbors.len() == before {
                    return Err(CnciError::kernel("neigh del", name, "No such entry"));
                }
                Ok(())
            }
            None => Err(CnciError::kernel("neigh del", name, "Cannot find device")),
        }
    }

    async fn route_list(&self) -> CnciResult<Vec<KernelRoute>> {
        let mut s = self.lock();
        s.record("route_list", "-")?;
        Ok(s.routes.clone())
    }

    async fn route_add_dev(&self, dst: &Ipv4Net, dev: &str) -> CnciResult<()> {
        let mut s = self.lock();
        s.record("route_add_dev", dev)?;
        s.routes.retain(|r| r.dst != *dst);
        s.routes.push(KernelRoute {
            dst: *dst,
            via: None,
            dev: Some(dev.to_string()),
        });
        Ok(())
    }

    async fn route_add_via(&self, dst: &Ipv4Net, via: Ipv4Addr) -> CnciResult<()> {
        let mut s = self.lock();
        s.record("route_add_via", "-")?;
        s.routes.retain(|r| r.dst != *dst);
        s.routes.push(KernelRoute {
            dst: *dst,
            via: Some(via),
            dev: None,
        });
        Ok(())
    }

    async fn route_del(&self, dst: &Ipv4Net) -> CnciResult<()> {
        let mut s = self.lock();
        s.record("route_del", "-")?;
        let before = s.routes.len();
        s.routes.retain(|r| r.dst != *dst);
        if s.routes.len() == before {
            return Err(CnciError::kernel("route del", "-", "No such route"));
        }
        Ok(())
    }

    async fn enable_forwarding(&self) -> CnciResult<()> {
        let mut s = self.lock();
        s.record("enable_forwarding", "-")?;
        Ok(())
    }
}
