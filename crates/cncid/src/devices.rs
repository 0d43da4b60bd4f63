//! Thin device adapters over the kernel seam
//!
//! One wrapper per device kind the concentrator manages. The wrappers hold
//! the logical alias alongside the kernel identity and tag every failure
//! with the alias, so errors surfacing from deep inside an operation still
//! point at the device the caller asked about. Idempotence is decided by the
//! topology store; these adapters always issue the kernel call.

use std::net::Ipv4Addr;

use cnci_common::{CnciError, CnciResult};

use crate::kernel::NetKernel;
use crate::types::PEER_TUNNEL_NAME;

fn wrap(operation: &str, alias: &str, err: CnciError) -> CnciError {
    CnciError::kernel(operation, alias, err.to_string())
}

/// L2 bridge carrying one tenant subnet.
#[derive(Debug, Clone)]
pub struct Bridge {
    /// Durable alias, `br_<subnet-encoded>`.
    pub alias: String,
    /// Kernel device name.
    pub name: String,
    /// Kernel interface index; 0 until known.
    pub index: u32,
}

impl Bridge {
    pub fn new(alias: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            name: name.into(),
            index: 0,
        }
    }

    pub async fn create(&self, kernel: &dyn NetKernel) -> CnciResult<()> {
        kernel
            .bridge_create(&self.name, &self.alias)
            .await
            .map_err(|e| wrap("create", &self.alias, e))
    }

    pub async fn enable(&self, kernel: &dyn NetKernel) -> CnciResult<()> {
        kernel
            .link_enable(&self.name)
            .await
            .map_err(|e| wrap("enable", &self.alias, e))
    }

    /// Populates `name` and `index` from the kernel, addressing by alias.
    pub async fn get_device(&mut self, kernel: &dyn NetKernel) -> CnciResult<()> {
        let link = kernel
            .link_by_alias(&self.alias)
            .await
            .map_err(|e| wrap("get_device", &self.alias, e))?
            .ok_or_else(|| {
                CnciError::kernel("get_device", &self.alias, "no device carries this alias")
            })?;
        self.name = link.name;
        self.index = link.index;
        Ok(())
    }

    pub async fn destroy(&self, kernel: &dyn NetKernel) -> CnciResult<()> {
        kernel
            .link_destroy(&self.name)
            .await
            .map_err(|e| wrap("destroy", &self.alias, e))
    }
}

/// L2-over-GRE tap stitching one remote compute node into a subnet bridge.
#[derive(Debug, Clone)]
pub struct GreTap {
    /// Durable alias, `gre_<subnet-encoded>##<peer-ip>`.
    pub alias: String,
    /// Kernel device name.
    pub name: String,
    /// Kernel interface index; 0 until known.
    pub index: u32,
    /// Local tunnel endpoint (the concentrator's compute address).
    pub local: Ipv4Addr,
    /// Remote tunnel endpoint (the compute node).
    pub remote: Ipv4Addr,
    /// GRE key carrying the subnet identifier.
    pub key: u32,
}

impl GreTap {
    pub fn new(
        alias: impl Into<String>,
        name: impl Into<String>,
        local: Ipv4Addr,
        remote: Ipv4Addr,
        key: u32,
    ) -> Self {
        Self {
            alias: alias.into(),
            name: name.into(),
            index: 0,
            local,
            remote,
            key,
        }
    }

    pub async fn create(&self, kernel: &dyn NetKernel) -> CnciResult<()> {
        kernel
            .gretap_create(&self.name, &self.alias, self.local, self.remote, self.key)
            .await
            .map_err(|e| wrap("create", &self.alias, e))
    }

    pub async fn enable(&self, kernel: &dyn NetKernel) -> CnciResult<()> {
        kernel
            .link_enable(&self.name)
            .await
            .map_err(|e| wrap("enable", &self.alias, e))
    }

    /// Attaches the tap to its bridge. Traffic starts flowing here, so this
    /// must be the last step of a subnet add.
    pub async fn attach(&self, kernel: &dyn NetKernel, bridge_name: &str) -> CnciResult<()> {
        kernel
            .link_attach(&self.name, bridge_name)
            .await
            .map_err(|e| wrap("attach", &self.alias, e))
    }

    pub async fn get_device(&mut self, kernel: &dyn NetKernel) -> CnciResult<()> {
        let link = kernel
            .link_by_alias(&self.alias)
            .await
            .map_err(|e| wrap("get_device", &self.alias, e))?
            .ok_or_else(|| {
                CnciError::kernel("get_device", &self.alias, "no device carries this alias")
            })?;
        self.name = link.name;
        self.index = link.index;
        Ok(())
    }

    pub async fn destroy(&self, kernel: &dyn NetKernel) -> CnciResult<()> {
        kernel
            .link_destroy(&self.name)
            .await
            .map_err(|e| wrap("destroy", &self.alias, e))
    }
}

/// The single point-to-multipoint GRE tunnel reaching peer concentrators.
#[derive(Debug, Clone)]
pub struct GreTun {
    /// Kernel interface index; 0 until known.
    pub index: u32,
    /// Local tunnel endpoint.
    pub local: Ipv4Addr,
    /// GRE key identifying the tenant.
    pub key: u32,
}

impl GreTun {
    pub fn new(local: Ipv4Addr, key: u32) -> Self {
        Self {
            index: 0,
            local,
            key,
        }
    }

    pub async fn create(&self, kernel: &dyn NetKernel) -> CnciResult<()> {
        kernel
            .gretun_create(PEER_TUNNEL_NAME, self.local, self.key)
            .await
            .map_err(|e| wrap("create", PEER_TUNNEL_NAME, e))
    }

    pub async fn enable(&self, kernel: &dyn NetKernel) -> CnciResult<()> {
        kernel
            .link_enable(PEER_TUNNEL_NAME)
            .await
            .map_err(|e| wrap("enable", PEER_TUNNEL_NAME, e))
    }

    /// Populates `index` from the kernel, addressing by the fixed name.
    pub async fn get_device(&mut self, kernel: &dyn NetKernel) -> CnciResult<bool> {
        match kernel
            .link_by_name(PEER_TUNNEL_NAME)
            .await
            .map_err(|e| wrap("get_device", PEER_TUNNEL_NAME, e))?
        {
            Some(link) => {
                self.index = link.index;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn destroy(&self, kernel: &dyn NetKernel) -> CnciResult<()> {
        kernel
            .link_destroy(PEER_TUNNEL_NAME)
            .await
            .map_err(|e| wrap("destroy", PEER_TUNNEL_NAME, e))
    }
}

/// Generic tap interface handed to a workload.
#[derive(Debug, Clone)]
pub struct Vnic {
    /// Durable alias.
    pub alias: String,
    /// Kernel device name.
    pub name: String,
    /// Kernel interface index; 0 until known.
    pub index: u32,
}

impl Vnic {
    pub fn new(alias: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            name: name.into(),
            index: 0,
        }
    }

    pub async fn create(&self, kernel: &dyn NetKernel) -> CnciResult<()> {
        kernel
            .tap_create(&self.name, &self.alias)
            .await
            .map_err(|e| wrap("create", &self.alias, e))
    }

    pub async fn enable(&self, kernel: &dyn NetKernel) -> CnciResult<()> {
        kernel
            .link_enable(&self.name)
            .await
            .map_err(|e| wrap("enable", &self.alias, e))
    }

    pub async fn attach(&self, kernel: &dyn NetKernel, bridge_name: &str) -> CnciResult<()> {
        kernel
            .link_attach(&self.name, bridge_name)
            .await
            .map_err(|e| wrap("attach", &self.alias, e))
    }

    pub async fn get_device(&mut self, kernel: &dyn NetKernel) -> CnciResult<()> {
        let link = kernel
            .link_by_alias(&self.alias)
            .await
            .map_err(|e| wrap("get_device", &self.alias, e))?
            .ok_or_else(|| {
                CnciError::kernel("get_device", &self.alias, "no device carries this alias")
            })?;
        self.name = link.name;
        self.index = link.index;
        Ok(())
    }

    pub async fn destroy(&self, kernel: &dyn NetKernel) -> CnciResult<()> {
        kernel
            .link_destroy(&self.name)
            .await
            .map_err(|e| wrap("destroy", &self.alias, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cnci_test::FakeKernel;

    #[tokio::test]
    async fn test_bridge_lifecycle() {
        let kernel = FakeKernel::new();
        let mut bridge = Bridge::new("br_10.1.0.0+24", "cncibr01");

        bridge.create(&kernel).await.unwrap();
        bridge.enable(&kernel).await.unwrap();
        bridge.get_device(&kernel).await.unwrap();
        assert!(bridge.index > 0);
        assert_eq!(bridge.name, "cncibr01");

        bridge.destroy(&kernel).await.unwrap();
        assert!(kernel.link("cncibr01").is_none());
    }

    #[tokio::test]
    async fn test_bridge_get_device_missing_alias() {
        let kernel = FakeKernel::new();
        let mut bridge = Bridge::new("br_10.1.0.0+24", "cncibr01");

        let err = bridge.get_device(&kernel).await.unwrap_err();
        match err {
            CnciError::Kernel { alias, .. } => assert_eq!(alias, "br_10.1.0.0+24"),
            other => panic!("expected kernel error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_gretap_attach() {
        let kernel = FakeKernel::new();
        let bridge = Bridge::new("br_10.1.0.0+24", "cncibr01");
        bridge.create(&kernel).await.unwrap();

        let tap = GreTap::new(
            "gre_10.1.0.0+24##10.0.0.7",
            "cncigt01",
            "10.0.0.1".parse().unwrap(),
            "10.0.0.7".parse().unwrap(),
            42,
        );
        tap.create(&kernel).await.unwrap();
        tap.attach(&kernel, "cncibr01").await.unwrap();

        assert_eq!(kernel.master_of("cncigt01").as_deref(), Some("cncibr01"));
    }

    #[tokio::test]
    async fn test_gretun_get_device_absent_then_present() {
        let kernel = FakeKernel::new();
        let mut tun = GreTun::new("10.0.0.1".parse().unwrap(), 7);

        assert!(!tun.get_device(&kernel).await.unwrap());

        tun.create(&kernel).await.unwrap();
        assert!(tun.get_device(&kernel).await.unwrap());
        assert!(tun.index > 0);
    }

    #[tokio::test]
    async fn test_vnic_lifecycle() {
        let kernel = FakeKernel::new();
        let bridge = Bridge::new("br_10.1.0.0+24", "cncibr01");
        bridge.create(&kernel).await.unwrap();

        let mut vnic = Vnic::new("vnic_test", "tap0");
        vnic.create(&kernel).await.unwrap();
        vnic.enable(&kernel).await.unwrap();
        vnic.attach(&kernel, "cncibr01").await.unwrap();
        vnic.get_device(&kernel).await.unwrap();
        assert!(vnic.index > 0);

        vnic.destroy(&kernel).await.unwrap();
        assert!(kernel.link("tap0").is_none());
    }
}
