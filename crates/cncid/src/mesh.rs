//! Peer mesh reconciliation over the point-to-multipoint tunnel
//!
//! Every call converges the tunnel, its neighbor table and its routes onto
//! the controller's view. The local entry is handled first: confirming the
//! tunnel yields the device all remaining steps operate on. Stale-entry
//! removal is best effort; a peer that already vanished must not abort
//! reconciliation of the rest.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tracing::{debug, info, warn};

use cnci_common::{CnciError, CnciResult};

use crate::concentrator::Concentrator;
use crate::devices::GreTun;
use crate::kernel::KernelNeighbor;
use crate::types::{Neighbor, PEER_TUNNEL_NAME, PEER_TUNNEL_PREFIX_LEN};

impl Concentrator {
    /// Confirms or repairs the peer tunnel, installs a PERMANENT neighbor
    /// and route pair for every remote peer, and removes entries for peers
    /// no longer in the list. Repeated calls with the same list are no-ops.
    pub async fn update_neighbors(&self, neighbors: &[Neighbor]) -> CnciResult<()> {
        let local_addr = self.compute_address()?;
        let local = neighbors
            .iter()
            .find(|n| n.physical_ip == local_addr)
            .ok_or_else(|| {
                CnciError::invalid_input(
                    "neighbors",
                    format!("no entry matches the local compute address {}", local_addr),
                )
            })?;

        self.confirm_tunnel(local).await?;

        let existing = self.kernel().neigh_list(PEER_TUNNEL_NAME).await?;

        let mut confirmed = HashSet::new();
        for neighbor in neighbors.iter().filter(|n| n.physical_ip != local_addr) {
            self.confirm_neighbor(&existing, neighbor).await?;
            confirmed.insert(neighbor.tunnel_ip);
        }

        self.confirm_routes(&existing, &confirmed).await;
        Ok(())
    }

    /// Ensures the tunnel device exists and carries exactly one address:
    /// the local tunnel IP.
    async fn confirm_tunnel(&self, local: &Neighbor) -> CnciResult<()> {
        let kernel = self.kernel();
        let mut tun = GreTun::new(local.physical_ip, local.tunnel_id);

        if !tun.get_device(kernel).await? {
            info!(key = local.tunnel_id, "Creating peer tunnel");
            tun.create(kernel).await?;
            tun.enable(kernel).await?;
            if !tun.get_device(kernel).await? {
                return Err(CnciError::kernel(
                    "get_device",
                    PEER_TUNNEL_NAME,
                    "tunnel missing after creation",
                ));
            }
        }

        let want = Ipv4Net::new(local.tunnel_ip, PEER_TUNNEL_PREFIX_LEN)
            .map_err(|e| CnciError::invalid_input("tunnel_ip", e.to_string()))?;

        let mut present = false;
        for addr in kernel.addr_list(PEER_TUNNEL_NAME).await? {
            if addr == want {
                present = true;
            } else {
                warn!(addr = %addr, "Removing unexpected address from peer tunnel");
                kernel.addr_del(PEER_TUNNEL_NAME, &addr).await?;
            }
        }
        if !present {
            kernel.addr_add(PEER_TUNNEL_NAME, &want).await?;
        }
        Ok(())
    }

    /// Installs the neighbor entry and its host/subnet routes for one peer,
    /// unless an identical PERMANENT entry is already in place.
    async fn confirm_neighbor(
        &self,
        existing: &[KernelNeighbor],
        neighbor: &Neighbor,
    ) -> CnciResult<()> {
        let kernel = self.kernel();
        let already = existing.iter().any(|e| {
            e.permanent && e.dst == neighbor.tunnel_ip && e.lladdr == Some(neighbor.physical_ip)
        });
        if already {
            debug!(peer = %neighbor.tunnel_ip, "Neighbor already confirmed");
            return Ok(());
        }

        kernel
            .neigh_add(PEER_TUNNEL_NAME, neighbor.tunnel_ip, neighbor.physical_ip)
            .await?;
        kernel
            .route_add_dev(&Ipv4Net::from(neighbor.tunnel_ip), PEER_TUNNEL_NAME)
            .await?;
        kernel
            .route_add_via(&neighbor.subnet, neighbor.tunnel_ip)
            .await?;

        info!(
            peer = %neighbor.tunnel_ip,
            endpoint = %neighbor.physical_ip,
            subnet = %neighbor.subnet,
            "Confirmed neighbor"
        );
        Ok(())
    }

    /// Removes neighbors that dropped out of the list, along with any route
    /// whose destination or gateway is their tunnel IP. Deletion failures
    /// are logged and skipped.
    async fn confirm_routes(&self, existing: &[KernelNeighbor], confirmed: &HashSet<Ipv4Addr>) {
        let kernel = self.kernel();
        let stale: Vec<_> = existing
            .iter()
            .filter(|e| e.permanent && !confirmed.contains(&e.dst))
            .collect();
        if stale.is_empty() {
            return;
        }

        let routes = match kernel.route_list().await {
            Ok(routes) => routes,
            Err(e) => {
                warn!(error = %e, "Cannot list routes, skipping stale cleanup");
                return;
            }
        };

        for entry in stale {
            info!(peer = %entry.dst, "Removing stale neighbor");
            if let Err(e) = kernel.neigh_del(PEER_TUNNEL_NAME, entry.dst).await {
                warn!(peer = %entry.dst, error = %e, "Stale neighbor removal failed");
            }
            for route in routes
                .iter()
                .filter(|r| r.dst == Ipv4Net::from(entry.dst) || r.via == Some(entry.dst))
            {
                if let Err(e) = kernel.route_del(&route.dst).await {
                    warn!(route = %route.dst, error = %e, "Stale route removal failed");
                }
            }
        }
    }
}
