//! Per-bridge DHCP/DNS supervision
//!
//! Every subnet bridge owns exactly one dnsmasq instance serving tenant
//! leases. The supervisor first tries to attach to an instance left over
//! from a previous process (crash recovery keeps leases warm); only when
//! that fails does it start a fresh one.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use cnci_common::{shell, CnciError, CnciResult};

/// Identity of one DHCP instance. The alias keys the runtime files, so the
/// instance can be found again after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpHandle {
    /// Alias of the bridge the instance is bound to.
    pub bridge_alias: String,
    /// Tenant the leases belong to.
    pub tenant: Uuid,
    /// The subnet served.
    pub subnet: Ipv4Net,
}

impl DhcpHandle {
    pub fn new(bridge_alias: impl Into<String>, tenant: Uuid, subnet: Ipv4Net) -> Self {
        Self {
            bridge_alias: bridge_alias.into(),
            tenant,
            subnet,
        }
    }
}

/// DHCP supervision consumed by the topology core.
#[async_trait]
pub trait DhcpLauncher: Send + Sync {
    /// Attaches to a running instance for this bridge, or (re)starts one.
    async fn start_or_attach(&self, bridge_name: &str, handle: &DhcpHandle) -> CnciResult<()>;

    /// Terminates the instance and removes its runtime files.
    async fn stop(&self, handle: &DhcpHandle) -> CnciResult<()>;
}

/// Computes the lease range handed out on a subnet: the first address after
/// the gateway up to the last address before broadcast.
pub fn dhcp_range(subnet: &Ipv4Net) -> (Ipv4Addr, Ipv4Addr) {
    let network = u32::from(subnet.network());
    let broadcast = u32::from(subnet.broadcast());
    let start = Ipv4Addr::from(network.saturating_add(2).min(broadcast));
    let end = Ipv4Addr::from(broadcast.saturating_sub(1).max(network));
    (start, end)
}

/// Production launcher driving dnsmasq with per-bridge runtime files.
#[derive(Debug)]
pub struct DnsmasqLauncher {
    state_dir: PathBuf,
}

impl DnsmasqLauncher {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    fn pid_path(&self, handle: &DhcpHandle) -> PathBuf {
        self.state_dir.join(format!("{}.pid", handle.bridge_alias))
    }

    fn conf_path(&self, handle: &DhcpHandle) -> PathBuf {
        self.state_dir.join(format!("{}.conf", handle.bridge_alias))
    }

    fn lease_path(&self, handle: &DhcpHandle) -> PathBuf {
        self.state_dir
            .join(format!("{}.leases", handle.bridge_alias))
    }

    fn render_config(&self, bridge_name: &str, handle: &DhcpHandle) -> String {
        let (start, end) = dhcp_range(&handle.subnet);
        format!(
            "interface={}\n\
             bind-interfaces\n\
             except-interface=lo\n\
             pid-file={}\n\
             dhcp-leasefile={}\n\
             dhcp-range={},{},{},1h\n\
             # tenant {}\n",
            bridge_name,
            self.pid_path(handle).display(),
            self.lease_path(handle).display(),
            start,
            end,
            handle.subnet.netmask(),
            handle.tenant,
        )
    }

    async fn read_pid(&self, path: &Path) -> Option<i32> {
        let contents = fs::read_to_string(path).await.ok()?;
        contents.trim().parse().ok()
    }

    async fn pid_alive(&self, pid: i32) -> bool {
        match shell::exec(&format!("{} -0 {}", shell::KILL_CMD, pid)).await {
            Ok(result) => result.success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl DhcpLauncher for DnsmasqLauncher {
    async fn start_or_attach(&self, bridge_name: &str, handle: &DhcpHandle) -> CnciResult<()> {
        let pid_path = self.pid_path(handle);

        if let Some(pid) = self.read_pid(&pid_path).await {
            if self.pid_alive(pid).await {
                info!(
                    bridge = %handle.bridge_alias,
                    pid = pid,
                    "Attached to running dnsmasq"
                );
                return Ok(());
            }
            warn!(
                bridge = %handle.bridge_alias,
                pid = pid,
                "Stale dnsmasq pidfile, restarting"
            );
            let _ = fs::remove_file(&pid_path).await;
        }

        fs::create_dir_all(&self.state_dir)
            .await
            .map_err(|e| CnciError::dhcp(&handle.bridge_alias, e.to_string()))?;

        let conf_path = self.conf_path(handle);
        fs::write(&conf_path, self.render_config(bridge_name, handle))
            .await
            .map_err(|e| CnciError::dhcp(&handle.bridge_alias, e.to_string()))?;

        let cmd = format!(
            "{} --conf-file={}",
            shell::DNSMASQ_CMD,
            shell::shellquote(&conf_path.display().to_string())
        );
        shell::exec_or_throw(&cmd)
            .await
            .map_err(|e| CnciError::dhcp(&handle.bridge_alias, e.to_string()))?;

        info!(bridge = %handle.bridge_alias, subnet = %handle.subnet, "Started dnsmasq");
        Ok(())
    }

    async fn stop(&self, handle: &DhcpHandle) -> CnciResult<()> {
        let pid_path = self.pid_path(handle);

        if let Some(pid) = self.read_pid(&pid_path).await {
            let result = shell::exec(&format!("{} {}", shell::KILL_CMD, pid))
                .await
                .map_err(|e| CnciError::dhcp(&handle.bridge_alias, e.to_string()))?;
            if !result.success() {
                warn!(
                    bridge = %handle.bridge_alias,
                    pid = pid,
                    "dnsmasq already gone"
                );
            }
        }

        let _ = fs::remove_file(&pid_path).await;
        let _ = fs::remove_file(self.conf_path(handle)).await;
        let _ = fs::remove_file(self.lease_path(handle)).await;

        info!(bridge = %handle.bridge_alias, "Stopped dnsmasq");
        Ok(())
    }
}
