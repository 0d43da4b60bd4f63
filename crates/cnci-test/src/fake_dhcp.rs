//! DHCP supervisor double

use std::sync::Mutex;

use async_trait::async_trait;

use cnci_common::{CnciError, CnciResult};
use cncid::dhcp::{DhcpHandle, DhcpLauncher};

#[derive(Default)]
struct DhcpState {
    running: Vec<DhcpHandle>,
    start_calls: u32,
    stop_calls: u32,
    fail_start: bool,
    fail_stop: bool,
}

/// Tracks one pretend dnsmasq per bridge alias.
#[derive(Default)]
pub struct FakeDhcp {
    state: Mutex<DhcpState>,
}

impl FakeDhcp {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DhcpState> {
        self.state.lock().expect("fake dhcp mutex poisoned")
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.lock().fail_start = fail;
    }

    pub fn set_fail_stop(&self, fail: bool) {
        self.lock().fail_stop = fail;
    }

    pub fn start_calls(&self) -> u32 {
        self.lock().start_calls
    }

    pub fn stop_calls(&self) -> u32 {
        self.lock().stop_calls
    }

    pub fn running_count(&self) -> usize {
        self.lock().running.len()
    }

    pub fn is_running(&self, bridge_alias: &str) -> bool {
        self.lock()
            .running
            .iter()
            .any(|h| h.bridge_alias == bridge_alias)
    }
}

#[async_trait]
impl DhcpLauncher for FakeDhcp {
    async fn start_or_attach(&self, _bridge_name: &str, handle: &DhcpHandle) -> CnciResult<()> {
        let mut s = self.lock();
        s.start_calls += 1;
        if s.fail_start {
            return Err(CnciError::dhcp(&handle.bridge_alias, "injected failure"));
        }
        // At most one instance per bridge: attaching twice is fine.
        if !s
            .running
            .iter()
            .any(|h| h.bridge_alias == handle.bridge_alias)
        {
            s.running.push(handle.clone());
        }
        Ok(())
    }

    async fn stop(&self, handle: &DhcpHandle) -> CnciResult<()> {
        let mut s = self.lock();
        s.stop_calls += 1;
        if s.fail_stop {
            return Err(CnciError::dhcp(&handle.bridge_alias, "injected failure"));
        }
        s.running.retain(|h| h.bridge_alias != handle.bridge_alias);
        Ok(())
    }
}
