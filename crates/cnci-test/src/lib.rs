//! Test infrastructure for the concentrator daemon
//!
//! Provides:
//! - [`FakeKernel`]: an in-memory host network stack with failure injection
//!   and per-operation call counting
//! - [`FakeDhcp`]: a DHCP supervisor double tracking instances per bridge
//! - [`fixtures`]: configuration and neighbor builders plus a ready-to-use
//!   initialized concentrator

mod fake_dhcp;
mod fake_kernel;
pub mod fixtures;

pub use fake_dhcp::FakeDhcp;
pub use fake_kernel::{FakeKernel, FakeLink};
pub use fixtures::*;
