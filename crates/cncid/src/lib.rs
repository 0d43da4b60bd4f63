//! Per-tenant overlay network concentrator.
//!
//! A concentrator owns the software-defined overlay connecting one tenant's
//! compute nodes: for every tenant subnet it maintains a local bridge with
//! an attached DHCP/DNS instance, stitches remote compute nodes into the
//! subnet through keyed GRE taps, and reaches peer concentrators over a
//! single point-to-multipoint GRE tunnel.
//!
//! The topology lives in a concurrency-safe store ([`topology::Topology`])
//! whose entries carry durable aliases; after a restart the whole model is
//! reconstructed from the kernel's alias attributes alone
//! ([`Concentrator::rebuild_topology`]).
//!
//! Kernel access and DHCP supervision sit behind traits
//! ([`kernel::NetKernel`], [`dhcp::DhcpLauncher`]) so the core can be
//! exercised against an in-memory host in tests.

pub mod commands;
pub mod concentrator;
pub mod config;
pub mod devices;
pub mod dhcp;
pub mod gate;
pub mod kernel;
pub mod mesh;
pub mod naming;
pub mod topology;
pub mod types;

pub use concentrator::Concentrator;
pub use config::Config;
pub use types::Neighbor;
