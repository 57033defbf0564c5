//! vmesh: distributed VM orchestration over a peer-to-peer control mesh.
//!
//! vmesh launches and supervises virtual machines — full KVM/QEMU guests
//! and lightweight container VMs — across a cluster of hosts, together
//! with the OpenvSwitch bridges, taps, tunnels, and `tc` shaping rules
//! that wire them together. Hosts discover each other over a gossip mesh;
//! any host can drive the whole cluster.
//!
//! # Example: launch a VM
//!
//! ```no_run
//! use std::sync::Arc;
//! use vmesh::engine::{Engine, EngineConfig};
//! use vmesh::process::HostTools;
//!
//! #[tokio::main]
//! async fn main() -> vmesh::Result<()> {
//!     let config = EngineConfig::new("/tmp/vmesh", "host0");
//!     let engine = Engine::new(config, Arc::new(HostTools));
//!     engine.start(true).await?;
//!
//!     engine.queue_launch("kvm", "t1").await?;
//!     engine.launch_queued().await?;
//!     Ok(())
//! }
//! ```
//!
//! The interactive front end drives the same engine through compiled
//! commands; see [`command::compile`] and [`dispatch::dispatch`].

// Core plumbing
pub mod error;
pub mod process;

// Network plane
pub mod bridge;
pub mod qos;

// VM lifecycle
pub mod qmp;
pub mod vm;

// Cluster control
pub mod mesh;
pub mod namespace;
pub mod scheduler;

// Command plumbing
pub mod command;
pub mod control;
pub mod dispatch;
pub mod engine;

// External tool surfaces
pub mod disk;

pub use error::{Error, Result};

/// Build date baked into `version` output.
pub const BUILD_DATE: &str = "2026-08-01";

/// Prelude for embedding the orchestrator.
pub mod prelude {
    pub use crate::engine::{Engine, EngineConfig};
    pub use crate::error::{Error, Result};
    pub use crate::process::{HostTools, ToolRunner};
    pub use crate::scheduler::{CommitMetric, HostStats, QueuedVms};
    pub use crate::vm::{VmConfig, VmState};
}
