//! Homepool
//!
//! Storage-lifecycle core for a home-server appliance: manages the
//! installation's one storage pool across internal NVMe devices, from
//! initial setup through capacity expansion and the live transition to a
//! mirrored failsafe layout.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      REST API (axum)                     │
//! ├──────────────────────────────────────────────────────────┤
//! │                     RAID Manager                         │
//! │   setup / expand / failsafe transition / status          │
//! │   one in-flight operation, durable transition marker     │
//! ├──────────────────┬───────────────────┬───────────────────┤
//! │  Device Prober   │  Pool Resolver    │   Config Store    │
//! │  (lsblk, by-id)  │  (identity match) │   (YAML, atomic)  │
//! ├──────────────────┴───────────────────┴───────────────────┤
//! │          Pool Backend (ZFS CLI | in-memory sim)          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Devices are always addressed by hardware-intrinsic identity (the
//! `/dev/disk/by-id` name), never by bus position, so physically
//! rearranging drives changes nothing about pool membership.

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod hardware;
pub mod pool;
pub mod raid;

pub use api::{ApiServer, ApiServerConfig};
pub use config::ConfigStore;
pub use error::{Error, Result};
pub use raid::{ManagerConfig, RaidManager};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
