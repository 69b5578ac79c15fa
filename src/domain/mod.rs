//! Core domain types and ports

pub mod ports;
pub mod types;

pub use ports::{DeviceProber, DeviceProberRef, PoolBackend, PoolBackendRef};
pub use types::*;
