//! Domain Ports - trait definitions for the storage core
//!
//! These traits define the boundaries between the lifecycle logic and the
//! physical world. Adapters implement them: `hardware::prober` for device
//! enumeration, `pool::zfs` for the real pool tooling and `pool::memory`
//! for the in-memory backend used in standalone mode and tests.
//!
//! Every method on `PoolBackend` is an out-of-process call with no latency
//! bound; callers must not hold any exclusive lock across these awaits.

use crate::domain::types::{PoolSignature, PoolState, RaidType, RecoveryDevice, StorageDevice};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

// =============================================================================
// Device Prober Port
// =============================================================================

/// Port for enumerating physically attached internal storage devices.
///
/// Probing is idempotent and side-effect free. Devices that are present
/// but unreadable are omitted from the result, never fatal to the call.
#[async_trait]
pub trait DeviceProber: Send + Sync {
    /// Enumerate all internal storage devices, sorted by stable id
    async fn get_devices(&self) -> Result<Vec<StorageDevice>>;
}

// =============================================================================
// Pool Backend Port
// =============================================================================

/// Port for the underlying pooled-storage tooling.
///
/// The backend never decides which pool belongs to this installation; it
/// only reports what is physically present and executes operations on a
/// pool named by the caller.
#[async_trait]
pub trait PoolBackend: Send + Sync {
    /// Scan every pool signature visible on attached hardware, active and
    /// importable alike. Includes foreign pools; filtering by ownership is
    /// the resolver's job.
    async fn scan_signatures(&self) -> Result<Vec<PoolSignature>>;

    /// Live state of a pool, or `None` if no pool with this id is present.
    async fn pool_state(&self, pool_id: &str) -> Result<Option<PoolState>>;

    /// Partition a device for pool membership and return the member handle
    /// to pass to the pool operations. The data partition is sized from
    /// `rounded_size_bytes` so nominally-identical drives from different
    /// vendors produce interchangeable members.
    async fn prepare_member(&self, device_id: &str, rounded_size_bytes: u64) -> Result<String>;

    /// Create a pool with `pool_id` embedded in its own metadata
    async fn create_pool(&self, pool_id: &str, members: &[String], raid_type: RaidType)
        -> Result<()>;

    /// Extend a storage-mode pool with an additional member (stripe).
    /// Existing members are never removed, relabeled, or resized.
    async fn extend_pool(&self, pool_id: &str, member: &str) -> Result<()>;

    /// Attach `new_member` as a mirror of the member living on
    /// `existing_device_id`, beginning the live storage-to-failsafe
    /// migration. Resilver progress subsequently appears in `pool_state`.
    async fn attach_mirror(
        &self,
        pool_id: &str,
        existing_device_id: &str,
        new_member: &str,
    ) -> Result<()>;

    /// Replace the member living on `old_device_id` with `new_member`,
    /// rebuilding its data onto the new device. The old member stays in
    /// the pool until the rebuild completes; resilver progress
    /// subsequently appears in `pool_state`.
    async fn replace_member(
        &self,
        pool_id: &str,
        old_device_id: &str,
        new_member: &str,
    ) -> Result<()>;

    /// Tell the pool to claim any extra capacity on the member living on
    /// `device_id`, after a replacement onto a larger device.
    async fn expand_member(&self, pool_id: &str, device_id: &str) -> Result<()>;

    /// Per-device health of an importable (not currently active) pool, as
    /// reported by an import scan. Used by the boot-time mount-failure
    /// check to point at the member that kept the pool from coming up.
    async fn scan_import_health(&self, pool_id: &str) -> Result<Vec<RecoveryDevice>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type DeviceProberRef = Arc<dyn DeviceProber>;
pub type PoolBackendRef = Arc<dyn PoolBackend>;
