//! Domain types for the storage-lifecycle core
//!
//! These are the shared vocabulary between the device prober, the pool
//! backend, the lifecycle manager, and the REST surface. `RaidStatus` and
//! everything hanging off it is derived on every poll and never persisted;
//! `PoolIdentity` and `SetupIntent` are the only persisted records.

use serde::{Deserialize, Serialize};

// =============================================================================
// Redundancy Level
// =============================================================================

/// Redundancy level of the pool. This is a closed set: `storage` is the
/// non-redundant capacity-optimized layout, `failsafe` is the mirrored
/// layout that survives a single device failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidType {
    Storage,
    Failsafe,
}

impl std::fmt::Display for RaidType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaidType::Storage => write!(f, "storage"),
            RaidType::Failsafe => write!(f, "failsafe"),
        }
    }
}

// =============================================================================
// Pool Health
// =============================================================================

/// Health of the pool or an individual member, as reported by the pool
/// tooling. `Absent` is only used at the aggregate level when no pool
/// resolves for this installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PoolHealth {
    Online,
    Degraded,
    Faulted,
    Absent,
}

impl std::fmt::Display for PoolHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolHealth::Online => write!(f, "ONLINE"),
            PoolHealth::Degraded => write!(f, "DEGRADED"),
            PoolHealth::Faulted => write!(f, "FAULTED"),
            PoolHealth::Absent => write!(f, "ABSENT"),
        }
    }
}

// =============================================================================
// Storage Devices
// =============================================================================

/// A physically attached internal block device, refreshed on every probe.
///
/// `id` is derived from hardware-intrinsic data (the `/dev/disk/by-id`
/// name, which encodes model and serial) and is invariant across reboots
/// and physical slot moves. `slot` is the current physical bay and changes
/// when the drive is relocated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageDevice {
    /// Stable identity (e.g. `nvme-Samsung_SSD_990_PRO_2TB-S6Z1NJ0W123456`)
    pub id: String,
    /// Physical bay number, if the chassis exposes one
    pub slot: Option<u32>,
    /// Model name
    pub model: String,
    /// Serial number
    pub serial: String,
    /// Size as reported by the device
    pub raw_size_bytes: u64,
    /// Size normalized onto the coarse capacity grid (see `hardware::sizing`)
    pub rounded_size_bytes: u64,
}

// =============================================================================
// Pool Identity (persisted)
// =============================================================================

/// Persisted record identifying the one pool owned by this installation.
/// Written exactly once at initial setup; any pool signature on attached
/// hardware whose embedded id does not match is a foreign pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolIdentity {
    /// Opaque identifier embedded in the pool's own metadata
    pub pool_id: String,
    /// Redundancy level the pool was created with (updated once a
    /// failsafe transition completes)
    pub raid_type: RaidType,
}

/// Crash-resumable record of an accepted initial setup. Persisted before
/// any device is touched so an interrupted setup can be re-driven from the
/// same intent instead of re-run from scratch with a fresh pool id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupIntent {
    pub pool_id: String,
    pub device_ids: Vec<String>,
    pub raid_type: RaidType,
}

// =============================================================================
// Pool Signatures (backend scan results)
// =============================================================================

/// A pool signature physically present on attached hardware, owned or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSignature {
    /// The identifier embedded in the pool metadata
    pub pool_id: String,
    /// Backend-assigned numeric guid
    pub guid: u64,
    /// Stable ids of the member devices currently visible
    pub device_ids: Vec<String>,
}

// =============================================================================
// Backend Pool State
// =============================================================================

/// Per-member state as reported by the pool tooling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberState {
    /// Stable device id this member lives on
    pub device_id: String,
    pub health: PoolHealth,
    pub size_bytes: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub checksum_errors: u64,
}

/// Progress of an in-flight mirror rebuild
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResilverProgress {
    /// 0-100; capped at 99 until the tooling reports completion
    pub percent: u8,
    pub finished: bool,
}

/// Live state of a pool as reported by the backend tooling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolState {
    /// Redundancy level derived from the on-disk topology, not from config
    pub raid_type: RaidType,
    pub health: PoolHealth,
    pub total_space: u64,
    pub usable_space: u64,
    pub used_space: u64,
    pub members: Vec<MemberState>,
    /// Present while a mirror rebuild is running or just finished
    pub resilver: Option<ResilverProgress>,
}

// =============================================================================
// Transition Status
// =============================================================================

/// State of the storage-to-failsafe transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionState {
    Migrating,
    Complete,
    Error,
}

/// Derived/ephemeral status of an in-flight or terminal failsafe
/// transition. Held in process memory plus a small on-disk marker so a
/// restart can resume monitoring without replaying the migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailsafeTransitionStatus {
    pub state: TransitionState,
    /// 0-100 mirror completeness
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// =============================================================================
// Replacement Status
// =============================================================================

/// State of an in-place device replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplacementState {
    Rebuilding,
    Finished,
    Error,
}

/// Status of the most recent device replacement. The rebuild onto the
/// new device runs inside the pool tooling; progress and failure surface
/// here, never as exceptions into a polling caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplacementStatus {
    pub state: ReplacementState,
    /// 0-100 rebuild completeness
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// =============================================================================
// Expansion Status
// =============================================================================

/// State of a storage-mode capacity expansion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpansionState {
    Expanding,
    Finished,
    Error,
}

/// Status of the most recent `addDevice` expansion. Failures after the
/// synchronous validation phase surface here, never as exceptions into a
/// polling caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpansionStatus {
    pub state: ExpansionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// =============================================================================
// Aggregate Status
// =============================================================================

/// A pool member as surfaced through `RaidStatus`: membership is keyed by
/// stable id, while `slot` always reflects the latest probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaidMemberDevice {
    pub id: String,
    pub slot: Option<u32>,
    pub size_bytes: u64,
    pub status: PoolHealth,
    pub read_errors: u64,
    pub write_errors: u64,
    pub checksum_errors: u64,
}

/// The live aggregate view consumed by the rest of the appliance.
/// Derived on every poll, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaidStatus {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raid_type: Option<RaidType>,
    pub status: PoolHealth,
    pub devices: Vec<RaidMemberDevice>,
    pub total_space: u64,
    pub usable_space: u64,
    pub used_space: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expansion: Option<ExpansionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replacement: Option<ReplacementStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failsafe_transition_status: Option<FailsafeTransitionStatus>,
}

impl RaidStatus {
    /// The status reported when no pool resolves for this installation.
    /// Not an error condition by itself (fresh unconfigured hardware).
    pub fn absent() -> Self {
        Self {
            exists: false,
            raid_type: None,
            status: PoolHealth::Absent,
            devices: Vec::new(),
            total_space: 0,
            usable_space: 0,
            used_space: 0,
            expansion: None,
            replacement: None,
            failsafe_transition_status: None,
        }
    }
}

/// A member device as seen by an import scan while the pool failed to
/// mount: present-and-healthy or not
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryDevice {
    pub id: String,
    pub is_ok: bool,
}

/// Result of the boot-time mount-failure check. When the pool failed to
/// mount, `devices` lists each expected member with whether the import
/// scan still sees it healthy, so the UI can point at the bad drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStatus {
    pub mount_failed: bool,
    pub devices: Vec<RecoveryDevice>,
}

/// Result of polling the initial setup across the reboot boundary.
/// `error` is only ever set once the pool tooling itself reported a
/// structural failure; transient unreachability is the caller's concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialSetupStatus {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raid_type_display() {
        assert_eq!(format!("{}", RaidType::Storage), "storage");
        assert_eq!(format!("{}", RaidType::Failsafe), "failsafe");
    }

    #[test]
    fn test_pool_health_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&PoolHealth::Degraded).unwrap(),
            "\"DEGRADED\""
        );
        assert_eq!(
            serde_json::to_string(&PoolHealth::Online).unwrap(),
            "\"ONLINE\""
        );
    }

    #[test]
    fn test_absent_status() {
        let status = RaidStatus::absent();
        assert!(!status.exists);
        assert_eq!(status.status, PoolHealth::Absent);
        assert!(status.devices.is_empty());
    }

    #[test]
    fn test_transition_status_json_shape() {
        let status = FailsafeTransitionStatus {
            state: TransitionState::Migrating,
            progress: 42,
            error: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "migrating");
        assert_eq!(json["progress"], 42);
        assert!(json.get("error").is_none());
    }
}
