//! Error types for the homepool storage core
//!
//! Provides structured error types for device probing, pool resolution,
//! the lifecycle manager, and the pool backend tooling.

use thiserror::Error;

/// Unified error type for the storage core
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Validation Errors (synchronous, no state is mutated)
    // =========================================================================
    #[error("device not found: {device}")]
    DeviceNotFound { device: String },

    #[error("device {device} is already a member of the pool")]
    DeviceAlreadyMember { device: String },

    #[error("device {device} is not a member of the pool")]
    DeviceNotInPool { device: String },

    #[error("cannot transition to a device smaller than the current device ({new_bytes} < {current_bytes} bytes)")]
    TransitionTargetTooSmall { new_bytes: u64, current_bytes: u64 },

    #[error("another operation is already in flight: {operation}")]
    OperationInFlight { operation: String },

    #[error("no pool exists for this installation")]
    PoolMissing,

    #[error("a pool identity already exists for this installation")]
    PoolAlreadyConfigured,

    #[error("operation requires a {required} pool but the pool is {actual}")]
    WrongRaidType { required: String, actual: String },

    #[error("at least one device is required")]
    NoDevices,

    #[error("failsafe mode requires at least two devices")]
    NotEnoughDevicesForFailsafe,

    #[error("can only transition single-device pools (pool has {count} members)")]
    NotSingleDevicePool { count: usize },

    // =========================================================================
    // Pool Tooling Errors
    // =========================================================================
    #[error("pool command failed: {command} - {reason}")]
    PoolCommand { command: String, reason: String },

    #[error("failed to parse pool status output: {0}")]
    PoolStatusParse(String),

    #[error("partitioning failed for {device}: {reason}")]
    Partitioning { device: String, reason: String },

    // =========================================================================
    // Device Probing Errors
    // =========================================================================
    #[error("device probing failed: {0}")]
    Probe(String),

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    #[error("config store error: {0}")]
    ConfigStore(String),

    #[error("transition marker error: {0}")]
    TransitionMarker(String),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is a synchronous validation rejection.
    /// Validation errors never mutate any state and map to HTTP 400.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::DeviceNotFound { .. }
                | Error::DeviceAlreadyMember { .. }
                | Error::DeviceNotInPool { .. }
                | Error::TransitionTargetTooSmall { .. }
                | Error::PoolMissing
                | Error::PoolAlreadyConfigured
                | Error::WrongRaidType { .. }
                | Error::NoDevices
                | Error::NotEnoughDevicesForFailsafe
                | Error::NotSingleDevicePool { .. }
        )
    }

    /// Check if this error is a rejected-because-busy conflict (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::OperationInFlight { .. })
    }
}

/// Result type alias for the storage core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_classification() {
        let err = Error::DeviceNotFound {
            device: "nvme-FOO-1".into(),
        };
        assert!(err.is_validation());
        assert!(!err.is_conflict());

        let err = Error::OperationInFlight {
            operation: "transition".into(),
        };
        assert!(err.is_conflict());
        assert!(!err.is_validation());

        let err = Error::PoolCommand {
            command: "zpool create".into(),
            reason: "boom".into(),
        };
        assert!(!err.is_validation());
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_undersized_transition_message() {
        let err = Error::TransitionTargetTooSmall {
            new_bytes: 1_000,
            current_bytes: 2_000,
        };
        assert!(err.to_string().contains("smaller than the current device"));
    }
}
