//! Durable lifecycle markers
//!
//! Small JSON files recording in-flight or terminal long-running pool
//! operations: the storage-to-failsafe transition, a stripe expansion,
//! and an in-place device replacement. The pool backend carries the
//! operation itself (an attach or replace survives restarts on its own);
//! a marker only lets a restarted process resume monitoring and keeps a
//! terminal error visible across reboots until it is acknowledged or
//! superseded.

use crate::domain::types::{
    ExpansionState, ExpansionStatus, FailsafeTransitionStatus, ReplacementState,
    ReplacementStatus, TransitionState,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

// =============================================================================
// Marker Shapes
// =============================================================================

/// Persisted record of a storage-to-failsafe transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionMarker {
    pub state: TransitionState,
    /// Stable id of the device being mirrored in
    pub device_id: String,
    /// Last observed mirror completeness, 0-100
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When this marker state was recorded
    pub updated_at: DateTime<Utc>,
}

impl TransitionMarker {
    pub fn migrating(device_id: &str) -> Self {
        Self {
            state: TransitionState::Migrating,
            device_id: device_id.to_string(),
            progress: 0,
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn status(&self) -> FailsafeTransitionStatus {
        FailsafeTransitionStatus {
            state: self.state,
            progress: self.progress,
            error: self.error.clone(),
        }
    }
}

/// Persisted record of a stripe expansion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpansionMarker {
    pub state: ExpansionState,
    /// Stable id of the device being added
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ExpansionMarker {
    pub fn expanding(device_id: &str) -> Self {
        Self {
            state: ExpansionState::Expanding,
            device_id: device_id.to_string(),
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn status(&self) -> ExpansionStatus {
        ExpansionStatus {
            state: self.state,
            error: self.error.clone(),
        }
    }
}

/// Persisted record of an in-place device replacement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplacementMarker {
    pub state: ReplacementState,
    /// Stable id of the member being replaced
    pub old_device_id: String,
    /// Stable id of the device taking its place
    pub new_device_id: String,
    /// Last observed rebuild completeness, 0-100
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ReplacementMarker {
    pub fn rebuilding(old_device_id: &str, new_device_id: &str) -> Self {
        Self {
            state: ReplacementState::Rebuilding,
            old_device_id: old_device_id.to_string(),
            new_device_id: new_device_id.to_string(),
            progress: 0,
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn status(&self) -> ReplacementStatus {
        ReplacementStatus {
            state: self.state,
            progress: self.progress,
            error: self.error.clone(),
        }
    }
}

// =============================================================================
// Marker Store
// =============================================================================

/// File-backed single-record store with an in-memory cache. Writes are
/// atomic (write-aside then rename) so a crash can never leave a torn
/// marker.
pub struct MarkerStore<T> {
    path: PathBuf,
    current: Mutex<Option<T>>,
}

pub type TransitionMarkerStore = MarkerStore<TransitionMarker>;
pub type ExpansionMarkerStore = MarkerStore<ExpansionMarker>;
pub type ReplacementMarkerStore = MarkerStore<ReplacementMarker>;

impl<T: Clone + Serialize + DeserializeOwned> MarkerStore<T> {
    /// Open the store, loading any marker left by a previous run
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let current = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            Some(serde_json::from_str(&raw)?)
        } else {
            None
        };
        Ok(Self {
            path,
            current: Mutex::new(current),
        })
    }

    pub fn get(&self) -> Option<T> {
        self.current.lock().clone()
    }

    /// Persist a new marker state. Atomic write-aside then rename.
    pub fn set(&self, marker: T) -> Result<()> {
        let mut current = self.current.lock();
        let raw = serde_json::to_string_pretty(&marker)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| Error::TransitionMarker(format!("atomic replace failed: {e}")))?;
        *current = Some(marker);
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        let mut current = self.current.lock();
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        *current = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> TransitionMarkerStore {
        TransitionMarkerStore::open(dir.path().join("failsafe-transition.json")).unwrap()
    }

    #[test]
    fn test_marker_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let mut marker = TransitionMarker::migrating("nvme-B-2");
        marker.progress = 37;
        store.set(marker.clone()).unwrap();

        let reopened = store_in(&dir);
        assert_eq!(reopened.get().unwrap(), marker);
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.set(TransitionMarker::migrating("nvme-B-2")).unwrap();
        store.clear().unwrap();

        assert!(store.get().is_none());
        assert!(store_in(&dir).get().is_none());
    }

    #[test]
    fn test_error_marker_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let marker = TransitionMarker {
            state: TransitionState::Error,
            device_id: "nvme-B-2".into(),
            progress: 61,
            error: Some("member faulted during mirror rebuild".into()),
            updated_at: Utc::now(),
        };
        store.set(marker).unwrap();

        let status = store_in(&dir).get().unwrap().status();
        assert_eq!(status.state, TransitionState::Error);
        assert_eq!(
            status.error.as_deref(),
            Some("member faulted during mirror rebuild")
        );
    }

    #[test]
    fn test_empty_store_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(store_in(&dir).get().is_none());
    }

    #[test]
    fn test_expansion_error_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("expansion.json");
        let store = ExpansionMarkerStore::open(&path).unwrap();

        let mut marker = ExpansionMarker::expanding("nvme-C-3");
        marker.state = ExpansionState::Error;
        marker.error = Some("device vanished mid-add".into());
        store.set(marker).unwrap();

        let reopened = ExpansionMarkerStore::open(&path).unwrap();
        let status = reopened.get().unwrap().status();
        assert_eq!(status.state, ExpansionState::Error);
        assert_eq!(status.error.as_deref(), Some("device vanished mid-add"));
    }

    #[test]
    fn test_replacement_marker_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replacement.json");
        let store = ReplacementMarkerStore::open(&path).unwrap();

        let mut marker = ReplacementMarker::rebuilding("nvme-A-1", "nvme-D-4");
        marker.progress = 42;
        store.set(marker.clone()).unwrap();

        let reopened = ReplacementMarkerStore::open(&path).unwrap();
        assert_eq!(reopened.get().unwrap(), marker);
        assert_eq!(
            reopened.get().unwrap().status().state,
            ReplacementState::Rebuilding
        );
    }
}
