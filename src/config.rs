//! Persisted appliance configuration store
//!
//! A small YAML file holding the installation's pool identity and the
//! crash-resumable setup state. Writes are atomic (write-aside then
//! rename) so an interrupted write can never leave a torn record. The
//! store is keyed independent of any device or slot.

use crate::domain::types::{PoolIdentity, RaidType, SetupIntent};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// On-disk shape of the config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigData {
    /// The one pool owned by this installation; written once at setup
    #[serde(skip_serializing_if = "Option::is_none")]
    pool: Option<PoolIdentity>,
    /// Accepted-but-unfinished initial setup
    #[serde(skip_serializing_if = "Option::is_none")]
    setup: Option<SetupIntent>,
    /// Structural failure reported by the pool tooling during setup.
    /// Surfaced through the setup status poll; cleared when a later
    /// setup attempt (or resume) succeeds.
    #[serde(skip_serializing_if = "Option::is_none")]
    setup_error: Option<String>,
}

/// YAML-backed configuration store with an in-memory cache
pub struct ConfigStore {
    path: PathBuf,
    data: Mutex<ConfigData>,
}

impl ConfigStore {
    /// Open the store, loading the existing file if present
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_yaml::from_str(&raw)?
        } else {
            ConfigData::default()
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, data: &ConfigData) -> Result<()> {
        let raw = serde_yaml::to_string(data)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("yaml.tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| Error::ConfigStore(format!("atomic replace failed: {e}")))?;
        Ok(())
    }

    fn update(&self, mutate: impl FnOnce(&mut ConfigData)) -> Result<()> {
        let mut data = self.data.lock();
        mutate(&mut data);
        self.persist(&data)
    }

    // =========================================================================
    // Pool identity
    // =========================================================================

    pub fn pool_identity(&self) -> Option<PoolIdentity> {
        self.data.lock().pool.clone()
    }

    /// Write the pool identity. Rejected if one already exists; the
    /// identity is written exactly once per installation.
    pub fn set_pool_identity(&self, identity: PoolIdentity) -> Result<()> {
        let mut data = self.data.lock();
        if data.pool.is_some() {
            return Err(Error::PoolAlreadyConfigured);
        }
        data.pool = Some(identity);
        self.persist(&data)
    }

    /// Record the new redundancy level once a failsafe transition has
    /// completed. The pool id itself never changes.
    pub fn set_raid_type(&self, raid_type: RaidType) -> Result<()> {
        self.update(|data| {
            if let Some(pool) = data.pool.as_mut() {
                pool.raid_type = raid_type;
            }
        })
    }

    // =========================================================================
    // Setup intent
    // =========================================================================

    pub fn setup_intent(&self) -> Option<SetupIntent> {
        self.data.lock().setup.clone()
    }

    pub fn set_setup_intent(&self, intent: SetupIntent) -> Result<()> {
        self.update(|data| data.setup = Some(intent))
    }

    pub fn clear_setup_intent(&self) -> Result<()> {
        self.update(|data| data.setup = None)
    }

    // =========================================================================
    // Setup error
    // =========================================================================

    pub fn setup_error(&self) -> Option<String> {
        self.data.lock().setup_error.clone()
    }

    pub fn set_setup_error(&self, error: &str) -> Result<()> {
        self.update(|data| data.setup_error = Some(error.to_string()))
    }

    pub fn clear_setup_error(&self) -> Result<()> {
        self.update(|data| data.setup_error = None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> ConfigStore {
        ConfigStore::open(dir.path().join("homepool.yaml")).unwrap()
    }

    #[test]
    fn test_roundtrip_across_reopen() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store
            .set_pool_identity(PoolIdentity {
                pool_id: "homepool-deadbeef".into(),
                raid_type: RaidType::Storage,
            })
            .unwrap();

        // Re-open from disk and read the same record back
        let reopened = store_in(&dir);
        let identity = reopened.pool_identity().unwrap();
        assert_eq!(identity.pool_id, "homepool-deadbeef");
        assert_eq!(identity.raid_type, RaidType::Storage);
    }

    #[test]
    fn test_identity_written_exactly_once() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let identity = PoolIdentity {
            pool_id: "homepool-00000001".into(),
            raid_type: RaidType::Storage,
        };
        store.set_pool_identity(identity.clone()).unwrap();

        let second = store.set_pool_identity(PoolIdentity {
            pool_id: "homepool-00000002".into(),
            raid_type: RaidType::Failsafe,
        });
        assert_matches!(second, Err(Error::PoolAlreadyConfigured));

        // The original identity is untouched
        assert_eq!(store.pool_identity().unwrap(), identity);
    }

    #[test]
    fn test_setup_intent_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        assert!(store.setup_intent().is_none());
        store
            .set_setup_intent(SetupIntent {
                pool_id: "homepool-cafe0001".into(),
                device_ids: vec!["nvme-A-1".into()],
                raid_type: RaidType::Storage,
            })
            .unwrap();

        let reopened = store_in(&dir);
        assert_eq!(
            reopened.setup_intent().unwrap().pool_id,
            "homepool-cafe0001"
        );

        reopened.clear_setup_intent().unwrap();
        assert!(store_in(&dir).setup_intent().is_none());
    }

    #[test]
    fn test_setup_error_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.set_setup_error("pool tool reported corrupt label").unwrap();

        let reopened = store_in(&dir);
        assert_eq!(
            reopened.setup_error().unwrap(),
            "pool tool reported corrupt label"
        );

        reopened.clear_setup_error().unwrap();
        assert!(store_in(&dir).setup_error().is_none());
    }

    #[test]
    fn test_raid_type_update_preserves_pool_id() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store
            .set_pool_identity(PoolIdentity {
                pool_id: "homepool-feed0001".into(),
                raid_type: RaidType::Storage,
            })
            .unwrap();

        store.set_raid_type(RaidType::Failsafe).unwrap();
        let identity = store.pool_identity().unwrap();
        assert_eq!(identity.pool_id, "homepool-feed0001");
        assert_eq!(identity.raid_type, RaidType::Failsafe);
    }
}
