//! In-memory Pool Backend
//!
//! A fully simulated `PoolBackend` with the same observable behavior as
//! the ZFS backend: topology-derived raid type, poll-driven resilver
//! progress, and space accounting on normalized member sizes. Used by the
//! daemon's standalone mode and throughout the test suite, where it also
//! provides fault injection for migration-failure paths.

use crate::domain::ports::PoolBackend;
use crate::domain::types::{
    MemberState, PoolHealth, PoolSignature, PoolState, RaidType, RecoveryDevice,
    ResilverProgress,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

// =============================================================================
// Simulated Pool State
// =============================================================================

#[derive(Debug, Clone)]
struct SimMember {
    device_id: String,
    size_bytes: u64,
    health: PoolHealth,
    read_errors: u64,
    write_errors: u64,
    checksum_errors: u64,
}

impl SimMember {
    fn healthy(device_id: &str, size_bytes: u64) -> Self {
        Self {
            device_id: device_id.to_string(),
            size_bytes,
            health: PoolHealth::Online,
            read_errors: 0,
            write_errors: 0,
            checksum_errors: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct SimPool {
    guid: u64,
    raid_type: RaidType,
    members: Vec<SimMember>,
    used_space: u64,
    /// Status polls remaining until the current resilver finishes
    resilver_remaining: Option<u32>,
    resilver_total: u32,
    /// When set, the resilver ends with the newest member faulting
    /// instead of completing
    fail_resilver: Option<String>,
}

impl SimPool {
    fn total_space(&self) -> u64 {
        match self.raid_type {
            // Stripe: capacity is the sum of all members
            RaidType::Storage => self.members.iter().map(|m| m.size_bytes).sum(),
            // Mirror: capacity is the smallest member
            RaidType::Failsafe => self
                .members
                .iter()
                .map(|m| m.size_bytes)
                .min()
                .unwrap_or(0),
        }
    }

    fn health(&self) -> PoolHealth {
        if self.members.iter().any(|m| m.health == PoolHealth::Faulted) {
            return match self.raid_type {
                // A faulted stripe member takes the whole pool down
                RaidType::Storage => PoolHealth::Faulted,
                RaidType::Failsafe => PoolHealth::Degraded,
            };
        }
        if self.resilver_remaining.map(|r| r > 0).unwrap_or(false) {
            // Redundant guarantee not yet established
            PoolHealth::Degraded
        } else {
            PoolHealth::Online
        }
    }
}

// =============================================================================
// Memory Backend
// =============================================================================

/// Simulated pool backend. The `resilver_polls` knob controls how many
/// `pool_state` calls a mirror rebuild takes to finish.
pub struct MemoryBackend {
    pools: Mutex<BTreeMap<String, SimPool>>,
    /// Members prepared via `prepare_member` but not yet in a pool
    prepared: Mutex<BTreeMap<String, u64>>,
    resilver_polls: u32,
    next_guid: AtomicU64,
    fail_next_command: Mutex<Option<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_resilver_polls(3)
    }

    pub fn with_resilver_polls(resilver_polls: u32) -> Self {
        Self {
            pools: Mutex::new(BTreeMap::new()),
            prepared: Mutex::new(BTreeMap::new()),
            resilver_polls,
            next_guid: AtomicU64::new(1),
            fail_next_command: Mutex::new(None),
        }
    }

    /// Place a pre-existing pool signature on the simulated hardware, as a
    /// drive from another installation would carry one.
    pub fn inject_pool(&self, pool_id: &str, raid_type: RaidType, devices: &[(&str, u64)]) {
        let pool = SimPool {
            guid: self.next_guid.fetch_add(1, Ordering::Relaxed),
            raid_type,
            members: devices
                .iter()
                .map(|(id, size)| SimMember::healthy(id, *size))
                .collect(),
            used_space: 0,
            resilver_remaining: None,
            resilver_total: self.resilver_polls,
            fail_resilver: None,
        };
        self.pools.lock().insert(pool_id.to_string(), pool);
    }

    /// Make the next mutating pool command fail with `reason`
    pub fn fail_next_command(&self, reason: &str) {
        *self.fail_next_command.lock() = Some(reason.to_string());
    }

    /// Make the in-flight (or next) resilver on `pool_id` end in a device
    /// fault instead of completing
    pub fn fail_resilver(&self, pool_id: &str, reason: &str) {
        if let Some(pool) = self.pools.lock().get_mut(pool_id) {
            pool.fail_resilver = Some(reason.to_string());
        }
    }

    /// Set the allocated space of a pool (simulates user data)
    pub fn set_used_space(&self, pool_id: &str, used_space: u64) {
        if let Some(pool) = self.pools.lock().get_mut(pool_id) {
            pool.used_space = used_space;
        }
    }

    /// Mark a member device as faulted
    pub fn fault_member(&self, pool_id: &str, device_id: &str) {
        if let Some(pool) = self.pools.lock().get_mut(pool_id) {
            if let Some(member) = pool
                .members
                .iter_mut()
                .find(|m| m.device_id == device_id)
            {
                member.health = PoolHealth::Faulted;
            }
        }
    }

    fn take_injected_failure(&self) -> Option<String> {
        self.fail_next_command.lock().take()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PoolBackend for MemoryBackend {
    async fn scan_signatures(&self) -> Result<Vec<PoolSignature>> {
        let pools = self.pools.lock();
        Ok(pools
            .iter()
            .map(|(pool_id, pool)| PoolSignature {
                pool_id: pool_id.clone(),
                guid: pool.guid,
                device_ids: pool.members.iter().map(|m| m.device_id.clone()).collect(),
            })
            .collect())
    }

    async fn pool_state(&self, pool_id: &str) -> Result<Option<PoolState>> {
        let mut pools = self.pools.lock();
        let Some(pool) = pools.get_mut(pool_id) else {
            return Ok(None);
        };

        // Advance the simulated resilver one step per status poll
        let resilver = match pool.resilver_remaining {
            Some(remaining) if remaining > 1 => {
                pool.resilver_remaining = Some(remaining - 1);
                let done = pool.resilver_total.saturating_sub(remaining - 1);
                let percent =
                    ((done as u64 * 100) / pool.resilver_total.max(1) as u64).min(99) as u8;
                Some(ResilverProgress {
                    percent,
                    finished: false,
                })
            }
            Some(_) => {
                pool.resilver_remaining = None;
                if let Some(reason) = pool.fail_resilver.take() {
                    // The rebuild target faulted mid-copy
                    debug!(%pool_id, %reason, "simulated resilver failure");
                    if let Some(member) = pool.members.last_mut() {
                        member.health = PoolHealth::Faulted;
                        member.write_errors += 1;
                    }
                    None
                } else {
                    Some(ResilverProgress {
                        percent: 100,
                        finished: true,
                    })
                }
            }
            None => None,
        };

        let total_space = pool.total_space();
        Ok(Some(PoolState {
            raid_type: pool.raid_type,
            health: pool.health(),
            total_space,
            usable_space: total_space,
            used_space: pool.used_space,
            members: pool
                .members
                .iter()
                .map(|m| MemberState {
                    device_id: m.device_id.clone(),
                    health: m.health,
                    size_bytes: m.size_bytes,
                    read_errors: m.read_errors,
                    write_errors: m.write_errors,
                    checksum_errors: m.checksum_errors,
                })
                .collect(),
            resilver,
        }))
    }

    async fn prepare_member(&self, device_id: &str, rounded_size_bytes: u64) -> Result<String> {
        if let Some(reason) = self.take_injected_failure() {
            return Err(Error::Partitioning {
                device: device_id.to_string(),
                reason,
            });
        }
        self.prepared
            .lock()
            .insert(device_id.to_string(), rounded_size_bytes);
        // Member handle is the device id itself in the simulation
        Ok(device_id.to_string())
    }

    async fn create_pool(
        &self,
        pool_id: &str,
        members: &[String],
        raid_type: RaidType,
    ) -> Result<()> {
        if let Some(reason) = self.take_injected_failure() {
            return Err(Error::PoolCommand {
                command: "create".into(),
                reason,
            });
        }

        let prepared = self.prepared.lock();
        let sim_members: Vec<SimMember> = members
            .iter()
            .map(|member| {
                let size = prepared.get(member).copied().ok_or_else(|| {
                    Error::Internal(format!("member {member} was never prepared"))
                })?;
                Ok(SimMember::healthy(member, size))
            })
            .collect::<Result<_>>()?;
        drop(prepared);

        let pool = SimPool {
            guid: self.next_guid.fetch_add(1, Ordering::Relaxed),
            raid_type,
            members: sim_members,
            used_space: 0,
            resilver_remaining: None,
            resilver_total: self.resilver_polls,
            fail_resilver: None,
        };
        self.pools.lock().insert(pool_id.to_string(), pool);
        Ok(())
    }

    async fn extend_pool(&self, pool_id: &str, member: &str) -> Result<()> {
        if let Some(reason) = self.take_injected_failure() {
            return Err(Error::PoolCommand {
                command: "add".into(),
                reason,
            });
        }

        let size = self.prepared.lock().get(member).copied().ok_or_else(|| {
            Error::Internal(format!("member {member} was never prepared"))
        })?;

        let mut pools = self.pools.lock();
        let pool = pools
            .get_mut(pool_id)
            .ok_or(Error::PoolMissing)?;
        if pool.raid_type != RaidType::Storage {
            return Err(Error::PoolCommand {
                command: "add".into(),
                reason: "can only stripe-extend a storage pool".into(),
            });
        }
        pool.members.push(SimMember::healthy(member, size));
        Ok(())
    }

    async fn attach_mirror(
        &self,
        pool_id: &str,
        existing_device_id: &str,
        new_member: &str,
    ) -> Result<()> {
        if let Some(reason) = self.take_injected_failure() {
            return Err(Error::PoolCommand {
                command: "attach".into(),
                reason,
            });
        }

        let size = self.prepared.lock().get(new_member).copied().ok_or_else(|| {
            Error::Internal(format!("member {new_member} was never prepared"))
        })?;

        let mut pools = self.pools.lock();
        let pool = pools
            .get_mut(pool_id)
            .ok_or(Error::PoolMissing)?;
        if !pool
            .members
            .iter()
            .any(|m| m.device_id == existing_device_id)
        {
            return Err(Error::PoolCommand {
                command: "attach".into(),
                reason: format!("no member on device {existing_device_id}"),
            });
        }

        // Topology becomes a mirror the moment the attach is accepted;
        // redundancy arrives when the resilver finishes
        pool.raid_type = RaidType::Failsafe;
        pool.members.push(SimMember::healthy(new_member, size));
        pool.resilver_remaining = Some(pool.resilver_total.max(1));
        Ok(())
    }

    async fn replace_member(
        &self,
        pool_id: &str,
        old_device_id: &str,
        new_member: &str,
    ) -> Result<()> {
        if let Some(reason) = self.take_injected_failure() {
            return Err(Error::PoolCommand {
                command: "replace".into(),
                reason,
            });
        }

        let size = self.prepared.lock().get(new_member).copied().ok_or_else(|| {
            Error::Internal(format!("member {new_member} was never prepared"))
        })?;

        let mut pools = self.pools.lock();
        let pool = pools
            .get_mut(pool_id)
            .ok_or(Error::PoolMissing)?;
        let Some(old) = pool
            .members
            .iter_mut()
            .find(|m| m.device_id == old_device_id)
        else {
            return Err(Error::PoolCommand {
                command: "replace".into(),
                reason: format!("no member on device {old_device_id}"),
            });
        };

        // The real tooling keeps the old member until the rebuild finishes;
        // the simulation swaps immediately and models the rebuild window as
        // a resilver on the new member.
        *old = SimMember::healthy(new_member, size);
        pool.resilver_remaining = Some(pool.resilver_total.max(1));
        Ok(())
    }

    async fn expand_member(&self, pool_id: &str, device_id: &str) -> Result<()> {
        if let Some(reason) = self.take_injected_failure() {
            return Err(Error::PoolCommand {
                command: "online -e".into(),
                reason,
            });
        }

        let pools = self.pools.lock();
        let pool = pools.get(pool_id).ok_or(Error::PoolMissing)?;
        if !pool.members.iter().any(|m| m.device_id == device_id) {
            return Err(Error::PoolCommand {
                command: "online -e".into(),
                reason: format!("no member on device {device_id}"),
            });
        }
        // Member sizes track the prepared size directly, so there is
        // nothing further to claim in the simulation
        Ok(())
    }

    async fn scan_import_health(&self, pool_id: &str) -> Result<Vec<RecoveryDevice>> {
        let pools = self.pools.lock();
        let Some(pool) = pools.get(pool_id) else {
            return Ok(Vec::new());
        };
        Ok(pool
            .members
            .iter()
            .map(|m| RecoveryDevice {
                id: m.device_id.clone(),
                is_ok: m.health == PoolHealth::Online,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_scan() {
        let backend = MemoryBackend::new();
        backend
            .prepare_member("nvme-A-1", 2_000_000_000_000)
            .await
            .unwrap();
        backend
            .create_pool("homepool-00000001", &["nvme-A-1".into()], RaidType::Storage)
            .await
            .unwrap();

        let signatures = backend.scan_signatures().await.unwrap();
        assert_eq!(signatures.len(), 1);
        assert_eq!(signatures[0].pool_id, "homepool-00000001");
        assert_eq!(signatures[0].device_ids, vec!["nvme-A-1".to_string()]);
    }

    #[tokio::test]
    async fn test_stripe_capacity_is_sum() {
        let backend = MemoryBackend::new();
        backend.prepare_member("a", 1_000_000_000_000).await.unwrap();
        backend.prepare_member("b", 2_000_000_000_000).await.unwrap();
        backend
            .create_pool("p", &["a".into(), "b".into()], RaidType::Storage)
            .await
            .unwrap();

        let state = backend.pool_state("p").await.unwrap().unwrap();
        assert_eq!(state.total_space, 3_000_000_000_000);
        assert_eq!(state.raid_type, RaidType::Storage);
    }

    #[tokio::test]
    async fn test_attach_runs_resilver_to_completion() {
        let backend = MemoryBackend::with_resilver_polls(3);
        backend.prepare_member("a", 1_000_000_000_000).await.unwrap();
        backend
            .create_pool("p", &["a".into()], RaidType::Storage)
            .await
            .unwrap();
        backend.prepare_member("b", 1_000_000_000_000).await.unwrap();
        backend.attach_mirror("p", "a", "b").await.unwrap();

        // Degraded while mirroring
        let state = backend.pool_state("p").await.unwrap().unwrap();
        assert_eq!(state.raid_type, RaidType::Failsafe);
        assert_eq!(state.health, PoolHealth::Degraded);
        assert_eq!(state.members.len(), 2);

        // Poll until the resilver reports finished
        let mut finished = false;
        for _ in 0..10 {
            let state = backend.pool_state("p").await.unwrap().unwrap();
            if state.resilver.map(|r| r.finished).unwrap_or(false) {
                finished = true;
                assert_eq!(state.health, PoolHealth::Online);
                break;
            }
        }
        assert!(finished);
    }

    #[tokio::test]
    async fn test_mirror_capacity_is_smallest_member() {
        let backend = MemoryBackend::with_resilver_polls(1);
        backend.prepare_member("a", 1_000_000_000_000).await.unwrap();
        backend
            .create_pool("p", &["a".into()], RaidType::Storage)
            .await
            .unwrap();
        backend.prepare_member("b", 2_000_000_000_000).await.unwrap();
        backend.attach_mirror("p", "a", "b").await.unwrap();

        let state = backend.pool_state("p").await.unwrap().unwrap();
        assert_eq!(state.total_space, 1_000_000_000_000);
    }

    #[tokio::test]
    async fn test_replace_swaps_member_and_resilvers() {
        let backend = MemoryBackend::with_resilver_polls(2);
        backend.prepare_member("a", 1_000_000_000_000).await.unwrap();
        backend
            .create_pool("p", &["a".into()], RaidType::Storage)
            .await
            .unwrap();
        backend.prepare_member("b", 2_000_000_000_000).await.unwrap();
        backend.replace_member("p", "a", "b").await.unwrap();

        let state = backend.pool_state("p").await.unwrap().unwrap();
        assert_eq!(state.members.len(), 1);
        assert_eq!(state.members[0].device_id, "b");
        assert_eq!(state.health, PoolHealth::Degraded);

        let mut finished = false;
        for _ in 0..10 {
            let state = backend.pool_state("p").await.unwrap().unwrap();
            if state.resilver.map(|r| r.finished).unwrap_or(false) {
                finished = true;
                break;
            }
        }
        assert!(finished);
        backend.expand_member("p", "b").await.unwrap();
        let state = backend.pool_state("p").await.unwrap().unwrap();
        assert_eq!(state.total_space, 2_000_000_000_000);
    }

    #[tokio::test]
    async fn test_import_health_reflects_member_faults() {
        let backend = MemoryBackend::new();
        backend.inject_pool(
            "p",
            RaidType::Storage,
            &[("a", 1_000_000_000_000), ("b", 1_000_000_000_000)],
        );
        backend.fault_member("p", "b");

        let health = backend.scan_import_health("p").await.unwrap();
        assert_eq!(health.len(), 2);
        assert!(health.iter().find(|d| d.id == "a").unwrap().is_ok);
        assert!(!health.iter().find(|d| d.id == "b").unwrap().is_ok);

        assert!(backend.scan_import_health("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resilver_fault_injection() {
        let backend = MemoryBackend::with_resilver_polls(2);
        backend.prepare_member("a", 1_000_000_000_000).await.unwrap();
        backend
            .create_pool("p", &["a".into()], RaidType::Storage)
            .await
            .unwrap();
        backend.prepare_member("b", 1_000_000_000_000).await.unwrap();
        backend.attach_mirror("p", "a", "b").await.unwrap();
        backend.fail_resilver("p", "write error on target");

        let mut saw_fault = false;
        for _ in 0..10 {
            let state = backend.pool_state("p").await.unwrap().unwrap();
            if state
                .members
                .iter()
                .any(|m| m.health == PoolHealth::Faulted)
            {
                assert_eq!(state.health, PoolHealth::Degraded);
                assert!(state.resilver.is_none());
                saw_fault = true;
                break;
            }
        }
        assert!(saw_fault);
    }
}
