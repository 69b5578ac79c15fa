//! RAID Lifecycle Manager
//!
//! Owns the full lifecycle of the installation's one pool: initial setup,
//! storage-mode capacity expansion, in-place device replacement, the live
//! storage-to-failsafe transition, and the aggregate status view. All
//! mutating operations are serialized through a single in-flight slot; a
//! second mutating request is rejected, never queued.
//!
//! Long-running work (pool creation, mirror resilver, replacement rebuild)
//! runs in background tasks. Their failures are recorded in durable
//! markers and surfaced through the status polls; nothing after the
//! synchronous validation phase ever raises into a caller.

use crate::config::ConfigStore;
use crate::domain::ports::{DeviceProberRef, PoolBackendRef};
use crate::domain::types::{
    ExpansionState, ExpansionStatus, FailsafeTransitionStatus, InitialSetupStatus, PoolHealth,
    PoolIdentity, PoolState, RaidMemberDevice, RaidStatus, RaidType, RecoveryStatus,
    ReplacementState, ReplacementStatus, SetupIntent, StorageDevice, TransitionState,
};
use crate::error::{Error, Result};
use crate::pool::resolve_owned_pool;
use crate::raid::transition::{
    ExpansionMarker, ExpansionMarkerStore, ReplacementMarker, ReplacementMarkerStore,
    TransitionMarker, TransitionMarkerStore,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const POOL_ID_PREFIX: &str = "homepool";
const TRANSITION_MARKER_FILE: &str = "failsafe-transition.json";
const EXPANSION_MARKER_FILE: &str = "expansion.json";
const REPLACEMENT_MARKER_FILE: &str = "replacement.json";

// =============================================================================
// Manager Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Interval between background status polls (resilver monitoring)
    pub poll_interval: Duration,
    /// Directory for the lifecycle markers and other daemon state
    pub data_dir: PathBuf,
    /// File the boot tooling leaves behind when the data pool failed to
    /// mount; its existence switches the recovery check on
    pub mount_failure_log: PathBuf,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            data_dir: PathBuf::from("/var/lib/homepool"),
            mount_failure_log: PathBuf::from("/run/homepool/data-mount-error.log"),
        }
    }
}

// =============================================================================
// Operation Serialization
// =============================================================================

/// Clears the in-flight slot when the operation (including its background
/// phase) finishes, however it finishes.
struct OperationGuard {
    inner: Arc<Inner>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        *self.inner.inflight.lock() = None;
    }
}

// =============================================================================
// RAID Manager
// =============================================================================

/// Cheap-to-clone handle; all state lives behind the shared inner.
#[derive(Clone)]
pub struct RaidManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<ConfigStore>,
    prober: DeviceProberRef,
    backend: PoolBackendRef,
    marker: TransitionMarkerStore,
    expansion: ExpansionMarkerStore,
    replacement: ReplacementMarkerStore,
    /// Name of the mutating operation currently in flight, if any
    inflight: Mutex<Option<String>>,
    mount_failure_log: PathBuf,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl RaidManager {
    pub fn new(
        config: Arc<ConfigStore>,
        prober: DeviceProberRef,
        backend: PoolBackendRef,
        settings: ManagerConfig,
    ) -> Result<Self> {
        let marker = TransitionMarkerStore::open(settings.data_dir.join(TRANSITION_MARKER_FILE))?;
        let expansion = ExpansionMarkerStore::open(settings.data_dir.join(EXPANSION_MARKER_FILE))?;
        let replacement =
            ReplacementMarkerStore::open(settings.data_dir.join(REPLACEMENT_MARKER_FILE))?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                prober,
                backend,
                marker,
                expansion,
                replacement,
                inflight: Mutex::new(None),
                mount_failure_log: settings.mount_failure_log,
                poll_interval: settings.poll_interval,
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Resume work interrupted by a restart: an accepted-but-unfinished
    /// setup intent is re-driven, an expanding marker gets the add
    /// re-checked, and migrating or rebuilding markers get their monitors
    /// back.
    pub fn start(&self) {
        if self.inner.config.pool_identity().is_some() {
            // Crash landed between the identity write and the intent
            // clear; only the clear is left
            if self.inner.config.setup_intent().is_some() {
                if let Err(e) = self.inner.config.clear_setup_intent() {
                    error!(error = %e, "failed to clear finished setup intent");
                }
            }
        } else if let Some(intent) = self.inner.config.setup_intent() {
            info!(pool_id = %intent.pool_id, "resuming interrupted initial setup");
            if let Ok(guard) = self.try_begin("setup") {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    inner.run_setup(intent, guard).await;
                });
            }
        }

        if let Some(marker) = self.inner.expansion.get() {
            if marker.state == ExpansionState::Expanding {
                info!(device = %marker.device_id, "resuming interrupted pool expansion");
                if let Ok(guard) = self.try_begin("addDevice") {
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move {
                        inner.resume_expansion(marker.device_id, guard).await;
                    });
                }
            }
        }

        if let Some(marker) = self.inner.marker.get() {
            if marker.state == TransitionState::Migrating {
                info!(device = %marker.device_id, "resuming failsafe transition monitor");
                if let Ok(guard) = self.try_begin("failsafeTransition") {
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move {
                        inner.monitor_transition(marker.device_id, guard).await;
                    });
                }
            }
        }

        if let Some(marker) = self.inner.replacement.get() {
            if marker.state == ReplacementState::Rebuilding {
                info!(
                    old = %marker.old_device_id,
                    new = %marker.new_device_id,
                    "resuming device replacement monitor"
                );
                if let Ok(guard) = self.try_begin("replaceDevice") {
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move {
                        inner
                            .monitor_replacement(marker.old_device_id, marker.new_device_id, guard)
                            .await;
                    });
                }
            }
        }
    }

    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    /// Fast busy check so a concurrent request is always rejected as a
    /// conflict, before any validation result can mask it
    fn ensure_idle(&self) -> Result<()> {
        if let Some(current) = self.inner.inflight.lock().as_ref() {
            return Err(Error::OperationInFlight {
                operation: current.clone(),
            });
        }
        Ok(())
    }

    fn try_begin(&self, operation: &str) -> Result<OperationGuard> {
        let mut slot = self.inner.inflight.lock();
        if let Some(current) = slot.as_ref() {
            return Err(Error::OperationInFlight {
                operation: current.clone(),
            });
        }
        *slot = Some(operation.to_string());
        Ok(OperationGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    fn generate_pool_id() -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{POOL_ID_PREFIX}-{}", &suffix[..8])
    }

    // =========================================================================
    // Device Listing
    // =========================================================================

    /// Enumerate attached internal storage devices, sorted by stable id
    pub async fn get_devices(&self) -> Result<Vec<StorageDevice>> {
        self.inner.prober.get_devices().await
    }

    // =========================================================================
    // Initial Setup
    // =========================================================================

    /// Accept an initial setup request. Validations are synchronous; the
    /// setup itself (partitioning, pool creation) runs in the background
    /// and is resumable across a crash because the intent is persisted
    /// before any device is touched.
    pub async fn setup(&self, device_ids: Vec<String>, raid_type: RaidType) -> Result<()> {
        self.ensure_idle()?;
        if self.inner.config.pool_identity().is_some()
            || self.inner.config.setup_intent().is_some()
        {
            return Err(Error::PoolAlreadyConfigured);
        }
        if device_ids.is_empty() {
            return Err(Error::NoDevices);
        }
        if raid_type == RaidType::Failsafe && device_ids.len() < 2 {
            return Err(Error::NotEnoughDevicesForFailsafe);
        }
        let attached = self.inner.prober.get_devices().await?;
        for device_id in &device_ids {
            if !attached.iter().any(|d| &d.id == device_id) {
                return Err(Error::DeviceNotFound {
                    device: device_id.clone(),
                });
            }
        }

        let guard = self.try_begin("setup")?;
        let intent = SetupIntent {
            pool_id: Self::generate_pool_id(),
            device_ids,
            raid_type,
        };
        // Persisted before any destructive work so an interrupted setup
        // resumes with the same pool id instead of restarting
        self.inner.config.set_setup_intent(intent.clone())?;
        info!(
            pool_id = %intent.pool_id,
            %raid_type,
            devices = intent.device_ids.len(),
            "initial setup accepted"
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run_setup(intent, guard).await;
        });
        Ok(())
    }

    /// Poll the initial setup across restarts. `ready` once the owned pool
    /// is present; `error` carries a structural failure reported by the
    /// pool tooling, persisted so it survives a reboot mid-setup.
    pub async fn check_initial_raid_setup_status(&self) -> Result<InitialSetupStatus> {
        // A resolvable pool wins over any recorded failure: a re-driven
        // setup may have succeeded after a transient error
        if self.inner.owned_pool_state().await?.is_some() {
            return Ok(InitialSetupStatus {
                ready: true,
                error: None,
            });
        }
        Ok(InitialSetupStatus {
            ready: false,
            error: self.inner.config.setup_error(),
        })
    }

    // =========================================================================
    // Storage Expansion
    // =========================================================================

    /// Add a device to a storage-mode pool as a new stripe member.
    /// Validations are synchronous and mutate nothing on failure; the
    /// partition-and-extend itself runs in the background with its result
    /// recorded durably and surfaced through `get_status`.
    pub async fn add_device(&self, device_id: &str) -> Result<()> {
        self.ensure_idle()?;
        let (pool_id, state) = self
            .inner
            .owned_pool_state()
            .await?
            .ok_or(Error::PoolMissing)?;
        if state.raid_type != RaidType::Storage {
            return Err(Error::WrongRaidType {
                required: RaidType::Storage.to_string(),
                actual: state.raid_type.to_string(),
            });
        }
        if state.members.iter().any(|m| m.device_id == device_id) {
            return Err(Error::DeviceAlreadyMember {
                device: device_id.to_string(),
            });
        }
        let device = self.inner.find_device(device_id).await?;

        let guard = self.try_begin("addDevice")?;
        // Durable before any device write so a terminal failure is still
        // reportable after a reboot
        self.inner
            .expansion
            .set(ExpansionMarker::expanding(device_id))?;
        info!(%pool_id, device = %device.id, "expanding pool");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match inner.execute_expansion(&pool_id, &device).await {
                Ok(()) => {
                    info!(%pool_id, device = %device.id, "expansion finished");
                    inner.record_expansion(ExpansionState::Finished, &device.id, None);
                }
                Err(e) => {
                    error!(%pool_id, device = %device.id, error = %e, "expansion failed");
                    inner.record_expansion(ExpansionState::Error, &device.id, Some(e.to_string()));
                }
            }
            drop(guard);
        });
        Ok(())
    }

    // =========================================================================
    // Device Replacement
    // =========================================================================

    /// Replace a pool member in place: rebuild its data onto a new device
    /// while the pool stays online. The call returns once the replacement
    /// is accepted and durably marked; rebuild progress and failure
    /// surface through `get_status`. After the rebuild, any extra capacity
    /// a larger replacement device brings is claimed automatically.
    pub async fn replace_device(&self, old_device_id: &str, new_device_id: &str) -> Result<()> {
        self.ensure_idle()?;
        let (pool_id, state) = self
            .inner
            .owned_pool_state()
            .await?
            .ok_or(Error::PoolMissing)?;
        if !state.members.iter().any(|m| m.device_id == old_device_id) {
            return Err(Error::DeviceNotInPool {
                device: old_device_id.to_string(),
            });
        }
        if state.members.iter().any(|m| m.device_id == new_device_id) {
            return Err(Error::DeviceAlreadyMember {
                device: new_device_id.to_string(),
            });
        }
        let device = self.inner.find_device(new_device_id).await?;

        let guard = self.try_begin("replaceDevice")?;
        // Durable before any device write so a restart resumes monitoring
        self.inner
            .replacement
            .set(ReplacementMarker::rebuilding(old_device_id, new_device_id))?;
        info!(%pool_id, old = %old_device_id, new = %device.id, "device replacement accepted");

        let old_device = old_device_id.to_string();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = inner
                .execute_replacement(&pool_id, &old_device, &device)
                .await
            {
                error!(%pool_id, error = %e, "device replacement failed");
                inner.record_replacement_error(&old_device, &device.id, 0, &e.to_string());
                drop(guard);
                return;
            }
            inner
                .monitor_replacement(old_device, device.id.clone(), guard)
                .await;
        });
        Ok(())
    }

    // =========================================================================
    // Failsafe Transition
    // =========================================================================

    /// Begin the live storage-to-failsafe transition: mirror the single
    /// existing member onto `device_id` while the pool stays online. The
    /// call returns once the migration is accepted and durably marked;
    /// progress and failure surface through `get_status`.
    pub async fn transition_to_failsafe(&self, device_id: &str) -> Result<()> {
        self.ensure_idle()?;
        let (pool_id, state) = self
            .inner
            .owned_pool_state()
            .await?
            .ok_or(Error::PoolMissing)?;
        if state.raid_type != RaidType::Storage {
            return Err(Error::WrongRaidType {
                required: RaidType::Storage.to_string(),
                actual: state.raid_type.to_string(),
            });
        }
        if state.members.len() != 1 {
            return Err(Error::NotSingleDevicePool {
                count: state.members.len(),
            });
        }
        let existing = &state.members[0];
        if existing.device_id == device_id {
            return Err(Error::DeviceAlreadyMember {
                device: device_id.to_string(),
            });
        }
        let device = self.inner.find_device(device_id).await?;
        // Sizes compare on the normalized grid, so a nominally-equal drive
        // from another vendor is never rejected for a few raw bytes
        if device.rounded_size_bytes < existing.size_bytes {
            return Err(Error::TransitionTargetTooSmall {
                new_bytes: device.rounded_size_bytes,
                current_bytes: existing.size_bytes,
            });
        }

        let guard = self.try_begin("failsafeTransition")?;
        // Durable before the attach so a restart resumes monitoring
        self.inner.marker.set(TransitionMarker::migrating(device_id))?;
        info!(%pool_id, device = %device.id, "failsafe transition accepted");

        let existing_device = existing.device_id.clone();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = inner
                .execute_attach(&pool_id, &existing_device, &device)
                .await
            {
                error!(%pool_id, error = %e, "failsafe transition attach failed");
                inner.record_transition_error(&device.id, 0, &e.to_string());
                drop(guard);
                return;
            }
            inner.monitor_transition(device.id.clone(), guard).await;
        });
        Ok(())
    }

    /// Clear a terminal transition error so a corrected retry can be
    /// attempted. Idempotent; does nothing unless an error is recorded.
    pub fn acknowledge_transition_error(&self) -> Result<()> {
        if let Some(marker) = self.inner.marker.get() {
            if marker.state == TransitionState::Error {
                info!(device = %marker.device_id, "transition error acknowledged");
                self.inner.marker.clear()?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Boot-time mount-failure check. When the boot tooling left a
    /// mount-error log behind, the pool never came up; report each member
    /// the import scan still sees healthy so the UI can point at the bad
    /// drive.
    pub async fn check_recovery(&self) -> Result<RecoveryStatus> {
        if !self.inner.mount_failure_log.exists() {
            return Ok(RecoveryStatus {
                mount_failed: false,
                devices: Vec::new(),
            });
        }
        let devices = match self.inner.config.pool_identity() {
            Some(identity) => self.inner.backend.scan_import_health(&identity.pool_id).await?,
            None => Vec::new(),
        };
        Ok(RecoveryStatus {
            mount_failed: true,
            devices,
        })
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Build the live aggregate status: backend pool state merged with the
    /// current probe (membership keyed by stable id, slots always fresh)
    /// plus any expansion, replacement, or transition in progress.
    ///
    /// A `complete` transition and a `finished` expansion or replacement
    /// are one-shot notifications: reported once, then cleared.
    pub async fn get_status(&self) -> Result<RaidStatus> {
        let Some((_pool_id, state)) = self.inner.owned_pool_state().await? else {
            return Ok(RaidStatus::absent());
        };

        let attached = match self.inner.prober.get_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                // Membership and health still report; only slots go stale
                warn!(error = %e, "device probe failed while building status");
                Vec::new()
            }
        };

        let devices = state
            .members
            .iter()
            .map(|member| {
                let slot = attached
                    .iter()
                    .find(|d| d.id == member.device_id)
                    .and_then(|d| d.slot);
                RaidMemberDevice {
                    id: member.device_id.clone(),
                    slot,
                    size_bytes: member.size_bytes,
                    status: member.health,
                    read_errors: member.read_errors,
                    write_errors: member.write_errors,
                    checksum_errors: member.checksum_errors,
                }
            })
            .collect();

        let expansion = self.inner.expansion.get().map(|m| m.status());
        if matches!(
            expansion,
            Some(ExpansionStatus {
                state: ExpansionState::Finished,
                ..
            })
        ) {
            self.inner.expansion.clear()?;
        }

        let replacement = self.inner.replacement.get().map(|m| m.status());
        if matches!(
            replacement,
            Some(ReplacementStatus {
                state: ReplacementState::Finished,
                ..
            })
        ) {
            self.inner.replacement.clear()?;
        }

        let transition = self.inner.marker.get().map(|m| m.status());
        if matches!(
            transition,
            Some(FailsafeTransitionStatus {
                state: TransitionState::Complete,
                ..
            })
        ) {
            self.inner.marker.clear()?;
        }

        Ok(RaidStatus {
            exists: true,
            raid_type: Some(state.raid_type),
            status: state.health,
            devices,
            total_space: state.total_space,
            usable_space: state.usable_space,
            used_space: state.used_space,
            expansion,
            replacement,
            failsafe_transition_status: transition,
        })
    }
}

// =============================================================================
// Background Work
// =============================================================================

impl Inner {
    async fn find_device(&self, device_id: &str) -> Result<StorageDevice> {
        self.prober
            .get_devices()
            .await?
            .into_iter()
            .find(|d| d.id == device_id)
            .ok_or_else(|| Error::DeviceNotFound {
                device: device_id.to_string(),
            })
    }

    /// Live state of the owned pool, if one resolves on attached hardware.
    /// Foreign pool signatures are excluded here and everywhere downstream.
    async fn owned_pool_state(&self) -> Result<Option<(String, PoolState)>> {
        let Some(identity) = self.config.pool_identity() else {
            return Ok(None);
        };
        let signatures = self.backend.scan_signatures().await?;
        let Some(signature) = resolve_owned_pool(&signatures, &identity) else {
            return Ok(None);
        };
        let pool_id = signature.pool_id.clone();
        match self.backend.pool_state(&pool_id).await? {
            Some(state) => Ok(Some((pool_id, state))),
            None => Ok(None),
        }
    }

    async fn run_setup(&self, intent: SetupIntent, _guard: OperationGuard) {
        if let Err(e) = self.execute_setup(&intent).await {
            error!(pool_id = %intent.pool_id, error = %e, "initial setup failed");
            if let Err(persist) = self.config.set_setup_error(&e.to_string()) {
                error!(error = %persist, "failed to record setup error");
            }
        }
    }

    async fn execute_setup(&self, intent: &SetupIntent) -> Result<()> {
        // Resume path: if a previous run already created the pool, only
        // the bookkeeping is left to finish
        let signatures = self.backend.scan_signatures().await?;
        let already_created = signatures.iter().any(|s| s.pool_id == intent.pool_id);

        if !already_created {
            let attached = self.prober.get_devices().await?;
            let mut members = Vec::with_capacity(intent.device_ids.len());
            for device_id in &intent.device_ids {
                let device = attached
                    .iter()
                    .find(|d| &d.id == device_id)
                    .ok_or_else(|| Error::DeviceNotFound {
                        device: device_id.clone(),
                    })?;
                let member = self
                    .backend
                    .prepare_member(device_id, device.rounded_size_bytes)
                    .await?;
                members.push(member);
            }
            self.backend
                .create_pool(&intent.pool_id, &members, intent.raid_type)
                .await?;
        }

        self.config.set_pool_identity(PoolIdentity {
            pool_id: intent.pool_id.clone(),
            raid_type: intent.raid_type,
        })?;
        self.config.clear_setup_intent()?;
        // A failure recorded by an earlier attempt must not shadow this
        // success in the setup status poll
        self.config.clear_setup_error()?;
        info!(pool_id = %intent.pool_id, "initial setup complete");
        Ok(())
    }

    async fn execute_expansion(&self, pool_id: &str, device: &StorageDevice) -> Result<()> {
        let member = self
            .backend
            .prepare_member(&device.id, device.rounded_size_bytes)
            .await?;
        self.backend.extend_pool(pool_id, &member).await
    }

    /// Finish an expansion interrupted by a restart. The accepted device
    /// carries no data yet, so re-driving the prepare-and-extend is safe
    /// unless the add already landed, which membership decides.
    async fn resume_expansion(&self, device_id: String, _guard: OperationGuard) {
        let pool = match self.owned_pool_state().await {
            Ok(pool) => pool,
            Err(e) => {
                self.record_expansion(ExpansionState::Error, &device_id, Some(e.to_string()));
                return;
            }
        };
        let Some((pool_id, state)) = pool else {
            self.record_expansion(
                ExpansionState::Error,
                &device_id,
                Some("pool not present while resuming expansion".into()),
            );
            return;
        };
        if state.members.iter().any(|m| m.device_id == device_id) {
            info!(%pool_id, device = %device_id, "expansion already landed before restart");
            self.record_expansion(ExpansionState::Finished, &device_id, None);
            return;
        }
        let device = match self.find_device(&device_id).await {
            Ok(device) => device,
            Err(e) => {
                self.record_expansion(ExpansionState::Error, &device_id, Some(e.to_string()));
                return;
            }
        };
        match self.execute_expansion(&pool_id, &device).await {
            Ok(()) => {
                info!(%pool_id, device = %device_id, "expansion finished");
                self.record_expansion(ExpansionState::Finished, &device_id, None);
            }
            Err(e) => {
                error!(%pool_id, device = %device_id, error = %e, "expansion failed");
                self.record_expansion(ExpansionState::Error, &device_id, Some(e.to_string()));
            }
        }
    }

    fn record_expansion(&self, state: ExpansionState, device_id: &str, error: Option<String>) {
        let marker = ExpansionMarker {
            state,
            device_id: device_id.to_string(),
            error,
            updated_at: chrono::Utc::now(),
        };
        if let Err(e) = self.expansion.set(marker) {
            error!(error = %e, "failed to persist expansion marker");
        }
    }

    async fn execute_replacement(
        &self,
        pool_id: &str,
        old_device_id: &str,
        device: &StorageDevice,
    ) -> Result<()> {
        let member = self
            .backend
            .prepare_member(&device.id, device.rounded_size_bytes)
            .await?;
        self.backend
            .replace_member(pool_id, old_device_id, &member)
            .await
    }

    async fn execute_attach(
        &self,
        pool_id: &str,
        existing_device_id: &str,
        device: &StorageDevice,
    ) -> Result<()> {
        let member = self
            .backend
            .prepare_member(&device.id, device.rounded_size_bytes)
            .await?;
        self.backend
            .attach_mirror(pool_id, existing_device_id, &member)
            .await
    }

    fn record_transition_error(&self, device_id: &str, progress: u8, message: &str) {
        let marker = TransitionMarker {
            state: TransitionState::Error,
            device_id: device_id.to_string(),
            progress,
            error: Some(message.to_string()),
            updated_at: chrono::Utc::now(),
        };
        if let Err(e) = self.marker.set(marker) {
            error!(error = %e, "failed to persist transition error marker");
        }
    }

    fn record_transition_complete(&self, device_id: &str) {
        if let Err(e) = self.config.set_raid_type(RaidType::Failsafe) {
            error!(error = %e, "failed to persist raid type change");
        }
        let marker = TransitionMarker {
            state: TransitionState::Complete,
            device_id: device_id.to_string(),
            progress: 100,
            error: None,
            updated_at: chrono::Utc::now(),
        };
        if let Err(e) = self.marker.set(marker) {
            error!(error = %e, "failed to persist transition completion marker");
        }
        info!(device = %device_id, "failsafe transition complete");
    }

    fn record_replacement_error(
        &self,
        old_device_id: &str,
        new_device_id: &str,
        progress: u8,
        message: &str,
    ) {
        let marker = ReplacementMarker {
            state: ReplacementState::Error,
            old_device_id: old_device_id.to_string(),
            new_device_id: new_device_id.to_string(),
            progress,
            error: Some(message.to_string()),
            updated_at: chrono::Utc::now(),
        };
        if let Err(e) = self.replacement.set(marker) {
            error!(error = %e, "failed to persist replacement error marker");
        }
    }

    async fn record_replacement_complete(
        &self,
        pool_id: &str,
        old_device_id: &str,
        new_device_id: &str,
    ) {
        // Claim any extra capacity a larger replacement device brings; a
        // failure here leaves the pool healthy at its old size
        if let Err(e) = self.backend.expand_member(pool_id, new_device_id).await {
            warn!(
                %pool_id,
                device = %new_device_id,
                error = %e,
                "failed to claim extra capacity on replacement device"
            );
        }
        let marker = ReplacementMarker {
            state: ReplacementState::Finished,
            old_device_id: old_device_id.to_string(),
            new_device_id: new_device_id.to_string(),
            progress: 100,
            error: None,
            updated_at: chrono::Utc::now(),
        };
        if let Err(e) = self.replacement.set(marker) {
            error!(error = %e, "failed to persist replacement completion marker");
        }
        info!(old = %old_device_id, new = %new_device_id, "device replacement complete");
    }

    /// Watch the mirror rebuild until it completes or fails. The rebuild
    /// itself runs inside the pool tooling and survives our restarts; this
    /// task only observes and records.
    async fn monitor_transition(&self, device_id: String, _guard: OperationGuard) {
        let Some(identity) = self.config.pool_identity() else {
            self.record_transition_error(&device_id, 0, "no pool identity during transition");
            return;
        };
        let mut progress = self.marker.get().map(|m| m.progress).unwrap_or(0);

        loop {
            let state = match self.backend.pool_state(&identity.pool_id).await {
                Ok(Some(state)) => state,
                Ok(None) => {
                    self.record_transition_error(
                        &device_id,
                        progress,
                        "pool disappeared during transition",
                    );
                    return;
                }
                Err(e) => {
                    // Status read failures are transient; keep watching
                    warn!(error = %e, "transition monitor failed to read pool state");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = sleep(self.poll_interval) => continue,
                    }
                }
            };

            if let Some(resilver) = state.resilver {
                if resilver.finished {
                    self.record_transition_complete(&device_id);
                    return;
                }
                if resilver.percent > progress {
                    progress = resilver.percent;
                    let mut marker = TransitionMarker::migrating(&device_id);
                    marker.progress = progress;
                    if let Err(e) = self.marker.set(marker) {
                        warn!(error = %e, "failed to persist transition progress");
                    }
                }
            } else {
                let target = state.members.iter().find(|m| m.device_id == device_id);
                match target {
                    Some(member) if member.health == PoolHealth::Online => {
                        // Rebuild already over by the time we looked
                        self.record_transition_complete(&device_id);
                        return;
                    }
                    Some(member) => {
                        self.record_transition_error(
                            &device_id,
                            progress,
                            &format!(
                                "device {} is {} after mirror rebuild",
                                member.device_id, member.health
                            ),
                        );
                        return;
                    }
                    None => {
                        self.record_transition_error(
                            &device_id,
                            progress,
                            "mirror target is no longer a pool member",
                        );
                        return;
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep(self.poll_interval) => {}
            }
        }
    }

    /// Watch the replacement rebuild until it completes or fails, then
    /// claim any extra capacity on the new device. Observes and records
    /// only; the rebuild runs inside the pool tooling.
    async fn monitor_replacement(
        &self,
        old_device_id: String,
        new_device_id: String,
        _guard: OperationGuard,
    ) {
        let Some(identity) = self.config.pool_identity() else {
            self.record_replacement_error(
                &old_device_id,
                &new_device_id,
                0,
                "no pool identity during replacement",
            );
            return;
        };
        let mut progress = self.replacement.get().map(|m| m.progress).unwrap_or(0);

        loop {
            let state = match self.backend.pool_state(&identity.pool_id).await {
                Ok(Some(state)) => state,
                Ok(None) => {
                    self.record_replacement_error(
                        &old_device_id,
                        &new_device_id,
                        progress,
                        "pool disappeared during replacement",
                    );
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "replacement monitor failed to read pool state");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = sleep(self.poll_interval) => continue,
                    }
                }
            };

            if let Some(resilver) = state.resilver {
                if resilver.finished {
                    self.record_replacement_complete(
                        &identity.pool_id,
                        &old_device_id,
                        &new_device_id,
                    )
                    .await;
                    return;
                }
                if resilver.percent > progress {
                    progress = resilver.percent;
                    let mut marker =
                        ReplacementMarker::rebuilding(&old_device_id, &new_device_id);
                    marker.progress = progress;
                    if let Err(e) = self.replacement.set(marker) {
                        warn!(error = %e, "failed to persist replacement progress");
                    }
                }
            } else {
                let target = state.members.iter().find(|m| m.device_id == new_device_id);
                match target {
                    Some(member) if member.health == PoolHealth::Online => {
                        // No rebuild visible but the new device is online
                        self.record_replacement_complete(
                            &identity.pool_id,
                            &old_device_id,
                            &new_device_id,
                        )
                        .await;
                        return;
                    }
                    Some(member) => {
                        self.record_replacement_error(
                            &old_device_id,
                            &new_device_id,
                            progress,
                            &format!(
                                "device {} is {} after replacement rebuild",
                                member.device_id, member.health
                            ),
                        );
                        return;
                    }
                    None => {
                        self.record_replacement_error(
                            &old_device_id,
                            &new_device_id,
                            progress,
                            "replacement target is not a pool member",
                        );
                        return;
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep(self.poll_interval) => {}
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
