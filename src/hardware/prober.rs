//! Device Prober
//!
//! Enumerates physically attached internal NVMe devices and derives a
//! slot-independent stable identity for each. The stable id is the
//! `/dev/disk/by-id` name, which encodes model and serial and therefore
//! survives reboots and physical slot moves. The physical bay number is
//! derived from the PCIe physical slot table in sysfs; PCI bus and root
//! port addresses are NOT stable (they change with slot population) and
//! must never be used as identity.

use crate::domain::ports::DeviceProber;
use crate::domain::types::StorageDevice;
use crate::error::{Error, Result};
use crate::hardware::sizing::rounded_device_size;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

// =============================================================================
// Constants
// =============================================================================

const DISK_BY_ID: &str = "/dev/disk/by-id";
const SYSFS_PCI_SLOTS: &str = "/sys/bus/pci/slots";

/// Mapping from PCIe physical slot number to chassis bay number.
/// Measured on the appliance motherboard; stable across population changes.
fn bay_from_pci_slot(pci_slot: u32) -> Option<u32> {
    match pci_slot {
        6 => Some(1),
        4 => Some(2),
        14 => Some(3),
        12 => Some(4),
        _ => None,
    }
}

// =============================================================================
// lsblk Output Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    model: Option<String>,
    serial: Option<String>,
    size: Option<u64>,
    #[serde(rename = "type")]
    device_type: Option<String>,
    tran: Option<String>,
}

// =============================================================================
// Production Prober
// =============================================================================

/// Probes internal NVMe devices via `lsblk` and sysfs.
pub struct LsblkProber {
    by_id_dir: PathBuf,
    pci_slots_dir: PathBuf,
}

impl LsblkProber {
    pub fn new() -> Self {
        Self {
            by_id_dir: PathBuf::from(DISK_BY_ID),
            pci_slots_dir: PathBuf::from(SYSFS_PCI_SLOTS),
        }
    }

    /// Resolve the stable `/dev/disk/by-id` name for a kernel device name
    /// (e.g. `nvme0n1`). Partition entries (`-partN`) are skipped.
    fn resolve_device_id(&self, device_name: &str) -> Option<String> {
        let entries = fs::read_dir(&self.by_id_dir).ok()?;
        let target_dev = format!("/dev/{device_name}");

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_partition_entry(&name) {
                continue;
            }
            let link_path = entry.path();
            let Ok(target) = fs::read_link(&link_path) else {
                continue;
            };
            let resolved = if target.is_absolute() {
                target
            } else {
                normalize_path(&self.by_id_dir.join(target))
            };
            if resolved == Path::new(&target_dev) {
                return Some(name);
            }
        }
        None
    }

    /// Find the physical bay a device occupies by matching its PCI address
    /// against the sysfs slot table.
    fn resolve_slot(&self, device_name: &str) -> Option<u32> {
        let pci_address = self.pci_address_of(device_name)?;

        let entries = fs::read_dir(&self.pci_slots_dir).ok()?;
        for entry in entries.flatten() {
            let Ok(slot_number) = entry.file_name().to_string_lossy().parse::<u32>() else {
                continue;
            };
            let Ok(address) = fs::read_to_string(entry.path().join("address")) else {
                continue;
            };
            // Slot address is the function-less form, e.g. "0000:01:00"
            if pci_address.starts_with(address.trim()) {
                return bay_from_pci_slot(slot_number);
            }
        }
        None
    }

    /// Walk the sysfs device path of a block device to find the PCI
    /// address of the NVMe controller it hangs off.
    fn pci_address_of(&self, device_name: &str) -> Option<String> {
        let sys_path = fs::canonicalize(format!("/sys/class/block/{device_name}")).ok()?;
        // Path looks like .../pci0000:00/0000:00:1c.0/0000:01:00.0/nvme/nvme0/nvme0n1
        for component in sys_path.components().rev() {
            let part = component.as_os_str().to_string_lossy();
            if looks_like_pci_address(&part) {
                return Some(part.to_string());
            }
        }
        None
    }
}

impl Default for LsblkProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceProber for LsblkProber {
    async fn get_devices(&self) -> Result<Vec<StorageDevice>> {
        let output = Command::new("lsblk")
            .args([
                "--output",
                "NAME,MODEL,SERIAL,SIZE,TYPE,TRAN",
                "--json",
                "--bytes",
            ])
            .output()
            .await
            .map_err(|e| Error::Probe(format!("failed to run lsblk: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Probe(format!("lsblk failed: {stderr}")));
        }

        let parsed: LsblkOutput = serde_json::from_slice(&output.stdout)?;

        let mut devices = Vec::new();
        for block in parsed.blockdevices {
            let is_internal_disk = block.device_type.as_deref() == Some("disk")
                && block.tran.as_deref() == Some("nvme");
            if !is_internal_disk {
                continue;
            }

            // A device without a resolvable stable id is unreadable for our
            // purposes; skip it rather than failing the whole probe.
            let Some(id) = self.resolve_device_id(&block.name) else {
                warn!(device = %block.name, "skipping device without a stable id");
                continue;
            };

            let raw_size_bytes = block.size.unwrap_or(0);
            let slot = self.resolve_slot(&block.name);
            debug!(device = %block.name, %id, ?slot, raw_size_bytes, "probed device");

            devices.push(StorageDevice {
                id,
                slot,
                model: block.model.map(|m| m.trim().to_string()).unwrap_or_default(),
                serial: block.serial.map(|s| s.trim().to_string()).unwrap_or_default(),
                raw_size_bytes,
                rounded_size_bytes: rounded_device_size(raw_size_bytes),
            });
        }

        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }
}

fn is_partition_entry(name: &str) -> bool {
    if let Some(idx) = name.rfind("-part") {
        return name[idx + 5..].chars().all(|c| c.is_ascii_digit())
            && name.len() > idx + 5;
    }
    false
}

fn looks_like_pci_address(s: &str) -> bool {
    // e.g. "0000:01:00.0"
    let bytes = s.as_bytes();
    bytes.len() == 12 && bytes[4] == b':' && bytes[7] == b':' && bytes[10] == b'.'
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                normalized.pop();
            }
            std::path::Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    normalized
}

// =============================================================================
// Static Prober (standalone mode and tests)
// =============================================================================

/// A prober backed by a fixed, mutable device table. Used by the daemon's
/// standalone mode and by tests to simulate attach, removal, and physical
/// slot rearrangement without hardware.
#[derive(Default)]
pub struct StaticProber {
    devices: RwLock<BTreeMap<String, StorageDevice>>,
}

impl StaticProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a device. Sizes are normalized on insert.
    pub fn upsert_device(&self, id: &str, slot: Option<u32>, raw_size_bytes: u64) {
        self.devices.write().insert(
            id.to_string(),
            StorageDevice {
                id: id.to_string(),
                slot,
                model: format!("Simulated SSD {raw_size_bytes}"),
                serial: id.to_string(),
                raw_size_bytes,
                rounded_size_bytes: rounded_device_size(raw_size_bytes),
            },
        );
    }

    /// Move a device to a different physical bay, as a human would by
    /// physically reseating the drive. Identity is untouched.
    pub fn set_slot(&self, id: &str, slot: Option<u32>) {
        if let Some(device) = self.devices.write().get_mut(id) {
            device.slot = slot;
        }
    }

    pub fn remove_device(&self, id: &str) {
        self.devices.write().remove(id);
    }
}

#[async_trait]
impl DeviceProber for StaticProber {
    async fn get_devices(&self) -> Result<Vec<StorageDevice>> {
        // BTreeMap iteration already yields id order
        Ok(self.devices.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_entry_detection() {
        assert!(is_partition_entry("nvme-Samsung_SSD-S123-part1"));
        assert!(is_partition_entry("nvme-Samsung_SSD-S123-part12"));
        assert!(!is_partition_entry("nvme-Samsung_SSD-S123"));
        assert!(!is_partition_entry("nvme-Samsung_SSD-S123-part"));
        assert!(!is_partition_entry("nvme-Samsung_SSD-partial"));
    }

    #[test]
    fn test_pci_address_detection() {
        assert!(looks_like_pci_address("0000:01:00.0"));
        assert!(looks_like_pci_address("0000:05:00.0"));
        assert!(!looks_like_pci_address("nvme0n1"));
        assert!(!looks_like_pci_address("pci0000:00"));
    }

    #[test]
    fn test_bay_mapping() {
        assert_eq!(bay_from_pci_slot(6), Some(1));
        assert_eq!(bay_from_pci_slot(4), Some(2));
        assert_eq!(bay_from_pci_slot(14), Some(3));
        assert_eq!(bay_from_pci_slot(12), Some(4));
        assert_eq!(bay_from_pci_slot(0), None);
    }

    #[tokio::test]
    async fn test_static_prober_id_stable_across_slot_moves() {
        let prober = StaticProber::new();
        prober.upsert_device("nvme-A-1", Some(1), 2_000_000_000_000);
        prober.upsert_device("nvme-B-2", Some(2), 2_000_000_000_000);

        let before = prober.get_devices().await.unwrap();
        assert_eq!(before.len(), 2);

        // Swap the physical bays
        prober.set_slot("nvme-A-1", Some(2));
        prober.set_slot("nvme-B-2", Some(1));

        let after = prober.get_devices().await.unwrap();
        let ids_before: Vec<_> = before.iter().map(|d| &d.id).collect();
        let ids_after: Vec<_> = after.iter().map(|d| &d.id).collect();
        assert_eq!(ids_before, ids_after);
        assert_eq!(after[0].slot, Some(2));
        assert_eq!(after[1].slot, Some(1));
    }

    #[tokio::test]
    async fn test_static_prober_normalizes_sizes() {
        let prober = StaticProber::new();
        prober.upsert_device("nvme-C-3", None, 4_096_000_000_000);
        let devices = prober.get_devices().await.unwrap();
        assert_eq!(devices[0].raw_size_bytes, 4_096_000_000_000);
        assert_eq!(devices[0].rounded_size_bytes, 4_000_000_000_000);
    }
}
