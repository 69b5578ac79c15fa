//! Pool Identity Resolver
//!
//! Decides which of the pool signatures physically present on attached
//! hardware belongs to this installation. Matching is by the embedded
//! pool id only - never by device membership, slot, or device count - so
//! a pool found with only a subset of its historical devices still
//! resolves (health is handled downstream).
//!
//! Non-matching signatures are foreign pools: drives left over from some
//! other installation. They are logged for diagnostics and otherwise
//! invisible to every other component. They are never auto-imported,
//! auto-repaired, or merged.

use crate::domain::types::{PoolIdentity, PoolSignature};
use tracing::{debug, info};

/// Find the signature owned by `identity` among all visible signatures.
/// `None` means no pool for this installation is present; that is not an
/// error by itself (fresh unconfigured hardware looks exactly like this).
pub fn resolve_owned_pool<'a>(
    candidates: &'a [PoolSignature],
    identity: &PoolIdentity,
) -> Option<&'a PoolSignature> {
    let mut owned = None;
    for signature in candidates {
        if signature.pool_id == identity.pool_id {
            debug!(
                pool_id = %signature.pool_id,
                devices = signature.device_ids.len(),
                "resolved owned pool"
            );
            owned = Some(signature);
        } else {
            info!(
                pool_id = %signature.pool_id,
                guid = signature.guid,
                "ignoring foreign pool signature"
            );
        }
    }
    owned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::RaidType;

    fn signature(pool_id: &str, guid: u64, devices: &[&str]) -> PoolSignature {
        PoolSignature {
            pool_id: pool_id.to_string(),
            guid,
            device_ids: devices.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn identity(pool_id: &str) -> PoolIdentity {
        PoolIdentity {
            pool_id: pool_id.to_string(),
            raid_type: RaidType::Storage,
        }
    }

    #[test]
    fn test_resolves_by_embedded_id() {
        let candidates = vec![
            signature("homepool-aaaa0001", 11, &["nvme-A-1"]),
            signature("homepool-bbbb0002", 22, &["nvme-B-2", "nvme-C-3"]),
        ];
        let resolved =
            resolve_owned_pool(&candidates, &identity("homepool-bbbb0002")).unwrap();
        assert_eq!(resolved.guid, 22);
    }

    #[test]
    fn test_foreign_pools_are_ignored_not_errors() {
        // Only somebody else's pools are attached
        let candidates = vec![signature("homepool-dead0001", 99, &["nvme-X-9"])];
        assert!(resolve_owned_pool(&candidates, &identity("homepool-aaaa0001")).is_none());
    }

    #[test]
    fn test_no_signatures_resolves_absent() {
        assert!(resolve_owned_pool(&[], &identity("homepool-aaaa0001")).is_none());
    }

    #[test]
    fn test_subset_of_devices_still_resolves() {
        // Two of four original devices attached; the signature still
        // carries the owned id and must resolve
        let candidates = vec![signature("homepool-cafe0004", 44, &["nvme-A-1", "nvme-B-2"])];
        let resolved =
            resolve_owned_pool(&candidates, &identity("homepool-cafe0004")).unwrap();
        assert_eq!(resolved.device_ids.len(), 2);
    }

    #[test]
    fn test_owned_pool_found_among_foreign_pools() {
        let candidates = vec![
            signature("homepool-f0f0f0f0", 1, &["nvme-F-1"]),
            signature("homepool-aaaa0001", 2, &["nvme-A-1"]),
            signature("homepool-0f0f0f0f", 3, &["nvme-G-2"]),
        ];
        let resolved =
            resolve_owned_pool(&candidates, &identity("homepool-aaaa0001")).unwrap();
        assert_eq!(resolved.device_ids, vec!["nvme-A-1".to_string()]);
    }
}
