//! Size Normalizer
//!
//! Vendors report slightly different byte counts for nominally identical
//! drive capacities; two "4 TB" SSDs commonly differ by tens of GB. Pool
//! construction requires members to agree on a usable size, so every
//! member is normalized onto the same coarse grid before any pool math.

const ONE_TERABYTE: u64 = 1_000_000_000_000;
const GRID_STEP: u64 = 250_000_000_000;

/// Round a raw device size down to the nearest 250 GB multiple if it is
/// 1 TB or larger; smaller sizes are returned unchanged.
///
/// Pure and deterministic. Never rounds up, so the normalized size always
/// fits on the physical device.
pub fn rounded_device_size(size_in_bytes: u64) -> u64 {
    if size_in_bytes >= ONE_TERABYTE {
        (size_in_bytes / GRID_STEP) * GRID_STEP
    } else {
        size_in_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_below_one_terabyte_unchanged() {
        assert_eq!(rounded_device_size(0), 0);
        assert_eq!(rounded_device_size(1), 1);
        assert_eq!(rounded_device_size(32_000_000_000), 32_000_000_000);
        assert_eq!(rounded_device_size(999_999_999_999), 999_999_999_999);
    }

    #[test]
    fn test_one_terabyte_boundary() {
        // 1 TB is itself a multiple of 250 GB
        assert_eq!(rounded_device_size(1_000_000_000_000), 1_000_000_000_000);
    }

    #[test]
    fn test_rounds_down_above_one_terabyte() {
        // A "4 TB" drive reporting 4096 GB and one reporting 4000 GB
        // normalize to the same grid value
        assert_eq!(rounded_device_size(4_096_000_000_000), 4_000_000_000_000);
        assert_eq!(rounded_device_size(4_000_000_000_000), 4_000_000_000_000);

        // Just below a multiple rounds down to the prior multiple, never up
        assert_eq!(rounded_device_size(1_249_999_999_999), 1_000_000_000_000);
        assert_eq!(rounded_device_size(1_250_000_000_000), 1_250_000_000_000);
    }

    #[test]
    fn test_never_exceeds_input() {
        for size in [
            1_000_000_000_001u64,
            1_847_123_456_789,
            2_000_000_000_000,
            7_999_999_999_999,
        ] {
            let rounded = rounded_device_size(size);
            assert!(rounded <= size);
            assert_eq!(rounded % GRID_STEP, 0);
        }
    }
}
