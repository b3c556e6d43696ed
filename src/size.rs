//! Initial allocation sizing for base images.
//!
//! The nominal size of a container image is usually the compressed layer size, and the
//! extracted tree plus ext4 metadata and journal can be several times bigger.  The image file
//! is sparse and gets shrunk after population, so over-allocating costs nothing on disk.

use log::info;

/// Environment variable overriding the floor, in whole GB.
pub const MIN_SIZE_GB_ENV: &str = "IMGFS_BASE_IMAGE_MIN_SIZE_GB";

/// Expansion from nominal (compressed) size to extracted size plus filesystem overhead.
pub const SIZE_MULTIPLIER: u64 = 5;

/// Floor used when no valid override is configured.
pub const DEFAULT_MIN_SIZE_GB: u64 = 10;

const MIN_SIZE_GB_RANGE: std::ops::RangeInclusive<u64> = 1..=100;
const GB: u64 = 1024 * 1024 * 1024;

/// How big a freshly created image file should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizePolicy {
    floor_bytes: u64,
}

impl Default for SizePolicy {
    fn default() -> Self {
        Self {
            floor_bytes: DEFAULT_MIN_SIZE_GB * GB,
        }
    }
}

impl SizePolicy {
    /// Builds a policy from an optional override string.  Anything that isn't an integer in
    /// 1..=100 (after trimming) is ignored and the default floor is used instead.
    pub fn with_floor_override(value: Option<&str>) -> Self {
        let gb = value
            .and_then(|s| s.trim().parse::<u64>().ok())
            .filter(|gb| MIN_SIZE_GB_RANGE.contains(gb))
            .unwrap_or(DEFAULT_MIN_SIZE_GB);
        Self {
            floor_bytes: gb * GB,
        }
    }

    /// Reads [`MIN_SIZE_GB_ENV`] once.  Meant to be called at startup; the result is then
    /// passed around explicitly.
    pub fn from_env() -> Self {
        Self::with_floor_override(std::env::var(MIN_SIZE_GB_ENV).ok().as_deref())
    }

    pub fn floor_bytes(&self) -> u64 {
        self.floor_bytes
    }

    pub fn floor_gb(&self) -> u64 {
        self.floor_bytes / GB
    }

    /// Returns `max(nominal × SIZE_MULTIPLIER, floor)`.
    pub fn plan(&self, nominal: u64) -> u64 {
        info!(
            "minimum base image size {} GB (override with {MIN_SIZE_GB_ENV})",
            self.floor_gb()
        );
        nominal
            .saturating_mul(SIZE_MULTIPLIER)
            .max(self.floor_bytes)
    }
}
