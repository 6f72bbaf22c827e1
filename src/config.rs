//! Registration settings for index groups.
//!
//! Each group owns an independent hash table and log, configured at
//! registration time. Settings are plain serializable structs validated up
//! front; an ill-formed setting is an argument error and the group is never
//! created.

use serde::{Deserialize, Serialize};

use crate::error::{ChaindexError, Result};

/// Smallest permitted hash table (buckets).
pub const MIN_HASH_TABLE_SIZE: usize = 1 << 6;

/// Page-size bounds for the secondary log.
pub const MIN_PAGE_BITS: u8 = 6;
pub const MAX_PAGE_BITS: u8 = 30;

/// Read-cache settings for the secondary log.
///
/// Present so the settings surface is complete; a configured read cache is
/// rejected at registration — the secondary store does not support one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadCacheSettings {
    pub memory_bits: u8,
}

/// Log geometry for one group's secondary store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    /// In-memory window: addresses within `1 << memory_bits` of the tail
    /// stay readable without device I/O. Older pages are flushed and their
    /// reads go through the pending path.
    pub memory_bits: u8,
    /// Device segment size (`1 << segment_bits` bytes).
    pub segment_bits: u8,
    /// Page size (`1 << page_bits` bytes). Records never span pages.
    pub page_bits: u8,
    /// Must be `None`; see [`ReadCacheSettings`].
    pub read_cache: Option<ReadCacheSettings>,
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            memory_bits: 25, // 32 MiB in memory
            segment_bits: 23,
            page_bits: 16, // 64 KiB pages
            read_cache: None,
        }
    }
}

impl LogSettings {
    pub fn page_size(&self) -> usize {
        1usize << self.page_bits
    }

    pub fn in_memory_span(&self) -> u64 {
        1u64 << self.memory_bits
    }

    fn validate(&self) -> Result<()> {
        if self.page_bits < MIN_PAGE_BITS || self.page_bits > MAX_PAGE_BITS {
            return Err(ChaindexError::InvalidArgument(format!(
                "page_bits must be in {MIN_PAGE_BITS}..={MAX_PAGE_BITS}, got {}",
                self.page_bits
            )));
        }
        if self.memory_bits < self.page_bits {
            return Err(ChaindexError::InvalidArgument(format!(
                "memory_bits ({}) must be >= page_bits ({})",
                self.memory_bits, self.page_bits
            )));
        }
        if self.segment_bits < self.page_bits {
            return Err(ChaindexError::InvalidArgument(format!(
                "segment_bits ({}) must be >= page_bits ({})",
                self.segment_bits, self.page_bits
            )));
        }
        if self.read_cache.is_some() {
            return Err(ChaindexError::InvalidArgument(
                "the secondary store does not support a read cache".into(),
            ));
        }
        Ok(())
    }
}

/// Settings for registering a predicate group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationSettings {
    /// Hash-table bucket count. Must be a power of two.
    pub hash_table_size: usize,
    /// Secondary-log geometry.
    pub log: LogSettings,
    /// When true, sessions pin to the registering thread's epoch slot.
    /// Affects nothing beyond session bookkeeping today.
    pub thread_affinitized: bool,
    /// In-place-update cache sizes. Both must be zero: the caches are not
    /// implemented and non-zero sizes are rejected.
    pub ipu_cache_1_size: usize,
    pub ipu_cache_2_size: usize,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        RegistrationSettings {
            hash_table_size: 1 << 16,
            log: LogSettings::default(),
            thread_affinitized: false,
            ipu_cache_1_size: 0,
            ipu_cache_2_size: 0,
        }
    }
}

impl RegistrationSettings {
    /// Validate the whole settings tree.
    pub fn validate(&self) -> Result<()> {
        if !self.hash_table_size.is_power_of_two() {
            return Err(ChaindexError::InvalidArgument(format!(
                "hash_table_size must be a power of two, got {}",
                self.hash_table_size
            )));
        }
        if self.hash_table_size < MIN_HASH_TABLE_SIZE {
            return Err(ChaindexError::InvalidArgument(format!(
                "hash_table_size must be at least {MIN_HASH_TABLE_SIZE}, got {}",
                self.hash_table_size
            )));
        }
        if self.ipu_cache_1_size != 0 || self.ipu_cache_2_size != 0 {
            return Err(ChaindexError::InvalidArgument(
                "in-place-update caches are not implemented; sizes must be 0".into(),
            ));
        }
        self.log.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_validate() {
        assert!(RegistrationSettings::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_non_power_of_two_table() {
        let mut s = RegistrationSettings::default();
        s.hash_table_size = 1000;
        assert!(matches!(
            s.validate(),
            Err(ChaindexError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rejects_tiny_table() {
        let mut s = RegistrationSettings::default();
        s.hash_table_size = 32;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_rejects_ipu_caches() {
        let mut s = RegistrationSettings::default();
        s.ipu_cache_1_size = 4096;
        assert!(s.validate().is_err());

        let mut s = RegistrationSettings::default();
        s.ipu_cache_2_size = 1;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_rejects_read_cache() {
        let mut s = RegistrationSettings::default();
        s.log.read_cache = Some(ReadCacheSettings { memory_bits: 20 });
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_rejects_memory_smaller_than_page() {
        let mut s = RegistrationSettings::default();
        s.log.page_bits = 16;
        s.log.memory_bits = 12;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_page_bits() {
        let mut s = RegistrationSettings::default();
        s.log.page_bits = 4;
        assert!(s.validate().is_err());
        s.log.page_bits = 31;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_settings_json_roundtrip() {
        let s = RegistrationSettings::default();
        let js = serde_json::to_string(&s).unwrap();
        let back: RegistrationSettings = serde_json::from_str(&js).unwrap();
        assert_eq!(back, s);
    }
}
