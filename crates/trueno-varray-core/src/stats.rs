//! Cache statistics.

use crate::page::{ChannelId, DeviceId};
use std::fmt;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of one channel cache, updated without taking the channel lock.
#[derive(Debug, Default)]
pub(crate) struct ChannelCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    fetches: AtomicU64,
    writebacks: AtomicU64,
    bytes_fetched: AtomicU64,
    bytes_written_back: AtomicU64,
}

impl ChannelCounters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fetched(&self, bytes: usize) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.bytes_fetched.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn written_back(&self, bytes: usize) {
        self.writebacks.fetch_add(1, Ordering::Relaxed);
        self.bytes_written_back.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            writebacks: self.writebacks.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            bytes_written_back: self.bytes_written_back.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.fetches.store(0, Ordering::Relaxed);
        self.writebacks.store(0, Ordering::Relaxed);
        self.bytes_fetched.store(0, Ordering::Relaxed);
        self.bytes_written_back.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of cache activity.
///
/// A miss costs one page fetch; an eviction of a dirty page costs one
/// write-back. Hits cost no transfer. A miss whose transfer fails is still
/// counted as a miss but not as a fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Accesses served from a resident page.
    pub hits: u64,
    /// Accesses that required a fetch.
    pub misses: u64,
    /// Pages removed from the resident set.
    pub evictions: u64,
    /// Completed device → host page copies.
    pub fetches: u64,
    /// Dirty pages written back (on eviction or flush).
    pub writebacks: u64,
    /// Bytes copied device → host.
    pub bytes_fetched: u64,
    /// Bytes copied host → device.
    pub bytes_written_back: u64,
}

impl CacheStats {
    /// Total accesses.
    #[must_use]
    pub fn accesses(&self) -> u64 {
        self.hits + self.misses
    }

    /// Fraction of accesses served without a transfer, in `[0, 1]`.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let accesses = self.accesses();
        if accesses == 0 {
            return 0.0;
        }
        self.hits as f64 / accesses as f64
    }

    /// Bytes moved in either direction.
    #[must_use]
    pub fn transfer_bytes(&self) -> u64 {
        self.bytes_fetched + self.bytes_written_back
    }
}

impl AddAssign for CacheStats {
    fn add_assign(&mut self, rhs: Self) {
        self.hits += rhs.hits;
        self.misses += rhs.misses;
        self.evictions += rhs.evictions;
        self.fetches += rhs.fetches;
        self.writebacks += rhs.writebacks;
        self.bytes_fetched += rhs.bytes_fetched;
        self.bytes_written_back += rhs.bytes_written_back;
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} hits, {} misses ({:.2}% hit rate), {} evictions, {} write-backs, {}B transferred",
            self.hits,
            self.misses,
            self.hit_ratio() * 100.0,
            self.evictions,
            self.writebacks,
            self.transfer_bytes()
        )
    }
}

/// Statistics of one channel cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    /// Device the channel belongs to.
    pub device: DeviceId,
    /// Channel within the device.
    pub channel: ChannelId,
    /// Pages currently resident.
    pub resident_pages: usize,
    /// Resident pages with unpersisted writes.
    pub dirty_pages: usize,
    /// Activity counters.
    pub cache: CacheStats,
}
