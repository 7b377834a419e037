//! Per-channel write-back LRU page cache.
//!
//! Each channel owns up to `capacity` resident pages for the slice of the
//! index space routed to it. Page states:
//!
//! ```text
//!   Absent ──fetch──► Resident(clean) ──write──► Resident(dirty)
//!      ▲                    │                          │
//!      └──────evict─────────┘◄──────write-back─────────┘
//! ```
//!
//! A miss runs evict → fetch → serve under the channel lock, so two
//! concurrent misses on the same page issue one fetch. Channels share no
//! state: a transfer on one channel never blocks callers routed elsewhere.

use crate::device::BackingStore;
use crate::page::{ChannelId, DeviceId, Element, Page, PageId};
use crate::router::Route;
use crate::stats::{ChannelCounters, ChannelStats};
use crate::{Error, Result};
use lru::LruCache;
use parking_lot::Mutex;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// LRU cache of pages bound to one device transfer channel.
pub struct ChannelCache<T: Element> {
    device: DeviceId,
    channel: ChannelId,
    page_size: usize,
    capacity: NonZeroUsize,
    store: Arc<BackingStore>,
    resident: Mutex<LruCache<PageId, Page<T>>>,
    counters: ChannelCounters,
}

impl<T: Element> ChannelCache<T> {
    /// Create an empty cache of `capacity` pages over `store`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `capacity` or `page_size` is zero.
    pub fn new(
        device: DeviceId,
        channel: ChannelId,
        page_size: usize,
        capacity: usize,
        store: Arc<BackingStore>,
    ) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            Error::Configuration(format!("{device} {channel}: capacity must be positive"))
        })?;
        if page_size == 0 {
            return Err(Error::Configuration("page_size must be positive".to_string()));
        }

        Ok(Self {
            device,
            channel,
            page_size,
            capacity,
            store,
            // Eviction is driven manually so a failed write-back keeps the page.
            resident: Mutex::new(LruCache::unbounded()),
            counters: ChannelCounters::default(),
        })
    }

    /// Device this channel transfers to.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Channel index within its device.
    #[must_use]
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Maximum number of resident pages.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Read the element at `route`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransferFailure`] if the eviction write-back or the
    /// fetch fails.
    pub fn read(&self, route: &Route) -> Result<T> {
        self.with_page(route, |page| page.get(route.offset))
    }

    /// Write `value` at `route`; persisted on eviction or flush.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransferFailure`] if the eviction write-back or the
    /// fetch fails.
    pub fn write(&self, route: &Route, value: T) -> Result<()> {
        self.with_page(route, |page| page.set(route.offset, value))
    }

    /// Read `out.len()` consecutive elements starting at `route`.
    ///
    /// The run must not cross the end of the page.
    ///
    /// # Errors
    ///
    /// Same as [`ChannelCache::read`].
    pub fn read_run(&self, route: &Route, out: &mut [T]) -> Result<()> {
        self.check_run(route, out.len())?;
        self.with_page(route, |page| page.read_run(route.offset, out))
    }

    /// Write `values` consecutively starting at `route`.
    ///
    /// The run must not cross the end of the page.
    ///
    /// # Errors
    ///
    /// Same as [`ChannelCache::write`].
    pub fn write_run(&self, route: &Route, values: &[T]) -> Result<()> {
        self.check_run(route, values.len())?;
        self.with_page(route, |page| page.write_run(route.offset, values))
    }

    /// Make the page at `route` resident without touching its elements.
    ///
    /// # Errors
    ///
    /// Same as [`ChannelCache::read`].
    pub fn prefetch(&self, route: &Route) -> Result<()> {
        self.with_page(route, |_| ())
    }

    /// Write back every dirty resident page. Pages stay resident.
    ///
    /// Every dirty page is attempted even after a failure; failed pages keep
    /// their dirty flag. Returns the number of pages written.
    ///
    /// # Errors
    ///
    /// Returns the first [`Error::TransferFailure`] encountered.
    pub fn flush(&self) -> Result<usize> {
        let mut resident = self.resident.lock();
        let mut written = 0;
        let mut first_error = None;

        for (_, page) in resident.iter_mut() {
            if !page.is_dirty() {
                continue;
            }
            match self.store.write_page(page.slot(), page.as_bytes()) {
                Ok(()) => {
                    page.mark_clean();
                    self.counters.written_back(page.as_bytes().len());
                    written += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        device = %self.device,
                        channel = %self.channel,
                        page = %page.id(),
                        error = %e,
                        "Write-back failed during flush"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Number of resident pages.
    #[must_use]
    pub fn resident_pages(&self) -> usize {
        self.resident.lock().len()
    }

    /// Resident page ids, most recently used first.
    #[must_use]
    pub fn resident_page_ids(&self) -> Vec<PageId> {
        self.resident.lock().iter().map(|(id, _)| *id).collect()
    }

    /// Whether `page` is resident. Does not affect recency.
    #[must_use]
    pub fn is_resident(&self, page: PageId) -> bool {
        self.resident.lock().contains(&page)
    }

    /// Whether `page` is resident with unpersisted writes.
    #[must_use]
    pub fn is_dirty(&self, page: PageId) -> bool {
        self.resident.lock().peek(&page).is_some_and(Page::is_dirty)
    }

    /// Snapshot of residency and activity.
    #[must_use]
    pub fn stats(&self) -> ChannelStats {
        let (resident_pages, dirty_pages) = {
            let resident = self.resident.lock();
            let dirty = resident.iter().filter(|(_, page)| page.is_dirty()).count();
            (resident.len(), dirty)
        };
        ChannelStats {
            device: self.device,
            channel: self.channel,
            resident_pages,
            dirty_pages,
            cache: self.counters.snapshot(),
        }
    }

    /// Reset activity counters.
    pub fn reset_stats(&self) {
        self.counters.reset();
    }

    fn check_run(&self, route: &Route, len: usize) -> Result<()> {
        match route.offset.checked_add(len) {
            Some(end) if end <= self.page_size => Ok(()),
            _ => Err(Error::Configuration(format!(
                "run of {len} elements at offset {} crosses the end of {} ({} elements)",
                route.offset, route.page, self.page_size
            ))),
        }
    }

    /// Ensure the page at `route` is resident, then apply `f` to it.
    fn with_page<R>(&self, route: &Route, f: impl FnOnce(&mut Page<T>) -> R) -> Result<R> {
        let mut resident = self.resident.lock();

        if let Some(page) = resident.get_mut(&route.page) {
            self.counters.hit();
            return Ok(f(page));
        }

        self.counters.miss();
        let recycled = if resident.len() >= self.capacity.get() {
            self.evict_lru(&mut resident)?
        } else {
            None
        };

        let mut page = self.fetch(route, recycled)?;
        let result = f(&mut page);
        resident.put(route.page, page);
        debug_assert!(resident.len() <= self.capacity.get());
        Ok(result)
    }

    /// Remove the least recently used page, writing it back first if dirty.
    ///
    /// On write-back failure the page stays resident and dirty.
    fn evict_lru(&self, resident: &mut LruCache<PageId, Page<T>>) -> Result<Option<Page<T>>> {
        if let Some((_, victim)) = resident.peek_lru() {
            if victim.is_dirty() {
                if let Err(e) = self.store.write_page(victim.slot(), victim.as_bytes()) {
                    tracing::warn!(
                        device = %self.device,
                        channel = %self.channel,
                        page = %victim.id(),
                        error = %e,
                        "Write-back failed, page kept resident"
                    );
                    return Err(e);
                }
                self.counters.written_back(victim.as_bytes().len());
            }
        }

        let evicted = resident.pop_lru().map(|(id, page)| {
            tracing::trace!(device = %self.device, channel = %self.channel, page = %id, "Evicted");
            self.counters.eviction();
            page
        });
        Ok(evicted)
    }

    /// Copy the page at `route` from the backing store, reusing `recycled`'s
    /// allocation when available.
    fn fetch(&self, route: &Route, recycled: Option<Page<T>>) -> Result<Page<T>> {
        let mut page = match recycled {
            Some(mut page) => {
                page.reassign(route.page, route.slot);
                page
            }
            None => Page::zeroed(route.page, route.slot, self.page_size),
        };

        self.store.read_page(route.slot, page.as_bytes_mut())?;
        self.counters.fetched(page.as_bytes().len());
        tracing::trace!(
            device = %self.device,
            channel = %self.channel,
            page = %route.page,
            "Fetched"
        );
        Ok(page)
    }
}

impl<T: Element> fmt::Debug for ChannelCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCache")
            .field("device", &self.device)
            .field("channel", &self.channel)
            .field("page_size", &self.page_size)
            .field("capacity", &self.capacity)
            .field("resident", &self.resident.try_lock().map(|r| r.len()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArrayConfig;
    use crate::device::testing::FlakyDevice;
    use crate::device::{DeviceMemory, HostDevice};
    use crate::router::ShardRouter;

    struct Fixture<D> {
        device: Arc<D>,
        router: ShardRouter,
        cache: ChannelCache<u64>,
    }

    /// Single-channel cache: every page routes to it.
    fn fixture<D: DeviceMemory + 'static>(
        device: D,
        pages: usize,
        page_size: usize,
        capacity: usize,
    ) -> Fixture<D> {
        let config = ArrayConfig::new(pages * page_size, vec![1])
            .with_page_size(page_size)
            .with_pages_per_channel(capacity);
        let router = ShardRouter::new(&config).unwrap();
        let device = Arc::new(device);
        let store = BackingStore::allocate(
            DeviceId(0),
            ChannelId(0),
            device.clone(),
            router.slots_per_channel(),
            page_size * std::mem::size_of::<u64>(),
        )
        .unwrap();
        let cache =
            ChannelCache::new(DeviceId(0), ChannelId(0), page_size, capacity, Arc::new(store))
                .unwrap();
        Fixture {
            device,
            router,
            cache,
        }
    }

    impl<D> Fixture<D> {
        fn route(&self, index: usize) -> Route {
            self.router.route(index).unwrap()
        }

        fn touch_page(&self, page: usize, page_size: usize) {
            let route = self.route(page * page_size);
            self.cache.read(&route).unwrap();
        }
    }

    #[test]
    fn test_new_rejects_zero_capacity() {
        let device: Arc<dyn DeviceMemory> = Arc::new(HostDevice::new("d"));
        let store =
            Arc::new(BackingStore::allocate(DeviceId(0), ChannelId(0), device, 1, 8).unwrap());
        let err = ChannelCache::<u64>::new(DeviceId(0), ChannelId(0), 1, 0, store).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_read_unwritten_is_zero() {
        let fx = fixture(HostDevice::new("d"), 4, 2, 2);
        assert_eq!(fx.cache.read(&fx.route(3)).unwrap(), 0);
    }

    #[test]
    fn test_write_then_read_hits() {
        let fx = fixture(HostDevice::new("d"), 4, 2, 2);
        let route = fx.route(5);
        fx.cache.write(&route, 77).unwrap();
        assert_eq!(fx.cache.read(&route).unwrap(), 77);
        assert!(fx.cache.is_dirty(route.page));

        let stats = fx.cache.stats().cache;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_hit_costs_no_transfer() {
        let fx = fixture(HostDevice::new("d"), 4, 4, 2);
        fx.cache.read(&fx.route(0)).unwrap();
        let before = fx.device.transfer_stats();

        for index in 0..4 {
            fx.cache.read(&fx.route(index)).unwrap();
        }
        assert_eq!(fx.device.transfer_stats(), before);
    }

    #[test]
    fn test_miss_costs_one_fetch() {
        let fx = fixture(HostDevice::new("d"), 4, 4, 2);
        fx.cache.read(&fx.route(0)).unwrap();

        let stats = fx.device.transfer_stats();
        assert_eq!(stats.copy_out_calls, 1);
        assert_eq!(stats.bytes_copied_out, 32);
        assert_eq!(stats.copy_in_calls, 0);
    }

    #[test]
    fn test_capacity_bound() {
        let fx = fixture(HostDevice::new("d"), 16, 1, 3);
        for page in 0..16 {
            fx.touch_page(page, 1);
            assert!(fx.cache.resident_pages() <= 3);
        }
        assert_eq!(fx.cache.resident_pages(), 3);
        assert_eq!(fx.cache.stats().cache.evictions, 13);
    }

    #[test]
    fn test_lru_evicts_first_accessed() {
        let fx = fixture(HostDevice::new("d"), 8, 1, 3);
        for page in 0..3 {
            fx.touch_page(page, 1);
        }
        fx.touch_page(3, 1);

        assert!(!fx.cache.is_resident(PageId(0)));
        assert_eq!(
            fx.cache.resident_page_ids(),
            vec![PageId(3), PageId(2), PageId(1)]
        );
    }

    #[test]
    fn test_reaccess_resets_recency() {
        let fx = fixture(HostDevice::new("d"), 8, 1, 3);
        for page in 0..3 {
            fx.touch_page(page, 1);
        }
        fx.touch_page(0, 1);
        fx.touch_page(3, 1);

        assert!(fx.cache.is_resident(PageId(0)));
        assert!(!fx.cache.is_resident(PageId(1)));
    }

    #[test]
    fn test_write_updates_recency() {
        let fx = fixture(HostDevice::new("d"), 8, 1, 2);
        fx.touch_page(0, 1);
        fx.touch_page(1, 1);
        fx.cache.write(&fx.route(0), 5).unwrap();
        fx.touch_page(2, 1);

        assert!(fx.cache.is_resident(PageId(0)));
        assert!(!fx.cache.is_resident(PageId(1)));
    }

    #[test]
    fn test_dirty_eviction_writes_back() {
        let fx = fixture(HostDevice::new("d"), 8, 2, 1);
        fx.cache.write(&fx.route(1), 42).unwrap();
        fx.touch_page(1, 2);

        assert!(!fx.cache.is_resident(PageId(0)));
        let stats = fx.cache.stats().cache;
        assert_eq!(stats.writebacks, 1);
        assert_eq!(stats.bytes_written_back, 16);
        assert_eq!(fx.cache.read(&fx.route(1)).unwrap(), 42);
    }

    #[test]
    fn test_clean_eviction_skips_write_back() {
        let fx = fixture(HostDevice::new("d"), 8, 2, 1);
        fx.touch_page(0, 2);
        fx.touch_page(1, 2);
        assert_eq!(fx.device.transfer_stats().copy_in_calls, 0);
        assert_eq!(fx.cache.stats().cache.evictions, 1);
    }

    #[test]
    fn test_flush_persists_and_cleans() {
        let fx = fixture(HostDevice::new("d"), 4, 2, 4);
        fx.cache.write(&fx.route(0), 1).unwrap();
        fx.cache.write(&fx.route(2), 2).unwrap();
        fx.touch_page(3, 2);

        assert_eq!(fx.cache.flush().unwrap(), 2);
        assert_eq!(fx.cache.stats().dirty_pages, 0);
        assert_eq!(fx.cache.resident_pages(), 3);
        assert_eq!(fx.cache.flush().unwrap(), 0);
        assert_eq!(fx.device.transfer_stats().copy_in_calls, 2);
    }

    #[test]
    fn test_failed_write_back_keeps_page_dirty() {
        let fx = fixture(FlakyDevice::new("flaky"), 4, 1, 1);
        fx.cache.write(&fx.route(0), 9).unwrap();

        fx.device.fail_writes(true);
        let err = fx.cache.read(&fx.route(1)).unwrap_err();
        assert!(err.is_transfer_failure());
        assert!(fx.cache.is_resident(PageId(0)));
        assert!(fx.cache.is_dirty(PageId(0)));

        fx.device.fail_writes(false);
        assert_eq!(fx.cache.read(&fx.route(1)).unwrap(), 0);
        assert_eq!(fx.cache.read(&fx.route(0)).unwrap(), 9);
    }

    #[test]
    fn test_failed_flush_keeps_dirty_flag() {
        let fx = fixture(FlakyDevice::new("flaky"), 4, 1, 4);
        fx.cache.write(&fx.route(0), 1).unwrap();
        fx.cache.write(&fx.route(1), 2).unwrap();

        fx.device.fail_writes(true);
        assert!(fx.cache.flush().is_err());
        assert_eq!(fx.cache.stats().dirty_pages, 2);

        fx.device.fail_writes(false);
        assert_eq!(fx.cache.flush().unwrap(), 2);
        assert_eq!(fx.device.host().transfer_stats().copy_in_calls, 2);
    }

    #[test]
    fn test_failed_fetch_leaves_cache_consistent() {
        let fx = fixture(FlakyDevice::new("flaky"), 4, 1, 1);
        fx.cache.write(&fx.route(0), 3).unwrap();

        fx.device.fail_reads(true);
        assert!(fx.cache.read(&fx.route(1)).is_err());
        assert_eq!(fx.cache.resident_pages(), 0);
        let stats = fx.cache.stats().cache;
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.fetches, 1);

        fx.device.fail_reads(false);
        assert_eq!(fx.cache.read(&fx.route(0)).unwrap(), 3);
    }

    #[test]
    fn test_runs() {
        let fx = fixture(HostDevice::new("d"), 4, 4, 2);
        fx.cache.write_run(&fx.route(5), &[10, 11, 12]).unwrap();

        let mut out = [0u64; 4];
        fx.cache.read_run(&fx.route(4), &mut out).unwrap();
        assert_eq!(out, [0, 10, 11, 12]);

        let mut too_long = [0u64; 3];
        let err = fx.cache.read_run(&fx.route(6), &mut too_long).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("crosses the end of page 1"));
        assert!(fx.cache.write_run(&fx.route(4), &[0u64; 5]).is_err());
    }

    #[test]
    fn test_prefetch_makes_resident() {
        let fx = fixture(HostDevice::new("d"), 4, 2, 2);
        fx.cache.prefetch(&fx.route(4)).unwrap();
        assert!(fx.cache.is_resident(PageId(2)));
        assert!(!fx.cache.is_dirty(PageId(2)));
    }

    #[test]
    fn test_concurrent_misses_on_same_page_fetch_once() {
        let fx = fixture(HostDevice::new("d"), 4, 8, 2);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for index in 0..8 {
                        fx.cache.read(&fx.route(index)).unwrap();
                    }
                });
            }
        });
        assert_eq!(fx.device.transfer_stats().copy_out_calls, 1);
        assert_eq!(fx.cache.stats().cache.misses, 1);
        assert_eq!(fx.cache.stats().cache.fetches, 1);
    }
}
