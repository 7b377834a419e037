//! Device-backed virtual array.

use crate::cache::ChannelCache;
use crate::config::ArrayConfig;
use crate::device::{BackingStore, DeviceMemory};
use crate::page::Element;
use crate::router::{Route, ShardRouter};
use crate::stats::{CacheStats, ChannelStats};
use crate::{Error, Result};
use rayon::prelude::*;
use std::fmt;
use std::sync::Arc;

/// Array of `len` elements stored on one or more devices and accessed
/// through per-channel LRU page caches.
///
/// `get` and `set` take `&self`; share the array across threads with a
/// reference or an `Arc`. Accesses routed to different channels run in
/// parallel, accesses to the same channel are serialized.
///
/// Dropping the array flushes every dirty page before device buffers are
/// released. Use [`VirtualArray::close`] to observe flush failures.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use trueno_varray_core::{ArrayConfig, DeviceMemory, HostDevice, VirtualArray};
///
/// let devices: Vec<Arc<dyn DeviceMemory>> = vec![
///     Arc::new(HostDevice::new("gpu0")),
///     Arc::new(HostDevice::new("gpu1")),
/// ];
/// let config = ArrayConfig::new(10_000, vec![4, 4])
///     .with_page_size(16)
///     .with_pages_per_channel(8);
///
/// let array = VirtualArray::<u64>::new(config, devices).unwrap();
/// array.set(1234, 42).unwrap();
/// assert_eq!(array.get(1234).unwrap(), 42);
/// array.close().unwrap();
/// ```
pub struct VirtualArray<T: Element> {
    config: ArrayConfig,
    router: ShardRouter,
    /// Indexed by global channel.
    channels: Vec<ChannelCache<T>>,
    closed: bool,
}

impl<T: Element> VirtualArray<T> {
    /// Allocate backing storage on `devices` and build the channel caches.
    ///
    /// `devices[i]` receives `config.channels_per_device[i]` channels.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for invalid parameters or a device
    /// count that does not match the configuration, and
    /// [`Error::AllocationFailure`] if a device cannot hold its share.
    pub fn new(config: ArrayConfig, devices: Vec<Arc<dyn DeviceMemory>>) -> Result<Self> {
        config.validate()?;
        if devices.len() != config.device_count() {
            return Err(Error::Configuration(format!(
                "{} devices supplied, channels configured for {}",
                devices.len(),
                config.device_count()
            )));
        }

        let router = ShardRouter::new(&config)?;
        let page_bytes = config
            .page_size
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| Error::Configuration("page size in bytes overflows".to_string()))?;

        // One buffer per channel: channels of a device never share storage.
        let channels = (0..router.channel_count())
            .filter_map(|global| router.channel(global))
            .map(|(device, channel)| {
                let store = BackingStore::allocate(
                    device,
                    channel,
                    Arc::clone(&devices[device.0]),
                    router.slots_per_channel(),
                    page_bytes,
                )?;
                ChannelCache::new(
                    device,
                    channel,
                    config.page_size,
                    config.pages_per_channel,
                    Arc::new(store),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            len = config.len,
            page_size = config.page_size,
            pages_per_channel = config.pages_per_channel,
            devices = config.device_count(),
            channels = channels.len(),
            element_bytes = std::mem::size_of::<T>(),
            cache_elements = config.cache_elements(),
            "Created virtual array"
        );

        Ok(Self {
            config,
            router,
            channels,
            closed: false,
        })
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.config.len
    }

    /// Always `false`: construction rejects empty arrays.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.config.len == 0
    }

    /// Construction parameters.
    #[must_use]
    pub fn config(&self) -> &ArrayConfig {
        &self.config
    }

    /// Resolve where `index` lives.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `index >= len`.
    pub fn route(&self, index: usize) -> Result<Route> {
        self.router.route(index)
    }

    /// Copy of the element at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `index >= len` and
    /// [`Error::TransferFailure`] if a required transfer fails.
    pub fn get(&self, index: usize) -> Result<T> {
        let route = self.router.route(index)?;
        self.channels[route.global_channel].read(&route)
    }

    /// Store `value` at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `index >= len` and
    /// [`Error::TransferFailure`] if a required transfer fails.
    pub fn set(&self, index: usize, value: T) -> Result<()> {
        let route = self.router.route(index)?;
        self.channels[route.global_channel].write(&route, value)
    }

    /// Read `out.len()` elements starting at `start`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if the range exceeds `len`; nothing is
    /// read in that case.
    pub fn get_range(&self, start: usize, out: &mut [T]) -> Result<()> {
        self.check_range(start, out.len())?;
        let mut done = 0;
        while done < out.len() {
            let route = self.router.route(start + done)?;
            let run = (self.config.page_size - route.offset).min(out.len() - done);
            self.channels[route.global_channel].read_run(&route, &mut out[done..done + run])?;
            done += run;
        }
        Ok(())
    }

    /// Write `values` starting at `start`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if the range exceeds `len`; nothing is
    /// written in that case.
    pub fn set_range(&self, start: usize, values: &[T]) -> Result<()> {
        self.check_range(start, values.len())?;
        let mut done = 0;
        while done < values.len() {
            let route = self.router.route(start + done)?;
            let run = (self.config.page_size - route.offset).min(values.len() - done);
            self.channels[route.global_channel].write_run(&route, &values[done..done + run])?;
            done += run;
        }
        Ok(())
    }

    /// Make the page holding `index` resident.
    ///
    /// # Errors
    ///
    /// Same as [`VirtualArray::get`].
    pub fn prefetch(&self, index: usize) -> Result<()> {
        let route = self.router.route(index)?;
        self.channels[route.global_channel].prefetch(&route)
    }

    /// Set every element to `init(index)`, in parallel on the rayon pool.
    ///
    /// # Errors
    ///
    /// Returns the first transfer failure encountered.
    pub fn par_init<F>(&self, init: F) -> Result<()>
    where
        F: Fn(usize) -> T + Sync + Send,
    {
        let page_size = self.config.page_size;
        let pages = usize::try_from(self.config.page_count())
            .map_err(|_| Error::Configuration("page count exceeds usize".to_string()))?;

        (0..pages).into_par_iter().try_for_each(|page| {
            let start = page * page_size;
            let end = (start + page_size).min(self.config.len);
            let values: Vec<T> = (start..end).map(&init).collect();
            self.set_range(start, &values)
        })
    }

    /// Write back every dirty page on every channel.
    ///
    /// All channels are attempted even if some fail.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FlushFailed`] listing each failed channel's error.
    pub fn flush(&self) -> Result<()> {
        let mut failures = Vec::new();
        let mut written = 0;
        for cache in &self.channels {
            match cache.flush() {
                Ok(pages) => written += pages,
                Err(e) => {
                    tracing::error!(
                        device = %cache.device(),
                        channel = %cache.channel(),
                        error = %e,
                        "Channel flush failed"
                    );
                    failures.push(e);
                }
            }
        }

        tracing::debug!(pages = written, failed = failures.len(), "Flushed virtual array");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::FlushFailed {
                failures,
                total: self.channels.len(),
            })
        }
    }

    /// Flush and release device storage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FlushFailed`] if any dirty page could not be written
    /// back. Storage is released regardless.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        let result = self.flush();
        tracing::info!(len = self.config.len, ok = result.is_ok(), "Closed virtual array");
        result
    }

    /// Pages resident across all channels.
    #[must_use]
    pub fn resident_pages(&self) -> usize {
        self.channels.iter().map(ChannelCache::resident_pages).sum()
    }

    /// Aggregate statistics of all channels.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let mut total = CacheStats::default();
        for cache in &self.channels {
            total += cache.stats().cache;
        }
        total
    }

    /// Per-channel statistics, in global channel order.
    #[must_use]
    pub fn channel_stats(&self) -> Vec<ChannelStats> {
        self.channels.iter().map(ChannelCache::stats).collect()
    }

    /// Reset activity counters of every channel.
    pub fn reset_stats(&self) {
        for cache in &self.channels {
            cache.reset_stats();
        }
    }

    fn check_range(&self, start: usize, count: usize) -> Result<()> {
        match start.checked_add(count) {
            Some(end) if end <= self.config.len => Ok(()),
            _ => Err(Error::OutOfRange {
                index: start.max(self.config.len),
                len: self.config.len,
            }),
        }
    }
}

impl<T: Element> Drop for VirtualArray<T> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.flush() {
            tracing::error!(error = %e, "Final flush failed, unwritten data lost");
        }
    }
}

impl<T: Element> fmt::Debug for VirtualArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualArray")
            .field("config", &self.config)
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}
