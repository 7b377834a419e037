//! Page and identifier types.
//!
//! A page is a fixed-size run of `page_size` elements and the unit of both
//! transfer and eviction. Pages move between host and device as raw bytes.

use bytemuck::Pod;
use std::fmt;

/// Element types storable in a virtual array.
///
/// Elements are copied to and from device memory as plain bytes, so they must
/// be plain-old-data.
pub trait Element: Pod + Send + Sync {}

impl<T: Pod + Send + Sync> Element for T {}

/// Index of a device in the device list passed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device {}", self.0)
    }
}

/// Index of a transfer channel within its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub usize);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel {}", self.0)
    }
}

/// Page-aligned window of the logical index range: `index / page_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u64);

impl PageId {
    /// Page containing `index`.
    #[inline]
    #[must_use]
    pub const fn containing(index: usize, page_size: usize) -> Self {
        Self((index / page_size) as u64)
    }

    /// First logical index covered by this page.
    #[inline]
    #[must_use]
    pub const fn first_index(self, page_size: usize) -> usize {
        self.0 as usize * page_size
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page {}", self.0)
    }
}

/// A resident page owned by one channel cache.
#[derive(Debug, Clone)]
pub struct Page<T> {
    id: PageId,
    slot: u64,
    data: Box<[T]>,
    dirty: bool,
}

impl<T: Element> Page<T> {
    /// Create a zero-filled clean page.
    #[must_use]
    pub fn zeroed(id: PageId, slot: u64, page_size: usize) -> Self {
        Self {
            id,
            slot,
            data: vec![T::zeroed(); page_size].into_boxed_slice(),
            dirty: false,
        }
    }

    /// Page identifier.
    #[inline]
    #[must_use]
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Slot of this page inside its channel's backing buffer.
    #[inline]
    #[must_use]
    pub fn slot(&self) -> u64 {
        self.slot
    }

    /// Whether the page holds writes not yet persisted to the device.
    #[inline]
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Element at `offset`.
    #[inline]
    #[must_use]
    pub fn get(&self, offset: usize) -> T {
        self.data[offset]
    }

    /// Overwrite the element at `offset` and mark the page dirty.
    #[inline]
    pub fn set(&mut self, offset: usize, value: T) {
        self.data[offset] = value;
        self.dirty = true;
    }

    /// Copy elements starting at `offset` into `out`.
    pub fn read_run(&self, offset: usize, out: &mut [T]) {
        out.copy_from_slice(&self.data[offset..offset + out.len()]);
    }

    /// Copy `values` into the page starting at `offset` and mark it dirty.
    pub fn write_run(&mut self, offset: usize, values: &[T]) {
        self.data[offset..offset + values.len()].copy_from_slice(values);
        self.dirty = true;
    }

    /// Page contents as bytes, for write-back.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data[..])
    }

    /// Page contents as mutable bytes, for fetch.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.data[..])
    }

    /// Record that the page content now matches the device.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Reuse this page's allocation for another page. Contents are stale
    /// until the caller overwrites them with a fetch.
    pub fn reassign(&mut self, id: PageId, slot: u64) {
        self.id = id;
        self.slot = slot;
        self.dirty = false;
    }
}
