//! Device memory abstraction.
//!
//! Device discovery and driver setup live outside this crate. The virtual
//! array consumes devices through the narrow [`DeviceMemory`] trait: allocate
//! a buffer, copy bytes in and out of it, release it. [`HostDevice`] is a
//! host-RAM implementation used by tests and as a reference backend.

mod host;

pub use host::{HostDevice, TransferStats};

use crate::page::{ChannelId, DeviceId};
use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// Opaque handle to a buffer allocated on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceBuffer {
    id: u64,
    len: usize,
}

impl DeviceBuffer {
    /// Create a buffer handle. Called by [`DeviceMemory`] implementations.
    #[must_use]
    pub const fn new(id: u64, len: usize) -> Self {
        Self { id, len }
    }

    /// Implementation-defined buffer identifier.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Buffer size in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer has zero size.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Memory pool and transfer channels of one compute device.
///
/// Every channel of a device owns a separate buffer and transfers
/// independently, so implementations must allow concurrent copies into
/// different buffers without serializing them.
pub trait DeviceMemory: Send + Sync + fmt::Debug {
    /// Human-readable device name.
    fn name(&self) -> &str;

    /// Allocate a zero-filled buffer of `bytes` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot provide the memory.
    fn allocate(&self, bytes: usize) -> std::result::Result<DeviceBuffer, String>;

    /// Copy `src` from the host into `buffer` at byte `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer did not complete.
    fn copy_in(
        &self,
        buffer: &DeviceBuffer,
        offset: usize,
        src: &[u8],
    ) -> std::result::Result<(), String>;

    /// Copy `dst.len()` bytes of `buffer` at byte `offset` to the host.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer did not complete.
    fn copy_out(
        &self,
        buffer: &DeviceBuffer,
        offset: usize,
        dst: &mut [u8],
    ) -> std::result::Result<(), String>;

    /// Release a buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is unknown to the device.
    fn release(&self, buffer: DeviceBuffer) -> std::result::Result<(), String>;
}

/// Canonical storage for every page routed to one channel.
///
/// Each channel owns one device buffer divided into page-sized slots, so a
/// transfer on one channel never waits on another channel's buffer.
#[derive(Debug)]
pub struct BackingStore {
    device_id: DeviceId,
    channel: ChannelId,
    device: Arc<dyn DeviceMemory>,
    buffer: DeviceBuffer,
    page_bytes: usize,
}

impl BackingStore {
    /// Allocate `slots` page slots of `page_bytes` bytes on `device` for
    /// `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the size overflows and
    /// [`Error::AllocationFailure`] if the device refuses the allocation.
    pub fn allocate(
        device_id: DeviceId,
        channel: ChannelId,
        device: Arc<dyn DeviceMemory>,
        slots: u64,
        page_bytes: usize,
    ) -> Result<Self> {
        let bytes = usize::try_from(slots)
            .ok()
            .and_then(|slots| slots.checked_mul(page_bytes))
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "{device_id} {channel}: {slots} slots of {page_bytes} bytes overflow"
                ))
            })?;

        let buffer = device
            .allocate(bytes)
            .map_err(|reason| Error::AllocationFailure {
                device: device_id,
                bytes,
                reason,
            })?;

        tracing::debug!(
            device = %device_id,
            channel = %channel,
            name = device.name(),
            bytes,
            slots,
            "Allocated backing store"
        );

        Ok(Self {
            device_id,
            channel,
            device,
            buffer,
            page_bytes,
        })
    }

    /// Device this store lives on.
    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Channel this store belongs to.
    #[must_use]
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Backing buffer size in bytes.
    #[must_use]
    pub fn len_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Fetch the page stored in `slot` into `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransferFailure`] if the device copy fails.
    pub fn read_page(&self, slot: u64, dst: &mut [u8]) -> Result<()> {
        let offset = self.offset_of(slot)?;
        self.device
            .copy_out(&self.buffer, offset, dst)
            .map_err(|reason| Error::transfer(self.device_id, reason))
    }

    /// Write `src` back into `slot`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransferFailure`] if the device copy fails.
    pub fn write_page(&self, slot: u64, src: &[u8]) -> Result<()> {
        let offset = self.offset_of(slot)?;
        self.device
            .copy_in(&self.buffer, offset, src)
            .map_err(|reason| Error::transfer(self.device_id, reason))
    }

    fn offset_of(&self, slot: u64) -> Result<usize> {
        usize::try_from(slot)
            .ok()
            .and_then(|slot| slot.checked_mul(self.page_bytes))
            .filter(|offset| {
                offset
                    .checked_add(self.page_bytes)
                    .is_some_and(|end| end <= self.buffer.len())
            })
            .ok_or_else(|| {
                Error::transfer(self.device_id, format!("slot {slot} outside backing buffer"))
            })
    }
}

impl Drop for BackingStore {
    fn drop(&mut self) {
        if let Err(reason) = self.device.release(self.buffer) {
            tracing::warn!(
                device = %self.device_id,
                channel = %self.channel,
                %reason,
                "Failed to release backing buffer"
            );
        }
    }
}
