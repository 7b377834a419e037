//! Host-memory device backend.

use super::{DeviceBuffer, DeviceMemory};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Transfer counters of a [`HostDevice`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Host → device copies.
    pub copy_in_calls: u64,
    /// Device → host copies.
    pub copy_out_calls: u64,
    /// Bytes copied host → device.
    pub bytes_copied_in: u64,
    /// Bytes copied device → host.
    pub bytes_copied_out: u64,
}

/// Device backed by host RAM.
///
/// Each buffer has its own lock, so copies into different buffers never
/// contend. The buffer table lock is only held while looking a buffer up.
#[derive(Debug)]
pub struct HostDevice {
    name: String,
    capacity: Option<usize>,
    buffers: RwLock<FxHashMap<u64, Arc<RwLock<Vec<u8>>>>>,
    next_id: AtomicU64,
    allocated: AtomicU64,
    copy_in_calls: AtomicU64,
    copy_out_calls: AtomicU64,
    bytes_copied_in: AtomicU64,
    bytes_copied_out: AtomicU64,
}

impl HostDevice {
    /// Create an unbounded host device.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: None,
            buffers: RwLock::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
            allocated: AtomicU64::new(0),
            copy_in_calls: AtomicU64::new(0),
            copy_out_calls: AtomicU64::new(0),
            bytes_copied_in: AtomicU64::new(0),
            bytes_copied_out: AtomicU64::new(0),
        }
    }

    /// Create a host device that refuses allocations beyond `capacity` bytes.
    #[must_use]
    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new(name)
        }
    }

    /// Bytes currently allocated.
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Number of buffers not yet released.
    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.buffers.read().len()
    }

    /// Transfer counters since creation or the last reset.
    #[must_use]
    pub fn transfer_stats(&self) -> TransferStats {
        TransferStats {
            copy_in_calls: self.copy_in_calls.load(Ordering::Relaxed),
            copy_out_calls: self.copy_out_calls.load(Ordering::Relaxed),
            bytes_copied_in: self.bytes_copied_in.load(Ordering::Relaxed),
            bytes_copied_out: self.bytes_copied_out.load(Ordering::Relaxed),
        }
    }

    /// Reset transfer counters.
    pub fn reset_transfer_stats(&self) {
        self.copy_in_calls.store(0, Ordering::Relaxed);
        self.copy_out_calls.store(0, Ordering::Relaxed);
        self.bytes_copied_in.store(0, Ordering::Relaxed);
        self.bytes_copied_out.store(0, Ordering::Relaxed);
    }

    fn lookup(&self, buffer: &DeviceBuffer) -> Result<Arc<RwLock<Vec<u8>>>, String> {
        self.buffers
            .read()
            .get(&buffer.id())
            .cloned()
            .ok_or_else(|| format!("{}: unknown buffer {}", self.name, buffer.id()))
    }

    fn check_range(&self, len: usize, offset: usize, size: usize) -> Result<(), String> {
        match offset.checked_add(size) {
            Some(end) if end <= len => Ok(()),
            _ => Err(format!(
                "{}: range {offset}+{size} exceeds buffer of {len} bytes",
                self.name
            )),
        }
    }
}

impl DeviceMemory for HostDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn allocate(&self, bytes: usize) -> Result<DeviceBuffer, String> {
        let requested = bytes as u64;
        if let Some(capacity) = self.capacity {
            let reserved = self
                .allocated
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                    used.checked_add(requested).filter(|total| *total <= capacity as u64)
                });
            if reserved.is_err() {
                return Err(format!(
                    "{}: {bytes} bytes requested, {} of {capacity} in use",
                    self.name,
                    self.allocated_bytes()
                ));
            }
        } else {
            self.allocated.fetch_add(requested, Ordering::AcqRel);
        }

        let mut memory = Vec::new();
        if let Err(e) = memory.try_reserve_exact(bytes) {
            self.allocated.fetch_sub(requested, Ordering::AcqRel);
            return Err(format!("{}: cannot allocate {bytes} bytes: {e}", self.name));
        }
        memory.resize(bytes, 0u8);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.buffers.write().insert(id, Arc::new(RwLock::new(memory)));
        Ok(DeviceBuffer::new(id, bytes))
    }

    fn copy_in(&self, buffer: &DeviceBuffer, offset: usize, src: &[u8]) -> Result<(), String> {
        let memory = self.lookup(buffer)?;
        let mut memory = memory.write();
        self.check_range(memory.len(), offset, src.len())?;
        memory[offset..offset + src.len()].copy_from_slice(src);

        self.copy_in_calls.fetch_add(1, Ordering::Relaxed);
        self.bytes_copied_in.fetch_add(src.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn copy_out(&self, buffer: &DeviceBuffer, offset: usize, dst: &mut [u8]) -> Result<(), String> {
        let memory = self.lookup(buffer)?;
        let memory = memory.read();
        self.check_range(memory.len(), offset, dst.len())?;
        dst.copy_from_slice(&memory[offset..offset + dst.len()]);

        self.copy_out_calls.fetch_add(1, Ordering::Relaxed);
        self.bytes_copied_out.fetch_add(dst.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn release(&self, buffer: DeviceBuffer) -> Result<(), String> {
        let removed = self.buffers.write().remove(&buffer.id());
        match removed {
            Some(memory) => {
                let bytes = memory.read().len() as u64;
                self.allocated.fetch_sub(bytes, Ordering::AcqRel);
                Ok(())
            }
            None => Err(format!(
                "{}: release of unknown buffer {}",
                self.name,
                buffer.id()
            )),
        }
    }
}
