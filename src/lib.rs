//! # trueno-varray
//!
//! Fixed-length arrays whose storage lives in compute-device memory, served
//! through per-channel write-back LRU page caches.
//!
//! This is the workspace root crate that re-exports core functionality.
//! For direct usage, depend on [`trueno-varray-core`] instead.
//!
//! - [`VirtualArray`] - element-level `get`/`set` over the whole array
//! - [`ShardRouter`] - deterministic index → (device, channel, page) mapping
//! - [`ChannelCache`] - one LRU page cache per transfer channel
//! - [`DeviceMemory`] - the device memory interface; [`HostDevice`] implements it in RAM
//!
//! [`trueno-varray-core`]: trueno_varray_core

pub use trueno_varray_core::*;
