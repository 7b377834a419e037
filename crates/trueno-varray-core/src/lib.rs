//! Device-backed virtual arrays.
//!
//! A [`VirtualArray`] exposes `len` elements whose canonical storage lives in
//! the memory of one or more compute devices. Each device is fronted by
//! several independent transfer channels, and each channel by a small
//! write-back LRU cache of fixed-size pages. Random access to a data set far
//! larger than the caches costs one page transfer per miss (plus one
//! write-back if the evicted page was dirty) and nothing per hit.
//!
//! ```text
//!   get(i) / set(i, v)
//!          │
//!          ▼
//!   ShardRouter ── page = i / page_size, channel = page % channels
//!          │
//!          ▼
//!   ChannelCache[d, c] ── hit: serve in place
//!          │ miss: evict LRU (write back if dirty), fetch page
//!          ▼
//!   BackingStore[d] ── DeviceMemory::copy_in / copy_out
//! ```
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use trueno_varray_core::{ArrayConfig, DeviceMemory, HostDevice, VirtualArray};
//!
//! let devices: Vec<Arc<dyn DeviceMemory>> = vec![Arc::new(HostDevice::new("gpu0"))];
//! let config = ArrayConfig::new(1_000, vec![4]).with_pages_per_channel(10);
//!
//! let array = VirtualArray::<f32>::new(config, devices).unwrap();
//! array.par_init(|i| i as f32 * 0.5).unwrap();
//! assert_eq!(array.get(999).unwrap(), 499.5);
//! ```

#![deny(missing_docs)]
#![deny(clippy::panic)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]

mod array;
pub mod cache;
pub mod config;
pub mod device;
mod error;
mod page;
pub mod router;
pub mod stats;

pub use array::VirtualArray;
pub use cache::ChannelCache;
pub use config::ArrayConfig;
pub use device::{BackingStore, DeviceBuffer, DeviceMemory, HostDevice, TransferStats};
pub use error::{Error, Result};
pub use page::{ChannelId, DeviceId, Element, Page, PageId};
pub use router::{Route, ShardRouter};
pub use stats::{CacheStats, ChannelStats};
