//! Shard router: logical index → (device, channel, page, offset).
//!
//! Pages are interleaved round-robin over the flattened channel table
//! (all channels of device 0, then device 1, ...). A device therefore
//! receives a share of pages proportional to its channel count, and
//! uniformly random indices spread evenly over every channel.
//!
//! ```text
//!   page:      0    1    2    3    4    5    6 ...
//!   channel:  d0c0 d0c1 d1c0 d0c0 d0c1 d1c0 d0c0 ...   (channels = [2, 1])
//! ```
//!
//! Every channel has its own backing buffer of `slots_per_channel` page
//! slots; page `p` lands in slot `p / channels` of its channel's buffer.

use crate::config::ArrayConfig;
use crate::page::{ChannelId, DeviceId, PageId};
use crate::{Error, Result};

/// Resolved location of one element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    /// Device holding the element.
    pub device: DeviceId,
    /// Channel within the device.
    pub channel: ChannelId,
    /// Position of the channel in the flattened channel table.
    pub global_channel: usize,
    /// Page containing the element.
    pub page: PageId,
    /// Element offset inside the page.
    pub offset: usize,
    /// Page slot inside the channel's backing store.
    pub slot: u64,
}

/// Deterministic, stateless index router.
#[derive(Debug, Clone)]
pub struct ShardRouter {
    len: usize,
    page_size: usize,
    slots_per_channel: u64,
    /// `(device, channel within device)` per global channel.
    table: Vec<(DeviceId, ChannelId)>,
}

impl ShardRouter {
    /// Build the routing table for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `config` is invalid.
    pub fn new(config: &ArrayConfig) -> Result<Self> {
        config.validate()?;

        let table = config
            .channels_per_device
            .iter()
            .enumerate()
            .flat_map(|(device, &channels)| {
                (0..channels).map(move |channel| (DeviceId(device), ChannelId(channel)))
            })
            .collect();

        Ok(Self {
            len: config.len,
            page_size: config.page_size,
            slots_per_channel: config.slots_per_channel(),
            table,
        })
    }

    /// Number of addressable elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always `false`: a router covers at least one element.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Elements per page.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Total number of channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.table.len()
    }

    /// Device and local channel of a global channel index.
    #[must_use]
    pub fn channel(&self, global_channel: usize) -> Option<(DeviceId, ChannelId)> {
        self.table.get(global_channel).copied()
    }

    /// Page slots in each channel's backing store.
    #[must_use]
    pub fn slots_per_channel(&self) -> u64 {
        self.slots_per_channel
    }

    /// Resolve `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `index >= len`.
    #[inline]
    pub fn route(&self, index: usize) -> Result<Route> {
        if index >= self.len {
            return Err(Error::OutOfRange {
                index,
                len: self.len,
            });
        }

        let page = PageId::containing(index, self.page_size);
        let channels = self.table.len() as u64;
        let global_channel = (page.0 % channels) as usize;
        let (device, channel) = self.table[global_channel];

        Ok(Route {
            device,
            channel,
            global_channel,
            page,
            offset: index % self.page_size,
            slot: page.0 / channels,
        })
    }
}
