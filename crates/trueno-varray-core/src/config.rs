//! Virtual array configuration.
//!
//! Parameters are fixed at construction. A configuration can be built in code
//! or loaded from TOML:
//!
//! ```toml
//! len = 2_880_000
//! page_size = 1
//! pages_per_channel = 50
//! channels_per_device = [12, 12, 12, 12]
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default page size in elements.
pub const DEFAULT_PAGE_SIZE: usize = 1;

/// Default number of resident pages per channel cache.
pub const DEFAULT_PAGES_PER_CHANNEL: usize = 50;

/// Construction parameters of a virtual array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayConfig {
    /// Number of addressable elements.
    pub len: usize,

    /// Elements per page (unit of transfer and eviction).
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Capacity of each channel cache, in pages.
    #[serde(default = "default_pages_per_channel")]
    pub pages_per_channel: usize,

    /// Number of transfer channels for each device, in device order.
    pub channels_per_device: Vec<usize>,
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_pages_per_channel() -> usize {
    DEFAULT_PAGES_PER_CHANNEL
}

impl ArrayConfig {
    /// Configuration for `len` elements spread over devices with the given
    /// channel counts, using default page size and cache capacity.
    #[must_use]
    pub fn new(len: usize, channels_per_device: Vec<usize>) -> Self {
        Self {
            len,
            page_size: DEFAULT_PAGE_SIZE,
            pages_per_channel: DEFAULT_PAGES_PER_CHANNEL,
            channels_per_device,
        }
    }

    /// Set the page size in elements.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the number of resident pages per channel.
    #[must_use]
    pub fn with_pages_per_channel(mut self, pages: usize) -> Self {
        self.pages_per_channel = pages;
        self
    }

    /// Parse a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the text is not a valid configuration.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::Configuration(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IoError`] if the file cannot be read and
    /// [`Error::Configuration`] if its content is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::IoError(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Check that every parameter is positive and storage sizing cannot overflow.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] describing the first invalid parameter.
    pub fn validate(&self) -> Result<()> {
        if self.len == 0 {
            return Err(Error::Configuration("len must be positive".to_string()));
        }
        if self.page_size == 0 {
            return Err(Error::Configuration("page_size must be positive".to_string()));
        }
        if self.pages_per_channel == 0 {
            return Err(Error::Configuration("pages_per_channel must be positive".to_string()));
        }
        if self.channels_per_device.is_empty() {
            return Err(Error::Configuration("at least one device is required".to_string()));
        }
        if let Some(device) = self.channels_per_device.iter().position(|&c| c == 0) {
            return Err(Error::Configuration(format!("device {device} has no channels")));
        }
        self.channels_per_device
            .iter()
            .try_fold(0usize, |acc, &c| acc.checked_add(c))
            .ok_or_else(|| Error::Configuration("channel count overflows".to_string()))?;
        self.padded_len()
            .ok_or_else(|| Error::Configuration("len overflows when padded to pages".to_string()))?;
        Ok(())
    }

    /// Number of devices.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.channels_per_device.len()
    }

    /// Total number of channels across all devices.
    #[must_use]
    pub fn total_channels(&self) -> usize {
        self.channels_per_device.iter().sum()
    }

    /// Number of pages covering `len` elements; the last page may be partial.
    #[must_use]
    pub fn page_count(&self) -> u64 {
        self.len.div_ceil(self.page_size) as u64
    }

    /// Page slots in each channel's backing store.
    #[must_use]
    pub fn slots_per_channel(&self) -> u64 {
        self.page_count().div_ceil(self.total_channels() as u64)
    }

    /// Elements that fit in all channel caches at once.
    #[must_use]
    pub fn cache_elements(&self) -> usize {
        self.total_channels()
            .saturating_mul(self.pages_per_channel)
            .saturating_mul(self.page_size)
    }

    /// `len` rounded up to a whole number of pages.
    fn padded_len(&self) -> Option<usize> {
        self.len
            .div_ceil(self.page_size)
            .checked_mul(self.page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ArrayConfig::new(1000, vec![2, 2]);
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.pages_per_channel, DEFAULT_PAGES_PER_CHANNEL);
        assert_eq!(config.device_count(), 2);
        assert_eq!(config.total_channels(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_derived_sizes() {
        let config = ArrayConfig::new(10, vec![2, 1])
            .with_page_size(4)
            .with_pages_per_channel(2);
        assert_eq!(config.page_count(), 3);
        assert_eq!(config.slots_per_channel(), 1);
        assert_eq!(config.cache_elements(), 3 * 2 * 4);
    }

    #[test]
    fn test_config_benchmark_shape() {
        let config = ArrayConfig::new(28_800, vec![12, 12, 12, 12]);
        assert_eq!(config.total_channels(), 48);
        assert_eq!(config.cache_elements(), 2400);
        assert_eq!(config.slots_per_channel(), 600);
    }

    #[test]
    fn test_config_rejects_zero_len() {
        let err = ArrayConfig::new(0, vec![1]).validate().unwrap_err();
        assert!(err.to_string().contains("len must be positive"));
    }

    #[test]
    fn test_config_rejects_zero_page_size() {
        let err = ArrayConfig::new(10, vec![1])
            .with_page_size(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("page_size"));
    }

    #[test]
    fn test_config_rejects_zero_pages_per_channel() {
        let err = ArrayConfig::new(10, vec![1])
            .with_pages_per_channel(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("pages_per_channel"));
    }

    #[test]
    fn test_config_rejects_no_devices() {
        let err = ArrayConfig::new(10, vec![]).validate().unwrap_err();
        assert!(err.to_string().contains("at least one device"));
    }

    #[test]
    fn test_config_rejects_channelless_device() {
        let err = ArrayConfig::new(10, vec![4, 0, 4]).validate().unwrap_err();
        assert!(err.to_string().contains("device 1 has no channels"));
    }

    #[test]
    fn test_config_rejects_padding_overflow() {
        let err = ArrayConfig::new(usize::MAX, vec![1])
            .with_page_size(2)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
            len = 2880
            page_size = 4
            pages_per_channel = 8
            channels_per_device = [12, 12]
        "#;

        let config = ArrayConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.len, 2880);
        assert_eq!(config.page_size, 4);
        assert_eq!(config.pages_per_channel, 8);
        assert_eq!(config.channels_per_device, vec![12, 12]);
    }

    #[test]
    fn test_parse_config_defaults() {
        let toml = r#"
            len = 100
            channels_per_device = [1]
        "#;

        let config = ArrayConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.pages_per_channel, DEFAULT_PAGES_PER_CHANNEL);
    }

    #[test]
    fn test_parse_config_invalid() {
        assert!(ArrayConfig::from_toml_str("len = \"big\"").is_err());
        let err = ArrayConfig::from_toml_str("len = 0\nchannels_per_device = [1]").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = ArrayConfig::load("/nonexistent/trueno-varray.toml").unwrap_err();
        assert!(matches!(err, Error::IoError(_)));
    }

    #[test]
    fn test_config_serialize_roundtrip() {
        let config = ArrayConfig::new(64, vec![3]).with_page_size(8);
        let text = toml::to_string(&config).unwrap();
        assert_eq!(ArrayConfig::from_toml_str(&text).unwrap(), config);
    }
}
