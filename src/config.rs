//! Driver configuration.
//!
//! Configuration is plain YAML. Every field has a default, so an empty
//! document is a valid configuration:
//!
//! ```yaml
//! queue_capacity: 10
//! image_search_path: [/usr/local/piop/images]
//! max_image_blocks: 512
//! verify_checksums: true
//! wire:
//!   swap_bytes: true
//!   swap_words: true
//! retries:
//!   control: { tries: 3, delay_ms: 50 }
//!   status: { tries: 3, delay_ms: 100 }
//!   ftp: { tries: 3, delay_ms: 50 }
//! download:
//!   reset_settle_ms: 2000
//!   final_settle_ms: 500
//! ```
//!
//! The `PIOP_IMAGE_PATH` environment variable adds image directories ahead
//! of the configured ones; see [`DriverConfig::apply_env`].

use serde::{Deserialize, Deserializer};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::block::WireFormat;
use crate::download::DownloadTiming;
use crate::engine::{BlockEngine, RetryPolicy};
use crate::image::{DEFAULT_MAX_BLOCKS, IMAGE_BLOCK_STRIDE, ImageSource};
use crate::{PiopError, Result};

/// Environment variable holding extra image directories.
pub const IMAGE_PATH_ENV: &str = "PIOP_IMAGE_PATH";

pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Deserialize an integer millisecond count.
pub(crate) fn millis<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Top-level driver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    pub queue_capacity: usize,
    pub image_search_path: Vec<PathBuf>,
    pub max_image_blocks: usize,
    pub verify_checksums: bool,
    pub wire: WireConfig,
    pub retries: RetryConfig,
    pub download: DownloadTiming,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            image_search_path: Vec::new(),
            max_image_blocks: DEFAULT_MAX_BLOCKS,
            verify_checksums: true,
            wire: WireConfig::default(),
            retries: RetryConfig::default(),
            download: DownloadTiming::default(),
        }
    }
}

/// Wire swap overrides; unset fields follow host endianness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WireConfig {
    pub swap_bytes: Option<bool>,
    pub swap_words: Option<bool>,
}

/// Retry policies per block operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub control: RetryPolicy,
    pub status: RetryPolicy,
    pub ftp: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            control: RetryPolicy::new(3, Duration::from_millis(50)),
            status: RetryPolicy::new(3, Duration::from_millis(100)),
            ftp: RetryPolicy::new(3, Duration::from_millis(50)),
        }
    }
}

impl DriverConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)
            .map_err(|e| PiopError::config("DriverConfig deserialization", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| PiopError::config(path.display().to_string(), e.to_string()))?;
        let config = Self::from_yaml(&yaml)?;
        debug!(path = %path.display(), "Loaded driver configuration");
        Ok(config)
    }

    /// Prepend directories from `PIOP_IMAGE_PATH`, if set.
    pub fn apply_env(&mut self) {
        if let Some(value) = std::env::var_os(IMAGE_PATH_ENV) {
            self.prepend_image_path(&value);
        }
    }

    /// Prepend directories from a platform path list (`:`-separated on Unix).
    pub fn prepend_image_path(&mut self, value: &OsStr) {
        let mut search_path: Vec<PathBuf> =
            std::env::split_paths(value).filter(|p| !p.as_os_str().is_empty()).collect();
        debug!(added = search_path.len(), "Prepending image search directories");
        search_path.append(&mut self.image_search_path);
        self.image_search_path = search_path;
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(PiopError::config("queue_capacity", "must be at least 1"));
        }
        if self.max_image_blocks == 0 {
            return Err(PiopError::config("max_image_blocks", "must be at least 1"));
        }
        if self.max_image_blocks.checked_mul(IMAGE_BLOCK_STRIDE).is_none() {
            return Err(PiopError::config(
                "max_image_blocks",
                format!("{} blocks overflows the image size", self.max_image_blocks),
            ));
        }
        Ok(())
    }

    pub fn wire_format(&self) -> WireFormat {
        let native = WireFormat::native();
        WireFormat {
            swap_bytes: self.wire.swap_bytes.unwrap_or(native.swap_bytes),
            swap_words: self.wire.swap_words.unwrap_or(native.swap_words),
        }
    }

    pub fn max_image_bytes(&self) -> usize {
        self.max_image_blocks.saturating_mul(IMAGE_BLOCK_STRIDE)
    }

    pub fn block_engine(&self) -> BlockEngine {
        BlockEngine::new(self.wire_format(), self.verify_checksums)
    }

    pub fn image_source(&self) -> ImageSource {
        ImageSource::new(self.image_search_path.clone())
    }
}
