//! Heap configuration.
//!
//! Everything here is read once, when a [`Heap`](crate::Heap) is built, and
//! never changes afterwards.

use std::env;

use crate::error::ConfigError;
use crate::local_allocator::AllocatorMode;
use crate::size_class::SizeClassConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    /// Shape of the size-class table.
    pub size_classes: SizeClassConfig,
    /// Mode a thread's local allocators start in.
    pub mode: AllocatorMode,
    /// Empty regions a local allocator keeps committed before it starts
    /// decommitting the ones that empty out.
    pub retained_empty_regions: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            size_classes: SizeClassConfig::default(),
            mode: AllocatorMode::Allocator,
            retained_empty_regions: 1,
        }
    }
}

impl HeapConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.size_classes.validate()
    }

    /// Load configuration from environment variables, starting from the
    /// defaults.
    ///
    /// Recognized variables:
    /// - `TCACHE_MIN_SIZE`: smallest size class, in bytes
    /// - `TCACHE_MAX_SIZE`: largest size class, in bytes
    /// - `TCACHE_STEPS_PER_DOUBLING`: classes per power of two
    /// - `TCACHE_OBJECTS_PER_REGION`: objects a region is sized for
    /// - `TCACHE_RETAINED_EMPTY_REGIONS`: empty regions kept committed
    /// - `TCACHE_MODE`: `allocator` or `view_cache`
    ///
    /// Values that do not parse are ignored with a warning. The result is
    /// not validated; [`Heap::with_config`](crate::Heap) does that.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("TCACHE_MIN_SIZE") {
            config.size_classes.min_size = val;
        }
        if let Some(val) = parse_env_usize("TCACHE_MAX_SIZE") {
            config.size_classes.max_size = val;
        }
        if let Some(val) = parse_env_usize("TCACHE_STEPS_PER_DOUBLING") {
            config.size_classes.steps_per_doubling = val;
        }
        if let Some(val) = parse_env_usize("TCACHE_OBJECTS_PER_REGION") {
            config.size_classes.objects_per_region = val;
        }
        if let Some(val) = parse_env_usize("TCACHE_RETAINED_EMPTY_REGIONS") {
            config.retained_empty_regions = val;
        }
        if let Ok(val) = env::var("TCACHE_MODE") {
            match AllocatorMode::parse(&val) {
                Ok(mode) => config.mode = mode,
                Err(err) => log::warn!("ignoring TCACHE_MODE: {}", err),
            }
        }

        config
    }
}

fn parse_env_usize(name: &str) -> Option<usize> {
    let val = env::var(name).ok()?;
    match val.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            log::warn!("ignoring {}={:?}: not an unsigned integer", name, val);
            None
        }
    }
}
