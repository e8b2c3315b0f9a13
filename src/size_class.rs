//! Size classes: the mapping from a requested byte count to the bucket that
//! serves it.
//!
//! Classes start at the configured minimum and grow linearly by one granule
//! (16 bytes) until the linear step would exceed `1 / steps_per_doubling` of
//! the current size; from then on each power-of-two band is cut into
//! `steps_per_doubling` equal steps. With the default 8 steps this bounds the
//! wasted tail of any object to 1/8 of the request (or less than one granule
//! for tiny requests).

use static_assertions::const_assert;

use crate::error::{AllocError, ConfigError};

/// Every object is aligned to, and sized in multiples of, this many bytes.
pub const MIN_ALIGN: usize = 16;
const_assert!(MIN_ALIGN.is_power_of_two());

/// Round value up to the nearest multiple of increment, or `None` if that
/// does not fit in a `usize`.
pub(crate) fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    ((value - 1) / increment)
        .checked_add(1)?
        .checked_mul(increment)
}

// Largest power of two <= value. value must be non-zero.
fn prev_power_of_two(value: usize) -> usize {
    1 << (usize::BITS - 1 - value.leading_zeros())
}

/// Parameters of the size-class table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeClassConfig {
    /// Smallest object size handed out. Rounded up to [`MIN_ALIGN`].
    pub min_size: usize,
    /// Largest size served by a size class; anything above goes to the
    /// large-object path.
    pub max_size: usize,
    /// Number of classes per power-of-two band once the spacing is
    /// geometric. Must be a power of two.
    pub steps_per_doubling: usize,
    /// How many objects a freshly reserved region should hold at least.
    pub objects_per_region: usize,
}

impl Default for SizeClassConfig {
    fn default() -> Self {
        SizeClassConfig {
            min_size: 16,
            max_size: 32 * 1024,
            steps_per_doubling: 8,
            objects_per_region: 64,
        }
    }
}

impl SizeClassConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_size == 0 {
            return Err(ConfigError::ZeroMinSize);
        }
        if self.max_size < self.min_size {
            return Err(ConfigError::MaxBelowMin {
                min: self.min_size,
                max: self.max_size,
            });
        }
        if !self.steps_per_doubling.is_power_of_two() {
            return Err(ConfigError::BadStepsPerDoubling(self.steps_per_doubling));
        }
        if self.objects_per_region < 2 {
            return Err(ConfigError::TooFewObjectsPerRegion(
                self.objects_per_region,
            ));
        }
        Ok(())
    }
}

/// An immutable size class descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SizeClass {
    index: usize,
    object_size: usize,
    page_multiple: usize,
}

impl SizeClass {
    /// Position of this class in its table.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Bytes handed out for every request mapped to this class.
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Pages per region reserved for this class.
    pub fn page_multiple(&self) -> usize {
        self.page_multiple
    }
}

/// The static table of size classes, built once from a [`SizeClassConfig`].
#[derive(Debug, Clone)]
pub struct SizeClassTable {
    classes: Vec<SizeClass>,
    steps_per_doubling: usize,
    page_size: usize,
}

impl SizeClassTable {
    pub fn new(config: &SizeClassConfig, page_size: usize) -> Result<Self, ConfigError> {
        config.validate()?;
        if !page_size.is_power_of_two() {
            return Err(ConfigError::BadPageSize(page_size));
        }

        let max_size =
            round_up(config.max_size, MIN_ALIGN).ok_or(ConfigError::TooLarge(config.max_size))?;
        let mut sizes = Vec::new();
        let mut size =
            round_up(config.min_size, MIN_ALIGN).ok_or(ConfigError::TooLarge(config.min_size))?;
        loop {
            sizes.push(size);
            if size >= max_size {
                break;
            }
            let step = (prev_power_of_two(size) / config.steps_per_doubling).max(MIN_ALIGN);
            size = size.saturating_add(step).min(max_size);
        }

        let classes = sizes
            .into_iter()
            .enumerate()
            .map(|(index, object_size)| {
                let region_len = object_size
                    .checked_mul(config.objects_per_region)
                    .and_then(|wanted| round_up(wanted, page_size))
                    .ok_or(ConfigError::TooLarge(object_size))?;
                Ok(SizeClass {
                    index,
                    object_size,
                    page_multiple: (region_len / page_size).max(1),
                })
            })
            .collect::<Result<_, ConfigError>>()?;

        Ok(SizeClassTable {
            classes,
            steps_per_doubling: config.steps_per_doubling,
            page_size,
        })
    }

    /// The class serving `size` bytes: the smallest class whose object size
    /// is at least `size`. A request of 0 bytes is served like a request of
    /// 1 byte.
    pub fn class_for(&self, size: usize) -> Result<SizeClass, AllocError> {
        let max = self.max_allocatable();
        if size > max {
            return Err(AllocError::OversizeRequest { size, max });
        }
        let index = self
            .classes
            .partition_point(|class| class.object_size < size.max(1));
        Ok(self.classes[index])
    }

    pub fn get(&self, index: usize) -> Option<SizeClass> {
        self.classes.get(index).copied()
    }

    /// Largest request served by a size class.
    pub fn max_allocatable(&self) -> usize {
        self.classes.last().map(|c| c.object_size).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SizeClass> {
        self.classes.iter()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn steps_per_doubling(&self) -> usize {
        self.steps_per_doubling
    }

    /// Length in bytes of one region of `class`.
    pub fn region_len(&self, class: SizeClass) -> usize {
        class.page_multiple * self.page_size
    }
}
