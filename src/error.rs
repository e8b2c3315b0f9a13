//! Error types shared by every layer of the allocator.

use thiserror::Error;

use crate::local_allocator::LocalAllocatorState;

/// Reasons an allocation-path operation can fail.
///
/// `OutOfAddressSpace` and `OutOfMemory` are the only conditions a caller is
/// expected to handle (usually by giving up). `OversizeRequest` never leaves
/// the [`Heap`](crate::Heap): it is how the size-class table tells the facade
/// to take the large-object path. The remaining variants are programming
/// errors; the facade turns them into debug assertions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("out of address space reserving {requested} bytes")]
    OutOfAddressSpace { requested: usize },

    #[error("out of memory committing {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("request of {size} bytes exceeds the largest size class ({max} bytes)")]
    OversizeRequest { size: usize, max: usize },

    #[error("local allocator is not active (state: {state})")]
    NotActive { state: LocalAllocatorState },

    #[error("allocator invariant violated: {0}")]
    InvariantViolation(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AllocError {
    /// True for failures caused by the operating system refusing memory, as
    /// opposed to misuse or internal corruption.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            AllocError::OutOfAddressSpace { .. } | AllocError::OutOfMemory { .. }
        )
    }
}

/// A rejected [`HeapConfig`](crate::HeapConfig).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("minimum size class must be at least 1 byte")]
    ZeroMinSize,

    #[error("maximum size ({max}) is smaller than the minimum size ({min})")]
    MaxBelowMin { min: usize, max: usize },

    #[error("steps per doubling must be a power of two, got {0}")]
    BadStepsPerDoubling(usize),

    #[error("a region must hold at least 2 objects, got {0}")]
    TooFewObjectsPerRegion(usize),

    #[error("page size {0} is not a power of two")]
    BadPageSize(usize),

    #[error("size {0} cannot be rounded to whole pages")]
    TooLarge(usize),

    #[error("unknown allocator mode {0:?}")]
    UnknownMode(String),
}
