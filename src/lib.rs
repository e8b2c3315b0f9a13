//! A per-thread cached, size-class segregated memory allocator core.
//!
//! Requests are rounded up to a size class. Each thread gets its own
//! [`LocalAllocator`] per class, which carves objects out of regions taken
//! from a [`MemorySource`] and keeps freed objects on a LIFO free list, so
//! the fast path never touches shared state. Frees may come from any thread;
//! the [`PageMap`] finds the owning allocator from the pointer alone.
//! Requests above the largest class get a region of their own.
//!
//! ```no_run
//! let heap = tcache_alloc::Heap::new().unwrap();
//! let ptr = heap.allocate(24).unwrap();
//! unsafe { heap.deallocate(ptr.as_ptr()) };
//! ```

mod config;
mod error;
mod free_range;
mod heap;
mod local_allocator;
mod memory;
mod page_map;
mod per_thread;
mod size_class;
#[cfg(unix)]
mod unix;

pub use config::HeapConfig;
pub use error::{AllocError, ConfigError};
pub use free_range::{
    FreeRange, FreeRangeKind, FreeRangeTracker, RegionId, Relation, Stats, Validity,
};
pub use heap::{Heap, HeapStats};
#[cfg(unix)]
pub use heap::{allocate, deallocate, global};
pub use local_allocator::{
    AllocatorMode, LocalAllocator, LocalAllocatorState, LocalStats, RegionLayout, TeardownReport,
};
pub use memory::{CommitState, MemoryRegion, MemorySource, ToyMemorySource, ToyStats};
pub use page_map::{Lookup, PageMap, PageOwner};
pub use per_thread::{CheckedTeardown, LocalAllocatorSet, PerThreadRegistry, TeardownHook};
pub use size_class::{SizeClass, SizeClassConfig, SizeClassTable, MIN_ALIGN};
#[cfg(unix)]
pub use unix::SystemMemorySource;
