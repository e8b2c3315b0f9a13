//! The heap facade: size classing, per-thread dispatch, large objects and
//! pointer-based deallocation.

use core::ptr::NonNull;
use std::sync::Arc;

use crate::config::HeapConfig;
use crate::error::{AllocError, ConfigError};
use crate::free_range::{Stats, Validity};
use crate::local_allocator::TeardownReport;
use crate::memory::MemorySource;
use crate::page_map::{Lookup, PageMap, PageOwner};
use crate::per_thread::{CheckedTeardown, PerThreadRegistry, TeardownHook};
use crate::size_class::SizeClassTable;

/// State shared by a heap and every local allocator it builds.
pub(crate) struct HeapCore {
    pub(crate) config: HeapConfig,
    pub(crate) table: SizeClassTable,
    pub(crate) source: Arc<dyn MemorySource>,
    pub(crate) page_map: Arc<PageMap>,
}

/// Usage and consistency figures for a whole heap.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Threads with a registered set of local allocators.
    pub threads: usize,
    pub committed_regions: usize,
    pub retired_regions: usize,
    pub live_objects: usize,
    pub large_objects: usize,
    pub large_bytes: usize,
    pub validity: Validity,
    pub free: Stats,
}

/// A size-class segregated heap with a cache of local allocators per thread.
///
/// A heap must outlive every pointer it hands out. Dropping it releases its
/// large objects; small-object regions go back to the source as the threads
/// that carved them exit.
pub struct Heap {
    core: Arc<HeapCore>,
    registry: Arc<PerThreadRegistry>,
}

impl Heap {
    /// A heap on the operating system's virtual memory, with the default
    /// configuration.
    #[cfg(unix)]
    pub fn new() -> Result<Self, ConfigError> {
        Self::with_config(HeapConfig::default())
    }

    #[cfg(unix)]
    pub fn with_config(config: HeapConfig) -> Result<Self, ConfigError> {
        Self::with_source(config, Arc::new(crate::unix::SystemMemorySource::new()))
    }

    pub fn with_source(config: HeapConfig, source: Arc<dyn MemorySource>) -> Result<Self, ConfigError> {
        Self::with_source_and_hook(config, source, Box::new(CheckedTeardown))
    }

    /// Like [`with_source`](Self::with_source), with `hook` told about every
    /// thread teardown instead of the leak-checking default.
    pub fn with_source_and_hook(
        config: HeapConfig,
        source: Arc<dyn MemorySource>,
        hook: Box<dyn TeardownHook>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let table = SizeClassTable::new(&config.size_classes, source.page_size())?;
        log::debug!(
            "heap with {} size classes up to {} bytes, page size {}",
            table.len(),
            table.max_allocatable(),
            table.page_size()
        );
        let core = Arc::new(HeapCore {
            config,
            table,
            source,
            page_map: Arc::new(PageMap::new()),
        });
        let registry = Arc::new(PerThreadRegistry::new(Arc::clone(&core), hook));
        Ok(Heap { core, registry })
    }

    pub fn config(&self) -> &HeapConfig {
        &self.core.config
    }

    pub fn size_classes(&self) -> &SizeClassTable {
        &self.core.table
    }

    pub fn source(&self) -> &Arc<dyn MemorySource> {
        &self.core.source
    }

    pub fn registry(&self) -> &Arc<PerThreadRegistry> {
        &self.registry
    }

    /// Allocate at least `size` bytes, aligned to
    /// [`MIN_ALIGN`](crate::MIN_ALIGN). A request of 0 bytes gets the
    /// smallest class.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let class = match self.core.table.class_for(size) {
            Ok(class) => class,
            Err(AllocError::OversizeRequest { .. }) => return self.allocate_large(size),
            Err(err) => return Err(err),
        };

        let set = self.registry.for_current_thread();
        let allocator = set.allocator(class);
        if allocator.state().is_stopped() {
            allocator.prepare(self.core.config.mode);
            allocator.resume()?;
        }

        match allocator.allocate() {
            Err(err) if !err.is_exhaustion() => {
                log::error!("allocation of {} bytes failed: {}", size, err);
                debug_assert!(false, "allocation of {} bytes failed: {}", size, err);
                Err(err)
            }
            result => result,
        }
    }

    fn allocate_large(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let source = &self.core.source;
        let mut region = source.reserve(size)?;
        if let Err(err) = source.commit(&mut region) {
            source.release(region);
            return Err(err);
        }
        let base = region.base();
        let (addr, length) = (region.addr(), region.len());
        self.core
            .page_map
            .insert(addr, length, PageOwner::Large { region });
        log::debug!("large object of {} bytes at {:#x}", length, addr);
        Ok(base)
    }

    /// Free a pointer returned by [`allocate`](Self::allocate). Null is
    /// ignored, as is (after a debug assertion) anything this heap did not
    /// hand out.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of this heap, and must not be
    /// used afterwards.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        if let Err(err) = self.try_deallocate(ptr as usize) {
            log::error!("invalid deallocation of {:p}: {}", ptr, err);
            debug_assert!(false, "invalid deallocation of {:p}: {}", ptr, err);
        }
    }

    fn try_deallocate(&self, addr: usize) -> Result<(), AllocError> {
        match self.core.page_map.lookup(addr) {
            Some(Lookup::Small { allocator, region }) => allocator.deallocate(addr, region),
            Some(Lookup::Large { base, .. }) => match self.core.page_map.remove(base) {
                Some(PageOwner::Large { region }) => {
                    log::debug!("releasing large object at {:#x}", base);
                    self.core.source.release(region);
                    Ok(())
                }
                _ => Err(AllocError::InvariantViolation("double free")),
            },
            Some(Lookup::LargeInterior) => Err(AllocError::InvariantViolation(
                "pointer into the middle of a large object",
            )),
            None => Err(AllocError::InvariantViolation(
                "pointer was not allocated by this heap",
            )),
        }
    }

    /// Bytes usable at `ptr`: the object size of its class, or the length of
    /// its large region. `None` if this heap does not know `ptr`.
    pub fn usable_size(&self, ptr: *const u8) -> Option<usize> {
        match self.core.page_map.lookup(ptr as usize)? {
            Lookup::Small { allocator, .. } => Some(allocator.class().object_size()),
            Lookup::Large { length, .. } => Some(length),
            Lookup::LargeInterior => None,
        }
    }

    /// Park the local allocators of every thread.
    pub fn stop_all(&self) {
        self.registry.stop_all()
    }

    pub fn resume_all(&self) -> Result<(), AllocError> {
        self.registry.resume_all()
    }

    /// Give back the calling thread's local allocators now, rather than
    /// when the thread exits.
    pub fn teardown_current_thread(&self) -> Option<TeardownReport> {
        self.registry.teardown_current_thread()
    }

    pub fn stats(&self) -> HeapStats {
        let (large_objects, large_bytes) = self.core.page_map.large_objects();
        let mut stats = HeapStats {
            threads: self.registry.threads(),
            large_objects,
            large_bytes,
            ..HeapStats::default()
        };
        for set in self.registry.sets() {
            for allocator in set.iter() {
                let local = allocator.stats();
                stats.committed_regions += local.committed_regions;
                stats.retired_regions += local.retired_regions;
                stats.live_objects += local.live_objects;
                stats.validity.merge(&local.validity);
                stats.free.merge(&local.free);
            }
        }
        stats
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let large = self.core.page_map.drain_large();
        if !large.is_empty() {
            log::warn!("heap dropped with {} large objects still allocated", large.len());
        }
        for region in large {
            self.core.source.release(region);
        }
    }
}

#[cfg(unix)]
static GLOBAL: spin::Once<Heap> = spin::Once::new();

/// The process-wide heap, built on first use from
/// [`HeapConfig::from_env`].
#[cfg(unix)]
pub fn global() -> Result<&'static Heap, ConfigError> {
    GLOBAL.try_call_once(|| Heap::with_config(HeapConfig::from_env()))
}

/// Allocate from the process-wide heap.
#[cfg(unix)]
pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
    global()?.allocate(size)
}

/// Free a pointer from [`allocate`].
///
/// # Safety
///
/// `ptr` must be null or a live allocation of the process-wide heap.
#[cfg(unix)]
pub unsafe fn deallocate(ptr: *mut u8) {
    if let Ok(heap) = global() {
        heap.deallocate(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::memory::ToyMemorySource;
    use test_log::test;

    fn toy_heap() -> (Arc<ToyMemorySource>, Heap) {
        let source = Arc::new(ToyMemorySource::default());
        let heap = Heap::with_source(HeapConfig::default(), source.clone()).unwrap();
        (source, heap)
    }

    #[test]
    fn test_lifo_reuse() {
        let (_, heap) = toy_heap();
        let a = heap.allocate(16).unwrap();
        let b = heap.allocate(16).unwrap();
        assert_ne!(a, b);
        assert_eq!(heap.usable_size(a.as_ptr()), Some(16));
        assert_eq!(heap.usable_size(b.as_ptr()), Some(16));

        unsafe { heap.deallocate(a.as_ptr()) };
        let c = heap.allocate(16).unwrap();
        assert_eq!(c, a);

        unsafe {
            heap.deallocate(b.as_ptr());
            heap.deallocate(c.as_ptr());
        }
        assert!(heap.teardown_current_thread().unwrap().is_clean());
    }

    #[test]
    fn test_zero_and_null() {
        let (_, heap) = toy_heap();
        let p = heap.allocate(0).unwrap();
        assert_eq!(p.as_ptr() as usize % crate::MIN_ALIGN, 0);
        assert_eq!(heap.usable_size(p.as_ptr()), Some(16));
        unsafe {
            p.as_ptr().write_bytes(0xAB, 16);
            heap.deallocate(p.as_ptr());
            heap.deallocate(core::ptr::null_mut());
        }
        assert_eq!(heap.stats().live_objects, 0);
        heap.teardown_current_thread();
    }

    #[test]
    fn test_large_objects() {
        let (source, heap) = toy_heap();
        let max = heap.size_classes().max_allocatable();
        let p = heap.allocate(max + 1).unwrap();
        assert_eq!(heap.usable_size(p.as_ptr()), crate::size_class::round_up(max + 1, 4096));
        assert_eq!(heap.usable_size(unsafe { p.as_ptr().add(8) }), None);
        let stats = heap.stats();
        assert_eq!(stats.large_objects, 1);
        assert_eq!(stats.threads, 0);

        unsafe { p.as_ptr().add(max).write(7) };
        unsafe { heap.deallocate(p.as_ptr()) };
        assert_eq!(source.stats().live_regions, 0);
        assert_eq!(heap.stats().large_objects, 0);
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let source = Arc::new(ToyMemorySource::new(4096, 1 << 20, 1 << 20));
        let heap = Heap::with_source(HeapConfig::default(), source).unwrap();
        let err = heap.allocate(2 << 20).unwrap_err();
        assert_eq!(err, AllocError::OutOfAddressSpace { requested: 2 << 20 });
    }

    #[test]
    fn test_bad_config_is_rejected() {
        let mut config = HeapConfig::default();
        config.size_classes.min_size = 0;
        let source = Arc::new(ToyMemorySource::default());
        assert_eq!(
            Heap::with_source(config, source).err(),
            Some(ConfigError::ZeroMinSize)
        );
    }

    #[test]
    fn test_huge_requests_run_out_of_address_space() {
        let (source, heap) = toy_heap();
        assert_eq!(
            heap.allocate(usize::MAX).unwrap_err(),
            AllocError::OutOfAddressSpace {
                requested: usize::MAX
            }
        );
        // Rounds to whole pages, but no layout can describe it.
        assert!(matches!(
            heap.allocate(usize::MAX - 2 * 4096),
            Err(AllocError::OutOfAddressSpace { .. })
        ));
        assert!(matches!(
            heap.allocate(isize::MAX as usize),
            Err(AllocError::OutOfAddressSpace { .. })
        ));
        assert_eq!(source.stats().live_regions, 0);
        assert_eq!(heap.stats().large_objects, 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "invalid deallocation")]
    fn test_foreign_pointer_asserts() {
        let (_, heap) = toy_heap();
        let mut local = [0u8; 32];
        unsafe { heap.deallocate(local.as_mut_ptr()) };
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "invalid deallocation")]
    fn test_double_free_asserts() {
        let (_, heap) = toy_heap();
        let p = heap.allocate(100).unwrap();
        unsafe {
            heap.deallocate(p.as_ptr());
            heap.deallocate(p.as_ptr());
        }
    }

    #[test]
    fn test_stop_all_then_allocate() {
        let (_, heap) = toy_heap();
        let p = heap.allocate(40).unwrap();
        heap.stop_all();
        // The owning thread resumes its allocator on the next allocation.
        let q = heap.allocate(40).unwrap();
        assert_ne!(p, q);
        heap.stop_all();
        heap.resume_all().unwrap();
        unsafe {
            heap.deallocate(p.as_ptr());
            heap.deallocate(q.as_ptr());
        }
        assert!(heap.teardown_current_thread().unwrap().is_clean());
    }

    #[test]
    fn test_random_no_aliasing() {
        let seed: u64 = rand::thread_rng().gen();
        log::info!("Seed: {}", seed);
        let mut rng = StdRng::seed_from_u64(seed);

        let (source, heap) = toy_heap();
        let max = heap.size_classes().max_allocatable();
        // start address -> (size, fill byte)
        let mut live: HashMap<usize, (usize, u8)> = HashMap::new();

        for _ in 0..5_000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let size = if rng.gen_bool(0.02) {
                    rng.gen_range(max + 1..max * 3)
                } else {
                    rng.gen_range(0..512)
                };
                let ptr = heap.allocate(size).unwrap();
                let addr = ptr.as_ptr() as usize;
                for (&other, &(other_size, _)) in live.iter() {
                    assert!(
                        addr + size.max(1) <= other || other + other_size.max(1) <= addr,
                        "{:#x} ({} bytes) overlaps {:#x} ({} bytes)",
                        addr,
                        size,
                        other,
                        other_size
                    );
                }
                let fill: u8 = rng.gen();
                unsafe { ptr.as_ptr().write_bytes(fill, size) };
                live.insert(addr, (size, fill));
            } else {
                let addr = *live.keys().next().unwrap();
                let (size, fill) = live.remove(&addr).unwrap();
                let bytes = unsafe { core::slice::from_raw_parts(addr as *const u8, size) };
                assert!(bytes.iter().all(|&b| b == fill), "object at {:#x} was clobbered", addr);
                unsafe { heap.deallocate(addr as *mut u8) };
            }
        }

        let stats = heap.stats();
        assert!(stats.validity.is_valid());
        assert_eq!(stats.live_objects + stats.large_objects, live.len());

        for (addr, _) in live.drain() {
            unsafe { heap.deallocate(addr as *mut u8) };
        }
        assert!(heap.teardown_current_thread().unwrap().is_clean());
        assert_eq!(source.stats().live_regions, 0);
    }
}
