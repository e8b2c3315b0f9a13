//! Virtual memory sources.
//!
//! ## [`MemorySource`]
//!
//! `MemorySource` is the trait interface abstracting over the calls to the OS
//! that reserve address space, back it with physical memory, and give it
//! back. Allocators never touch the OS directly; they go through a source.
//!
//! ## [`MemoryRegion`]
//!
//! A region is a reserved, page-aligned span of address space. Whoever holds
//! the `MemoryRegion` value owns the span: the source until `reserve`
//! returns, then a local allocator (or the page map, for large objects).
//! `release` consumes the value, so a released region cannot be touched
//! again through safe code.
//!
//! ## [`ToyMemorySource`]
//!
//! `ToyMemorySource` pretends to be the OS, handing out page-aligned blocks
//! from the process heap with configurable address-space and commit limits.
//! It counts everything it does and is mainly useful for testing.

use core::ptr::NonNull;
use std::alloc::{self, Layout};
use std::collections::BTreeMap;

use spin::Mutex;

use crate::error::AllocError;
use crate::size_class::round_up;

/// Whether a region is currently backed by physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitState {
    Decommitted,
    Committed,
}

/// A reserved span of address space.
#[derive(Debug)]
pub struct MemoryRegion {
    base: NonNull<u8>,
    length: usize,
    commit: CommitState,
}

// A MemoryRegion is sendable - it is an exclusive claim on its address range,
// and nothing else holds a pointer into it while it is unallocated.
unsafe impl Send for MemoryRegion {}
// Shared access only reads the descriptor, never the memory behind it.
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Construct a region from raw parts.
    ///
    /// # Safety
    ///
    /// `base..base + length` must be a span of address space reserved for,
    /// and exclusively owned by, the caller. `commit` must describe whether
    /// the span is currently readable and writable.
    pub unsafe fn from_raw_parts(base: NonNull<u8>, length: usize, commit: CommitState) -> Self {
        MemoryRegion {
            base,
            length,
            commit,
        }
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// The base address as an integer.
    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn end(&self) -> usize {
        self.addr() + self.length
    }

    pub fn commit_state(&self) -> CommitState {
        self.commit
    }

    pub fn is_committed(&self) -> bool {
        self.commit == CommitState::Committed
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.addr() && addr < self.end()
    }

    pub(crate) fn set_commit_state(&mut self, commit: CommitState) {
        self.commit = commit;
    }
}

/// A provider of address space and physical memory.
///
/// Calls for *different* regions may come from different threads at the same
/// time; implementations protect their own bookkeeping. Calls for the *same*
/// region are serialized by whoever owns it.
pub trait MemorySource: Send + Sync {
    /// The granularity of every reservation.
    fn page_size(&self) -> usize;

    /// Reserve at least `length` bytes of address space, rounded up to whole
    /// pages. The returned region is decommitted.
    fn reserve(&self, length: usize) -> Result<MemoryRegion, AllocError>;

    /// Back `region` with physical memory, making it readable and writable.
    /// Committing a committed region is a no-op.
    fn commit(&self, region: &mut MemoryRegion) -> Result<(), AllocError>;

    /// Drop the physical backing of `region` but keep the address space.
    /// This is a hint and never fails; decommitting a decommitted region is
    /// a no-op.
    fn decommit(&self, region: &mut MemoryRegion);

    /// Give the address space of `region` back.
    ///
    /// Releasing a region this source never handed out, or has already
    /// released, is a fatal programming error.
    fn release(&self, region: MemoryRegion);
}

/// Counters kept by a [`ToyMemorySource`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ToyStats {
    /// Successful `reserve` calls.
    pub reservations: usize,
    /// `release` calls.
    pub releases: usize,
    /// `commit` calls that changed a region's state.
    pub commits: usize,
    /// `decommit` calls that changed a region's state.
    pub decommits: usize,
    /// Regions reserved and not yet released.
    pub live_regions: usize,
    /// Highest `live_regions` ever observed.
    pub peak_live_regions: usize,
    pub reserved_bytes: usize,
    pub committed_bytes: usize,
}

struct ToyState {
    // base address -> (length, commit state)
    regions: BTreeMap<usize, (usize, CommitState)>,
    stats: ToyStats,
}

/// A [`MemorySource`] carved out of the process heap, for tests.
pub struct ToyMemorySource {
    page_size: usize,
    address_limit: usize,
    commit_limit: usize,
    state: Mutex<ToyState>,
}

impl Default for ToyMemorySource {
    fn default() -> Self {
        ToyMemorySource::new(4096, 1 << 30, 1 << 30)
    }
}

impl ToyMemorySource {
    /// A source handing out `page_size` pages, refusing to reserve more than
    /// `address_limit` bytes or commit more than `commit_limit` bytes at once.
    pub fn new(page_size: usize, address_limit: usize, commit_limit: usize) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        ToyMemorySource {
            page_size,
            address_limit,
            commit_limit,
            state: Mutex::new(ToyState {
                regions: BTreeMap::new(),
                stats: ToyStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> ToyStats {
        self.state.lock().stats.clone()
    }

    fn layout(&self, length: usize) -> Result<Layout, AllocError> {
        Layout::from_size_align(length, self.page_size)
            .map_err(|_| AllocError::OutOfAddressSpace { requested: length })
    }
}

impl MemorySource for ToyMemorySource {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn reserve(&self, length: usize) -> Result<MemoryRegion, AllocError> {
        let requested = length;
        let length = round_up(length.max(1), self.page_size)
            .ok_or(AllocError::OutOfAddressSpace { requested })?;
        let layout = self.layout(length)?;
        let mut state = self.state.lock();
        let reserved = state.stats.reserved_bytes.checked_add(length);
        if reserved.map_or(true, |reserved| reserved > self.address_limit) {
            return Err(AllocError::OutOfAddressSpace { requested: length });
        }

        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or(AllocError::OutOfAddressSpace { requested: length })?;

        state
            .regions
            .insert(base.as_ptr() as usize, (length, CommitState::Decommitted));
        let stats = &mut state.stats;
        stats.reservations += 1;
        stats.live_regions += 1;
        stats.peak_live_regions = stats.peak_live_regions.max(stats.live_regions);
        stats.reserved_bytes += length;

        Ok(unsafe { MemoryRegion::from_raw_parts(base, length, CommitState::Decommitted) })
    }

    fn commit(&self, region: &mut MemoryRegion) -> Result<(), AllocError> {
        let mut state = self.state.lock();
        let commit_limit = self.commit_limit;
        let ToyState { regions, stats } = &mut *state;
        let entry = regions
            .get_mut(&region.addr())
            .unwrap_or_else(|| panic!("commit of unknown region at {:#x}", region.addr()));
        if entry.1 == CommitState::Committed {
            region.set_commit_state(CommitState::Committed);
            return Ok(());
        }
        if stats.committed_bytes + region.len() > commit_limit {
            return Err(AllocError::OutOfMemory {
                requested: region.len(),
            });
        }
        entry.1 = CommitState::Committed;
        stats.commits += 1;
        stats.committed_bytes += region.len();
        region.set_commit_state(CommitState::Committed);
        Ok(())
    }

    fn decommit(&self, region: &mut MemoryRegion) {
        let mut state = self.state.lock();
        let ToyState { regions, stats } = &mut *state;
        let entry = match regions.get_mut(&region.addr()) {
            Some(entry) => entry,
            None => {
                debug_assert!(false, "decommit of unknown region at {:#x}", region.addr());
                return;
            }
        };
        region.set_commit_state(CommitState::Decommitted);
        if entry.1 == CommitState::Decommitted {
            return;
        }
        entry.1 = CommitState::Decommitted;
        stats.decommits += 1;
        stats.committed_bytes -= region.len();
        // Dropping the backing of real pages leaves zero-filled memory behind.
        unsafe { core::ptr::write_bytes(region.base().as_ptr(), 0, region.len()) };
    }

    fn release(&self, region: MemoryRegion) {
        let mut state = self.state.lock();
        let (length, commit) = state
            .regions
            .remove(&region.addr())
            .unwrap_or_else(|| panic!("release of unknown region at {:#x}", region.addr()));
        assert_eq!(length, region.len(), "release with a mismatched length");

        let stats = &mut state.stats;
        stats.releases += 1;
        stats.live_regions -= 1;
        stats.reserved_bytes -= length;
        if commit == CommitState::Committed {
            stats.committed_bytes -= length;
        }
        if let Ok(layout) = self.layout(length) {
            unsafe { alloc::dealloc(region.base().as_ptr(), layout) };
        }
    }
}

impl Drop for ToyMemorySource {
    fn drop(&mut self) {
        // Anything still reserved is leaked by its owner; give the heap its
        // blocks back anyway.
        let page_size = self.page_size;
        let state = self.state.get_mut();
        for (&base, &(length, _)) in state.regions.iter() {
            if let Ok(layout) = Layout::from_size_align(length, page_size) {
                unsafe { alloc::dealloc(base as *mut u8, layout) };
            }
        }
        state.regions.clear();
    }
}
