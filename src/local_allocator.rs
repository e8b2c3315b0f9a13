//! One thread's claim on one size class.
//!
//! A `LocalAllocator` owns the regions it carved for its class, the free
//! ranges inside them, and (in allocator mode) a bump cursor. Its owning
//! thread is the only one that allocates from it; any thread may free into
//! it. Everything mutable sits behind one spin lock, which keeps a foreign
//! free linearizable with the owner's pops.
//!
//! Each region starts with a header holding one bit per object slot, set
//! while the slot is allocated. The header is allocator bookkeeping: when a
//! region is retired its header goes back on the tracker as a meta range,
//! and the next refill recommits that region instead of reserving a new one.

use core::fmt;
use core::ptr::NonNull;
use std::sync::Arc;

use spin::Mutex;

use crate::error::{AllocError, ConfigError};
use crate::free_range::{FreeRange, FreeRangeKind, FreeRangeTracker, RegionId, Stats, Validity};
use crate::memory::{MemoryRegion, MemorySource};
use crate::page_map::{PageMap, PageOwner};
use crate::size_class::{SizeClass, MIN_ALIGN};

/// Which fast path an allocator serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocatorMode {
    /// Bump allocation from a cursor, with freed objects reused first.
    Allocator,
    /// Every slot of a fresh region is pre-split onto the free list.
    ViewCache,
}

impl AllocatorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocatorMode::Allocator => "allocator",
            AllocatorMode::ViewCache => "view_cache",
        }
    }

    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name.trim().to_lowercase().as_str() {
            "allocator" | "bump" => Ok(AllocatorMode::Allocator),
            "view_cache" | "view-cache" | "viewcache" => Ok(AllocatorMode::ViewCache),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalAllocatorState {
    Decommitted,
    StoppedAllocator,
    Allocator,
    StoppedViewCache,
    ViewCache,
}

impl LocalAllocatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalAllocatorState::Decommitted => "decommitted",
            LocalAllocatorState::StoppedAllocator => "stopped_allocator",
            LocalAllocatorState::Allocator => "allocator",
            LocalAllocatorState::StoppedViewCache => "stopped_view_cache",
            LocalAllocatorState::ViewCache => "view_cache",
        }
    }

    /// Stopped states, including `Decommitted`, cannot allocate.
    pub fn is_stopped(&self) -> bool {
        match self {
            LocalAllocatorState::Decommitted
            | LocalAllocatorState::StoppedAllocator
            | LocalAllocatorState::StoppedViewCache => true,
            LocalAllocatorState::Allocator | LocalAllocatorState::ViewCache => false,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.is_stopped()
    }

    /// The mode of this state, or `None` when decommitted.
    pub fn mode(&self) -> Option<AllocatorMode> {
        match self {
            LocalAllocatorState::Decommitted => None,
            LocalAllocatorState::StoppedAllocator | LocalAllocatorState::Allocator => {
                Some(AllocatorMode::Allocator)
            }
            LocalAllocatorState::StoppedViewCache | LocalAllocatorState::ViewCache => {
                Some(AllocatorMode::ViewCache)
            }
        }
    }

    fn stopped(mode: AllocatorMode) -> Self {
        match mode {
            AllocatorMode::Allocator => LocalAllocatorState::StoppedAllocator,
            AllocatorMode::ViewCache => LocalAllocatorState::StoppedViewCache,
        }
    }

    fn active(mode: AllocatorMode) -> Self {
        match mode {
            AllocatorMode::Allocator => LocalAllocatorState::Allocator,
            AllocatorMode::ViewCache => LocalAllocatorState::ViewCache,
        }
    }
}

impl fmt::Display for LocalAllocatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the header and the object slots sit inside one region of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub object_size: usize,
    pub region_len: usize,
    /// Bytes at the start of the region reserved for the live bitmap.
    pub header_len: usize,
    pub slots: usize,
}

impl RegionLayout {
    pub fn new(class: SizeClass, page_size: usize) -> Self {
        let object_size = class.object_size();
        let region_len = class.page_multiple() * page_size;
        let max_slots = region_len / object_size;
        let header_len = ((max_slots + 7) / 8 + MIN_ALIGN - 1) / MIN_ALIGN * MIN_ALIGN;
        RegionLayout {
            object_size,
            region_len,
            header_len,
            slots: (region_len - header_len) / object_size,
        }
    }

    pub fn offset_of(&self, slot: usize) -> usize {
        self.header_len + slot * self.object_size
    }

    /// The slot starting at `offset`, if any.
    pub fn slot_of(&self, offset: usize) -> Option<usize> {
        let relative = offset.checked_sub(self.header_len)?;
        if relative % self.object_size != 0 {
            return None;
        }
        let slot = relative / self.object_size;
        (slot < self.slots).then_some(slot)
    }
}

// A view of the live bitmap in a region header.
struct LiveBitmap {
    base: NonNull<u8>,
}

impl LiveBitmap {
    // # Safety
    //
    // `region` must be committed and its first `header_len` bytes reserved
    // for the bitmap, and the caller must have exclusive access to them.
    unsafe fn of(region: &MemoryRegion) -> Self {
        debug_assert!(region.is_committed());
        LiveBitmap {
            base: region.base(),
        }
    }

    fn clear(&mut self, header_len: usize) {
        unsafe { core::ptr::write_bytes(self.base.as_ptr(), 0, header_len) };
    }

    // Mark `slot` live. Returns false if it already was.
    fn set(&mut self, slot: usize) -> bool {
        let byte = unsafe { &mut *self.base.as_ptr().add(slot / 8) };
        let mask = 1u8 << (slot % 8);
        let was_free = *byte & mask == 0;
        *byte |= mask;
        was_free
    }

    // Mark `slot` free. Returns false if it already was.
    fn unset(&mut self, slot: usize) -> bool {
        let byte = unsafe { &mut *self.base.as_ptr().add(slot / 8) };
        let mask = 1u8 << (slot % 8);
        let was_live = *byte & mask != 0;
        *byte &= !mask;
        was_live
    }
}

struct RegionRecord {
    region: MemoryRegion,
    live: usize,
    // Decommitted, with its header parked on the tracker as a meta range.
    retired: bool,
}

impl RegionRecord {
    fn bitmap(&mut self) -> LiveBitmap {
        unsafe { LiveBitmap::of(&self.region) }
    }
}

struct LocalInner {
    state: LocalAllocatorState,
    tracker: FreeRangeTracker,
    cursor: Option<FreeRange>,
    regions: Vec<Option<RegionRecord>>,
}

impl LocalInner {
    fn record_mut(&mut self, id: RegionId) -> Result<&mut RegionRecord, AllocError> {
        self.regions
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(AllocError::InvariantViolation("free range names an unknown region"))
    }

    fn insert_region(&mut self, record: RegionRecord) -> RegionId {
        match self.regions.iter().position(Option::is_none) {
            Some(slot) => {
                self.regions[slot] = Some(record);
                RegionId(slot)
            }
            None => {
                self.regions.push(Some(record));
                RegionId(self.regions.len() - 1)
            }
        }
    }

    fn empty_regions(&self) -> usize {
        self.regions
            .iter()
            .flatten()
            .filter(|r| !r.retired && r.live == 0)
            .count()
    }

    // Forget every range in `id`, including the cursor.
    fn forget_ranges(&mut self, id: RegionId) {
        self.tracker.retain(|r| r.region != id);
        if self.cursor.map_or(false, |c| c.region == id) {
            self.cursor = None;
        }
    }
}

/// What tearing down a local allocator left behind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    /// Regions given back to the memory source.
    pub released_regions: usize,
    /// Regions kept because objects in them are still allocated.
    pub live_regions: usize,
    /// Objects still allocated in those regions.
    pub live_objects: usize,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.live_regions == 0
    }

    pub fn merge(&mut self, other: &TeardownReport) {
        self.released_regions += other.released_regions;
        self.live_regions += other.live_regions;
        self.live_objects += other.live_objects;
    }
}

/// A snapshot of one local allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStats {
    pub state: LocalAllocatorState,
    pub committed_regions: usize,
    pub retired_regions: usize,
    pub live_objects: usize,
    pub validity: Validity,
    pub free: Stats,
}

pub struct LocalAllocator {
    class: SizeClass,
    layout: RegionLayout,
    retained_empty_regions: usize,
    source: Arc<dyn MemorySource>,
    page_map: Arc<PageMap>,
    inner: Mutex<LocalInner>,
}

impl LocalAllocator {
    /// A decommitted allocator for `class`. It holds no memory until its
    /// first refill.
    pub fn new(
        class: SizeClass,
        page_size: usize,
        retained_empty_regions: usize,
        source: Arc<dyn MemorySource>,
        page_map: Arc<PageMap>,
    ) -> Self {
        LocalAllocator {
            class,
            layout: RegionLayout::new(class, page_size),
            retained_empty_regions,
            source,
            page_map,
            inner: Mutex::new(LocalInner {
                state: LocalAllocatorState::Decommitted,
                tracker: FreeRangeTracker::new(),
                cursor: None,
                regions: Vec::new(),
            }),
        }
    }

    pub fn class(&self) -> SizeClass {
        self.class
    }

    pub fn layout(&self) -> RegionLayout {
        self.layout
    }

    pub fn state(&self) -> LocalAllocatorState {
        self.inner.lock().state
    }

    /// First touch: move a decommitted allocator to the stopped state of
    /// `mode`. Any other state is left alone. Returns the resulting state.
    pub fn prepare(&self, mode: AllocatorMode) -> LocalAllocatorState {
        let mut inner = self.inner.lock();
        if inner.state == LocalAllocatorState::Decommitted {
            inner.state = LocalAllocatorState::stopped(mode);
            log::trace!("class {} prepared as {}", self.class.index(), inner.state);
        }
        inner.state
    }

    /// Move a stopped allocator to the active state of its mode. Resuming an
    /// active allocator does nothing.
    pub fn resume(&self) -> Result<(), AllocError> {
        let mut inner = self.inner.lock();
        match inner.state {
            LocalAllocatorState::Decommitted => {
                return Err(AllocError::NotActive { state: inner.state })
            }
            LocalAllocatorState::Allocator | LocalAllocatorState::ViewCache => return Ok(()),
            LocalAllocatorState::StoppedAllocator => {
                inner.state = LocalAllocatorState::active(AllocatorMode::Allocator)
            }
            LocalAllocatorState::StoppedViewCache => {
                inner.state = LocalAllocatorState::active(AllocatorMode::ViewCache)
            }
        }
        log::trace!("class {} resumed as {}", self.class.index(), inner.state);
        Ok(())
    }

    /// Park an active allocator. The bump cursor goes back onto the tracker
    /// so that a stopped allocator holds no fast-path state. Stopping a
    /// stopped allocator does nothing.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            LocalAllocatorState::Allocator => {
                if let Some(cursor) = inner.cursor.take() {
                    inner.tracker.push(cursor);
                }
                inner.state = LocalAllocatorState::StoppedAllocator;
            }
            LocalAllocatorState::ViewCache => inner.state = LocalAllocatorState::StoppedViewCache,
            _ => return,
        }
        log::trace!("class {} stopped", self.class.index());
    }

    /// Allocate one object of this allocator's class.
    pub fn allocate(self: &Arc<Self>) -> Result<NonNull<u8>, AllocError> {
        let mut inner = self.inner.lock();
        let mode = match inner.state.mode() {
            Some(mode) if inner.state.is_active() => mode,
            _ => return Err(AllocError::NotActive { state: inner.state }),
        };

        let range = match self.take_object(&mut inner) {
            Some(range) => range,
            None => {
                self.refill(&mut inner, mode)?;
                self.take_object(&mut inner).ok_or(AllocError::InvariantViolation(
                    "no free object after carving a region",
                ))?
            }
        };

        let object_size = self.layout.object_size;
        let record = inner.record_mut(range.region)?;
        let slot = self
            .layout
            .slot_of(range.offset)
            .filter(|_| range.length == object_size)
            .ok_or(AllocError::InvariantViolation("free range is not one object slot"))?;
        if !record.bitmap().set(slot) {
            return Err(AllocError::InvariantViolation(
                "free range covers a live object",
            ));
        }
        record.live += 1;

        let ptr = unsafe { record.region.base().as_ptr().add(range.offset) };
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    // Pop one object-sized range: recently freed objects first, then the
    // bump cursor.
    fn take_object(&self, inner: &mut LocalInner) -> Option<FreeRange> {
        let object_size = self.layout.object_size;
        if let Some(mut range) = inner.tracker.pop(FreeRangeKind::Object) {
            debug_assert!(range.length >= object_size);
            if range.length > object_size {
                let front = range.split_front(object_size);
                inner.tracker.push(range);
                return Some(front);
            }
            return Some(range);
        }

        let cursor = inner.cursor.as_mut()?;
        let front = cursor.split_front(object_size);
        if cursor.length == 0 {
            inner.cursor = None;
        }
        Some(front)
    }

    // Find a region to carve: a retired one if the tracker has a header
    // parked, otherwise a fresh reservation.
    fn refill(self: &Arc<Self>, inner: &mut LocalInner, mode: AllocatorMode) -> Result<(), AllocError> {
        let id = match inner.tracker.pop(FreeRangeKind::Meta) {
            Some(header) => {
                let record = inner.record_mut(header.region)?;
                if let Err(err) = self.source.commit(&mut record.region) {
                    inner.tracker.push(header);
                    return Err(err);
                }
                record.retired = false;
                log::debug!(
                    "class {}: recommitted retired region at {:#x}",
                    self.class.index(),
                    record.region.addr()
                );
                header.region
            }
            None => {
                let mut region = self.source.reserve(self.layout.region_len)?;
                if let Err(err) = self.source.commit(&mut region) {
                    self.source.release(region);
                    return Err(err);
                }
                let (base, length) = (region.addr(), region.len());
                let id = inner.insert_region(RegionRecord {
                    region,
                    live: 0,
                    retired: false,
                });
                self.page_map.insert(
                    base,
                    length,
                    PageOwner::Small {
                        allocator: Arc::clone(self),
                        region: id,
                    },
                );
                log::debug!(
                    "class {}: reserved region {} at {:#x} ({} bytes, {} slots)",
                    self.class.index(),
                    id.0,
                    base,
                    length,
                    self.layout.slots
                );
                id
            }
        };

        let layout = self.layout;
        inner.record_mut(id)?.bitmap().clear(layout.header_len);
        match mode {
            AllocatorMode::Allocator => {
                let span = FreeRange::object(id, layout.header_len, layout.slots * layout.object_size);
                if let Some(old) = inner.cursor.replace(span) {
                    inner.tracker.push(old);
                }
            }
            AllocatorMode::ViewCache => {
                // Pushed highest first, so the lowest address pops first.
                for slot in (0..layout.slots).rev() {
                    inner
                        .tracker
                        .push(FreeRange::object(id, layout.offset_of(slot), layout.object_size));
                }
            }
        }
        Ok(())
    }

    /// Return the object at `addr`, which lives in `region`, to this
    /// allocator. Valid in every state and from every thread.
    pub fn deallocate(&self, addr: usize, region: RegionId) -> Result<(), AllocError> {
        let layout = self.layout;
        let mut inner = self.inner.lock();
        let record = inner.record_mut(region)?;
        if record.retired {
            return Err(AllocError::InvariantViolation("double free"));
        }
        let offset = addr
            .checked_sub(record.region.addr())
            .filter(|&offset| offset < record.region.len())
            .ok_or(AllocError::InvariantViolation("pointer outside its region"))?;
        let slot = layout.slot_of(offset).ok_or(AllocError::InvariantViolation(
            "pointer is not the start of an object",
        ))?;
        if !record.bitmap().unset(slot) {
            return Err(AllocError::InvariantViolation("double free"));
        }
        record.live -= 1;
        let now_empty = record.live == 0;

        inner
            .tracker
            .push(FreeRange::object(region, offset, layout.object_size));

        if now_empty {
            if inner.state == LocalAllocatorState::Decommitted {
                // The owning thread is gone; nobody will allocate here again.
                let owner = self.release_region(&mut inner, region);
                drop(inner);
                drop(owner);
            } else if inner.empty_regions() > self.retained_empty_regions {
                self.retire_region(&mut inner, region)?;
            }
        }
        Ok(())
    }

    fn retire_region(&self, inner: &mut LocalInner, id: RegionId) -> Result<(), AllocError> {
        inner.forget_ranges(id);
        let record = inner.record_mut(id)?;
        self.source.decommit(&mut record.region);
        record.retired = true;
        log::debug!(
            "class {}: retired region {} at {:#x}",
            self.class.index(),
            id.0,
            record.region.addr()
        );
        inner
            .tracker
            .push(FreeRange::meta(id, 0, self.layout.header_len));
        Ok(())
    }

    // Give region `id` back to the source. The page-map entry is handed back
    // so that the caller can drop it after unlocking.
    fn release_region(&self, inner: &mut LocalInner, id: RegionId) -> Option<PageOwner> {
        inner.forget_ranges(id);
        let record = inner.regions.get_mut(id.0)?.take()?;
        let owner = self.page_map.remove(record.region.addr());
        log::debug!(
            "class {}: released region {} at {:#x}",
            self.class.index(),
            id.0,
            record.region.addr()
        );
        self.source.release(record.region);
        owner
    }

    /// Tear this allocator down: release every region without live objects,
    /// clear the tracker and return to `Decommitted`. Regions that still hold
    /// objects stay mapped (so those objects remain valid) and are released
    /// when their last object is freed.
    pub fn decommit(&self) -> TeardownReport {
        let mut report = TeardownReport::default();
        let mut owners = Vec::new();
        let mut inner = self.inner.lock();

        inner.cursor = None;
        inner.tracker.drain().for_each(drop);
        for slot in 0..inner.regions.len() {
            let live = match &inner.regions[slot] {
                Some(record) => record.live,
                None => continue,
            };
            if live == 0 {
                owners.push(self.release_region(&mut inner, RegionId(slot)));
                report.released_regions += 1;
            } else {
                report.live_regions += 1;
                report.live_objects += live;
            }
        }
        inner.state = LocalAllocatorState::Decommitted;

        drop(inner);
        drop(owners);
        report
    }

    pub fn stats(&self) -> LocalStats {
        let inner = self.inner.lock();
        let (validity, mut free) = inner.tracker.stats();
        if let Some(cursor) = inner.cursor {
            free.object_ranges += 1;
            free.object_bytes += cursor.length;
        }
        let records = inner.regions.iter().flatten();
        LocalStats {
            state: inner.state,
            committed_regions: records.clone().filter(|r| !r.retired).count(),
            retired_regions: records.clone().filter(|r| r.retired).count(),
            live_objects: records.map(|r| r.live).sum(),
            validity,
            free,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;

    use crate::memory::ToyMemorySource;
    use crate::page_map::Lookup;
    use crate::size_class::{SizeClassConfig, SizeClassTable};
    use test_log::test;

    struct Fixture {
        source: Arc<ToyMemorySource>,
        page_map: Arc<PageMap>,
        allocator: Arc<LocalAllocator>,
    }

    fn fixture(size: usize, retained: usize) -> Fixture {
        let config = SizeClassConfig {
            objects_per_region: 8,
            ..SizeClassConfig::default()
        };
        let table = SizeClassTable::new(&config, 256).unwrap();
        let class = table.class_for(size).unwrap();
        let source = Arc::new(ToyMemorySource::new(256, 1 << 24, 1 << 24));
        let page_map = Arc::new(PageMap::new());
        let allocator = Arc::new(LocalAllocator::new(
            class,
            256,
            retained,
            source.clone(),
            page_map.clone(),
        ));
        Fixture {
            source,
            page_map,
            allocator,
        }
    }

    fn free(f: &Fixture, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let addr = ptr.as_ptr() as usize;
        match f.page_map.lookup(addr) {
            Some(Lookup::Small { allocator, region }) => {
                assert!(Arc::ptr_eq(&allocator, &f.allocator));
                allocator.deallocate(addr, region)
            }
            _ => panic!("{:#x} is not mapped", addr),
        }
    }

    fn activate(f: &Fixture, mode: AllocatorMode) {
        f.allocator.prepare(mode);
        f.allocator.resume().unwrap();
    }

    #[test]
    fn test_state_machine() {
        let f = fixture(32, 1);
        let a = &f.allocator;
        assert_eq!(a.state(), LocalAllocatorState::Decommitted);
        assert_eq!(
            a.allocate().unwrap_err(),
            AllocError::NotActive {
                state: LocalAllocatorState::Decommitted
            }
        );
        assert!(a.resume().is_err());

        assert_eq!(a.prepare(AllocatorMode::Allocator), LocalAllocatorState::StoppedAllocator);
        assert!(a.allocate().is_err());
        a.resume().unwrap();
        a.resume().unwrap();
        assert_eq!(a.state(), LocalAllocatorState::Allocator);

        a.stop();
        a.stop();
        assert_eq!(a.state(), LocalAllocatorState::StoppedAllocator);
        assert_eq!(
            a.allocate().unwrap_err(),
            AllocError::NotActive {
                state: LocalAllocatorState::StoppedAllocator
            }
        );

        // Preparing again does not change the mode of a touched allocator.
        assert_eq!(a.prepare(AllocatorMode::ViewCache), LocalAllocatorState::StoppedAllocator);
        a.decommit();
        assert_eq!(a.state(), LocalAllocatorState::Decommitted);
        assert_eq!(a.prepare(AllocatorMode::ViewCache), LocalAllocatorState::StoppedViewCache);
        a.resume().unwrap();
        assert_eq!(a.state(), LocalAllocatorState::ViewCache);
        a.stop();
        assert_eq!(a.state(), LocalAllocatorState::StoppedViewCache);
    }

    #[test]
    fn test_state_names() {
        let names: Vec<&str> = [
            LocalAllocatorState::Decommitted,
            LocalAllocatorState::StoppedAllocator,
            LocalAllocatorState::Allocator,
            LocalAllocatorState::StoppedViewCache,
            LocalAllocatorState::ViewCache,
        ]
        .iter()
        .map(|s| s.as_str())
        .collect();
        assert_eq!(
            names,
            ["decommitted", "stopped_allocator", "allocator", "stopped_view_cache", "view_cache"]
        );
        assert_eq!(AllocatorMode::parse("View_Cache").unwrap(), AllocatorMode::ViewCache);
        assert!(AllocatorMode::parse("slab").is_err());
    }

    #[test]
    fn test_lifo_reuse() {
        let f = fixture(16, 1);
        activate(&f, AllocatorMode::Allocator);
        let a = f.allocator.allocate().unwrap();
        let b = f.allocator.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 16);

        free(&f, a).unwrap();
        assert_eq!(f.allocator.allocate().unwrap(), a);

        free(&f, a).unwrap();
        free(&f, b).unwrap();
        assert_eq!(f.allocator.allocate().unwrap(), b);
        assert_eq!(f.allocator.allocate().unwrap(), a);
        free(&f, a).unwrap();
        free(&f, b).unwrap();
        assert!(f.allocator.decommit().is_clean());
    }

    #[test]
    fn test_view_cache_prewarms_region() {
        let f = fixture(64, 1);
        activate(&f, AllocatorMode::ViewCache);
        let first = f.allocator.allocate().unwrap();

        let layout = f.allocator.layout();
        let stats = f.allocator.stats();
        assert_eq!(stats.free.object_ranges, layout.slots - 1);
        assert_eq!(stats.live_objects, 1);

        // Lowest slot first.
        let second = f.allocator.allocate().unwrap();
        assert_eq!(second.as_ptr() as usize - first.as_ptr() as usize, 64);
        free(&f, first).unwrap();
        free(&f, second).unwrap();
        assert!(f.allocator.decommit().is_clean());
        assert_eq!(f.source.stats().live_regions, 0);
    }

    #[test]
    fn test_stop_returns_cursor_to_tracker() {
        let f = fixture(32, 1);
        activate(&f, AllocatorMode::Allocator);
        let p = f.allocator.allocate().unwrap();
        assert_eq!(f.allocator.stats().free.object_ranges, 1);

        f.allocator.stop();
        let stats = f.allocator.stats();
        let layout = f.allocator.layout();
        assert_eq!(stats.free.object_ranges, 1);
        assert_eq!(stats.free.object_bytes, (layout.slots - 1) * 32);

        // A parked allocator still accepts frees.
        free(&f, p).unwrap();
        assert_eq!(f.allocator.stats().live_objects, 0);

        f.allocator.resume().unwrap();
        assert_eq!(f.allocator.allocate().unwrap(), p);
        let q = f.allocator.allocate().unwrap();
        assert_eq!(q.as_ptr() as usize, p.as_ptr() as usize + 32);
        free(&f, p).unwrap();
        free(&f, q).unwrap();
        assert_eq!(f.source.stats().reservations, 1);
    }

    #[test]
    fn test_no_aliasing_across_regions() {
        let f = fixture(48, 1);
        activate(&f, AllocatorMode::Allocator);
        let slots = f.allocator.layout().slots;

        let mut seen = HashSet::new();
        let mut pointers = Vec::new();
        for _ in 0..slots * 3 + 1 {
            let p = f.allocator.allocate().unwrap();
            assert!(seen.insert(p.as_ptr() as usize), "duplicate pointer {:p}", p);
            pointers.push(p);
        }
        assert_eq!(f.source.stats().reservations, 4);
        for p in pointers {
            free(&f, p).unwrap();
        }
        let stats = f.allocator.stats();
        assert!(stats.validity.is_valid());
        assert_eq!(stats.live_objects, 0);
    }

    #[test]
    fn test_round_trip_needs_no_new_reservation() {
        let f = fixture(32, 1);
        activate(&f, AllocatorMode::Allocator);
        let n = f.allocator.layout().slots * 3;

        let first: Vec<_> = (0..n).map(|_| f.allocator.allocate().unwrap()).collect();
        let reserved = f.source.stats().reservations;
        for p in &first {
            free(&f, *p).unwrap();
        }
        // All but one empty region were retired.
        let stats = f.allocator.stats();
        assert_eq!(stats.committed_regions, 1);
        assert_eq!(stats.retired_regions, 2);
        assert_eq!(stats.free.meta_ranges, 2);
        assert_eq!(f.source.stats().decommits, 2);

        let second: Vec<_> = (0..n).map(|_| f.allocator.allocate().unwrap()).collect();
        assert_eq!(f.source.stats().reservations, reserved);
        assert_eq!(f.allocator.stats().retired_regions, 0);
        for p in &second {
            free(&f, *p).unwrap();
        }
        assert!(f.allocator.decommit().is_clean());
        assert_eq!(f.source.stats().live_regions, 0);
    }

    #[test]
    fn test_detects_double_and_misaligned_free() {
        let f = fixture(32, 4);
        activate(&f, AllocatorMode::Allocator);
        let p = f.allocator.allocate().unwrap();
        let keep = f.allocator.allocate().unwrap();
        free(&f, p).unwrap();
        assert_eq!(
            free(&f, p).unwrap_err(),
            AllocError::InvariantViolation("double free")
        );

        let interior = unsafe { NonNull::new_unchecked(keep.as_ptr().add(8)) };
        assert_eq!(
            free(&f, interior).unwrap_err(),
            AllocError::InvariantViolation("pointer is not the start of an object")
        );
        free(&f, keep).unwrap();
        assert!(f.allocator.stats().validity.is_valid());
    }

    #[test]
    fn test_teardown_keeps_live_regions() {
        let f = fixture(32, 1);
        activate(&f, AllocatorMode::Allocator);
        let slots = f.allocator.layout().slots;
        let pointers: Vec<_> = (0..slots + 1).map(|_| f.allocator.allocate().unwrap()).collect();
        // Empty the first region entirely; the second keeps one object.
        for p in &pointers[..slots] {
            free(&f, *p).unwrap();
        }

        let report = f.allocator.decommit();
        assert_eq!(
            report,
            TeardownReport {
                released_regions: 1,
                live_regions: 1,
                live_objects: 1,
            }
        );
        assert_eq!(f.allocator.state(), LocalAllocatorState::Decommitted);
        assert_eq!(f.source.stats().live_regions, 1);

        // Freeing the orphan's last object releases its region.
        free(&f, pointers[slots]).unwrap();
        assert_eq!(f.source.stats().live_regions, 0);
        assert!(f.page_map.is_empty());
    }

    #[test]
    fn test_commit_failure_propagates() {
        let config = SizeClassConfig::default();
        let table = SizeClassTable::new(&config, 4096).unwrap();
        let class = table.class_for(1024).unwrap();
        let source = Arc::new(ToyMemorySource::new(4096, 1 << 24, 4096));
        let allocator = Arc::new(LocalAllocator::new(
            class,
            4096,
            1,
            source.clone(),
            Arc::new(PageMap::new()),
        ));
        allocator.prepare(AllocatorMode::Allocator);
        allocator.resume().unwrap();

        let err = allocator.allocate().unwrap_err();
        assert!(matches!(err, AllocError::OutOfMemory { .. }));
        assert!(err.is_exhaustion());
        // The reservation was handed back.
        assert_eq!(source.stats().live_regions, 0);
    }

    #[test]
    fn test_region_layout() {
        let config = SizeClassConfig::default();
        let table = SizeClassTable::new(&config, 4096).unwrap();
        for class in table.iter() {
            let layout = RegionLayout::new(*class, 4096);
            assert!(layout.slots >= 1);
            assert_eq!(layout.header_len % MIN_ALIGN, 0);
            assert!(layout.header_len * 8 >= layout.slots);
            assert!(layout.offset_of(layout.slots) <= layout.region_len);
            assert_eq!(layout.slot_of(layout.offset_of(layout.slots - 1)), Some(layout.slots - 1));
            assert_eq!(layout.slot_of(layout.offset_of(layout.slots)), None);
            assert_eq!(layout.slot_of(0), None);
        }
    }
}
