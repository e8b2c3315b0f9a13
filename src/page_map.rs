//! Pointer to owner lookup.
//!
//! Every region a heap reserves is entered here under its base address, so
//! that `deallocate` can find the local allocator (and region) a pointer
//! belongs to, whichever thread frees it.

use std::collections::BTreeMap;
use std::sync::Arc;

use spin::RwLock;

use crate::free_range::RegionId;
use crate::local_allocator::LocalAllocator;
use crate::memory::MemoryRegion;

/// Who owns a mapped span.
pub enum PageOwner {
    /// A size-class region, owned by a local allocator.
    Small {
        allocator: Arc<LocalAllocator>,
        region: RegionId,
    },
    /// A single large object, which owns its region outright.
    Large { region: MemoryRegion },
}

struct PageEntry {
    length: usize,
    owner: PageOwner,
}

/// The result of looking up an address.
pub enum Lookup {
    Small {
        allocator: Arc<LocalAllocator>,
        region: RegionId,
    },
    /// `addr` is the start of a large object of `length` bytes.
    Large { base: usize, length: usize },
    /// `addr` lies inside a large object but is not its start.
    LargeInterior,
}

#[derive(Default)]
pub struct PageMap {
    entries: RwLock<BTreeMap<usize, PageEntry>>,
}

impl PageMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, base: usize, length: usize, owner: PageOwner) {
        let mut entries = self.entries.write();
        debug_assert!(
            entries
                .range(..base + length)
                .next_back()
                .map_or(true, |(&b, e)| b + e.length <= base),
            "page map entry at {:#x} overlaps an existing entry",
            base
        );
        entries.insert(base, PageEntry { length, owner });
    }

    pub fn lookup(&self, addr: usize) -> Option<Lookup> {
        let entries = self.entries.read();
        let (&base, entry) = entries.range(..=addr).next_back()?;
        if addr >= base + entry.length {
            return None;
        }
        Some(match &entry.owner {
            PageOwner::Small { allocator, region } => Lookup::Small {
                allocator: Arc::clone(allocator),
                region: *region,
            },
            PageOwner::Large { .. } if addr == base => Lookup::Large {
                base,
                length: entry.length,
            },
            PageOwner::Large { .. } => Lookup::LargeInterior,
        })
    }

    pub fn remove(&self, base: usize) -> Option<PageOwner> {
        self.entries.write().remove(&base).map(|e| e.owner)
    }

    /// Number of mapped spans.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Number and total length of large objects currently mapped.
    pub fn large_objects(&self) -> (usize, usize) {
        self.entries
            .read()
            .values()
            .filter(|e| matches!(e.owner, PageOwner::Large { .. }))
            .fold((0, 0), |(count, bytes), e| (count + 1, bytes + e.length))
    }

    /// Remove every large object, handing back their regions.
    pub fn drain_large(&self) -> Vec<MemoryRegion> {
        let mut entries = self.entries.write();
        let bases: Vec<usize> = entries
            .iter()
            .filter(|(_, e)| matches!(e.owner, PageOwner::Large { .. }))
            .map(|(&b, _)| b)
            .collect();
        bases
            .into_iter()
            .filter_map(|b| match entries.remove(&b)?.owner {
                PageOwner::Large { region } => Some(region),
                PageOwner::Small { .. } => None,
            })
            .collect()
    }
}
