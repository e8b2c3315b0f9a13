//! Free-range bookkeeping for one local allocator.
//!
//! Ranges are offsets into the allocator's regions. Object ranges and meta
//! ranges sit on separate LIFO stacks and are never handed out for each other.

use core::fmt;

/// Identifies a region within the local allocator that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(pub usize);

/// What a free range may be used for.
///
/// Object ranges hold reusable allocation slots. Meta ranges hold allocator
/// bookkeeping (region headers). The two are never interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FreeRangeKind {
    Object,
    Meta,
}

impl FreeRangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FreeRangeKind::Object => "free_object_range",
            FreeRangeKind::Meta => "free_meta_range",
        }
    }
}

impl fmt::Display for FreeRangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An enum for easy comparison of ranges and their order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
    /// The ranges live in different regions and cannot touch.
    Disjoint,
}

/// A contiguous free span, expressed as an offset into its region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRange {
    pub region: RegionId,
    pub offset: usize,
    pub length: usize,
    pub kind: FreeRangeKind,
}

impl FreeRange {
    pub fn object(region: RegionId, offset: usize, length: usize) -> Self {
        FreeRange {
            region,
            offset,
            length,
            kind: FreeRangeKind::Object,
        }
    }

    pub fn meta(region: RegionId, offset: usize, length: usize) -> Self {
        FreeRange {
            region,
            offset,
            length,
            kind: FreeRangeKind::Meta,
        }
    }

    /// Offset one past the last byte of the range.
    pub fn end(&self) -> usize {
        self.offset + self.length
    }

    /// Split `size` bytes off the front of this range and return them,
    /// leaving the remainder in `self`.
    ///
    /// Panics if `size` is larger than the range.
    pub fn split_front(&mut self, size: usize) -> FreeRange {
        assert!(
            size <= self.length,
            "Can't split {} bytes off of a range of {} bytes",
            size,
            self.length
        );
        let front = FreeRange {
            length: size,
            ..*self
        };
        self.offset += size;
        self.length -= size;
        front
    }

    /// Compare two ranges to see how they are ordered.
    pub fn relation(&self, other: &Self) -> Relation {
        if self.region != other.region {
            Relation::Disjoint
        } else if self.end() < other.offset {
            Relation::Before
        } else if self.end() == other.offset {
            Relation::AdjacentBefore
        } else if self.offset < other.end() {
            Relation::Overlapping
        } else if self.offset == other.end() {
            Relation::AdjacentAfter
        } else {
            Relation::After
        }
    }
}

/// A `FreeRangeTracker` holds the free ranges of one size class of one local
/// allocator.
///
/// Object and meta ranges are kept in separate LIFO stacks: the range pushed
/// last is popped first, which hands the most recently freed (and most likely
/// cached) object back out. Ranges are never merged, and no two ranges in a
/// tracker overlap.
#[derive(Debug, Default)]
pub struct FreeRangeTracker {
    objects: Vec<FreeRange>,
    metas: Vec<FreeRange>,
}

/// Validity contains a representation of all invalid states found in a
/// FreeRangeTracker.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Validity {
    /// Number of ranges overlapping other ranges.
    ///
    /// This likely indicates a double free or corruption.
    pub overlaps: usize,

    /// Number of ranges sitting in the list of the other kind.
    pub misfiled: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0 && self.misfiled == 0
    }

    pub fn merge(&mut self, other: &Validity) {
        self.overlaps += other.overlaps;
        self.misfiled += other.misfiled;
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub object_ranges: usize,
    pub object_bytes: usize,
    pub meta_ranges: usize,
    pub meta_bytes: usize,
    /// Pairs of object ranges that touch and could have been one range.
    pub adjacents: usize,
}

impl Stats {
    pub fn merge(&mut self, other: &Stats) {
        self.object_ranges += other.object_ranges;
        self.object_bytes += other.object_bytes;
        self.meta_ranges += other.meta_ranges;
        self.meta_bytes += other.meta_bytes;
        self.adjacents += other.adjacents;
    }
}

impl FreeRangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self, kind: FreeRangeKind) -> &Vec<FreeRange> {
        match kind {
            FreeRangeKind::Object => &self.objects,
            FreeRangeKind::Meta => &self.metas,
        }
    }

    fn list_mut(&mut self, kind: FreeRangeKind) -> &mut Vec<FreeRange> {
        match kind {
            FreeRangeKind::Object => &mut self.objects,
            FreeRangeKind::Meta => &mut self.metas,
        }
    }

    /// Add a range to the stack of its kind.
    pub fn push(&mut self, range: FreeRange) {
        debug_assert!(range.length > 0, "empty free range pushed");
        self.list_mut(range.kind).push(range);
    }

    /// Take the most recently pushed range of `kind`.
    pub fn pop(&mut self, kind: FreeRangeKind) -> Option<FreeRange> {
        let range = self.list_mut(kind).pop()?;
        debug_assert_eq!(range.kind, kind, "free range found in the wrong list");
        Some(range)
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.metas.is_empty()
    }

    pub fn is_empty_of(&self, kind: FreeRangeKind) -> bool {
        self.list(kind).is_empty()
    }

    pub fn len(&self, kind: FreeRangeKind) -> usize {
        self.list(kind).len()
    }

    /// Iterate over the ranges of `kind`, most recently pushed first.
    pub fn iter(&self, kind: FreeRangeKind) -> impl Iterator<Item = &FreeRange> {
        self.list(kind).iter().rev()
    }

    /// Keep only the ranges for which `keep` returns true, in both lists.
    pub fn retain<F: FnMut(&FreeRange) -> bool>(&mut self, mut keep: F) {
        self.objects.retain(|r| keep(r));
        self.metas.retain(|r| keep(r));
    }

    /// Remove every range, objects first.
    pub fn drain(&mut self) -> impl Iterator<Item = FreeRange> + '_ {
        self.objects.drain(..).chain(self.metas.drain(..))
    }

    /// Check current size of the tracker, and whether it is valid.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats::default();

        for range in &self.objects {
            if range.kind != FreeRangeKind::Object {
                validity.misfiled += 1;
            }
            stats.object_ranges += 1;
            stats.object_bytes += range.length;
        }
        for range in &self.metas {
            if range.kind != FreeRangeKind::Meta {
                validity.misfiled += 1;
            }
            stats.meta_ranges += 1;
            stats.meta_bytes += range.length;
        }

        let mut all: Vec<&FreeRange> = self.objects.iter().chain(self.metas.iter()).collect();
        all.sort_by_key(|r| (r.region, r.offset));
        for pair in all.windows(2) {
            match pair[0].relation(pair[1]) {
                Relation::Overlapping => validity.overlaps += 1,
                Relation::AdjacentBefore if pair[0].kind == pair[1].kind => stats.adjacents += 1,
                _ => {}
            }
        }

        (validity, stats)
    }
}

impl fmt::Display for FreeRangeTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FreeRangeTracker(")?;
        let mut start = true;
        for range in self.objects.iter().rev().chain(self.metas.iter().rev()) {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(
                f,
                "{}({}:{:#x}, {})",
                range.kind, range.region.0, range.offset, range.length
            )?;
        }
        write!(f, ")")
    }
}
