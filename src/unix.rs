//! The operating system as a [`MemorySource`].
//!
//! Reservation maps inaccessible anonymous memory, commit makes it readable
//! and writable, decommit tells the kernel the pages can be dropped and takes
//! access away again, and release unmaps.

use core::ptr::{null_mut, NonNull};
use std::collections::BTreeMap;

use spin::Mutex;

use crate::error::AllocError;
use crate::memory::{CommitState, MemoryRegion, MemorySource};
use crate::size_class::round_up;

#[cfg(target_os = "linux")]
const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
#[cfg(not(target_os = "linux"))]
const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

/// SystemMemorySource uses virtual memory from the kernel.
pub struct SystemMemorySource {
    page_size: usize,
    // base address -> length, for every region reserved and not yet released
    regions: Mutex<BTreeMap<usize, usize>>,
}

impl Default for SystemMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMemorySource {
    pub fn new() -> Self {
        SystemMemorySource {
            page_size: sysconf::page::pagesize(),
            regions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of regions currently reserved through this source.
    pub fn live_regions(&self) -> usize {
        self.regions.lock().len()
    }

    fn check_known(&self, region: &MemoryRegion, operation: &str) {
        let known = self.regions.lock().get(&region.addr()) == Some(&region.len());
        assert!(
            known,
            "{} of unknown region at {:#x} ({} bytes)",
            operation,
            region.addr(),
            region.len()
        );
    }
}

impl MemorySource for SystemMemorySource {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn reserve(&self, length: usize) -> Result<MemoryRegion, AllocError> {
        let requested = length;
        let length = round_up(length.max(1), self.page_size)
            .ok_or(AllocError::OutOfAddressSpace { requested })?;

        let ptr = unsafe {
            libc::mmap(
                // Address we want the memory at. We don't care, so null it is.
                null_mut(),
                length,
                // No access until the region is committed.
                libc::PROT_NONE,
                RESERVE_FLAGS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            log::warn!("mmap of {} bytes failed: {}", length, errno::errno());
            return Err(AllocError::OutOfAddressSpace { requested: length });
        }
        let base =
            NonNull::new(ptr as *mut u8).ok_or(AllocError::OutOfAddressSpace { requested: length })?;

        self.regions.lock().insert(base.as_ptr() as usize, length);
        Ok(unsafe { MemoryRegion::from_raw_parts(base, length, CommitState::Decommitted) })
    }

    fn commit(&self, region: &mut MemoryRegion) -> Result<(), AllocError> {
        self.check_known(region, "commit");
        if region.is_committed() {
            return Ok(());
        }

        let result = unsafe {
            libc::mprotect(
                region.base().as_ptr() as *mut libc::c_void,
                region.len(),
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if result != 0 {
            log::warn!(
                "committing {} bytes at {:#x} failed: {}",
                region.len(),
                region.addr(),
                errno::errno()
            );
            return Err(AllocError::OutOfMemory {
                requested: region.len(),
            });
        }

        region.set_commit_state(CommitState::Committed);
        Ok(())
    }

    fn decommit(&self, region: &mut MemoryRegion) {
        if !region.is_committed() {
            return;
        }
        debug_assert!(self.regions.lock().contains_key(&region.addr()));

        unsafe {
            let ptr = region.base().as_ptr() as *mut libc::c_void;
            if libc::madvise(ptr, region.len(), libc::MADV_DONTNEED) != 0 {
                log::debug!("madvise at {:#x} failed: {}", region.addr(), errno::errno());
            }
            if libc::mprotect(ptr, region.len(), libc::PROT_NONE) != 0 {
                log::debug!("mprotect at {:#x} failed: {}", region.addr(), errno::errno());
            }
        }
        region.set_commit_state(CommitState::Decommitted);
    }

    fn release(&self, region: MemoryRegion) {
        let length = self
            .regions
            .lock()
            .remove(&region.addr())
            .unwrap_or_else(|| panic!("release of unknown region at {:#x}", region.addr()));
        assert_eq!(length, region.len(), "release with a mismatched length");

        let result = unsafe { libc::munmap(region.base().as_ptr() as *mut libc::c_void, length) };
        if result != 0 {
            log::error!(
                "munmap of {} bytes at {:#x} failed: {}",
                length,
                region.addr(),
                errno::errno()
            );
        }
    }
}
