//! Per-thread local allocator sets.
//!
//! A [`PerThreadRegistry`] hands every thread its own [`LocalAllocatorSet`],
//! built on first use. The set is remembered in a thread-local slot whose
//! destructor tears it down exactly once when the thread exits. The registry
//! also keeps every live set, so that a coordinator can park them all.

use std::cell::RefCell;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use spin::{Mutex, Once};

use crate::error::AllocError;
use crate::heap::HeapCore;
use crate::local_allocator::{LocalAllocator, LocalAllocatorState, TeardownReport};
use crate::size_class::SizeClass;

/// One local allocator per size class, all belonging to one thread.
pub struct LocalAllocatorSet {
    // None for the registry's shared fallback set.
    thread: Option<ThreadId>,
    allocators: Box<[Arc<LocalAllocator>]>,
}

impl LocalAllocatorSet {
    pub(crate) fn new(core: &HeapCore, thread: Option<ThreadId>) -> Self {
        let page_size = core.table.page_size();
        let allocators = core
            .table
            .iter()
            .map(|class| {
                Arc::new(LocalAllocator::new(
                    *class,
                    page_size,
                    core.config.retained_empty_regions,
                    Arc::clone(&core.source),
                    Arc::clone(&core.page_map),
                ))
            })
            .collect();
        LocalAllocatorSet { thread, allocators }
    }

    /// The owning thread, or `None` for a set shared by threads whose local
    /// storage was already gone.
    pub fn thread(&self) -> Option<ThreadId> {
        self.thread
    }

    pub fn allocator(&self, class: SizeClass) -> &Arc<LocalAllocator> {
        &self.allocators[class.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<LocalAllocator>> {
        self.allocators.iter()
    }

    pub fn stop(&self) {
        for allocator in self.iter() {
            allocator.stop();
        }
    }

    /// Resume every allocator this set has touched. Untouched (decommitted)
    /// allocators stay as they are.
    pub fn resume(&self) -> Result<(), AllocError> {
        for allocator in self.iter() {
            if allocator.state() != LocalAllocatorState::Decommitted {
                allocator.resume()?;
            }
        }
        Ok(())
    }

    /// Decommit every allocator in the set.
    pub fn teardown(&self) -> TeardownReport {
        let mut report = TeardownReport::default();
        for allocator in self.iter() {
            report.merge(&allocator.decommit());
        }
        report
    }
}

/// Told about every torn-down set.
pub trait TeardownHook: Send + Sync {
    fn on_teardown(&self, thread: Option<ThreadId>, report: &TeardownReport);
}

impl<F> TeardownHook for F
where
    F: Fn(Option<ThreadId>, &TeardownReport) + Send + Sync,
{
    fn on_teardown(&self, thread: Option<ThreadId>, report: &TeardownReport) {
        self(thread, report)
    }
}

/// The default hook: a thread that exits with objects still allocated is a
/// leak. It is logged, and in debug builds the process aborts.
#[derive(Debug, Default, Clone, Copy)]
pub struct CheckedTeardown;

impl TeardownHook for CheckedTeardown {
    fn on_teardown(&self, thread: Option<ThreadId>, report: &TeardownReport) {
        if report.is_clean() {
            log::trace!(
                "{:?} torn down, {} regions released",
                thread,
                report.released_regions
            );
            return;
        }
        log::error!(
            "{:?} exited with {} live objects in {} regions",
            thread,
            report.live_objects,
            report.live_regions
        );
        if cfg!(debug_assertions) {
            std::process::abort();
        }
    }
}

struct ThreadSlot {
    registry: Arc<PerThreadRegistry>,
    set: Arc<LocalAllocatorSet>,
}

#[derive(Default)]
struct ThreadSlots {
    slots: RefCell<Vec<ThreadSlot>>,
}

impl Drop for ThreadSlots {
    fn drop(&mut self) {
        let slots = std::mem::take(self.slots.get_mut());
        for slot in slots {
            slot.registry.teardown(&slot.set);
        }
    }
}

thread_local! {
    static THREAD_SLOTS: ThreadSlots = ThreadSlots::default();
}

pub struct PerThreadRegistry {
    core: Arc<HeapCore>,
    hook: Box<dyn TeardownHook>,
    live: Mutex<Vec<Arc<LocalAllocatorSet>>>,
    fallback: Once<Arc<LocalAllocatorSet>>,
}

impl PerThreadRegistry {
    pub(crate) fn new(core: Arc<HeapCore>, hook: Box<dyn TeardownHook>) -> Self {
        PerThreadRegistry {
            core,
            hook,
            live: Mutex::new(Vec::new()),
            fallback: Once::new(),
        }
    }

    /// The calling thread's set, created and registered on first use.
    pub fn for_current_thread(self: &Arc<Self>) -> Arc<LocalAllocatorSet> {
        let found = THREAD_SLOTS.try_with(|slots| {
            if let Some(slot) = slots
                .slots
                .borrow()
                .iter()
                .find(|slot| Arc::ptr_eq(&slot.registry, self))
            {
                return Arc::clone(&slot.set);
            }
            let set = self.register();
            slots.slots.borrow_mut().push(ThreadSlot {
                registry: Arc::clone(self),
                set: Arc::clone(&set),
            });
            set
        });
        found.unwrap_or_else(|_| self.fallback())
    }

    fn register(&self) -> Arc<LocalAllocatorSet> {
        let thread = thread::current().id();
        let set = Arc::new(LocalAllocatorSet::new(&self.core, Some(thread)));
        self.live.lock().push(Arc::clone(&set));
        log::trace!("registered local allocators for {:?}", thread);
        set
    }

    fn fallback(&self) -> Arc<LocalAllocatorSet> {
        let set = self.fallback.call_once(|| {
            log::debug!("thread-local storage is gone; using the shared fallback set");
            Arc::new(LocalAllocatorSet::new(&self.core, None))
        });
        Arc::clone(set)
    }

    fn teardown(&self, set: &Arc<LocalAllocatorSet>) -> TeardownReport {
        self.live.lock().retain(|live| !Arc::ptr_eq(live, set));
        let report = set.teardown();
        self.hook.on_teardown(set.thread(), &report);
        report
    }

    /// Tear down the calling thread's set now instead of at thread exit.
    /// Returns `None` if the thread never used this registry. A later
    /// allocation on the same thread builds a fresh set.
    pub fn teardown_current_thread(self: &Arc<Self>) -> Option<TeardownReport> {
        let slot = THREAD_SLOTS
            .try_with(|slots| {
                let mut slots = slots.slots.borrow_mut();
                let pos = slots
                    .iter()
                    .position(|slot| Arc::ptr_eq(&slot.registry, self))?;
                Some(slots.swap_remove(pos))
            })
            .ok()
            .flatten()?;
        Some(self.teardown(&slot.set))
    }

    /// Number of threads with a registered set.
    pub fn threads(&self) -> usize {
        self.live.lock().len()
    }

    /// Every live set, including the fallback set if it was ever built.
    pub fn sets(&self) -> Vec<Arc<LocalAllocatorSet>> {
        let mut sets = self.live.lock().clone();
        if let Some(fallback) = self.fallback.get() {
            sets.push(Arc::clone(fallback));
        }
        sets
    }

    /// Park every registered set. The owning threads must not be allocating
    /// while this runs.
    pub fn stop_all(&self) {
        let sets = self.sets();
        for set in &sets {
            set.stop();
        }
        log::debug!("stopped {} local allocator sets", sets.len());
    }

    pub fn resume_all(&self) -> Result<(), AllocError> {
        for set in self.sets() {
            set.resume()?;
        }
        Ok(())
    }
}

impl Drop for PerThreadRegistry {
    fn drop(&mut self) {
        if let Some(set) = self.fallback.get() {
            let report = set.teardown();
            self.hook.on_teardown(None, &report);
        }
    }
}
