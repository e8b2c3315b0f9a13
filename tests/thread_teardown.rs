use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, ThreadId};

use tcache_alloc::{Heap, HeapConfig, TeardownReport, ToyMemorySource};

use test_log::test;

#[derive(Default)]
struct Recorded {
    teardowns: AtomicUsize,
    live_objects: AtomicUsize,
    released_regions: AtomicUsize,
}

fn recording_heap() -> (Arc<ToyMemorySource>, Arc<Recorded>, Arc<Heap>) {
    let source = Arc::new(ToyMemorySource::default());
    let recorded = Arc::new(Recorded::default());
    let hook = {
        let recorded = recorded.clone();
        move |_: Option<ThreadId>, report: &TeardownReport| {
            recorded.teardowns.fetch_add(1, Ordering::SeqCst);
            recorded
                .live_objects
                .fetch_add(report.live_objects, Ordering::SeqCst);
            recorded
                .released_regions
                .fetch_add(report.released_regions, Ordering::SeqCst);
        }
    };
    let heap = Heap::with_source_and_hook(HeapConfig::default(), source.clone(), Box::new(hook))
        .unwrap();
    (source, recorded, Arc::new(heap))
}

fn churn(heap: &Heap, rounds: usize) {
    for i in 0..rounds {
        let p = heap.allocate(24).unwrap();
        unsafe {
            p.as_ptr().cast::<u64>().write(i as u64);
            assert_eq!(p.as_ptr().cast::<u64>().read(), i as u64);
            heap.deallocate(p.as_ptr());
        }
    }
}

#[test]
fn test_threads_release_everything() {
    // One thread on its own, for comparison.
    let (single_source, _, single_heap) = recording_heap();
    {
        let heap = single_heap.clone();
        thread::spawn(move || churn(&heap, 10_000)).join().unwrap();
    }
    let single_run = single_source.stats().reservations;
    assert!(single_run >= 1);

    let (source, recorded, heap) = recording_heap();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let heap = heap.clone();
            thread::spawn(move || churn(&heap, 10_000))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = source.stats();
    assert_eq!(stats.live_regions, 0);
    assert!(stats.reservations <= 4 * single_run);
    assert_eq!(recorded.teardowns.load(Ordering::SeqCst), 4);
    assert_eq!(recorded.live_objects.load(Ordering::SeqCst), 0);
    assert_eq!(
        recorded.released_regions.load(Ordering::SeqCst),
        stats.reservations
    );
    assert_eq!(heap.stats().threads, 0);
}

#[test]
fn test_cross_thread_free() {
    let (source, recorded, heap) = recording_heap();
    let (tx, rx) = mpsc::channel::<Vec<usize>>();

    let producer = {
        let heap = heap.clone();
        thread::spawn(move || {
            for _ in 0..20 {
                let batch = (0..100)
                    .map(|_| heap.allocate(48).unwrap().as_ptr() as usize)
                    .collect();
                tx.send(batch).unwrap();
            }
        })
    };
    let consumer = {
        let heap = heap.clone();
        thread::spawn(move || {
            let mut freed = 0;
            for batch in rx {
                for addr in batch {
                    unsafe { heap.deallocate(addr as *mut u8) };
                    freed += 1;
                }
            }
            freed
        })
    };

    producer.join().unwrap();
    assert_eq!(consumer.join().unwrap(), 2_000);

    // The producer may have exited before all of its objects were freed;
    // whatever it left behind was released by the last free.
    assert_eq!(source.stats().live_regions, 0);
    assert_eq!(recorded.teardowns.load(Ordering::SeqCst), 1);
}

#[test]
fn test_leaked_objects_are_reported_and_stay_valid() {
    let (source, recorded, heap) = recording_heap();
    let leaked = {
        let heap = heap.clone();
        thread::spawn(move || {
            let p = heap.allocate(200).unwrap();
            unsafe { p.as_ptr().write_bytes(0x5A, 200) };
            let q = heap.allocate(200).unwrap();
            unsafe { heap.deallocate(q.as_ptr()) };
            p.as_ptr() as usize
        })
        .join()
        .unwrap()
    };

    assert_eq!(recorded.teardowns.load(Ordering::SeqCst), 1);
    assert_eq!(recorded.live_objects.load(Ordering::SeqCst), 1);
    assert_eq!(source.stats().live_regions, 1);

    let bytes = unsafe { core::slice::from_raw_parts(leaked as *const u8, 200) };
    assert!(bytes.iter().all(|&b| b == 0x5A));
    assert_eq!(heap.usable_size(leaked as *const u8), Some(208));

    unsafe { heap.deallocate(leaked as *mut u8) };
    assert_eq!(source.stats().live_regions, 0);
    assert_eq!(heap.usable_size(leaked as *const u8), None);
}

#[test]
fn test_teardown_then_allocate_again() {
    let (source, recorded, heap) = recording_heap();
    let p = heap.allocate(64).unwrap();
    unsafe { heap.deallocate(p.as_ptr()) };
    assert!(heap.teardown_current_thread().unwrap().is_clean());
    assert_eq!(source.stats().live_regions, 0);

    let q = heap.allocate(64).unwrap();
    assert_eq!(heap.stats().threads, 1);
    unsafe { heap.deallocate(q.as_ptr()) };
    heap.teardown_current_thread();
    assert_eq!(recorded.teardowns.load(Ordering::SeqCst), 2);
    assert_eq!(source.stats().live_regions, 0);
}
