//! This is a very minimal example to show using the MemorySource functions.

use tcache_alloc::{MemorySource, SystemMemorySource};

fn main() {
    let source = SystemMemorySource::new();
    println!("Page size: {}", source.page_size());

    let mut region = source.reserve(8).unwrap();
    println!(
        "Reserved: ({:p}, {}) {:?}",
        region.base(),
        region.len(),
        region.commit_state()
    );

    source.commit(&mut region).unwrap();
    unsafe { region.base().as_ptr().write(42) };
    println!("Committed: {:?}", region.commit_state());

    source.decommit(&mut region);
    println!("Decommitted: {:?}", region.commit_state());

    source.release(region);
    println!("Live regions after release: {}", source.live_regions());
}
