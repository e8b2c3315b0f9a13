fn main() {
    let ptr = tcache_alloc::allocate(14).unwrap();
    unsafe {
        ptr.as_ptr().copy_from(b"Hello, World!\n".as_ptr(), 14);
        let greeting = core::slice::from_raw_parts(ptr.as_ptr(), 14);
        print!("{}", String::from_utf8_lossy(greeting));
        tcache_alloc::deallocate(ptr.as_ptr());
    }
}
