use crate::sluice::server::PipePool;

#[test]
fn test_acquire_release_recycles() {
    let mut pool = PipePool::new();
    let p = pool.acquire().unwrap();
    let fd = p.read_fd();
    pool.release(p);
    assert_eq!(pool.idle_len(), 1);
    // a clean pipe keeps its kernel object
    let p2 = pool.acquire().unwrap();
    assert_eq!(p2.read_fd(), fd);
    pool.release(p2);
}

#[test]
fn test_loaded_release_discards_descriptors() {
    let mut pool = PipePool::new();
    let mut p = pool.acquire().unwrap();
    // pretend the peer never drained these bytes
    p.add_load(17);
    pool.release(p);
    // the recycled entry must come back empty and usable
    let p2 = pool.acquire().unwrap();
    assert_eq!(p2.load(), 0);
    let rc = unsafe { libc::write(p2.write_fd(), b"ok".as_ptr() as *const libc::c_void, 2) };
    assert_eq!(rc, 2);
    pool.release(p2);
}

#[test]
fn test_purge_empties_pool() {
    let mut pool = PipePool::new();
    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    pool.release(a);
    pool.release(b);
    assert_eq!(pool.idle_len(), 2);
    pool.purge();
    assert_eq!(pool.idle_len(), 0);
}
