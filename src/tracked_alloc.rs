//! Tracking allocator for sampled allocations.
//!
//! A sampled allocation must be recognizable again when it comes back
//! through `free` or `realloc`, long after the sampling decision was
//! made. Sampling is rare, so everything is arranged to make the
//! *negative* membership check cheap: each tracked allocation lives in
//! its own anonymous mapping aligned to 1 GiB, and a direct-mapped table
//! over the whole 47-bit address space records, per 1 GiB slot, the base
//! address of the live allocation that starts there. A pointer is tracked
//! iff it is 1 GiB-aligned and its slot holds exactly its address, so
//! [`is_tracked`] rejects almost every pointer without touching the
//! table.

use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use libc::c_void;

use crate::hint::likely;
use crate::probes;

/// Bump this if we ever opt into 5-level page tables.
pub const ADDRESS_SPACE_MAX: usize = 1 << 47;

/// Every tracked allocation is aligned to 1 GiB. A misaligned pointer is
/// definitely not tracked; an aligned one may or may not be.
pub const TRACKING_ALIGNMENT: usize = 1 << 30;

const TABLE_LEN: usize = ADDRESS_SPACE_MAX / TRACKING_ALIGNMENT;

const PAGE_SIZE: usize = 4096;

/// Live metadata for a tracked allocation.
#[derive(Clone, Copy, Debug)]
pub struct AllocInfo {
    pub id: u64,
    pub size: usize,
}

static ALLOC_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

// Parallel arrays let the membership test use simple addressing. Both
// live in zero-initialized demand-paged memory, so the tables cost no
// physical pages until a slot is touched.
#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: AtomicUsize = AtomicUsize::new(0);
static TRACKED_ALLOC_TABLE: [AtomicUsize; TABLE_LEN] = [EMPTY_SLOT; TABLE_LEN];

struct InfoSlot {
    id: AtomicU64,
    size: AtomicUsize,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_INFO: InfoSlot = InfoSlot {
    id: AtomicU64::new(0),
    size: AtomicUsize::new(0),
};
static INFO_TABLE: [InfoSlot; TABLE_LEN] = [EMPTY_INFO; TABLE_LEN];

// Multiplying ids by this constant, modulo the address-space size,
// spreads consecutive allocations across the virtual address space. The
// hint is non-binding, so it cannot affect correctness; it makes address
// reuse rare, which turns most use-after-free accesses into faults.
const MMAP_LOCATION_MOD: usize = 1 << 47;
const MMAP_LOCATION_MULTIPLIER: usize = 17 << 30;

fn mmap_hint(id: u64) -> *mut c_void {
    let hint = (id as usize).wrapping_mul(MMAP_LOCATION_MULTIPLIER) % MMAP_LOCATION_MOD;

    (hint & !(PAGE_SIZE - 1)) as *mut c_void
}

// A zero-byte request still occupies one page: the mapping must exist for
// the entry to have an address, and its release must unmap a nonzero
// range.
fn round_to_pages(size: usize) -> usize {
    (size.max(1) + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

/// Returns a fresh zero-filled mapping of `size` bytes (rounded up to
/// whole pages), aligned to `alignment`, or null on failure.
fn aligned_mmap(id: u64, size: usize, alignment: usize) -> *mut u8 {
    debug_assert!(alignment.is_power_of_two());

    if size > isize::MAX as usize {
        return ptr::null_mut();
    }

    let rounded_size = round_to_pages(size);
    let padded_size = rounded_size + alignment;

    let map = unsafe {
        libc::mmap(
            mmap_hint(id),
            padded_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if map == libc::MAP_FAILED {
        probes::mmap_failed(size, alignment, padded_size, errno());
        return ptr::null_mut();
    }

    let map_begin = map as usize;
    let map_end = map_begin + padded_size;

    // Keep only an aligned chunk of the oversized mapping: unmap the slop
    // before the first aligned boundary and past the rounded size.
    let chunk_begin = (map_begin + alignment) & !(alignment - 1);
    if chunk_begin != map_begin {
        let r = unsafe { libc::munmap(map_begin as *mut c_void, chunk_begin - map_begin) };
        assert!(r == 0, "header slop munmap failed");
    }

    let chunk_end = chunk_begin + rounded_size;
    if chunk_end != map_end {
        let r = unsafe { libc::munmap(chunk_end as *mut c_void, map_end - chunk_end) };
        assert!(r == 0, "trailer slop munmap failed");
    }

    chunk_begin as *mut u8
}

fn aligned_munmap(ptr: *mut u8, size: usize, alignment: usize) {
    let bits = ptr as usize;

    assert!((bits & (alignment - 1)) == 0, "munmap target must be aligned");
    if ptr.is_null() {
        return;
    }

    let r = unsafe { libc::munmap(ptr as *mut c_void, round_to_pages(size)) };
    assert!(r == 0, "release munmap failed");
}

/// Serves a sampled allocation from a fresh anonymous mapping and
/// publishes it in the tracking tables.
///
/// Returns the allocation and its id; an id of 0 means the mapping failed
/// and the pointer is null. The region always comes back zero-filled from
/// the kernel.
pub fn get(request: usize) -> (*mut u8, u64) {
    let id = ALLOC_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let alloc = aligned_mmap(id, request, TRACKING_ALIGNMENT);
    if alloc.is_null() {
        return (ptr::null_mut(), 0);
    }

    // Publish the info before the address: a reader that wins the address
    // comparison must observe a live id and size.
    let index = alloc as usize / TRACKING_ALIGNMENT;
    INFO_TABLE[index].id.store(id, Ordering::Release);
    INFO_TABLE[index].size.store(request, Ordering::Release);
    let prev = TRACKED_ALLOC_TABLE[index].swap(alloc as usize, Ordering::AcqRel);
    assert!(prev == 0, "heap corruption: double or invalid free");

    (alloc, id)
}

/// Looks up the live metadata for a tracked pointer.
///
/// Panics unless `ptr` is the base of a live tracked allocation: anything
/// else here is a double free or an invalid pointer.
pub fn info(ptr: *const u8) -> AllocInfo {
    let index = ptr as usize / TRACKING_ALIGNMENT;
    let expected = TRACKED_ALLOC_TABLE[index].load(Ordering::Acquire);

    assert!(expected == ptr as usize, "heap corruption: double or invalid free");

    AllocInfo {
        id: INFO_TABLE[index].id.load(Ordering::Acquire),
        size: INFO_TABLE[index].size.load(Ordering::Acquire),
    }
}

fn shrink_mapping(ptr: *mut u8, current: usize, desired: usize) {
    let begin = ptr as usize;
    let end = begin + round_to_pages(current);
    let desired_end = begin + round_to_pages(desired);

    if end == desired_end {
        return;
    }

    let r = unsafe { libc::munmap(desired_end as *mut c_void, end - desired_end) };
    assert!(r == 0, "shrink munmap failed");
}

fn grow_mapping(ptr: *mut u8, current: usize, desired: usize) -> bool {
    let begin = ptr as usize;
    let end = begin + round_to_pages(current);
    let desired_end = begin + round_to_pages(desired);

    if end == desired_end {
        return true;
    }

    // Try to extend the current mapping in place. MAP_FIXED_NOREPLACE
    // asks the kernel to fail if the range at `end` is occupied, leaving
    // existing mappings alone. An older kernel may ignore the flag and
    // hand back a different address; undo that mapping and report
    // failure, so no stray mapping is ever left behind.
    let ret = unsafe {
        libc::mmap(
            end as *mut c_void,
            desired_end - end,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
            -1,
            0,
        )
    };
    if ret == libc::MAP_FAILED {
        return false;
    }

    if ret as usize != end {
        let r = unsafe { libc::munmap(ret, desired_end - end) };
        assert!(r == 0, "cleanup growth munmap failed");
        return false;
    }

    true
}

/// Resizes a tracked allocation without moving it: shrinks unmap trailing
/// pages, grows try to extend the mapping in place.
///
/// Returns whether the allocation now holds `request` bytes; on failure
/// it is left untouched.
///
/// # Safety
///
/// `ptr` must be the base of a live tracked allocation; a shrink unmaps
/// its trailing pages, so nothing may hold references into them.
pub unsafe fn resize(ptr: *mut u8, request: usize) -> bool {
    let index = ptr as usize / TRACKING_ALIGNMENT;
    let current = info(ptr);

    if request == current.size {
        return true;
    }

    let resized = if request < current.size {
        shrink_mapping(ptr, current.size, request);
        true
    } else {
        grow_mapping(ptr, current.size, request)
    };

    if resized {
        INFO_TABLE[index].size.store(request, Ordering::Release);
    }

    resized
}

/// Releases a tracked allocation: clears the tables, then returns the
/// mapping to the kernel.
///
/// # Safety
///
/// `ptr` must be the base of a live tracked allocation that nothing will
/// touch again; its whole mapping is returned to the kernel.
pub unsafe fn put(ptr: *mut u8) {
    let index = ptr as usize / TRACKING_ALIGNMENT;
    let prev = TRACKED_ALLOC_TABLE[index].load(Ordering::Acquire);
    let current = info(ptr);

    assert!(prev == ptr as usize, "heap corruption: double or invalid free");
    assert!(current.id != 0, "heap corruption: double or invalid free");

    // Clear the id first: a concurrent reader that still wins the address
    // comparison must already observe the allocation as dead.
    INFO_TABLE[index].id.store(0, Ordering::Release);
    INFO_TABLE[index].size.store(0, Ordering::Release);
    let prev = TRACKED_ALLOC_TABLE[index].swap(0, Ordering::AcqRel);
    assert!(prev == ptr as usize, "heap corruption: double or invalid free");

    // mmap happens before publishing and munmap after clearing, so the
    // kernel's serialization of the address space is the mutual exclusion
    // for slot ownership.
    aligned_munmap(ptr, current.size, TRACKING_ALIGNMENT);
}

/// Constant-time membership test for the `free` fast path.
#[inline(always)]
pub fn is_tracked(ptr: *const u8) -> bool {
    let bits = ptr as usize;

    // Skip even reading the table in the common case.
    if likely(bits % TRACKING_ALIGNMENT != 0) {
        return false;
    }

    if ptr.is_null() {
        return false;
    }

    match TRACKED_ALLOC_TABLE.get(bits / TRACKING_ALIGNMENT) {
        Some(slot) => slot.load(Ordering::Acquire) == bits,
        None => false,
    }
}
