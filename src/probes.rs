//! USDT tracepoints under the `libpoireau` provider.
//!
//! Sampled events are broadcast as static probes for whatever tracer is
//! attached; nothing is ever read back. Out-of-process consumers match
//! arguments by position, so the tuples are part of the interface.

use libc::c_void;
use probe::probe;

#[inline(never)]
#[allow(unused_variables)]
pub fn malloc(id: u64, ptr: *mut u8, size: usize) {
    probe!(libpoireau, malloc, id, ptr as usize, size);
}

#[inline(never)]
#[allow(unused_variables)]
pub fn calloc(num: usize, size: usize, id: u64, ptr: *mut u8, rounded_size: usize) {
    probe!(libpoireau, calloc, num, size, id, ptr as usize, rounded_size);
}

#[inline(never)]
#[allow(unused_variables)]
pub fn calloc_overflow(num: usize, size: usize) {
    probe!(libpoireau, calloc_overflow, num, size);
}

#[inline(never)]
#[allow(unused_variables)]
pub fn realloc(old_ptr: *mut c_void, old_size: usize, new_id: u64, new_ptr: *mut u8, new_size: usize) {
    probe!(
        libpoireau,
        realloc,
        old_ptr as usize,
        old_size,
        new_id,
        new_ptr as usize,
        new_size
    );
}

#[inline(never)]
#[allow(unused_variables)]
pub fn realloc_from_tracked(
    old_id: u64,
    old_ptr: *mut u8,
    old_size: usize,
    new_id: u64,
    new_ptr: *mut u8,
    new_size: usize,
) {
    probe!(
        libpoireau,
        realloc_from_tracked,
        old_id,
        old_ptr as usize,
        old_size,
        new_id,
        new_ptr as usize,
        new_size
    );
}

#[inline(never)]
#[allow(unused_variables)]
pub fn realloc_to_regular(
    old_id: u64,
    old_ptr: *mut c_void,
    old_size: usize,
    new_ptr: *mut c_void,
    new_size: usize,
) {
    probe!(
        libpoireau,
        realloc_to_regular,
        old_id,
        old_ptr as usize,
        old_size,
        new_ptr as usize,
        new_size
    );
}

#[inline(never)]
#[allow(unused_variables)]
pub fn free(id: u64, ptr: *mut u8, size: usize) {
    probe!(libpoireau, free, id, ptr as usize, size);
}

#[inline(never)]
#[allow(unused_variables)]
pub fn mmap_failed(size: usize, alignment: usize, padded_size: usize, errno: i32) {
    probe!(libpoireau, mmap_failed, size, alignment, padded_size, errno);
}
