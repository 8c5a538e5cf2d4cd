//! Companion crate to [`poireau`].  This crate compiles into a dynamic
//! library that can be loaded via `LD_PRELOAD` to supplant the C library's
//! `malloc`, `calloc`, `realloc`, and `free` in a target process, diverting
//! a Poisson-sampled subset of allocations to poireau's tracking allocator
//! and its `libpoireau:*` USDT probes.

use libc::{c_void, size_t};

// Runs before the target's `main`: the sample period has to settle before
// the first allocation is observed, because reading it from the
// environment allocates and is not async-signal-safe.
#[used]
#[link_section = ".init_array"]
static INITIALIZE_SAMPLE_PERIOD: extern "C" fn() = {
    extern "C" fn initialize_sample_period() {
        poireau::sample::initialize_sample_period();
    }
    initialize_sample_period
};

/// When this library is loaded with `LD_PRELOAD`, this `malloc`
/// implementation supplants the C library's and routes each request
/// through the poireau sampler.
///
/// # Safety
///
/// Same contract as the C `malloc` it replaces.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    poireau::shim::malloc(size)
}

/// Replacement `calloc`, installed alongside [`malloc`].
///
/// # Safety
///
/// Same contract as the C `calloc` it replaces.
#[no_mangle]
pub unsafe extern "C" fn calloc(num: size_t, size: size_t) -> *mut c_void {
    poireau::shim::calloc(num, size)
}

/// Replacement `realloc`, installed alongside [`malloc`].
///
/// # Safety
///
/// Same contract as the C `realloc` it replaces.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    poireau::shim::realloc(ptr, size)
}

/// Replacement `free`, installed alongside [`malloc`].
///
/// # Safety
///
/// Same contract as the C `free` it replaces.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    poireau::shim::free(ptr)
}
