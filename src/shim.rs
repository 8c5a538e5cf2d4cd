//! Interposed entry points for the C allocation interface.
//!
//! Each entry point asks the sampler whether to divert the request; the
//! overwhelmingly common answer is no, and the call tail-calls the
//! underlying allocator through a cached function pointer. Sampled
//! requests take a cold path through the tracking allocator and announce
//! themselves on a probe. `free` and `realloc` additionally probe the
//! tracking table so pointers can find their way home regardless of how
//! the sampler feels about the current request.
//!
//! The underlying functions are discovered lazily with
//! `dlsym(RTLD_NEXT, ...)`. glibc's dlsym may itself allocate, so the
//! discovery windows are bridged by dummy paths: while the base pointers
//! are still null, allocation calls on the discovering thread return
//! null (and frees do nothing), which dlsym's internal fallback handles.

use std::cell::{Cell, RefCell};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use libc::{c_char, c_void, size_t};

use crate::hint::{likely, unlikely};
use crate::probes;
use crate::sample::{self, SampleState};
use crate::tracked_alloc;

const PAGE_SIZE: usize = 4096;

type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);

// Null means "not discovered yet" and routes the caller to the dummy
// paths below.
static BASE_MALLOC: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
static BASE_CALLOC: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
static BASE_REALLOC: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
static BASE_FREE: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());

static DISCOVERY_DONE: AtomicBool = AtomicBool::new(false);

thread_local! {
    static SAMPLE_STATE: RefCell<SampleState> = const { RefCell::new(SampleState::new()) };

    // Set while this thread runs symbol discovery.
    static DISCOVERY_STARTED: Cell<bool> = const { Cell::new(false) };
}

/// Resolves the underlying allocator and fills the base pointers.
///
/// Returns whether the pointers are usable. The lookups run in
/// free/realloc/malloc/calloc order: an allocation made while discovery
/// is in flight must never reach the base malloc before the base free is
/// wired up, or its eventual free would be dispatched to the wrong
/// allocator. The whole function is idempotent, so concurrent threads may
/// run it back to back; the thread-local started flag only breaks the
/// recursion when dlsym re-enters the shim on the discovering thread.
#[cold]
#[inline(never)]
unsafe fn init_shim() -> bool {
    if DISCOVERY_DONE.load(Ordering::Acquire) {
        return true;
    }

    let started = DISCOVERY_STARTED
        .try_with(|started| started.replace(true))
        .unwrap_or(true);
    if started {
        return false;
    }

    BASE_FREE.store(
        libc::dlsym(libc::RTLD_NEXT, b"free\0".as_ptr() as *const c_char),
        Ordering::Release,
    );
    BASE_REALLOC.store(
        libc::dlsym(libc::RTLD_NEXT, b"realloc\0".as_ptr() as *const c_char),
        Ordering::Release,
    );
    BASE_MALLOC.store(
        libc::dlsym(libc::RTLD_NEXT, b"malloc\0".as_ptr() as *const c_char),
        Ordering::Release,
    );
    BASE_CALLOC.store(
        libc::dlsym(libc::RTLD_NEXT, b"calloc\0".as_ptr() as *const c_char),
        Ordering::Release,
    );

    if BASE_FREE.load(Ordering::Relaxed).is_null()
        || BASE_REALLOC.load(Ordering::Relaxed).is_null()
        || BASE_MALLOC.load(Ordering::Relaxed).is_null()
        || BASE_CALLOC.load(Ordering::Relaxed).is_null()
    {
        panic!("libpoireau: couldn't find the underlying allocator");
    }

    DISCOVERY_DONE.store(true, Ordering::Release);
    true
}

unsafe fn base_malloc(request: size_t) -> *mut c_void {
    let base = BASE_MALLOC.load(Ordering::Acquire);
    if likely(!base.is_null()) {
        return mem::transmute::<*mut c_void, MallocFn>(base)(request);
    }

    dummy_malloc(request)
}

unsafe fn base_calloc(num: size_t, size: size_t) -> *mut c_void {
    let base = BASE_CALLOC.load(Ordering::Acquire);
    if likely(!base.is_null()) {
        return mem::transmute::<*mut c_void, CallocFn>(base)(num, size);
    }

    dummy_calloc(num, size)
}

unsafe fn base_realloc(ptr: *mut c_void, request: size_t) -> *mut c_void {
    let base = BASE_REALLOC.load(Ordering::Acquire);
    if likely(!base.is_null()) {
        return mem::transmute::<*mut c_void, ReallocFn>(base)(ptr, request);
    }

    dummy_realloc(ptr, request)
}

unsafe fn base_free(ptr: *mut c_void) {
    let base = BASE_FREE.load(Ordering::Acquire);
    if likely(!base.is_null()) {
        return mem::transmute::<*mut c_void, FreeFn>(base)(ptr);
    }

    dummy_free(ptr)
}

// Once discovery completes, the dummies re-enter the full entry points:
// the base pointers now lead to the real implementations.

#[cold]
unsafe fn dummy_malloc(request: size_t) -> *mut c_void {
    if init_shim() {
        return malloc(request);
    }

    ptr::null_mut()
}

#[cold]
unsafe fn dummy_calloc(num: size_t, size: size_t) -> *mut c_void {
    if init_shim() {
        return calloc(num, size);
    }

    ptr::null_mut()
}

#[cold]
unsafe fn dummy_realloc(ptr: *mut c_void, request: size_t) -> *mut c_void {
    if init_shim() {
        return realloc(ptr, request);
    }

    ptr::null_mut()
}

#[cold]
unsafe fn dummy_free(ptr: *mut c_void) {
    if init_shim() {
        free(ptr);
    }
}

fn request_is_sampled(request: size_t) -> bool {
    SAMPLE_STATE
        .try_with(|state| sample::sample_request(&mut state.borrow_mut(), request))
        // The thread is tearing down its TLS: stop sampling, keep serving.
        .unwrap_or(false)
}

fn sample_request_reset() -> bool {
    SAMPLE_STATE
        .try_with(|state| sample::sample_request_reset(&mut state.borrow_mut()))
        .unwrap_or(false)
}

/// Replacement `malloc`.
///
/// # Safety
///
/// Same contract as the C `malloc` this supplants.
pub unsafe fn malloc(request: size_t) -> *mut c_void {
    if unlikely(request_is_sampled(request)) {
        return sampled_malloc(request);
    }

    base_malloc(request)
}

#[cold]
#[inline(never)]
unsafe fn sampled_malloc(request: size_t) -> *mut c_void {
    if sample_request_reset() {
        return malloc(request);
    }

    let (ret, id) = tracked_alloc::get(request);
    probes::malloc(id, ret, request);
    ret as *mut c_void
}

/// Replacement `calloc`.
///
/// # Safety
///
/// Same contract as the C `calloc` this supplants.
pub unsafe fn calloc(num: size_t, size: size_t) -> *mut c_void {
    match num.checked_mul(size) {
        Some(request) => {
            if unlikely(request_is_sampled(request)) {
                return sampled_calloc(num, size);
            }

            base_calloc(1, request)
        }
        // The cold path owns overflow reporting.
        None => sampled_calloc(num, size),
    }
}

#[cold]
#[inline(never)]
unsafe fn sampled_calloc(num: size_t, size: size_t) -> *mut c_void {
    if sample_request_reset() {
        return calloc(num, size);
    }

    let Some(request) = num.checked_mul(size) else {
        probes::calloc_overflow(num, size);
        return ptr::null_mut();
    };

    // The tracking allocator's mappings come back zero-filled from the
    // kernel, so there is nothing left to clear.
    let (ret, id) = tracked_alloc::get(request);
    probes::calloc(num, size, id, ret, request);
    ret as *mut c_void
}

/// Replacement `realloc`.
///
/// # Safety
///
/// Same contract as the C `realloc` this supplants.
pub unsafe fn realloc(ptr: *mut c_void, request: size_t) -> *mut c_void {
    if unlikely(request_is_sampled(request)) {
        return sampled_realloc(ptr, request);
    }

    if unlikely(tracked_alloc::is_tracked(ptr as *const u8)) {
        return sampled_realloc_to_regular(ptr, request);
    }

    base_realloc(ptr, request)
}

#[cold]
#[inline(never)]
unsafe fn sampled_realloc(ptr: *mut c_void, request: size_t) -> *mut c_void {
    if sample_request_reset() {
        return realloc(ptr, request);
    }

    if ptr.is_null() {
        return sampled_malloc(request);
    }

    if tracked_alloc::is_tracked(ptr as *const u8) {
        return sampled_realloc_from_tracked(ptr as *mut u8, request);
    }

    // The base allocator's usable-size report is an introspection aid
    // that can overestimate what is actually mapped (glibc's malloc
    // debugger makes it outright garbage), so it is forwarded as probe
    // metadata only; the copy below trusts the kernel instead.
    let old_size = libc::malloc_usable_size(ptr);
    let (ret, id) = tracked_alloc::get(request);

    probes::realloc(ptr, old_size, id, ret, request);
    if ret.is_null() {
        return ptr::null_mut();
    }

    safe_copy(ret, ptr as *const u8, request);
    base_free(ptr);
    ret as *mut c_void
}

#[cold]
#[inline(never)]
unsafe fn sampled_realloc_from_tracked(ptr: *mut u8, request: size_t) -> *mut c_void {
    let old = tracked_alloc::info(ptr);
    let (ret, new_id) = tracked_alloc::get(request);

    probes::realloc_from_tracked(old.id, ptr, old.size, new_id, ret, request);
    if ret.is_null() {
        return ptr::null_mut();
    }

    ptr::copy_nonoverlapping(ptr as *const u8, ret, old.size.min(request));
    tracked_alloc::put(ptr);
    ret as *mut c_void
}

#[cold]
#[inline(never)]
unsafe fn sampled_realloc_to_regular(ptr: *mut c_void, request: size_t) -> *mut c_void {
    let old = tracked_alloc::info(ptr as *const u8);
    let ret = malloc(request);

    probes::realloc_to_regular(old.id, ptr, old.size, ret, request);
    if ret.is_null() {
        return ret;
    }

    ptr::copy_nonoverlapping(ptr as *const u8, ret as *mut u8, old.size.min(request));
    tracked_alloc::put(ptr as *mut u8);
    ret
}

/// Replacement `free`.
///
/// # Safety
///
/// Same contract as the C `free` this supplants.
pub unsafe fn free(ptr: *mut c_void) {
    if unlikely(tracked_alloc::is_tracked(ptr as *const u8)) {
        return sampled_free(ptr as *mut u8);
    }

    base_free(ptr)
}

#[cold]
#[inline(never)]
unsafe fn sampled_free(ptr: *mut u8) {
    let info = tracked_alloc::info(ptr);

    probes::free(info.id, ptr, info.size);
    tracked_alloc::put(ptr);
}

unsafe fn safe_copy_one_chunk(
    self_pid: libc::pid_t,
    dst: *mut u8,
    src: *const u8,
    request: usize,
) -> isize {
    let to = libc::iovec {
        iov_base: dst as *mut c_void,
        iov_len: request,
    };
    let from = libc::iovec {
        iov_base: src as *mut c_void,
        iov_len: request,
    };

    libc::process_vm_readv(self_pid, &to, 1, &from, 1, 0)
}

/// Copies `request` bytes into `dst` with `process_vm_readv` on our own
/// process.
///
/// `dst` is fully writable, but `src` may stop being readable partway
/// through: the syscall reports partial progress instead of faulting.
/// Try one large copy; consume whatever it managed; then align the
/// source to a page boundary and copy one page at a time, stopping at
/// the first short chunk. Anything left uncopied in `dst` stays
/// zero-filled.
unsafe fn safe_copy(dst: *mut u8, src: *const u8, request: usize) {
    let self_pid = libc::getpid();

    let r = safe_copy_one_chunk(self_pid, dst, src, request);
    if r == request as isize {
        return;
    }

    let (mut dst, mut src, mut request) = (dst, src, request);
    if r >= 0 {
        dst = dst.add(r as usize);
        src = src.add(r as usize);
        request -= r as usize;
    }

    let max_initial_copy = PAGE_SIZE - (src as usize % PAGE_SIZE);
    let r = safe_copy_one_chunk(self_pid, dst, src, max_initial_copy);
    if r != max_initial_copy as isize {
        return;
    }

    let mut copied = max_initial_copy;
    while copied < request {
        debug_assert_eq!((src as usize + copied) % PAGE_SIZE, 0);

        let copy_size = PAGE_SIZE.min(request - copied);
        let r = safe_copy_one_chunk(self_pid, dst.add(copied), src.add(copied), copy_size);
        if r != copy_size as isize {
            break;
        }

        copied += copy_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::tests::{set_sample_period, PERIOD_LOCK};
    use crate::sample::DEFAULT_SAMPLE_PERIOD;
    use crate::tracked_alloc::{is_tracked, TRACKING_ALIGNMENT};

    // Serializes the allocation-path tests around the process-wide
    // sample period, restoring the default afterwards.
    fn with_period<R>(period: f64, run: impl FnOnce() -> R) -> R {
        let _guard = PERIOD_LOCK.lock().unwrap();
        set_sample_period(period);
        let ret = run();
        set_sample_period(DEFAULT_SAMPLE_PERIOD);
        ret
    }

    // Burns this thread's pending countdown so it gets re-drawn from the
    // current period.
    unsafe fn drain_countdown() {
        let p = malloc(1);
        free(p);
    }

    #[test]
    fn unsampled_requests_reach_the_base_allocator() {
        with_period(1e18, || unsafe {
            drain_countdown();

            let p = malloc(64) as *mut u8;
            assert!(!p.is_null());
            assert!(!is_tracked(p));

            for i in 0..64 {
                p.add(i).write(i as u8);
            }
            let q = realloc(p as *mut c_void, 4_096) as *mut u8;
            assert!(!q.is_null());
            assert!(!is_tracked(q));
            for i in 0..64 {
                assert_eq!(q.add(i).read(), i as u8);
            }
            free(q as *mut c_void);

            let z = calloc(16, 16) as *mut u8;
            assert!(!z.is_null());
            assert!(!is_tracked(z));
            assert!((0..256).all(|i| z.add(i).read() == 0));
            free(z as *mut c_void);
        });
    }

    #[test]
    fn free_of_null_is_a_no_op() {
        with_period(1e18, || unsafe {
            free(ptr::null_mut());
        });
    }

    #[test]
    fn sampled_allocations_are_tracked_and_released() {
        with_period(1.0, || unsafe {
            drain_countdown();

            let p = malloc(1_024) as *mut u8;
            assert!(!p.is_null());
            assert!(is_tracked(p));
            assert_eq!(p as usize % TRACKING_ALIGNMENT, 0);

            p.write(0xfe);
            p.add(1_023).write(0xef);

            free(p as *mut c_void);
            assert!(!is_tracked(p));
        });
    }

    #[test]
    fn sampled_calloc_is_tracked_and_zeroed() {
        with_period(1.0, || unsafe {
            drain_countdown();

            let p = calloc(256, 4) as *mut u8;
            assert!(!p.is_null());
            assert!(is_tracked(p));
            assert!((0..1_024).all(|i| p.add(i).read() == 0));
            free(p as *mut c_void);
        });
    }

    #[test]
    fn calloc_overflow_returns_null() {
        with_period(1.0, || unsafe {
            assert!(calloc(usize::MAX, 2).is_null());
        });
        with_period(1e18, || unsafe {
            assert!(calloc(usize::MAX, 2).is_null());
        });
    }

    #[test]
    fn realloc_of_null_behaves_like_malloc() {
        with_period(1.0, || unsafe {
            drain_countdown();

            let p = realloc(ptr::null_mut(), 512) as *mut u8;
            assert!(!p.is_null());
            assert!(is_tracked(p));
            free(p as *mut c_void);
        });
    }

    #[test]
    fn realloc_keeps_tracked_contents() {
        with_period(1.0, || unsafe {
            drain_countdown();

            let p = malloc(1_024) as *mut u8;
            assert!(is_tracked(p));
            for i in 0..1_024 {
                p.add(i).write((i % 251) as u8);
            }

            let q = realloc(p as *mut c_void, 4_096) as *mut u8;
            assert!(is_tracked(q));
            assert!(!is_tracked(p));
            for i in 0..1_024 {
                assert_eq!(q.add(i).read(), (i % 251) as u8);
            }

            free(q as *mut c_void);
        });
    }

    #[test]
    fn realloc_hands_tracked_memory_back_to_the_base_allocator() {
        let _guard = PERIOD_LOCK.lock().unwrap();
        unsafe {
            set_sample_period(1.0);
            drain_countdown();

            let p = malloc(64) as *mut u8;
            assert!(is_tracked(p));
            for i in 0..64 {
                p.add(i).write(i as u8);
            }

            // With sampling effectively off, the tracked block migrates
            // back to the base allocator on its next realloc.
            set_sample_period(1e18);
            drain_countdown();

            let q = realloc(p as *mut c_void, 256) as *mut u8;
            assert!(!q.is_null());
            assert!(!is_tracked(q));
            assert!(!is_tracked(p));
            for i in 0..64 {
                assert_eq!(q.add(i).read(), i as u8);
            }
            free(q as *mut c_void);
        }
        set_sample_period(DEFAULT_SAMPLE_PERIOD);
    }

    #[test]
    fn sampled_realloc_copies_from_base_memory() {
        let _guard = PERIOD_LOCK.lock().unwrap();
        unsafe {
            set_sample_period(1e18);
            drain_countdown();

            let p = malloc(512) as *mut u8;
            assert!(!is_tracked(p));
            for i in 0..512 {
                p.add(i).write((i % 127) as u8);
            }

            // Force the next decision positive: the countdown is re-drawn
            // on the way through the cold path.
            set_sample_period(1.0);
            drain_countdown();

            let q = realloc(p as *mut c_void, 512) as *mut u8;
            assert!(is_tracked(q));
            for i in 0..512 {
                assert_eq!(q.add(i).read(), (i % 127) as u8);
            }
            free(q as *mut c_void);
        }
        set_sample_period(DEFAULT_SAMPLE_PERIOD);
    }

    #[test]
    fn sampling_rate_matches_the_period() {
        const ITERATIONS: usize = 50_000;
        const REQUEST: usize = 64;
        const PERIOD: f64 = 4_096.0;

        let sampled = with_period(PERIOD, || unsafe {
            drain_countdown();

            let mut sampled = 0usize;
            for _ in 0..ITERATIONS {
                let p = malloc(REQUEST) as *mut u8;
                assert!(!p.is_null());
                if is_tracked(p) {
                    sampled += 1;
                }
                free(p as *mut c_void);
            }
            sampled
        });

        // Poisson with mean volume / period; allow 5 sigma either way.
        let expected = ITERATIONS as f64 * REQUEST as f64 / PERIOD;
        let tolerance = 5.0 * expected.sqrt();
        assert!(
            (sampled as f64 - expected).abs() < tolerance,
            "sampled {} allocations, expected {} +/- {}",
            sampled,
            expected,
            tolerance
        );
    }

    #[test]
    fn enormous_period_never_samples() {
        with_period(1e15, || unsafe {
            drain_countdown();

            for _ in 0..10_000 {
                let p = malloc(64) as *mut u8;
                assert!(!is_tracked(p));
                free(p as *mut c_void);
            }
        });
    }

    #[test]
    fn fresh_threads_do_not_oversample_their_first_allocation() {
        with_period(1e15, || {
            let handles: Vec<_> = (0..32)
                .map(|_| {
                    std::thread::spawn(|| unsafe {
                        let p = malloc(64) as *mut u8;
                        let tracked = is_tracked(p);
                        free(p as *mut c_void);
                        tracked
                    })
                })
                .collect();

            let sampled = handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|&tracked| tracked)
                .count();
            assert_eq!(sampled, 0, "first allocations were oversampled");
        });
    }

    #[test]
    fn safe_copy_stops_at_unmapped_source_pages() {
        unsafe {
            // Two readable pages followed by an unmapped range.
            let src = libc::mmap(
                ptr::null_mut(),
                2 * PAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            ) as *mut u8;
            assert_ne!(src as *mut c_void, libc::MAP_FAILED);
            for i in 0..2 * PAGE_SIZE {
                src.add(i).write((i % 83) as u8);
            }
            let r = libc::munmap(src.add(PAGE_SIZE) as *mut c_void, PAGE_SIZE);
            assert_eq!(r, 0);

            let mut dst = vec![0u8; 2 * PAGE_SIZE];

            // Ask for more than remains readable: the copy must deliver
            // the readable prefix and leave the rest untouched.
            safe_copy(dst.as_mut_ptr(), src.add(16), 2 * PAGE_SIZE - 16);
            for i in 0..PAGE_SIZE - 16 {
                assert_eq!(dst[i], ((i + 16) % 83) as u8);
            }
            assert!(dst[PAGE_SIZE - 16..].iter().all(|&b| b == 0));

            let r = libc::munmap(src as *mut c_void, PAGE_SIZE);
            assert_eq!(r, 0);
        }
    }

    #[test]
    fn safe_copy_handles_full_and_tiny_requests() {
        unsafe {
            let src = [7u8; 100];
            let mut dst = [0u8; 100];

            safe_copy(dst.as_mut_ptr(), src.as_ptr(), 100);
            assert_eq!(src, dst);

            safe_copy(dst.as_mut_ptr(), src.as_ptr(), 0);
        }
    }
}
