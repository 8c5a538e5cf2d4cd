//! `poireau` samples heap allocations in a target process and announces the
//! sampled subset through USDT tracepoints, so leaks and long-lived heap
//! growth can be diagnosed in production without recompiling the target and
//! without replacing its primary allocator.
//!
//! The library interposes on `malloc`, `calloc`, `realloc`, and `free`. For
//! each request, a per-thread Poisson sampler decides in one subtraction
//! whether to divert the allocation: each allocated byte is selected
//! independently with probability `1 / period`, so the samples are unbiased
//! by allocation size or call site, and the expected overhead is a few
//! instructions per call. Sampled allocations are served from dedicated
//! anonymous mappings by a tracking allocator that can recognize its own
//! pointers in constant time, which lets the matching `free` or `realloc`
//! emit a probe carrying the same allocation id.
//!
//! ## Interposing on a target
//!
//! The companion `lib_poireau` crate builds the preloadable library:
//!
//! ```bash
//! LD_PRELOAD=libpoireau.so ./my_program
//! ```
//!
//! ## Observing the probe stream
//!
//! Sampled events surface as `libpoireau:*` USDT probes: `malloc`,
//! `calloc`, `calloc_overflow`, `realloc`, `realloc_from_tracked`,
//! `realloc_to_regular`, `free`, and `mmap_failed`. Any USDT-aware tracer
//! works, e.g.:
//!
//! ```bash
//! bpftrace -e 'usdt:./libpoireau.so:libpoireau:malloc
//!     { printf("malloc id=%d size=%d\n", arg0, arg2); }' \
//!     -c 'env LD_PRELOAD=./libpoireau.so ./my_program'
//! ```
//!
//! An allocation that shows up in the `malloc`/`calloc`/`realloc*` stream
//! with no matching `free`/`realloc*` for its id is still live; sampled
//! live objects stand in, with known sampling rate, for the population of
//! all live objects.
//!
//! ## Configuration
//!
//! `POIREAU_SAMPLE_PERIOD_BYTES` sets the expected number of allocated
//! bytes between samples (default `33554432`, one sample per 32 MB).
//! Invalid values fall back to the default with a warning on stderr;
//! define `POIREAU_QUIET` to silence it.
//!
//! Linux on 64-bit, 4 KiB-page hardware only: the implementation leans on
//! `mmap` with `MAP_FIXED_NOREPLACE`, `process_vm_readv`, and
//! `dlsym(RTLD_NEXT, ...)`.

pub mod sample;
pub mod shim;
pub mod tracked_alloc;

mod hint;
mod probes;
