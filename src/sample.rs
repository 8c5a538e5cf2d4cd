//! Poisson sampling of allocation requests.
//!
//! Every allocated byte is selected independently with probability
//! `1 / sample_period`; equivalently, the gap between two selected bytes
//! follows an Exponential distribution with mean `sample_period` bytes.
//! Each thread tracks that gap as a countdown, so the per-request decision
//! on the allocation hot path is a single subtraction ([`sample_request`]),
//! and only the rare positive decision pays for a fresh Exponential draw
//! ([`sample_request_reset`]).

use std::env;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::hint::unlikely;

/// Attempt to sample roughly every 32 MB of allocated bytes by default.
pub const DEFAULT_SAMPLE_PERIOD: f64 = (1u64 << 25) as f64;

/// Fetch the runtime-defined allocation sample period from this
/// environment variable.
pub const SAMPLE_PERIOD_ENV_VAR: &str = "POIREAU_SAMPLE_PERIOD_BYTES";

/// Define this environment variable to silence the warning printed when
/// the sample period fails to parse.
pub const QUIET_ENV_VAR: &str = "POIREAU_QUIET";

// f64 bits. Written once at load time, read with relaxed loads after.
static SAMPLE_PERIOD: AtomicU64 = AtomicU64::new(DEFAULT_SAMPLE_PERIOD.to_bits());

/// Per-thread sampler state: the xoshiro256+ words and the countdown of
/// bytes until the next sample.
///
/// Zero-initialized at thread start. The all-zero PRNG state doubles as
/// the "needs seeding" sentinel; the uniform slow path seeds it from OS
/// entropy the first time the thread draws.
pub struct SampleState {
    s: [u64; 4],
    bytes_until_next_sample: u64,
}

impl SampleState {
    pub const fn new() -> Self {
        SampleState {
            s: [0; 4],
            bytes_until_next_sample: 0,
        }
    }
}

impl Default for SampleState {
    fn default() -> Self {
        Self::new()
    }
}

fn sample_period() -> f64 {
    f64::from_bits(SAMPLE_PERIOD.load(Ordering::Relaxed))
}

/// Reads the sample period override from the environment.
///
/// Must run from the library constructor, before the first allocation is
/// observed: environment access may itself allocate and is not
/// async-signal-safe, while allocation calls can arrive from signal
/// handlers.
pub fn initialize_sample_period() {
    let Some(raw) = env::var_os(SAMPLE_PERIOD_ENV_VAR) else {
        return;
    };

    let period = match raw.to_str().and_then(parse_sample_period) {
        Some(period) => period,
        None => {
            if env::var_os(QUIET_ENV_VAR).is_none() {
                eprintln!(
                    "libpoireau failed to parse {}={}. defaulting to {}. \
                     Define {} to silence this warning.",
                    SAMPLE_PERIOD_ENV_VAR,
                    raw.to_string_lossy(),
                    DEFAULT_SAMPLE_PERIOD,
                    QUIET_ENV_VAR
                );
            }
            DEFAULT_SAMPLE_PERIOD
        }
    };

    SAMPLE_PERIOD.store(period.to_bits(), Ordering::Relaxed);
}

/// Accepts only a positive, finite period.
fn parse_sample_period(raw: &str) -> Option<f64> {
    let period: f64 = raw.parse().ok()?;
    if period <= 0.0 || !period.is_finite() {
        return None;
    }

    Some(period)
}

/// One xoshiro256+ step, keeping only the top 52 bits: that is all a
/// double's significand holds, and the low bits of the `+` variant are
/// the least uniform.
#[inline]
fn xoshiro_next(s: &mut [u64; 4]) -> u64 {
    const SIGNIFICAND_BITS: u32 = 52;
    const SHIFT: u32 = 64 - SIGNIFICAND_BITS;

    let result = s[0].wrapping_add(s[3]);
    let t = s[1] << 17;

    s[2] ^= s[0];
    s[3] ^= s[1];
    s[1] ^= s[2];
    s[0] ^= s[3];

    s[2] ^= t;
    s[3] = s[3].rotate_left(45);

    result >> SHIFT
}

/// Returns whether the state was zero-filled and had to be seeded.
#[cold]
fn maybe_initialize_xoshiro(state: &mut SampleState) -> bool {
    if state.s.iter().any(|&word| word != 0) {
        return false;
    }

    let mut seed = [0u8; 32];
    getrandom::getrandom(&mut seed).expect("libpoireau: failed to read OS entropy");
    for (word, chunk) in state.s.iter_mut().zip(seed.chunks_exact(8)) {
        *word = u64::from_ne_bytes(chunk.try_into().unwrap());
    }

    true
}

#[cold]
#[inline(never)]
fn sample_uniform_slow_path(state: &mut SampleState, newly_initialized: &mut bool) -> u64 {
    loop {
        // An all-zero state can only mean this thread has not seeded yet.
        if maybe_initialize_xoshiro(state) {
            *newly_initialized = true;
        }

        let bits = xoshiro_next(&mut state.s);
        if bits != 0 {
            return bits;
        }
    }
}

/// Returns a pseudorandom value from U(0, 1].
///
/// Sets `newly_initialized` exactly when this call seeded the thread's
/// PRNG from the OS entropy source.
pub fn sample_uniform(state: &mut SampleState, newly_initialized: &mut bool) -> f64 {
    let mut bits = xoshiro_next(&mut state.s);
    if unlikely(bits == 0) {
        bits = sample_uniform_slow_path(state, newly_initialized);
    }

    // OR the bits under the exponent of 1.0 for a double in [1.0, 2.0),
    // then shift down. `bits` is never zero, so the log of the result is
    // always finite.
    f64::from_bits(1.0f64.to_bits() | bits) - 1.0
}

fn sample_exponential(state: &mut SampleState, mean: f64, newly_initialized: &mut bool) -> f64 {
    -mean * sample_uniform(state, newly_initialized).ln()
}

/// Determines whether this allocation request should be sampled.
///
/// Subtracts the request from the countdown; the request is selected when
/// it meets or exceeds the countdown it started with. The subtraction
/// wraps: [`sample_request_reset`] must run after every `true` and
/// replaces the countdown with a fresh draw.
#[inline(always)]
pub fn sample_request(state: &mut SampleState, request: usize) -> bool {
    let current = state.bytes_until_next_sample;

    state.bytes_until_next_sample = current.wrapping_sub(request as u64);
    request as u64 >= current
}

/// Re-arms the countdown after [`sample_request`] returned true.
///
/// Returns whether the caller must re-run the sampling decision against
/// the fresh countdown instead of sampling the current request: when the
/// draw seeded this thread's PRNG, the positive decision was made against
/// the zero placeholder countdown, and honoring it would sample the first
/// allocation of every thread.
#[cold]
#[inline(never)]
pub fn sample_request_reset(state: &mut SampleState) -> bool {
    let period = sample_period();

    loop {
        let mut newly_initialized = false;
        let gap = sample_exponential(state, period, &mut newly_initialized);

        state.bytes_until_next_sample = gap as u64;
        if newly_initialized {
            return true;
        }

        if state.bytes_until_next_sample != 0 {
            return false;
        }
    }
}
