//! Deterministic random number generation.
//!
//! RULE: Nothing in the core calls a platform RNG.
//! The only randomness (retry jitter) comes from a seeded stream, so a
//! run with the same config waits the same way every time.

use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;

pub struct JitterRng {
    inner: Pcg64Mcg,
}

impl JitterRng {
    /// Derive a stream from the master seed and a stable stream index.
    /// Different indices give independent streams for the same seed.
    pub fn new(master_seed: u64, stream: u64) -> Self {
        let derived_seed = master_seed ^ stream.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        Self { inner: Pcg64Mcg::seed_from_u64(derived_seed) }
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Roll a float in [-1.0, 1.0).
    pub fn next_signed_unit(&mut self) -> f64 {
        self.next_f64() * 2.0 - 1.0
    }
}
