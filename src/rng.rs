//! The randomness stream each worker owns.

use rand::{Rng, RngCore, SeedableRng};
use rand_distr::StandardNormal;
use rand_xoshiro::Xoshiro256PlusPlus;

/// Mask of the low 53 bits, the width of an `f64` mantissa.
pub(crate) const MASK_53: u64 = (1 << 53) - 1;

/// A reproducible pseudo-random stream.
///
/// Streams for concurrent workers are derived from one another with
/// [`ChaosRng::jump`], which advances by 2<sup>128</sup> outputs so the
/// subsequences never overlap.
///
/// Also implements [`RngCore`], so functions can use any [`rand`] distribution.
#[derive(Debug, Clone)]
pub struct ChaosRng {
    inner: Xoshiro256PlusPlus,
}
impl ChaosRng {
    #[must_use]
    pub fn from_entropy() -> Self {
        Self {
            inner: Xoshiro256PlusPlus::from_entropy(),
        }
    }
    #[must_use]
    pub fn seed_from_u64(seed: u64) -> Self {
        Self {
            inner: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }

    /// Advance the stream to the start of the next non-overlapping
    /// subsequence.
    pub fn jump(&mut self) {
        self.inner.jump();
    }

    #[inline]
    pub fn uint64(&mut self) -> u64 {
        self.inner.next_u64()
    }

    /// A uniform variate in the 53-bit fixed-point domain `[0, 2^53)`.
    #[inline]
    pub(crate) fn uint53(&mut self) -> u64 {
        self.inner.next_u64() & MASK_53
    }

    /// A uniform variate in `[0, 1)`.
    #[inline]
    #[allow(clippy::cast_precision_loss)]
    pub fn uniform(&mut self) -> f64 {
        (self.inner.next_u64() >> 11) as f64 * (1. / (1_u64 << 53) as f64)
    }

    /// A uniform variate in `[lo, hi)`.
    #[inline]
    pub fn uniform_range(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.uniform()
    }

    /// A uniform integer in `[0, n)`, without modulo bias.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    #[inline]
    pub fn intn(&mut self, n: usize) -> usize {
        self.inner.gen_range(0..n)
    }

    /// A standard normal variate.
    #[inline]
    pub fn normal(&mut self) -> f64 {
        self.inner.sample(StandardNormal)
    }
}
impl RngCore for ChaosRng {
    fn next_u32(&mut self) -> u32 {
        self.inner.next_u32()
    }
    fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.inner.fill_bytes(dest);
    }
    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.inner.try_fill_bytes(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jumped_streams_differ() {
        let mut a = ChaosRng::seed_from_u64(7);
        let mut b = a.clone();
        b.jump();
        let xs: Vec<u64> = (0..64).map(|_| a.uint64()).collect();
        let ys: Vec<u64> = (0..64).map(|_| b.uint64()).collect();
        assert!(xs.iter().all(|x| !ys.contains(x)));
    }

    #[test]
    fn same_seed_same_stream() {
        let mut a = ChaosRng::seed_from_u64(42);
        let mut b = ChaosRng::seed_from_u64(42);
        for _ in 0..100 {
            assert_eq!(a.uint64(), b.uint64());
        }
    }

    #[test]
    fn ranges() {
        let mut rng = ChaosRng::seed_from_u64(1);
        for _ in 0..10_000 {
            let u = rng.uniform();
            assert!((0. ..1.).contains(&u));
            let r = rng.uniform_range(-1., 1.);
            assert!((-1. ..1.).contains(&r));
            assert!(rng.intn(3) < 3);
            assert!(rng.uint53() <= MASK_53);
            assert!(rng.normal().is_finite());
        }
    }
}
