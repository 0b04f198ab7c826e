// Minimal PRNG (no external crates).
//
// This is NOT cryptographically secure.
// It is used for weight init, action sampling and task generation so that
// a fixed seed reproduces a whole training run bit for bit.

#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        // Avoid a zero state.
        let seed = if seed == 0 { 0x9E3779B97F4A7C15 } else { seed };
        Self { state: seed }
    }

    /// Derive an independent stream, e.g. one for init and one for sampling.
    pub fn fork(&mut self) -> Self {
        Self::new(self.next_u64() ^ 0xD1B54A32D192ED03)
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    #[inline]
    pub fn next_f32_01(&mut self) -> f32 {
        // Top 24 bits map exactly onto [0,1) without rounding up to 1.0.
        let x = self.next_u32() >> 8;
        (x as f32) / 16_777_216.0
    }

    #[inline]
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32_01()
    }

    #[inline]
    pub fn gen_range_usize(&mut self, low: usize, high: usize) -> usize {
        if high <= low {
            return low;
        }
        let span = (high - low) as u32;
        let v = self.next_u32() % span;
        low + v as usize
    }

    /// Standard normal sample (Box-Muller, one value per call).
    pub fn gen_normal(&mut self) -> f32 {
        // u1 in (0, 1] so the log stays finite.
        let u1 = 1.0 - self.next_f32_01();
        let u2 = self.next_f32_01();
        (-2.0 * u1.ln()).sqrt() * (core::f32::consts::TAU * u2).cos()
    }

    /// Draw an index from a discrete distribution.
    ///
    /// `probs` need not be exactly normalized; rounding leftovers fall on
    /// the last index with non-zero mass.
    pub fn sample_categorical(&mut self, probs: &[f32]) -> usize {
        let total: f32 = probs.iter().sum();
        let mut u = self.next_f32_01() * total;
        let mut last = 0;
        for (i, &p) in probs.iter().enumerate() {
            if p <= 0.0 {
                continue;
            }
            last = i;
            if u < p {
                return i;
            }
            u -= p;
        }
        last
    }

    /// Fisher-Yates shuffle.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.gen_range_usize(0, i + 1);
            items.swap(i, j);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let mut a = Prng::new(7);
        let mut b = Prng::new(7);
        for _ in 0..64 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn categorical_never_picks_zero_mass() {
        let mut rng = Prng::new(3);
        for _ in 0..500 {
            let i = rng.sample_categorical(&[0.0, 0.3, 0.0, 0.7]);
            assert!(i == 1 || i == 3);
        }
        for _ in 0..50 {
            assert_eq!(rng.sample_categorical(&[1.0, 0.0]), 0);
        }
    }

    #[test]
    fn normal_samples_are_roughly_standard() {
        let mut rng = Prng::new(11);
        let n = 20_000;
        let xs: Vec<f32> = (0..n).map(|_| rng.gen_normal()).collect();
        let mean = xs.iter().sum::<f32>() / n as f32;
        let var = xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / n as f32;
        assert!(mean.abs() < 0.05, "mean={mean}");
        assert!((var - 1.0).abs() < 0.1, "var={var}");
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let mut rng = Prng::new(5);
        let mut v: Vec<usize> = (0..20).collect();
        rng.shuffle(&mut v);
        let mut sorted = v.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
    }
}
