//! Minimal-sample drawing strategies.
//!
//! [`UniformSampler`] draws by partial Fisher-Yates over a persistent index
//! pool. [`ProsacSampler`] progressively widens the subset of top-ranked
//! points before falling back to uniform sampling; it assumes the point
//! table is sorted by descending match quality.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::SamplingMethod;
use crate::utils::draw_unique;

/// Uniform sampler over `[0, points_size)` without replacement.
#[derive(Debug, Clone)]
pub struct UniformSampler {
    pool: Vec<usize>,
    sample_size: usize,
    rng: StdRng,
}

impl UniformSampler {
    pub fn new(seed: u64, sample_size: usize, points_size: usize) -> Self {
        Self {
            pool: (0..points_size).collect(),
            sample_size,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draw `sample_size` distinct indices by swapping random picks to the
    /// tail of the pool. The pool itself persists across draws; only the
    /// active prefix is reset per call.
    pub fn generate(&mut self, sample: &mut [usize]) {
        debug_assert!(sample.len() >= self.sample_size);
        let mut pool_size = self.pool.len();
        for slot in sample.iter_mut().take(self.sample_size) {
            let pick = self.rng.gen_range(0..pool_size);
            *slot = self.pool[pick];
            pool_size -= 1;
            self.pool.swap(pick, pool_size);
        }
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    pub fn clone_for_worker(&self, seed: u64) -> Self {
        Self::new(seed, self.sample_size, self.pool.len())
    }
}

/// PROSAC sampler after Chum & Matas: samples are drawn from a growing
/// prefix of the (quality-sorted) point table, converging to uniform
/// sampling after a configured number of draws.
#[derive(Debug, Clone)]
pub struct ProsacSampler {
    rng: StdRng,
    seed: u64,
    growth_function: Vec<usize>,
    sample_size: usize,
    points_size: usize,
    ransac_convergence_iterations: usize,
    kth_sample_number: usize,
    subset_size: usize,
}

impl ProsacSampler {
    pub fn new(seed: u64, sample_size: usize, points_size: usize) -> Self {
        Self::with_convergence(seed, sample_size, points_size, 100_000)
    }

    pub fn with_convergence(
        seed: u64,
        sample_size: usize,
        points_size: usize,
        ransac_convergence_iterations: usize,
    ) -> Self {
        let mut sampler = Self {
            rng: StdRng::seed_from_u64(seed),
            seed,
            growth_function: Vec::new(),
            sample_size,
            points_size,
            ransac_convergence_iterations,
            kth_sample_number: 1,
            subset_size: sample_size.min(points_size),
        };
        sampler.build_growth_function();
        sampler
    }

    // T_n recurrence from the PROSAC paper: the iteration at which the n-th
    // ranked point enters the sampling subset.
    fn build_growth_function(&mut self) {
        let n = self.points_size;
        let m = self.sample_size;
        self.growth_function = vec![0; n];

        let mut t_n = self.ransac_convergence_iterations as f64;
        for i in 0..m {
            t_n *= (m - i) as f64 / (n - i) as f64;
        }

        let mut t_n_prime = 1usize;
        for i in 0..n {
            if i < m {
                self.growth_function[i] = t_n_prime;
                continue;
            }
            let t_n_plus1 = (i + 1) as f64 * t_n / (i + 1 - m) as f64;
            self.growth_function[i] = t_n_prime + (t_n_plus1 - t_n).ceil() as usize;
            t_n = t_n_plus1;
            t_n_prime = self.growth_function[i];
        }
    }

    pub fn generate(&mut self, sample: &mut [usize]) {
        debug_assert!(sample.len() >= self.sample_size);
        if self.kth_sample_number > self.ransac_convergence_iterations {
            // Converged to plain RANSAC.
            draw_unique(
                &mut self.rng,
                &mut sample[..self.sample_size],
                self.points_size,
            );
            return;
        }

        // Draw sample_size - 1 points from the current subset prefix and fix
        // the last slot to the newest subset member.
        if self.sample_size > 1 {
            draw_unique(
                &mut self.rng,
                &mut sample[..self.sample_size - 1],
                self.subset_size - 1,
            );
        }
        sample[self.sample_size - 1] = self.subset_size - 1;

        self.kth_sample_number += 1;
        if self.kth_sample_number > self.growth_function[self.subset_size - 1] {
            self.subset_size = (self.subset_size + 1).min(self.points_size);
        }
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    pub fn clone_for_worker(&self, seed: u64) -> Self {
        Self::with_convergence(
            seed,
            self.sample_size,
            self.points_size,
            self.ransac_convergence_iterations,
        )
    }

    /// Rewind the progressive schedule, keeping configuration and seed.
    pub fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
        self.kth_sample_number = 1;
        self.subset_size = self.sample_size.min(self.points_size);
    }
}

/// Sampler variants, dispatched at the loop boundary.
#[derive(Debug, Clone)]
pub enum Sampler {
    Uniform(UniformSampler),
    Prosac(ProsacSampler),
}

impl Sampler {
    pub fn from_params(
        method: SamplingMethod,
        seed: u64,
        sample_size: usize,
        points_size: usize,
    ) -> Self {
        match method {
            SamplingMethod::Uniform => {
                Sampler::Uniform(UniformSampler::new(seed, sample_size, points_size))
            }
            SamplingMethod::Prosac => {
                Sampler::Prosac(ProsacSampler::new(seed, sample_size, points_size))
            }
        }
    }

    pub fn generate(&mut self, sample: &mut [usize]) {
        match self {
            Sampler::Uniform(s) => s.generate(sample),
            Sampler::Prosac(s) => s.generate(sample),
        }
    }

    pub fn clone_for_worker(&self, seed: u64) -> Self {
        match self {
            Sampler::Uniform(s) => Sampler::Uniform(s.clone_for_worker(seed)),
            Sampler::Prosac(s) => Sampler::Prosac(s.clone_for_worker(seed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn uniform_sampler_draws_distinct_indices_in_range() {
        let mut sampler = UniformSampler::new(7, 4, 10);
        let mut sample = [0usize; 4];
        for _ in 0..100_000 {
            sampler.generate(&mut sample);
            assert!(sample.iter().all(|&i| i < 10));
            let unique: HashSet<_> = sample.iter().collect();
            assert_eq!(unique.len(), sample.len());
        }
    }

    #[test]
    fn uniform_sampler_is_deterministic_per_seed() {
        let mut a = UniformSampler::new(123, 5, 15);
        let mut b = UniformSampler::new(123, 5, 15);
        let mut sa = [0usize; 5];
        let mut sb = [0usize; 5];
        for _ in 0..10 {
            a.generate(&mut sa);
            b.generate(&mut sb);
            assert_eq!(sa, sb);
        }
    }

    #[test]
    fn uniform_sampler_covers_the_whole_range() {
        let mut sampler = UniformSampler::new(3, 2, 6);
        let mut sample = [0usize; 2];
        let mut seen = HashSet::new();
        for _ in 0..200 {
            sampler.generate(&mut sample);
            seen.extend(sample);
        }
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn worker_clones_are_independent_streams() {
        let base = UniformSampler::new(42, 3, 20);
        let mut w1 = base.clone_for_worker(52);
        let mut w2 = base.clone_for_worker(62);
        let mut s1 = [0usize; 3];
        let mut s2 = [0usize; 3];
        let mut identical = true;
        for _ in 0..20 {
            w1.generate(&mut s1);
            w2.generate(&mut s2);
            if s1 != s2 {
                identical = false;
            }
        }
        assert!(!identical, "workers with different seeds repeat one stream");
    }

    #[test]
    fn prosac_starts_in_the_top_ranked_prefix() {
        let mut sampler = ProsacSampler::new(5, 3, 50);
        let mut sample = [0usize; 3];
        sampler.generate(&mut sample);
        // The first draw only sees the minimal-sample prefix.
        assert!(sample.iter().all(|&i| i < 3));
    }

    #[test]
    fn prosac_converges_to_uniform_and_stays_valid() {
        let mut sampler = ProsacSampler::with_convergence(5, 3, 20, 10);
        let mut sample = [0usize; 3];
        let mut seen = HashSet::new();
        for _ in 0..200 {
            sampler.generate(&mut sample);
            assert!(sample.iter().all(|&i| i < 20));
            let unique: HashSet<_> = sample.iter().collect();
            assert_eq!(unique.len(), sample.len());
            seen.extend(sample);
        }
        // After convergence the whole range is reachable.
        assert!(seen.len() > 10);
    }
}
