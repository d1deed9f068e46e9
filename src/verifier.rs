//! Preemptive model verification by sequential probability ratio test,
//! after Matas & Chum, "Randomized RANSAC with sequential probability ratio
//! test", ICCV 2005.
//!
//! A hypothesis is examined point by point in a pre-shuffled random order;
//! the running likelihood ratio rejects it as soon as the evidence says the
//! model is bad. The test redesigns itself online as its estimates of the
//! inlier probability (epsilon) and of the bad-model consistency
//! probability (delta) improve.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::config::{ScoreMethod, SprtParams, VerificationMethod};
use crate::core::{DataMatrix, Residual};
use crate::scoring::Score;

/// One designed test: parameters, decision threshold and the number of
/// hypotheses it was applied to. Entries are append-only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SprtHistory {
    pub epsilon: f64,
    pub delta: f64,
    pub a: f64,
    pub tested_samples: usize,
}

/// Shared SPRT state: current design, history and the shuffled point order.
#[derive(Debug, Clone)]
struct Sprt {
    points_size: usize,
    t_m: f64,
    m_s: f64,
    current_epsilon: f64,
    current_delta: f64,
    current_a: f64,
    delta_to_epsilon: f64,
    complement_delta_to_complement_epsilon: f64,
    histories: Vec<SprtHistory>,
    points_random_pool: Vec<usize>,
    pool_idx: usize,
    highest_inlier_number: usize,
    rng: StdRng,
}

impl Sprt {
    fn new(seed: u64, points_size: usize, params: &SprtParams) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut pool: Vec<usize> = (0..points_size).collect();
        pool.shuffle(&mut rng);

        let mut sprt = Self {
            points_size,
            t_m: params.time_for_model_estimation,
            m_s: params.avg_models_per_sample,
            current_epsilon: 0.0,
            current_delta: 0.0,
            current_a: 0.0,
            delta_to_epsilon: 0.0,
            complement_delta_to_complement_epsilon: 0.0,
            histories: Vec::with_capacity(20),
            points_random_pool: pool,
            pool_idx: 0,
            highest_inlier_number: 0,
            rng,
        };
        sprt.create_test(params.epsilon, params.delta);
        sprt
    }

    /// Design a new test and append it to the history.
    fn create_test(&mut self, mut epsilon: f64, mut delta: f64) {
        // Clamps keep the complement ratios finite.
        if epsilon > 0.999999 {
            epsilon = 0.99;
        }
        if delta > 0.8 {
            delta = 0.8;
        }

        let a = self.estimate_threshold_a(epsilon, delta);
        self.histories.push(SprtHistory {
            epsilon,
            delta,
            a,
            tested_samples: 0,
        });
        self.current_a = a;
        self.current_epsilon = epsilon;
        self.current_delta = delta;
        self.delta_to_epsilon = delta / epsilon;
        self.complement_delta_to_complement_epsilon = (1.0 - delta) / (1.0 - epsilon);
    }

    /// Decision threshold A as the fixed point of `A = K + log A` with
    /// `K = t_M * C / m_S + 1`. The series converges within a few steps.
    fn estimate_threshold_a(&self, epsilon: f64, delta: f64) -> f64 {
        let c = (1.0 - delta) * ((1.0 - delta) / (1.0 - epsilon)).ln()
            + delta * (delta / epsilon).ln();
        let k = self.t_m * c / self.m_s + 1.0;
        let mut a_prev = k;
        for _ in 0..10 {
            let a = k + a_prev.ln();
            if (a - a_prev).abs() < f64::EPSILON {
                return a;
            }
            a_prev = a;
        }
        a_prev
    }

    /// Random start offset into the shuffled pool for the next hypothesis.
    fn begin(&mut self) {
        self.pool_idx = self.rng.gen_range(0..self.points_size);
    }

    #[inline]
    fn next_point(&mut self) -> usize {
        if self.pool_idx >= self.points_size {
            self.pool_idx = 0;
        }
        let point = self.points_random_pool[self.pool_idx];
        self.pool_idx += 1;
        point
    }

    /// Terminal transition of one hypothesis: bump the current test's usage
    /// counter and redesign when the estimates moved.
    fn conclude(&mut self, good_model: bool, tested_inliers: usize, tested_points: usize) {
        if let Some(current) = self.histories.last_mut() {
            current.tested_samples += 1;
        }
        if good_model {
            if tested_inliers > self.highest_inlier_number {
                // Accepted with the largest support so far: redesign with the
                // sharper epsilon estimate.
                self.highest_inlier_number = tested_inliers;
                let epsilon = tested_inliers as f64 / self.points_size as f64;
                self.create_test(epsilon, self.current_delta);
            }
        } else if tested_points > 0 {
            // Almost all tested models are bad, so delta is estimated as the
            // average consistency of rejected models.
            let delta_estimate = tested_inliers as f64 / tested_points as f64;
            if delta_estimate > 0.0
                && (self.current_delta - delta_estimate).abs() / self.current_delta > 0.05
            {
                self.create_test(self.current_epsilon, delta_estimate);
            }
        }
    }

    /// Adopt a peer's inlier record (parallel mode): only ever sharpens
    /// epsilon.
    fn update(&mut self, inlier_number: usize) {
        if inlier_number > self.highest_inlier_number {
            self.highest_inlier_number = inlier_number;
            let epsilon = inlier_number as f64 / self.points_size as f64;
            self.create_test(epsilon, self.current_delta);
        }
    }
}

/// SPRT verifier returning only the accept/reject verdict.
#[derive(Debug, Clone)]
pub struct SprtUniversal<R: Residual> {
    sprt: Sprt,
    threshold: f64,
    params: SprtParams,
    residual: R,
}

impl<R: Residual> SprtUniversal<R> {
    pub fn new(seed: u64, points_size: usize, threshold: f64, params: SprtParams, residual: R) -> Self {
        Self {
            sprt: Sprt::new(seed, points_size, &params),
            threshold,
            params,
            residual,
        }
    }

    pub fn is_model_good(&mut self, data: &DataMatrix, model: &R::Model) -> bool {
        let n = self.sprt.points_size;
        let mut lambda = 1.0;
        let mut good_model = true;
        let mut tested_inliers = 0usize;
        let mut tested_points = 0usize;

        self.sprt.begin();
        for _ in 0..n {
            let point = self.sprt.next_point();
            if self.residual.error(data, model, point) < self.threshold {
                tested_inliers += 1;
                lambda *= self.sprt.delta_to_epsilon;
            } else {
                lambda *= self.sprt.complement_delta_to_complement_epsilon;
            }
            tested_points += 1;
            if lambda > self.sprt.current_a {
                good_model = false;
                break;
            }
        }
        self.sprt.conclude(good_model, tested_inliers, tested_points);
        good_model
    }
}

/// SPRT verifier that additionally publishes a score for accepted models.
/// Acceptance means every point was inspected, so the piggybacked score is
/// the exact score of a full pass and the caller can skip re-scoring.
#[derive(Debug, Clone)]
pub struct SprtScore<R: Residual> {
    sprt: Sprt,
    threshold: f64,
    params: SprtParams,
    binary_score: bool,
    last_score: Option<Score>,
    residual: R,
}

impl<R: Residual> SprtScore<R> {
    pub fn new(
        seed: u64,
        points_size: usize,
        threshold: f64,
        params: SprtParams,
        score_method: ScoreMethod,
        residual: R,
    ) -> Self {
        Self {
            sprt: Sprt::new(seed, points_size, &params),
            threshold,
            params,
            binary_score: score_method == ScoreMethod::Ransac,
            last_score: None,
            residual,
        }
    }

    pub fn is_model_good(&mut self, data: &DataMatrix, model: &R::Model) -> bool {
        let n = self.sprt.points_size;
        let mut lambda = 1.0;
        let mut sum_errors = 0.0;
        let mut good_model = true;
        let mut tested_inliers = 0usize;
        let mut tested_points = 0usize;

        self.sprt.begin();
        for _ in 0..n {
            let point = self.sprt.next_point();
            let error = self.residual.error(data, model, point);
            if error < self.threshold {
                tested_inliers += 1;
                if !self.binary_score {
                    sum_errors += error;
                }
                lambda *= self.sprt.delta_to_epsilon;
            } else {
                lambda *= self.sprt.complement_delta_to_complement_epsilon;
            }
            tested_points += 1;
            if lambda > self.sprt.current_a {
                good_model = false;
                break;
            }
        }

        self.last_score = if good_model {
            Some(if self.binary_score {
                Score::new(tested_inliers, -(tested_inliers as f64))
            } else {
                Score::new(
                    tested_inliers,
                    sum_errors + (n - tested_inliers) as f64 * self.threshold,
                )
            })
        } else {
            None
        };
        self.sprt.conclude(good_model, tested_inliers, tested_points);
        good_model
    }
}

/// Verifier variants, dispatched at the loop boundary.
#[derive(Debug, Clone)]
pub enum Verifier<R: Residual> {
    /// Every hypothesis is worth full scoring.
    Null,
    Sprt(SprtUniversal<R>),
    SprtScore(SprtScore<R>),
}

impl<R: Residual> Verifier<R> {
    pub fn from_params(
        method: VerificationMethod,
        seed: u64,
        points_size: usize,
        threshold: f64,
        sprt: SprtParams,
        score_method: ScoreMethod,
        residual: R,
    ) -> Self {
        match method {
            VerificationMethod::None => Verifier::Null,
            VerificationMethod::SprtUniversal => Verifier::Sprt(SprtUniversal::new(
                seed,
                points_size,
                threshold,
                sprt,
                residual,
            )),
            VerificationMethod::SprtScore => Verifier::SprtScore(SprtScore::new(
                seed,
                points_size,
                threshold,
                sprt,
                score_method,
                residual,
            )),
        }
    }

    pub fn is_model_good(&mut self, data: &DataMatrix, model: &R::Model) -> bool {
        match self {
            Verifier::Null => true,
            Verifier::Sprt(v) => v.is_model_good(data, model),
            Verifier::SprtScore(v) => v.is_model_good(data, model),
        }
    }

    /// Score of the last accepted hypothesis, when this verifier produces
    /// one. Callers must treat `None` as "score it yourself".
    pub fn score(&self) -> Option<Score> {
        match self {
            Verifier::SprtScore(v) => v.last_score,
            _ => None,
        }
    }

    /// Feed a best-inlier record observed elsewhere (peer workers, local
    /// optimization) back into the test design.
    pub fn update(&mut self, inlier_number: usize) {
        match self {
            Verifier::Null => {}
            Verifier::Sprt(v) => v.sprt.update(inlier_number),
            Verifier::SprtScore(v) => v.sprt.update(inlier_number),
        }
    }

    /// Append-only design history; empty for the null verifier.
    pub fn histories(&self) -> &[SprtHistory] {
        match self {
            Verifier::Null => &[],
            Verifier::Sprt(v) => &v.sprt.histories,
            Verifier::SprtScore(v) => &v.sprt.histories,
        }
    }

    pub fn clone_for_worker(&self, seed: u64) -> Self {
        match self {
            Verifier::Null => Verifier::Null,
            Verifier::Sprt(v) => Verifier::Sprt(SprtUniversal::new(
                seed,
                v.sprt.points_size,
                v.threshold,
                v.params,
                v.residual.clone(),
            )),
            Verifier::SprtScore(v) => Verifier::SprtScore(SprtScore::new(
                seed,
                v.sprt.points_size,
                v.threshold,
                v.params,
                if v.binary_score {
                    ScoreMethod::Ransac
                } else {
                    ScoreMethod::Msac
                },
                v.residual.clone(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug)]
    struct RowValue;

    impl Residual for RowValue {
        type Model = ();

        fn error(&self, data: &DataMatrix, _model: &(), point: usize) -> f64 {
            data[(point, 0)]
        }
    }

    fn residual_column(values: &[f64]) -> DataMatrix {
        DataMatrix::from_iterator(values.len(), 1, values.iter().copied())
    }

    fn sprt(epsilon: f64, delta: f64) -> SprtParams {
        SprtParams {
            epsilon,
            delta,
            ..SprtParams::default()
        }
    }

    #[test]
    fn design_invariants_hold() {
        let data = residual_column(&vec![0.0; 32]);
        let verifier = SprtUniversal::new(0, data.nrows(), 0.5, sprt(0.011, 0.01), RowValue);
        for h in &verifier.sprt.histories {
            assert!(h.epsilon > 0.0 && h.epsilon < 1.0);
            assert!(h.delta > 0.0 && h.delta < 1.0);
            assert!(h.delta < h.epsilon);
            assert!(h.a > 1.0);
        }
    }

    #[test]
    fn all_inlier_model_is_accepted() {
        let data = residual_column(&vec![0.1; 100]);
        let mut verifier = SprtUniversal::new(1, data.nrows(), 0.5, sprt(0.011, 0.01), RowValue);
        assert!(verifier.is_model_good(&data, &()));
    }

    #[test]
    fn all_outlier_model_is_rejected_early() {
        let data = residual_column(&vec![9.0; 1000]);
        let mut verifier = SprtUniversal::new(1, data.nrows(), 0.5, sprt(0.2, 0.01), RowValue);
        assert!(!verifier.is_model_good(&data, &()));
    }

    #[test]
    fn equal_delta_and_epsilon_never_rejects() {
        // With delta == epsilon the likelihood ratio stays at 1 and the test
        // has no power to reject anything.
        let data = residual_column(&vec![9.0; 200]);
        let mut verifier = SprtUniversal::new(3, data.nrows(), 0.5, sprt(0.3, 0.3), RowValue);
        for _ in 0..5 {
            assert!(verifier.is_model_good(&data, &()));
        }
    }

    #[test]
    fn accepting_larger_support_redesigns_epsilon() {
        let data = residual_column(&vec![0.1; 64]);
        let mut verifier = SprtUniversal::new(2, data.nrows(), 0.5, sprt(0.011, 0.01), RowValue);
        assert_eq!(verifier.sprt.histories.len(), 1);
        assert!(verifier.is_model_good(&data, &()));
        assert_eq!(verifier.sprt.histories.len(), 2);
        let last = verifier.sprt.histories.last().unwrap();
        assert!((last.epsilon - 0.99).abs() < 1e-12, "clamped from 1.0");
    }

    #[test]
    fn rejections_with_moved_delta_redesign_the_test() {
        // Roughly 5% of points are consistent: rejected models keep
        // re-estimating delta until the design settles.
        let mut values = vec![9.0; 200];
        for v in values.iter_mut().take(10) {
            *v = 0.1;
        }
        let data = residual_column(&values);
        let mut verifier = SprtUniversal::new(4, data.nrows(), 0.5, sprt(0.9, 0.001), RowValue);
        for _ in 0..50 {
            verifier.is_model_good(&data, &());
        }
        let histories = &verifier.sprt.histories;
        assert!(histories.len() >= 2);
        let deltas: Vec<f64> = histories.iter().map(|h| h.delta).collect();
        assert!(deltas.windows(2).any(|w| (w[0] - w[1]).abs() > 1e-9));
    }

    #[test]
    fn score_verifier_publishes_score_only_on_accept() {
        let data = residual_column(&vec![0.1; 50]);
        let mut verifier = SprtScore::new(
            5,
            data.nrows(),
            0.5,
            sprt(0.011, 0.01),
            ScoreMethod::Msac,
            RowValue,
        );
        assert!(verifier.is_model_good(&data, &()));
        let score = verifier.last_score.expect("accepted model carries a score");
        assert_eq!(score.inlier_number, 50);
        assert!((score.value - 50.0 * 0.1).abs() < 1e-9);

        let bad = residual_column(&vec![9.0; 50]);
        if !verifier.is_model_good(&bad, &()) {
            assert!(verifier.last_score.is_none());
        }
    }

    #[test]
    fn binary_score_encodes_negated_inlier_count() {
        let data = residual_column(&vec![0.1; 30]);
        let mut verifier = SprtScore::new(
            6,
            data.nrows(),
            0.5,
            sprt(0.011, 0.01),
            ScoreMethod::Ransac,
            RowValue,
        );
        assert!(verifier.is_model_good(&data, &()));
        let score = verifier.last_score.unwrap();
        assert_eq!(score.inlier_number, 30);
        assert_eq!(score.value, -30.0);
    }
}
