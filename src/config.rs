//! Run configuration.
//!
//! `RansacParams` carries every recognized knob of the engine. The
//! per-problem constructors bake in the constants that depend on the
//! estimation method: minimal sample size, SPRT design constants, and
//! whether the threshold must be squared to match the residual domain
//! (reprojection-like metrics measure squared pixel distances).

/// Scoring policy used to rank models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreMethod {
    /// Plain inlier counting; score is the negated inlier number.
    Ransac,
    /// Truncated-loss scoring; score is the sum of clamped errors.
    Msac,
}

/// Preemptive model verification strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationMethod {
    /// Score every hypothesis in full.
    None,
    /// SPRT verdict only; accepted models are scored by the quality.
    SprtUniversal,
    /// SPRT verdict plus a piggybacked score for accepted models.
    SprtScore,
}

/// Local optimization applied to promising hypotheses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalOptimMethod {
    None,
    /// Inner RANSAC over the current inlier set.
    InnerRansac,
    /// Marginalizing sigma-consensus; routes scoring through the optimizer.
    Sigma,
}

/// Final refinement of the best model after the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolishingMethod {
    None,
    LeastSquares,
}

/// Minimal-sample drawing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMethod {
    Uniform,
    /// Progressive sampling; assumes points are sorted by match quality.
    Prosac,
}

/// Design constants of the sequential probability ratio test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SprtParams {
    /// Assumed inlier probability of a good model (lower-bound estimate).
    pub epsilon: f64,
    /// Probability that a point is consistent with a bad model.
    pub delta: f64,
    /// Time to instantiate a model hypothesis, in point-verification units.
    pub time_for_model_estimation: f64,
    /// Average number of models returned per minimal sample.
    pub avg_models_per_sample: f64,
}

impl Default for SprtParams {
    fn default() -> Self {
        Self {
            epsilon: 0.011,
            delta: 0.01,
            time_for_model_estimation: 100.0,
            avg_models_per_sample: 1.0,
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RansacParams {
    /// Inlier threshold in the residual's domain. The per-problem
    /// constructors square the caller's pixel threshold where the residual
    /// measures squared distances.
    pub threshold: f64,
    /// Required confidence of finding the best model, in (0, 1).
    pub confidence: f64,
    /// Hard cap on the number of iterations.
    pub max_iterations: usize,
    /// Minimal sample size of the wired estimator.
    pub sample_size: usize,

    pub score: ScoreMethod,
    pub verification: VerificationMethod,
    pub local_optimization: LocalOptimMethod,
    pub polisher: PolishingMethod,
    pub sampler: SamplingMethod,
    /// Run the hypothesize-and-verify loop across all available cores.
    pub parallel: bool,
    /// Base seed for every random stream of the run.
    pub seed: u64,

    pub sprt: SprtParams,
    /// Largest non-minimal sample drawn by the inner-RANSAC optimizer.
    pub lo_sample_size: usize,
    /// Iterations of the inner-RANSAC optimizer per invocation.
    pub lo_inner_iterations: usize,
    /// Refit rounds of the final least-squares polisher.
    pub final_lsq_iterations: usize,
}

impl RansacParams {
    fn base(threshold: f64, sample_size: usize, sprt: SprtParams) -> Self {
        Self {
            threshold,
            confidence: 0.95,
            max_iterations: 5000,
            sample_size,
            score: ScoreMethod::Msac,
            verification: VerificationMethod::SprtScore,
            local_optimization: LocalOptimMethod::InnerRansac,
            polisher: PolishingMethod::LeastSquares,
            sampler: SamplingMethod::Uniform,
            parallel: false,
            seed: 0,
            sprt,
            lo_sample_size: 14,
            lo_inner_iterations: 10,
            final_lsq_iterations: 3,
        }
    }

    /// Configuration for 4-point homography fitting. `threshold` is in
    /// pixels; the forward reprojection residual is squared, so the stored
    /// threshold is too.
    pub fn homography(threshold: f64) -> Self {
        Self::base(
            threshold * threshold,
            4,
            SprtParams {
                time_for_model_estimation: 100.0,
                avg_models_per_sample: 1.0,
                ..SprtParams::default()
            },
        )
    }

    /// Configuration for 7-point fundamental matrix fitting. The Sampson
    /// residual is used as-is.
    pub fn fundamental(threshold: f64) -> Self {
        Self::base(
            threshold,
            7,
            SprtParams {
                time_for_model_estimation: 125.0,
                avg_models_per_sample: 2.38,
                ..SprtParams::default()
            },
        )
    }

    /// Configuration for 5-point essential matrix fitting. The caller is
    /// expected to pass a threshold already mapped to normalized image
    /// coordinates (see [`crate::api::find_essential_mat`]).
    pub fn essential(threshold: f64) -> Self {
        Self::base(
            threshold,
            5,
            SprtParams {
                time_for_model_estimation: 150.0,
                avg_models_per_sample: 4.5,
                ..SprtParams::default()
            },
        )
    }

    /// Configuration for 6-point projection-matrix pose fitting.
    /// `threshold` is in pixels; the reprojection residual is squared.
    pub fn pnp(threshold: f64) -> Self {
        Self::base(
            threshold * threshold,
            6,
            SprtParams {
                time_for_model_estimation: 150.0,
                avg_models_per_sample: 1.0,
                ..SprtParams::default()
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_problem_constructors_bake_in_constants() {
        let h = RansacParams::homography(1.5);
        assert_eq!(h.sample_size, 4);
        assert!((h.threshold - 2.25).abs() < 1e-12);

        let f = RansacParams::fundamental(1.0);
        assert_eq!(f.sample_size, 7);
        assert!((f.threshold - 1.0).abs() < 1e-12);
        assert!((f.sprt.avg_models_per_sample - 2.38).abs() < 1e-12);

        let e = RansacParams::essential(0.001);
        assert_eq!(e.sample_size, 5);
        assert!((e.sprt.time_for_model_estimation - 150.0).abs() < 1e-12);

        let p = RansacParams::pnp(2.0);
        assert_eq!(p.sample_size, 6);
        assert!((p.threshold - 4.0).abs() < 1e-12);
    }

    #[test]
    fn defaults_match_documented_values() {
        let p = RansacParams::homography(1.0);
        assert!((p.confidence - 0.95).abs() < 1e-12);
        assert_eq!(p.max_iterations, 5000);
        assert_eq!(p.score, ScoreMethod::Msac);
        assert_eq!(p.verification, VerificationMethod::SprtScore);
        assert_eq!(p.sampler, SamplingMethod::Uniform);
        assert!(!p.parallel);
        assert!((p.sprt.epsilon - 0.011).abs() < 1e-12);
        assert!((p.sprt.delta - 0.01).abs() < 1e-12);
    }
}
