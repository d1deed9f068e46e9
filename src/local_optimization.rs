//! Local optimization and final polishing.
//!
//! Both refine a promising model from its inlier set through the
//! estimator's non-minimal solver; the inner-RANSAC variant adds sampling
//! over the inliers to escape contaminated supports.

use log::debug;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::core::{DataMatrix, Estimator, LocalOptimizer, Residual};
use crate::scoring::{Quality, Score};
use crate::utils::draw_unique;

/// Inner RANSAC over the current inlier set: repeatedly fits non-minimal
/// subsets of the best model's inliers and keeps strict improvements,
/// refreshing the inlier set whenever the model improves.
#[derive(Debug, Clone)]
pub struct InnerRansacOptimizer<E, R>
where
    E: Estimator,
    R: Residual<Model = E::Model>,
{
    estimator: E,
    quality: Quality<R>,
    rng: StdRng,
    sample_size: usize,
    iterations: usize,
}

impl<E, R> InnerRansacOptimizer<E, R>
where
    E: Estimator,
    R: Residual<Model = E::Model>,
{
    pub fn new(
        seed: u64,
        estimator: E,
        quality: Quality<R>,
        sample_size: usize,
        iterations: usize,
    ) -> Self {
        Self {
            estimator,
            quality,
            rng: StdRng::seed_from_u64(seed),
            sample_size,
            iterations,
        }
    }
}

impl<E, R> LocalOptimizer for InnerRansacOptimizer<E, R>
where
    E: Estimator,
    R: Residual<Model = E::Model>,
{
    type Model = E::Model;

    fn refine(
        &mut self,
        data: &DataMatrix,
        best_model: &E::Model,
        best_score: &Score,
    ) -> Option<(E::Model, Score)> {
        let minimal = self.estimator.sample_size();
        let mut inliers = self.quality.inlier_indices(data, best_model);
        if inliers.len() <= minimal {
            return None;
        }

        self.quality.set_best_score(best_score.value);
        let mut best = *best_score;
        let mut refined: Option<E::Model> = None;
        let mut positions = vec![0usize; self.sample_size];

        for _ in 0..self.iterations {
            if inliers.len() <= minimal {
                break;
            }
            let draw = self.sample_size.min(inliers.len());
            let subset: Vec<usize> = if draw == inliers.len() {
                inliers.clone()
            } else {
                draw_unique(&mut self.rng, &mut positions[..draw], inliers.len());
                positions[..draw].iter().map(|&p| inliers[p]).collect()
            };

            for model in self.estimator.estimate_non_minimal(data, &subset, None) {
                let score = self.quality.score(data, &model);
                if score.is_better(&best) {
                    best = score;
                    inliers = self.quality.inlier_indices(data, &model);
                    refined = Some(model);
                    self.quality.set_best_score(best.value);
                }
            }
        }

        let model = refined?;
        debug!(
            "local optimization improved support to {} inliers",
            best.inlier_number
        );
        Some((model, best))
    }

    fn clone_for_worker(&self, seed: u64) -> Self {
        Self::new(
            seed,
            self.estimator.clone(),
            self.quality.clone_for_worker(),
            self.sample_size,
            self.iterations,
        )
    }
}

/// Iterated least squares on the best model's inliers, applied once after
/// the main loop.
#[derive(Debug, Clone)]
pub struct LeastSquaresPolisher<E, R>
where
    E: Estimator,
    R: Residual<Model = E::Model>,
{
    estimator: E,
    quality: Quality<R>,
    iterations: usize,
}

impl<E, R> LeastSquaresPolisher<E, R>
where
    E: Estimator,
    R: Residual<Model = E::Model>,
{
    pub fn new(estimator: E, quality: Quality<R>, iterations: usize) -> Self {
        Self {
            estimator,
            quality,
            iterations,
        }
    }
}

impl<E, R> LocalOptimizer for LeastSquaresPolisher<E, R>
where
    E: Estimator,
    R: Residual<Model = E::Model>,
{
    type Model = E::Model;

    fn refine(
        &mut self,
        data: &DataMatrix,
        best_model: &E::Model,
        best_score: &Score,
    ) -> Option<(E::Model, Score)> {
        let minimal = self.estimator.sample_size();
        let mut inliers = self.quality.inlier_indices(data, best_model);

        let mut best = *best_score;
        let mut polished: Option<E::Model> = None;

        for _ in 0..self.iterations {
            if inliers.len() < minimal {
                break;
            }
            let mut improved = false;
            for model in self.estimator.estimate_non_minimal(data, &inliers, None) {
                let score = self.quality.score(data, &model);
                if score.is_better(&best) {
                    best = score;
                    inliers = self.quality.inlier_indices(data, &model);
                    polished = Some(model);
                    improved = true;
                }
            }
            if !improved {
                break;
            }
        }

        polished.map(|model| (model, best))
    }

    fn clone_for_worker(&self, _seed: u64) -> Self {
        Self::new(
            self.estimator.clone(),
            self.quality.clone_for_worker(),
            self.iterations,
        )
    }
}
