//! Model quality scoring.
//!
//! A [`Score`] pairs an inlier count with a floating-point quality value
//! under a "lower is better" convention: inlier-count scoring stores the
//! negated count, truncated-loss scoring stores the loss itself. Both
//! policies share one total order, so the loop controller never cares which
//! policy produced a score.

use crate::config::ScoreMethod;
use crate::core::{DataMatrix, Residual};

/// Model quality: inlier count plus a comparable value, lower is better.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub inlier_number: usize,
    pub value: f64,
}

impl Score {
    pub fn new(inlier_number: usize, value: f64) -> Self {
        Self {
            inlier_number,
            value,
        }
    }

    /// Neutral score every run starts from; loses against any real score.
    pub fn worst() -> Self {
        Self {
            inlier_number: 0,
            value: f64::MAX,
        }
    }

    /// Strict total order: better value wins, ties break on inlier count.
    #[inline]
    pub fn is_better(&self, other: &Score) -> bool {
        if self.value == other.value {
            self.inlier_number > other.inlier_number
        } else {
            self.value < other.value
        }
    }
}

impl Default for Score {
    fn default() -> Self {
        Self::worst()
    }
}

/// Scorer evaluating a model over the whole point table.
///
/// Holds the best score seen so far as a pruning bound: a scoring pass stops
/// as soon as no completion of the remaining points can beat it. Scores
/// produced by such a truncated pass are lower bounds and, by construction,
/// never better than the published best, so the comparison in the loop
/// discards them without special handling.
#[derive(Debug, Clone)]
pub struct Quality<R: Residual> {
    method: ScoreMethod,
    threshold: f64,
    best_score: f64,
    residual: R,
}

impl<R: Residual> Quality<R> {
    pub fn new(method: ScoreMethod, threshold: f64, residual: R) -> Self {
        Self {
            method,
            threshold,
            best_score: f64::MAX,
            residual,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Tighten the early-exit bound to the best score found so far.
    pub fn set_best_score(&mut self, best_score: f64) {
        self.best_score = best_score;
    }

    /// Fresh clone for a parallel worker; the bound starts untightened.
    pub fn clone_for_worker(&self) -> Self {
        Self::new(self.method, self.threshold, self.residual.clone())
    }

    #[inline]
    pub fn is_inlier(&self, data: &DataMatrix, model: &R::Model, point: usize) -> bool {
        self.residual.error(data, model, point) < self.threshold
    }

    /// Score `model`, pruning against the current best.
    pub fn score(&self, data: &DataMatrix, model: &R::Model) -> Score {
        self.score_impl(data, model, None)
    }

    /// Score `model` and collect its inlier indices. A pruned pass leaves a
    /// partial index list; callers only consume it after the score survived
    /// the is-better gate, which a pruned score cannot.
    pub fn score_with_inliers(
        &self,
        data: &DataMatrix,
        model: &R::Model,
        inliers: &mut Vec<usize>,
    ) -> Score {
        inliers.clear();
        self.score_impl(data, model, Some(inliers))
    }

    fn score_impl(
        &self,
        data: &DataMatrix,
        model: &R::Model,
        mut inliers: Option<&mut Vec<usize>>,
    ) -> Score {
        let n = data.nrows();
        match self.method {
            ScoreMethod::Ransac => {
                let mut inlier_number = 0usize;
                for point in 0..n {
                    if self.residual.error(data, model, point) < self.threshold {
                        if let Some(out) = inliers.as_mut() {
                            out.push(point);
                        }
                        inlier_number += 1;
                    }
                    // No completion of the remaining points can reach the bound.
                    if ((inlier_number + (n - point)) as f64) < -self.best_score {
                        break;
                    }
                }
                Score::new(inlier_number, -(inlier_number as f64))
            }
            ScoreMethod::Msac => {
                let mut inlier_number = 0usize;
                let mut sum_errors = 0.0;
                for point in 0..n {
                    let err = self.residual.error(data, model, point);
                    if err < self.threshold {
                        if let Some(out) = inliers.as_mut() {
                            out.push(point);
                        }
                        sum_errors += err;
                        inlier_number += 1;
                    } else {
                        sum_errors += self.threshold;
                    }
                    // Remaining contributions are non-negative.
                    if sum_errors > self.best_score {
                        break;
                    }
                }
                Score::new(inlier_number, sum_errors)
            }
        }
    }

    /// Inlier indices of `model` over the full table, never pruned.
    pub fn inlier_indices(&self, data: &DataMatrix, model: &R::Model) -> Vec<usize> {
        let mut inliers = Vec::new();
        for point in 0..data.nrows() {
            if self.residual.error(data, model, point) < self.threshold {
                inliers.push(point);
            }
        }
        inliers
    }

    /// Full inlier mask, per-point errors and inlier count for `model` at
    /// `threshold`. Single scan, never pruned.
    pub fn inliers_at(
        &self,
        data: &DataMatrix,
        model: &R::Model,
        threshold: f64,
    ) -> (Vec<bool>, Vec<f64>, usize) {
        let n = data.nrows();
        let mut mask = vec![false; n];
        let mut errors = vec![0.0; n];
        let mut count = 0usize;
        for point in 0..n {
            let err = self.residual.error(data, model, point);
            errors[point] = err;
            if err < threshold {
                mask[point] = true;
                count += 1;
            }
        }
        (mask, errors, count)
    }

    /// Same as [`Quality::inliers_at`] with the configured threshold.
    pub fn inliers(&self, data: &DataMatrix, model: &R::Model) -> (Vec<bool>, Vec<f64>, usize) {
        self.inliers_at(data, model, self.threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug)]
    struct RowValue;

    // Treats the single column of the data matrix as the residual itself.
    impl Residual for RowValue {
        type Model = ();

        fn error(&self, data: &DataMatrix, _model: &(), point: usize) -> f64 {
            data[(point, 0)]
        }
    }

    fn residual_column(values: &[f64]) -> DataMatrix {
        DataMatrix::from_iterator(values.len(), 1, values.iter().copied())
    }

    #[test]
    fn score_order_is_strict_and_total() {
        let a = Score::new(10, -10.0);
        let b = Score::new(8, -8.0);
        let c = Score::new(12, -10.0);

        assert!(a.is_better(&b));
        assert!(!b.is_better(&a));
        // Irreflexive.
        assert!(!a.is_better(&a));
        // Equal values break ties on inlier count.
        assert!(c.is_better(&a));
        assert!(!a.is_better(&c));
        // Transitive on this chain.
        assert!(c.is_better(&b));
        // Anything beats the neutral score.
        assert!(Score::new(1, -1.0).is_better(&Score::worst()));
    }

    #[test]
    fn ransac_policy_counts_inliers() {
        let data = residual_column(&[0.1, 0.4, 0.6, 1.0, 0.3]);
        let quality = Quality::new(ScoreMethod::Ransac, 0.5, RowValue);

        let mut inliers = Vec::new();
        let score = quality.score_with_inliers(&data, &(), &mut inliers);
        assert_eq!(score.inlier_number, 3);
        assert_eq!(score.value, -3.0);
        assert_eq!(inliers, vec![0, 1, 4]);
    }

    #[test]
    fn msac_policy_truncates_outlier_errors() {
        let data = residual_column(&[0.1, 0.4, 0.6, 1.0, 0.3]);
        let quality = Quality::new(ScoreMethod::Msac, 0.5, RowValue);

        let score = quality.score(&data, &());
        assert_eq!(score.inlier_number, 3);
        // Inliers contribute their error, outliers the threshold.
        assert!((score.value - (0.1 + 0.4 + 0.3 + 0.5 + 0.5)).abs() < 1e-12);
    }

    #[test]
    fn mask_count_matches_score_count() {
        let data = residual_column(&[0.2, 0.9, 0.45, 0.5, 0.0, 2.0]);
        let quality = Quality::new(ScoreMethod::Msac, 0.5, RowValue);

        let score = quality.score(&data, &());
        let (mask, errors, count) = quality.inliers(&data, &());
        assert_eq!(count, score.inlier_number);
        assert_eq!(mask.iter().filter(|&&m| m).count(), count);
        assert_eq!(errors.len(), data.nrows());
        // Threshold is exclusive: 0.5 is not an inlier.
        assert!(!mask[3]);
    }

    #[test]
    fn early_exit_never_changes_the_winner() {
        // Two models over the same residual layout: the second is strictly
        // better. Scoring the worse one against the better one's bound must
        // produce a score that still loses.
        let good = residual_column(&[0.1, 0.1, 0.1, 0.1, 0.1, 0.1]);
        let bad = residual_column(&[0.1, 0.9, 0.9, 0.9, 0.9, 0.9]);

        for method in [ScoreMethod::Ransac, ScoreMethod::Msac] {
            let mut quality = Quality::new(method, 0.5, RowValue);
            let good_score = quality.score(&good, &());
            quality.set_best_score(good_score.value);

            let pruned = quality.score(&bad, &());
            let full = Quality::new(method, 0.5, RowValue).score(&bad, &());
            assert!(good_score.is_better(&pruned));
            assert!(good_score.is_better(&full));
        }
    }
}
