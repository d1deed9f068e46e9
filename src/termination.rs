//! Adaptive termination of the hypothesize-and-verify loop.

/// Standard RANSAC iteration bound: with inlier ratio `w` and sample size
/// `s`, `ceil(log(1 - confidence) / log(1 - w^s))` draws give the required
/// confidence of seeing at least one all-inlier sample. The bound only ever
/// tightens as the best inlier count grows, and never exceeds the caller's
/// hard cap.
#[derive(Debug, Clone)]
pub struct StandardTermination {
    log_confidence: f64,
    points_size: usize,
    sample_size: usize,
    current_max: usize,
}

impl StandardTermination {
    pub fn new(confidence: f64, points_size: usize, sample_size: usize, max_iterations: usize) -> Self {
        Self {
            log_confidence: (1.0 - confidence).ln(),
            points_size,
            sample_size,
            current_max: max_iterations,
        }
    }

    /// Recompute the bound after a strict improvement to `inlier_number`.
    pub fn update(&mut self, inlier_number: usize) -> usize {
        let ratio = (inlier_number as f64 / self.points_size as f64).powi(self.sample_size as i32);
        // ratio == 0 gives log(1) == 0 and an infinite prediction: keep the
        // cap. ratio == 1 gives log(0) == -inf and a prediction of zero:
        // stop immediately.
        let predicted = self.log_confidence / (1.0 - ratio).ln();
        if predicted.is_finite() && predicted < self.current_max as f64 {
            self.current_max = predicted.ceil() as usize;
        }
        self.current_max
    }

    pub fn max_iterations(&self) -> usize {
        self.current_max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_is_monotone_non_increasing() {
        let mut termination = StandardTermination::new(0.95, 100, 4, 5000);
        let mut previous = termination.max_iterations();
        for inliers in [10, 20, 20, 35, 50, 80, 95] {
            let bound = termination.update(inliers);
            assert!(bound <= previous, "bound grew from {previous} to {bound}");
            previous = bound;
        }
    }

    #[test]
    fn zero_inliers_keeps_the_hard_cap() {
        let mut termination = StandardTermination::new(0.99, 50, 7, 1234);
        assert_eq!(termination.update(0), 1234);
    }

    #[test]
    fn all_inliers_stops_immediately() {
        let mut termination = StandardTermination::new(0.95, 20, 4, 5000);
        assert_eq!(termination.update(20), 0);
    }

    #[test]
    fn high_inlier_ratio_needs_few_iterations() {
        let mut termination = StandardTermination::new(0.99, 120, 4, 5000);
        // 100 of 120 inliers: w^s ~ 0.48, bound ~ ceil(ln 0.01 / ln 0.52) ~ 8.
        let bound = termination.update(100);
        assert!(bound <= 10, "bound {bound} too loose");
        assert!(bound >= 1);
    }

    #[test]
    fn improvement_after_plateau_does_not_loosen() {
        let mut termination = StandardTermination::new(0.95, 100, 7, 5000);
        let tight = termination.update(90);
        // A later, worse report (possible across parallel workers) must not
        // loosen the bound.
        assert_eq!(termination.update(40), tight);
    }
}
