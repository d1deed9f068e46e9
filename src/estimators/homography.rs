//! Homography estimation from point correspondences.

use nalgebra::{DMatrix, DVector, Matrix3};

use crate::core::{DataMatrix, Estimator};
use crate::degeneracy::homography_sample_good;
use crate::models::Homography;
use crate::utils::gauss_elimination;

/// 4-point minimal solver (Gaussian elimination with `h22 = 1`) plus a
/// weighted inhomogeneous DLT for non-minimal samples.
#[derive(Clone, Copy, Debug, Default)]
pub struct HomographyEstimator;

impl HomographyEstimator {
    pub fn new() -> Self {
        Self
    }

    fn estimate_minimal(&self, data: &DataMatrix, sample: &[usize]) -> Vec<Homography> {
        // 8x9 augmented system [A | b] with h22 fixed to one.
        let mut augmented = DMatrix::<f64>::zeros(8, 9);
        for (i, &idx) in sample.iter().enumerate() {
            let x1 = data[(idx, 0)];
            let y1 = data[(idx, 1)];
            let x2 = data[(idx, 2)];
            let y2 = data[(idx, 3)];

            augmented[(2 * i, 0)] = -x1;
            augmented[(2 * i, 1)] = -y1;
            augmented[(2 * i, 2)] = -1.0;
            augmented[(2 * i, 6)] = x2 * x1;
            augmented[(2 * i, 7)] = x2 * y1;
            augmented[(2 * i, 8)] = -x2;

            augmented[(2 * i + 1, 3)] = -x1;
            augmented[(2 * i + 1, 4)] = -y1;
            augmented[(2 * i + 1, 5)] = -1.0;
            augmented[(2 * i + 1, 6)] = y2 * x1;
            augmented[(2 * i + 1, 7)] = y2 * y1;
            augmented[(2 * i + 1, 8)] = -y2;
        }

        let mut h = DVector::<f64>::zeros(8);
        if !gauss_elimination(&mut augmented, &mut h) {
            return Vec::new();
        }
        if h.iter().any(|v| !v.is_finite()) {
            return Vec::new();
        }

        let h_mat = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0);
        vec![Homography::new(h_mat)]
    }
}

impl Estimator for HomographyEstimator {
    type Model = Homography;

    fn sample_size(&self) -> usize {
        4
    }

    fn max_solutions(&self) -> usize {
        1
    }

    fn is_sample_good(&self, data: &DataMatrix, sample: &[usize]) -> bool {
        sample.len() >= 4 && homography_sample_good(data, sample)
    }

    fn estimate(&self, data: &DataMatrix, sample: &[usize]) -> Vec<Homography> {
        if sample.len() < self.sample_size() {
            return Vec::new();
        }
        if sample.len() == self.sample_size() {
            return self.estimate_minimal(data, sample);
        }
        self.estimate_non_minimal(data, sample, None)
    }

    fn estimate_non_minimal(
        &self,
        data: &DataMatrix,
        sample: &[usize],
        weights: Option<&[f64]>,
    ) -> Vec<Homography> {
        let n = sample.len();
        if n < self.sample_size() {
            return Vec::new();
        }

        let mut coefficients = DMatrix::<f64>::zeros(2 * n, 8);
        let mut inhomogeneous = DVector::<f64>::zeros(2 * n);

        for (i, &idx) in sample.iter().enumerate() {
            let x1 = data[(idx, 0)];
            let y1 = data[(idx, 1)];
            let x2 = data[(idx, 2)];
            let y2 = data[(idx, 3)];

            let weight = weights.map(|w| w[idx]).unwrap_or(1.0);
            let wx1 = -weight * x1;
            let wy1 = -weight * y1;
            let wx2 = weight * x2;
            let wy2 = weight * y2;

            coefficients[(2 * i, 0)] = wx1;
            coefficients[(2 * i, 1)] = wy1;
            coefficients[(2 * i, 2)] = -weight;
            coefficients[(2 * i, 6)] = wx2 * x1;
            coefficients[(2 * i, 7)] = wx2 * y1;
            inhomogeneous[2 * i] = -wx2;

            coefficients[(2 * i + 1, 3)] = wx1;
            coefficients[(2 * i + 1, 4)] = wy1;
            coefficients[(2 * i + 1, 5)] = -weight;
            coefficients[(2 * i + 1, 6)] = wy2 * x1;
            coefficients[(2 * i + 1, 7)] = wy2 * y1;
            inhomogeneous[2 * i + 1] = -wy2;
        }

        let Ok(h) = coefficients.svd(true, true).solve(&inhomogeneous, 1e-12) else {
            return Vec::new();
        };
        if h.iter().any(|v| !v.is_finite()) {
            return Vec::new();
        }

        let h_mat = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0);
        vec![Homography::new(h_mat)]
    }

    fn is_model_valid(&self, _data: &DataMatrix, model: &Homography, _sample: &[usize]) -> bool {
        let det = model.h.determinant().abs();
        det > 1e-4 && det < 1e4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Residual;
    use crate::residuals::ForwardReprojection;

    fn affine_scene(n: usize) -> DataMatrix {
        // x' = 1.2x - 0.1y + 7, y' = 0.2x + 0.9y - 4
        let mut data = DataMatrix::zeros(n, 4);
        for i in 0..n {
            let x = (i % 5) as f64 * 11.0 + 1.0;
            let y = (i / 5) as f64 * 7.0 + 2.0;
            data[(i, 0)] = x;
            data[(i, 1)] = y;
            data[(i, 2)] = 1.2 * x - 0.1 * y + 7.0;
            data[(i, 3)] = 0.2 * x + 0.9 * y - 4.0;
        }
        data
    }

    #[test]
    fn minimal_solver_interpolates_the_sample() {
        let data = affine_scene(10);
        let estimator = HomographyEstimator::new();
        let sample = [0, 3, 7, 9];
        let models = estimator.estimate(&data, &sample);
        assert_eq!(models.len(), 1);

        let r = ForwardReprojection;
        for &idx in &sample {
            assert!(r.error(&data, &models[0], idx) < 1e-8);
        }
        // And, since the scene is a global affinity, every other point too.
        for idx in 0..data.nrows() {
            assert!(r.error(&data, &models[0], idx) < 1e-6);
        }
    }

    #[test]
    fn non_minimal_solver_fits_all_points() {
        let data = affine_scene(15);
        let estimator = HomographyEstimator::new();
        let sample: Vec<usize> = (0..15).collect();
        let models = estimator.estimate_non_minimal(&data, &sample, None);
        assert_eq!(models.len(), 1);

        let r = ForwardReprojection;
        for idx in 0..data.nrows() {
            assert!(r.error(&data, &models[0], idx) < 1e-6);
        }
    }

    #[test]
    fn weights_steer_the_fit() {
        let mut data = affine_scene(12);
        // Corrupt one point; weight it to zero.
        data[(5, 2)] += 40.0;
        let estimator = HomographyEstimator::new();
        let sample: Vec<usize> = (0..12).collect();
        let mut weights = vec![1.0; 12];
        weights[5] = 0.0;

        let models = estimator.estimate_non_minimal(&data, &sample, Some(&weights));
        assert_eq!(models.len(), 1);
        let r = ForwardReprojection;
        for idx in (0..12).filter(|&i| i != 5) {
            assert!(r.error(&data, &models[0], idx) < 1e-6);
        }
    }
}
