//! Camera pose estimation from 2D-3D correspondences.

use nalgebra::{DMatrix, Matrix3x4, SVD, Vector4};

use crate::core::{DataMatrix, Estimator};
use crate::models::Projection;

/// Direct linear transform over the 3x4 projection matrix: six
/// correspondences determine the twelve parameters up to scale. The
/// estimated matrix is re-signed so the sample lies in front of the camera.
#[derive(Clone, Copy, Debug, Default)]
pub struct PnPEstimator;

impl PnPEstimator {
    pub fn new() -> Self {
        Self
    }

    fn solve_dlt(
        &self,
        data: &DataMatrix,
        sample: &[usize],
        weights: Option<&[f64]>,
    ) -> Option<Projection> {
        let n = sample.len();
        let mut a = DMatrix::<f64>::zeros(2 * n, 12);
        for (i, &idx) in sample.iter().enumerate() {
            let u = data[(idx, 0)];
            let v = data[(idx, 1)];
            let x = data[(idx, 2)];
            let y = data[(idx, 3)];
            let z = data[(idx, 4)];
            let w = weights.map(|w| w[idx]).unwrap_or(1.0);

            a[(2 * i, 0)] = w * x;
            a[(2 * i, 1)] = w * y;
            a[(2 * i, 2)] = w * z;
            a[(2 * i, 3)] = w;
            a[(2 * i, 8)] = -w * u * x;
            a[(2 * i, 9)] = -w * u * y;
            a[(2 * i, 10)] = -w * u * z;
            a[(2 * i, 11)] = -w * u;

            a[(2 * i + 1, 4)] = w * x;
            a[(2 * i + 1, 5)] = w * y;
            a[(2 * i + 1, 6)] = w * z;
            a[(2 * i + 1, 7)] = w;
            a[(2 * i + 1, 8)] = -w * v * x;
            a[(2 * i + 1, 9)] = -w * v * y;
            a[(2 * i + 1, 10)] = -w * v * z;
            a[(2 * i + 1, 11)] = -w * v;
        }

        let ata = a.transpose() * &a;
        let svd = SVD::new(ata, false, true);
        let v_t = svd.v_t?;
        let p_vec = v_t.row(11);
        if p_vec.iter().any(|v| !v.is_finite()) {
            return None;
        }

        let mut p = Matrix3x4::zeros();
        for r in 0..3 {
            for c in 0..4 {
                p[(r, c)] = p_vec[4 * r + c];
            }
        }

        // Fix the sign so the first sample point has positive depth.
        let idx = sample[0];
        let world = Vector4::new(data[(idx, 2)], data[(idx, 3)], data[(idx, 4)], 1.0);
        if (p * world).z < 0.0 {
            p = -p;
        }
        Some(Projection::new(p))
    }
}

impl Estimator for PnPEstimator {
    type Model = Projection;

    fn sample_size(&self) -> usize {
        6
    }

    fn max_solutions(&self) -> usize {
        1
    }

    fn is_sample_good(&self, data: &DataMatrix, sample: &[usize]) -> bool {
        sample.len() >= self.sample_size() && data.ncols() >= 5
    }

    fn estimate(&self, data: &DataMatrix, sample: &[usize]) -> Vec<Projection> {
        if sample.len() < self.sample_size() {
            return Vec::new();
        }
        self.solve_dlt(data, sample, None).into_iter().collect()
    }

    fn estimate_non_minimal(
        &self,
        data: &DataMatrix,
        sample: &[usize],
        weights: Option<&[f64]>,
    ) -> Vec<Projection> {
        if sample.len() < self.sample_size() {
            return Vec::new();
        }
        self.solve_dlt(data, sample, weights).into_iter().collect()
    }

    /// Cheirality: every sample point must project with positive depth.
    fn is_model_valid(&self, data: &DataMatrix, model: &Projection, sample: &[usize]) -> bool {
        sample.iter().all(|&idx| {
            let world = Vector4::new(data[(idx, 2)], data[(idx, 3)], data[(idx, 4)], 1.0);
            (model.p * world).z > 0.0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Residual;
    use crate::residuals::ProjectionReprojection;
    use nalgebra::{Matrix3, Vector3};

    // Scene viewed by a camera rotated about y and pushed back along z.
    fn pose_scene(n: usize) -> DataMatrix {
        let angle = 0.15f64;
        let (sin, cos) = angle.sin_cos();
        let r = Matrix3::new(cos, 0.0, sin, 0.0, 1.0, 0.0, -sin, 0.0, cos);
        let t = Vector3::new(0.2, -0.1, 6.0);

        let mut data = DataMatrix::zeros(n, 5);
        for i in 0..n {
            let world = Vector3::new(
                -2.0 + 0.5 * (i % 5) as f64,
                -1.5 + 0.45 * ((i / 5) % 5) as f64,
                0.5 * (i % 7) as f64,
            );
            let cam = r * world + t;
            data[(i, 0)] = cam.x / cam.z;
            data[(i, 1)] = cam.y / cam.z;
            data[(i, 2)] = world.x;
            data[(i, 3)] = world.y;
            data[(i, 4)] = world.z;
        }
        data
    }

    #[test]
    fn dlt_recovers_the_projection() {
        let data = pose_scene(24);
        let estimator = PnPEstimator::new();
        let sample = [0, 4, 9, 13, 18, 22];
        let models = estimator.estimate(&data, &sample);
        assert_eq!(models.len(), 1);

        let r = ProjectionReprojection;
        for i in 0..data.nrows() {
            assert!(r.error(&data, &models[0], i) < 1e-8, "point {i}");
        }
        assert!(estimator.is_model_valid(&data, &models[0], &sample));
    }

    #[test]
    fn non_minimal_fit_uses_all_points() {
        let data = pose_scene(24);
        let estimator = PnPEstimator::new();
        let sample: Vec<usize> = (0..24).collect();
        let models = estimator.estimate_non_minimal(&data, &sample, None);
        assert_eq!(models.len(), 1);

        let r = ProjectionReprojection;
        let worst = (0..24)
            .map(|i| r.error(&data, &models[0], i))
            .fold(0.0f64, f64::max);
        assert!(worst < 1e-8);
    }
}
