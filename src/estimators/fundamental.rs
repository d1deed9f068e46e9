//! Fundamental matrix estimation.

use nalgebra::{DMatrix, Matrix3, SVD};

use crate::core::{DataMatrix, Estimator};
use crate::degeneracy::oriented_epipolar_valid;
use crate::models::FundamentalMatrix;
use crate::utils::solve_cubic_real;

/// 7-point minimal solver (null-space pair plus the rank cubic) and a
/// Hartley-normalized 8-point solver for non-minimal samples.
#[derive(Clone, Copy, Debug, Default)]
pub struct FundamentalEstimator;

impl FundamentalEstimator {
    pub fn new() -> Self {
        Self
    }

    fn epipolar_row(a: &mut DMatrix<f64>, row: usize, x1: f64, y1: f64, x2: f64, y2: f64, w: f64) {
        a[(row, 0)] = w * x2 * x1;
        a[(row, 1)] = w * x2 * y1;
        a[(row, 2)] = w * x2;
        a[(row, 3)] = w * y2 * x1;
        a[(row, 4)] = w * y2 * y1;
        a[(row, 5)] = w * y2;
        a[(row, 6)] = w * x1;
        a[(row, 7)] = w * y1;
        a[(row, 8)] = w;
    }

    /// Hartley normalization: translate centroids to the origin and scale
    /// mean distances to sqrt(2), per image.
    fn normalize_points(
        data: &DataMatrix,
        sample: &[usize],
    ) -> Option<(DMatrix<f64>, Matrix3<f64>, Matrix3<f64>)> {
        let n = sample.len();
        let (mut cx1, mut cy1, mut cx2, mut cy2) = (0.0, 0.0, 0.0, 0.0);
        for &idx in sample {
            cx1 += data[(idx, 0)];
            cy1 += data[(idx, 1)];
            cx2 += data[(idx, 2)];
            cy2 += data[(idx, 3)];
        }
        let inv_n = 1.0 / n as f64;
        cx1 *= inv_n;
        cy1 *= inv_n;
        cx2 *= inv_n;
        cy2 *= inv_n;

        let (mut d1, mut d2) = (0.0, 0.0);
        for &idx in sample {
            d1 += ((data[(idx, 0)] - cx1).powi(2) + (data[(idx, 1)] - cy1).powi(2)).sqrt();
            d2 += ((data[(idx, 2)] - cx2).powi(2) + (data[(idx, 3)] - cy2).powi(2)).sqrt();
        }
        d1 *= inv_n;
        d2 *= inv_n;
        if d1 < 1e-10 || d2 < 1e-10 {
            return None;
        }

        let s1 = std::f64::consts::SQRT_2 / d1;
        let s2 = std::f64::consts::SQRT_2 / d2;
        let t1 = Matrix3::new(s1, 0.0, -s1 * cx1, 0.0, s1, -s1 * cy1, 0.0, 0.0, 1.0);
        let t2 = Matrix3::new(s2, 0.0, -s2 * cx2, 0.0, s2, -s2 * cy2, 0.0, 0.0, 1.0);

        let mut normalized = DMatrix::zeros(n, 4);
        for (i, &idx) in sample.iter().enumerate() {
            normalized[(i, 0)] = (data[(idx, 0)] - cx1) * s1;
            normalized[(i, 1)] = (data[(idx, 1)] - cy1) * s1;
            normalized[(i, 2)] = (data[(idx, 2)] - cx2) * s2;
            normalized[(i, 3)] = (data[(idx, 3)] - cy2) * s2;
        }
        Some((normalized, t1, t2))
    }

    fn estimate_seven_point(&self, data: &DataMatrix, sample: &[usize]) -> Vec<FundamentalMatrix> {
        let Some((normalized, t1, t2)) = Self::normalize_points(data, sample) else {
            return Vec::new();
        };
        let mut coefficients = DMatrix::<f64>::zeros(7, 9);
        for i in 0..sample.len() {
            Self::epipolar_row(
                &mut coefficients,
                i,
                normalized[(i, 0)],
                normalized[(i, 1)],
                normalized[(i, 2)],
                normalized[(i, 3)],
                1.0,
            );
        }

        // Two-dimensional null space of the 7x9 system, from the spectrum
        // of the 9x9 normal matrix (singular vectors come out sorted by
        // decreasing singular value).
        let ata = coefficients.transpose() * &coefficients;
        let svd = SVD::new(ata, false, true);
        let Some(v_t) = svd.v_t else {
            return Vec::new();
        };
        let f1: Vec<f64> = (0..9).map(|k| v_t[(7, k)]).collect();
        let f2: Vec<f64> = (0..9).map(|k| v_t[(8, k)]).collect();

        // det(lambda f1 + f2) = 0 expands to a cubic in lambda.
        let det3 = |m: &[f64]| {
            m[0] * (m[4] * m[8] - m[5] * m[7]) - m[1] * (m[3] * m[8] - m[5] * m[6])
                + m[2] * (m[3] * m[7] - m[4] * m[6])
        };
        // Coefficient of lambda^k by finite evaluation of the cubic
        // det(lambda f1 + f2) at four nodes.
        let eval = |lambda: f64| {
            let m: Vec<f64> = (0..9).map(|k| lambda * f1[k] + f2[k]).collect();
            det3(&m)
        };
        let p0 = eval(0.0);
        let p1 = eval(1.0);
        let pm1 = eval(-1.0);
        let p2 = eval(2.0);
        // Solve the Vandermonde system for c3 lambda^3 + c2 lambda^2 + c1 lambda + c0.
        let c0 = p0;
        let c2 = (p1 + pm1) / 2.0 - c0;
        let c3 = (p2 - 2.0 * p1 - 2.0 * c2 + c0) / 6.0;
        let c1 = p1 - c0 - c2 - c3;

        // The cubic can lose leading coefficients, down to the identically
        // zero pencil of a coplanar sample where every member is singular.
        let scale = c3.abs().max(c2.abs()).max(c1.abs()).max(c0.abs());
        let mut roots = [0.0; 3];
        let n_roots = if scale < 1e-14 {
            // Any combination works; hand back one member and let scoring
            // and the degeneracy guard judge it.
            roots[0] = 0.0;
            1
        } else if c3.abs() > 1e-10 * scale {
            let inv_c3 = 1.0 / c3;
            solve_cubic_real(c2 * inv_c3, c1 * inv_c3, c0 * inv_c3, &mut roots)
        } else if c2.abs() > 1e-10 * scale {
            let disc = c1 * c1 - 4.0 * c2 * c0;
            if disc < 0.0 {
                0
            } else {
                let sq = disc.sqrt();
                roots[0] = (-c1 + sq) / (2.0 * c2);
                roots[1] = (-c1 - sq) / (2.0 * c2);
                2
            }
        } else if c1.abs() > 1e-10 * scale {
            roots[0] = -c0 / c1;
            1
        } else {
            return Vec::new();
        };

        let mut models = Vec::with_capacity(n_roots);
        for &lambda in roots.iter().take(n_roots) {
            let mut f_vec: Vec<f64> = (0..9).map(|k| lambda * f1[k] + f2[k]).collect();
            let norm = f_vec.iter().map(|v| v * v).sum::<f64>().sqrt();
            if norm < 1e-12 || f_vec.iter().any(|v| !v.is_finite()) {
                continue;
            }
            for v in &mut f_vec {
                *v /= norm;
            }
            let f_hat = Matrix3::new(
                f_vec[0], f_vec[1], f_vec[2], f_vec[3], f_vec[4], f_vec[5], f_vec[6], f_vec[7],
                f_vec[8],
            );
            models.push(FundamentalMatrix::new(t2.transpose() * f_hat * t1));
        }
        models
    }

    /// Project onto the rank-2 manifold by zeroing the smallest singular
    /// value.
    pub fn recover_rank(f: &Matrix3<f64>) -> Option<Matrix3<f64>> {
        let svd = SVD::new(*f, true, true);
        let u = svd.u?;
        let v_t = svd.v_t?;
        let s = svd.singular_values;
        let w = Matrix3::new(s[0], 0.0, 0.0, 0.0, s[1], 0.0, 0.0, 0.0, 0.0);
        Some(u * w * v_t)
    }
}

impl Estimator for FundamentalEstimator {
    type Model = FundamentalMatrix;

    fn sample_size(&self) -> usize {
        7
    }

    fn max_solutions(&self) -> usize {
        3
    }

    fn is_sample_good(&self, _data: &DataMatrix, sample: &[usize]) -> bool {
        sample.len() >= self.sample_size()
    }

    fn estimate(&self, data: &DataMatrix, sample: &[usize]) -> Vec<FundamentalMatrix> {
        if sample.len() < self.sample_size() {
            return Vec::new();
        }
        if sample.len() == 7 {
            return self.estimate_seven_point(data, sample);
        }
        self.estimate_non_minimal(data, sample, None)
    }

    fn estimate_non_minimal(
        &self,
        data: &DataMatrix,
        sample: &[usize],
        weights: Option<&[f64]>,
    ) -> Vec<FundamentalMatrix> {
        let n = sample.len();
        if n < 8 {
            return Vec::new();
        }
        let Some((normalized, t1, t2)) = Self::normalize_points(data, sample) else {
            return Vec::new();
        };

        let mut a = DMatrix::<f64>::zeros(n, 9);
        for (i, &idx) in sample.iter().enumerate() {
            let w = weights.map(|w| w[idx]).unwrap_or(1.0);
            Self::epipolar_row(
                &mut a,
                i,
                normalized[(i, 0)],
                normalized[(i, 1)],
                normalized[(i, 2)],
                normalized[(i, 3)],
                w,
            );
        }

        let ata = a.transpose() * &a;
        let svd = SVD::new(ata, false, true);
        let Some(v_t) = svd.v_t else {
            return Vec::new();
        };
        let null = v_t.row(8);
        if null.iter().any(|v| !v.is_finite()) {
            return Vec::new();
        }

        let f_norm = Matrix3::new(
            null[0], null[1], null[2], null[3], null[4], null[5], null[6], null[7], null[8],
        );
        // Denormalize and restore the rank-2 constraint lost to least squares.
        let f = t2.transpose() * f_norm * t1;
        let Some(f) = Self::recover_rank(&f) else {
            return Vec::new();
        };
        vec![FundamentalMatrix::new(f)]
    }

    fn is_model_valid(
        &self,
        data: &DataMatrix,
        model: &FundamentalMatrix,
        sample: &[usize],
    ) -> bool {
        oriented_epipolar_valid(data, &model.f, sample)
    }
}
