//! Degenerate-configuration tests and recovery.
//!
//! Two cheap pre-scoring tests guard the hypothesis stream: the four-point
//! orientation test for homography samples and the oriented epipolar
//! constraint for F/E candidates. The expensive path is the dominant-plane
//! failure of fundamental-matrix estimation, repaired by plane-and-parallax
//! after Chum et al., "Two-view geometry estimation unaffected by a
//! dominant plane", CVPR 2005.

use log::debug;
use nalgebra::{Matrix3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ScoreMethod;
use crate::core::{DataMatrix, DegeneracyGuard, Residual};
use crate::models::{FundamentalMatrix, Homography};
use crate::residuals::{ForwardReprojection, SampsonDistance};
use crate::scoring::{Quality, Score};
use crate::utils::skew_symmetric;

/// General-position test for a four-point homography sample: for both line
/// pairs (1-2 and 3-4), the other two points must lie on consistent sides
/// in both images. Rejects collinear triples and orientation flips.
pub fn homography_sample_good(data: &DataMatrix, sample: &[usize]) -> bool {
    let pt = |i: usize| {
        (
            data[(sample[i], 0)],
            data[(sample[i], 1)],
            data[(sample[i], 2)],
            data[(sample[i], 3)],
        )
    };
    let (x1, y1, u1, v1) = pt(0);
    let (x2, y2, u2, v2) = pt(1);
    let (x3, y3, u3, v3) = pt(2);
    let (x4, y4, u4, v4) = pt(3);

    // Line through points 1-2 in each image, as cross products.
    let ab = (y1 - y2, x2 - x1, x1 * y2 - y1 * x2);
    let ab2 = (v1 - v2, u2 - u1, u1 * v2 - v1 * u2);

    if (ab.0 * x3 + ab.1 * y3 + ab.2) * (ab2.0 * u3 + ab2.1 * v3 + ab2.2) < 0.0 {
        return false;
    }
    if (ab.0 * x4 + ab.1 * y4 + ab.2) * (ab2.0 * u4 + ab2.1 * v4 + ab2.2) < 0.0 {
        return false;
    }

    let cd = (y3 - y4, x4 - x3, x3 * y4 - y3 * x4);
    let cd2 = (v3 - v4, u4 - u3, u3 * v4 - v3 * u4);

    if (cd.0 * x1 + cd.1 * y1 + cd.2) * (cd2.0 * u1 + cd2.1 * v1 + cd2.2) < 0.0 {
        return false;
    }
    if (cd.0 * x2 + cd.1 * y2 + cd.2) * (cd2.0 * u2 + cd2.1 * v2 + cd2.2) < 0.0 {
        return false;
    }
    true
}

// Null vector of the rank-2 matrix as a cross product of two rows, with a
// fallback when the first pair is linearly dependent.
fn epipole(f: &Matrix3<f64>) -> Vector3<f64> {
    let r0 = Vector3::new(f[(0, 0)], f[(0, 1)], f[(0, 2)]);
    let r1 = Vector3::new(f[(1, 0)], f[(1, 1)], f[(1, 2)]);
    let r2 = Vector3::new(f[(2, 0)], f[(2, 1)], f[(2, 2)]);
    let ec = r0.cross(&r2);
    if ec.iter().any(|c| c.abs() > 1.9984e-15) {
        ec
    } else {
        r1.cross(&r2)
    }
}

/// Oriented epipolar (cheirality) constraint: all sample points must induce
/// epipolar orientation signs matching the first point's, otherwise the
/// reconstruction puts points on both sides of the camera.
pub fn oriented_epipolar_valid(data: &DataMatrix, f: &Matrix3<f64>, sample: &[usize]) -> bool {
    let ec = epipole(f);
    let orientation = |idx: usize| {
        let (x1, y1) = (data[(idx, 0)], data[(idx, 1)]);
        let (x2, y2) = (data[(idx, 2)], data[(idx, 3)]);
        (f[(0, 0)] * x2 + f[(1, 0)] * y2 + f[(2, 0)]) * (ec.y - ec.z * y1)
    };

    let sign = orientation(sample[0]);
    sample[1..].iter().all(|&idx| sign * orientation(idx) >= 0.0)
}

/// Dominant-plane guard for fundamental matrices.
///
/// A promising F estimated from a sample whose points mostly lie on one
/// scene plane is consistent with that plane's homography rather than with
/// the true epipolar geometry. The guard fits homographies to triplets of
/// the sample; once five or more sample points agree with one of them, the
/// sample is declared degenerate and a confidence-driven inner search over
/// plane-off points rebuilds F from the homography and two parallax points.
#[derive(Debug, Clone)]
pub struct FundamentalDegeneracy {
    rng: StdRng,
    quality: Quality<SampsonDistance>,
    h_residual: ForwardReprojection,
    homography_threshold: f64,
    h_samples: Vec<[usize; 3]>,
    points_size: usize,
    sample_size: usize,
    log_confidence: f64,
}

impl FundamentalDegeneracy {
    pub fn new(
        seed: u64,
        points_size: usize,
        sample_size: usize,
        sampson_threshold: f64,
        homography_threshold: f64,
    ) -> Self {
        // Five triplets cover the degenerate configurations of a 7-point
        // sample; an 8-point sample needs five more.
        let mut h_samples = vec![[0, 1, 2], [3, 4, 5], [0, 1, 6], [3, 4, 6], [2, 5, 6]];
        if sample_size == 8 {
            h_samples.extend([[0, 1, 7], [0, 2, 7], [3, 5, 7], [3, 6, 7], [2, 4, 7]]);
        }
        Self {
            rng: StdRng::seed_from_u64(seed),
            quality: Quality::new(ScoreMethod::Msac, sampson_threshold, SampsonDistance),
            h_residual: ForwardReprojection,
            homography_threshold,
            h_samples,
            points_size,
            sample_size,
            log_confidence: 0.05f64.ln(),
        }
    }

    // Plane-induced homography H = A - e' (M^-1 b)^T with A = [e']x F,
    // from one triplet of sample points. None when M is singular.
    fn homography_from_triplet(
        &self,
        data: &DataMatrix,
        sample: &[usize],
        triplet: &[usize; 3],
        e_prime: &Vector3<f64>,
        a: &Matrix3<f64>,
    ) -> Option<Matrix3<f64>> {
        let mut m = Matrix3::zeros();
        let mut b = Vector3::zeros();

        for (row, &local) in triplet.iter().enumerate() {
            let idx = sample[local];
            let xi = Vector3::new(data[(idx, 0)], data[(idx, 1)], 1.0);
            let xi_prime = Vector3::new(data[(idx, 2)], data[(idx, 3)], 1.0);

            let xprime_cross_eprime = xi_prime.cross(e_prime);
            let norm_sq = xprime_cross_eprime.norm_squared();
            if norm_sq < 1e-14 {
                return None;
            }
            let xprime_cross_ax = xi_prime.cross(&(a * xi));
            b[row] = xprime_cross_ax.dot(&xprime_cross_eprime) / norm_sq;

            m[(row, 0)] = xi.x;
            m[(row, 1)] = xi.y;
            m[(row, 2)] = 1.0;
        }

        let m_inv = m.try_inverse()?;
        Some(a - e_prime * (m_inv * b).transpose())
    }

    // Inner plane-and-parallax RANSAC: pairs of homography outliers define
    // candidate epipolar geometries consistent with the plane.
    fn plane_and_parallax(
        &mut self,
        data: &DataMatrix,
        h: &Matrix3<f64>,
    ) -> (Score, Option<FundamentalMatrix>) {
        let homography = Homography::new(*h);
        let mut best_score = Score::worst();
        let mut best_f = None;

        let mut max_iters = 100usize;
        let mut iters = 0usize;
        while iters < max_iters {
            iters += 1;

            let pt1 = self.rng.gen_range(0..self.points_size);
            let mut pt2 = self.rng.gen_range(0..self.points_size);
            while pt2 == pt1 {
                pt2 = self.rng.gen_range(0..self.points_size);
            }

            // Only pairs off the plane carry parallax.
            if self.h_residual.error(data, &homography, pt1) <= self.homography_threshold
                || self.h_residual.error(data, &homography, pt2) <= self.homography_threshold
            {
                continue;
            }

            let x1 = Vector3::new(data[(pt1, 0)], data[(pt1, 1)], 1.0);
            let x2 = Vector3::new(data[(pt2, 0)], data[(pt2, 1)], 1.0);
            let x1_prime = Vector3::new(data[(pt1, 2)], data[(pt1, 3)], 1.0);
            let x2_prime = Vector3::new(data[(pt2, 2)], data[(pt2, 3)], 1.0);

            // F = [(x1' x Hx1) x (x2' x Hx2)]x H
            let line = (x1_prime.cross(&(h * x1))).cross(&(x2_prime.cross(&(h * x2))));
            let f = FundamentalMatrix::new(skew_symmetric(&line) * h);

            let score = self.quality.score(data, &f);
            if score.is_better(&best_score) {
                best_score = score;
                best_f = Some(f);

                let ratio = score.inlier_number as f64 / self.points_size as f64;
                let predicted = self.log_confidence / (1.0 - ratio * ratio).ln();
                if predicted.is_finite() && predicted < max_iters as f64 {
                    max_iters = predicted.ceil() as usize;
                }
            }
        }
        (best_score, best_f)
    }
}

impl DegeneracyGuard for FundamentalDegeneracy {
    type Model = FundamentalMatrix;

    fn recover_if_degenerate(
        &mut self,
        data: &DataMatrix,
        sample: &[usize],
        candidate: &FundamentalMatrix,
    ) -> Option<(FundamentalMatrix, Score)> {
        let f = &candidate.f;

        // Left epipole: null space of F^T.
        let c0 = f.column(0).into_owned();
        let c1 = f.column(1).into_owned();
        let c2 = f.column(2).into_owned();
        let mut e_prime = c0.cross(&c2);
        if e_prime.iter().all(|c| c.abs() < 1e-10) {
            e_prime = c1.cross(&c2);
        }

        let a = skew_symmetric(&e_prime) * f;

        let mut is_degenerate = false;
        let mut best_score = Score::worst();
        let mut best_model = *candidate;

        let triplets = self.h_samples.clone();
        for triplet in &triplets {
            let Some(h) = self.homography_from_triplet(data, sample, triplet, &e_prime, &a) else {
                continue;
            };
            let homography = Homography::new(h);
            let on_plane = sample
                .iter()
                .filter(|&&idx| {
                    self.h_residual.error(data, &homography, idx) < self.homography_threshold
                })
                .count();

            if on_plane >= 5 {
                is_degenerate = true;
                let (score, model) = self.plane_and_parallax(data, &h);
                if let Some(model) = model {
                    if score.is_better(&best_score) {
                        best_score = score;
                        best_model = model;
                    }
                }
            }
        }

        if is_degenerate {
            debug!(
                "degenerate fundamental sample; recovered model supports {} points",
                best_score.inlier_number
            );
            Some((best_model, best_score))
        } else {
            None
        }
    }

    fn clone_for_worker(&self, seed: u64) -> Self {
        Self::new(
            seed,
            self.points_size,
            self.sample_size,
            self.quality.threshold(),
            self.homography_threshold,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Estimator;
    use crate::estimators::FundamentalEstimator;

    #[test]
    fn orientation_flip_is_rejected() {
        // Point 2 sits left of the 0-1 line in the first image but right of
        // it in the second: no homography maps this sample consistently.
        let rows = [
            [0.0, 0.0, 10.0, 10.0],
            [1.0, 0.0, 11.0, 10.0],
            [0.5, 1.0, 10.5, 9.0],
            [0.5, -1.0, 10.5, -1.0 + 10.0],
        ];
        let mut data = DataMatrix::zeros(4, 4);
        for (i, row) in rows.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                data[(i, j)] = v;
            }
        }
        assert!(!homography_sample_good(&data, &[0, 1, 2, 3]));
    }

    #[test]
    fn orientation_preserving_sample_is_accepted() {
        // A quad mapped by a plain translation keeps orientation.
        let mut data = DataMatrix::zeros(4, 4);
        let quad = [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        for (i, (x, y)) in quad.iter().enumerate() {
            data[(i, 0)] = *x;
            data[(i, 1)] = *y;
            data[(i, 2)] = *x + 5.0;
            data[(i, 3)] = *y - 2.0;
        }
        assert!(homography_sample_good(&data, &[0, 1, 2, 3]));
    }

    #[test]
    fn oriented_constraint_accepts_consistent_geometry() {
        // Pure-translation F with all correspondences on matching epipolar
        // lines and identical disparity signs.
        let f = Matrix3::new(0.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, 1.0, 0.0);
        let mut data = DataMatrix::zeros(7, 4);
        for i in 0..7 {
            let x = i as f64 * 3.0;
            let y = 1.0 + i as f64;
            data[(i, 0)] = x;
            data[(i, 1)] = y;
            data[(i, 2)] = x + 4.0;
            data[(i, 3)] = y;
        }
        let sample: Vec<usize> = (0..7).collect();
        assert!(oriented_epipolar_valid(&data, &f, &sample));
    }

    // Synthetic two-camera scene: 50 points on the z=5 plane and a handful
    // of points well off it, projected into two views with a lateral
    // baseline.
    fn dominant_plane_scene() -> (DataMatrix, Vec<usize>) {
        let project = |x: f64, y: f64, z: f64, tx: f64| {
            // Second camera translated by tx, both with focal 100.
            let u1 = 100.0 * x / z;
            let v1 = 100.0 * y / z;
            let u2 = 100.0 * (x - tx) / z;
            let v2 = 100.0 * y / z;
            (u1, v1, u2, v2)
        };

        let mut rows = Vec::new();
        for i in 0..50 {
            let x = -2.0 + 0.08 * i as f64;
            let y = -1.5 + 0.06 * i as f64;
            let (u1, v1, u2, v2) = project(x, y, 5.0, 1.0);
            rows.push([u1, v1, u2, v2]);
        }
        // Parallax points at very different depths.
        for i in 0..10 {
            let x = -1.0 + 0.2 * i as f64;
            let y = 0.5 - 0.15 * i as f64;
            let z = 2.0 + 0.3 * i as f64;
            let (u1, v1, u2, v2) = project(x, y, z, 1.0);
            rows.push([u1, v1, u2, v2]);
        }

        let mut data = DataMatrix::zeros(rows.len(), 4);
        for (i, row) in rows.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                data[(i, j)] = v;
            }
        }
        // An all-on-plane minimal sample.
        (data, vec![0, 7, 14, 21, 28, 35, 42])
    }

    #[test]
    fn dominant_plane_sample_triggers_recovery() {
        let (data, sample) = dominant_plane_scene();
        let estimator = FundamentalEstimator::new();
        let models = estimator.estimate(&data, &sample);
        assert!(!models.is_empty(), "7-point solver failed on plane sample");

        let mut guard = FundamentalDegeneracy::new(42, data.nrows(), 7, 1.0, 4.0);
        let mut triggered = false;
        for model in &models {
            if let Some((recovered, score)) = guard.recover_if_degenerate(&data, &sample, model) {
                triggered = true;
                if score.inlier_number > 0 {
                    // The recovered F must explain the parallax points too.
                    let quality = Quality::new(ScoreMethod::Msac, 2.0, SampsonDistance);
                    let off_plane: Vec<usize> = (50..60).collect();
                    let close = off_plane
                        .iter()
                        .filter(|&&i| SampsonDistance.error(&data, &recovered, i) < 4.0)
                        .count();
                    let full = quality.score(&data, &recovered);
                    assert!(full.inlier_number >= score.inlier_number / 2);
                    assert!(close >= 5, "parallax residuals too large");
                }
            }
        }
        assert!(triggered, "plane-and-parallax never fired");
    }
}
