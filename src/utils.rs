//! Shared numerics: seeded sampling helpers, small linear solvers and the
//! polynomial root finders used by the minimal solvers.

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use rand::rngs::StdRng;
use rand::Rng;

/// Fill `out` with distinct values drawn uniformly from `[0, upper)`.
///
/// Rejection sampling; suitable for the small sample sizes of minimal
/// solvers, where collisions are rare.
pub fn draw_unique(rng: &mut StdRng, out: &mut [usize], upper: usize) {
    debug_assert!(out.len() <= upper);
    for i in 0..out.len() {
        loop {
            let candidate = rng.gen_range(0..upper);
            if out[..i].iter().all(|&v| v != candidate) {
                out[i] = candidate;
                break;
            }
        }
    }
}

/// Skew-symmetric matrix `[v]x` such that `[v]x * w == v.cross(&w)`.
pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Gaussian elimination with partial pivoting on an `[A | b]` system.
/// Returns `false` for (near-)singular systems.
pub fn gauss_elimination(augmented: &mut DMatrix<f64>, result: &mut DVector<f64>) -> bool {
    let n = augmented.nrows();
    if n + 1 != augmented.ncols() || n != result.len() {
        return false;
    }

    for i in 0..n {
        let mut max_row = i;
        let mut max_val = augmented[(i, i)].abs();
        for k in (i + 1)..n {
            let val = augmented[(k, i)].abs();
            if val > max_val {
                max_val = val;
                max_row = k;
            }
        }
        if max_row != i {
            augmented.swap_rows(i, max_row);
        }
        if augmented[(i, i)].abs() < 1e-10 {
            return false;
        }
        for k in (i + 1)..n {
            let factor = augmented[(k, i)] / augmented[(i, i)];
            for j in i..augmented.ncols() {
                augmented[(k, j)] -= factor * augmented[(i, j)];
            }
        }
    }

    for i in (0..n).rev() {
        result[i] = augmented[(i, n)];
        for j in (i + 1)..n {
            result[i] -= augmented[(i, j)] * result[j];
        }
        result[i] /= augmented[(i, i)];
    }
    true
}

/// Real roots of `x^3 + c2 x^2 + c1 x + c0 = 0`. Returns the root count
/// (1 or 3); roots are refined by one Newton step.
pub fn solve_cubic_real(c2: f64, c1: f64, c0: f64, roots: &mut [f64; 3]) -> usize {
    let a = c1 - c2 * c2 / 3.0;
    let b = (2.0 * c2 * c2 * c2 - 9.0 * c2 * c1) / 27.0 + c0;
    let mut c = b * b / 4.0 + a * a * a / 27.0;

    let n_roots = if c > 0.0 {
        c = c.sqrt();
        let b_neg = -0.5 * b;
        roots[0] = (b_neg + c).cbrt() + (b_neg - c).cbrt() - c2 / 3.0;
        1
    } else {
        c = 3.0 * b / (2.0 * a) * (-3.0 / a).sqrt();
        let d = 2.0 * (-a / 3.0).sqrt();
        let acos_c = c.clamp(-1.0, 1.0).acos();
        const TWO_PI_3: f64 = 2.0943951023931953;
        const FOUR_PI_3: f64 = 4.1887902047863905;
        roots[0] = d * (acos_c / 3.0).cos() - c2 / 3.0;
        roots[1] = d * (acos_c / 3.0 - TWO_PI_3).cos() - c2 / 3.0;
        roots[2] = d * (acos_c / 3.0 - FOUR_PI_3).cos() - c2 / 3.0;
        3
    };

    for root in roots.iter_mut().take(n_roots) {
        let x = *root;
        let x2 = x * x;
        let denom = 3.0 * x2 + 2.0 * c2 * x + c1;
        if denom.abs() > 1e-12 {
            *root -= (x * x2 + c2 * x2 + c1 * x + c0) / denom;
        }
    }
    n_roots
}

/// Evaluate a dense polynomial `coeffs[0] + coeffs[1] x + ...` by Horner.
#[inline]
pub fn polyval(coeffs: &[f64], x: f64) -> f64 {
    let mut acc = 0.0;
    for &c in coeffs.iter().rev() {
        acc = acc * x + c;
    }
    acc
}

/// Real roots of a degree-10 polynomial (ascending coefficients) inside the
/// Cauchy bound, by sign-change bracketing and Newton refinement. Returns
/// the number of roots stored.
pub fn find_roots_deg10(coeffs: &[f64; 11], roots: &mut [f64; 10]) -> usize {
    let lead = coeffs[10];
    if lead.abs() < 1e-14 {
        return 0;
    }
    let mut monic = [0.0; 11];
    for (m, &c) in monic.iter_mut().zip(coeffs.iter()) {
        *m = c / lead;
    }

    // Derivative for Newton steps.
    let mut deriv = [0.0; 10];
    for (i, d) in deriv.iter_mut().enumerate() {
        *d = monic[i + 1] * (i as f64 + 1.0);
    }

    // Cauchy bound on the magnitude of any real root.
    let bound = 1.0 + monic[..10].iter().fold(0.0f64, |m, c| m.max(c.abs()));

    const STEPS: usize = 4096;
    let step = 2.0 * bound / STEPS as f64;
    let mut n_roots = 0usize;
    let mut x0 = -bound;
    let mut f0 = polyval(&monic, x0);
    for _ in 0..STEPS {
        let x1 = x0 + step;
        let f1 = polyval(&monic, x1);
        if (f0 < 0.0) != (f1 < 0.0) {
            let mut x = 0.5 * (x0 + x1);
            for _ in 0..30 {
                let fx = polyval(&monic, x);
                let fpx = polyval(&deriv, x);
                if fpx.abs() < 1e-14 {
                    break;
                }
                let dx = fx / fpx;
                x -= dx;
                if dx.abs() < 1e-12 {
                    break;
                }
            }
            // Newton can escape the bracket on flat stretches; fall back to
            // the bracket midpoint via bisection in that case.
            if !(x0..=x1).contains(&x) {
                let (mut lo, mut hi, mut flo) = (x0, x1, f0);
                for _ in 0..60 {
                    let mid = 0.5 * (lo + hi);
                    let fmid = polyval(&monic, mid);
                    if (flo < 0.0) != (fmid < 0.0) {
                        hi = mid;
                    } else {
                        lo = mid;
                        flo = fmid;
                    }
                }
                x = 0.5 * (lo + hi);
            }
            if n_roots < roots.len() {
                roots[n_roots] = x;
                n_roots += 1;
            }
        }
        x0 = x1;
        f0 = f1;
    }
    n_roots
}

/// Map image points of both views to normalized camera coordinates.
///
/// `data` rows are `(x, y, x', y')`; the result applies `K1^-1` to the first
/// view and `K2^-1` to the second.
pub fn calibrate_points(
    k1: &Matrix3<f64>,
    k2: &Matrix3<f64>,
    data: &DMatrix<f64>,
) -> Option<DMatrix<f64>> {
    let k1_inv = k1.try_inverse()?;
    let k2_inv = k2.try_inverse()?;
    let mut out = DMatrix::zeros(data.nrows(), 4);
    for i in 0..data.nrows() {
        let p1 = k1_inv * Vector3::new(data[(i, 0)], data[(i, 1)], 1.0);
        let p2 = k2_inv * Vector3::new(data[(i, 2)], data[(i, 3)], 1.0);
        out[(i, 0)] = p1.x / p1.z;
        out[(i, 1)] = p1.y / p1.z;
        out[(i, 2)] = p2.x / p2.z;
        out[(i, 3)] = p2.y / p2.z;
    }
    Some(out)
}

/// Scale a pixel threshold into the normalized-coordinate domain of the
/// squared symmetric geometric distance.
pub fn calibrated_threshold(threshold: f64, k1: &Matrix3<f64>, k2: &Matrix3<f64>) -> f64 {
    let mean_focal = (k1[(0, 0)] + k1[(1, 1)] + k2[(0, 0)] + k2[(1, 1)]) / 4.0;
    let scaled = threshold / mean_focal;
    scaled * scaled
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn draw_unique_is_distinct_in_range_and_deterministic() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let mut s1 = [0usize; 5];
        let mut s2 = [0usize; 5];
        for _ in 0..50 {
            draw_unique(&mut a, &mut s1, 11);
            draw_unique(&mut b, &mut s2, 11);
            assert_eq!(s1, s2);
            assert!(s1.iter().all(|&v| v < 11));
            for i in 0..s1.len() {
                for j in (i + 1)..s1.len() {
                    assert_ne!(s1[i], s1[j]);
                }
            }
        }
    }

    #[test]
    fn gauss_elimination_solves_small_system() {
        // x + 2y = 5, 3x - y = 1  =>  x = 1, y = 2
        let mut aug = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 5.0, 3.0, -1.0, 1.0]);
        let mut x = DVector::zeros(2);
        assert!(gauss_elimination(&mut aug, &mut x));
        assert!((x[0] - 1.0).abs() < 1e-10);
        assert!((x[1] - 2.0).abs() < 1e-10);
    }

    #[test]
    fn cubic_solver_finds_known_roots() {
        // (x - 1)(x - 2)(x - 3) = x^3 - 6x^2 + 11x - 6
        let mut roots = [0.0; 3];
        let n = solve_cubic_real(-6.0, 11.0, -6.0, &mut roots);
        assert_eq!(n, 3);
        let mut sorted = roots.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        for (root, expected) in sorted.iter().zip([1.0, 2.0, 3.0]) {
            assert!((root - expected).abs() < 1e-8);
        }
    }

    #[test]
    fn degree10_root_finder_recovers_planted_roots() {
        // (x^2 - 1)(x^2 - 4) * x^6 has sign-change roots at +-1, +-2.
        // Build coefficients of (x^2-1)(x^2-4) = x^4 - 5x^2 + 4, times x^6.
        let mut coeffs = [0.0; 11];
        coeffs[6] = 4.0;
        coeffs[8] = -5.0;
        coeffs[10] = 1.0;
        let mut roots = [0.0; 10];
        let n = find_roots_deg10(&coeffs, &mut roots);
        assert!(n >= 4);
        for target in [-2.0, -1.0, 1.0, 2.0] {
            assert!(
                roots[..n].iter().any(|r| (r - target).abs() < 1e-6),
                "missing root {target}, got {:?}",
                &roots[..n]
            );
        }
    }

    #[test]
    fn skew_symmetric_matches_cross_product() {
        let v = Vector3::new(0.3, -1.2, 2.0);
        let w = Vector3::new(-0.7, 0.4, 1.1);
        let lhs = skew_symmetric(&v) * w;
        let rhs = v.cross(&w);
        assert!((lhs - rhs).norm() < 1e-12);
    }
}
