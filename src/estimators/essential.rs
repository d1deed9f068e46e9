//! Essential matrix estimation.
//!
//! The minimal solver follows Nister's five-point method: the epipolar
//! constraints of five correspondences leave a four-dimensional null space
//! `E = x E1 + y E2 + z E3 + E4`; the rank and trace constraints expand to
//! ten cubic equations over the twenty monomials in `(x, y, z)`, and after
//! Gauss-Jordan elimination three eliminant rows reduce the system to a
//! degree-10 polynomial in `z` whose real roots yield the candidates.

use nalgebra::{DMatrix, Matrix3, SVD};

use crate::core::{DataMatrix, Estimator};
use crate::degeneracy::oriented_epipolar_valid;
use crate::models::{EssentialMatrix, FundamentalMatrix};
use crate::utils::{find_roots_deg10, polyval};

use super::fundamental::FundamentalEstimator;

// Monomial ordering of degree <= 3 polynomials in (x, y, z). The first ten
// columns are eliminated by Gauss-Jordan; the tail block only carries
// monomials linear in x and y, which is what makes the eliminant rows
// polynomial in z alone.
const MONOMIALS: [(usize, usize, usize); 20] = [
    (3, 0, 0), // x^3
    (0, 3, 0), // y^3
    (2, 1, 0), // x^2 y
    (1, 2, 0), // x y^2
    (2, 0, 1), // x^2 z
    (2, 0, 0), // x^2
    (0, 2, 1), // y^2 z
    (0, 2, 0), // y^2
    (1, 1, 1), // x y z
    (1, 1, 0), // x y
    (1, 0, 2), // x z^2
    (1, 0, 1), // x z
    (1, 0, 0), // x
    (0, 1, 2), // y z^2
    (0, 1, 1), // y z
    (0, 1, 0), // y
    (0, 0, 3), // z^3
    (0, 0, 2), // z^2
    (0, 0, 1), // z
    (0, 0, 0), // 1
];

type Poly = [f64; 20];

fn monomial_index(e: (usize, usize, usize)) -> usize {
    MONOMIALS
        .iter()
        .position(|&m| m == e)
        .expect("monomial degree exceeds three")
}

fn poly_mul(a: &Poly, b: &Poly) -> Poly {
    let mut out = [0.0; 20];
    for (i, &ca) in a.iter().enumerate() {
        if ca == 0.0 {
            continue;
        }
        let (ax, ay, az) = MONOMIALS[i];
        for (j, &cb) in b.iter().enumerate() {
            if cb == 0.0 {
                continue;
            }
            let (bx, by, bz) = MONOMIALS[j];
            out[monomial_index((ax + bx, ay + by, az + bz))] += ca * cb;
        }
    }
    out
}

fn poly_add(a: &Poly, b: &Poly) -> Poly {
    let mut out = *a;
    for (o, v) in out.iter_mut().zip(b.iter()) {
        *o += v;
    }
    out
}

fn poly_sub(a: &Poly, b: &Poly) -> Poly {
    let mut out = *a;
    for (o, v) in out.iter_mut().zip(b.iter()) {
        *o -= v;
    }
    out
}

fn poly_scale(a: &Poly, s: f64) -> Poly {
    let mut out = *a;
    for o in &mut out {
        *o *= s;
    }
    out
}

// Univariate helpers for the z-polynomials of the eliminant rows.
fn uni_mul(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, &ca) in a.iter().enumerate() {
        for (j, &cb) in b.iter().enumerate() {
            out[i + j] += ca * cb;
        }
    }
    out
}

fn uni_sub(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len().max(b.len())];
    for (i, &v) in a.iter().enumerate() {
        out[i] += v;
    }
    for (i, &v) in b.iter().enumerate() {
        out[i] -= v;
    }
    out
}

// Eliminant row: coefficient polynomials in z for x, y and the constant
// part, built as row_high - z * row_low over the tail block.
struct Eliminant {
    px: [f64; 4],
    py: [f64; 4],
    pc: [f64; 5],
}

fn eliminant(high: &[f64], low: &[f64]) -> Eliminant {
    // Tail columns: xz^2, xz, x, yz^2, yz, y, z^3, z^2, z, 1 at 10..19.
    Eliminant {
        px: [
            high[12],
            high[11] - low[12],
            high[10] - low[11],
            -low[10],
        ],
        py: [
            high[15],
            high[14] - low[15],
            high[13] - low[14],
            -low[13],
        ],
        pc: [
            high[19],
            high[18] - low[19],
            high[17] - low[18],
            high[16] - low[17],
            -low[16],
        ],
    }
}

/// 5-point minimal solver plus an 8-point-and-project non-minimal solver.
#[derive(Clone, Copy, Debug, Default)]
pub struct EssentialEstimator;

impl EssentialEstimator {
    pub fn new() -> Self {
        Self
    }

    // Four-dimensional null space of the 5x9 epipolar system, as row-major
    // 3x3 matrices.
    fn null_space(data: &DataMatrix, sample: &[usize]) -> Option<[Matrix3<f64>; 4]> {
        let mut a = DMatrix::<f64>::zeros(sample.len(), 9);
        for (i, &idx) in sample.iter().enumerate() {
            let x1 = data[(idx, 0)];
            let y1 = data[(idx, 1)];
            let x2 = data[(idx, 2)];
            let y2 = data[(idx, 3)];
            a[(i, 0)] = x2 * x1;
            a[(i, 1)] = x2 * y1;
            a[(i, 2)] = x2;
            a[(i, 3)] = y2 * x1;
            a[(i, 4)] = y2 * y1;
            a[(i, 5)] = y2;
            a[(i, 6)] = x1;
            a[(i, 7)] = y1;
            a[(i, 8)] = 1.0;
        }
        let ata = a.transpose() * &a;
        let svd = SVD::new(ata, false, true);
        let v_t = svd.v_t?;

        let mut basis = [Matrix3::zeros(); 4];
        for (b, row) in basis.iter_mut().zip(5..9) {
            *b = Matrix3::new(
                v_t[(row, 0)],
                v_t[(row, 1)],
                v_t[(row, 2)],
                v_t[(row, 3)],
                v_t[(row, 4)],
                v_t[(row, 5)],
                v_t[(row, 6)],
                v_t[(row, 7)],
                v_t[(row, 8)],
            );
        }
        Some(basis)
    }

    // The ten cubic constraint polynomials over the monomial basis:
    // det(E) = 0 and 2 E E^T E - trace(E E^T) E = 0.
    fn constraint_matrix(basis: &[Matrix3<f64>; 4]) -> DMatrix<f64> {
        // Symbolic entries of E(x, y, z): degree-1 polynomials.
        let mut e: [[Poly; 3]; 3] = [[[0.0; 20]; 3]; 3];
        let slots = [
            monomial_index((1, 0, 0)),
            monomial_index((0, 1, 0)),
            monomial_index((0, 0, 1)),
            monomial_index((0, 0, 0)),
        ];
        for r in 0..3 {
            for c in 0..3 {
                for (k, &slot) in slots.iter().enumerate() {
                    e[r][c][slot] = basis[k][(r, c)];
                }
            }
        }

        let mut m = DMatrix::<f64>::zeros(10, 20);

        // det(E) by cofactor expansion along the first row.
        let minor = |a: &Poly, b: &Poly, c: &Poly, d: &Poly| poly_sub(&poly_mul(a, b), &poly_mul(c, d));
        let det = poly_add(
            &poly_sub(
                &poly_mul(&e[0][0], &minor(&e[1][1], &e[2][2], &e[1][2], &e[2][1])),
                &poly_mul(&e[0][1], &minor(&e[1][0], &e[2][2], &e[1][2], &e[2][0])),
            ),
            &poly_mul(&e[0][2], &minor(&e[1][0], &e[2][1], &e[1][1], &e[2][0])),
        );
        for (col, &v) in det.iter().enumerate() {
            m[(0, col)] = v;
        }

        // P = E E^T (degree-2 entries) and its trace.
        let mut p: [[Poly; 3]; 3] = [[[0.0; 20]; 3]; 3];
        for r in 0..3 {
            for c in 0..3 {
                let mut acc = [0.0; 20];
                for k in 0..3 {
                    acc = poly_add(&acc, &poly_mul(&e[r][k], &e[c][k]));
                }
                p[r][c] = acc;
            }
        }
        let trace = poly_add(&poly_add(&p[0][0], &p[1][1]), &p[2][2]);

        // Rows 1..9: entries of 2 P E - trace * E.
        for r in 0..3 {
            for c in 0..3 {
                let mut acc = [0.0; 20];
                for k in 0..3 {
                    acc = poly_add(&acc, &poly_mul(&p[r][k], &e[k][c]));
                }
                let row = poly_sub(&poly_scale(&acc, 2.0), &poly_mul(&trace, &e[r][c]));
                for (col, &v) in row.iter().enumerate() {
                    m[(1 + 3 * r + c, col)] = v;
                }
            }
        }
        m
    }

    // Full Gauss-Jordan reduction of the leading 10x10 block.
    fn gauss_jordan(m: &mut DMatrix<f64>) -> bool {
        for col in 0..10 {
            let mut pivot = col;
            let mut pivot_value = m[(col, col)].abs();
            for row in (col + 1)..10 {
                let value = m[(row, col)].abs();
                if value > pivot_value {
                    pivot = row;
                    pivot_value = value;
                }
            }
            if pivot_value < 1e-12 {
                return false;
            }
            if pivot != col {
                m.swap_rows(pivot, col);
            }
            let inv = 1.0 / m[(col, col)];
            for j in col..20 {
                m[(col, j)] *= inv;
            }
            for row in 0..10 {
                if row == col {
                    continue;
                }
                let factor = m[(row, col)];
                if factor == 0.0 {
                    continue;
                }
                for j in col..20 {
                    m[(row, j)] -= factor * m[(col, j)];
                }
            }
        }
        true
    }

    fn estimate_five_point(&self, data: &DataMatrix, sample: &[usize]) -> Vec<EssentialMatrix> {
        let Some(basis) = Self::null_space(data, sample) else {
            return Vec::new();
        };
        let mut m = Self::constraint_matrix(&basis);
        if !Self::gauss_jordan(&mut m) {
            return Vec::new();
        }

        // Rows with leading monomials x^2 z, x^2, y^2 z, y^2, xyz, xy.
        let row = |i: usize| -> Vec<f64> { (0..20).map(|j| m[(i, j)]).collect() };
        let k = eliminant(&row(4), &row(5));
        let l = eliminant(&row(6), &row(7));
        let mm = eliminant(&row(8), &row(9));

        // Determinant of the 3x3 eliminant system: a degree-10 polynomial.
        // det = kx (ly mc - my lc) - ky (lx mc - mx lc) + kc (lx my - mx ly)
        let det = uni_sub(
            &uni_sub(
                &uni_mul(&k.px, &uni_sub(&uni_mul(&l.py, &mm.pc), &uni_mul(&mm.py, &l.pc))),
                &uni_mul(&k.py, &uni_sub(&uni_mul(&l.px, &mm.pc), &uni_mul(&mm.px, &l.pc))),
            ),
            &uni_mul(
                &k.pc,
                &uni_sub(&uni_mul(&mm.px, &l.py), &uni_mul(&l.px, &mm.py)),
            ),
        );
        let mut coeffs = [0.0; 11];
        for (c, &v) in coeffs.iter_mut().zip(det.iter()) {
            *c = v;
        }

        let mut roots = [0.0; 10];
        let n_roots = find_roots_deg10(&coeffs, &mut roots);

        let mut models = Vec::with_capacity(n_roots);
        for &z in roots.iter().take(n_roots) {
            // Solve for (x, y) from the two best-conditioned eliminant rows.
            let rows = [
                (polyval(&k.px, z), polyval(&k.py, z), polyval(&k.pc, z)),
                (polyval(&l.px, z), polyval(&l.py, z), polyval(&l.pc, z)),
                (polyval(&mm.px, z), polyval(&mm.py, z), polyval(&mm.pc, z)),
            ];
            let mut best = None;
            for (i, a) in rows.iter().enumerate() {
                for b in rows.iter().skip(i + 1) {
                    let det2 = a.0 * b.1 - a.1 * b.0;
                    if best.map_or(true, |(d, _, _)| det2.abs() > f64::abs(d)) {
                        best = Some((det2, *a, *b));
                    }
                }
            }
            let Some((det2, a, b)) = best else {
                continue;
            };
            if det2.abs() < 1e-14 {
                continue;
            }
            let x = (-a.2 * b.1 + a.1 * b.2) / det2;
            let y = (-a.0 * b.2 + a.2 * b.0) / det2;

            let e = basis[0] * x + basis[1] * y + basis[2] * z + basis[3];
            let norm = e.norm();
            if norm < 1e-12 || e.iter().any(|v| !v.is_finite()) {
                continue;
            }
            models.push(EssentialMatrix::new(e / norm));
        }
        models
    }

    /// Project a matrix onto the essential manifold: two equal singular
    /// values, third zero.
    pub fn enforce_constraints(f: &Matrix3<f64>) -> Option<Matrix3<f64>> {
        let svd = SVD::new(*f, true, true);
        let u = svd.u?;
        let v_t = svd.v_t?;
        let s = svd.singular_values;
        let avg = (s[0] + s[1]) / 2.0;
        let w = Matrix3::new(avg, 0.0, 0.0, 0.0, avg, 0.0, 0.0, 0.0, 0.0);
        Some(u * w * v_t)
    }
}

impl Estimator for EssentialEstimator {
    type Model = EssentialMatrix;

    fn sample_size(&self) -> usize {
        5
    }

    fn max_solutions(&self) -> usize {
        10
    }

    fn is_sample_good(&self, _data: &DataMatrix, sample: &[usize]) -> bool {
        sample.len() >= self.sample_size()
    }

    fn estimate(&self, data: &DataMatrix, sample: &[usize]) -> Vec<EssentialMatrix> {
        if sample.len() < self.sample_size() {
            return Vec::new();
        }
        if sample.len() == 5 {
            return self.estimate_five_point(data, sample);
        }
        self.estimate_non_minimal(data, sample, None)
    }

    fn estimate_non_minimal(
        &self,
        data: &DataMatrix,
        sample: &[usize],
        weights: Option<&[f64]>,
    ) -> Vec<EssentialMatrix> {
        let fundamental = FundamentalEstimator::new();
        let models = fundamental.estimate_non_minimal(data, sample, weights);
        models
            .into_iter()
            .filter_map(|m| Self::enforce_constraints(&m.f))
            .map(EssentialMatrix::new)
            .collect()
    }

    fn is_model_valid(
        &self,
        data: &DataMatrix,
        model: &EssentialMatrix,
        sample: &[usize],
    ) -> bool {
        oriented_epipolar_valid(data, &model.e, sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Residual;
    use crate::residuals::SymmetricGeometricDistance;
    use crate::utils::skew_symmetric;
    use nalgebra::Vector3;

    // Calibrated two-view scene with known relative pose; returns the data
    // table and the ground-truth E = [t]x R.
    fn calibrated_scene(n: usize) -> (DataMatrix, Matrix3<f64>) {
        let angle = 0.1f64;
        let (sin, cos) = angle.sin_cos();
        let r = Matrix3::new(cos, 0.0, sin, 0.0, 1.0, 0.0, -sin, 0.0, cos);
        let t = Vector3::new(0.4, 0.1, 0.05);

        let mut data = DataMatrix::zeros(n, 4);
        for i in 0..n {
            let x = -1.0 + 0.23 * (i % 9) as f64;
            let y = -0.8 + 0.19 * (i / 9) as f64;
            let z = 3.0 + 0.4 * ((i * 3) % 7) as f64;
            let p = Vector3::new(x, y, z);
            let q = r * p + t;
            data[(i, 0)] = x / z;
            data[(i, 1)] = y / z;
            data[(i, 2)] = q.x / q.z;
            data[(i, 3)] = q.y / q.z;
        }
        (data, skew_symmetric(&t) * r)
    }

    #[test]
    fn constraint_matrix_vanishes_on_essential_members() {
        // Any essential matrix satisfies det and trace constraints; plug a
        // known E into the symbolic rows at the matching (x, y, z).
        let (data, _) = calibrated_scene(45);
        let sample = [0, 9, 19, 29, 39];
        let basis = EssentialEstimator::null_space(&data, &sample).unwrap();
        let m = EssentialEstimator::constraint_matrix(&basis);
        assert_eq!(m.nrows(), 10);
        assert_eq!(m.ncols(), 20);
        // The degree-0 column of det(E4) equals det of the last basis matrix.
        let det_col = m[(0, 19)];
        assert!((det_col - basis[3].determinant()).abs() < 1e-9);
    }

    #[test]
    fn five_point_solver_recovers_the_true_essential_matrix() {
        let (data, e_true) = calibrated_scene(45);
        let estimator = EssentialEstimator::new();
        let sample = [0, 9, 19, 29, 39];
        let models = estimator.estimate(&data, &sample);
        assert!(!models.is_empty(), "no candidates from the 5-point solver");

        let r = SymmetricGeometricDistance;
        // At least one candidate reproduces the scene's epipolar geometry.
        let best_max_err = models
            .iter()
            .map(|m| {
                (0..data.nrows())
                    .map(|i| r.error(&data, m, i))
                    .fold(0.0f64, f64::max)
            })
            .fold(f64::MAX, f64::min);
        assert!(best_max_err < 1e-10, "best candidate max error {best_max_err}");

        // And is close to the ground truth up to scale and sign.
        let e_true = e_true / e_true.norm();
        let close = models.iter().any(|m| {
            let e = m.e / m.e.norm();
            (e - e_true).norm() < 1e-6 || (e + e_true).norm() < 1e-6
        });
        assert!(close, "no candidate matched ground truth");
    }

    #[test]
    fn five_point_candidates_satisfy_internal_constraints() {
        let (data, _) = calibrated_scene(45);
        let estimator = EssentialEstimator::new();
        let models = estimator.estimate(&data, &[2, 11, 21, 31, 41]);
        for m in &models {
            assert!(m.e.determinant().abs() < 1e-8);
            let svd = SVD::new(m.e, false, false);
            let s = svd.singular_values;
            assert!((s[0] - s[1]).abs() < 1e-6, "singular values not paired");
            assert!(s[2].abs() < 1e-8);
        }
    }

    #[test]
    fn non_minimal_fit_projects_to_the_essential_manifold() {
        let (data, _) = calibrated_scene(45);
        let estimator = EssentialEstimator::new();
        let sample: Vec<usize> = (0..45).collect();
        let models = estimator.estimate_non_minimal(&data, &sample, None);
        assert_eq!(models.len(), 1);
        let svd = SVD::new(models[0].e, false, false);
        let s = svd.singular_values;
        assert!((s[0] - s[1]).abs() < 1e-9);
        assert!(s[2].abs() < 1e-9);
    }
}
