//! Per-point error metrics.
//!
//! Each metric is a zero-sized [`Residual`] implementation; the model is
//! passed to every call, so holders never share mutable state. Reprojection
//! metrics return squared pixel distances (their thresholds are squared by
//! the configuration); the Sampson and symmetric geometric distances are
//! used with thresholds in their own domain.

use nalgebra::{Vector3, Vector4};

use crate::core::{DataMatrix, Residual};
use crate::models::{EssentialMatrix, FundamentalMatrix, Homography, Projection};

/// Squared forward reprojection error of a homography:
/// `|| proj(H x) - x' ||^2`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ForwardReprojection;

impl Residual for ForwardReprojection {
    type Model = Homography;

    fn error(&self, data: &DataMatrix, model: &Homography, point: usize) -> f64 {
        let h = &model.h;
        let (x, y) = (data[(point, 0)], data[(point, 1)]);
        let (x2, y2) = (data[(point, 2)], data[(point, 3)]);

        let w = h[(2, 0)] * x + h[(2, 1)] * y + h[(2, 2)];
        if w.abs() < 1e-12 {
            return f64::MAX;
        }
        let px = (h[(0, 0)] * x + h[(0, 1)] * y + h[(0, 2)]) / w;
        let py = (h[(1, 0)] * x + h[(1, 1)] * y + h[(1, 2)]) / w;
        let dx = px - x2;
        let dy = py - y2;
        dx * dx + dy * dy
    }
}

/// Squared Sampson distance to the epipolar constraint:
/// `(x'^T F x)^2 / ||grad||^2`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SampsonDistance;

impl Residual for SampsonDistance {
    type Model = FundamentalMatrix;

    fn error(&self, data: &DataMatrix, model: &FundamentalMatrix, point: usize) -> f64 {
        let f = &model.f;
        let x1 = Vector3::new(data[(point, 0)], data[(point, 1)], 1.0);
        let x2 = Vector3::new(data[(point, 2)], data[(point, 3)], 1.0);

        let f_x1 = f * x1;
        let ft_x2 = f.transpose() * x2;
        let c = x2.dot(&f_x1);

        let denom = f_x1.x * f_x1.x + f_x1.y * f_x1.y + ft_x2.x * ft_x2.x + ft_x2.y * ft_x2.y;
        if denom < 1e-14 {
            return 0.0;
        }
        c * c / denom
    }
}

/// Squared symmetric geometric distance: point-to-epipolar-line distance in
/// both images.
#[derive(Clone, Copy, Debug, Default)]
pub struct SymmetricGeometricDistance;

impl Residual for SymmetricGeometricDistance {
    type Model = EssentialMatrix;

    fn error(&self, data: &DataMatrix, model: &EssentialMatrix, point: usize) -> f64 {
        let e = &model.e;
        let x1 = Vector3::new(data[(point, 0)], data[(point, 1)], 1.0);
        let x2 = Vector3::new(data[(point, 2)], data[(point, 3)], 1.0);

        let e_x1 = e * x1;
        let et_x2 = e.transpose() * x2;
        let c = x2.dot(&e_x1);
        let c2 = c * c;

        let n1 = e_x1.x * e_x1.x + e_x1.y * e_x1.y;
        let n2 = et_x2.x * et_x2.x + et_x2.y * et_x2.y;
        if n1 < 1e-14 || n2 < 1e-14 {
            return f64::MAX;
        }
        c2 / n1 + c2 / n2
    }
}

/// Squared reprojection error of a projection matrix over `(u, v, X, Y, Z)`
/// rows. Points projecting behind the camera are pushed out of any sane
/// threshold.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProjectionReprojection;

impl Residual for ProjectionReprojection {
    type Model = Projection;

    fn error(&self, data: &DataMatrix, model: &Projection, point: usize) -> f64 {
        let world = Vector4::new(
            data[(point, 2)],
            data[(point, 3)],
            data[(point, 4)],
            1.0,
        );
        let projected = model.p * world;
        if projected.z <= 1e-12 {
            return f64::MAX;
        }
        let du = projected.x / projected.z - data[(point, 0)];
        let dv = projected.y / projected.z - data[(point, 1)];
        du * du + dv * dv
    }
}
