//! Geometric model value types.
//!
//! Models are small matrices wrapped in newtypes so estimator, residual and
//! degeneracy pairings are checked by the type system. They are cheap to
//! copy; the loop clones them freely per hypothesis.

use nalgebra::{Matrix3, Matrix3x4};

/// Planar projective transformation between two views.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Homography {
    pub h: Matrix3<f64>,
}

impl Homography {
    pub fn new(h: Matrix3<f64>) -> Self {
        Self { h }
    }
}

/// Fundamental matrix relating two uncalibrated pinhole views.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FundamentalMatrix {
    pub f: Matrix3<f64>,
}

impl FundamentalMatrix {
    pub fn new(f: Matrix3<f64>) -> Self {
        Self { f }
    }
}

/// Essential matrix relating two calibrated views.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EssentialMatrix {
    pub e: Matrix3<f64>,
}

impl EssentialMatrix {
    pub fn new(e: Matrix3<f64>) -> Self {
        Self { e }
    }
}

/// Camera projection matrix mapping homogeneous world points to the image.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Projection {
    pub p: Matrix3x4<f64>,
}

impl Projection {
    pub fn new(p: Matrix3x4<f64>) -> Self {
        Self { p }
    }
}
