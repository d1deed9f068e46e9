//! Public entry points.
//!
//! Each function merges the caller's point matrices into the engine's row
//! layout, wires the components appropriate for the model class and runs
//! the loop. Pass `None` for the parameters to get the per-problem defaults
//! derived from `threshold`; pass `Some` (built by the matching
//! [`RansacParams`] constructor) to customize the run.

use nalgebra::{DMatrix, Matrix3};

use crate::config::{LocalOptimMethod, PolishingMethod, RansacParams};
use crate::core::{DataMatrix, DegeneracyGuard, Estimator, NoDegeneracy, Residual};
use crate::degeneracy::FundamentalDegeneracy;
use crate::error::RansacError;
use crate::estimators::{
    EssentialEstimator, FundamentalEstimator, HomographyEstimator, PnPEstimator,
};
use crate::local_optimization::{InnerRansacOptimizer, LeastSquaresPolisher};
use crate::models::{EssentialMatrix, FundamentalMatrix, Homography, Projection};
use crate::ransac::{Ransac, RansacOutput};
use crate::residuals::{
    ForwardReprojection, ProjectionReprojection, SampsonDistance, SymmetricGeometricDistance,
};
use crate::samplers::Sampler;
use crate::scoring::Quality;
use crate::utils::{calibrate_points, calibrated_threshold};
use crate::verifier::Verifier;

fn merge_two_view(
    points1: &DMatrix<f64>,
    points2: &DMatrix<f64>,
) -> Result<DataMatrix, RansacError> {
    if points1.nrows() != points2.nrows() {
        return Err(RansacError::BadInput(format!(
            "point counts differ: {} vs {}",
            points1.nrows(),
            points2.nrows()
        )));
    }
    if points1.ncols() != 2 || points2.ncols() != 2 {
        return Err(RansacError::BadInput(
            "two-view points must be Nx2 matrices".into(),
        ));
    }
    let n = points1.nrows();
    let mut data = DataMatrix::zeros(n, 4);
    for i in 0..n {
        data[(i, 0)] = points1[(i, 0)];
        data[(i, 1)] = points1[(i, 1)];
        data[(i, 2)] = points2[(i, 0)];
        data[(i, 3)] = points2[(i, 1)];
    }
    Ok(data)
}

// One generic assembly point so every entry point wires components the
// same way.
fn run_pipeline<E, R, D>(
    data: &DataMatrix,
    mut params: RansacParams,
    estimator: E,
    residual: R,
    degeneracy: D,
) -> Result<RansacOutput<E::Model>, RansacError>
where
    E: Estimator + Sync,
    E::Model: Send + Sync,
    R: Residual<Model = E::Model> + Send + Sync,
    D: DegeneracyGuard<Model = E::Model> + Sync,
{
    params.sample_size = estimator.sample_size();
    let points_size = data.nrows();
    if points_size < params.sample_size {
        return Err(RansacError::InsufficientData {
            needed: params.sample_size,
            got: points_size,
        });
    }

    let quality = Quality::new(params.score, params.threshold, residual.clone());
    let sampler = Sampler::from_params(
        params.sampler,
        params.seed,
        params.sample_size,
        points_size,
    );
    let verifier = Verifier::from_params(
        params.verification,
        params.seed.wrapping_add(1),
        points_size,
        params.threshold,
        params.sprt,
        params.score,
        residual,
    );

    let local_optimizer = if params.local_optimization == LocalOptimMethod::None {
        None
    } else {
        Some(InnerRansacOptimizer::new(
            params.seed.wrapping_add(3),
            estimator.clone(),
            quality.clone_for_worker(),
            params.lo_sample_size,
            params.lo_inner_iterations,
        ))
    };
    let polisher = if params.polisher == PolishingMethod::LeastSquares {
        Some(LeastSquaresPolisher::new(
            estimator.clone(),
            quality.clone_for_worker(),
            params.final_lsq_iterations,
        ))
    } else {
        None
    };

    Ransac::new(
        params,
        estimator,
        quality,
        sampler,
        verifier,
        degeneracy,
        local_optimizer,
        polisher,
    )
    .run(data)
}

/// Robustly fit a homography to two matched 2D point sets (`Nx2` each).
/// `threshold` is the inlier reprojection threshold in pixels.
pub fn find_homography(
    points1: &DMatrix<f64>,
    points2: &DMatrix<f64>,
    threshold: f64,
    params: Option<RansacParams>,
) -> Result<RansacOutput<Homography>, RansacError> {
    let data = merge_two_view(points1, points2)?;
    let params = params.unwrap_or_else(|| RansacParams::homography(threshold));
    run_pipeline(
        &data,
        params,
        HomographyEstimator::new(),
        ForwardReprojection,
        NoDegeneracy::<Homography>::new(),
    )
}

/// Robustly fit a fundamental matrix to two matched 2D point sets, guarded
/// against the dominant-plane degeneracy. `threshold` bounds the Sampson
/// distance of inliers.
pub fn find_fundamental_mat(
    points1: &DMatrix<f64>,
    points2: &DMatrix<f64>,
    threshold: f64,
    params: Option<RansacParams>,
) -> Result<RansacOutput<FundamentalMatrix>, RansacError> {
    let data = merge_two_view(points1, points2)?;
    let params = params.unwrap_or_else(|| RansacParams::fundamental(threshold));
    let degeneracy = FundamentalDegeneracy::new(
        params.seed.wrapping_add(2),
        data.nrows(),
        7,
        params.threshold,
        4.0 * params.threshold,
    );
    run_pipeline(
        &data,
        params,
        FundamentalEstimator::new(),
        SampsonDistance,
        degeneracy,
    )
}

/// Robustly fit an essential matrix to two matched 2D point sets with known
/// intrinsics. Points are mapped to normalized camera coordinates and the
/// pixel `threshold` is scaled by the mean focal length; a `Some` params'
/// threshold field is replaced by that calibrated value.
pub fn find_essential_mat(
    points1: &DMatrix<f64>,
    points2: &DMatrix<f64>,
    k1: &Matrix3<f64>,
    k2: &Matrix3<f64>,
    threshold: f64,
    params: Option<RansacParams>,
) -> Result<RansacOutput<EssentialMatrix>, RansacError> {
    let data = merge_two_view(points1, points2)?;
    let calibrated = calibrate_points(k1, k2, &data)
        .ok_or_else(|| RansacError::BadInput("singular intrinsic matrix".into()))?;

    let mut params = params.unwrap_or_else(|| RansacParams::essential(0.0));
    params.threshold = calibrated_threshold(threshold, k1, k2);
    run_pipeline(
        &calibrated,
        params,
        EssentialEstimator::new(),
        SymmetricGeometricDistance,
        NoDegeneracy::<EssentialMatrix>::new(),
    )
}

/// Robustly estimate a camera projection matrix from 2D image points
/// (`Nx2`) and 3D object points (`Nx3`). `threshold` is the inlier
/// reprojection threshold in pixels.
pub fn solve_pnp_ransac(
    image_points: &DMatrix<f64>,
    object_points: &DMatrix<f64>,
    threshold: f64,
    params: Option<RansacParams>,
) -> Result<RansacOutput<Projection>, RansacError> {
    if image_points.nrows() != object_points.nrows() {
        return Err(RansacError::BadInput(format!(
            "point counts differ: {} vs {}",
            image_points.nrows(),
            object_points.nrows()
        )));
    }
    if image_points.ncols() != 2 || object_points.ncols() != 3 {
        return Err(RansacError::BadInput(
            "pose input must be Nx2 image points and Nx3 object points".into(),
        ));
    }
    let n = image_points.nrows();
    let mut data = DataMatrix::zeros(n, 5);
    for i in 0..n {
        data[(i, 0)] = image_points[(i, 0)];
        data[(i, 1)] = image_points[(i, 1)];
        data[(i, 2)] = object_points[(i, 0)];
        data[(i, 3)] = object_points[(i, 1)];
        data[(i, 4)] = object_points[(i, 2)];
    }

    let params = params.unwrap_or_else(|| RansacParams::pnp(threshold));
    run_pipeline(
        &data,
        params,
        PnPEstimator::new(),
        ProjectionReprojection,
        NoDegeneracy::<Projection>::new(),
    )
}
