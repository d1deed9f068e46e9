//! Universal sample consensus: robust model fitting for two-view geometry
//! (homography, fundamental and essential matrices) and camera pose, built
//! around a hypothesize-and-verify loop with SPRT preemptive verification,
//! adaptive termination, dominant-plane degeneracy recovery and an optional
//! parallel search.

pub mod api;
pub mod config;
pub mod core;
pub mod degeneracy;
pub mod error;
pub mod estimators;
pub mod local_optimization;
pub mod models;
pub mod ransac;
pub mod residuals;
pub mod samplers;
pub mod scoring;
pub mod termination;
pub mod utils;
pub mod verifier;

pub use api::{find_essential_mat, find_fundamental_mat, find_homography, solve_pnp_ransac};
pub use config::{
    LocalOptimMethod, PolishingMethod, RansacParams, SamplingMethod, ScoreMethod, SprtParams,
    VerificationMethod,
};
pub use error::RansacError;
pub use models::{EssentialMatrix, FundamentalMatrix, Homography, Projection};
pub use ransac::{Ransac, RansacOutput};
pub use scoring::Score;
