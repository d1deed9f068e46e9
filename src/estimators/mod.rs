//! Minimal and non-minimal model solvers wired by the entry points.

mod essential;
mod fundamental;
mod homography;
mod pnp;

pub use essential::EssentialEstimator;
pub use fundamental::FundamentalEstimator;
pub use homography::HomographyEstimator;
pub use pnp::PnPEstimator;
