//! Extrinsic calibration between a monocular camera and a 3D lidar.
//!
//! Given a handful of synchronized image + point-cloud frames and a rough
//! initial guess of the rigid transform between the two sensors, this crate
//! refines the six-parameter transform by aligning edges detected
//! independently in each modality. The total objective combines:
//!
//! - a Gaussian-kernel convolution cost between projected lidar edge points
//!   and image edge score maps ([`edge_align`]),
//! - mutual information between camera grayscale and lidar reflectance at
//!   the projected points ([`mutual_info`]),
//! - reprojection residuals of hand-picked 2D/3D correspondences
//!   ([`corresp`]),
//! - a chamfer term from the distance transform of the image edge mask
//!   ([`chamfer`]).
//!
//! The transform is parameterized as a 6-vector `tau`: an axis-angle
//! rotation (radians) concatenated with a translation (meters). See
//! [`transform`] for the codec and [`optimize`] for the Nelder-Mead shell
//! with its degenerate-projection recovery loop.
//!
//! ## Example
//!
//! ```rust
//! use lidar_cam_cal::{project_frame, Intrinsics, Tau};
//! use nalgebra::{Matrix3, Point3};
//!
//! let k = Intrinsics::from_matrix(&Matrix3::new(
//!     720.0, 0.0, 320.0, //
//!     0.0, 720.0, 240.0, //
//!     0.0, 0.0, 1.0,
//! ))
//! .unwrap();
//! let tau = Tau::zeros();
//! let points = vec![Point3::new(0.0, 0.0, 5.0)];
//! let tables = project_frame(&tau, &k, 640, 480, &points);
//! assert!(tables.in_frustum[0]);
//! ```
#![deny(rust_2018_idioms)]

use thiserror::Error;

pub mod chamfer;
pub mod config;
pub mod corresp;
pub mod edge_align;
pub mod frame;
pub mod image_edge;
pub mod mutual_info;
pub mod optimize;
pub mod pc_edge;
pub mod project;
pub mod transform;
pub mod viz;

pub use config::CalibConfig;
pub use corresp::Correspondences;
pub use edge_align::EdgeAlignParams;
pub use frame::Frame;
pub use image_edge::{CannyParams, EdgeMethod, ImageEdges};
pub use optimize::{calibrate, CalibrationInput, CalibrationOutcome, OptimizeParams, Weights};
pub use pc_edge::{detect_pc_edges, EdgeThreshold, PcEdgeParams, PcEdges};
pub use project::{project_all, project_frame, FrameTables, FrustumFloor, Intrinsics};
pub use transform::{rt_to_tau, tau_to_rt, Tau};

#[derive(Error, Debug)]
pub enum CalibError {
    /// The current transform leaves too few points inside the camera
    /// frustum to trust any cost term. Recoverable: the optimizer shell
    /// perturbs the transform and retries.
    #[error("degenerate projection: {in_frustum} of {total} points in frustum")]
    BadProjection { in_frustum: usize, total: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// All perturb-and-retry attempts after degenerate projections failed.
    #[error("optimization failed: restart budget exhausted after {attempts} attempts")]
    RestartsExhausted { attempts: usize },

    #[error("solver error: {0}")]
    Solver(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, CalibError>;
