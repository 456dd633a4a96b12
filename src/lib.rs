//! Flycave Calibration Tool
//!
//! Closed-loop geometric calibration for a multi-projector immersive display:
//! - A motorized 2-axis laser pointer is servoed onto known pixel locations
//! - Tracking cameras triangulate the laser dot into 3D world coordinates
//! - A projector pixel is servoed onto the same spot via a dedicated
//!   laser/projector tracking camera
//! - Accepted (3D point, laser angles, projector pixel) correspondences are
//!   persisted for later projection warping

pub mod calibration;
pub mod camera;
pub mod config;
pub mod detect;
pub mod laser;
pub mod pacing;
pub mod projector;
pub mod store;
pub mod triangulate;
