//! Per-virtual-display working state.
//!
//! One context exists at a time: virtual displays are calibrated strictly
//! sequentially. The context is created when the coarse-to-fine search finds
//! the laser near the vdisp's target pixel and is dropped when the vdisp is
//! finished or abandoned.

use crate::camera::Pixel;
use nalgebra::Point3;

/// Working state for one 3D sample being servoed onto a projector pixel.
#[derive(Debug, Clone)]
pub struct ServoState {
    /// Triangulated laser position.
    pub position: Point3<f64>,
    /// Per-camera observations that fed the triangulation.
    pub observations: Vec<(String, Pixel)>,
    /// Laser angles at capture.
    pub pan: f64,
    pub tilt: f64,
    /// Where the PTC camera saw the laser dot; the servo target.
    pub target: Pixel,
    /// Current projector pixel estimate.
    pub proj: Pixel,
    pub attempts_left: i32,
}

/// Working state for the virtual display currently being calibrated.
#[derive(Debug, Clone)]
pub struct VdispCalibrationContext {
    pub display_server: String,
    pub vdisp: String,
    /// Known-good laser angles near the vdisp's target pixel.
    pub home_pan: f64,
    pub home_tilt: f64,
    /// The projector pixel the search converged around.
    pub target_pixel: Pixel,
    /// Display server dimensions, for servo clamping.
    pub width: u32,
    pub height: u32,
    /// Laser servo gain per image axis.
    pub laser_gain: (f64, f64),
    /// Projector servo step per image axis.
    pub proj_step: (f64, f64),
    /// Correspondences still wanted for this vdisp.
    pub points_needed: u32,
    pub home_attempts_left: i32,
    /// Candidate laser angles still to try, popped from the back.
    pub candidates: Vec<(f64, f64)>,
    pub servo: Option<ServoState>,
}
