//! The calibration state machine and its supporting pieces.

pub mod context;
pub mod engine;
pub mod sampling;

pub use context::{ServoState, VdispCalibrationContext};
pub use engine::{
    CalibrationEngine, EngineError, EngineHandle, EngineMode, ModeCallback, ReplayCallback,
    Triangulation3d, VdispSelector,
};
