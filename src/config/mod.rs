//! Configuration loading and validation.
//!
//! All tunables are supplied once at startup and never reloaded. Loading
//! fails fast: a missing or inconsistent field is a `ConfigError` naming the
//! field, not a runtime surprise deep inside the calibration loop.

use crate::laser::LaserRange;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    /// A field failed validation; the string names the field and why.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config read error: {}", e),
            ConfigError::Parse(e) => write!(f, "config parse error: {}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

/// Laser hardware configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaserConfig {
    /// Pan travel range and raster sweep step count.
    pub pan_range: LaserRange,
    /// Tilt travel range and raster sweep step count.
    pub tilt_range: LaserRange,
    /// Startup home position (pan, tilt).
    pub home: [f64; 2],
    pub brightness: f64,
}

impl Default for LaserConfig {
    fn default() -> Self {
        Self {
            pan_range: LaserRange {
                min: 0.0,
                max: 180.0,
                steps: 18,
            },
            tilt_range: LaserRange {
                min: 0.0,
                max: 90.0,
                steps: 9,
            },
            home: [90.0, 45.0],
            brightness: 1.0,
        }
    }
}

/// Detection thresholds and geometric gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Foreground threshold for a projector-lit pixel.
    pub visible_thresh: u8,
    /// Foreground threshold for the laser dot.
    pub laser_thresh: u8,
    /// Frames per camera for the background model.
    pub background_frames: usize,
    /// Expected laser location in the PTC camera (col, row).
    pub expected_location: [f64; 2],
    /// Maximum distance from the expected location before a laser detection
    /// is treated as a reflection and discarded.
    pub expected_gate_px: f64,
    /// Mean reprojection error at or above which a triangulation is
    /// discarded.
    pub reprojection_gate_px: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            visible_thresh: 20,
            laser_thresh: 60,
            background_frames: 20,
            expected_location: [320.0, 240.0],
            expected_gate_px: 100.0,
            reprojection_gate_px: 10.0,
        }
    }
}

/// Search and servo tuning. These bounds are empirically tuned on the rig;
/// the defaults are the values the procedure was commissioned with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// A sweep detection farther than this from the expected location is not
    /// worth refining.
    pub rough_px: f64,
    /// Refinement convergence distance.
    pub fine_px: f64,
    /// Accept an unconverged refinement whose best distance stayed under
    /// this.
    pub accept_px: f64,
    /// Per-axis distance above which the servo switches from the fixed step
    /// to the proportional step.
    pub coarse_px: f64,
    /// Gain applied to the proportional step.
    pub proportional_gain: f64,
    /// Refinement iterations per sweep hit.
    pub refine_attempts: u32,
    /// Projector servo attempts per 3D sample.
    pub servo_attempts: u32,
    /// Home re-acquisition attempts per sample.
    pub home_attempts: u32,
    /// Candidate laser angles generated around home per HOME success.
    pub candidate_count: usize,
    /// Uniform jitter range (inclusive) added to home per candidate axis.
    pub jitter: [i32; 2],
    /// Correspondences to collect per virtual display.
    pub points_per_vdisp: u32,
    /// Snake-grid spacing for whole-display enumeration.
    pub sample_spacing_px: u32,
    /// Whether the coarse-to-fine search drives the beam powered. The
    /// hardware tracks position either way; rigs whose camera cannot see an
    /// unpowered beam set this true.
    pub beam_on_during_search: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            rough_px: 150.0,
            fine_px: 3.0,
            accept_px: 40.0,
            coarse_px: 5.0,
            proportional_gain: 0.3,
            refine_attempts: 40,
            servo_attempts: 30,
            home_attempts: 30,
            candidate_count: 150,
            jitter: [-15, 15],
            points_per_vdisp: 5,
            sample_spacing_px: 60,
            beam_on_during_search: false,
        }
    }
}

/// Projector output timing and rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Half-size of the lit square in projector pixels.
    pub point_half_size_px: u32,
    /// Settle delay after a projector redraw, seconds.
    pub projector_settle_secs: f64,
    /// Engine tick period, seconds.
    pub tick_secs: f64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            point_half_size_px: 2,
            projector_settle_secs: 0.5,
            tick_secs: 0.1,
        }
    }
}

/// One virtual display of a display server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualDisplayConfig {
    pub id: String,
    /// Mask image path, relative to the mask directory.
    pub mask: Option<PathBuf>,
    /// Laser servo gain per image axis.
    pub laser_gain_col: f64,
    pub laser_gain_row: f64,
    /// Projector servo step per image axis.
    pub proj_step_col: f64,
    pub proj_step_row: f64,
}

/// One display server (physical projector output).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayServerConfig {
    pub width: u32,
    pub height: u32,
    pub virtual_displays: Vec<VirtualDisplayConfig>,
}

/// Complete calibration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub tracking_cameras: Vec<String>,
    pub laser_camera: String,
    /// Directory of per-camera mask PNGs (named `<camera>.png`).
    pub mask_dir: Option<PathBuf>,
    /// Mask restricting PTC laser detections.
    pub laser_camera_mask: Option<PathBuf>,
    /// Camera-set JSON for the tracking reconstructor.
    pub tracking_calibration: PathBuf,
    pub display_servers: BTreeMap<String, DisplayServerConfig>,
    #[serde(default)]
    pub laser: LaserConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl CalibrationConfig {
    /// Load and validate a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: CalibrationConfig =
            serde_json::from_str(&contents).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tracking_cameras.len() < 2 {
            return Err(ConfigError::Invalid(format!(
                "tracking_cameras: need at least 2, got {}",
                self.tracking_cameras.len()
            )));
        }
        if self.laser_camera.is_empty() {
            return Err(ConfigError::Invalid("laser_camera: empty".to_string()));
        }
        if self.display_servers.is_empty() {
            return Err(ConfigError::Invalid(
                "display_servers: none configured".to_string(),
            ));
        }
        for range in [
            ("laser.pan_range", &self.laser.pan_range),
            ("laser.tilt_range", &self.laser.tilt_range),
        ] {
            if range.1.min >= range.1.max {
                return Err(ConfigError::Invalid(format!(
                    "{}: min {} >= max {}",
                    range.0, range.1.min, range.1.max
                )));
            }
            if range.1.steps == 0 {
                return Err(ConfigError::Invalid(format!("{}: zero steps", range.0)));
            }
        }
        if self.search.jitter[0] > self.search.jitter[1] {
            return Err(ConfigError::Invalid(format!(
                "search.jitter: lower bound {} above upper bound {}",
                self.search.jitter[0], self.search.jitter[1]
            )));
        }
        if self.search.points_per_vdisp == 0 {
            return Err(ConfigError::Invalid(
                "search.points_per_vdisp: zero".to_string(),
            ));
        }
        for (name, ds) in &self.display_servers {
            if ds.width == 0 || ds.height == 0 {
                return Err(ConfigError::Invalid(format!(
                    "display_servers.{}: zero size",
                    name
                )));
            }
            if ds.virtual_displays.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "display_servers.{}: no virtual displays",
                    name
                )));
            }
            let mut seen = std::collections::BTreeSet::new();
            for vd in &ds.virtual_displays {
                if !seen.insert(&vd.id) {
                    return Err(ConfigError::Invalid(format!(
                        "display_servers.{}: duplicate vdisp id {}",
                        name, vd.id
                    )));
                }
                for (field, gain) in [
                    ("laser_gain_col", vd.laser_gain_col),
                    ("laser_gain_row", vd.laser_gain_row),
                    ("proj_step_col", vd.proj_step_col),
                    ("proj_step_row", vd.proj_step_row),
                ] {
                    if gain <= 0.0 {
                        return Err(ConfigError::Invalid(format!(
                            "display_servers.{}.{}.{}: must be positive, got {}",
                            name, vd.id, field, gain
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> CalibrationConfig {
        CalibrationConfig {
            tracking_cameras: vec!["cam0".to_string(), "cam1".to_string()],
            laser_camera: "ptc".to_string(),
            mask_dir: None,
            laser_camera_mask: None,
            tracking_calibration: PathBuf::from("cameras.json"),
            display_servers: [(
                "display_server0".to_string(),
                DisplayServerConfig {
                    width: 1024,
                    height: 768,
                    virtual_displays: vec![VirtualDisplayConfig {
                        id: "vdisp0".to_string(),
                        mask: None,
                        laser_gain_col: 0.5,
                        laser_gain_row: 0.5,
                        proj_step_col: 1.0,
                        proj_step_row: 1.0,
                    }],
                },
            )]
            .into(),
            laser: LaserConfig::default(),
            detection: DetectionConfig::default(),
            search: SearchConfig::default(),
            output: OutputConfig::default(),
        }
    }

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn too_few_tracking_cameras_fails() {
        let mut cfg = valid_config();
        cfg.tracking_cameras.pop();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("tracking_cameras"));
    }

    #[test]
    fn inverted_range_fails() {
        let mut cfg = valid_config();
        cfg.laser.pan_range.min = 200.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_vdisp_id_fails() {
        let mut cfg = valid_config();
        let ds = cfg.display_servers.get_mut("display_server0").unwrap();
        let dup = ds.virtual_displays[0].clone();
        ds.virtual_displays.push(dup);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn nonpositive_gain_fails() {
        let mut cfg = valid_config();
        cfg.display_servers
            .get_mut("display_server0")
            .unwrap()
            .virtual_displays[0]
            .laser_gain_col = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn json_round_trip() {
        let cfg = valid_config();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: CalibrationConfig = serde_json::from_str(&json).unwrap();
        back.validate().unwrap();
        assert_eq!(back.tracking_cameras, cfg.tracking_cameras);
    }
}
