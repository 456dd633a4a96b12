//! Camera acquisition and per-camera detection front ends.
//!
//! The actual camera drivers (trigger hardware, transport) live outside this
//! crate; acquisition is the `FrameSource` trait returning one grayscale
//! frame per camera. On top of that sit the two rigs the calibration uses:
//! the tracking cameras that feed triangulation, and the single PTC
//! (projector/laser tracking) camera used for fine 2D servoing.

use crate::detect::DotDetector;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A 2D pixel location, column-major order as (col, row).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pixel {
    pub col: f64,
    pub row: f64,
}

impl Pixel {
    pub fn new(col: f64, row: f64) -> Self {
        Self { col, row }
    }

    /// Euclidean distance to another pixel.
    pub fn distance(&self, other: &Pixel) -> f64 {
        let dc = self.col - other.col;
        let dr = self.row - other.row;
        (dc * dc + dr * dr).sqrt()
    }
}

impl std::fmt::Display for Pixel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "col:{:.1} row:{:.1}", self.col, self.row)
    }
}

/// Camera acquisition error.
#[derive(Debug)]
pub enum CameraError {
    /// The underlying acquisition failed.
    Acquisition(String),
    /// A requested camera was not present in the acquired frame set.
    MissingCamera(String),
    /// No frames were collected when a background model was requested.
    NoFrames(String),
}

impl std::fmt::Display for CameraError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraError::Acquisition(msg) => write!(f, "acquisition error: {}", msg),
            CameraError::MissingCamera(cam) => write!(f, "no frame for camera {}", cam),
            CameraError::NoFrames(cam) => write!(f, "no frames collected for {}", cam),
        }
    }
}

impl std::error::Error for CameraError {}

/// Blocking frame acquisition: one grayscale frame per camera per call.
pub trait FrameSource {
    fn frames(&mut self) -> Result<HashMap<String, GrayImage>, CameraError>;
}

/// The tracking cameras used for 3D triangulation.
pub struct TrackingCameras {
    source: Box<dyn FrameSource>,
    detectors: BTreeMap<String, DotDetector>,
}

impl TrackingCameras {
    pub fn new(source: Box<dyn FrameSource>, cameras: &[String]) -> Self {
        let detectors = cameras
            .iter()
            .map(|c| (c.clone(), DotDetector::new()))
            .collect();
        Self { source, detectors }
    }

    pub fn camera_names(&self) -> impl Iterator<Item = &String> {
        self.detectors.keys()
    }

    /// Set a persistent detection mask for one camera.
    pub fn set_mask(&mut self, camera: &str, mask: GrayImage) {
        if let Some(det) = self.detectors.get_mut(camera) {
            log::info!("setting {} mask", camera);
            det.set_mask(mask);
        }
    }

    /// Load per-camera masks named `<camera>.png` from a directory. Cameras
    /// without a mask file keep their full frame.
    pub fn load_masks(&mut self, mask_dir: &std::path::Path) {
        let cameras: Vec<String> = self.detectors.keys().cloned().collect();
        for camera in cameras {
            let stem = camera.rsplit('/').next().unwrap_or(&camera).to_string();
            let path = mask_dir.join(format!("{}.png", stem));
            if !path.exists() {
                continue;
            }
            match image::open(&path) {
                Ok(img) => {
                    log::info!("setting {} mask = {}", camera, path.display());
                    self.set_mask(&camera, img.to_luma8());
                }
                Err(e) => log::warn!("could not load mask {}: {}", path.display(), e),
            }
        }
    }

    /// Acquire `count` frames per camera and compute every background model.
    pub fn collect_backgrounds(&mut self, count: usize) -> Result<(), CameraError> {
        log::info!("collecting backgrounds");
        let mut stacks: BTreeMap<String, Vec<GrayImage>> = BTreeMap::new();
        for _ in 0..count {
            let frames = self.source.frames()?;
            for (cam, frame) in frames {
                stacks.entry(cam).or_default().push(frame);
            }
        }
        for (cam, det) in &mut self.detectors {
            let stack = stacks
                .remove(cam)
                .ok_or_else(|| CameraError::NoFrames(cam.clone()))?;
            det.compute_background(&stack);
            log::info!("calculated background for {}", cam);
        }
        log::info!("collecting backgrounds finished");
        Ok(())
    }

    /// Acquire one frame per camera and run detection on each registered
    /// camera. Returns the per-camera detections in camera-name order.
    pub fn detect_all(&mut self, thresh: u8) -> Result<Vec<(String, Pixel)>, CameraError> {
        let frames = self.source.frames()?;
        let mut detected = Vec::new();
        for (cam, det) in &self.detectors {
            let Some(frame) = frames.get(cam) else {
                continue;
            };
            if let Some(px) = det.detect(frame, thresh) {
                log::debug!("detect {}: {}", cam, px);
                detected.push((cam.clone(), px));
            }
        }
        Ok(detected)
    }
}

/// Which detection the PTC camera should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectKind {
    /// Projector-lit pixel, lenient threshold, full frame.
    Visible,
    /// Laser dot, strict threshold, laser mask and expected-location gate.
    Laser,
}

/// The dedicated laser/projector tracking camera.
///
/// Laser detections are restricted to a mask and rejected when they land too
/// far from the expected image location (reflections land elsewhere).
pub struct PtcCamera {
    source: Box<dyn FrameSource>,
    name: String,
    detector: DotDetector,
    laser_mask: Option<GrayImage>,
    expected: Pixel,
    expected_gate_px: f64,
    visible_thresh: u8,
    laser_thresh: u8,
}

impl PtcCamera {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Box<dyn FrameSource>,
        name: String,
        laser_mask: Option<GrayImage>,
        expected: Pixel,
        expected_gate_px: f64,
        visible_thresh: u8,
        laser_thresh: u8,
    ) -> Self {
        Self {
            source,
            name,
            detector: DotDetector::new(),
            laser_mask,
            expected,
            expected_gate_px,
            visible_thresh,
            laser_thresh,
        }
    }

    /// Expected laser detection location in this camera.
    pub fn expected(&self) -> Pixel {
        self.expected
    }

    pub fn collect_background(&mut self, count: usize) -> Result<(), CameraError> {
        let mut stack = Vec::with_capacity(count);
        for _ in 0..count {
            let mut frames = self.source.frames()?;
            let frame = frames
                .remove(&self.name)
                .ok_or_else(|| CameraError::MissingCamera(self.name.clone()))?;
            stack.push(frame);
        }
        self.detector.compute_background(&stack);
        log::info!("calculated background for {}", self.name);
        Ok(())
    }

    /// Acquire one frame and detect per `kind`. A miss is `Ok(None)`.
    pub fn detect(&mut self, kind: DetectKind) -> Result<Option<Pixel>, CameraError> {
        let mut frames = self.source.frames()?;
        let frame = frames
            .remove(&self.name)
            .ok_or_else(|| CameraError::MissingCamera(self.name.clone()))?;

        let found = match kind {
            DetectKind::Visible => self.detector.detect(&frame, self.visible_thresh),
            DetectKind::Laser => {
                let found = match &self.laser_mask {
                    Some(mask) => self
                        .detector
                        .detect_within(&frame, self.laser_thresh, mask),
                    None => self.detector.detect(&frame, self.laser_thresh),
                };
                match found {
                    Some(px) => {
                        let dist = self.expected.distance(&px);
                        if dist > self.expected_gate_px {
                            log::warn!(
                                "misdetected laser location expected:{} got:{} (dist:{:.1})",
                                self.expected,
                                px,
                                dist
                            );
                            None
                        } else {
                            Some(px)
                        }
                    }
                    None => None,
                }
            }
        };

        if let Some(px) = found {
            let what = match kind {
                DetectKind::Visible => "PTC visible",
                DetectKind::Laser => "PTC laser",
            };
            log::info!("detect 2D {}: {}", what, px);
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OneFrame(HashMap<String, GrayImage>);

    impl FrameSource for OneFrame {
        fn frames(&mut self) -> Result<HashMap<String, GrayImage>, CameraError> {
            Ok(self.0.clone())
        }
    }

    fn frame_with_dot(w: u32, h: u32, col: u32, row: u32, value: u8) -> GrayImage {
        let mut img = GrayImage::new(w, h);
        img.put_pixel(col, row, image::Luma([value]));
        img
    }

    #[test]
    fn pixel_distance() {
        let a = Pixel::new(0.0, 0.0);
        let b = Pixel::new(3.0, 4.0);
        assert!((a.distance(&b) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn ptc_laser_gate_rejects_far_detection() {
        let frames: HashMap<_, _> =
            [("ptc".to_string(), frame_with_dot(64, 64, 60, 60, 255))].into();
        let mut ptc = PtcCamera::new(
            Box::new(OneFrame(frames)),
            "ptc".to_string(),
            None,
            Pixel::new(5.0, 5.0),
            20.0,
            20,
            200,
        );
        // dot at (60,60), expected (5,5), gate 20px -> rejected
        assert!(ptc.detect(DetectKind::Laser).unwrap().is_none());
        // same dot is fine at the visible threshold (no gate)
        let px = ptc.detect(DetectKind::Visible).unwrap().unwrap();
        assert_eq!((px.col, px.row), (60.0, 60.0));
    }

    #[test]
    fn tracking_detect_all_reports_per_camera() {
        let frames: HashMap<_, _> = [
            ("cam0".to_string(), frame_with_dot(32, 32, 10, 12, 255)),
            ("cam1".to_string(), frame_with_dot(32, 32, 3, 4, 255)),
        ]
        .into();
        let names = vec!["cam0".to_string(), "cam1".to_string()];
        let mut rig = TrackingCameras::new(Box::new(OneFrame(frames)), &names);
        let detected = rig.detect_all(50).unwrap();
        assert_eq!(detected.len(), 2);
        assert_eq!(detected[0].0, "cam0");
        assert_eq!((detected[0].1.col, detected[0].1.row), (10.0, 12.0));
    }
}
