//! Append-only persistence of accepted calibration correspondences.
//!
//! Samples are bincode records inside an lz4 frame, written in acceptance
//! order and replayed in the same order. Appending also fires the publish
//! callback with the record and the running count, so an external status
//! channel can mirror progress.

use crate::camera::Pixel;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// One contributing 2D observation of the laser dot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub camera: String,
    pub pixel: Pixel,
}

/// One accepted correspondence between a 3D point and a projector pixel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub display_server: String,
    pub vdisp: String,
    /// Triangulated 3D position of the laser dot.
    pub position: [f64; 3],
    /// Laser angles at capture.
    pub pan: f64,
    pub tilt: f64,
    /// The projector pixel that converged onto the laser dot.
    pub pixel_projector: Pixel,
    /// Where the PTC camera saw the laser dot.
    pub pixel_ptc_laser: Pixel,
    /// Where the PTC camera saw the converged projector pixel.
    pub pixel_ptc_projector: Pixel,
    /// Per-camera observations that fed the triangulation.
    pub points: Vec<Observation>,
}

/// Persistence error.
#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Record(bincode::Error),
    Closed,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "calibration log io error: {}", e),
            StoreError::Record(e) => write!(f, "calibration record error: {}", e),
            StoreError::Closed => write!(f, "calibration log already closed"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

/// Publish hook fired per appended sample with the running count.
pub type SampleCallback = Box<dyn FnMut(&CalibrationSample, u32)>;

/// Append-only log of accepted calibration samples.
pub struct CorrespondenceStore {
    path: PathBuf,
    writer: Option<FrameEncoder<BufWriter<File>>>,
    count: u32,
    on_sample: Option<SampleCallback>,
}

impl CorrespondenceStore {
    /// Create a new log file at `path`.
    pub fn create(path: &Path, on_sample: Option<SampleCallback>) -> Result<Self, StoreError> {
        let file = File::create(path)?;
        log::info!("saving calibration to {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(FrameEncoder::new(BufWriter::new(file))),
            count: 0,
            on_sample,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Persist one sample and fire the publish callback.
    pub fn append(&mut self, sample: &CalibrationSample) -> Result<(), StoreError> {
        let writer = self.writer.as_mut().ok_or(StoreError::Closed)?;
        bincode::serialize_into(writer, sample).map_err(StoreError::Record)?;
        self.count += 1;
        if let Some(cb) = self.on_sample.as_mut() {
            cb(sample, self.count);
        }
        Ok(())
    }

    /// Read every sample out of a previously written log, in storage order.
    pub fn read_all(
        path: &Path,
        mut callback: impl FnMut(&CalibrationSample),
    ) -> Result<u32, StoreError> {
        let file = File::open(path)?;
        let mut reader = FrameDecoder::new(BufReader::new(file));
        let mut count = 0;
        loop {
            match bincode::deserialize_from::<_, CalibrationSample>(&mut reader) {
                Ok(sample) => {
                    callback(&sample);
                    count += 1;
                }
                Err(e) => match *e {
                    bincode::ErrorKind::Io(ref io)
                        if io.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        break;
                    }
                    _ => return Err(StoreError::Record(e)),
                },
            }
        }
        Ok(count)
    }

    /// Replay a previous log into this one: every replayed sample is
    /// re-appended (persisted and published) and handed to `viz`.
    pub fn replay_into(
        &mut self,
        path: &Path,
        mut viz: impl FnMut(&CalibrationSample),
    ) -> Result<u32, StoreError> {
        let mut replayed = Vec::new();
        let count = Self::read_all(path, |sample| replayed.push(sample.clone()))?;
        for sample in &replayed {
            self.append(sample)?;
            viz(sample);
        }
        log::info!("replayed {} samples from {}", count, path.display());
        Ok(count)
    }

    /// Flush and finalize the log. Safe to call more than once.
    pub fn close(&mut self) -> Result<(), StoreError> {
        if let Some(writer) = self.writer.take() {
            writer
                .finish()
                .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
            log::info!("saved {} samples to {}", self.count, self.path.display());
        }
        Ok(())
    }
}

impl Drop for CorrespondenceStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("closing calibration log failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn temp_log(tag: &str) -> PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        std::env::temp_dir().join(format!(
            "flycave-store-{}-{}-{}.cal",
            tag,
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ))
    }

    fn sample(n: u32) -> CalibrationSample {
        CalibrationSample {
            display_server: "display_server0".to_string(),
            vdisp: format!("vdisp{}", n),
            position: [n as f64, 0.5, -1.0],
            pan: 10.0 + n as f64,
            tilt: -5.0,
            pixel_projector: Pixel::new(100.0, 200.0),
            pixel_ptc_laser: Pixel::new(320.0, 240.0),
            pixel_ptc_projector: Pixel::new(321.0, 239.0),
            points: vec![
                Observation {
                    camera: "cam0".to_string(),
                    pixel: Pixel::new(1.0, 2.0),
                },
                Observation {
                    camera: "cam1".to_string(),
                    pixel: Pixel::new(3.0, 4.0),
                },
            ],
        }
    }

    #[test]
    fn round_trip_preserves_order() {
        let path = temp_log("roundtrip");
        let mut store = CorrespondenceStore::create(&path, None).unwrap();
        for n in 0..5 {
            store.append(&sample(n)).unwrap();
        }
        assert_eq!(store.count(), 5);
        store.close().unwrap();

        let mut seen = Vec::new();
        let count = CorrespondenceStore::read_all(&path, |s| seen.push(s.clone())).unwrap();
        assert_eq!(count, 5);
        for (n, s) in seen.iter().enumerate() {
            assert_eq!(*s, sample(n as u32));
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn close_is_idempotent_and_empty_log_is_fine() {
        let path = temp_log("empty");
        let mut store = CorrespondenceStore::create(&path, None).unwrap();
        store.close().unwrap();
        store.close().unwrap();
        assert!(store.append(&sample(0)).is_err());
        assert_eq!(CorrespondenceStore::read_all(&path, |_| ()).unwrap(), 0);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn append_publishes_sample_and_count() {
        let path = temp_log("publish");
        let counts = Rc::new(RefCell::new(Vec::new()));
        let counts_cb = counts.clone();
        let mut store = CorrespondenceStore::create(
            &path,
            Some(Box::new(move |s, count| {
                counts_cb.borrow_mut().push((s.vdisp.clone(), count));
            })),
        )
        .unwrap();
        store.append(&sample(0)).unwrap();
        store.append(&sample(1)).unwrap();
        assert_eq!(
            *counts.borrow(),
            vec![("vdisp0".to_string(), 1), ("vdisp1".to_string(), 2)]
        );
        store.close().unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn replay_reappends_and_visualizes_in_order() {
        let old_path = temp_log("replay-src");
        let mut old = CorrespondenceStore::create(&old_path, None).unwrap();
        for n in 0..3 {
            old.append(&sample(n)).unwrap();
        }
        old.close().unwrap();

        let new_path = temp_log("replay-dst");
        let mut store = CorrespondenceStore::create(&new_path, None).unwrap();
        let mut seen = Vec::new();
        let count = store
            .replay_into(&old_path, |s| seen.push(s.vdisp.clone()))
            .unwrap();
        assert_eq!(count, 3);
        assert_eq!(seen, vec!["vdisp0", "vdisp1", "vdisp2"]);
        assert_eq!(store.count(), 3);
        store.close().unwrap();

        let reread = CorrespondenceStore::read_all(&new_path, |_| ()).unwrap();
        assert_eq!(reread, 3);
        std::fs::remove_file(&old_path).ok();
        std::fs::remove_file(&new_path).ok();
    }
}
