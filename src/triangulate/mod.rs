//! Multi-view 3D reconstruction.
//!
//! The tracking rig's extrinsic/intrinsic calibration is produced elsewhere;
//! this module consumes it as a set of per-camera 3x4 projection matrices and
//! offers linear (DLT) triangulation plus reprojection, behind the
//! `Reconstructor` trait so the engine can be driven against synthetic
//! geometry in tests.

use crate::camera::Pixel;
use nalgebra::{DMatrix, Point3, SMatrix, Vector4};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// A 3x4 camera projection matrix.
pub type ProjectionMatrix = SMatrix<f64, 3, 4>;

/// Multi-view reconstruction of a single bright point.
pub trait Reconstructor {
    /// Triangulate a 3D point from per-camera observations. Fewer than two
    /// observations never attempts a reconstruction.
    fn find3d(&self, observations: &[(String, Pixel)]) -> Option<Point3<f64>>;

    /// Reproject a 3D point into the named camera.
    fn find2d(&self, camera: &str, point: &Point3<f64>) -> Option<Pixel>;
}

/// Error loading a camera set.
#[derive(Debug)]
pub enum ReconstructorError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    /// The file held fewer than two cameras.
    TooFewCameras(usize),
}

impl std::fmt::Display for ReconstructorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconstructorError::Io(e) => write!(f, "camera set read error: {}", e),
            ReconstructorError::Parse(e) => write!(f, "camera set parse error: {}", e),
            ReconstructorError::TooFewCameras(n) => {
                write!(f, "camera set needs at least 2 cameras, got {}", n)
            }
        }
    }
}

impl std::error::Error for ReconstructorError {}

impl From<std::io::Error> for ReconstructorError {
    fn from(e: std::io::Error) -> Self {
        ReconstructorError::Io(e)
    }
}

#[derive(Debug, Deserialize)]
struct CameraSetFile {
    cameras: BTreeMap<String, [[f64; 4]; 3]>,
}

/// DLT-based reconstructor over calibrated projection matrices.
pub struct LinearReconstructor {
    cameras: BTreeMap<String, ProjectionMatrix>,
}

impl LinearReconstructor {
    pub fn new(cameras: BTreeMap<String, ProjectionMatrix>) -> Self {
        Self { cameras }
    }

    /// Load a camera set from a JSON file of row-major 3x4 matrices.
    pub fn load(path: &Path) -> Result<Self, ReconstructorError> {
        let contents = std::fs::read_to_string(path)?;
        let file: CameraSetFile =
            serde_json::from_str(&contents).map_err(ReconstructorError::Parse)?;
        if file.cameras.len() < 2 {
            return Err(ReconstructorError::TooFewCameras(file.cameras.len()));
        }
        let cameras = file
            .cameras
            .into_iter()
            .map(|(name, rows)| {
                let m = ProjectionMatrix::from_fn(|r, c| rows[r][c]);
                (name, m)
            })
            .collect();
        Ok(Self::new(cameras))
    }

    pub fn camera_names(&self) -> impl Iterator<Item = &String> {
        self.cameras.keys()
    }
}

impl Reconstructor for LinearReconstructor {
    fn find3d(&self, observations: &[(String, Pixel)]) -> Option<Point3<f64>> {
        if observations.len() < 2 {
            return None;
        }

        // u*P3 - P1 and v*P3 - P2 rows per view, null space via SVD.
        let mut a = DMatrix::<f64>::zeros(2 * observations.len(), 4);
        for (i, (cam, px)) in observations.iter().enumerate() {
            let p = self.cameras.get(cam)?;
            let row0 = p.row(0);
            let row1 = p.row(1);
            let row2 = p.row(2);
            a.row_mut(2 * i).copy_from(&(px.col * row2 - row0));
            a.row_mut(2 * i + 1).copy_from(&(px.row * row2 - row1));
        }

        let svd = a.svd(true, true);
        let v_t = svd.v_t?;
        let x_h = v_t.row(v_t.nrows() - 1);
        let w = x_h[3];
        if w.abs() <= f64::EPSILON {
            return None;
        }
        Some(Point3::new(x_h[0] / w, x_h[1] / w, x_h[2] / w))
    }

    fn find2d(&self, camera: &str, point: &Point3<f64>) -> Option<Pixel> {
        let p = self.cameras.get(camera)?;
        let x = p * Vector4::new(point.x, point.y, point.z, 1.0);
        if x.z.abs() <= f64::EPSILON {
            return None;
        }
        Some(Pixel::new(x.x / x.z, x.y / x.z))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_view_rig() -> LinearReconstructor {
        let cam0 = ProjectionMatrix::new(
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0,
        );
        let cam1 = ProjectionMatrix::new(
            1.0, 0.0, 0.0, -0.2, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0,
        );
        LinearReconstructor::new(
            [("cam0".to_string(), cam0), ("cam1".to_string(), cam1)].into(),
        )
    }

    #[test]
    fn fewer_than_two_views_is_none() {
        let rig = two_view_rig();
        assert!(rig.find3d(&[]).is_none());
        assert!(rig
            .find3d(&[("cam0".to_string(), Pixel::new(0.1, 0.2))])
            .is_none());
    }

    #[test]
    fn two_views_recover_the_point() {
        let rig = two_view_rig();
        let world = Point3::new(0.1, -0.05, 2.0);
        let p0 = rig.find2d("cam0", &world).unwrap();
        let p1 = rig.find2d("cam1", &world).unwrap();
        let est = rig
            .find3d(&[("cam0".to_string(), p0), ("cam1".to_string(), p1)])
            .unwrap();
        assert!((est - world).norm() < 1e-6);
    }

    #[test]
    fn unknown_camera_is_none() {
        let rig = two_view_rig();
        assert!(rig.find2d("cam9", &Point3::new(0.0, 0.0, 1.0)).is_none());
        assert!(rig
            .find3d(&[
                ("cam0".to_string(), Pixel::new(0.0, 0.0)),
                ("cam9".to_string(), Pixel::new(0.0, 0.0)),
            ])
            .is_none());
    }
}
