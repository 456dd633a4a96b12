//! Display servers, virtual displays, and single-pixel lighting.
//!
//! A display server drives one physical projector; its output is carved into
//! virtual displays, each with its own pixel mask and servo gains, calibrated
//! independently. The rendering transport is the `PixelRenderer` trait;
//! `ProjectorPixelLighter` renders a blank frame with one white square and
//! caches the last-lit target so identical requests skip the redraw and its
//! settle delay.

use crate::calibration::sampling;
use crate::camera::Pixel;
use crate::config::DisplayServerConfig;
use crate::pacing::Pacer;
use image::GrayImage;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Projector output error.
#[derive(Debug)]
pub enum ProjectorError {
    UnknownDisplayServer(String),
    Render(String),
    MaskLoad(String),
}

impl std::fmt::Display for ProjectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectorError::UnknownDisplayServer(ds) => {
                write!(f, "unknown display server {}", ds)
            }
            ProjectorError::Render(msg) => write!(f, "render error: {}", msg),
            ProjectorError::MaskLoad(msg) => write!(f, "mask load error: {}", msg),
        }
    }
}

impl std::error::Error for ProjectorError {}

/// Rendering handle for one display server.
pub trait PixelRenderer {
    fn show(&mut self, frame: &GrayImage) -> Result<(), ProjectorError>;
}

/// One logical sub-region of a projector output, calibrated independently.
pub struct VirtualDisplay {
    pub id: String,
    /// Non-zero mask pixels lie inside the virtual display.
    pub mask: GrayImage,
    /// Laser servo gain per image axis (degrees of travel per step).
    pub laser_gain_col: f64,
    pub laser_gain_row: f64,
    /// Projector servo step per image axis (pixels).
    pub proj_step_col: f64,
    pub proj_step_row: f64,
}

impl VirtualDisplay {
    /// Center of mass of the mask, or `None` for an empty mask.
    pub fn center_of_mass(&self) -> Option<Pixel> {
        sampling::center_of_mass(&self.mask)
    }

    pub fn contains(&self, px: &Pixel) -> bool {
        let (col, row) = (px.col.floor(), px.row.floor());
        if col < 0.0 || row < 0.0 {
            return false;
        }
        let (col, row) = (col as u32, row as u32);
        col < self.mask.width()
            && row < self.mask.height()
            && self.mask.get_pixel(col, row).0[0] != 0
    }

    /// Mask-covered sample points on a snake grid of the given spacing.
    pub fn sample_points(&self, spacing: u32) -> Vec<Pixel> {
        sampling::masked_grid(&self.mask, spacing)
    }
}

/// Driver-side description of one physical projector output.
pub struct DisplayServer {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub vdisps: Vec<VirtualDisplay>,
}

impl DisplayServer {
    pub fn vdisp(&self, id: &str) -> Option<&VirtualDisplay> {
        self.vdisps.iter().find(|v| v.id == id)
    }

    /// Build from configuration, loading vdisp masks relative to `mask_dir`.
    /// A vdisp without a mask file covers the whole output.
    pub fn from_config(
        name: &str,
        cfg: &DisplayServerConfig,
        mask_dir: Option<&Path>,
    ) -> Result<Self, ProjectorError> {
        let mut vdisps = Vec::with_capacity(cfg.virtual_displays.len());
        for vd in &cfg.virtual_displays {
            let mask = match &vd.mask {
                Some(rel) => {
                    let path = match mask_dir {
                        Some(dir) => dir.join(rel),
                        None => rel.clone(),
                    };
                    let mask = load_mask(&path)?;
                    log::info!("loaded {} mask from {}", vd.id, path.display());
                    mask
                }
                None => GrayImage::from_pixel(cfg.width, cfg.height, image::Luma([255])),
            };
            vdisps.push(VirtualDisplay {
                id: vd.id.clone(),
                mask,
                laser_gain_col: vd.laser_gain_col,
                laser_gain_row: vd.laser_gain_row,
                proj_step_col: vd.proj_step_col,
                proj_step_row: vd.proj_step_row,
            });
        }
        Ok(Self {
            name: name.to_string(),
            width: cfg.width,
            height: cfg.height,
            vdisps,
        })
    }
}

/// Load a pixel mask image; any non-zero pixel is inside the mask.
pub fn load_mask(path: &Path) -> Result<GrayImage, ProjectorError> {
    let img = image::open(path)
        .map_err(|e| ProjectorError::MaskLoad(format!("{}: {}", path.display(), e)))?;
    Ok(img.to_luma8())
}

struct LighterTarget {
    width: u32,
    height: u32,
    renderer: Box<dyn PixelRenderer>,
}

/// Lights a single white square (or blanks) on a named display server.
pub struct ProjectorPixelLighter {
    displays: HashMap<String, LighterTarget>,
    /// Last-lit (display server, floored col/row or `None` for blank).
    cache: Option<(String, Option<(i64, i64)>)>,
    half_size: u32,
    settle: Duration,
    pacer: Box<dyn Pacer>,
}

impl ProjectorPixelLighter {
    pub fn new(half_size: u32, settle: Duration, pacer: Box<dyn Pacer>) -> Self {
        Self {
            displays: HashMap::new(),
            cache: None,
            half_size,
            settle,
            pacer,
        }
    }

    pub fn add_display(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
        renderer: Box<dyn PixelRenderer>,
    ) {
        self.displays.insert(
            name.to_string(),
            LighterTarget {
                width,
                height,
                renderer,
            },
        );
    }

    /// Light the pixel (floored) on the named display server, or blank it
    /// with `None`. A repeat of the last-lit target is a no-op.
    pub fn light(&mut self, ds: &str, pixel: Option<Pixel>) -> Result<(), ProjectorError> {
        let floored = pixel.map(|p| (p.col.floor() as i64, p.row.floor() as i64));
        let target = (ds.to_string(), floored);
        if self.cache.as_ref() == Some(&target) {
            log::debug!("not lighting projector {} {:?} (already lit)", ds, floored);
            return Ok(());
        }

        let display = self
            .displays
            .get_mut(ds)
            .ok_or_else(|| ProjectorError::UnknownDisplayServer(ds.to_string()))?;

        let mut frame = GrayImage::new(display.width, display.height);
        if let Some((col, row)) = floored {
            let sz = self.half_size as i64;
            let c0 = (col - sz).max(0);
            let c1 = (col + sz).min(display.width as i64);
            let r0 = (row - sz).max(0);
            let r1 = (row + sz).min(display.height as i64);
            for r in r0..r1 {
                for c in c0..c1 {
                    frame.put_pixel(c as u32, r as u32, image::Luma([255]));
                }
            }
        }
        display.renderer.show(&frame)?;
        log::info!("lighting projector {} {:?}", ds, floored);
        self.cache = Some(target);

        self.pacer.pause(self.settle);
        Ok(())
    }

    /// Blank the named display server.
    pub fn blank(&mut self, ds: &str) -> Result<(), ProjectorError> {
        self.light(ds, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacing::NullPacer;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct CountingRenderer {
        draws: Rc<RefCell<Vec<GrayImage>>>,
    }

    impl PixelRenderer for CountingRenderer {
        fn show(&mut self, frame: &GrayImage) -> Result<(), ProjectorError> {
            self.draws.borrow_mut().push(frame.clone());
            Ok(())
        }
    }

    struct CountingPacer(Rc<RefCell<u32>>);

    impl Pacer for CountingPacer {
        fn pause(&mut self, _d: Duration) {
            *self.0.borrow_mut() += 1;
        }
    }

    fn lighter() -> (ProjectorPixelLighter, Rc<RefCell<Vec<GrayImage>>>, Rc<RefCell<u32>>) {
        let draws = Rc::new(RefCell::new(Vec::new()));
        let pauses = Rc::new(RefCell::new(0));
        let mut lighter = ProjectorPixelLighter::new(
            2,
            Duration::from_millis(500),
            Box::new(CountingPacer(pauses.clone())),
        );
        lighter.add_display(
            "ds0",
            64,
            48,
            Box::new(CountingRenderer {
                draws: draws.clone(),
            }),
        );
        (lighter, draws, pauses)
    }

    #[test]
    fn repeat_light_is_a_cache_hit() {
        let (mut lighter, draws, pauses) = lighter();
        lighter.light("ds0", Some(Pixel::new(10.4, 20.9))).unwrap();
        assert_eq!(draws.borrow().len(), 1);
        assert_eq!(*pauses.borrow(), 1);

        // same pixel after flooring: no redraw, no settle
        lighter.light("ds0", Some(Pixel::new(10.7, 20.1))).unwrap();
        assert_eq!(draws.borrow().len(), 1);
        assert_eq!(*pauses.borrow(), 1);

        // different pixel redraws
        lighter.light("ds0", Some(Pixel::new(11.0, 20.0))).unwrap();
        assert_eq!(draws.borrow().len(), 2);
        assert_eq!(*pauses.borrow(), 2);
    }

    #[test]
    fn blank_then_light_renders_square_clipped() {
        let (mut lighter, draws, _) = lighter();
        lighter.blank("ds0").unwrap();
        let frame = draws.borrow().last().unwrap().clone();
        assert!(frame.pixels().all(|p| p.0[0] == 0));

        lighter.light("ds0", Some(Pixel::new(0.0, 0.0))).unwrap();
        let frame = draws.borrow().last().unwrap().clone();
        // half size 2 clipped at the origin: a 2x2 block is lit
        assert_eq!(frame.get_pixel(0, 0).0[0], 255);
        assert_eq!(frame.get_pixel(1, 1).0[0], 255);
        assert_eq!(frame.get_pixel(2, 2).0[0], 0);

        // blanking again redraws (cache was the pixel)
        lighter.blank("ds0").unwrap();
        let frame = draws.borrow().last().unwrap().clone();
        assert!(frame.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn unknown_display_server_errors() {
        let (mut lighter, _, _) = lighter();
        assert!(lighter.light("nope", None).is_err());
    }

    #[test]
    fn from_config_without_mask_covers_the_whole_output() {
        use crate::config::VirtualDisplayConfig;

        let cfg = DisplayServerConfig {
            width: 32,
            height: 16,
            virtual_displays: vec![VirtualDisplayConfig {
                id: "vdisp0".to_string(),
                mask: None,
                laser_gain_col: 0.5,
                laser_gain_row: 0.5,
                proj_step_col: 1.0,
                proj_step_row: 1.0,
            }],
        };
        let ds = DisplayServer::from_config("ds0", &cfg, None).unwrap();
        let vd = ds.vdisp("vdisp0").unwrap();
        assert!(vd.contains(&Pixel::new(0.0, 0.0)));
        assert!(vd.contains(&Pixel::new(31.0, 15.0)));
        let c = vd.center_of_mass().unwrap();
        assert!((c.col - 15.5).abs() < 1e-9);
        assert!((c.row - 7.5).abs() < 1e-9);
    }
}
