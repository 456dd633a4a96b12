//! Bright-dot detection against a static background model.
//!
//! Each camera carries a background model (per-pixel median of a short frame
//! stack taken with the laser off and the projectors black). Detection is a
//! foreground test: the pixel with the greatest excess over background above
//! the threshold wins, scanning row-major so ties resolve to the first
//! qualifying pixel. No detection is a normal outcome, not an error.

use crate::camera::Pixel;
use image::GrayImage;

/// Background-subtracting dot detector for one camera.
#[derive(Debug, Default)]
pub struct DotDetector {
    background: Option<GrayImage>,
    mask: Option<GrayImage>,
}

impl DotDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a persistent mask; zero-valued mask pixels are never considered.
    pub fn set_mask(&mut self, mask: GrayImage) {
        self.mask = Some(mask);
    }

    pub fn clear_mask(&mut self) {
        self.mask = None;
    }

    pub fn has_background(&self) -> bool {
        self.background.is_some()
    }

    /// Compute the background model as the per-pixel median of `frames`.
    ///
    /// An empty stack clears the model.
    pub fn compute_background(&mut self, frames: &[GrayImage]) {
        let Some(first) = frames.first() else {
            log::warn!("no frames supplied for background model");
            self.background = None;
            return;
        };
        let (w, h) = (first.width(), first.height());
        let mut bg = GrayImage::new(w, h);
        let mut column = Vec::with_capacity(frames.len());
        for y in 0..h {
            for x in 0..w {
                column.clear();
                for f in frames {
                    column.push(f.get_pixel(x, y).0[0]);
                }
                column.sort_unstable();
                bg.put_pixel(x, y, image::Luma([column[column.len() / 2]]));
            }
        }
        self.background = Some(bg);
    }

    /// Detect the strongest foreground pixel above `thresh` using the
    /// persistent mask.
    pub fn detect(&self, frame: &GrayImage, thresh: u8) -> Option<Pixel> {
        self.scan(frame, thresh, self.mask.as_ref())
    }

    /// Detect with a caller-supplied mask overriding the persistent one.
    pub fn detect_within(&self, frame: &GrayImage, thresh: u8, mask: &GrayImage) -> Option<Pixel> {
        self.scan(frame, thresh, Some(mask))
    }

    fn scan(&self, frame: &GrayImage, thresh: u8, mask: Option<&GrayImage>) -> Option<Pixel> {
        let mut best: Option<(u8, u32, u32)> = None;
        for y in 0..frame.height() {
            for x in 0..frame.width() {
                if let Some(m) = mask {
                    if m.width() == frame.width()
                        && m.height() == frame.height()
                        && m.get_pixel(x, y).0[0] == 0
                    {
                        continue;
                    }
                }
                let raw = frame.get_pixel(x, y).0[0];
                let bg = self
                    .background
                    .as_ref()
                    .filter(|b| b.width() == frame.width() && b.height() == frame.height())
                    .map(|b| b.get_pixel(x, y).0[0])
                    .unwrap_or(0);
                let fg = raw.saturating_sub(bg);
                if fg > thresh && best.map(|(b, _, _)| fg > b).unwrap_or(true) {
                    best = Some((fg, x, y));
                }
            }
        }
        best.map(|(_, x, y)| Pixel::new(x as f64, y as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(w: u32, h: u32, value: u8) -> GrayImage {
        GrayImage::from_pixel(w, h, image::Luma([value]))
    }

    #[test]
    fn no_detection_below_threshold() {
        let det = DotDetector::new();
        let frame = uniform(16, 16, 30);
        assert!(det.detect(&frame, 30).is_none());
    }

    #[test]
    fn strongest_pixel_wins() {
        let det = DotDetector::new();
        let mut frame = uniform(16, 16, 0);
        frame.put_pixel(3, 5, image::Luma([100]));
        frame.put_pixel(10, 2, image::Luma([200]));
        let px = det.detect(&frame, 50).unwrap();
        assert_eq!((px.col, px.row), (10.0, 2.0));
    }

    #[test]
    fn first_in_scan_order_wins_ties() {
        let det = DotDetector::new();
        let mut frame = uniform(16, 16, 0);
        frame.put_pixel(8, 1, image::Luma([200]));
        frame.put_pixel(2, 9, image::Luma([200]));
        let px = det.detect(&frame, 50).unwrap();
        assert_eq!((px.col, px.row), (8.0, 1.0));
    }

    #[test]
    fn background_is_subtracted() {
        let mut det = DotDetector::new();
        det.compute_background(&[uniform(8, 8, 100)]);
        // raw 120 over bg 100 is only 20 of foreground
        let frame = uniform(8, 8, 120);
        assert!(det.detect(&frame, 30).is_none());
        let mut lit = uniform(8, 8, 100);
        lit.put_pixel(4, 4, image::Luma([180]));
        let px = det.detect(&lit, 30).unwrap();
        assert_eq!((px.col, px.row), (4.0, 4.0));
    }

    #[test]
    fn median_background_ignores_outlier_frame() {
        let mut det = DotDetector::new();
        let mut flash = uniform(8, 8, 0);
        flash.put_pixel(1, 1, image::Luma([255]));
        det.compute_background(&[uniform(8, 8, 0), flash, uniform(8, 8, 0)]);
        // the single flash frame must not poison the median
        let mut frame = uniform(8, 8, 0);
        frame.put_pixel(1, 1, image::Luma([200]));
        let px = det.detect(&frame, 50).unwrap();
        assert_eq!((px.col, px.row), (1.0, 1.0));
    }

    #[test]
    fn mask_restricts_detection() {
        let det = DotDetector::new();
        let mut frame = uniform(16, 16, 0);
        frame.put_pixel(1, 1, image::Luma([255]));
        frame.put_pixel(12, 12, image::Luma([200]));
        let mut mask = uniform(16, 16, 0);
        mask.put_pixel(12, 12, image::Luma([255]));
        let px = det.detect_within(&frame, 50, &mask).unwrap();
        assert_eq!((px.col, px.row), (12.0, 12.0));
    }
}
