//! Sampling paths for the laser sweep and the projector sample grid.
//!
//! Snake (boustrophedon) orders keep successive candidates adjacent, which
//! matters here because the laser settle dwell grows with travel distance.

use crate::camera::Pixel;
use image::GrayImage;

/// Integer grid over a `w` x `h` image with the given spacing, walking rows
/// top to bottom and alternating column direction per row. Yields (col, row).
pub fn horiz_snake(w: u32, h: u32, spacing: u32) -> Vec<(u32, u32)> {
    let spacing = spacing.max(1);
    let cols: Vec<u32> = (0..w).step_by(spacing as usize).collect();
    let mut path = Vec::new();
    for (i, row) in (0..h).step_by(spacing as usize).enumerate() {
        if i % 2 == 0 {
            path.extend(cols.iter().map(|&c| (c, row)));
        } else {
            path.extend(cols.iter().rev().map(|&c| (c, row)));
        }
    }
    path
}

/// Column-major snake over `nw` x `nh` values linearly spaced across the two
/// closed ranges. Yields (w, h) pairs, walking each column of `h` values and
/// alternating direction per column.
pub fn vert_snake_linspace(
    (min_w, max_w): (f64, f64),
    nw: usize,
    (min_h, max_h): (f64, f64),
    nh: usize,
) -> Vec<(f64, f64)> {
    let ws = linspace(min_w, max_w, nw);
    let hs = linspace(min_h, max_h, nh);
    let mut path = Vec::with_capacity(nw * nh);
    for (i, &w) in ws.iter().enumerate() {
        if i % 2 == 0 {
            path.extend(hs.iter().map(|&h| (w, h)));
        } else {
            path.extend(hs.iter().rev().map(|&h| (w, h)));
        }
    }
    path
}

fn linspace(min: f64, max: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![min],
        _ => (0..n)
            .map(|i| min + (max - min) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

/// Center of mass of a mask's non-zero pixels, or `None` for an empty mask.
pub fn center_of_mass(mask: &GrayImage) -> Option<Pixel> {
    let mut count = 0u64;
    let mut sum_col = 0.0;
    let mut sum_row = 0.0;
    for y in 0..mask.height() {
        for x in 0..mask.width() {
            if mask.get_pixel(x, y).0[0] != 0 {
                count += 1;
                sum_col += x as f64;
                sum_row += y as f64;
            }
        }
    }
    if count == 0 {
        return None;
    }
    Some(Pixel::new(sum_col / count as f64, sum_row / count as f64))
}

/// Snake-grid points of the given spacing that fall inside the mask.
pub fn masked_grid(mask: &GrayImage, spacing: u32) -> Vec<Pixel> {
    horiz_snake(mask.width(), mask.height(), spacing)
        .into_iter()
        .filter(|&(col, row)| mask.get_pixel(col, row).0[0] != 0)
        .map(|(col, row)| Pixel::new(col as f64, row as f64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn horiz_snake_alternates_direction() {
        let path = horiz_snake(3, 2, 1);
        assert_eq!(
            path,
            vec![(0, 0), (1, 0), (2, 0), (2, 1), (1, 1), (0, 1)]
        );
    }

    #[test]
    fn vert_snake_covers_endpoints() {
        let path = vert_snake_linspace((0.0, 10.0), 3, (0.0, 4.0), 2);
        assert_eq!(path.len(), 6);
        assert_eq!(path[0], (0.0, 0.0));
        assert_eq!(path[1], (0.0, 4.0));
        // second column walks back down
        assert_eq!(path[2], (5.0, 4.0));
        assert_eq!(path[3], (5.0, 0.0));
        assert_eq!(path[5], (10.0, 4.0));
    }

    #[test]
    fn center_of_mass_of_rectangle() {
        let mut mask = GrayImage::new(10, 10);
        for y in 2..6 {
            for x in 4..8 {
                mask.put_pixel(x, y, image::Luma([255]));
            }
        }
        let c = center_of_mass(&mask).unwrap();
        assert!((c.col - 5.5).abs() < 1e-9);
        assert!((c.row - 3.5).abs() < 1e-9);
        assert!(center_of_mass(&GrayImage::new(4, 4)).is_none());
    }

    #[test]
    fn masked_grid_only_returns_masked_points() {
        let mut mask = GrayImage::new(8, 8);
        mask.put_pixel(0, 0, image::Luma([255]));
        mask.put_pixel(4, 4, image::Luma([255]));
        mask.put_pixel(5, 4, image::Luma([255])); // off-grid at spacing 4
        let pts = masked_grid(&mask, 4);
        assert_eq!(pts.len(), 2);
        assert!(pts.contains(&Pixel::new(0.0, 0.0)));
        assert!(pts.contains(&Pixel::new(4.0, 4.0)));
    }
}
