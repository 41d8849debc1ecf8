//! Skew estimation and correction.
//!
//! Estimation: Canny edges → progressive probabilistic Hough transform →
//! keep near-horizontal segments → median angle. The median keeps table
//! borders and signature strokes from dragging the estimate.
//!
//! Correction: rotate the full-resolution colour image about its centre with
//! bicubic sampling. Out-of-frame samples replicate the nearest edge pixel,
//! so no black wedges appear in the corners.

use image::{GrayImage, Rgb, RgbImage};
use imageproc::edges::canny;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::imaging::{median, rgb_to_gray};

/// Fixed-point precision used while walking along a candidate line.
const WALK_SHIFT: u32 = 16;

/// Seed for the edge-point visiting order; fixed so results are reproducible.
const HOUGH_SEED: u64 = 0x5eed_cafe;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeskewParams {
    pub canny_low: f32,
    pub canny_high: f32,
    /// Accumulator votes a line needs before it is traced.
    pub hough_threshold: u32,
    /// Minimum segment length as a divisor of the shorter image side.
    pub min_line_divisor: u32,
    pub max_line_gap: u32,
    /// Segments steeper than this are not text lines.
    pub max_abs_angle: f32,
    /// Rotations at or below this are skipped.
    pub min_correction: f32,
}

impl Default for DeskewParams {
    fn default() -> Self {
        Self {
            canny_low: 50.0,
            canny_high: 150.0,
            hough_threshold: 80,
            min_line_divisor: 4,
            max_line_gap: 20,
            max_abs_angle: 45.0,
            min_correction: 0.2,
        }
    }
}

/// A traced line segment in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSegment {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl LineSegment {
    /// Angle against the x axis in degrees, in (-90, 90]. Vertical is 90.
    /// Positive means the segment descends to the right (image y grows down).
    pub fn angle_degrees(&self) -> f32 {
        let (mut dx, mut dy) = (self.x2 - self.x1, self.y2 - self.y1);
        if dx == 0 {
            return 90.0;
        }
        if dx < 0 {
            dx = -dx;
            dy = -dy;
        }
        (dy as f32).atan2(dx as f32).to_degrees()
    }
}

/// Estimate document skew in degrees. 0 when no usable line is found.
pub fn estimate_skew(gray: &GrayImage, params: &DeskewParams) -> f32 {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }

    let edges = canny(gray, params.canny_low, params.canny_high);
    let min_line_length = w.min(h) / params.min_line_divisor.max(1);
    let segments = probabilistic_hough(
        &edges,
        params.hough_threshold,
        min_line_length,
        params.max_line_gap,
    );

    let angles: Vec<f32> = segments
        .iter()
        .map(LineSegment::angle_degrees)
        .filter(|a| a.abs() < params.max_abs_angle)
        .collect();

    let angle = median(&angles).unwrap_or(0.0);
    debug!(
        segments = segments.len(),
        near_horizontal = angles.len(),
        angle,
        "Skew estimated"
    );
    angle
}

/// Estimate and, when it exceeds the threshold, correct skew.
/// Returns the corrected image and the rotation actually applied (0 if none).
pub fn deskew(img: &RgbImage, params: &DeskewParams) -> (RgbImage, f32) {
    let angle = estimate_skew(&rgb_to_gray(img), params);
    if angle.abs() > params.min_correction {
        (rotate_replicate(img, angle), angle)
    } else {
        (img.clone(), 0.0)
    }
}

/// Progressive probabilistic Hough transform (ρ = 1 px, θ = 1°).
///
/// Edge points vote in random order; as soon as a point's strongest bin
/// reaches `threshold`, the line through it is walked in both directions
/// (tolerating `max_line_gap` missing pixels). Points on an accepted segment
/// withdraw their votes and are removed from further consideration.
pub fn probabilistic_hough(
    edges: &GrayImage,
    threshold: u32,
    min_line_length: u32,
    max_line_gap: u32,
) -> Vec<LineSegment> {
    let (w, h) = (edges.width() as i64, edges.height() as i64);
    if w == 0 || h == 0 {
        return Vec::new();
    }

    let num_angle = 180usize;
    let num_rho = (2 * (w + h) + 1) as usize;
    let rho_offset = (num_rho as i64 - 1) / 2;
    let trig: Vec<(f32, f32)> = (0..num_angle)
        .map(|n| {
            let theta = (n as f32).to_radians();
            (theta.cos(), theta.sin())
        })
        .collect();

    let rho_index = |x: i64, y: i64, (cos, sin): (f32, f32)| -> usize {
        ((x as f32 * cos + y as f32 * sin).round() as i64 + rho_offset) as usize
    };

    let mut accum = vec![0i32; num_angle * num_rho];
    let mut mask = vec![false; (w * h) as usize];
    let mut points: Vec<(i64, i64)> = Vec::new();
    for (x, y, p) in edges.enumerate_pixels() {
        if p.0[0] != 0 {
            mask[(y as i64 * w + x as i64) as usize] = true;
            points.push((x as i64, y as i64));
        }
    }
    points.shuffle(&mut StdRng::seed_from_u64(HOUGH_SEED));

    let threshold = threshold.max(1) as i32;
    let min_len = min_line_length as i64;
    let max_gap = max_line_gap as i64;
    let mut segments = Vec::new();

    for &(px, py) in &points {
        if !mask[(py * w + px) as usize] {
            continue;
        }

        let mut best_votes = threshold - 1;
        let mut best_n = 0usize;
        for (n, &tc) in trig.iter().enumerate() {
            let cell = &mut accum[n * num_rho + rho_index(px, py, tc)];
            *cell += 1;
            if *cell > best_votes {
                best_votes = *cell;
                best_n = n;
            }
        }
        if best_votes < threshold {
            continue;
        }

        let walk = LineWalk::new(px, py, trig[best_n]);

        let mut ends = [(px, py); 2];
        for (k, end) in ends.iter_mut().enumerate() {
            let mut gap = 0i64;
            for (x, y) in walk.steps(k == 1, w, h) {
                if mask[(y * w + x) as usize] {
                    gap = 0;
                    *end = (x, y);
                } else {
                    gap += 1;
                    if gap > max_gap {
                        break;
                    }
                }
            }
        }

        let accepted = (ends[1].0 - ends[0].0).abs() >= min_len
            || (ends[1].1 - ends[0].1).abs() >= min_len;

        for (k, &end) in ends.iter().enumerate() {
            for (x, y) in walk.steps(k == 1, w, h) {
                let idx = (y * w + x) as usize;
                if mask[idx] {
                    if accepted {
                        for (n, &tc) in trig.iter().enumerate() {
                            accum[n * num_rho + rho_index(x, y, tc)] -= 1;
                        }
                    }
                    mask[idx] = false;
                }
                if (x, y) == end {
                    break;
                }
            }
        }

        if accepted {
            segments.push(LineSegment {
                x1: ends[0].0 as i32,
                y1: ends[0].1 as i32,
                x2: ends[1].0 as i32,
                y2: ends[1].1 as i32,
            });
        }
    }

    segments
}

/// Fixed-point stepping along the line through a seed point whose normal
/// has direction `(cos, sin)`. The dominant axis advances one pixel per step.
struct LineWalk {
    x0: i64,
    y0: i64,
    dx: i64,
    dy: i64,
    along_x: bool,
}

impl LineWalk {
    fn new(px: i64, py: i64, (cos, sin): (f32, f32)) -> Self {
        let a = -sin;
        let b = cos;
        let one = (1i64 << WALK_SHIFT) as f32;
        let half = 1i64 << (WALK_SHIFT - 1);
        if a.abs() > b.abs() {
            Self {
                x0: px,
                y0: (py << WALK_SHIFT) + half,
                dx: if a > 0.0 { 1 } else { -1 },
                dy: (b * one / a.abs()).round() as i64,
                along_x: true,
            }
        } else {
            Self {
                x0: (px << WALK_SHIFT) + half,
                y0: py,
                dx: (a * one / b.abs()).round() as i64,
                dy: if b > 0.0 { 1 } else { -1 },
                along_x: false,
            }
        }
    }

    /// In-bounds pixels from the seed outward, forward or backward.
    fn steps(&self, backward: bool, w: i64, h: i64) -> impl Iterator<Item = (i64, i64)> + '_ {
        let sign = if backward { -1 } else { 1 };
        (0i64..)
            .map(move |k| {
                let fx = self.x0 + sign * k * self.dx;
                let fy = self.y0 + sign * k * self.dy;
                if self.along_x {
                    (fx, fy >> WALK_SHIFT)
                } else {
                    (fx >> WALK_SHIFT, fy)
                }
            })
            .take_while(move |&(x, y)| x >= 0 && x < w && y >= 0 && y < h)
    }
}

/// Rotate about the image centre by `angle_deg` (positive lifts a line that
/// descends to the right). Output keeps the input size; borders replicate.
pub fn rotate_replicate(img: &RgbImage, angle_deg: f32) -> RgbImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return img.clone();
    }
    let (sin, cos) = angle_deg.to_radians().sin_cos();
    // Pivot is the integer centre floor(w / 2), not w / 2.0.
    let cx = (w / 2) as f32;
    let cy = (h / 2) as f32;

    RgbImage::from_fn(w, h, |x, y| {
        let rx = x as f32 - cx;
        let ry = y as f32 - cy;
        let sx = cos * rx - sin * ry + cx;
        let sy = sin * rx + cos * ry + cy;
        sample_bicubic(img, sx, sy)
    })
}

fn sample_bicubic(img: &RgbImage, sx: f32, sy: f32) -> Rgb<u8> {
    let (w, h) = (img.width() as i64, img.height() as i64);
    let x0 = sx.floor();
    let y0 = sy.floor();
    let wx = cubic_weights(sx - x0);
    let wy = cubic_weights(sy - y0);
    let (x0, y0) = (x0 as i64, y0 as i64);

    let mut acc = [0f32; 3];
    for (j, weight_y) in wy.iter().enumerate() {
        let py = (y0 - 1 + j as i64).clamp(0, h - 1) as u32;
        for (i, weight_x) in wx.iter().enumerate() {
            let px = (x0 - 1 + i as i64).clamp(0, w - 1) as u32;
            let p = img.get_pixel(px, py);
            let weight = weight_x * weight_y;
            for c in 0..3 {
                acc[c] += weight * p.0[c] as f32;
            }
        }
    }
    Rgb(acc.map(|v| v.round().clamp(0.0, 255.0) as u8))
}

/// Cubic convolution weights (a = -0.75) for the four taps around `t`.
fn cubic_weights(t: f32) -> [f32; 4] {
    const A: f32 = -0.75;
    let w0 = ((A * (t + 1.0) - 5.0 * A) * (t + 1.0) + 8.0 * A) * (t + 1.0) - 4.0 * A;
    let w1 = ((A + 2.0) * t - (A + 3.0)) * t * t + 1.0;
    let w2 = ((A + 2.0) * (1.0 - t) - (A + 3.0)) * (1.0 - t) * (1.0 - t) + 1.0;
    [w0, w1, w2, 1.0 - w0 - w1 - w2]
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Luma;

    /// White page with four dark bars tilted by `angle_deg` about the centre.
    pub(crate) fn skewed_bars(width: u32, height: u32, angle_deg: f32) -> RgbImage {
        let (sin, cos) = angle_deg.to_radians().sin_cos();
        let cx = width as f32 / 2.0;
        let cy = height as f32 / 2.0;
        let half_len = width as f32 * 0.375;
        RgbImage::from_fn(width, height, |x, y| {
            let rx = x as f32 - cx;
            let ry = y as f32 - cy;
            let along = cos * rx + sin * ry;
            let across = -sin * rx + cos * ry;
            let on_bar = along.abs() <= half_len
                && [-45.0f32, -15.0, 15.0, 45.0]
                    .iter()
                    .any(|offset| (across - offset).abs() <= 6.0);
            if on_bar {
                Rgb([20, 20, 20])
            } else {
                Rgb([245, 245, 245])
            }
        })
    }

    #[test]
    fn segment_angles() {
        let flat = LineSegment { x1: 0, y1: 5, x2: 100, y2: 5 };
        assert_eq!(flat.angle_degrees(), 0.0);

        let vertical = LineSegment { x1: 4, y1: 0, x2: 4, y2: 50 };
        assert_eq!(vertical.angle_degrees(), 90.0);

        let reversed = LineSegment { x1: 100, y1: 10, x2: 0, y2: 0 };
        assert!((reversed.angle_degrees() - 5.71).abs() < 0.01);
    }

    #[test]
    fn blank_page_has_zero_skew() {
        let gray = GrayImage::from_pixel(120, 80, Luma([255]));
        assert_eq!(estimate_skew(&gray, &DeskewParams::default()), 0.0);
    }

    #[test]
    fn tiny_image_has_zero_skew() {
        let gray = GrayImage::from_pixel(2, 2, Luma([0]));
        assert_eq!(estimate_skew(&gray, &DeskewParams::default()), 0.0);
    }

    #[test]
    fn hough_traces_horizontal_line() {
        let mut edges = GrayImage::new(200, 60);
        for x in 20..180 {
            edges.put_pixel(x, 30, Luma([255]));
        }
        let segments = probabilistic_hough(&edges, 80, 50, 20);
        assert_eq!(segments.len(), 1, "got {segments:?}");
        let s = segments[0];
        assert_eq!(s.angle_degrees(), 0.0);
        assert!((s.x2 - s.x1).abs() >= 150);
    }

    #[test]
    fn hough_ignores_short_fragments() {
        let mut edges = GrayImage::new(200, 60);
        for x in 20..40 {
            edges.put_pixel(x, 30, Luma([255]));
        }
        assert!(probabilistic_hough(&edges, 10, 50, 20).is_empty());
    }

    #[test]
    fn estimate_recovers_synthetic_skew() {
        let img = skewed_bars(320, 200, 3.0);
        let angle = estimate_skew(&rgb_to_gray(&img), &DeskewParams::default());
        assert!((angle - 3.0).abs() < 0.5, "expected ~3°, got {angle}");
    }

    #[test]
    fn estimate_sign_follows_direction() {
        let img = skewed_bars(320, 200, -4.0);
        let angle = estimate_skew(&rgb_to_gray(&img), &DeskewParams::default());
        assert!((angle + 4.0).abs() < 0.5, "expected ~-4°, got {angle}");
    }

    #[test]
    fn deskew_straightens_and_second_pass_is_quiet() {
        let params = DeskewParams::default();
        let (straight, applied) = deskew(&skewed_bars(320, 200, 3.0), &params);
        assert!(applied.abs() > 2.0, "first pass should rotate, applied {applied}");

        let residual = estimate_skew(&rgb_to_gray(&straight), &params);
        assert!(residual.abs() <= 0.2, "residual skew {residual}");
    }

    #[test]
    fn small_skew_not_corrected() {
        let img = RgbImage::from_pixel(50, 50, Rgb([255, 255, 255]));
        let (out, applied) = deskew(&img, &DeskewParams::default());
        assert_eq!(applied, 0.0);
        assert_eq!(out, img);
    }

    #[test]
    fn rotation_replicates_borders() {
        let img = RgbImage::from_pixel(60, 40, Rgb([240, 240, 240]));
        let rotated = rotate_replicate(&img, 10.0);
        assert_eq!(rotated.dimensions(), (60, 40));
        for &(x, y) in &[(0, 0), (59, 0), (0, 39), (59, 39)] {
            assert_eq!(rotated.get_pixel(x, y).0, [240, 240, 240], "corner ({x},{y})");
        }
    }

    #[test]
    fn odd_width_pivots_on_integer_centre() {
        let img = RgbImage::from_fn(5, 3, |x, _| {
            let v = ((x + 1) * 40) as u8;
            Rgb([v, v, v])
        });
        let rotated = rotate_replicate(&img, 180.0);
        let row: Vec<u8> = (0..5).map(|x| rotated.get_pixel(x, 1).0[0]).collect();
        assert_eq!(row, vec![200, 160, 120, 80, 40], "column 2 must stay fixed");
    }

    #[test]
    fn zero_rotation_is_identity() {
        let img = RgbImage::from_fn(16, 12, |x, y| Rgb([(x * 10) as u8, (y * 10) as u8, 7]));
        assert_eq!(rotate_replicate(&img, 0.0), img);
    }

    #[test]
    fn cubic_weights_partition_unity() {
        for &t in &[0.0f32, 0.25, 0.5, 0.9] {
            let sum: f32 = cubic_weights(t).iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
        let w = cubic_weights(0.0);
        assert!((w[1] - 1.0).abs() < 1e-6 && w[0].abs() < 1e-6 && w[2].abs() < 1e-6);
    }
}
