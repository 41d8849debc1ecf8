//! Pixel-level building blocks shared by the normalizer and the segmenter.
//!
//! Everything here is pure, synchronous and single-threaded over one image.
//! Threshold and morphology conventions follow the usual document-imaging
//! semantics: foreground is non-zero, inverse thresholds map ink to 255.

use std::collections::VecDeque;

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::contrast::{otsu_level, threshold, ThresholdType};

use super::types::BoundingBox;
use super::NormalizeError;

/// Reject zero-sized images before any step touches them.
pub fn ensure_non_empty(width: u32, height: u32) -> Result<(), NormalizeError> {
    if width == 0 || height == 0 {
        return Err(NormalizeError::EmptyImage { width, height });
    }
    Ok(())
}

/// Convert RGB to grayscale using ITU-R BT.601 luminance.
pub fn rgb_to_gray(rgb: &RgbImage) -> GrayImage {
    let (w, h) = rgb.dimensions();
    let mut gray = GrayImage::new(w, h);
    for (x, y, p) in rgb.enumerate_pixels() {
        let luma = 0.299 * p.0[0] as f32 + 0.587 * p.0[1] as f32 + 0.114 * p.0[2] as f32;
        gray.put_pixel(x, y, Luma([luma.round().clamp(0.0, 255.0) as u8]));
    }
    gray
}

/// Replicate a single channel into three.
pub fn gray_to_rgb(gray: &GrayImage) -> RgbImage {
    let (w, h) = gray.dimensions();
    let mut rgb = RgbImage::new(w, h);
    for (x, y, p) in gray.enumerate_pixels() {
        let v = p.0[0];
        rgb.put_pixel(x, y, Rgb([v, v, v]));
    }
    rgb
}

/// Ink mask of a grayscale image via inverse Otsu: pixels above the level
/// become 0, the rest 255. A single-intensity image has level 0, so a blank
/// white page yields no ink.
pub fn otsu_ink_mask(gray: &GrayImage) -> GrayImage {
    threshold(gray, otsu_level(gray), ThresholdType::BinaryInverted)
}

/// Mean pixel intensity.
pub fn mean_intensity(gray: &GrayImage) -> f64 {
    let count = gray.width() as u64 * gray.height() as u64;
    if count == 0 {
        return 0.0;
    }
    let sum: u64 = gray.pixels().map(|p| p.0[0] as u64).sum();
    sum as f64 / count as f64
}

// ── Rectangular morphology ───────────────────────────────

/// Dilate with a `kw`x`kh` rectangle anchored at its centre.
pub fn dilate_rect(img: &GrayImage, kw: u32, kh: u32) -> GrayImage {
    morph_rect(img, kw, kh, true, false)
}

/// Erosion followed by dilation with the reflected element.
pub fn open_rect(img: &GrayImage, kw: u32, kh: u32) -> GrayImage {
    morph_rect(&morph_rect(img, kw, kh, false, false), kw, kh, true, true)
}

/// Dilation followed by erosion with the reflected element.
pub fn close_rect(img: &GrayImage, kw: u32, kh: u32) -> GrayImage {
    morph_rect(&morph_rect(img, kw, kh, true, false), kw, kh, false, true)
}

/// Separable rectangle morphology. A rectangle's max (or min) is the
/// row-wise extreme followed by the column-wise extreme.
fn morph_rect(img: &GrayImage, kw: u32, kh: u32, take_max: bool, reflect: bool) -> GrayImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return img.clone();
    }
    let (w, h) = (w as usize, h as usize);
    let (before_x, after_x) = window_extent(kw.max(1) as usize, reflect);
    let (before_y, after_y) = window_extent(kh.max(1) as usize, reflect);

    let src = img.as_raw();
    let mut rows = vec![0u8; w * h];
    for y in 0..h {
        let line = &src[y * w..(y + 1) * w];
        sliding_extreme(line, before_x, after_x, take_max, &mut rows[y * w..(y + 1) * w]);
    }

    let mut column = vec![0u8; h];
    let mut column_out = vec![0u8; h];
    let mut out = vec![0u8; w * h];
    for x in 0..w {
        for y in 0..h {
            column[y] = rows[y * w + x];
        }
        sliding_extreme(&column, before_y, after_y, take_max, &mut column_out);
        for y in 0..h {
            out[y * w + x] = column_out[y];
        }
    }

    GrayImage::from_raw(w as u32, h as u32, out).unwrap_or_else(|| img.clone())
}

/// Pixels covered before and after the anchor for a kernel of length `k`.
fn window_extent(k: usize, reflect: bool) -> (usize, usize) {
    let anchor = k / 2;
    if reflect {
        (k - 1 - anchor, anchor)
    } else {
        (anchor, k - 1 - anchor)
    }
}

/// Running max/min over `[i - before, i + after]`, ignoring out-of-range cells.
/// Monotonic deque: O(n) regardless of window length.
fn sliding_extreme(src: &[u8], before: usize, after: usize, take_max: bool, out: &mut [u8]) {
    let n = src.len();
    if n == 0 {
        return;
    }
    let dominates = |a: u8, b: u8| if take_max { a >= b } else { a <= b };
    let mut window: VecDeque<usize> = VecDeque::new();
    let mut next = 0usize;

    for i in 0..n {
        let hi = (i + after).min(n - 1);
        while next <= hi {
            while let Some(&back) = window.back() {
                if dominates(src[next], src[back]) {
                    window.pop_back();
                } else {
                    break;
                }
            }
            window.push_back(next);
            next += 1;
        }
        let lo = i.saturating_sub(before);
        while let Some(&front) = window.front() {
            if front < lo {
                window.pop_front();
            } else {
                break;
            }
        }
        if let Some(&best) = window.front() {
            out[i] = src[best];
        }
    }
}

// ── Contours ─────────────────────────────────────────────

/// Bounding boxes of the outermost foreground contours.
/// Components nested inside another component's hole are not reported.
pub fn external_boxes(mask: &GrayImage) -> Vec<BoundingBox> {
    find_contours::<u32>(mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .filter_map(|c| {
            let min_x = c.points.iter().map(|p| p.x).min()?;
            let max_x = c.points.iter().map(|p| p.x).max()?;
            let min_y = c.points.iter().map(|p| p.y).min()?;
            let max_y = c.points.iter().map(|p| p.y).max()?;
            Some(BoundingBox {
                x: min_x,
                y: min_y,
                width: max_x - min_x + 1,
                height: max_y - min_y + 1,
            })
        })
        .collect()
}

/// Median with even-length averaging. `None` for an empty slice.
pub fn median(values: &[f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Gaussian smoothing with an explicit odd kernel size and replicated borders.
/// Sigma is derived from the size the same way common imaging libraries do.
pub fn gaussian_blur_sized(gray: &GrayImage, ksize: u32) -> Vec<f32> {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let kernel = gaussian_kernel(ksize.max(1) | 1);
    let radius = (kernel.len() / 2) as isize;
    let src = gray.as_raw();

    let clamp = |v: isize, max: usize| v.clamp(0, max as isize - 1) as usize;

    let mut horizontal = vec![0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0f32;
            for (k, weight) in kernel.iter().enumerate() {
                let sx = clamp(x as isize + k as isize - radius, w);
                acc += weight * src[y * w + sx] as f32;
            }
            horizontal[y * w + x] = acc;
        }
    }

    let mut out = vec![0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0f32;
            for (k, weight) in kernel.iter().enumerate() {
                let sy = clamp(y as isize + k as isize - radius, h);
                acc += weight * horizontal[sy * w + x];
            }
            out[y * w + x] = acc;
        }
    }
    out
}

fn gaussian_kernel(ksize: u32) -> Vec<f32> {
    let sigma = 0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let center = (ksize / 2) as f32;
    let weights: Vec<f32> = (0..ksize)
        .map(|i| {
            let d = i as f32 - center;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = weights.iter().sum();
    weights.into_iter().map(|v| v / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_from(w: u32, h: u32, f: impl Fn(u32, u32) -> u8) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| Luma([f(x, y)]))
    }

    #[test]
    fn empty_dimensions_rejected() {
        assert!(ensure_non_empty(0, 10).is_err());
        assert!(ensure_non_empty(10, 0).is_err());
        assert!(ensure_non_empty(1, 1).is_ok());
    }

    #[test]
    fn gray_conversion_uses_luminance_weights() {
        let rgb = RgbImage::from_pixel(1, 1, Rgb([255, 0, 0]));
        assert_eq!(rgb_to_gray(&rgb).get_pixel(0, 0).0[0], 76);
        let white = RgbImage::from_pixel(1, 1, Rgb([255, 255, 255]));
        assert_eq!(rgb_to_gray(&white).get_pixel(0, 0).0[0], 255);
    }

    #[test]
    fn otsu_splits_bimodal_image() {
        let img = gray_from(20, 20, |x, _| if x < 10 { 30 } else { 220 });
        let mask = otsu_ink_mask(&img);
        assert_eq!(mask.get_pixel(0, 0).0[0], 255, "dark side is ink");
        assert_eq!(mask.get_pixel(19, 0).0[0], 0, "light side is background");
    }

    #[test]
    fn otsu_uniform_white_has_no_ink() {
        let img = gray_from(16, 16, |_, _| 255);
        assert!(otsu_ink_mask(&img).pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn dilate_wide_kernel_bridges_gap() {
        let img = gray_from(30, 3, |x, y| if y == 1 && (x == 5 || x == 15) { 255 } else { 0 });
        let out = dilate_rect(&img, 11, 1);
        assert!((5..=15).all(|x| out.get_pixel(x, 1).0[0] == 255));
        assert_eq!(out.get_pixel(10, 0).0[0], 0, "1-row kernel must not grow vertically");
    }

    #[test]
    fn open_removes_isolated_pixel() {
        let mut img = gray_from(10, 10, |_, _| 0);
        img.put_pixel(5, 5, Luma([255]));
        let out = open_rect(&img, 2, 2);
        assert!(out.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn close_fills_single_pixel_gap() {
        let img = gray_from(10, 4, |x, y| if (1..3).contains(&y) && x != 5 { 255 } else { 0 });
        let out = close_rect(&img, 2, 2);
        assert_eq!(out.get_pixel(5, 1).0[0], 255);
        assert_eq!(out.get_pixel(5, 2).0[0], 255);
    }

    #[test]
    fn open_preserves_solid_block() {
        let img = gray_from(12, 12, |x, y| if (3..9).contains(&x) && (3..9).contains(&y) { 255 } else { 0 });
        assert_eq!(open_rect(&img, 2, 2), img);
        assert_eq!(close_rect(&img, 2, 2), img);
    }

    #[test]
    fn external_boxes_skip_nested_components() {
        // Hollow square with a dot inside its hole.
        let img = gray_from(20, 20, |x, y| {
            let border = (2..18).contains(&x)
                && (2..18).contains(&y)
                && (x == 2 || x == 17 || y == 2 || y == 17);
            let dot = x == 10 && y == 10;
            if border || dot {
                255
            } else {
                0
            }
        });
        let boxes = external_boxes(&img);
        assert_eq!(boxes.len(), 1);
        assert_eq!(
            boxes[0],
            BoundingBox {
                x: 2,
                y: 2,
                width: 16,
                height: 16
            }
        );
    }

    #[test]
    fn external_boxes_empty_mask() {
        let img = gray_from(10, 10, |_, _| 0);
        assert!(external_boxes(&img).is_empty());
    }

    #[test]
    fn median_averages_even_length() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
    }

    #[test]
    fn gaussian_blur_keeps_flat_image_flat() {
        let img = gray_from(15, 9, |_, _| 100);
        let blurred = gaussian_blur_sized(&img, 21);
        assert!(blurred.iter().all(|v| (v - 100.0).abs() < 1e-3));
    }

    #[test]
    fn gaussian_kernel_sums_to_one() {
        let kernel = gaussian_kernel(31);
        assert_eq!(kernel.len(), 31);
        let sum: f32 = kernel.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn mean_intensity_of_half_white() {
        let img = gray_from(10, 2, |_, y| if y == 0 { 255 } else { 0 });
        assert!((mean_intensity(&img) - 127.5).abs() < 1e-9);
    }
}
