//! Non-local-means colour denoising.
//!
//! Every pixel becomes a weighted average of the pixels in its search window,
//! weighted by how similar their surrounding patches are. Flat paper speckle
//! averages away while stroke edges (whose patches differ strongly) keep
//! their contrast.
//!
//! The sweep runs offset by offset: for each displacement in the search
//! window, a per-pixel patch distance is built with a sliding box sum, so the
//! cost is O(pixels x search_window^2) independent of the template size.
//! The image is cut into horizontal bands that rayon denoises in parallel;
//! each band keeps only its own rows (plus a template-radius halo) in memory.
//! Distances are exact integer sums of squared 8-bit differences.

use image::{Rgb, RgbImage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Weights below this are treated as zero and skipped.
const MIN_WEIGHT: f32 = 1e-3;

/// Distance resolution of the weight lookup table (entries per unit of d²).
const LUT_STEPS_PER_UNIT: f32 = 4.0;

/// Output rows per parallel work item.
const BAND_ROWS: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NlMeansParams {
    /// Filter strength. Larger removes more noise and more detail.
    pub h: f32,
    /// Patch side length (odd).
    pub template_window: u32,
    /// Search area side length (odd).
    pub search_window: u32,
}

impl Default for NlMeansParams {
    fn default() -> Self {
        Self {
            h: 10.0,
            template_window: 7,
            search_window: 21,
        }
    }
}

/// Per-call constants shared by every band.
struct Sweep<'a> {
    src: &'a [u8],
    width: usize,
    height: usize,
    template_radius: usize,
    search_radius: isize,
    /// Multiplies a patch sum of squared differences into a LUT slot.
    slot_scale: f32,
    lut: Vec<f32>,
}

/// Denoise a colour image. Channels share one patch distance so that colour
/// edges are judged jointly.
pub fn nl_means_colored(img: &RgbImage, params: &NlMeansParams) -> RgbImage {
    let (w, h) = (img.width() as usize, img.height() as usize);
    if w == 0 || h == 0 || params.h <= 0.0 {
        return img.clone();
    }

    let template_radius = (params.template_window.max(1) / 2) as usize;
    let patch_area = ((2 * template_radius + 1) * (2 * template_radius + 1)) as f32;
    let sweep = Sweep {
        src: img.as_raw(),
        width: w,
        height: h,
        template_radius,
        search_radius: (params.search_window.max(1) / 2) as isize,
        slot_scale: LUT_STEPS_PER_UNIT / (3.0 * patch_area),
        lut: weight_table(params.h),
    };

    let mut out = RgbImage::new(w as u32, h as u32);
    let pixels: &mut [u8] = &mut out;
    pixels
        .par_chunks_mut(BAND_ROWS * w * 3)
        .enumerate()
        .for_each(|(band, rows)| sweep.denoise_band(band * BAND_ROWS, rows));
    out
}

impl Sweep<'_> {
    /// Denoise output rows starting at `y0`; `out` holds those rows' RGB bytes.
    fn denoise_band(&self, y0: usize, out: &mut [u8]) {
        let w = self.width;
        let rows = out.len() / (w * 3);
        let r = self.template_radius;
        let span = 2 * r + 1;
        // Rows y0 - r .. y0 + rows + r, clamped to the image.
        let halo_rows = rows + 2 * r;

        let mut row_diff = vec![0u32; w];
        let mut horizontal = vec![0u32; halo_rows * w];
        let mut patch = vec![0u32; w];
        let mut acc = vec![0f32; rows * w * 3];
        let mut weights = vec![0f32; rows * w];

        for dy in -self.search_radius..=self.search_radius {
            for dx in -self.search_radius..=self.search_radius {
                for e in 0..halo_rows {
                    let y = clamp_index(y0 as isize + e as isize - r as isize, self.height);
                    let sy = clamp_index(y as isize + dy, self.height);
                    squared_row_diff(self.row(y), self.row(sy), dx, &mut row_diff);
                    window_sum(&row_diff, r, &mut horizontal[e * w..(e + 1) * w]);
                }

                patch.fill(0);
                for e in 0..span {
                    add_row(&mut patch, &horizontal[e * w..(e + 1) * w]);
                }

                for local in 0..rows {
                    if local > 0 {
                        let (leaving, entering) = (local - 1, local + span - 1);
                        slide_row(
                            &mut patch,
                            &horizontal[entering * w..(entering + 1) * w],
                            &horizontal[leaving * w..(leaving + 1) * w],
                        );
                    }
                    let sy = clamp_index((y0 + local) as isize + dy, self.height);
                    self.accumulate(
                        &patch,
                        self.row(sy),
                        dx,
                        &mut acc[local * w * 3..(local + 1) * w * 3],
                        &mut weights[local * w..(local + 1) * w],
                    );
                }
            }
        }

        for (i, px) in out.chunks_exact_mut(3).enumerate() {
            let total = weights[i];
            if total > 0.0 {
                for c in 0..3 {
                    px[c] = (acc[i * 3 + c] / total).round().clamp(0.0, 255.0) as u8;
                }
            } else {
                let y = y0 + i / w;
                let x = i % w;
                px.copy_from_slice(&self.row(y)[x * 3..x * 3 + 3]);
            }
        }
    }

    fn row(&self, y: usize) -> &[u8] {
        &self.src[y * self.width * 3..(y + 1) * self.width * 3]
    }

    fn accumulate(&self, patch: &[u32], shifted: &[u8], dx: isize, acc: &mut [f32], weights: &mut [f32]) {
        let w = self.width;
        for (x, &distance) in patch.iter().enumerate() {
            let slot = (distance as f32 * self.slot_scale) as usize;
            let Some(&weight) = self.lut.get(slot) else {
                continue;
            };
            let sx = clamp_index(x as isize + dx, w);
            let b = &shifted[sx * 3..sx * 3 + 3];
            acc[x * 3] += weight * b[0] as f32;
            acc[x * 3 + 1] += weight * b[1] as f32;
            acc[x * 3 + 2] += weight * b[2] as f32;
            weights[x] += weight;
        }
    }
}

fn squared_distance(a: &[u8], b: &[u8]) -> u32 {
    a.iter()
        .zip(b)
        .map(|(&p, &q)| {
            let d = p as i32 - q as i32;
            (d * d) as u32
        })
        .sum()
}

/// Per-pixel squared RGB distance between row `a` and row `b` shifted by `dx`,
/// with replicated borders.
fn squared_row_diff(a: &[u8], b: &[u8], dx: isize, out: &mut [u32]) {
    let w = out.len();
    let lo = (-dx).clamp(0, w as isize) as usize;
    let hi = ((w as isize - dx).clamp(0, w as isize) as usize).max(lo);

    for x in (0..lo).chain(hi..w) {
        let sx = clamp_index(x as isize + dx, w);
        out[x] = squared_distance(&a[x * 3..x * 3 + 3], &b[sx * 3..sx * 3 + 3]);
    }

    if hi == lo {
        return;
    }
    // Interior: no clamping needed, so the slices line up directly.
    let shift = (lo as isize + dx) as usize;
    let interior = a[lo * 3..hi * 3]
        .chunks_exact(3)
        .zip(b[shift * 3..(shift + hi - lo) * 3].chunks_exact(3));
    for (slot, (pa, pb)) in out[lo..hi].iter_mut().zip(interior) {
        *slot = squared_distance(pa, pb);
    }
}

/// Sum over `[x - r, x + r]` with replicated borders.
fn window_sum(line: &[u32], r: usize, out: &mut [u32]) {
    let len = line.len();
    let at = |i: isize| line[clamp_index(i, len)];
    let r = r as isize;

    let mut sum: u32 = (-r..=r).map(at).sum();
    for (x, slot) in out.iter_mut().enumerate() {
        *slot = sum;
        let x = x as isize;
        sum = sum + at(x + r + 1) - at(x - r);
    }
}

fn add_row(acc: &mut [u32], row: &[u32]) {
    for (a, &v) in acc.iter_mut().zip(row) {
        *a += v;
    }
}

fn slide_row(acc: &mut [u32], entering: &[u32], leaving: &[u32]) {
    for ((a, &add), &sub) in acc.iter_mut().zip(entering).zip(leaving) {
        *a = *a + add - sub;
    }
}

/// exp(-d²/h²) sampled until the weight drops below `MIN_WEIGHT`.
fn weight_table(h: f32) -> Vec<f32> {
    let h2 = h * h;
    let cutoff = -MIN_WEIGHT.ln() * h2;
    let len = (cutoff * LUT_STEPS_PER_UNIT).ceil() as usize + 1;
    (0..len)
        .map(|i| (-(i as f32 / LUT_STEPS_PER_UNIT) / h2).exp())
        .collect()
}

fn clamp_index(v: isize, len: usize) -> usize {
    v.clamp(0, len as isize - 1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_params() -> NlMeansParams {
        NlMeansParams {
            h: 10.0,
            template_window: 3,
            search_window: 7,
        }
    }

    fn channel_variance(img: &RgbImage) -> f64 {
        let values: Vec<f64> = img.pixels().map(|p| p.0[0] as f64).collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
    }

    #[test]
    fn flat_image_unchanged() {
        let img = RgbImage::from_pixel(16, 12, Rgb([200, 180, 160]));
        let out = nl_means_colored(&img, &NlMeansParams::default());
        assert_eq!(out, img);
    }

    #[test]
    fn speckle_variance_reduced() {
        let img = RgbImage::from_fn(24, 24, |x, y| {
            let v = if (x * 7 + y * 13) % 5 == 0 { 140 } else { 128 };
            Rgb([v, v, v])
        });
        let out = nl_means_colored(&img, &small_params());
        assert!(
            channel_variance(&out) < channel_variance(&img) * 0.5,
            "denoised variance {} vs input {}",
            channel_variance(&out),
            channel_variance(&img)
        );
    }

    #[test]
    fn strong_edge_preserved() {
        let img = RgbImage::from_fn(24, 16, |x, _| {
            if x < 12 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        let out = nl_means_colored(&img, &small_params());
        assert!(out.get_pixel(10, 8).0[0] < 10, "dark side bled: {:?}", out.get_pixel(10, 8));
        assert!(out.get_pixel(13, 8).0[0] > 245, "light side bled: {:?}", out.get_pixel(13, 8));
    }

    #[test]
    fn dimensions_preserved() {
        let img = RgbImage::from_pixel(9, 5, Rgb([10, 20, 30]));
        let out = nl_means_colored(&img, &small_params());
        assert_eq!(out.dimensions(), (9, 5));
    }

    #[test]
    fn weight_table_starts_at_one_and_decays() {
        let lut = weight_table(10.0);
        assert!((lut[0] - 1.0).abs() < 1e-6);
        assert!(lut.windows(2).all(|w| w[1] <= w[0]));
        assert!(*lut.last().unwrap() >= MIN_WEIGHT * 0.9);
    }

    #[test]
    fn window_sum_replicates_borders() {
        let line = [1u32, 2, 3, 4];
        let mut out = [0u32; 4];
        window_sum(&line, 1, &mut out);
        assert_eq!(out, [4, 6, 9, 11]);
    }

    #[test]
    fn row_diff_handles_shift_wider_than_row() {
        let a = [10u8, 10, 10, 20, 20, 20];
        let b = [0u8, 0, 0, 30, 30, 30];
        let mut out = [0u32; 2];
        squared_row_diff(&a, &b, -5, &mut out);
        assert_eq!(out, [300, 1200]);
        squared_row_diff(&a, &b, 5, &mut out);
        assert_eq!(out, [1200, 300]);
    }

    /// Direct per-pixel evaluation of the same filter.
    fn reference(img: &RgbImage, params: &NlMeansParams) -> RgbImage {
        let (w, h) = (img.width() as isize, img.height() as isize);
        let r = (params.template_window / 2) as isize;
        let s = (params.search_window / 2) as isize;
        let area = ((2 * r + 1) * (2 * r + 1)) as f32;
        let lut = weight_table(params.h);
        let at = |x: isize, y: isize| {
            img.get_pixel(x.clamp(0, w - 1) as u32, y.clamp(0, h - 1) as u32).0
        };
        RgbImage::from_fn(w as u32, h as u32, |x, y| {
            let (x, y) = (x as isize, y as isize);
            let mut acc = [0f32; 3];
            let mut total = 0f32;
            for dy in -s..=s {
                for dx in -s..=s {
                    let mut distance = 0u32;
                    for py in -r..=r {
                        for px in -r..=r {
                            let qy = (y + py).clamp(0, h - 1);
                            let qx = (x + px).clamp(0, w - 1);
                            distance += squared_distance(&at(qx, qy), &at(qx + dx, qy + dy));
                        }
                    }
                    let slot = (distance as f32 * (LUT_STEPS_PER_UNIT / (3.0 * area))) as usize;
                    if let Some(&weight) = lut.get(slot) {
                        let b = at(x + dx, y + dy);
                        for c in 0..3 {
                            acc[c] += weight * b[c] as f32;
                        }
                        total += weight;
                    }
                }
            }
            Rgb(std::array::from_fn(|c| (acc[c] / total).round().clamp(0.0, 255.0) as u8))
        })
    }

    #[test]
    fn banded_sweep_matches_direct_evaluation() {
        // Taller than one band so band seams and halos are exercised.
        let img = RgbImage::from_fn(20, BAND_ROWS as u32 * 2 + 6, |x, y| {
            let base = if (x / 4 + y / 5) % 2 == 0 { 60 } else { 190 };
            let jitter = ((x * 31 + y * 17) % 9) as u8;
            Rgb([base + jitter, base, base - jitter])
        });
        let params = NlMeansParams {
            h: 12.0,
            template_window: 3,
            search_window: 5,
        };
        let fast = nl_means_colored(&img, &params);
        let slow = reference(&img, &params);
        for (a, b) in fast.pixels().zip(slow.pixels()) {
            for c in 0..3 {
                assert!(
                    (a.0[c] as i16 - b.0[c] as i16).abs() <= 1,
                    "banded {:?} vs direct {:?}",
                    a,
                    b
                );
            }
        }
    }
}
