//! Page normalization for OCR.
//!
//! `ImageNormalizer` runs five steps in a fixed order:
//! 1. upscale so the median glyph is roughly `target_glyph_height` pixels tall
//! 2. non-local-means colour denoise
//! 3. deskew by the median Hough line angle
//! 4. adaptive Gaussian binarization (dark text on white)
//! 5. morphological cleanup (open then close)
//!
//! The result stays 3-channel so downstream consumers see one pixel format.
//! `PreprocessingPipeline` composes the normalizer with the segmenter and is
//! what the orchestrator runs on its blocking worker pool.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use imageproc::filter::median_filter;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::denoise::{nl_means_colored, NlMeansParams};
use super::deskew::{deskew, DeskewParams};
use super::imaging::{
    close_rect, ensure_non_empty, external_boxes, gaussian_blur_sized, gray_to_rgb, mean_intensity,
    median, open_rect, otsu_ink_mask, rgb_to_gray,
};
use super::segment::PageSegmenter;
use super::traits::PagePreprocessor;
use super::types::{BoundingBox, ContentBlock, BlockType, NormalizedPage, Page, SegmentedPage};
use super::NormalizeError;

// ═══════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Desired median glyph height after upscaling, in pixels.
    pub target_glyph_height: f32,
    /// Upper bound on the upscale factor.
    pub max_upscale: f32,
    /// Glyph candidates must be wider than this...
    pub min_glyph_width: u32,
    /// ...and narrower than this fraction of the page width.
    pub max_glyph_width_ratio: f32,
    /// Longest side allowed after upscaling.
    pub max_upscaled_dimension: u32,
    pub denoise: NlMeansParams,
    pub deskew: DeskewParams,
    /// Binarization block size for pages whose longest side is below `large_page_dimension`.
    pub small_block_size: u32,
    pub large_block_size: u32,
    pub large_page_dimension: u32,
    /// Constant subtracted from the local Gaussian mean.
    pub threshold_offset: f32,
    /// Side of the square open/close element.
    pub cleanup_kernel: u32,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            target_glyph_height: 28.0,
            max_upscale: 4.0,
            min_glyph_width: 5,
            max_glyph_width_ratio: 0.8,
            max_upscaled_dimension: 8192,
            denoise: NlMeansParams::default(),
            deskew: DeskewParams::default(),
            small_block_size: 21,
            large_block_size: 31,
            large_page_dimension: 1000,
            threshold_offset: 10.0,
            cleanup_kernel: 2,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Normalizer
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct ImageNormalizer {
    config: NormalizerConfig,
}

impl ImageNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Normalize one page. Only an empty image is an error.
    pub fn normalize(&self, page: &Page) -> Result<NormalizedPage, NormalizeError> {
        let (width, height) = page.dimensions();
        ensure_non_empty(width, height)?;

        // 1. Upscale
        let scale = self.upscale_factor(&rgb_to_gray(&page.image));
        let upscaled = if scale > 1.0 {
            let new_w = (width as f32 * scale).round().max(1.0) as u32;
            let new_h = (height as f32 * scale).round().max(1.0) as u32;
            imageops::resize(&page.image, new_w, new_h, FilterType::CatmullRom)
        } else {
            page.image.clone()
        };

        // 2. Denoise
        let denoised = nl_means_colored(&upscaled, &self.config.denoise);

        // 3. Deskew
        let (straight, skew_angle) = deskew(&denoised, &self.config.deskew);

        // 4. Binarize
        let binary = self.binarize(&rgb_to_gray(&straight));

        // 5. Cleanup
        let k = self.config.cleanup_kernel;
        let cleaned = close_rect(&open_rect(&binary, k, k), k, k);

        debug!(
            page = page.index,
            scale,
            skew_angle,
            width = cleaned.width(),
            height = cleaned.height(),
            "Page normalized"
        );

        Ok(NormalizedPage {
            index: page.index,
            image: gray_to_rgb(&cleaned),
            skew_angle,
        })
    }

    /// Factor that brings the median glyph height to the target, in `[1, max_upscale]`,
    /// shrunk further if the page would outgrow `max_upscaled_dimension`.
    pub fn upscale_factor(&self, gray: &GrayImage) -> f32 {
        let cfg = &self.config;
        let page_width = gray.width() as f32;
        let glyphs = open_rect(&otsu_ink_mask(gray), 3, 3);

        let heights: Vec<f32> = external_boxes(&glyphs)
            .into_iter()
            .filter(|b| {
                b.width > cfg.min_glyph_width
                    && (b.width as f32) < cfg.max_glyph_width_ratio * page_width
            })
            .map(|b| b.height as f32)
            .collect();

        let Some(median_height) = median(&heights) else {
            return 1.0;
        };

        let mut scale = (cfg.target_glyph_height / (median_height + 1e-6)).clamp(1.0, cfg.max_upscale);
        let longest = gray.width().max(gray.height()) as f32;
        if longest * scale > cfg.max_upscaled_dimension as f32 {
            scale = (cfg.max_upscaled_dimension as f32 / longest).max(1.0);
        }
        scale
    }

    /// Median-smoothed adaptive threshold. Output is 0/255 with a light background.
    fn binarize(&self, gray: &GrayImage) -> GrayImage {
        let cfg = &self.config;
        let smoothed = median_filter(gray, 1, 1);

        let block = if gray.width().max(gray.height()) >= cfg.large_page_dimension {
            cfg.large_block_size
        } else {
            cfg.small_block_size
        } | 1;
        let local_mean = gaussian_blur_sized(&smoothed, block);

        let mut binary = GrayImage::new(gray.width(), gray.height());
        for (i, (dst, src)) in binary.pixels_mut().zip(smoothed.pixels()).enumerate() {
            let delta = src.0[0] as f32 - local_mean[i].round();
            *dst = Luma([if delta > -cfg.threshold_offset { 255 } else { 0 }]);
        }

        if mean_intensity(&binary) < 127.0 {
            imageops::invert(&mut binary);
        }
        binary
    }
}

// ═══════════════════════════════════════════════════════════
// Pipeline
// ═══════════════════════════════════════════════════════════

/// Normalize then segment. One instance is shared by all page workers.
#[derive(Debug, Clone, Default)]
pub struct PreprocessingPipeline {
    normalizer: ImageNormalizer,
    segmenter: PageSegmenter,
}

impl PreprocessingPipeline {
    pub fn new(normalizer: ImageNormalizer, segmenter: PageSegmenter) -> Self {
        Self {
            normalizer,
            segmenter,
        }
    }
}

impl PagePreprocessor for PreprocessingPipeline {
    fn preprocess(&self, page: Page) -> Result<SegmentedPage, NormalizeError> {
        let normalized = self.normalizer.normalize(&page)?;
        let blocks = self.segmenter.segment(&normalized);
        Ok(SegmentedPage {
            page: normalized,
            blocks,
        })
    }
}

// ═══════════════════════════════════════════════════════════
// Mock implementations (for testing)
// ═══════════════════════════════════════════════════════════

/// Skips image work: the page passes through with one full-page paragraph block.
pub struct MockPagePreprocessor {
    fail: bool,
}

impl MockPagePreprocessor {
    pub fn new() -> Self {
        Self { fail: false }
    }

    pub fn failing() -> Self {
        Self { fail: true }
    }
}

impl Default for MockPagePreprocessor {
    fn default() -> Self {
        Self::new()
    }
}

impl PagePreprocessor for MockPagePreprocessor {
    fn preprocess(&self, page: Page) -> Result<SegmentedPage, NormalizeError> {
        if self.fail {
            return Err(NormalizeError::ImageProcessing(
                "Mock preprocessing failure".into(),
            ));
        }
        let (width, height) = page.dimensions();
        ensure_non_empty(width, height)?;

        let block = ContentBlock {
            index: 0,
            bbox: BoundingBox {
                x: 0,
                y: 0,
                width,
                height,
            },
            block_type: BlockType::Paragraph,
            image: page.image.clone(),
        };
        Ok(SegmentedPage {
            page: NormalizedPage {
                index: page.index,
                image: page.image,
                skew_angle: 0.0,
            },
            blocks: vec![block],
        })
    }
}
