//! Page segmentation into paragraph and title blocks.
//!
//! Ink is smeared horizontally (joining words into lines) and then vertically
//! (joining lines into paragraphs); each outer contour of the smeared mask is
//! one candidate block. Block heights are judged relative to the page's
//! median block height, so "title" adapts to the document's own font scale.

use image::imageops;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::imaging::{dilate_rect, external_boxes, median, otsu_ink_mask, rgb_to_gray};
use super::types::{BlockType, ContentBlock, NormalizedPage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Width of the 1-row kernel that joins words into lines.
    pub word_join_width: u32,
    /// Height of the 1-column kernel that joins lines into paragraphs.
    pub line_join_height: u32,
    /// Contours at or below this height are ignored when computing the median.
    pub noise_floor_height: u32,
    /// Reference height when no contour clears the noise floor.
    pub default_median_height: f32,
    pub min_block_width: u32,
    pub min_block_height: u32,
    /// A block taller than `title_height_factor` x median is a title.
    pub title_height_factor: f32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            word_join_width: 50,
            line_join_height: 30,
            noise_floor_height: 20,
            default_median_height: 30.0,
            min_block_width: 50,
            min_block_height: 30,
            title_height_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PageSegmenter {
    config: SegmenterConfig,
}

impl PageSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self { config }
    }

    /// Split a normalized page into blocks, top to bottom.
    ///
    /// A page without ink (or with only speckle) yields an empty list.
    pub fn segment(&self, page: &NormalizedPage) -> Vec<ContentBlock> {
        let cfg = &self.config;
        let mask = otsu_ink_mask(&rgb_to_gray(&page.image));
        let smeared = dilate_rect(
            &dilate_rect(&mask, cfg.word_join_width, 1),
            1,
            cfg.line_join_height,
        );

        let mut boxes = external_boxes(&smeared);
        let heights: Vec<f32> = boxes
            .iter()
            .filter(|b| b.height > cfg.noise_floor_height)
            .map(|b| b.height as f32)
            .collect();
        let median_height = median(&heights).unwrap_or(cfg.default_median_height);

        // Stable: contours sharing a row keep their scan order.
        boxes.sort_by_key(|b| b.y);

        let blocks: Vec<ContentBlock> = boxes
            .into_iter()
            .enumerate()
            .filter(|(_, b)| b.width >= cfg.min_block_width && b.height >= cfg.min_block_height)
            .map(|(index, bbox)| {
                let block_type = if bbox.height as f32 > cfg.title_height_factor * median_height {
                    BlockType::Title
                } else {
                    BlockType::Paragraph
                };
                let image =
                    imageops::crop_imm(&page.image, bbox.x, bbox.y, bbox.width, bbox.height)
                        .to_image();
                ContentBlock {
                    index,
                    bbox,
                    block_type,
                    image,
                }
            })
            .collect();

        debug!(
            page = page.index,
            blocks = blocks.len(),
            median_height,
            "Page segmented"
        );
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn page_with(width: u32, height: u32, rects: &[(u32, u32, u32, u32)]) -> NormalizedPage {
        let image = RgbImage::from_fn(width, height, |x, y| {
            let ink = rects
                .iter()
                .any(|&(rx, ry, rw, rh)| x >= rx && x < rx + rw && y >= ry && y < ry + rh);
            if ink {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        NormalizedPage {
            index: 1,
            image,
            skew_angle: 0.0,
        }
    }

    /// Three 8px text lines, 15px apart, starting at `top`.
    fn paragraph(top: u32) -> Vec<(u32, u32, u32, u32)> {
        (0..3).map(|i| (50, top + i * 15, 400, 8)).collect()
    }

    #[test]
    fn blank_page_yields_no_blocks() {
        let page = page_with(300, 200, &[]);
        assert!(PageSegmenter::default().segment(&page).is_empty());
    }

    #[test]
    fn speckle_only_yields_no_blocks() {
        let page = page_with(300, 200, &[(100, 100, 2, 2), (200, 40, 3, 3)]);
        assert!(PageSegmenter::default().segment(&page).is_empty());
    }

    #[test]
    fn lines_merge_into_paragraphs_and_titles_stand_out() {
        let mut rects = vec![(50, 20, 300, 120)];
        rects.extend(paragraph(200));
        rects.extend(paragraph(320));
        rects.push((480, 500, 3, 3));
        let page = page_with(500, 600, &rects);

        let blocks = PageSegmenter::default().segment(&page);
        assert_eq!(blocks.len(), 3, "got {:?}", blocks.iter().map(|b| b.bbox).collect::<Vec<_>>());

        assert_eq!(blocks[0].block_type, BlockType::Title);
        assert_eq!(blocks[1].block_type, BlockType::Paragraph);
        assert_eq!(blocks[2].block_type, BlockType::Paragraph);
        assert!(blocks.windows(2).all(|w| w[0].bbox.y <= w[1].bbox.y));
        assert_eq!(
            blocks.iter().map(|b| b.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn skipped_contours_still_consume_indices() {
        let mut rects = vec![(10, 2, 2, 2)];
        rects.extend(paragraph(100));
        let page = page_with(500, 250, &rects);

        let blocks = PageSegmenter::default().segment(&page);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].index, 1, "speck at the top is index 0");
    }

    #[test]
    fn block_crop_matches_bbox() {
        let page = page_with(500, 250, &paragraph(100));
        let blocks = PageSegmenter::default().segment(&page);
        assert_eq!(blocks.len(), 1);
        let b = &blocks[0];
        assert_eq!(b.image.dimensions(), (b.bbox.width, b.bbox.height));
        assert!(b.bbox.height > 38, "vertical join should span all three lines");
    }
}
