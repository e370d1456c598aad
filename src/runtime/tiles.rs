//! Whole-page detection with a fixed-size network.
//!
//! A page at least as large as the network input is covered by a grid of
//! input-sized windows. Windows are spread evenly, so neighbours overlap
//! whenever the page is not an exact multiple of the window; overlapping
//! scores are merged with `max`.

use indicatif::ProgressBar;
use tracing::{debug, info};

use super::OnnxRunner;
use crate::core::{DetectorError, DetectorResult};
use crate::models::Resolution;

/// Score above which a pixel counts as text.
pub const DEFAULT_THRESHOLD: f32 = 0.0005;

/// Top-left corner of one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub top: usize,
    pub left: usize,
}

/// Placement of network-sized windows over a page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileGrid {
    page: Resolution,
    tile: Resolution,
    rows: usize,
    cols: usize,
    row_step: f64,
    col_step: f64,
}

impl TileGrid {
    pub fn new(page: Resolution, tile: Resolution) -> DetectorResult<Self> {
        if tile.height == 0 || tile.width == 0 {
            return Err(DetectorError::config(format!("empty tile {tile}")));
        }
        if page.height < tile.height || page.width < tile.width {
            return Err(DetectorError::invalid_input(format!(
                "page {page} is smaller than the {tile} network input"
            )));
        }
        let rows = page.height.div_ceil(tile.height);
        let cols = page.width.div_ceil(tile.width);
        let step = |extra: usize, count: usize| {
            if count > 1 {
                extra as f64 / (count - 1) as f64
            } else {
                0.0
            }
        };
        Ok(Self {
            page,
            tile,
            rows,
            cols,
            row_step: step(page.height - tile.height, rows),
            col_step: step(page.width - tile.width, cols),
        })
    }

    pub fn page(&self) -> Resolution {
        self.page
    }

    pub fn tile(&self) -> Resolution {
        self.tile
    }

    /// Number of windows.
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Windows in row-major order.
    pub fn tiles(&self) -> impl Iterator<Item = Tile> + '_ {
        (0..self.rows).flat_map(move |r| {
            (0..self.cols).map(move |c| Tile {
                top: (r as f64 * self.row_step) as usize,
                left: (c as f64 * self.col_step) as usize,
            })
        })
    }
}

/// Per-pixel text scores of a page, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct PageScores {
    pub resolution: Resolution,
    pub scores: Vec<f32>,
}

impl PageScores {
    /// `true` where the score exceeds `threshold`.
    pub fn mask(&self, threshold: f32) -> Vec<bool> {
        self.scores.iter().map(|&s| s > threshold).collect()
    }

    /// Share of pixels above `threshold`.
    pub fn text_fraction(&self, threshold: f32) -> f64 {
        if self.scores.is_empty() {
            return 0.0;
        }
        let text = self.scores.iter().filter(|&&s| s > threshold).count();
        text as f64 / self.scores.len() as f64
    }
}

impl OnnxRunner {
    /// Scores a grayscale page (row-major, `page.height * page.width` values)
    /// window by window. The grayscale window is repeated over every input
    /// channel. `progress` advances once per window.
    pub fn detect_page(
        &self,
        pixels: &[f32],
        page: Resolution,
        progress: &ProgressBar,
    ) -> DetectorResult<PageScores> {
        let &[1, channels, tile_h, tile_w] = self.input_shape() else {
            return Err(DetectorError::invalid_input(format!(
                "tiled detection needs a [1, C, H, W] input, the graph takes {:?}",
                self.input_shape()
            )));
        };
        if pixels.len() != page.height * page.width {
            return Err(DetectorError::shape_mismatch(
                "page pixels",
                &[page.height, page.width],
                &[pixels.len()],
            ));
        }
        let grid = TileGrid::new(page, Resolution::new(tile_h, tile_w))?;
        info!(page = %page, tiles = grid.len(), "detecting text");

        let mut scores = vec![f32::NEG_INFINITY; pixels.len()];
        let mut window = Vec::with_capacity(channels * tile_h * tile_w);
        progress.set_length(grid.len() as u64);
        for tile in grid.tiles() {
            window.clear();
            for _ in 0..channels {
                for y in 0..tile_h {
                    let start = (tile.top + y) * page.width + tile.left;
                    window.extend_from_slice(&pixels[start..start + tile_w]);
                }
            }
            let (shape, output) = self.run(&window)?;
            if shape != [1, 1, tile_h, tile_w] {
                return Err(DetectorError::shape_mismatch(
                    "tile output",
                    &[1, 1, tile_h, tile_w],
                    &shape,
                ));
            }
            for (y, row) in output.chunks_exact(tile_w).enumerate() {
                let start = (tile.top + y) * page.width + tile.left;
                for (dst, &src) in scores[start..start + tile_w].iter_mut().zip(row) {
                    *dst = dst.max(src);
                }
            }
            debug!(top = tile.top, left = tile.left, "tile done");
            progress.inc(1);
        }
        progress.finish();
        Ok(PageScores {
            resolution: page,
            scores,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx::proto::{attr_int, attr_ints};
    use crate::onnx::{GraphBuilder, GraphSpec, INPUT_NAME};

    fn corners(grid: &TileGrid) -> Vec<(usize, usize)> {
        grid.tiles().map(|t| (t.top, t.left)).collect()
    }

    const TILE: Resolution = Resolution::new(6, 4);

    #[test]
    fn test_single_tile() -> DetectorResult<()> {
        let grid = TileGrid::new(TILE, TILE)?;
        assert_eq!(grid.len(), 1);
        assert_eq!(corners(&grid), vec![(0, 0)]);
        Ok(())
    }

    #[test]
    fn test_one_extra_row_nearly_overlaps() -> DetectorResult<()> {
        let grid = TileGrid::new(Resolution::new(7, 5), TILE)?;
        assert_eq!(corners(&grid), vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
        Ok(())
    }

    #[test]
    fn test_almost_double_page() -> DetectorResult<()> {
        let grid = TileGrid::new(Resolution::new(11, 8), TILE)?;
        assert_eq!(corners(&grid), vec![(0, 0), (0, 4), (5, 0), (5, 4)]);
        Ok(())
    }

    #[test]
    fn test_exact_multiple_does_not_overlap() -> DetectorResult<()> {
        let grid = TileGrid::new(Resolution::new(18, 8), TILE)?;
        assert_eq!(grid.len(), 6);
        assert_eq!(
            corners(&grid),
            vec![(0, 0), (0, 4), (6, 0), (6, 4), (12, 0), (12, 4)]
        );
        Ok(())
    }

    #[test]
    fn test_page_smaller_than_tile_is_rejected() {
        assert!(TileGrid::new(Resolution::new(5, 4), TILE).is_err());
    }

    #[test]
    fn test_mask_and_fraction() {
        let scores = PageScores {
            resolution: Resolution::new(1, 4),
            scores: vec![-1.0, 0.0004, 0.0006, 3.0],
        };
        assert_eq!(scores.mask(DEFAULT_THRESHOLD), vec![false, false, true, true]);
        assert_eq!(scores.text_fraction(DEFAULT_THRESHOLD), 0.5);
    }

    /// Graph returning the channel mean of its three-channel input.
    fn channel_mean_runner(tile: Resolution) -> DetectorResult<OnnxRunner> {
        let mut graph = GraphBuilder::new();
        let out = graph.node(
            "",
            "ReduceMean",
            &[INPUT_NAME],
            vec![attr_ints("axes", &[1]), attr_int("keepdims", 1)],
        );
        let model = graph.build(
            &out,
            &GraphSpec {
                graph_name: "mean".to_string(),
                input_dims: vec![1, 3, tile.height, tile.width],
                output_dims: vec![1, 1, tile.height, tile.width],
                opset: 12,
            },
        )?;
        OnnxRunner::from_model(&model, None)
    }

    #[test]
    fn test_detect_page_stitches_every_pixel() -> DetectorResult<()> {
        let runner = channel_mean_runner(TILE)?;
        let page = Resolution::new(11, 9);
        let pixels: Vec<f32> = (0..page.height * page.width).map(|i| i as f32 / 100.0).collect();
        let scores = runner.detect_page(&pixels, page, &ProgressBar::hidden())?;
        assert_eq!(scores.resolution, page);
        for (got, want) in scores.scores.iter().zip(&pixels) {
            assert!((got - want).abs() < 1e-5, "{got} != {want}");
        }
        Ok(())
    }

    #[test]
    fn test_detect_page_rejects_wrong_pixel_count() -> DetectorResult<()> {
        let runner = channel_mean_runner(TILE)?;
        let result = runner.detect_page(&[0.0; 10], Resolution::new(6, 4), &ProgressBar::hidden());
        assert!(matches!(result, Err(DetectorError::ShapeMismatch { .. })));
        Ok(())
    }
}
