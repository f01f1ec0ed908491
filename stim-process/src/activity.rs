//! Local-contrast activity scoring
//!
//! Each pixel is compared with the mean and spread of the tile it falls in.
//! Pixels whose z-score clears the threshold are illuminated, and the score
//! map (z * 32, saturated to 8 bits) replaces the frame as processed pixels.

use crate::processor::Processor;
use crate::types::{BitMask, PatternPayload, Processed, ProcessedImage};
use rayon::prelude::*;
use stim_frame::Frame;

/// Spread floor so flat tiles do not amplify noise (one 8-bit step)
const MIN_STD: f32 = 256.0;
/// Score-map gain: z of 8 saturates the 8-bit image
const SCORE_GAIN: f32 = 32.0;

#[derive(Debug, Clone, Copy, Default)]
struct TileStats {
    mean: f32,
    std: f32,
}

pub struct ActivityProcessor {
    tile: u32,
    z_threshold: f32,
    tiles: Vec<TileStats>,
}

impl ActivityProcessor {
    pub fn new(tile: u32, z_threshold: f32) -> Self {
        Self {
            tile,
            z_threshold,
            tiles: Vec::new(),
        }
    }

    fn compute_tiles(&mut self, frame: &Frame) -> usize {
        let tile = self.tile;
        let (width, height) = (frame.width(), frame.height());
        let tiles_x = width.div_ceil(tile) as usize;
        let tiles_y = height.div_ceil(tile) as usize;

        self.tiles.clear();
        self.tiles.resize(tiles_x * tiles_y, TileStats::default());
        self.tiles
            .par_chunks_mut(tiles_x)
            .enumerate()
            .for_each(|(ty, row)| {
                let y0 = ty as u32 * tile;
                let y1 = (y0 + tile).min(height);
                for (tx, stats) in row.iter_mut().enumerate() {
                    let x0 = tx as u32 * tile;
                    let x1 = (x0 + tile).min(width);
                    let mut sum = 0f64;
                    let mut sum_sq = 0f64;
                    for y in y0..y1 {
                        for x in x0..x1 {
                            let v = frame.intensity(x, y) as f64;
                            sum += v;
                            sum_sq += v * v;
                        }
                    }
                    let n = ((x1 - x0) * (y1 - y0)) as f64;
                    let mean = sum / n;
                    let variance = (sum_sq / n - mean * mean).max(0.0);
                    *stats = TileStats {
                        mean: mean as f32,
                        std: variance.sqrt() as f32,
                    };
                }
            });
        tiles_x
    }
}

#[inline]
fn z_score(frame: &Frame, tiles: &[TileStats], tiles_x: usize, tile: u32, x: u32, y: u32) -> f32 {
    let stats = tiles[(y / tile) as usize * tiles_x + (x / tile) as usize];
    (frame.intensity(x, y) as f32 - stats.mean) / stats.std.max(MIN_STD)
}

impl Processor for ActivityProcessor {
    fn name(&self) -> &'static str {
        "activity"
    }

    fn process(&mut self, frame: &Frame) -> Processed {
        let tiles_x = self.compute_tiles(frame);
        let (width, height) = (frame.width(), frame.height());
        let (tile, threshold) = (self.tile, self.z_threshold);
        let tiles = &self.tiles;

        let mut mask = BitMask::new(width, height);
        mask.fill_rows(|y, row| {
            for x in 0..width {
                if z_score(frame, tiles, tiles_x, tile, x, y) >= threshold {
                    BitMask::set_row_bit(row, x);
                }
            }
        });

        let mut scores = vec![0u8; width as usize * height as usize];
        scores
            .par_chunks_mut(width as usize)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, score) in row.iter_mut().enumerate() {
                    let z = z_score(frame, tiles, tiles_x, tile, x as u32, y as u32);
                    *score = (z.max(0.0) * SCORE_GAIN).min(255.0) as u8;
                }
            });

        Processed {
            payload: PatternPayload::Mask(mask),
            image: Some(ProcessedImage {
                width,
                height,
                data: scores,
            }),
        }
    }
}
