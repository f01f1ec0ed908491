//! Connected bright regions as rectangular ROIs

use crate::processor::Processor;
use crate::threshold::threshold_mask;
use crate::types::{BitMask, PatternPayload, Processed, Roi};
use stim_frame::Frame;

#[derive(Clone, Copy)]
struct RegionStats {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    area: u32,
    peak: u16,
}

impl RegionStats {
    const EMPTY: RegionStats = RegionStats {
        min_x: u32::MAX,
        min_y: u32::MAX,
        max_x: 0,
        max_y: 0,
        area: 0,
        peak: 0,
    };

    fn add(&mut self, x: u32, y: u32, intensity: u16) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
        self.area += 1;
        self.peak = self.peak.max(intensity);
    }

    fn to_roi(self) -> Roi {
        Roi {
            x: self.min_x,
            y: self.min_y,
            width: self.max_x - self.min_x + 1,
            height: self.max_y - self.min_y + 1,
            area: self.area,
            peak: self.peak,
        }
    }
}

/// Labels 4-connected components of the threshold mask and reports the
/// largest ones, sorted by area (ties broken by position).
pub struct RegionProcessor {
    level: u16,
    min_area: u32,
    max_regions: usize,
    // Scratch, reused across frames
    labels: Vec<u32>,
    parents: Vec<u32>,
    stats: Vec<RegionStats>,
}

impl RegionProcessor {
    pub fn new(level: u16, min_area: u32, max_regions: usize) -> Self {
        Self {
            level,
            min_area,
            max_regions,
            labels: Vec::new(),
            parents: Vec::new(),
            stats: Vec::new(),
        }
    }

    fn find(parents: &mut [u32], mut label: u32) -> u32 {
        while parents[label as usize] != label {
            let grand = parents[parents[label as usize] as usize];
            parents[label as usize] = grand;
            label = grand;
        }
        label
    }

    fn union(parents: &mut [u32], a: u32, b: u32) -> u32 {
        let ra = Self::find(parents, a);
        let rb = Self::find(parents, b);
        let (keep, merge) = if ra < rb { (ra, rb) } else { (rb, ra) };
        parents[merge as usize] = keep;
        keep
    }

    /// Find regions in an already thresholded mask
    pub fn label(&mut self, frame: &Frame, mask: &BitMask) -> Vec<Roi> {
        let width = mask.width();
        let height = mask.height();

        self.labels.clear();
        self.labels.resize(width as usize * height as usize, 0);
        self.parents.clear();
        self.parents.push(0); // label 0 = background

        // First pass: provisional labels and equivalences
        for y in 0..height {
            let row = mask.row(y);
            for x in 0..width {
                if !BitMask::row_bit(row, x) {
                    continue;
                }
                let index = (y * width + x) as usize;
                let left = if x > 0 { self.labels[index - 1] } else { 0 };
                let up = if y > 0 {
                    self.labels[index - width as usize]
                } else {
                    0
                };

                let label = match (left, up) {
                    (0, 0) => {
                        let fresh = self.parents.len() as u32;
                        self.parents.push(fresh);
                        fresh
                    }
                    (l, 0) => l,
                    (0, u) => u,
                    (l, u) if l == u => l,
                    (l, u) => Self::union(&mut self.parents, l, u),
                };
                self.labels[index] = label;
            }
        }

        // Second pass: accumulate statistics per root label
        self.stats.clear();
        self.stats.resize(self.parents.len(), RegionStats::EMPTY);
        for y in 0..height {
            for x in 0..width {
                let index = (y * width + x) as usize;
                let label = self.labels[index];
                if label == 0 {
                    continue;
                }
                let root = Self::find(&mut self.parents, label);
                self.stats[root as usize].add(x, y, frame.intensity(x, y));
            }
        }

        let mut regions: Vec<Roi> = self
            .stats
            .iter()
            .filter(|s| s.area > 0 && s.area >= self.min_area)
            .map(|s| s.to_roi())
            .collect();
        regions.sort_by(|a, b| {
            b.area
                .cmp(&a.area)
                .then(a.y.cmp(&b.y))
                .then(a.x.cmp(&b.x))
        });
        regions.truncate(self.max_regions);
        regions
    }
}

impl Processor for RegionProcessor {
    fn name(&self) -> &'static str {
        "regions"
    }

    fn process(&mut self, frame: &Frame) -> Processed {
        let mask = threshold_mask(frame, self.level);
        let regions = self.label(frame, &mask);
        if regions.is_empty() {
            return Processed::pattern_only(PatternPayload::Blank);
        }
        Processed::pattern_only(PatternPayload::Regions(regions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::mono8_frame;

    fn two_blobs(x: u32, y: u32) -> u8 {
        // 3x3 blob at (1,1) and a 2x4 blob at (10,5)
        let in_a = (1..4).contains(&x) && (1..4).contains(&y);
        let in_b = (10..12).contains(&x) && (5..9).contains(&y);
        if in_a || in_b {
            250
        } else {
            0
        }
    }

    #[test]
    fn test_regions_sorted_by_area() {
        let frame = mono8_frame(16, 12, two_blobs);
        let mut processor = RegionProcessor::new(128 << 8, 1, 8);

        let PatternPayload::Regions(regions) = processor.process(&frame).payload else {
            panic!("expected regions");
        };
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].area, 9);
        assert_eq!((regions[0].x, regions[0].y, regions[0].width, regions[0].height), (1, 1, 3, 3));
        assert_eq!(regions[1].area, 8);
        assert_eq!((regions[1].x, regions[1].y, regions[1].width, regions[1].height), (10, 5, 2, 4));
        assert_eq!(regions[0].peak, 250 << 8);
    }

    #[test]
    fn test_u_shape_merges_into_one_region() {
        // Two arms joined at the bottom: labels meet late and must be unified
        let frame = mono8_frame(7, 5, |x, y| {
            let arm = (x == 1 || x == 5) && y < 4;
            let base = y == 4 && (1..6).contains(&x);
            if arm || base {
                255
            } else {
                0
            }
        });
        let mut processor = RegionProcessor::new(1 << 8, 1, 4);
        let PatternPayload::Regions(regions) = processor.process(&frame).payload else {
            panic!("expected regions");
        };
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].area, 13);
        assert_eq!(regions[0].width, 5);
    }

    #[test]
    fn test_min_area_and_limit() {
        let frame = mono8_frame(16, 12, two_blobs);
        let mut processor = RegionProcessor::new(128 << 8, 9, 8);
        let PatternPayload::Regions(regions) = processor.process(&frame).payload else {
            panic!("expected regions");
        };
        assert_eq!(regions.len(), 1);

        let mut limited = RegionProcessor::new(128 << 8, 1, 1);
        let PatternPayload::Regions(regions) = limited.process(&frame).payload else {
            panic!("expected regions");
        };
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].area, 9);
    }

    #[test]
    fn test_dark_frame_is_blank() {
        let frame = mono8_frame(8, 8, |_, _| 0);
        let mut processor = RegionProcessor::new(1 << 8, 1, 4);
        assert_eq!(processor.process(&frame).payload, PatternPayload::Blank);
    }
}
