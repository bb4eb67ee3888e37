//! Chunk grid math - how one scale of a volume is tiled into chunks

use crate::types::Bbox;
use serde::{Deserialize, Serialize};

/// The chunk tiling of one scale: a grid of `chunk_size` cells anchored at
/// the scale's voxel offset and clipped to the scale's bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkGrid {
    /// Voxel extent of the scale
    pub bounds: Bbox,

    /// Size of a full chunk along each axis
    pub chunk_size: [usize; 3],
}

impl ChunkGrid {
    /// Create a grid for a scale with the given offset, size and chunk size
    pub fn new(voxel_offset: [i64; 3], size: [usize; 3], chunk_size: [usize; 3]) -> Self {
        Self {
            bounds: Bbox::from_shape(voxel_offset, size),
            chunk_size,
        }
    }

    /// Grid origin (the scale's voxel offset)
    pub fn origin(&self) -> [i64; 3] {
        self.bounds.min
    }

    /// Number of chunks along each axis
    pub fn chunk_count(&self) -> [usize; 3] {
        let size = self.bounds.size();
        let mut count = [0usize; 3];
        for i in 0..3 {
            count[i] = size[i].div_ceil(self.chunk_size[i]);
        }
        count
    }

    /// Total number of chunks in the scale
    pub fn total_chunks(&self) -> usize {
        self.chunk_count().iter().product()
    }

    /// Whether `coord` lies on a chunk boundary along `axis`
    fn on_grid(&self, axis: usize, coord: i64) -> bool {
        (coord - self.origin()[axis]).rem_euclid(self.chunk_size[axis] as i64) == 0
    }

    /// Round a box outward to whole grid cells. The result is not clipped,
    /// so the last cell along an axis may extend past the bounds.
    pub fn expand_to_chunks(&self, bbox: &Bbox) -> Bbox {
        let origin = self.origin();
        let mut out = *bbox;
        for i in 0..3 {
            let cs = self.chunk_size[i] as i64;
            out.min[i] = origin[i] + (bbox.min[i] - origin[i]).div_euclid(cs) * cs;
            let rel_max = bbox.max[i] - origin[i];
            out.max[i] = origin[i] + (rel_max + cs - 1).div_euclid(cs) * cs;
        }
        out
    }

    /// A box is writable when it starts on the grid and every end either
    /// lies on the grid or at the far edge of the volume.
    pub fn is_aligned(&self, bbox: &Bbox) -> bool {
        if bbox.is_empty() {
            return false;
        }
        let rounded_bounds = self.expand_to_chunks(&self.bounds);
        (0..3).all(|i| {
            bbox.min[i] >= self.bounds.min[i]
                && bbox.max[i] <= rounded_bounds.max[i]
                && self.on_grid(i, bbox.min[i])
                && (self.on_grid(i, bbox.max[i]) || bbox.max[i] == self.bounds.max[i])
        })
    }

    /// Chunk boxes covering `bbox`, clipped to the scale bounds (the last
    /// chunk along an axis is truncated, never padded). Ordered x fastest,
    /// then y, then z.
    pub fn chunks_covering(&self, bbox: &Bbox) -> Vec<Bbox> {
        let clipped = match bbox.intersection(&self.bounds) {
            Some(clipped) => clipped,
            None => return Vec::new(),
        };
        let grid = self.expand_to_chunks(&clipped);
        let cs = self.chunk_size.map(|c| c as i64);

        let mut chunks = Vec::new();
        let mut z = grid.min[2];
        while z < grid.max[2] {
            let mut y = grid.min[1];
            while y < grid.max[1] {
                let mut x = grid.min[0];
                while x < grid.max[0] {
                    let cell = Bbox::new([x, y, z], [x + cs[0], y + cs[1], z + cs[2]]);
                    if let Some(chunk) = cell.intersection(&self.bounds) {
                        chunks.push(chunk);
                    }
                    x += cs[0];
                }
                y += cs[1];
            }
            z += cs[2];
        }
        chunks
    }

    /// Every chunk of the scale
    pub fn all_chunks(&self) -> Vec<Bbox> {
        self.chunks_covering(&self.bounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_grid() -> ChunkGrid {
        ChunkGrid::new([0, 0, 0], [1000, 800, 500], [64, 64, 64])
    }

    #[test]
    fn test_chunk_count() {
        let grid = create_test_grid();
        assert_eq!(grid.chunk_count(), [16, 13, 8]); // ceil(1000/64), ceil(800/64), ceil(500/64)
        assert_eq!(grid.total_chunks(), 16 * 13 * 8);
        assert_eq!(grid.all_chunks().len(), 16 * 13 * 8);
    }

    #[test]
    fn test_last_chunk_is_truncated() {
        let grid = create_test_grid();
        let chunks = grid.chunks_covering(&Bbox::new([990, 790, 490], [1000, 800, 500]));
        assert_eq!(chunks, vec![Bbox::new([960, 768, 448], [1000, 800, 500])]);
    }

    #[test]
    fn test_chunks_covering_order() {
        let grid = ChunkGrid::new([0, 0, 0], [128, 128, 64], [64, 64, 64]);
        let chunks = grid.chunks_covering(&Bbox::new([10, 10, 0], [100, 100, 10]));
        assert_eq!(
            chunks,
            vec![
                Bbox::new([0, 0, 0], [64, 64, 64]),
                Bbox::new([64, 0, 0], [128, 64, 64]),
                Bbox::new([0, 64, 0], [64, 128, 64]),
                Bbox::new([64, 64, 0], [128, 128, 64]),
            ]
        );
    }

    #[test]
    fn test_grid_anchored_at_offset() {
        let grid = ChunkGrid::new([3, 7, 11], [512, 512, 128], [64, 64, 64]);
        let chunks = grid.chunks_covering(&Bbox::new([3, 7, 11], [4, 8, 12]));
        assert_eq!(chunks, vec![Bbox::new([3, 7, 11], [67, 71, 75])]);
    }

    #[test]
    fn test_alignment() {
        let grid = ChunkGrid::new([0, 0, 0], [100, 64, 64], [64, 64, 64]);
        assert!(grid.is_aligned(&Bbox::new([0, 0, 0], [64, 64, 64])));
        // Truncated at the far edge
        assert!(grid.is_aligned(&Bbox::new([64, 0, 0], [100, 64, 64])));
        // Rounded up to a full chunk past the edge
        assert!(grid.is_aligned(&Bbox::new([64, 0, 0], [128, 64, 64])));
        assert!(!grid.is_aligned(&Bbox::new([1, 0, 0], [64, 64, 64])));
        assert!(!grid.is_aligned(&Bbox::new([0, 0, 0], [32, 64, 64])));
    }

    #[test]
    fn test_expand_to_chunks() {
        let grid = ChunkGrid::new([3, 0, 0], [100, 64, 64], [32, 32, 32]);
        let expanded = grid.expand_to_chunks(&Bbox::new([10, 1, 33], [40, 2, 34]));
        assert_eq!(expanded, Bbox::new([3, 0, 32], [67, 32, 64]));
    }
}
