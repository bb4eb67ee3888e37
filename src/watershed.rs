//! Watershed kernel: threshold-driven union-find agglomeration of voxels
//! over a 6-connected affinity graph.
//!
//! Affinity channel `a` of voxel `v` is the strength of the edge between `v`
//! and its +1 neighbor along axis `a` (x, y, z). The result is deterministic:
//! edges are visited in a total order and every component is named after its
//! lowest member voxel.

use crate::error::{PipelineError, Result};
use ndarray::{Array3, ArrayView4};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Thresholds controlling agglomeration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WatershedParams {
    /// Edges at or above this affinity always join (seeds)
    pub high_threshold: f32,
    /// Edges below this affinity never join
    pub low_threshold: f32,
    /// Growth edges at or above this affinity join unconditionally
    pub merge_threshold: f32,
    /// Components below this many voxels may join an established one at any
    /// growth affinity
    pub merge_size: usize,
    /// Components below this many voxels are absorbed by their strongest
    /// neighbor, or dropped to background when they have none
    pub dust_size: usize,
}

impl WatershedParams {
    pub fn validate(&self) -> Result<()> {
        let in_unit = |v: f32| (0.0..=1.0).contains(&v);
        if !in_unit(self.high_threshold) || !in_unit(self.low_threshold) || !in_unit(self.merge_threshold) {
            return Err(PipelineError::InvalidTask(
                "Watershed thresholds must lie in [0, 1]".to_string(),
            ));
        }
        if self.low_threshold > self.high_threshold {
            return Err(PipelineError::InvalidTask(format!(
                "low_threshold {} exceeds high_threshold {}",
                self.low_threshold, self.high_threshold
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Component {
    parent: usize,
    size: usize,
    min_member: usize,
}

/// Disjoint sets over voxel indices, stored as an arena of records
#[derive(Debug)]
struct UnionFind {
    nodes: Vec<Component>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self {
            nodes: (0..len)
                .map(|i| Component {
                    parent: i,
                    size: 1,
                    min_member: i,
                })
                .collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.nodes[i].parent != i {
            // path halving
            let grandparent = self.nodes[self.nodes[i].parent].parent;
            self.nodes[i].parent = grandparent;
            i = grandparent;
        }
        i
    }

    fn size(&self, root: usize) -> usize {
        self.nodes[root].size
    }

    /// Join two roots; the larger (then lower-indexed) root survives
    fn union_roots(&mut self, a: usize, b: usize) -> usize {
        if a == b {
            return a;
        }
        let (keep, absorb) = match self.nodes[a].size.cmp(&self.nodes[b].size) {
            Ordering::Greater => (a, b),
            Ordering::Less => (b, a),
            Ordering::Equal => (a.min(b), a.max(b)),
        };
        self.nodes[absorb].parent = keep;
        self.nodes[keep].size += self.nodes[absorb].size;
        self.nodes[keep].min_member = self.nodes[keep].min_member.min(self.nodes[absorb].min_member);
        keep
    }
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    affinity: f32,
    voxel: usize,
    axis: usize,
}

/// Descending affinity, then ascending voxel and axis
fn edge_order(a: &Edge, b: &Edge) -> Ordering {
    b.affinity
        .total_cmp(&a.affinity)
        .then(a.voxel.cmp(&b.voxel))
        .then(a.axis.cmp(&b.axis))
}

/// Segment an `[x, y, z, 3]` affinity block into labels.
///
/// Voxels with no incident edge at or above `low_threshold`, and components
/// left smaller than `dust_size`, are background (0). Every other component
/// is labeled `1 + ` its lowest member's linear index (x fastest).
pub fn watershed(affinities: ArrayView4<'_, f32>, params: &WatershedParams) -> Result<Array3<u64>> {
    params.validate()?;
    let shape = affinities.shape();
    if shape[3] != 3 {
        return Err(PipelineError::InvalidDimensions(format!(
            "Affinity graph needs 3 channels, got {}",
            shape[3]
        )));
    }
    let (sx, sy, sz) = (shape[0], shape[1], shape[2]);
    let len = sx * sy * sz;
    let strides = [1, sx, sx * sy];

    let mut uf = UnionFind::new(len);
    let mut active = vec![false; len];
    let mut candidates = Vec::new();

    for z in 0..sz {
        for y in 0..sy {
            for x in 0..sx {
                let voxel = x + sx * (y + sy * z);
                let coords = [x, y, z];
                let dims = [sx, sy, sz];
                for axis in 0..3 {
                    if coords[axis] + 1 >= dims[axis] {
                        continue;
                    }
                    let affinity = affinities[[x, y, z, axis]];
                    if affinity.is_nan() || affinity < params.low_threshold {
                        continue;
                    }
                    let neighbor = voxel + strides[axis];
                    active[voxel] = true;
                    active[neighbor] = true;
                    if affinity >= params.high_threshold {
                        let (a, b) = (uf.find(voxel), uf.find(neighbor));
                        uf.union_roots(a, b);
                    }
                    candidates.push(Edge { affinity, voxel, axis });
                }
            }
        }
    }

    candidates.sort_unstable_by(edge_order);

    // Size-weighted growth
    for edge in candidates.iter().filter(|e| e.affinity < params.high_threshold) {
        let a = uf.find(edge.voxel);
        let b = uf.find(edge.voxel + strides[edge.axis]);
        if a == b {
            continue;
        }
        let small_a = uf.size(a) < params.merge_size;
        let small_b = uf.size(b) < params.merge_size;
        if edge.affinity >= params.merge_threshold || small_a != small_b {
            uf.union_roots(a, b);
        }
    }

    // Dust absorption along each small component's strongest edge
    for edge in &candidates {
        let a = uf.find(edge.voxel);
        let b = uf.find(edge.voxel + strides[edge.axis]);
        if a != b && (uf.size(a) < params.dust_size || uf.size(b) < params.dust_size) {
            uf.union_roots(a, b);
        }
    }

    let mut labels = Array3::<u64>::zeros((sx, sy, sz));
    for z in 0..sz {
        for y in 0..sy {
            for x in 0..sx {
                let voxel = x + sx * (y + sy * z);
                if !active[voxel] {
                    continue;
                }
                let root = uf.find(voxel);
                if uf.size(root) < params.dust_size {
                    continue;
                }
                labels[[x, y, z]] = uf.nodes[root].min_member as u64 + 1;
            }
        }
    }

    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{s, Array4};

    fn params() -> WatershedParams {
        WatershedParams {
            high_threshold: 0.9,
            low_threshold: 0.1,
            merge_threshold: 0.5,
            merge_size: 4,
            dust_size: 1,
        }
    }

    /// Two 4x4x4 cubes side by side along x joined by a weak wall
    fn two_cubes(wall: f32) -> Array4<f32> {
        let mut aff = Array4::<f32>::from_elem((8, 4, 4, 3), 0.95);
        aff.slice_mut(s![3, .., .., 0]).fill(wall);
        aff
    }

    #[test]
    fn test_seeds_join_and_weak_wall_separates() {
        let labels = watershed(two_cubes(0.05).view(), &params()).unwrap();
        let left = labels[[0, 0, 0]];
        let right = labels[[4, 0, 0]];
        assert_eq!(left, 1);
        assert_eq!(right, 5);
        assert!(labels.slice(s![..4, .., ..]).iter().all(|&l| l == left));
        assert!(labels.slice(s![4.., .., ..]).iter().all(|&l| l == right));
    }

    #[test]
    fn test_strong_growth_edge_merges() {
        let labels = watershed(two_cubes(0.6).view(), &params()).unwrap();
        assert!(labels.iter().all(|&l| l == 1));
    }

    #[test]
    fn test_large_components_resist_weak_merge() {
        // 0.3 is above low but below merge_threshold; both sides hold 64 voxels
        let labels = watershed(two_cubes(0.3).view(), &params()).unwrap();
        assert_ne!(labels[[0, 0, 0]], labels[[7, 0, 0]]);
    }

    #[test]
    fn test_small_region_joins_established_one() {
        // A single voxel hanging off a large cube by a weak edge
        let mut aff = Array4::<f32>::from_elem((5, 4, 4, 3), 0.0);
        aff.slice_mut(s![..4, .., .., ..]).fill(0.95);
        aff.slice_mut(s![3, .., .., 0]).fill(0.0);
        aff[[3, 0, 0, 0]] = 0.2;
        let labels = watershed(aff.view(), &params()).unwrap();
        assert_eq!(labels[[4, 0, 0]], labels[[0, 0, 0]]);
        // Voxels on x = 4 other than the attached one have no usable edges
        assert_eq!(labels[[4, 1, 1]], 0);
    }

    #[test]
    fn test_dust_absorbed_by_strongest_neighbor() {
        let mut p = params();
        p.dust_size = 10;
        p.merge_size = 0;
        // Column x = 4 attaches to the block at 0.2 and to itself at 0.3
        let mut aff = Array4::<f32>::from_elem((5, 2, 1, 3), 0.0);
        aff[[4, 0, 0, 1]] = 0.3;
        aff.slice_mut(s![..4, .., .., 0]).fill(0.95);
        aff[[3, 0, 0, 0]] = 0.2;
        aff[[3, 1, 0, 0]] = 0.0;
        aff.slice_mut(s![..4, 0, .., 1]).fill(0.95);
        let labels = watershed(aff.view(), &p).unwrap();
        // (4,0,0) and (4,1,0) form dust that joins the cube through x
        assert_eq!(labels[[4, 0, 0]], labels[[0, 0, 0]]);
        assert_eq!(labels[[4, 1, 0]], labels[[0, 0, 0]]);
    }

    #[test]
    fn test_isolated_dust_becomes_background() {
        let mut p = params();
        p.dust_size = 3;
        let mut aff = Array4::<f32>::zeros((4, 1, 1, 3));
        aff[[0, 0, 0, 0]] = 0.95;
        let labels = watershed(aff.view(), &p).unwrap();
        assert!(labels.iter().all(|&l| l == 0));
    }

    #[test]
    fn test_deterministic() {
        let aff = Array4::from_shape_fn((12, 10, 6, 3), |(x, y, z, c)| {
            (((x * 73 + y * 151 + z * 37 + c * 11) % 97) as f32) / 96.0
        });
        let p = WatershedParams {
            high_threshold: 0.95,
            low_threshold: 0.05,
            merge_threshold: 0.6,
            merge_size: 20,
            dust_size: 5,
        };
        let a = watershed(aff.view(), &p).unwrap();
        let b = watershed(aff.view(), &p).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_bad_params() {
        let mut p = params();
        p.low_threshold = 0.95;
        assert!(watershed(two_cubes(0.1).view(), &p).is_err());

        let aff = Array4::<f32>::zeros((2, 2, 2, 1));
        assert!(watershed(aff.view(), &params()).is_err());
    }
}
