//! Downsampling kernels: averaging for intensities, mode for labels

use crate::error::{PipelineError, Result};
use crate::types::{Element, Label, LayerType};
use ndarray::{s, Array, Array4};
use serde::{Deserialize, Serialize};

/// Reduction used to build a coarser mip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownsampleMethod {
    /// Arithmetic mean of each block
    Average,
    /// Most frequent value of each block, smallest value on ties
    Mode,
}

impl DownsampleMethod {
    /// Segmentation labels must not be blended; everything else is averaged
    pub fn for_layer(layer_type: LayerType) -> Self {
        match layer_type {
            LayerType::Segmentation => DownsampleMethod::Mode,
            LayerType::Image | LayerType::Affinities => DownsampleMethod::Average,
        }
    }
}

fn check_factor(factor: [usize; 3]) -> Result<()> {
    if factor.contains(&0) {
        return Err(PipelineError::InvalidDimensions(format!(
            "Downsample factor {:?} has a zero component",
            factor
        )));
    }
    Ok(())
}

fn output_shape(shape: &[usize], factor: [usize; 3]) -> (usize, usize, usize, usize) {
    (
        shape[0].div_ceil(factor[0]),
        shape[1].div_ceil(factor[1]),
        shape[2].div_ceil(factor[2]),
        shape[3],
    )
}

/// Number of input voxels along one axis feeding output index `o`
fn block_len(size: usize, factor: usize, o: usize) -> usize {
    factor.min(size - o * factor)
}

/// Average each `factor` block of `data` (axes x, y, z; channels untouched).
///
/// Sums accumulate in `T::Sum` (`u128` for integers, `f64` for floats);
/// integer means truncate. Blocks cut off by the far edge average only the
/// voxels present.
pub fn downsample_with_averaging<T: Element>(data: &Array4<T>, factor: [usize; 3]) -> Result<Array4<T>> {
    check_factor(factor)?;
    let shape = data.shape();
    let out_shape = output_shape(shape, factor);

    let mut sums = Array4::<T::Sum>::default(out_shape);
    for ((x, y, z, c), value) in data.indexed_iter() {
        sums[[x / factor[0], y / factor[1], z / factor[2], c]] += (*value).widen();
    }

    let (sx, sy, sz) = (shape[0], shape[1], shape[2]);
    Ok(Array::from_shape_fn(out_shape, |(x, y, z, c)| {
        let count = block_len(sx, factor[0], x) * block_len(sy, factor[1], y) * block_len(sz, factor[2], z);
        T::mean(sums[[x, y, z, c]], count)
    }))
}

/// Take the most frequent label of each `factor` block, breaking ties
/// toward the numerically smallest label.
pub fn downsample_segmentation<T: Label>(data: &Array4<T>, factor: [usize; 3]) -> Result<Array4<T>> {
    check_factor(factor)?;
    let shape = data.shape();
    let out_shape = output_shape(shape, factor);
    let (sx, sy, sz) = (shape[0], shape[1], shape[2]);
    let mut block: Vec<T> = Vec::with_capacity(factor.iter().product());

    Ok(Array::from_shape_fn(out_shape, |(x, y, z, c)| {
        let x0 = x * factor[0];
        let y0 = y * factor[1];
        let z0 = z * factor[2];
        let view = data.slice(s![
            x0..(x0 + factor[0]).min(sx),
            y0..(y0 + factor[1]).min(sy),
            z0..(z0 + factor[2]).min(sz),
            c
        ]);

        block.clear();
        block.extend(view.iter().copied());
        block.sort_unstable();
        mode_of_sorted(&block)
    }))
}

/// Most frequent value of a sorted slice; the first (smallest) wins ties
fn mode_of_sorted<T: Label>(sorted: &[T]) -> T {
    let mut best = T::default();
    let mut best_count = 0usize;
    let mut i = 0;
    while i < sorted.len() {
        let value = sorted[i];
        let mut j = i + 1;
        while j < sorted.len() && sorted[j] == value {
            j += 1;
        }
        if j - i > best_count {
            best = value;
            best_count = j - i;
        }
        i = j;
    }
    best
}
