use super::write_labels;
use crate::access::ChunkedVolume;
use crate::error::{PipelineError, Result};
use crate::io::StorageProvider;
use crate::types::{Bbox, BboxString, DataType};
use crate::watershed::{watershed, WatershedParams};
use ndarray::{s, Array3, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Segment one affinity chunk and persist the stable inner crop.
///
/// `chunk_position` is the absolute box read from the affinity layer,
/// context margin included. `crop_position` is relative to the chunk's
/// minimum corner and selects the labels actually written.
///
/// Written labels are `1 +` the layer-wide linear index (x fastest) of each
/// segment's lowest voxel, so chunks never reuse each other's ids. Segments
/// crossing a chunk border still get one id per chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatershedTask {
    pub chunk_position: BboxString,
    pub crop_position: BboxString,
    pub layer_path_affinities: String,
    pub layer_path_segmentation: String,
    pub high_threshold: f32,
    pub low_threshold: f32,
    pub merge_threshold: f32,
    pub merge_size: usize,
    pub dust_size: usize,
    #[serde(default)]
    pub mip: usize,
}

impl WatershedTask {
    pub fn params(&self) -> WatershedParams {
        WatershedParams {
            high_threshold: self.high_threshold,
            low_threshold: self.low_threshold,
            merge_threshold: self.merge_threshold,
            merge_size: self.merge_size,
            dust_size: self.dust_size,
        }
    }

    /// Absolute box of the persisted labels
    pub fn crop_box(&self) -> Result<Bbox> {
        let chunk = self.chunk_position.0;
        let crop = self.crop_position.0;
        let size = chunk.size();
        let within = (0..3).all(|i| crop.min[i] >= 0 && crop.max[i] <= size[i] as i64);
        if crop.is_empty() || !within {
            return Err(PipelineError::InvalidTask(format!(
                "Crop {} does not fit inside chunk {}",
                crop, chunk
            )));
        }
        let mut absolute = crop;
        for i in 0..3 {
            absolute.min[i] += chunk.min[i];
            absolute.max[i] += chunk.min[i];
        }
        Ok(absolute)
    }

    pub async fn execute(&self, provider: &dyn StorageProvider) -> Result<()> {
        let chunk = self.chunk_position.0;
        let crop = self.crop_box()?;
        let params = self.params();
        params.validate()?;

        let affinities = ChunkedVolume::open_url(provider, &self.layer_path_affinities).await?;
        if affinities.data_type() != DataType::F32 {
            return Err(PipelineError::DataTypeMismatch {
                expected: affinities.data_type().to_string(),
                requested: DataType::F32.to_string(),
            });
        }
        let segmentation = ChunkedVolume::open_url(provider, &self.layer_path_segmentation).await?;
        let bounds = segmentation.scale(self.mip)?.bounds();
        if !bounds.contains_box(&chunk) {
            return Err(PipelineError::InvalidTask(format!(
                "Chunk {} lies outside segmentation bounds {}",
                chunk, bounds
            )));
        }

        let graph = affinities.read::<f32>(chunk, self.mip).await?;
        let labels = to_layer_labels(watershed(graph.view(), &params)?, chunk, bounds);

        let [x, y, z] = crop.ranges_from(chunk.min);
        let cropped = labels
            .slice(s![x, y, z])
            .to_owned()
            .insert_axis(Axis(3));
        debug!(%chunk, %crop, "writing watershed labels");
        write_labels(&segmentation, crop, self.mip, &cropped).await
    }
}

/// Re-key chunk-local labels (`1 +` linear index inside `chunk`) to linear
/// indices inside `bounds`, which must contain `chunk`
fn to_layer_labels(labels: Array3<u64>, chunk: Bbox, bounds: Bbox) -> Array3<u64> {
    let local = chunk.size();
    let layer = bounds.size();
    labels.mapv_into(|label| {
        if label == 0 {
            return 0;
        }
        let index = (label - 1) as usize;
        let coords = [index % local[0], (index / local[0]) % local[1], index / (local[0] * local[1])];
        let mut global = [0usize; 3];
        for i in 0..3 {
            global[i] = (chunk.min[i] - bounds.min[i]) as usize + coords[i];
        }
        1 + (global[0] + layer[0] * (global[1] + layer[1] * global[2])) as u64
    })
}
