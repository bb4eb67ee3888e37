use crate::access::ChunkedVolume;
use crate::error::{PipelineError, Result};
use crate::io::StorageProvider;
use crate::metadata::{Scale, VolumeInfo};
use crate::types::{Bbox, DataType, LayerType};
use ndarray::{s, Array4};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Metadata for an 8-bit, single-channel copy of a float affinity layer
pub fn create_quantized_affinity_info(source: &VolumeInfo, chunk_size: [usize; 3]) -> Result<VolumeInfo> {
    let base = source.scale(0)?;
    let scale = Scale::new(base.size, base.resolution, base.voxel_offset, chunk_size)
        .with_compression(base.compression);
    let mut info = VolumeInfo::new(LayerType::Image, DataType::U8, 1, scale);
    info.mesh = source.mesh.clone();
    Ok(info)
}

/// Rescale float affinities in [0, 1] to an integer layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizeAffinitiesTask {
    pub source_layer_path: String,
    pub dest_layer_path: String,
    pub shape: [usize; 3],
    pub offset: [i64; 3],
    #[serde(default)]
    pub mip: usize,
}

impl QuantizeAffinitiesTask {
    pub async fn execute(&self, provider: &dyn StorageProvider) -> Result<()> {
        let source = ChunkedVolume::open_url(provider, &self.source_layer_path).await?;
        let dest = ChunkedVolume::open_url(provider, &self.dest_layer_path).await?;

        let channels = dest.num_channels();
        if channels > source.num_channels() {
            return Err(PipelineError::InvalidTask(format!(
                "Destination has {} channels, source only {}",
                channels,
                source.num_channels()
            )));
        }

        let bbox = Bbox::from_shape(self.offset, self.shape)
            .intersection(&source.scale(self.mip)?.bounds())
            .ok_or_else(|| {
                PipelineError::OutOfBounds(format!(
                    "Quantize box at {:?} misses mip {}",
                    self.offset, self.mip
                ))
            })?;
        let data = source.read::<f32>(bbox, self.mip).await?;
        let leading = data.slice(s![.., .., .., ..channels]);
        debug!(%bbox, channels, "quantizing affinities");

        match dest.data_type() {
            DataType::U8 => {
                let out: Array4<u8> = leading.mapv(|v| quantize(v, u8::MAX as f32) as u8);
                dest.write(bbox, self.mip, &out).await
            }
            DataType::U16 => {
                let out: Array4<u16> = leading.mapv(|v| quantize(v, u16::MAX as f32) as u16);
                dest.write(bbox, self.mip, &out).await
            }
            other => Err(PipelineError::InvalidTask(format!(
                "Cannot quantize into {} layer",
                other
            ))),
        }
    }
}

/// `clamp(v * max, 0, max)`; the caller's cast truncates
fn quantize(value: f32, max: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }
    (value * max).clamp(0.0, max)
}
