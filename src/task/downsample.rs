use crate::access::ChunkedVolume;
use crate::downsample::{downsample_segmentation, downsample_with_averaging, DownsampleMethod};
use crate::error::{PipelineError, Result};
use crate::io::StorageProvider;
use crate::types::{Bbox, Element, Label};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Produce one output chunk at `mip` from the mip directly below it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownsampleTask {
    pub layer_path: String,
    /// Output mip; the source is `mip - 1`
    pub mip: usize,
    pub shape: [usize; 3],
    pub offset: [i64; 3],
    pub factor: [usize; 3],
    #[serde(default)]
    pub fill_missing: bool,
    /// Kernel override; defaults from the layer type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<DownsampleMethod>,
}

impl DownsampleTask {
    pub async fn execute(&self, provider: &dyn StorageProvider) -> Result<()> {
        if self.mip == 0 {
            return Err(PipelineError::InvalidTask(
                "Downsample output mip must be at least 1".to_string(),
            ));
        }
        let volume = ChunkedVolume::open_url(provider, &self.layer_path)
            .await?
            .with_fill_missing(self.fill_missing);
        let info = volume.info();
        let source = info.scale(self.mip - 1)?;
        let target = info.scale(self.mip)?;

        for i in 0..3 {
            let implied = target.resolution[i] / source.resolution[i];
            if (implied - self.factor[i] as f64).abs() > 1e-6 {
                return Err(PipelineError::InvalidTask(format!(
                    "Factor {:?} does not match scales {} -> {}",
                    self.factor, source.key, target.key
                )));
            }
        }

        let output = Bbox::from_shape(self.offset, self.shape)
            .intersection(&target.bounds())
            .ok_or_else(|| {
                PipelineError::OutOfBounds(format!(
                    "Downsample box at {:?} misses mip {}",
                    self.offset, self.mip
                ))
            })?;

        // Blocks are grouped relative to each scale's own origin
        let mut input = Bbox::new([0; 3], [0; 3]);
        for i in 0..3 {
            let f = self.factor[i] as i64;
            input.min[i] = source.voxel_offset[i] + f * (output.min[i] - target.voxel_offset[i]);
            input.max[i] = source.voxel_offset[i] + f * (output.max[i] - target.voxel_offset[i]);
        }
        let input = input.intersection(&source.bounds()).ok_or_else(|| {
            PipelineError::OutOfBounds(format!("No source voxels under {} at mip {}", output, self.mip))
        })?;

        let method = self
            .method
            .unwrap_or_else(|| DownsampleMethod::for_layer(info.layer_type));
        debug!(mip = self.mip, %input, %output, ?method, "downsampling");

        match method {
            DownsampleMethod::Average => {
                crate::dispatch_data_type!(info.data_type, T => {
                    average::<T>(&volume, input, output, self.mip, self.factor).await
                })
            }
            DownsampleMethod::Mode => {
                crate::dispatch_label_type!(info.data_type, T => {
                    mode::<T>(&volume, input, output, self.mip, self.factor).await
                }, else Err(PipelineError::InvalidTask(format!(
                    "Mode downsampling needs integer labels, layer is {}",
                    info.data_type
                ))))
            }
        }
    }
}

async fn average<T: Element>(
    volume: &ChunkedVolume,
    input: Bbox,
    output: Bbox,
    mip: usize,
    factor: [usize; 3],
) -> Result<()> {
    let data = volume.read::<T>(input, mip - 1).await?;
    let reduced = downsample_with_averaging(&data, factor)?;
    volume.write(output, mip, &reduced).await
}

async fn mode<T: Label>(
    volume: &ChunkedVolume,
    input: Bbox,
    output: Bbox,
    mip: usize,
    factor: [usize; 3],
) -> Result<()> {
    let data = volume.read::<T>(input, mip - 1).await?;
    let reduced = downsample_segmentation(&data, factor)?;
    volume.write(output, mip, &reduced).await
}
