//! Ingest: stage a dense array as self-describing build chunks, derive the
//! layer's `info` from them and queue one [`IngestTask`] per chunk.

use crate::access::{decode_chunk, encode_chunk};
use crate::error::{PipelineError, Result};
use crate::io::IOManager;
use crate::layout::ChunkGrid;
use crate::metadata::{Scale, VolumeInfo, INFO_KEY};
use crate::task::{IngestTask, Task};
use crate::types::{Bbox, DataType, Element, LayerType};
use crate::utils::{build_chunk_key, BUILD_DIR};
use ndarray::{s, Array4};
use serde::{Deserialize, Serialize};
use tracing::info;

/// A block of voxels awaiting ingest, carrying its own type and position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildChunk {
    pub data_type: DataType,
    pub num_channels: usize,
    pub bbox: Bbox,
    /// Raw chunk encoding of the voxels
    pub data: Vec<u8>,
}

impl BuildChunk {
    pub fn new<T: Element>(bbox: Bbox, data: &Array4<T>) -> Self {
        Self {
            data_type: T::DATA_TYPE,
            num_channels: data.shape()[3],
            bbox,
            data: encode_chunk(data.view()),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Decode the voxels as `T`
    pub fn voxels<T: Element>(&self) -> Result<Array4<T>> {
        if T::DATA_TYPE != self.data_type {
            return Err(PipelineError::DataTypeMismatch {
                expected: self.data_type.to_string(),
                requested: T::DATA_TYPE.to_string(),
            });
        }
        let size = self.bbox.size();
        decode_chunk(&self.data, [size[0], size[1], size[2], self.num_channels])
    }
}

/// Split `data` (placed at `offset`) into build chunks of `chunk_size`
pub async fn upload_build_chunks<T: Element>(
    io: &dyn IOManager,
    data: &Array4<T>,
    offset: [i64; 3],
    chunk_size: [usize; 3],
) -> Result<Vec<Bbox>> {
    let shape = data.shape();
    let grid = ChunkGrid::new(offset, [shape[0], shape[1], shape[2]], chunk_size);
    let chunks = grid.all_chunks();
    for chunk in &chunks {
        let [x, y, z] = chunk.ranges_from(offset);
        let block = data.slice(s![x, y, z, ..]).to_owned();
        let build = BuildChunk::new(*chunk, &block);
        io.put(&build_chunk_key(chunk), &build.to_bytes()?).await?;
    }
    info!(chunks = chunks.len(), "uploaded build chunks");
    Ok(chunks)
}

async fn build_chunk_keys(io: &dyn IOManager) -> Result<Vec<String>> {
    let keys = io.list(&format!("{}/", BUILD_DIR)).await?;
    if keys.is_empty() {
        return Err(PipelineError::NotFound(format!("No build chunks under '{}/'", BUILD_DIR)));
    }
    Ok(keys)
}

/// Write an `info` covering the union of all build chunks
pub async fn create_info_from_build(
    io: &dyn IOManager,
    layer_type: LayerType,
    resolution: [f64; 3],
    chunk_size: [usize; 3],
) -> Result<VolumeInfo> {
    let keys = build_chunk_keys(io).await?;

    let mut bounds: Option<Bbox> = None;
    for key in &keys {
        let name = key.rsplit('/').next().unwrap_or(key);
        let bbox: Bbox = name.parse()?;
        bounds = Some(match bounds {
            None => bbox,
            Some(mut union) => {
                for i in 0..3 {
                    union.min[i] = union.min[i].min(bbox.min[i]);
                    union.max[i] = union.max[i].max(bbox.max[i]);
                }
                union
            }
        });
    }
    let bounds = bounds.ok_or_else(|| PipelineError::NotFound("Build chunk bounds".to_string()))?;

    let first = io
        .get(&keys[0])
        .await?
        .ok_or_else(|| PipelineError::NotFound(keys[0].clone()))?;
    let sample = BuildChunk::from_bytes(&first)?;

    let scale = Scale::new(bounds.size(), resolution, bounds.min, chunk_size);
    let info = VolumeInfo::new(layer_type, sample.data_type, sample.num_channels, scale);
    io.put(INFO_KEY, &info.to_json()?).await?;
    io.wait().await?;
    info!(bounds = %bounds, data_type = %sample.data_type, "created info from build chunks");
    Ok(info)
}

/// One [`IngestTask`] per staged build chunk
pub async fn create_ingest_tasks(io: &dyn IOManager, layer_path: &str) -> Result<Vec<Task>> {
    let keys = build_chunk_keys(io).await?;
    Ok(keys
        .into_iter()
        .map(|chunk_path| {
            Task::Ingest(IngestTask {
                layer_path: layer_path.to_string(),
                chunk_path,
            })
        })
        .collect())
}
