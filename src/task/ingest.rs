use crate::access::ChunkedVolume;
use crate::error::{PipelineError, Result};
use crate::ingest::BuildChunk;
use crate::io::StorageProvider;
use crate::types::Element;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Write one staged build chunk into its layer at mip 0
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestTask {
    pub layer_path: String,
    /// Key of the build chunk inside the layer
    pub chunk_path: String,
}

impl IngestTask {
    pub async fn execute(&self, provider: &dyn StorageProvider) -> Result<()> {
        let volume = ChunkedVolume::open_url(provider, &self.layer_path).await?;
        let bytes = volume
            .io()
            .get(&self.chunk_path)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("Build chunk '{}'", self.chunk_path)))?;
        let chunk = BuildChunk::from_bytes(&bytes)?;
        debug!(bbox = %chunk.bbox, "ingesting build chunk");

        crate::dispatch_data_type!(chunk.data_type, T => write_chunk::<T>(&volume, &chunk).await)
    }
}

async fn write_chunk<T: Element>(volume: &ChunkedVolume, chunk: &BuildChunk) -> Result<()> {
    let data = chunk.voxels::<T>()?;
    volume.write(chunk.bbox, 0, &data).await
}
