//! Tasks - self-describing, serializable units of work.
//!
//! A task names its operation and every parameter needed to reproduce its
//! output from store state. It never reads ambient state: the executing
//! worker passes the [`StorageProvider`] that resolves the layer URLs.

mod downsample;
mod ingest;
mod manifest;
mod mesh;
mod quantize;
mod relabel;
mod watershed;

pub use downsample::DownsampleTask;
pub use ingest::IngestTask;
pub use manifest::{Manifest, MeshManifestTask};
pub use mesh::{encode_fragment, MeshTask};
pub use quantize::{create_quantized_affinity_info, QuantizeAffinitiesTask};
pub use relabel::{encode_mapping, RelabelTask};
pub use watershed::WatershedTask;

use crate::access::ChunkedVolume;
use crate::error::{PipelineError, Result};
use crate::io::StorageProvider;
use crate::types::Bbox;
use ndarray::Array4;
use num_traits::{NumCast, ToPrimitive};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Every kind of work the pipeline can dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class")]
pub enum Task {
    Downsample(DownsampleTask),
    Watershed(WatershedTask),
    Mesh(MeshTask),
    MeshManifest(MeshManifestTask),
    QuantizeAffinities(QuantizeAffinitiesTask),
    Relabel(RelabelTask),
    Ingest(IngestTask),
}

impl Task {
    /// Short name of the task kind
    pub fn kind(&self) -> &'static str {
        match self {
            Task::Downsample(_) => "downsample",
            Task::Watershed(_) => "watershed",
            Task::Mesh(_) => "mesh",
            Task::MeshManifest(_) => "mesh_manifest",
            Task::QuantizeAffinities(_) => "quantize_affinities",
            Task::Relabel(_) => "relabel",
            Task::Ingest(_) => "ingest",
        }
    }

    /// Run the task against the stores resolved by `provider`
    pub async fn execute(&self, provider: &dyn StorageProvider) -> Result<()> {
        debug!(kind = self.kind(), "executing task");
        let result = match self {
            Task::Downsample(task) => task.execute(provider).await,
            Task::Watershed(task) => task.execute(provider).await,
            Task::Mesh(task) => task.execute(provider).await,
            Task::MeshManifest(task) => task.execute(provider).await,
            Task::QuantizeAffinities(task) => task.execute(provider).await,
            Task::Relabel(task) => task.execute(provider).await,
            Task::Ingest(task) => task.execute(provider).await,
        };
        if result.is_ok() {
            info!(kind = self.kind(), "task complete");
        }
        result
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

macro_rules! impl_from_task {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Task {
                fn from(task: $ty) -> Self {
                    Task::$variant(task)
                }
            }
        )*
    };
}

impl_from_task!(
    Downsample => DownsampleTask,
    Watershed => WatershedTask,
    Mesh => MeshTask,
    MeshManifest => MeshManifestTask,
    QuantizeAffinities => QuantizeAffinitiesTask,
    Relabel => RelabelTask,
    Ingest => IngestTask,
);

/// Read any integer layer as `u64` labels
pub(crate) async fn read_labels(volume: &ChunkedVolume, bbox: Bbox, mip: usize) -> Result<Array4<u64>> {
    let data_type = volume.data_type();
    crate::dispatch_label_type!(data_type, T => {
        let data = volume.read::<T>(bbox, mip).await?;
        Ok(data.mapv(|v| v.to_u64().unwrap_or(0)))
    }, else Err(PipelineError::InvalidTask(format!(
        "Layer data type {} cannot hold labels",
        data_type
    ))))
}

/// Write `u64` labels into an integer layer, failing on values that do not fit
pub(crate) async fn write_labels(
    volume: &ChunkedVolume,
    bbox: Bbox,
    mip: usize,
    labels: &Array4<u64>,
) -> Result<()> {
    let data_type = volume.data_type();
    crate::dispatch_label_type!(data_type, T => {
        let mut converted = Array4::<T>::default(labels.raw_dim());
        for (dst, &src) in converted.iter_mut().zip(labels.iter()) {
            *dst = <T as NumCast>::from(src).ok_or_else(|| {
                PipelineError::InvalidTask(format!("Label {} does not fit {}", src, data_type))
            })?;
        }
        volume.write(bbox, mip, &converted).await
    }, else Err(PipelineError::InvalidTask(format!(
        "Layer data type {} cannot hold labels",
        data_type
    ))))
}
