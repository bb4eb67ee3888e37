use super::{read_labels, write_labels};
use crate::access::ChunkedVolume;
use crate::error::{PipelineError, Result};
use crate::io::{IOManager, StorageProvider};
use crate::types::{BboxString, DataType, Element};
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Remap the labels of one chunk through a lookup table
///
/// The table lives at `mapping_path` in the output layer and holds raw
/// little-endian values of the output layer's data type, indexed by the
/// old label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelabelTask {
    pub layer_in_path: String,
    pub layer_out_path: String,
    pub chunk_position: BboxString,
    pub mapping_path: String,
    #[serde(default)]
    pub mip: usize,
}

/// Encode a lookup table for [`RelabelTask`]
pub fn encode_mapping<T: Element>(mapping: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(mapping.len() * T::DATA_TYPE.size_in_bytes());
    for &value in mapping {
        value.write_le(&mut out);
    }
    out
}

fn decode_mapping(bytes: &[u8], data_type: DataType) -> Result<Vec<u64>> {
    let width = data_type.size_in_bytes();
    if bytes.len() % width != 0 {
        return Err(PipelineError::InvalidFormat(format!(
            "Mapping of {} bytes is not a whole number of {} values",
            bytes.len(),
            data_type
        )));
    }
    crate::dispatch_label_type!(data_type, T => {
        Ok(bytes
            .chunks_exact(width)
            .map(|b| T::read_le(b).to_u64().unwrap_or(0))
            .collect())
    }, else Err(PipelineError::InvalidTask(format!(
        "Cannot relabel into {} layer",
        data_type
    ))))
}

impl RelabelTask {
    pub async fn execute(&self, provider: &dyn StorageProvider) -> Result<()> {
        let bbox = self.chunk_position.0;
        let input = ChunkedVolume::open_url(provider, &self.layer_in_path).await?;
        let output = ChunkedVolume::open_url(provider, &self.layer_out_path).await?;

        let io = output.io();
        let bytes = io
            .get(&self.mapping_path)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("Mapping '{}'", self.mapping_path)))?;
        let mapping = decode_mapping(&bytes, output.data_type())?;

        let mut relabeled = read_labels(&input, bbox, self.mip).await?;
        for value in relabeled.iter_mut() {
            let old = *value;
            *value = usize::try_from(old)
                .ok()
                .and_then(|i| mapping.get(i).copied())
                .ok_or(PipelineError::RelabelDomain {
                    label: old,
                    domain: mapping.len(),
                })?;
        }

        debug!(%bbox, domain = mapping.len(), "relabeling");
        write_labels(&output, bbox, self.mip, &relabeled).await
    }
}
