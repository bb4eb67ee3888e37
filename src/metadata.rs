//! Volume metadata: the `info` document and its ordered list of scales

use crate::compression::CompressionMethod;
use crate::error::{PipelineError, Result};
use crate::layout::ChunkGrid;
use crate::types::{Bbox, DataType, LayerType};
use serde::{Deserialize, Serialize};

/// Object key of the metadata document inside a layer
pub const INFO_KEY: &str = "info";

const MULTISCALE_TYPE: &str = "neuroglancer_multiscale_volume";

/// Voxel encoding of stored chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Little-endian values, x fastest, channel slowest
    #[default]
    Raw,
}

/// One resolution level of a volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scale {
    /// Key prefix of this scale's chunk objects
    pub key: String,

    pub encoding: Encoding,

    #[serde(default, skip_serializing_if = "CompressionMethod::is_none")]
    pub compression: CompressionMethod,

    /// Voxel extent per axis
    pub size: [usize; 3],

    /// Physical size of a voxel per axis
    pub resolution: [f64; 3],

    /// Origin of the scale in its own voxel coordinates
    pub voxel_offset: [i64; 3],

    /// Chunk sizes; the first entry is the one used for storage
    pub chunk_sizes: Vec<[usize; 3]>,
}

impl Scale {
    /// Create a scale keyed by its resolution
    pub fn new(
        size: [usize; 3],
        resolution: [f64; 3],
        voxel_offset: [i64; 3],
        chunk_size: [usize; 3],
    ) -> Self {
        Self {
            key: resolution_key(resolution),
            encoding: Encoding::Raw,
            compression: CompressionMethod::None,
            size,
            resolution,
            voxel_offset,
            chunk_sizes: vec![chunk_size],
        }
    }

    /// Set chunk object compression
    pub fn with_compression(mut self, compression: CompressionMethod) -> Self {
        self.compression = compression;
        self
    }

    /// Storage chunk size; every component is non-zero
    pub fn chunk_size(&self) -> Result<[usize; 3]> {
        let chunk_size = self
            .chunk_sizes
            .first()
            .copied()
            .ok_or_else(|| PipelineError::Metadata(format!("Scale {} has no chunk size", self.key)))?;
        if chunk_size.contains(&0) {
            return Err(PipelineError::Metadata(format!(
                "Scale {} has chunk size {:?}",
                self.key, chunk_size
            )));
        }
        Ok(chunk_size)
    }

    /// Voxel extent of the scale as a box
    pub fn bounds(&self) -> Bbox {
        Bbox::from_shape(self.voxel_offset, self.size)
    }

    /// Chunk tiling of the scale
    pub fn grid(&self) -> Result<ChunkGrid> {
        Ok(ChunkGrid::new(self.voxel_offset, self.size, self.chunk_size()?))
    }

    /// Scale produced by downsampling this one by `factor`:
    /// `size' = ceil(size / f)` and `offset' = floor(offset / f)`.
    pub fn downsampled(&self, factor: [usize; 3]) -> Result<Scale> {
        if factor.contains(&0) {
            return Err(PipelineError::ScaleOrder(format!(
                "Downsample factor {:?} has a zero component",
                factor
            )));
        }
        let mut size = self.size;
        let mut offset = self.voxel_offset;
        let mut resolution = self.resolution;
        for i in 0..3 {
            size[i] = self.size[i].div_ceil(factor[i]);
            offset[i] = self.voxel_offset[i].div_euclid(factor[i] as i64);
            resolution[i] = self.resolution[i] * factor[i] as f64;
        }
        Ok(Scale {
            key: resolution_key(resolution),
            encoding: self.encoding,
            compression: self.compression,
            size,
            resolution,
            voxel_offset: offset,
            chunk_sizes: self.chunk_sizes.clone(),
        })
    }
}

/// `"{rx}_{ry}_{rz}"`, printing whole resolutions without a fraction
fn resolution_key(resolution: [f64; 3]) -> String {
    resolution
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("_")
}

fn default_type_tag() -> String {
    MULTISCALE_TYPE.to_string()
}

/// The `info` document describing a multi-resolution volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeInfo {
    #[serde(rename = "@type", default = "default_type_tag")]
    pub type_tag: String,

    #[serde(rename = "type")]
    pub layer_type: LayerType,

    pub data_type: DataType,

    pub num_channels: usize,

    /// Scales ordered finest first
    pub scales: Vec<Scale>,

    /// Directory holding mesh fragments and manifests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh: Option<String>,
}

impl VolumeInfo {
    /// Create metadata with a single (mip 0) scale
    pub fn new(layer_type: LayerType, data_type: DataType, num_channels: usize, scale: Scale) -> Self {
        Self {
            type_tag: default_type_tag(),
            layer_type,
            data_type,
            num_channels,
            scales: vec![scale],
            mesh: None,
        }
    }

    /// Set the mesh directory
    pub fn with_mesh_dir(mut self, mesh: impl Into<String>) -> Self {
        self.mesh = Some(mesh.into());
        self
    }

    pub fn num_mips(&self) -> usize {
        self.scales.len()
    }

    pub fn scale(&self, mip: usize) -> Result<&Scale> {
        self.scales.get(mip).ok_or_else(|| {
            PipelineError::OutOfBounds(format!(
                "Mip {} does not exist ({} scales)",
                mip,
                self.scales.len()
            ))
        })
    }

    pub fn volume_size(&self, mip: usize) -> Result<[usize; 3]> {
        Ok(self.scale(mip)?.size)
    }

    pub fn voxel_offset(&self, mip: usize) -> Result<[i64; 3]> {
        Ok(self.scale(mip)?.voxel_offset)
    }

    pub fn bounds(&self, mip: usize) -> Result<Bbox> {
        Ok(self.scale(mip)?.bounds())
    }

    pub fn chunk_size(&self, mip: usize) -> Result<[usize; 3]> {
        self.scale(mip)?.chunk_size()
    }

    pub fn grid(&self, mip: usize) -> Result<ChunkGrid> {
        self.scale(mip)?.grid()
    }

    /// Chunk boxes covering `bbox` at `mip`, clipped to the volume
    pub fn chunk_grid(&self, mip: usize, bbox: &Bbox) -> Result<Vec<Bbox>> {
        Ok(self.grid(mip)?.chunks_covering(bbox))
    }

    /// Per-axis factor between two mips, from their resolutions
    pub fn factor_between(&self, from_mip: usize, to_mip: usize) -> Result<[f64; 3]> {
        let from = self.scale(from_mip)?;
        let to = self.scale(to_mip)?;
        let mut factor = [1.0; 3];
        for i in 0..3 {
            factor[i] = to.resolution[i] / from.resolution[i];
        }
        Ok(factor)
    }

    /// Scale that downsampling `mip` by `factor` would produce
    pub fn downsample_scale(&self, mip: usize, factor: [usize; 3]) -> Result<Scale> {
        self.scale(mip)?.downsampled(factor)
    }

    /// Append a new highest mip.
    ///
    /// The factor implied by the resolutions must be at least 1 on every axis
    /// and greater than 1 on at least one axis relative to the current
    /// highest mip.
    pub fn add_scale(&mut self, scale: Scale) -> Result<usize> {
        scale.chunk_size()?;
        if let Some(top) = self.scales.last() {
            const EPS: f64 = 1e-9;
            let mut grows = false;
            for i in 0..3 {
                let factor = scale.resolution[i] / top.resolution[i];
                if !factor.is_finite() || factor < 1.0 - EPS {
                    return Err(PipelineError::ScaleOrder(format!(
                        "Scale {} is finer than mip {} ({}) on axis {}",
                        scale.key,
                        self.scales.len() - 1,
                        top.key,
                        i
                    )));
                }
                grows |= factor > 1.0 + EPS;
            }
            if !grows {
                return Err(PipelineError::ScaleOrder(format!(
                    "Scale {} does not coarsen mip {} ({})",
                    scale.key,
                    self.scales.len() - 1,
                    top.key
                )));
            }
        }
        if self.scales.iter().any(|s| s.key == scale.key) {
            return Err(PipelineError::ScaleOrder(format!(
                "Scale key {} already exists",
                scale.key
            )));
        }
        self.scales.push(scale);
        Ok(self.scales.len() - 1)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let info: VolumeInfo =
            serde_json::from_slice(bytes).map_err(|e| PipelineError::Metadata(e.to_string()))?;
        info.validate()?;
        Ok(info)
    }

    /// Reject documents the chunk store cannot address
    pub fn validate(&self) -> Result<()> {
        if self.scales.is_empty() {
            return Err(PipelineError::Metadata("Volume has no scales".to_string()));
        }
        if self.num_channels == 0 {
            return Err(PipelineError::Metadata("Volume has zero channels".to_string()));
        }
        for scale in &self.scales {
            scale.chunk_size()?;
        }
        Ok(())
    }
}
