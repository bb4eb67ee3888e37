//! Chunked volume access - main API for reading/writing voxel ranges

use crate::error::{PipelineError, Result};
use crate::io::{IOManager, StorageProvider};
use crate::metadata::{Scale, VolumeInfo, INFO_KEY};
use crate::types::{Bbox, DataType, Element};
use crate::utils::{chunk_key, format_bytes};
use futures::future::try_join_all;
use ndarray::{s, Array4, ArrayView4, ShapeBuilder};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

/// Encode a chunk as raw little-endian values, x fastest, channel slowest
pub fn encode_chunk<T: Element>(data: ArrayView4<'_, T>) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * T::DATA_TYPE.size_in_bytes());
    // Logical order of the reversed axes is Fortran order of the original
    for value in data.t().iter() {
        value.write_le(&mut out);
    }
    out
}

/// Decode a raw chunk of the given `[x, y, z, c]` shape
pub fn decode_chunk<T: Element>(bytes: &[u8], shape: [usize; 4]) -> Result<Array4<T>> {
    let width = T::DATA_TYPE.size_in_bytes();
    let expected = shape.iter().product::<usize>() * width;
    if bytes.len() != expected {
        return Err(PipelineError::InvalidFormat(format!(
            "Chunk holds {} bytes, expected {} for shape {:?}",
            bytes.len(),
            expected,
            shape
        )));
    }

    let values: Vec<T> = bytes.chunks_exact(width).map(T::read_le).collect();
    Array4::from_shape_vec((shape[0], shape[1], shape[2], shape[3]).f(), values)
        .map_err(|e| PipelineError::InvalidDimensions(e.to_string()))
}

/// A multi-resolution volume stored as chunk objects in a backend.
///
/// The metadata held here is a local copy: changes become visible to other
/// processes only through [`commit_metadata`](Self::commit_metadata), and
/// changes made elsewhere only through
/// [`refresh_metadata`](Self::refresh_metadata).
pub struct ChunkedVolume {
    /// Volume metadata
    info: Arc<RwLock<VolumeInfo>>,

    /// I/O manager for storage operations
    io: Arc<dyn IOManager>,

    /// Read absent chunks as zeros instead of failing
    fill_missing: bool,
}

impl ChunkedVolume {
    /// Open an existing volume by reading its `info`
    pub async fn open(io: Arc<dyn IOManager>) -> Result<Self> {
        let info = fetch_info(io.as_ref()).await?;
        Ok(Self::from_info(io, info))
    }

    /// Open the volume at `url` through a storage provider
    pub async fn open_url(provider: &dyn StorageProvider, url: &str) -> Result<Self> {
        Self::open(provider.open(url)?).await
    }

    /// Create a new volume and commit its metadata
    pub async fn create(io: Arc<dyn IOManager>, info: VolumeInfo) -> Result<Self> {
        info.validate()?;
        let volume = Self::from_info(io, info);
        volume.commit_metadata().await?;
        Ok(volume)
    }

    /// Wrap a backend with metadata that has not been committed
    pub fn from_info(io: Arc<dyn IOManager>, info: VolumeInfo) -> Self {
        Self {
            info: Arc::new(RwLock::new(info)),
            io,
            fill_missing: false,
        }
    }

    /// Set the missing-chunk policy
    pub fn with_fill_missing(mut self, fill_missing: bool) -> Self {
        self.fill_missing = fill_missing;
        self
    }

    pub fn fill_missing(&self) -> bool {
        self.fill_missing
    }

    /// Snapshot of the local metadata
    pub fn info(&self) -> VolumeInfo {
        self.info.read().clone()
    }

    /// Snapshot of one scale
    pub fn scale(&self, mip: usize) -> Result<Scale> {
        self.info.read().scale(mip).cloned()
    }

    pub fn data_type(&self) -> DataType {
        self.info.read().data_type
    }

    pub fn num_channels(&self) -> usize {
        self.info.read().num_channels
    }

    pub fn num_mips(&self) -> usize {
        self.info.read().num_mips()
    }

    /// Backend handle
    pub fn io(&self) -> Arc<dyn IOManager> {
        Arc::clone(&self.io)
    }

    /// Append a new highest mip to the local metadata
    pub fn add_scale(&self, scale: Scale) -> Result<usize> {
        self.info.write().add_scale(scale)
    }

    /// Persist the local metadata to the backend
    pub async fn commit_metadata(&self) -> Result<()> {
        let json = self.info.read().to_json()?;
        self.io.put(INFO_KEY, &json).await?;
        self.io.wait().await?;
        info!(scales = self.num_mips(), "committed volume metadata");
        Ok(())
    }

    /// Replace the local metadata with the backend's copy
    pub async fn refresh_metadata(&self) -> Result<()> {
        let fresh = fetch_info(self.io.as_ref()).await?;
        let scales = fresh.num_mips();
        *self.info.write() = fresh;
        debug!(scales, "refreshed volume metadata");
        Ok(())
    }

    fn check_type<T: Element>(&self) -> Result<()> {
        let expected = self.data_type();
        if T::DATA_TYPE != expected {
            return Err(PipelineError::DataTypeMismatch {
                expected: expected.to_string(),
                requested: T::DATA_TYPE.to_string(),
            });
        }
        Ok(())
    }

    /// Read a voxel box at `mip` into a dense `[x, y, z, c]` array
    pub async fn read<T: Element>(&self, bbox: Bbox, mip: usize) -> Result<Array4<T>> {
        self.check_type::<T>()?;
        let scale = self.scale(mip)?;
        let channels = self.num_channels();

        let bounds = scale.bounds();
        if bbox.is_empty() || !bounds.contains_box(&bbox) {
            return Err(PipelineError::OutOfBounds(format!(
                "Requested {} outside {} at mip {}",
                bbox, bounds, mip
            )));
        }

        let chunks = scale.grid()?.chunks_covering(&bbox);

        // Fetch all chunks concurrently
        let futures: Vec<_> = chunks
            .into_iter()
            .map(|chunk| {
                let io = Arc::clone(&self.io);
                let key = chunk_key(&scale.key, &chunk);
                async move {
                    let data = io.get(&key).await?;
                    Ok::<_, PipelineError>((chunk, key, data))
                }
            })
            .collect();
        let fetched = try_join_all(futures).await?;

        let size = bbox.size();
        let mut out = Array4::<T>::default((size[0], size[1], size[2], channels));

        for (chunk, key, data) in fetched {
            let data = match data {
                Some(data) => data,
                None if self.fill_missing => continue,
                None => return Err(PipelineError::EmptyVolume { key }),
            };

            let chunk_size = chunk.size();
            let shape = [chunk_size[0], chunk_size[1], chunk_size[2], channels];
            let raw_len = chunk.volume() * channels * T::DATA_TYPE.size_in_bytes();
            let raw = scale.compression.decompress(&data, raw_len)?;
            let decoded = decode_chunk::<T>(&raw, shape)?;

            let overlap = chunk.intersection(&bbox).ok_or_else(|| {
                PipelineError::InvalidDimensions(format!("Chunk {} misses {}", chunk, bbox))
            })?;
            let [ox, oy, oz] = overlap.ranges_from(bbox.min);
            let [cx, cy, cz] = overlap.ranges_from(chunk.min);
            out.slice_mut(s![ox, oy, oz, ..])
                .assign(&decoded.slice(s![cx, cy, cz, ..]));
        }

        Ok(out)
    }

    /// Write a chunk-aligned voxel box at `mip`.
    ///
    /// Every covered chunk object is replaced whole; the parts of `data`
    /// beyond the volume's far edge are dropped.
    pub async fn write<T: Element>(&self, bbox: Bbox, mip: usize, data: &Array4<T>) -> Result<()> {
        self.check_type::<T>()?;
        let scale = self.scale(mip)?;
        let channels = self.num_channels();

        let size = bbox.size();
        let expected = [size[0], size[1], size[2], channels];
        if data.shape() != &expected[..] {
            return Err(PipelineError::InvalidDimensions(format!(
                "Data shape {:?} does not match {} with {} channels",
                data.shape(),
                bbox,
                channels
            )));
        }

        let grid = scale.grid()?;
        if !grid.is_aligned(&bbox) {
            return Err(PipelineError::UnalignedWrite {
                bbox: bbox.to_string(),
                mip,
            });
        }

        let mut objects = Vec::new();
        for chunk in grid.chunks_covering(&bbox) {
            let [x, y, z] = chunk.ranges_from(bbox.min);
            let encoded = encode_chunk(data.slice(s![x, y, z, ..]));
            let compressed = scale.compression.compress(&encoded)?;
            objects.push((chunk_key(&scale.key, &chunk), compressed));
        }

        debug!(mip, %bbox, chunks = objects.len(), "writing chunks");
        let puts = objects
            .iter()
            .map(|(key, bytes)| self.io.put(key, bytes));
        try_join_all(puts).await?;
        Ok(())
    }

    /// Get statistics about the volume at one mip
    pub fn stats(&self, mip: usize) -> Result<VolumeStats> {
        let info = self.info.read();
        let scale = info.scale(mip)?;
        let grid = scale.grid()?;
        let total_voxels = scale.bounds().volume();
        Ok(VolumeStats {
            mip,
            total_voxels,
            total_chunks: grid.total_chunks(),
            uncompressed_size: total_voxels * info.num_channels * info.data_type.size_in_bytes(),
            data_type: info.data_type,
            compression_method: scale.compression,
        })
    }
}

async fn fetch_info(io: &dyn IOManager) -> Result<VolumeInfo> {
    let bytes = io
        .get(INFO_KEY)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("Volume metadata '{}'", INFO_KEY)))?;
    VolumeInfo::from_json(&bytes)
}

/// Volume statistics
#[derive(Debug, Clone)]
pub struct VolumeStats {
    pub mip: usize,
    pub total_voxels: usize,
    pub total_chunks: usize,
    pub uncompressed_size: usize,
    pub data_type: DataType,
    pub compression_method: crate::compression::CompressionMethod,
}

impl VolumeStats {
    pub fn summary(&self) -> String {
        format!(
            "mip {}: {} voxels, {} chunks, {} uncompressed ({}, {:?})",
            self.mip,
            self.total_voxels,
            self.total_chunks,
            format_bytes(self.uncompressed_size),
            self.data_type,
            self.compression_method,
        )
    }
}
