use super::read_labels;
use crate::access::ChunkedVolume;
use crate::error::{PipelineError, Result};
use crate::io::StorageProvider;
use crate::types::Bbox;
use crate::utils::fragment_name;
use fast_surface_nets::ndshape::{RuntimeShape, Shape};
use fast_surface_nets::{surface_nets, SurfaceNetsBuffer};
use ndarray::{Array3, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Directory used when the layer's `info` names none
pub const DEFAULT_MESH_DIR: &str = "mesh";

/// Extract one surface fragment per label present in a segmentation box
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshTask {
    pub layer_path: String,
    pub shape: [usize; 3],
    pub offset: [i64; 3],
    #[serde(default)]
    pub mip: usize,
    #[serde(default)]
    pub lod: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_dir: Option<String>,
}

impl MeshTask {
    pub async fn execute(&self, provider: &dyn StorageProvider) -> Result<()> {
        let volume = ChunkedVolume::open_url(provider, &self.layer_path).await?;
        let info = volume.info();
        let scale = info.scale(self.mip)?;
        let bbox = Bbox::from_shape(self.offset, self.shape)
            .intersection(&scale.bounds())
            .ok_or_else(|| {
                PipelineError::OutOfBounds(format!(
                    "Mesh box at {:?} misses mip {}",
                    self.offset, self.mip
                ))
            })?;
        let mesh_dir = self
            .mesh_dir
            .clone()
            .or(info.mesh.clone())
            .unwrap_or_else(|| DEFAULT_MESH_DIR.to_string());

        let labels = read_labels(&volume, bbox, self.mip).await?.index_axis_move(Axis(3), 0);
        let present: BTreeSet<u64> = labels.iter().copied().filter(|&l| l != 0).collect();
        debug!(%bbox, labels = present.len(), "meshing");

        let io = volume.io();
        for label in present {
            let mesh = extract_surface(&labels, label, bbox.min, scale.resolution);
            let key = format!("{}/{}", mesh_dir, fragment_name(label, self.lod, &bbox));
            io.put(&key, &encode_fragment(&mesh.positions, &mesh.indices)).await?;
        }
        Ok(())
    }
}

/// Surface of one label, in physical coordinates
pub(crate) struct Fragment {
    pub positions: Vec<[f32; 3]>,
    pub indices: Vec<u32>,
}

fn extract_surface(labels: &Array3<u64>, label: u64, origin: [i64; 3], resolution: [f64; 3]) -> Fragment {
    let (sx, sy, sz) = labels.dim();
    // One voxel of padding keeps surfaces closed at the box faces
    let dims = [sx as u32 + 2, sy as u32 + 2, sz as u32 + 2];
    let shape = RuntimeShape::<u32, 3>::new(dims);
    let mut sdf = vec![1.0f32; shape.usize()];
    for ((x, y, z), &value) in labels.indexed_iter() {
        if value == label {
            let i = shape.linearize([x as u32 + 1, y as u32 + 1, z as u32 + 1]);
            sdf[i as usize] = -1.0;
        }
    }

    let mut buffer = SurfaceNetsBuffer::default();
    surface_nets(&sdf, &shape, [0; 3], [dims[0] - 1, dims[1] - 1, dims[2] - 1], &mut buffer);

    let positions = buffer
        .positions
        .iter()
        .map(|p| {
            let mut out = [0.0f32; 3];
            for i in 0..3 {
                out[i] = ((p[i] as f64 - 1.0 + origin[i] as f64) * resolution[i]) as f32;
            }
            out
        })
        .collect();
    Fragment {
        positions,
        indices: buffer.indices,
    }
}

/// Fragment bytes: vertex count, xyz vertices, triangle indices (little-endian)
pub fn encode_fragment(positions: &[[f32; 3]], indices: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + positions.len() * 12 + indices.len() * 4);
    out.extend_from_slice(&(positions.len() as u32).to_le_bytes());
    for p in positions {
        for v in p {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    for i in indices {
        out.extend_from_slice(&i.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{IOManager, MemoryStorageProvider};
    use crate::metadata::{Scale, VolumeInfo};
    use crate::types::{DataType, LayerType};
    use ndarray::{s, Array4};

    #[test]
    fn test_surface_of_cube_is_closed_mesh() {
        let mut labels = Array3::<u64>::zeros((6, 6, 6));
        labels.slice_mut(s![1..5, 1..5, 1..5]).fill(3);
        let mesh = extract_surface(&labels, 3, [0, 0, 0], [1.0, 1.0, 1.0]);
        assert!(!mesh.positions.is_empty());
        assert_eq!(mesh.indices.len() % 3, 0);
        assert!(mesh.indices.iter().all(|&i| (i as usize) < mesh.positions.len()));
        // Vertices stay near the cube's faces
        for p in &mesh.positions {
            assert!(p.iter().all(|&c| (0.0..=5.0).contains(&c)));
        }
    }

    #[test]
    fn test_fragment_layout() {
        let bytes = encode_fragment(&[[1.0, 2.0, 3.0]], &[0, 0, 0]);
        assert_eq!(bytes.len(), 4 + 12 + 12);
        assert_eq!(&bytes[..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1.0f32.to_le_bytes());
    }

    #[tokio::test]
    async fn test_mesh_task_one_fragment_per_label() {
        let provider = MemoryStorageProvider::new();
        let scale = Scale::new([16, 16, 16], [4.0, 4.0, 40.0], [0, 0, 0], [16, 16, 16]);
        let info = VolumeInfo::new(LayerType::Segmentation, DataType::U32, 1, scale);
        let volume = ChunkedVolume::create(provider.open("mem://seg").unwrap(), info)
            .await
            .unwrap();
        let mut data = Array4::<u32>::zeros((16, 16, 16, 1));
        data.slice_mut(s![..8, .., .., ..]).fill(7);
        data.slice_mut(s![8.., ..4, .., ..]).fill(12);
        volume
            .write(Bbox::new([0, 0, 0], [16, 16, 16]), 0, &data)
            .await
            .unwrap();

        MeshTask {
            layer_path: "mem://seg".to_string(),
            shape: [16, 16, 16],
            offset: [0, 0, 0],
            mip: 0,
            lod: 0,
            mesh_dir: None,
        }
        .execute(&provider)
        .await
        .unwrap();

        let io = provider.memory("mem://seg");
        let keys = io.list("mesh/").await.unwrap();
        assert_eq!(keys, vec!["mesh/12:0:0-16_0-16_0-16", "mesh/7:0:0-16_0-16_0-16"]);
    }
}
