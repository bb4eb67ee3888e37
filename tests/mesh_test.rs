//! Mesh fragment and manifest tests

use chunkpipe::io::FileSystemIOManager;
use chunkpipe::task::{Manifest, MeshManifestTask, MeshTask};
use chunkpipe::{
    Bbox, ChunkedVolume, DataType, IOManager, LayerType, MemoryStorageProvider, Scale, StorageProvider, UrlStorageProvider,
    VolumeInfo,
};
use ndarray::Array4;
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_mesh_fragment_key() {
    let provider = MemoryStorageProvider::new();
    let scale = Scale::new([64, 64, 64], [1.0, 1.0, 1.0], [0, 0, 0], [64, 64, 64]);
    let info = VolumeInfo::new(LayerType::Segmentation, DataType::U32, 1, scale);
    let volume = ChunkedVolume::create(provider.open("mem://seg").unwrap(), info)
        .await
        .unwrap();

    // A ball of label 1
    let data = Array4::from_shape_fn((64, 64, 64, 1), |(x, y, z, _)| {
        let d = |v: usize| (v as f64 - 31.5).powi(2);
        u32::from(d(x) + d(y) + d(z) < 20.0 * 20.0)
    });
    volume
        .write(Bbox::new([0, 0, 0], [64, 64, 64]), 0, &data)
        .await
        .unwrap();

    MeshTask {
        layer_path: "mem://seg".to_string(),
        shape: [64, 64, 64],
        offset: [0, 0, 0],
        mip: 0,
        lod: 0,
        mesh_dir: None,
    }
    .execute(&provider)
    .await
    .unwrap();

    let io = provider.memory("mem://seg");
    assert_eq!(io.list("mesh/").await.unwrap(), vec!["mesh/1:0:0-64_0-64_0-64"]);

    let fragment = io.get("mesh/1:0:0-64_0-64_0-64").await.unwrap().unwrap();
    let vertices = u32::from_le_bytes([fragment[0], fragment[1], fragment[2], fragment[3]]) as usize;
    assert!(vertices > 0);
    let index_bytes = fragment.len() - 4 - vertices * 12;
    assert_eq!(index_bytes % 12, 0);
}

async fn write_manifests(layer: &str, lod: u32) {
    for prefix in 0..10 {
        MeshManifestTask {
            layer_path: layer.to_string(),
            prefix,
            lod,
            mesh_dir: None,
        }
        .execute(&UrlStorageProvider)
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn test_manifests_group_by_label_and_lod() {
    let temp_dir = TempDir::new().unwrap();
    let layer = temp_dir.path().to_str().unwrap().to_string();
    let io: Arc<dyn IOManager> = Arc::new(FileSystemIOManager::new(temp_dir.path()));

    for id in 0..100u64 {
        for lod in 0..2 {
            for frag in 0..5 {
                io.put(&format!("mesh/{}:{}:{}", id, lod, frag), b"").await.unwrap();
            }
        }
    }

    write_manifests(&layer, 0).await;
    for id in 0..100u64 {
        let bytes = io.get(&format!("mesh/{}:0", id)).await.unwrap().unwrap();
        let manifest: Manifest = serde_json::from_slice(&bytes).unwrap();
        let expected: Vec<String> = (0..5).map(|frag| format!("{}:0:{}", id, frag)).collect();
        assert_eq!(manifest.fragments, expected);
        assert!(!io.exists(&format!("mesh/{}:1", id)).await.unwrap());
    }

    let bytes = io.get("mesh/50:0").await.unwrap().unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(
        json,
        serde_json::json!({"fragments": ["50:0:0", "50:0:1", "50:0:2", "50:0:3", "50:0:4"]})
    );

    write_manifests(&layer, 1).await;
    for id in 0..100u64 {
        let bytes = io.get(&format!("mesh/{}:1", id)).await.unwrap().unwrap();
        let manifest: Manifest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(manifest.fragments.len(), 5);
        assert!(manifest.fragments.iter().all(|f| f.starts_with(&format!("{}:1:", id))));
    }
}
