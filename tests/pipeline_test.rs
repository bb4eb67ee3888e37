//! End-to-end pipeline tests against the filesystem and in-memory backends

use chunkpipe::io::FileSystemIOManager;
use chunkpipe::{
    create_downsample_scales, create_downsampling_tasks, create_info_from_build, create_ingest_tasks,
    downsample_segmentation, downsample_with_averaging, upload_build_chunks, Bbox, ChunkedVolume, DataType,
    IOManager, LayerType, MemoryStorageProvider, MockTaskQueue, PipelineError, Scale, StorageProvider, TaskQueue,
    UrlStorageProvider, VolumeInfo,
};
use chunkpipe::task::{
    create_quantized_affinity_info, encode_mapping, QuantizeAffinitiesTask, RelabelTask, Task, WatershedTask,
};
use ndarray::{s, Array4};
use std::sync::Arc;
use tempfile::TempDir;

fn noise(shape: (usize, usize, usize, usize)) -> Array4<u8> {
    Array4::from_shape_fn(shape, |(x, y, z, c)| {
        ((x * 7919 + y * 104_729 + z * 1_299_709 + c * 31) % 251) as u8
    })
}

async fn ingest(provider: &dyn StorageProvider, layer: &str, data: &Array4<u8>) -> ChunkedVolume {
    let io = provider.open(layer).unwrap();
    upload_build_chunks(io.as_ref(), data, [0, 0, 0], [64, 64, 64])
        .await
        .unwrap();
    create_info_from_build(io.as_ref(), LayerType::Image, [4.0, 4.0, 40.0], [64, 64, 64])
        .await
        .unwrap();

    for task in create_ingest_tasks(io.as_ref(), layer).await.unwrap() {
        task.execute(provider).await.unwrap();
    }
    ChunkedVolume::open(io).await.unwrap()
}

#[tokio::test]
async fn test_ingest_round_trip_and_averaging_pyramid() {
    let temp_dir = TempDir::new().unwrap();
    let layer = format!("file://{}", temp_dir.path().display());
    let provider = Arc::new(UrlStorageProvider);

    let data = noise((256, 256, 128, 1));
    let volume = ingest(provider.as_ref(), &layer, &data).await;

    let cutout = volume.read::<u8>(Bbox::new([0, 0, 0], [64, 64, 64]), 0).await.unwrap();
    assert_eq!(cutout, data.slice(s![0..64, 0..64, 0..64, ..]));

    let planned = create_downsample_scales(&volume, 0, [256, 256, 128], [2, 2, 1])
        .await
        .unwrap();
    assert_eq!(planned, 2);

    let queue = MockTaskQueue::new(provider.clone());
    create_downsampling_tasks(&queue, provider.as_ref(), &layer, 0, 2, [2, 2, 1], false)
        .await
        .unwrap();
    volume.refresh_metadata().await.unwrap();
    assert_eq!(volume.num_mips(), 3);

    let once = downsample_with_averaging(&data, [2, 2, 1]).unwrap();
    let twice = downsample_with_averaging(&once, [2, 2, 1]).unwrap();

    let mip1 = volume.read::<u8>(Bbox::new([0, 0, 0], [128, 128, 128]), 1).await.unwrap();
    assert_eq!(mip1, once);
    let probe = volume.read::<u8>(Bbox::new([10, 20, 30], [50, 60, 90]), 2).await.unwrap();
    assert_eq!(probe, twice.slice(s![10..50, 20..60, 30..90, ..]));
}

#[tokio::test]
async fn test_mode_pyramid_never_blends_labels() {
    let provider = Arc::new(MemoryStorageProvider::new());
    let scale = Scale::new([128, 128, 16], [1.0, 1.0, 1.0], [0, 0, 0], [32, 32, 16]);
    let info = VolumeInfo::new(LayerType::Segmentation, DataType::U32, 1, scale);
    let volume = ChunkedVolume::create(provider.open("mem://seg").unwrap(), info)
        .await
        .unwrap();

    let labels = Array4::from_shape_fn((128, 128, 16, 1), |(x, y, z, _)| {
        1000 + ((x / 3) * 17 + (y / 5) * 3 + z) as u32 % 9 * 1000
    });
    volume
        .write(Bbox::new([0, 0, 0], [128, 128, 16]), 0, &labels)
        .await
        .unwrap();

    let queue = MockTaskQueue::new(provider.clone());
    create_downsampling_tasks(&queue, provider.as_ref(), "mem://seg", 0, 2, [2, 2, 1], false)
        .await
        .unwrap();
    volume.refresh_metadata().await.unwrap();

    let once = downsample_segmentation(&labels, [2, 2, 1]).unwrap();
    let twice = downsample_segmentation(&once, [2, 2, 1]).unwrap();
    let mip2 = volume.read::<u32>(Bbox::new([0, 0, 0], [32, 32, 16]), 2).await.unwrap();
    assert_eq!(mip2, twice);
    assert!(mip2.iter().all(|v| v % 1000 == 0));
}

#[tokio::test]
async fn test_offset_pyramid_metadata() {
    let provider = MemoryStorageProvider::new();
    let scale = Scale::new([512, 512, 128], [4.0, 4.0, 40.0], [3, 7, 11], [64, 64, 64]);
    let info = VolumeInfo::new(LayerType::Image, DataType::U8, 1, scale);
    let volume = ChunkedVolume::create(provider.open("mem://img").unwrap(), info)
        .await
        .unwrap();

    let planned = create_downsample_scales(&volume, 0, [512, 512, 128], [2, 2, 1])
        .await
        .unwrap();
    assert_eq!(planned, 3);

    let reopened = ChunkedVolume::open_url(&provider, "mem://img").await.unwrap();
    let info = reopened.info();
    assert_eq!(info.voxel_offset(3).unwrap(), [0, 0, 11]);
    let sizes: Vec<[usize; 3]> = (0..4).map(|mip| info.volume_size(mip).unwrap()).collect();
    assert_eq!(sizes, vec![[512, 512, 128], [256, 256, 128], [128, 128, 128], [64, 64, 128]]);
}

#[tokio::test]
async fn test_offset_pyramid_data() {
    let provider = Arc::new(MemoryStorageProvider::new());
    let scale = Scale::new([128, 128, 64], [4.0, 4.0, 40.0], [3, 7, 11], [32, 32, 32]);
    let info = VolumeInfo::new(LayerType::Image, DataType::U8, 1, scale);
    let volume = ChunkedVolume::create(provider.open("mem://img").unwrap(), info)
        .await
        .unwrap();
    let data = noise((128, 128, 64, 1));
    volume
        .write(Bbox::from_shape([3, 7, 11], [128, 128, 64]), 0, &data)
        .await
        .unwrap();

    let queue = MockTaskQueue::new(provider.clone());
    create_downsampling_tasks(&queue, provider.as_ref(), "mem://img", 0, 1, [2, 2, 1], false)
        .await
        .unwrap();
    volume.refresh_metadata().await.unwrap();
    assert_eq!(volume.info().voxel_offset(1).unwrap(), [1, 3, 11]);

    let once = downsample_with_averaging(&data, [2, 2, 1]).unwrap();
    let cutout = volume.read::<u8>(Bbox::new([1, 3, 11], [33, 35, 75]), 1).await.unwrap();
    assert_eq!(cutout, once.slice(s![0..32, 0..32, 0..64, ..]));
}

#[tokio::test]
async fn test_pyramid_resumes_from_higher_mip() {
    let provider = Arc::new(MemoryStorageProvider::new());
    let scale = Scale::new([256, 256, 64], [1.0, 1.0, 1.0], [0, 0, 0], [32, 32, 32]);
    let info = VolumeInfo::new(LayerType::Image, DataType::U8, 1, scale);
    let volume = ChunkedVolume::create(provider.open("mem://img").unwrap(), info)
        .await
        .unwrap();
    let data = noise((256, 256, 64, 1));
    volume
        .write(Bbox::new([0, 0, 0], [256, 256, 64]), 0, &data)
        .await
        .unwrap();

    let queue = MockTaskQueue::new(provider.clone());
    create_downsampling_tasks(&queue, provider.as_ref(), "mem://img", 0, 1, [2, 2, 1], false)
        .await
        .unwrap();
    // Second run starts from mip 1, never reading mip 0
    create_downsampling_tasks(&queue, provider.as_ref(), "mem://img", 1, 2, [2, 2, 1], false)
        .await
        .unwrap();
    volume.refresh_metadata().await.unwrap();
    assert_eq!(volume.num_mips(), 4);

    let mut expected = data;
    for _ in 0..3 {
        expected = downsample_with_averaging(&expected, [2, 2, 1]).unwrap();
    }
    let mip3 = volume.read::<u8>(Bbox::new([0, 0, 0], [32, 32, 64]), 3).await.unwrap();
    assert_eq!(mip3.shape(), &[32, 32, 64, 1]);
    assert_eq!(mip3, expected);
}

#[tokio::test]
async fn test_quantized_affinities_build_their_own_pyramid() {
    let provider = Arc::new(MemoryStorageProvider::new());
    let scale = Scale::new([64, 64, 8], [4.0, 4.0, 40.0], [0, 0, 0], [32, 32, 8]);
    let info = VolumeInfo::new(LayerType::Affinities, DataType::F32, 3, scale);
    let affinities = ChunkedVolume::create(provider.open("mem://aff").unwrap(), info)
        .await
        .unwrap();
    let graph = Array4::from_shape_fn((64, 64, 8, 3), |(x, y, z, c)| ((x + 2 * y + 3 * z + c) % 11) as f32 / 10.0);
    affinities
        .write(Bbox::new([0, 0, 0], [64, 64, 8]), 0, &graph)
        .await
        .unwrap();

    let dest_info = create_quantized_affinity_info(&affinities.info(), [32, 32, 8]).unwrap();
    let dest = ChunkedVolume::create(provider.open("mem://aff-u8").unwrap(), dest_info)
        .await
        .unwrap();
    QuantizeAffinitiesTask {
        source_layer_path: "mem://aff".to_string(),
        dest_layer_path: "mem://aff-u8".to_string(),
        shape: [64, 64, 8],
        offset: [0, 0, 0],
        mip: 0,
    }
    .execute(provider.as_ref())
    .await
    .unwrap();

    let quantized = dest.read::<u8>(Bbox::new([0, 0, 0], [64, 64, 8]), 0).await.unwrap();
    let expected = graph
        .slice(s![.., .., .., 0..1])
        .mapv(|v| (v * 255.0).clamp(0.0, 255.0) as u8);
    assert_eq!(quantized, expected);

    let queue = MockTaskQueue::new(provider.clone());
    create_downsampling_tasks(&queue, provider.as_ref(), "mem://aff-u8", 0, 1, [2, 2, 1], false)
        .await
        .unwrap();
    dest.refresh_metadata().await.unwrap();
    // The source layer keeps its single scale
    affinities.refresh_metadata().await.unwrap();
    assert_eq!(affinities.num_mips(), 1);

    let mip1 = dest.read::<u8>(Bbox::new([0, 0, 0], [32, 32, 8]), 1).await.unwrap();
    assert_eq!(mip1, downsample_with_averaging(&quantized, [2, 2, 1]).unwrap());
}

#[tokio::test]
async fn test_missing_data_policy() {
    let provider = MemoryStorageProvider::new();
    let scale = Scale::new([64, 64, 64], [1.0, 1.0, 1.0], [0, 0, 0], [32, 32, 32]);
    let info = VolumeInfo::new(LayerType::Image, DataType::F32, 1, scale);
    let volume = ChunkedVolume::create(provider.open("mem://empty").unwrap(), info)
        .await
        .unwrap();
    let bbox = Bbox::new([0, 0, 0], [40, 40, 40]);

    let err = volume.read::<f32>(bbox, 0).await.unwrap_err();
    assert!(matches!(err, PipelineError::EmptyVolume { .. }));

    let volume = volume.with_fill_missing(true);
    let block = volume.read::<f32>(bbox, 0).await.unwrap();
    assert_eq!(block.shape(), &[40, 40, 40, 1]);
    assert_eq!(block.iter().filter(|&&v| v != 0.0).count(), 0);
}

#[tokio::test]
async fn test_downsample_before_ingest_fails_until_data_exists() {
    let provider = Arc::new(MemoryStorageProvider::new());
    let scale = Scale::new([64, 64, 8], [1.0, 1.0, 1.0], [0, 0, 0], [32, 32, 8]);
    let info = VolumeInfo::new(LayerType::Image, DataType::U8, 1, scale);
    ChunkedVolume::create(provider.open("mem://img").unwrap(), info)
        .await
        .unwrap();

    let queue = MockTaskQueue::new(provider.clone());
    let err = create_downsampling_tasks(&queue, provider.as_ref(), "mem://img", 0, 1, [2, 2, 1], false)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::EmptyVolume { .. }));
    assert!(!err.is_permanent());
}

async fn affinity_layer(provider: &MemoryStorageProvider) {
    let scale = Scale::new([32, 32, 16], [1.0, 1.0, 1.0], [0, 0, 0], [32, 32, 16]);
    let info = VolumeInfo::new(LayerType::Affinities, DataType::F32, 3, scale.clone());
    let volume = ChunkedVolume::create(provider.open("mem://aff").unwrap(), info)
        .await
        .unwrap();
    let graph = Array4::from_shape_fn((32, 32, 16, 3), |(x, y, z, c)| {
        let h = (x * 73_856_093) ^ (y * 19_349_663) ^ (z * 83_492_791) ^ (c * 2_654_435_761);
        (h % 10_007) as f32 / 10_006.0
    });
    volume
        .write(Bbox::new([0, 0, 0], [32, 32, 16]), 0, &graph)
        .await
        .unwrap();

    for name in ["mem://seg-a", "mem://seg-b"] {
        let info = VolumeInfo::new(LayerType::Segmentation, DataType::U64, 1, scale.clone());
        ChunkedVolume::create(provider.open(name).unwrap(), info)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_watershed_is_deterministic() {
    let provider = MemoryStorageProvider::new();
    affinity_layer(&provider).await;

    let task = |segmentation: &str| WatershedTask {
        chunk_position: Bbox::new([0, 0, 0], [32, 32, 16]).into(),
        crop_position: Bbox::new([0, 0, 0], [32, 32, 16]).into(),
        layer_path_affinities: "mem://aff".to_string(),
        layer_path_segmentation: segmentation.to_string(),
        high_threshold: 0.95,
        low_threshold: 0.2,
        merge_threshold: 0.7,
        merge_size: 30,
        dust_size: 5,
        mip: 0,
    };
    task("mem://seg-a").execute(&provider).await.unwrap();
    task("mem://seg-b").execute(&provider).await.unwrap();
    // A retry over existing output must not change it
    task("mem://seg-a").execute(&provider).await.unwrap();

    let key = "1_1_1/0-32_0-32_0-16";
    let a = provider.memory("mem://seg-a").get(key).await.unwrap().unwrap();
    let b = provider.memory("mem://seg-b").get(key).await.unwrap().unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_relabel_through_queue() {
    let provider = Arc::new(MemoryStorageProvider::new());
    let scale = Scale::new([8, 1, 1], [1.0, 1.0, 1.0], [0, 0, 0], [8, 1, 1]);
    let info = VolumeInfo::new(LayerType::Segmentation, DataType::U64, 1, scale);
    let source = ChunkedVolume::create(provider.open("mem://in").unwrap(), info.clone())
        .await
        .unwrap();
    let output = ChunkedVolume::create(provider.open("mem://out").unwrap(), info)
        .await
        .unwrap();

    let bbox = Bbox::new([0, 0, 0], [8, 1, 1]);
    let voxels = Array4::from_shape_vec((8, 1, 1, 1), (0u64..8).collect()).unwrap();
    source.write(bbox, 0, &voxels).await.unwrap();

    let mapping: Vec<u64> = vec![0, 0, 0, 0, 1, 1, 1, 1];
    provider
        .memory("mem://out")
        .put("relabel/mapping", &encode_mapping(&mapping))
        .await
        .unwrap();

    let queue = MockTaskQueue::new(provider.clone());
    queue
        .insert(Task::Relabel(RelabelTask {
            layer_in_path: "mem://in".to_string(),
            layer_out_path: "mem://out".to_string(),
            chunk_position: bbox.into(),
            mapping_path: "relabel/mapping".to_string(),
            mip: 0,
        }))
        .await
        .unwrap();

    let result = output.read::<u64>(bbox, 0).await.unwrap();
    assert_eq!(result.iter().copied().collect::<Vec<_>>(), mapping);
}

#[tokio::test]
async fn test_filesystem_layer_layout() {
    let temp_dir = TempDir::new().unwrap();
    let io: Arc<dyn IOManager> = Arc::new(FileSystemIOManager::new(temp_dir.path()));
    let scale = Scale::new([64, 64, 64], [1.0, 1.0, 1.0], [0, 0, 0], [64, 64, 64]);
    let info = VolumeInfo::new(LayerType::Image, DataType::U8, 1, scale);
    let volume = ChunkedVolume::create(Arc::clone(&io), info).await.unwrap();
    let data = noise((64, 64, 64, 1));
    volume.write(Bbox::new([0, 0, 0], [64, 64, 64]), 0, &data).await.unwrap();

    assert!(temp_dir.path().join("info").is_file());
    let stored = std::fs::read(temp_dir.path().join("1_1_1/0-64_0-64_0-64")).unwrap();
    assert_eq!(stored.len(), 64 * 64 * 64);
    // x fastest
    assert_eq!(stored[1], data[[1, 0, 0, 0]]);
    assert_eq!(stored[64], data[[0, 1, 0, 0]]);
}
