//! chunkpipe - task pipeline for chunked multi-resolution volumes
//!
//! Volumes are stored as a JSON `info` document plus one object per chunk
//! per scale, in the precomputed layout. Work is split into independent,
//! serializable tasks that each read and write whole chunks.
//!
//! # Features
//!
//! - Chunk store with explicit metadata commit/refresh and a missing-data policy
//! - Downsampling pyramids (averaging for intensities, mode for labels)
//! - Watershed segmentation of affinity graphs
//! - Mesh fragments and manifests, affinity quantization, relabeling
//! - In-process and lease-based task queues
//! - Filesystem and in-memory backends (implement `IOManager` for object stores)
//!
//! # Example
//!
//! ```rust,ignore
//! use chunkpipe::{create_downsampling_tasks, MockTaskQueue, UrlStorageProvider};
//! use std::sync::Arc;
//!
//! # async fn example() -> chunkpipe::Result<()> {
//! let provider = Arc::new(UrlStorageProvider);
//! let queue = MockTaskQueue::new(provider.clone());
//! create_downsampling_tasks(&queue, provider.as_ref(), "file:///data/image", 0, 3, [2, 2, 1], false).await?;
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod compression;
pub mod config;
pub mod downsample;
pub mod error;
pub mod ingest;
pub mod io;
pub mod layout;
pub mod metadata;
pub mod pyramid;
pub mod queue;
pub mod task;
pub mod types;
pub mod utils;
pub mod watershed;

// Re-exports
pub use access::{ChunkedVolume, VolumeStats};
pub use compression::CompressionMethod;
pub use config::{PipelineConfig, PyramidConfig, QueueConfig, QueueKind, WorkerConfig};
pub use downsample::{downsample_segmentation, downsample_with_averaging, DownsampleMethod};
pub use error::{PipelineError, Result};
pub use ingest::{create_info_from_build, create_ingest_tasks, upload_build_chunks, BuildChunk};
pub use io::{
    IOManager, MemoryStorageProvider, StorageBackend, StorageProvider, UrlStorageProvider,
};
pub use layout::ChunkGrid;
pub use metadata::{Scale, VolumeInfo};
pub use pyramid::{create_downsample_scales, create_downsampling_tasks, create_pyramid_tasks};
pub use queue::{
    create_task_queue, LeasedTask, LeasedTaskQueue, MockTaskQueue, TaskQueue, Worker, WorkerStats,
};
pub use task::Task;
pub use types::{Bbox, DataType, Element, Label, LayerType};
pub use watershed::{watershed, WatershedParams};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install a `tracing` fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Does nothing if a global subscriber is already set.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
