//! Pyramid planning: append coarser scales to a layer and queue one
//! downsample task per output chunk.

use crate::access::ChunkedVolume;
use crate::compression::CompressionMethod;
use crate::config::PyramidConfig;
use crate::error::{PipelineError, Result};
use crate::io::StorageProvider;
use crate::queue::TaskQueue;
use crate::task::{DownsampleTask, Task};
use tracing::{debug, info};

/// Number of downsamples of `ds_shape` by `factor` that keep every
/// factored axis at least one chunk wide
pub fn num_downsamples(ds_shape: [usize; 3], chunk_size: [usize; 3], factor: [usize; 3]) -> usize {
    if factor.iter().all(|&f| f <= 1) {
        return 0;
    }
    let mut shape = ds_shape;
    let mut count = 0;
    loop {
        for i in 0..3 {
            if factor[i] > 1 {
                shape[i] /= factor[i];
            }
        }
        let fits = (0..3).all(|i| factor[i] <= 1 || shape[i] >= chunk_size[i].max(1));
        if !fits {
            return count;
        }
        count += 1;
    }
}

/// Append the scales reachable from `mip` and commit them.
///
/// Scales that already exist above `mip` are kept. Returns the number of
/// mips above `mip` the layer is planned to have.
pub async fn create_downsample_scales(
    volume: &ChunkedVolume,
    mip: usize,
    ds_shape: [usize; 3],
    factor: [usize; 3],
) -> Result<usize> {
    let chunk_size = volume.scale(mip)?.chunk_size()?;
    let count = num_downsamples(ds_shape, chunk_size, factor);
    if ensure_scales(volume, mip + count, factor, None)? > 0 {
        volume.commit_metadata().await?;
    }
    Ok(count)
}

/// Extend the local metadata up to `top_mip`, returning how many scales
/// were added. New scales inherit their source's compression unless
/// `compression` is given.
fn ensure_scales(
    volume: &ChunkedVolume,
    top_mip: usize,
    factor: [usize; 3],
    compression: Option<CompressionMethod>,
) -> Result<usize> {
    let mut added = 0;
    while volume.num_mips() <= top_mip {
        let source = volume.num_mips() - 1;
        let mut scale = volume.info().downsample_scale(source, factor)?;
        if let Some(compression) = compression {
            scale = scale.with_compression(compression);
        }
        let mip = volume.add_scale(scale)?;
        debug!(summary = %volume.stats(mip)?.summary(), "planned scale");
        added += 1;
    }
    Ok(added)
}

/// Plan and submit the tasks building mips `mip + 1 ..= mip + num_mips`.
///
/// Missing scales are appended with `factor` and committed before any task
/// is queued; existing scales keep their own factors. Tasks are submitted
/// mip by mip in ascending order. Returns the number of tasks submitted.
pub async fn create_downsampling_tasks(
    queue: &dyn TaskQueue,
    provider: &dyn StorageProvider,
    layer_path: &str,
    mip: usize,
    num_mips: usize,
    factor: [usize; 3],
    fill_missing: bool,
) -> Result<usize> {
    let volume = ChunkedVolume::open_url(provider, layer_path).await?;
    volume.scale(mip)?;
    if ensure_scales(&volume, mip + num_mips, factor, None)? > 0 {
        volume.commit_metadata().await?;
    }

    let info = volume.info();
    let mut submitted = 0;
    for target in mip + 1..=mip + num_mips {
        let implied = info.factor_between(target - 1, target)?;
        let mut target_factor = [1usize; 3];
        for i in 0..3 {
            let rounded = implied[i].round();
            if rounded < 1.0 || (implied[i] - rounded).abs() > 1e-6 {
                return Err(PipelineError::ScaleOrder(format!(
                    "Mip {} is not an integer downsample of mip {}: {:?}",
                    target,
                    target - 1,
                    implied
                )));
            }
            target_factor[i] = rounded as usize;
        }

        let chunks = info.grid(target)?.all_chunks();
        info!(mip = target, tasks = chunks.len(), factor = ?target_factor, "queueing downsample tasks");
        for chunk in chunks {
            let task = DownsampleTask {
                layer_path: layer_path.to_string(),
                mip: target,
                shape: chunk.size(),
                offset: chunk.min,
                factor: target_factor,
                fill_missing,
                method: None,
            };
            queue.insert(Task::Downsample(task)).await?;
            submitted += 1;
        }
    }
    Ok(submitted)
}

/// [`create_downsampling_tasks`] with factor, missing-data policy and
/// new-scale compression taken from `config`
pub async fn create_pyramid_tasks(
    queue: &dyn TaskQueue,
    provider: &dyn StorageProvider,
    layer_path: &str,
    mip: usize,
    num_mips: usize,
    config: &PyramidConfig,
) -> Result<usize> {
    let volume = ChunkedVolume::open_url(provider, layer_path).await?;
    volume.scale(mip)?;
    if ensure_scales(&volume, mip + num_mips, config.factor, Some(config.compression))? > 0 {
        volume.commit_metadata().await?;
    }
    create_downsampling_tasks(
        queue,
        provider,
        layer_path,
        mip,
        num_mips,
        config.factor,
        config.fill_missing,
    )
    .await
}
