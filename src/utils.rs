//! Utility functions: object key conventions and formatting helpers

use crate::types::Bbox;

/// Object key of a chunk: `"{scale-key}/{x0}-{x1}_{y0}-{y1}_{z0}-{z1}"`
pub fn chunk_key(scale_key: &str, bbox: &Bbox) -> String {
    format!("{}/{}", scale_key, bbox)
}

/// Name of a mesh fragment inside the mesh directory: `"{label}:{lod}:{bbox}"`
pub fn fragment_name(label: u64, lod: u32, bbox: &Bbox) -> String {
    format!("{}:{}:{}", label, lod, bbox)
}

/// Object key of a mesh manifest: `"{mesh_dir}/{label}:{lod}"`
pub fn manifest_key(mesh_dir: &str, label: u64, lod: u32) -> String {
    format!("{}/{}:{}", mesh_dir, label, lod)
}

/// Directory holding build chunks awaiting ingest
pub const BUILD_DIR: &str = "build";

/// Object key of a build chunk
pub fn build_chunk_key(bbox: &Bbox) -> String {
    format!("{}/{}", BUILD_DIR, bbox)
}

/// Human-readable byte count, e.g. `1.50 KB`
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut size = bytes as f64 / 1024.0;
    let mut unit = 0;
    while size >= 1024.0 && unit + 1 < UNITS.len() {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}
