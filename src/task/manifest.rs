use super::mesh::DEFAULT_MESH_DIR;
use crate::error::{PipelineError, Result};
use crate::io::{IOManager, StorageProvider};
use crate::metadata::INFO_KEY;
use crate::utils::manifest_key;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Manifest object listing the fragments of one `(label, lod)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub fragments: Vec<String>,
}

/// Group stored fragments whose label starts with `prefix` into manifests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshManifestTask {
    pub layer_path: String,
    pub prefix: u64,
    pub lod: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_dir: Option<String>,
}

/// Only the mesh directory matters here, so the layer `info` is read loosely
#[derive(Deserialize)]
struct MeshDirectory {
    #[serde(default)]
    mesh: Option<String>,
}

async fn mesh_dir_of(io: &dyn IOManager) -> Result<String> {
    let dir = match io.get(INFO_KEY).await? {
        Some(bytes) => serde_json::from_slice::<MeshDirectory>(&bytes)?.mesh,
        None => None,
    };
    Ok(dir.unwrap_or_else(|| DEFAULT_MESH_DIR.to_string()))
}

/// `(label, lod)` of a fragment name `"{label}:{lod}:{bbox}"`
fn parse_fragment(name: &str) -> Option<(u64, u32)> {
    let parts: Vec<&str> = name.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    Some((parts[0].parse().ok()?, parts[1].parse().ok()?))
}

impl MeshManifestTask {
    pub async fn execute(&self, provider: &dyn StorageProvider) -> Result<()> {
        let io = provider.open(&self.layer_path)?;
        let mesh_dir = match &self.mesh_dir {
            Some(dir) => dir.clone(),
            None => mesh_dir_of(io.as_ref()).await?,
        };

        let dir_prefix = format!("{}/", mesh_dir);
        let keys = io.list(&format!("{}{}", dir_prefix, self.prefix)).await?;

        let mut groups: BTreeMap<(u64, u32), Vec<String>> = BTreeMap::new();
        for key in keys {
            let name = match key.strip_prefix(&dir_prefix) {
                Some(name) => name,
                None => continue,
            };
            match parse_fragment(name) {
                Some((label, lod)) if lod == self.lod => {
                    groups.entry((label, lod)).or_default().push(name.to_string());
                }
                Some(_) => {}
                None => {
                    if name.split(':').count() == 3 {
                        warn!(key = %key, "skipping malformed fragment name");
                    }
                }
            }
        }

        debug!(prefix = self.prefix, lod = self.lod, manifests = groups.len(), "writing manifests");
        for ((label, lod), mut fragments) in groups {
            if let Some(stray) = fragments
                .iter()
                .find(|name| parse_fragment(name).map(|(_, l)| l) != Some(lod))
            {
                return Err(PipelineError::ManifestGrouping(format!(
                    "Fragment {} grouped under {}:{}",
                    stray, label, lod
                )));
            }
            fragments.sort();
            let manifest = serde_json::to_vec(&Manifest { fragments })?;
            io.put(&manifest_key(&mesh_dir, label, lod), &manifest).await?;
        }
        Ok(())
    }
}
