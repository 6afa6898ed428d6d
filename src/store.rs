//! Content-addressed artifact store.
//!
//! One entry per [`CacheKey`]: the frozen [`JobManifest`] plus the PNG bytes
//! of every tile and viewport frame. Writing a key that already exists is a
//! no-op, so two racing jobs can both call `put` safely. The one exception
//! is a `Degraded` entry, which a later `Complete` manifest replaces.
//!
//! * [`MemoryStore`]: in-process map, used by tests and short-lived tools.
//! * [`FsStore`]: one directory per key under a root. Each entry is staged
//!   in a temporary directory next to its final location and renamed into
//!   place, so readers never observe a half-written entry.

use crate::cache::CacheKey;
use crate::error::StoreError;
use crate::job::JobState;
use crate::manifest::JobManifest;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

const MANIFEST_FILE: &str = "manifest.json";

/// Whether `incoming` may replace the stored `existing` manifest.
pub fn supersedes(existing: &JobManifest, incoming: &JobManifest) -> bool {
    existing.state == JobState::Degraded && incoming.state == JobState::Complete
}

/// Everything persisted for one job.
#[derive(Debug, Clone)]
pub struct ArtifactBundle {
    pub manifest: JobManifest,
    /// `(file name, png)` per tile.
    pub tiles: Vec<(String, Arc<Vec<u8>>)>,
    /// `(file name, png)` per viewport frame.
    pub screenshots: Vec<(String, Arc<Vec<u8>>)>,
}

impl ArtifactBundle {
    /// Collect the PNGs the manifest's frames and tiles still hold in memory.
    pub fn from_manifest(manifest: JobManifest) -> Self {
        let tiles = manifest
            .tiles
            .iter()
            .filter(|t| !t.png.is_empty())
            .map(|t| (format!("{}.png", t.tile_id()), Arc::clone(&t.png)))
            .collect();
        let screenshots = manifest
            .frames
            .iter()
            .filter(|f| !f.png.is_empty())
            .map(|f| (format!("frame_{:04}.png", f.index), Arc::clone(&f.png)))
            .collect();
        Self {
            manifest,
            tiles,
            screenshots,
        }
    }
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<JobManifest>, StoreError>;

    /// Persist `bundle` under `key`. Returns `false` when the key was already
    /// present and the stored entry was kept (see [`supersedes`]).
    async fn put(&self, key: &CacheKey, bundle: ArtifactBundle) -> Result<bool, StoreError>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<CacheKey, ArtifactBundle>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `put` calls that actually stored something.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Stored tile and frame file names for `key`.
    pub async fn files(&self, key: &CacheKey) -> Vec<String> {
        self.entries
            .read()
            .await
            .get(key)
            .map(|b| {
                b.tiles
                    .iter()
                    .chain(&b.screenshots)
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<JobManifest>, StoreError> {
        Ok(self.entries.read().await.get(key).map(|b| b.manifest.clone()))
    }

    async fn put(&self, key: &CacheKey, bundle: ArtifactBundle) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(key) {
            if !supersedes(&existing.manifest, &bundle.manifest) {
                debug!("Store already holds {}", key.short());
                return Ok(false);
            }
            info!("Replacing degraded entry for {}", key.short());
        }
        entries.insert(key.clone(), bundle);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

/// Directory-per-key store on the local file system.
///
/// ```text
/// <root>/<cache-key>/manifest.json
/// <root>/<cache-key>/tiles/tile_0000.png
/// <root>/<cache-key>/frames/frame_0000.png
/// ```
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    async fn write_files(dir: &Path, files: &[(String, Arc<Vec<u8>>)]) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(dir).await.map_err(io_err(dir))?;
        for (name, bytes) in files {
            let path = dir.join(name);
            tokio::fs::write(&path, bytes.as_slice())
                .await
                .map_err(io_err(&path))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for FsStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<JobManifest>, StoreError> {
        let path = self.entry_dir(key).join(MANIFEST_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    async fn put(&self, key: &CacheKey, bundle: ArtifactBundle) -> Result<bool, StoreError> {
        let final_dir = self.entry_dir(key);
        let replacing = match self.get(key).await? {
            Some(existing) if !supersedes(&existing, &bundle.manifest) => {
                debug!("Store already holds {}", key.short());
                return Ok(false);
            }
            Some(_) => true,
            None => false,
        };

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(io_err(&self.root))?;
        // Removed on drop if anything below fails.
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.root)
            .map_err(io_err(&self.root))?;

        Self::write_files(&staging.path().join("tiles"), &bundle.tiles).await?;
        Self::write_files(&staging.path().join("frames"), &bundle.screenshots).await?;
        let manifest_path = staging.path().join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(&bundle.manifest)?;
        tokio::fs::write(&manifest_path, json)
            .await
            .map_err(io_err(&manifest_path))?;

        // The old entry is parked next to the staging dir and deleted on drop.
        let retired = if replacing {
            let retired = tempfile::Builder::new()
                .prefix(".retired-")
                .tempdir_in(&self.root)
                .map_err(io_err(&self.root))?;
            tokio::fs::rename(&final_dir, retired.path().join("entry"))
                .await
                .map_err(io_err(&final_dir))?;
            info!("Replacing degraded entry for {}", key.short());
            Some(retired)
        } else {
            None
        };

        match tokio::fs::rename(staging.path(), &final_dir).await {
            Ok(()) => {
                info!(
                    "Stored {} ({} tiles, {} frames) at {}",
                    key.short(),
                    bundle.tiles.len(),
                    bundle.screenshots.len(),
                    final_dir.display()
                );
                Ok(true)
            }
            // Lost a race with another writer of the same key.
            Err(_) if final_dir.join(MANIFEST_FILE).exists() => Ok(false),
            Err(e) => {
                if let Some(retired) = &retired {
                    let _ = tokio::fs::rename(retired.path().join("entry"), &final_dir).await;
                }
                Err(io_err(&final_dir)(e))
            }
        }
    }
}
