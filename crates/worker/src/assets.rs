//! Model asset materialization.
//!
//! Makes model weights resolvable under ComfyUI's `models/` directory
//! before the engine starts, either by symlinking directories from the
//! shared network volume or by downloading individual files. Both are
//! idempotent: an asset that is already in place is left alone.

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Deserialize;
use tokio::io::AsyncWriteExt;

/// Model directories linked from the shared volume.
pub const MODEL_DIRS: &[&str] = &[
    "diffusion_models",
    "text_encoders",
    "vae",
    "loras",
    "clip",
    "unet",
    "controlnet",
    "checkpoints",
];

/// Where an asset comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetSource {
    /// Downloaded over HTTP(S).
    Remote { url: String },
    /// Symlinked from a directory on the shared volume.
    Volume { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelAsset {
    pub source: AssetSource,
    /// Local path ComfyUI expects the asset at.
    pub target: PathBuf,
}

/// One entry of the `MODEL_MANIFEST` JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    pub url: String,
    /// Absolute, or relative to the ComfyUI directory.
    pub target: PathBuf,
}

/// What a materialization pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    pub linked: usize,
    pub downloaded: usize,
    /// Already in place; nothing done.
    pub present: usize,
    /// Volume source absent; skipped.
    pub missing: usize,
}

impl MaterializeReport {
    /// Number of link or download operations performed.
    pub fn operations(&self) -> usize {
        self.linked + self.downloaded
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("Failed to read model manifest {path}: {detail}")]
    Manifest { path: PathBuf, detail: String },

    #[error("Failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> AssetError + '_ {
    move |source| AssetError::Io {
        path: path.to_path_buf(),
        source,
    }
}

enum Outcome {
    Linked,
    Downloaded,
    Present,
    Missing,
}

/// The set of assets to put in place at startup.
pub struct AssetPlan {
    assets: Vec<ModelAsset>,
    /// Volume root, checked once so an unmounted volume is reported clearly.
    volume_root: Option<PathBuf>,
    client: reqwest::Client,
}

impl AssetPlan {
    pub fn new(assets: Vec<ModelAsset>) -> Self {
        Self {
            assets,
            volume_root: None,
            client: reqwest::Client::new(),
        }
    }

    /// Links for every [`MODEL_DIRS`] entry from `volume_root` into
    /// `models_dir`.
    pub fn volume_links(volume_root: &Path, models_dir: &Path) -> Self {
        let assets = MODEL_DIRS
            .iter()
            .map(|dir| ModelAsset {
                source: AssetSource::Volume {
                    path: volume_root.join(dir),
                },
                target: models_dir.join(dir),
            })
            .collect();

        Self {
            volume_root: Some(volume_root.to_path_buf()),
            ..Self::new(assets)
        }
    }

    /// Append downloads listed in a manifest file. Relative targets are
    /// resolved against `base_dir`.
    pub async fn with_manifest(mut self, manifest: &Path, base_dir: &Path) -> Result<Self, AssetError> {
        let text = tokio::fs::read_to_string(manifest)
            .await
            .map_err(|e| AssetError::Manifest {
                path: manifest.to_path_buf(),
                detail: e.to_string(),
            })?;
        let entries: Vec<ManifestEntry> =
            serde_json::from_str(&text).map_err(|e| AssetError::Manifest {
                path: manifest.to_path_buf(),
                detail: e.to_string(),
            })?;

        self.assets.extend(entries.into_iter().map(|entry| ModelAsset {
            source: AssetSource::Remote { url: entry.url },
            target: base_dir.join(entry.target),
        }));
        Ok(self)
    }

    pub fn assets(&self) -> &[ModelAsset] {
        &self.assets
    }

    /// Put every asset in place. The first failure aborts the pass.
    pub async fn materialize(&self) -> Result<MaterializeReport, AssetError> {
        let mut report = MaterializeReport::default();

        let volume_mounted = match &self.volume_root {
            Some(root) => {
                let mounted = exists(root).await;
                if !mounted {
                    tracing::warn!(
                        volume = %root.display(),
                        "Volume not mounted; models must be in the container image",
                    );
                }
                mounted
            }
            None => true,
        };

        for asset in &self.assets {
            let outcome = match &asset.source {
                AssetSource::Volume { .. } if !volume_mounted => Outcome::Missing,
                AssetSource::Volume { path } => link_volume_dir(path, &asset.target).await?,
                AssetSource::Remote { url } => self.download(url, &asset.target).await?,
            };

            match outcome {
                Outcome::Linked => report.linked += 1,
                Outcome::Downloaded => report.downloaded += 1,
                Outcome::Present => report.present += 1,
                Outcome::Missing => report.missing += 1,
            }
        }

        tracing::info!(
            linked = report.linked,
            downloaded = report.downloaded,
            present = report.present,
            missing = report.missing,
            "Model assets ready",
        );
        Ok(report)
    }

    async fn download(&self, url: &str, target: &Path) -> Result<Outcome, AssetError> {
        if exists(target).await {
            tracing::info!(asset = %target.display(), "Model already present");
            return Ok(Outcome::Present);
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error(parent))?;
        }

        let started = Instant::now();
        let partial = partial_path(target);
        tracing::info!(url, asset = %target.display(), "Downloading model");

        let written = match self.fetch_to(url, &partial).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };
        tokio::fs::rename(&partial, target)
            .await
            .map_err(io_error(target))?;

        tracing::info!(
            asset = %target.display(),
            bytes = written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Model downloaded",
        );
        Ok(Outcome::Downloaded)
    }

    async fn fetch_to(&self, url: &str, path: &Path) -> Result<u64, AssetError> {
        let download_error = |source: reqwest::Error| AssetError::Download {
            url: url.to_string(),
            source,
        };

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(download_error)?;

        let mut file = tokio::fs::File::create(path).await.map_err(io_error(path))?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(download_error)? {
            file.write_all(&chunk).await.map_err(io_error(path))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_error(path))?;
        Ok(written)
    }
}

/// Link `target` to the volume directory `source`.
///
/// An existing link to `source` is kept; a link elsewhere is replaced;
/// a real file or directory is renamed aside to `.bak` first.
async fn link_volume_dir(source: &Path, target: &Path) -> Result<Outcome, AssetError> {
    if !exists(source).await {
        tracing::info!(source = %source.display(), "Volume dir not found");
        return Ok(Outcome::Missing);
    }

    match tokio::fs::symlink_metadata(target).await {
        Ok(meta) if meta.file_type().is_symlink() => {
            let current = tokio::fs::read_link(target).await.map_err(io_error(target))?;
            if current == source {
                return Ok(Outcome::Present);
            }
            tokio::fs::remove_file(target).await.map_err(io_error(target))?;
        }
        Ok(_) => {
            let backup = backup_path(target).await;
            tokio::fs::rename(target, &backup)
                .await
                .map_err(io_error(target))?;
            tracing::info!(
                asset = %target.display(),
                backup = %backup.display(),
                "Moved existing model dir aside",
            );
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(io_error(parent))?;
            }
        }
        Err(e) => return Err(io_error(target)(e)),
    }

    tokio::fs::symlink(source, target)
        .await
        .map_err(io_error(target))?;
    tracing::info!(asset = %target.display(), source = %source.display(), "Linked model dir");
    Ok(Outcome::Linked)
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// `<path>.bak`, or `<path>.bak.N` for the first free N.
async fn backup_path(path: &Path) -> PathBuf {
    let candidate = suffixed(path, ".bak");
    if tokio::fs::symlink_metadata(&candidate).await.is_err() {
        return candidate;
    }
    let mut n = 1;
    loop {
        let candidate = suffixed(path, &format!(".bak.{n}"));
        if tokio::fs::symlink_metadata(&candidate).await.is_err() {
            return candidate;
        }
        n += 1;
    }
}

fn partial_path(path: &Path) -> PathBuf {
    suffixed(path, ".part")
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
