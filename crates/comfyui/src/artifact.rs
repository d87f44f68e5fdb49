//! Artifact download from ComfyUI's `/view` endpoint.
//!
//! Single attempt, no retry. Transport failures and engine-side
//! failures are reported as distinct [`FetchError`] variants.

use std::sync::Arc;

use bytes::Bytes;

use crate::api::{ComfyUIApiError, EngineApi};
use crate::history::OutputDescriptor;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// ComfyUI could not be reached or the body could not be read.
    #[error("Failed to download {filename}: {source}")]
    Unreachable {
        filename: String,
        #[source]
        source: reqwest::Error,
    },

    /// ComfyUI answered with a non-2xx status.
    #[error("ComfyUI could not serve {filename} ({status}): {body}")]
    Engine {
        filename: String,
        status: u16,
        body: String,
    },
}

pub struct ArtifactFetcher {
    api: Arc<dyn EngineApi>,
}

impl ArtifactFetcher {
    pub fn new(api: Arc<dyn EngineApi>) -> Self {
        Self { api }
    }

    /// Download the bytes of one produced artifact.
    pub async fn fetch(&self, descriptor: &OutputDescriptor) -> Result<Bytes, FetchError> {
        tracing::info!(
            filename = %descriptor.filename,
            subfolder = %descriptor.subfolder,
            kind = %descriptor.kind,
            "Downloading artifact",
        );

        let filename = descriptor.filename.clone();
        let data = self.api.view(descriptor).await.map_err(|e| match e {
            ComfyUIApiError::Request(source) => FetchError::Unreachable { filename, source },
            ComfyUIApiError::ApiError { status, body } => FetchError::Engine {
                filename,
                status,
                body,
            },
        })?;

        tracing::info!(filename = %descriptor.filename, bytes = data.len(), "Artifact downloaded");
        Ok(data)
    }
}
