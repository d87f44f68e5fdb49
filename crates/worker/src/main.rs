//! `indus-worker` -- serverless ComfyUI worker.
//!
//! Links model directories from the network volume, starts ComfyUI,
//! blocks until it answers `/system_stats`, then serves jobs. See
//! [`WorkerConfig::from_env`] for the environment variables it reads.

use std::sync::Arc;

use indus_comfyui::api::ComfyUIApi;
use indus_worker::assets::AssetPlan;
use indus_worker::bootstrap::{Bootstrap, BootstrapError};
use indus_worker::config::{LogFormat, WorkerConfig};
use indus_worker::handler::JobHandler;
use indus_worker::listener::{JobListener, LocalListener};
use indus_worker::supervisor::ProcessSupervisor;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env();
    init_tracing(config.as_ref().map_or(LogFormat::Text, |c| c.log_format));
    let config = config.unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    tracing::info!(
        comfyui_path = %config.comfyui_path.display(),
        api_url = %config.api_url(),
        volume = %config.volume_models.display(),
        "=== Indus ComfyUI serverless worker ===",
    );

    // --- Assets ---
    let mut assets = AssetPlan::volume_links(&config.volume_models, &config.models_dir());
    if let Some(manifest) = &config.model_manifest {
        assets = assets
            .with_manifest(manifest, &config.comfyui_path)
            .await
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "FATAL: cannot load model manifest");
                std::process::exit(1);
            });
    }

    // --- Engine ---
    let api = Arc::new(ComfyUIApi::new(config.api_url()));
    let supervisor = ProcessSupervisor::new(api.clone(), config.launch_spec(), config.supervisor_config());
    let handler = JobHandler::new(api, config.tracker_config());

    // --- Shutdown ---
    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            ctrl_c_cancel.cancel();
        }
    });

    // --- Jobs ---
    let mut listener: Box<dyn JobListener> = match &config.job_input {
        Some(path) => match LocalListener::open_file(path, cancel.clone()).await {
            Ok(listener) => Box::new(listener),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "FATAL: cannot open job input");
                std::process::exit(1);
            }
        },
        None => Box::new(LocalListener::stdin(cancel.clone())),
    };

    let outcome = Bootstrap::new(assets, supervisor, cancel)
        .run(&handler, listener.as_mut())
        .await;
    match outcome {
        Ok(_) => {}
        Err(e @ BootstrapError::Cancelled { .. }) => {
            tracing::info!(reason = %e, "Worker interrupted");
            std::process::exit(130);
        }
        Err(e) => {
            tracing::error!(error = %e, "FATAL: worker stopped");
            std::process::exit(1);
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "indus_worker=info,indus_comfyui=info,comfyui=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}
