//! Startup sequence: assets, engine, then jobs.
//!
//! The listener is only served after [`ProcessSupervisor::ensure_running`]
//! has returned, so no job is accepted before ComfyUI answers health
//! probes. Asset and startup failures abort the worker.
//!
//! Every stage also races the shutdown token: a cancel during asset
//! setup, the readiness wait or an in-flight job stops the engine and
//! returns [`BootstrapError::Cancelled`].

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::assets::{AssetError, AssetPlan};
use crate::handler::HandleJob;
use crate::listener::{JobListener, ListenerError};
use crate::supervisor::{ProcessSupervisor, Ready, StartupFailure};

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("Model assets unavailable: {0}")]
    Assets(#[from] AssetError),

    #[error(transparent)]
    Startup(#[from] StartupFailure),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("Shutdown requested during {stage}")]
    Cancelled { stage: &'static str },
}

pub struct Bootstrap {
    assets: AssetPlan,
    supervisor: ProcessSupervisor,
    cancel: CancellationToken,
}

impl Bootstrap {
    pub fn new(assets: AssetPlan, supervisor: ProcessSupervisor, cancel: CancellationToken) -> Self {
        Self {
            assets,
            supervisor,
            cancel,
        }
    }

    /// Bring the engine up and serve jobs until the listener stops.
    ///
    /// The engine child (if this worker started it) is stopped on the
    /// way out, whether serving succeeded or not.
    pub async fn run<L>(mut self, handler: &dyn HandleJob, listener: &mut L) -> Result<u64, BootstrapError>
    where
        L: JobListener + ?Sized,
    {
        tracing::info!("Step 1: materializing model assets");
        let materialized = until_cancelled(&self.cancel, self.assets.materialize()).await;
        let report = match materialized {
            Some(report) => report?,
            None => return self.cancelled("asset setup").await,
        };
        tracing::debug!(operations = report.operations(), "Asset step finished");

        tracing::info!("Step 2: starting ComfyUI");
        let started = until_cancelled(&self.cancel, self.supervisor.ensure_running()).await;
        let ready = match started {
            Some(ready) => ready,
            None => return self.cancelled("engine startup").await,
        };
        match ready {
            Ok(Ready::AlreadyRunning) => {}
            Ok(Ready::Started { pid, elapsed }) => {
                tracing::info!(pid = ?pid, elapsed_ms = elapsed.as_millis() as u64, "ComfyUI started");
            }
            Err(e) => {
                self.supervisor.shutdown().await;
                return Err(e.into());
            }
        }

        tracing::info!("Step 3: ready, serving jobs");
        let serving = until_cancelled(&self.cancel, listener.serve(handler)).await;
        let served = match serving {
            Some(served) => served,
            None => return self.cancelled("job execution").await,
        };

        self.supervisor.shutdown().await;
        let handled = served?;
        tracing::info!(handled, "Worker finished");
        Ok(handled)
    }

    async fn cancelled(mut self, stage: &'static str) -> Result<u64, BootstrapError> {
        tracing::warn!(stage, "Shutdown requested, stopping ComfyUI");
        self.supervisor.shutdown().await;
        Err(BootstrapError::Cancelled { stage })
    }
}

/// Run `fut` unless `cancel` fires first.
///
/// `fut` is polled first, so work that completes on the same wake-up as
/// the cancel (a listener seeing the token itself) still reports its
/// result.
async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        output = fut => Some(output),
        _ = cancel.cancelled() => None,
    }
}
