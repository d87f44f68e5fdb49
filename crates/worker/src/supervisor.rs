//! ComfyUI process supervision.
//!
//! [`ProcessSupervisor::ensure_running`] is the readiness gate: it
//! returns only once `GET /system_stats` answers 200, starting the
//! ComfyUI child process first if nothing answers yet. The child is
//! tied to this process's lifetime and its output is relayed to the
//! log for as long as it runs.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use indus_comfyui::api::HealthProbe;
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::relay::LogRelay;

/// Default time allowed for ComfyUI to become healthy.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(300);

/// Default interval between readiness probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// How long shutdown waits for the log relay to drain.
const RELAY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How to start the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Added on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    /// `python main.py --listen <addr> --port <port> --disable-auto-launch`
    /// run from the ComfyUI directory with unbuffered output.
    pub fn comfyui(python: &str, comfyui_path: &Path, listen: &str, port: u16) -> Self {
        Self {
            program: python.to_string(),
            args: vec![
                "main.py".into(),
                "--listen".into(),
                listen.to_string(),
                "--port".into(),
                port.to_string(),
                "--disable-auto-launch".into(),
            ],
            working_dir: comfyui_path.to_path_buf(),
            env: vec![("PYTHONUNBUFFERED".into(), "1".into())],
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(&self.working_dir)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        die_with_parent(&mut command);
        command
    }
}

/// Have the kernel send SIGTERM to the child if the worker dies first.
#[cfg(target_os = "linux")]
fn die_with_parent(command: &mut Command) {
    // Safety: prctl is async-signal-safe and only affects the child
    // process it runs in.
    unsafe {
        command.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn die_with_parent(_command: &mut Command) {}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub startup_timeout: Duration,
    pub probe_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }
}

/// ComfyUI is answering health probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ready {
    /// Something was already serving the port; nothing was started.
    AlreadyRunning,
    /// The supervisor started the child and it became healthy.
    Started { pid: Option<u32>, elapsed: Duration },
}

#[derive(Debug, thiserror::Error)]
pub enum StartupFailure {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ComfyUI failed to start within {secs}s")]
    Timeout { secs: u64 },

    #[error("ComfyUI exited before becoming ready ({status})")]
    Exited { status: ExitStatus },
}

/// A running ComfyUI child and its log relay.
struct EngineProcess {
    child: Child,
    relay: LogRelay,
}

pub struct ProcessSupervisor {
    probe: Arc<dyn HealthProbe>,
    launch: LaunchSpec,
    config: SupervisorConfig,
    process: Option<EngineProcess>,
}

impl ProcessSupervisor {
    pub fn new(probe: Arc<dyn HealthProbe>, launch: LaunchSpec, config: SupervisorConfig) -> Self {
        Self {
            probe,
            launch,
            config,
            process: None,
        }
    }

    /// Whether this supervisor owns a child process.
    pub fn is_spawned(&self) -> bool {
        self.process.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.child.id())
    }

    /// Make sure ComfyUI is healthy, starting it if needed.
    ///
    /// A healthy first probe returns immediately without spawning. A
    /// child this supervisor already owns is never spawned twice.
    pub async fn ensure_running(&mut self) -> Result<Ready, StartupFailure> {
        if self.probe.probe().await.is_ok() {
            tracing::info!("ComfyUI already running");
            return Ok(Ready::AlreadyRunning);
        }

        if self.process.is_none() {
            self.process = Some(self.spawn()?);
        }

        self.wait_ready().await
    }

    /// Kill the child (if any) and give the relay a moment to drain.
    pub async fn shutdown(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };

        tracing::info!(pid = ?process.child.id(), "Stopping ComfyUI");
        if let Err(e) = process.child.kill().await {
            tracing::warn!(error = %e, "Failed to kill ComfyUI");
        }
        let lines = process.relay.drain(RELAY_DRAIN_TIMEOUT).await;
        tracing::debug!(lines, "ComfyUI log relay finished");
    }

    fn spawn(&self) -> Result<EngineProcess, StartupFailure> {
        tracing::info!(
            program = %self.launch.program,
            args = ?self.launch.args,
            cwd = %self.launch.working_dir.display(),
            "Starting ComfyUI",
        );

        let mut child = self
            .launch
            .command()
            .spawn()
            .map_err(|source| StartupFailure::Spawn {
                program: self.launch.program.clone(),
                source,
            })?;

        let relay = LogRelay::attach(&mut child);
        tracing::info!(pid = ?child.id(), "ComfyUI process spawned");
        Ok(EngineProcess { child, relay })
    }

    /// Probe until healthy, the child exits, or the deadline passes.
    async fn wait_ready(&mut self) -> Result<Ready, StartupFailure> {
        let started = Instant::now();
        let deadline = started + self.config.startup_timeout;

        while Instant::now() < deadline {
            if self.probe.probe().await.is_ok() {
                let elapsed = started.elapsed();
                tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "ComfyUI is ready");
                return Ok(Ready::Started {
                    pid: self.pid(),
                    elapsed,
                });
            }

            if let Some(status) = self.exited() {
                tracing::error!(%status, "ComfyUI exited during startup");
                if let Some(process) = self.process.take() {
                    process.relay.drain(RELAY_DRAIN_TIMEOUT).await;
                }
                return Err(StartupFailure::Exited { status });
            }

            tokio::time::sleep(self.config.probe_interval).await;
        }

        let secs = self.config.startup_timeout.as_secs();
        tracing::error!(timeout_secs = secs, "ComfyUI failed to start in time");
        Err(StartupFailure::Timeout { secs })
    }

    fn exited(&mut self) -> Option<ExitStatus> {
        let process = self.process.as_mut()?;
        match process.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to poll ComfyUI process status");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use indus_comfyui::api::ComfyUIApiError;

    use super::*;

    /// Healthy from the `healthy_from`-th probe on (1-based).
    struct CountingProbe {
        calls: AtomicUsize,
        healthy_from: usize,
    }

    impl CountingProbe {
        fn new(healthy_from: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                healthy_from,
            })
        }
    }

    #[async_trait]
    impl HealthProbe for CountingProbe {
        async fn probe(&self) -> Result<(), ComfyUIApiError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.healthy_from {
                Ok(())
            } else {
                Err(ComfyUIApiError::ApiError {
                    status: 503,
                    body: "starting".into(),
                })
            }
        }
    }

    fn fast() -> SupervisorConfig {
        SupervisorConfig {
            startup_timeout: Duration::from_secs(10),
            probe_interval: Duration::from_millis(10),
        }
    }

    fn shell(script: &str) -> LaunchSpec {
        LaunchSpec {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            working_dir: std::env::temp_dir(),
            env: vec![("PYTHONUNBUFFERED".into(), "1".into())],
        }
    }

    #[test]
    fn comfyui_launch_spec() {
        let spec = LaunchSpec::comfyui("python3", Path::new("/comfyui"), "0.0.0.0", 8188);
        assert_eq!(spec.program, "python3");
        assert_eq!(
            spec.args,
            ["main.py", "--listen", "0.0.0.0", "--port", "8188", "--disable-auto-launch"]
        );
        assert_eq!(spec.working_dir, PathBuf::from("/comfyui"));
        assert_eq!(spec.env, vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())]);
    }

    #[tokio::test]
    async fn healthy_engine_is_not_spawned() {
        let probe = CountingProbe::new(1);
        let launch = LaunchSpec::comfyui("/nonexistent/python", Path::new("/nonexistent"), "0.0.0.0", 8188);
        let mut supervisor = ProcessSupervisor::new(probe.clone(), launch, fast());

        assert_eq!(supervisor.ensure_running().await.unwrap(), Ready::AlreadyRunning);
        assert!(!supervisor.is_spawned());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn spawns_once_and_waits_for_health() {
        let probe = CountingProbe::new(4);
        let mut supervisor = ProcessSupervisor::new(probe.clone(), shell("echo booting; sleep 30"), fast());

        let ready = supervisor.ensure_running().await.unwrap();
        assert_matches!(ready, Ready::Started { pid: Some(_), .. });
        let pid = supervisor.pid();

        // Second call: healthy on the first probe, same child.
        assert_eq!(supervisor.ensure_running().await.unwrap(), Ready::AlreadyRunning);
        assert_eq!(supervisor.pid(), pid);

        supervisor.shutdown().await;
        assert!(!supervisor.is_spawned());
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let probe = CountingProbe::new(usize::MAX);
        let launch = LaunchSpec::comfyui("/nonexistent/python", Path::new("/"), "0.0.0.0", 8188);
        let mut supervisor = ProcessSupervisor::new(probe, launch, fast());

        let err = supervisor.ensure_running().await.unwrap_err();
        assert_matches!(err, StartupFailure::Spawn { .. });
    }

    #[tokio::test]
    async fn early_exit_fails_fast() {
        let probe = CountingProbe::new(usize::MAX);
        let mut supervisor = ProcessSupervisor::new(probe, shell("echo 'import error' >&2; exit 3"), fast());

        let err = supervisor.ensure_running().await.unwrap_err();
        assert_matches!(err, StartupFailure::Exited { status } if status.code() == Some(3));
        assert!(!supervisor.is_spawned());
    }

    #[tokio::test]
    async fn never_healthy_times_out() {
        let probe = CountingProbe::new(usize::MAX);
        let config = SupervisorConfig {
            startup_timeout: Duration::from_millis(200),
            probe_interval: Duration::from_millis(20),
        };
        let mut supervisor = ProcessSupervisor::new(probe.clone(), shell("sleep 30"), config);

        let err = supervisor.ensure_running().await.unwrap_err();
        assert_matches!(err, StartupFailure::Timeout { .. });
        assert!(probe.calls.load(Ordering::SeqCst) > 2);
        supervisor.shutdown().await;
    }
}
