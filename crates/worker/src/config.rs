use std::path::PathBuf;
use std::time::Duration;

use indus_comfyui::tracker::TrackerConfig;

use crate::supervisor::{LaunchSpec, SupervisorConfig};

/// Worker configuration loaded from environment variables.
///
/// Built once in `main` and handed to each component; nothing reads the
/// environment after startup.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// ComfyUI install directory (child working dir, holds `models/`).
    pub comfyui_path: PathBuf,
    /// Host the worker uses to reach ComfyUI.
    pub comfyui_host: String,
    /// ComfyUI HTTP port.
    pub comfyui_port: u16,
    /// Address passed to ComfyUI's `--listen`.
    pub comfyui_listen: String,
    /// Interpreter used to run ComfyUI's `main.py`.
    pub python: String,
    /// Model root on the shared network volume.
    pub volume_models: PathBuf,
    /// Optional JSON list of remote model files to download.
    pub model_manifest: Option<PathBuf>,
    pub startup_timeout: Duration,
    pub execution_timeout: Duration,
    pub poll_interval: Duration,
    pub cancel_on_timeout: bool,
    /// Local job file; jobs are read from stdin when unset.
    pub job_input: Option<PathBuf>,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got '{value}'")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            comfyui_path: PathBuf::from("/comfyui"),
            comfyui_host: "127.0.0.1".into(),
            comfyui_port: 8188,
            comfyui_listen: "0.0.0.0".into(),
            python: "python3".into(),
            volume_models: PathBuf::from("/runpod-volume/ComfyUI/models"),
            model_manifest: None,
            startup_timeout: Duration::from_secs(300),
            execution_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            cancel_on_timeout: false,
            job_input: None,
            log_format: LogFormat::Text,
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default                          |
    /// |--------------------------|----------------------------------|
    /// | `COMFYUI_PATH`           | `/comfyui`                       |
    /// | `COMFYUI_HOST`           | `127.0.0.1`                      |
    /// | `COMFYUI_PORT`           | `8188`                           |
    /// | `COMFYUI_LISTEN`         | `0.0.0.0`                        |
    /// | `COMFYUI_PYTHON`         | `python3`                        |
    /// | `VOLUME_MODELS`          | `/runpod-volume/ComfyUI/models`  |
    /// | `MODEL_MANIFEST`         | unset                            |
    /// | `STARTUP_TIMEOUT_SECS`   | `300`                            |
    /// | `EXECUTION_TIMEOUT_SECS` | `300`                            |
    /// | `POLL_INTERVAL_SECS`     | `2`                              |
    /// | `CANCEL_ON_TIMEOUT`      | `false`                          |
    /// | `JOB_INPUT`              | unset (stdin)                    |
    /// | `LOG_FORMAT`             | `text`                           |
    ///
    /// `*_SECS` values must lie between 1 and 604800 (one week).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Ok(Self {
            comfyui_path: var("COMFYUI_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.comfyui_path),
            comfyui_host: var("COMFYUI_HOST").unwrap_or(defaults.comfyui_host),
            comfyui_port: match var("COMFYUI_PORT") {
                Some(v) => parse_number("COMFYUI_PORT", &v)?,
                None => defaults.comfyui_port,
            },
            comfyui_listen: var("COMFYUI_LISTEN").unwrap_or(defaults.comfyui_listen),
            python: var("COMFYUI_PYTHON").unwrap_or(defaults.python),
            volume_models: var("VOLUME_MODELS")
                .map(PathBuf::from)
                .unwrap_or(defaults.volume_models),
            model_manifest: var("MODEL_MANIFEST").map(PathBuf::from),
            startup_timeout: seconds(var("STARTUP_TIMEOUT_SECS"), "STARTUP_TIMEOUT_SECS", defaults.startup_timeout)?,
            execution_timeout: seconds(
                var("EXECUTION_TIMEOUT_SECS"),
                "EXECUTION_TIMEOUT_SECS",
                defaults.execution_timeout,
            )?,
            poll_interval: seconds(var("POLL_INTERVAL_SECS"), "POLL_INTERVAL_SECS", defaults.poll_interval)?,
            cancel_on_timeout: match var("CANCEL_ON_TIMEOUT") {
                Some(v) => parse_bool("CANCEL_ON_TIMEOUT", &v)?,
                None => defaults.cancel_on_timeout,
            },
            job_input: var("JOB_INPUT").map(PathBuf::from),
            log_format: match var("LOG_FORMAT").as_deref().map(str::to_ascii_lowercase).as_deref() {
                None | Some("text") => LogFormat::Text,
                Some("json") => LogFormat::Json,
                Some(other) => {
                    return Err(ConfigError::Invalid {
                        name: "LOG_FORMAT",
                        expected: "`text` or `json`",
                        value: other.to_string(),
                    })
                }
            },
        })
    }

    /// Base HTTP URL of the local ComfyUI server.
    pub fn api_url(&self) -> String {
        format!("http://{}:{}", self.comfyui_host, self.comfyui_port)
    }

    /// Local model directory ComfyUI loads weights from.
    pub fn models_dir(&self) -> PathBuf {
        self.comfyui_path.join("models")
    }

    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec::comfyui(
            &self.python,
            &self.comfyui_path,
            &self.comfyui_listen,
            self.comfyui_port,
        )
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            startup_timeout: self.startup_timeout,
            probe_interval: self.poll_interval,
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            poll_interval: self.poll_interval,
            timeout: self.execution_timeout,
            cancel_on_timeout: self.cancel_on_timeout,
        }
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        expected: "a non-negative integer",
        value: value.to_string(),
    })
}

/// Upper bound for every `*_SECS` variable (one week).
const MAX_SECONDS: u64 = 7 * 24 * 60 * 60;

fn seconds(
    value: Option<String>,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let Some(v) = value else {
        return Ok(default);
    };
    match v.trim().parse::<u64>() {
        Ok(secs) if (1..=MAX_SECONDS).contains(&secs) => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::Invalid {
            name,
            expected: "a number of seconds between 1 and 604800",
            value: v,
        }),
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            expected: "a boolean",
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_match_serverless_layout() {
        let config = load(&[]).unwrap();
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.api_url(), "http://127.0.0.1:8188");
        assert_eq!(config.models_dir(), PathBuf::from("/comfyui/models"));
        assert_eq!(config.tracker_config().timeout, Duration::from_secs(300));
        assert_eq!(config.supervisor_config().probe_interval, Duration::from_secs(2));
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("COMFYUI_PATH", "/opt/comfy"),
            ("COMFYUI_PORT", "8288"),
            ("EXECUTION_TIMEOUT_SECS", "60"),
            ("CANCEL_ON_TIMEOUT", "true"),
            ("LOG_FORMAT", "JSON"),
            ("JOB_INPUT", "test_input.json"),
        ])
        .unwrap();

        assert_eq!(config.api_url(), "http://127.0.0.1:8288");
        assert_eq!(config.models_dir(), PathBuf::from("/opt/comfy/models"));
        assert_eq!(config.execution_timeout, Duration::from_secs(60));
        assert!(config.tracker_config().cancel_on_timeout);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.job_input, Some(PathBuf::from("test_input.json")));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = load(&[("COMFYUI_PORT", "  "), ("MODEL_MANIFEST", "")]).unwrap();
        assert_eq!(config.comfyui_port, 8188);
        assert_eq!(config.model_manifest, None);
    }

    #[test]
    fn invalid_port_is_rejected() {
        let err = load(&[("COMFYUI_PORT", "eighty")]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "COMFYUI_PORT must be a non-negative integer, got 'eighty'"
        );
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let err = load(&[("POLL_INTERVAL_SECS", "0")]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "POLL_INTERVAL_SECS must be a number of seconds between 1 and 604800, got '0'"
        );
    }

    #[test]
    fn oversized_timeouts_are_rejected() {
        let huge = u64::MAX.to_string();
        assert!(load(&[("EXECUTION_TIMEOUT_SECS", huge.as_str())]).is_err());
        assert!(load(&[("STARTUP_TIMEOUT_SECS", "604801")]).is_err());

        let config = load(&[("STARTUP_TIMEOUT_SECS", "604800")]).unwrap();
        assert_eq!(config.startup_timeout, Duration::from_secs(MAX_SECONDS));
    }

    #[test]
    fn invalid_bool_is_rejected() {
        assert!(load(&[("CANCEL_ON_TIMEOUT", "maybe")]).is_err());
    }

    #[test]
    fn launch_spec_targets_configured_port() {
        let spec = load(&[("COMFYUI_PORT", "9000")]).unwrap().launch_spec();
        assert_eq!(spec.working_dir, PathBuf::from("/comfyui"));
        assert!(spec.args.windows(2).any(|w| w == ["--port", "9000"]));
    }
}
