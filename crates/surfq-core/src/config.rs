//! Configuration parsing and validation.
//!
//! Settings are read from a TOML file with three sections:
//!
//! ```toml
//! [orchestrator]
//! concurrency_limit = 1
//! queue_depth_limit = 20
//!
//! [worker]
//! program = "docker"
//! output_root = "/var/lib/surfq/subjects"
//!
//! [store]
//! path = "/var/lib/surfq/jobs.json"
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

impl Settings {
    /// Load settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.orchestrator.validate()?;
        self.worker.validate()
    }
}

/// Limits, loop intervals and reaper thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum number of RUNNING jobs.
    pub concurrency_limit: usize,

    /// Maximum number of PENDING jobs; further submissions are rejected.
    pub queue_depth_limit: usize,

    pub monitor_interval_secs: u64,
    pub reaper_interval_secs: u64,

    /// A RUNNING job older than this (from `started_at`) is flagged.
    pub running_threshold_secs: u64,

    /// A PENDING job older than this (from `created_at`) is flagged.
    pub pending_threshold_secs: u64,

    /// Time between flagging and forced cleanup.
    pub grace_period_secs: u64,

    /// Hold escalations until an operator approves them.
    pub require_operator_approval: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 1,
            queue_depth_limit: 20,
            monitor_interval_secs: 30,
            reaper_interval_secs: 60,
            running_threshold_secs: 2 * 60 * 60,
            pending_threshold_secs: 24 * 60 * 60,
            grace_period_secs: 3 * 60 * 60,
            require_operator_approval: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn running_threshold(&self) -> chrono::Duration {
        secs(self.running_threshold_secs)
    }

    pub fn pending_threshold(&self) -> chrono::Duration {
        secs(self.pending_threshold_secs)
    }

    pub fn grace_period(&self) -> chrono::Duration {
        secs(self.grace_period_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_limit == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.concurrency_limit must be at least 1".to_string(),
            ));
        }
        if self.queue_depth_limit == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.queue_depth_limit must be at least 1".to_string(),
            ));
        }
        if self.monitor_interval_secs == 0 || self.reaper_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "orchestrator loop intervals must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn secs(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}

/// A program plus argument templates.
///
/// Placeholders: `{name}`, `{prefix}`, `{input}`, `{input_dir}`,
/// `{input_file}`, `{output_dir}`, `{subject}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// How the external unit is launched, probed and killed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Launch command.
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,

    /// Subjects directory; each job writes to `<output_root>/<subject>`.
    pub output_root: PathBuf,

    /// Prefix of every reference (container name) this orchestrator creates.
    pub reference_prefix: String,

    /// Paths, relative to `output_root`, that must exist after exit 0.
    pub expected_outputs: Vec<String>,

    /// Independent liveness probe for units not supervised in memory.
    /// Alive iff it exits 0 and does not print `false`.
    pub probe: Option<CommandTemplate>,

    /// Kills a unit by reference.
    pub kill: Option<CommandTemplate>,

    /// Lists unit references, one per line.
    pub list: Option<CommandTemplate>,

    pub probe_timeout_secs: u64,

    /// stderr lines kept for error messages.
    pub stderr_tail_lines: usize,

    /// How long to keep reading stdout/stderr after the unit exited. A
    /// background child holding the pipes open is cut off after this.
    pub output_drain_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let args = [
            "run",
            "--rm",
            "--name",
            "{name}",
            "-v",
            "{input_dir}:/input:ro",
            "-v",
            "{output_dir}:/subjects",
            "-v",
            "/opt/freesurfer/license.txt:/usr/local/freesurfer/license.txt:ro",
            "freesurfer/freesurfer:7.4.1",
            "recon-all",
            "-i",
            "/input/{input_file}",
            "-s",
            "{subject}",
            "-sd",
            "/subjects",
            "-all",
        ];
        Self {
            program: "docker".to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
            output_root: PathBuf::from("/var/lib/surfq/subjects"),
            reference_prefix: "surfq-".to_string(),
            expected_outputs: vec![
                "{subject}/mri/aseg.mgz".to_string(),
                "{subject}/stats/aseg.stats".to_string(),
            ],
            probe: Some(CommandTemplate::new(
                "docker",
                &["inspect", "-f", "{{.State.Running}}", "{name}"],
            )),
            kill: Some(CommandTemplate::new("docker", &["kill", "{name}"])),
            list: Some(CommandTemplate::new(
                "docker",
                &["ps", "--filter", "name={prefix}", "--format", "{{.Names}}"],
            )),
            probe_timeout_secs: 10,
            stderr_tail_lines: 20,
            output_drain_timeout_ms: 5_000,
        }
    }
}

impl WorkerConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    pub fn output_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.output_drain_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.program.trim().is_empty() {
            return Err(ConfigError::Validation(
                "worker.program must not be empty".to_string(),
            ));
        }
        if self.reference_prefix.is_empty() {
            return Err(ConfigError::Validation(
                "worker.reference_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON state file shared by every orchestrator instance and the CLI.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/surfq/jobs.json"),
        }
    }
}
