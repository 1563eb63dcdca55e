// src/config/model.rs

use std::path::PathBuf;

use serde::Deserialize;

use crate::types::RestartQueuePolicy;

/// Configuration exactly as read from TOML, before validation.
///
/// ```toml
/// [kernel]
/// name = "python3"
/// python = "python3"
/// bridge = "bridge.py"
///
/// [stream]
/// bulk_threshold = 800
///
/// [coordinator]
/// restart_queue = "drain"
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub kernel: KernelSection,

    #[serde(default)]
    pub stream: StreamSection,

    #[serde(default)]
    pub coordinator: CoordinatorSection,
}

/// Validated configuration. Build it with `ConfigFile::try_from(raw)`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub kernel: KernelSection,
    pub stream: StreamSection,
    pub coordinator: CoordinatorSection,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        kernel: KernelSection,
        stream: StreamSection,
        coordinator: CoordinatorSection,
    ) -> Self {
        Self {
            kernel,
            stream,
            coordinator,
        }
    }
}

/// `[kernel]` section: which kernel to start and how to run the bridge.
#[derive(Debug, Clone, Deserialize)]
pub struct KernelSection {
    /// Kernel spec name sent with `start` and `restart`.
    #[serde(default = "default_kernel_name")]
    pub name: String,

    /// Working directory for the kernel.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Interpreter that runs the bridge script.
    #[serde(default = "default_python")]
    pub python: String,

    /// Bridge script. Relative paths are resolved against the config file's
    /// directory.
    #[serde(default = "default_bridge")]
    pub bridge: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,
}

fn default_kernel_name() -> String {
    "python3".to_string()
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_bridge() -> PathBuf {
    PathBuf::from("bridge.py")
}

impl Default for KernelSection {
    fn default() -> Self {
        Self {
            name: default_kernel_name(),
            cwd: None,
            python: default_python(),
            bridge: default_bridge(),
            args: Vec::new(),
        }
    }
}

/// `[stream]` section: output aggregation limits.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamSection {
    /// Stream events per rate window at which bulk mode starts.
    #[serde(default = "default_bulk_threshold")]
    pub bulk_threshold: u32,

    #[serde(default = "default_batch_max_lines")]
    pub batch_max_lines: usize,

    #[serde(default = "default_batch_max_latency_ms")]
    pub batch_max_latency_ms: u64,

    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
}

fn default_bulk_threshold() -> u32 {
    800
}

fn default_batch_max_lines() -> usize {
    200
}

fn default_batch_max_latency_ms() -> u64 {
    40
}

fn default_rate_window_ms() -> u64 {
    1000
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            bulk_threshold: default_bulk_threshold(),
            batch_max_lines: default_batch_max_lines(),
            batch_max_latency_ms: default_batch_max_latency_ms(),
            rate_window_ms: default_rate_window_ms(),
        }
    }
}

/// `[coordinator]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoordinatorSection {
    /// `"drain"` (default) or `"keep"`: what happens to queued requests on
    /// kernel restart.
    #[serde(default)]
    pub restart_queue: RestartQueuePolicy,
}
