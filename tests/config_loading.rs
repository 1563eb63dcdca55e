// tests/config_loading.rs

mod common;
use crate::common::{ConfigFileBuilder, init_tracing};

use std::fs;
use std::time::Duration;

use cellrunner::config::{load_and_validate, load_or_default};
use cellrunner::engine::KernelSpec;
use cellrunner::errors::CellRunnerError;
use cellrunner::stream::StreamSettings;
use cellrunner::transport::KernelCommand;
use cellrunner::types::RestartQueuePolicy;
use tempfile::tempdir;

#[test]
fn full_config_round_trips_into_runtime_settings() {
    init_tracing();
    let dir = tempdir().unwrap();
    let path = dir.path().join("Cellrunner.toml");
    fs::write(
        &path,
        r#"
[kernel]
name = "ir"
cwd = "/srv/notebooks"
python = "python3.12"
bridge = "tools/bridge.py"
args = ["--quiet"]

[stream]
bulk_threshold = 500
batch_max_lines = 50
batch_max_latency_ms = 25
rate_window_ms = 500

[coordinator]
restart_queue = "keep"
"#,
    )
    .unwrap();

    let cfg = load_and_validate(&path).unwrap();
    assert_eq!(cfg.kernel.name, "ir");
    assert_eq!(cfg.kernel.bridge, dir.path().join("tools/bridge.py"));
    assert_eq!(cfg.coordinator.restart_queue, RestartQueuePolicy::Keep);

    let spec = KernelSpec::from_config(&cfg.kernel);
    assert_eq!(spec.cwd.as_deref(), Some("/srv/notebooks"));

    let command = KernelCommand::from_config(&cfg.kernel);
    assert_eq!(command.program, "python3.12");
    assert_eq!(command.args, vec!["--quiet".to_string()]);

    let settings = StreamSettings::from(&cfg.stream);
    assert_eq!(settings.bulk_threshold, 500);
    assert_eq!(settings.batch_max_lines, 50);
    assert_eq!(settings.batch_max_latency, Duration::from_millis(25));
    assert_eq!(settings.rate_window, Duration::from_millis(500));
}

#[test]
fn missing_sections_fall_back_to_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("minimal.toml");
    fs::write(&path, "[kernel]\nname = \"python3\"\n").unwrap();

    let cfg = load_and_validate(&path).unwrap();
    assert_eq!(cfg.stream.bulk_threshold, 800);
    assert_eq!(cfg.stream.batch_max_lines, 200);
    assert_eq!(cfg.stream.batch_max_latency_ms, 40);
    assert_eq!(cfg.coordinator.restart_queue, RestartQueuePolicy::Drain);
    assert_eq!(cfg.kernel.bridge, dir.path().join("bridge.py"));
}

#[test]
fn absolute_bridge_path_is_kept() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("abs.toml");
    fs::write(&path, "[kernel]\nbridge = \"/opt/cellrunner/bridge.py\"\n").unwrap();

    let cfg = load_and_validate(&path).unwrap();
    assert_eq!(
        cfg.kernel.bridge,
        std::path::PathBuf::from("/opt/cellrunner/bridge.py")
    );
}

#[test]
fn invalid_values_are_reported() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    fs::write(&path, "[stream]\nbatch_max_latency_ms = 2000\n").unwrap();

    let err = load_and_validate(&path).unwrap_err();
    assert!(matches!(err, CellRunnerError::ConfigError(_)));
    assert!(err.to_string().contains("rate_window_ms"));
}

#[test]
fn unknown_policy_is_a_toml_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad_policy.toml");
    fs::write(&path, "[coordinator]\nrestart_queue = \"sometimes\"\n").unwrap();

    let err = load_and_validate(&path).unwrap_err();
    assert!(matches!(err, CellRunnerError::TomlError(_)));
}

#[test]
fn explicit_path_must_exist() {
    let dir = tempdir().unwrap();
    let err = load_or_default(Some(&dir.path().join("nope.toml"))).unwrap_err();
    assert!(matches!(err, CellRunnerError::IoError(_)));
}

#[test]
fn builder_produces_validated_config() {
    let cfg = ConfigFileBuilder::new()
        .kernel("julia-1.10")
        .batch(10, 5)
        .restart_queue(RestartQueuePolicy::Keep)
        .build();
    assert_eq!(cfg.kernel.name, "julia-1.10");
    assert_eq!(cfg.stream.batch_max_lines, 10);
    assert_eq!(cfg.coordinator.restart_queue, RestartQueuePolicy::Keep);
}
