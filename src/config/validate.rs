// src/config/validate.rs

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{CellRunnerError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = CellRunnerError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw.kernel, raw.stream, raw.coordinator))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_kernel(cfg)?;
    validate_stream(cfg)?;
    Ok(())
}

fn validate_kernel(cfg: &RawConfigFile) -> Result<()> {
    if cfg.kernel.name.trim().is_empty() {
        return Err(CellRunnerError::ConfigError(
            "[kernel].name must not be empty".to_string(),
        ));
    }
    if cfg.kernel.python.trim().is_empty() {
        return Err(CellRunnerError::ConfigError(
            "[kernel].python must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_stream(cfg: &RawConfigFile) -> Result<()> {
    let stream = &cfg.stream;
    let limits = [
        ("bulk_threshold", u64::from(stream.bulk_threshold)),
        ("batch_max_lines", stream.batch_max_lines as u64),
        ("batch_max_latency_ms", stream.batch_max_latency_ms),
        ("rate_window_ms", stream.rate_window_ms),
    ];
    for (name, value) in limits {
        if value == 0 {
            return Err(CellRunnerError::ConfigError(format!(
                "[stream].{name} must be >= 1 (got 0)"
            )));
        }
    }

    if stream.batch_max_latency_ms >= stream.rate_window_ms {
        return Err(CellRunnerError::ConfigError(format!(
            "[stream].batch_max_latency_ms ({}) must be smaller than rate_window_ms ({})",
            stream.batch_max_latency_ms, stream.rate_window_ms
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ConfigFile::try_from(RawConfigFile::default()).unwrap();
        assert_eq!(cfg.kernel.name, "python3");
        assert_eq!(cfg.stream.bulk_threshold, 800);
    }

    #[test]
    fn zero_stream_limits_are_rejected() {
        let mut raw = RawConfigFile::default();
        raw.stream.batch_max_lines = 0;
        let err = ConfigFile::try_from(raw).unwrap_err();
        assert!(err.to_string().contains("batch_max_lines"));
    }

    #[test]
    fn latency_must_fit_in_rate_window() {
        let mut raw = RawConfigFile::default();
        raw.stream.batch_max_latency_ms = 1000;
        assert!(ConfigFile::try_from(raw).is_err());
    }

    #[test]
    fn empty_kernel_name_is_rejected() {
        let mut raw = RawConfigFile::default();
        raw.kernel.name = "  ".into();
        assert!(matches!(
            ConfigFile::try_from(raw),
            Err(CellRunnerError::ConfigError(_))
        ));
    }
}
