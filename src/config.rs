// src/config.rs
use crate::error::{PipelineError, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

// Per-binary command line arguments live in the submodules.
pub mod classification;
pub mod extraction;
pub mod feedback;
pub mod gateway;
pub mod transaction;

/// Well-known queue names, used as clap defaults so every binary agrees
/// without further coordination.
pub mod queues {
    pub const EXTRACTION: &str = "doc_extraction_queue";
    pub const CLASSIFICATION: &str = "doc_classification_queue";
    pub const TRANSACTION: &str = "doc_transaction_queue";
    pub const FEEDBACK: &str = "doc_feedback_queue";
    pub const STATUS: &str = "doc_status_queue";
    pub const DEAD_LETTER: &str = "doc_dead_letter_queue";
}

// --- Pipeline Settings ---

/// Shared tunables read from YAML: retry policy, circuit breaker thresholds,
/// processing-state TTL and collaborator timeouts. Every binary loads the
/// same file so the pipeline behaves uniformly.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct PipelineSettings {
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub state_store: StateStoreSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.state_store.validate()?;
        self.timeouts.validate()?;
        Ok(())
    }
}

/// Parameters for the retry / dead-letter layer.
#[derive(Deserialize, Debug, Clone)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            multiplier: 2.0,
        }
    }
}

impl RetrySettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(PipelineError::ConfigValidationError(
                "RetrySettings: max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.multiplier < 1.0 {
            return Err(PipelineError::ConfigValidationError(format!(
                "RetrySettings: multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

/// Parameters for the per-collaborator circuit breakers.
#[derive(Deserialize, Debug, Clone)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a probe call.
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        CircuitBreakerSettings {
            failure_threshold: 5,
            cooldown_secs: 30,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(PipelineError::ConfigValidationError(
                "CircuitBreakerSettings: failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.cooldown_secs == 0 {
            return Err(PipelineError::ConfigValidationError(
                "CircuitBreakerSettings: cooldown_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Parameters for the processing state store and its degradation path.
#[derive(Deserialize, Debug, Clone)]
pub struct StateStoreSettings {
    /// TTL for per-document counters, so abandoned documents self-clean.
    pub ttl_secs: u64,
    /// Attempts against the remote store before falling back.
    pub remote_attempts: u32,
    /// Fixed backoff between remote attempts.
    pub remote_backoff_ms: u64,
}

impl Default for StateStoreSettings {
    fn default() -> Self {
        StateStoreSettings {
            ttl_secs: 24 * 60 * 60,
            remote_attempts: 3,
            remote_backoff_ms: 200,
        }
    }
}

impl StateStoreSettings {
    pub fn validate(&self) -> Result<()> {
        if self.ttl_secs == 0 {
            return Err(PipelineError::ConfigValidationError(
                "StateStoreSettings: ttl_secs must be greater than 0".to_string(),
            ));
        }
        if self.remote_attempts == 0 {
            return Err(PipelineError::ConfigValidationError(
                "StateStoreSettings: remote_attempts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn remote_backoff(&self) -> Duration {
        Duration::from_millis(self.remote_backoff_ms)
    }
}

/// Explicit timeouts for every suspending collaborator call, so a stuck
/// dependency cannot starve a consumer indefinitely.
#[derive(Deserialize, Debug, Clone)]
pub struct TimeoutSettings {
    pub http_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        TimeoutSettings { http_secs: 30 }
    }
}

impl TimeoutSettings {
    pub fn validate(&self) -> Result<()> {
        if self.http_secs == 0 {
            return Err(PipelineError::ConfigValidationError(
                "TimeoutSettings: http_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn http(&self) -> Duration {
        Duration::from_secs(self.http_secs)
    }
}

/// Loads and parses the pipeline settings YAML file. A missing file is fine:
/// every section has defaults matching the deployed values.
pub fn load_settings<P: AsRef<Path>>(settings_path: P) -> Result<PipelineSettings> {
    let path_ref = settings_path.as_ref();
    if !path_ref.exists() {
        let settings = PipelineSettings::default();
        settings.validate()?;
        return Ok(settings);
    }

    let content = fs::read_to_string(path_ref).map_err(|e| {
        PipelineError::ConfigError(format!(
            "Failed to read settings file '{}': {}",
            path_ref.display(),
            e
        ))
    })?;

    let settings: PipelineSettings = serde_yaml::from_str(&content).map_err(|e| {
        PipelineError::ConfigError(format!(
            "Failed to parse settings YAML from '{}': {}",
            path_ref.display(),
            e
        ))
    })?;

    settings.validate()?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_valid_settings() {
        let yaml = r#"
retry:
  max_attempts: 5
  initial_backoff_ms: 500
  multiplier: 1.5
circuit_breaker:
  failure_threshold: 3
  cooldown_secs: 10
state_store:
  ttl_secs: 3600
  remote_attempts: 2
  remote_backoff_ms: 100
timeouts:
  http_secs: 15
"#;
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml.as_bytes()).unwrap();

        let settings = load_settings(temp_file.path()).expect("settings should load");
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.retry.initial_backoff(), Duration::from_millis(500));
        assert_eq!(settings.circuit_breaker.failure_threshold, 3);
        assert_eq!(settings.state_store.ttl(), Duration::from_secs(3600));
        assert_eq!(settings.timeouts.http(), Duration::from_secs(15));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let settings = load_settings("definitely_not_here.yaml").unwrap();
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.retry.initial_backoff(), Duration::from_secs(1));
        assert_eq!(settings.state_store.ttl_secs, 86_400);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let yaml = "retry:\n  max_attempts: 7\n  initial_backoff_ms: 1000\n  multiplier: 2.0\n";
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml.as_bytes()).unwrap();

        let settings = load_settings(temp_file.path()).unwrap();
        assert_eq!(settings.retry.max_attempts, 7);
        // untouched sections keep their defaults
        assert_eq!(settings.circuit_breaker.failure_threshold, 5);
    }

    #[test]
    fn test_zero_attempts_fails_validation() {
        let yaml = "retry:\n  max_attempts: 0\n  initial_backoff_ms: 1000\n  multiplier: 2.0\n";
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml.as_bytes()).unwrap();

        let result = load_settings(temp_file.path());
        assert!(matches!(
            result,
            Err(PipelineError::ConfigValidationError(_))
        ));
    }

    #[test]
    fn test_submultiplier_fails_validation() {
        let yaml = "retry:\n  max_attempts: 3\n  initial_backoff_ms: 1000\n  multiplier: 0.5\n";
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml.as_bytes()).unwrap();

        assert!(load_settings(temp_file.path()).is_err());
    }

    #[test]
    fn test_malformed_yaml_is_config_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"retry: [not, a, map").unwrap();

        let result = load_settings(temp_file.path());
        assert!(matches!(result, Err(PipelineError::ConfigError(_))));
    }
}
