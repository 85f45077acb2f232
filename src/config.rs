//! Pacer configuration loaded from `pacer.toml`.
//!
//! [`PacerConfig`] holds every tunable. Keys missing from the file fall back
//! to defaults, `PACER_ISSUER_URL` and `PACER_NOTIFY_WEBHOOK` override the
//! file, and the CLI overrides both.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::admission::AdmissionSettings;
use crate::backoff::RetryPolicy;
use crate::error::PacerError;
use crate::monitor::{DeviceHints, HostIntrospection, SystemHost};
use crate::resolver::MAX_BATCH_SIZE;

const MIB: u64 = 1024 * 1024;

/// Where host readings come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    /// Operating-system readings for this process.
    #[default]
    System,
    /// Caller-supplied core and memory hints.
    Device,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PacerConfig {
    /// Base URL of the write-authorization issuer.
    #[serde(default = "default_issuer_url")]
    pub issuer_url: String,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Files per resolver round trip. Clamped to the issuer's limit.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    #[serde(default = "default_pressure_recheck_ms")]
    pub pressure_recheck_ms: u64,

    /// Fraction of the memory ceiling above which transfers are deferred.
    #[serde(default = "default_pressure_threshold")]
    pub pressure_threshold: f64,

    /// Derived from the core count when absent.
    #[serde(default)]
    pub memory_ceiling_mb: Option<u64>,

    /// Transfer workers. Defaults to the transfer slot ceiling.
    #[serde(default)]
    pub workers: Option<usize>,

    #[serde(default)]
    pub host: HostKind,

    #[serde(default = "default_device_cores")]
    pub device_cores: usize,

    #[serde(default)]
    pub device_memory_mb: Option<u64>,

    /// Chat webhook receiving completion notices.
    #[serde(default)]
    pub notify_webhook: Option<String>,
}

fn default_issuer_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_batch_size() -> usize {
    20
}

fn default_grace_period_ms() -> u64 {
    2000
}

fn default_pressure_recheck_ms() -> u64 {
    100
}

fn default_pressure_threshold() -> f64 {
    0.8
}

fn default_device_cores() -> usize {
    2
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            issuer_url: default_issuer_url(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            batch_size: default_batch_size(),
            grace_period_ms: default_grace_period_ms(),
            pressure_recheck_ms: default_pressure_recheck_ms(),
            pressure_threshold: default_pressure_threshold(),
            memory_ceiling_mb: None,
            workers: None,
            host: HostKind::default(),
            device_cores: default_device_cores(),
            device_memory_mb: None,
            notify_webhook: None,
        }
    }
}

impl PacerConfig {
    /// Load `pacer.toml` from the working directory, or defaults if it is absent.
    pub fn load() -> Result<Self, PacerError> {
        let path = Path::new("pacer.toml");
        if path.exists() {
            Self::load_from(path)
        } else {
            Self::default().with_env_overrides()
        }
    }

    /// Load from `path`, which must exist, then apply environment overrides
    /// and validate.
    pub fn load_from(path: &Path) -> Result<Self, PacerError> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str::<PacerConfig>(&contents)?.with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Result<Self, PacerError> {
        if let Ok(url) = std::env::var("PACER_ISSUER_URL")
            && !url.is_empty()
        {
            self.issuer_url = url;
        }
        if let Ok(hook) = std::env::var("PACER_NOTIFY_WEBHOOK")
            && !hook.is_empty()
        {
            self.notify_webhook = Some(hook);
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), PacerError> {
        if self.batch_size == 0 {
            return Err(PacerError::Config("batch_size must be at least 1".into()));
        }
        if self.base_delay_ms == 0 {
            return Err(PacerError::Config("base_delay_ms must be positive".into()));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(PacerError::Config(format!(
                "max_delay_ms ({}) is below base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        if !(self.pressure_threshold > 0.0 && self.pressure_threshold <= 1.0) {
            return Err(PacerError::Config(format!(
                "pressure_threshold must be in (0, 1], got {}",
                self.pressure_threshold
            )));
        }
        if self.workers == Some(0) {
            return Err(PacerError::Config("workers must be at least 1".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
        }
    }

    pub fn admission_settings(&self) -> AdmissionSettings {
        AdmissionSettings {
            grace_period: Duration::from_millis(self.grace_period_ms),
            recheck_interval: Duration::from_millis(self.pressure_recheck_ms.max(1)),
        }
    }

    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_BATCH_SIZE)
    }

    pub fn memory_ceiling_bytes(&self) -> Option<u64> {
        self.memory_ceiling_mb.map(|mb| mb * MIB)
    }

    pub fn host(&self) -> Arc<dyn HostIntrospection> {
        match self.host {
            HostKind::System => Arc::new(SystemHost::new()),
            HostKind::Device => Arc::new(DeviceHints::new(
                self.device_cores,
                self.device_memory_mb.map(|mb| mb * MIB),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::ResourceMonitor;
    use std::io::Write;

    #[test]
    fn default_config_values() {
        let config = PacerConfig::default();
        assert_eq!(config.issuer_url, "http://localhost:8000");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 30_000);
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.host, HostKind::System);
        assert!(config.memory_ceiling_mb.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            max_retries = 5
            batch_size = 80
            host = "device"
            device_cores = 4
            memory_ceiling_mb = 512
        "#;
        let config: PacerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.effective_batch_size(), MAX_BATCH_SIZE);
        assert_eq!(config.host, HostKind::Device);
        assert_eq!(config.memory_ceiling_bytes(), Some(512 * MIB));
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.host().core_count(), 4);
    }

    #[test]
    fn conversions() {
        let config = PacerConfig {
            grace_period_ms: 750,
            pressure_recheck_ms: 0,
            ..Default::default()
        };
        let settings = config.admission_settings();
        assert_eq!(settings.grace_period, Duration::from_millis(750));
        assert_eq!(settings.recheck_interval, Duration::from_millis(1));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn validation_rejects_nonsense() {
        let bad = [
            PacerConfig {
                batch_size: 0,
                ..Default::default()
            },
            PacerConfig {
                base_delay_ms: 0,
                ..Default::default()
            },
            PacerConfig {
                max_delay_ms: 10,
                ..Default::default()
            },
            PacerConfig {
                pressure_threshold: 1.5,
                ..Default::default()
            },
            PacerConfig {
                workers: Some(0),
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(PacerError::Config(_))));
        }
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "grace_period_ms = 500\nworkers = 2").unwrap();
        let config = PacerConfig::load_from(file.path()).unwrap();
        assert_eq!(config.grace_period_ms, 500);
        assert_eq!(config.workers, Some(2));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_retries = \"lots\"").unwrap();
        assert!(matches!(
            PacerConfig::load_from(file.path()),
            Err(PacerError::Toml(_))
        ));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        assert!(matches!(
            PacerConfig::load_from(Path::new("/nonexistent/pacer.toml")),
            Err(PacerError::Io(_))
        ));
    }

    #[test]
    fn absent_default_file_falls_back_to_defaults() {
        // The crate root carries no pacer.toml.
        let config = PacerConfig::load().unwrap();
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn device_memory_bounds_the_derived_ceiling() {
        let config = PacerConfig {
            host: HostKind::Device,
            device_cores: 4,
            device_memory_mb: Some(1024),
            ..Default::default()
        };
        let monitor = ResourceMonitor::new(config.host(), config.memory_ceiling_bytes(), 0.8);
        assert_eq!(monitor.memory_ceiling(), 256 * MIB);
    }
}
