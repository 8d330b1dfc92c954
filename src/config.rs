//! Configuration structures for modelwright

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::device::Device;
use crate::error::{Error, Result};

/// Prefix for environment overrides, e.g. `MODELWRIGHT__FINETUNE__EPOCHS=5`
pub const ENV_PREFIX: &str = "MODELWRIGHT";

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device selection
    pub device: DeviceConfig,
    /// Finetuning defaults
    pub finetune: FinetuneConfig,
    /// Remote inference API
    pub api: ApiConfig,
    /// Model selection per task
    pub tasks: TaskConfig,
}

impl Config {
    /// Load configuration from a JSON or YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| Error::config(format!("invalid YAML in {}: {}", path.display(), e)))?,
            _ => serde_json::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Layer defaults, an optional file and `MODELWRIGHT__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default()).map_err(config_error)?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder
            .build()
            .map_err(config_error)?
            .try_deserialize()
            .map_err(config_error)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let finetune = &self.finetune;
        if !(finetune.validation_split > 0.0 && finetune.validation_split < 1.0) {
            return Err(Error::config("validation_split must be between 0 and 1 (exclusive)"));
        }
        if finetune.epochs == 0 {
            return Err(Error::config("epochs must be > 0"));
        }
        if finetune.batch_size == Some(0) || finetune.optimal_batch_size == Some(0) {
            return Err(Error::config("batch sizes must be > 0"));
        }
        if finetune.patience == 0 {
            return Err(Error::config("patience must be > 0"));
        }
        if finetune.max_input_length == Some(0) {
            return Err(Error::config("max_input_length must be > 0"));
        }
        if finetune.probe.initial == 0 || finetune.probe.max_trials == 0 {
            return Err(Error::config("batch size probe needs initial > 0 and max_trials > 0"));
        }
        if self.api.base_url.trim().is_empty() {
            return Err(Error::config("api.base_url must not be empty"));
        }
        Ok(())
    }
}

fn config_error(e: config::ConfigError) -> Error {
    Error::config(e.to_string())
}

/// Device configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Which kind of device to use
    pub preference: DevicePreference,
    /// GPU ordinal
    pub ordinal: usize,
}

impl DeviceConfig {
    /// Turn the preference into a concrete device. Hardware is probed here
    /// and nowhere else.
    pub fn resolve(&self) -> Device {
        match self.preference {
            DevicePreference::Auto => match Device::auto() {
                Device::Gpu(_) => Device::Gpu(self.ordinal),
                Device::Cpu => Device::Cpu,
            },
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Gpu => Device::Gpu(self.ordinal),
        }
    }
}

/// Device preference
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// GPU if available, else CPU
    #[default]
    Auto,
    /// Always CPU
    Cpu,
    /// Always GPU
    Gpu,
}

/// Finetuning defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinetuneConfig {
    /// Fraction held out for validation
    pub validation_split: f64,
    /// Maximum epochs
    pub epochs: usize,
    /// Fixed batch size; discovered automatically when absent
    pub batch_size: Option<usize>,
    /// Target effective batch size for gradient accumulation
    pub optimal_batch_size: Option<usize>,
    /// Stop when validation loss stops improving
    pub early_stopping: bool,
    /// Validation cycles without improvement before stopping
    pub patience: usize,
    /// Token limit for inputs; task-specific default when absent
    pub max_input_length: Option<usize>,
    /// Batch size search
    pub probe: BatchSizeProbeConfig,
}

impl Default for FinetuneConfig {
    fn default() -> Self {
        Self {
            validation_split: 0.15,
            epochs: 20,
            batch_size: None,
            optimal_batch_size: None,
            early_stopping: true,
            patience: 1,
            max_input_length: None,
            probe: BatchSizeProbeConfig::default(),
        }
    }
}

/// Batch size search configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSizeProbeConfig {
    /// First batch size tried
    pub initial: usize,
    /// Maximum number of doublings
    pub max_trials: usize,
    /// Steps run per candidate size
    pub steps_per_trial: usize,
}

impl Default for BatchSizeProbeConfig {
    fn default() -> Self {
        Self {
            initial: 1,
            max_trials: 25,
            steps_per_trial: 3,
        }
    }
}

/// Remote inference API configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL; task name is appended as the path
    pub base_url: String,
    /// Key sent in the `x-api-key` header
    pub api_key: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.example".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

/// Model selection per task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Run models locally instead of through the API
    pub local: bool,
    /// Generation model key (local registry key or API model name)
    pub generation_model: Option<String>,
    /// Classification model key
    pub classification_model: Option<String>,
    /// Vectorisation model key
    pub vectorisation_model: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.finetune.validation_split, 0.15);
        assert_eq!(config.finetune.epochs, 20);
        assert!(config.finetune.early_stopping);
        assert_eq!(config.finetune.batch_size, None);
        assert_eq!(config.finetune.optimal_batch_size, None);
    }

    #[test]
    fn test_invalid_split_rejected() {
        let mut config = Config::default();
        config.finetune.validation_split = 1.0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_from_json_file_with_partial_sections() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"finetune": {{"epochs": 3, "batch_size": 8}}}}"#).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.finetune.epochs, 3);
        assert_eq!(config.finetune.batch_size, Some(8));
        assert_eq!(config.finetune.validation_split, 0.15);
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "device:\n  preference: cpu\napi:\n  api_key: secret").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.device.resolve(), Device::Cpu);
        assert_eq!(config.api.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_load_layers_file_over_defaults() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"finetune": {{"optimal_batch_size": 128}}}}"#).unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.finetune.optimal_batch_size, Some(128));
        assert_eq!(config.finetune.epochs, 20);
    }

    #[test]
    fn test_gpu_preference_uses_ordinal() {
        let device = DeviceConfig {
            preference: DevicePreference::Gpu,
            ordinal: 2,
        };
        assert_eq!(device.resolve(), Device::Gpu(2));
    }
}
