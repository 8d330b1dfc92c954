//! Task facades
//!
//! A facade is the call surface for one task. It is bound at construction
//! to either a local model, built through a [`ModelRegistry`], or to the
//! remote API.

pub mod api;
pub mod classification;
pub mod generation;
pub mod vectorisation;

use std::collections::BTreeMap;
use tracing::info;

use crate::device::Device;
use crate::error::{Error, Result};

pub use api::{ApiClient, ApiTransport, HttpTransport};
pub use classification::TextClassification;
pub use generation::TextGeneration;
pub use vectorisation::TextVectorisation;

/// Builds a local model on a device
pub type Constructor<L> = Box<dyn Fn(Device) -> Result<Box<L>> + Send + Sync>;

/// Maps model keys to constructors for one task
pub struct ModelRegistry<L: ?Sized> {
    default_key: String,
    constructors: BTreeMap<String, Constructor<L>>,
}

impl<L: ?Sized> ModelRegistry<L> {
    /// Empty registry; `default_key` is used when no key is given
    pub fn new(default_key: impl Into<String>) -> Self {
        Self {
            default_key: default_key.into(),
            constructors: BTreeMap::new(),
        }
    }

    /// Register a constructor under `key`, replacing any previous one
    pub fn register<F>(mut self, key: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(Device) -> Result<Box<L>> + Send + Sync + 'static,
    {
        self.constructors.insert(key.into(), Box::new(constructor));
        self
    }

    pub fn default_key(&self) -> &str {
        &self.default_key
    }

    pub fn contains(&self, key: &str) -> bool {
        self.constructors.contains_key(key)
    }

    /// Registered keys, sorted
    pub fn keys(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Build the model registered under `key`, or the default model
    pub fn build(&self, key: Option<&str>, device: Device) -> Result<Box<L>> {
        let key = key.unwrap_or(&self.default_key);
        let constructor = self.constructors.get(key).ok_or_else(|| {
            let known = self.keys();
            Error::config(format!(
                "unknown local model '{}', registered: {}",
                key,
                if known.is_empty() { "(none)".to_string() } else { known.join(", ") }
            ))
        })?;
        info!("Building local model '{}' on {}", key, device);
        constructor(device)
    }
}

/// Where a facade sends its calls
pub enum Backend<L: ?Sized> {
    Local(Box<L>),
    Remote { client: ApiClient, model: String },
}

impl<L: ?Sized> Backend<L> {
    pub fn is_local(&self) -> bool {
        matches!(self, Backend::Local(_))
    }

    /// Build a local model from `registry` when `local` is set, otherwise
    /// bind to the API with `model` or `default_api_model`
    pub fn select(
        local: bool,
        model: Option<&str>,
        registry: &ModelRegistry<L>,
        device: Device,
        api: impl FnOnce() -> Result<ApiClient>,
        default_api_model: &str,
    ) -> Result<Self> {
        if local {
            Ok(Backend::Local(registry.build(model, device)?))
        } else {
            Ok(Backend::Remote {
                client: api()?,
                model: model.unwrap_or(default_api_model).to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiConfig;

    trait Named {
        fn name(&self) -> String;
    }

    struct Fixed(&'static str);

    impl Named for Fixed {
        fn name(&self) -> String {
            self.0.to_string()
        }
    }

    fn registry() -> ModelRegistry<dyn Named> {
        ModelRegistry::new("small")
            .register("small", |_| Ok(Box::new(Fixed("small")) as Box<dyn Named>))
            .register("large", |_| Ok(Box::new(Fixed("large")) as Box<dyn Named>))
    }

    #[test]
    fn test_build_default_and_named() {
        let registry = registry();
        assert_eq!(registry.build(None, Device::Cpu).unwrap().name(), "small");
        assert_eq!(registry.build(Some("large"), Device::Cpu).unwrap().name(), "large");
        assert_eq!(registry.keys(), vec!["large", "small"]);
    }

    #[test]
    fn test_unknown_key_lists_registered() {
        let err = registry().build(Some("huge"), Device::Cpu).err().unwrap();
        let message = err.to_string();
        assert!(message.contains("huge"));
        assert!(message.contains("large, small"));
    }

    #[test]
    fn test_select_remote_uses_default_api_model() {
        let backend = Backend::select(
            false,
            None,
            &registry(),
            Device::Cpu,
            || ApiClient::new(&ApiConfig::default()),
            "gpt2-large",
        )
        .unwrap();
        match backend {
            Backend::Remote { model, .. } => assert_eq!(model, "gpt2-large"),
            Backend::Local(_) => panic!("expected remote backend"),
        }
    }

    #[test]
    fn test_select_local_builds_from_registry() {
        let backend = Backend::select(
            true,
            Some("large"),
            &registry(),
            Device::Cpu,
            || panic!("api client must not be built for local models"),
            "gpt2-large",
        )
        .unwrap();
        assert!(backend.is_local());
    }
}
