//! Uniform handle over an externally constructed model object

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, instrument};

use crate::device::Device;
use crate::error::{Error, Result};

/// Whether a model is being trained or used for inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Inference mode (the resting state)
    Eval,
    /// Training mode, only during an active finetune
    Train,
}

/// The opaque pretrained model object a [`ModelHandle`] owns.
///
/// Forward passes are exposed by the task-specific traits built on top of
/// this one; here only placement and mode are managed.
pub trait ModelObject {
    /// Move weights to `device`
    fn to_device(&mut self, device: Device) -> Result<()>;

    /// Switch between training and evaluation behavior
    fn set_mode(&mut self, mode: Mode);

    /// Current mode
    fn mode(&self) -> Mode;

    /// The candle device tensors for this model must be created on
    fn tensor_device(&self) -> &candle_core::Device;
}

/// Identity metadata attached to a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Short model name
    pub name: String,
    /// Human readable description
    pub description: String,
    /// Tasks the model declares support for
    pub tasks: BTreeSet<String>,
}

impl Default for ModelInfo {
    fn default() -> Self {
        Self {
            name: "base-model".to_string(),
            description: "This is the base description. Change me.".to_string(),
            tasks: BTreeSet::new(),
        }
    }
}

impl ModelInfo {
    /// Create metadata for a model declaring the given tasks
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        description: impl Into<String>,
        tasks: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            tasks: tasks.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `task` is among the declared tasks
    pub fn supports(&self, task: &str) -> bool {
        self.tasks.contains(task)
    }
}

/// A loaded model, its optional tokenizer and the device it lives on
pub struct ModelHandle<M, T = ()> {
    model_path: String,
    model: M,
    tokenizer: Option<T>,
    device: Device,
    info: ModelInfo,
}

impl<M: ModelObject, T> ModelHandle<M, T> {
    /// Load a model through `loader`, place it on `device` and put it in
    /// evaluation mode. `None` resolves the device with [`Device::auto`].
    #[instrument(skip(loader))]
    pub fn initialize<F>(model_path: &str, device: Option<Device>, loader: F) -> Result<Self>
    where
        F: FnOnce(&str, Device) -> anyhow::Result<M>,
    {
        let device = device.unwrap_or_else(Device::auto);
        info!("Loading model from {} onto {}", model_path, device);

        let mut model = loader(model_path, device).map_err(|e| {
            Error::initialization(format!("failed to load model '{}': {:#}", model_path, e))
        })?;
        model.set_mode(Mode::Eval);
        model.to_device(device)?;

        Ok(Self {
            model_path: model_path.to_string(),
            model,
            tokenizer: None,
            device,
            info: ModelInfo::default(),
        })
    }

    /// Wrap an already-constructed model object
    pub fn from_parts(model_path: impl Into<String>, mut model: M, device: Device) -> Result<Self> {
        model.set_mode(Mode::Eval);
        model.to_device(device)?;
        Ok(Self {
            model_path: model_path.into(),
            model,
            tokenizer: None,
            device,
            info: ModelInfo::default(),
        })
    }

    /// Load a tokenizer. Not all models need one.
    pub fn load_tokenizer<F>(mut self, tokenizer_path: &str, loader: F) -> Result<Self>
    where
        F: FnOnce(&str) -> anyhow::Result<T>,
    {
        debug!("Loading tokenizer from {}", tokenizer_path);
        let tokenizer = loader(tokenizer_path).map_err(|e| {
            Error::initialization(format!("failed to load tokenizer '{}': {:#}", tokenizer_path, e))
        })?;
        self.tokenizer = Some(tokenizer);
        Ok(self)
    }

    /// Attach an already-constructed tokenizer
    pub fn with_tokenizer(mut self, tokenizer: T) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Replace the identity metadata
    pub fn with_info(mut self, info: ModelInfo) -> Self {
        self.info = info;
        self
    }

    /// Call straight through to the model object
    pub fn invoke<R>(&self, f: impl FnOnce(&M) -> R) -> R {
        f(&self.model)
    }

    /// Move the model to `device` and record the new assignment
    pub fn set_device(&mut self, device: Device) -> Result<()> {
        debug!("Moving {} from {} to {}", self.info.name, self.device, device);
        self.model.to_device(device)?;
        self.device = device;
        Ok(())
    }

    /// Device the model is assigned to
    pub fn device(&self) -> Device {
        self.device
    }

    /// Path or hub identifier the model was loaded from
    pub fn model_path(&self) -> &str {
        &self.model_path
    }

    /// Identity metadata
    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    /// Model object
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Mutable model object
    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// Tokenizer, if one was loaded
    pub fn tokenizer(&self) -> Option<&T> {
        self.tokenizer.as_ref()
    }

    /// Tokenizer, or an error naming the model that lacks one
    pub fn require_tokenizer(&self) -> Result<&T> {
        self.tokenizer.as_ref().ok_or_else(|| {
            Error::config(format!("model '{}' has no tokenizer loaded", self.model_path))
        })
    }

    /// Current mode of the model object
    pub fn mode(&self) -> Mode {
        self.model.mode()
    }

    /// Switch the model object's mode
    pub fn set_mode(&mut self, mode: Mode) {
        self.model.set_mode(mode);
    }

    /// Candle device to build input tensors on
    pub fn tensor_device(&self) -> &candle_core::Device {
        self.model.tensor_device()
    }
}
