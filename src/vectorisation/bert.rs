//! BERT sentence encoder
//!
//! Weights live in a [`VarMap`] so they can be handed to the optimizer.
//! Token embeddings are mean-pooled under the attention mask.

use anyhow::{anyhow, bail, Context};
use candle_core::{DType, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use super::{mean_pool, SentenceEncoder, VectorisationModel};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::handle::{Mode, ModelHandle, ModelObject};
use crate::tokenizer::load_tokenizer;

/// Files a BERT checkpoint is made of
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub weights: PathBuf,
    pub tokenizer: PathBuf,
}

impl ModelFiles {
    /// Find checkpoint files in a local directory, or download them from the
    /// Hugging Face Hub when `model_path` is not a directory
    pub fn resolve(model_path: &str) -> anyhow::Result<Self> {
        let dir = Path::new(model_path);
        if dir.is_dir() {
            let files = Self {
                config: dir.join("config.json"),
                weights: dir.join("model.safetensors"),
                tokenizer: dir.join("tokenizer.json"),
            };
            for path in [&files.config, &files.weights, &files.tokenizer] {
                if !path.exists() {
                    bail!("{} not found in model directory {}", path.display(), model_path);
                }
            }
            return Ok(files);
        }

        info!("Fetching {} from the Hugging Face Hub", model_path);
        let api = hf_hub::api::sync::Api::new()?;
        let repo = api.model(model_path.to_string());
        let fetch = |name: &str| {
            repo.get(name)
                .with_context(|| format!("Failed to fetch {} for {}", name, model_path))
        };
        Ok(Self {
            config: fetch("config.json")?,
            weights: fetch("model.safetensors")?,
            tokenizer: fetch("tokenizer.json")?,
        })
    }
}

/// Sentence encoder backed by `candle_transformers`' BERT
pub struct BertSentenceEncoder {
    model: BertModel,
    varmap: VarMap,
    config: BertConfig,
    candle: candle_core::Device,
    mode: Mode,
}

impl BertSentenceEncoder {
    /// Build a randomly initialized encoder
    pub fn from_config(config: BertConfig, device: Device) -> Result<Self> {
        let candle = device.to_candle()?;
        let (varmap, model) = build(&config, &candle)?;
        Ok(Self {
            model,
            varmap,
            config,
            candle,
            mode: Mode::Eval,
        })
    }

    /// Load `config.json` and `model.safetensors`
    pub fn from_files(files: &ModelFiles, device: Device) -> anyhow::Result<Self> {
        let config = std::fs::read_to_string(&files.config)
            .with_context(|| format!("Failed to read {}", files.config.display()))?;
        let config: BertConfig = serde_json::from_str(&config)?;

        let mut encoder = Self::from_config(config, device)?;
        encoder
            .varmap
            .load(&files.weights)
            .with_context(|| format!("Failed to load weights from {}", files.weights.display()))?;
        debug!("Loaded {} weight tensors", encoder.varmap.all_vars().len());
        Ok(encoder)
    }

    pub fn config(&self) -> &BertConfig {
        &self.config
    }
}

fn build(config: &BertConfig, device: &candle_core::Device) -> Result<(VarMap, BertModel)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = BertModel::load(vb, config)?;
    Ok((varmap, model))
}

impl ModelObject for BertSentenceEncoder {
    fn to_device(&mut self, device: Device) -> Result<()> {
        let target = device.to_candle()?;
        if target.same_device(&self.candle) {
            return Ok(());
        }

        let (varmap, model) = build(&self.config, &target)?;
        {
            let source = self
                .varmap
                .data()
                .lock()
                .map_err(|_| Error::Other(anyhow!("weight map lock poisoned")))?;
            let dest = varmap
                .data()
                .lock()
                .map_err(|_| Error::Other(anyhow!("weight map lock poisoned")))?;
            for (name, var) in dest.iter() {
                if let Some(src) = source.get(name) {
                    var.set(&src.as_tensor().to_device(&target)?)?;
                }
            }
        }

        self.varmap = varmap;
        self.model = model;
        self.candle = target;
        Ok(())
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn tensor_device(&self) -> &candle_core::Device {
        &self.candle
    }
}

impl SentenceEncoder for BertSentenceEncoder {
    fn embed(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let token_type_ids = input_ids.zeros_like()?;
        let hidden = self
            .model
            .forward(input_ids, &token_type_ids, Some(attention_mask))?;
        mean_pool(&hidden, attention_mask)
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }
}

/// Load a BERT vectoriser and its tokenizer from a directory or hub id
pub fn load_bert_vectoriser(
    model_path: &str,
    device: Option<Device>,
) -> Result<VectorisationModel<BertSentenceEncoder, Tokenizer>> {
    let files = ModelFiles::resolve(model_path)
        .map_err(|e| Error::initialization(format!("{:#}", e)))?;
    let tokenizer_path = files.tokenizer.to_string_lossy().into_owned();

    let handle = ModelHandle::initialize(model_path, device, |_, device| {
        BertSentenceEncoder::from_files(&files, device)
    })?
    .load_tokenizer(&tokenizer_path, load_tokenizer)?;

    Ok(VectorisationModel::new(handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::batch_tensor;

    fn tiny_config() -> BertConfig {
        serde_json::from_str(
            r#"{
                "vocab_size": 32,
                "hidden_size": 8,
                "num_hidden_layers": 1,
                "num_attention_heads": 2,
                "intermediate_size": 16,
                "hidden_act": "gelu",
                "hidden_dropout_prob": 0.0,
                "max_position_embeddings": 16,
                "type_vocab_size": 2,
                "initializer_range": 0.02,
                "layer_norm_eps": 1e-12,
                "pad_token_id": 0
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_embedding_shape_and_trainable_vars() {
        let encoder = BertSentenceEncoder::from_config(tiny_config(), Device::Cpu).unwrap();
        let device = encoder.tensor_device().clone();
        let ids = [1u32, 5, 7, 0];
        let mask = [1u32, 1, 1, 0];
        let input_ids = batch_tensor(&[&ids[..], &ids[..]], &device).unwrap();
        let attention_mask = batch_tensor(&[&mask[..], &mask[..]], &device).unwrap();

        let embeddings = encoder.embed(&input_ids, &attention_mask).unwrap();
        assert_eq!(embeddings.dims(), &[2, 8]);
        assert!(!encoder.trainable_vars().is_empty());
    }

    #[test]
    fn test_same_device_move_keeps_weights() {
        let mut encoder = BertSentenceEncoder::from_config(tiny_config(), Device::Cpu).unwrap();
        let before = encoder.trainable_vars().len();
        encoder.to_device(Device::Cpu).unwrap();
        assert_eq!(encoder.trainable_vars().len(), before);
    }

    #[test]
    fn test_missing_local_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        let err = ModelFiles::resolve(dir.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("model.safetensors"));
    }

    #[test]
    fn test_loader_failure_is_initialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_bert_vectoriser(dir.path().to_str().unwrap(), Some(Device::Cpu));
        assert!(matches!(result, Err(Error::Initialization(_))));
    }
}
