//! Text vectorisation adapter with a similarity-regression objective
//!
//! Finetuning takes text pairs with target similarity scores in [0, 1].
//! Both texts are embedded independently, their cosine similarity is
//! regressed onto the target with mean squared error.

pub mod bert;

use candle_core::{DType, Tensor, Var, D};
use candle_nn::ParamsAdamW;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::config::FinetuneConfig;
use crate::device::{self, Device};
use crate::error::{Error, Result};
use crate::finetune::{
    AccumulatingAdamW, Finetunable, FinetuneOptions, FinetuneOrchestrator, FinetuneReport,
    StepOptimizer,
};
use crate::handle::{Mode, ModelHandle, ModelInfo, ModelObject};
use crate::input::OneOrMany;
use crate::tokenizer::{batch_tensor, encode_fixed, TextTokenizer, TokenizedInput};

pub use bert::BertSentenceEncoder;

/// Task name declared by vectorisation models
pub const TASK: &str = "text-vectorisation";

const COSINE_EPS: f64 = 1e-8;

/// A model object producing one embedding per input sequence
pub trait SentenceEncoder: ModelObject {
    /// Sentence embeddings `[batch, hidden]`
    fn embed(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;

    /// Parameters updated during finetuning
    fn trainable_vars(&self) -> Vec<Var>;
}

/// An encoded text pair and its target similarity
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedExample {
    pub input_ids_a: Vec<u32>,
    pub attention_mask_a: Vec<u32>,
    pub input_ids_b: Vec<u32>,
    pub attention_mask_b: Vec<u32>,
    pub target_score: f32,
}

impl EncodedExample {
    fn new(a: TokenizedInput, b: TokenizedInput, target_score: f32) -> Self {
        Self {
            input_ids_a: a.input_ids,
            attention_mask_a: a.attention_mask,
            input_ids_b: b.input_ids,
            attention_mask_b: b.attention_mask,
            target_score,
        }
    }
}

/// Finetune parameters for vectorisation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorisationFinetuneOptions {
    pub finetune: FinetuneOptions,
    /// Tokens kept from each text; anything longer is truncated
    pub max_input_length: usize,
    pub learning_rate: f64,
    pub eps: f64,
}

impl Default for VectorisationFinetuneOptions {
    fn default() -> Self {
        Self {
            finetune: FinetuneOptions {
                optimal_batch_size: Some(128),
                ..Default::default()
            },
            max_input_length: 64,
            learning_rate: 2e-5,
            eps: 1e-6,
        }
    }
}

impl VectorisationFinetuneOptions {
    /// Defaults taken from the `finetune` configuration section
    pub fn from_config(config: &FinetuneConfig) -> Self {
        let defaults = Self::default();
        let finetune = FinetuneOptions::from(config);
        Self {
            finetune: FinetuneOptions {
                optimal_batch_size: finetune
                    .optimal_batch_size
                    .or(defaults.finetune.optimal_batch_size),
                ..finetune
            },
            max_input_length: config.max_input_length.unwrap_or(defaults.max_input_length),
            ..defaults
        }
    }
}

/// Object-safe view of a local vectoriser, used by the task facade
pub trait LocalVectoriser {
    fn info(&self) -> &ModelInfo;

    fn vectorise(&self, input: &OneOrMany<String>) -> Result<OneOrMany<Vec<f32>>>;

    fn finetune(
        &mut self,
        text_pairs: &[(String, String)],
        similarity_scores: &[f32],
        options: &VectorisationFinetuneOptions,
        orchestrator: &FinetuneOrchestrator,
    ) -> Result<FinetuneReport>;
}

/// Vectorisation adapter over a model handle
pub struct VectorisationModel<M, T> {
    handle: ModelHandle<M, T>,
    optimizer: ParamsAdamW,
}

fn default_info() -> ModelInfo {
    ModelInfo::new(
        "text-vec-model",
        "Embeds text for similarity comparison",
        [TASK],
    )
}

impl<M: SentenceEncoder, T: TextTokenizer> VectorisationModel<M, T> {
    /// Wrap a handle. Handles still carrying the base metadata get the
    /// vectorisation defaults.
    pub fn new(handle: ModelHandle<M, T>) -> Self {
        let handle = if *handle.info() == ModelInfo::default() {
            handle.with_info(default_info())
        } else {
            handle
        };
        let defaults = VectorisationFinetuneOptions::default();
        Self {
            handle,
            optimizer: adamw_params(defaults.learning_rate, defaults.eps),
        }
    }

    pub fn handle(&self) -> &ModelHandle<M, T> {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut ModelHandle<M, T> {
        &mut self.handle
    }

    /// Embed one text or a list of texts. No gradients are tracked.
    #[instrument(skip_all, fields(model = %self.handle.info().name, inputs = input.len()))]
    pub fn vectorise(&self, input: &OneOrMany<String>) -> Result<OneOrMany<Vec<f32>>> {
        let tokenizer = self.handle.require_tokenizer()?;
        let device = self.handle.tensor_device();

        let mut embeddings = Vec::with_capacity(input.len());
        for text in input.as_slice() {
            let encoded = tokenizer.encode(text)?;
            let input_ids = batch_tensor(&[encoded.input_ids.as_slice()], device)?;
            let attention_mask = batch_tensor(&[encoded.attention_mask.as_slice()], device)?;
            let embedding = self
                .handle
                .model()
                .embed(&input_ids, &attention_mask)
                .map_err(|e| Error::delegate("vectorisation", e))?
                .detach();
            embeddings.push(embedding.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?);
        }

        Ok(input.restore(embeddings))
    }

    /// Tokenize both texts of a pair, truncated and padded to `max_length`
    pub fn encode_input(
        &self,
        text_a: &str,
        text_b: &str,
        max_length: usize,
    ) -> Result<(TokenizedInput, TokenizedInput)> {
        let tokenizer = self.handle.require_tokenizer()?;
        encode_pair_fixed(tokenizer, text_a, text_b, max_length)
    }

    /// Finetune on text pairs and their target similarity scores
    #[instrument(skip_all, fields(model = %self.handle.info().name, pairs = text_pairs.len()))]
    pub fn finetune(
        &mut self,
        text_pairs: &[(String, String)],
        similarity_scores: &[f32],
        options: &VectorisationFinetuneOptions,
        orchestrator: &FinetuneOrchestrator,
    ) -> Result<FinetuneReport> {
        if text_pairs.len() != similarity_scores.len() {
            return Err(Error::precondition(format!(
                "Input list must match the output list ({} pairs, {} scores)",
                text_pairs.len(),
                similarity_scores.len()
            )));
        }
        if let Some(score) = similarity_scores
            .iter()
            .find(|s| !(0.0..=1.0).contains(*s))
        {
            return Err(Error::precondition(format!(
                "similarity scores must be in [0, 1], got {}",
                score
            )));
        }
        if !self.handle.device().is_gpu() {
            return Err(Error::device_unavailable(format!(
                "You need a GPU-capable device for finetuning, model is on {}",
                self.handle.device()
            )));
        }

        let dataset = {
            let tokenizer = self.handle.require_tokenizer()?;
            let max_length = options.max_input_length;
            text_pairs
                .par_iter()
                .zip(similarity_scores.par_iter())
                .map(|((a, b), &score)| {
                    let (a, b) = encode_pair_fixed(tokenizer, a, b, max_length)?;
                    Ok(EncodedExample::new(a, b, score))
                })
                .collect::<Result<Vec<_>>>()?
        };
        info!("Encoded {} text pairs to {} tokens each", dataset.len(), options.max_input_length);

        self.optimizer = adamw_params(options.learning_rate, options.eps);
        orchestrator.finetune(self, dataset, &options.finetune, None)
    }

    fn pair_loss(&self, batch: &[EncodedExample]) -> Result<Tensor> {
        let device = self.handle.tensor_device();
        let model = self.handle.model();

        let ids_a: Vec<&[u32]> = batch.iter().map(|e| e.input_ids_a.as_slice()).collect();
        let mask_a: Vec<&[u32]> = batch.iter().map(|e| e.attention_mask_a.as_slice()).collect();
        let ids_b: Vec<&[u32]> = batch.iter().map(|e| e.input_ids_b.as_slice()).collect();
        let mask_b: Vec<&[u32]> = batch.iter().map(|e| e.attention_mask_b.as_slice()).collect();

        let embeddings_a = model.embed(&batch_tensor(&ids_a, device)?, &batch_tensor(&mask_a, device)?)?;
        let embeddings_b = model.embed(&batch_tensor(&ids_b, device)?, &batch_tensor(&mask_b, device)?)?;

        let similarity = cosine_similarity(&embeddings_a, &embeddings_b)?;
        let targets: Vec<f32> = batch.iter().map(|e| e.target_score).collect();
        let targets = Tensor::from_vec(targets, batch.len(), device)?.to_dtype(similarity.dtype())?;

        Ok(candle_nn::loss::mse(&similarity, &targets)?)
    }
}

fn adamw_params(learning_rate: f64, eps: f64) -> ParamsAdamW {
    ParamsAdamW {
        lr: learning_rate,
        eps,
        weight_decay: 0.0,
        ..Default::default()
    }
}

fn encode_pair_fixed<T: TextTokenizer + ?Sized>(
    tokenizer: &T,
    text_a: &str,
    text_b: &str,
    max_length: usize,
) -> Result<(TokenizedInput, TokenizedInput)> {
    Ok((
        encode_fixed(tokenizer, text_a, max_length)?,
        encode_fixed(tokenizer, text_b, max_length)?,
    ))
}

/// Row-wise cosine similarity of two `[batch, hidden]` tensors
pub fn cosine_similarity(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let dot = (a * b)?.sum(D::Minus1)?;
    let norm_a = a.sqr()?.sum(D::Minus1)?.sqrt()?;
    let norm_b = b.sqr()?.sum(D::Minus1)?.sqrt()?;
    let denom = (norm_a * norm_b)?.maximum(COSINE_EPS)?;
    Ok((dot / denom)?)
}

/// Mean of token embeddings `[batch, seq, hidden]` over unmasked positions
pub fn mean_pool(token_embeddings: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let mask = attention_mask
        .to_dtype(token_embeddings.dtype())?
        .unsqueeze(D::Minus1)?;
    let summed = token_embeddings.broadcast_mul(&mask)?.sum(1)?;
    let counts = mask.sum(1)?.maximum(1e-9)?;
    Ok(summed.broadcast_div(&counts)?)
}

impl<M: SentenceEncoder, T: TextTokenizer> Finetunable for VectorisationModel<M, T> {
    type Example = EncodedExample;

    fn training_step(&mut self, batch: &[EncodedExample], batch_idx: usize) -> Result<Tensor> {
        let loss = self.pair_loss(batch)?;
        debug!("training batch {}: {} pairs", batch_idx, batch.len());
        Ok(loss)
    }

    fn validation_step(&mut self, batch: &[EncodedExample], _batch_idx: usize) -> Result<Tensor> {
        Ok(self.pair_loss(batch)?.detach())
    }

    fn configure_optimizers(&self) -> Result<Box<dyn StepOptimizer>> {
        let vars = self.handle.model().trainable_vars();
        Ok(Box::new(AccumulatingAdamW::new(vars, self.optimizer.clone())?))
    }

    fn device(&self) -> Device {
        self.handle.device()
    }

    fn set_device(&mut self, device: Device) -> Result<()> {
        self.handle.set_device(device)
    }

    fn mode(&self) -> Mode {
        self.handle.mode()
    }

    fn set_mode(&mut self, mode: Mode) {
        self.handle.set_mode(mode);
    }

    fn reclaim_memory(&self) -> Result<()> {
        device::reclaim_memory(self.handle.tensor_device())
    }
}

impl<M: SentenceEncoder, T: TextTokenizer> LocalVectoriser for VectorisationModel<M, T> {
    fn info(&self) -> &ModelInfo {
        self.handle.info()
    }

    fn vectorise(&self, input: &OneOrMany<String>) -> Result<OneOrMany<Vec<f32>>> {
        VectorisationModel::vectorise(self, input)
    }

    fn finetune(
        &mut self,
        text_pairs: &[(String, String)],
        similarity_scores: &[f32],
        options: &VectorisationFinetuneOptions,
        orchestrator: &FinetuneOrchestrator,
    ) -> Result<FinetuneReport> {
        VectorisationModel::finetune(self, text_pairs, similarity_scores, options, orchestrator)
    }
}
