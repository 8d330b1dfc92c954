//! Seq2seq finetuning for generation models

use candle_core::{Tensor, Var};
use candle_nn::ParamsAdamW;
use serde::{Deserialize, Serialize};

use super::TextGenerator;
use crate::config::FinetuneConfig;
use crate::device::{self, Device};
use crate::error::Result;
use crate::finetune::{AccumulatingAdamW, Finetunable, FinetuneOptions, StepOptimizer};
use crate::handle::Mode;
use crate::tokenizer::{batch_tensor, encode_fixed, TextTokenizer, TokenizedInput};

/// A generation model that can compute a supervised loss against target text
pub trait Seq2SeqModel: TextGenerator {
    /// Mean cross-entropy of `labels` given the inputs. Positions where
    /// `labels_mask` is zero are ignored.
    fn loss(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        labels: &Tensor,
        labels_mask: &Tensor,
    ) -> Result<Tensor>;

    /// Parameters updated during finetuning
    fn trainable_vars(&self) -> Vec<Var>;
}

/// Finetune parameters for generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationFinetuneOptions {
    pub finetune: FinetuneOptions,
    /// Tokens kept from each input text
    pub max_input_length: usize,
    /// Tokens kept from each target text
    pub max_output_length: usize,
    pub learning_rate: f64,
}

impl Default for GenerationFinetuneOptions {
    fn default() -> Self {
        Self {
            finetune: FinetuneOptions::default(),
            max_input_length: 128,
            max_output_length: 32,
            learning_rate: 1e-4,
        }
    }
}

impl GenerationFinetuneOptions {
    /// Defaults taken from the `finetune` configuration section
    pub fn from_config(config: &FinetuneConfig) -> Self {
        let defaults = Self::default();
        Self {
            finetune: FinetuneOptions::from(config),
            max_input_length: config.max_input_length.unwrap_or(defaults.max_input_length),
            ..defaults
        }
    }
}

/// One encoded (input, target) pair
#[derive(Debug, Clone, PartialEq)]
pub struct Seq2SeqExample {
    pub input: TokenizedInput,
    pub labels: TokenizedInput,
}

pub(crate) fn encode_examples<T: TextTokenizer + ?Sized>(
    tokenizer: &T,
    input_text: &[String],
    output_text: &[String],
    options: &GenerationFinetuneOptions,
) -> Result<Vec<Seq2SeqExample>> {
    input_text
        .iter()
        .zip(output_text)
        .map(|(input, output)| {
            Ok(Seq2SeqExample {
                input: encode_fixed(tokenizer, input, options.max_input_length)?,
                labels: encode_fixed(tokenizer, output, options.max_output_length)?,
            })
        })
        .collect()
}

/// Adapts a [`Seq2SeqModel`] to the finetune lifecycle
pub struct Seq2SeqFinetuner<'a> {
    model: &'a mut dyn Seq2SeqModel,
    device: Device,
    learning_rate: f64,
}

impl<'a> Seq2SeqFinetuner<'a> {
    pub fn new(model: &'a mut dyn Seq2SeqModel, device: Device, learning_rate: f64) -> Self {
        Self {
            model,
            device,
            learning_rate,
        }
    }

    fn batch_loss(&self, batch: &[Seq2SeqExample]) -> Result<Tensor> {
        let device = self.model.tensor_device();
        let input_ids = batch_tensor(&column(batch, |e| e.input.input_ids.as_slice()), device)?;
        let attention_mask =
            batch_tensor(&column(batch, |e| e.input.attention_mask.as_slice()), device)?;
        let labels = batch_tensor(&column(batch, |e| e.labels.input_ids.as_slice()), device)?;
        let labels_mask =
            batch_tensor(&column(batch, |e| e.labels.attention_mask.as_slice()), device)?;

        self.model
            .loss(&input_ids, &attention_mask, &labels, &labels_mask)
    }
}

fn column<'b>(
    batch: &'b [Seq2SeqExample],
    select: impl Fn(&'b Seq2SeqExample) -> &'b [u32],
) -> Vec<&'b [u32]> {
    batch.iter().map(select).collect()
}

impl Finetunable for Seq2SeqFinetuner<'_> {
    type Example = Seq2SeqExample;

    fn training_step(&mut self, batch: &[Seq2SeqExample], _batch_idx: usize) -> Result<Tensor> {
        self.batch_loss(batch)
    }

    fn validation_step(&mut self, batch: &[Seq2SeqExample], _batch_idx: usize) -> Result<Tensor> {
        Ok(self.batch_loss(batch)?.detach())
    }

    fn configure_optimizers(&self) -> Result<Box<dyn StepOptimizer>> {
        let params = ParamsAdamW {
            lr: self.learning_rate,
            ..Default::default()
        };
        Ok(Box::new(AccumulatingAdamW::new(self.model.trainable_vars(), params)?))
    }

    fn device(&self) -> Device {
        self.device
    }

    fn set_device(&mut self, device: Device) -> Result<()> {
        self.model.to_device(device)?;
        self.device = device;
        Ok(())
    }

    fn mode(&self) -> Mode {
        self.model.mode()
    }

    fn set_mode(&mut self, mode: Mode) {
        self.model.set_mode(mode);
    }

    fn reclaim_memory(&self) -> Result<()> {
        device::reclaim_memory(self.model.tensor_device())
    }
}
