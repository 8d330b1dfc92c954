//! Text generation adapter

pub mod finetune;
pub mod params;

use candle_core::Tensor;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::finetune::{FinetuneOrchestrator, FinetuneReport};
use crate::handle::{ModelHandle, ModelInfo, ModelObject};
use crate::input::OneOrMany;
use crate::tokenizer::{batch_tensor, TextTokenizer};

pub use finetune::{GenerationFinetuneOptions, Seq2SeqExample, Seq2SeqFinetuner, Seq2SeqModel};
pub use params::{GenerationConfig, GenerationOptions};

/// Model variants that can be finetuned for generation
pub const FINETUNABLE_MODELS: &[&str] = &["t5", "t5-base-qa-summary-emotion"];

/// Candidates generated for one input: a single string when one sequence
/// was requested, otherwise the full list
pub type Generated = OneOrMany<String>;

/// A model object that can decode continuations
pub trait TextGenerator: ModelObject {
    /// Generate token sequences for a `[1, seq_len]` input.
    ///
    /// Returns `config.return_sequences()` sequences.
    fn generate(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        config: &GenerationConfig,
    ) -> Result<Vec<Vec<u32>>>;

    /// Finetuning capability
    fn as_seq2seq(&self) -> Option<&dyn Seq2SeqModel> {
        None
    }

    fn as_seq2seq_mut(&mut self) -> Option<&mut dyn Seq2SeqModel> {
        None
    }
}

/// Object-safe view of a local generation model, used by the task facade
pub trait LocalGenerator {
    fn info(&self) -> &ModelInfo;

    fn generate(
        &self,
        input: &OneOrMany<String>,
        options: &GenerationOptions,
    ) -> Result<OneOrMany<Generated>>;

    fn supports_finetuning(&self) -> bool;

    fn finetune(
        &mut self,
        input_text: &[String],
        output_text: &[String],
        options: &GenerationFinetuneOptions,
        orchestrator: &FinetuneOrchestrator,
    ) -> Result<FinetuneReport>;
}

/// Generation adapter over a model handle
pub struct GenerationModel<M, T> {
    handle: ModelHandle<M, T>,
}

impl<M: TextGenerator, T: TextTokenizer> GenerationModel<M, T> {
    pub fn new(handle: ModelHandle<M, T>) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &ModelHandle<M, T> {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut ModelHandle<M, T> {
        &mut self.handle
    }

    pub fn into_handle(self) -> ModelHandle<M, T> {
        self.handle
    }

    /// Generate continuations for one text or a list of texts.
    ///
    /// The output has the input's arity. Each item is a single string unless
    /// more than one return sequence was requested.
    #[instrument(skip_all, fields(model = %self.handle.info().name, inputs = input.len()))]
    pub fn generate(
        &self,
        input: &OneOrMany<String>,
        options: &GenerationOptions,
    ) -> Result<OneOrMany<Generated>> {
        let config = options.resolve()?;
        debug!("Resolved generation config: {:?}", config);

        let mut results = Vec::with_capacity(input.len());
        for text in input.as_slice() {
            let mut candidates = self.generate_one(text, &config)?;
            let generated = if config.return_sequences() == 1 {
                if candidates.is_empty() {
                    return Err(Error::delegate(
                        "generation",
                        Error::invalid_input("model returned no sequences"),
                    ));
                }
                OneOrMany::One(candidates.swap_remove(0))
            } else {
                OneOrMany::Many(candidates)
            };
            results.push(generated);
        }

        Ok(input.restore(results))
    }

    fn generate_one(&self, text: &str, config: &GenerationConfig) -> Result<Vec<String>> {
        let tokenizer = self.handle.require_tokenizer()?;
        let encoded = tokenizer.encode(text)?;
        let device = self.handle.tensor_device();
        let input_ids = batch_tensor(&[encoded.input_ids.as_slice()], device)?;
        let attention_mask = batch_tensor(&[encoded.attention_mask.as_slice()], device)?;

        let sequences = self
            .handle
            .model()
            .generate(&input_ids, &attention_mask, config)
            .map_err(|e| Error::delegate("generation", e))?;

        sequences
            .iter()
            .map(|ids| tokenizer.decode(ids, true))
            .collect()
    }

    /// Whether the underlying model carries the seq2seq finetune capability
    pub fn supports_finetuning(&self) -> bool {
        self.handle.model().as_seq2seq().is_some()
    }

    /// Finetune on parallel lists of inputs and expected outputs
    #[instrument(skip_all, fields(model = %self.handle.info().name, examples = input_text.len()))]
    pub fn finetune(
        &mut self,
        input_text: &[String],
        output_text: &[String],
        options: &GenerationFinetuneOptions,
        orchestrator: &FinetuneOrchestrator,
    ) -> Result<FinetuneReport> {
        if !self.supports_finetuning() {
            return Err(Error::unsupported(
                "This model does not support finetuning",
                FINETUNABLE_MODELS,
            ));
        }
        if input_text.len() != output_text.len() {
            return Err(Error::precondition(format!(
                "Input list must match the output list ({} inputs, {} outputs)",
                input_text.len(),
                output_text.len()
            )));
        }
        let device = self.handle.device();
        if !device.is_gpu() {
            return Err(Error::device_unavailable(format!(
                "You need a GPU-capable device for finetuning, model is on {}",
                device
            )));
        }

        let dataset = {
            let tokenizer = self.handle.require_tokenizer()?;
            finetune::encode_examples(tokenizer, input_text, output_text, options)?
        };

        let model = self.handle.model_mut().as_seq2seq_mut().ok_or_else(|| {
            Error::unsupported("This model does not support finetuning", FINETUNABLE_MODELS)
        })?;
        let mut finetuner = Seq2SeqFinetuner::new(model, device, options.learning_rate);
        orchestrator.finetune(&mut finetuner, dataset, &options.finetune, None)
    }
}

impl<M: TextGenerator, T: TextTokenizer> LocalGenerator for GenerationModel<M, T> {
    fn info(&self) -> &ModelInfo {
        self.handle.info()
    }

    fn generate(
        &self,
        input: &OneOrMany<String>,
        options: &GenerationOptions,
    ) -> Result<OneOrMany<Generated>> {
        GenerationModel::generate(self, input, options)
    }

    fn supports_finetuning(&self) -> bool {
        GenerationModel::supports_finetuning(self)
    }

    fn finetune(
        &mut self,
        input_text: &[String],
        output_text: &[String],
        options: &GenerationFinetuneOptions,
        orchestrator: &FinetuneOrchestrator,
    ) -> Result<FinetuneReport> {
        GenerationModel::finetune(self, input_text, output_text, options, orchestrator)
    }
}
