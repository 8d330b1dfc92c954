//! Modelwright - uniform model handles and a finetuning lifecycle for
//! pretrained sequence models
//!
//! A [`ModelHandle`] wraps an externally built model object with its
//! tokenizer, device and metadata. Task adapters build on it:
//!
//! - [`generation`]: decoding parameter resolution and output reshaping
//! - [`classification`]: zero-shot scoring through entailment
//! - [`vectorisation`]: embeddings and similarity-regression finetuning
//!
//! Finetuning always goes through the [`FinetuneOrchestrator`], which splits
//! the data, finds a batch size that fits the device and runs the training
//! loop. The [`tasks`] facades pick a local model or the remote API.

#![warn(rustdoc::broken_intra_doc_links)]

pub mod classification;
pub mod config;
pub mod device;
pub mod error;
pub mod finetune;
pub mod generation;
pub mod handle;
pub mod input;
pub mod logging;
pub mod tasks;
pub mod tokenizer;
pub mod vectorisation;

// Re-exports
pub use classification::{ClassificationModel, EntailmentModel, LabelScores, LocalClassifier};
pub use config::Config;
pub use device::Device;
pub use error::{Error, Result};
pub use finetune::{Finetunable, FinetuneOptions, FinetuneOrchestrator, FinetuneReport, Phase};
pub use generation::{
    GenerationConfig, GenerationModel, GenerationOptions, LocalGenerator, TextGenerator,
};
pub use handle::{Mode, ModelHandle, ModelInfo, ModelObject};
pub use input::OneOrMany;
pub use tasks::{TextClassification, TextGeneration, TextVectorisation};
pub use tokenizer::{TextTokenizer, TokenizedInput};
pub use vectorisation::{LocalVectoriser, SentenceEncoder, VectorisationModel};
