//! Finetuning lifecycle
//!
//! A finetune call walks a fixed sequence of phases:
//!
//! ```text
//! Idle -> Splitting -> [BatchSizeSearch] -> (Training -> Validating)* -> EarlyStopped | EpochsExhausted -> Cleanup -> Idle
//! ```
//!
//! The orchestrator owns the phase order and the batch-size/accumulation
//! policy. Loss computation belongs to the task module ([`Finetunable`]);
//! the epoch loop belongs to a [`Trainer`], [`EpochTrainer`] unless the
//! caller brings one. Cleanup runs on every exit path, so the model is back
//! on its original device and in evaluation mode whenever `finetune` returns.

pub mod batch_size;
pub mod optimizer;
pub mod split;
pub mod trainer;


use candle_core::Tensor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, instrument, warn};

use crate::config::{BatchSizeProbeConfig, FinetuneConfig};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::handle::Mode;

pub use batch_size::BatchSizeProbe;
pub use optimizer::{AccumulatingAdamW, StepOptimizer};
pub use split::random_split;
pub use trainer::{EarlyStopping, EpochSummary, EpochTrainer, FitOutcome, Trainer, TrainingPlan};

/// Training contract a task module supplies to the orchestrator
pub trait Finetunable {
    /// One encoded training example
    type Example: Send + Sync;

    /// Loss for one training batch
    fn training_step(&mut self, batch: &[Self::Example], batch_idx: usize) -> Result<Tensor>;

    /// Loss for one validation batch
    fn validation_step(&mut self, batch: &[Self::Example], batch_idx: usize) -> Result<Tensor>;

    /// Optimizer over the module's trainable parameters
    fn configure_optimizers(&self) -> Result<Box<dyn StepOptimizer>>;

    /// Device the model is assigned to
    fn device(&self) -> Device;

    /// Move the model to `device`
    fn set_device(&mut self, device: Device) -> Result<()>;

    /// Current mode
    fn mode(&self) -> Mode;

    /// Switch between training and evaluation
    fn set_mode(&mut self, mode: Mode);

    /// Return freed device buffers to the allocator
    fn reclaim_memory(&self) -> Result<()> {
        Ok(())
    }
}

/// Caller-facing finetune parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinetuneOptions {
    /// Fraction of the dataset held out for validation, in (0, 1)
    pub validation_split: f64,
    /// Maximum number of epochs
    pub epochs: usize,
    /// Per-step batch size; discovered automatically when `None`
    pub batch_size: Option<usize>,
    /// Effective batch size to reach through gradient accumulation
    pub optimal_batch_size: Option<usize>,
    /// Stop once validation loss stops improving
    pub early_stopping: bool,
    /// Validation cycles without improvement before stopping
    pub patience: usize,
}

impl Default for FinetuneOptions {
    fn default() -> Self {
        Self {
            validation_split: 0.15,
            epochs: 20,
            batch_size: None,
            optimal_batch_size: None,
            early_stopping: true,
            patience: 1,
        }
    }
}

impl From<&FinetuneConfig> for FinetuneOptions {
    fn from(config: &FinetuneConfig) -> Self {
        Self {
            validation_split: config.validation_split,
            epochs: config.epochs,
            batch_size: config.batch_size,
            optimal_batch_size: config.optimal_batch_size,
            early_stopping: config.early_stopping,
            patience: config.patience,
        }
    }
}

impl FinetuneOptions {
    /// Check ranges before any work starts
    pub fn validate(&self) -> Result<()> {
        if !(self.validation_split > 0.0 && self.validation_split < 1.0) {
            return Err(Error::precondition(format!(
                "validation_split must be in (0, 1), got {}",
                self.validation_split
            )));
        }
        if self.epochs == 0 {
            return Err(Error::precondition("epochs must be >= 1"));
        }
        if self.batch_size == Some(0) {
            return Err(Error::precondition("batch_size must be >= 1"));
        }
        if self.optimal_batch_size == Some(0) {
            return Err(Error::precondition("optimal_batch_size must be >= 1"));
        }
        if self.early_stopping && self.patience == 0 {
            return Err(Error::precondition("patience must be >= 1"));
        }
        Ok(())
    }
}

/// Lifecycle phases, in the order they may occur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Splitting,
    BatchSizeSearch,
    Training,
    Validating,
    EarlyStopped,
    EpochsExhausted,
    Cleanup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Splitting => "splitting",
            Phase::BatchSizeSearch => "batch size search",
            Phase::Training => "training",
            Phase::Validating => "validating",
            Phase::EarlyStopped => "early stopped",
            Phase::EpochsExhausted => "epochs exhausted",
            Phase::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// State of one finetune call. Never outlives the call that created it.
#[derive(Debug)]
pub struct FinetuneJob<E> {
    pub train: Vec<E>,
    pub valid: Vec<E>,
    pub batch_size: Option<usize>,
    pub optimal_batch_size: Option<usize>,
    pub epochs: usize,
    pub early_stopping: bool,
    pub accumulate_grad_batches: usize,
}

impl<E> FinetuneJob<E> {
    /// Split `dataset` into training and validation partitions
    pub fn split(dataset: Vec<E>, options: &FinetuneOptions) -> Result<Self> {
        let total = dataset.len();
        let (train, valid) = random_split(dataset, options.validation_split);
        if train.is_empty() {
            return Err(Error::precondition(format!(
                "{} examples leave no training data with validation_split={}",
                total, options.validation_split
            )));
        }
        info!("Split {} examples into {} train / {} validation", total, train.len(), valid.len());

        Ok(Self {
            train,
            valid,
            batch_size: options.batch_size,
            optimal_batch_size: options.optimal_batch_size,
            epochs: options.epochs,
            early_stopping: options.early_stopping,
            accumulate_grad_batches: 1,
        })
    }
}

/// Gradient accumulation factor for a memory-safe `batch_size`.
///
/// The per-step batch never exceeds `batch_size`; reaching a larger
/// `optimal_batch_size` is done purely by accumulating gradients.
pub fn accumulate_grad_batches(batch_size: usize, optimal_batch_size: Option<usize>) -> usize {
    accumulation_plan(batch_size, optimal_batch_size).1
}

/// Per-step batch size and accumulation factor
pub fn accumulation_plan(batch_size: usize, optimal_batch_size: Option<usize>) -> (usize, usize) {
    match optimal_batch_size {
        Some(optimal) => {
            let step_batch = batch_size.min(optimal).max(1);
            (step_batch, (optimal / step_batch).max(1))
        }
        None => (batch_size, 1),
    }
}

/// What a finetune call did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinetuneReport {
    /// Phases visited, in order
    pub phases: Vec<Phase>,
    pub train_examples: usize,
    pub validation_examples: usize,
    /// Per-step batch size used for training
    pub batch_size: usize,
    pub accumulate_grad_batches: usize,
    pub epochs: Vec<EpochSummary>,
    pub stopped_early: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl FinetuneReport {
    pub fn epochs_completed(&self) -> usize {
        self.epochs.len()
    }

    /// Validation loss of the last epoch that had one
    pub fn final_val_loss(&self) -> Option<f64> {
        self.epochs.iter().rev().find_map(|e| e.val_loss)
    }
}

/// Drives a [`Finetunable`] module through the finetune lifecycle
#[derive(Debug, Clone, Default)]
pub struct FinetuneOrchestrator {
    probe: BatchSizeProbe,
}

impl FinetuneOrchestrator {
    pub fn new(probe: BatchSizeProbe) -> Self {
        Self { probe }
    }

    pub fn from_config(config: &BatchSizeProbeConfig) -> Self {
        Self::new(BatchSizeProbe::from(config))
    }

    /// Finetune `module` on `dataset`.
    ///
    /// Fails with [`Error::DeviceUnavailable`] before touching the dataset when
    /// the model is not on a GPU. Failures from the module or trainer are
    /// returned as [`Error::Delegate`] after cleanup has restored the model.
    #[instrument(skip_all, fields(examples = dataset.len()))]
    pub fn finetune<F: Finetunable>(
        &self,
        module: &mut F,
        dataset: Vec<F::Example>,
        options: &FinetuneOptions,
        trainer: Option<&mut dyn Trainer<F>>,
    ) -> Result<FinetuneReport> {
        options.validate()?;

        let original_device = module.device();
        if !original_device.is_gpu() {
            return Err(Error::device_unavailable(format!(
                "You need a GPU-capable device for finetuning, model is on {}",
                original_device
            )));
        }
        if dataset.is_empty() {
            return Err(Error::precondition("cannot finetune on an empty dataset"));
        }

        let started_at = Utc::now();
        let mut phases = vec![Phase::Splitting];
        let mut job = FinetuneJob::split(dataset, options)?;

        let result = self.run(module, &mut job, options, trainer, &mut phases);

        phases.push(Phase::Cleanup);
        let train_examples = job.train.len();
        let validation_examples = job.valid.len();
        drop(job);
        let restored = module.set_device(original_device);
        module.set_mode(Mode::Eval);

        let (batch_size, accumulate_grad_batches, outcome) = result?;
        restored?;

        info!(
            "Training finished after {} epoch(s){}",
            outcome.epochs.len(),
            if outcome.stopped_early { " (early stopped)" } else { "" }
        );

        Ok(FinetuneReport {
            phases,
            train_examples,
            validation_examples,
            batch_size,
            accumulate_grad_batches,
            epochs: outcome.epochs,
            stopped_early: outcome.stopped_early,
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn run<F: Finetunable>(
        &self,
        module: &mut F,
        job: &mut FinetuneJob<F::Example>,
        options: &FinetuneOptions,
        trainer: Option<&mut dyn Trainer<F>>,
        phases: &mut Vec<Phase>,
    ) -> Result<(usize, usize, FitOutcome)> {
        let batch_size = match job.batch_size {
            Some(batch_size) => batch_size,
            None => {
                phases.push(Phase::BatchSizeSearch);
                info!("Finding the optimal batch size...");
                let found = self
                    .probe
                    .find(module, &job.train)
                    .map_err(|e| Error::delegate(Phase::BatchSizeSearch.to_string(), e))?;
                // The probe's buffers are gone; hand them back before training allocates.
                module
                    .reclaim_memory()
                    .map_err(|e| Error::delegate(Phase::BatchSizeSearch.to_string(), e))?;
                info!("Using batch size {}", found);
                found
            }
        };

        let (step_batch, accumulate) = accumulation_plan(batch_size, job.optimal_batch_size);
        job.batch_size = Some(step_batch);
        job.accumulate_grad_batches = accumulate;

        if job.early_stopping && job.valid.is_empty() {
            warn!("No validation examples after splitting; early stopping is disabled");
        }

        let plan = TrainingPlan {
            batch_size: step_batch,
            accumulate_grad_batches: accumulate,
            max_epochs: job.epochs,
            early_stopping: job.early_stopping.then(|| EarlyStopping::new(options.patience)),
        };

        module.set_mode(Mode::Train);
        let outcome = match trainer {
            Some(trainer) => trainer.fit(module, &job.train, &job.valid, &plan),
            None => EpochTrainer::default().fit(module, &job.train, &job.valid, &plan),
        }
        .map_err(|e| Error::delegate(Phase::Training.to_string(), e))?;

        for epoch in &outcome.epochs {
            phases.push(Phase::Training);
            if epoch.val_loss.is_some() {
                phases.push(Phase::Validating);
            }
        }
        phases.push(if outcome.stopped_early {
            Phase::EarlyStopped
        } else {
            Phase::EpochsExhausted
        });

        Ok((step_batch, accumulate, outcome))
    }
}
