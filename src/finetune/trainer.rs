//! Epoch loop and early stopping

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

use super::{Finetunable, StepOptimizer};
use crate::error::{Error, Result};
use crate::handle::Mode;

/// Stops training once the monitored validation loss stops improving
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStopping {
    /// Metric being monitored
    pub monitor: String,
    /// Validation cycles without improvement tolerated
    pub patience: usize,
    /// Minimum decrease that counts as improvement
    pub min_delta: f64,
    best_score: Option<f64>,
    cycles_since_best: usize,
}

impl EarlyStopping {
    /// Monitor `val_loss` with the given patience
    pub fn new(patience: usize) -> Self {
        Self {
            monitor: "val_loss".to_string(),
            patience,
            min_delta: 0.0,
            best_score: None,
            cycles_since_best: 0,
        }
    }

    /// Record a validation loss; returns true when training should stop
    pub fn update(&mut self, current: f64) -> bool {
        let improved = match self.best_score {
            None => true,
            Some(best) => current < best - self.min_delta,
        };

        if improved {
            self.best_score = Some(current);
            self.cycles_since_best = 0;
            false
        } else {
            self.cycles_since_best += 1;
            self.cycles_since_best >= self.patience
        }
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best_score
    }
}

/// Parameters the orchestrator hands to a trainer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingPlan {
    pub batch_size: usize,
    pub accumulate_grad_batches: usize,
    pub max_epochs: usize,
    pub early_stopping: Option<EarlyStopping>,
}

/// Losses for one epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: f64,
    /// `None` when there was no validation data
    pub val_loss: Option<f64>,
}

/// What a trainer's fit produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitOutcome {
    pub epochs: Vec<EpochSummary>,
    pub stopped_early: bool,
    pub optimizer_steps: usize,
}

/// Runs the training loop for a module
pub trait Trainer<F: Finetunable> {
    fn fit(
        &mut self,
        module: &mut F,
        train: &[F::Example],
        valid: &[F::Example],
        plan: &TrainingPlan,
    ) -> Result<FitOutcome>;
}

/// Sequential epoch loop: train over every batch, validate, check early stopping
#[derive(Debug, Clone, Default)]
pub struct EpochTrainer;

impl EpochTrainer {
    fn train_epoch<F: Finetunable>(
        &self,
        module: &mut F,
        train: &[F::Example],
        plan: &TrainingPlan,
        optimizer: &mut dyn StepOptimizer,
    ) -> Result<f64> {
        let accumulate = plan.accumulate_grad_batches.max(1);
        let mut total_loss = 0.0;
        let mut num_batches = 0usize;
        let mut pending = 0usize;

        module.set_mode(Mode::Train);
        for (batch_idx, batch) in train.chunks(plan.batch_size.max(1)).enumerate() {
            let loss = module.training_step(batch, batch_idx)?;
            total_loss += scalar(&loss)?;
            num_batches += 1;

            let scaled = if accumulate > 1 {
                loss.affine(1.0 / accumulate as f64, 0.0)?
            } else {
                loss
            };
            optimizer.accumulate(&scaled)?;
            pending += 1;

            if pending == accumulate {
                optimizer.step()?;
                pending = 0;
            }
        }
        if pending > 0 {
            optimizer.step()?;
        }

        Ok(if num_batches > 0 { total_loss / num_batches as f64 } else { 0.0 })
    }

    fn validate<F: Finetunable>(
        &self,
        module: &mut F,
        valid: &[F::Example],
        batch_size: usize,
    ) -> Result<f64> {
        module.set_mode(Mode::Eval);
        let mut total_loss = 0.0;
        let mut num_batches = 0usize;
        for (batch_idx, batch) in valid.chunks(batch_size.max(1)).enumerate() {
            let loss = module.validation_step(batch, batch_idx)?;
            total_loss += scalar(&loss)?;
            num_batches += 1;
        }
        Ok(total_loss / num_batches.max(1) as f64)
    }
}

impl<F: Finetunable> Trainer<F> for EpochTrainer {
    fn fit(
        &mut self,
        module: &mut F,
        train: &[F::Example],
        valid: &[F::Example],
        plan: &TrainingPlan,
    ) -> Result<FitOutcome> {
        if plan.batch_size == 0 {
            return Err(Error::precondition("batch size must be >= 1"));
        }

        let mut optimizer = module.configure_optimizers()?;
        let mut early_stopping = plan.early_stopping.clone();
        let mut outcome = FitOutcome::default();

        info!(
            "Training {} examples, batch size {}, accumulating {} batch(es), up to {} epoch(s)",
            train.len(),
            plan.batch_size,
            plan.accumulate_grad_batches,
            plan.max_epochs
        );

        for epoch in 0..plan.max_epochs {
            let epoch_start = Instant::now();
            let train_loss = self.train_epoch(module, train, plan, optimizer.as_mut())?;

            let val_loss = if valid.is_empty() {
                None
            } else {
                Some(self.validate(module, valid, plan.batch_size)?)
            };

            debug!(
                "Epoch {}/{} - train_loss: {:.4}, val_loss: {:?}, time: {:?}",
                epoch + 1,
                plan.max_epochs,
                train_loss,
                val_loss,
                epoch_start.elapsed()
            );
            outcome.epochs.push(EpochSummary {
                epoch,
                train_loss,
                val_loss,
            });

            if let (Some(stopper), Some(val_loss)) = (early_stopping.as_mut(), val_loss) {
                if stopper.update(val_loss) {
                    info!(
                        "Early stopping: val_loss has not improved on {:.4} for {} epoch(s)",
                        stopper.best_score().unwrap_or(val_loss),
                        stopper.patience
                    );
                    outcome.stopped_early = true;
                    break;
                }
            }
        }

        outcome.optimizer_steps = optimizer.steps();
        Ok(outcome)
    }
}

/// Mean value of a loss tensor as f64
pub(crate) fn scalar(loss: &Tensor) -> Result<f64> {
    Ok(loss.mean_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_early_stopping_patience_one() {
        let mut stopper = EarlyStopping::new(1);
        assert!(!stopper.update(1.0));
        assert!(!stopper.update(0.8));
        assert!(stopper.update(0.9));
        assert_eq!(stopper.best_score(), Some(0.8));
    }

    #[test]
    fn test_early_stopping_equal_loss_is_not_improvement() {
        let mut stopper = EarlyStopping::new(2);
        assert!(!stopper.update(0.5));
        assert!(!stopper.update(0.5));
        assert!(stopper.update(0.5));
    }

    #[test]
    fn test_improvement_resets_counter() {
        let mut stopper = EarlyStopping::new(2);
        stopper.update(1.0);
        assert!(!stopper.update(1.1));
        assert!(!stopper.update(0.7));
        assert!(!stopper.update(0.8));
        assert!(stopper.update(0.9));
    }

    #[test]
    fn test_scalar_of_rank0_and_vector() {
        let device = candle_core::Device::Cpu;
        assert_eq!(scalar(&Tensor::new(0.25f32, &device).unwrap()).unwrap(), 0.25);
        assert_eq!(scalar(&Tensor::new(&[1.0f32, 3.0], &device).unwrap()).unwrap(), 2.0);
    }
}
