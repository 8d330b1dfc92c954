//! Automatic batch size discovery
//!
//! Power-of-two scaling: start small, double after every trial that fits,
//! stop at the first allocation failure and keep the last size that worked.
//! Trials run forward and backward passes only. Gradients are dropped
//! after each step and no optimizer is built, so probing never changes
//! weights.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::Finetunable;
use crate::config::BatchSizeProbeConfig;
use crate::error::{Error, Result};
use crate::handle::Mode;

/// Power-of-two batch size search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSizeProbe {
    /// First batch size tried
    pub initial: usize,
    /// Maximum number of doublings
    pub max_trials: usize,
    /// Training steps run at each candidate size
    pub steps_per_trial: usize,
}

impl Default for BatchSizeProbe {
    fn default() -> Self {
        Self {
            initial: 1,
            max_trials: 25,
            steps_per_trial: 3,
        }
    }
}

impl From<&BatchSizeProbeConfig> for BatchSizeProbe {
    fn from(config: &BatchSizeProbeConfig) -> Self {
        Self {
            initial: config.initial,
            max_trials: config.max_trials,
            steps_per_trial: config.steps_per_trial,
        }
    }
}

impl BatchSizeProbe {
    /// Largest batch size that fits, capped at the training set size
    pub fn find<F: Finetunable>(&self, module: &mut F, train: &[F::Example]) -> Result<usize> {
        if train.is_empty() {
            return Err(Error::precondition("batch size search needs training examples"));
        }

        let mut size = self.initial.max(1).min(train.len());
        let mut best = None;

        module.set_mode(Mode::Train);
        for trial in 0..self.max_trials.max(1) {
            match self.try_batch_size(module, train, size) {
                Ok(()) => {
                    debug!("Batch size {} fits (trial {})", size, trial + 1);
                    best = Some(size);
                    if size >= train.len() {
                        debug!("Batch size reached the training set size");
                        break;
                    }
                    size = (size * 2).min(train.len());
                }
                Err(e) if e.is_out_of_memory() => {
                    warn!("Batch size {} failed with out of memory", size);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let found = best.ok_or_else(|| {
            Error::resource_exhausted(format!("batch size {} does not fit on the device", size))
        })?;
        info!("Batch size search finished: {}", found);
        Ok(found)
    }

    fn try_batch_size<F: Finetunable>(
        &self,
        module: &mut F,
        train: &[F::Example],
        size: usize,
    ) -> Result<()> {
        let batch = &train[..size];
        for step in 0..self.steps_per_trial.max(1) {
            let loss = module.training_step(batch, step)?;
            let grads = loss.backward()?;
            drop(grads);
        }
        Ok(())
    }
}
