//! Optimizers with gradient accumulation

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use tracing::trace;

use crate::error::Result;

/// Optimizer interface used by the epoch loop.
///
/// `accumulate` may be called several times before `step`; gradients from
/// all calls are summed and applied together.
pub trait StepOptimizer {
    /// Backpropagate `loss` and add its gradients to the pending sum
    fn accumulate(&mut self, loss: &Tensor) -> Result<()>;

    /// Apply pending gradients and clear them
    fn step(&mut self) -> Result<()>;

    /// Number of parameter updates applied so far
    fn steps(&self) -> usize;

    fn learning_rate(&self) -> f64;
}

/// AdamW over a fixed set of variables, with summed gradient accumulation
pub struct AccumulatingAdamW {
    vars: Vec<Var>,
    inner: AdamW,
    pending: Option<GradStore>,
    steps: usize,
}

impl AccumulatingAdamW {
    pub fn new(vars: Vec<Var>, params: ParamsAdamW) -> Result<Self> {
        let inner = AdamW::new(vars.clone(), params)?;
        Ok(Self {
            vars,
            inner,
            pending: None,
            steps: 0,
        })
    }

    /// Number of variables being optimized
    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }
}

impl StepOptimizer for AccumulatingAdamW {
    fn accumulate(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        let merged = match self.pending.take() {
            None => grads,
            Some(mut acc) => {
                for var in &self.vars {
                    let tensor = var.as_tensor();
                    if let Some(grad) = grads.get(tensor) {
                        let sum = match acc.remove(tensor) {
                            Some(prev) => (prev + grad)?,
                            None => grad.clone(),
                        };
                        acc.insert(tensor, sum);
                    }
                }
                acc
            }
        };
        self.pending = Some(merged);
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        if let Some(grads) = self.pending.take() {
            self.inner.step(&grads)?;
            self.steps += 1;
            trace!("optimizer step {}", self.steps);
        }
        Ok(())
    }

    fn steps(&self) -> usize {
        self.steps
    }

    fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }
}
