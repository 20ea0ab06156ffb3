use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ir::LossKind;

/// How per-example loss values are folded into the reported loss and its gradient seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LossReduction {
    /// Mean over the loss output elements.
    #[default]
    SumOverBatchSize,
    /// Sum over the loss output elements. Only per-example losses support it; categorical
    /// cross-entropy already yields the batch mean.
    Sum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LossInfo {
    pub kind: LossKind,
    #[serde(default)]
    pub reduction: LossReduction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OptimizerKind {
    #[default]
    Sgd,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerInfo {
    #[serde(default)]
    pub kind: OptimizerKind,
    pub learning_rate: f32,
}

/// Training configuration supplied alongside the compiler options.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingInfo {
    pub loss: LossInfo,
    pub batch_size: usize,
    pub optimizer: OptimizerInfo,
}

impl TrainingInfo {
    pub fn new(kind: LossKind, batch_size: usize, learning_rate: f32) -> Self {
        Self {
            loss: LossInfo {
                kind,
                reduction: LossReduction::default(),
            },
            batch_size,
            optimizer: OptimizerInfo {
                kind: OptimizerKind::Sgd,
                learning_rate,
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::configuration("training batch size must be positive"));
        }
        let lr = self.optimizer.learning_rate;
        if !lr.is_finite() || lr <= 0.0 {
            return Err(Error::configuration(format!(
                "learning rate must be a positive finite number, got {lr}"
            )));
        }
        if self.loss.kind == LossKind::CategoricalCrossEntropy
            && self.loss.reduction == LossReduction::Sum
        {
            return Err(Error::configuration(
                "categorical cross-entropy is reduced to the batch mean; Sum reduction is not supported",
            ));
        }
        Ok(())
    }

    /// Gradient seeded into each element of the loss output.
    pub(crate) fn loss_seed(&self, loss_elements: usize) -> f32 {
        match self.loss.reduction {
            LossReduction::SumOverBatchSize => 1.0 / loss_elements.max(1) as f32,
            LossReduction::Sum => 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_learning_rate_is_a_configuration_error() {
        let info = TrainingInfo::new(LossKind::MeanSquaredError, 4, 0.0);
        assert!(matches!(info.validate(), Err(Error::Configuration(_))));
        let info = TrainingInfo::new(LossKind::MeanSquaredError, 0, 0.1);
        assert!(info.validate().is_err());
    }

    #[test]
    fn cross_entropy_rejects_sum_reduction() {
        let mut info = TrainingInfo::new(LossKind::CategoricalCrossEntropy, 4, 0.1);
        assert!(info.validate().is_ok());
        info.loss.reduction = LossReduction::Sum;
        assert!(matches!(info.validate(), Err(Error::Configuration(_))));
        info.loss.kind = LossKind::MeanSquaredError;
        assert!(info.validate().is_ok());
    }

    #[test]
    fn seed_follows_reduction() {
        let mut info = TrainingInfo::new(LossKind::MeanSquaredError, 4, 0.1);
        assert_eq!(info.loss_seed(4), 0.25);
        info.loss.reduction = LossReduction::Sum;
        assert_eq!(info.loss_seed(4), 1.0);
    }
}
