//! Loss kernels and their gradients.
//!
//! Inputs are `prediction, target` of identical dims with the batch on axis 0. Mean squared
//! error yields one value per batch element; categorical cross-entropy yields the batch mean
//! as a single value.

use nnrt::backend::{BackendError, BackendResult, Kernel, KernelContext};
use nnrt::ir::LossKind;
use nnrt::HostTensor;

use super::{expect_inputs, f32_tensor, f32_values};

const PROBABILITY_FLOOR: f32 = 1e-20;

fn batch_split(pred: &HostTensor, target: &HostTensor) -> BackendResult<(usize, usize)> {
    if pred.dims() != target.dims() {
        return Err(BackendError::shape_mismatch(format!(
            "prediction {:?} and target {:?} differ",
            pred.dims(),
            target.dims()
        )));
    }
    let batch = *pred
        .dims()
        .first()
        .ok_or_else(|| BackendError::shape_mismatch("loss needs at least one dimension"))?;
    if batch == 0 {
        return Err(BackendError::shape_mismatch("loss needs a non-empty batch"));
    }
    Ok((batch, pred.element_count() / batch))
}

/// Per batch element: mean of squared differences.
pub fn mse(pred: &[f32], target: &[f32], batch: usize) -> Vec<f32> {
    let size = pred.len() / batch.max(1);
    (0..batch)
        .map(|b| {
            let range = b * size..(b + 1) * size;
            let sum: f32 = pred[range.clone()]
                .iter()
                .zip(&target[range])
                .map(|(p, t)| (p - t) * (p - t))
                .sum();
            sum / size as f32
        })
        .collect()
}

/// `-2 * (target - pred) / size` element-wise, `size` being the per-example element count.
pub fn mse_grad(pred: &[f32], target: &[f32], size: usize) -> Vec<f32> {
    pred.iter()
        .zip(target)
        .map(|(p, t)| -2.0 * (t - p) / size as f32)
        .collect()
}

fn check_probabilities(pred: &[f32]) -> BackendResult<()> {
    match pred.iter().find(|p| !(0.0..=1.0).contains(*p)) {
        Some(value) => Err(BackendError::invalid_input(format!(
            "categorical cross-entropy needs predictions in [0, 1], found {value}"
        ))),
        None => Ok(()),
    }
}

/// Batch mean of `-log(max(pred, 1e-20)) * target` over nonzero targets.
pub fn categorical_cross_entropy(pred: &[f32], target: &[f32], batch: usize) -> BackendResult<f32> {
    check_probabilities(pred)?;
    let sum: f32 = pred
        .iter()
        .zip(target)
        .filter(|(_, t)| **t != 0.0)
        .map(|(p, t)| -p.max(PROBABILITY_FLOOR).ln() * t)
        .sum();
    Ok(sum / batch.max(1) as f32)
}

/// `-(target / max(pred, 1e-20))` element-wise.
pub fn cce_grad(pred: &[f32], target: &[f32]) -> BackendResult<Vec<f32>> {
    check_probabilities(pred)?;
    Ok(pred
        .iter()
        .zip(target)
        .map(|(p, t)| -(t / p.max(PROBABILITY_FLOOR)))
        .collect())
}

pub struct LossKernel {
    pub kind: LossKind,
}

impl Kernel for LossKernel {
    fn name(&self) -> &'static str {
        "Loss"
    }

    fn run(&self, inputs: &[&HostTensor], _cx: &KernelContext<'_>) -> BackendResult<Vec<HostTensor>> {
        expect_inputs(self.name(), inputs, 2)?;
        let (batch, _) = batch_split(inputs[0], inputs[1])?;
        let pred = f32_values(self.name(), inputs[0])?;
        let target = f32_values(self.name(), inputs[1])?;
        let output = match self.kind {
            LossKind::MeanSquaredError => f32_tensor(&[batch], mse(pred, target, batch))?,
            LossKind::CategoricalCrossEntropy => {
                f32_tensor(&[1], vec![categorical_cross_entropy(pred, target, batch)?])?
            }
        };
        Ok(vec![output])
    }

    /// Gradient w.r.t. the prediction scaled by the incoming loss gradient; the target gets none.
    fn backward(
        &self,
        inputs: &[&HostTensor],
        _outputs: &[&HostTensor],
        output_grads: &[&HostTensor],
        _cx: &KernelContext<'_>,
    ) -> BackendResult<Vec<Option<HostTensor>>> {
        expect_inputs(self.name(), inputs, 2)?;
        let (batch, size) = batch_split(inputs[0], inputs[1])?;
        let pred = f32_values(self.name(), inputs[0])?;
        let target = f32_values(self.name(), inputs[1])?;
        let seed = f32_values(self.name(), output_grads[0])?;

        let mut grad = match self.kind {
            LossKind::MeanSquaredError => mse_grad(pred, target, size),
            LossKind::CategoricalCrossEntropy => cce_grad(pred, target)?,
        };
        for b in 0..batch {
            let scale = match self.kind {
                LossKind::MeanSquaredError => seed.get(b),
                LossKind::CategoricalCrossEntropy => seed.first(),
            }
            .copied()
            .unwrap_or(1.0);
            grad[b * size..(b + 1) * size]
                .iter_mut()
                .for_each(|g| *g *= scale);
        }
        Ok(vec![Some(f32_tensor(inputs[0].dims(), grad)?), None])
    }
}
