//! Softmax and L2 normalization over the last axis.

use nnrt::backend::{BackendError, BackendResult, Kernel, KernelContext};
use nnrt::HostTensor;

use super::{expect_inputs, f32_tensor, f32_values};

const L2_EPSILON: f32 = 1e-6;

fn last_axis(op: &str, tensor: &HostTensor) -> BackendResult<usize> {
    match tensor.dims().last() {
        Some(depth) if *depth > 0 => Ok(*depth),
        _ => Err(BackendError::shape_mismatch(format!(
            "{op} needs a non-empty last axis, got {:?}",
            tensor.dims()
        ))),
    }
}

pub struct SoftmaxKernel {
    pub beta: f32,
}

impl Kernel for SoftmaxKernel {
    fn name(&self) -> &'static str {
        "Softmax"
    }

    fn run(&self, inputs: &[&HostTensor], _cx: &KernelContext<'_>) -> BackendResult<Vec<HostTensor>> {
        expect_inputs(self.name(), inputs, 1)?;
        let depth = last_axis(self.name(), inputs[0])?;
        let values = f32_values(self.name(), inputs[0])?;
        let mut out = Vec::with_capacity(values.len());
        for row in values.chunks(depth) {
            let scaled: Vec<f32> = row.iter().map(|x| x * self.beta).collect();
            let max = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let exps: Vec<f32> = scaled.iter().map(|x| (x - max).exp()).collect();
            let sum: f32 = exps.iter().sum();
            out.extend(exps.iter().map(|e| e / sum));
        }
        Ok(vec![f32_tensor(inputs[0].dims(), out)?])
    }

    fn backward(
        &self,
        inputs: &[&HostTensor],
        outputs: &[&HostTensor],
        output_grads: &[&HostTensor],
        _cx: &KernelContext<'_>,
    ) -> BackendResult<Vec<Option<HostTensor>>> {
        expect_inputs(self.name(), inputs, 1)?;
        let depth = last_axis(self.name(), outputs[0])?;
        let y = f32_values(self.name(), outputs[0])?;
        let dy = f32_values(self.name(), output_grads[0])?;
        let mut dx = Vec::with_capacity(y.len());
        for (y_row, dy_row) in y.chunks(depth).zip(dy.chunks(depth)) {
            let dot: f32 = y_row.iter().zip(dy_row).map(|(a, b)| a * b).sum();
            dx.extend(
                y_row
                    .iter()
                    .zip(dy_row)
                    .map(|(yi, gi)| self.beta * yi * (gi - dot)),
            );
        }
        Ok(vec![Some(f32_tensor(inputs[0].dims(), dx)?)])
    }
}

pub struct L2NormalizeKernel;

impl Kernel for L2NormalizeKernel {
    fn name(&self) -> &'static str {
        "L2Normalize"
    }

    fn run(&self, inputs: &[&HostTensor], _cx: &KernelContext<'_>) -> BackendResult<Vec<HostTensor>> {
        expect_inputs(self.name(), inputs, 1)?;
        let depth = last_axis(self.name(), inputs[0])?;
        let values = f32_values(self.name(), inputs[0])?;
        let mut out = Vec::with_capacity(values.len());
        for row in values.chunks(depth) {
            let norm = row.iter().map(|x| x * x).sum::<f32>().max(L2_EPSILON).sqrt();
            out.extend(row.iter().map(|x| x / norm));
        }
        Ok(vec![f32_tensor(inputs[0].dims(), out)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nnrt::ir::OperationIndex;

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = HostTensor::from_f32(&[2, 3], vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0]).unwrap();
        let cx = KernelContext::new(OperationIndex::new(0), None);
        let out = SoftmaxKernel { beta: 1.0 }.run(&[&x], &cx).unwrap();
        for row in out[0].as_f32().unwrap().chunks(3) {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn negative_beta_stays_finite_on_wide_rows() {
        let x = HostTensor::from_f32(&[1, 3], vec![-100.0, 0.0, 100.0]).unwrap();
        let cx = KernelContext::new(OperationIndex::new(0), None);
        let out = SoftmaxKernel { beta: -1.0 }.run(&[&x], &cx).unwrap();
        let row = out[0].as_f32().unwrap();
        assert!(row.iter().all(|p| p.is_finite()));
        assert!((row[0] - 1.0).abs() < 1e-6);
        assert!(row[2] < 1e-30);
    }

    #[test]
    fn l2_normalize_yields_unit_rows() {
        let x = HostTensor::from_f32(&[1, 2], vec![3.0, 4.0]).unwrap();
        let cx = KernelContext::new(OperationIndex::new(0), None);
        let out = L2NormalizeKernel.run(&[&x], &cx).unwrap();
        assert_eq!(out[0].as_f32().unwrap(), &[0.6, 0.8]);
    }
}
