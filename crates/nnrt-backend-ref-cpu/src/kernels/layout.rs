//! Kernels that only move elements: reshape, permute (copy) and transpose.

use nnrt::backend::{BackendError, BackendResult, Kernel, KernelContext};
use nnrt::tensor::contiguous_strides;
use nnrt::HostTensor;

use super::{expect_inputs, f32_tensor, f32_values, unravel_index};

/// Reinterprets the input with the planned output dims.
pub struct ReshapeKernel {
    pub dims: Vec<usize>,
}

impl Kernel for ReshapeKernel {
    fn name(&self) -> &'static str {
        "Reshape"
    }

    fn run(&self, inputs: &[&HostTensor], _cx: &KernelContext<'_>) -> BackendResult<Vec<HostTensor>> {
        expect_inputs(self.name(), inputs, 1)?;
        let reshaped = inputs[0]
            .clone()
            .reshaped(&self.dims)
            .map_err(|err| BackendError::shape_mismatch(err.to_string()))?;
        Ok(vec![reshaped])
    }

    fn backward(
        &self,
        inputs: &[&HostTensor],
        _outputs: &[&HostTensor],
        output_grads: &[&HostTensor],
        _cx: &KernelContext<'_>,
    ) -> BackendResult<Vec<Option<HostTensor>>> {
        expect_inputs(self.name(), inputs, 1)?;
        let grad = output_grads[0]
            .clone()
            .reshaped(inputs[0].dims())
            .map_err(|err| BackendError::shape_mismatch(err.to_string()))?;
        Ok(vec![Some(grad)])
    }
}

/// Identity copy.
pub struct PermuteKernel;

impl Kernel for PermuteKernel {
    fn name(&self) -> &'static str {
        "Permute"
    }

    fn run(&self, inputs: &[&HostTensor], _cx: &KernelContext<'_>) -> BackendResult<Vec<HostTensor>> {
        expect_inputs(self.name(), inputs, 1)?;
        Ok(vec![inputs[0].clone()])
    }

    fn backward(
        &self,
        inputs: &[&HostTensor],
        _outputs: &[&HostTensor],
        output_grads: &[&HostTensor],
        _cx: &KernelContext<'_>,
    ) -> BackendResult<Vec<Option<HostTensor>>> {
        expect_inputs(self.name(), inputs, 1)?;
        Ok(vec![Some(output_grads[0].clone())])
    }
}

pub struct TransposeKernel {
    pub perm: Vec<usize>,
}

impl Kernel for TransposeKernel {
    fn name(&self) -> &'static str {
        "Transpose"
    }

    fn run(&self, inputs: &[&HostTensor], _cx: &KernelContext<'_>) -> BackendResult<Vec<HostTensor>> {
        expect_inputs(self.name(), inputs, 1)?;
        let input = inputs[0];
        let input_dims = input.dims();
        if self.perm.len() != input_dims.len() {
            return Err(BackendError::execution("transpose rank mismatch"));
        }
        let values = f32_values(self.name(), input)?;
        let out_dims: Vec<usize> = self.perm.iter().map(|axis| input_dims[*axis]).collect();
        let input_strides = contiguous_strides(input_dims);
        let mut result = vec![0.0f32; values.len()];
        for (idx, slot) in result.iter_mut().enumerate() {
            let out_coord = unravel_index(idx, &out_dims);
            let in_index: usize = out_coord
                .iter()
                .enumerate()
                .map(|(out_axis, coord)| coord * input_strides[self.perm[out_axis]])
                .sum();
            *slot = values[in_index];
        }
        Ok(vec![f32_tensor(&out_dims, result)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nnrt::ir::OperationIndex;

    #[test]
    fn transpose_swaps_axes() {
        let kernel = TransposeKernel { perm: vec![1, 0] };
        let x = HostTensor::from_f32(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let cx = KernelContext::new(OperationIndex::new(0), None);
        let out = kernel.run(&[&x], &cx).unwrap();
        assert_eq!(out[0].dims(), &[3, 2]);
        assert_eq!(out[0].as_f32().unwrap(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }
}
