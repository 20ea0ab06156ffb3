use nnrt::backend::{BackendError, BackendResult, Kernel, KernelContext};
use nnrt::ir::Activation;
use nnrt::HostTensor;

use super::activation::apply_in_place;
use super::{f32_tensor, f32_values, split_axis};

pub struct ConcatKernel {
    pub axis: i32,
    pub activation: Activation,
}

impl ConcatKernel {
    fn resolve_axis(&self, rank: usize) -> BackendResult<usize> {
        let axis = if self.axis < 0 {
            self.axis + rank as i32
        } else {
            self.axis
        };
        if axis < 0 || axis as usize >= rank {
            return Err(BackendError::execution("concat axis out of range"));
        }
        Ok(axis as usize)
    }
}

impl Kernel for ConcatKernel {
    fn name(&self) -> &'static str {
        "Concat"
    }

    fn run(&self, inputs: &[&HostTensor], _cx: &KernelContext<'_>) -> BackendResult<Vec<HostTensor>> {
        let first = inputs
            .first()
            .ok_or_else(|| BackendError::execution("concat expects at least one input"))?;
        let rank = first.rank();
        let axis = self.resolve_axis(rank)?;

        let mut out_dims = first.dims().to_vec();
        out_dims[axis] = 0;
        for tensor in inputs {
            let dims = tensor.dims();
            if dims.len() != rank {
                return Err(BackendError::execution("concat rank mismatch"));
            }
            for (idx, (dim, out_dim)) in dims.iter().zip(first.dims()).enumerate() {
                if idx != axis && dim != out_dim {
                    return Err(BackendError::execution("concat dimension mismatch"));
                }
            }
            out_dims[axis] += dims[axis];
        }

        let (outer, total, inner) = split_axis(&out_dims, axis);
        let mut result = vec![0.0f32; outer * total * inner];
        let stride_outer = total * inner;
        let mut axis_offset = 0usize;
        for tensor in inputs {
            let values = f32_values(self.name(), tensor)?;
            let chunk = tensor.dims()[axis] * inner;
            for outer_idx in 0..outer {
                let dst = outer_idx * stride_outer + axis_offset * inner;
                let src = outer_idx * chunk;
                result[dst..dst + chunk].copy_from_slice(&values[src..src + chunk]);
            }
            axis_offset += tensor.dims()[axis];
        }
        apply_in_place(self.activation, &mut result);
        Ok(vec![f32_tensor(&out_dims, result)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nnrt::ir::OperationIndex;

    #[test]
    fn concat_along_last_axis_interleaves_rows() {
        let kernel = ConcatKernel {
            axis: -1,
            activation: Activation::None,
        };
        let a = HostTensor::from_f32(&[2, 1], vec![1.0, 2.0]).unwrap();
        let b = HostTensor::from_f32(&[2, 2], vec![3.0, 4.0, 5.0, 6.0]).unwrap();
        let cx = KernelContext::new(OperationIndex::new(0), None);
        let out = kernel.run(&[&a, &b], &cx).unwrap();
        assert_eq!(out[0].dims(), &[2, 3]);
        assert_eq!(out[0].as_f32().unwrap(), &[1.0, 3.0, 4.0, 2.0, 5.0, 6.0]);
    }
}
