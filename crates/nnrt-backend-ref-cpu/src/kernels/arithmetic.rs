use nnrt::backend::{BackendError, BackendResult, Kernel, KernelContext};
use nnrt::ir::{Activation, ArithmeticKind};
use nnrt::tensor::contiguous_strides;
use nnrt::HostTensor;

use super::activation::{apply_in_place, through};
use super::{
    broadcast_dims, broadcast_source, expect_inputs, f32_tensor, f32_values, reduce_to,
    unravel_index,
};

/// `lhs (op) rhs` with broadcasting and a fused activation.
pub struct ArithmeticKernel {
    pub kind: ArithmeticKind,
    pub activation: Activation,
}

impl Kernel for ArithmeticKernel {
    fn name(&self) -> &'static str {
        "BinaryArithmetic"
    }

    fn run(&self, inputs: &[&HostTensor], _cx: &KernelContext<'_>) -> BackendResult<Vec<HostTensor>> {
        expect_inputs(self.name(), inputs, 2)?;
        let (lhs, rhs) = (inputs[0], inputs[1]);
        let a = f32_values(self.name(), lhs)?;
        let b = f32_values(self.name(), rhs)?;
        let out_dims = broadcast_dims(lhs.dims(), rhs.dims())?;
        let lhs_strides = contiguous_strides(lhs.dims());
        let rhs_strides = contiguous_strides(rhs.dims());

        let len = out_dims.iter().product();
        let mut result = Vec::with_capacity(len);
        for index in 0..len {
            let coord = unravel_index(index, &out_dims);
            let x = a[broadcast_source(&coord, lhs.dims(), &lhs_strides)];
            let y = b[broadcast_source(&coord, rhs.dims(), &rhs_strides)];
            result.push(match self.kind {
                ArithmeticKind::Add => x + y,
                ArithmeticKind::Sub => x - y,
                ArithmeticKind::Mul => x * y,
                ArithmeticKind::Div => x / y,
            });
        }
        apply_in_place(self.activation, &mut result);
        Ok(vec![f32_tensor(&out_dims, result)?])
    }

    fn backward(
        &self,
        inputs: &[&HostTensor],
        outputs: &[&HostTensor],
        output_grads: &[&HostTensor],
        _cx: &KernelContext<'_>,
    ) -> BackendResult<Vec<Option<HostTensor>>> {
        expect_inputs(self.name(), inputs, 2)?;
        if self.kind != ArithmeticKind::Add {
            return Err(BackendError::unimplemented(
                self.name(),
                format!("gradient of {:?} is not implemented", self.kind),
            ));
        }
        let output = outputs[0];
        let grad = through(
            self.activation,
            f32_values(self.name(), output)?,
            f32_values(self.name(), output_grads[0])?,
        );
        inputs
            .iter()
            .map(|input| {
                let reduced = reduce_to(&grad, output.dims(), input.dims());
                Ok(Some(f32_tensor(input.dims(), reduced)?))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nnrt::ir::OperationIndex;

    fn cx() -> KernelContext<'static> {
        KernelContext::new(OperationIndex::new(0), None)
    }

    fn tensor(dims: &[usize], values: &[f32]) -> HostTensor {
        HostTensor::from_f32(dims, values.to_vec()).unwrap()
    }

    #[test]
    fn add_broadcasts_row_vector() {
        let kernel = ArithmeticKernel {
            kind: ArithmeticKind::Add,
            activation: Activation::None,
        };
        let a = tensor(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = tensor(&[3], &[10.0, 20.0, 30.0]);
        let out = kernel.run(&[&a, &b], &cx()).unwrap();
        assert_eq!(out[0].dims(), &[2, 3]);
        assert_eq!(out[0].as_f32().unwrap(), &[11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn add_backward_reduces_broadcast_input() {
        let kernel = ArithmeticKernel {
            kind: ArithmeticKind::Add,
            activation: Activation::None,
        };
        let a = tensor(&[2, 3], &[0.0; 6]);
        let b = tensor(&[3], &[0.0; 3]);
        let out = kernel.run(&[&a, &b], &cx()).unwrap();
        let grad = tensor(&[2, 3], &[1.0; 6]);
        let grads = kernel.backward(&[&a, &b], &[&out[0]], &[&grad], &cx()).unwrap();
        assert_eq!(grads[0].as_ref().unwrap().as_f32().unwrap(), &[1.0; 6]);
        assert_eq!(grads[1].as_ref().unwrap().as_f32().unwrap(), &[2.0, 2.0, 2.0]);
    }

    #[test]
    fn mul_backward_is_unimplemented() {
        let kernel = ArithmeticKernel {
            kind: ArithmeticKind::Mul,
            activation: Activation::None,
        };
        let a = tensor(&[2], &[1.0, 2.0]);
        let out = kernel.run(&[&a, &a], &cx()).unwrap();
        let err = kernel.backward(&[&a, &a], &[&out[0]], &[&out[0]], &cx()).unwrap_err();
        assert!(matches!(err, BackendError::Unimplemented { .. }));
    }
}
