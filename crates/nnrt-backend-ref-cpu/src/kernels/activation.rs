use nnrt::backend::{BackendResult, Kernel, KernelContext};
use nnrt::ir::Activation;
use nnrt::HostTensor;

use super::{expect_inputs, f32_tensor, f32_values};

pub fn apply(activation: Activation, x: f32) -> f32 {
    match activation {
        Activation::None => x,
        Activation::Relu => x.max(0.0),
        Activation::Relu6 => x.clamp(0.0, 6.0),
        Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        Activation::Tanh => x.tanh(),
    }
}

/// Derivative expressed through the activation's output `y`.
pub fn derivative_from_output(activation: Activation, y: f32) -> f32 {
    match activation {
        Activation::None => 1.0,
        Activation::Relu => {
            if y > 0.0 {
                1.0
            } else {
                0.0
            }
        }
        Activation::Relu6 => {
            if y > 0.0 && y < 6.0 {
                1.0
            } else {
                0.0
            }
        }
        Activation::Sigmoid => y * (1.0 - y),
        Activation::Tanh => 1.0 - y * y,
    }
}

pub(crate) fn apply_in_place(activation: Activation, values: &mut [f32]) {
    if activation != Activation::None {
        values.iter_mut().for_each(|v| *v = apply(activation, *v));
    }
}

/// Gradient w.r.t. the pre-activation value.
pub(crate) fn through(activation: Activation, output: &[f32], grad: &[f32]) -> Vec<f32> {
    if activation == Activation::None {
        return grad.to_vec();
    }
    output
        .iter()
        .zip(grad.iter())
        .map(|(y, g)| g * derivative_from_output(activation, *y))
        .collect()
}

pub struct ActivationKernel {
    pub activation: Activation,
}

impl Kernel for ActivationKernel {
    fn name(&self) -> &'static str {
        "ElementwiseActivation"
    }

    fn run(&self, inputs: &[&HostTensor], _cx: &KernelContext<'_>) -> BackendResult<Vec<HostTensor>> {
        expect_inputs(self.name(), inputs, 1)?;
        let mut values = f32_values(self.name(), inputs[0])?.to_vec();
        apply_in_place(self.activation, &mut values);
        Ok(vec![f32_tensor(inputs[0].dims(), values)?])
    }

    fn backward(
        &self,
        inputs: &[&HostTensor],
        outputs: &[&HostTensor],
        output_grads: &[&HostTensor],
        _cx: &KernelContext<'_>,
    ) -> BackendResult<Vec<Option<HostTensor>>> {
        expect_inputs(self.name(), inputs, 1)?;
        let output = f32_values(self.name(), outputs[0])?;
        let grad = f32_values(self.name(), output_grads[0])?;
        let input_grad = through(self.activation, output, grad);
        Ok(vec![Some(f32_tensor(inputs[0].dims(), input_grad)?)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relu6_clamps_both_sides() {
        assert_eq!(apply(Activation::Relu6, -1.0), 0.0);
        assert_eq!(apply(Activation::Relu6, 7.5), 6.0);
        assert_eq!(derivative_from_output(Activation::Relu6, 6.0), 0.0);
        assert_eq!(derivative_from_output(Activation::Relu6, 3.0), 1.0);
    }

    #[test]
    fn sigmoid_derivative_matches_output_form() {
        let y = apply(Activation::Sigmoid, 0.0);
        assert!((y - 0.5).abs() < 1e-6);
        assert!((derivative_from_output(Activation::Sigmoid, y) - 0.25).abs() < 1e-6);
    }
}
