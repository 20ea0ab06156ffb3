use nnrt::backend::{BackendError, BackendResult, Kernel, KernelContext};
use nnrt::ir::Activation;
use nnrt::HostTensor;

use super::activation::{apply_in_place, through};
use super::{f32_tensor, f32_values};

/// `input[B, K] x weights[N, K]^T + bias[N]`; higher-rank inputs are flattened to rows of `K`.
pub struct FullyConnectedKernel {
    pub activation: Activation,
}

struct Dims {
    rows: usize,
    depth: usize,
    units: usize,
}

impl FullyConnectedKernel {
    fn dims(&self, inputs: &[&HostTensor]) -> BackendResult<Dims> {
        if inputs.len() != 2 && inputs.len() != 3 {
            return Err(BackendError::execution(format!(
                "FullyConnected expects 2 or 3 inputs, got {}",
                inputs.len()
            )));
        }
        let [units, depth] = inputs[1].dims() else {
            return Err(BackendError::shape_mismatch(format!(
                "weights must be rank 2, got {:?}",
                inputs[1].dims()
            )));
        };
        let elements = inputs[0].element_count();
        if *depth == 0 || elements % depth != 0 {
            return Err(BackendError::shape_mismatch(format!(
                "input {:?} cannot be flattened to rows of {depth}",
                inputs[0].dims()
            )));
        }
        Ok(Dims {
            rows: elements / depth,
            depth: *depth,
            units: *units,
        })
    }
}

impl Kernel for FullyConnectedKernel {
    fn name(&self) -> &'static str {
        "FullyConnected"
    }

    fn run(&self, inputs: &[&HostTensor], _cx: &KernelContext<'_>) -> BackendResult<Vec<HostTensor>> {
        let Dims { rows, depth, units } = self.dims(inputs)?;
        let x = f32_values(self.name(), inputs[0])?;
        let w = f32_values(self.name(), inputs[1])?;
        let bias = match inputs.get(2) {
            Some(bias) => Some(f32_values(self.name(), bias)?),
            None => None,
        };

        let mut out = vec![0.0f32; rows * units];
        for row in 0..rows {
            let x_row = &x[row * depth..(row + 1) * depth];
            for unit in 0..units {
                let w_row = &w[unit * depth..(unit + 1) * depth];
                let dot: f32 = x_row.iter().zip(w_row).map(|(a, b)| a * b).sum();
                out[row * units + unit] = dot + bias.map_or(0.0, |bias| bias[unit]);
            }
        }
        apply_in_place(self.activation, &mut out);
        Ok(vec![f32_tensor(&[rows, units], out)?])
    }

    fn backward(
        &self,
        inputs: &[&HostTensor],
        outputs: &[&HostTensor],
        output_grads: &[&HostTensor],
        _cx: &KernelContext<'_>,
    ) -> BackendResult<Vec<Option<HostTensor>>> {
        let Dims { rows, depth, units } = self.dims(inputs)?;
        let x = f32_values(self.name(), inputs[0])?;
        let w = f32_values(self.name(), inputs[1])?;
        let dz = through(
            self.activation,
            f32_values(self.name(), outputs[0])?,
            f32_values(self.name(), output_grads[0])?,
        );

        let mut dx = vec![0.0f32; rows * depth];
        let mut dw = vec![0.0f32; units * depth];
        let mut db = vec![0.0f32; units];
        for row in 0..rows {
            for unit in 0..units {
                let g = dz[row * units + unit];
                if g == 0.0 {
                    continue;
                }
                db[unit] += g;
                for k in 0..depth {
                    dx[row * depth + k] += g * w[unit * depth + k];
                    dw[unit * depth + k] += g * x[row * depth + k];
                }
            }
        }

        let mut grads = vec![
            Some(f32_tensor(inputs[0].dims(), dx)?),
            Some(f32_tensor(inputs[1].dims(), dw)?),
        ];
        if inputs.len() == 3 {
            grads.push(Some(f32_tensor(inputs[2].dims(), db)?));
        }
        Ok(grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nnrt::ir::OperationIndex;

    #[test]
    fn bias_and_relu_are_applied() {
        let kernel = FullyConnectedKernel {
            activation: Activation::Relu,
        };
        let x = HostTensor::from_f32(&[1, 2], vec![1.0, 2.0]).unwrap();
        let w = HostTensor::from_f32(&[2, 2], vec![1.0, 1.0, -1.0, -1.0]).unwrap();
        let b = HostTensor::from_f32(&[2], vec![0.5, 0.5]).unwrap();
        let cx = KernelContext::new(OperationIndex::new(0), None);
        let out = kernel.run(&[&x, &w, &b], &cx).unwrap();
        assert_eq!(out[0].as_f32().unwrap(), &[3.5, 0.0]);

        let grad = HostTensor::from_f32(&[1, 2], vec![1.0, 1.0]).unwrap();
        let grads = kernel.backward(&[&x, &w, &b], &[&out[0]], &[&grad], &cx).unwrap();
        assert_eq!(grads[0].as_ref().unwrap().as_f32().unwrap(), &[1.0, 1.0]);
        assert_eq!(grads[1].as_ref().unwrap().as_f32().unwrap(), &[1.0, 2.0, 0.0, 0.0]);
        assert_eq!(grads[2].as_ref().unwrap().as_f32().unwrap(), &[1.0, 0.0]);
    }
}
