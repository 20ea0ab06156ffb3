use nnrt::ir::OperandIndex;
use nnrt::train::{OptimizerInfo, OptimizerKind, OptimizerUpdate};
use nnrt::{Error, HostTensor, Result};

/// Plain stochastic gradient descent: `value -= learning_rate * gradient`.
#[derive(Debug, Clone, Copy)]
pub struct SgdOptimizer {
    learning_rate: f32,
}

impl SgdOptimizer {
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }

    pub fn from_info(info: &OptimizerInfo) -> Self {
        match info.kind {
            OptimizerKind::Sgd => Self::new(info.learning_rate),
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

impl OptimizerUpdate for SgdOptimizer {
    fn apply(&self, operand: OperandIndex, value: &mut HostTensor, gradient: &HostTensor) -> Result<()> {
        if value.dims() != gradient.dims() {
            return Err(Error::Execution(format!(
                "gradient {:?} does not match parameter {operand} {:?}",
                gradient.dims(),
                value.dims()
            )));
        }
        let grad = gradient
            .as_f32()
            .ok_or_else(|| Error::invalid_input(format!("gradient of {operand} is not f32")))?;
        let values = value
            .as_f32_mut()
            .ok_or_else(|| Error::invalid_input(format!("parameter {operand} is not f32")))?;
        for (v, g) in values.iter_mut().zip(grad) {
            *v -= self.learning_rate * g;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sgd_steps_against_gradient() {
        let sgd = SgdOptimizer::new(0.5);
        let mut value = HostTensor::from_f32(&[2], vec![1.0, 1.0]).unwrap();
        let grad = HostTensor::from_f32(&[2], vec![2.0, -2.0]).unwrap();
        sgd.apply(OperandIndex::new(0), &mut value, &grad).unwrap();
        assert_eq!(value.as_f32().unwrap(), &[0.0, 2.0]);
    }
}
