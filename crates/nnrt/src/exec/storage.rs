use std::borrow::Cow;
use std::collections::HashMap;

use crate::compiler::LoweredGraph;
use crate::error::{Error, Result};
use crate::ir::{BufferState, OperandIndex};
use crate::tensor::HostTensor;

/// Operand buffers of one subgraph run.
///
/// Aliased operands never get their own buffer: writes land in the parent's window and reads
/// copy the window back out. Parents are allocated from their backend's pool on first write.
pub struct TensorStore<'g> {
    lowered: &'g LoweredGraph,
    values: HashMap<OperandIndex, HostTensor>,
}

impl<'g> TensorStore<'g> {
    pub fn new(lowered: &'g LoweredGraph) -> Self {
        Self {
            lowered,
            values: HashMap::new(),
        }
    }

    /// Binds the subgraph inputs, checking them against the planned shapes.
    pub fn bind_inputs(&mut self, inputs: &[HostTensor]) -> Result<()> {
        let expected = self.lowered.graph().inputs();
        if inputs.len() != expected.len() {
            return Err(Error::invalid_input(format!(
                "expected {} inputs, got {}",
                expected.len(),
                inputs.len()
            )));
        }
        for (position, (operand, tensor)) in expected.iter().zip(inputs.iter()).enumerate() {
            if let Some(entry) = self.lowered.tensors().entry(*operand) {
                if tensor.dtype() != entry.dtype || tensor.dims() != entry.dims.as_slice() {
                    return Err(Error::invalid_input(format!(
                        "input {position} must be {}{:?}, got {}{:?}",
                        entry.dtype,
                        entry.dims,
                        tensor.dtype(),
                        tensor.dims()
                    )));
                }
            }
            self.commit(*operand, tensor.clone())?;
        }
        Ok(())
    }

    /// Overrides a constant with a mutable parameter value.
    pub fn bind_parameter(&mut self, operand: OperandIndex, value: HostTensor) {
        self.values.insert(operand, value);
    }

    pub fn read(&self, operand: OperandIndex) -> Result<Cow<'_, HostTensor>> {
        if let Some(value) = self.values.get(&operand) {
            return Ok(Cow::Borrowed(value));
        }
        if let Some(data) = self.lowered.graph().operand(operand).data() {
            return Ok(Cow::Borrowed(data.as_ref()));
        }
        if let Some(info) = self.lowered.tensors().subtensor(operand) {
            let parent = self.values.get(&info.parent).ok_or_else(|| missing(operand))?;
            return Ok(Cow::Owned(parent.read_window(&info.offset, &info.extent)?));
        }
        Err(missing(operand))
    }

    /// Stores a computed value, writing through to the parent window for aliased operands.
    pub fn commit(&mut self, operand: OperandIndex, tensor: HostTensor) -> Result<()> {
        let lowered = self.lowered;
        let entry = lowered.tensors().entry(operand).ok_or_else(|| {
            Error::Execution(format!("operand {operand} has no planned buffer"))
        })?;
        if tensor.dtype() != entry.dtype || tensor.dims() != entry.dims.as_slice() {
            return Err(Error::Execution(format!(
                "operand {operand} expects {}{:?}, kernel produced {}{:?}",
                entry.dtype,
                entry.dims,
                tensor.dtype(),
                tensor.dims()
            )));
        }
        match &entry.buffer {
            BufferState::Aliased(info) => {
                if !self.values.contains_key(&info.parent) {
                    let buffer = self.allocate(info.parent)?;
                    self.values.insert(info.parent, buffer);
                }
                let parent = self
                    .values
                    .get_mut(&info.parent)
                    .ok_or_else(|| missing(info.parent))?;
                parent.write_window(&info.offset, &tensor)
            }
            _ => {
                self.values.insert(operand, tensor);
                Ok(())
            }
        }
    }

    pub fn release(&mut self, operand: OperandIndex) {
        if self.values.remove(&operand).is_some() {
            tracing::trace!(%operand, "buffer released");
        }
    }

    /// Copies out the subgraph outputs in declaration order.
    pub fn outputs(&self) -> Result<Vec<HostTensor>> {
        self.lowered
            .graph()
            .outputs()
            .iter()
            .map(|output| self.read(*output).map(Cow::into_owned))
            .collect()
    }

    fn allocate(&self, operand: OperandIndex) -> Result<HostTensor> {
        let entry = self.lowered.tensors().entry(operand).ok_or_else(|| {
            Error::Execution(format!("operand {operand} has no planned buffer"))
        })?;
        let tensor = match self.lowered.graph().operand(operand).def() {
            Some(producer) => self.lowered.backend(producer).allocate(entry.dtype, &entry.dims),
            None => HostTensor::zeros(entry.dtype, &entry.dims),
        };
        Ok(tensor)
    }
}

fn missing(operand: OperandIndex) -> Error {
    Error::Execution(format!("operand {operand} was read before it was produced"))
}
