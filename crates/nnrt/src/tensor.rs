//! Host-resident tensor values exchanged between executors and kernels.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Scalar element types understood by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    Si32,
    U8,
    Bool,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 | DType::Si32 => 4,
            DType::U8 | DType::Bool => 1,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32)
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::Si32 => "si32",
            DType::U8 => "u8",
            DType::Bool => "bool",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Dense element storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    F32(Vec<f32>),
    Si32(Vec<i32>),
    U8(Vec<u8>),
    Bool(Vec<bool>),
}

impl TensorData {
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => TensorData::F32(vec![0.0; len]),
            DType::Si32 => TensorData::Si32(vec![0; len]),
            DType::U8 => TensorData::U8(vec![0; len]),
            DType::Bool => TensorData::Bool(vec![false; len]),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::Si32(_) => DType::Si32,
            TensorData::U8(_) => DType::U8,
            TensorData::Bool(_) => DType::Bool,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(values) => values.len(),
            TensorData::Si32(values) => values.len(),
            TensorData::U8(values) => values.len(),
            TensorData::Bool(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Row-major tensor living in host memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostTensor {
    dims: Vec<usize>,
    data: TensorData,
}

impl HostTensor {
    pub fn new(dims: impl Into<Vec<usize>>, data: TensorData) -> Result<Self> {
        let dims = dims.into();
        let expected: usize = dims.iter().product();
        if expected != data.len() {
            return Err(Error::invalid_input(format!(
                "tensor with dims {:?} needs {} elements, got {}",
                dims,
                expected,
                data.len()
            )));
        }
        Ok(Self { dims, data })
    }

    pub fn from_f32(dims: &[usize], values: Vec<f32>) -> Result<Self> {
        Self::new(dims.to_vec(), TensorData::F32(values))
    }

    pub fn zeros(dtype: DType, dims: &[usize]) -> Self {
        let len = dims.iter().product();
        Self {
            dims: dims.to_vec(),
            data: TensorData::zeros(dtype, len),
        }
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn element_count(&self) -> usize {
        self.data.len()
    }

    pub fn byte_len(&self) -> usize {
        self.element_count() * self.dtype().size_in_bytes()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn into_data(self) -> TensorData {
        self.data
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match &mut self.data {
            TensorData::F32(values) => Some(values),
            _ => None,
        }
    }

    /// Returns the same elements viewed with new dims.
    pub fn reshaped(self, dims: &[usize]) -> Result<Self> {
        Self::new(dims.to_vec(), self.data)
    }

    /// Interprets the first element as a branch condition.
    pub fn truthy(&self) -> Option<bool> {
        match &self.data {
            TensorData::F32(values) => values.first().map(|v| *v != 0.0),
            TensorData::Si32(values) => values.first().map(|v| *v != 0),
            TensorData::U8(values) => values.first().map(|v| *v != 0),
            TensorData::Bool(values) => values.first().copied(),
        }
    }

    /// Minimum and maximum element of a float tensor.
    pub fn min_max(&self) -> Option<(f32, f32)> {
        let values = self.as_f32()?;
        let first = *values.first()?;
        Some(
            values
                .iter()
                .fold((first, first), |(lo, hi), v| (lo.min(*v), hi.max(*v))),
        )
    }

    /// Copies the `extent`-sized window starting at `offset` into a new contiguous tensor.
    pub fn read_window(&self, offset: &[usize], extent: &[usize]) -> Result<HostTensor> {
        check_window(&self.dims, offset, extent)?;
        let mut out = HostTensor::zeros(self.dtype(), extent);
        let dims = self.dims.clone();
        copy_elements(&mut out.data, &self.data, |visit| {
            for_each_window_offset(&dims, offset, extent, |child, parent| visit(child, parent))
        })?;
        Ok(out)
    }

    /// Float tensor with every element set to `value`.
    pub fn filled(dims: &[usize], value: f32) -> Self {
        let len = dims.iter().product();
        Self {
            dims: dims.to_vec(),
            data: TensorData::F32(vec![value; len]),
        }
    }

    /// Adds `other` element-wise; both must be float tensors of the same dims.
    pub fn accumulate(&mut self, other: &HostTensor) -> Result<()> {
        if self.dims != other.dims {
            return Err(Error::graph_shape_mismatch(format!(
                "cannot accumulate {:?} into {:?}",
                other.dims, self.dims
            )));
        }
        match (&mut self.data, &other.data) {
            (TensorData::F32(dst), TensorData::F32(src)) => {
                for (d, s) in dst.iter_mut().zip(src.iter()) {
                    *d += *s;
                }
                Ok(())
            }
            (dst, src) => Err(Error::invalid_input(format!(
                "cannot accumulate {} into {}",
                src.dtype(),
                dst.dtype()
            ))),
        }
    }

    /// Writes `src` into the window starting at `offset`.
    pub fn write_window(&mut self, offset: &[usize], src: &HostTensor) -> Result<()> {
        check_window(&self.dims, offset, &src.dims)?;
        let dims = self.dims.clone();
        let extent = src.dims.clone();
        copy_elements(&mut self.data, &src.data, |visit| {
            for_each_window_offset(&dims, offset, &extent, |child, parent| visit(parent, child))
        })
    }
}

/// Row-major strides for `dims`.
pub fn contiguous_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1];
    }
    strides
}

fn check_window(parent: &[usize], offset: &[usize], extent: &[usize]) -> Result<()> {
    if parent.len() != offset.len() || parent.len() != extent.len() {
        return Err(Error::graph_shape_mismatch(format!(
            "window rank mismatch: parent {parent:?}, offset {offset:?}, extent {extent:?}"
        )));
    }
    for axis in 0..parent.len() {
        if offset[axis] + extent[axis] > parent[axis] {
            return Err(Error::graph_shape_mismatch(format!(
                "window {offset:?}+{extent:?} exceeds parent {parent:?} on axis {axis}"
            )));
        }
    }
    Ok(())
}

/// Visits `(child_linear, parent_linear)` pairs for every element of the window.
fn for_each_window_offset(
    parent: &[usize],
    offset: &[usize],
    extent: &[usize],
    mut f: impl FnMut(usize, usize),
) {
    let count: usize = extent.iter().product();
    if count == 0 {
        return;
    }
    let strides = contiguous_strides(parent);
    let rank = extent.len();
    let mut coord = vec![0usize; rank];
    for child in 0..count {
        let parent_linear: usize = (0..rank)
            .map(|axis| (offset[axis] + coord[axis]) * strides[axis])
            .sum();
        f(child, parent_linear);
        for axis in (0..rank).rev() {
            coord[axis] += 1;
            if coord[axis] < extent[axis] {
                break;
            }
            coord[axis] = 0;
        }
    }
}

/// Runs `walk` with a visitor that copies `src[from]` into `dst[to]`.
fn copy_elements<W>(dst: &mut TensorData, src: &TensorData, walk: W) -> Result<()>
where
    W: FnOnce(&mut dyn FnMut(usize, usize)),
{
    macro_rules! copy {
        ($dst:expr, $src:expr) => {{
            let dst = $dst;
            let src = $src;
            walk(&mut |to: usize, from: usize| dst[to] = src[from]);
            Ok(())
        }};
    }
    match (dst, src) {
        (TensorData::F32(d), TensorData::F32(s)) => copy!(d, s),
        (TensorData::Si32(d), TensorData::Si32(s)) => copy!(d, s),
        (TensorData::U8(d), TensorData::U8(s)) => copy!(d, s),
        (TensorData::Bool(d), TensorData::Bool(s)) => copy!(d, s),
        (d, s) => Err(Error::invalid_input(format!(
            "dtype mismatch copying {} into {}",
            s.dtype(),
            d.dtype()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_round_trip_along_last_axis() {
        let mut parent = HostTensor::zeros(DType::F32, &[1, 2, 3]);
        let left = HostTensor::from_f32(&[1, 2, 1], vec![1.0, 2.0]).unwrap();
        let right = HostTensor::from_f32(&[1, 2, 2], vec![3.0, 4.0, 5.0, 6.0]).unwrap();
        parent.write_window(&[0, 0, 0], &left).unwrap();
        parent.write_window(&[0, 0, 1], &right).unwrap();
        assert_eq!(parent.as_f32().unwrap(), &[1.0, 3.0, 4.0, 2.0, 5.0, 6.0]);
        let back = parent.read_window(&[0, 0, 1], &[1, 2, 2]).unwrap();
        assert_eq!(back, right);
    }

    #[test]
    fn window_out_of_bounds_is_rejected() {
        let mut parent = HostTensor::zeros(DType::F32, &[2, 2]);
        let src = HostTensor::from_f32(&[2, 2], vec![0.0; 4]).unwrap();
        assert!(parent.write_window(&[0, 1], &src).is_err());
    }

    #[test]
    fn element_count_must_match_dims() {
        assert!(HostTensor::from_f32(&[2, 3], vec![0.0; 5]).is_err());
    }
}
