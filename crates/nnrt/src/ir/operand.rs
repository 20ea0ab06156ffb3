use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::tensor::{DType, HostTensor};

use super::index::{OperandIndex, OperationIndex};

/// Extent of one tensor axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Static(usize),
    /// Not known until shape inference resolves it.
    Unknown,
}

impl Dimension {
    pub fn as_static(self) -> Option<usize> {
        match self {
            Dimension::Static(value) => Some(value),
            Dimension::Unknown => None,
        }
    }
}

/// Ordered list of dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape {
    dims: SmallVec<[Dimension; 4]>,
}

impl Shape {
    pub fn new(dims: impl IntoIterator<Item = Dimension>) -> Self {
        Self {
            dims: dims.into_iter().collect(),
        }
    }

    pub fn from_static(dims: &[usize]) -> Self {
        Self::new(dims.iter().copied().map(Dimension::Static))
    }

    /// Shape of the given rank with every dimension unknown.
    pub fn unknown(rank: usize) -> Self {
        Self::new(std::iter::repeat(Dimension::Unknown).take(rank))
    }

    pub fn scalar() -> Self {
        Self::default()
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn dim(&self, axis: usize) -> Dimension {
        self.dims[axis]
    }

    /// Returns static dimensions when every dimension is known.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        self.dims.iter().map(|dim| dim.as_static()).collect()
    }

    pub fn is_resolved(&self) -> bool {
        self.dims.iter().all(|dim| matches!(dim, Dimension::Static(_)))
    }

    pub fn element_count(&self) -> Option<usize> {
        self.static_dims().map(|dims| dims.iter().product())
    }

    /// Fills unknown dimensions of `self` from `other`; `None` when known dimensions disagree.
    pub fn merge(&self, other: &Shape) -> Option<Shape> {
        if self.rank() != other.rank() {
            return None;
        }
        let mut dims = SmallVec::with_capacity(self.rank());
        for (lhs, rhs) in self.dims.iter().zip(other.dims.iter()) {
            let merged = match (lhs, rhs) {
                (Dimension::Static(a), Dimension::Static(b)) if a != b => return None,
                (Dimension::Static(a), _) => Dimension::Static(*a),
                (Dimension::Unknown, rhs) => *rhs,
            };
            dims.push(merged);
        }
        Some(Shape { dims })
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dims.is_empty() {
            return f.write_str("scalar");
        }
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                f.write_str("x")?;
            }
            match dim {
                Dimension::Static(value) => write!(f, "{value}")?,
                Dimension::Unknown => f.write_str("?")?,
            }
        }
        Ok(())
    }
}

/// Memory layout tag carried for backends that care about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Layout {
    #[default]
    Nhwc,
    Nchw,
}

/// Static description of an operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperandInfo {
    pub shape: Shape,
    pub dtype: DType,
    pub layout: Layout,
}

impl OperandInfo {
    pub fn new(shape: Shape, dtype: DType) -> Self {
        Self {
            shape,
            dtype,
            layout: Layout::default(),
        }
    }

    pub fn f32(dims: &[usize]) -> Self {
        Self::new(Shape::from_static(dims), DType::F32)
    }

    pub fn byte_len(&self) -> Option<usize> {
        self.shape
            .element_count()
            .map(|count| count * self.dtype.size_in_bytes())
    }
}

/// View of a parent operand's buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtensorInfo {
    pub parent: OperandIndex,
    /// Coordinates of the first element inside the parent.
    pub offset: Vec<usize>,
    pub extent: Vec<usize>,
}

impl SubtensorInfo {
    /// Whether `offset + extent` fits inside `parent_dims` on every axis.
    pub fn fits_within(&self, parent_dims: &[usize]) -> bool {
        parent_dims.len() == self.offset.len()
            && parent_dims.len() == self.extent.len()
            && parent_dims
                .iter()
                .zip(self.offset.iter().zip(self.extent.iter()))
                .all(|(parent, (offset, extent))| offset + extent <= *parent)
    }
}

/// Ownership of an operand's storage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BufferState {
    #[default]
    Unallocated,
    Owned,
    Aliased(SubtensorInfo),
}

/// Tensor slot in a graph.
#[derive(Debug, Clone)]
pub struct Operand {
    info: OperandInfo,
    shape_final: bool,
    buffer: BufferState,
    data: Option<Arc<HostTensor>>,
    pub(crate) def: Option<OperationIndex>,
    pub(crate) uses: SmallVec<[OperationIndex; 2]>,
}

impl Operand {
    pub fn new(info: OperandInfo) -> Self {
        Self {
            info,
            shape_final: false,
            buffer: BufferState::Unallocated,
            data: None,
            def: None,
            uses: SmallVec::new(),
        }
    }

    pub fn constant(info: OperandInfo, data: HostTensor) -> Self {
        let mut operand = Self::new(info);
        operand.data = Some(Arc::new(data));
        operand
    }

    pub fn info(&self) -> &OperandInfo {
        &self.info
    }

    pub fn shape(&self) -> &Shape {
        &self.info.shape
    }

    pub fn dtype(&self) -> DType {
        self.info.dtype
    }

    pub fn is_shape_final(&self) -> bool {
        self.shape_final
    }

    pub fn is_constant(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Option<&Arc<HostTensor>> {
        self.data.as_ref()
    }

    pub fn buffer(&self) -> &BufferState {
        &self.buffer
    }

    pub fn def(&self) -> Option<OperationIndex> {
        self.def
    }

    pub fn uses(&self) -> &[OperationIndex] {
        &self.uses
    }

    pub(crate) fn set_shape_unchecked(&mut self, shape: Shape) {
        self.info.shape = shape;
    }

    pub(crate) fn mark_shape_final(&mut self) {
        self.shape_final = true;
    }

    pub(crate) fn set_buffer(&mut self, buffer: BufferState) {
        self.buffer = buffer;
    }

    pub(crate) fn take_data(&mut self) -> Option<Arc<HostTensor>> {
        self.data.take()
    }

    /// Copy with fresh use/def links and no buffer assignment.
    pub(crate) fn detached(&self) -> Self {
        Self {
            info: self.info.clone(),
            shape_final: false,
            buffer: BufferState::Unallocated,
            data: None,
            def: None,
            uses: SmallVec::new(),
        }
    }
}
