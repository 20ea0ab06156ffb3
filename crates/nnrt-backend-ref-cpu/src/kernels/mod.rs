//! Host kernels of the reference CPU backend. All of them compute in f32.

pub mod activation;
pub mod arithmetic;
pub mod concat;
pub mod fully_connected;
pub mod layout;
pub mod loss;
pub mod normalize;

use nnrt::backend::{BackendError, BackendResult};
use nnrt::HostTensor;

pub(crate) fn expect_inputs(op: &str, inputs: &[&HostTensor], count: usize) -> BackendResult<()> {
    if inputs.len() != count {
        return Err(BackendError::execution(format!(
            "{op} expects {count} inputs, got {}",
            inputs.len()
        )));
    }
    Ok(())
}

pub(crate) fn f32_values<'t>(op: &str, tensor: &'t HostTensor) -> BackendResult<&'t [f32]> {
    tensor.as_f32().ok_or_else(|| {
        BackendError::execution(format!("{op} only supports f32 tensors, got {}", tensor.dtype()))
    })
}

pub(crate) fn f32_tensor(dims: &[usize], values: Vec<f32>) -> BackendResult<HostTensor> {
    HostTensor::from_f32(dims, values).map_err(|err| BackendError::execution(err.to_string()))
}

pub(crate) fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}

/// Numpy-style broadcast of two shapes.
pub(crate) fn broadcast_dims(lhs: &[usize], rhs: &[usize]) -> BackendResult<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    (0..rank)
        .map(|axis| {
            let l = padded_dim(lhs, rank, axis);
            let r = padded_dim(rhs, rank, axis);
            match (l, r) {
                (a, b) if a == b => Ok(a),
                (1, b) => Ok(b),
                (a, 1) => Ok(a),
                _ => Err(BackendError::shape_mismatch(format!(
                    "cannot broadcast {lhs:?} with {rhs:?}"
                ))),
            }
        })
        .collect()
}

fn padded_dim(dims: &[usize], rank: usize, axis: usize) -> usize {
    let pad = rank - dims.len();
    if axis < pad {
        1
    } else {
        dims[axis - pad]
    }
}

/// Flat index into `dims` of the element a broadcast output coordinate reads.
pub(crate) fn broadcast_source(coord: &[usize], dims: &[usize], strides: &[usize]) -> usize {
    let pad = coord.len() - dims.len();
    dims.iter()
        .zip(strides.iter())
        .enumerate()
        .map(|(axis, (dim, stride))| if *dim == 1 { 0 } else { coord[axis + pad] * stride })
        .sum()
}

/// Sums a gradient of `out_dims` down to `dims` along broadcast axes.
pub(crate) fn reduce_to(grad: &[f32], out_dims: &[usize], dims: &[usize]) -> Vec<f32> {
    let strides = nnrt::tensor::contiguous_strides(dims);
    let mut reduced = vec![0.0f32; dims.iter().product()];
    for (index, value) in grad.iter().enumerate() {
        let coord = unravel_index(index, out_dims);
        reduced[broadcast_source(&coord, dims, &strides)] += *value;
    }
    reduced
}

/// Outer count, axis length and inner count around `axis`.
pub(crate) fn split_axis(dims: &[usize], axis: usize) -> (usize, usize, usize) {
    let outer = dims[..axis].iter().product();
    let inner = dims[axis + 1..].iter().product();
    (outer, dims[axis], inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_to_sums_broadcast_axes() {
        let grad = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert_eq!(reduce_to(&grad, &[2, 3], &[3]), vec![5.0, 7.0, 9.0]);
        assert_eq!(reduce_to(&grad, &[2, 3], &[2, 1]), vec![6.0, 15.0]);
        assert_eq!(reduce_to(&grad, &[2, 3], &[2, 3]), grad);
    }

    #[test]
    fn broadcast_dims_rejects_mismatch() {
        assert_eq!(broadcast_dims(&[4, 1], &[3]).unwrap(), vec![4, 3]);
        assert!(broadcast_dims(&[2], &[3]).is_err());
    }
}
