use std::path::Path;

use tch::{Device, Kind, Tensor};

use crate::error::{DistillError, Result};

pub(crate) fn file_open<P: AsRef<Path>>(path: P) -> anyhow::Result<std::fs::File> {
    std::fs::File::open(path.as_ref()).map_err(|e| {
        let context = format!("error opening {:?}", path.as_ref().to_string_lossy());
        anyhow::Error::new(e).context(context)
    })
}

pub fn get_device() -> Device {
    if tch::utils::has_mps() {
        Device::Mps
    } else {
        Device::cuda_if_available()
    }
}

/// Appends trailing singleton dimensions until `xs` has `target_dims` dimensions,
/// so that a per-sample tensor of shape `(b,)` broadcasts against `(b, c, t, h, w)`.
pub fn append_dims(xs: &Tensor, target_dims: usize) -> Result<Tensor> {
    let dims = xs.dim();
    if dims > target_dims {
        return Err(DistillError::ShapeMismatch {
            context: "append_dims",
            expected: vec![target_dims as i64],
            actual: xs.size(),
        });
    }
    let mut shape = xs.size();
    shape.resize(target_dims, 1);
    Ok(xs.reshape(shape.as_slice()))
}

/// Scalar value of a zero-dimensional (or single element) tensor.
pub fn scalar(xs: &Tensor) -> Result<f64> {
    Ok(xs.to_kind(Kind::Double).f_double_value(&[])?)
}

pub fn has_nan(xs: &Tensor) -> bool {
    xs.isnan().any().int64_value(&[]) != 0
}

pub fn count_nan(xs: &Tensor) -> i64 {
    xs.isnan().sum(Kind::Int64).int64_value(&[])
}
