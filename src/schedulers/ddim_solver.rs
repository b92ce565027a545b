//! Deterministic DDIM solver over a sparse sub-schedule of the training timesteps.
//!
//! The distillation step samples a start point on the sparse schedule and
//! advances it one sparse step towards `t = 0` with the classifier-free-guided
//! teacher estimates. With `eta = 0` the update is the probability-flow ODE
//! discretization, so the output is a pure function of its inputs.
use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};
use tracing::{debug, warn};

use super::NoiseSchedule;
use crate::error::{DistillError, Result};
use crate::utils::append_dims;

/// Parameterization of the solver update.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SolverMode {
    #[default]
    Deterministic,
    /// Reserved for the scaled-`x_0` parameterization of some teachers. Not implemented.
    Scaled { scale_b: f64 },
}

/// Returns `num_ddim_timesteps` indices `(i + 1) * floor(T / K) - 1` into the full schedule.
pub fn ddim_timesteps(num_train_timesteps: usize, num_ddim_timesteps: usize) -> Result<Vec<i64>> {
    if num_ddim_timesteps == 0 || num_ddim_timesteps > num_train_timesteps {
        return Err(DistillError::config(format!(
            "num_ddim_timesteps must be in [1, {num_train_timesteps}], got {num_ddim_timesteps}"
        )));
    }
    if num_train_timesteps % num_ddim_timesteps != 0 {
        warn!(
            num_train_timesteps,
            num_ddim_timesteps,
            "timestep count is not a multiple of the DDIM step count, rounding the stride down"
        );
    }
    let step_ratio = (num_train_timesteps / num_ddim_timesteps) as i64;
    let last = num_train_timesteps as i64 - 1;
    Ok((1..=num_ddim_timesteps as i64)
        .map(|i| (i * step_ratio - 1).clamp(0, last))
        .collect())
}

#[derive(Debug)]
pub struct DdimSolver {
    ddim_timesteps: Vec<i64>,
    ddim_timesteps_tensor: Tensor,
    ddim_alphas_cumprod_prev: Tensor,
    eta: f64,
}

impl DdimSolver {
    /// `set_alpha_to_one` selects the alpha used one step past the start of the
    /// schedule: `1.0` (fully clean) or `alphas_cumprod[0]`.
    pub fn new(
        schedule: &NoiseSchedule,
        num_ddim_timesteps: usize,
        mode: SolverMode,
        eta: f64,
        set_alpha_to_one: bool,
        device: Device,
    ) -> Result<Self> {
        if let SolverMode::Scaled { scale_b } = mode {
            return Err(DistillError::Unsupported(format!(
                "scaled DDIM parameterization (scale_b = {scale_b})"
            )));
        }
        if eta != 0.0 {
            warn!(eta, "ddim eta is reserved and has no effect on the deterministic solver");
        }
        let alphas_cumprod = schedule.alphas_cumprod();
        let ddim_timesteps = ddim_timesteps(alphas_cumprod.len(), num_ddim_timesteps)?;
        let final_alpha_cumprod = if set_alpha_to_one { 1.0 } else { alphas_cumprod[0] };
        let mut alphas_prev = Vec::with_capacity(ddim_timesteps.len());
        alphas_prev.push(final_alpha_cumprod);
        for &t in &ddim_timesteps[..ddim_timesteps.len() - 1] {
            alphas_prev.push(alphas_cumprod[t as usize]);
        }
        debug!(num_ddim_timesteps, first = ddim_timesteps[0], "built ddim solver");
        Ok(Self {
            ddim_timesteps_tensor: Tensor::from_slice(&ddim_timesteps).to_device(device),
            ddim_alphas_cumprod_prev: Tensor::from_slice(&alphas_prev)
                .to_kind(Kind::Float)
                .to_device(device),
            ddim_timesteps,
            eta,
        })
    }

    pub fn ddim_timesteps(&self) -> &[i64] {
        &self.ddim_timesteps
    }

    pub fn num_ddim_timesteps(&self) -> usize {
        self.ddim_timesteps.len()
    }

    pub fn eta(&self) -> f64 {
        self.eta
    }

    fn check_index(&self, index: &Tensor) {
        let k = self.ddim_timesteps.len() as i64;
        let min = index.min().int64_value(&[]);
        let max = index.max().int64_value(&[]);
        assert!(
            min >= 0 && max < k,
            "ddim index out of range [0, {k}): got values in [{min}, {max}]"
        );
    }

    /// Full-schedule timesteps for per-sample sparse indices.
    pub fn timesteps_at(&self, index: &Tensor) -> Tensor {
        self.check_index(index);
        let index = index.to_kind(Kind::Int64).to_device(self.ddim_timesteps_tensor.device());
        self.ddim_timesteps_tensor.index_select(0, &index)
    }

    /// One deterministic DDIM update from sparse index `i` to `i - 1`:
    /// `sqrt(a_prev) * pred_x0 + sqrt(1 - a_prev) * pred_noise`.
    ///
    /// Panics if any index is outside `[0, K)`.
    pub fn ddim_step(
        &self,
        pred_x0: &Tensor,
        pred_noise: &Tensor,
        index: &Tensor,
    ) -> Result<Tensor> {
        self.check_index(index);
        let index = index
            .to_kind(Kind::Int64)
            .to_device(self.ddim_alphas_cumprod_prev.device());
        let alpha_cumprod_prev = self
            .ddim_alphas_cumprod_prev
            .index_select(0, &index)
            .to_kind(pred_x0.kind());
        let alpha_cumprod_prev = append_dims(&alpha_cumprod_prev, pred_x0.dim())?;
        let dir_xt = (alpha_cumprod_prev.neg() + 1.0).sqrt() * pred_noise;
        Ok(alpha_cumprod_prev.sqrt() * pred_x0 + dir_xt)
    }
}
