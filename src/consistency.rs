//! Boundary-condition scalings of the consistency function
//! `f(x, t) = c_skip(t) * x + c_out(t) * x_0(x, t)`.
use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};

use crate::error::Result;
use crate::utils::append_dims;

/// `scaled = timestep_scaling * t`,
/// `c_skip = sigma_data^2 / (scaled^2 + sigma_data^2)`,
/// `c_out = scaled / sqrt(scaled^2 + sigma_data^2)`.
///
/// At `t = 0` this gives `c_skip = 1` and `c_out = 0` exactly, so the
/// consistency function returns its input unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundaryCondition {
    pub sigma_data: f64,
    pub timestep_scaling: f64,
}

impl Default for BoundaryCondition {
    fn default() -> Self {
        Self { sigma_data: 0.5, timestep_scaling: 10.0 }
    }
}

impl BoundaryCondition {
    /// Single-constant form `c_skip = s^2 / ((t/s)^2 + s^2)` and
    /// `c_out = (t/s) / sqrt((t/s)^2 + s^2)`.
    pub fn from_scaling_constant(s: f64) -> Self {
        Self { sigma_data: s, timestep_scaling: 1.0 / s }
    }

    /// Returns `(c_skip, c_out)` with the shape of `timesteps`, in `Kind::Float`.
    pub fn scalings(&self, timesteps: &Tensor) -> (Tensor, Tensor) {
        let sigma_sq = self.sigma_data * self.sigma_data;
        let scaled = timesteps.to_kind(Kind::Float) * self.timestep_scaling;
        let denom = scaled.square() + sigma_sq;
        let c_skip = scaled.ones_like() * sigma_sq / &denom;
        let c_out = &scaled / denom.sqrt();
        (c_skip, c_out)
    }

    /// Scalings broadcast to a tensor of rank `ndim`.
    pub fn scalings_for(&self, timesteps: &Tensor, ndim: usize) -> Result<(Tensor, Tensor)> {
        let (c_skip, c_out) = self.scalings(timesteps);
        Ok((append_dims(&c_skip, ndim)?, append_dims(&c_out, ndim)?))
    }

    /// `c_skip * sample + c_out * pred_x0`.
    pub fn apply(&self, sample: &Tensor, pred_x0: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        let (c_skip, c_out) = self.scalings_for(timesteps, sample.dim())?;
        let kind = sample.kind();
        Ok(c_skip.to_kind(kind) * sample + c_out.to_kind(kind) * pred_x0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tch::Device;

    #[test]
    fn test_identity_at_timestep_zero() {
        for bc in [BoundaryCondition::default(), BoundaryCondition::from_scaling_constant(0.5)] {
            let (c_skip, c_out) = bc.scalings(&Tensor::from_slice(&[0i64]));
            assert_eq!(c_skip.double_value(&[0]), 1.0);
            assert_eq!(c_out.double_value(&[0]), 0.0);
        }
    }

    #[test]
    #[serial]
    fn test_apply_at_zero_returns_input() {
        let bc = BoundaryCondition::default();
        let sample = Tensor::randn([2, 4, 5, 8, 8], (Kind::Float, Device::Cpu));
        let pred_x0 = Tensor::randn([2, 4, 5, 8, 8], (Kind::Float, Device::Cpu)) * 100.;
        let out = bc.apply(&sample, &pred_x0, &Tensor::from_slice(&[0i64, 0])).unwrap();
        assert!(out.equal(&sample));
    }

    #[test]
    fn test_scalings_approach_consistency_limit() {
        let bc = BoundaryCondition::default();
        let (c_skip, c_out) = bc.scalings(&Tensor::from_slice(&[999i64]));
        assert!(c_skip.double_value(&[0]) < 1e-6);
        assert!((c_out.double_value(&[0]) - 1.0).abs() < 1e-6);

        let (c_skip, c_out) = bc.scalings(&Tensor::from_slice(&[1i64]));
        let scaled: f64 = 10.0;
        assert!((c_skip.double_value(&[0]) - 0.25 / (scaled * scaled + 0.25)).abs() < 1e-7);
        let expected = scaled / (scaled * scaled + 0.25f64).sqrt();
        assert!((c_out.double_value(&[0]) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_single_constant_form() {
        let s = 2.0;
        let bc = BoundaryCondition::from_scaling_constant(s);
        let (c_skip, c_out) = bc.scalings(&Tensor::from_slice(&[3i64]));
        let ts: f64 = 3.0 / s;
        assert!((c_skip.double_value(&[0]) - s * s / (ts * ts + s * s)).abs() < 1e-6);
        assert!((c_out.double_value(&[0]) - ts / (ts * ts + s * s).sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_scalings_for_broadcast_rank() {
        let (c_skip, c_out) = BoundaryCondition::default()
            .scalings_for(&Tensor::from_slice(&[0i64, 19, 999]), 5)
            .unwrap();
        assert_eq!(c_skip.size(), vec![3, 1, 1, 1, 1]);
        assert_eq!(c_out.size(), vec![3, 1, 1, 1, 1]);
    }
}
