use tch::Tensor;

use crate::error::Result;

pub trait Scheduler {
    fn timesteps(&self) -> &[i64];
    fn step(&self, model_output: &Tensor, timestep: i64, sample: &Tensor) -> Result<Tensor>;
    fn init_noise_sigma(&self) -> f64;
}
