use serde::{Deserialize, Serialize};
use tch::{Kind, Reduction, Tensor};

use crate::error::{DistillError, Result};

/// Regression metric between the online consistency prediction and the target.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DistillLoss {
    #[default]
    L2,
    /// Pseudo-Huber: `mean(sqrt((x - y)^2 + c^2) - c)`.
    Huber { huber_c: f64 },
}

pub type LossFn = Box<dyn Fn(&Tensor, &Tensor) -> Tensor + Send + Sync>;

impl DistillLoss {
    pub fn validate(&self) -> Result<()> {
        match *self {
            DistillLoss::Huber { huber_c } if !(huber_c > 0.0) => Err(DistillError::config(format!(
                "huber_c must be positive, got {huber_c}"
            ))),
            _ => Ok(()),
        }
    }

    /// Resolves the metric once so the step does not branch on it.
    pub fn resolve(self) -> Result<LossFn> {
        self.validate()?;
        let loss: LossFn = match self {
            DistillLoss::L2 => Box::new(mse_loss),
            DistillLoss::Huber { huber_c } => {
                Box::new(move |x: &Tensor, y: &Tensor| huber_loss(x, y, huber_c))
            }
        };
        Ok(loss)
    }
}

pub fn mse_loss(x: &Tensor, y: &Tensor) -> Tensor {
    x.to_kind(Kind::Float).mse_loss(&y.to_kind(Kind::Float), Reduction::Mean)
}

pub fn huber_loss(x: &Tensor, y: &Tensor, huber_c: f64) -> Tensor {
    let diff = x.to_kind(Kind::Float) - y.to_kind(Kind::Float);
    ((diff.square() + huber_c * huber_c).sqrt() - huber_c).mean(Kind::Float)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mse() {
        let x = Tensor::from_slice(&[1f32, 2., 3.]);
        let y = Tensor::from_slice(&[1f32, 0., 0.]);
        let loss = DistillLoss::L2.resolve().unwrap();
        assert!((loss(&x, &y).double_value(&[]) - 13.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_huber() {
        let x = Tensor::from_slice(&[0f32, 3.]);
        let y = Tensor::from_slice(&[0f32, -1.]);
        let loss = DistillLoss::Huber { huber_c: 3.0 }.resolve().unwrap();
        // sqrt(0 + 9) - 3 = 0 and sqrt(16 + 9) - 3 = 2
        assert!((loss(&x, &y).double_value(&[]) - 1.0).abs() < 1e-6);
        // small residuals behave like a scaled squared error
        let x = Tensor::from_slice(&[1e-2f32]);
        let y = Tensor::from_slice(&[0f32]);
        let v = huber_loss(&x, &y, 1.0).double_value(&[]);
        assert!((v - 0.5e-4).abs() < 1e-6);
    }

    #[test]
    fn test_huber_requires_positive_constant() {
        assert!(DistillLoss::Huber { huber_c: 0.0 }.resolve().is_err());
        assert!(DistillLoss::Huber { huber_c: -1.0 }.validate().is_err());
    }

    #[test]
    fn test_loss_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            loss: DistillLoss,
        }
        let w: Wrapper = toml::from_str("loss = { type = \"huber\", huber_c = 0.001 }").unwrap();
        assert_eq!(w.loss, DistillLoss::Huber { huber_c: 0.001 });
        let w: Wrapper = toml::from_str("loss = { type = \"l2\" }").unwrap();
        assert_eq!(w.loss, DistillLoss::L2);
    }
}
