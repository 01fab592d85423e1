use crate::error::Result;
use crate::layers::NamedParam;
use crate::{config_bail, domain_bail};
use candle_core::Tensor;
use std::collections::BTreeMap;

/// Gradient descent with one momentum accumulator per parameter.
///
/// momentum = 1 - 1 / terminal_velocity
/// inc <- momentum * inc - learning_rate * grad
/// param <- param + inc
///
/// All new values are computed before any parameter is written, so a
/// failed step leaves every parameter untouched.
#[derive(Clone, Debug, Default)]
pub struct MomentumSgd {
    increments: BTreeMap<String, Tensor>,
}

pub fn momentum_from_terminal_velocity(terminal_velocity: f64) -> Result<f64> {
    if !(terminal_velocity >= 1.0) {
        config_bail!(
            "terminal velocity must be at least 1, got {}",
            terminal_velocity
        );
    }
    Ok(1.0 - 1.0 / terminal_velocity)
}

impl MomentumSgd {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &str) -> Option<&Tensor> {
        self.increments.get(name)
    }

    pub fn step(
        &mut self,
        params: &[NamedParam],
        grads: &BTreeMap<String, Tensor>,
        learning_rate: f64,
        terminal_velocity: f64,
    ) -> Result<()> {
        if !(learning_rate > 0.0) {
            config_bail!("learning rate must be positive, got {}", learning_rate);
        }
        let momentum = momentum_from_terminal_velocity(terminal_velocity)?;

        let mut staged = Vec::with_capacity(params.len());
        for p in params {
            let grad = match grads.get(&p.name) {
                Some(g) => g,
                None => domain_bail!("no gradient for parameter {}", p.name),
            };
            if grad.dims() != p.var.dims() {
                domain_bail!(
                    "gradient for {} has shape {:?}, parameter has {:?}",
                    p.name,
                    grad.dims(),
                    p.var.dims()
                );
            }
            let grad = grad.to_dtype(p.var.dtype())?;
            let inc = match self.increments.get(&p.name) {
                Some(prev) => prev
                    .affine(momentum, 0.0)?
                    .sub(&grad.affine(learning_rate, 0.0)?)?,
                None => grad.affine(-learning_rate, 0.0)?,
            };
            let value = p.var.as_tensor().add(&inc)?.detach();
            staged.push((p, inc.detach(), value));
        }

        for (p, inc, value) in staged {
            p.var.set(&value)?;
            self.increments.insert(p.name.clone(), inc);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PddbmError;
    use candle_core::{Device, Var};

    #[test]
    fn two_steps_by_hand() -> Result<()> {
        let dev = Device::Cpu;
        let var = Var::from_tensor(&Tensor::new(&[1.0f64, -2.0], &dev)?)?;
        let params = vec![NamedParam::new("w", var.clone())];
        let mut grads = BTreeMap::new();
        grads.insert("w".to_string(), Tensor::new(&[0.5f64, 1.0], &dev)?);

        let mut opt = MomentumSgd::new();
        // tv = 2 -> momentum 0.5
        opt.step(&params, &grads, 0.1, 2.0)?;
        let after_one = var.as_tensor().to_vec1::<f64>()?;
        approx::assert_abs_diff_eq!(after_one[0], 0.95, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(after_one[1], -2.1, epsilon = 1e-12);

        opt.step(&params, &grads, 0.1, 2.0)?;
        let after_two = var.as_tensor().to_vec1::<f64>()?;
        // inc = 0.5 * (-0.05) - 0.05 = -0.075
        approx::assert_abs_diff_eq!(after_two[0], 0.875, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(after_two[1], -2.25, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn missing_gradient_leaves_all_params() -> Result<()> {
        let dev = Device::Cpu;
        let a = Var::from_tensor(&Tensor::new(&[1.0f64], &dev)?)?;
        let b = Var::from_tensor(&Tensor::new(&[2.0f64], &dev)?)?;
        let params = vec![NamedParam::new("a", a.clone()), NamedParam::new("b", b.clone())];
        let mut grads = BTreeMap::new();
        grads.insert("a".to_string(), Tensor::new(&[1.0f64], &dev)?);

        let mut opt = MomentumSgd::new();
        let res = opt.step(&params, &grads, 0.1, 2.0);
        assert!(matches!(res, Err(PddbmError::TypeDomain(_))));
        assert_eq!(a.as_tensor().to_vec1::<f64>()?, vec![1.0]);
        assert!(opt.increment("a").is_none());
        Ok(())
    }

    #[test]
    fn terminal_velocity_below_one_is_rejected() {
        assert!(matches!(
            momentum_from_terminal_velocity(0.5),
            Err(PddbmError::Configuration(_))
        ));
        assert_eq!(momentum_from_terminal_velocity(1.0).ok(), Some(0.0));
    }
}
