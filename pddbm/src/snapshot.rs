//! Parameters and chain states in a single safetensors file.
//!
//! Keys are `param.<name>` for parameters and `chain.<layer>.<p|h>` for
//! the persistent chains.

use crate::chains::PersistentChains;
use crate::domain_bail;
use crate::error::Result;
use crate::layers::{LayerState, NamedParam};
use candle_core::{Device, Tensor};
use log::info;
use std::collections::HashMap;
use std::path::Path;

fn chain_key(layer: &str, part: &str) -> String {
    format!("chain.{}.{}", layer, part)
}

pub fn save(
    path: &Path,
    params: &[NamedParam],
    layer_names: &[String],
    chains: &PersistentChains,
) -> Result<()> {
    if layer_names.len() != chains.states().len() {
        domain_bail!(
            "{} layer names for {} chain states",
            layer_names.len(),
            chains.states().len()
        );
    }
    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    for p in params {
        tensors.insert(format!("param.{}", p.name), p.var.as_tensor().detach().contiguous()?);
    }
    for (name, state) in layer_names.iter().zip(chains.states().iter()) {
        tensors.insert(chain_key(name, "p"), state.p.detach().contiguous()?);
        tensors.insert(chain_key(name, "h"), state.h.detach().contiguous()?);
    }
    candle_core::safetensors::save(&tensors, path)?;
    info!("saved {} tensors to {}", tensors.len(), path.display());
    Ok(())
}

/// Restore parameters and chains in place. Every key must be present
/// with the shape it had when saved.
pub fn load(
    path: &Path,
    params: &[NamedParam],
    layer_names: &[String],
    chains: &mut PersistentChains,
    device: &Device,
) -> Result<()> {
    let tensors = candle_core::safetensors::load(path, device)?;
    let fetch = |key: &str, like: &Tensor| -> Result<Tensor> {
        match tensors.get(key) {
            Some(t) if t.dims() == like.dims() => Ok(t.to_dtype(like.dtype())?),
            Some(t) => domain_bail!(
                "{}: stored shape {:?}, expected {:?}",
                key,
                t.dims(),
                like.dims()
            ),
            None => domain_bail!("{} is missing from {}", key, path.display()),
        }
    };

    let mut staged = Vec::with_capacity(params.len());
    for p in params {
        staged.push((p, fetch(&format!("param.{}", p.name), p.var.as_tensor())?));
    }
    let mut states = Vec::with_capacity(chains.states().len());
    for (name, state) in layer_names.iter().zip(chains.states().iter()) {
        let p = fetch(&chain_key(name, "p"), &state.p)?;
        let h = fetch(&chain_key(name, "h"), &state.h)?;
        states.push(LayerState::pooled(p, h));
    }

    for (p, value) in staged {
        p.var.set(&value)?;
    }
    chains.apply(states)?;
    info!("restored {} parameters from {}", params.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbm::DbmArch;
    use crate::error::PddbmError;
    use candle_core::DType;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn restores_parameters_and_chains() -> Result<()> {
        let dev = Device::Cpu;
        let mut rng = SmallRng::seed_from_u64(0);
        let arch = DbmArch {
            nvis: 4,
            hidden_dims: vec![6],
            pool_size: 2,
            n_classes: None,
            irange: 0.5,
            init_bias_hid: 0.0,
        };
        let saved = arch.build(DType::F64, &dev, &mut rng)?;
        let chains = PersistentChains::new(&saved, 3, &mut rng)?;
        let names = vec!["v".to_string(), "h1".to_string()];

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.safetensors");
        save(&path, &saved.params(), &names, &chains)?;

        let fresh = arch.build(DType::F64, &dev, &mut rng)?;
        let mut fresh_chains = PersistentChains::new(&fresh, 3, &mut rng)?;
        load(&path, &fresh.params(), &names, &mut fresh_chains, &dev)?;

        for (a, b) in saved.params().iter().zip(fresh.params().iter()) {
            assert_eq!(
                a.var.as_tensor().flatten_all()?.to_vec1::<f64>()?,
                b.var.as_tensor().flatten_all()?.to_vec1::<f64>()?
            );
        }
        assert_eq!(
            chains.hidden()[0].p.to_vec2::<f64>()?,
            fresh_chains.hidden()[0].p.to_vec2::<f64>()?
        );
        Ok(())
    }

    #[test]
    fn shape_change_is_rejected() -> Result<()> {
        let dev = Device::Cpu;
        let mut rng = SmallRng::seed_from_u64(1);
        let small = DbmArch {
            nvis: 4,
            hidden_dims: vec![3],
            pool_size: 1,
            n_classes: None,
            irange: 0.5,
            init_bias_hid: 0.0,
        };
        let big = DbmArch {
            hidden_dims: vec![5],
            ..small.clone()
        };
        let a = small.build(DType::F64, &dev, &mut rng)?;
        let chains = PersistentChains::new(&a, 2, &mut rng)?;
        let names = vec!["v".to_string(), "h1".to_string()];
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("small.safetensors");
        save(&path, &a.params(), &names, &chains)?;

        let b = big.build(DType::F64, &dev, &mut rng)?;
        let mut b_chains = PersistentChains::new(&b, 2, &mut rng)?;
        let res = load(&path, &b.params(), &names, &mut b_chains, &dev);
        assert!(matches!(res, Err(PddbmError::TypeDomain(_))));
        Ok(())
    }
}
