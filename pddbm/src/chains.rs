//! Persistent Gibbs chains for the negative phase.

use crate::config_bail;
use crate::dbm::Dbm;
use crate::domain_bail;
use crate::error::Result;
use crate::layers::LayerState;
use log::debug;
use rand::Rng;

/// A fixed pool of chains, one full stack state per chain.
///
/// `states[k]` holds stack index `k` (0 = visible) for all chains, so
/// every tensor has `num_chains` rows.
#[derive(Clone, Debug)]
pub struct PersistentChains {
    num_chains: usize,
    states: Vec<LayerState>,
}

impl PersistentChains {
    /// Start every chain from the bias-only priors
    pub fn new<R: Rng + ?Sized>(dbm: &Dbm, num_chains: usize, rng: &mut R) -> Result<Self> {
        if num_chains == 0 {
            config_bail!("num_chains must be positive");
        }
        let states = dbm.make_layer_to_state(num_chains, rng)?;
        debug!("{} persistent chains over {} layers", num_chains, states.len());
        Ok(Self { num_chains, states })
    }

    pub fn num_chains(&self) -> usize {
        self.num_chains
    }

    pub fn states(&self) -> &[LayerState] {
        &self.states
    }

    /// Visible samples
    pub fn visible(&self) -> &LayerState {
        &self.states[0]
    }

    /// Hidden samples, one state per hidden layer
    pub fn hidden(&self) -> &[LayerState] {
        &self.states[1..]
    }

    /// Run `num_steps` block-Gibbs sweeps starting from the current states.
    ///
    /// Each sweep redraws the odd stack indices given the even ones, then
    /// the even ones given the odd. Nothing is written back; pass the
    /// result to [`PersistentChains::apply`].
    pub fn advance<R: Rng + ?Sized>(
        &self,
        dbm: &Dbm,
        num_steps: usize,
        rng: &mut R,
    ) -> Result<Vec<LayerState>> {
        if dbm.stack_len() != self.states.len() {
            domain_bail!(
                "chains hold {} layers but the model has {}",
                self.states.len(),
                dbm.stack_len()
            );
        }
        let mut states = self.states.clone();
        for _ in 0..num_steps {
            for parity in [1, 0] {
                for k in (parity..states.len()).step_by(2) {
                    states[k] = dbm.stack_sample(&states, k, rng)?;
                }
            }
        }
        Ok(states)
    }

    /// Replace the chain states; shapes must not change
    pub fn apply(&mut self, new_states: Vec<LayerState>) -> Result<()> {
        if new_states.len() != self.states.len() {
            domain_bail!(
                "expected {} layer states, got {}",
                self.states.len(),
                new_states.len()
            );
        }
        for (old, new) in self.states.iter().zip(new_states.iter()) {
            if old.p.dims() != new.p.dims() || old.h.dims() != new.h.dims() {
                domain_bail!(
                    "chain state shape changed from {:?} to {:?}",
                    old.h.dims(),
                    new.h.dims()
                );
            }
        }
        self.states = new_states.iter().map(LayerState::detach).collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbm::DbmArch;
    use crate::error::PddbmError;
    use candle_core::{DType, Device};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn dbm(rng: &mut SmallRng) -> Result<Dbm> {
        DbmArch {
            nvis: 4,
            hidden_dims: vec![6, 4],
            pool_size: 2,
            n_classes: Some(3),
            irange: 0.5,
            init_bias_hid: -0.5,
        }
        .build(DType::F64, &Device::Cpu, rng)
    }

    #[test]
    fn zero_chains_is_configuration_error() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(0);
        let dbm = dbm(&mut rng)?;
        assert!(matches!(
            PersistentChains::new(&dbm, 0, &mut rng),
            Err(PddbmError::Configuration(_))
        ));
        Ok(())
    }

    #[test]
    fn shapes_survive_many_sweeps() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(1);
        let dbm = dbm(&mut rng)?;
        let mut chains = PersistentChains::new(&dbm, 7, &mut rng)?;
        let before: Vec<(Vec<usize>, Vec<usize>)> = chains
            .states()
            .iter()
            .map(|s| (s.p.dims().to_vec(), s.h.dims().to_vec()))
            .collect();

        for _ in 0..3 {
            let next = chains.advance(&dbm, 2, &mut rng)?;
            chains.apply(next)?;
        }
        let after: Vec<(Vec<usize>, Vec<usize>)> = chains
            .states()
            .iter()
            .map(|s| (s.p.dims().to_vec(), s.h.dims().to_vec()))
            .collect();
        assert_eq!(before, after);
        assert_eq!(chains.num_chains(), 7);

        // samples are binary and labels one-hot
        for x in chains.visible().h.flatten_all()?.to_vec1::<f64>()? {
            assert!(x == 0.0 || x == 1.0);
        }
        for row in chains.hidden()[2].h.to_vec2::<f64>()? {
            assert_eq!(row.iter().sum::<f64>(), 1.0);
        }
        Ok(())
    }

    #[test]
    fn advance_does_not_mutate() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(2);
        let dbm = dbm(&mut rng)?;
        let chains = PersistentChains::new(&dbm, 5, &mut rng)?;
        let v0 = chains.visible().h.to_vec2::<f64>()?;
        let _ = chains.advance(&dbm, 4, &mut rng)?;
        assert_eq!(chains.visible().h.to_vec2::<f64>()?, v0);
        Ok(())
    }

    #[test]
    fn apply_rejects_shape_change() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(3);
        let dbm = dbm(&mut rng)?;
        let mut chains = PersistentChains::new(&dbm, 5, &mut rng)?;
        let other = PersistentChains::new(&dbm, 6, &mut rng)?;
        assert!(matches!(
            chains.apply(other.states().to_vec()),
            Err(PddbmError::TypeDomain(_))
        ));
        Ok(())
    }
}
