//! Stochastic-approximation gradient of the DBM log likelihood.
//!
//! Positive phase: the expected energy under the mean-field posterior of
//! the data, with the posterior held constant. Negative phase: the energy
//! of samples from the persistent chains, with the opposite sign, so the
//! two gradients simply add.

use crate::chains::PersistentChains;
use crate::config_bail;
use crate::dbm::{Dbm, MeanFieldProcedure};
use crate::error::Result;
use crate::layers::{Layer, LayerState, NamedParam};
use crate::tensor_ops::scalar_f64;
use candle_core::Tensor;
use rand::Rng;
use std::collections::BTreeMap;

/// Gradients keyed by parameter name, plus the chain states to install
/// once the caller has applied them.
#[derive(Debug)]
pub struct GradientResult {
    pub grads: BTreeMap<String, Tensor>,
    pub chain_update: Vec<LayerState>,
    /// batch mean of the positive-phase expected energy
    pub positive_energy: f64,
}

/// How the negative-phase energy is formed from the chain samples
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegativePhase {
    /// `-mean E(samples)`, valid for any depth
    Plain,
    /// Average of two half mean-field, half sample estimates; only for
    /// `[MaxPool(1), MaxPool(1), Softmax]` stacks
    VarianceReduced,
}

#[derive(Clone, Debug)]
pub struct GradientEstimator {
    rule: NegativePhase,
    num_gibbs_steps: usize,
    niter: usize,
    procedure: MeanFieldProcedure,
}

/// Gradient of `loss` with respect to every parameter, zeros where the
/// parameter does not enter the loss.
pub fn grads_of(loss: &Tensor, params: &[NamedParam]) -> Result<BTreeMap<String, Tensor>> {
    let store = loss.backward()?;
    let mut out = BTreeMap::new();
    for p in params {
        let g = match store.get(p.var.as_tensor()) {
            Some(g) => g.clone(),
            None => p.var.as_tensor().zeros_like()?,
        };
        out.insert(p.name.clone(), g);
    }
    Ok(out)
}

/// Element-wise sum of two gradient maps over the same parameters
pub fn add_grads(
    a: BTreeMap<String, Tensor>,
    b: &BTreeMap<String, Tensor>,
) -> Result<BTreeMap<String, Tensor>> {
    a.into_iter()
        .map(|(k, x)| match b.get(&k) {
            Some(y) => Ok((k, x.add(y)?)),
            None => Ok((k, x)),
        })
        .collect()
}

/// Check for exactly two pool-size-one binary layers under a softmax
pub fn check_variance_reduced_topology(dbm: &Dbm) -> Result<()> {
    let ok = matches!(
        dbm.hidden(),
        [
            Layer::BinaryVectorMaxPool(a),
            Layer::BinaryVectorMaxPool(b),
            Layer::Softmax(_)
        ] if a.pool_size() == 1 && b.pool_size() == 1
    );
    if !ok {
        config_bail!(
            "variance-reduced negative phase needs [MaxPool(1), MaxPool(1), Softmax], got {:?}",
            dbm.hidden()
                .iter()
                .map(|l| match l {
                    Layer::BinaryVector(_) => "BinaryVector".to_string(),
                    Layer::BinaryVectorMaxPool(m) => format!("MaxPool({})", m.pool_size()),
                    Layer::Softmax(_) => "Softmax".to_string(),
                })
                .collect::<Vec<_>>()
        );
    }
    Ok(())
}

/// `0.5 E(V_s, [H1_mf, H2_s, Y_mf]) + 0.5 E(V_mf, [H1_s, H2_mf, Y_s])`
/// per chain.
///
/// * `samples` - stack states `[V, H1, H2, Y]` drawn by the chains
/// * `mf` - mean-field states of the same stack given the samples
///
pub fn variance_reduced_energy(
    dbm: &Dbm,
    samples: &[LayerState],
    mf: &[LayerState],
) -> Result<Tensor> {
    check_variance_reduced_topology(dbm)?;
    if samples.len() != 4 || mf.len() != 4 {
        config_bail!("variance reduction needs four stack states");
    }
    let odd_smoothed = [mf[1].clone(), samples[2].clone(), mf[3].clone()];
    let even_smoothed = [samples[1].clone(), mf[2].clone(), samples[3].clone()];
    let e1 = dbm.energy(&samples[0].h, &odd_smoothed)?;
    let e2 = dbm.energy(&mf[0].h, &even_smoothed)?;
    Ok(e1.affine(0.5, 0.0)?.add(&e2.affine(0.5, 0.0)?)?)
}

impl GradientEstimator {
    pub fn plain(num_gibbs_steps: usize, niter: usize, procedure: MeanFieldProcedure) -> Self {
        Self {
            rule: NegativePhase::Plain,
            num_gibbs_steps,
            niter,
            procedure,
        }
    }

    /// Estimator with the two-way averaged negative phase; fails unless
    /// the model is `[MaxPool(1), MaxPool(1), Softmax]` above the visible
    /// layer.
    pub fn variance_reduced(
        dbm: &Dbm,
        num_gibbs_steps: usize,
        niter: usize,
        procedure: MeanFieldProcedure,
    ) -> Result<Self> {
        check_variance_reduced_topology(dbm)?;
        Ok(Self {
            rule: NegativePhase::VarianceReduced,
            num_gibbs_steps,
            niter,
            procedure,
        })
    }

    pub fn rule(&self) -> NegativePhase {
        self.rule
    }

    pub fn niter(&self) -> usize {
        self.niter
    }

    pub fn procedure(&self) -> MeanFieldProcedure {
        self.procedure
    }

    pub fn num_gibbs_steps(&self) -> usize {
        self.num_gibbs_steps
    }

    /// Gradient of the batch-mean expected energy with the posterior
    /// detached, and that energy's value.
    pub fn positive_phase(
        &self,
        dbm: &Dbm,
        v: &Tensor,
        y: Option<&Tensor>,
    ) -> Result<(BTreeMap<String, Tensor>, f64)> {
        let q: Vec<LayerState> = dbm
            .mf(v, y, self.niter, self.procedure)?
            .iter()
            .map(LayerState::detach)
            .collect();
        let energy = dbm.expected_energy(&v.detach(), &q)?.mean_all()?;
        let value = scalar_f64(&energy)?;
        Ok((grads_of(&energy, &dbm.params())?, value))
    }

    /// Negative-phase loss over chain states; differentiating it gives
    /// the negative-phase gradient directly.
    pub fn negative_loss(&self, dbm: &Dbm, samples: &[LayerState]) -> Result<Tensor> {
        let samples: Vec<LayerState> = samples.iter().map(LayerState::detach).collect();
        let energy = match self.rule {
            NegativePhase::Plain => dbm.energy(&samples[0].h, &samples[1..])?,
            NegativePhase::VarianceReduced => {
                let mf = (0..samples.len())
                    .map(|k| Ok(dbm.stack_mean(&samples, k)?.detach()))
                    .collect::<Result<Vec<_>>>()?;
                variance_reduced_energy(dbm, &samples, &mf)?
            }
        };
        Ok(energy.mean_all()?.neg()?)
    }

    /// Advance the chains and combine both phases
    pub fn estimate<R: Rng + ?Sized>(
        &self,
        dbm: &Dbm,
        v: &Tensor,
        y: Option<&Tensor>,
        chains: &PersistentChains,
        rng: &mut R,
    ) -> Result<GradientResult> {
        let (pos, positive_energy) = self.positive_phase(dbm, v, y)?;
        let chain_update = chains.advance(dbm, self.num_gibbs_steps, rng)?;
        let neg = grads_of(&self.negative_loss(dbm, &chain_update)?, &dbm.params())?;
        Ok(GradientResult {
            grads: add_grads(pos, &neg)?,
            chain_update,
            positive_energy,
        })
    }

    /// Classification error channels when the model carries labels
    pub fn monitoring_channels(
        &self,
        dbm: &Dbm,
        v: &Tensor,
        y: Option<&Tensor>,
    ) -> Result<BTreeMap<String, f64>> {
        match y {
            Some(y) if dbm.has_labels() => {
                dbm.classification_channels(v, y, self.niter, self.procedure)
            }
            _ => Ok(BTreeMap::new()),
        }
    }
}

/// Parameters appearing in more than one list are kept once
pub fn dedup_params(params: Vec<NamedParam>) -> Vec<NamedParam> {
    let mut seen = std::collections::HashSet::new();
    params
        .into_iter()
        .filter(|p| seen.insert(p.var.as_tensor().id()))
        .collect()
}
