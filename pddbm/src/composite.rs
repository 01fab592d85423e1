//! PD-DBM: an S3C layer whose spike prior is a DBM.
//!
//! The DBM's visible layer *is* the S3C spike layer: it shares the S3C
//! hidden bias, and its state during inference is `H_hat`. The joint
//! E-step is [`InferenceProcedure`]; the M-step maximizes the S3C
//! expectations plus the DBM's negative expected energy under the
//! detached posterior, with the DBM log partition function handled by
//! persistent chains.

use crate::chains::PersistentChains;
use crate::config::HyperParams;
use crate::config_bail;
use crate::dbm::Dbm;
use crate::error::Result;
use crate::gradient::{add_grads, dedup_params, grads_of};
use crate::inference::{InferenceOptions, InferenceProcedure, VariationalParams};
use crate::layers::{Layer, NamedParam};
use crate::learner::{Learn, MiniBatch, StatusPrinter, StepReport};
use crate::optimizer::MomentumSgd;
use crate::s3c::S3c;
use crate::sufficient_stats::{StatName, SufficientStats};
use crate::tensor_ops::*;
use candle_core::Tensor;
use log::{info, warn};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::collections::BTreeMap;

pub struct Pddbm {
    s3c: S3c,
    dbm: Dbm,
    inference: InferenceProcedure,
    chains: PersistentChains,
    optimizer: MomentumSgd,
    num_gibbs_steps: usize,
    rng: SmallRng,
    examples_seen: usize,
    status: StatusPrinter,
}

/// Turn off S3C conveniences that only make sense for a standalone S3C
fn disable_standalone_options(s3c: &mut S3c) {
    let opts = s3c.options_mut();
    if opts.monitor_functional {
        warn!("monitor_functional is not supported inside a PD-DBM; disabled");
        opts.monitor_functional = false;
    }
    if opts.recycle_q {
        warn!("recycle_q is not supported inside a PD-DBM; disabled");
        opts.recycle_q = false;
    }
    if opts.debug_m_step {
        warn!("debug_m_step is not supported inside a PD-DBM; disabled");
        opts.debug_m_step = false;
    }
}

impl Pddbm {
    /// Wire the two models together.
    ///
    /// Fails with a configuration error when the DBM's visible layer does
    /// not match the S3C hidden layer or the schedule names a missing g
    /// layer.
    pub fn new(
        mut s3c: S3c,
        mut dbm: Dbm,
        inference_options: InferenceOptions,
        hp: &HyperParams,
    ) -> Result<Self> {
        hp.validate()?;
        if !matches!(dbm.visible(), Layer::BinaryVector(_)) {
            config_bail!("the DBM visible layer must be a BinaryVector");
        }
        if dbm.nvis() != s3c.nhid() {
            config_bail!(
                "DBM visible width {} does not match S3C nhid {}",
                dbm.nvis(),
                s3c.nhid()
            );
        }
        if dbm.dtype() != s3c.dtype() {
            config_bail!(
                "S3C uses {:?} but the DBM uses {:?}",
                s3c.dtype(),
                dbm.dtype()
            );
        }
        let inference = InferenceProcedure::new(inference_options)?;
        inference.validate_for(dbm.num_hidden())?;

        disable_standalone_options(&mut s3c);
        dbm.share_visible_bias(s3c.bias_hid().clone())?;

        let mut rng = SmallRng::seed_from_u64(hp.seed);
        let chains = PersistentChains::new(&dbm, hp.num_chains, &mut rng)?;

        info!(
            "PD-DBM: S3C {} -> {}, DBM with {} hidden layers, {} chains",
            s3c.nvis(),
            s3c.nhid(),
            dbm.num_hidden(),
            hp.num_chains
        );

        Ok(Self {
            s3c,
            dbm,
            inference,
            chains,
            optimizer: MomentumSgd::new(),
            num_gibbs_steps: hp.num_gibbs_steps,
            rng,
            examples_seen: 0,
            status: StatusPrinter::new(hp.print_interval),
        })
    }

    pub fn s3c(&self) -> &S3c {
        &self.s3c
    }

    pub fn dbm(&self) -> &Dbm {
        &self.dbm
    }

    pub fn inference(&self) -> &InferenceProcedure {
        &self.inference
    }

    fn positive_needs() -> Vec<StatName> {
        let mut names: Vec<StatName> = S3c::expected_log_prob_v_given_hs_needs()
            .iter()
            .chain(S3c::log_likelihood_s_given_h_needs())
            .copied()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Batch-mean objective to maximize with the posterior held fixed.
    /// Its entropy part is constant in the parameters and left out.
    fn positive_objective(&self, v: &Tensor, q: &VariationalParams) -> Result<Tensor> {
        let stats =
            SufficientStats::from_observations(&Self::positive_needs(), &q.observations(v))?
                .detach();
        let log_v = self
            .s3c
            .expected_log_prob_v_given_hs(&stats, &q.h_hat, &q.s_hat)?;
        let log_s = self.s3c.log_likelihood_s_given_h(&stats)?;
        let energy = self.dbm.expected_energy(&q.h_hat, &q.g_hat)?.mean_all()?;
        Ok(log_v.add(&log_s)?.sub(&energy)?)
    }

    /// Draw `batch_size` visible vectors: Gibbs sampling of the DBM from
    /// its priors, then the S3C conditional given the sampled spikes.
    pub fn random_design_matrix(&mut self, batch_size: usize) -> Result<Tensor> {
        let chains = PersistentChains::new(&self.dbm, batch_size, &mut self.rng)?;
        let states = chains.advance(&self.dbm, self.num_gibbs_steps.max(1), &mut self.rng)?;
        self.s3c.random_design_matrix(&states[0].h, &mut self.rng)
    }
}

impl Learn for Pddbm {
    fn learn_mini_batch(
        &mut self,
        batch: &MiniBatch,
        learning_rate: f64,
        terminal_velocity: f64,
    ) -> Result<StepReport> {
        let v = batch.x.detach();
        let q = self.inference.infer(&self.s3c, &self.dbm, &v)?.detach();
        let params = self.params();

        let objective = self.positive_objective(&v, &q)?;
        let pos = grads_of(&objective.neg()?, &params)?;

        let chain_update = self
            .chains
            .advance(&self.dbm, self.num_gibbs_steps, &mut self.rng)?;
        let neg_loss = self
            .dbm
            .energy(&chain_update[0].h, &chain_update[1..])?
            .mean_all()?
            .neg()?;
        let neg = grads_of(&neg_loss, &params)?;

        let grads = add_grads(pos, &neg)?;
        self.optimizer
            .step(&params, &grads, learning_rate, terminal_velocity)?;
        self.s3c.censor_updates()?;
        self.chains.apply(chain_update)?;

        self.examples_seen += batch.num_rows()?;
        let report = StepReport {
            objective: -self.inference.truncated_kl(&self.s3c, &self.dbm, &v, &q)?,
            examples_seen: self.examples_seen,
        };
        self.status.maybe_print("PD-DBM", &report);
        Ok(report)
    }

    fn monitoring_channels(&self, batch: &MiniBatch) -> Result<BTreeMap<String, f64>> {
        let v = &batch.x;
        let q = self.inference.infer(&self.s3c, &self.dbm, v)?;
        let mut out = BTreeMap::new();

        out.insert("s3c_mean_h".to_string(), scalar_f64(&q.h_hat.mean_all()?)?);
        out.insert(
            "s3c_mean_abs_s".to_string(),
            scalar_f64(&q.s_hat.abs()?.mean_all()?)?,
        );
        for p in self.s3c.params() {
            let x = p.var.as_tensor();
            let short = p.name.trim_start_matches("s3c.");
            out.insert(format!("s3c_{}_min", short), scalar_f64(&x.min_all()?)?);
            out.insert(format!("s3c_{}_max", short), scalar_f64(&x.max_all()?)?);
        }
        for (layer, state) in self.dbm.hidden().iter().zip(q.g_hat.iter()) {
            out.insert(
                format!("dbm_{}_mean", layer.name()),
                scalar_f64(&state.h.mean_all()?)?,
            );
        }
        out.insert(
            "dbm_chain_mean_v".to_string(),
            scalar_f64(&self.chains.visible().h.mean_all()?)?,
        );

        if self.inference.options().monitor_kl {
            out.extend(self.inference.kl_channels(&self.s3c, &self.dbm, v)?);
        }
        Ok(out)
    }

    fn params(&self) -> Vec<NamedParam> {
        dedup_params(
            self.s3c
                .params()
                .into_iter()
                .chain(self.dbm.params())
                .collect(),
        )
    }

    fn chains(&self) -> &PersistentChains {
        &self.chains
    }

    fn chains_mut(&mut self) -> &mut PersistentChains {
        &mut self.chains
    }

    fn stack_names(&self) -> Vec<String> {
        (0..self.dbm.stack_len())
            .map(|k| self.dbm.stack_layer(k).name().to_string())
            .collect()
    }
}
