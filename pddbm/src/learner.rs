//! One-minibatch learning step shared by the DBM and the composite model.

use crate::chains::PersistentChains;
use crate::config::HyperParams;
use crate::dbm::Dbm;
use crate::config_bail;
use crate::error::Result;
use crate::gradient::{GradientEstimator, NegativePhase};
use crate::layers::NamedParam;
use crate::optimizer::MomentumSgd;
use candle_core::Tensor;
use log::info;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::collections::BTreeMap;

/// Observed data for one step; `y` holds one-hot labels when supervised
#[derive(Clone, Debug)]
pub struct MiniBatch {
    pub x: Tensor,
    pub y: Option<Tensor>,
}

impl MiniBatch {
    pub fn new(x: Tensor, y: Option<Tensor>) -> Self {
        Self { x, y }
    }

    pub fn unlabeled(x: Tensor) -> Self {
        Self { x, y: None }
    }

    pub fn num_rows(&self) -> Result<usize> {
        Ok(self.x.dim(0)?)
    }
}

/// Outcome of one learning step
#[derive(Clone, Debug)]
pub struct StepReport {
    /// Objective at the posterior used for the step (higher is better)
    pub objective: f64,
    pub examples_seen: usize,
}

pub trait Learn {
    /// Infer, estimate gradients, apply one parameter update and one
    /// chain update.
    fn learn_mini_batch(
        &mut self,
        batch: &MiniBatch,
        learning_rate: f64,
        terminal_velocity: f64,
    ) -> Result<StepReport>;

    /// Named diagnostics; never mutates the model
    fn monitoring_channels(&self, batch: &MiniBatch) -> Result<BTreeMap<String, f64>>;

    fn params(&self) -> Vec<NamedParam>;

    fn chains(&self) -> &PersistentChains;

    fn chains_mut(&mut self) -> &mut PersistentChains;

    /// Names of the Gibbs stack layers, visible first
    fn stack_names(&self) -> Vec<String>;
}

/// Reports every `print_interval` examples
#[derive(Clone, Debug)]
pub struct StatusPrinter {
    print_interval: usize,
    next_print: usize,
}

impl StatusPrinter {
    pub fn new(print_interval: usize) -> Self {
        Self {
            print_interval,
            next_print: print_interval,
        }
    }

    pub fn maybe_print(&mut self, what: &str, report: &StepReport) {
        if self.print_interval == 0 || report.examples_seen < self.next_print {
            return;
        }
        while self.next_print <= report.examples_seen {
            self.next_print += self.print_interval;
        }
        info!(
            "{}: {} examples seen, objective {:.6}",
            what, report.examples_seen, report.objective
        );
    }
}

/// Stochastic maximum likelihood training of a plain DBM
pub struct DbmLearner {
    dbm: Dbm,
    estimator: GradientEstimator,
    chains: PersistentChains,
    optimizer: MomentumSgd,
    rng: SmallRng,
    examples_seen: usize,
    status: StatusPrinter,
}

impl DbmLearner {
    pub fn new(dbm: Dbm, hp: &HyperParams) -> Result<Self> {
        hp.validate()?;
        let mut rng = SmallRng::seed_from_u64(hp.seed);
        let estimator = if hp.variance_reduction {
            GradientEstimator::variance_reduced(&dbm, hp.num_gibbs_steps, hp.mf_iter, hp.mf_procedure)?
        } else {
            GradientEstimator::plain(hp.num_gibbs_steps, hp.mf_iter, hp.mf_procedure)
        };
        let chains = PersistentChains::new(&dbm, hp.num_chains, &mut rng)?;
        info!(
            "DBM learner: {} chains, {} Gibbs steps, {:?} negative phase",
            hp.num_chains,
            hp.num_gibbs_steps,
            estimator.rule()
        );
        Ok(Self {
            dbm,
            estimator,
            chains,
            optimizer: MomentumSgd::new(),
            rng,
            examples_seen: 0,
            status: StatusPrinter::new(hp.print_interval),
        })
    }

    pub fn dbm(&self) -> &Dbm {
        &self.dbm
    }

    pub fn estimator(&self) -> &GradientEstimator {
        &self.estimator
    }
}

impl Learn for DbmLearner {
    fn learn_mini_batch(
        &mut self,
        batch: &MiniBatch,
        learning_rate: f64,
        terminal_velocity: f64,
    ) -> Result<StepReport> {
        if self.estimator.rule() == NegativePhase::VarianceReduced && batch.y.is_none() {
            config_bail!("the variance-reduced negative phase needs labels");
        }
        let result = self.estimator.estimate(
            &self.dbm,
            &batch.x,
            batch.y.as_ref(),
            &self.chains,
            &mut self.rng,
        )?;
        self.optimizer
            .step(&self.dbm.params(), &result.grads, learning_rate, terminal_velocity)?;
        self.chains.apply(result.chain_update)?;

        self.examples_seen += batch.num_rows()?;
        let report = StepReport {
            objective: -result.positive_energy,
            examples_seen: self.examples_seen,
        };
        self.status.maybe_print("DBM", &report);
        Ok(report)
    }

    fn monitoring_channels(&self, batch: &MiniBatch) -> Result<BTreeMap<String, f64>> {
        self.estimator
            .monitoring_channels(&self.dbm, &batch.x, batch.y.as_ref())
    }

    fn params(&self) -> Vec<NamedParam> {
        self.dbm.params()
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbm::{DbmArch, MeanFieldProcedure};
    use crate::error::PddbmError;
    use crate::tensor_ops::*;
    use candle_core::{DType, Device};

    #[test]
    fn one_step_moves_parameters_and_counts_examples() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(5);
        let dbm = DbmArch {
            nvis: 4,
            hidden_dims: vec![5, 10],
            pool_size: 1,
            n_classes: Some(3),
            irange: 0.1,
            init_bias_hid: 0.0,
        }
        .build(DType::F64, &Device::Cpu, &mut rng)?;
        let hp = HyperParams {
            num_chains: 6,
            num_gibbs_steps: 2,
            mf_iter: 2,
            mf_procedure: MeanFieldProcedure::Consistent,
            print_interval: 0,
            ..HyperParams::default()
        };
        let mut learner = DbmLearner::new(dbm, &hp)?;
        let before = learner.params()[0].var.as_tensor().to_vec1::<f64>()?;

        let x = sample_bernoulli(&mut rng, &Tensor::full(0.8f64, (5, 4), &Device::Cpu)?)?;
        let y = sample_categorical(&mut rng, &Tensor::full(1.0f64 / 3.0, (5, 3), &Device::Cpu)?)?;
        let batch = MiniBatch::new(x, Some(y));
        let report = learner.learn_mini_batch(&batch, 0.05, 2.0)?;
        assert_eq!(report.examples_seen, 5);
        assert!(report.objective.is_finite());

        let after = learner.params()[0].var.as_tensor().to_vec1::<f64>()?;
        assert_ne!(before, after);

        let channels = learner.monitoring_channels(&batch)?;
        assert!(channels.contains_key("misclass"));
        assert!(channels.contains_key("recons_misclass"));
        assert_eq!(learner.stack_names(), vec!["v", "h1", "h2", "y"]);
        Ok(())
    }

    #[test]
    fn variance_reduction_requires_labels() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(8);
        let dbm = DbmArch {
            nvis: 4,
            hidden_dims: vec![5, 4],
            pool_size: 1,
            n_classes: Some(2),
            irange: 0.1,
            init_bias_hid: 0.0,
        }
        .build(DType::F64, &Device::Cpu, &mut rng)?;
        let hp = HyperParams {
            num_chains: 4,
            num_gibbs_steps: 1,
            mf_iter: 2,
            print_interval: 0,
            ..HyperParams::default()
        };
        let mut learner = DbmLearner::new(dbm, &hp)?;
        assert_eq!(learner.estimator().rule(), NegativePhase::VarianceReduced);
        let before = learner.params()[1].var.as_tensor().to_vec2::<f64>()?;

        let x = sample_bernoulli(&mut rng, &Tensor::full(0.5f64, (3, 4), &Device::Cpu)?)?;
        let result = learner.learn_mini_batch(&MiniBatch::unlabeled(x), 0.05, 2.0);
        assert!(matches!(result, Err(PddbmError::Configuration(_))));
        assert_eq!(learner.params()[1].var.as_tensor().to_vec2::<f64>()?, before);
        Ok(())
    }

    #[test]
    fn status_printer_interval() {
        let mut printer = StatusPrinter::new(10);
        let report = StepReport {
            objective: 0.0,
            examples_seen: 25,
        };
        printer.maybe_print("test", &report);
        assert_eq!(printer.next_print, 30);
    }
}
