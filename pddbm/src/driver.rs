//! Epoch loop around [`Learn`]: shuffling, minibatches, annealing,
//! monitoring and snapshots.

use crate::composite::Pddbm;
use crate::config::HyperParams;
use crate::learner::{DbmLearner, Learn, MiniBatch};
use crate::snapshot;
use candle_core::Tensor;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Learning-rate decay toward a floor and terminal-velocity growth
/// toward a ceiling, applied once per epoch.
#[derive(Clone, Debug)]
pub struct Annealer {
    learning_rate: f64,
    lr_decay: f64,
    min_learning_rate: f64,
    terminal_velocity: f64,
    tv_mult: f64,
    tv_max: f64,
}

impl Annealer {
    pub fn new(hp: &HyperParams) -> Self {
        Self {
            learning_rate: hp.learning_rate,
            lr_decay: hp.lr_decay,
            min_learning_rate: hp.min_learning_rate,
            terminal_velocity: hp.terminal_velocity_init,
            tv_mult: hp.terminal_velocity_mult,
            tv_max: hp.terminal_velocity_max,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn terminal_velocity(&self) -> f64 {
        self.terminal_velocity
    }

    pub fn step(&mut self) {
        self.learning_rate = (self.learning_rate / self.lr_decay).max(self.min_learning_rate);
        self.terminal_velocity = (self.terminal_velocity * self.tv_mult).min(self.tv_max);
    }
}

pub struct TrainConfig {
    pub hp: HyperParams,
    /// Snapshot written after every epoch and at the end
    pub output: Option<PathBuf>,
    pub verbose: bool,
    pub show_progress: bool,
}

/// Objective and channels recorded at the end of every epoch
#[derive(Clone, Debug, Default)]
pub struct TrainTrace {
    pub objective: Vec<f64>,
    pub channels: Vec<BTreeMap<String, f64>>,
}

fn shuffled_minibatches(
    n: usize,
    batch_size: usize,
    rng: &mut SmallRng,
) -> Vec<Vec<u32>> {
    let mut rows: Vec<u32> = (0..n as u32).collect();
    rows.shuffle(rng);
    rows.chunks(batch_size).map(|c| c.to_vec()).collect()
}

fn select_rows(x: &Tensor, rows: &[u32]) -> anyhow::Result<Tensor> {
    let idx = Tensor::from_slice(rows, rows.len(), x.device())?;
    Ok(x.index_select(&idx, 0)?)
}

/// Run `hp.num_epochs` epochs over `data`
///
/// * `learner` - model with its persistent chains
/// * `data` - observations `[n, nvis]`
/// * `labels` - optional one-hot labels `[n, k]`
/// * `config` - hyperparameters and output settings
///
pub fn fit<L: Learn>(
    learner: &mut L,
    data: &Tensor,
    labels: Option<&Tensor>,
    config: &TrainConfig,
) -> anyhow::Result<TrainTrace> {
    let hp = &config.hp;
    hp.validate()?;
    let n = data.dim(0)?;
    if n == 0 {
        anyhow::bail!("no training examples");
    }
    if let Some(y) = labels {
        if y.dim(0)? != n {
            anyhow::bail!("{} labels for {} examples", y.dim(0)?, n);
        }
    }

    let mut rng = SmallRng::seed_from_u64(hp.seed.wrapping_add(1));
    let mut annealer = Annealer::new(hp);
    let mut trace = TrainTrace::default();

    let pb = ProgressBar::new(hp.num_epochs as u64);
    if !config.show_progress || config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    for epoch in 0..hp.num_epochs {
        let mut objective_tot = 0f64;
        let batches = shuffled_minibatches(n, hp.batch_size, &mut rng);
        for rows in batches.iter() {
            let x = select_rows(data, rows)?;
            let y = labels.map(|y| select_rows(y, rows)).transpose()?;
            let report = learner.learn_mini_batch(
                &MiniBatch::new(x, y),
                annealer.learning_rate(),
                annealer.terminal_velocity(),
            )?;
            objective_tot += report.objective * rows.len() as f64;
        }
        trace.objective.push(objective_tot / n as f64);

        let monitor_rows: Vec<u32> = (0..n.min(hp.batch_size) as u32).collect();
        let monitor = MiniBatch::new(
            select_rows(data, &monitor_rows)?,
            labels.map(|y| select_rows(y, &monitor_rows)).transpose()?,
        );
        let channels = learner.monitoring_channels(&monitor)?;

        if config.verbose {
            info!(
                "[{}] objective: {:.6}, lr: {:.3e}, tv: {:.4}",
                epoch + 1,
                trace.objective.last().copied().unwrap_or(f64::NAN),
                annealer.learning_rate(),
                annealer.terminal_velocity()
            );
            for (k, v) in channels.iter() {
                info!("[{}] {}: {:.6}", epoch + 1, k, v);
            }
        }
        trace.channels.push(channels);

        if let Some(out) = config.output.as_ref() {
            snapshot::save(out, &learner.params(), &learner.stack_names(), learner.chains())?;
        }

        annealer.step();
        pb.inc(1);
    }
    pb.finish_and_clear();
    Ok(trace)
}

/// Train a DBM (optionally supervised) on binary data
pub fn train_dbm(
    learner: &mut DbmLearner,
    data: &Tensor,
    labels: Option<&Tensor>,
    config: &TrainConfig,
) -> anyhow::Result<TrainTrace> {
    info!(
        "training DBM on {} examples for {} epochs",
        data.dim(0)?,
        config.hp.num_epochs
    );
    fit(learner, data, labels, config)
}

/// Train a PD-DBM on real-valued data
pub fn train_pddbm(
    model: &mut Pddbm,
    data: &Tensor,
    config: &TrainConfig,
) -> anyhow::Result<TrainTrace> {
    info!(
        "training PD-DBM on {} examples for {} epochs",
        data.dim(0)?,
        config.hp.num_epochs
    );
    fit(model, data, None, config)
}
