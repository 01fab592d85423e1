//! Training hyperparameters, read from and written to JSON.

use crate::config_bail;
use crate::dbm::MeanFieldProcedure;
use crate::error::{PddbmError, Result};
use crate::inference::{InferenceOptions, ScheduleStep};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperParams {
    /// Number of persistent chains. Default: 100
    pub num_chains: usize,
    /// Gibbs sweeps per minibatch. Default: 5
    pub num_gibbs_steps: usize,
    /// Initial learning rate. Default: 0.1
    pub learning_rate: f64,
    /// Learning rate is divided by this after every epoch. Default: 1.0001
    pub lr_decay: f64,
    /// Floor for the learning rate. Default: 5e-5
    pub min_learning_rate: f64,
    /// Initial terminal velocity. Default: 2
    pub terminal_velocity_init: f64,
    /// Terminal velocity is multiplied by this after every epoch. Default: 1.001
    pub terminal_velocity_mult: f64,
    /// Ceiling for the terminal velocity. Default: 10
    pub terminal_velocity_max: f64,
    /// Composite E-step schedule
    pub schedule: Vec<ScheduleStep>,
    pub clip_reflections: bool,
    /// Reflection bound in (0, 1). Default: 0.5
    pub rho: f64,
    pub monitor_kl: bool,
    /// Mean-field sweeps for the DBM positive phase. Default: 5
    pub mf_iter: usize,
    pub mf_procedure: MeanFieldProcedure,
    /// Use the two-way averaged negative phase (DBM training only)
    pub variance_reduction: bool,
    pub batch_size: usize,
    pub num_epochs: usize,
    /// Report status every this many examples (0 = never). Default: 10000
    pub print_interval: usize,
    pub seed: u64,
}

impl Default for HyperParams {
    fn default() -> Self {
        let inference = InferenceOptions::default();
        Self {
            num_chains: 100,
            num_gibbs_steps: 5,
            learning_rate: 0.1,
            lr_decay: 1.0001,
            min_learning_rate: 5e-5,
            terminal_velocity_init: 2.0,
            terminal_velocity_mult: 1.001,
            terminal_velocity_max: 10.0,
            schedule: inference.schedule,
            clip_reflections: inference.clip_reflections,
            rho: inference.rho,
            monitor_kl: inference.monitor_kl,
            mf_iter: 5,
            mf_procedure: MeanFieldProcedure::WeightDoubling,
            variance_reduction: true,
            batch_size: 100,
            num_epochs: 10,
            print_interval: 10000,
            seed: 42,
        }
    }
}

impl HyperParams {
    pub fn validate(&self) -> Result<()> {
        if self.num_chains == 0 {
            config_bail!("num_chains must be positive");
        }
        if self.batch_size == 0 {
            config_bail!("batch_size must be positive");
        }
        if !(self.rho > 0.0 && self.rho < 1.0) {
            config_bail!("rho must be in (0, 1), got {}", self.rho);
        }
        if !(self.learning_rate > 0.0 && self.min_learning_rate > 0.0) {
            config_bail!("learning rates must be positive");
        }
        if !(self.lr_decay >= 1.0) {
            config_bail!("lr_decay must be at least 1, got {}", self.lr_decay);
        }
        if !(self.terminal_velocity_init >= 1.0
            && self.terminal_velocity_mult >= 1.0
            && self.terminal_velocity_max >= self.terminal_velocity_init)
        {
            config_bail!(
                "terminal velocity init {} / mult {} / max {} are inconsistent",
                self.terminal_velocity_init,
                self.terminal_velocity_mult,
                self.terminal_velocity_max
            );
        }
        for step in self.schedule.iter() {
            match step {
                ScheduleStep::S(c) | ScheduleStep::H(c) if !(0.0..=1.0).contains(c) => {
                    config_bail!("step {} has a damping coefficient outside [0, 1]", step)
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn inference_options(&self) -> InferenceOptions {
        InferenceOptions {
            schedule: self.schedule.clone(),
            clip_reflections: self.clip_reflections,
            rho: self.rho,
            monitor_kl: self.monitor_kl,
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let hp: HyperParams = serde_json::from_str(&text)
            .map_err(|e| PddbmError::Configuration(format!("{}: {}", path.display(), e)))?;
        hp.validate()?;
        Ok(hp)
    }

    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| PddbmError::Configuration(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }
}
