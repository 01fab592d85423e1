//! Fixed-point mean-field schedule for the joint S3C + DBM posterior.
//!
//! The posterior is q(h, s) for the S3C layer times one factorized
//! distribution per DBM hidden layer (`G_hat`). A schedule is an ordered
//! list of coordinate updates consumed once per call:
//!
//! * `s:c` - slab means, optionally reflection-clipped, damped by `c`
//! * `h:c` - spike probabilities with the top-down term from `G_hat[0]`,
//!   damped by `c`
//! * `g:i` - `G_hat[i]` from both neighbours (one-sided at the top)

use crate::dbm::Dbm;
use crate::error::{PddbmError, Result};
use crate::layers::{Layer, LayerState};
use crate::s3c::S3c;
use crate::sufficient_stats::{Observations, StatName, SufficientStats};
use crate::tensor_ops::*;
use crate::{config_bail, domain_bail};
use candle_core::Tensor;
use log::debug;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScheduleStep {
    S(f64),
    H(f64),
    G(usize),
}

impl FromStr for ScheduleStep {
    type Err = PddbmError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, arg) = match s.trim().split_once(':') {
            Some(x) => x,
            None => config_bail!("schedule step {:?} is not of the form <kind>:<arg>", s),
        };
        let coeff = || -> Result<f64> {
            match arg.trim().parse::<f64>() {
                Ok(c) if (0.0..=1.0).contains(&c) => Ok(c),
                _ => config_bail!("damping coefficient {:?} must be in [0, 1]", arg),
            }
        };
        match kind.trim() {
            "s" | "S" => Ok(ScheduleStep::S(coeff()?)),
            "h" | "H" => Ok(ScheduleStep::H(coeff()?)),
            "g" | "G" => match arg.trim().parse::<usize>() {
                Ok(i) => Ok(ScheduleStep::G(i)),
                Err(_) => config_bail!("g step index {:?} is not a layer index", arg),
            },
            other => config_bail!("unknown schedule step kind {:?}", other),
        }
    }
}

impl fmt::Display for ScheduleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleStep::S(c) => write!(f, "s:{}", c),
            ScheduleStep::H(c) => write!(f, "h:{}", c),
            ScheduleStep::G(i) => write!(f, "g:{}", i),
        }
    }
}

impl TryFrom<String> for ScheduleStep {
    type Error = PddbmError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ScheduleStep> for String {
    fn from(step: ScheduleStep) -> String {
        step.to_string()
    }
}

/// Parse a comma-separated schedule such as `s:0.5,h:1.0,g:0`
pub fn parse_schedule(s: &str) -> Result<Vec<ScheduleStep>> {
    s.split(',')
        .filter(|x| !x.trim().is_empty())
        .map(str::parse)
        .collect()
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct InferenceOptions {
    pub schedule: Vec<ScheduleStep>,
    pub clip_reflections: bool,
    pub rho: f64,
    pub monitor_kl: bool,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            schedule: vec![
                ScheduleStep::S(1.0),
                ScheduleStep::H(1.0),
                ScheduleStep::G(0),
                ScheduleStep::S(0.5),
                ScheduleStep::H(0.5),
                ScheduleStep::G(0),
            ],
            clip_reflections: false,
            rho: 0.5,
            monitor_kl: false,
        }
    }
}

/// Variational parameters for one batch
#[derive(Clone, Debug)]
pub struct VariationalParams {
    pub h_hat: Tensor,
    pub s_hat: Tensor,
    pub g_hat: Vec<LayerState>,
    pub var_s0_hat: Tensor,
    pub var_s1_hat: Tensor,
}

impl VariationalParams {
    /// Same values, treated as constants by any gradient taken later
    pub fn detach(&self) -> Self {
        Self {
            h_hat: self.h_hat.detach(),
            s_hat: self.s_hat.detach(),
            g_hat: self.g_hat.iter().map(LayerState::detach).collect(),
            var_s0_hat: self.var_s0_hat.detach(),
            var_s1_hat: self.var_s1_hat.detach(),
        }
    }

    pub fn observations<'a>(&'a self, v: &'a Tensor) -> Observations<'a> {
        Observations {
            v,
            h_hat: &self.h_hat,
            s_hat: &self.s_hat,
            var_s0_hat: &self.var_s0_hat,
            var_s1_hat: &self.var_s1_hat,
        }
    }
}

#[derive(Clone, Debug)]
pub struct InferenceProcedure {
    options: InferenceOptions,
}

impl InferenceProcedure {
    pub fn new(options: InferenceOptions) -> Result<Self> {
        if !(options.rho > 0.0 && options.rho < 1.0) {
            config_bail!("rho must be in (0, 1), got {}", options.rho);
        }
        for step in options.schedule.iter() {
            match step {
                ScheduleStep::S(c) | ScheduleStep::H(c) if !(0.0..=1.0).contains(c) => {
                    config_bail!("step {} has a damping coefficient outside [0, 1]", step)
                }
                _ => {}
            }
        }
        Ok(Self { options })
    }

    pub fn options(&self) -> &InferenceOptions {
        &self.options
    }

    /// Check every `g` step against the number of DBM hidden layers
    pub fn validate_for(&self, num_g: usize) -> Result<()> {
        if num_g == 0 {
            config_bail!("inference needs at least one g layer");
        }
        for step in self.options.schedule.iter() {
            if let ScheduleStep::G(i) = step {
                if *i >= num_g {
                    config_bail!("step {} refers to g layer {} of {}", step, i, num_g);
                }
            }
        }
        Ok(())
    }

    /// Run the schedule and return the final posterior
    pub fn infer(&self, s3c: &S3c, dbm: &Dbm, v: &Tensor) -> Result<VariationalParams> {
        let mut last = None;
        self.run(s3c, dbm, v, |q| last = Some(q.clone()))?;
        match last {
            Some(q) => Ok(q),
            None => domain_bail!("inference produced no state"),
        }
    }

    /// Run the schedule and return the initial state followed by the
    /// state after every step
    pub fn infer_history(&self, s3c: &S3c, dbm: &Dbm, v: &Tensor) -> Result<Vec<VariationalParams>> {
        let mut history = Vec::with_capacity(self.options.schedule.len() + 1);
        self.run(s3c, dbm, v, |q| history.push(q.clone()))?;
        Ok(history)
    }

    fn run<F>(&self, s3c: &S3c, dbm: &Dbm, v: &Tensor, mut record: F) -> Result<()>
    where
        F: FnMut(&VariationalParams),
    {
        self.validate_for(dbm.num_hidden())?;
        ensure_dtype(v, s3c.dtype(), "V")?;
        ensure_matrix(v, s3c.nvis(), "V")?;
        if dbm.nvis() != s3c.nhid() {
            config_bail!(
                "DBM visible width {} does not match S3C nhid {}",
                dbm.nvis(),
                s3c.nhid()
            );
        }

        let mut q = self.init(s3c, dbm, v)?;
        record(&q);
        for step in self.options.schedule.iter() {
            match *step {
                ScheduleStep::S(c) => self.s_step(s3c, v, &mut q, c)?,
                ScheduleStep::H(c) => self.h_step(s3c, dbm, v, &mut q, c)?,
                ScheduleStep::G(idx) => self.g_step(dbm, &mut q, idx)?,
            }
            record(&q);
        }
        debug!("ran {} inference steps", self.options.schedule.len());
        Ok(())
    }

    /// Prior spikes and slabs, then a bottom-up pass through the DBM
    pub fn init(&self, s3c: &S3c, dbm: &Dbm, v: &Tensor) -> Result<VariationalParams> {
        let h_hat = s3c.init_h_hat(v)?;
        ensure_dtype(&h_hat, v.dtype(), "H_hat")?;
        let s_hat = s3c.init_s_hat(v)?;

        let mut g_hat: Vec<LayerState> = Vec::with_capacity(dbm.num_hidden());
        for (i, layer) in dbm.hidden().iter().enumerate() {
            let below = match i {
                0 => h_hat.clone(),
                _ => dbm.hidden()[i - 1].upward_state(&g_hat[i - 1]),
            };
            g_hat.push(layer.mf_update(Some(&below), None)?);
        }

        Ok(VariationalParams {
            h_hat,
            s_hat,
            g_hat,
            var_s0_hat: s3c.var_s0_hat()?,
            var_s1_hat: s3c.var_s1_hat()?,
        })
    }

    fn s_step(&self, s3c: &S3c, v: &Tensor, q: &mut VariationalParams, coeff: f64) -> Result<()> {
        let mut new_s = s3c.infer_s_hat(v, &q.h_hat, &q.s_hat)?;
        if self.options.clip_reflections {
            new_s = reflection_clip(&q.s_hat, &new_s, self.options.rho)?;
        }
        q.s_hat = damp(&q.s_hat, &new_s, coeff)?;
        Ok(())
    }

    fn h_step(
        &self,
        s3c: &S3c,
        dbm: &Dbm,
        v: &Tensor,
        q: &mut VariationalParams,
        coeff: f64,
    ) -> Result<()> {
        let bottom_up = s3c.infer_h_hat_presigmoid(v, &q.h_hat, &q.s_hat)?;
        let top_down = dbm.hidden()[0].downward_message(&q.g_hat[0])?;
        let new_h = sigmoid(&bottom_up.add(&top_down)?)?;
        ensure_dtype(&new_h, v.dtype(), "H_hat")?;
        q.h_hat = damp(&q.h_hat, &new_h, coeff)?;
        Ok(())
    }

    fn g_step(&self, dbm: &Dbm, q: &mut VariationalParams, idx: usize) -> Result<()> {
        let hidden = dbm.hidden();
        if idx >= hidden.len() {
            config_bail!("g step index {} out of range [0, {})", idx, hidden.len());
        }
        let below = match idx {
            0 => q.h_hat.clone(),
            _ => hidden[idx - 1].upward_state(&q.g_hat[idx - 1]),
        };
        let above: Option<(&Layer, &LayerState)> =
            hidden.get(idx + 1).map(|layer| (layer, &q.g_hat[idx + 1]));
        let new = hidden[idx].mf_update(Some(&below), above)?;
        q.g_hat[idx] = new;
        Ok(())
    }

    /// Statistics used by the truncated KL
    pub fn kl_needs() -> Vec<StatName> {
        let mut names: Vec<StatName> = S3c::expected_log_prob_v_given_hs_needs()
            .iter()
            .chain(S3c::log_likelihood_s_given_h_needs())
            .copied()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// KL(Q || P) up to the DBM log partition function, batch mean.
    ///
    /// The S3C part carries the spike bias term; the DBM part is taken
    /// without its visible bias so that term is counted once. The spike
    /// entropy likewise enters only through the S3C part.
    pub fn truncated_kl(
        &self,
        s3c: &S3c,
        dbm: &Dbm,
        v: &Tensor,
        q: &VariationalParams,
    ) -> Result<f64> {
        let stats = SufficientStats::from_observations(&Self::kl_needs(), &q.observations(v))?;
        let log_v = s3c.expected_log_prob_v_given_hs(&stats, &q.h_hat, &q.s_hat)?;
        let log_s = s3c.log_likelihood_s_given_h(&stats)?;
        let bias_h = q
            .h_hat
            .mean(0)?
            .mul(s3c.bias_hid().as_tensor())?
            .sum_all()?;
        let entropy = s3c
            .entropy_hs(&q.h_hat, &q.var_s0_hat, &q.var_s1_hat)?
            .mean_all()?;

        let s3c_part = log_v.add(&log_s)?.add(&bias_h)?.neg()?.sub(&entropy)?;
        let dbm_part = dbm.truncated_kl(&q.h_hat, &q.g_hat, true)?.mean_all()?;
        scalar_f64(&s3c_part.add(&dbm_part)?)
    }

    /// `trunc_KL_<k>` after each step, `trunc_KL_1` being the initial state
    pub fn kl_channels(&self, s3c: &S3c, dbm: &Dbm, v: &Tensor) -> Result<BTreeMap<String, f64>> {
        let history = self.infer_history(s3c, dbm, v)?;
        let mut out = BTreeMap::new();
        for (k, q) in history.iter().enumerate() {
            out.insert(
                format!("trunc_KL_{}", k + 1),
                self.truncated_kl(s3c, dbm, v, q)?,
            );
        }
        Ok(out)
    }
}
