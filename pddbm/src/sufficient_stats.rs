//! Batch-mean moments of the S3C posterior.
//!
//! Every statistic is a plain average over the batch, so duplicating every
//! example leaves all of them unchanged. Second moments across hidden units
//! are never materialized here; the one term that would need them is
//! evaluated per example by the S3C objective itself.

use crate::error::{PddbmError, Result};
use crate::tensor_ops::ensure_dtype;
use crate::{config_bail, domain_bail};
use candle_core::Tensor;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StatName {
    MeanH,
    MeanV,
    MeanSqV,
    MeanS,
    MeanS1,
    MeanSqS,
    MeanHs,
    MeanSqHs,
    MeanSqMeanHs,
    MeanHsv,
}

impl StatName {
    pub const ALL: [StatName; 10] = [
        StatName::MeanH,
        StatName::MeanV,
        StatName::MeanSqV,
        StatName::MeanS,
        StatName::MeanS1,
        StatName::MeanSqS,
        StatName::MeanHs,
        StatName::MeanSqHs,
        StatName::MeanSqMeanHs,
        StatName::MeanHsv,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatName::MeanH => "mean_h",
            StatName::MeanV => "mean_v",
            StatName::MeanSqV => "mean_sq_v",
            StatName::MeanS => "mean_s",
            StatName::MeanS1 => "mean_s1",
            StatName::MeanSqS => "mean_sq_s",
            StatName::MeanHs => "mean_hs",
            StatName::MeanSqHs => "mean_sq_hs",
            StatName::MeanSqMeanHs => "mean_sq_mean_hs",
            StatName::MeanHsv => "mean_hsv",
        }
    }
}

impl fmt::Display for StatName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatName {
    type Err = PddbmError;

    fn from_str(s: &str) -> Result<Self> {
        match StatName::ALL.iter().find(|n| n.as_str() == s) {
            Some(n) => Ok(*n),
            None => config_bail!("unknown sufficient statistic: {}", s),
        }
    }
}

/// Posterior quantities the statistics are reduced from
pub struct Observations<'a> {
    /// visible batch `[n, nvis]`
    pub v: &'a Tensor,
    /// spike probabilities `[n, nhid]`
    pub h_hat: &'a Tensor,
    /// slab means given the spike is on `[n, nhid]`
    pub s_hat: &'a Tensor,
    /// slab variance given the spike is off `[nhid]`
    pub var_s0_hat: &'a Tensor,
    /// slab variance given the spike is on `[nhid]`
    pub var_s1_hat: &'a Tensor,
}

#[derive(Clone, Debug)]
pub struct SufficientStats {
    stats: BTreeMap<StatName, Tensor>,
}

impl SufficientStats {
    /// Reduce a batch to exactly the requested statistics.
    ///
    /// * `needed` - statistics to compute
    /// * `obs` - visible batch and variational parameters
    ///
    pub fn from_observations(needed: &[StatName], obs: &Observations) -> Result<Self> {
        let n = obs.v.dim(0)?;
        if n == 0 {
            domain_bail!("sufficient statistics need a non-empty batch");
        }
        if obs.h_hat.dim(0)? != n || obs.s_hat.dims() != obs.h_hat.dims() {
            domain_bail!(
                "V {:?}, H_hat {:?} and S_hat {:?} disagree",
                obs.v.dims(),
                obs.h_hat.dims(),
                obs.s_hat.dims()
            );
        }
        let dtype = obs.v.dtype();
        ensure_dtype(obs.h_hat, dtype, "H_hat")?;
        ensure_dtype(obs.s_hat, dtype, "S_hat")?;
        ensure_dtype(obs.var_s0_hat, dtype, "var_s0_hat")?;
        ensure_dtype(obs.var_s1_hat, dtype, "var_s1_hat")?;

        let h = obs.h_hat;
        let hs = h.mul(obs.s_hat)?;

        let mut stats = BTreeMap::new();
        for &name in needed {
            if stats.contains_key(&name) {
                continue;
            }
            let value = match name {
                StatName::MeanH => h.mean(0)?,
                StatName::MeanV => obs.v.mean(0)?,
                StatName::MeanSqV => obs.v.sqr()?.mean(0)?,
                StatName::MeanS | StatName::MeanHs => hs.mean(0)?,
                StatName::MeanS1 => obs.s_hat.mean(0)?,
                StatName::MeanSqS => {
                    let on = h.mul(&obs.s_hat.sqr()?.broadcast_add(obs.var_s1_hat)?)?;
                    let off = h.affine(-1.0, 1.0)?.broadcast_mul(obs.var_s0_hat)?;
                    on.add(&off)?.mean(0)?
                }
                StatName::MeanSqHs => h
                    .mul(&obs.s_hat.sqr()?.broadcast_add(obs.var_s1_hat)?)?
                    .mean(0)?,
                StatName::MeanSqMeanHs => hs.sqr()?.mean(0)?,
                StatName::MeanHsv => (hs.t()?.matmul(obs.v)? / n as f64)?,
            };
            stats.insert(name, value);
        }
        Ok(Self { stats })
    }

    /// Same as `from_observations` with statistics requested by name
    pub fn from_named_observations(needed: &[&str], obs: &Observations) -> Result<Self> {
        let names = needed
            .iter()
            .map(|s| s.parse::<StatName>())
            .collect::<Result<Vec<_>>>()?;
        Self::from_observations(&names, obs)
    }

    pub fn get(&self, name: StatName) -> Result<&Tensor> {
        match self.stats.get(&name) {
            Some(x) => Ok(x),
            None => config_bail!("statistic {} was not computed", name),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &StatName> {
        self.stats.keys()
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Same statistics cut off from the autodiff graph
    pub fn detach(&self) -> Self {
        Self {
            stats: self
                .stats
                .iter()
                .map(|(k, v)| (*k, v.detach()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor_ops::{standard_normal_like, uniform_like};
    use candle_core::{DType, Device};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    struct Batch {
        v: Tensor,
        h: Tensor,
        s: Tensor,
        var0: Tensor,
        var1: Tensor,
    }

    impl Batch {
        fn obs(&self) -> Observations<'_> {
            Observations {
                v: &self.v,
                h_hat: &self.h,
                s_hat: &self.s,
                var_s0_hat: &self.var0,
                var_s1_hat: &self.var1,
            }
        }
    }

    fn random_batch(n: usize, nvis: usize, nhid: usize) -> Result<Batch> {
        let dev = Device::Cpu;
        let mut rng = SmallRng::seed_from_u64(11);
        let v = standard_normal_like(&mut rng, &Tensor::zeros((n, nvis), DType::F64, &dev)?)?;
        let h = uniform_like(&mut rng, &Tensor::zeros((n, nhid), DType::F64, &dev)?)?;
        let s = standard_normal_like(&mut rng, &h)?;
        let var0 = (uniform_like(&mut rng, &Tensor::zeros(nhid, DType::F64, &dev)?)? + 0.5)?;
        let var1 = (uniform_like(&mut rng, &var0)? + 0.1)?;
        Ok(Batch { v, h, s, var0, var1 })
    }

    #[test]
    fn unknown_name_is_configuration_error() -> Result<()> {
        let b = random_batch(3, 2, 4)?;
        let res = SufficientStats::from_named_observations(&["mean_h", "mean_q"], &b.obs());
        assert!(matches!(res, Err(PddbmError::Configuration(_))));
        Ok(())
    }

    #[test]
    fn only_requested_stats_are_returned() -> Result<()> {
        let b = random_batch(3, 2, 4)?;
        let stats = SufficientStats::from_named_observations(&["mean_h", "mean_hsv"], &b.obs())?;
        assert_eq!(stats.len(), 2);
        assert_eq!(stats.get(StatName::MeanHsv)?.dims(), &[4, 2]);
        assert!(matches!(
            stats.get(StatName::MeanV),
            Err(PddbmError::Configuration(_))
        ));
        Ok(())
    }

    #[test]
    fn duplicating_the_batch_changes_nothing() -> Result<()> {
        let b = random_batch(5, 3, 4)?;
        let doubled = Batch {
            v: Tensor::cat(&[&b.v, &b.v], 0)?,
            h: Tensor::cat(&[&b.h, &b.h], 0)?,
            s: Tensor::cat(&[&b.s, &b.s], 0)?,
            var0: b.var0.clone(),
            var1: b.var1.clone(),
        };
        let one = SufficientStats::from_observations(&StatName::ALL, &b.obs())?;
        let two = SufficientStats::from_observations(&StatName::ALL, &doubled.obs())?;
        for name in StatName::ALL {
            let a = one.get(name)?.flatten_all()?.to_vec1::<f64>()?;
            let c = two.get(name)?.flatten_all()?.to_vec1::<f64>()?;
            for (x, y) in a.iter().zip(c.iter()) {
                approx::assert_abs_diff_eq!(x, y, epsilon = 1e-12);
            }
        }
        Ok(())
    }

    #[test]
    fn mean_sq_s_mixes_both_branches() -> Result<()> {
        let dev = Device::Cpu;
        let v = Tensor::zeros((1, 1), DType::F64, &dev)?;
        let h = Tensor::new(&[[0.25f64]], &dev)?;
        let s = Tensor::new(&[[2.0f64]], &dev)?;
        let var0 = Tensor::new(&[3.0f64], &dev)?;
        let var1 = Tensor::new(&[0.5f64], &dev)?;
        let obs = Observations {
            v: &v,
            h_hat: &h,
            s_hat: &s,
            var_s0_hat: &var0,
            var_s1_hat: &var1,
        };
        let stats = SufficientStats::from_observations(&[StatName::MeanSqS], &obs)?;
        let got = stats.get(StatName::MeanSqS)?.to_vec1::<f64>()?[0];
        approx::assert_abs_diff_eq!(got, 0.25 * (0.5 + 4.0) + 0.75 * 3.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn empty_batch_is_rejected() -> Result<()> {
        let dev = Device::Cpu;
        let b = random_batch(2, 2, 2)?;
        let v = Tensor::zeros((0, 2), DType::F64, &dev)?;
        let h = Tensor::zeros((0, 2), DType::F64, &dev)?;
        let obs = Observations {
            v: &v,
            h_hat: &h,
            s_hat: &h,
            var_s0_hat: &b.var0,
            var_s1_hat: &b.var1,
        };
        let res = SufficientStats::from_observations(&[StatName::MeanH], &obs);
        assert!(matches!(res, Err(PddbmError::TypeDomain(_))));
        Ok(())
    }
}
