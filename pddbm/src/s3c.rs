//! Spike-and-slab sparse coding (S3C).
//!
//! h_i ~ Bernoulli(sigmoid(b_i)),
//! s_i | h_i ~ N(h_i mu_i, 1/alpha_i),
//! v | h, s ~ N(W (h*s), diag(1/B)).
//!
//! The E-step pieces here are closed-form coordinate updates of a
//! factorized posterior q(h, s) = prod_i q(h_i) q(s_i | h_i); the objective
//! pieces are expectations under that posterior written in terms of
//! [`SufficientStats`] so that only O(nhid) moments are stored.

use crate::config_bail;
use crate::error::Result;
use crate::layers::NamedParam;
use crate::sufficient_stats::{StatName, SufficientStats};
use crate::tensor_ops::*;
use candle_core::{DType, Device, Tensor, Var};
use log::info;
use rand::Rng;
use std::f64::consts::PI;

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct S3cOptions {
    pub irange: f64,
    pub init_bias_hid: f64,
    pub init_mu: f64,
    pub init_alpha: f64,
    pub init_b: f64,
    pub min_alpha: f64,
    pub max_alpha: f64,
    pub min_b: f64,
    pub max_b: f64,
    /// report the full objective after every E-step (standalone only)
    pub monitor_functional: bool,
    /// start each E-step from the previous posterior (standalone only)
    pub recycle_q: bool,
    /// check that every M-step improves the objective (standalone only)
    pub debug_m_step: bool,
}

impl Default for S3cOptions {
    fn default() -> Self {
        Self {
            irange: 0.02,
            init_bias_hid: 0.0,
            init_mu: 1.0,
            init_alpha: 1.0,
            init_b: 1.0,
            min_alpha: 1e-3,
            max_alpha: 1e3,
            min_b: 1e-3,
            max_b: 1e3,
            monitor_functional: false,
            recycle_q: false,
            debug_m_step: false,
        }
    }
}

impl S3cOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.min_alpha > 0.0 && self.min_alpha <= self.max_alpha) {
            config_bail!("alpha bounds [{}, {}] are invalid", self.min_alpha, self.max_alpha);
        }
        if !(self.min_b > 0.0 && self.min_b <= self.max_b) {
            config_bail!("B bounds [{}, {}] are invalid", self.min_b, self.max_b);
        }
        if self.init_alpha <= 0.0 || self.init_b <= 0.0 {
            config_bail!("initial precisions must be positive");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct S3c {
    nvis: usize,
    nhid: usize,
    w: Var,
    bias_hid: Var,
    mu: Var,
    alpha: Var,
    b: Var,
    options: S3cOptions,
}

impl S3c {
    pub fn new<R: Rng + ?Sized>(
        nvis: usize,
        nhid: usize,
        options: S3cOptions,
        dtype: DType,
        device: &Device,
        rng: &mut R,
    ) -> Result<Self> {
        if nvis == 0 || nhid == 0 {
            config_bail!("S3C needs positive nvis and nhid, got {} and {}", nvis, nhid);
        }
        options.validate()?;

        let w = uniform_matrix(rng, nvis, nhid, options.irange, dtype, device)?;
        let full = |x: f64, n: usize| -> Result<Var> {
            let t = Tensor::full(x, n, device)?.to_dtype(dtype)?;
            Ok(Var::from_tensor(&t)?)
        };
        let s3c = Self {
            nvis,
            nhid,
            w: Var::from_tensor(&w)?,
            bias_hid: full(options.init_bias_hid, nhid)?,
            mu: full(options.init_mu, nhid)?,
            alpha: full(options.init_alpha, nhid)?,
            b: full(options.init_b, nvis)?,
            options,
        };
        info!("S3C: {} visible, {} hidden", nvis, nhid);
        Ok(s3c)
    }

    pub fn nvis(&self) -> usize {
        self.nvis
    }

    pub fn nhid(&self) -> usize {
        self.nhid
    }

    pub fn dtype(&self) -> DType {
        self.w.dtype()
    }

    pub fn device(&self) -> &Device {
        self.w.device()
    }

    pub fn bias_hid(&self) -> &Var {
        &self.bias_hid
    }

    pub fn options(&self) -> &S3cOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut S3cOptions {
        &mut self.options
    }

    pub fn params(&self) -> Vec<NamedParam> {
        vec![
            NamedParam::new("s3c.W", self.w.clone()),
            NamedParam::new("s3c.bias_hid", self.bias_hid.clone()),
            NamedParam::new("s3c.mu", self.mu.clone()),
            NamedParam::new("s3c.alpha", self.alpha.clone()),
            NamedParam::new("s3c.B", self.b.clone()),
        ]
    }

    /// `w_i = sum_j B_j W_ji^2`
    fn w_sq(&self) -> Result<Tensor> {
        let b = self.b.as_tensor().unsqueeze(1)?;
        Ok(self.w.as_tensor().sqr()?.broadcast_mul(&b)?.sum(0)?)
    }

    /// `W` scaled row-wise by the visible precisions
    fn bw(&self) -> Result<Tensor> {
        let b = self.b.as_tensor().unsqueeze(1)?;
        Ok(self.w.as_tensor().broadcast_mul(&b)?)
    }

    pub fn var_s0_hat(&self) -> Result<Tensor> {
        Ok(self.alpha.as_tensor().recip()?)
    }

    pub fn var_s1_hat(&self) -> Result<Tensor> {
        Ok(self.alpha.as_tensor().add(&self.w_sq()?)?.recip()?)
    }

    fn batched(&self, x: &Tensor, n: usize) -> Result<Tensor> {
        Ok(x.unsqueeze(0)?.broadcast_as((n, self.nhid))?.contiguous()?)
    }

    /// Prior spike probabilities repeated over the batch
    pub fn init_h_hat(&self, v: &Tensor) -> Result<Tensor> {
        let n = ensure_matrix(v, self.nvis, "V")?;
        self.batched(&sigmoid(self.bias_hid.as_tensor())?, n)
    }

    /// Prior slab means repeated over the batch
    pub fn init_s_hat(&self, v: &Tensor) -> Result<Tensor> {
        let n = ensure_matrix(v, self.nvis, "V")?;
        self.batched(self.mu.as_tensor(), n)
    }

    /// `alpha mu + V (B W) - (H S) W^T (B W) + w (H S)`, the natural
    /// parameter of q(s_i | h_i = 1) with unit i's own reconstruction
    /// added back.
    fn slab_numerator(&self, v: &Tensor, h_hat: &Tensor, s_hat: &Tensor) -> Result<Tensor> {
        let bw = self.bw()?;
        let w_sq = self.w_sq()?;
        let hs = h_hat.mul(s_hat)?;

        let prior = self.alpha.as_tensor().mul(self.mu.as_tensor())?;
        let data = v.matmul(&bw)?;
        let recon = hs.matmul(&self.w.as_tensor().t()?)?.matmul(&bw)?;
        let own = hs.broadcast_mul(&w_sq)?;

        Ok(data.sub(&recon)?.add(&own)?.broadcast_add(&prior)?)
    }

    /// Closed-form slab means given the current spikes
    pub fn infer_s_hat(&self, v: &Tensor, h_hat: &Tensor, s_hat: &Tensor) -> Result<Tensor> {
        let numer = self.slab_numerator(v, h_hat, s_hat)?;
        let denom = self.alpha.as_tensor().add(&self.w_sq()?)?;
        Ok(numer.broadcast_div(&denom)?)
    }

    /// Log-odds of the spikes under the S3C prior; a layer above adds its
    /// own top-down term before the sigmoid.
    ///
    /// b + 0.5 numer^2 / (alpha + w) - 0.5 alpha mu^2
    ///   - 0.5 log(alpha + w) + 0.5 log(alpha)
    pub fn infer_h_hat_presigmoid(
        &self,
        v: &Tensor,
        h_hat: &Tensor,
        s_hat: &Tensor,
    ) -> Result<Tensor> {
        let alpha = self.alpha.as_tensor();
        let mu = self.mu.as_tensor();
        let denom = alpha.add(&self.w_sq()?)?;

        let numer = self.slab_numerator(v, h_hat, s_hat)?;
        let term_1 = numer.sqr()?.broadcast_div(&denom)?.affine(0.5, 0.0)?;
        let term_2 = alpha.mul(&mu.sqr()?)?.affine(-0.5, 0.0)?;
        let log_ratio = alpha.log()?.sub(&denom.log()?)?.affine(0.5, 0.0)?;
        let per_unit = term_2
            .add(&log_ratio)?
            .add(self.bias_hid.as_tensor())?;

        Ok(term_1.broadcast_add(&per_unit)?)
    }

    pub fn expected_log_prob_v_given_hs_needs() -> &'static [StatName] {
        &[
            StatName::MeanSqV,
            StatName::MeanHsv,
            StatName::MeanSqHs,
            StatName::MeanSqMeanHs,
        ]
    }

    /// E_q[log p(v | h, s)], averaged over the batch
    pub fn expected_log_prob_v_given_hs(
        &self,
        stats: &SufficientStats,
        h_hat: &Tensor,
        s_hat: &Tensor,
    ) -> Result<Tensor> {
        let b = self.b.as_tensor();
        let nvis = self.nvis as f64;
        let w_sq = self.w_sq()?;

        let mean_sq_v = stats.get(StatName::MeanSqV)?;
        let mean_hsv = stats.get(StatName::MeanHsv)?;
        let mean_sq_hs = stats.get(StatName::MeanSqHs)?;
        let mean_sq_mean_hs = stats.get(StatName::MeanSqMeanHs)?;

        let half_log_det = (b.log()?.sum_all()? * 0.5)?;
        let norm = 0.5 * nvis * (2.0 * PI).ln();

        let sq_v = b.mul(mean_sq_v)?.sum_all()?;
        let cross = mean_hsv.mul(&self.bw()?.t()?)?.sum_all()?;

        // batch mean of sum_j B_j (W (h*s))_j^2
        let recon = h_hat.mul(s_hat)?.matmul(&self.w.as_tensor().t()?)?;
        let sq_recon = recon.sqr()?.broadcast_mul(b)?.sum(1)?.mean_all()?;
        let var_recon = w_sq.mul(&mean_sq_hs.sub(mean_sq_mean_hs)?)?.sum_all()?;

        let quad = sq_v
            .sub(&cross.affine(2.0, 0.0)?)?
            .add(&sq_recon)?
            .add(&var_recon)?;
        Ok(half_log_det.sub(&quad.affine(0.5, 0.0)?)?.affine(1.0, -norm)?)
    }

    pub fn log_likelihood_s_given_h_needs() -> &'static [StatName] {
        &[StatName::MeanH, StatName::MeanHs, StatName::MeanSqS]
    }

    /// E_q[log p(s | h)], averaged over the batch
    pub fn log_likelihood_s_given_h(&self, stats: &SufficientStats) -> Result<Tensor> {
        let alpha = self.alpha.as_tensor();
        let mu = self.mu.as_tensor();
        let nhid = self.nhid as f64;

        let mean_h = stats.get(StatName::MeanH)?;
        let mean_hs = stats.get(StatName::MeanHs)?;
        let mean_sq_s = stats.get(StatName::MeanSqS)?;

        let half_log_det = (alpha.log()?.sum_all()? * 0.5)?;
        let norm = 0.5 * nhid * (2.0 * PI).ln();

        let sq = mean_sq_s
            .sub(&mu.mul(mean_hs)?.affine(2.0, 0.0)?)?
            .add(&mu.sqr()?.mul(mean_h)?)?;
        let quad = alpha.mul(&sq)?.sum_all()?;
        Ok(half_log_det.sub(&quad.affine(0.5, 0.0)?)?.affine(1.0, -norm)?)
    }

    pub fn expected_log_prob_h_needs() -> &'static [StatName] {
        &[StatName::MeanH]
    }

    /// E_q[log p(h)] under the factorized Bernoulli prior, batch mean
    pub fn expected_log_prob_h(&self, stats: &SufficientStats) -> Result<Tensor> {
        let b = self.bias_hid.as_tensor();
        let mean_h = stats.get(StatName::MeanH)?;
        Ok(mean_h
            .mul(b)?
            .sum_all()?
            .sub(&softplus(b)?.sum_all()?)?)
    }

    /// Entropy of q(h, s) for each example
    pub fn entropy_hs(
        &self,
        h_hat: &Tensor,
        var_s0_hat: &Tensor,
        var_s1_hat: &Tensor,
    ) -> Result<Tensor> {
        let off = h_hat.affine(-1.0, 1.0)?;
        let gauss = |var: &Tensor| -> Result<Tensor> {
            Ok(var.affine(2.0 * PI, 0.0)?.log()?.affine(0.5, 0.5)?)
        };
        let h_part = xlogx(h_hat)?.add(&xlogx(&off)?)?.neg()?;
        let s_part = h_hat
            .broadcast_mul(&gauss(var_s1_hat)?)?
            .add(&off.broadcast_mul(&gauss(var_s0_hat)?)?)?;
        Ok(h_part.add(&s_part)?.sum(1)?)
    }

    /// Clamp the precisions back into their configured ranges
    pub fn censor_updates(&self) -> Result<()> {
        let o = &self.options;
        let alpha = self.alpha.as_tensor().clamp(o.min_alpha, o.max_alpha)?;
        let b = self.b.as_tensor().clamp(o.min_b, o.max_b)?;
        self.alpha.set(&alpha)?;
        self.b.set(&b)?;
        Ok(())
    }

    /// Draw visible vectors given sampled spikes `[n, nhid]`
    pub fn random_design_matrix<R: Rng + ?Sized>(&self, h_sample: &Tensor, rng: &mut R) -> Result<Tensor> {
        let n = ensure_matrix(h_sample, self.nhid, "H")?;
        let slab_sd = self.alpha.as_tensor().detach().sqrt()?.recip()?;
        let eps = standard_normal_like(rng, h_sample)?;
        let s = eps
            .broadcast_mul(&slab_sd)?
            .broadcast_add(&self.mu.as_tensor().detach())?
            .mul(h_sample)?;

        let vis_sd = self.b.as_tensor().detach().sqrt()?.recip()?;
        let noise = standard_normal_like(
            rng,
            &Tensor::zeros((n, self.nvis), self.dtype(), self.device())?,
        )?
        .broadcast_mul(&vis_sd)?;
        Ok(s.matmul(&self.w.as_tensor().detach().t()?)?.add(&noise)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PddbmError;
    use crate::sufficient_stats::Observations;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn model(rng: &mut SmallRng) -> Result<S3c> {
        let opts = S3cOptions {
            irange: 0.5,
            init_mu: 0.7,
            init_alpha: 2.0,
            init_b: 1.5,
            ..S3cOptions::default()
        };
        S3c::new(3, 4, opts, DType::F64, &Device::Cpu, rng)
    }

    #[test]
    fn bad_bounds_are_rejected() {
        let mut rng = SmallRng::seed_from_u64(0);
        let opts = S3cOptions {
            min_alpha: 2.0,
            max_alpha: 1.0,
            ..S3cOptions::default()
        };
        let res = S3c::new(3, 4, opts, DType::F64, &Device::Cpu, &mut rng);
        assert!(matches!(res, Err(PddbmError::Configuration(_))));
    }

    #[test]
    fn slab_update_matches_single_unit_formula() -> Result<()> {
        // one hidden unit: s = (alpha mu + v.(B W)) / (alpha + w)
        let dev = Device::Cpu;
        let mut rng = SmallRng::seed_from_u64(1);
        let s3c = S3c::new(2, 1, S3cOptions::default(), DType::F64, &dev, &mut rng)?;
        let w = s3c.w.as_tensor().flatten_all()?.to_vec1::<f64>()?;
        let v = Tensor::new(&[[0.3f64, -1.2]], &dev)?;
        let h = Tensor::new(&[[0.4f64]], &dev)?;
        let s = Tensor::new(&[[5.0f64]], &dev)?;

        let got = s3c.infer_s_hat(&v, &h, &s)?.to_vec2::<f64>()?[0][0];
        let w_sq = w[0] * w[0] + w[1] * w[1];
        let want = (1.0 + 0.3 * w[0] - 1.2 * w[1]) / (1.0 + w_sq);
        approx::assert_abs_diff_eq!(got, want, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn expected_log_prob_matches_point_mass() -> Result<()> {
        // with H in {0,1} and vanishing slab variance the expectation is
        // the plain Gaussian log density of v
        let dev = Device::Cpu;
        let mut rng = SmallRng::seed_from_u64(2);
        let s3c = model(&mut rng)?;
        let v = Tensor::new(&[[0.5f64, -0.25, 1.0]], &dev)?;
        let h = Tensor::new(&[[1.0f64, 0.0, 1.0, 1.0]], &dev)?;
        let s = Tensor::new(&[[0.2f64, 9.0, -1.0, 0.4]], &dev)?;
        let zero = Tensor::zeros(4, DType::F64, &dev)?;
        let obs = Observations {
            v: &v,
            h_hat: &h,
            s_hat: &s,
            var_s0_hat: &zero,
            var_s1_hat: &zero,
        };
        let stats =
            SufficientStats::from_observations(S3c::expected_log_prob_v_given_hs_needs(), &obs)?;
        let got = scalar_f64(&s3c.expected_log_prob_v_given_hs(&stats, &h, &s)?)?;

        let mean = h.mul(&s)?.matmul(&s3c.w.as_tensor().t()?)?;
        let resid = v.sub(&mean)?.sqr()?.mul(&s3c.b.as_tensor().unsqueeze(0)?)?;
        let want = 3.0 * 0.5 * 1.5f64.ln()
            - 1.5 * (2.0 * PI).ln()
            - 0.5 * scalar_f64(&resid.sum_all()?)?;
        approx::assert_abs_diff_eq!(got, want, epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn censoring_clamps_precisions() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(3);
        let s3c = model(&mut rng)?;
        s3c.alpha.set(&Tensor::new(&[1e-9f64, 5.0, 1e9, 1.0], &Device::Cpu)?)?;
        s3c.censor_updates()?;
        let alpha = s3c.alpha.as_tensor().to_vec1::<f64>()?;
        assert_eq!(alpha, vec![1e-3, 5.0, 1e3, 1.0]);
        Ok(())
    }

    #[test]
    fn entropy_of_deterministic_spikes() -> Result<()> {
        let dev = Device::Cpu;
        let mut rng = SmallRng::seed_from_u64(4);
        let s3c = model(&mut rng)?;
        let h = Tensor::new(&[[1.0f64, 1.0, 1.0, 1.0]], &dev)?;
        let var1 = Tensor::full(1.0 / (2.0 * PI), 4, &dev)?;
        let var0 = Tensor::ones(4, DType::F64, &dev)?;
        let e = scalar_f64(&s3c.entropy_hs(&h, &var0, &var1)?)?;
        approx::assert_abs_diff_eq!(e, 4.0 * 0.5, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn design_matrix_has_visible_width() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(5);
        let s3c = model(&mut rng)?;
        let h = sample_bernoulli(&mut rng, &Tensor::full(0.5f64, (7, 4), &Device::Cpu)?)?;
        let v = s3c.random_design_matrix(&h, &mut rng)?;
        assert_eq!(v.dims(), &[7, 3]);
        Ok(())
    }
}
