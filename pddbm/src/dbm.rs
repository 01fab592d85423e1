//! Deep Boltzmann machine: a visible layer plus an adjacency-only stack of
//! hidden layers.
//!
//! States are addressed either per hidden layer (`q[i]` is the state of
//! `hidden[i]`) or per *stack index*, where index 0 is the visible layer
//! and index `k >= 1` is `hidden[k - 1]`. The Gibbs partitions are the
//! even and odd stack indices.

use crate::error::Result;
use crate::layers::*;
use crate::tensor_ops::*;
use crate::{config_bail, domain_bail};
use candle_core::{DType, Device, Tensor};
use log::info;
use rand::Rng;
use std::collections::BTreeMap;

/// How mean-field inference initializes the hidden layers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeanFieldProcedure {
    #[default]
    /// Bottom-up pass with doubled input to every layer that has a layer
    /// above it; labels in inpainting start from the bias prior.
    WeightDoubling,
    /// Plain bottom-up pass; `mf` and `do_inpainting` start from the same
    /// point so they agree when nothing is dropped but the labels.
    Consistent,
}

#[derive(Clone, Debug)]
pub struct Dbm {
    visible: Layer,
    hidden: Vec<Layer>,
}

impl Dbm {
    pub fn new(visible: Layer, hidden: Vec<Layer>) -> Result<Self> {
        if !matches!(visible, Layer::BinaryVector(_)) {
            config_bail!("visible layer {} must be a BinaryVector", visible.name());
        }
        if hidden.is_empty() {
            config_bail!("a DBM needs at least one hidden layer");
        }

        let mut below_dim = visible.upward_dim();
        for (i, layer) in hidden.iter().enumerate() {
            if layer.input_dim() != Some(below_dim) {
                config_bail!(
                    "layer {} expects input width {:?} but the layer below provides {}",
                    layer.name(),
                    layer.input_dim(),
                    below_dim
                );
            }
            if matches!(layer, Layer::Softmax(_)) && i + 1 < hidden.len() {
                config_bail!("softmax layer {} must be the top layer", layer.name());
            }
            below_dim = layer.upward_dim();
        }

        info!(
            "DBM: {} visible, hidden widths {:?}",
            visible.upward_dim(),
            hidden.iter().map(|l| l.state_dim()).collect::<Vec<_>>()
        );

        Ok(Self { visible, hidden })
    }

    pub fn visible(&self) -> &Layer {
        &self.visible
    }

    pub fn hidden(&self) -> &[Layer] {
        &self.hidden
    }

    pub fn nvis(&self) -> usize {
        self.visible.upward_dim()
    }

    pub fn num_hidden(&self) -> usize {
        self.hidden.len()
    }

    /// Number of layers in the Gibbs stack, visible included
    pub fn stack_len(&self) -> usize {
        self.hidden.len() + 1
    }

    pub fn stack_layer(&self, k: usize) -> &Layer {
        if k == 0 {
            &self.visible
        } else {
            &self.hidden[k - 1]
        }
    }

    pub fn has_labels(&self) -> bool {
        matches!(self.hidden.last(), Some(Layer::Softmax(_)))
    }

    pub fn num_classes(&self) -> Option<usize> {
        match self.hidden.last() {
            Some(Layer::Softmax(l)) => Some(l.n_classes()),
            _ => None,
        }
    }

    fn visible_bias(&self) -> &candle_core::Var {
        match &self.visible {
            Layer::BinaryVector(l) => l.bias(),
            _ => unreachable!("checked in Dbm::new"),
        }
    }

    pub fn dtype(&self) -> DType {
        self.visible_bias().dtype()
    }

    pub fn device(&self) -> &Device {
        self.visible_bias().device()
    }

    /// Replace the visible bias with a variable owned elsewhere
    pub fn share_visible_bias(&mut self, bias: candle_core::Var) -> Result<()> {
        if bias.dims() != self.visible_bias().dims() {
            config_bail!(
                "shared bias has shape {:?}, visible layer needs {:?}",
                bias.dims(),
                self.visible_bias().dims()
            );
        }
        let name = self.visible.name().to_string();
        self.visible = Layer::BinaryVector(BinaryVector::from_bias(&name, bias)?);
        Ok(())
    }

    /// All parameters, visible layer first
    pub fn params(&self) -> Vec<NamedParam> {
        std::iter::once(&self.visible)
            .chain(self.hidden.iter())
            .flat_map(|l| l.params())
            .collect()
    }

    /// Energy of each example, or the expected energy under a factorized
    /// posterior when `v` and `states` hold means.
    ///
    /// * `v` - visible state `[n, nvis]`
    /// * `states` - one state per hidden layer
    ///
    pub fn energy(&self, v: &Tensor, states: &[LayerState]) -> Result<Tensor> {
        self.energy_impl(v, states, false)
    }

    pub fn expected_energy(&self, v_hat: &Tensor, q: &[LayerState]) -> Result<Tensor> {
        self.energy_impl(v_hat, q, false)
    }

    fn energy_impl(&self, v: &Tensor, states: &[LayerState], ignore_vis: bool) -> Result<Tensor> {
        if states.len() != self.hidden.len() {
            domain_bail!(
                "expected {} hidden states, got {}",
                self.hidden.len(),
                states.len()
            );
        }
        let mut total = if ignore_vis {
            Tensor::zeros(v.dim(0)?, v.dtype(), v.device())?
        } else {
            self.visible
                .expected_energy_term(None, &LayerState::single(v.clone()))?
        };
        let mut below = v.clone();
        for (layer, state) in self.hidden.iter().zip(states.iter()) {
            total = total.add(&layer.expected_energy_term(Some(&below), state)?)?;
            below = layer.upward_state(state);
        }
        Ok(total)
    }

    /// Entropy of the factorized posterior over the hidden layers
    pub fn entropy_h(&self, q: &[LayerState]) -> Result<Tensor> {
        let mut terms = q
            .iter()
            .zip(self.hidden.iter())
            .map(|(state, layer)| layer.entropy(state));
        let first = match terms.next() {
            Some(t) => t?,
            None => domain_bail!("no hidden states"),
        };
        terms.try_fold(first, |acc, t| -> Result<Tensor> { Ok(acc.add(&t?)?) })
    }

    /// Truncated KL(Q || P) per example, dropping `log Z`.
    ///
    /// With `ignore_vis` the visible bias term is left out; a caller that
    /// already accounts for it elsewhere avoids counting it twice.
    pub fn truncated_kl(&self, v: &Tensor, q: &[LayerState], ignore_vis: bool) -> Result<Tensor> {
        let energy = self.energy_impl(v, q, ignore_vis)?;
        Ok(energy.sub(&self.entropy_h(q)?)?)
    }

    /// Upward state of stack index `k` in a full stack state
    fn stack_upward(&self, states: &[LayerState], k: usize) -> Tensor {
        self.stack_layer(k).upward_state(&states[k])
    }

    /// Conditional inputs of stack layer `k` given its stack neighbours
    pub fn neighbours<'a>(
        &'a self,
        states: &'a [LayerState],
        k: usize,
    ) -> (Option<Tensor>, Option<(&'a Layer, &'a LayerState)>) {
        let below = if k == 0 {
            None
        } else {
            Some(self.stack_upward(states, k - 1))
        };
        let above = if k + 1 < self.stack_len() {
            Some((self.stack_layer(k + 1), &states[k + 1]))
        } else {
            None
        };
        (below, above)
    }

    /// Mean of stack layer `k` given the rest of a full stack state
    pub fn stack_mean(&self, states: &[LayerState], k: usize) -> Result<LayerState> {
        let (below, above) = self.neighbours(states, k);
        self.stack_layer(k).mf_update(below.as_ref(), above)
    }

    /// Draw stack layer `k` given the rest of a full stack state
    pub fn stack_sample<R: Rng + ?Sized>(
        &self,
        states: &[LayerState],
        k: usize,
        rng: &mut R,
    ) -> Result<LayerState> {
        let (below, above) = self.neighbours(states, k);
        self.stack_layer(k).sample(below.as_ref(), above, rng)
    }

    /// Fresh stack state for `num_chains` chains drawn from the bias priors
    pub fn make_layer_to_state<R: Rng + ?Sized>(
        &self,
        num_chains: usize,
        rng: &mut R,
    ) -> Result<Vec<LayerState>> {
        std::iter::once(&self.visible)
            .chain(self.hidden.iter())
            .map(|l| l.sample_prior(num_chains, rng))
            .collect()
    }

    fn check_inputs(&self, v: &Tensor, y: Option<&Tensor>) -> Result<usize> {
        ensure_dtype(v, self.dtype(), "V")?;
        let n = ensure_matrix(v, self.nvis(), "V")?;
        if let Some(y) = y {
            match self.num_classes() {
                Some(k) => {
                    ensure_dtype(y, self.dtype(), "Y")?;
                    if ensure_matrix(y, k, "Y")? != n {
                        domain_bail!("Y has {} rows but V has {}", y.dim(0)?, n);
                    }
                }
                None => config_bail!("labels given but the top layer is not a Softmax"),
            }
        }
        Ok(n)
    }

    fn init_bottom_up(&self, v: &Tensor, procedure: MeanFieldProcedure) -> Result<Vec<LayerState>> {
        let top = self.hidden.len() - 1;
        let mut q: Vec<LayerState> = Vec::with_capacity(self.hidden.len());
        for (i, layer) in self.hidden.iter().enumerate() {
            let below = match i {
                0 => v.clone(),
                _ => self.hidden[i - 1].upward_state(&q[i - 1]),
            };
            let state = match procedure {
                MeanFieldProcedure::WeightDoubling if i < top => {
                    layer.mf_update_scaled(&below, 2.0)?
                }
                _ => layer.mf_update(Some(&below), None)?,
            };
            q.push(state);
        }
        Ok(q)
    }

    /// One bottom-up sweep of mean-field updates over the hidden layers,
    /// leaving the top layer untouched when `clamp_top` is set.
    fn mf_sweep(&self, v: &Tensor, q: &mut [LayerState], clamp_top: bool) -> Result<()> {
        let top = self.hidden.len() - 1;
        for i in 0..self.hidden.len() {
            if clamp_top && i == top {
                continue;
            }
            let below = match i {
                0 => v.clone(),
                _ => self.hidden[i - 1].upward_state(&q[i - 1]),
            };
            let new = match q.get(i + 1) {
                Some(state_above) => self.hidden[i]
                    .mf_update(Some(&below), Some((&self.hidden[i + 1], state_above)))?,
                None => self.hidden[i].mf_update(Some(&below), None)?,
            };
            q[i] = new;
        }
        Ok(())
    }

    /// Mean-field posterior over the hidden layers.
    ///
    /// * `v` - visible batch `[n, nvis]`
    /// * `y` - labels to clamp the Softmax top layer to, if any
    /// * `niter` - number of full sweeps after initialization
    ///
    pub fn mf(
        &self,
        v: &Tensor,
        y: Option<&Tensor>,
        niter: usize,
        procedure: MeanFieldProcedure,
    ) -> Result<Vec<LayerState>> {
        self.check_inputs(v, y)?;
        let mut q = self.init_bottom_up(v, procedure)?;
        if let Some(y) = y {
            let top = self.hidden.len() - 1;
            q[top] = LayerState::single(y.clone());
        }
        for _ in 0..niter {
            self.mf_sweep(v, &mut q, y.is_some())?;
        }
        Ok(q)
    }

    /// Mean-field inference that also fills in dropped visible units and
    /// labels.
    ///
    /// * `drop_mask` - `[n, nvis]`, 1 where a visible unit is unobserved
    /// * `drop_mask_y` - `[n, 1]`, 1 where the label is unobserved
    ///
    /// Returns the inpainted visible means and the hidden posterior.
    pub fn do_inpainting(
        &self,
        v: &Tensor,
        y: Option<&Tensor>,
        drop_mask: &Tensor,
        drop_mask_y: Option<&Tensor>,
        niter: usize,
        procedure: MeanFieldProcedure,
    ) -> Result<(Tensor, Vec<LayerState>)> {
        let n = self.check_inputs(v, y)?;
        if drop_mask.dims() != v.dims() {
            domain_bail!(
                "drop mask {:?} does not match V {:?}",
                drop_mask.dims(),
                v.dims()
            );
        }
        let label_mask = match (y, drop_mask_y) {
            (Some(y), Some(m)) => {
                if m.dims() != [n, 1] {
                    domain_bail!("label drop mask must be [{}, 1], got {:?}", n, m.dims());
                }
                Some((y, m))
            }
            (Some(_), None) => config_bail!("labels given without a label drop mask"),
            (None, _) => None,
        };

        let keep = drop_mask.affine(-1.0, 1.0)?;
        let v_prior = self.visible.init_h_hat(n)?.h;
        let mut v_hat = drop_mask.mul(&v_prior)?.add(&keep.mul(v)?)?;

        let top = self.hidden.len() - 1;
        let mut q = self.init_bottom_up(&v_hat, procedure)?;
        let mix_labels = |y_model: &Tensor| -> Result<LayerState> {
            match label_mask {
                Some((y, m)) => {
                    let y_keep = m.affine(-1.0, 1.0)?;
                    let mixed = m
                        .broadcast_mul(y_model)?
                        .add(&y_keep.broadcast_mul(y)?)?;
                    Ok(LayerState::single(mixed))
                }
                None => Ok(LayerState::single(y_model.clone())),
            }
        };
        if label_mask.is_some() {
            let y_init = match procedure {
                MeanFieldProcedure::WeightDoubling => self.hidden[top].init_h_hat(n)?.h,
                MeanFieldProcedure::Consistent => q[top].h.clone(),
            };
            q[top] = mix_labels(&y_init)?;
        }

        for _ in 0..niter {
            self.mf_sweep(&v_hat, &mut q, false)?;
            if label_mask.is_some() {
                q[top] = mix_labels(&q[top].h)?;
            }
            let v_model = match &self.visible {
                Layer::BinaryVector(l) => l.inpaint_update(&self.hidden[0], &q[0])?,
                _ => unreachable!("checked in Dbm::new"),
            };
            v_hat = drop_mask.mul(&v_model)?.add(&keep.mul(v)?)?;
        }
        Ok((v_hat, q))
    }

    /// `misclass` from mean-field prediction of the labels, and, when there
    /// is a layer under the labels, `recons_misclass` from rebuilding the
    /// labels out of that layer alone after inference with `y` clamped.
    pub fn classification_channels(
        &self,
        v: &Tensor,
        y: &Tensor,
        niter: usize,
        procedure: MeanFieldProcedure,
    ) -> Result<BTreeMap<String, f64>> {
        let top = match self.num_classes() {
            Some(_) => self.hidden.len() - 1,
            None => config_bail!("classification channels need a Softmax top layer"),
        };
        self.check_inputs(v, Some(y))?;

        let mut out = BTreeMap::new();
        let q = self.mf(v, None, niter, procedure)?;
        out.insert("misclass".to_string(), misclassification_rate(y, &q[top].h)?);

        if top > 0 {
            let q = self.mf(v, Some(y), niter, procedure)?;
            let y_recons = self.reconstruct_labels(&q)?;
            out.insert(
                "recons_misclass".to_string(),
                misclassification_rate(y, &y_recons)?,
            );
        }
        Ok(out)
    }

    /// Label means given only the upward state of the penultimate layer
    pub fn reconstruct_labels(&self, q: &[LayerState]) -> Result<Tensor> {
        let top = self.hidden.len() - 1;
        if top == 0 || q.len() != self.hidden.len() {
            config_bail!("label reconstruction needs the layer under the labels");
        }
        let pen = self.hidden[top - 1].upward_state(&q[top - 1]);
        Ok(self.hidden[top].mf_update(Some(&pen), None)?.h)
    }
}

/// Layer widths and initialization for a DBM built from scratch
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct DbmArch {
    pub nvis: usize,
    pub hidden_dims: Vec<usize>,
    pub pool_size: usize,
    pub n_classes: Option<usize>,
    pub irange: f64,
    pub init_bias_hid: f64,
}

impl Default for DbmArch {
    fn default() -> Self {
        Self {
            nvis: 784,
            hidden_dims: vec![500, 1000],
            pool_size: 1,
            n_classes: Some(10),
            irange: 0.05,
            init_bias_hid: 0.0,
        }
    }
}

impl DbmArch {
    pub fn build<R: Rng + ?Sized>(&self, dtype: DType, device: &Device, rng: &mut R) -> Result<Dbm> {
        let visible = Layer::BinaryVector(BinaryVector::new("v", self.nvis, 0.0, dtype, device)?);
        let mut hidden = vec![];
        let mut below = self.nvis;
        for (i, &dim) in self.hidden_dims.iter().enumerate() {
            let layer = BinaryVectorMaxPool::new(
                &format!("h{}", i + 1),
                below,
                dim,
                self.pool_size,
                self.irange,
                self.init_bias_hid,
                dtype,
                device,
                rng,
            )?;
            below = dim / self.pool_size;
            hidden.push(Layer::BinaryVectorMaxPool(layer));
        }
        if let Some(k) = self.n_classes {
            hidden.push(Layer::Softmax(Softmax::new(
                "y", below, k, self.irange, dtype, device, rng,
            )?));
        }
        Dbm::new(visible, hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PddbmError;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn toy(rng: &mut SmallRng) -> Result<Dbm> {
        DbmArch {
            nvis: 4,
            hidden_dims: vec![5, 10],
            pool_size: 1,
            n_classes: Some(3),
            irange: 1.0,
            init_bias_hid: 0.0,
        }
        .build(DType::F64, &Device::Cpu, rng)
    }

    #[test]
    fn softmax_only_on_top() -> Result<()> {
        let dev = Device::Cpu;
        let mut rng = SmallRng::seed_from_u64(1);
        let v = Layer::BinaryVector(BinaryVector::new("v", 4, 0.0, DType::F64, &dev)?);
        let y = Layer::Softmax(Softmax::new("y", 4, 3, 0.1, DType::F64, &dev, &mut rng)?);
        let h = Layer::BinaryVectorMaxPool(BinaryVectorMaxPool::new(
            "h", 3, 2, 1, 0.1, 0.0, DType::F64, &dev, &mut rng,
        )?);
        assert!(matches!(
            Dbm::new(v, vec![y, h]),
            Err(PddbmError::Configuration(_))
        ));
        Ok(())
    }

    #[test]
    fn width_mismatch_is_rejected() -> Result<()> {
        let dev = Device::Cpu;
        let mut rng = SmallRng::seed_from_u64(1);
        let v = Layer::BinaryVector(BinaryVector::new("v", 4, 0.0, DType::F64, &dev)?);
        let h = Layer::BinaryVectorMaxPool(BinaryVectorMaxPool::new(
            "h", 3, 2, 1, 0.1, 0.0, DType::F64, &dev, &mut rng,
        )?);
        assert!(matches!(Dbm::new(v, vec![h]), Err(PddbmError::Configuration(_))));
        Ok(())
    }

    #[test]
    fn clamped_labels_stay_put() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(3);
        let dbm = toy(&mut rng)?;
        let v = sample_bernoulli(&mut rng, &Tensor::full(0.5f64, (6, 4), &Device::Cpu)?)?;
        let y = Tensor::new(
            &[
                [1.0f64, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 1.0],
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 1.0],
            ],
            &Device::Cpu,
        )?;
        let q = dbm.mf(&v, Some(&y), 4, MeanFieldProcedure::WeightDoubling)?;
        assert_eq!(q[2].h.to_vec2::<f64>()?, y.to_vec2::<f64>()?);
        for row in q[0].h.to_vec2::<f64>()? {
            assert!(row.iter().all(|&x| x > 0.0 && x < 1.0));
        }
        Ok(())
    }

    #[test]
    fn labels_need_softmax_top() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(3);
        let dbm = DbmArch {
            nvis: 4,
            hidden_dims: vec![5],
            pool_size: 1,
            n_classes: None,
            irange: 1.0,
            init_bias_hid: 0.0,
        }
        .build(DType::F64, &Device::Cpu, &mut rng)?;
        let v = Tensor::zeros((2, 4), DType::F64, &Device::Cpu)?;
        let y = Tensor::zeros((2, 3), DType::F64, &Device::Cpu)?;
        let res = dbm.mf(&v, Some(&y), 1, MeanFieldProcedure::Consistent);
        assert!(matches!(res, Err(PddbmError::Configuration(_))));
        Ok(())
    }

    #[test]
    fn kl_ignoring_visible_drops_bias_term() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(9);
        let dbm = toy(&mut rng)?;
        if let Layer::BinaryVector(l) = dbm.visible() {
            l.set_biases(&Tensor::new(&[0.5f64, -1.0, 2.0, 0.0], &Device::Cpu)?)?;
        }
        let v = Tensor::new(&[[1.0f64, 1.0, 0.0, 1.0]], &Device::Cpu)?;
        let q = dbm.mf(&v, None, 2, MeanFieldProcedure::Consistent)?;
        let full = scalar_f64(&dbm.truncated_kl(&v, &q, false)?)?;
        let trunc = scalar_f64(&dbm.truncated_kl(&v, &q, true)?)?;
        // visible energy is -b.v = -(0.5 - 1.0 + 0.0) = 0.5
        approx::assert_abs_diff_eq!(full - trunc, 0.5, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn recons_misclass_rebuilds_labels_from_penultimate_layer() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(9);
        let dbm = toy(&mut rng)?;
        let dev = Device::Cpu;
        let v = sample_bernoulli(&mut rng, &Tensor::full(0.5f64, (40, 4), &dev)?)?;
        let y = sample_categorical(&mut rng, &Tensor::full(1.0f64 / 3.0, (40, 3), &dev)?)?;
        let procedure = MeanFieldProcedure::Consistent;

        let q = dbm.mf(&v, Some(&y), 3, procedure)?;
        let (w, b) = match &dbm.hidden()[2] {
            Layer::Softmax(l) => (l.weights().as_tensor().clone(), l.bias().as_tensor().clone()),
            _ => unreachable!(),
        };
        let by_hand = candle_nn::ops::softmax(
            &q[1].p.matmul(&w)?.broadcast_add(&b)?,
            candle_core::D::Minus1,
        )?;
        let rebuilt = dbm.reconstruct_labels(&q)?;
        for (a, e) in rebuilt
            .to_vec2::<f64>()?
            .iter()
            .flatten()
            .zip(by_hand.to_vec2::<f64>()?.iter().flatten())
        {
            approx::assert_abs_diff_eq!(a, e, epsilon = 1e-12);
        }

        let channels = dbm.classification_channels(&v, &y, 3, procedure)?;
        let expected = misclassification_rate(&y, &by_hand)?;
        approx::assert_abs_diff_eq!(channels["recons_misclass"], expected, epsilon = 1e-12);

        let q_free = dbm.mf(&v, None, 3, procedure)?;
        let misclass = misclassification_rate(&y, &q_free[2].h)?;
        approx::assert_abs_diff_eq!(channels["misclass"], misclass, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn no_recons_channel_without_penultimate_layer() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(4);
        let dbm = DbmArch {
            nvis: 4,
            hidden_dims: vec![],
            pool_size: 1,
            n_classes: Some(3),
            irange: 1.0,
            init_bias_hid: 0.0,
        }
        .build(DType::F64, &Device::Cpu, &mut rng)?;
        let v = Tensor::ones((2, 4), DType::F64, &Device::Cpu)?;
        let y = Tensor::new(&[[1.0f64, 0.0, 0.0], [0.0, 0.0, 1.0]], &Device::Cpu)?;
        let channels = dbm.classification_channels(&v, &y, 2, MeanFieldProcedure::Consistent)?;
        assert!(channels.contains_key("misclass"));
        assert!(!channels.contains_key("recons_misclass"));
        Ok(())
    }
}
