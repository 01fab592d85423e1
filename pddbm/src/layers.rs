//! Layer variants of a deep Boltzmann machine.
//!
//! Every layer exposes the same capability set: `upward_state`,
//! `downward_state`, `mf_update`, `init_h_hat`, `sample`, plus the energy
//! and entropy terms needed by the variational bound. Adjacent layers talk
//! to each other only through `upward_state` (what the layer above sees)
//! and `downward_message` (what the layer below receives).

use crate::config_bail;
use crate::error::Result;
use crate::tensor_ops::*;
use candle_core::{DType, Device, Tensor, Var, D};
use rand::Rng;

/// A trainable tensor with a stable name
#[derive(Clone, Debug)]
pub struct NamedParam {
    pub name: String,
    pub var: Var,
}

impl NamedParam {
    pub fn new(name: impl Into<String>, var: Var) -> Self {
        Self {
            name: name.into(),
            var,
        }
    }
}

/// Total state of one layer for a batch.
///
/// `p` is sent upward, `h` is sent downward and enters the layer's own
/// energy. For layers without pooling both point to the same tensor.
#[derive(Clone, Debug)]
pub struct LayerState {
    pub p: Tensor,
    pub h: Tensor,
}

impl LayerState {
    pub fn single(x: Tensor) -> Self {
        Self { p: x.clone(), h: x }
    }

    pub fn pooled(p: Tensor, h: Tensor) -> Self {
        Self { p, h }
    }

    /// Same values, cut off from the autodiff graph
    pub fn detach(&self) -> Self {
        Self {
            p: self.p.detach(),
            h: self.h.detach(),
        }
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.h.dim(0)?)
    }
}

/// Visible layer of independent binary units
#[derive(Clone, Debug)]
pub struct BinaryVector {
    pub name: String,
    nvis: usize,
    bias: Var,
}

/// Binary detector units with probabilistic max pooling.
///
/// Detector units come in groups of `pool_size`; each group is a single
/// categorical variable over "all off" plus one unit on. The pooled unit
/// of a group is on iff any of its detectors is.
#[derive(Clone, Debug)]
pub struct BinaryVectorMaxPool {
    pub name: String,
    input_dim: usize,
    detector_dim: usize,
    pool_size: usize,
    weights: Var,
    bias: Var,
}

/// One-of-K label layer; only valid at the top of the stack
#[derive(Clone, Debug)]
pub struct Softmax {
    pub name: String,
    input_dim: usize,
    n_classes: usize,
    weights: Var,
    bias: Var,
}

#[derive(Clone, Debug)]
pub enum Layer {
    BinaryVector(BinaryVector),
    BinaryVectorMaxPool(BinaryVectorMaxPool),
    Softmax(Softmax),
}

impl BinaryVector {
    pub fn new(name: &str, nvis: usize, init_bias: f64, dtype: DType, device: &Device) -> Result<Self> {
        if nvis == 0 {
            config_bail!("layer {}: nvis must be positive", name);
        }
        let bias = Tensor::full(init_bias, nvis, device)?.to_dtype(dtype)?;
        Ok(Self {
            name: name.to_string(),
            nvis,
            bias: Var::from_tensor(&bias)?,
        })
    }

    /// Build a visible layer around an existing bias variable (shared
    /// parameters in a composite model).
    pub fn from_bias(name: &str, bias: Var) -> Result<Self> {
        let nvis = match *bias.dims() {
            [n] if n > 0 => n,
            _ => config_bail!("layer {}: bias must be a non-empty vector", name),
        };
        Ok(Self {
            name: name.to_string(),
            nvis,
            bias,
        })
    }

    pub fn bias(&self) -> &Var {
        &self.bias
    }

    pub fn set_biases(&self, bias: &Tensor) -> Result<()> {
        Ok(self.bias.set(bias)?)
    }

    /// Mean-field reconstruction of the visible units from the layer above
    pub fn inpaint_update(&self, layer_above: &Layer, state_above: &LayerState) -> Result<Tensor> {
        let msg = layer_above.downward_message(state_above)?;
        sigmoid(&msg.broadcast_add(self.bias.as_tensor())?)
    }
}

impl BinaryVectorMaxPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng + ?Sized>(
        name: &str,
        input_dim: usize,
        detector_dim: usize,
        pool_size: usize,
        irange: f64,
        init_bias: f64,
        dtype: DType,
        device: &Device,
        rng: &mut R,
    ) -> Result<Self> {
        if pool_size == 0 || detector_dim == 0 || detector_dim % pool_size != 0 {
            config_bail!(
                "layer {}: detector_dim {} must be a positive multiple of pool_size {}",
                name,
                detector_dim,
                pool_size
            );
        }
        let weights = uniform_matrix(rng, input_dim, detector_dim, irange, dtype, device)?;
        let bias = Tensor::full(init_bias, detector_dim, device)?.to_dtype(dtype)?;
        Ok(Self {
            name: name.to_string(),
            input_dim,
            detector_dim,
            pool_size,
            weights: Var::from_tensor(&weights)?,
            bias: Var::from_tensor(&bias)?,
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn detector_dim(&self) -> usize {
        self.detector_dim
    }

    fn num_pools(&self) -> usize {
        self.detector_dim / self.pool_size
    }

    pub fn weights(&self) -> &Var {
        &self.weights
    }

    pub fn bias(&self) -> &Var {
        &self.bias
    }

    /// Spread one message per pool over the pool's detector units
    fn spread_to_detectors(&self, msg: &Tensor) -> Result<Tensor> {
        if self.pool_size == 1 {
            return Ok(msg.clone());
        }
        let n = msg.dim(0)?;
        let g = self.num_pools();
        Ok(msg
            .unsqueeze(2)?
            .broadcast_as((n, g, self.pool_size))?
            .reshape((n, self.detector_dim))?)
    }

    /// Per-group categorical probabilities with "all off" in column 0
    fn group_probabilities(&self, z: &Tensor) -> Result<Tensor> {
        let n = z.dim(0)?;
        let g = self.num_pools();
        let z3 = z.reshape((n, g, self.pool_size))?;
        let off = Tensor::zeros((n, g, 1), z.dtype(), z.device())?;
        let logits = Tensor::cat(&[&off, &z3], 2)?;
        Ok(candle_nn::ops::softmax(&logits, D::Minus1)?)
    }

    fn max_pool(&self, z: &Tensor) -> Result<LayerState> {
        if self.pool_size == 1 {
            return Ok(LayerState::single(sigmoid(z)?));
        }
        let n = z.dim(0)?;
        let prob = self.group_probabilities(z)?;
        let h = prob
            .narrow(2, 1, self.pool_size)?
            .reshape((n, self.detector_dim))?;
        let p = prob.narrow(2, 0, 1)?.squeeze(2)?.affine(-1.0, 1.0)?;
        Ok(LayerState::pooled(p, h))
    }

    fn sample_max_pool<R: Rng + ?Sized>(&self, z: &Tensor, rng: &mut R) -> Result<LayerState> {
        if self.pool_size == 1 {
            return Ok(LayerState::single(sample_bernoulli(rng, &sigmoid(z)?)?));
        }
        let n = z.dim(0)?;
        let draw = sample_categorical(rng, &self.group_probabilities(z)?)?;
        let h3 = draw.narrow(2, 1, self.pool_size)?;
        let p = h3.sum(2)?;
        let h = h3.reshape((n, self.detector_dim))?;
        Ok(LayerState::pooled(p, h))
    }
}

impl Softmax {
    pub fn new<R: Rng + ?Sized>(
        name: &str,
        input_dim: usize,
        n_classes: usize,
        irange: f64,
        dtype: DType,
        device: &Device,
        rng: &mut R,
    ) -> Result<Self> {
        if n_classes < 2 {
            config_bail!("layer {}: need at least two classes", name);
        }
        let weights = uniform_matrix(rng, input_dim, n_classes, irange, dtype, device)?;
        let bias = Tensor::zeros(n_classes, dtype, device)?;
        Ok(Self {
            name: name.to_string(),
            input_dim,
            n_classes,
            weights: Var::from_tensor(&weights)?,
            bias: Var::from_tensor(&bias)?,
        })
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn weights(&self) -> &Var {
        &self.weights
    }

    pub fn bias(&self) -> &Var {
        &self.bias
    }
}

impl Layer {
    pub fn name(&self) -> &str {
        match self {
            Layer::BinaryVector(l) => &l.name,
            Layer::BinaryVectorMaxPool(l) => &l.name,
            Layer::Softmax(l) => &l.name,
        }
    }

    /// Width of the state sent to the layer above
    pub fn upward_dim(&self) -> usize {
        match self {
            Layer::BinaryVector(l) => l.nvis,
            Layer::BinaryVectorMaxPool(l) => l.num_pools(),
            Layer::Softmax(l) => l.n_classes,
        }
    }

    /// Width of the state entering this layer's own energy term
    pub fn state_dim(&self) -> usize {
        match self {
            Layer::BinaryVector(l) => l.nvis,
            Layer::BinaryVectorMaxPool(l) => l.detector_dim,
            Layer::Softmax(l) => l.n_classes,
        }
    }

    /// Width of the state this layer expects from below (None for visible)
    pub fn input_dim(&self) -> Option<usize> {
        match self {
            Layer::BinaryVector(_) => None,
            Layer::BinaryVectorMaxPool(l) => Some(l.input_dim),
            Layer::Softmax(l) => Some(l.input_dim),
        }
    }

    pub fn params(&self) -> Vec<NamedParam> {
        match self {
            Layer::BinaryVector(l) => vec![NamedParam::new(format!("{}.b", l.name), l.bias.clone())],
            Layer::BinaryVectorMaxPool(l) => vec![
                NamedParam::new(format!("{}.W", l.name), l.weights.clone()),
                NamedParam::new(format!("{}.b", l.name), l.bias.clone()),
            ],
            Layer::Softmax(l) => vec![
                NamedParam::new(format!("{}.W", l.name), l.weights.clone()),
                NamedParam::new(format!("{}.b", l.name), l.bias.clone()),
            ],
        }
    }

    pub fn upward_state(&self, state: &LayerState) -> Tensor {
        state.p.clone()
    }

    pub fn downward_state(&self, state: &LayerState) -> Tensor {
        state.h.clone()
    }

    /// Top-down input this layer sends to the layer below it
    pub fn downward_message(&self, state: &LayerState) -> Result<Tensor> {
        match self {
            Layer::BinaryVector(l) => {
                config_bail!("visible layer {} has nothing below it", l.name)
            }
            Layer::BinaryVectorMaxPool(l) => Ok(state.h.matmul(&l.weights.as_tensor().t()?)?),
            Layer::Softmax(l) => Ok(state.h.matmul(&l.weights.as_tensor().t()?)?),
        }
    }

    /// Total input to this layer's units given its neighbours
    fn pre_activation(
        &self,
        state_below: Option<&Tensor>,
        above: Option<(&Layer, &LayerState)>,
    ) -> Result<Tensor> {
        let bottom_up = match (self, state_below) {
            (Layer::BinaryVector(l), None) => l.bias.as_tensor().unsqueeze(0)?,
            (Layer::BinaryVector(l), Some(_)) => {
                config_bail!("visible layer {} takes no input from below", l.name)
            }
            (Layer::BinaryVectorMaxPool(l), Some(below)) => below
                .matmul(l.weights.as_tensor())?
                .broadcast_add(l.bias.as_tensor())?,
            (Layer::Softmax(l), Some(below)) => below
                .matmul(l.weights.as_tensor())?
                .broadcast_add(l.bias.as_tensor())?,
            (_, None) => config_bail!("layer {} needs a state from below", self.name()),
        };

        match (self, above) {
            (_, None) => Ok(bottom_up),
            (Layer::Softmax(l), Some(_)) => {
                config_bail!("softmax layer {} must be the top layer", l.name)
            }
            (Layer::BinaryVector(_), Some((layer_above, state_above))) => {
                Ok(bottom_up.broadcast_add(&layer_above.downward_message(state_above)?)?)
            }
            (Layer::BinaryVectorMaxPool(l), Some((layer_above, state_above))) => {
                let msg = layer_above.downward_message(state_above)?;
                Ok(bottom_up.broadcast_add(&l.spread_to_detectors(&msg)?)?)
            }
        }
    }

    /// Closed-form mean-field update given the neighbouring states
    ///
    /// * `state_below` - upward state of the layer below (None for visible)
    /// * `above` - the layer above and its current state, if any
    ///
    pub fn mf_update(
        &self,
        state_below: Option<&Tensor>,
        above: Option<(&Layer, &LayerState)>,
    ) -> Result<LayerState> {
        let z = self.pre_activation(state_below, above)?;
        match self {
            Layer::BinaryVector(_) => Ok(LayerState::single(sigmoid(&z)?)),
            Layer::BinaryVectorMaxPool(l) => l.max_pool(&z),
            Layer::Softmax(_) => Ok(LayerState::single(candle_nn::ops::softmax(
                &z,
                D::Minus1,
            )?)),
        }
    }

    /// Same as `mf_update` with the bottom-up input scaled by `scale`
    /// (weight doubling during initialization).
    pub fn mf_update_scaled(&self, state_below: &Tensor, scale: f64) -> Result<LayerState> {
        self.mf_update(Some(&state_below.affine(scale, 0.0)?), None)
    }

    /// Prior-only initialization from the biases, repeated over the batch
    pub fn init_h_hat(&self, batch_size: usize) -> Result<LayerState> {
        let z = match self {
            Layer::BinaryVector(l) => l.bias.as_tensor(),
            Layer::BinaryVectorMaxPool(l) => l.bias.as_tensor(),
            Layer::Softmax(l) => l.bias.as_tensor(),
        };
        let z = z
            .unsqueeze(0)?
            .broadcast_as((batch_size, self.state_dim()))?
            .contiguous()?;
        match self {
            Layer::BinaryVector(_) => Ok(LayerState::single(sigmoid(&z)?)),
            Layer::BinaryVectorMaxPool(l) => l.max_pool(&z),
            Layer::Softmax(_) => Ok(LayerState::single(candle_nn::ops::softmax(
                &z,
                D::Minus1,
            )?)),
        }
    }

    /// Draw from the layer's conditional given its neighbours
    pub fn sample<R: Rng + ?Sized>(
        &self,
        state_below: Option<&Tensor>,
        above: Option<(&Layer, &LayerState)>,
        rng: &mut R,
    ) -> Result<LayerState> {
        let z = self.pre_activation(state_below, above)?.detach();
        match self {
            Layer::BinaryVector(_) => Ok(LayerState::single(sample_bernoulli(rng, &sigmoid(&z)?)?)),
            Layer::BinaryVectorMaxPool(l) => l.sample_max_pool(&z, rng),
            Layer::Softmax(_) => {
                let prob = candle_nn::ops::softmax(&z, D::Minus1)?;
                Ok(LayerState::single(sample_categorical(rng, &prob)?))
            }
        }
    }

    /// Draw `batch_size` states from the bias-only prior
    pub fn sample_prior<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Result<LayerState> {
        let mean = self.init_h_hat(batch_size)?.detach();
        match self {
            Layer::BinaryVector(_) => Ok(LayerState::single(sample_bernoulli(rng, &mean.h)?)),
            Layer::BinaryVectorMaxPool(l) if l.pool_size == 1 => {
                Ok(LayerState::single(sample_bernoulli(rng, &mean.h)?))
            }
            Layer::BinaryVectorMaxPool(l) => {
                let z = l
                    .bias
                    .as_tensor()
                    .detach()
                    .unsqueeze(0)?
                    .broadcast_as((batch_size, l.detector_dim))?
                    .contiguous()?;
                l.sample_max_pool(&z, rng)
            }
            Layer::Softmax(_) => Ok(LayerState::single(sample_categorical(rng, &mean.h)?)),
        }
    }

    /// This layer's contribution to the energy, one value per example.
    ///
    /// E_l = -b.h - (below W) . h
    ///
    /// Multilinear in the states, so the same expression gives the
    /// expected energy under a factorized posterior.
    pub fn expected_energy_term(&self, state_below: Option<&Tensor>, state: &LayerState) -> Result<Tensor> {
        let (bias, weights) = match self {
            Layer::BinaryVector(l) => (l.bias.as_tensor(), None),
            Layer::BinaryVectorMaxPool(l) => (l.bias.as_tensor(), Some(l.weights.as_tensor())),
            Layer::Softmax(l) => (l.bias.as_tensor(), Some(l.weights.as_tensor())),
        };
        let bias_term = state.h.broadcast_mul(bias)?.sum(1)?;
        let total = match (weights, state_below) {
            (None, _) => bias_term,
            (Some(w), Some(below)) => {
                let interaction = below.matmul(w)?.mul(&state.h)?.sum(1)?;
                bias_term.add(&interaction)?
            }
            (Some(_), None) => config_bail!("layer {} needs a state from below", self.name()),
        };
        Ok(total.neg()?)
    }

    /// Entropy of the factorized distribution with the given means,
    /// one value per example.
    pub fn entropy(&self, state: &LayerState) -> Result<Tensor> {
        let neg_entropy = match self {
            Layer::BinaryVector(_) => {
                let off = state.h.affine(-1.0, 1.0)?;
                xlogx(&state.h)?.add(&xlogx(&off)?)?.sum(1)?
            }
            Layer::BinaryVectorMaxPool(_) => {
                let off = state.p.affine(-1.0, 1.0)?;
                xlogx(&state.h)?.sum(1)?.add(&xlogx(&off)?.sum(1)?)?
            }
            Layer::Softmax(_) => xlogx(&state.h)?.sum(1)?,
        };
        Ok(neg_entropy.neg()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(42)
    }

    #[test]
    fn pool_size_must_divide_detectors() {
        let dev = Device::Cpu;
        let res = BinaryVectorMaxPool::new("h", 4, 5, 2, 0.1, 0.0, DType::F64, &dev, &mut rng());
        assert!(matches!(res, Err(crate::error::PddbmError::Configuration(_))));
    }

    #[test]
    fn max_pool_groups_are_distributions() -> Result<()> {
        let dev = Device::Cpu;
        let mut rng = rng();
        let layer = Layer::BinaryVectorMaxPool(BinaryVectorMaxPool::new(
            "h", 3, 6, 3, 1.0, 0.0, DType::F64, &dev, &mut rng,
        )?);
        let v = uniform_like(&mut rng, &Tensor::zeros((4, 3), DType::F64, &dev)?)?;
        let q = layer.mf_update(Some(&v), None)?;
        assert_eq!(q.h.dims(), &[4, 6]);
        assert_eq!(q.p.dims(), &[4, 2]);

        let h = q.h.to_vec2::<f64>()?;
        let p = q.p.to_vec2::<f64>()?;
        for (hr, pr) in h.iter().zip(p.iter()) {
            for g in 0..2 {
                let on: f64 = hr[3 * g..3 * g + 3].iter().sum();
                approx::assert_abs_diff_eq!(on, pr[g], epsilon = 1e-12);
                assert!(pr[g] > 0.0 && pr[g] < 1.0);
            }
        }

        let s = layer.sample(Some(&v), None, &mut rng)?;
        for (hr, pr) in s.h.to_vec2::<f64>()?.iter().zip(s.p.to_vec2::<f64>()?.iter()) {
            for g in 0..2 {
                let on: f64 = hr[3 * g..3 * g + 3].iter().sum();
                assert!(on == 0.0 || on == 1.0);
                assert_eq!(on, pr[g]);
            }
        }
        Ok(())
    }

    #[test]
    fn pool_one_is_plain_sigmoid() -> Result<()> {
        let dev = Device::Cpu;
        let mut rng = rng();
        let layer = Layer::BinaryVectorMaxPool(BinaryVectorMaxPool::new(
            "h", 2, 3, 1, 1.0, -0.5, DType::F64, &dev, &mut rng,
        )?);
        let v = Tensor::new(&[[1.0f64, 0.0], [0.0, 1.0]], &dev)?;
        let q = layer.mf_update(Some(&v), None)?;
        let expected = match &layer {
            Layer::BinaryVectorMaxPool(l) => {
                sigmoid(&v.matmul(l.weights().as_tensor())?.broadcast_add(l.bias().as_tensor())?)?
            }
            _ => unreachable!(),
        };
        assert_eq!(q.h.to_vec2::<f64>()?, expected.to_vec2::<f64>()?);
        assert_eq!(q.p.to_vec2::<f64>()?, q.h.to_vec2::<f64>()?);
        Ok(())
    }

    #[test]
    fn softmax_rejects_layer_above() -> Result<()> {
        let dev = Device::Cpu;
        let mut rng = rng();
        let y = Layer::Softmax(Softmax::new("y", 2, 3, 1.0, DType::F64, &dev, &mut rng)?);
        let below = Tensor::ones((1, 2), DType::F64, &dev)?;
        let state = y.mf_update(Some(&below), None)?;
        let res = y.mf_update(Some(&below), Some((&y, &state)));
        assert!(matches!(res, Err(crate::error::PddbmError::Configuration(_))));
        Ok(())
    }

    #[test]
    fn binary_entropy_at_half_is_log2() -> Result<()> {
        let dev = Device::Cpu;
        let vis = Layer::BinaryVector(BinaryVector::new("v", 3, 0.0, DType::F64, &dev)?);
        let q = vis.init_h_hat(2)?;
        for e in vis.entropy(&q)?.to_vec1::<f64>()? {
            approx::assert_abs_diff_eq!(e, 3.0 * 2f64.ln(), epsilon = 1e-12);
        }
        Ok(())
    }
}
