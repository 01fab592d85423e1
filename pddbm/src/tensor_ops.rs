//! Small tensor routines shared by the layers, the E-step and the samplers.

use crate::domain_bail;
use crate::error::Result;
use candle_core::{DType, Tensor, D};
use rand::Rng;
use rand_distr::StandardNormal;

/// Logistic sigmoid
pub fn sigmoid(x: &Tensor) -> Result<Tensor> {
    Ok(candle_nn::ops::sigmoid(x)?)
}

/// Numerically stable `log(1 + exp(x))`
///
/// softplus(x) = max(x, 0) + log(1 + exp(-|x|))
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    Ok(x.relu()?.add(&tail)?)
}

/// `x * log(x)` with the convention `0 * log(0) = 0`
pub fn xlogx(x: &Tensor) -> Result<Tensor> {
    let safe = x.clamp(1e-30, f64::INFINITY)?;
    Ok(x.mul(&safe.log()?)?)
}

/// Exponential damping of a fixed-point update
///
/// damped = (1 - c) * old + c * new
///
/// * `old` - previous value
/// * `new` - candidate value
/// * `new_coeff` - weight `c` placed on the candidate
///
pub fn damp(old: &Tensor, new: &Tensor, new_coeff: f64) -> Result<Tensor> {
    Ok(old.affine(1.0 - new_coeff, 0.0)?.add(&new.affine(new_coeff, 0.0)?)?)
}

/// Bound how far an update may reflect through the origin.
///
/// For an old value `o > 0` the new value may not go below `-rho * o`;
/// for `o < 0` it may not go above `-rho * o`; `o = 0` leaves the
/// candidate untouched.
///
/// * `s_hat` - old values
/// * `new_s_hat` - candidate values
/// * `rho` - reflection bound in (0, 1)
///
pub fn reflection_clip(s_hat: &Tensor, new_s_hat: &Tensor, rho: f64) -> Result<Tensor> {
    if s_hat.dims() != new_s_hat.dims() {
        domain_bail!(
            "reflection_clip: shapes {:?} and {:?} differ",
            s_hat.dims(),
            new_s_hat.dims()
        );
    }
    let bound = s_hat.affine(-rho, 0.0)?;
    let positive = s_hat.gt(0.0)?;
    let negative = s_hat.lt(0.0)?;

    let from_positive = new_s_hat.maximum(&bound)?;
    let from_negative = new_s_hat.minimum(&bound)?;

    let rest = negative.where_cond(&from_negative, new_s_hat)?;
    Ok(positive.where_cond(&from_positive, &rest)?)
}

/// Uniform(0,1) tensor with the same shape, dtype and device as `like`
pub fn uniform_like<R: Rng + ?Sized>(rng: &mut R, like: &Tensor) -> Result<Tensor> {
    let data: Vec<f64> = (0..like.elem_count()).map(|_| rng.random::<f64>()).collect();
    let u = Tensor::from_vec(data, like.dims().to_vec(), like.device())?;
    Ok(u.to_dtype(like.dtype())?)
}

/// Standard normal tensor with the same shape, dtype and device as `like`
pub fn standard_normal_like<R: Rng + ?Sized>(rng: &mut R, like: &Tensor) -> Result<Tensor> {
    let data: Vec<f64> = (0..like.elem_count())
        .map(|_| rng.sample::<f64, _>(StandardNormal))
        .collect();
    let z = Tensor::from_vec(data, like.dims().to_vec(), like.device())?;
    Ok(z.to_dtype(like.dtype())?)
}

/// Uniform(-irange, irange) matrix for weight initialization
pub fn uniform_matrix<R: Rng + ?Sized>(
    rng: &mut R,
    rows: usize,
    cols: usize,
    irange: f64,
    dtype: DType,
    device: &candle_core::Device,
) -> Result<Tensor> {
    let data: Vec<f64> = (0..rows * cols)
        .map(|_| irange * (2.0 * rng.random::<f64>() - 1.0))
        .collect();
    Ok(Tensor::from_vec(data, (rows, cols), device)?.to_dtype(dtype)?)
}

/// Independent Bernoulli draws with the given probabilities
pub fn sample_bernoulli<R: Rng + ?Sized>(rng: &mut R, prob: &Tensor) -> Result<Tensor> {
    let u = uniform_like(rng, prob)?;
    Ok(u.lt(prob)?.to_dtype(prob.dtype())?)
}

/// One-hot draws from categorical distributions along the last dimension.
///
/// Compares one uniform per distribution against the running CDF; the
/// last category absorbs any rounding slack so exactly one entry fires.
pub fn sample_categorical<R: Rng + ?Sized>(rng: &mut R, prob: &Tensor) -> Result<Tensor> {
    let dims = prob.dims().to_vec();
    let last = dims.len() - 1;
    let k = dims[last];

    let cdf = prob.cumsum(D::Minus1)?;
    let mut u_dims = dims.clone();
    u_dims[last] = 1;
    let u = uniform_like(rng, &Tensor::zeros(u_dims, prob.dtype(), prob.device())?)?;

    let above = cdf.broadcast_gt(&u)?.to_dtype(prob.dtype())?;
    let above = if k > 1 {
        let head = above.narrow(last, 0, k - 1)?;
        let tail = Tensor::ones_like(&above.narrow(last, k - 1, 1)?)?;
        Tensor::cat(&[&head, &tail], last)?
    } else {
        Tensor::ones_like(&above)?
    };

    let shifted = if k > 1 {
        let zero = Tensor::zeros_like(&above.narrow(last, 0, 1)?)?;
        Tensor::cat(&[&zero, &above.narrow(last, 0, k - 1)?], last)?
    } else {
        Tensor::zeros_like(&above)?
    };
    Ok(above.sub(&shifted)?)
}

/// Read a rank-0 (or single-element) tensor as `f64`
pub fn scalar_f64(x: &Tensor) -> Result<f64> {
    Ok(x.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?[0])
}

/// Fraction of rows whose argmax differs
pub fn misclassification_rate(truth: &Tensor, pred: &Tensor) -> Result<f64> {
    let wrong = truth
        .argmax(1)?
        .ne(&pred.argmax(1)?)?
        .to_dtype(DType::F64)?
        .mean_all()?;
    scalar_f64(&wrong)
}

/// Fail unless `x` has the expected dtype
pub fn ensure_dtype(x: &Tensor, dtype: DType, what: &str) -> Result<()> {
    if x.dtype() != dtype {
        domain_bail!("{} has dtype {:?} but {:?} is required", what, x.dtype(), dtype);
    }
    Ok(())
}

/// Fail unless `x` is a matrix with `cols` columns
pub fn ensure_matrix(x: &Tensor, cols: usize, what: &str) -> Result<usize> {
    match *x.dims() {
        [rows, c] if c == cols => Ok(rows),
        _ => domain_bail!("{} must be [n, {}], got {:?}", what, cols, x.dims()),
    }
}
