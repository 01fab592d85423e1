//! Deep Boltzmann machines and PD-DBMs (spike-and-slab sparse coding
//! with a DBM prior over the spikes), trained by variational mean-field
//! inference and persistent contrastive divergence.
//!
//! # Overview
//!
//! One learning step on a minibatch:
//! 1. **E-step** ([`inference`], [`dbm::Dbm::mf`]): a damped fixed-point
//!    schedule of closed-form coordinate updates gives a factorized
//!    posterior for the batch.
//! 2. **Positive phase**: the variational bound, reduced through
//!    [`sufficient_stats`], is differentiated with the posterior held fixed.
//! 3. **Negative phase** ([`chains`], [`gradient`]): persistent Gibbs chains
//!    are advanced and their energy gradient is added.
//! 4. **Update** ([`optimizer`]): momentum SGD applied to every parameter
//!    at once, then the chain states are replaced.
//!
//! Tensors and autodiff come from `candle`.

pub mod chains;
pub mod cli;
pub mod composite;
pub mod config;
pub mod dbm;
pub mod driver;
pub mod error;
pub mod gradient;
pub mod inference;
pub mod layers;
pub mod learner;
pub mod optimizer;
pub mod s3c;
pub mod snapshot;
pub mod sufficient_stats;
pub mod tensor_ops;

pub use composite::Pddbm;
pub use dbm::{Dbm, DbmArch, MeanFieldProcedure};
pub use error::{PddbmError, Result};
pub use learner::{DbmLearner, Learn, MiniBatch, StepReport};
