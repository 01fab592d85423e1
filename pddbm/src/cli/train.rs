use anyhow::Result;
use candle_core::{DType, Device};
use clap::{Args, ValueEnum};
use log::info;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};

use super::data_io::{read_matrix, read_one_hot_labels};
use crate::composite::Pddbm;
use crate::config::HyperParams;
use crate::dbm::{DbmArch, MeanFieldProcedure};
use crate::driver::{train_dbm, train_pddbm, TrainConfig};
use crate::inference::parse_schedule;
use crate::learner::DbmLearner;
use crate::s3c::{S3c, S3cOptions};

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ProcedureArg {
    WeightDoubling,
    Consistent,
}

impl From<ProcedureArg> for MeanFieldProcedure {
    fn from(p: ProcedureArg) -> Self {
        match p {
            ProcedureArg::WeightDoubling => MeanFieldProcedure::WeightDoubling,
            ProcedureArg::Consistent => MeanFieldProcedure::Consistent,
        }
    }
}

/// Options shared by both training commands
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    #[arg(short, long, help = "Data matrix, one example per row (tsv, optionally .gz)")]
    pub data: PathBuf,

    #[arg(short, long, help = "Output snapshot (safetensors)")]
    pub output: PathBuf,

    #[arg(long, help = "JSON hyperparameters; command-line flags below override it")]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub num_chains: Option<usize>,

    #[arg(long)]
    pub num_gibbs_steps: Option<usize>,

    #[arg(long)]
    pub lr: Option<f64>,

    #[arg(long)]
    pub epochs: Option<usize>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long, default_value = "0.05", help = "Weights start uniform in [-irange, irange]")]
    pub irange: f64,

    #[arg(long, help = "Run on GPU if available")]
    pub gpu: bool,

    #[arg(long, help = "Use 64-bit floats")]
    pub double_precision: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Args, Debug, Clone)]
pub struct TrainDbmArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(short, long, help = "Integer class labels, one per line")]
    pub labels: Option<PathBuf>,

    #[arg(long, default_value = "10")]
    pub n_classes: usize,

    #[arg(long, value_delimiter = ',', default_value = "500,1000")]
    pub hidden: Vec<usize>,

    #[arg(long, default_value = "1")]
    pub pool_size: usize,

    #[arg(long)]
    pub mf_iter: Option<usize>,

    #[arg(long, value_enum)]
    pub procedure: Option<ProcedureArg>,

    #[arg(long, help = "Plain PCD negative phase instead of the averaged one")]
    pub no_variance_reduction: bool,
}

#[derive(Args, Debug, Clone)]
pub struct TrainPddbmArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(long, default_value = "400", help = "Number of S3C spike-and-slab units")]
    pub nhid: usize,

    #[arg(long, value_delimiter = ',', default_value = "400", help = "DBM hidden layer widths")]
    pub g_layers: Vec<usize>,

    #[arg(long, default_value = "1")]
    pub pool_size: usize,

    #[arg(long, help = "Comma-separated E-step schedule, e.g. s:1,h:1,g:0")]
    pub schedule: Option<String>,

    #[arg(long)]
    pub rho: Option<f64>,

    #[arg(long, help = "Reflection-clip the slab updates (off by default)")]
    pub clip_reflections: bool,

    #[arg(long)]
    pub monitor_kl: bool,
}

fn resolve_hyper_params(common: &CommonArgs) -> Result<HyperParams> {
    let mut hp = match common.config.as_ref() {
        Some(path) => {
            info!("reading hyperparameters from {:?}", path);
            HyperParams::from_json_file(path)?
        }
        None => HyperParams::default(),
    };
    if let Some(x) = common.num_chains {
        hp.num_chains = x;
    }
    if let Some(x) = common.num_gibbs_steps {
        hp.num_gibbs_steps = x;
    }
    if let Some(x) = common.lr {
        hp.learning_rate = x;
    }
    if let Some(x) = common.epochs {
        hp.num_epochs = x;
    }
    if let Some(x) = common.batch_size {
        hp.batch_size = x;
    }
    if let Some(x) = common.seed {
        hp.seed = x;
    }
    Ok(hp)
}

fn make_device(common: &CommonArgs) -> Result<(Device, DType)> {
    let device = if common.gpu {
        Device::cuda_if_available(0)?
    } else {
        Device::Cpu
    };
    let dtype = if common.double_precision { DType::F64 } else { DType::F32 };
    Ok((device, dtype))
}

fn config_path(output: &Path) -> PathBuf {
    let s = output.to_string_lossy();
    let base = s.strip_suffix(".safetensors").unwrap_or(&s);
    PathBuf::from(format!("{}.config.json", base))
}

fn train_config(hp: HyperParams, common: &CommonArgs) -> Result<TrainConfig> {
    hp.validate()?;
    let path = config_path(&common.output);
    hp.to_json_file(&path)?;
    info!("resolved configuration written to {:?}", path);
    Ok(TrainConfig {
        hp,
        output: Some(common.output.clone()),
        verbose: common.verbose,
        show_progress: true,
    })
}

pub fn run_train_dbm(args: &TrainDbmArgs) -> Result<()> {
    let common = &args.common;
    let (device, dtype) = make_device(common)?;

    let mut hp = resolve_hyper_params(common)?;
    if let Some(x) = args.mf_iter {
        hp.mf_iter = x;
    }
    if let Some(p) = args.procedure {
        hp.mf_procedure = p.into();
    }
    if args.no_variance_reduction {
        hp.variance_reduction = false;
    }

    let data = read_matrix(&common.data, dtype, &device)?;
    let labels = args
        .labels
        .as_ref()
        .map(|p| read_one_hot_labels(p, args.n_classes, dtype, &device))
        .transpose()?;
    if labels.is_none() && hp.variance_reduction {
        info!("no labels: falling back to the plain negative phase");
        hp.variance_reduction = false;
    }

    let arch = DbmArch {
        nvis: data.dim(1)?,
        hidden_dims: args.hidden.clone(),
        pool_size: args.pool_size,
        n_classes: labels.as_ref().map(|_| args.n_classes),
        irange: common.irange,
        init_bias_hid: 0.0,
    };
    let mut rng = SmallRng::seed_from_u64(hp.seed);
    let dbm = arch.build(dtype, &device, &mut rng)?;

    let config = train_config(hp, common)?;
    let mut learner = DbmLearner::new(dbm, &config.hp)?;
    let trace = train_dbm(&mut learner, &data, labels.as_ref(), &config)?;
    info!(
        "done: final objective {:.6}",
        trace.objective.last().copied().unwrap_or(f64::NAN)
    );
    Ok(())
}

pub fn run_train_pddbm(args: &TrainPddbmArgs) -> Result<()> {
    let common = &args.common;
    let (device, dtype) = make_device(common)?;

    let mut hp = resolve_hyper_params(common)?;
    if let Some(s) = args.schedule.as_ref() {
        hp.schedule = parse_schedule(s)?;
    }
    if let Some(rho) = args.rho {
        hp.rho = rho;
    }
    if args.clip_reflections {
        hp.clip_reflections = true;
    }
    if args.monitor_kl {
        hp.monitor_kl = true;
    }

    let data = read_matrix(&common.data, dtype, &device)?;
    let mut rng = SmallRng::seed_from_u64(hp.seed);
    let s3c = S3c::new(
        data.dim(1)?,
        args.nhid,
        S3cOptions {
            irange: common.irange,
            ..S3cOptions::default()
        },
        dtype,
        &device,
        &mut rng,
    )?;
    let dbm = DbmArch {
        nvis: args.nhid,
        hidden_dims: args.g_layers.clone(),
        pool_size: args.pool_size,
        n_classes: None,
        irange: common.irange,
        init_bias_hid: 0.0,
    }
    .build(dtype, &device, &mut rng)?;

    let config = train_config(hp, common)?;
    let mut model = Pddbm::new(s3c, dbm, config.hp.inference_options(), &config.hp)?;
    let trace = train_pddbm(&mut model, &data, &config)?;
    info!(
        "done: final objective {:.6}",
        trace.objective.last().copied().unwrap_or(f64::NAN)
    );
    Ok(())
}
