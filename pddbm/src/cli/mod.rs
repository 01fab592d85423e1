pub mod data_io;
pub mod train;

use clap::{Parser, Subcommand};

pub use train::{TrainDbmArgs, TrainPddbmArgs};

#[derive(Parser)]
#[command(name = "pddbm")]
#[command(about = "Deep Boltzmann machines and PD-DBMs trained by mean-field + PCD")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train a (optionally supervised) DBM on binary data
    TrainDbm(TrainDbmArgs),
    /// Train an S3C layer with a DBM prior on real-valued data
    TrainPddbm(TrainPddbmArgs),
}
