use anyhow::Result;
use clap::Parser;
use pddbm::cli::{train, Cli, Commands};

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::TrainDbm(args) => {
            train::run_train_dbm(args)?;
        }
        Commands::TrainPddbm(args) => {
            train::run_train_pddbm(args)?;
        }
    }

    Ok(())
}
