use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use cli::{Args, Commands};
use commands::utils::{config_path, init_logging, load_config};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    if let Commands::InitConfig { force } = args.command {
        return commands::init_config(&config_path(args.config)?, force);
    }

    let config = load_config(args.config.as_deref())?;
    init_logging(args.verbose, &config.logging.level);

    match args.command {
        Commands::Status => commands::status(&config),
        Commands::Resolve { user, parent } => commands::resolve(&config, user, parent),
        Commands::Recover => commands::recover(&config),
        Commands::Run => commands::run(config),
        Commands::InitConfig { .. } => Ok(()),
    }
}
