use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tally_cli::commands::{diff, import, status, sync, validate};
use tally_cli::{Cli, Commands, Config};

fn load_config(cli: &Cli) -> Result<Config> {
    let config =
        Config::load_from(cli.config.as_deref()).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with verbose flag support
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Use try_init to avoid panic if tracing is already initialized (e.g., in tests)
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let mut stdout = std::io::stdout();

    match &cli.command {
        Some(Commands::Import { files }) => {
            let config = load_config(&cli)?;
            import::run(&mut stdout, &config, files)?;
        }
        Some(Commands::Sync { once, since }) => {
            let config = load_config(&cli)?;
            sync::run(&mut stdout, &config, *once, since.as_deref())?;
        }
        Some(Commands::Diff { start, end, apply }) => {
            let config = load_config(&cli)?;
            diff::run(&mut stdout, &config, start, end, *apply)?;
        }
        Some(Commands::Validate) => {
            let config = load_config(&cli)?;
            if !validate::run(&mut stdout, &config)? {
                std::process::exit(1);
            }
        }
        Some(Commands::Status) => {
            let config = load_config(&cli)?;
            status::run(&mut stdout, &config, chrono::Utc::now())?;
        }
        None => {
            // No subcommand, show help
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}
