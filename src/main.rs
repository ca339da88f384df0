//! pinnerd command line.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use pinnerd::config::Config;
use pinnerd::queue::PinRequest;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "pinnerd", version)]
#[command(about = "Queue-driven pin orchestration daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct ConfigArg {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "pinnerd.toml")]
    config: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon until SIGINT/SIGTERM
    Run(ConfigArg),

    /// Load and validate the configuration, printing warnings
    Check(ConfigArg),

    /// Publish an add request for a storage record
    Pin {
        #[command(flatten)]
        config: ConfigArg,
        /// Storage record id
        #[arg(long)]
        id: i64,
        /// Object key, or key prefix for directories
        #[arg(long)]
        key: String,
        /// The key is a directory prefix
        #[arg(long)]
        dir: bool,
        /// Owner user id, scopes the record lookup
        #[arg(long)]
        user: Option<i64>,
    },

    /// Publish an unpin request for a storage record
    Unpin {
        #[command(flatten)]
        config: ConfigArg,
        /// Storage record id
        #[arg(long)]
        id: i64,
        /// Content identifier to unpin
        #[arg(long)]
        cid: String,
        /// Owner user id, scopes the record lookup
        #[arg(long)]
        user: Option<i64>,
        /// Unpin even if the record is not marked pinned
        #[arg(long)]
        force: bool,
    },
}

fn load(arg: &ConfigArg) -> Result<Config> {
    let config = Config::load_from(&arg.config)?;
    let validation = config.validate()?;
    for warning in &validation.warnings {
        tracing::warn!("{warning}");
    }
    Ok(config)
}

async fn execute(command: Command) -> Result<()> {
    match command {
        Command::Run(arg) => {
            let config = Config::load_from(&arg.config)?;
            pinnerd::logging::init(&config.logging)?;
            let validation = config.validate()?;
            for warning in &validation.warnings {
                tracing::warn!("{warning}");
            }
            tracing::info!(
                config = %arg.config.display(),
                version = env!("CARGO_PKG_VERSION"),
                "starting pinnerd"
            );
            pinnerd::daemon::run(config).await
        },
        Command::Check(arg) => {
            let config = Config::load_from(&arg.config)?;
            let validation = config.validate()?;
            for warning in &validation.warnings {
                println!("warning: {warning}");
            }
            println!("{} is valid", arg.config.display());
            Ok(())
        },
        Command::Pin {
            config,
            id,
            key,
            dir,
            user,
        } => {
            pinnerd::logging::init_stderr();
            let config = load(&config)?;
            let request = PinRequest {
                storage_id: id,
                storage_key: key,
                is_directory: dir,
                user_id: user,
                ..PinRequest::default()
            }
            .with_source("cli");
            pinnerd::daemon::publish_request(&config, &request).await
        },
        Command::Unpin {
            config,
            id,
            cid,
            user,
            force,
        } => {
            pinnerd::logging::init_stderr();
            let config = load(&config)?;
            let request = PinRequest {
                storage_id: id,
                content_id: Some(cid),
                unpin: true,
                user_id: user,
                force,
                ..PinRequest::default()
            }
            .with_source("cli");
            pinnerd::daemon::publish_request(&config, &request).await
        },
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match execute(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}
