#![cfg(not(tarpaulin_include))]

use clap::{Parser, Subcommand};
use dashboard::login::hash_password;
use dashboard::{Config, app};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dashboard")]
#[command(author, version, about = "Quality anomaly-detection and market dashboard")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the web server (default)
    Serve {
        /// Address to listen on, e.g. 0.0.0.0:5000
        #[arg(short, long)]
        bind: Option<String>,

        /// Directory that relative data paths are resolved against
        #[arg(long)]
        root: Option<PathBuf>,

        /// Use generated tables instead of the configured data files
        #[arg(long)]
        sample_data: bool,
    },

    /// Print an argon2 hash for an entry in the users file
    HashPassword {
        password: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match args.command.unwrap_or(Command::Serve {
        bind: None,
        root: None,
        sample_data: false,
    }) {
        Command::HashPassword { password } => {
            println!("{}", hash_password(&password)?);
        }
        Command::Serve {
            bind,
            root,
            sample_data,
        } => {
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(root) = root {
                config.root = root;
            }
            config.sample_data |= sample_data;

            app::run(config).await?;
        }
    }

    Ok(())
}
