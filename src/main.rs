use std::process::ExitCode;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tsumiki::{Config, WatchOptions};

/// Incremental web asset pipeline
#[derive(Parser, Debug)]
#[command(version, about, long_about = None, arg_required_else_help = true)]
struct Cli {
    /// Project root directory
    #[arg(long, global = true, default_value = ".", value_hint = clap::ValueHint::DirPath)]
    root: Utf8PathBuf,

    /// Config file path, relative to the project root (default: tsumiki.toml)
    #[arg(short = 'C', long, global = true, value_hint = clap::ValueHint::FilePath)]
    config: Option<Utf8PathBuf>,

    /// Increase logging verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Clean the output directory and build everything once
    #[command(visible_alias = "b")]
    Build,

    /// Build, serve, and rebuild on change until interrupted
    #[command(visible_alias = "w")]
    Watch {
        /// Open the site in a browser after the initial build
        #[arg(long)]
        open: bool,
    },

    /// Remove the build output
    Clean {
        /// Remove the artifact cache as well
        #[arg(long)]
        cache: bool,
    },

    /// Print the task graph as a Mermaid diagram
    Graph,
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    tsumiki::init_logging(cli.verbose);

    let root = cli
        .root
        .canonicalize_utf8()
        .with_context(|| format!("Couldn't resolve the project root `{}`", cli.root))?;

    let config = Config::load(&root, cli.config.as_deref())?;
    let pipeline = tsumiki::pipeline(config)?;

    match cli.command {
        Commands::Build => {
            let run = pipeline.build()?;

            if !run.is_success() {
                for error in run.failures() {
                    tracing::error!("{error}");
                }
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Watch { open } => pipeline.watch(&WatchOptions { open })?,
        Commands::Clean { cache } => pipeline.clean(cache)?,
        Commands::Graph => print!("{}", pipeline.graph()),
    }

    Ok(ExitCode::SUCCESS)
}
