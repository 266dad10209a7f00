use anyhow::{Result, bail};
use clap::Parser;
use gitdeps::InstallConfig;
use gitdeps::config::{DEFAULT_CONCURRENCY, DEFAULT_TIMEOUT_SECS};
use gitdeps::graph::PlacementPolicy;
use gitdeps::http::{MAX_RETRIES, RetryPolicy};
use gitdeps::runtime::{RealRuntime, Runtime};
use std::path::PathBuf;
use std::time::Duration;

/// gitdeps - install git and registry dependencies
///
/// Reads package.json in the project directory and installs its dependencies
/// into node_modules. Dependencies may name a registry version range, a
/// GitHub repository (owner/repo#ref) or a git URL (git+https://host/path.git#ref).
///
/// If the GITHUB_TOKEN environment variable is set, it will be used for GitHub API calls.
///
/// Examples:
///   gitdeps install                 # Install dependencies of ./package.json
///   gitdeps layout --cwd app        # Show what is installed in app/node_modules
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project directory (defaults to the current directory)
    #[arg(long = "cwd", value_name = "DIR", global = true)]
    pub cwd: Option<PathBuf>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Install the project's dependencies
    Install(InstallArgs),

    /// Print the installed layout as JSON
    Layout,
}

#[derive(clap::Args, Debug)]
pub struct InstallArgs {
    /// Shared store for fetched trees (also via GITDEPS_STORE)
    #[arg(long = "store", env = "GITDEPS_STORE", value_name = "DIR")]
    pub store: Option<PathBuf>,

    /// GitHub API URL (defaults to https://api.github.com)
    #[arg(long = "api-url", env = "GITDEPS_API_URL", value_name = "URL")]
    pub api_url: Option<String>,

    /// Package registry URL (defaults to https://registry.npmjs.org)
    #[arg(long = "registry", env = "GITDEPS_REGISTRY", value_name = "URL")]
    pub registry: Option<String>,

    /// How packages are arranged in node_modules
    #[arg(long = "placement", value_enum, default_value_t = PlacementPolicy::Nest)]
    pub placement: PlacementPolicy,

    /// Dependencies resolved in parallel
    #[arg(long = "concurrency", value_name = "N", default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Per-request network timeout in seconds
    #[arg(
        long = "timeout",
        env = "GITDEPS_TIMEOUT",
        value_name = "SECS",
        default_value_t = DEFAULT_TIMEOUT_SECS
    )]
    pub timeout: u64,

    /// Attempts per network request before giving up
    #[arg(
        long = "retries",
        env = "GITDEPS_RETRIES",
        value_name = "N",
        default_value_t = MAX_RETRIES
    )]
    pub retries: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let runtime = RealRuntime;
    let project = match cli.cwd {
        Some(dir) => dir,
        None => runtime.current_dir()?,
    };

    match cli.command {
        Commands::Install(args) => {
            let mut config = InstallConfig::new(&runtime, args.store, args.api_url, args.registry)?;
            config.placement = args.placement;
            config.concurrency = args.concurrency;
            config.timeout = Duration::from_secs(args.timeout);
            config.retry = RetryPolicy::new(args.retries, config.retry.base_delay);

            tokio::select! {
                result = gitdeps::install(runtime, config, &project) => {
                    let layout = result?;
                    println!("Installed {} dependencies", layout.dependencies.len());
                }
                _ = tokio::signal::ctrl_c() => {
                    bail!("Install interrupted");
                }
            }
        }
        Commands::Layout => {
            let layout = gitdeps::layout(runtime, &project)?;
            println!("{}", layout.to_json()?.trim_end());
        }
    }
    Ok(())
}
