mod config;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use omnistore_scp::ProcessRunner;
use omnistore_vfs::{LocalFs, ScpFs, VfsBackend};
use tokio::io::AsyncWriteExt;
use tracing::Level;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "omnistore", version, about = "Pull and push trees over scp")]
struct Cli {
    /// Config file (defaults to ~/.config/omnistore/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Command used to reach the remote host, e.g. "ssh -p 2222 alice@box"
    #[arg(long, global = true)]
    via: Option<String>,

    /// Remote directory that relative paths hang off
    #[arg(long, global = true)]
    root: Option<String>,

    /// Per-read timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// More output; repeat for trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a remote directory into a local one
    Pull { remote: String, dest: PathBuf },
    /// Copy a local file, or the contents of a local directory, into a remote directory
    Push { source: PathBuf, remote: String },
    /// Print a remote file to stdout
    Cat { remote: String },
    /// List a remote directory
    Ls { remote: String },
    /// Write the default config file if none exists
    Init,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };
    if let Some(via) = &cli.via {
        config.remote.via = via.split_whitespace().map(str::to_string).collect();
    }
    if let Some(root) = &cli.root {
        config.remote.root.clone_from(root);
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.scp.timeout_ms = timeout_ms;
    }
    Ok(config)
}

fn remote_backend(config: &Config) -> ScpFs {
    let runner = ProcessRunner::new(config.remote.via.clone());
    ScpFs::new(runner, config.scp.clone()).with_root(config.remote.root.clone())
}

/// Split a local path into the directory to sandbox and the name inside it
fn local_source(path: &Path) -> Result<(LocalFs, String)> {
    let path = path
        .canonicalize()
        .with_context(|| format!("Not found: {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("cannot push {}", path.display()))?
        .to_string();
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("cannot push {}", path.display()))?;
    Ok((LocalFs::new(parent), name))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if matches!(cli.command, Commands::Init) {
        let path = cli.config.clone().unwrap_or_else(Config::default_config_path);
        if Config::create_default_if_missing(&path)? {
            println!("wrote {}", path.display());
        } else {
            println!("{} already exists", path.display());
        }
        return Ok(());
    }

    let config = load_config(&cli)?;
    let remote = remote_backend(&config);

    match &cli.command {
        Commands::Pull { remote: dir, dest } => {
            let local = LocalFs::new(dest);
            let stats = remote.download_tree(dir, &local, "").await?;
            eprintln!(
                "pulled {} files, {} dirs, {} bytes",
                stats.files, stats.dirs, stats.bytes
            );
        }
        Commands::Push { source, remote: dir } => {
            let (local, name) = local_source(source)?;
            let stats = remote.upload_tree(&local, &name, dir).await?;
            eprintln!(
                "pushed {} files, {} dirs, {} bytes",
                stats.files, stats.dirs, stats.bytes
            );
        }
        Commands::Cat { remote: path } => {
            let data = remote.read(path).await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&data).await?;
            stdout.flush().await?;
        }
        Commands::Ls { remote: path } => {
            for name in remote.list(path).await? {
                println!("{name}");
            }
        }
        Commands::Init => {}
    }
    Ok(())
}
