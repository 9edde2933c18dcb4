//! CLI for running and watching processes in a remote sandbox.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod process;
mod watch;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use sbx::{Client, Codec, Gzip};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sbx", version, about = "Run and watch processes in a remote sandbox")]
struct Cli {
    /// Base URL of the sandbox agent.
    #[arg(long, env = "SBX_URL", default_value = "http://localhost:49983", global = true)]
    url: String,

    /// Payload codec.
    #[arg(long, default_value = "json", global = true)]
    codec: CodecArg,

    /// Compress request and response payloads with gzip.
    #[arg(long, global = true)]
    gzip: bool,

    /// Unary request timeout in seconds (0 disables it).
    #[arg(long, default_value_t = 60, global = true)]
    timeout: u64,

    /// Extra request header (format: name=value).
    #[arg(short = 'H', long = "header", global = true)]
    headers: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a command in the sandbox and stream its output.
    Run(process::RunArgs),

    /// Attach to a running process.
    Connect(process::ConnectArgs),

    /// List running processes.
    #[command(visible_alias = "ls")]
    Ps(process::PsArgs),

    /// Signal a running process.
    Kill(process::KillArgs),

    /// Print changes under a sandbox directory until interrupted.
    Watch(watch::WatchArgs),

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Payload codec selectable on the command line.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CodecArg {
    /// JSON payloads.
    Json,
    /// Compact binary payloads.
    Postcard,
}

/// Output format for list commands.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SBX_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().dispatch().await {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("sbx: {e:#}");
            std::process::exit(1);
        }
    }
}

impl Cli {
    /// Runs the subcommand; returns the exit status to propagate.
    async fn dispatch(self) -> Result<i32> {
        if let Command::Completion { shell } = self.command {
            clap_complete::generate(shell, &mut Self::command(), "sbx", &mut std::io::stdout());
            return Ok(0);
        }
        let client = self.client()?;
        match self.command {
            Command::Run(args) => process::run(&client, args).await,
            Command::Connect(args) => process::connect(&client, args).await,
            Command::Ps(args) => process::ps(&client, args).await.map(|()| 0),
            Command::Kill(args) => process::kill(&client, args).await.map(|()| 0),
            Command::Watch(args) => watch::watch(&client, args).await.map(|()| 0),
            Command::Completion { .. } => Ok(0),
        }
    }

    /// Builds a client from the global options.
    fn client(&self) -> Result<Client> {
        let codec = match self.codec {
            CodecArg::Json => Codec::Json,
            CodecArg::Postcard => Codec::Postcard,
        };
        let timeout = (self.timeout > 0).then(|| Duration::from_secs(self.timeout));
        let mut builder = Client::builder(&self.url)
            .codec(codec)
            .request_timeout(timeout);
        if self.gzip {
            builder = builder.compressor(Gzip::default());
        }
        for h in &self.headers {
            let (name, value) = h
                .split_once('=')
                .with_context(|| format!("invalid header '{h}' (expected name=value)"))?;
            builder = builder.header(name.trim(), value.trim());
        }
        builder
            .build()
            .with_context(|| format!("invalid sandbox url '{}'", self.url))
    }
}
