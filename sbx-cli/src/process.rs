//! Process commands: run, connect, ps, kill.

use anyhow::{Context, Result, bail};
use sbx::nonblocking::{AsyncCommandHandle, AsyncCommands};
use sbx::{
    Client, ConnectOptions, Error, Output, ProcessConfig, ProcessControl, ProcessSelector,
    PtySize, Signal, StartOptions,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::OutputFormat;

/// Arguments for `sbx run`.
///
/// Usage: `sbx run [OPTIONS] COMMAND [ARG...]`
#[derive(clap::Args)]
#[command(trailing_var_arg = true)]
pub struct RunArgs {
    /// Set environment variables.
    #[arg(short = 'e', long = "env")]
    pub env: Vec<String>,

    /// Working directory inside the sandbox.
    #[arg(short = 'w', long)]
    pub workdir: Option<String>,

    /// Allocate a pseudo-TTY.
    #[arg(short = 't', long)]
    pub tty: bool,

    /// Forward local stdin to the process.
    #[arg(short = 'i', long)]
    pub interactive: bool,

    /// Tag to find the process by later.
    #[arg(long)]
    pub tag: Option<String>,

    /// Command and arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub command: Vec<String>,
}

/// Arguments for `sbx connect`.
#[derive(clap::Args)]
pub struct ConnectArgs {
    /// Forward local stdin to the process.
    #[arg(short = 'i', long)]
    pub interactive: bool,

    /// Process id, or `tag:<name>`.
    pub target: String,
}

/// Arguments for `sbx ps`.
#[derive(clap::Args)]
pub struct PsArgs {
    /// Output format.
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for `sbx kill`.
#[derive(clap::Args)]
pub struct KillArgs {
    /// Signal to send (KILL or TERM).
    #[arg(short = 's', long, default_value = "KILL")]
    pub signal: String,

    /// Process ids, or `tag:<name>`.
    #[arg(required = true, num_args = 1..)]
    pub targets: Vec<String>,
}

pub async fn run(client: &Client, args: RunArgs) -> Result<i32> {
    let (cmd, rest) = args
        .command
        .split_first()
        .context("missing command")?;
    let mut config = ProcessConfig::new(cmd).args(rest);
    for kv in &args.env {
        let (k, v) = kv
            .split_once('=')
            .with_context(|| format!("invalid env '{kv}' (expected KEY=VALUE)"))?;
        config = config.env(k, v);
    }
    if let Some(dir) = args.workdir {
        config = config.cwd(dir);
    }

    let mut opts = StartOptions::new().stdin(args.interactive);
    if args.tty {
        opts = opts.pty(terminal_size());
    }
    if let Some(tag) = args.tag {
        opts = opts.tag(tag);
    }

    let handle = AsyncCommands::new(client).start(config, opts).await?;
    debug!(pid = handle.pid(), "process started");
    attach(handle, args.interactive).await
}

pub async fn connect(client: &Client, args: ConnectArgs) -> Result<i32> {
    let selector = parse_selector(&args.target)?;
    let handle = AsyncCommands::new(client)
        .connect(selector, ConnectOptions::new())
        .await
        .with_context(|| format!("connect to {}", args.target))?;
    attach(handle, args.interactive).await
}

pub async fn ps(client: &Client, args: PsArgs) -> Result<()> {
    let list = AsyncCommands::new(client).list().await?;

    if matches!(args.format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    if list.is_empty() {
        println!("No processes.");
        return Ok(());
    }
    println!("{:<10} {:<16} COMMAND", "PID", "TAG");
    for p in &list {
        let mut command = p.config.cmd.clone();
        for arg in &p.config.args {
            command.push(' ');
            command.push_str(arg);
        }
        println!(
            "{:<10} {:<16} {command}",
            p.pid,
            p.tag.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

pub async fn kill(client: &Client, args: KillArgs) -> Result<()> {
    let commands = AsyncCommands::new(client);
    let signal = args
        .signal
        .parse::<Signal>()
        .map_err(anyhow::Error::msg)?;
    let mut failed = 0;
    for target in &args.targets {
        let selector = parse_selector(target)?;
        let outcome = match signal {
            Signal::Sigkill => commands.kill(selector).await,
            other => commands.signal(selector, other).await.map(|()| true),
        };
        match outcome {
            Ok(true) => println!("{target}"),
            Ok(false) => {
                eprintln!("sbx: no such process: {target}");
                failed += 1;
            }
            Err(e) => {
                eprintln!("sbx: {target}: {e}");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{failed} process(es) could not be signalled");
    }
    Ok(())
}

/// Streams output until the process ends; returns its exit code.
async fn attach(mut handle: AsyncCommandHandle, interactive: bool) -> Result<i32> {
    let control = handle.control();
    if interactive {
        tokio::spawn(forward_stdin(control.clone()));
    }
    tokio::spawn(kill_on_interrupt(control));

    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    while let Some(chunk) = handle.next_output().await {
        match chunk {
            Output::Stderr(b) => stderr.write_all(&b).await?,
            other => {
                stdout.write_all(other.bytes()).await?;
                stdout.flush().await?;
            }
        }
    }

    match handle.wait().await {
        Ok(result) => Ok(result.exit_code),
        Err(Error::CommandExit(exit)) => {
            if let Some(msg) = &exit.error {
                debug!(%msg, "process reported an error");
            }
            Ok(exit.exit_code)
        }
        Err(e) => Err(e.into()),
    }
}

/// Copies local stdin to the process and closes its stdin at EOF.
async fn forward_stdin(control: ProcessControl) {
    if let Err(e) = pipe_stdin(control).await {
        debug!(error = %e, "stdin forwarding stopped");
    }
}

async fn pipe_stdin(control: ProcessControl) -> Result<()> {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; 8192];
    loop {
        let n = stdin.read(&mut buf).await?;
        let ctl = control.clone();
        if n == 0 {
            tokio::task::spawn_blocking(move || ctl.close_stdin()).await??;
            return Ok(());
        }
        let chunk = buf[..n].to_vec();
        tokio::task::spawn_blocking(move || ctl.send_stdin(&chunk)).await??;
    }
}

/// Kills the process on Ctrl-C; output keeps streaming until it ends.
async fn kill_on_interrupt(control: ProcessControl) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    let pid = control.pid();
    match tokio::task::spawn_blocking(move || control.kill()).await {
        Ok(Ok(_)) => debug!(pid, "killed on interrupt"),
        Ok(Err(e)) => eprintln!("sbx: kill {pid}: {e}"),
        Err(e) => eprintln!("sbx: kill {pid}: {e}"),
    }
}

/// Parses `1234` or `tag:<name>`.
fn parse_selector(target: &str) -> Result<ProcessSelector> {
    if let Some(tag) = target.strip_prefix("tag:") {
        return Ok(ProcessSelector::Tag(tag.to_owned()));
    }
    let pid = target
        .parse()
        .with_context(|| format!("invalid process id '{target}'"))?;
    Ok(ProcessSelector::Pid(pid))
}

/// Local terminal size from `COLUMNS`/`LINES`, 80x24 otherwise.
fn terminal_size() -> PtySize {
    let dim = |var: &str, default: u32| {
        std::env::var(var)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    };
    PtySize {
        cols: dim("COLUMNS", 80),
        rows: dim("LINES", 24),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors() {
        assert_eq!(parse_selector("42").ok(), Some(ProcessSelector::Pid(42)));
        assert_eq!(
            parse_selector("tag:web").ok(),
            Some(ProcessSelector::Tag("web".into()))
        );
        assert!(parse_selector("web").is_err());
    }
}
