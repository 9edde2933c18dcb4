//! `sbx watch`: print directory changes.

use anyhow::Result;
use sbx::nonblocking::AsyncFilesystem;
use sbx::{Client, WatchEvent};

/// Arguments for `sbx watch`.
#[derive(clap::Args)]
pub struct WatchArgs {
    /// Watch subdirectories too.
    #[arg(short = 'r', long)]
    pub recursive: bool,

    /// Directory inside the sandbox.
    pub path: String,
}

pub async fn watch(client: &Client, args: WatchArgs) -> Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<sbx::Result<WatchEvent>>();
    let handle = AsyncFilesystem::new(client)
        .watch_dir(args.path, args.recursive, tx)
        .await?;

    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(Ok(event)) => println!("{:<6} {}", kind(&event), event.path()),
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                handle.stop();
                return Ok(());
            }
        }
    }
}

/// Short label for an event kind.
const fn kind(event: &WatchEvent) -> &'static str {
    match event {
        WatchEvent::Create { .. } => "CREATE",
        WatchEvent::Write { .. } => "WRITE",
        WatchEvent::Remove { .. } => "REMOVE",
        WatchEvent::Rename { .. } => "RENAME",
        WatchEvent::Chmod { .. } => "CHMOD",
        _ => "OTHER",
    }
}
