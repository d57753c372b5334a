// tapclip Linux host: receive daemon and one-shot sends over the TCP tap emulation.

mod config;
mod host;
mod link;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tapclip_core::{
    ClipPayload, Outcome, PayloadSource, ReceiverContext, SendSession, Sender, SenderSlot,
    StoreRegistry, Watchdog,
};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: tapclip-linux [listen | send-text <text> | send-clipboard | send-file <path> | pending | purge | --version]";

enum Command {
    Listen,
    SendText(String),
    SendClipboard,
    SendFile(PathBuf),
    Pending,
    Purge,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Option<Command>> {
    let cmd = match args.next().as_deref() {
        None | Some("listen") => Command::Listen,
        Some("--version") | Some("-V") => return Ok(None),
        Some("send-text") => Command::SendText(args.next().context(USAGE)?),
        Some("send-clipboard") => Command::SendClipboard,
        Some("send-file") => Command::SendFile(args.next().context(USAGE)?.into()),
        Some("pending") => Command::Pending,
        Some("purge") => Command::Purge,
        Some(other) => bail!("unknown command {other:?}\n{USAGE}"),
    };
    Ok(Some(cmd))
}

fn main() -> anyhow::Result<()> {
    let Some(cmd) = parse_args(std::env::args().skip(1))? else {
        println!("tapclip-linux {}", VERSION);
        return Ok(());
    };

    let cfg = config::load()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cmd {
        Command::Listen => listen(&cfg),
        Command::SendText(text) => send(&cfg, PayloadSource::from_clip(&ClipPayload::text(text))?),
        Command::SendClipboard => {
            let clipboard = host::FileClipboard::new(cfg.clipboard_file.clone());
            let Some(sender) = Sender::for_clipboard(&cfg.core, &clipboard)? else {
                bail!("clipboard file {} is empty", cfg.clipboard_file.display());
            };
            send_with(&cfg, sender)
        }
        Command::SendFile(path) => send(
            &cfg,
            PayloadSource::from_file(&path).with_context(|| format!("cannot send {}", path.display()))?,
        ),
        Command::Pending => {
            let stores = StoreRegistry::open(&cfg.core.cache_dir)?;
            for p in stores.pending() {
                println!(
                    "{}  {:?}  {}/{}  {}",
                    p.digest,
                    p.kind,
                    p.bytes_stored,
                    p.total_size,
                    p.file_name.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        Command::Purge => {
            let stores = StoreRegistry::open(&cfg.core.cache_dir)?;
            let n = stores.evict_idle(Duration::ZERO);
            println!("removed {n} partial transfers");
            Ok(())
        }
    }
}

fn listen(cfg: &config::Config) -> anyhow::Result<()> {
    let stores = Arc::new(
        StoreRegistry::open(&cfg.core.cache_dir)
            .with_context(|| format!("opening cache {}", cfg.core.cache_dir.display()))?,
    );
    let ctx = Arc::new(ReceiverContext::new(
        &cfg.core,
        stores.clone(),
        Arc::new(host::FileClipboard::new(cfg.clipboard_file.clone())),
        Arc::new(host::DownloadSink::new(cfg.download_dir.clone())),
    )?);
    let stale_after = Duration::from_secs(cfg.stale_after_secs);
    let addr = cfg.listen.clone();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let listener = tokio::spawn(link::run_listener(addr, ctx));
        tokio::spawn(async move {
            let mut every = tokio::time::interval(Duration::from_secs(3600));
            loop {
                every.tick().await;
                evict_stale(stores.clone(), stale_after).await;
            }
        });
        tokio::select! {
            res = listener => res??,
            res = shutdown_signal() => res?,
        }
        tracing::info!("shutting down");
        anyhow::Ok(())
    })
}

/// Drop partial receives idle longer than `stale_after`. Deletes files, so it runs
/// off the runtime threads.
async fn evict_stale(stores: Arc<StoreRegistry>, stale_after: Duration) -> usize {
    match tokio::task::spawn_blocking(move || stores.evict_idle(stale_after)).await {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(error = %e, "eviction task failed");
            0
        }
    }
}

fn send(cfg: &config::Config, source: PayloadSource) -> anyhow::Result<()> {
    send_with(cfg, Sender::from_config(&cfg.core, source)?)
}

fn send_with(cfg: &config::Config, sender: Sender) -> anyhow::Result<()> {
    let slot = Arc::new(SenderSlot::new());
    let session = SendSession::start(
        &slot,
        sender,
        Arc::new(host::LogProgress),
        Watchdog::from_config(&cfg.core),
    )?;
    let dial = link::Dial {
        addr: cfg.connect.clone(),
        capacity: cfg.link_capacity,
        tap_exchanges: cfg.tap_exchanges,
        redial: Duration::from_millis(cfg.redial_ms),
    };

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(async {
        let driver = session.clone();
        let drive = tokio::task::spawn_blocking(move || link::drive_send(driver, dial));
        tokio::select! {
            res = drive => anyhow::Ok(res?),
            res = shutdown_signal() => {
                res?;
                session.cancel();
                Ok(Outcome::Cancelled)
            }
        }
    })?;
    match outcome {
        Outcome::Completed => Ok(()),
        other => bail!("send failed: {other:?}"),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn commands_parse() {
        assert!(matches!(parse_args(args(&[])).unwrap(), Some(Command::Listen)));
        assert!(parse_args(args(&["-V"])).unwrap().is_none());
        assert!(matches!(
            parse_args(args(&["send-text", "hi"])).unwrap(),
            Some(Command::SendText(t)) if t == "hi"
        ));
        assert!(parse_args(args(&["send-file"])).is_err());
        assert!(parse_args(args(&["bogus"])).is_err());
    }

    #[tokio::test]
    async fn stale_receives_evicted() {
        use tapclip_core::integrity::digest_of;
        use tapclip_core::protocol::PayloadHeader;

        let dir = std::env::temp_dir().join(format!("tapclip-evict-{}", std::process::id()));
        let stores = Arc::new(StoreRegistry::open(&dir).unwrap());
        let data = vec![1u8; 50];
        stores
            .open_or_create(&PayloadHeader {
                kind: tapclip_core::PayloadKind::File,
                total_size: data.len() as u32,
                max_chunk_len: 10,
                digest: digest_of(&data),
                file_name: Some("half.bin".into()),
            })
            .unwrap();
        assert_eq!(evict_stale(stores.clone(), Duration::from_secs(3600)).await, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(evict_stale(stores.clone(), Duration::from_millis(1)).await, 1);
        assert!(stores.is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
