//! TCP emulation of the tap link. Each TCP connection is one "tap"; every exchange
//! is a length-prefixed request frame answered by one length-prefixed response.
//!
//! Frame: [len u32 BE][bytes]. Frames over MAX_FRAME are refused.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use tapclip_core::{
    LinkError, Outcome, Receiver, ReceiverContext, ReceiverPhase, SendSession, Transport,
    TransportCapability,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

pub const MAX_FRAME: u32 = 16 * 1024 * 1024;
/// Either end gives up on a peer that stays silent this long mid-exchange.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

fn too_large(len: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("frame of {len} bytes exceeds {MAX_FRAME}"),
    )
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    match r.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len);
    if len > MAX_FRAME {
        return Err(too_large(len));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &[u8]) -> io::Result<()> {
    w.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    w.write_all(frame).await?;
    w.flush().await
}

/// Accept tap connections forever; each gets a fresh receiver over the shared stores.
pub async fn run_listener(addr: String, ctx: Arc<ReceiverContext>) -> io::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "waiting for taps");
    loop {
        let (stream, peer) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, peer, ctx, EXCHANGE_TIMEOUT).await {
                tracing::debug!(%peer, error = %e, "tap connection error");
            }
        });
    }
}

/// Run one tap until the sender hangs up, goes quiet for `idle`, or the receiver
/// refuses it. Dropping the stream closes the connection.
async fn serve_connection<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    peer: SocketAddr,
    ctx: Arc<ReceiverContext>,
    idle: Duration,
) -> io::Result<()> {
    tracing::debug!(%peer, "tap connected");
    let mut receiver = Receiver::new(ctx);
    loop {
        let frame = match tokio::time::timeout(idle, read_frame(&mut stream)).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                tracing::debug!(%peer, "tap went quiet");
                break;
            }
        };
        // The receiver does blocking file I/O.
        let (back, reply) = tokio::task::spawn_blocking(move || {
            let reply = receiver.process(&frame);
            (receiver, reply)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        receiver = back;
        write_frame(&mut stream, &reply).await?;
        if receiver.phase() == ReceiverPhase::Failed {
            tracing::debug!(%peer, "closing refused tap");
            break;
        }
    }
    tracing::debug!(%peer, phase = ?receiver.phase(), "tap ended");
    Ok(())
}

/// Sender side of one tap: a blocking TCP stream.
pub struct TcpLink {
    stream: TcpStream,
    capacity: u32,
    /// Exchanges left before the emulated tap ends; `None` for unlimited.
    budget: Option<u32>,
}

impl TcpLink {
    pub fn connect(addr: &str, capacity: u32, tap_exchanges: u32) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(EXCHANGE_TIMEOUT))?;
        stream.set_write_timeout(Some(EXCHANGE_TIMEOUT))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            capacity,
            budget: (tap_exchanges > 0).then_some(tap_exchanges),
        })
    }
}

impl TransportCapability for TcpLink {
    fn max_frame_bytes(&self) -> u32 {
        self.capacity
    }
}

impl Transport for TcpLink {
    fn exchange(&mut self, frame: &[u8]) -> Result<Vec<u8>, LinkError> {
        if let Some(left) = self.budget.as_mut() {
            if *left == 0 {
                let _ = self.stream.shutdown(std::net::Shutdown::Both);
                return Err(LinkError::ConnectionLost);
            }
            *left -= 1;
        }
        self.stream.write_all(&(frame.len() as u32).to_be_bytes())?;
        self.stream.write_all(frame)?;
        let mut len = [0u8; 4];
        if let Err(e) = self.stream.read_exact(&mut len) {
            return Err(match e.kind() {
                io::ErrorKind::UnexpectedEof => LinkError::ConnectionLost,
                _ => e.into(),
            });
        }
        let len = u32::from_be_bytes(len);
        if len > MAX_FRAME {
            return Err(too_large(len).into());
        }
        let mut reply = vec![0u8; len as usize];
        self.stream.read_exact(&mut reply)?;
        Ok(reply)
    }
}

/// Sender dialing parameters.
#[derive(Debug, Clone)]
pub struct Dial {
    pub addr: String,
    pub capacity: u32,
    pub tap_exchanges: u32,
    pub redial: Duration,
}

/// Keep dialing until the session finishes. Runs on a blocking thread.
pub fn drive_send(session: Arc<SendSession>, dial: Dial) -> Outcome {
    let Dial {
        addr,
        capacity,
        tap_exchanges,
        redial,
    } = dial;
    loop {
        if let Some(outcome) = session.outcome() {
            return outcome;
        }
        match TcpLink::connect(&addr, capacity, tap_exchanges) {
            Ok(mut link) => {
                if let Some(outcome) = session.on_connection(&mut link) {
                    return outcome;
                }
            }
            Err(e) => tracing::trace!(%addr, error = %e, "receiver not reachable"),
        }
        if let Some(outcome) = session.wait(redial) {
            return outcome;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{DownloadSink, FileClipboard};
    use std::path::PathBuf;
    use tapclip_core::integrity::digest_of;
    use tapclip_core::protocol::{encode_first_message, Handshake, PayloadHeader, Response};
    use tapclip_core::{Config, PayloadKind, StoreRegistry};

    struct Desk {
        dir: PathBuf,
        config: Config,
        ctx: Arc<ReceiverContext>,
    }

    impl Desk {
        fn new(tag: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("tapclip-link-{tag}-{}", std::process::id()));
            let config = Config {
                cache_dir: dir.join("cache"),
                ..Config::default()
            };
            let stores = Arc::new(StoreRegistry::open(&config.cache_dir).unwrap());
            let ctx = Arc::new(
                ReceiverContext::new(
                    &config,
                    stores,
                    Arc::new(FileClipboard::new(dir.join("clipboard.txt"))),
                    Arc::new(DownloadSink::new(dir.join("downloads"))),
                )
                .unwrap(),
            );
            Self { dir, config, ctx }
        }

        fn first_frame(&self, min_version: u8, max_version: u8) -> Vec<u8> {
            let data = vec![7u8; 3000];
            let header = PayloadHeader {
                kind: PayloadKind::File,
                total_size: data.len() as u32,
                max_chunk_len: 1000,
                digest: digest_of(&data),
                file_name: Some("big.bin".into()),
            };
            let hs = Handshake::new(self.config.aid_bytes().unwrap(), min_version, max_version);
            encode_first_message(&hs, &header).unwrap()
        }
    }

    impl Drop for Desk {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[tokio::test]
    async fn refused_handshake_closes_the_tap() {
        let desk = Desk::new("refuse");
        let (mut tap, far) = tokio::io::duplex(4096);
        let serve = tokio::spawn(serve_connection(far, peer(), desk.ctx.clone(), EXCHANGE_TIMEOUT));

        write_frame(&mut tap, &desk.first_frame(2, 3)).await.unwrap();
        let reply = read_frame(&mut tap).await.unwrap().unwrap();
        assert_eq!(Response::decode(&reply).unwrap(), Response::Failed);

        // A well-formed retry on the same connection finds it closed.
        let _ = write_frame(&mut tap, &desk.first_frame(1, 1)).await;
        assert_eq!(read_frame(&mut tap).await.unwrap(), None);
        serve.await.unwrap().unwrap();
        assert!(desk.ctx.stores().is_empty());
    }

    #[tokio::test]
    async fn quiet_tap_is_dropped_and_store_kept() {
        let desk = Desk::new("quiet");
        let (mut tap, far) = tokio::io::duplex(4096);
        let serve = tokio::spawn(serve_connection(
            far,
            peer(),
            desk.ctx.clone(),
            Duration::from_millis(50),
        ));

        write_frame(&mut tap, &desk.first_frame(1, 1)).await.unwrap();
        let reply = read_frame(&mut tap).await.unwrap().unwrap();
        assert!(matches!(
            Response::decode(&reply).unwrap(),
            Response::Continue { next_chunk: 0, .. }
        ));
        // Say nothing more; the receiver side gives up on its own.
        serve.await.unwrap().unwrap();
        assert_eq!(read_frame(&mut tap).await.unwrap(), None);
        assert_eq!(desk.ctx.stores().pending().len(), 1);
    }

    #[tokio::test]
    async fn frames_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"\x90\x00").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        drop(a);
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(b"\x90\x00".to_vec()));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frame_refused() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME + 1).to_be_bytes()).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
