//! Classic Bluetooth transport: RFCOMM under the Serial Port Profile.
//!
//! The stream is byte-oriented with no per-write size bound, so the writer
//! sends a whole command in one write and no chunk pacing applies. Inbound
//! bytes still arrive at arbitrary boundaries and go through the same line
//! reassembler as the LE path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use crate::infrastructure::bluetooth::framing::LineReassembler;
use crate::infrastructure::bluetooth::transport::{
    LinkEvent, Transport, TransportError, TransportKind,
};

/// RFCOMM channel carrying the SPP service on the device firmware.
pub const DEFAULT_RFCOMM_CHANNEL: u8 = 1;

#[derive(Debug, Clone)]
pub struct ClassicConfig {
    pub channel: u8,
    pub connection_timeout: Duration,
}

impl Default for ClassicConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_RFCOMM_CHANNEL,
            connection_timeout: Duration::from_secs(10),
        }
    }
}

/// Pump a readable half into the session's link channel until the peer
/// closes, a read fails, or shutdown is signalled. Factored out of the
/// platform socket so the loop is testable with an in-memory duplex.
pub(crate) async fn run_read_loop<R>(
    mut reader: R,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut reassembler = LineReassembler::new();
    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("classic link closed by peer");
                    connected.store(false, Ordering::SeqCst);
                    let _ = link_tx.send(LinkEvent::Closed);
                    break;
                }
                Ok(n) => {
                    for frame in reassembler.feed(&buf[..n]) {
                        if link_tx.send(LinkEvent::Frame(frame)).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!("classic read error: {e}");
                    connected.store(false, Ordering::SeqCst);
                    let _ = link_tx.send(LinkEvent::Closed);
                    break;
                }
            },
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::ClassicTransport;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    use bluer::rfcomm::{SocketAddr, Stream};
    use bluer::Address;
    use tokio::io::{AsyncWriteExt, WriteHalf};
    use tokio::time::timeout;
    use tracing::info;

    pub struct ClassicTransport {
        writer: Mutex<WriteHalf<Stream>>,
        connected: Arc<AtomicBool>,
        shutdown_tx: watch::Sender<bool>,
    }

    impl ClassicTransport {
        /// Connect an RFCOMM socket to `address` and spawn the read loop.
        /// `address` is the colon-separated form reported by discovery.
        pub async fn connect(
            address: &str,
            config: &ClassicConfig,
            link_tx: mpsc::UnboundedSender<LinkEvent>,
        ) -> Result<Self, TransportError> {
            let addr: Address = address
                .parse()
                .map_err(|_| TransportError::DeviceNotFound(address.to_string()))?;
            let target = SocketAddr::new(addr, config.channel);

            let stream = match timeout(config.connection_timeout, Stream::connect(target)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(TransportError::ConnectionFailed(e.to_string())),
                Err(_) => return Err(TransportError::ConnectionFailed("timed out".into())),
            };
            info!("RFCOMM link established on channel {}", config.channel);

            let (reader, writer) = tokio::io::split(stream);
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let connected = Arc::new(AtomicBool::new(true));

            tokio::spawn(run_read_loop(
                reader,
                link_tx,
                shutdown_rx,
                connected.clone(),
            ));

            Ok(Self {
                writer: Mutex::new(writer),
                connected,
                shutdown_tx,
            })
        }
    }

    #[async_trait]
    impl Transport for ClassicTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Classic
        }

        fn max_payload(&self) -> usize {
            usize::MAX
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn write_chunk(&self, chunk: &[u8]) -> Result<(), TransportError> {
            if !self.is_connected() {
                return Err(TransportError::NotConnected);
            }
            let mut writer = self.writer.lock().await;
            writer.write_all(chunk).await.map_err(|e| {
                self.connected.store(false, Ordering::SeqCst);
                TransportError::WriteFailed(e.to_string())
            })
        }

        async fn shutdown(&self) {
            if !self.connected.swap(false, Ordering::SeqCst) {
                return;
            }
            let _ = self.shutdown_tx.send(true);
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!("classic shutdown: {e}");
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use fallback::ClassicTransport;

#[cfg(not(target_os = "linux"))]
mod fallback {
    use super::*;

    /// RFCOMM sockets need bluez; other platforms get a typed refusal so
    /// session code stays cfg-free.
    pub struct ClassicTransport;

    impl ClassicTransport {
        pub async fn connect(
            _address: &str,
            _config: &ClassicConfig,
            _link_tx: mpsc::UnboundedSender<LinkEvent>,
        ) -> Result<Self, TransportError> {
            Err(TransportError::Unsupported("classic"))
        }
    }

    #[async_trait]
    impl Transport for ClassicTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Classic
        }

        fn max_payload(&self) -> usize {
            usize::MAX
        }

        fn is_connected(&self) -> bool {
            false
        }

        async fn write_chunk(&self, _chunk: &[u8]) -> Result<(), TransportError> {
            Err(TransportError::Unsupported("classic"))
        }

        async fn shutdown(&self) {}
    }
}
