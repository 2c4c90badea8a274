//! Transport abstraction over the two Bluetooth link types.
//!
//! A transport owns the physical connection. Inbound bytes are reassembled
//! into frames inside the transport's reader task and handed to the session
//! as [`LinkEvent`]s; outbound writes go through [`Transport::write_chunk`],
//! serialized by the session's writer task.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// BLE GATT (Nordic UART Service).
    Le,
    /// Classic Bluetooth RFCOMM (Serial Port Profile).
    Classic,
}

impl TransportKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Le => "BLE",
            Self::Classic => "Classic",
        }
    }
}

/// Errors from the transport layer. None of these are fatal to the process:
/// the session reports them, drops to Disconnected, and the caller may retry.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    ConnectionFailed(String),

    #[error("service discovery failed: {0}")]
    ServiceDiscoveryFailed(String),

    #[error("characteristic not found: {0}")]
    CharacteristicNotFound(&'static str),

    #[error("failed to subscribe to notifications: {0}")]
    SubscriptionFailed(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error("no Bluetooth adapter available")]
    AdapterNotAvailable,

    #[error("device not found in scan results: {0}")]
    DeviceNotFound(String),

    #[error("{0} transport is not supported on this platform")]
    Unsupported(&'static str),
}

/// Link-level notifications from a transport's reader task to its session.
#[derive(Debug)]
pub enum LinkEvent {
    /// One complete reassembled frame, newline stripped.
    Frame(String),
    /// The link dropped or the reader loop ended.
    Closed,
}

/// Capability surface shared by the LE and classic transports.
///
/// Connection establishment is done by the concrete constructors since the
/// two variants take different targets (a scan result vs. a socket address).
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Effective payload bound for one physical write. Recomputed by the
    /// writer at send time; unbounded (`usize::MAX`) for the classic link.
    fn max_payload(&self) -> usize;

    fn is_connected(&self) -> bool;

    /// Write one chunk on the link. Callers serialize writes; two concurrent
    /// writers on the same link are a caller error.
    async fn write_chunk(&self, chunk: &[u8]) -> Result<(), TransportError>;

    /// Stop the reader loop and release the physical link. Idempotent.
    async fn shutdown(&self);
}
