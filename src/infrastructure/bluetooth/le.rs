//! BLE GATT transport over the Nordic UART Service.
//!
//! Connect ordering is a correctness requirement, not cosmetics: services are
//! discovered and notifications subscribed *before* the session is reported
//! connected and the bootstrap sync commands go out. A reply arriving before
//! the subscription completes would be lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::stream::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::infrastructure::bluetooth::framing::{LineReassembler, DEFAULT_PAYLOAD_SIZE};
use crate::infrastructure::bluetooth::protocol::{
    ATT_HEADER_LEN, NUS_NOTIFY_CHAR_UUID, NUS_WRITE_CHAR_UUID, REQUEST_MTU,
};
use crate::infrastructure::bluetooth::transport::{
    LinkEvent, Transport, TransportError, TransportKind,
};

/// LE transport configuration.
#[derive(Debug, Clone)]
pub struct LeConfig {
    /// MTU the platform stack is expected to negotiate. Negotiation happens
    /// inside the host stack during connect, so this carries the value the
    /// firmware is known to grant.
    pub request_mtu: u16,
    /// Ignore `request_mtu` and stay at the 20-byte pre-negotiation payload,
    /// for peers that refuse MTU exchange.
    pub conservative_payload: bool,
    pub connection_timeout: Duration,
}

impl Default for LeConfig {
    fn default() -> Self {
        Self {
            request_mtu: REQUEST_MTU,
            conservative_payload: false,
            connection_timeout: Duration::from_secs(10),
        }
    }
}

impl LeConfig {
    /// Payload bound for one no-response write: `MTU - 3`, flooring at the
    /// unnegotiated default when negotiation is refused or unknown.
    pub fn effective_payload(&self) -> usize {
        let negotiated = self.request_mtu as usize;
        if self.conservative_payload || negotiated < ATT_HEADER_LEN + DEFAULT_PAYLOAD_SIZE {
            DEFAULT_PAYLOAD_SIZE
        } else {
            negotiated - ATT_HEADER_LEN
        }
    }
}

pub struct LeTransport {
    peripheral: Peripheral,
    write_char: Characteristic,
    payload_size: usize,
    connected: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

impl LeTransport {
    /// Connect to a peripheral obtained from a scan result, resolve the NUS
    /// characteristics, and subscribe to notifications. Reassembled frames
    /// are pushed to `link_tx` by a spawned reader task until the stream
    /// ends or the transport is shut down.
    pub async fn connect(
        peripheral: Peripheral,
        config: &LeConfig,
        link_tx: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Self, TransportError> {
        match timeout(config.connection_timeout, peripheral.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(TransportError::ConnectionFailed(e.to_string())),
            Err(_) => return Err(TransportError::ConnectionFailed("timed out".into())),
        }
        info!("LE link established, discovering services");

        peripheral
            .discover_services()
            .await
            .map_err(|e| TransportError::ServiceDiscoveryFailed(e.to_string()))?;

        let characteristics = peripheral.characteristics();
        let write_char = characteristics
            .iter()
            .find(|c| c.uuid == NUS_WRITE_CHAR_UUID)
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound("NUS write"))?;
        let notify_char = characteristics
            .iter()
            .find(|c| c.uuid == NUS_NOTIFY_CHAR_UUID)
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound("NUS notify"))?;

        // Subscribe before anyone can send, so no reply races the descriptor
        // write.
        peripheral
            .subscribe(&notify_char)
            .await
            .map_err(|e| TransportError::SubscriptionFailed(e.to_string()))?;
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| TransportError::SubscriptionFailed(e.to_string()))?;

        let payload_size = config.effective_payload();
        info!("notifications enabled, payload size {payload_size} bytes");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(true));

        let reader_connected = connected.clone();
        tokio::spawn(async move {
            let mut reassembler = LineReassembler::new();
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    delivery = notifications.next() => match delivery {
                        Some(data) if data.uuid == NUS_NOTIFY_CHAR_UUID => {
                            for frame in reassembler.feed(&data.value) {
                                if link_tx.send(LinkEvent::Frame(frame)).is_err() {
                                    // Session is gone.
                                    return;
                                }
                            }
                        }
                        Some(_) => {}
                        None => {
                            reader_connected.store(false, Ordering::SeqCst);
                            let _ = link_tx.send(LinkEvent::Closed);
                            break;
                        }
                    },
                }
            }
            debug!("LE notification loop ended");
        });

        Ok(Self {
            peripheral,
            write_char,
            payload_size,
            connected,
            shutdown_tx,
        })
    }
}

#[async_trait]
impl Transport for LeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Le
    }

    fn max_payload(&self) -> usize {
        self.payload_size
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn write_chunk(&self, chunk: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        // A single rejected GATT write may be transient; link death is
        // reported by the notification stream ending, not latched here.
        self.peripheral
            .write(&self.write_char, chunk, WriteType::WithoutResponse)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    async fn shutdown(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.peripheral.disconnect().await {
            warn!("LE disconnect: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_payload_is_mtu_minus_att_header() {
        let config = LeConfig::default();
        assert_eq!(config.effective_payload(), 244);
    }

    #[test]
    fn refused_negotiation_floors_at_default_payload() {
        let conservative = LeConfig {
            conservative_payload: true,
            ..LeConfig::default()
        };
        assert_eq!(conservative.effective_payload(), DEFAULT_PAYLOAD_SIZE);

        let tiny = LeConfig {
            request_mtu: 23,
            ..LeConfig::default()
        };
        assert_eq!(tiny.effective_payload(), DEFAULT_PAYLOAD_SIZE);
    }
}
