//! BLE discovery.
//!
//! Scans for peripherals advertising the Nordic UART Service and reports
//! them as [`AppEvent::DeviceFound`]. Discovered peripherals are retained by
//! address so a session can connect to one after the scan stops.

use std::collections::HashMap;
use std::sync::Arc;

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::models::{AppEvent, ScannedDevice};
use crate::infrastructure::bluetooth::protocol::NUS_SERVICE_UUID;
use crate::infrastructure::bluetooth::transport::TransportError;

pub struct Scanner {
    adapter: Adapter,
    devices: Arc<RwLock<HashMap<String, Peripheral>>>,
    stop_tx: Option<watch::Sender<bool>>,
}

impl Scanner {
    /// Bind to the first available Bluetooth adapter.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new()
            .await
            .map_err(|_| TransportError::AdapterNotAvailable)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|_| TransportError::AdapterNotAvailable)?
            .into_iter()
            .next()
            .ok_or(TransportError::AdapterNotAvailable)?;
        Ok(Self {
            adapter,
            devices: Arc::new(RwLock::new(HashMap::new())),
            stop_tx: None,
        })
    }

    /// Start scanning. `show_all` disables the service filter, for debugging
    /// peers whose advertisement omits the service UUID. `last_connected` is
    /// the remembered peer address used to flag the matching result.
    pub async fn start(
        &mut self,
        events: mpsc::UnboundedSender<AppEvent>,
        show_all: bool,
        last_connected: Option<String>,
    ) -> Result<(), TransportError> {
        let filter = if show_all {
            ScanFilter::default()
        } else {
            ScanFilter {
                services: vec![NUS_SERVICE_UUID],
            }
        };

        let mut adapter_events = self
            .adapter
            .events()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        self.adapter
            .start_scan(filter)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        info!(show_all, "scan started");

        let (stop_tx, mut stop_rx) = watch::channel(false);
        self.stop_tx = Some(stop_tx);

        let adapter = self.adapter.clone();
        let devices = self.devices.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    event = adapter_events.next() => {
                        let Some(event) = event else { break };
                        if let CentralEvent::DeviceDiscovered(id) = event {
                            let Ok(peripheral) = adapter.peripheral(&id).await else {
                                continue;
                            };
                            let properties = match peripheral.properties().await {
                                Ok(p) => p,
                                Err(e) => {
                                    debug!("properties for {id:?}: {e}");
                                    None
                                }
                            };
                            let address = peripheral.address().to_string();
                            let (name, rssi) = properties
                                .map(|p| (p.local_name, p.rssi))
                                .unwrap_or((None, None));

                            devices.write().await.insert(address.clone(), peripheral);

                            let device = ScannedDevice {
                                name: name.unwrap_or_else(|| "(unnamed)".to_string()),
                                last_connected: last_connected.as_deref()
                                    == Some(address.as_str()),
                                address,
                                signal_strength: rssi,
                            };
                            if events.send(AppEvent::DeviceFound(device)).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            debug!("scan event loop ended");
        });
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("stop scan: {e}");
        }
    }

    /// Look up a previously discovered peripheral by address.
    pub async fn peripheral(&self, address: &str) -> Result<Peripheral, TransportError> {
        self.devices
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::DeviceNotFound(address.to_string()))
    }

    /// Addresses discovered so far, for pick-first connection flows.
    pub async fn discovered_addresses(&self) -> Vec<String> {
        self.devices.read().await.keys().cloned().collect()
    }
}
