//! Connection session: owns one transport plus the writer and pump tasks
//! that serialize outbound commands and decode inbound frames.
//!
//! All outbound traffic funnels through a single writer task per session, so
//! chunks of overlapping `send` calls can never interleave on the wire. The
//! pump task turns reassembled frames into typed [`DeviceEvent`]s, folds them
//! into live state, and persists configuration echoes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::models::{
    AppEvent, ConnectionStatus, DeviceEvent, LiveState, MessageSeverity, StatusMessage,
};
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::classic::{ClassicConfig, ClassicTransport};
use crate::infrastructure::bluetooth::framing::{chunks, normalize_command, CHUNK_PACING};
use crate::infrastructure::bluetooth::le::{LeConfig, LeTransport};
use crate::infrastructure::bluetooth::protocol::{dispatch, Command, BOOTSTRAP_DELAY_MS};
use crate::infrastructure::bluetooth::scanner::Scanner;
use crate::infrastructure::bluetooth::transport::{
    LinkEvent, Transport, TransportError, TransportKind,
};

/// Commands queued but not yet written. Beyond this the session sheds the
/// newest command instead of stalling the caller.
const SEND_QUEUE_DEPTH: usize = 32;

pub struct Session {
    kind: Mutex<TransportKind>,
    status: Arc<Mutex<ConnectionStatus>>,
    settings: Arc<Mutex<SettingsService>>,
    events: mpsc::UnboundedSender<AppEvent>,
    live: Arc<Mutex<LiveState>>,
    send_tx: Mutex<Option<mpsc::Sender<String>>>,
    transport: tokio::sync::Mutex<Option<Arc<dyn Transport>>>,
}

impl Session {
    pub fn new(
        settings: Arc<Mutex<SettingsService>>,
        events: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            kind: Mutex::new(TransportKind::Le),
            status: Arc::new(Mutex::new(ConnectionStatus::Disconnected)),
            settings,
            events,
            live: Arc::new(Mutex::new(LiveState::default())),
            send_tx: Mutex::new(None),
            transport: tokio::sync::Mutex::new(None),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn kind(&self) -> TransportKind {
        *self.kind.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn live(&self) -> LiveState {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Select the transport for the next connection. Rejected while a
    /// connection exists; the link must be torn down first.
    pub fn set_kind(&self, kind: TransportKind) -> Result<(), TransportError> {
        if self.status() != ConnectionStatus::Disconnected {
            return Err(TransportError::ConnectionFailed(
                "cannot switch transport while connected".into(),
            ));
        }
        *self.kind.lock().unwrap_or_else(|e| e.into_inner()) = kind;
        Ok(())
    }

    /// Connect over BLE to a device previously discovered by `scanner`.
    pub async fn connect_le(
        &self,
        scanner: &Scanner,
        address: &str,
        config: &LeConfig,
    ) -> Result<(), TransportError> {
        self.set_kind(TransportKind::Le)?;
        self.set_status(ConnectionStatus::Connecting);

        let peripheral = scanner.peripheral(address).await?;
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let transport: Arc<dyn Transport> =
            match LeTransport::connect(peripheral, config, link_tx).await {
                Ok(t) => Arc::new(t),
                Err(e) => {
                    self.set_status(ConnectionStatus::Disconnected);
                    return Err(e);
                }
            };

        self.attach(transport, link_rx, address).await;
        self.bootstrap().await;
        Ok(())
    }

    /// Connect over classic RFCOMM to a peer address.
    pub async fn connect_classic(
        &self,
        address: &str,
        config: &ClassicConfig,
    ) -> Result<(), TransportError> {
        self.set_kind(TransportKind::Classic)?;
        self.set_status(ConnectionStatus::Connecting);

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let transport: Arc<dyn Transport> =
            match ClassicTransport::connect(address, config, link_tx).await {
                Ok(t) => Arc::new(t),
                Err(e) => {
                    self.set_status(ConnectionStatus::Disconnected);
                    return Err(e);
                }
            };

        // No bootstrap here: the classic firmware path streams unprompted,
        // and SYNC/REPORT on connect is a GATT-path behavior.
        self.attach(transport, link_rx, address).await;
        Ok(())
    }

    async fn attach(
        &self,
        transport: Arc<dyn Transport>,
        link_rx: mpsc::UnboundedReceiver<LinkEvent>,
        address: &str,
    ) {
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        *self.send_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(send_tx);
        *self.transport.lock().await = Some(transport.clone());

        tokio::spawn(run_writer(
            transport,
            send_rx,
            self.events.clone(),
            self.status.clone(),
        ));
        tokio::spawn(run_pump(
            link_rx,
            self.live.clone(),
            self.settings.clone(),
            self.events.clone(),
            self.status.clone(),
        ));

        {
            let mut settings = self.settings.lock().unwrap_or_else(|e| e.into_inner());
            settings.set_last_connected(address);
            if let Err(e) = settings.save() {
                warn!("persisting last connected peer: {e}");
            }
        }

        info!(peer = address, transport = self.kind().label(), "connected");
        self.set_status(ConnectionStatus::Connected);
    }

    /// Ask the device for its full state after connecting. The firmware
    /// needs a beat between the subscription and the first command, and
    /// between the two commands.
    async fn bootstrap(&self) {
        tokio::time::sleep(Duration::from_millis(BOOTSTRAP_DELAY_MS)).await;
        self.send_command(&Command::Sync);
        tokio::time::sleep(Duration::from_millis(BOOTSTRAP_DELAY_MS)).await;
        self.send_command(&Command::Report);
    }

    pub fn send_command(&self, command: &Command) {
        self.send(&command.line());
    }

    /// Queue a command for the writer. A no-op with a status message when
    /// disconnected, so callers never block on a dead link.
    pub fn send(&self, command: &str) {
        if self.status() != ConnectionStatus::Connected {
            self.emit_status("not connected, command dropped", MessageSeverity::Warning);
            return;
        }
        let guard = self.send_tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            self.emit_status("not connected, command dropped", MessageSeverity::Warning);
            return;
        };
        match tx.try_send(command.to_string()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("send queue full, dropping command");
                self.emit_status("send queue full, command dropped", MessageSeverity::Warning);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.emit_status("not connected, command dropped", MessageSeverity::Warning);
            }
        }
    }

    /// Tear down the link. Safe to call repeatedly and while disconnected.
    pub async fn disconnect(&self) {
        self.send_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(transport) = self.transport.lock().await.take() {
            transport.shutdown().await;
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
        let _ = self.events.send(AppEvent::Connection(status));
    }

    fn emit_status(&self, message: &str, severity: MessageSeverity) {
        let _ = self
            .events
            .send(AppEvent::Status(StatusMessage::new(message, severity)));
    }
}

/// Serialize queued commands onto the transport: normalize, chunk against
/// the payload bound sampled at send time, and pace successive chunks so the
/// peer's receive buffer keeps up. A write error means the link is gone: the
/// session drops to Disconnected and the remaining queue is abandoned.
async fn run_writer(
    transport: Arc<dyn Transport>,
    mut send_rx: mpsc::Receiver<String>,
    events: mpsc::UnboundedSender<AppEvent>,
    status: Arc<Mutex<ConnectionStatus>>,
) {
    while let Some(command) = send_rx.recv().await {
        let wire = normalize_command(&command);
        let max_payload = transport.max_payload();
        let mut pieces = chunks(wire.as_bytes(), max_payload).peekable();
        let mut failed = false;

        while let Some(chunk) = pieces.next() {
            if let Err(e) = transport.write_chunk(chunk).await {
                warn!("write failed, dropping link: {e}");
                let _ = events.send(AppEvent::Status(StatusMessage::new(
                    format!("write failed: {e}"),
                    MessageSeverity::Error,
                )));
                failed = true;
                break;
            }
            if pieces.peek().is_some() {
                tokio::time::sleep(CHUNK_PACING).await;
            }
        }

        if failed {
            *status.lock().unwrap_or_else(|e| e.into_inner()) =
                ConnectionStatus::Disconnected;
            let _ = events.send(AppEvent::Connection(ConnectionStatus::Disconnected));
            break;
        }
        let _ = events.send(AppEvent::CommandSent(command));
    }
    debug!("writer task ended");
}

/// Decode inbound frames, fold them into live state, persist configuration
/// echoes, and forward typed events to the consumer.
async fn run_pump(
    mut link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    live: Arc<Mutex<LiveState>>,
    settings: Arc<Mutex<SettingsService>>,
    events: mpsc::UnboundedSender<AppEvent>,
    status: Arc<Mutex<ConnectionStatus>>,
) {
    while let Some(event) = link_rx.recv().await {
        match event {
            LinkEvent::Frame(frame) => {
                let decoded = dispatch(&frame);
                live.lock().unwrap_or_else(|e| e.into_inner()).apply(&decoded);

                if let DeviceEvent::Config(item) = &decoded {
                    let mut settings = settings.lock().unwrap_or_else(|e| e.into_inner());
                    settings.apply_config_item(item);
                    if let Err(e) = settings.save() {
                        warn!("persisting settings echo: {e}");
                    }
                }

                if events.send(AppEvent::Device(decoded)).is_err() {
                    break;
                }
            }
            LinkEvent::Closed => {
                info!("link closed by peer");
                *status.lock().unwrap_or_else(|e| e.into_inner()) =
                    ConnectionStatus::Disconnected;
                let _ = events.send(AppEvent::Connection(ConnectionStatus::Disconnected));
                let _ = events.send(AppEvent::Status(StatusMessage::new(
                    "connection lost",
                    MessageSeverity::Warning,
                )));
                break;
            }
        }
    }
    debug!("pump task ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use crate::domain::models::ConfigItem;

    struct RecordingTransport {
        chunks: Mutex<Vec<Vec<u8>>>,
        max_payload: usize,
        connected: AtomicBool,
    }

    impl RecordingTransport {
        fn new(max_payload: usize) -> Arc<Self> {
            Arc::new(Self {
                chunks: Mutex::new(Vec::new()),
                max_payload,
                connected: AtomicBool::new(true),
            })
        }

        fn written(&self) -> Vec<Vec<u8>> {
            self.chunks.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Le
        }

        fn max_payload(&self) -> usize {
            self.max_payload
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn write_chunk(&self, chunk: &[u8]) -> Result<(), TransportError> {
            self.chunks.lock().unwrap().push(chunk.to_vec());
            Ok(())
        }

        async fn shutdown(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    fn test_settings() -> Arc<Mutex<SettingsService>> {
        let dir = std::env::temp_dir().join(format!("racetrix-session-{}", std::process::id()));
        Arc::new(Mutex::new(SettingsService::with_path(
            dir.join("settings.json"),
        )))
    }

    #[tokio::test(start_paused = true)]
    async fn writer_chunks_and_reports_command_sent() {
        let transport = RecordingTransport::new(20);
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(run_writer(
            transport.clone() as Arc<dyn Transport>,
            send_rx,
            events_tx,
            Arc::new(Mutex::new(ConnectionStatus::Connected)),
        ));

        let long = "TRACK:SETUP=0,5,51.500000,-0.120000,51.500100,-0.119900";
        send_tx.send(long.to_string()).await.unwrap();
        send_tx.send("CMD:SYNC".to_string()).await.unwrap();
        drop(send_tx);
        writer.await.unwrap();

        let written = transport.written();
        assert!(written.iter().all(|c| c.len() <= 20));
        let rebuilt: Vec<u8> = written.concat();
        assert_eq!(
            rebuilt,
            format!("{long}\nCMD:SYNC\n").into_bytes(),
            "chunks must concatenate to both commands in submission order"
        );

        let mut sent = Vec::new();
        while let Some(event) = events_rx.recv().await {
            if let AppEvent::CommandSent(cmd) = event {
                sent.push(cmd);
            }
        }
        assert_eq!(sent, vec![long.to_string(), "CMD:SYNC".to_string()]);
    }

    #[tokio::test]
    async fn command_sent_echoes_the_text_as_submitted() {
        let transport = RecordingTransport::new(usize::MAX);
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(run_writer(
            transport.clone() as Arc<dyn Transport>,
            send_rx,
            events_tx,
            Arc::new(Mutex::new(ConnectionStatus::Connected)),
        ));

        send_tx.send("CMD:SAVE\n".to_string()).await.unwrap();
        drop(send_tx);
        writer.await.unwrap();

        let mut sent = Vec::new();
        while let Some(event) = events_rx.recv().await {
            if let AppEvent::CommandSent(cmd) = event {
                sent.push(cmd);
            }
        }
        // The caller's trailing newline survives even though the wire form
        // is normalized separately.
        assert_eq!(sent, vec!["CMD:SAVE\n".to_string()]);
        assert_eq!(transport.written(), vec![b"CMD:SAVE\n".to_vec()]);
    }

    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Le
        }

        fn max_payload(&self) -> usize {
            20
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn write_chunk(&self, _chunk: &[u8]) -> Result<(), TransportError> {
            Err(TransportError::WriteFailed("gatt rejected".into()))
        }

        async fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn write_failure_drops_the_session_to_disconnected() {
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let status = Arc::new(Mutex::new(ConnectionStatus::Connected));

        let writer = tokio::spawn(run_writer(
            Arc::new(FailingTransport) as Arc<dyn Transport>,
            send_rx,
            events_tx,
            status.clone(),
        ));

        send_tx.send("CMD:SYNC".to_string()).await.unwrap();
        send_tx.send("CMD:REPORT".to_string()).await.unwrap();
        writer.await.unwrap();

        assert_eq!(*status.lock().unwrap(), ConnectionStatus::Disconnected);

        let mut errors = 0;
        let mut disconnects = 0;
        while let Some(event) = events_rx.recv().await {
            match event {
                AppEvent::Status(msg) if msg.severity == MessageSeverity::Error => errors += 1,
                AppEvent::Connection(ConnectionStatus::Disconnected) => disconnects += 1,
                AppEvent::CommandSent(cmd) => panic!("nothing was written, got {cmd:?}"),
                _ => {}
            }
        }
        // The queue is abandoned after the first failure, not drained.
        assert_eq!(errors, 1);
        assert_eq!(disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_sends_sync_before_report() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session = Session::new(test_settings(), events_tx);
        let transport = RecordingTransport::new(usize::MAX);
        let (_link_tx, link_rx) = mpsc::unbounded_channel();

        session
            .attach(transport.clone() as Arc<dyn Transport>, link_rx, "AA:BB")
            .await;
        session.bootstrap().await;

        // CommandSent events double as the barrier for the writer task.
        let mut sent = Vec::new();
        while sent.len() < 2 {
            match events_rx.recv().await.unwrap() {
                AppEvent::CommandSent(cmd) => sent.push(cmd),
                _ => {}
            }
        }
        assert_eq!(sent, vec!["CMD:SYNC".to_string(), "CMD:REPORT".to_string()]);
        assert_eq!(
            transport.written(),
            vec![b"CMD:SYNC\n".to_vec(), b"CMD:REPORT\n".to_vec()]
        );
    }

    #[tokio::test]
    async fn pump_persists_config_echo_and_forwards_events() {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let live = Arc::new(Mutex::new(LiveState::default()));
        let settings = test_settings();
        let status = Arc::new(Mutex::new(ConnectionStatus::Connected));

        let pump = tokio::spawn(run_pump(
            link_rx,
            live.clone(),
            settings.clone(),
            events_tx,
            status.clone(),
        ));

        link_tx.send(LinkEvent::Frame("VOL:22".into())).unwrap();
        link_tx
            .send(LinkEvent::Frame("TLM:42.5,7,1,0,65430,51.5,-0.12".into()))
            .unwrap();
        link_tx.send(LinkEvent::Closed).unwrap();
        pump.await.unwrap();

        assert_eq!(settings.lock().unwrap().get().volume, 22);
        let live = live.lock().unwrap().clone();
        assert!(live.recording);
        assert_eq!((live.latitude, live.longitude), (51.5, -0.12));
        assert_eq!(*status.lock().unwrap(), ConnectionStatus::Disconnected);

        let mut saw_config = false;
        let mut saw_disconnect = false;
        while let Some(event) = events_rx.recv().await {
            match event {
                AppEvent::Device(DeviceEvent::Config(ConfigItem::Volume(22))) => {
                    saw_config = true;
                }
                AppEvent::Connection(ConnectionStatus::Disconnected) => {
                    saw_disconnect = true;
                }
                _ => {}
            }
        }
        assert!(saw_config && saw_disconnect);
    }

    #[tokio::test]
    async fn send_while_disconnected_is_a_warning_not_a_write() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session = Session::new(test_settings(), events_tx);

        session.send("CMD:SYNC");

        let event = events_rx.recv().await.unwrap();
        match event {
            AppEvent::Status(msg) => assert_eq!(msg.severity, MessageSeverity::Warning),
            other => panic!("expected status warning, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_switch_rejected_while_connected() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let session = Session::new(test_settings(), events_tx);
        assert!(session.set_kind(TransportKind::Classic).is_ok());

        session.set_status(ConnectionStatus::Connected);
        assert!(session.set_kind(TransportKind::Le).is_err());

        session.disconnect().await;
        assert!(session.set_kind(TransportKind::Le).is_ok());
    }
}
