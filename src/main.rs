//! Console monitor: scan, connect over either transport, stream decoded
//! telemetry to stdout, and forward stdin lines to the device as commands.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;

use racetrix::domain::models::{
    AppEvent, ConnectionStatus, DeviceEvent, MessageSeverity, ScannedDevice,
};
use racetrix::domain::settings::SettingsService;
use racetrix::infrastructure::bluetooth::classic::ClassicConfig;
use racetrix::infrastructure::bluetooth::le::LeConfig;
use racetrix::infrastructure::bluetooth::protocol::format_elapsed;
use racetrix::infrastructure::bluetooth::{Scanner, Session};
use racetrix::infrastructure::logging::init_logger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportArg {
    Le,
    Classic,
}

#[derive(Parser, Debug)]
#[command(name = "racetrix", about = "Racetrix lap-timer console monitor")]
struct Cli {
    /// Bluetooth transport to use.
    #[arg(long, value_enum, default_value_t = TransportArg::Le)]
    transport: TransportArg,

    /// Peer address. Defaults to the remembered device, then the first
    /// discovered one.
    #[arg(long)]
    device: Option<String>,

    /// How long to scan before connecting (LE only).
    #[arg(long, default_value_t = 8)]
    scan_seconds: u64,

    /// Scan without the service filter.
    #[arg(long)]
    show_all: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Arc::new(Mutex::new(SettingsService::new()));
    let log_settings = settings
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get()
        .log
        .clone();
    let _logging = init_logger(&log_settings)?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let session = Session::new(settings.clone(), events_tx.clone());

    match cli.transport {
        TransportArg::Le => {
            let (show_all, remembered, request_mtu) = {
                let guard = settings.lock().unwrap_or_else(|e| e.into_inner());
                let s = guard.get();
                (
                    cli.show_all || s.debug_show_all_devices,
                    s.last_connected_device.clone(),
                    s.ble_request_mtu,
                )
            };

            let mut scanner = Scanner::new().await?;
            scanner
                .start(events_tx.clone(), show_all, remembered.clone())
                .await?;
            info!("scanning for {} s", cli.scan_seconds);
            let deadline = tokio::time::sleep(Duration::from_secs(cli.scan_seconds));
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    event = events_rx.recv() => {
                        if let Some(AppEvent::DeviceFound(device)) = event {
                            print_device(&device);
                        }
                    }
                }
            }
            scanner.stop().await;

            let discovered = scanner.discovered_addresses().await;
            let target = cli
                .device
                .or_else(|| remembered.filter(|addr| discovered.contains(addr)))
                .or_else(|| discovered.first().cloned());
            let Some(target) = target else {
                bail!("no device found");
            };

            let config = LeConfig {
                request_mtu,
                ..LeConfig::default()
            };
            session.connect_le(&scanner, &target, &config).await?;
        }
        TransportArg::Classic => {
            let (remembered, channel) = {
                let guard = settings.lock().unwrap_or_else(|e| e.into_inner());
                let s = guard.get();
                (s.last_connected_device.clone(), s.classic_channel)
            };
            let Some(target) = cli.device.or(remembered) else {
                bail!("classic transport needs --device or a remembered peer");
            };
            let config = ClassicConfig {
                channel,
                ..ClassicConfig::default()
            };
            session.connect_classic(&target, &config).await?;
        }
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                if print_event(&event) {
                    break;
                }
            }
            line = stdin.next_line() => match line? {
                Some(line) if !line.trim().is_empty() => session.send(line.trim()),
                Some(_) => {}
                None => break,
            },
        }
    }

    session.disconnect().await;
    Ok(())
}

fn print_device(device: &ScannedDevice) {
    let marker = if device.last_connected { " *" } else { "" };
    let rssi = device
        .signal_strength
        .map(|r| format!(" {r} dBm"))
        .unwrap_or_default();
    println!("found {} [{}]{rssi}{marker}", device.name, device.address);
}

/// Print one event. Returns true when the session is over.
fn print_event(event: &AppEvent) -> bool {
    match event {
        AppEvent::Device(DeviceEvent::Telemetry(tlm)) => {
            let position = if tlm.has_fix() {
                format!("{:.6},{:.6}", tlm.latitude, tlm.longitude)
            } else {
                "no fix".to_string()
            };
            println!(
                "{} | {:5.1} km/h | {} sats | {} | {} | {position}",
                format_elapsed(tlm.elapsed_ms),
                tlm.speed,
                tlm.satellites,
                tlm.run_state.label(),
                tlm.track_mode.label(),
            );
        }
        AppEvent::Device(DeviceEvent::Config(item)) => {
            println!("config {}={}", item.key(), item.wire_value());
        }
        AppEvent::Device(DeviceEvent::System(sys)) => {
            let sd = if sys.sd_known() {
                sys.sd_state.to_string()
            } else {
                "?".to_string()
            };
            let bat = if sys.battery_known() {
                format!("{:.2} V", sys.battery_voltage)
            } else {
                "?".to_string()
            };
            println!("system sd={sd} battery={bat}");
        }
        AppEvent::Device(DeviceEvent::Ack { message, .. }) => {
            println!("ack {message}");
        }
        AppEvent::Device(DeviceEvent::Unrecognized { raw }) => {
            println!("?? {raw}");
        }
        AppEvent::CommandSent(command) => {
            println!(">> {command}");
        }
        AppEvent::Connection(status) => {
            println!("connection: {status:?}");
            return *status == ConnectionStatus::Disconnected;
        }
        AppEvent::DeviceFound(device) => print_device(device),
        AppEvent::Status(message) => {
            let tag = match message.severity {
                MessageSeverity::Error => "error",
                MessageSeverity::Warning => "warn",
                MessageSeverity::Success | MessageSeverity::Info => "info",
            };
            println!("[{tag}] {}", message.message);
        }
    }
    false
}
