mod domain;
mod infrastructure;
mod presentation;

use clap::{Parser, ValueEnum};
use domain::platform::{BlePlatform, PlatformEventSink};
use domain::session::{PeripheralSession, SessionOptions};
use domain::settings::SettingsService;
use infrastructure::bluetooth::simulated::{SimulatedPlatform, SimulatorHandle};
use infrastructure::logging::init_logger;
use presentation::console::Console;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// In-process radio, driven with `sim` commands
    Simulated,
    /// The operating system's Bluetooth stack
    Native,
}

/// Door alarm BLE peripheral
#[derive(Parser)]
#[command(name = "door-alarm-peripheral")]
#[command(about = "Advertise the door alarm service and push door signals to a connected central")]
struct Cli {
    /// Settings file (defaults to the per-user config directory)
    #[arg(long)]
    settings: Option<PathBuf>,

    #[arg(long, value_enum)]
    backend: Option<Backend>,

    /// Advertised local name
    #[arg(long)]
    device_name: Option<String>,

    /// trace, debug, info, warn or error
    #[arg(long)]
    log_level: Option<String>,
}

const HAS_NATIVE_BACKEND: bool = cfg!(any(windows, all(target_os = "linux", feature = "bluez")));

#[cfg(windows)]
async fn native_platform(sink: PlatformEventSink) -> anyhow::Result<Box<dyn BlePlatform>> {
    Ok(Box::new(infrastructure::bluetooth::winrt::WindowsPlatform::new(sink)))
}

#[cfg(all(target_os = "linux", feature = "bluez"))]
async fn native_platform(sink: PlatformEventSink) -> anyhow::Result<Box<dyn BlePlatform>> {
    Ok(Box::new(
        infrastructure::bluetooth::bluez::BluezPlatform::new(sink).await?,
    ))
}

#[cfg(not(any(windows, all(target_os = "linux", feature = "bluez"))))]
async fn native_platform(_sink: PlatformEventSink) -> anyhow::Result<Box<dyn BlePlatform>> {
    Err(domain::error::SessionError::PlatformUnavailable(
        "this build has no native Bluetooth backend".to_string(),
    )
    .into())
}

async fn create_platform(
    backend: Backend,
    sink: PlatformEventSink,
) -> anyhow::Result<(Box<dyn BlePlatform>, Option<SimulatorHandle>)> {
    match backend {
        Backend::Simulated => {
            let platform = SimulatedPlatform::new(sink);
            let handle = platform.handle();
            Ok((Box::new(platform), Some(handle)))
        }
        Backend::Native => Ok((native_platform(sink).await?, None)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings_service = match cli.settings {
        Some(path) => SettingsService::load(path),
        None => SettingsService::new()?,
    };
    // First-run file holds file defaults, not command-line overrides
    let first_run_save = settings_service.save_if_missing();
    if let Some(name) = cli.device_name {
        settings_service.get_mut().device_name = name;
    }
    if let Some(level) = cli.log_level {
        settings_service.get_mut().log_settings.level = level;
    }
    let settings = settings_service.get().clone();

    let _logging_guard = init_logger(&settings.log_settings)?;

    match first_run_save {
        Ok(true) => info!(
            "Wrote default settings to {}",
            settings_service.path().display()
        ),
        Ok(false) => {}
        Err(e) => warn!("Could not write default settings: {}", e),
    }

    let backend = cli.backend.unwrap_or(if HAS_NATIVE_BACKEND {
        Backend::Native
    } else {
        Backend::Simulated
    });
    info!("Starting door alarm peripheral ({:?} backend)", backend);

    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (feed_tx, feed_rx) = mpsc::unbounded_channel();

    let (platform, simulator) =
        create_platform(backend, PlatformEventSink::new(input_tx.clone())).await?;
    let session =
        PeripheralSession::start(platform, SessionOptions::from(&settings), Some(feed_tx)).await?;
    let session_task = tokio::spawn(session.run(input_rx));

    Console::new(input_tx, settings.advertise, simulator)
        .run(feed_rx)
        .await?;

    session_task.await?;
    Ok(())
}
