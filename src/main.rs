use anyhow::Result;
use clap::Parser;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{info, warn};
use water_dispenser::domain::settings::SettingsService;
use water_dispenser::infrastructure::address_store::{
    AddressStore, MemoryAddressStore, SettingsAddressStore,
};
use water_dispenser::infrastructure::bluetooth::platform::GattPlatform;
use water_dispenser::infrastructure::bluetooth::protocol::SessionConfig;
use water_dispenser::infrastructure::bluetooth::simulator::{SimulatedDispenser, SimulatorConfig};
use water_dispenser::infrastructure::logging::init_logger;
use water_dispenser::presentation::Console;
use water_dispenser::DispenserService;

#[derive(Parser, Debug)]
#[command(name = "water-dispenser")]
#[command(about = "Drive a BLE water dispenser from the terminal")]
struct Args {
    /// Bluetooth MAC address of the dispenser (format: AA:BB:CC:DD:EE:FF).
    /// Connects on startup; defaults to the last address that connected.
    #[arg(value_name = "MAC_ADDRESS")]
    mac_address: Option<String>,

    /// Talk to the built-in simulated dispenser instead of a Bluetooth adapter
    #[arg(long)]
    simulate: bool,

    /// Override the heartbeat interval in milliseconds
    #[arg(long)]
    heartbeat_ms: Option<u64>,

    /// Override the configured log filter (e.g. "debug" or "water_dispenser=trace")
    #[arg(long)]
    log_level: Option<String>,
}

#[cfg(windows)]
async fn bluetooth_platform() -> Result<Arc<dyn GattPlatform>> {
    use water_dispenser::infrastructure::bluetooth::winrt::WinRtPlatform;
    WinRtPlatform::check_adapter().await?;
    Ok(Arc::new(WinRtPlatform::new()))
}

#[cfg(not(windows))]
async fn bluetooth_platform() -> Result<Arc<dyn GattPlatform>> {
    anyhow::bail!("The Bluetooth backend is only available on Windows")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let settings = SettingsService::new()?;
    let base_dir = settings.path().parent().map(|dir| dir.to_path_buf());
    let _logging_guard = init_logger(
        &settings.get().log_settings,
        base_dir.as_deref(),
        args.log_level.as_deref(),
    )?;
    info!("Starting water dispenser console");
    info!("Settings file: {}", settings.path().display());

    let mut config = SessionConfig::from_settings(&settings.get().ble)?;
    if let Some(ms) = args.heartbeat_ms {
        config.heartbeat_interval = Duration::from_millis(ms);
    }

    let simulate = args.simulate || cfg!(not(windows));
    if simulate && !args.simulate {
        warn!("No Bluetooth backend on this platform; using the simulated dispenser");
    }

    let (platform, store): (Arc<dyn GattPlatform>, Arc<dyn AddressStore>) = if simulate {
        info!("Using simulated dispenser");
        (
            Arc::new(SimulatedDispenser::new(SimulatorConfig::default())),
            Arc::new(MemoryAddressStore::new(None)),
        )
    } else {
        let settings = Arc::new(Mutex::new(settings));
        (bluetooth_platform().await?, Arc::new(SettingsAddressStore::new(settings)))
    };

    let service = DispenserService::new(platform, store, config);
    let remembered = service.stored_address().map(|address| address.to_string());
    if let Some(address) = &args.mac_address {
        service.connect(address);
    }

    let console = Console::new(
        service,
        args.mac_address.or(remembered),
        config.heartbeat_interval,
    );
    console.run(BufReader::new(tokio::io::stdin())).await
}
