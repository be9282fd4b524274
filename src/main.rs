use anyhow::Context;
use peripheral_session::domain::models::{
    BondState, Characteristic, CharacteristicId, CharacteristicProperties, ConnectionState,
    PeripheralId, WriteType,
};
use peripheral_session::domain::settings::SettingsService;
use peripheral_session::domain::status::GattStatus;
use peripheral_session::infrastructure::logging;
use peripheral_session::infrastructure::simulated::SimulatedPeripheral;
use peripheral_session::session::{PeripheralSession, SessionObserver};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Logs every session callback.
struct LogObserver;

impl SessionObserver for LogObserver {
    fn on_connection_state_changed(
        &self,
        peripheral: &PeripheralId,
        state: ConnectionState,
        status: GattStatus,
    ) {
        info!("{} is {} ({})", peripheral, state, status);
    }

    fn on_bond_state_changed(&self, peripheral: &PeripheralId, state: BondState) {
        info!("{} bond state {:?}", peripheral, state);
    }

    fn on_characteristic_update(
        &self,
        _peripheral: &PeripheralId,
        characteristic: &CharacteristicId,
        value: &[u8],
    ) {
        info!("Notification from {}: {:02X?}", characteristic, value);
    }

    fn on_mtu_changed(&self, _peripheral: &PeripheralId, mtu: u16, status: GattStatus) {
        info!("MTU {} ({})", mtu, status);
    }
}

fn heart_rate_measurement() -> Characteristic {
    Characteristic::new(
        Uuid::from_u128(0x0000180D_0000_1000_8000_00805F9B34FB),
        Uuid::from_u128(0x00002A37_0000_1000_8000_00805F9B34FB),
        0x000E,
        CharacteristicProperties::NOTIFY,
    )
}

fn body_sensor_location() -> Characteristic {
    Characteristic::new(
        Uuid::from_u128(0x0000180D_0000_1000_8000_00805F9B34FB),
        Uuid::from_u128(0x00002A38_0000_1000_8000_00805F9B34FB),
        0x0011,
        CharacteristicProperties::READ,
    )
}

fn control_point() -> Characteristic {
    Characteristic::new(
        Uuid::from_u128(0x0000180D_0000_1000_8000_00805F9B34FB),
        Uuid::from_u128(0x00002A39_0000_1000_8000_00805F9B34FB),
        0x0013,
        CharacteristicProperties::READ | CharacteristicProperties::WRITE,
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new().context("Failed to load settings")?;
    let settings = settings_service.get().clone();

    let _logging_guard = logging::init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!(
        "Starting peripheral session demo (settings: {})",
        settings_service.path().display()
    );

    #[cfg(windows)]
    if let Some(address) = std::env::args().nth(1) {
        return probe_device(address, settings).await;
    }

    // A simulated heart rate strap whose control point needs a bond.
    let peripheral = PeripheralId::new("C4:7C:8D:6A:11:02", "Simulated HR strap");
    let (device, transport, events) = SimulatedPeripheral::new(peripheral.clone());
    device.set_latency(Duration::from_millis(20));
    device.set_max_mtu(185);
    device.add_characteristic(&heart_rate_measurement(), &[0x00, 60]);
    device.add_characteristic(&body_sensor_location(), &[0x01]);
    device.add_characteristic(&control_point(), &[0x00]);
    device.protect(&control_point());

    let session = PeripheralSession::spawn(
        peripheral,
        settings,
        transport,
        events,
        Some(Arc::new(LogObserver)),
    );

    session.connect()?;
    session
        .wait_for_connection_state(ConnectionState::Connected)
        .await?;

    let mtu = session.request_mtu(247).await?;
    info!("Negotiated MTU {}", mtu);

    let location = session.read_characteristic(&body_sensor_location()).await?;
    info!("Body sensor location: {:02X?}", location);

    session.set_notify(&heart_rate_measurement(), true).await?;
    for bpm in [62u8, 64, 63] {
        device.notify(&heart_rate_measurement().id, &[0x00, bpm]);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Rejected for missing authentication, bonded, then retried.
    session
        .write_characteristic(&control_point(), &[0x01], WriteType::WithResponse)
        .await?;
    info!("Energy expended reset (bond state {:?})", session.bond_state());

    match session.read_rssi().await {
        Ok(rssi) => info!("RSSI {} dBm", rssi),
        Err(e) => warn!("RSSI unavailable: {}", e),
    }

    session.disconnect()?;
    session
        .wait_for_connection_state(ConnectionState::Disconnected)
        .await?;

    info!("Demo finished");
    Ok(())
}

/// Connect to a real device, report what the link negotiated and leave.
#[cfg(windows)]
async fn probe_device(
    address: String,
    settings: peripheral_session::domain::settings::Settings,
) -> anyhow::Result<()> {
    use peripheral_session::infrastructure::transport::event_channel;
    use peripheral_session::infrastructure::winrt::WinRtTransport;

    let (events_tx, events) = event_channel();
    let transport = WinRtTransport::new(events_tx)?;
    let peripheral = PeripheralId::new(address, "");
    let session = PeripheralSession::spawn(
        peripheral,
        settings,
        transport,
        events,
        Some(Arc::new(LogObserver)),
    );

    session.connect()?;
    session
        .wait_for_connection_state(ConnectionState::Connected)
        .await?;
    info!("Connected, MTU {}", session.request_mtu(517).await?);

    session.disconnect()?;
    session
        .wait_for_connection_state(ConnectionState::Disconnected)
        .await?;
    Ok(())
}
