//! WinRT GATT Platform
//!
//! [`GattPlatform`] on top of `Windows.Devices.Bluetooth`. Each operation is
//! started on the tokio runtime and its outcome is reported as a
//! [`PlatformEvent`].

use crate::domain::DeviceAddress;
use crate::infrastructure::bluetooth::error::{GattStatus, LinkError};
use crate::infrastructure::bluetooth::platform::{
    CharacteristicProperties, CommandCharacteristic, DiscoveredCharacteristic, DiscoveredService,
    GattPlatform, PlatformEvent, PlatformEventKind, PlatformEventSender, SessionId, WriteType,
};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCharacteristicProperties, GattCommunicationStatus, GattSession,
    GattWriteOption,
};
use windows::Devices::Bluetooth::{BluetoothAdapter, BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::DataWriter;

/// Resources held for one session
struct WinRtSession {
    device: BluetoothLEDevice,
    // Keeps the link up between writes
    _gatt_session: Option<GattSession>,
    status_token: i64,
    characteristics: HashMap<u128, GattCharacteristic>,
}

#[derive(Default)]
struct Shared {
    events: Option<PlatformEventSender>,
    sessions: HashMap<SessionId, WinRtSession>,
    // Sessions whose device is still being opened
    opening: HashSet<SessionId>,
    // Opening sessions that were disconnected before the device came up
    closed: HashSet<SessionId>,
}

impl Shared {
    fn emit(&self, session: SessionId, kind: PlatformEventKind) {
        if let Some(events) = &self.events {
            let _ = events.send(PlatformEvent::new(session, kind));
        }
    }
}

#[derive(Clone, Default)]
pub struct WinRtPlatform {
    shared: Arc<Mutex<Shared>>,
}

impl WinRtPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that a Bluetooth LE capable adapter is present
    pub async fn check_adapter() -> Result<(), LinkError> {
        let unavailable = |e: windows::core::Error| LinkError::AdapterUnavailable(e.message());
        let adapter = BluetoothAdapter::GetDefaultAsync()
            .map_err(unavailable)?
            .await
            .map_err(unavailable)?;
        if !adapter.IsLowEnergySupported().map_err(unavailable)? {
            return Err(LinkError::AdapterUnavailable(
                "adapter does not support Bluetooth LE".to_string(),
            ));
        }
        info!("Bluetooth adapter: {}", adapter.DeviceId().map_err(unavailable)?);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock_shared(&self.shared)
    }
}

fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn status_of(status: GattCommunicationStatus) -> GattStatus {
    if status == GattCommunicationStatus::Success {
        GattStatus::SUCCESS
    } else {
        GattStatus(0x100 | status.0 as u16)
    }
}

async fn open_device(
    shared: Arc<Mutex<Shared>>,
    session: SessionId,
    address: DeviceAddress,
) -> Result<()> {
    let device = BluetoothLEDevice::FromBluetoothAddressAsync(address.as_u64())?.await?;
    info!("Device opened: {:?}", device.Name()?);

    let gatt_session = match GattSession::FromDeviceIdAsync(&device.BluetoothDeviceId()?)?.await {
        Ok(gatt_session) => {
            gatt_session.SetMaintainConnection(true)?;
            Some(gatt_session)
        }
        Err(e) => {
            warn!("Failed to create GattSession, continuing anyway: {}", e);
            None
        }
    };

    let handler_shared = shared.clone();
    let status_handler =
        TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
            if let Some(dev) = dev.as_ref() {
                if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                    let mut shared = lock_shared(&handler_shared);
                    if let Some(closed) = shared.sessions.remove(&session) {
                        let _ = closed.device.Close();
                        shared.emit(session, PlatformEventKind::Disconnected);
                    }
                }
            }
            Ok(())
        });
    let status_token = device.ConnectionStatusChanged(&status_handler)?;

    let mut shared = lock_shared(&shared);
    shared.opening.remove(&session);
    if shared.closed.remove(&session) {
        info!("Session {} was closed while opening, releasing device", session);
        let _ = device.RemoveConnectionStatusChanged(status_token);
        let _ = device.Close();
        return Ok(());
    }
    shared.sessions.insert(
        session,
        WinRtSession {
            device,
            _gatt_session: gatt_session,
            status_token,
            characteristics: HashMap::new(),
        },
    );
    shared.emit(session, PlatformEventKind::Connected);
    Ok(())
}

/// Discovered services plus the characteristic handles later writes need
type Discovery = (Vec<DiscoveredService>, HashMap<u128, GattCharacteristic>);

async fn enumerate_services(
    device: BluetoothLEDevice,
) -> Result<std::result::Result<Discovery, GattStatus>> {
    let services_result = device.GetGattServicesAsync()?.await?;
    if services_result.Status()? != GattCommunicationStatus::Success {
        error!("Failed to get GATT services: {:?}", services_result.Status()?);
        return Ok(Err(status_of(services_result.Status()?)));
    }

    let mut discovered = Vec::new();
    let mut handles = HashMap::new();
    let services = services_result.Services()?;
    for i in 0..services.Size()? {
        let service = services.GetAt(i)?;
        let service_uuid = service.Uuid()?.to_u128();

        let chars_result = service.GetCharacteristicsAsync()?.await?;
        if chars_result.Status()? != GattCommunicationStatus::Success {
            debug!("Skipping service {:032x}: {:?}", service_uuid, chars_result.Status()?);
            continue;
        }

        let mut characteristics = Vec::new();
        let chars = chars_result.Characteristics()?;
        for j in 0..chars.Size()? {
            let c = chars.GetAt(j)?;
            let uuid = c.Uuid()?.to_u128();
            let props = c.CharacteristicProperties()?;
            characteristics.push(DiscoveredCharacteristic {
                uuid,
                properties: CharacteristicProperties {
                    write: props.contains(GattCharacteristicProperties::Write),
                    write_without_response: props
                        .contains(GattCharacteristicProperties::WriteWithoutResponse),
                },
            });
            handles.insert(uuid, c);
        }
        discovered.push(DiscoveredService {
            uuid: service_uuid,
            characteristics,
        });
    }

    info!("Found {} services", discovered.len());
    Ok(Ok((discovered, handles)))
}

impl GattPlatform for WinRtPlatform {
    fn attach(&self, events: PlatformEventSender) {
        self.lock().events = Some(events);
    }

    fn connect(&self, session: SessionId, address: DeviceAddress) -> Result<(), LinkError> {
        info!("Connecting to Bluetooth device: {}", address);
        self.lock().opening.insert(session);
        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = open_device(shared.clone(), session, address).await {
                error!("Connection failed: {}", e);
                let mut shared = lock_shared(&shared);
                shared.opening.remove(&session);
                if !shared.closed.remove(&session) {
                    shared.emit(session, PlatformEventKind::ConnectFailed(e.to_string()));
                }
            }
        });
        Ok(())
    }

    fn discover_services(&self, session: SessionId) -> Result<(), LinkError> {
        let device = self
            .lock()
            .sessions
            .get(&session)
            .map(|s| s.device.clone())
            .ok_or_else(|| LinkError::ConnectFailed("device not open".to_string()))?;

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let outcome = match enumerate_services(device).await {
                Ok(Ok((services, handles))) => {
                    let mut guard = lock_shared(&shared);
                    if let Some(open) = guard.sessions.get_mut(&session) {
                        open.characteristics = handles;
                    }
                    Ok(services)
                }
                Ok(Err(status)) => Err(status),
                Err(e) => {
                    error!("Service discovery failed: {}", e);
                    Err(GattStatus::FAILURE)
                }
            };
            lock_shared(&shared).emit(session, PlatformEventKind::ServicesDiscovered(outcome));
        });
        Ok(())
    }

    fn write(
        &self,
        session: SessionId,
        characteristic: &CommandCharacteristic,
        payload: &[u8],
    ) -> Result<(), LinkError> {
        let handle = self
            .lock()
            .sessions
            .get(&session)
            .and_then(|s| s.characteristics.get(&characteristic.uuid).cloned())
            .ok_or_else(|| LinkError::WriteNotIssued("characteristic not available".to_string()))?;

        let issue = || -> windows::core::Result<_> {
            let writer = DataWriter::new()?;
            writer.WriteBytes(payload)?;
            let buffer = writer.DetachBuffer()?;
            let option = match characteristic.write_type {
                WriteType::WithResponse => GattWriteOption::WriteWithResponse,
                WriteType::WithoutResponse => GattWriteOption::WriteWithoutResponse,
            };
            handle.WriteValueWithOptionAsync(&buffer, option)
        };
        let operation = issue().map_err(|e| LinkError::WriteNotIssued(e.to_string()))?;

        let with_response = characteristic.write_type == WriteType::WithResponse;
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let status = match operation.await {
                Ok(status) => status_of(status),
                Err(e) => {
                    error!("Write failed: {}", e);
                    GattStatus::FAILURE
                }
            };
            if with_response {
                lock_shared(&shared).emit(session, PlatformEventKind::CharacteristicWritten(status));
            } else if status != GattStatus::SUCCESS {
                warn!("Write without response on session {} reported {:?}", session, status);
            }
        });
        Ok(())
    }

    fn disconnect(&self, session: SessionId) {
        let mut shared = self.lock();
        if let Some(open) = shared.sessions.remove(&session) {
            let _ = open.device.RemoveConnectionStatusChanged(open.status_token);
            let _ = open.device.Close();
            info!("Disconnected from device");
        } else if shared.opening.contains(&session) {
            shared.closed.insert(session);
        }
        // Closing the device object is final; there is no later callback
        shared.emit(session, PlatformEventKind::Disconnected);
    }
}
