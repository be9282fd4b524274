//! WinRT transport
//!
//! [`Transport`] backed by `Windows.Devices.Bluetooth`. WinRT calls are
//! async, so they run on a dedicated worker thread with its own
//! current-thread runtime; the session only posts jobs to it and receives
//! the outcomes as [`TransportEvent`]s.
//!
//! Windows negotiates the MTU, connection parameters and PHY on its own.
//! An MTU request answers with the PDU size the stack settled on; RSSI,
//! priority and PHY requests answer `RequestNotSupported`.

use crate::domain::command::{GattRequest, ReplyValue};
use crate::domain::models::{
    Characteristic, CharacteristicId, Descriptor, NotifyMode, PeripheralId, WriteType,
};
use crate::domain::status::GattStatus;
use crate::error::TransportError;
use crate::infrastructure::transport::{
    CorrelationToken, EventSender, Transport, TransportEvent,
};
use anyhow::Result;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattDescriptor, GattSession, GattValueChangedEventArgs,
    GattWriteOption,
};
use windows::Devices::Bluetooth::{
    BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice,
};
use windows::Devices::Enumeration::DevicePairingResultStatus;
use windows::Foundation::{IReference, TypedEventHandler};
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

enum Job {
    Connect(u64),
    Disconnect,
    Send(CorrelationToken, GattRequest),
    CreateBond,
}

/// Session-facing handle; the WinRT objects live on the worker thread.
pub struct WinRtTransport {
    jobs: mpsc::UnboundedSender<Job>,
    next_token: u64,
}

impl WinRtTransport {
    pub fn new(events: EventSender) -> Result<Self> {
        let (jobs, mut job_rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("winrt-ble".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create runtime for Bluetooth: {}", e);
                        return;
                    }
                };

                rt.block_on(async move {
                    let mut worker = Worker::new(events);
                    while let Some(job) = job_rx.recv().await {
                        worker.run(job).await;
                    }
                    worker.close();
                });
            })?;

        Ok(Self {
            jobs,
            next_token: 0,
        })
    }

    fn post(&self, job: Job) -> Result<(), TransportError> {
        self.jobs
            .send(job)
            .map_err(|_| TransportError::Unavailable("Bluetooth worker stopped".to_string()))
    }
}

impl Transport for WinRtTransport {
    fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let address = parse_address(&peripheral.address).ok_or_else(|| {
            TransportError::Unavailable(format!("Invalid address {}", peripheral.address))
        })?;
        self.post(Job::Connect(address))
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.post(Job::Disconnect)
    }

    fn send(&mut self, request: &GattRequest) -> Result<CorrelationToken, TransportError> {
        self.next_token += 1;
        let token = CorrelationToken(self.next_token);
        self.post(Job::Send(token, request.clone()))?;
        Ok(token)
    }

    fn create_bond(&mut self) -> Result<(), TransportError> {
        self.post(Job::CreateBond)
    }
}

/// `AA:BB:CC:DD:EE:FF` to the 48-bit integer WinRT expects.
fn parse_address(address: &str) -> Option<u64> {
    let hex: String = address.chars().filter(|c| *c != ':' && *c != '-').collect();
    if hex.len() != 12 {
        return None;
    }
    u64::from_str_radix(&hex, 16).ok()
}

fn guid(uuid: &uuid::Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

fn to_buffer(bytes: &[u8]) -> Result<IBuffer> {
    let writer = DataWriter::new()?;
    writer.WriteBytes(bytes)?;
    Ok(writer.DetachBuffer()?)
}

fn from_buffer(buffer: &IBuffer) -> Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

fn map_status(status: GattCommunicationStatus, protocol_error: Option<IReference<u8>>) -> GattStatus {
    match status {
        GattCommunicationStatus::Success => GattStatus::Success,
        GattCommunicationStatus::Unreachable => GattStatus::ConnectionLost,
        GattCommunicationStatus::AccessDenied => GattStatus::InsufficientAuthentication,
        GattCommunicationStatus::ProtocolError => protocol_error
            .and_then(|code| code.Value().ok())
            .map(|code| GattStatus::from_native(u16::from(code)))
            .unwrap_or(GattStatus::Failure),
        _ => GattStatus::Failure,
    }
}

struct Worker {
    events: EventSender,
    device: Option<BluetoothLEDevice>,
    session: Option<GattSession>,
    characteristics: HashMap<u16, GattCharacteristic>,
    subscriptions: HashMap<u16, i64>,
}

impl Worker {
    fn new(events: EventSender) -> Self {
        Self {
            events,
            device: None,
            session: None,
            characteristics: HashMap::new(),
            subscriptions: HashMap::new(),
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    async fn run(&mut self, job: Job) {
        match job {
            Job::Connect(address) => {
                if let Err(e) = self.connect(address).await {
                    error!("Connection failed: {}", e);
                    self.close();
                    self.emit(TransportEvent::Disconnected {
                        status: GattStatus::Failure,
                    });
                }
            }
            Job::Disconnect => {
                self.close();
                self.emit(TransportEvent::Disconnected {
                    status: GattStatus::Success,
                });
            }
            Job::Send(token, request) => {
                let (status, value) = match self.execute(&request).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!("{} failed: {}", request, e);
                        (GattStatus::Failure, ReplyValue::None)
                    }
                };
                self.emit(TransportEvent::CommandReply {
                    token,
                    status,
                    value,
                });
            }
            Job::CreateBond => {
                self.emit(TransportEvent::BondStarted);
                let event = match self.pair().await {
                    Ok(true) => TransportEvent::BondSucceeded,
                    Ok(false) => TransportEvent::BondFailed,
                    Err(e) => {
                        warn!("Pairing failed: {}", e);
                        TransportEvent::BondFailed
                    }
                };
                self.emit(event);
            }
        }
    }

    async fn connect(&mut self, address: u64) -> Result<()> {
        info!("Connecting to Bluetooth device: {:#X}", address);
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?.await?;

        // Keeps the link up between requests; without it Windows drops
        // idle connections.
        let session = GattSession::FromDeviceIdAsync(&device.BluetoothDeviceId()?)?.await?;
        session.SetMaintainConnection(true)?;

        let sender = self.events.clone();
        let status_handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if let Ok(BluetoothConnectionStatus::Disconnected) = dev.ConnectionStatus() {
                        let _ = sender.send(TransportEvent::Disconnected {
                            status: GattStatus::ConnectionLost,
                        });
                    }
                }
                Ok(())
            });
        device.ConnectionStatusChanged(&status_handler)?;

        // Service discovery is what actually brings the link up.
        let services = device
            .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)?
            .await?;
        if services.Status()? != GattCommunicationStatus::Success {
            anyhow::bail!("Failed to get GATT services: {:?}", services.Status()?);
        }
        let services = services.Services()?;
        for i in 0..services.Size()? {
            let service = services.GetAt(i)?;
            let result = service.GetCharacteristicsAsync()?.await?;
            if result.Status()? != GattCommunicationStatus::Success {
                warn!("Skipping service {:?}: {:?}", service.Uuid()?, result.Status()?);
                continue;
            }
            let characteristics = result.Characteristics()?;
            for j in 0..characteristics.Size()? {
                let c = characteristics.GetAt(j)?;
                self.characteristics.insert(c.AttributeHandle()?, c);
            }
        }
        info!("Found {} characteristics", self.characteristics.len());

        let mtu = session.MaxPduSize()?;
        self.device = Some(device);
        self.session = Some(session);
        self.emit(TransportEvent::Connected);
        self.emit(TransportEvent::MtuChanged { mtu });
        Ok(())
    }

    fn close(&mut self) {
        for (handle, token) in self.subscriptions.drain() {
            if let Some(c) = self.characteristics.get(&handle) {
                let _ = c.RemoveValueChanged(token);
            }
        }
        self.characteristics.clear();
        if let Some(session) = self.session.take() {
            let _ = session.Close();
        }
        if let Some(device) = self.device.take() {
            let _ = device.Close();
        }
    }

    fn characteristic(&self, characteristic: &Characteristic) -> Result<&GattCharacteristic> {
        self.characteristics
            .get(&characteristic.id.handle)
            .ok_or_else(|| anyhow::anyhow!("Characteristic {} not found", characteristic.id))
    }

    async fn descriptor(&self, descriptor: &Descriptor) -> Result<GattDescriptor> {
        let owner = self
            .characteristics
            .get(&descriptor.characteristic.handle)
            .ok_or_else(|| anyhow::anyhow!("Characteristic {} not found", descriptor.characteristic))?;
        let result = owner
            .GetDescriptorsForUuidAsync(guid(&descriptor.uuid))?
            .await?;
        let descriptors = result.Descriptors()?;
        for i in 0..descriptors.Size()? {
            let d = descriptors.GetAt(i)?;
            if d.AttributeHandle()? == descriptor.handle {
                return Ok(d);
            }
        }
        anyhow::bail!("Descriptor {} not found", descriptor)
    }

    async fn execute(&mut self, request: &GattRequest) -> Result<(GattStatus, ReplyValue)> {
        if self.device.is_none() {
            return Ok((GattStatus::ConnectionLost, ReplyValue::None));
        }
        debug!("Executing {}", request);

        match request {
            GattRequest::ReadCharacteristic(c) => {
                let result = self
                    .characteristic(c)?
                    .ReadValueWithCacheModeAsync(BluetoothCacheMode::Uncached)?
                    .await?;
                let status = map_status(result.Status()?, result.ProtocolError().ok());
                if !status.is_success() {
                    return Ok((status, ReplyValue::None));
                }
                Ok((status, ReplyValue::Bytes(from_buffer(&result.Value()?)?)))
            }
            GattRequest::WriteCharacteristic {
                characteristic,
                value,
                write_type,
            } => {
                let option = match write_type {
                    WriteType::WithResponse => GattWriteOption::WriteWithResponse,
                    WriteType::WithoutResponse => GattWriteOption::WriteWithoutResponse,
                    WriteType::Signed => {
                        return Ok((GattStatus::RequestNotSupported, ReplyValue::None))
                    }
                };
                let result = self
                    .characteristic(characteristic)?
                    .WriteValueWithResultAndOptionAsync(&to_buffer(value)?, option)?
                    .await?;
                let status = map_status(result.Status()?, result.ProtocolError().ok());
                Ok((status, ReplyValue::None))
            }
            GattRequest::ReadDescriptor(d) => {
                let result = self
                    .descriptor(d)
                    .await?
                    .ReadValueWithCacheModeAsync(BluetoothCacheMode::Uncached)?
                    .await?;
                let status = map_status(result.Status()?, result.ProtocolError().ok());
                if !status.is_success() {
                    return Ok((status, ReplyValue::None));
                }
                Ok((status, ReplyValue::Bytes(from_buffer(&result.Value()?)?)))
            }
            GattRequest::WriteDescriptor { descriptor, value } => {
                let result = self
                    .descriptor(descriptor)
                    .await?
                    .WriteValueWithResultAsync(&to_buffer(value)?)?
                    .await?;
                let status = map_status(result.Status()?, result.ProtocolError().ok());
                Ok((status, ReplyValue::None))
            }
            GattRequest::SetNotify {
                characteristic,
                mode,
            } => self.set_notify(characteristic, *mode).await,
            GattRequest::RequestMtu(requested) => {
                let session = self
                    .session
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("No GATT session"))?;
                let mtu = session.MaxPduSize()?;
                debug!("MTU {} requested, stack uses {}", requested, mtu);
                Ok((GattStatus::Success, ReplyValue::Mtu(mtu)))
            }
            GattRequest::ReadRssi
            | GattRequest::RequestConnectionPriority(_)
            | GattRequest::SetPreferredPhy { .. }
            | GattRequest::CreateBond => Ok((GattStatus::RequestNotSupported, ReplyValue::None)),
        }
    }

    async fn set_notify(
        &mut self,
        characteristic: &Characteristic,
        mode: NotifyMode,
    ) -> Result<(GattStatus, ReplyValue)> {
        let c = self.characteristic(characteristic)?.clone();
        let value = match mode {
            NotifyMode::Disabled => GattClientCharacteristicConfigurationDescriptorValue::None,
            NotifyMode::Notify => GattClientCharacteristicConfigurationDescriptorValue::Notify,
            NotifyMode::Indicate => GattClientCharacteristicConfigurationDescriptorValue::Indicate,
        };
        let result = c
            .WriteClientCharacteristicConfigurationDescriptorWithResultAsync(value)?
            .await?;
        let status = map_status(result.Status()?, result.ProtocolError().ok());
        if !status.is_success() {
            return Ok((status, ReplyValue::None));
        }

        let handle = characteristic.id.handle;
        if mode.is_enabled() {
            if !self.subscriptions.contains_key(&handle) {
                let token = c.ValueChanged(&self.value_handler(characteristic.id))?;
                self.subscriptions.insert(handle, token);
            }
        } else if let Some(token) = self.subscriptions.remove(&handle) {
            c.RemoveValueChanged(token)?;
        }
        Ok((status, ReplyValue::None))
    }

    fn value_handler(
        &self,
        id: CharacteristicId,
    ) -> TypedEventHandler<GattCharacteristic, GattValueChangedEventArgs> {
        let sender = self.events.clone();
        TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    if let Ok(value) = args.CharacteristicValue() {
                        match from_buffer(&value) {
                            Ok(value) => {
                                let _ = sender.send(TransportEvent::Notification {
                                    characteristic: id,
                                    value,
                                });
                            }
                            Err(e) => warn!("Unreadable notification from {}: {}", id, e),
                        }
                    }
                }
                Ok(())
            },
        )
    }

    async fn pair(&self) -> Result<bool> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Not connected"))?;
        let pairing = device.DeviceInformation()?.Pairing()?;
        if pairing.IsPaired()? {
            info!("Device already paired");
            return Ok(true);
        }
        let result = pairing.PairAsync()?.await?;
        let status = result.Status()?;
        info!("Pairing result: {:?}", status);
        Ok(matches!(
            status,
            DevicePairingResultStatus::Paired | DevicePairingResultStatus::AlreadyPaired
        ))
    }
}
