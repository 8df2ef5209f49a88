//! WinRT BLE Stack
//!
//! Bridges the Windows Bluetooth LE APIs onto [`BleStack`]. WinRT async
//! operations are awaited on spawned tokio tasks of the worker runtime and
//! their outcomes are posted back as [`BleEvent`]s.

use crate::domain::error::BleError;
use crate::domain::models::{
    BleEvent, DiscoveredCharacteristic, DiscoveredService, GattHandle, NotificationConfig, PeerRef,
};
use crate::infrastructure::bluetooth::protocol::{CCD_UUID, ENABLE_NOTIFICATION_VALUE};
use crate::infrastructure::bluetooth::stack::{BleStack, PermissionGate, PermissionRequest};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCharacteristicProperties,
    GattClientCharacteristicConfigurationDescriptorValue, GattCommunicationStatus,
    GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Devices::Radios::{Radio, RadioAccessStatus};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, IBuffer};

/// Render a WinRT GUID the way the identity constants are written
pub fn guid_to_string(guid: &GUID) -> String {
    format!(
        "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        guid.data1,
        guid.data2,
        guid.data3,
        guid.data4[0],
        guid.data4[1],
        guid.data4[2],
        guid.data4[3],
        guid.data4[4],
        guid.data4[5],
        guid.data4[6],
        guid.data4[7]
    )
}

/// Render a 48-bit Bluetooth address as `AA:BB:CC:DD:EE:FF`
pub fn format_address(address: u64) -> String {
    (0..6)
        .rev()
        .map(|i| format!("{:02X}", (address >> (i * 8)) & 0xFF))
        .collect::<Vec<_>>()
        .join(":")
}

fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let length = reader.UnconsumedBufferLength()? as usize;
    let mut bytes = vec![0u8; length];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

fn stack_error(e: windows::core::Error) -> BleError {
    BleError::Stack(e.message().to_string())
}

#[derive(Default)]
struct Link {
    device: Option<BluetoothLEDevice>,
    status_token: Option<i64>,
    characteristics: HashMap<String, GattCharacteristic>,
    value_token: Option<(GattCharacteristic, i64)>,
}

type Links = Arc<Mutex<HashMap<GattHandle, Link>>>;

pub struct WinRtStack {
    events: mpsc::UnboundedSender<BleEvent>,
    watcher: Option<BluetoothLEAdvertisementWatcher>,
    links: Links,
    next_handle: u64,
}

impl WinRtStack {
    pub fn new(events: mpsc::UnboundedSender<BleEvent>) -> Self {
        Self {
            events,
            watcher: None,
            links: Arc::new(Mutex::new(HashMap::new())),
            next_handle: 1,
        }
    }

    fn with_link<R>(&self, handle: GattHandle, f: impl FnOnce(&mut Link) -> R) -> Option<R> {
        let mut links = self.links.lock().ok()?;
        links.get_mut(&handle).map(f)
    }

    fn characteristic(
        &self,
        handle: GattHandle,
        config: &NotificationConfig,
    ) -> Result<GattCharacteristic, BleError> {
        self.with_link(handle, |link| {
            link.characteristics
                .get(&config.characteristic_uuid)
                .cloned()
        })
        .flatten()
        .ok_or_else(|| BleError::Stack(format!("{} has no characteristic {}", handle, config.characteristic_uuid)))
    }
}

/// The connect task reports the link itself; later status changes only matter
/// when the link goes away.
fn link_lost_event(handle: GattHandle, status: BluetoothConnectionStatus) -> Option<BleEvent> {
    (status != BluetoothConnectionStatus::Connected).then_some(BleEvent::ConnectionStateChanged {
        handle,
        connected: false,
    })
}

fn watch_connection_status(
    device: &BluetoothLEDevice,
    handle: GattHandle,
    events: mpsc::UnboundedSender<BleEvent>,
) -> windows::core::Result<i64> {
    let status_handler =
        TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
            if let Some(dev) = dev.as_ref() {
                if let Some(event) = link_lost_event(handle, dev.ConnectionStatus()?) {
                    let _ = events.send(event);
                }
            }
            Ok(())
        });
    device.ConnectionStatusChanged(&status_handler)
}

async fn enumerate_services(
    device: BluetoothLEDevice,
) -> windows::core::Result<(Vec<DiscoveredService>, HashMap<String, GattCharacteristic>)> {
    let services_result = device.GetGattServicesAsync()?.await?;
    if services_result.Status()? != GattCommunicationStatus::Success {
        return Err(windows::core::Error::new(
            windows::core::HRESULT(-1),
            format!("GATT services unavailable: {:?}", services_result.Status()?),
        ));
    }

    let mut discovered = Vec::new();
    let mut handles = HashMap::new();
    let services = services_result.Services()?;
    for i in 0..services.Size()? {
        let service = services.GetAt(i)?;
        let service_uuid = guid_to_string(&service.Uuid()?);

        let mut characteristics = Vec::new();
        let chars_result = service.GetCharacteristicsAsync()?.await?;
        if chars_result.Status()? == GattCommunicationStatus::Success {
            let found = chars_result.Characteristics()?;
            for j in 0..found.Size()? {
                let characteristic = found.GetAt(j)?;
                let uuid = guid_to_string(&characteristic.Uuid()?);

                let mut descriptors = Vec::new();
                let desc_result = characteristic.GetDescriptorsAsync()?.await?;
                if desc_result.Status()? == GattCommunicationStatus::Success {
                    let list = desc_result.Descriptors()?;
                    for k in 0..list.Size()? {
                        descriptors.push(guid_to_string(&list.GetAt(k)?.Uuid()?));
                    }
                }
                // Windows manages the CCD itself and may leave it out of the list.
                let notify = characteristic.CharacteristicProperties()?.0
                    & GattCharacteristicProperties::Notify.0
                    != 0;
                if notify && !descriptors.iter().any(|d| d == CCD_UUID) {
                    descriptors.push(CCD_UUID.to_string());
                }

                handles.insert(uuid.clone(), characteristic);
                characteristics.push(DiscoveredCharacteristic { uuid, descriptors });
            }
        } else {
            warn!("Characteristics of {} unavailable", service_uuid);
        }

        discovered.push(DiscoveredService {
            uuid: service_uuid,
            characteristics,
        });
    }

    Ok((discovered, handles))
}

impl BleStack for WinRtStack {
    fn start_scan(&mut self) -> Result<(), BleError> {
        let watcher = BluetoothLEAdvertisementWatcher::new().map_err(stack_error)?;
        watcher
            .SetScanningMode(BluetoothLEScanningMode::Passive)
            .map_err(stack_error)?;

        let sender = self.events.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let address = args.BluetoothAddress()?;
                    let _ = sender.send(BleEvent::AdvertisementReceived {
                        address: format_address(address),
                        peer: PeerRef(address),
                    });
                }
                Ok(())
            },
        );

        watcher.Received(&handler).map_err(stack_error)?;
        watcher.Start().map_err(stack_error)?;
        self.watcher = Some(watcher);
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), BleError> {
        if let Some(watcher) = self.watcher.take() {
            watcher.Stop().map_err(stack_error)?;
        }
        Ok(())
    }

    fn connect(&mut self, peer: PeerRef) -> Result<GattHandle, BleError> {
        let handle = GattHandle(self.next_handle);
        self.next_handle += 1;
        self.links
            .lock()
            .map_err(|_| BleError::Stack("Lock error".to_string()))?
            .insert(handle, Link::default());

        info!("Opening {} as {}", format_address(peer.0), handle);
        let events = self.events.clone();
        let links = self.links.clone();
        tokio::spawn(async move {
            let opened = match BluetoothLEDevice::FromBluetoothAddressAsync(peer.0) {
                Ok(operation) => operation.await,
                Err(e) => Err(e),
            };
            let connected = match opened {
                Ok(device) => {
                    let mut links = match links.lock() {
                        Ok(links) => links,
                        Err(_) => return,
                    };
                    let Some(link) = links.get_mut(&handle) else {
                        // Closed while the open was in flight.
                        let _ = device.Close();
                        return;
                    };
                    // Only watch the link once discovery can find the device.
                    let watched = watch_connection_status(&device, handle, events.clone());
                    link.device = Some(device);
                    match watched {
                        Ok(token) => {
                            link.status_token = Some(token);
                            true
                        }
                        Err(e) => {
                            error!("Failed to watch connection status: {}", e);
                            false
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to open device: {}", e);
                    false
                }
            };
            if connected {
                info!("Device opened as {}", handle);
            }
            let _ = events.send(BleEvent::ConnectionStateChanged { handle, connected });
        });
        Ok(handle)
    }

    fn discover_services(&mut self, handle: GattHandle) -> Result<(), BleError> {
        let device = self
            .with_link(handle, |link| link.device.clone())
            .flatten()
            .ok_or_else(|| BleError::Stack(format!("{} is not open", handle)))?;

        let events = self.events.clone();
        let links = self.links.clone();
        tokio::spawn(async move {
            let result = match enumerate_services(device).await {
                Ok((services, characteristics)) => {
                    if let Ok(mut links) = links.lock() {
                        if let Some(link) = links.get_mut(&handle) {
                            link.characteristics = characteristics;
                        }
                    }
                    Ok(services)
                }
                Err(e) => Err(e.message().to_string()),
            };
            let _ = events.send(BleEvent::ServicesDiscovered { handle, result });
        });
        Ok(())
    }

    fn set_characteristic_notification(
        &mut self,
        handle: GattHandle,
        config: &NotificationConfig,
        enable: bool,
    ) -> Result<(), BleError> {
        let characteristic = self.characteristic(handle, config)?;

        let previous = self.with_link(handle, |link| link.value_token.take()).flatten();
        if let Some((old, token)) = previous {
            let _ = old.RemoveValueChanged(token);
        }
        if !enable {
            return Ok(());
        }

        let sender = self.events.clone();
        let characteristic_uuid = config.characteristic_uuid.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let value = args
                        .CharacteristicValue()
                        .and_then(|buffer| read_buffer(&buffer))
                        .ok();
                    let _ = sender.send(BleEvent::CharacteristicChanged {
                        handle,
                        characteristic_uuid: characteristic_uuid.clone(),
                        value,
                    });
                }
                Ok(())
            },
        );
        let token = characteristic.ValueChanged(&handler).map_err(stack_error)?;
        self.with_link(handle, |link| link.value_token = Some((characteristic, token)));
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        handle: GattHandle,
        config: &NotificationConfig,
        value: &[u8],
    ) -> Result<(), BleError> {
        let characteristic = self.characteristic(handle, config)?;
        let ccd_value = if value == ENABLE_NOTIFICATION_VALUE.as_slice() {
            GattClientCharacteristicConfigurationDescriptorValue::Notify
        } else {
            GattClientCharacteristicConfigurationDescriptorValue::None
        };

        let events = self.events.clone();
        tokio::spawn(async move {
            let result = match characteristic
                .WriteClientCharacteristicConfigurationDescriptorAsync(ccd_value)
            {
                Ok(operation) => match operation.await {
                    Ok(GattCommunicationStatus::Success) => Ok(()),
                    Ok(status) => Err(format!("CCD write returned {:?}", status)),
                    Err(e) => Err(e.message().to_string()),
                },
                Err(e) => Err(e.message().to_string()),
            };
            let _ = events.send(BleEvent::DescriptorWritten { handle, result });
        });
        Ok(())
    }

    fn close(&mut self, handle: GattHandle) {
        let link = match self.links.lock() {
            Ok(mut links) => links.remove(&handle),
            Err(_) => None,
        };
        let Some(link) = link else {
            debug!("{} already released", handle);
            return;
        };

        if let Some((characteristic, token)) = link.value_token {
            let _ = characteristic.RemoveValueChanged(token);
        }
        if let Some(device) = link.device {
            if let Some(token) = link.status_token {
                let _ = device.RemoveConnectionStatusChanged(token);
            }
            if let Err(e) = device.Close() {
                warn!("Closing {} failed: {}", handle, e);
            }
        }
        info!("Released {}", handle);
    }
}

impl Drop for WinRtStack {
    fn drop(&mut self) {
        let _ = self.stop_scan();
    }
}

/// Permission gate backed by the Bluetooth radio access status
#[derive(Clone, Default)]
pub struct RadioAccessGate {
    granted: Arc<AtomicBool>,
}

async fn request_radio_access() -> windows::core::Result<bool> {
    let status = Radio::RequestAccessAsync()?.await?;
    Ok(status == RadioAccessStatus::Allowed)
}

impl PermissionGate for RadioAccessGate {
    fn is_granted(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    fn request(&self) -> PermissionRequest {
        let granted = self.granted.clone();
        Box::pin(async move {
            let allowed = request_radio_access().await.unwrap_or_else(|e| {
                error!("Radio access request failed: {}", e);
                false
            });
            granted.store(allowed, Ordering::SeqCst);
            allowed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_address() {
        assert_eq!(format_address(0xC878447DFEEF), "C8:78:44:7D:FE:EF");
    }

    #[test]
    fn test_status_handler_reports_only_link_loss() {
        let handle = GattHandle(3);
        assert_eq!(
            link_lost_event(handle, BluetoothConnectionStatus::Connected),
            None
        );
        assert_eq!(
            link_lost_event(handle, BluetoothConnectionStatus::Disconnected),
            Some(BleEvent::ConnectionStateChanged {
                handle,
                connected: false
            })
        );
    }

    #[test]
    fn test_guid_to_string() {
        let guid = GUID::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
        assert_eq!(guid_to_string(&guid), "6e400001-b5a3-f393-e0a9-e50e24dcca9e");
    }
}
