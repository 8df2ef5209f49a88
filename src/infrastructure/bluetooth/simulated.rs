//! Simulated BLE Stack
//!
//! Records every request for assertions and, when given an event channel,
//! plays a scripted counter peripheral so the application runs without
//! Bluetooth hardware. Script steps run as tokio tasks on the caller's
//! runtime and report back through the same channel a real stack would use.

use crate::domain::error::BleError;
use crate::domain::models::{
    BleEvent, DeviceIdentity, DiscoveredCharacteristic, DiscoveredService, GattHandle,
    NotificationConfig, PeerRef,
};
use crate::infrastructure::bluetooth::protocol::ENABLE_NOTIFICATION_VALUE;
use crate::infrastructure::bluetooth::stack::BleStack;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Address of the device that advertises next to the target
pub const DECOY_ADDRESS: &str = "00:11:22:33:44:55";

const DECOY_PEER: PeerRef = PeerRef(1);
const TARGET_PEER: PeerRef = PeerRef(2);

const ADVERTISING_INTERVAL: Duration = Duration::from_millis(400);
const RESPONSE_DELAY: Duration = Duration::from_millis(150);

/// A request as the stack received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackCall {
    StartScan,
    StopScan,
    Connect(PeerRef),
    DiscoverServices(GattHandle),
    SetNotification {
        handle: GattHandle,
        characteristic_uuid: String,
        enable: bool,
    },
    WriteDescriptor {
        handle: GattHandle,
        descriptor_uuid: String,
        value: Vec<u8>,
    },
    Close(GattHandle),
}

impl StackCall {
    pub fn op(&self) -> StackOp {
        match self {
            Self::StartScan => StackOp::StartScan,
            Self::StopScan => StackOp::StopScan,
            Self::Connect(_) => StackOp::Connect,
            Self::DiscoverServices(_) => StackOp::DiscoverServices,
            Self::SetNotification { .. } => StackOp::SetNotification,
            Self::WriteDescriptor { .. } => StackOp::WriteDescriptor,
            Self::Close(_) => StackOp::Close,
        }
    }
}

/// Kinds of request that can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackOp {
    StartScan,
    StopScan,
    Connect,
    DiscoverServices,
    SetNotification,
    WriteDescriptor,
    Close,
}

/// Scripted peripheral state, only present when events are wired up
struct Peripheral {
    events: mpsc::UnboundedSender<BleEvent>,
    identity: DeviceIdentity,
    notify_interval: Duration,
    advertiser: Option<JoinHandle<()>>,
    notifiers: HashMap<GattHandle, JoinHandle<()>>,
}

impl Peripheral {
    /// Deliver `event` after the usual response delay.
    fn respond(&self, event: BleEvent) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RESPONSE_DELAY).await;
            let _ = events.send(event);
        });
    }

    fn services(&self) -> Vec<DiscoveredService> {
        vec![DiscoveredService {
            uuid: self.identity.service_uuid.to_string(),
            characteristics: vec![DiscoveredCharacteristic {
                uuid: self.identity.characteristic_uuid.to_string(),
                descriptors: vec![self.identity.ccd_uuid.to_string()],
            }],
        }]
    }
}

pub struct SimulatedStack {
    calls: Vec<StackCall>,
    failing: HashSet<StackOp>,
    next_handle: u64,
    peripheral: Option<Peripheral>,
}

impl SimulatedStack {
    /// Recording-only stack: requests are logged, nothing ever answers.
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            failing: HashSet::new(),
            next_handle: 1,
            peripheral: None,
        }
    }

    /// Stack that also plays `identity` as a live counter peripheral.
    ///
    /// Must be driven from inside a tokio runtime.
    pub fn with_peripheral(
        events: mpsc::UnboundedSender<BleEvent>,
        identity: DeviceIdentity,
        notify_interval: Duration,
    ) -> Self {
        Self {
            peripheral: Some(Peripheral {
                events,
                identity,
                notify_interval,
                advertiser: None,
                notifiers: HashMap::new(),
            }),
            ..Self::new()
        }
    }

    /// Make every later request of this kind fail immediately.
    #[cfg(test)]
    pub fn fail_on(&mut self, op: StackOp) {
        self.failing.insert(op);
    }

    #[cfg(test)]
    pub fn calls(&self) -> &[StackCall] {
        &self.calls
    }

    fn record(&mut self, call: StackCall) -> Result<(), BleError> {
        debug!("Simulated stack: {:?}", call);
        let op = call.op();
        self.calls.push(call);
        if self.failing.contains(&op) {
            return Err(BleError::Stack(format!("simulated {:?} failure", op)));
        }
        Ok(())
    }
}

impl Default for SimulatedStack {
    fn default() -> Self {
        Self::new()
    }
}

impl BleStack for SimulatedStack {
    fn start_scan(&mut self) -> Result<(), BleError> {
        self.record(StackCall::StartScan)?;

        if let Some(peripheral) = self.peripheral.as_mut() {
            let events = peripheral.events.clone();
            let target = peripheral.identity.address.to_string();
            let advertiser = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(ADVERTISING_INTERVAL);
                loop {
                    ticker.tick().await;
                    let decoy = BleEvent::AdvertisementReceived {
                        address: DECOY_ADDRESS.to_string(),
                        peer: DECOY_PEER,
                    };
                    let found = BleEvent::AdvertisementReceived {
                        address: target.clone(),
                        peer: TARGET_PEER,
                    };
                    if events.send(decoy).is_err() || events.send(found).is_err() {
                        break;
                    }
                }
            });
            if let Some(previous) = peripheral.advertiser.replace(advertiser) {
                previous.abort();
            }
        }
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), BleError> {
        self.record(StackCall::StopScan)?;
        if let Some(advertiser) = self
            .peripheral
            .as_mut()
            .and_then(|p| p.advertiser.take())
        {
            advertiser.abort();
        }
        Ok(())
    }

    fn connect(&mut self, peer: PeerRef) -> Result<GattHandle, BleError> {
        self.record(StackCall::Connect(peer))?;
        let handle = GattHandle(self.next_handle);
        self.next_handle += 1;

        if let Some(peripheral) = self.peripheral.as_ref() {
            // Only the target accepts connections.
            peripheral.respond(BleEvent::ConnectionStateChanged {
                handle,
                connected: peer == TARGET_PEER,
            });
        }
        Ok(handle)
    }

    fn discover_services(&mut self, handle: GattHandle) -> Result<(), BleError> {
        self.record(StackCall::DiscoverServices(handle))?;
        if let Some(peripheral) = self.peripheral.as_ref() {
            peripheral.respond(BleEvent::ServicesDiscovered {
                handle,
                result: Ok(peripheral.services()),
            });
        }
        Ok(())
    }

    fn set_characteristic_notification(
        &mut self,
        handle: GattHandle,
        config: &NotificationConfig,
        enable: bool,
    ) -> Result<(), BleError> {
        self.record(StackCall::SetNotification {
            handle,
            characteristic_uuid: config.characteristic_uuid.clone(),
            enable,
        })
    }

    fn write_descriptor(
        &mut self,
        handle: GattHandle,
        config: &NotificationConfig,
        value: &[u8],
    ) -> Result<(), BleError> {
        self.record(StackCall::WriteDescriptor {
            handle,
            descriptor_uuid: config.descriptor_uuid.clone(),
            value: value.to_vec(),
        })?;

        let Some(peripheral) = self.peripheral.as_mut() else {
            return Ok(());
        };
        peripheral.respond(BleEvent::DescriptorWritten {
            handle,
            result: Ok(()),
        });
        if value != ENABLE_NOTIFICATION_VALUE.as_slice() {
            return Ok(());
        }

        info!("Simulated peripheral streaming counter on {}", handle);
        let events = peripheral.events.clone();
        let characteristic_uuid = config.characteristic_uuid.clone();
        let interval = peripheral.notify_interval;
        let notifier = tokio::spawn(async move {
            tokio::time::sleep(RESPONSE_DELAY).await;
            let mut count: u8 = 0;
            loop {
                tokio::time::sleep(interval).await;
                let event = BleEvent::CharacteristicChanged {
                    handle,
                    characteristic_uuid: characteristic_uuid.clone(),
                    value: Some(vec![count]),
                };
                if events.send(event).is_err() {
                    break;
                }
                count = count.wrapping_add(1);
            }
        });
        if let Some(previous) = peripheral.notifiers.insert(handle, notifier) {
            previous.abort();
        }
        Ok(())
    }

    fn close(&mut self, handle: GattHandle) {
        let _ = self.record(StackCall::Close(handle));
        if let Some(notifier) = self
            .peripheral
            .as_mut()
            .and_then(|p| p.notifiers.remove(&handle))
        {
            notifier.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::TARGET;

    fn config() -> NotificationConfig {
        NotificationConfig {
            service_uuid: TARGET.service_uuid.to_string(),
            characteristic_uuid: TARGET.characteristic_uuid.to_string(),
            descriptor_uuid: TARGET.ccd_uuid.to_string(),
        }
    }

    #[test]
    fn test_recording_stack_never_answers() {
        let mut stack = SimulatedStack::new();
        let handle = stack.connect(PeerRef(5)).unwrap();
        stack.discover_services(handle).unwrap();
        stack.close(handle);

        assert_eq!(
            stack.calls(),
            &[
                StackCall::Connect(PeerRef(5)),
                StackCall::DiscoverServices(handle),
                StackCall::Close(handle),
            ]
        );
    }

    #[test]
    fn test_handles_are_unique() {
        let mut stack = SimulatedStack::new();
        let first = stack.connect(PeerRef(1)).unwrap();
        let second = stack.connect(PeerRef(1)).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_failure_is_recorded_and_returned() {
        let mut stack = SimulatedStack::new();
        stack.fail_on(StackOp::StopScan);

        assert!(matches!(stack.stop_scan(), Err(BleError::Stack(_))));
        assert_eq!(stack.calls(), &[StackCall::StopScan]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peripheral_advertises_decoy_then_target() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut stack = SimulatedStack::with_peripheral(tx, TARGET, Duration::from_millis(100));

        stack.start_scan().unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();

        assert!(matches!(first, BleEvent::AdvertisementReceived { ref address, .. } if address == DECOY_ADDRESS));
        assert_eq!(
            second,
            BleEvent::AdvertisementReceived {
                address: TARGET.address.to_string(),
                peer: TARGET_PEER,
            }
        );

        stack.stop_scan().unwrap();
        tokio::time::sleep(ADVERTISING_INTERVAL * 3).await;
        // Anything queued before the abort may still be there, but nothing new arrives.
        let mut leftovers = 0;
        while rx.try_recv().is_ok() {
            leftovers += 1;
        }
        assert!(leftovers <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peripheral_rejects_decoy_connection() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut stack = SimulatedStack::with_peripheral(tx, TARGET, Duration::from_millis(100));

        let handle = stack.connect(DECOY_PEER).unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            BleEvent::ConnectionStateChanged {
                handle,
                connected: false,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_peripheral_streams_counter_until_closed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut stack = SimulatedStack::with_peripheral(tx, TARGET, Duration::from_millis(100));

        let handle = stack.connect(TARGET_PEER).unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            BleEvent::ConnectionStateChanged {
                handle,
                connected: true,
            }
        );

        stack.discover_services(handle).unwrap();
        match rx.recv().await.unwrap() {
            BleEvent::ServicesDiscovered { result, .. } => {
                let services = result.unwrap();
                assert_eq!(services[0].uuid, TARGET.service_uuid);
            }
            other => panic!("unexpected event {:?}", other),
        }

        stack.set_characteristic_notification(handle, &config(), true).unwrap();
        stack
            .write_descriptor(handle, &config(), &ENABLE_NOTIFICATION_VALUE)
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            BleEvent::DescriptorWritten {
                handle,
                result: Ok(()),
            }
        );

        for expected in 0u8..3 {
            match rx.recv().await.unwrap() {
                BleEvent::CharacteristicChanged { value, .. } => {
                    assert_eq!(value, Some(vec![expected]));
                }
                other => panic!("unexpected event {:?}", other),
            }
        }

        stack.close(handle);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
    }
}
