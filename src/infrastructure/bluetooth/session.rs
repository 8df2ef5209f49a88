//! GATT Session Module
//!
//! Lifecycle of one connection to the target peripheral, driven entirely by
//! stack callbacks. Waiting for a later stage is a state, never a blocking call.
//!
//! ```text
//! Idle ─connect─> Connecting ─link up─> Connected ─> DiscoveringServices
//!                     │                                   │ found
//!                     │ link failed                       ▼
//!                     ▼                        SubscribingNotifications
//!                  Failed <──── not found / error ───┤    │ CCD ack
//!                                                         ▼
//!     any ─disconnect()─> Disconnecting ─> Disconnected   Ready ─notify─> Ready
//! ```

use crate::domain::error::BleError;
use crate::domain::models::{
    BleEvent, ConnectionState, CounterValue, DeviceIdentity, DiscoveredService, FailureReason,
    GattHandle, NotificationConfig, PeerRef,
};
use crate::infrastructure::bluetooth::protocol::{self, ENABLE_NOTIFICATION_VALUE};
use crate::infrastructure::bluetooth::stack::{ensure_granted, BleStack, PermissionGate};
use tracing::{debug, info, warn};

/// Output of the session, drained by the coordinator after every call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    Value(CounterValue),
}

/// Single owned session: state, handle and notification binding change only here.
pub struct GattSession {
    identity: DeviceIdentity,
    state: ConnectionState,
    handle: Option<GattHandle>,
    notification: Option<NotificationConfig>,
    events: Vec<SessionEvent>,
}

impl GattSession {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            state: ConnectionState::Idle,
            handle: None,
            notification: None,
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[cfg(test)]
    pub fn handle(&self) -> Option<GattHandle> {
        self.handle
    }

    #[cfg(test)]
    pub fn notification_config(&self) -> Option<&NotificationConfig> {
        self.notification.as_ref()
    }

    /// Events produced since the last call
    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Request a link to `peer`. Only legal from `Idle`.
    pub fn connect<S, G>(&mut self, stack: &mut S, gate: &G, peer: PeerRef) -> Result<(), BleError>
    where
        S: BleStack + ?Sized,
        G: PermissionGate + ?Sized,
    {
        ensure_granted(gate)?;
        if self.state != ConnectionState::Idle {
            warn!("Connect requested in state {}", self.state);
            return Err(BleError::InvalidState(self.state));
        }

        info!("Connecting to {}", self.identity.address);
        self.transition(ConnectionState::Connecting);
        match stack.connect(peer) {
            Ok(handle) => {
                debug!("Link requested on {}", handle);
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                self.fail(stack, FailureReason::ConnectError, &message);
                Err(BleError::ConnectError(message))
            }
        }
    }

    /// Tear the session down from any state. A no-op once terminal.
    pub fn disconnect<S, G>(&mut self, stack: &mut S, gate: &G) -> Result<(), BleError>
    where
        S: BleStack + ?Sized,
        G: PermissionGate + ?Sized,
    {
        ensure_granted(gate)?;
        if self.state.is_terminal() {
            debug!("Disconnect ignored, session already {}", self.state);
            return Ok(());
        }

        info!("Disconnecting from {}", self.identity.address);
        self.transition(ConnectionState::Disconnecting);
        self.release(stack);
        self.transition(ConnectionState::Disconnected);
        Ok(())
    }

    /// Apply one stack callback.
    ///
    /// Callbacks for another handle or arriving in a state that does not
    /// expect them are logged and dropped.
    pub fn handle_event<S, G>(
        &mut self,
        stack: &mut S,
        gate: &G,
        event: &BleEvent,
    ) -> Result<(), BleError>
    where
        S: BleStack + ?Sized,
        G: PermissionGate + ?Sized,
    {
        ensure_granted(gate)?;

        match event.handle() {
            Some(handle) if Some(handle) == self.handle => {}
            Some(handle) => {
                debug!("Dropping {} for stale handle {}", event.name(), handle);
                return Ok(());
            }
            None => {
                self.ignore(event);
                return Ok(());
            }
        }

        match (self.state, event) {
            (ConnectionState::Connecting, BleEvent::ConnectionStateChanged { connected, .. }) => {
                if *connected {
                    self.on_link_established(stack);
                } else {
                    self.fail(stack, FailureReason::ConnectError, "link could not be established");
                }
            }
            (state, BleEvent::ConnectionStateChanged { connected: false, .. })
                if state.is_linked() =>
            {
                warn!("Link to {} dropped in state {}", self.identity.address, state);
                self.release(stack);
                self.transition(ConnectionState::Disconnected);
            }
            (ConnectionState::DiscoveringServices, BleEvent::ServicesDiscovered { result, .. }) => {
                match result {
                    Ok(services) => self.on_services_discovered(stack, services),
                    Err(e) => self.fail(stack, FailureReason::DiscoveryError, e),
                }
            }
            (
                ConnectionState::SubscribingNotifications,
                BleEvent::DescriptorWritten { result, .. },
            ) => match result {
                Ok(()) => {
                    info!("Notifications enabled");
                    self.transition(ConnectionState::Ready);
                }
                Err(e) => self.fail(stack, FailureReason::SubscribeError, e),
            },
            (
                ConnectionState::Ready,
                BleEvent::CharacteristicChanged {
                    characteristic_uuid,
                    value,
                    ..
                },
            ) => {
                if characteristic_uuid != self.identity.characteristic_uuid {
                    debug!("Notification from unrelated characteristic {}", characteristic_uuid);
                    return Ok(());
                }
                let count = protocol::decode_counter(value.as_deref());
                debug!("Counter: {}", count);
                self.events.push(SessionEvent::Value(count));
            }
            _ => self.ignore(event),
        }

        Ok(())
    }

    fn on_link_established<S: BleStack + ?Sized>(&mut self, stack: &mut S) {
        self.transition(ConnectionState::Connected);

        let Some(handle) = self.handle else {
            return;
        };
        self.transition(ConnectionState::DiscoveringServices);
        if let Err(e) = stack.discover_services(handle) {
            self.fail(stack, FailureReason::DiscoveryError, &e.to_string());
        }
    }

    fn on_services_discovered<S: BleStack + ?Sized>(
        &mut self,
        stack: &mut S,
        services: &[DiscoveredService],
    ) {
        let Some(config) = self.find_notification_config(services) else {
            let detail = format!(
                "{} / {} not offered by peripheral",
                self.identity.service_uuid, self.identity.characteristic_uuid
            );
            self.fail(stack, FailureReason::NotFound, &detail);
            return;
        };
        let Some(handle) = self.handle else {
            return;
        };

        info!("Found counter characteristic {}", config.characteristic_uuid);
        self.transition(ConnectionState::SubscribingNotifications);

        let subscribed = stack
            .set_characteristic_notification(handle, &config, true)
            .and_then(|()| stack.write_descriptor(handle, &config, &ENABLE_NOTIFICATION_VALUE));
        self.notification = Some(config);

        if let Err(e) = subscribed {
            self.fail(stack, FailureReason::SubscribeError, &e.to_string());
        }
    }

    fn find_notification_config(&self, services: &[DiscoveredService]) -> Option<NotificationConfig> {
        let service = services
            .iter()
            .find(|s| s.uuid == self.identity.service_uuid)?;
        let characteristic = service
            .characteristics
            .iter()
            .find(|c| c.uuid == self.identity.characteristic_uuid)?;
        let descriptor = characteristic
            .descriptors
            .iter()
            .find(|d| d.as_str() == self.identity.ccd_uuid)?;

        Some(NotificationConfig {
            service_uuid: service.uuid.clone(),
            characteristic_uuid: characteristic.uuid.clone(),
            descriptor_uuid: descriptor.clone(),
        })
    }

    fn fail<S: BleStack + ?Sized>(&mut self, stack: &mut S, reason: FailureReason, detail: &str) {
        warn!("Session failed ({}): {}", reason, detail);
        self.release(stack);
        self.transition(ConnectionState::Failed(reason));
    }

    /// Close the handle at most once and drop the notification binding.
    fn release<S: BleStack + ?Sized>(&mut self, stack: &mut S) {
        self.notification = None;
        if let Some(handle) = self.handle.take() {
            debug!("Closing {}", handle);
            stack.close(handle);
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        info!("GATT session: {} -> {}", self.state, next);
        self.state = next;
        self.events.push(SessionEvent::StateChanged(next));
    }

    fn ignore(&self, event: &BleEvent) {
        let unexpected = BleError::UnexpectedCallback {
            state: self.state,
            event: event.name(),
        };
        warn!("{}", unexpected);
    }
}
