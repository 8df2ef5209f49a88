use std::fmt;

/// Immutable description of the one peripheral this application talks to.
///
/// All fields are opaque strings compared by exact equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Hardware address, upper-case colon-separated hex
    pub address: &'static str,
    /// Service carrying the counter characteristic
    pub service_uuid: &'static str,
    /// Characteristic that pushes counter notifications
    pub characteristic_uuid: &'static str,
    /// Client characteristic configuration descriptor
    pub ccd_uuid: &'static str,
}

/// Why a session ended in [`ConnectionState::Failed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    ConnectError,
    NotFound,
    DiscoveryError,
    SubscribeError,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::ConnectError => "could not connect",
            Self::NotFound => "service or characteristic not found",
            Self::DiscoveryError => "service discovery failed",
            Self::SubscribeError => "could not enable notifications",
        };
        f.write_str(text)
    }
}

/// Lifecycle of the link to the target peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    DiscoveringServices,
    SubscribingNotifications,
    Ready,
    Disconnecting,
    Disconnected,
    Failed(FailureReason),
}

impl ConnectionState {
    /// `Disconnected` and `Failed` end a session; a new one must be created to reconnect.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed(_))
    }

    /// True between `Connecting` and `Ready` inclusive, where a link is in use.
    pub fn is_linked(&self) -> bool {
        matches!(
            self,
            Self::Connecting
                | Self::Connected
                | Self::DiscoveringServices
                | Self::SubscribingNotifications
                | Self::Ready
        )
    }

    /// Human readable status line for the display
    pub fn status_text(&self) -> String {
        match self {
            Self::Idle => "Disconnected".to_string(),
            Self::Scanning => "Scanning...".to_string(),
            Self::Connecting => "Connecting...".to_string(),
            Self::Connected => "Connected".to_string(),
            Self::DiscoveringServices => "Discovering services...".to_string(),
            Self::SubscribingNotifications => "Subscribing...".to_string(),
            Self::Ready => "Ready".to_string(),
            Self::Disconnecting => "Disconnecting...".to_string(),
            Self::Disconnected => "Disconnected".to_string(),
            Self::Failed(reason) => format!("Failed: {}", reason),
        }
    }

    pub fn severity(&self) -> MessageSeverity {
        match self {
            Self::Ready => MessageSeverity::Success,
            Self::Failed(_) => MessageSeverity::Error,
            _ => MessageSeverity::Info,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "Failed({:?})", reason),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Opaque reference to an advertising peer, handed back to the stack on connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerRef(pub u64);

/// Opaque session handle issued by the stack for one connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattHandle(pub u64);

impl fmt::Display for GattHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gatt#{}", self.0)
    }
}

/// Characteristic bound to its configuration descriptor, fixed once discovery finds it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationConfig {
    pub service_uuid: String,
    pub characteristic_uuid: String,
    pub descriptor_uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: String,
    pub descriptors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: String,
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

/// Decoded value of one notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CounterValue(pub u32);

impl fmt::Display for CounterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callbacks delivered by the BLE stack, one variant per platform callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleEvent {
    AdvertisementReceived {
        address: String,
        peer: PeerRef,
    },
    ConnectionStateChanged {
        handle: GattHandle,
        connected: bool,
    },
    ServicesDiscovered {
        handle: GattHandle,
        result: Result<Vec<DiscoveredService>, String>,
    },
    DescriptorWritten {
        handle: GattHandle,
        result: Result<(), String>,
    },
    CharacteristicChanged {
        handle: GattHandle,
        characteristic_uuid: String,
        value: Option<Vec<u8>>,
    },
}

impl BleEvent {
    /// The GATT handle this callback belongs to, if any
    pub fn handle(&self) -> Option<GattHandle> {
        match self {
            Self::AdvertisementReceived { .. } => None,
            Self::ConnectionStateChanged { handle, .. }
            | Self::ServicesDiscovered { handle, .. }
            | Self::DescriptorWritten { handle, .. }
            | Self::CharacteristicChanged { handle, .. } => Some(*handle),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AdvertisementReceived { .. } => "advertisement-received",
            Self::ConnectionStateChanged { .. } => "connection-state-changed",
            Self::ServicesDiscovered { .. } => "services-discovered",
            Self::DescriptorWritten { .. } => "descriptor-written",
            Self::CharacteristicChanged { .. } => "characteristic-changed",
        }
    }
}

/// User intent sent from the display to the Bluetooth worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BluetoothCommand {
    Connect,
    Disconnect,
}

/// Events pushed to the display sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    StatusChanged(StatusMessage),
    StateChanged(ConnectionState),
    ValueChanged(CounterValue),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linked_states() {
        assert!(!ConnectionState::Idle.is_linked());
        assert!(ConnectionState::Connecting.is_linked());
        assert!(ConnectionState::Ready.is_linked());
        assert!(!ConnectionState::Disconnecting.is_linked());
        assert!(!ConnectionState::Failed(FailureReason::NotFound).is_linked());
    }

    #[test]
    fn test_status_text() {
        assert_eq!(ConnectionState::Idle.status_text(), "Disconnected");
        assert_eq!(
            ConnectionState::Failed(FailureReason::SubscribeError).status_text(),
            "Failed: could not enable notifications"
        );
    }
}
