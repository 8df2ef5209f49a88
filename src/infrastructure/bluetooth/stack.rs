//! BLE Stack Seam
//!
//! Command side of the platform Bluetooth stack plus the permission gate that
//! must be satisfied before any of it may be touched. Every stack call only
//! issues a request; its completion arrives later as a [`BleEvent`].
//!
//! [`BleEvent`]: crate::domain::models::BleEvent

use crate::domain::error::BleError;
use crate::domain::models::{GattHandle, NotificationConfig, PeerRef};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Non-blocking requests against the platform BLE stack
pub trait BleStack {
    /// Begin passive advertisement scanning; results arrive as `AdvertisementReceived`
    fn start_scan(&mut self) -> Result<(), BleError>;

    fn stop_scan(&mut self) -> Result<(), BleError>;

    /// Request a link; completion arrives as `ConnectionStateChanged`
    fn connect(&mut self, peer: PeerRef) -> Result<GattHandle, BleError>;

    /// Completion arrives as `ServicesDiscovered`
    fn discover_services(&mut self, handle: GattHandle) -> Result<(), BleError>;

    /// Local switch for delivering `CharacteristicChanged` events
    fn set_characteristic_notification(
        &mut self,
        handle: GattHandle,
        config: &NotificationConfig,
        enable: bool,
    ) -> Result<(), BleError>;

    /// Completion arrives as `DescriptorWritten`
    fn write_descriptor(
        &mut self,
        handle: GattHandle,
        config: &NotificationConfig,
        value: &[u8],
    ) -> Result<(), BleError>;

    /// Release the handle. Callers must not close the same handle twice.
    fn close(&mut self, handle: GattHandle);
}

pub type PermissionRequest = Pin<Box<dyn Future<Output = bool> + Send + 'static>>;

/// OS-level Bluetooth permission, owned outside the core
pub trait PermissionGate {
    fn is_granted(&self) -> bool;

    /// Ask the user or OS; resolves to the new grant status
    fn request(&self) -> PermissionRequest;
}

/// The single guard every public entry point runs before touching the stack.
pub fn ensure_granted<G: PermissionGate + ?Sized>(gate: &G) -> Result<(), BleError> {
    if gate.is_granted() {
        Ok(())
    } else {
        Err(BleError::PermissionDenied)
    }
}

/// Gate backed by a shared flag. Clones observe the same grant.
#[derive(Debug, Clone)]
pub struct SharedPermissionGate {
    granted: Arc<AtomicBool>,
}

impl SharedPermissionGate {
    pub fn new(granted: bool) -> Self {
        Self {
            granted: Arc::new(AtomicBool::new(granted)),
        }
    }

    #[cfg(test)]
    pub fn set_granted(&self, granted: bool) {
        self.granted.store(granted, Ordering::SeqCst);
    }
}

impl PermissionGate for SharedPermissionGate {
    fn is_granted(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    fn request(&self) -> PermissionRequest {
        let granted = self.granted.clone();
        Box::pin(async move { granted.load(Ordering::SeqCst) })
    }
}
