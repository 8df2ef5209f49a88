//! BLE Scanner Module
//!
//! Filters advertisements for the target address and stops on the first hit.

use crate::domain::error::BleError;
use crate::domain::models::PeerRef;
use crate::infrastructure::bluetooth::stack::{ensure_granted, BleStack, PermissionGate};
use tracing::{debug, info, trace, warn};

/// Scanner for the single target peripheral
pub struct BleScanner {
    target_address: &'static str,
    scanning: bool,
}

impl BleScanner {
    pub fn new(target_address: &'static str) -> Self {
        Self {
            target_address,
            scanning: false,
        }
    }

    /// Start scanning. Calling it while already scanning is a no-op.
    pub fn start<S, G>(&mut self, stack: &mut S, gate: &G) -> Result<(), BleError>
    where
        S: BleStack + ?Sized,
        G: PermissionGate + ?Sized,
    {
        ensure_granted(gate)?;
        if self.scanning {
            debug!("Scan already running");
            return Ok(());
        }

        info!("Starting BLE scan for {}", self.target_address);
        stack.start_scan()?;
        self.scanning = true;
        Ok(())
    }

    /// Stop scanning. Safe to call when not scanning.
    pub fn stop<S, G>(&mut self, stack: &mut S, gate: &G) -> Result<(), BleError>
    where
        S: BleStack + ?Sized,
        G: PermissionGate + ?Sized,
    {
        if !self.scanning {
            return Ok(());
        }
        ensure_granted(gate)?;

        info!("Stopping BLE scan...");
        self.scanning = false;
        stack.stop_scan()
    }

    /// Feed one advertisement through the address filter.
    ///
    /// Returns the peer on the first match and stops scanning; anything seen
    /// after that is ignored.
    pub fn on_advertisement<S, G>(
        &mut self,
        stack: &mut S,
        gate: &G,
        address: &str,
        peer: PeerRef,
    ) -> Result<Option<PeerRef>, BleError>
    where
        S: BleStack + ?Sized,
        G: PermissionGate + ?Sized,
    {
        if !self.scanning {
            trace!("Advertisement from {} after scan stopped", address);
            return Ok(None);
        }
        if address != self.target_address {
            trace!("Skipping advertisement from {}", address);
            return Ok(None);
        }

        ensure_granted(gate)?;
        info!("Target device {} found", address);
        if let Err(e) = self.stop(stack, gate) {
            // The scanner is logically stopped either way.
            warn!("Failed to stop scan after match: {}", e);
        }
        Ok(Some(peer))
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }
}
