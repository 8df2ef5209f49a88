//! Bluetooth Service Module
//!
//! Coordinator between user intent, the scanner, the GATT session and the
//! display. Every handler runs to completion without awaiting anything.

use crate::domain::error::BleError;
use crate::domain::models::{
    AppEvent, BleEvent, BluetoothCommand, ConnectionState, CounterValue, DeviceIdentity,
    MessageSeverity, PeerRef, StatusMessage,
};
use crate::infrastructure::bluetooth::{
    scanner::BleScanner,
    session::{GattSession, SessionEvent},
    stack::{ensure_granted, BleStack, PermissionGate},
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService<S: BleStack, G: PermissionGate> {
    identity: DeviceIdentity,
    stack: S,
    gate: G,
    scanner: BleScanner,
    session: Option<GattSession>,
    latest_value: Option<CounterValue>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl<S: BleStack, G: PermissionGate> BluetoothService<S, G> {
    pub fn new(
        identity: DeviceIdentity,
        stack: S,
        gate: G,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            identity,
            stack,
            gate,
            scanner: BleScanner::new(identity.address),
            session: None,
            latest_value: None,
            event_sender,
        }
    }

    /// Snapshot of the connection state; `Scanning` while the scanner runs.
    pub fn state(&self) -> ConnectionState {
        if self.scanner.is_scanning() {
            return ConnectionState::Scanning;
        }
        self.session
            .as_ref()
            .map(GattSession::state)
            .unwrap_or(ConnectionState::Idle)
    }

    pub fn latest_value(&self) -> Option<CounterValue> {
        self.latest_value
    }

    #[cfg(test)]
    pub fn stack(&self) -> &S {
        &self.stack
    }

    pub fn handle_command(&mut self, command: BluetoothCommand) {
        match command {
            BluetoothCommand::Connect => self.request_connect(),
            BluetoothCommand::Disconnect => self.request_disconnect(),
        }
    }

    /// Start scanning unless a scan or a live session is already underway.
    pub fn request_connect(&mut self) {
        if let Err(e) = ensure_granted(&self.gate) {
            self.report_error(e);
            return;
        }
        if self.scanner.is_scanning() {
            debug!("Connect ignored, already scanning");
            return;
        }
        if let Some(session) = &self.session {
            let state = session.state();
            if state != ConnectionState::Idle && !state.is_terminal() {
                info!("Connect ignored, session is {}", state);
                return;
            }
        }

        // Finished sessions are replaced, never revived.
        self.session = None;
        match self.scanner.start(&mut self.stack, &self.gate) {
            Ok(()) => self.publish_state(ConnectionState::Scanning),
            Err(e) => self.report_error(e),
        }
    }

    /// Cancel a running scan and tear down the session. Safe in any state.
    pub fn request_disconnect(&mut self) {
        if self.scanner.is_scanning() {
            match self.scanner.stop(&mut self.stack, &self.gate) {
                Ok(()) => self.publish_state(self.state()),
                Err(e) => self.report_error(e),
            }
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        let result = session.disconnect(&mut self.stack, &self.gate);
        self.forward_session_events();
        if let Err(e) = result {
            self.report_error(e);
        }
    }

    /// Route one stack callback to the scanner or the session.
    pub fn handle_ble_event(&mut self, event: BleEvent) {
        if let BleEvent::AdvertisementReceived { address, peer } = &event {
            match self
                .scanner
                .on_advertisement(&mut self.stack, &self.gate, address, *peer)
            {
                Ok(Some(peer)) => self.start_session(peer),
                Ok(None) => {}
                Err(e) => self.report_error(e),
            }
            return;
        }

        let Some(session) = self.session.as_mut() else {
            debug!("No session for {} callback", event.name());
            return;
        };
        let result = session.handle_event(&mut self.stack, &self.gate, &event);
        self.forward_session_events();
        if let Err(e) = result {
            self.report_error(e);
        }
    }

    /// Drive the service from the command and callback channels until the UI hangs up.
    ///
    /// This is the only place that awaits; each message is handled synchronously.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<BluetoothCommand>,
        mut events: mpsc::UnboundedReceiver<BleEvent>,
    ) {
        if !self.gate.is_granted() {
            let granted = self.gate.request().await;
            info!("Bluetooth permission request answered: granted={}", granted);
        }
        self.publish_state(self.state());

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        // A connect intent re-asks after an earlier denial.
                        if command == BluetoothCommand::Connect && !self.gate.is_granted() {
                            let granted = self.gate.request().await;
                            info!("Bluetooth permission re-requested: granted={}", granted);
                        }
                        self.handle_command(command);
                    }
                    None => {
                        info!("Command channel closed, disconnecting");
                        self.request_disconnect();
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_ble_event(event),
            }
        }
        info!("Bluetooth service stopped, last value {:?}", self.latest_value());
    }

    fn start_session(&mut self, peer: PeerRef) {
        let mut session = GattSession::new(self.identity);
        let result = session.connect(&mut self.stack, &self.gate, peer);
        self.session = Some(session);
        self.forward_session_events();
        if let Err(e) = result {
            self.report_error(e);
        }
    }

    fn forward_session_events(&mut self) {
        let events = match self.session.as_mut() {
            Some(session) => session.take_events(),
            None => return,
        };
        for event in events {
            match event {
                SessionEvent::StateChanged(state) => self.publish_state(state),
                SessionEvent::Value(value) => {
                    self.latest_value = Some(value);
                    let _ = self.event_sender.send(AppEvent::ValueChanged(value));
                }
            }
        }
    }

    fn publish_state(&self, state: ConnectionState) {
        let _ = self.event_sender.send(AppEvent::StateChanged(state));
        self.send_status(state.status_text(), state.severity());
    }

    fn report_error(&self, e: BleError) {
        match e {
            BleError::PermissionDenied => {
                warn!("Bluetooth permission denied");
                self.send_status(e.to_string(), MessageSeverity::Error);
            }
            // Already visible through the Failed state.
            e if e.is_terminal_failure() => debug!("Session ended: {}", e),
            BleError::InvalidState(state) => warn!("Request rejected in state {}", state),
            e => {
                error!("Bluetooth error: {}", e);
                self.send_status(e.to_string(), MessageSeverity::Error);
            }
        }
    }

    fn send_status(&self, message: String, severity: MessageSeverity) {
        let _ = self
            .event_sender
            .send(AppEvent::StatusChanged(StatusMessage { message, severity }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{
        DiscoveredCharacteristic, DiscoveredService, FailureReason, GattHandle,
    };
    use crate::infrastructure::bluetooth::protocol::TARGET;
    use crate::infrastructure::bluetooth::simulated::{
        SimulatedStack, StackCall, StackOp, DECOY_ADDRESS,
    };
    use crate::infrastructure::bluetooth::stack::{PermissionRequest, SharedPermissionGate};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    type TestService = BluetoothService<SimulatedStack, SharedPermissionGate>;

    fn service(
        granted: bool,
    ) -> (
        TestService,
        SharedPermissionGate,
        mpsc::UnboundedReceiver<AppEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = SharedPermissionGate::new(granted);
        let service = BluetoothService::new(TARGET, SimulatedStack::new(), gate.clone(), tx);
        (service, gate, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<AppEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn states(events: &[AppEvent]) -> Vec<ConnectionState> {
        events
            .iter()
            .filter_map(|e| match e {
                AppEvent::StateChanged(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn advertise(service: &mut TestService, address: &str, peer: u64) {
        service.handle_ble_event(BleEvent::AdvertisementReceived {
            address: address.to_string(),
            peer: PeerRef(peer),
        });
    }

    fn services() -> Vec<DiscoveredService> {
        vec![DiscoveredService {
            uuid: TARGET.service_uuid.to_string(),
            characteristics: vec![DiscoveredCharacteristic {
                uuid: TARGET.characteristic_uuid.to_string(),
                descriptors: vec![TARGET.ccd_uuid.to_string()],
            }],
        }]
    }

    /// Scan, match and walk the session through to `Ready`.
    fn to_ready(service: &mut TestService) -> GattHandle {
        service.request_connect();
        advertise(service, TARGET.address, 3);
        let handle = GattHandle(1);
        service.handle_ble_event(BleEvent::ConnectionStateChanged {
            handle,
            connected: true,
        });
        service.handle_ble_event(BleEvent::ServicesDiscovered {
            handle,
            result: Ok(services()),
        });
        service.handle_ble_event(BleEvent::DescriptorWritten {
            handle,
            result: Ok(()),
        });
        handle
    }

    #[test]
    fn test_connect_without_permission_makes_no_stack_calls() {
        let (mut service, _gate, mut rx) = service(false);
        service.request_connect();

        assert!(service.stack().calls().is_empty());
        assert_eq!(service.state(), ConnectionState::Idle);
        assert_eq!(
            drain(&mut rx),
            vec![AppEvent::StatusChanged(StatusMessage {
                message: "Bluetooth permission denied".to_string(),
                severity: MessageSeverity::Error,
            })]
        );
    }

    #[test]
    fn test_full_flow_forwards_status_and_values() {
        let (mut service, _gate, mut rx) = service(true);
        let handle = to_ready(&mut service);
        service.handle_ble_event(BleEvent::CharacteristicChanged {
            handle,
            characteristic_uuid: TARGET.characteristic_uuid.to_string(),
            value: Some(vec![7]),
        });

        let events = drain(&mut rx);
        assert_eq!(
            states(&events),
            vec![
                ConnectionState::Scanning,
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::DiscoveringServices,
                ConnectionState::SubscribingNotifications,
                ConnectionState::Ready,
            ]
        );
        assert!(events.contains(&AppEvent::StatusChanged(StatusMessage {
            message: "Ready".to_string(),
            severity: MessageSeverity::Success,
        })));
        assert_eq!(events.last(), Some(&AppEvent::ValueChanged(CounterValue(7))));
        assert_eq!(service.latest_value(), Some(CounterValue(7)));
        assert_eq!(service.state(), ConnectionState::Ready);
        assert_eq!(
            &service.stack().calls()[..3],
            &[
                StackCall::StartScan,
                StackCall::StopScan,
                StackCall::Connect(PeerRef(3)),
            ]
        );
    }

    #[test]
    fn test_decoy_advertisements_do_not_connect() {
        let (mut service, _gate, _rx) = service(true);
        service.request_connect();
        advertise(&mut service, DECOY_ADDRESS, 1);

        assert_eq!(service.state(), ConnectionState::Scanning);
        assert_eq!(service.stack().calls(), &[StackCall::StartScan]);
    }

    #[test]
    fn test_connect_ignored_while_session_live() {
        let (mut service, _gate, mut rx) = service(true);
        to_ready(&mut service);
        drain(&mut rx);

        service.request_connect();
        assert!(drain(&mut rx).is_empty());
        let scans = service
            .stack()
            .calls()
            .iter()
            .filter(|c| **c == StackCall::StartScan)
            .count();
        assert_eq!(scans, 1);
    }

    #[test]
    fn test_connect_ignored_while_scanning() {
        let (mut service, _gate, mut rx) = service(true);
        service.request_connect();
        drain(&mut rx);

        service.request_connect();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(service.stack().calls(), &[StackCall::StartScan]);
    }

    #[test]
    fn test_reconnect_after_failure_rescans() {
        let (mut service, _gate, _rx) = service(true);
        service.request_connect();
        advertise(&mut service, TARGET.address, 3);
        service.handle_ble_event(BleEvent::ConnectionStateChanged {
            handle: GattHandle(1),
            connected: false,
        });
        assert_eq!(
            service.state(),
            ConnectionState::Failed(FailureReason::ConnectError)
        );

        // No automatic retry happens on its own.
        assert_eq!(
            service.stack().calls().last(),
            Some(&StackCall::Close(GattHandle(1)))
        );

        service.request_connect();
        assert_eq!(service.state(), ConnectionState::Scanning);
    }

    #[test]
    fn test_disconnect_from_ready() {
        let (mut service, _gate, mut rx) = service(true);
        let handle = to_ready(&mut service);
        drain(&mut rx);

        service.request_disconnect();
        assert_eq!(
            states(&drain(&mut rx)),
            vec![ConnectionState::Disconnecting, ConnectionState::Disconnected]
        );
        assert_eq!(service.stack().calls().last(), Some(&StackCall::Close(handle)));

        service.request_disconnect();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_disconnect_without_session_is_silent() {
        let (mut service, _gate, mut rx) = service(true);
        service.request_disconnect();

        assert!(drain(&mut rx).is_empty());
        assert!(service.stack().calls().is_empty());
    }

    #[test]
    fn test_disconnect_cancels_scan() {
        let (mut service, _gate, mut rx) = service(true);
        service.request_connect();
        drain(&mut rx);

        service.request_disconnect();
        assert_eq!(service.state(), ConnectionState::Idle);
        assert_eq!(states(&drain(&mut rx)), vec![ConnectionState::Idle]);
        assert_eq!(
            service.stack().calls(),
            &[StackCall::StartScan, StackCall::StopScan]
        );
    }

    #[test]
    fn test_scan_failure_is_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut stack = SimulatedStack::new();
        stack.fail_on(StackOp::StartScan);
        let mut service =
            BluetoothService::new(TARGET, stack, SharedPermissionGate::new(true), tx);

        service.request_connect();
        assert_eq!(service.state(), ConnectionState::Idle);
        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [AppEvent::StatusChanged(StatusMessage { severity: MessageSeverity::Error, .. })]
        ));
    }

    #[test]
    fn test_permission_revoked_mid_session() {
        let (mut service, gate, mut rx) = service(true);
        service.request_connect();
        advertise(&mut service, TARGET.address, 3);
        drain(&mut rx);
        let calls_before = service.stack().calls().len();

        gate.set_granted(false);
        service.handle_ble_event(BleEvent::ConnectionStateChanged {
            handle: GattHandle(1),
            connected: true,
        });

        assert_eq!(service.state(), ConnectionState::Connecting);
        assert_eq!(service.stack().calls().len(), calls_before);
        assert_eq!(
            drain(&mut rx),
            vec![AppEvent::StatusChanged(StatusMessage {
                message: "Bluetooth permission denied".to_string(),
                severity: MessageSeverity::Error,
            })]
        );
    }

    #[test]
    fn test_gatt_callback_without_session_is_dropped() {
        let (mut service, _gate, mut rx) = service(true);
        service.handle_ble_event(BleEvent::DescriptorWritten {
            handle: GattHandle(4),
            result: Ok(()),
        });
        assert!(drain(&mut rx).is_empty());
        assert_eq!(service.state(), ConnectionState::Idle);
    }

    /// Denies the first `deny_first` prompts, grants every later one.
    #[derive(Clone)]
    struct PromptingGate {
        granted: Arc<AtomicBool>,
        prompts: Arc<AtomicUsize>,
        deny_first: usize,
    }

    impl PromptingGate {
        fn new(deny_first: usize) -> Self {
            Self {
                granted: Arc::new(AtomicBool::new(false)),
                prompts: Arc::new(AtomicUsize::new(0)),
                deny_first,
            }
        }

        fn prompts(&self) -> usize {
            self.prompts.load(Ordering::SeqCst)
        }
    }

    impl PermissionGate for PromptingGate {
        fn is_granted(&self) -> bool {
            self.granted.load(Ordering::SeqCst)
        }

        fn request(&self) -> PermissionRequest {
            let prompt = self.prompts.fetch_add(1, Ordering::SeqCst) + 1;
            let allowed = prompt > self.deny_first;
            self.granted.store(allowed, Ordering::SeqCst);
            Box::pin(async move { allowed })
        }
    }

    fn denied_statuses(events: &[AppEvent]) -> usize {
        events
            .iter()
            .filter(|e| {
                matches!(e, AppEvent::StatusChanged(StatusMessage { message, .. })
                    if message == "Bluetooth permission denied")
            })
            .count()
    }

    #[tokio::test]
    async fn test_connect_after_startup_denial_prompts_again() {
        let (app_tx, mut app_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (_ble_tx, ble_rx) = mpsc::unbounded_channel();
        let gate = PromptingGate::new(1);
        let service = BluetoothService::new(TARGET, SimulatedStack::new(), gate.clone(), app_tx);

        cmd_tx.send(BluetoothCommand::Connect).unwrap();
        cmd_tx.send(BluetoothCommand::Connect).unwrap();
        drop(cmd_tx);
        service.run(cmd_rx, ble_rx).await;

        // Startup prompt denied, first connect granted, second already granted.
        assert_eq!(gate.prompts(), 2);
        let events = drain(&mut app_rx);
        assert_eq!(denied_statuses(&events), 0);
        assert!(states(&events).contains(&ConnectionState::Scanning));
    }

    #[tokio::test]
    async fn test_connect_prompts_each_time_while_denied() {
        let (app_tx, mut app_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (_ble_tx, ble_rx) = mpsc::unbounded_channel();
        let gate = PromptingGate::new(usize::MAX);
        let service = BluetoothService::new(TARGET, SimulatedStack::new(), gate.clone(), app_tx);

        cmd_tx.send(BluetoothCommand::Connect).unwrap();
        cmd_tx.send(BluetoothCommand::Connect).unwrap();
        cmd_tx.send(BluetoothCommand::Disconnect).unwrap();
        drop(cmd_tx);
        service.run(cmd_rx, ble_rx).await;

        assert_eq!(gate.prompts(), 3);
        let events = drain(&mut app_rx);
        assert_eq!(denied_statuses(&events), 2);
        assert!(!states(&events).contains(&ConnectionState::Scanning));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_against_simulated_peripheral() {
        let (app_tx, mut app_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ble_tx, ble_rx) = mpsc::unbounded_channel();
        let stack = SimulatedStack::with_peripheral(ble_tx, TARGET, Duration::from_millis(100));
        let service =
            BluetoothService::new(TARGET, stack, SharedPermissionGate::new(true), app_tx);
        let worker = tokio::spawn(service.run(cmd_rx, ble_rx));

        cmd_tx.send(BluetoothCommand::Connect).unwrap();
        let mut values = Vec::new();
        while values.len() < 3 {
            if let Some(AppEvent::ValueChanged(value)) = app_rx.recv().await {
                values.push(value);
            }
        }
        assert_eq!(values, vec![CounterValue(0), CounterValue(1), CounterValue(2)]);

        cmd_tx.send(BluetoothCommand::Disconnect).unwrap();
        drop(cmd_tx);
        worker.await.unwrap();

        let events = drain(&mut app_rx);
        assert_eq!(
            states(&events)
                .into_iter()
                .filter(|s| *s == ConnectionState::Disconnected)
                .count(),
            1
        );
    }
}
