use crate::domain::models::{
    AppEvent, BluetoothCommand, ConnectionState, CounterValue, MessageSeverity, StatusMessage,
};
use crate::domain::settings::{Settings, SettingsService};
use crate::infrastructure::bluetooth::protocol::TARGET;
use crate::infrastructure::bluetooth::simulated::SimulatedStack;
use crate::infrastructure::bluetooth::stack::SharedPermissionGate;
use crate::infrastructure::bluetooth::BluetoothService;
use crate::infrastructure::logging::{init_logger, LoggingGuard};
use crate::presentation::components::Components;
use crate::presentation::theme::{self, Palette};
use eframe::egui;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

pub struct CounterApp {
    settings: SettingsService,

    // Bluetooth
    bluetooth_tx: mpsc::UnboundedSender<BluetoothCommand>,
    event_rx: mpsc::UnboundedReceiver<AppEvent>,

    // State
    connection_state: ConnectionState,
    status_message: StatusMessage,
    counter: Option<CounterValue>,

    is_dark_mode: bool,
    _logging_guard: Option<LoggingGuard>,
}

impl CounterApp {
    pub fn new(cc: &eframe::CreationContext<'_>) -> Self {
        let settings = SettingsService::new().unwrap_or_else(|e| {
            eprintln!("Failed to locate settings, using local file: {}", e);
            SettingsService::from_path(PathBuf::from("settings.json"))
        });

        let logging_guard = init_logger(&settings.get().log_settings)
            .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
            .ok();

        info!("Starting BLE Counter Viewer");

        let is_dark_mode = settings.get().dark_mode;
        theme::configure(&cc.egui_ctx, is_dark_mode);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (bluetooth_tx, bluetooth_rx) = mpsc::unbounded_channel();
        spawn_bluetooth_worker(settings.get(), event_tx, bluetooth_rx);

        Self {
            settings,
            bluetooth_tx,
            event_rx,
            connection_state: ConnectionState::Idle,
            status_message: status_for(ConnectionState::Idle),
            counter: None,
            is_dark_mode,
            _logging_guard: logging_guard,
        }
    }

    fn apply_event(&mut self, event: AppEvent) {
        match event {
            AppEvent::StatusChanged(status) => self.status_message = status,
            AppEvent::StateChanged(state) => self.connection_state = state,
            AppEvent::ValueChanged(value) => self.counter = Some(value),
        }
    }

    fn can_connect(&self) -> bool {
        matches!(
            self.connection_state,
            ConnectionState::Idle | ConnectionState::Disconnected | ConnectionState::Failed(_)
        )
    }

    fn send(&self, command: BluetoothCommand) {
        if self.bluetooth_tx.send(command).is_err() {
            error!("Bluetooth worker is gone, dropping {:?}", command);
        }
    }

    fn toggle_theme(&mut self, ctx: &egui::Context) {
        self.is_dark_mode = !self.is_dark_mode;
        theme::configure(ctx, self.is_dark_mode);
        if let Err(e) = self.settings.set_dark_mode(self.is_dark_mode) {
            error!("Failed to save settings: {}", e);
        }
    }

    fn ui_connection_panel(&self, ui: &mut egui::Ui) {
        let palette = Palette::new(self.is_dark_mode);
        Components::card(ui, "Connection", |ui| {
            Components::status_banner(ui, &palette, &self.status_message);
            ui.add_space(10.0);

            ui.horizontal(|ui| {
                if ui
                    .add_enabled(self.can_connect(), egui::Button::new("Connect"))
                    .clicked()
                {
                    self.send(BluetoothCommand::Connect);
                }
                if ui
                    .add_enabled(!self.can_connect(), egui::Button::new("Disconnect"))
                    .clicked()
                {
                    self.send(BluetoothCommand::Disconnect);
                }
                if !self.can_connect() && self.connection_state != ConnectionState::Ready {
                    ui.spinner();
                }
            });
        });
    }

    fn ui_counter_panel(&self, ui: &mut egui::Ui) {
        Components::card(ui, "Counter", |ui| {
            ui.vertical_centered(|ui| Components::counter(ui, self.counter));
            ui.label(format!("Device: {}", TARGET.address));
        });
    }
}

impl eframe::App for CounterApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        while let Ok(event) = self.event_rx.try_recv() {
            self.apply_event(event);
        }
        ctx.request_repaint_after(Duration::from_millis(100));

        egui::TopBottomPanel::top("top_panel").show(ctx, |ui| {
            egui::menu::bar(ui, |ui| {
                ui.strong("BLE Counter Viewer");
                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    let switch_icon = if self.is_dark_mode {
                        "☀ Light"
                    } else {
                        "🌙 Dark"
                    };
                    if ui.button(switch_icon).clicked() {
                        self.toggle_theme(ctx);
                    }
                });
            });
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.vertical_centered(|ui| {
                ui.set_max_width(500.0);
                ui.add_space(20.0);
                self.ui_connection_panel(ui);
                ui.add_space(15.0);
                self.ui_counter_panel(ui);
            });
        });
    }
}

fn status_for(state: ConnectionState) -> StatusMessage {
    StatusMessage {
        message: state.status_text(),
        severity: state.severity(),
    }
}

/// Start the Bluetooth worker: one thread owning a current-thread runtime
/// that drives the coordinator until the UI drops its command sender.
fn spawn_bluetooth_worker(
    settings: &Settings,
    event_tx: mpsc::UnboundedSender<AppEvent>,
    commands: mpsc::UnboundedReceiver<BluetoothCommand>,
) {
    let use_simulator = settings.use_simulator;
    let notify_interval = Duration::from_millis(settings.simulator_notify_interval_ms);

    let spawned = std::thread::Builder::new()
        .name("bluetooth".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Failed to create tokio runtime for Bluetooth: {}", e);
                    let _ = event_tx.send(AppEvent::StatusChanged(StatusMessage {
                        message: format!("Bluetooth unavailable: {}", e),
                        severity: MessageSeverity::Error,
                    }));
                    return;
                }
            };

            rt.block_on(async move {
                let (ble_tx, ble_rx) = mpsc::unbounded_channel();

                #[cfg(windows)]
                {
                    use crate::infrastructure::bluetooth::winrt::{RadioAccessGate, WinRtStack};
                    if !use_simulator {
                        info!("Using WinRT Bluetooth stack");
                        let stack = WinRtStack::new(ble_tx);
                        BluetoothService::new(TARGET, stack, RadioAccessGate::default(), event_tx)
                            .run(commands, ble_rx)
                            .await;
                        return;
                    }
                }
                #[cfg(not(windows))]
                {
                    if !use_simulator {
                        info!("No platform Bluetooth backend on this OS");
                    }
                }

                info!("Using simulated peripheral every {:?}", notify_interval);
                let stack = SimulatedStack::with_peripheral(ble_tx, TARGET, notify_interval);
                BluetoothService::new(TARGET, stack, SharedPermissionGate::new(true), event_tx)
                    .run(commands, ble_rx)
                    .await;
            });
        });

    if let Err(e) = spawned {
        error!("Failed to spawn Bluetooth worker: {}", e);
    }
}
