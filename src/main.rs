mod domain;
mod infrastructure;
mod presentation;

use eframe::egui;

fn main() -> eframe::Result<()> {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([520.0, 480.0])
            .with_title("BLE Counter Viewer"),
        ..Default::default()
    };

    eframe::run_native(
        "BLE Counter Viewer",
        options,
        Box::new(|cc| Ok(Box::new(presentation::app::CounterApp::new(cc)))),
    )
}
