use crate::domain::models::{CounterValue, StatusMessage};
use crate::presentation::theme::Palette;
use eframe::egui;

pub struct Components;

impl Components {
    pub fn card<R>(
        ui: &mut egui::Ui,
        title: &str,
        add_contents: impl FnOnce(&mut egui::Ui) -> R,
    ) -> R {
        let stroke = ui.style().visuals.widgets.noninteractive.bg_stroke;
        let bg = ui.style().visuals.widgets.noninteractive.bg_fill;

        egui::Frame::none()
            .inner_margin(egui::Margin::same(15.0))
            .stroke(stroke)
            .fill(bg)
            .show(ui, |ui| {
                ui.vertical(|ui| {
                    ui.label(egui::RichText::new(title).strong().size(18.0));
                    ui.add_space(8.0);
                    add_contents(ui)
                })
                .inner
            })
            .inner
    }

    pub fn status_banner(ui: &mut egui::Ui, palette: &Palette, status: &StatusMessage) {
        let (bg_color, text_color) = palette.banner_colors(status.severity);
        ui.add_sized(
            [ui.available_width(), 35.0],
            egui::Label::new(
                egui::RichText::new(status.message.to_uppercase())
                    .color(text_color)
                    .background_color(bg_color)
                    .size(16.0)
                    .strong(),
            )
            .wrap_mode(egui::TextWrapMode::Extend),
        );
    }

    /// Large readout of the last counter value, or a dash before the first one
    pub fn counter(ui: &mut egui::Ui, value: Option<CounterValue>) {
        let text = value.map_or_else(|| "-".to_string(), |v| v.to_string());
        ui.label(egui::RichText::new(text).monospace().size(72.0).strong());
    }
}
