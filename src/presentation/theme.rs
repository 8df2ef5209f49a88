use crate::domain::models::MessageSeverity;
use eframe::egui;

/// Flat, square-cornered look shared by both modes
pub struct Palette {
    pub bg: egui::Color32,
    pub fg: egui::Color32,
    pub ready: egui::Color32,
    pub failed: egui::Color32,
    pub idle: egui::Color32,
}

impl Palette {
    pub fn new(is_dark: bool) -> Self {
        if is_dark {
            Self {
                bg: egui::Color32::from_rgb(25, 25, 25),
                fg: egui::Color32::WHITE,
                ready: egui::Color32::from_rgb(0, 200, 110),
                failed: egui::Color32::from_rgb(230, 70, 70),
                idle: egui::Color32::from_gray(70),
            }
        } else {
            Self {
                bg: egui::Color32::from_rgb(245, 245, 245),
                fg: egui::Color32::BLACK,
                ready: egui::Color32::from_rgb(0, 220, 100),
                failed: egui::Color32::from_rgb(255, 50, 50),
                idle: egui::Color32::from_gray(110),
            }
        }
    }

    /// Banner (background, text) colours for a status line
    pub fn banner_colors(&self, severity: MessageSeverity) -> (egui::Color32, egui::Color32) {
        match severity {
            MessageSeverity::Success => (self.ready, egui::Color32::BLACK),
            MessageSeverity::Error => (self.failed, egui::Color32::WHITE),
            MessageSeverity::Info => (self.idle, egui::Color32::WHITE),
        }
    }
}

/// Start from egui's stock visuals for the mode and square off the widgets.
pub fn configure(ctx: &egui::Context, is_dark: bool) {
    let palette = Palette::new(is_dark);
    let mut visuals = if is_dark {
        egui::Visuals::dark()
    } else {
        egui::Visuals::light()
    };

    visuals.panel_fill = palette.bg;
    visuals.window_fill = palette.bg;
    visuals.override_text_color = Some(palette.fg);
    visuals.window_rounding = egui::Rounding::ZERO;

    let outline = egui::Stroke::new(2.0, palette.fg);
    for widget in [
        &mut visuals.widgets.noninteractive,
        &mut visuals.widgets.inactive,
        &mut visuals.widgets.hovered,
        &mut visuals.widgets.active,
    ] {
        widget.rounding = egui::Rounding::ZERO;
        widget.bg_stroke = outline;
    }
    visuals.widgets.noninteractive.bg_fill = palette.bg;
    visuals.widgets.active.bg_fill = palette.ready;

    ctx.set_visuals(visuals);
    ctx.style_mut(|style| {
        style.spacing.item_spacing = egui::vec2(12.0, 12.0);
        style.spacing.button_padding = egui::vec2(16.0, 10.0);
    });
}
