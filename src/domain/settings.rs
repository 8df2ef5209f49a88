use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "ble_counter_viewer".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_notify_interval_ms() -> u64 {
    1000
}

/// User preferences. The target device identity is not part of this on purpose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,

    /// Drive the simulated peripheral instead of the platform stack
    #[serde(default = "default_false")]
    pub use_simulator: bool,
    #[serde(default = "default_notify_interval_ms")]
    pub simulator_notify_interval_ms: u64,

    #[serde(default = "default_false")]
    pub dark_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            use_simulator: default_false(),
            simulator_notify_interval_ms: default_notify_interval_ms(),
            dark_mode: default_false(),
        }
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults when it is missing or invalid.
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleCounterViewer");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    #[cfg(test)]
    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn set_dark_mode(&mut self, dark_mode: bool) -> anyhow::Result<()> {
        if self.settings.dark_mode != dark_mode {
            self.settings.dark_mode = dark_mode;
            self.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_settings_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "ble_counter_viewer_{}_{}.json",
            name,
            std::process::id()
        ))
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"use_simulator": true}"#).unwrap();
        assert!(settings.use_simulator);
        assert_eq!(settings.simulator_notify_interval_ms, 1000);
        assert_eq!(settings.log_settings.level, "info");
        assert_eq!(settings.log_settings.rotation, "daily");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let path = temp_settings_path("missing");
        let _ = fs::remove_file(&path);
        let service = SettingsService::from_path(path);
        assert!(!service.get().use_simulator);
        assert!(!service.get().dark_mode);
    }

    #[test]
    fn test_save_and_reload() {
        let path = temp_settings_path("reload");
        let mut service = SettingsService::from_path(path.clone());
        service.get_mut().simulator_notify_interval_ms = 250;
        service.set_dark_mode(true).unwrap();

        let reloaded = SettingsService::from_path(path.clone());
        assert!(reloaded.get().dark_mode);
        assert_eq!(reloaded.get().simulator_notify_interval_ms, 250);
        let _ = fs::remove_file(&path);
    }
}
