use crate::domain::command::CommandKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
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
            file_logging_enabled: default_false(),
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
    "peripheral_session".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Per-kind ceilings for a dispatched command, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandTimeouts {
    #[serde(default = "default_gatt_timeout_ms")]
    pub read_ms: u64,
    #[serde(default = "default_gatt_timeout_ms")]
    pub write_ms: u64,
    #[serde(default = "default_gatt_timeout_ms")]
    pub descriptor_ms: u64,
    #[serde(default = "default_gatt_timeout_ms")]
    pub notify_ms: u64,
    #[serde(default = "default_link_timeout_ms")]
    pub mtu_ms: u64,
    #[serde(default = "default_link_timeout_ms")]
    pub rssi_ms: u64,
    #[serde(default = "default_link_timeout_ms")]
    pub priority_ms: u64,
    #[serde(default = "default_link_timeout_ms")]
    pub phy_ms: u64,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            read_ms: default_gatt_timeout_ms(),
            write_ms: default_gatt_timeout_ms(),
            descriptor_ms: default_gatt_timeout_ms(),
            notify_ms: default_gatt_timeout_ms(),
            mtu_ms: default_link_timeout_ms(),
            rssi_ms: default_link_timeout_ms(),
            priority_ms: default_link_timeout_ms(),
            phy_ms: default_link_timeout_ms(),
        }
    }
}

impl CommandTimeouts {
    /// Ceiling for a GATT command. Bonding is governed by
    /// [`Settings::bond_timeout`] instead.
    pub fn for_kind(&self, kind: CommandKind, bond_timeout: Duration) -> Duration {
        let ms = match kind {
            CommandKind::ReadCharacteristic => self.read_ms,
            CommandKind::WriteCharacteristic => self.write_ms,
            CommandKind::ReadDescriptor | CommandKind::WriteDescriptor => self.descriptor_ms,
            CommandKind::SetNotify => self.notify_ms,
            CommandKind::RequestMtu => self.mtu_ms,
            CommandKind::ReadRssi => self.rssi_ms,
            CommandKind::RequestConnectionPriority => self.priority_ms,
            CommandKind::SetPreferredPhy => self.phy_ms,
            CommandKind::CreateBond => return bond_timeout,
        };
        Duration::from_millis(ms)
    }
}

fn default_gatt_timeout_ms() -> u64 {
    30_000
}
fn default_link_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_false")]
    pub enabled: bool,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// `None` keeps trying forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: default_false(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: None,
        }
    }
}

fn default_initial_backoff_ms() -> u64 {
    2000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub timeouts: CommandTimeouts,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
    #[serde(default = "default_bond_timeout_ms")]
    pub bond_timeout_ms: u64,
    #[serde(default)]
    pub auto_reconnect: ReconnectSettings,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timeouts: CommandTimeouts::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            bond_timeout_ms: default_bond_timeout_ms(),
            auto_reconnect: ReconnectSettings::default(),
            log_settings: LogSettings::default(),
        }
    }
}

impl Settings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn bond_timeout(&self) -> Duration {
        Duration::from_millis(self.bond_timeout_ms)
    }

    pub fn command_timeout(&self, kind: CommandKind) -> Duration {
        self.timeouts.for_kind(kind, self.bond_timeout())
    }
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}
fn default_disconnect_timeout_ms() -> u64 {
    5_000
}
fn default_bond_timeout_ms() -> u64 {
    60_000
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load from the platform config directory, falling back to defaults
    /// when the file is missing or unreadable.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("PeripheralSession");
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

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn set_auto_reconnect(&mut self, enabled: bool) -> anyhow::Result<()> {
        self.settings.auto_reconnect.enabled = enabled;
        self.save()
    }
}
