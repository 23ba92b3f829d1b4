//! Configuration file support for coflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (COFLASH_*)
//! 3. Local config file (./coflash.toml, ./coflash_ports.toml)
//! 4. Global config file (~/.config/coflash/config.toml)

use coflash::session::retry::RetryPolicy;
use coflash::{FailureAction, UpdateConfig};
use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOCAL_CONFIG: &str = "coflash.toml";
const LOCAL_PORTS: &str = "coflash_ports.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
}

/// Update tuning. Unset fields keep the library defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSettings {
    /// Interval between SYNC attempts.
    pub sync_interval_ms: Option<u64>,
    /// Give up after this many SYNC attempts.
    pub max_sync_attempts: Option<u32>,
    /// Interval between SYNC attempts after a failed block.
    pub resync_interval_ms: Option<u64>,
    /// Give up after this many resync attempts.
    pub max_resync_attempts: Option<u32>,
    /// Pause between a successful seal and the jump.
    pub jump_delay_ms: Option<u64>,
    /// Request a restart instead of reporting a rejected seal.
    #[serde(default)]
    pub restart_on_seal_failure: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Update settings.
    #[serde(default)]
    pub update: UpdateSettings,
}

/// Remembered port, kept apart from the hand-written config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PortsFile {
    #[serde(default)]
    connection: ConnectionConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        if let Some(serial) = Self::load_remembered_port() {
            config.connection.serial = Some(serial);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    fn load_remembered_port() -> Option<String> {
        let candidates = [
            Some(PathBuf::from(LOCAL_PORTS)),
            Self::global_config_dir().map(|dir| dir.join("ports.toml")),
        ];

        candidates
            .into_iter()
            .flatten()
            .filter(|path| path.exists())
            .find_map(|path| {
                let content = fs::read_to_string(&path).ok()?;
                let ports: PortsFile = toml::from_str(&content).ok()?;
                debug!("Loaded remembered port from {}", path.display());
                ports.connection.serial
            })
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "coflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.connection.serial.is_some() {
            self.connection.serial = other.connection.serial;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }

        let update = other.update;
        if update.sync_interval_ms.is_some() {
            self.update.sync_interval_ms = update.sync_interval_ms;
        }
        if update.max_sync_attempts.is_some() {
            self.update.max_sync_attempts = update.max_sync_attempts;
        }
        if update.resync_interval_ms.is_some() {
            self.update.resync_interval_ms = update.resync_interval_ms;
        }
        if update.max_resync_attempts.is_some() {
            self.update.max_resync_attempts = update.max_resync_attempts;
        }
        if update.jump_delay_ms.is_some() {
            self.update.jump_delay_ms = update.jump_delay_ms;
        }
        if update.restart_on_seal_failure {
            self.update.restart_on_seal_failure = true;
        }
    }

    /// Build the orchestrator configuration from the `[update]` section.
    pub fn to_update_config(&self) -> UpdateConfig {
        let mut config = UpdateConfig::default();
        let update = &self.update;
        let session = &mut config.session;

        if let Some(ms) = update.sync_interval_ms {
            session.sync = RetryPolicy::fixed(Duration::from_millis(ms));
        }
        session.sync = session
            .sync
            .with_max_attempts(update.max_sync_attempts);

        if let Some(ms) = update.resync_interval_ms {
            session.resync = RetryPolicy::fixed(Duration::from_millis(ms));
        }
        session.resync = session
            .resync
            .with_max_attempts(update.max_resync_attempts);

        if let Some(ms) = update.jump_delay_ms {
            session.jump_delay = Duration::from_millis(ms);
        }

        if update.restart_on_seal_failure {
            config.failure_policy.seal = FailureAction::Restart;
        }

        config
    }

    /// Remember the serial port for later runs.
    ///
    /// Writes `coflash_ports.toml` next to a local config, otherwise the
    /// global `ports.toml`.
    pub fn remember_port(&mut self, serial: &str) -> anyhow::Result<()> {
        let path = if Path::new(LOCAL_CONFIG).exists() || Path::new(LOCAL_PORTS).exists() {
            PathBuf::from(LOCAL_PORTS)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("ports.toml")
        } else {
            PathBuf::from(LOCAL_PORTS)
        };

        self.save_port_to(&path, serial)?;
        self.connection.serial = Some(serial.to_string());
        Ok(())
    }

    #[allow(clippy::unused_self)]
    fn save_port_to(&self, path: &Path, serial: &str) -> anyhow::Result<()> {
        let ports = PortsFile {
            connection: ConnectionConfig {
                serial: Some(serial.to_string()),
                baud: None,
            },
        };
        let content = toml::to_string_pretty(&ports)?;
        fs::write(path, content)?;
        info!("Saved port {serial} to {}", path.display());
        Ok(())
    }
}
