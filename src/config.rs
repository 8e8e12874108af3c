// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Configuration file. Searched at `--config`, then
//! `~/.config/apklink/config.toml`, then `/etc/apklink/config.toml`;
//! built-in defaults apply when none exists.

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use tracing::info;
use crate::listener::ListenerSettings;
use crate::modem::ModemSettings;
use crate::protocol::{DEFAULT_PORT, MAX_ERRORS};
use crate::session::SessionSettings;
use crate::transfer::AckMode;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub modem: ModemConfig,
    pub bridge: BridgeConfig,
    pub package: PackageConfig,
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub save_dir: PathBuf,
    /// Name the verified artifact is staged under
    pub artifact_name: String,
    pub ack_mode: AckMode,
    pub header_attempts: u32,
    pub header_retry_delay_ms: u64,
    /// Consecutive socket errors tolerated before the listener is rebuilt
    pub socket_error_budget: u32,
    pub rebuild_delay_ms: u64,
    pub bind_retry_delay_ms: u64,
    pub eot_settle_ms: u64,
    pub peer_eot_timeout_ms: u64,
    pub install_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            save_dir: PathBuf::from("./received"),
            artifact_name: "firmware.apk".into(),
            ack_mode: AckMode::EndOfTransfer,
            header_attempts: 3,
            header_retry_delay_ms: 2000,
            socket_error_budget: 3,
            rebuild_delay_ms: 5000,
            bind_retry_delay_ms: 10000,
            eot_settle_ms: 3000,
            peer_eot_timeout_ms: 10000,
            install_delay_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModemConfig {
    pub request_timeout_ms: u64,
    pub block_timeout_ms: u64,
    pub max_errors: u32,
}

impl Default for ModemConfig {
    fn default() -> Self {
        ModemConfig {
            request_timeout_ms: 3000,
            block_timeout_ms: 10000,
            max_errors: MAX_ERRORS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub enabled: bool,
    pub device: String,
    pub baud_rate: u32,
    pub poll_interval_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            enabled: false,
            device: "/dev/rfcomm0".into(),
            baud_rate: 115200,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackageConfig {
    /// Installed packages are searched under this name prefix
    pub prefix: String,
    /// Packages under the prefix that are never the install target
    pub ignore: Vec<String>,
    pub list_command: Vec<String>,
    pub dump_command: Vec<String>,
    pub badging_command: Vec<String>,
}

impl Default for PackageConfig {
    fn default() -> Self {
        PackageConfig {
            prefix: "com.example".into(),
            ignore: vec!["com.example.apkdownloader".into()],
            list_command: vec!["pm".into(), "list".into(), "packages".into()],
            dump_command: vec!["dumpsys".into(), "package".into()],
            badging_command: vec!["aapt".into(), "dump".into(), "badging".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    pub reboot_command: Vec<String>,
    pub snapshot_file: PathBuf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            reboot_command: vec!["su".into(), "-c".into(), "reboot".into()],
            snapshot_file: PathBuf::from("device_status.json"),
        }
    }
}

// ============================================================================
// Command-line Overrides
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub save_dir: Option<PathBuf>,
    pub ack_per_block: bool,
    pub bridge: Option<String>,
}

impl Config {
    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(save_dir) = &overrides.save_dir {
            self.server.save_dir = save_dir.clone();
        }
        if overrides.ack_per_block {
            self.server.ack_mode = AckMode::PerBlock;
        }
        if let Some(device) = &overrides.bridge {
            self.bridge.enabled = true;
            self.bridge.device = device.clone();
        }
    }

    pub fn modem_settings(&self) -> ModemSettings {
        ModemSettings {
            request_timeout: Duration::from_millis(self.modem.request_timeout_ms),
            block_timeout: Duration::from_millis(self.modem.block_timeout_ms),
            max_errors: self.modem.max_errors.max(1),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        let server = &self.server;
        SessionSettings {
            save_dir: server.save_dir.clone(),
            artifact_name: server.artifact_name.clone(),
            ack_mode: server.ack_mode,
            modem: self.modem_settings(),
            header_attempts: server.header_attempts.max(1),
            header_retry_delay: Duration::from_millis(server.header_retry_delay_ms),
            eot_settle: Duration::from_millis(server.eot_settle_ms),
            peer_eot_timeout: Duration::from_millis(server.peer_eot_timeout_ms),
            install_delay: Duration::from_millis(server.install_delay_ms),
        }
    }

    pub fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            socket_error_budget: self.server.socket_error_budget,
            rebuild_delay: Duration::from_millis(self.server.rebuild_delay_ms),
            bind_retry_delay: Duration::from_millis(self.server.bind_retry_delay_ms),
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(home.join(".config/apklink/config.toml"));
    }
    out.push(PathBuf::from("/etc/apklink/config.toml"));
    out
}

pub fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "configuration loaded");
    Ok(config)
}

/// Loads `explicit` if given, else the first config file found, else defaults.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    if let Some(path) = explicit {
        return load_file(path);
    }

    match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path),
        None => Ok(Config::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 55556);
        assert_eq!(config.server.ack_mode, AckMode::EndOfTransfer);
        assert!(!config.bridge.enabled);

        let session = config.session_settings();
        assert_eq!(session.modem.request_timeout, Duration::from_secs(3));
        assert_eq!(session.modem.block_timeout, Duration::from_secs(10));
        assert_eq!(session.header_attempts, 3);
        assert_eq!(config.listener_settings().socket_error_budget, 3);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 6000
            ack_mode = "per-block"

            [package]
            prefix = "kr.example"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 6000);
        assert_eq!(config.server.ack_mode, AckMode::PerBlock);
        assert_eq!(config.server.artifact_name, "firmware.apk");
        assert_eq!(config.package.prefix, "kr.example");
        assert_eq!(config.package.list_command, vec!["pm", "list", "packages"]);
        assert_eq!(config.modem.max_errors, 10);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("[server]\nprot = 1\n").is_err());
        assert!(toml::from_str::<Config>("[serverr]\n").is_err());
        assert!(toml::from_str::<Config>("[server]\nack_mode = \"sometimes\"\n").is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config.apply(&Overrides {
            port: Some(7000),
            save_dir: Some(PathBuf::from("/tmp/in")),
            ack_per_block: true,
            bridge: Some("/dev/rfcomm1".into()),
        });

        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.save_dir, PathBuf::from("/tmp/in"));
        assert_eq!(config.server.ack_mode, AckMode::PerBlock);
        assert!(config.bridge.enabled);
        assert_eq!(config.bridge.device, "/dev/rfcomm1");
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[modem]\nblock_timeout_ms = 500\n").unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.modem_settings().block_timeout, Duration::from_millis(500));

        let err = load(Some(&dir.path().join("missing.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));

        std::fs::write(&path, "[modem\n").unwrap();
        assert!(matches!(load(Some(&path)).unwrap_err(), ConfigError::Parse { .. }));
    }
}
