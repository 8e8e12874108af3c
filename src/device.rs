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

//! Device-side collaborators the orchestrator is handed at construction:
//! reboot action, device-state snapshot and progress sink.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// ============================================================================
// Reboot Action
// ============================================================================

pub trait RebootAction: Send + Sync {
    fn reboot(&self) -> std::io::Result<()>;
}

/// Runs an external command, e.g. `su -c reboot`.
pub struct CommandReboot {
    pub command: Vec<String>,
}

impl RebootAction for CommandReboot {
    fn reboot(&self) -> std::io::Result<()> {
        let (program, args) = self.command.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty reboot command")
        })?;

        info!(command = ?self.command, "rebooting device");
        let status = Command::new(program).args(args).status()?;
        if !status.success() {
            return Err(std::io::Error::other(format!("reboot command exited with {}", status)));
        }
        Ok(())
    }
}

// ============================================================================
// Snapshot Provider
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot file: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait SnapshotProvider: Send + Sync {
    /// Serialized device state, written to the stream as is.
    fn snapshot(&self) -> Result<Vec<u8>, SnapshotError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceSnapshot {
    pub timestamp: String,

    pub ai_status: bool,
    pub ao_status: bool,
    pub ethernet_status: bool,
    pub serial_status: bool,
    pub satellite_remote_control_status: bool,

    pub door_open: bool,
    pub power_available: bool,

    pub water_level: f64,
    pub water_level2: f64,
    pub rain_fall: f64,
    pub battery_voltage: f64,

    pub rtu_id: String,
    pub group_id: String,
    pub dam_code: String,

    pub eth0_user_type: bool,
    pub eth0_ip_address: String,
    pub eth0_subnet_mask: String,
    pub eth0_gateway: String,

    pub eth1_user_type: bool,
    pub eth1_ip_address: String,
    pub eth1_subnet_mask: String,
    pub eth1_gateway: String,

    /// BCD level gauge bits, then door and mains inputs
    pub di_data: String,
    pub do_data: String,
    pub ai_data: Vec<f64>,
    pub ao_data: Vec<f64>,

    pub sensor_alert: bool,
    pub pulse_per_mm: f64,
}

impl DeviceSnapshot {
    /// Stand-in used until the device writes a real status file.
    pub fn placeholder() -> Self {
        DeviceSnapshot {
            timestamp: current_timestamp(),
            ai_status: true,
            ao_status: false,
            ethernet_status: true,
            serial_status: false,
            satellite_remote_control_status: false,
            door_open: false,
            power_available: true,
            water_level: 100.5,
            water_level2: 101.5,
            rain_fall: 10.2,
            battery_voltage: 120.8,
            rtu_id: "1".into(),
            group_id: "1".into(),
            dam_code: "1234567".into(),
            eth0_user_type: true,
            eth0_ip_address: "192.168.0.137".into(),
            eth0_subnet_mask: "255.255.255.0".into(),
            eth0_gateway: "192.168.0.1".into(),
            eth1_user_type: true,
            eth1_ip_address: "192.168.0.135".into(),
            eth1_subnet_mask: "255.255.255.0".into(),
            eth1_gateway: "192.168.0.1".into(),
            di_data: "00000 00000 00000 00000 1 2".into(),
            do_data: "1 1 0 0 1 0 0 1".into(),
            ai_data: vec![4.1, 3.9, 4.0, 4.2],
            ao_data: vec![3.8, 4.0, 4.1, 3.9],
            sensor_alert: false,
            pulse_per_mm: 0.5,
        }
    }
}

pub fn current_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// Device state kept in a JSON file; the timestamp is refreshed and written
/// back on every request.
pub struct FileSnapshotProvider {
    path: PathBuf,
}

impl FileSnapshotProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSnapshotProvider { path: path.into() }
    }
}

impl SnapshotProvider for FileSnapshotProvider {
    fn snapshot(&self) -> Result<Vec<u8>, SnapshotError> {
        let mut snapshot = match fs::read_to_string(&self.path) {
            Ok(text) => {
                debug!(path = %self.path.display(), "device state loaded");
                serde_json::from_str::<DeviceSnapshot>(&text)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no device state file, using placeholder");
                DeviceSnapshot::placeholder()
            }
            Err(e) => return Err(e.into()),
        };

        snapshot.timestamp = current_timestamp();
        let json = serde_json::to_string_pretty(&snapshot)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, &json)?;

        Ok(json.into_bytes())
    }
}

// ============================================================================
// Progress Sink
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    HeaderReceived { file_name: String, expected_size: u64 },
    Block { index: u32, total: u32, percent: f32 },
    PayloadComplete { bytes: u64 },
    Verdict { install: bool, comment: String },
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Writes every event to the tracing subscriber.
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::HeaderReceived { file_name, expected_size } => {
                info!(file = %file_name, size = expected_size, "transfer starting");
            }
            ProgressEvent::Block { index, total, percent } => {
                info!(packet = index.saturating_add(1), total, "receiving... {:.1}%", percent);
            }
            ProgressEvent::PayloadComplete { bytes } => {
                info!(bytes, "transfer complete");
            }
            ProgressEvent::Verdict { install, comment } => {
                info!(install, "{}", comment);
            }
        }
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct RecordingProgress {
    events: std::sync::Mutex<Vec<ProgressEvent>>,
}

#[cfg(test)]
impl RecordingProgress {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl ProgressSink for RecordingProgress {
    fn report(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_written_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("device_status.json");
        let provider = FileSnapshotProvider::new(&path);

        let bytes = provider.snapshot().unwrap();
        let sent: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(sent["waterLevel"], 100.5);
        assert_eq!(sent["damCode"], "1234567");
        assert_eq!(sent["aiData"].as_array().unwrap().len(), 4);

        // The file on disk is what was sent
        assert_eq!(fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn test_existing_state_keeps_values_and_refreshes_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device_status.json");
        fs::write(&path, r#"{"timestamp": "old", "waterLevel": 7.25, "rtuId": "42"}"#).unwrap();

        let bytes = FileSnapshotProvider::new(&path).snapshot().unwrap();
        let snapshot: DeviceSnapshot = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(snapshot.water_level, 7.25);
        assert_eq!(snapshot.rtu_id, "42");
        assert_ne!(snapshot.timestamp, "old");

        // yyyy-mm-dd hh:mm:ss.mmm
        assert_eq!(snapshot.timestamp.len(), 23);
        assert_eq!(&snapshot.timestamp[10..11], " ");
        assert_eq!(&snapshot.timestamp[19..20], ".");
    }

    #[test]
    fn test_corrupt_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device_status.json");
        fs::write(&path, "{ not json").unwrap();

        let err = FileSnapshotProvider::new(&path).snapshot().unwrap_err();
        assert!(matches!(err, SnapshotError::Json(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_reboot() {
        assert!(CommandReboot { command: vec!["true".into()] }.reboot().is_ok());
        assert!(CommandReboot { command: vec!["false".into()] }.reboot().is_err());

        let err = CommandReboot { command: vec![] }.reboot().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_recording_progress() {
        let sink = RecordingProgress::default();
        sink.report(ProgressEvent::PayloadComplete { bytes: 5 });
        TracingProgress.report(ProgressEvent::PayloadComplete { bytes: 5 });
        assert_eq!(sink.events(), vec![ProgressEvent::PayloadComplete { bytes: 5 }]);
    }
}
