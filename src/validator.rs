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

//! Install-or-reject decision for a received package.

use std::path::Path;
use std::process::Command;
use serde::Serialize;
use tracing::{debug, info, warn};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageInfo {
    pub name: String,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallReason {
    DifferentPackageForced,
    NotInstalled,
    ForcedSameVersion,
    NewerVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    ArtifactCorrupted,
    DifferentPackageNotForced,
    AlreadyLatest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum Verdict {
    Install(InstallReason),
    Reject(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationOutcome {
    #[serde(flatten)]
    pub verdict: Verdict,
    pub comment: String,
}

impl ValidationOutcome {
    pub fn should_install(&self) -> bool {
        matches!(self.verdict, Verdict::Install(_))
    }
}

// ============================================================================
// Decision Table
// ============================================================================

/// Decides from the artifact's package (None when unreadable), the installed
/// package under the watched prefix (None when absent) and the force flag.
pub fn evaluate(
    artifact: Option<&PackageInfo>,
    installed: Option<&PackageInfo>,
    force: bool,
) -> ValidationOutcome {
    let Some(artifact) = artifact else {
        return ValidationOutcome {
            verdict: Verdict::Reject(RejectReason::ArtifactCorrupted),
            comment: "[X] artifact may be corrupted (unable to read package information)".into(),
        };
    };

    let Some(installed) = installed else {
        return ValidationOutcome {
            verdict: Verdict::Install(InstallReason::NotInstalled),
            comment: format!(
                "{} is not installed, installing version {}",
                artifact.name, artifact.version
            ),
        };
    };

    if installed.name != artifact.name {
        return if force {
            ValidationOutcome {
                verdict: Verdict::Install(InstallReason::DifferentPackageForced),
                comment: format!(
                    "[O] {} will be replaced by {} version {} (force update)",
                    installed.name, artifact.name, artifact.version
                ),
            }
        } else {
            ValidationOutcome {
                verdict: Verdict::Reject(RejectReason::DifferentPackageNotForced),
                comment: format!(
                    "[X] installed package {} differs from {}, enable force update",
                    installed.name, artifact.name
                ),
            }
        };
    }

    if force {
        ValidationOutcome {
            verdict: Verdict::Install(InstallReason::ForcedSameVersion),
            comment: format!("[O] force update: {} -> {}", installed.version, artifact.version),
        }
    } else if artifact.version > installed.version {
        ValidationOutcome {
            verdict: Verdict::Install(InstallReason::NewerVersion),
            comment: format!("[O] newer version ({}) available, updating", artifact.version),
        }
    } else {
        ValidationOutcome {
            verdict: Verdict::Reject(RejectReason::AlreadyLatest),
            comment: "[X] the app is already up to date".into(),
        }
    }
}

// ============================================================================
// Package Inspector
// ============================================================================

pub trait PackageInspector: Send + Sync {
    /// First installed package whose name starts with `prefix`.
    fn installed_package(&self, prefix: &str) -> Option<PackageInfo>;

    /// Package name and version declared by the artifact at `path`.
    fn artifact_package(&self, path: &Path) -> Option<PackageInfo>;
}

/// Queries the platform tools (`pm`, `dumpsys`, `aapt`) through the shell.
pub struct ShellPackageInspector {
    pub ignore: Vec<String>,
    pub list_command: Vec<String>,
    pub dump_command: Vec<String>,
    pub badging_command: Vec<String>,
}

impl ShellPackageInspector {
    fn run(&self, command: &[String], arg: &str) -> Option<String> {
        let (program, args) = command.split_first()?;
        match Command::new(program).args(args).arg(arg).output() {
            Ok(output) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(output) => {
                debug!(program = %program, status = %output.status, "package query failed");
                None
            }
            Err(e) => {
                warn!(program = %program, "could not run package query: {}", e);
                None
            }
        }
    }
}

impl PackageInspector for ShellPackageInspector {
    fn installed_package(&self, prefix: &str) -> Option<PackageInfo> {
        let listing = self.run(&self.list_command, prefix)?;
        let name = parse_package_list(&listing, prefix, &self.ignore)?;
        let dump = self.run(&self.dump_command, &name)?;
        let version = parse_version_code(&dump)?;
        Some(PackageInfo { name, version })
    }

    fn artifact_package(&self, path: &Path) -> Option<PackageInfo> {
        let badging = self.run(&self.badging_command, &path.to_string_lossy())?;
        parse_badging(&badging)
    }
}

/// `package:<name>` lines from `pm list packages`.
pub fn parse_package_list(output: &str, prefix: &str, ignore: &[String]) -> Option<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(str::trim)
        .find(|name| name.starts_with(prefix) && !ignore.iter().any(|i| i == name))
        .map(str::to_string)
}

/// First `versionCode=<n>` in `dumpsys package` output.
pub fn parse_version_code(output: &str) -> Option<u64> {
    let start = output.find("versionCode=")? + "versionCode=".len();
    let digits: String = output[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// `package: name='…' versionCode='…'` line from `aapt dump badging`.
pub fn parse_badging(output: &str) -> Option<PackageInfo> {
    let line = output.lines().find(|line| line.starts_with("package:"))?;
    let name = quoted_attribute(line, "name")?;
    let version = quoted_attribute(line, "versionCode")?.parse().ok()?;
    Some(PackageInfo { name: name.to_string(), version })
}

fn quoted_attribute<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let pattern = format!(" {}='", key);
    let start = line.find(&pattern)? + pattern.len();
    let len = line[start..].find('\'')?;
    Some(&line[start..start + len])
}

// ============================================================================
// Artifact Validator
// ============================================================================

pub struct ArtifactValidator {
    inspector: Box<dyn PackageInspector>,
    prefix: String,
}

impl ArtifactValidator {
    pub fn new(inspector: Box<dyn PackageInspector>, prefix: impl Into<String>) -> Self {
        ArtifactValidator {
            inspector,
            prefix: prefix.into(),
        }
    }

    pub fn validate(&self, artifact: &Path, force: bool) -> ValidationOutcome {
        let artifact_info = self.inspector.artifact_package(artifact);
        let installed = match &artifact_info {
            Some(info) => {
                debug!(package = %info.name, version = info.version, "artifact package");
                self.inspector.installed_package(&self.prefix)
            }
            None => None,
        };

        if let Some(installed) = &installed {
            debug!(package = %installed.name, version = installed.version, "installed package");
        }

        let outcome = evaluate(artifact_info.as_ref(), installed.as_ref(), force);
        info!(verdict = ?outcome.verdict, force, "{}", outcome.comment);
        outcome
    }
}

// ============================================================================
// Tests
// ============================================================================
