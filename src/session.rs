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

//! Session orchestrator: drives one connection from the header to the
//! install decision.

use std::fs;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use crate::device::{ProgressEvent, ProgressSink, RebootAction, SnapshotError, SnapshotProvider};
use crate::integrity::check_integrity;
use crate::modem::{Modem, ModemError, ModemSettings};
use crate::protocol::*;
use crate::stream::ByteStream;
use crate::transfer::{AckMode, TransferError, TransferHeader, TransferSession};
use crate::validator::{ArtifactValidator, InstallReason, RejectReason, Verdict};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("integrity check failed, expected {expected} bytes")]
    IntegrityMismatch { expected: u64 },

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ModemError> for SessionError {
    fn from(err: ModemError) -> Self {
        SessionError::Transfer(TransferError::Modem(err))
    }
}

impl SessionError {
    /// Failures of the connection itself; these count against the
    /// listener's socket error budget.
    pub fn is_socket_level(&self) -> bool {
        matches!(
            self,
            SessionError::Io(_)
                | SessionError::Transfer(TransferError::Io(_))
                | SessionError::Transfer(TransferError::Modem(ModemError::Io(_)))
                | SessionError::Transfer(TransferError::Modem(ModemError::StreamClosed))
        )
    }
}

/// What the listener does after a failed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Drop the connection, keep accepting on the same socket.
    KeepListener,
    /// Tear the listening socket down and bind a fresh one.
    RestartListener,
}

pub fn classify_error(error: &SessionError) -> Recovery {
    match error {
        SessionError::Transfer(TransferError::InvalidHeader(_)) => Recovery::KeepListener,
        SessionError::Transfer(TransferError::Modem(modem)) => match modem {
            ModemError::RepeatedBlock { .. }
            | ModemError::SynchronizationLost { .. }
            | ModemError::InvalidBlock(_)
            | ModemError::TooManyErrors(_) => Recovery::KeepListener,
            ModemError::Io(e) => io_recovery(e),
            _ => Recovery::RestartListener,
        },
        SessionError::Transfer(TransferError::Io(e)) | SessionError::Io(e) => io_recovery(e),
        SessionError::IntegrityMismatch { .. } | SessionError::Snapshot(_) => Recovery::KeepListener,
    }
}

fn io_recovery(e: &std::io::Error) -> Recovery {
    match e.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe => Recovery::KeepListener,
        _ => Recovery::RestartListener,
    }
}

// ============================================================================
// Settings & Context
// ============================================================================

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub save_dir: PathBuf,
    /// Name the verified artifact is staged under for installation
    pub artifact_name: String,
    pub ack_mode: AckMode,
    pub modem: ModemSettings,
    pub header_attempts: u32,
    pub header_retry_delay: Duration,
    pub eot_settle: Duration,
    pub peer_eot_timeout: Duration,
    pub install_delay: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            save_dir: PathBuf::from("./received"),
            artifact_name: "firmware.apk".into(),
            ack_mode: AckMode::EndOfTransfer,
            modem: ModemSettings::default(),
            header_attempts: 3,
            header_retry_delay: Duration::from_secs(2),
            eot_settle: Duration::from_secs(3),
            peer_eot_timeout: Duration::from_secs(10),
            install_delay: Duration::from_secs(5),
        }
    }
}

/// Everything a session needs besides its stream. Shared by all listeners.
pub struct SessionContext {
    pub settings: SessionSettings,
    pub validator: ArtifactValidator,
    pub reboot: Arc<dyn RebootAction>,
    pub snapshots: Box<dyn SnapshotProvider>,
    pub progress: Arc<dyn ProgressSink>,
    // One writer in the save directory at a time, across all transports
    destination: Mutex<()>,
}

impl SessionContext {
    pub fn new(
        settings: SessionSettings,
        validator: ArtifactValidator,
        reboot: Arc<dyn RebootAction>,
        snapshots: Box<dyn SnapshotProvider>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        SessionContext {
            settings,
            validator,
            reboot,
            snapshots,
            progress,
            destination: Mutex::new(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    SyncDataSent,
    RebootRequested,
    InstallScheduled(InstallReason),
    Discarded(RejectReason),
}

// ============================================================================
// States
// ============================================================================

pub struct ReceiveHeader;
pub struct Dispatch;
pub struct SyncData;
pub struct Reboot;
pub struct ReceivePayload;
pub struct CheckIntegrity;
pub struct Rename;
pub struct AwaitPeerEot;
pub struct Validate;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct SessionFsm<State> {
    state: PhantomData<State>,
    transfer: TransferSession,
    ctx: Arc<SessionContext>,
    header: Option<TransferHeader>,
    header_attempt: u32,
    // Removed if the session fails
    artifact: Option<PathBuf>,
}

pub enum Step {
    Next(Box<dyn SessionState>),
    Finished(SessionOutcome),
}

// ============================================================================
// Trait
// ============================================================================

pub trait SessionState: Send {
    fn step(self: Box<Self>) -> Result<Step, SessionError>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> SessionFsm<S> {
    fn transition<T>(self) -> Box<SessionFsm<T>>
    where
        SessionFsm<T>: SessionState,
    {
        Box::new(SessionFsm {
            state: PhantomData,
            transfer: self.transfer,
            ctx: self.ctx,
            header: self.header,
            header_attempt: self.header_attempt,
            artifact: self.artifact,
        })
    }

    fn next<T>(self) -> Result<Step, SessionError>
    where
        SessionFsm<T>: SessionState + 'static,
    {
        let next = self.transition::<T>();
        Ok(Step::Next(next as Box<dyn SessionState>))
    }

    fn finish(mut self, outcome: SessionOutcome) -> Result<Step, SessionError> {
        if let Err(e) = self.transfer.modem().close() {
            debug!("closing stream: {}", e);
        }
        Ok(Step::Finished(outcome))
    }

    /// Tears the session down: removes the partial artifact and closes the stream.
    fn fail(mut self, error: SessionError) -> SessionError {
        let type_name = std::any::type_name::<S>();
        let state_name = type_name.split("::").last().unwrap_or(type_name);
        warn!(state = state_name, "[X] session failed: {}", error);

        if let Some(path) = self.artifact.take() {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "artifact removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "could not remove artifact: {}", e),
            }
        }

        if let Err(e) = self.transfer.modem().close() {
            debug!("closing stream: {}", e);
        }
        error
    }

    fn header(&self) -> Result<&TransferHeader, SessionError> {
        self.header
            .as_ref()
            .ok_or_else(|| TransferError::InvalidHeader("no header received".into()).into())
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl SessionState for SessionFsm<ReceiveHeader> {
    fn step(self: Box<Self>) -> Result<Step, SessionError> {
        let mut fsm = *self;
        let ctx = Arc::clone(&fsm.ctx);
        let settings = &ctx.settings;

        match fsm.transfer.receive_header(&settings.save_dir) {
            Ok(header) => {
                if let Err(e) = fsm.transfer.modem().send_byte(ACK) {
                    return Err(fsm.fail(e.into()));
                }
                debug!("[TX] header ACK");

                ctx.progress.report(ProgressEvent::HeaderReceived {
                    file_name: header.file_name.clone(),
                    expected_size: header.expected_size,
                });
                fsm.header = Some(header);
                fsm.next::<Dispatch>()
            }
            Err(TransferError::Modem(ModemError::Timeout))
                if fsm.header_attempt < settings.header_attempts =>
            {
                warn!(
                    attempt = fsm.header_attempt,
                    of = settings.header_attempts,
                    "header timed out, retrying"
                );
                fsm.header_attempt += 1;
                std::thread::sleep(settings.header_retry_delay);
                Ok(Step::Next(Box::new(fsm) as Box<dyn SessionState>))
            }
            Err(e) => Err(fsm.fail(e.into())),
        }
    }
}

impl SessionState for SessionFsm<Dispatch> {
    fn step(self: Box<Self>) -> Result<Step, SessionError> {
        let fsm = *self;
        let header = match fsm.header() {
            Ok(header) => header.clone(),
            Err(e) => return Err(fsm.fail(e)),
        };

        if header.sync_data_mode {
            fsm.next::<SyncData>()
        } else if header.reboot_mode {
            fsm.next::<Reboot>()
        } else {
            fsm.next::<ReceivePayload>()
        }
    }
}

impl SessionState for SessionFsm<SyncData> {
    fn step(self: Box<Self>) -> Result<Step, SessionError> {
        let mut fsm = *self;
        let ctx = Arc::clone(&fsm.ctx);

        let snapshot = match ctx.snapshots.snapshot() {
            Ok(bytes) => bytes,
            Err(e) => return Err(fsm.fail(e.into())),
        };

        if let Err(e) = fsm.transfer.modem().send_bytes(&snapshot) {
            return Err(fsm.fail(e.into()));
        }

        info!(bytes = snapshot.len(), "[O] device state sent");
        fsm.finish(SessionOutcome::SyncDataSent)
    }
}

impl SessionState for SessionFsm<Reboot> {
    fn step(self: Box<Self>) -> Result<Step, SessionError> {
        let fsm = *self;

        info!("reboot requested by peer");
        if let Err(e) = fsm.ctx.reboot.reboot() {
            error!("reboot failed: {}", e);
        }
        fsm.finish(SessionOutcome::RebootRequested)
    }
}

impl SessionState for SessionFsm<ReceivePayload> {
    fn step(self: Box<Self>) -> Result<Step, SessionError> {
        let mut fsm = *self;
        let ctx = Arc::clone(&fsm.ctx);
        let header = match fsm.header() {
            Ok(header) => header.clone(),
            Err(e) => return Err(fsm.fail(e)),
        };

        fsm.artifact = fsm.transfer.save_path().map(|p| p.to_path_buf());
        info!(file = %header.file_name, size = header.expected_size, "waiting for payload");

        match fsm.transfer.receive_payload(&header, ctx.settings.ack_mode, ctx.progress.as_ref()) {
            Ok(_) => fsm.next::<CheckIntegrity>(),
            Err(e) => Err(fsm.fail(e.into())),
        }
    }
}

impl SessionState for SessionFsm<CheckIntegrity> {
    fn step(self: Box<Self>) -> Result<Step, SessionError> {
        let mut fsm = *self;
        let expected = match fsm.header() {
            Ok(header) => header.expected_size,
            Err(e) => return Err(fsm.fail(e)),
        };
        let Some(path) = fsm.artifact.clone() else {
            return Err(fsm.fail(TransferError::InvalidHeader("no artifact path".into()).into()));
        };

        match check_integrity(&path, expected) {
            Ok(true) => fsm.next::<Rename>(),
            Ok(false) => {
                if let Err(e) = fsm.transfer.modem().send_byte(NAK) {
                    return Err(fsm.fail(e.into()));
                }
                Err(fsm.fail(SessionError::IntegrityMismatch { expected }))
            }
            Err(e) => Err(fsm.fail(e.into())),
        }
    }
}

impl SessionState for SessionFsm<Rename> {
    fn step(self: Box<Self>) -> Result<Step, SessionError> {
        let mut fsm = *self;
        let Some(path) = fsm.artifact.clone() else {
            return Err(fsm.fail(TransferError::InvalidHeader("no artifact path".into()).into()));
        };

        let target = fsm.ctx.settings.save_dir.join(&fsm.ctx.settings.artifact_name);
        if let Err(e) = fs::rename(&path, &target) {
            return Err(fsm.fail(e.into()));
        }

        info!(from = %path.display(), to = %target.display(), "[O] artifact staged");
        fsm.artifact = Some(target);
        fsm.next::<AwaitPeerEot>()
    }
}

impl SessionState for SessionFsm<AwaitPeerEot> {
    fn step(self: Box<Self>) -> Result<Step, SessionError> {
        let mut fsm = *self;
        let ctx = Arc::clone(&fsm.ctx);

        if let Err(e) = fsm.transfer.modem().send_byte(EOT) {
            return Err(fsm.fail(e.into()));
        }
        debug!("[TX] EOT");

        std::thread::sleep(ctx.settings.eot_settle);

        match fsm.transfer.modem().await_byte(EOT, ctx.settings.peer_eot_timeout) {
            Ok(()) => {
                debug!("[RX] EOT");
                fsm.next::<Validate>()
            }
            Err(e) => Err(fsm.fail(e.into())),
        }
    }
}

impl SessionState for SessionFsm<Validate> {
    fn step(self: Box<Self>) -> Result<Step, SessionError> {
        let mut fsm = *self;
        let ctx = Arc::clone(&fsm.ctx);
        let force = match fsm.header() {
            Ok(header) => header.force_update_mode,
            Err(e) => return Err(fsm.fail(e)),
        };
        let Some(path) = fsm.artifact.clone() else {
            return Err(fsm.fail(TransferError::InvalidHeader("no artifact path".into()).into()));
        };

        let outcome = ctx.validator.validate(&path, force);
        ctx.progress.report(ProgressEvent::Verdict {
            install: outcome.should_install(),
            comment: outcome.comment.clone(),
        });

        match outcome.verdict {
            Verdict::Install(reason) => {
                info!(delay = ?ctx.settings.install_delay, "[O] artifact accepted, rebooting to install");
                schedule_reboot(Arc::clone(&ctx.reboot), ctx.settings.install_delay);
                fsm.finish(SessionOutcome::InstallScheduled(reason))
            }
            Verdict::Reject(reason) => {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), "could not remove rejected artifact: {}", e);
                }
                info!("[X] update skipped, artifact deleted");
                fsm.artifact = None;
                fsm.finish(SessionOutcome::Discarded(reason))
            }
        }
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl SessionFsm<ReceiveHeader> {
    pub fn new(stream: Box<dyn ByteStream>, ctx: Arc<SessionContext>) -> Box<dyn SessionState> {
        let modem = Modem::new(stream, ctx.settings.modem);
        Box::new(SessionFsm {
            state: PhantomData::<ReceiveHeader>,
            transfer: TransferSession::new(modem),
            ctx,
            header: None,
            header_attempt: 1,
            artifact: None,
        })
    }
}

/// Runs one connection to completion. Sessions from different listeners
/// are serialized on the save directory.
pub fn run_session(
    stream: Box<dyn ByteStream>,
    ctx: &Arc<SessionContext>,
) -> Result<SessionOutcome, SessionError> {
    let _destination = ctx.destination.lock().unwrap_or_else(PoisonError::into_inner);
    fs::create_dir_all(&ctx.settings.save_dir)?;

    let mut state = SessionFsm::<ReceiveHeader>::new(stream, Arc::clone(ctx));
    loop {
        match state.step()? {
            Step::Next(next) => state = next,
            Step::Finished(outcome) => {
                info!(?outcome, "session finished");
                return Ok(outcome);
            }
        }
    }
}

fn schedule_reboot(reboot: Arc<dyn RebootAction>, delay: Duration) {
    let spawned = std::thread::Builder::new()
        .name("reboot".into())
        .spawn(move || {
            std::thread::sleep(delay);
            if let Err(e) = reboot.reboot() {
                error!("reboot failed: {}", e);
            }
        });

    if let Err(e) = spawned {
        error!("could not schedule reboot: {}", e);
    }
}

// ============================================================================
// Tests
// ============================================================================
