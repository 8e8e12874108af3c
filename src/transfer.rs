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

//! Transfer session: header block, then data blocks into a file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use serde::Deserialize;
use tracing::{debug, info, warn};
use crate::device::{ProgressEvent, ProgressSink};
use crate::modem::{Modem, ModemError};
use crate::protocol::*;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Modem(#[from] ModemError),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Types
// ============================================================================

/// When data blocks are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckMode {
    /// ACK every accepted block. Safer against dropped bytes, much slower.
    PerBlock,
    /// ACK only once the sender signals EOT.
    #[default]
    EndOfTransfer,
}

/// Parsed header block: `name\0size\0sync\0reboot\0force\0...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    pub file_name: String,
    pub expected_size: u64,
    pub sync_data_mode: bool,
    pub reboot_mode: bool,
    pub force_update_mode: bool,
}

// ============================================================================
// Transfer Session
// ============================================================================

pub struct TransferSession {
    modem: Modem,
    save_path: Option<PathBuf>,
    received_size: u64,
    error_count: u32,
}

impl TransferSession {
    pub fn new(modem: Modem) -> Self {
        TransferSession {
            modem,
            save_path: None,
            received_size: 0,
            error_count: 0,
        }
    }

    pub fn modem(&mut self) -> &mut Modem {
        &mut self.modem
    }

    /// Destination resolved from the last header, `save_dir/file_name`.
    pub fn save_path(&self) -> Option<&Path> {
        self.save_path.as_deref()
    }

    #[cfg(test)]
    pub fn received_size(&self) -> u64 {
        self.received_size
    }

    /// Requests the transfer and reads the header block. Nothing is written
    /// to `save_dir`; the payload file is only created by [`receive_payload`].
    ///
    /// [`receive_payload`]: TransferSession::receive_payload
    pub fn receive_header(&mut self, save_dir: &Path) -> Result<TransferHeader, TransferError> {
        let mut start = self.modem.request_start()?;
        self.error_count = 0;

        loop {
            match self.modem.read_block(0, start, 0, 1) {
                Ok(block) => {
                    let header = parse_header(block)?;
                    info!(
                        file = %header.file_name,
                        size = header.expected_size,
                        sync_data = header.sync_data_mode,
                        reboot = header.reboot_mode,
                        force_update = header.force_update_mode,
                        "[O] header received"
                    );
                    self.save_path = Some(save_dir.join(&header.file_name));
                    return Ok(header);
                }
                Err(e) if e.is_transient() => {
                    self.note_invalid_block(&e)?;
                    start = match self.modem.read_next_block_start(false)? {
                        ControlByte::EndOfTransmission => {
                            return Err(TransferError::InvalidHeader("EOT before header block".into()));
                        }
                        block_start => block_start,
                    };
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Receives data blocks into the save path until EOT. On failure a NAK is
    /// sent and the partial file is left for the caller to discard.
    pub fn receive_payload(
        &mut self,
        header: &TransferHeader,
        ack_mode: AckMode,
        progress: &dyn ProgressSink,
    ) -> Result<u64, TransferError> {
        let path = self.save_path.clone().ok_or_else(|| {
            TransferError::InvalidHeader("payload requested before header".into())
        })?;

        let mut writer = BufWriter::new(File::create(&path)?);
        self.modem.reset_block_counter();
        self.received_size = 0;
        self.error_count = 0;

        // Sizes from the peer are untrusted; progress only needs an upper bound
        let total_packets = u32::try_from(header.expected_size.div_ceil(LONG_BLOCK_SIZE as u64))
            .unwrap_or(u32::MAX);
        debug!(path = %path.display(), total_packets, ?ack_mode, "receiving payload");

        let result = self
            .receive_blocks(&mut writer, total_packets, ack_mode, progress)
            .and_then(|()| writer.flush().map_err(TransferError::from));

        if let Err(e) = result {
            warn!("payload reception failed: {}", e);
            if let Err(nak_err) = self.modem.send_byte(NAK) {
                debug!("could not send NAK: {}", nak_err);
            }
            return Err(e);
        }

        info!(path = %path.display(), bytes = self.received_size, "[O] payload stored");
        progress.report(ProgressEvent::PayloadComplete { bytes: self.received_size });
        Ok(self.received_size)
    }

    fn receive_blocks(
        &mut self,
        writer: &mut impl Write,
        total_packets: u32,
        ack_mode: AckMode,
        progress: &dyn ProgressSink,
    ) -> Result<(), TransferError> {
        let mut packet: u32 = 0;
        let mut last_ack = true;

        loop {
            let start = self.modem.read_next_block_start(last_ack)?;
            if start == ControlByte::EndOfTransmission {
                debug!("[RX] EOT");
                self.modem.send_byte(ACK)?;
                break;
            }

            let seq = self.modem.block_counter();
            match self.modem.read_block(seq, start, packet, total_packets) {
                Ok(block) => {
                    writer.write_all(block)?;
                    self.received_size += block.len() as u64;
                    self.error_count = 0;
                }
                Err(e) if e.is_transient() => {
                    self.note_invalid_block(&e)?;
                    last_ack = false;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            report_progress(progress, packet, total_packets);
            packet += 1;
            self.modem.increment_block_counter();
            last_ack = true;

            if ack_mode == AckMode::PerBlock {
                self.modem.send_byte(ACK)?;
            }
        }

        // Confirms the whole transfer in both modes
        self.modem.send_byte(ACK)?;
        Ok(())
    }

    /// Counts an invalid block and NAKs it, or cancels once the ceiling is hit.
    /// The count covers consecutive failures of the same block.
    fn note_invalid_block(&mut self, e: &ModemError) -> Result<(), TransferError> {
        self.error_count += 1;
        if self.error_count >= self.modem.settings().max_errors {
            self.modem.interrupt_transmission()?;
            return Err(ModemError::TooManyErrors(self.error_count).into());
        }

        warn!(errors = self.error_count, "{}, requesting resend", e);
        self.modem.send_byte(NAK)?;
        Ok(())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn parse_header(block: &[u8]) -> Result<TransferHeader, TransferError> {
    let text = String::from_utf8_lossy(block);
    let trimmed = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    let fields: Vec<&str> = trimmed.split('\0').collect();

    if fields.len() < 5 || fields[1].trim().is_empty() {
        return Err(TransferError::InvalidHeader(format!("{:?}", trimmed)));
    }

    let expected_size = fields[1].trim().parse::<u64>().map_err(|_| {
        TransferError::InvalidHeader(format!("invalid file size {:?}", fields[1]))
    })?;

    Ok(TransferHeader {
        file_name: sanitize_file_name(fields[0].trim())?,
        expected_size,
        sync_data_mode: fields[2].trim() == "1",
        reboot_mode: fields[3].trim() == "1",
        force_update_mode: fields[4].trim() == "1",
    })
}

/// Keeps only the final component of the sender's file name.
fn sanitize_file_name(name: &str) -> Result<String, TransferError> {
    let mut last = None;
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => last = Some(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(TransferError::InvalidHeader(format!(
                    "file name escapes the save directory: {:?}",
                    name
                )));
            }
        }
    }

    last.map(|part| part.to_string_lossy().into_owned())
        .ok_or_else(|| TransferError::InvalidHeader("empty file name".into()))
}

/// Roughly every 10% of the transfer, plus the last packet.
fn report_progress(progress: &dyn ProgressSink, packet: u32, total_packets: u32) {
    let unit = (total_packets.saturating_add(2) / 10).max(1);
    if packet % unit == 0 || packet.saturating_add(1) == total_packets {
        let percent = if total_packets == 0 {
            100.0
        } else {
            (packet.saturating_add(1) as f32 / total_packets as f32 * 100.0).min(100.0)
        };
        progress.report(ProgressEvent::Block {
            index: packet,
            total: total_packets,
            percent,
        });
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RecordingProgress;
    use crate::modem::ModemSettings;
    use crate::stream::{MockStream, data_payload, frame, header_payload, script};
    use std::time::Duration;

    fn session(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> TransferSession {
        let settings = ModemSettings {
            request_timeout: Duration::from_secs(1),
            block_timeout: Duration::from_secs(1),
            max_errors: MAX_ERRORS,
        };
        TransferSession::new(Modem::new(
            Box::new(MockStream::new(responses, expected_writes)),
            settings,
        ))
    }

    fn data_frames(blocks: &[(u8, &[u8])]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for (seq, data) in blocks {
            bytes.extend(frame(STX, *seq, &data_payload(data)));
        }
        bytes
    }

    #[test]
    fn test_parse_header_fields() {
        let header = parse_header(&header_payload("fw.bin\0100\00\01\01")).unwrap();
        assert_eq!(header.file_name, "fw.bin");
        assert_eq!(header.expected_size, 100);
        assert!(!header.sync_data_mode);
        assert!(header.reboot_mode);
        assert!(header.force_update_mode);

        let header = parse_header(&header_payload("app.apk\03654326\01\0yes\00")).unwrap();
        assert_eq!(header.expected_size, 3654326);
        assert!(header.sync_data_mode);
        assert!(!header.reboot_mode);
        assert!(!header.force_update_mode);
    }

    #[test]
    fn test_parse_header_too_few_fields() {
        let err = parse_header(&header_payload("fw.bin\0100\00\00")).unwrap_err();
        assert!(matches!(err, TransferError::InvalidHeader(_)));

        let err = parse_header(&header_payload("")).unwrap_err();
        assert!(matches!(err, TransferError::InvalidHeader(_)));
    }

    #[test]
    fn test_parse_header_bad_size() {
        for text in ["fw.bin\0abc\00\00\00", "fw.bin\0-5\00\00\00", "fw.bin\0 \00\00\00"] {
            let err = parse_header(&header_payload(text)).unwrap_err();
            assert!(matches!(err, TransferError::InvalidHeader(_)), "{:?}", text);
        }
    }

    #[test]
    fn test_parse_header_file_name() {
        let header = parse_header(&header_payload("sub/fw.bin\010\00\00\00")).unwrap();
        assert_eq!(header.file_name, "fw.bin");

        for text in ["../evil\010\00\00\00", "/etc/passwd\010\00\00\00", ".\010\00\00\00"] {
            assert!(parse_header(&header_payload(text)).is_err(), "{:?}", text);
        }
    }

    #[test]
    fn test_receive_header() {
        let dir = tempfile::tempdir().unwrap();
        let responses = script(&frame(SOH, 0, &header_payload("fw.bin\0100\00\00\00")));
        let mut session = session(responses, vec![START_CRC]);

        let header = session.receive_header(dir.path()).unwrap();
        assert_eq!(header, TransferHeader {
            file_name: "fw.bin".into(),
            expected_size: 100,
            sync_data_mode: false,
            reboot_mode: false,
            force_update_mode: false,
        });
        assert_eq!(session.save_path(), Some(dir.path().join("fw.bin").as_path()));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_receive_header_invalid_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let responses = script(&frame(SOH, 0, &header_payload("fw.bin\0100\00")));
        let mut session = session(responses, vec![START_CRC]);

        let err = session.receive_header(dir.path()).unwrap_err();
        assert!(matches!(err, TransferError::InvalidHeader(_)));
        assert!(session.save_path().is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_receive_header_crc_retry() {
        let dir = tempfile::tempdir().unwrap();
        let payload = header_payload("fw.bin\0100\00\00\00");
        let mut damaged = frame(SOH, 0, &payload);
        damaged[20] ^= 0x01;

        let mut bytes = damaged;
        bytes.extend(frame(SOH, 0, &payload));
        let mut session = session(script(&bytes), vec![START_CRC, NAK]);

        let header = session.receive_header(dir.path()).unwrap();
        assert_eq!(header.expected_size, 100);
    }

    #[test]
    fn test_receive_payload_end_of_transfer_ack() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = frame(SOH, 0, &header_payload("fw.bin\03000\00\00\00"));
        bytes.extend(data_frames(&[(0, b"one"), (1, b"two"), (2, b"three")]));
        bytes.push(EOT);

        let progress = RecordingProgress::default();
        let mut session = session(script(&bytes), vec![START_CRC, ACK, ACK]);
        let header = session.receive_header(dir.path()).unwrap();

        let written = session.receive_payload(&header, AckMode::EndOfTransfer, &progress).unwrap();
        assert_eq!(written, 3 * 1024);

        let content = std::fs::read(dir.path().join("fw.bin")).unwrap();
        assert_eq!(content.len(), 3072);
        assert_eq!(&content[..3], b"one");
        assert_eq!(&content[1024..1027], b"two");
        assert_eq!(&content[2048..2053], b"three");

        let events = progress.events();
        assert!(matches!(events[0], ProgressEvent::Block { index: 0, total: 3, .. }));
        assert!(events.contains(&ProgressEvent::Block { index: 2, total: 3, percent: 100.0 }));
        assert_eq!(events.last(), Some(&ProgressEvent::PayloadComplete { bytes: 3072 }));
    }

    #[test]
    fn test_receive_payload_per_block_ack() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = frame(SOH, 0, &header_payload("fw.bin\02048\00\00\00"));
        bytes.extend(data_frames(&[(0, b"a"), (1, b"b")]));
        bytes.push(EOT);

        let mut session = session(script(&bytes), vec![START_CRC, ACK, ACK, ACK, ACK]);
        let header = session.receive_header(dir.path()).unwrap();

        let written = session
            .receive_payload(&header, AckMode::PerBlock, &RecordingProgress::default())
            .unwrap();
        assert_eq!(written, 2048);
    }

    #[test]
    fn test_receive_payload_retries_invalid_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut damaged = frame(STX, 1, &data_payload(b"b"));
        damaged[100] ^= 0x80;

        let mut bytes = frame(SOH, 0, &header_payload("fw.bin\02048\00\00\00"));
        bytes.extend(data_frames(&[(0, b"a")]));
        bytes.extend(damaged);
        bytes.extend(data_frames(&[(1, b"b")]));
        bytes.push(EOT);

        let mut session = session(script(&bytes), vec![START_CRC, NAK, ACK, ACK]);
        let header = session.receive_header(dir.path()).unwrap();

        let written = session
            .receive_payload(&header, AckMode::EndOfTransfer, &RecordingProgress::default())
            .unwrap();
        assert_eq!(written, 2048);

        let content = std::fs::read(dir.path().join("fw.bin")).unwrap();
        assert_eq!(content[1024], b'b');
    }

    #[test]
    fn test_receive_payload_sync_lost_naks_and_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = frame(SOH, 0, &header_payload("fw.bin\03072\00\00\00"));
        bytes.extend(data_frames(&[(0, b"a"), (2, b"c")]));

        let mut session = session(script(&bytes), vec![START_CRC, NAK]);
        let header = session.receive_header(dir.path()).unwrap();

        let err = session
            .receive_payload(&header, AckMode::EndOfTransfer, &RecordingProgress::default())
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Modem(ModemError::SynchronizationLost { expected: 1, received: 2 })
        ));

        // Partial file stays for the caller to discard
        assert_eq!(std::fs::metadata(dir.path().join("fw.bin")).unwrap().len(), 1024);
    }

    #[test]
    fn test_receive_payload_zero_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = frame(SOH, 0, &header_payload("empty.bin\00\00\00\00"));
        bytes.push(EOT);

        let mut session = session(script(&bytes), vec![START_CRC, ACK, ACK]);
        let header = session.receive_header(dir.path()).unwrap();

        let written = session
            .receive_payload(&header, AckMode::EndOfTransfer, &RecordingProgress::default())
            .unwrap();
        assert_eq!(written, 0);
        assert_eq!(session.received_size(), 0);
    }

    #[test]
    fn test_receive_header_invalid_block_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let mut damaged = frame(SOH, 0, &header_payload("fw.bin\0100\00\00\00"));
        damaged[20] ^= 0x01;

        let mut bytes = Vec::new();
        for _ in 0..MAX_ERRORS {
            bytes.extend_from_slice(&damaged);
        }

        let mut expected = vec![START_CRC];
        expected.extend(vec![NAK; MAX_ERRORS as usize - 1]);
        expected.extend([CAN, CAN]);
        let mut session = session(script(&bytes), expected);

        let err = session.receive_header(dir.path()).unwrap_err();
        assert!(matches!(err, TransferError::Modem(ModemError::TooManyErrors(n)) if n == MAX_ERRORS));
        assert!(session.save_path().is_none());
    }

    #[test]
    fn test_receive_payload_invalid_block_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let mut damaged = frame(STX, 0, &data_payload(b"a"));
        damaged[100] ^= 0x80;

        let mut bytes = frame(SOH, 0, &header_payload("fw.bin\01024\00\00\00"));
        for _ in 0..MAX_ERRORS {
            bytes.extend_from_slice(&damaged);
        }

        // Nine resend requests, cancel on the tenth, then the failure NAK
        let mut expected = vec![START_CRC];
        expected.extend(vec![NAK; MAX_ERRORS as usize - 1]);
        expected.extend([CAN, CAN, NAK]);
        let mut session = session(script(&bytes), expected);
        let header = session.receive_header(dir.path()).unwrap();

        let err = session
            .receive_payload(&header, AckMode::EndOfTransfer, &RecordingProgress::default())
            .unwrap_err();
        assert!(matches!(err, TransferError::Modem(ModemError::TooManyErrors(n)) if n == MAX_ERRORS));
        assert_eq!(std::fs::metadata(dir.path().join("fw.bin")).unwrap().len(), 0);
    }

    #[test]
    fn test_receive_payload_error_count_resets_after_good_block() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = MAX_ERRORS as u8 + 2;

        let mut bytes = frame(SOH, 0, &header_payload(&format!("fw.bin\0{}\00\00\00", blocks as u32 * 1024)));
        for seq in 0..blocks {
            let mut damaged = frame(STX, seq, &data_payload(&[seq]));
            damaged[100] ^= 0x80;
            bytes.extend(damaged);
            bytes.extend(frame(STX, seq, &data_payload(&[seq])));
        }
        bytes.push(EOT);

        let mut expected = vec![START_CRC];
        expected.extend(vec![NAK; blocks as usize]);
        expected.extend([ACK, ACK]);
        let mut session = session(script(&bytes), expected);
        let header = session.receive_header(dir.path()).unwrap();

        let written = session
            .receive_payload(&header, AckMode::EndOfTransfer, &RecordingProgress::default())
            .unwrap();
        assert_eq!(written, blocks as u64 * 1024);
    }

    #[test]
    fn test_receive_payload_huge_declared_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = frame(SOH, 0, &header_payload("fw.bin\04398046510080\00\00\00"));
        bytes.extend(data_frames(&[(0, b"a")]));
        bytes.push(EOT);

        let progress = RecordingProgress::default();
        let mut session = session(script(&bytes), vec![START_CRC, ACK, ACK]);
        let header = session.receive_header(dir.path()).unwrap();
        assert_eq!(header.expected_size, 4398046510080);

        let written = session.receive_payload(&header, AckMode::EndOfTransfer, &progress).unwrap();
        assert_eq!(written, 1024);

        let events = progress.events();
        assert!(matches!(events[0], ProgressEvent::Block { index: 0, total: u32::MAX, .. }));
        assert_eq!(events.last(), Some(&ProgressEvent::PayloadComplete { bytes: 1024 }));
    }

    #[test]
    fn test_progress_saturates_on_huge_totals() {
        let progress = RecordingProgress::default();
        report_progress(&progress, 0, u32::MAX);
        report_progress(&progress, 1, u32::MAX);
        report_progress(&progress, u32::MAX - 1, u32::MAX);
        assert_eq!(progress.events().len(), 2);
    }

    #[test]
    fn test_progress_is_throttled() {
        let progress = RecordingProgress::default();
        for packet in 0..100 {
            report_progress(&progress, packet, 100);
        }
        let indices: Vec<u32> = progress
            .events()
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Block { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90, 99]);
    }
}
