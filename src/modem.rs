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

//! Block framer: control bytes, one block at a time, CRC and sequence checks.

use std::time::Duration;
use tracing::{debug, trace, warn};
use crate::crc::crc16;
use crate::protocol::*;
use crate::stream::ByteStream;
use crate::timer::Timer;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ModemError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for data")]
    Timeout,

    #[error("stream closed by peer")]
    StreamClosed,

    #[error("no block start after {attempts} start requests")]
    NoResponse { attempts: u32 },

    #[error("no block start after {attempts} waits, transfer cancelled")]
    RetriesExhausted { attempts: u32 },

    #[error("previous block {received} received again")]
    RepeatedBlock { received: u8 },

    #[error("block number mismatch: expected {expected}, received {received}")]
    SynchronizationLost { expected: u8, received: u8 },

    #[error("invalid block: {0}")]
    InvalidBlock(&'static str),

    #[error("gave up after {0} invalid blocks")]
    TooManyErrors(u32),

    #[error("transfer cancelled by peer")]
    PeerCancelled,
}

impl ModemError {
    /// Errors worth a NAK and another attempt at the same block.
    pub fn is_transient(&self) -> bool {
        matches!(self, ModemError::InvalidBlock(_))
    }
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct ModemSettings {
    /// Wait for a block start after each 'C'
    pub request_timeout: Duration,
    /// Wait for each block start and each block body
    pub block_timeout: Duration,
    /// Retry ceiling for start requests, block-start waits and invalid blocks
    pub max_errors: u32,
}

impl Default for ModemSettings {
    fn default() -> Self {
        ModemSettings {
            request_timeout: Duration::from_secs(3),
            block_timeout: Duration::from_secs(10),
            max_errors: MAX_ERRORS,
        }
    }
}

// ============================================================================
// Modem
// ============================================================================

pub struct Modem {
    stream: Box<dyn ByteStream>,
    settings: ModemSettings,
    short_block: [u8; SHORT_BLOCK_SIZE],
    long_block: Vec<u8>,
    block_counter: u8,
    // Set once a block was accepted since the last reset, so that a
    // wrapped-around 255 is not mistaken for a repeat of the first block
    has_previous: bool,
}

impl Modem {
    pub fn new(stream: Box<dyn ByteStream>, settings: ModemSettings) -> Self {
        Modem {
            stream,
            settings,
            short_block: [0; SHORT_BLOCK_SIZE],
            long_block: vec![0; LONG_BLOCK_SIZE],
            block_counter: 0,
            has_previous: false,
        }
    }

    pub fn settings(&self) -> &ModemSettings {
        &self.settings
    }

    pub fn block_counter(&self) -> u8 {
        self.block_counter
    }

    pub fn reset_block_counter(&mut self) {
        self.block_counter = 0;
        self.has_previous = false;
    }

    pub fn increment_block_counter(&mut self) {
        self.block_counter = self.block_counter.wrapping_add(1);
        self.has_previous = true;
    }

    pub fn decrement_block_counter(&mut self) {
        self.block_counter = self.block_counter.wrapping_sub(1);
    }

    pub fn send_byte(&mut self, byte: u8) -> Result<(), ModemError> {
        self.stream.write_all(&[byte])?;
        trace!("[TX] {} (0x{:02X})", byte_name(byte), byte);
        Ok(())
    }

    pub fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), ModemError> {
        self.stream.write_all(bytes)?;
        trace!(len = bytes.len(), "[TX] raw bytes");
        Ok(())
    }

    /// Sends CAN CAN to abort the transfer.
    pub fn interrupt_transmission(&mut self) -> Result<(), ModemError> {
        self.stream.write_all(&[CAN, CAN])?;
        debug!("[TX] CAN CAN");
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), ModemError> {
        self.stream.close()?;
        Ok(())
    }

    /// Sends 'C' until the sender starts a block, returning its start byte.
    pub fn request_start(&mut self) -> Result<ControlByte, ModemError> {
        let attempts = self.settings.max_errors;
        let mut timer = Timer::new(self.settings.request_timeout);

        for attempt in 1..=attempts {
            self.send_byte(START_CRC)?;
            timer.start();

            loop {
                match read_byte(self.stream.as_mut(), &timer) {
                    Ok(byte) => match ControlByte::from_byte(byte) {
                        Some(start @ (ControlByte::Short | ControlByte::Long)) => {
                            debug!(attempt, "[RX] {}", byte_name(byte));
                            return Ok(start);
                        }
                        _ => trace!("ignoring 0x{:02X} while waiting for block start", byte),
                    },
                    Err(ModemError::Timeout) => {
                        debug!(attempt, "no answer to start request");
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        self.interrupt_transmission()?;
        Err(ModemError::NoResponse { attempts })
    }

    /// Waits for SOH, STX or EOT. Each silent block timeout repeats the
    /// previous verdict (ACK when `last_ack`, NAK otherwise) to nudge the
    /// sender; the ceiling cancels the transfer.
    pub fn read_next_block_start(&mut self, last_ack: bool) -> Result<ControlByte, ModemError> {
        let mut timer = Timer::new(self.settings.block_timeout);
        let mut timeouts = 0;
        let mut cancels = 0;

        loop {
            timer.start();

            loop {
                match read_byte(self.stream.as_mut(), &timer) {
                    Ok(byte) => {
                        if let Some(start) = ControlByte::from_byte(byte) {
                            return Ok(start);
                        }
                        if byte == CAN {
                            cancels += 1;
                            if cancels >= 2 {
                                return Err(ModemError::PeerCancelled);
                            }
                        } else {
                            cancels = 0;
                            debug!("[X] expected SOH, STX or EOT, got 0x{:02X}", byte);
                        }
                    }
                    Err(ModemError::Timeout) => break,
                    Err(e) => return Err(e),
                }
            }

            timeouts += 1;
            if timeouts >= self.settings.max_errors {
                warn!(timeouts, "no block start from sender, cancelling");
                self.interrupt_transmission()?;
                return Err(ModemError::RetriesExhausted { attempts: timeouts });
            }

            let nudge = if last_ack { ACK } else { NAK };
            self.send_byte(nudge)?;
            debug!(timeouts, "block start timed out, repeated {}", byte_name(nudge));
        }
    }

    /// Reads the rest of a block whose start byte was already consumed.
    ///
    /// The whole frame is read before validating so the stream stays aligned
    /// for a retry. The returned slice borrows the framer's scratch buffer and
    /// is overwritten by the next call; copy it out first.
    pub fn read_block(
        &mut self,
        expected_seq: u8,
        kind: ControlByte,
        packet_index: u32,
        total_packets: u32,
    ) -> Result<&[u8], ModemError> {
        let timer = Timer::new(self.settings.block_timeout);

        let block: &mut [u8] = match kind {
            ControlByte::Short => &mut self.short_block,
            ControlByte::Long => &mut self.long_block,
            ControlByte::EndOfTransmission => {
                return Err(ModemError::InvalidBlock("no block follows EOT"));
            }
        };

        let seq = read_byte(self.stream.as_mut(), &timer)?;
        let complement = read_byte(self.stream.as_mut(), &timer)?;
        read_exact(self.stream.as_mut(), block, &timer)?;
        let mut crc_bytes = [0u8; 2];
        read_exact(self.stream.as_mut(), &mut crc_bytes, &timer)?;

        if self.has_previous && seq == expected_seq.wrapping_sub(1) {
            warn!(seq, "previous block received again, ACK probably lost");
            return Err(ModemError::RepeatedBlock { received: seq });
        }

        if seq != expected_seq {
            warn!(expected = expected_seq, received = seq, "block number mismatch");
            return Err(ModemError::SynchronizationLost {
                expected: expected_seq,
                received: seq,
            });
        }

        if complement != !expected_seq {
            warn!(seq, complement, "sequence complement mismatch");
            return Err(ModemError::InvalidBlock("sequence complement mismatch"));
        }

        let calculated = crc16(block);
        let received = u16::from_be_bytes(crc_bytes);
        if calculated != received {
            warn!(
                packet = packet_index,
                "CRC mismatch: calculated 0x{:04X}, received 0x{:04X}", calculated, received
            );
            return Err(ModemError::InvalidBlock("crc mismatch"));
        }

        trace!(packet = packet_index, total = total_packets, seq, len = block.len(), "[RX] block");
        Ok(&*block)
    }

    /// Reads and discards bytes until `target` arrives.
    pub fn await_byte(&mut self, target: u8, timeout: Duration) -> Result<(), ModemError> {
        let timer = Timer::new(timeout);
        loop {
            let byte = read_byte(self.stream.as_mut(), &timer)?;
            if byte == target {
                trace!("[RX] {}", byte_name(byte));
                return Ok(());
            }
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn read_byte(stream: &mut dyn ByteStream, timer: &Timer) -> Result<u8, ModemError> {
    let mut buf = [0u8; 1];
    read_exact(stream, &mut buf, timer)?;
    Ok(buf[0])
}

/// Fills `buf` completely, retrying partial reads until the timer runs out.
fn read_exact(stream: &mut dyn ByteStream, buf: &mut [u8], timer: &Timer) -> Result<(), ModemError> {
    let mut filled = 0;
    while filled < buf.len() {
        let remaining = timer.remaining();
        if remaining.is_zero() {
            return Err(ModemError::Timeout);
        }

        match stream.read_timeout(&mut buf[filled..], remaining) {
            Ok(0) => return Err(ModemError::StreamClosed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Err(ModemError::Timeout),
            Err(e) if matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ) => continue,
            Err(e) => return Err(ModemError::Io(e)),
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{MockStream, data_payload, frame, header_payload, script};

    fn settings(max_errors: u32) -> ModemSettings {
        ModemSettings {
            request_timeout: Duration::from_secs(1),
            block_timeout: Duration::from_secs(1),
            max_errors,
        }
    }

    fn modem(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Modem {
        Modem::new(Box::new(MockStream::new(responses, expected_writes)), settings(MAX_ERRORS))
    }

    /// Frame bytes after the start byte, which read_next_block_start consumes.
    fn body(seq: u8, payload: &[u8]) -> Vec<u8> {
        frame(STX, seq, payload)[1..].to_vec()
    }

    #[test]
    fn test_request_start_ignores_noise() {
        let mut modem = modem(script(&[START_CRC, 0x00, STX]), vec![START_CRC]);
        assert_eq!(modem.request_start().unwrap(), ControlByte::Long);
    }

    #[test]
    fn test_request_start_retries_after_timeout() {
        let mut modem = modem(vec![None, Some(SOH)], vec![START_CRC, START_CRC]);
        assert_eq!(modem.request_start().unwrap(), ControlByte::Short);
    }

    #[test]
    fn test_request_start_no_response_cancels() {
        let mock = MockStream::new(
            vec![None, None, None],
            vec![START_CRC, START_CRC, START_CRC, CAN, CAN],
        );
        let mut modem = Modem::new(Box::new(mock), settings(3));

        match modem.request_start() {
            Err(ModemError::NoResponse { attempts: 3 }) => {}
            other => panic!("expected NoResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_block_start_timeout_repeats_last_result() {
        let mut modem = modem(vec![None, None, Some(EOT)], vec![NAK, NAK]);
        assert_eq!(modem.read_next_block_start(false).unwrap(), ControlByte::EndOfTransmission);
    }

    #[test]
    fn test_block_start_ceiling_cancels() {
        let mock = MockStream::new(vec![None, None, None], vec![ACK, ACK, CAN, CAN]);
        let mut modem = Modem::new(Box::new(mock), settings(3));

        match modem.read_next_block_start(true) {
            Err(ModemError::RetriesExhausted { attempts: 3 }) => {}
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }

    #[test]
    fn test_block_start_skips_garbage() {
        let mut modem = modem(script(&[0x55, 0xAA, SOH]), vec![]);
        assert_eq!(modem.read_next_block_start(true).unwrap(), ControlByte::Short);
    }

    #[test]
    fn test_peer_cancel() {
        let mut modem = modem(script(&[CAN, CAN]), vec![]);
        assert!(matches!(modem.read_next_block_start(true), Err(ModemError::PeerCancelled)));
    }

    #[test]
    fn test_read_header_block() {
        let payload = header_payload("fw.bin\0100\00\00\00");
        let responses = script(&frame(SOH, 0, &payload)[1..]);
        let mut modem = modem(responses, vec![]);

        let block = modem.read_block(0, ControlByte::Short, 0, 1).unwrap();
        assert_eq!(block.len(), 128);
        assert_eq!(block, &payload[..]);
    }

    #[test]
    fn test_repeated_block() {
        let payload = data_payload(b"data");
        let mut bytes = Vec::new();
        for seq in [0u8, 1, 1] {
            bytes.extend(frame(STX, seq, &payload));
        }
        let mut modem = modem(script(&bytes), vec![]);
        modem.reset_block_counter();

        for _ in 0..2 {
            assert_eq!(modem.read_next_block_start(true).unwrap(), ControlByte::Long);
            let seq = modem.block_counter();
            modem.read_block(seq, ControlByte::Long, seq as u32, 3).unwrap();
            modem.increment_block_counter();
        }

        assert_eq!(modem.read_next_block_start(true).unwrap(), ControlByte::Long);
        match modem.read_block(modem.block_counter(), ControlByte::Long, 2, 3) {
            Err(ModemError::RepeatedBlock { received: 1 }) => {}
            other => panic!("expected RepeatedBlock, got {:?}", other.map(|b| b.len())),
        }
    }

    #[test]
    fn test_synchronization_lost() {
        let payload = data_payload(b"data");
        let mut bytes = Vec::new();
        for seq in [0u8, 1, 3] {
            bytes.extend(frame(STX, seq, &payload));
        }
        let mut modem = modem(script(&bytes), vec![]);

        for _ in 0..2 {
            modem.read_next_block_start(true).unwrap();
            modem.read_block(modem.block_counter(), ControlByte::Long, 0, 3).unwrap();
            modem.increment_block_counter();
        }

        modem.read_next_block_start(true).unwrap();
        match modem.read_block(modem.block_counter(), ControlByte::Long, 2, 3) {
            Err(ModemError::SynchronizationLost { expected: 2, received: 3 }) => {}
            other => panic!("expected SynchronizationLost, got {:?}", other.map(|b| b.len())),
        }
    }

    #[test]
    fn test_first_block_255_is_not_a_repeat() {
        let payload = data_payload(b"x");
        let mut modem = modem(script(&body(255, &payload)), vec![]);

        assert!(matches!(
            modem.read_block(0, ControlByte::Long, 0, 1),
            Err(ModemError::SynchronizationLost { expected: 0, received: 255 })
        ));
    }

    #[test]
    fn test_complement_mismatch() {
        let payload = data_payload(b"data");
        let mut bytes = body(0, &payload);
        bytes[1] = 0x00;
        let mut modem = modem(script(&bytes), vec![]);

        match modem.read_block(0, ControlByte::Long, 0, 1) {
            Err(e @ ModemError::InvalidBlock("sequence complement mismatch")) => {
                assert!(e.is_transient());
            }
            other => panic!("expected InvalidBlock, got {:?}", other.map(|b| b.len())),
        }
    }

    #[test]
    fn test_crc_mismatch() {
        let payload = data_payload(b"data");
        let mut bytes = body(0, &payload);
        bytes[10] ^= 0xFF;
        let mut modem = modem(script(&bytes), vec![]);

        assert!(matches!(
            modem.read_block(0, ControlByte::Long, 0, 1),
            Err(ModemError::InvalidBlock("crc mismatch"))
        ));
    }

    #[test]
    fn test_truncated_block_times_out() {
        let payload = data_payload(b"data");
        let bytes = body(0, &payload);
        let mut modem = modem(script(&bytes[..500]), vec![]);

        assert!(matches!(
            modem.read_block(0, ControlByte::Long, 0, 1),
            Err(ModemError::Timeout)
        ));
    }

    #[test]
    fn test_block_counter_wraps() {
        let mut modem = modem(vec![], vec![]);
        modem.reset_block_counter();
        for _ in 0..256 {
            modem.increment_block_counter();
        }
        assert_eq!(modem.block_counter(), 0);

        modem.decrement_block_counter();
        assert_eq!(modem.block_counter(), 255);

        modem.reset_block_counter();
        assert_eq!(modem.block_counter(), 0);
    }

    #[test]
    fn test_await_byte_skips_until_target() {
        let mut modem = modem(script(&[ACK, 0x00, EOT]), vec![EOT]);
        modem.send_byte(EOT).unwrap();
        modem.await_byte(EOT, Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_interrupt_sends_double_cancel() {
        let mut modem = modem(vec![], vec![CAN, CAN]);
        modem.interrupt_transmission().unwrap();
    }
}
