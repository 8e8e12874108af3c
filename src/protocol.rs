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

//! YMODEM wire constants

/// Start of header - begins a 128-byte block
pub const SOH: u8 = 0x01;

/// Start of text - begins a 1024-byte block
pub const STX: u8 = 0x02;

/// End of transmission
pub const EOT: u8 = 0x04;

/// Block accepted
pub const ACK: u8 = 0x06;

/// Block rejected, resend
pub const NAK: u8 = 0x15;

/// Cancel - sent twice to abort the transfer
pub const CAN: u8 = 0x18;

/// Padding filler appended to the final data block
pub const CPMEOF: u8 = 0x1A;

/// Start-of-transfer request in CRC mode
pub const START_CRC: u8 = b'C';

/// Payload size of an SOH block
pub const SHORT_BLOCK_SIZE: usize = 128;

/// Payload size of an STX block
pub const LONG_BLOCK_SIZE: usize = 1024;

/// Transient error ceiling for one session
pub const MAX_ERRORS: u32 = 10;

/// Default TCP port of the file-transfer channel
pub const DEFAULT_PORT: u16 = 55556;

/// Block-start byte read off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlByte {
    /// SOH, a 128-byte block follows
    Short,
    /// STX, a 1024-byte block follows
    Long,
    /// EOT, the sender has no more blocks
    EndOfTransmission,
}

impl ControlByte {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            SOH => Some(ControlByte::Short),
            STX => Some(ControlByte::Long),
            EOT => Some(ControlByte::EndOfTransmission),
            _ => None,
        }
    }
}

/// Human readable name of a control byte, for trace output.
pub fn byte_name(byte: u8) -> &'static str {
    match byte {
        SOH => "SOH",
        STX => "STX",
        EOT => "EOT",
        ACK => "ACK",
        NAK => "NAK",
        CAN => "CAN",
        CPMEOF => "CPMEOF",
        START_CRC => "'C'",
        _ => "data",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_byte_mapping() {
        assert_eq!(ControlByte::from_byte(SOH), Some(ControlByte::Short));
        assert_eq!(ControlByte::from_byte(STX), Some(ControlByte::Long));
        assert_eq!(ControlByte::from_byte(EOT), Some(ControlByte::EndOfTransmission));
        assert_eq!(ControlByte::from_byte(ACK), None);
        assert_eq!(ControlByte::from_byte(CAN), None);
    }
}
