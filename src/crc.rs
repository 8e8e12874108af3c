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

//! CRC-16/XMODEM (poly 0x1021, init 0, no reflection)

const POLY: u16 = 0x1021;

const TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ POLY } else { crc << 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Checksum of one block payload, as carried big-endian after the block.
pub fn crc16(block: &[u8]) -> u16 {
    block.iter().fold(0u16, |crc, &byte| {
        (crc << 8) ^ TABLE[((crc >> 8) as u8 ^ byte) as usize]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_all_zero_block() {
        assert_eq!(crc16(&[0u8; 128]), 0x0000);
        assert_eq!(crc16(&[0u8; 1024]), 0x0000);
    }

    #[test]
    fn test_single_byte_change_detected() {
        let block = [0x1Au8; 128];
        let mut damaged = block;
        damaged[127] = 0x1B;
        assert_eq!(crc16(&block), crc16(&block));
        assert_ne!(crc16(&block), crc16(&damaged));
    }

    #[test]
    fn test_order_sensitive() {
        let mut block = [0u8; 128];
        for (i, byte) in block.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let original = crc16(&block);
        block.swap(10, 11);
        assert_ne!(crc16(&block), original);
    }
}
