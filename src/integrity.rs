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

//! Strips the CPMEOF fill from the final block and checks the declared size.

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, info, warn};
use crate::protocol::{CPMEOF, LONG_BLOCK_SIZE};

/// Fill bytes the sender appended to round `expected_size` up to a whole block.
pub fn padding_len(expected_size: u64) -> u64 {
    let block = LONG_BLOCK_SIZE as u64;
    (block - expected_size % block) % block
}

/// Truncates the trailing padding if every padding byte is CPMEOF.
/// Returns whether the file was shortened.
pub fn remove_padding(path: &Path, expected_size: u64) -> std::io::Result<bool> {
    let remainder = padding_len(expected_size);
    if remainder == 0 {
        debug!(expected_size, "size is a whole number of blocks, no padding expected");
        return Ok(false);
    }

    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let actual = file.metadata()?.len();
    if actual <= expected_size || actual < remainder {
        debug!(actual, expected_size, "no additional padding found");
        return Ok(false);
    }

    let kept = actual - remainder;
    file.seek(SeekFrom::Start(kept))?;
    let mut tail = vec![0u8; remainder as usize];
    file.read_exact(&mut tail)?;

    if tail.iter().all(|&b| b == CPMEOF) {
        file.set_len(kept)?;
        debug!(removed = remainder, size = kept, "padding removed");
        Ok(true)
    } else {
        debug!("no additional padding found");
        Ok(false)
    }
}

/// True when the file exists, is non-empty and matches `expected_size` once
/// padding is removed.
pub fn check_integrity(path: &Path, expected_size: u64) -> std::io::Result<bool> {
    let actual = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "received file is missing");
            return Ok(false);
        }
        Err(e) => return Err(e),
    };

    if actual == 0 {
        warn!(path = %path.display(), "received file is empty");
        return Ok(false);
    }

    remove_padding(path, expected_size)?;

    let actual = fs::metadata(path)?.len();
    if actual != expected_size {
        warn!(actual, expected = expected_size, "[X] size mismatch after padding removal");
        return Ok(false);
    }

    info!(size = actual, "[O] integrity check passed");
    Ok(true)
}
