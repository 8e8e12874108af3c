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

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

// ============================================================================
// ByteStream Trait
// ============================================================================

/// Duplex byte stream the protocol engine runs over. Reads may return fewer
/// bytes than requested; writes are flushed before returning.
pub trait ByteStream: Send {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    fn close(&mut self) -> std::io::Result<()>;
}

// ============================================================================
// TCP Implementation
// ============================================================================

pub struct TcpConnection {
    stream: TcpStream,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        Ok(TcpConnection { stream })
    }
}

impl ByteStream for TcpConnection {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        // A zero duration means "block forever" to set_read_timeout
        let timeout = timeout.max(Duration::from_millis(1));
        self.stream.set_read_timeout(Some(timeout))?;
        match self.stream.read(buf) {
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "TCP read timed out",
            )),
            other => other,
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(buf)?;
        self.stream.flush()
    }

    fn close(&mut self) -> std::io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

// ============================================================================
// Serial Implementation
// ============================================================================

/// Serial device wrapped by the serialport crate, used for native bridges
/// such as an RFCOMM device node.
pub struct SerialConnection {
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialConnection {
    pub fn open(device: &str, baud_rate: u32) -> Result<Self, serialport::Error> {
        let port = serialport::new(device, baud_rate)
            .timeout(Duration::from_millis(100))
            .open()?;

        Ok(SerialConnection { port: Some(port) })
    }

    fn port(&mut self) -> std::io::Result<&mut Box<dyn serialport::SerialPort>> {
        self.port.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "serial bridge closed")
        })
    }
}

impl ByteStream for SerialConnection {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        let port = self.port()?;
        port.set_timeout(timeout)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        port.read(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        let port = self.port()?;
        port.write_all(buf)?;
        port.flush()?;
        Ok(())
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.port = None;
        Ok(())
    }
}

// ============================================================================
// Mock Stream for Testing
// ============================================================================

#[cfg(test)]
pub struct MockStream {
    // Data to return on reads (None = timeout)
    read_buffer: Vec<Option<u8>>,
    read_pos: usize,
    // Track what was written
    write_log: Vec<u8>,
    // Expected writes for verification
    expected_writes: Vec<u8>,
    closed: bool,
}

#[cfg(test)]
impl MockStream {
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        MockStream {
            read_buffer: responses,
            read_pos: 0,
            write_log: Vec::new(),
            expected_writes,
            closed: false,
        }
    }
}

#[cfg(test)]
impl ByteStream for MockStream {
    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "Mock closed"));
        }

        // Out of responses = timeout
        if self.read_pos >= self.read_buffer.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Mock timeout"
            ));
        }

        // If current response is None = timeout
        if self.read_buffer[self.read_pos].is_none() {
            self.read_pos += 1;
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Mock timeout"
            ));
        }

        let mut bytes_read = 0;
        while bytes_read < buf.len() && self.read_pos < self.read_buffer.len() {
            match self.read_buffer[self.read_pos] {
                Some(byte) => {
                    buf[bytes_read] = byte;
                    bytes_read += 1;
                    self.read_pos += 1;
                }
                None => break,  // Stop at timeout marker
            }
        }

        Ok(bytes_read)
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.write_log.extend_from_slice(buf);
        Ok(())
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
impl Drop for MockStream {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert_eq!(
            self.read_pos,
            self.read_buffer.len(),
            "MockStream dropped with {} unconsumed responses (read {} of {} bytes)",
            self.read_buffer.len() - self.read_pos,
            self.read_pos,
            self.read_buffer.len()
        );

        assert_eq!(
            &self.write_log,
            &self.expected_writes,
            "MockStream write log mismatch!\nExpected {} bytes:\n{:02X?}\nGot {} bytes:\n{:02X?}",
            self.expected_writes.len(),
            self.expected_writes,
            self.write_log.len(),
            self.write_log
        );
    }
}

// ============================================================================
// Script Builders for Testing
// ============================================================================

/// Wraps raw bytes as mock responses.
#[cfg(test)]
pub fn script(bytes: &[u8]) -> Vec<Option<u8>> {
    bytes.iter().map(|&b| Some(b)).collect()
}

/// Full frame as a sender emits it: start byte, sequence, complement,
/// payload, big-endian CRC.
#[cfg(test)]
pub fn frame(start: u8, seq: u8, payload: &[u8]) -> Vec<u8> {
    let crc = crate::crc::crc16(payload);
    let mut out = vec![start, seq, !seq];
    out.extend_from_slice(payload);
    out.push((crc >> 8) as u8);
    out.push((crc & 0xFF) as u8);
    out
}

/// NUL-padded 128-byte header payload.
#[cfg(test)]
pub fn header_payload(header: &str) -> Vec<u8> {
    let mut block = header.as_bytes().to_vec();
    block.resize(crate::protocol::SHORT_BLOCK_SIZE, 0);
    block
}

/// 1024-byte data payload padded with CPMEOF.
#[cfg(test)]
pub fn data_payload(data: &[u8]) -> Vec<u8> {
    let mut block = data.to_vec();
    block.resize(crate::protocol::LONG_BLOCK_SIZE, crate::protocol::CPMEOF);
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_mock_partial_reads_stop_at_timeout() {
        let mut mock = MockStream::new(vec![Some(1), Some(2), None, Some(3)], vec![]);
        let mut buf = [0u8; 8];

        assert_eq!(mock.read_timeout(&mut buf, Duration::ZERO).unwrap(), 2);
        assert_eq!(&buf[..2], &[1, 2]);

        let err = mock.read_timeout(&mut buf, Duration::ZERO).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);

        assert_eq!(mock.read_timeout(&mut buf, Duration::ZERO).unwrap(), 1);
        assert_eq!(buf[0], 3);
    }

    #[test]
    fn test_frame_layout() {
        let payload = header_payload("a\0b");
        let framed = frame(crate::protocol::SOH, 0, &payload);
        assert_eq!(framed.len(), 1 + 2 + 128 + 2);
        assert_eq!(&framed[..3], &[crate::protocol::SOH, 0x00, 0xFF]);
        assert_eq!(&framed[3..6], b"a\0b");
    }

    #[test]
    fn test_tcp_connection_timeout_and_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).unwrap();
            stream.write_all(&[byte[0] + 1]).unwrap();
        });

        let (accepted, _) = listener.accept().unwrap();
        let mut conn = TcpConnection::new(accepted).unwrap();

        let mut buf = [0u8; 1];
        let err = conn.read_timeout(&mut buf, Duration::from_millis(20)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);

        conn.write_all(&[41]).unwrap();
        let n = conn.read_timeout(&mut buf, Duration::from_secs(5)).unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf[0], 42);

        client.join().unwrap();
        conn.close().unwrap();
    }
}
