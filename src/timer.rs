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

use std::time::{Duration, Instant};

/// Monotonic deadline bounding a blocking read.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    timeout: Duration,
    deadline: Instant,
}

impl Timer {
    /// Creates a timer that is already running.
    pub fn new(timeout: Duration) -> Self {
        Timer {
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    /// Re-arms the deadline `timeout` from now.
    pub fn start(&mut self) -> &mut Self {
        self.deadline = Instant::now() + self.timeout;
        self
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Time left before the deadline, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_timeout_is_expired() {
        let timer = Timer::new(Duration::ZERO);
        assert!(timer.is_expired());
        assert_eq!(timer.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_long_timeout_not_expired() {
        let mut timer = Timer::new(Duration::from_secs(60));
        assert!(!timer.is_expired());
        assert!(timer.start().remaining() > Duration::from_secs(59));
        assert_eq!(timer.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_expires_after_deadline() {
        let timer = Timer::new(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(20));
        assert!(timer.is_expired());
    }
}
