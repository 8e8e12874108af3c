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

//! Transport acceptors and the per-transport listener loop.

use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use crate::session::{Recovery, SessionContext, classify_error, run_session};
use crate::stream::{ByteStream, SerialConnection, TcpConnection};

// ============================================================================
// Acceptor Trait
// ============================================================================

pub struct Connection {
    pub stream: Box<dyn ByteStream>,
    pub peer: String,
}

pub trait Acceptor: Send {
    /// Opens the listening resource. A no-op when already bound.
    fn bind(&mut self) -> std::io::Result<()>;

    /// Blocks until a peer connects. Returns `None` once `running` is cleared.
    fn accept(&mut self, running: &AtomicBool) -> std::io::Result<Option<Connection>>;

    fn close(&mut self);

    fn kind(&self) -> &'static str;
}

// ============================================================================
// TCP Acceptor
// ============================================================================

pub struct TcpAcceptor {
    addr: String,
    poll_interval: Duration,
    listener: Option<TcpListener>,
}

impl TcpAcceptor {
    pub fn new(bind: &str, port: u16, poll_interval: Duration) -> Self {
        TcpAcceptor {
            addr: format!("{}:{}", bind, port),
            poll_interval,
            listener: None,
        }
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }
}

impl Acceptor for TcpAcceptor {
    fn bind(&mut self) -> std::io::Result<()> {
        if self.listener.is_some() {
            return Ok(());
        }

        let listener = TcpListener::bind(&self.addr)?;
        // Polled so a cleared run flag is noticed without a connection
        listener.set_nonblocking(true)?;
        info!(addr = %self.addr, "TCP listener bound");
        self.listener = Some(listener);
        Ok(())
    }

    fn accept(&mut self, running: &AtomicBool) -> std::io::Result<Option<Connection>> {
        let listener = self.listener.as_ref().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "TCP listener not bound")
        })?;

        while running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    return Ok(Some(Connection {
                        stream: Box::new(TcpConnection::new(stream)?),
                        peer: peer.to_string(),
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(self.poll_interval);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn close(&mut self) {
        if self.listener.take().is_some() {
            debug!(addr = %self.addr, "TCP listener closed");
        }
    }

    fn kind(&self) -> &'static str {
        "tcp"
    }
}

// ============================================================================
// Connection Signal
// ============================================================================

#[derive(Debug, Default)]
struct LinkState {
    connected: bool,
    // Bumped on every new connection so one link is only accepted once
    generation: u64,
}

/// Connected/disconnected flag flipped by a watcher thread and awaited by
/// the acceptor.
#[derive(Debug, Default)]
pub struct ConnectionSignal {
    state: Mutex<LinkState>,
    changed: Condvar,
}

impl ConnectionSignal {
    pub fn notify_connected(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.connected {
            state.connected = true;
            state.generation += 1;
            self.changed.notify_all();
        }
    }

    pub fn notify_disconnected(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.connected {
            state.connected = false;
            self.changed.notify_all();
        }
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).connected
    }

    /// Waits up to `timeout` for a connection newer than `seen`, returning
    /// its generation.
    pub fn wait_connected(&self, seen: u64, timeout: Duration) -> Option<u64> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| !(s.connected && s.generation > seen))
            .unwrap_or_else(PoisonError::into_inner);

        (state.connected && state.generation > seen).then_some(state.generation)
    }
}

// ============================================================================
// Bridge Acceptor
// ============================================================================

/// Native serial bridge such as an RFCOMM device node. The node appearing
/// counts as a peer connecting.
pub struct BridgeAcceptor {
    device: String,
    baud_rate: u32,
    poll_interval: Duration,
    signal: Arc<ConnectionSignal>,
    watching: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
    accepted: u64,
}

impl BridgeAcceptor {
    pub fn new(device: &str, baud_rate: u32, poll_interval: Duration) -> Self {
        BridgeAcceptor {
            device: device.to_string(),
            baud_rate,
            poll_interval,
            signal: Arc::new(ConnectionSignal::default()),
            watching: Arc::new(AtomicBool::new(false)),
            watcher: None,
            accepted: 0,
        }
    }

    #[cfg(test)]
    pub fn signal(&self) -> Arc<ConnectionSignal> {
        Arc::clone(&self.signal)
    }
}

impl Acceptor for BridgeAcceptor {
    fn bind(&mut self) -> std::io::Result<()> {
        if self.watcher.is_some() {
            return Ok(());
        }

        self.watching.store(true, Ordering::SeqCst);
        let device = self.device.clone();
        let signal = Arc::clone(&self.signal);
        let watching = Arc::clone(&self.watching);
        let poll_interval = self.poll_interval;

        let watcher = std::thread::Builder::new()
            .name("bridge-watch".into())
            .spawn(move || {
                while watching.load(Ordering::SeqCst) {
                    if Path::new(&device).exists() {
                        signal.notify_connected();
                    } else {
                        signal.notify_disconnected();
                    }
                    std::thread::sleep(poll_interval);
                }
            })?;

        info!(device = %self.device, "watching bridge device");
        self.watcher = Some(watcher);
        Ok(())
    }

    fn accept(&mut self, running: &AtomicBool) -> std::io::Result<Option<Connection>> {
        while running.load(Ordering::SeqCst) {
            let Some(generation) = self.signal.wait_connected(self.accepted, self.poll_interval) else {
                continue;
            };

            self.accepted = generation;
            let stream = SerialConnection::open(&self.device, self.baud_rate)
                .map_err(std::io::Error::other)?;
            return Ok(Some(Connection {
                stream: Box::new(stream),
                peer: self.device.clone(),
            }));
        }
        Ok(None)
    }

    fn close(&mut self) {
        self.watching.store(false, Ordering::SeqCst);
        if let Some(watcher) = self.watcher.take() {
            if watcher.join().is_err() {
                warn!("bridge watcher panicked");
            }
        }
        self.signal.notify_disconnected();
    }

    fn kind(&self) -> &'static str {
        "bridge"
    }
}

// ============================================================================
// Listener Loop
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct ListenerSettings {
    /// Consecutive socket-level failures tolerated before rebinding
    pub socket_error_budget: u32,
    pub rebuild_delay: Duration,
    pub bind_retry_delay: Duration,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        ListenerSettings {
            socket_error_budget: 3,
            rebuild_delay: Duration::from_secs(5),
            bind_retry_delay: Duration::from_secs(10),
        }
    }
}

enum ServeEnd {
    Stopped,
    Rebuild,
    AcceptFailed,
}

/// Accepts one connection at a time and runs its session to completion.
pub struct Listener<A: Acceptor> {
    acceptor: A,
    ctx: Arc<SessionContext>,
    settings: ListenerSettings,
    running: Arc<AtomicBool>,
}

impl<A: Acceptor> Listener<A> {
    pub fn new(
        acceptor: A,
        ctx: Arc<SessionContext>,
        settings: ListenerSettings,
        running: Arc<AtomicBool>,
    ) -> Self {
        Listener {
            acceptor,
            ctx,
            settings,
            running,
        }
    }

    /// Runs until the shared run flag is cleared.
    pub fn run(&mut self) {
        let kind = self.acceptor.kind();
        let mut socket_errors = 0;

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.acceptor.bind() {
                error!(kind, "[X] failed to start listener: {}", e);
                self.pause(self.settings.bind_retry_delay);
                continue;
            }

            let end = self.serve(&mut socket_errors);
            self.acceptor.close();

            match end {
                ServeEnd::Stopped => break,
                ServeEnd::Rebuild => info!(kind, "rebuilding listener"),
                ServeEnd::AcceptFailed => self.pause(self.settings.rebuild_delay),
            }
        }

        info!(kind, "listener stopped");
    }

    fn serve(&mut self, socket_errors: &mut u32) -> ServeEnd {
        let kind = self.acceptor.kind();

        loop {
            if *socket_errors > self.settings.socket_error_budget {
                warn!(kind, errors = *socket_errors, "[X] too many socket errors, restarting listener");
                *socket_errors = 0;
                return ServeEnd::Rebuild;
            }

            info!(kind, "waiting for connection");
            let connection = match self.acceptor.accept(&self.running) {
                Ok(Some(connection)) => connection,
                Ok(None) => return ServeEnd::Stopped,
                Err(e) => {
                    error!(kind, "[X] accept failed: {}", e);
                    return ServeEnd::AcceptFailed;
                }
            };

            info!(kind, peer = %connection.peer, "[O] client connected");
            match run_session(connection.stream, &self.ctx) {
                Ok(_) => *socket_errors = 0,
                Err(e) => {
                    if e.is_socket_level() {
                        *socket_errors += 1;
                    }
                    match classify_error(&e) {
                        Recovery::KeepListener => {
                            info!(kind, "closing connection, waiting for the next one");
                        }
                        Recovery::RestartListener => {
                            warn!(kind, "[X] unhandled error, restarting listener: {}", e);
                            return ServeEnd::Rebuild;
                        }
                    }
                }
            }
        }
    }

    /// Sleeps for `delay` unless the run flag is cleared first.
    fn pause(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        while self.running.load(Ordering::SeqCst) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            std::thread::sleep(remaining.min(Duration::from_millis(100)));
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
