//! Key emission backends.
//!
//! Playback hands every key to an [`InputSink`] and never looks back: sinks
//! report their own failures through logging and must not block for long.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex};

/// Receives logical key names from playback.
pub trait InputSink: Send + Sync {
    /// Presses and releases `key`. Errors are handled by the sink.
    fn send_input(&self, key: &str);
}

/// Logs every key instead of pressing it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl InputSink for LogSink {
    fn send_input(&self, key: &str) {
        tracing::info!("key: {}", key);
    }
}

/// Collects keys in memory. Clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    keys: Arc<Mutex<Vec<String>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys received so far, oldest first.
    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().map(|k| k.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut keys) = self.keys.lock() {
            keys.clear();
        }
    }
}

impl InputSink for RecordingSink {
    fn send_input(&self, key: &str) {
        if let Ok(mut keys) = self.keys.lock() {
            keys.push(key.to_string());
        }
    }
}

/// Datagram size expected by the remote listener.
pub const DATAGRAM_SIZE: usize = 1024;

/// Message type tag for a key press request.
const EVENT_SEND_INPUT: i32 = 2;

/// Forwards keys to a remote input injector over UDP.
///
/// Each key is one fixed-size datagram laid out as
/// `[i32 message type][u64 key length][key bytes]`, little endian, padded
/// with zeros.
#[derive(Debug)]
pub struct UdpSink {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpSink {
    /// Binds an ephemeral local port for sending to `target`.
    ///
    /// # Errors
    ///
    /// Returns error if the address does not resolve or binding fails
    pub fn connect<A: ToSocketAddrs>(target: A) -> io::Result<Self> {
        let target = target.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no address to send to")
        })?;
        let bind = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind)?;
        tracing::info!("Sending keys to {}", target);
        Ok(Self { socket, target })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

/// Encodes a key press request. Keys longer than fit are truncated.
///
/// # Arguments
///
/// * `key` - Logical key name
///
/// # Returns
///
/// The zero-padded datagram
pub fn encode_key_event(key: &str) -> [u8; DATAGRAM_SIZE] {
    let mut buffer = [0u8; DATAGRAM_SIZE];
    let bytes = key.as_bytes();
    let len = bytes.len().min(DATAGRAM_SIZE - 12);
    buffer[..4].copy_from_slice(&EVENT_SEND_INPUT.to_le_bytes());
    buffer[4..12].copy_from_slice(&(len as u64).to_le_bytes());
    buffer[12..12 + len].copy_from_slice(&bytes[..len]);
    buffer
}

impl InputSink for UdpSink {
    fn send_input(&self, key: &str) {
        match self.socket.send_to(&encode_key_event(key), self.target) {
            Ok(sent) => tracing::debug!("Sent {} bytes for key {}", sent, key),
            Err(e) => tracing::warn!("Failed to send key {} to {}: {}", key, self.target, e),
        }
    }
}
