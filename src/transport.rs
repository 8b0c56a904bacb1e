// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP transport: a bound socket plus a once-resolved, cached hostname.

use crate::codec::MAX_PACKET_SIZE;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;
use std::time::Duration;

/// Poll timeout so the owning thread can check a shutdown flag between
/// datagrams instead of blocking forever on `recv_from`.
const RECEIVE_POLL_TIMEOUT: Duration = Duration::from_millis(200);

pub struct UdpTransport {
    socket: UdpSocket,
    resolved_host: OnceLock<Ipv4Addr>,
}

impl UdpTransport {
    pub fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).map_err(|e| TransportError::Bind(addr, e.to_string()))?;
        socket
            .set_read_timeout(Some(RECEIVE_POLL_TIMEOUT))
            .map_err(|e| TransportError::Configure(e.to_string()))?;
        Ok(Self { socket, resolved_host: OnceLock::new() })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.socket.local_addr().map_err(|e| TransportError::Configure(e.to_string()))
    }

    pub fn send_to(&self, buf: &[u8], dest: SocketAddr) -> Result<(), TransportError> {
        if buf.len() > MAX_PACKET_SIZE {
            return Err(TransportError::PacketTooLarge(buf.len()));
        }
        self.socket.send_to(buf, dest).map_err(|e| TransportError::Send(dest, e.to_string()))?;
        Ok(())
    }

    /// Resolve `host:port` once and cache the resulting IPv4 for the
    /// lifetime of this transport, then send to it.
    pub fn send_to_hostname(&self, buf: &[u8], host: &str, port: u16) -> Result<(), TransportError> {
        let ip = self.resolve_cached(host, port)?;
        self.send_to(buf, SocketAddr::V4(SocketAddrV4::new(ip, port)))
    }

    fn resolve_cached(&self, host: &str, port: u16) -> Result<Ipv4Addr, TransportError> {
        if let Some(ip) = self.resolved_host.get() {
            return Ok(*ip);
        }
        let ip = (host, port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Resolve(host.to_string(), e.to_string()))?
            .find_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                SocketAddr::V6(_) => None,
            })
            .ok_or_else(|| TransportError::Resolve(host.to_string(), "no IPv4 address found".into()))?;
        // best effort: if another thread raced us, keep whichever landed first
        let _ = self.resolved_host.set(ip);
        Ok(*self.resolved_host.get().unwrap())
    }

    /// Block until a datagram arrives or the poll timeout elapses. Returns
    /// `Ok(None)` on timeout so callers can check their stop flag.
    pub fn receive(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, TransportError> {
        match self.socket.recv_from(buf) {
            Ok((n, from)) => Ok(Some((n, from))),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                Ok(None)
            }
            Err(e) => Err(TransportError::Receive(e.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TransportError {
    Bind(SocketAddr, String),
    Configure(String),
    Send(SocketAddr, String),
    Receive(String),
    Resolve(String, String),
    PacketTooLarge(usize),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind(addr, e) => write!(f, "failed to bind UDP socket on {}: {}", addr, e),
            Self::Configure(e) => write!(f, "failed to configure UDP socket: {}", e),
            Self::Send(dest, e) => write!(f, "failed to send to {}: {}", dest, e),
            Self::Receive(e) => write!(f, "failed to receive: {}", e),
            Self::Resolve(host, e) => write!(f, "failed to resolve {}: {}", host, e),
            Self::PacketTooLarge(n) => write!(f, "packet of {} bytes exceeds {} byte ceiling", n, MAX_PACKET_SIZE),
        }
    }
}

impl std::error::Error for TransportError {}
