// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The registry server's receive loop.
//!
//! Single thread: parse a check-in, update the registry, build an
//! interest-filtered list reply, send it back. The reaper runs on its own
//! thread against the same registry behind one mutex.

use crate::agent::now_micros;
use crate::codec::{AgentId, AgentSocket, AgentType, CheckIn, CodecError, ListReply, PacketHeader, PeerEntry};
use crate::config::ServerConfig;
use crate::reaper::Reaper;
use crate::registry::Registry;
use crate::transport::{TransportError, UdpTransport};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

/// Runs the registry: owns the transport, the membership set, and the
/// reaper thread's lifetime.
pub struct RegistryServer {
    transport: Arc<UdpTransport>,
    registry: Arc<Registry>,
    config: ServerConfig,
    next_id: AtomicU16,
    _reaper: Reaper,
}

impl RegistryServer {
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate().map_err(ServerError::Config)?;
        let bind_addr = SocketAddr::new(config.bind_address, config.port);
        let transport = Arc::new(UdpTransport::bind(bind_addr).map_err(ServerError::Transport)?);
        let registry = Arc::new(Registry::new());
        let reaper = Reaper::start_with(
            Arc::clone(&registry),
            config.reaper_sweep_interval(),
            config.silence_threshold().as_micros() as u64,
        )
        .map_err(|e| ServerError::Io(e.to_string()))?;

        Ok(Self { transport, registry, config, next_id: AtomicU16::new(0), _reaper: reaper })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Local IPv4 this server is bound to, used for the same-host rewrite.
    fn local_ipv4(&self) -> Option<std::net::Ipv4Addr> {
        match self.transport.local_addr().ok()?.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        }
    }

    /// Run forever. Returns only on a transport error that isn't a
    /// transient timeout (which `receive` already absorbs).
    pub fn run(&self, stop: &std::sync::atomic::AtomicBool) -> Result<(), ServerError> {
        let mut buf = [0u8; crate::codec::MAX_PACKET_SIZE];
        while !stop.load(Ordering::Relaxed) {
            let Some((n, from)) = self.transport.receive(&mut buf).map_err(ServerError::Transport)? else {
                continue;
            };
            if let Err(e) = self.handle_datagram(&buf[..n], from) {
                tracing::debug!(%e, %from, "dropped malformed check-in");
            }
        }
        Ok(())
    }

    fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) -> Result<(), ServerError> {
        let check_in = CheckIn::decode(bytes).map_err(ServerError::Codec)?;
        let now = now_micros();

        let IpAddr::V4(sender_ip) = from.ip() else {
            return Err(ServerError::Codec(CodecError::UnexpectedEof));
        };
        let public_socket = AgentSocket::new(sender_ip, from.port());

        // Same-host rewrite: a sender on this host is reachable by the
        // configured public IP, and the reply must go back to its local
        // socket rather than the (unroutable from outside) loopback-ish one.
        let (recorded_public, reply_dest) = if !self.config.local_mode && self.local_ipv4() == Some(sender_ip) {
            let public_ip = match self.config.public_ip {
                Some(IpAddr::V4(v4)) => v4,
                _ => sender_ip,
            };
            (AgentSocket::new(public_ip, public_socket.port), check_in.local_socket)
        } else {
            (public_socket, public_socket)
        };

        let id_hint = self.next_id.load(Ordering::Relaxed);
        let (id, newly_inserted) = self.registry.add_or_update(
            Some(recorded_public),
            Some(check_in.local_socket),
            check_in.agent_type,
            id_hint,
            now,
        );
        if newly_inserted {
            self.next_id.store(id_hint.wrapping_add(1), Ordering::Relaxed);
        }

        if check_in.header == PacketHeader::DomainReportForDuty && check_in.agent_type.is_solo() {
            self.registry.with_record_mut(id, |r| r.wake_micros = now);
        }
        self.registry.with_record_mut(id, |r| r.touch(now, bytes.len()));

        let reply = self.build_reply(id, check_in.agent_type, &check_in.interest_types);

        self.transport
            .send_to(&reply.encode(), SocketAddr::new(IpAddr::V4(reply_dest.ip), reply_dest.port))
            .map_err(ServerError::Transport)
    }

    fn build_reply(&self, requester_id: AgentId, requester_type: AgentType, interest: &[AgentType]) -> ListReply {
        let mut direct = Vec::new();
        let mut newest_solo: HashMap<AgentType, (u64, PeerEntry)> = HashMap::new();

        if !interest.is_empty() {
            self.registry.for_each_live(|rec| {
                if rec.id == requester_id || !interest.contains(&rec.agent_type) {
                    return;
                }
                // Avatar peers never hear about other Avatar peers.
                if requester_type == AgentType::Interactive && rec.agent_type == AgentType::Interactive {
                    return;
                }
                let (Some(public_socket), Some(local_socket)) = (rec.public_socket, rec.local_socket) else {
                    return;
                };
                let entry = PeerEntry { agent_type: rec.agent_type, id: rec.id, public_socket, local_socket };
                if rec.agent_type.is_solo() {
                    match newest_solo.get(&rec.agent_type) {
                        Some((wake, _)) if *wake >= rec.wake_micros => {}
                        _ => {
                            newest_solo.insert(rec.agent_type, (rec.wake_micros, entry));
                        }
                    }
                } else {
                    direct.push(entry);
                }
            });
        }

        direct.extend(newest_solo.into_values().map(|(_, entry)| entry));
        ListReply { peers: direct, assigned_id: requester_id }
    }
}

#[derive(Debug)]
pub enum ServerError {
    Config(crate::config::ConfigError),
    Transport(TransportError),
    Codec(CodecError),
    Io(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "configuration error: {}", e),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::Codec(e) => write!(f, "codec error: {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<crate::config::ConfigError> for ServerError {
    fn from(e: crate::config::ConfigError) -> Self {
        Self::Config(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AgentSocket, AgentType};
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicBool;

    fn local_config(port: u16) -> ServerConfig {
        ServerConfig { bind_address: "127.0.0.1".parse().unwrap(), port, local_mode: true, ..ServerConfig::default() }
    }

    #[test]
    fn new_server_starts_with_an_empty_registry() {
        let server = RegistryServer::new(local_config(0)).unwrap();
        assert!(server.registry().is_empty());
    }

    #[test]
    fn avatar_to_avatar_suppression_is_applied_in_build_reply() {
        let server = RegistryServer::new(local_config(0)).unwrap();
        let peer_public = AgentSocket::new(Ipv4Addr::new(10, 0, 0, 2), 40103);
        let (requester_id, _) = server.registry.add_or_update(
            Some(AgentSocket::new(Ipv4Addr::new(10, 0, 0, 1), 40103)),
            Some(AgentSocket::new(Ipv4Addr::new(10, 0, 0, 1), 40103)),
            AgentType::Interactive,
            0,
            0,
        );
        server.registry.add_or_update(Some(peer_public), Some(peer_public), AgentType::Interactive, 1, 0);

        let reply = server.build_reply(requester_id, AgentType::Interactive, &[AgentType::Interactive]);
        assert!(reply.peers.is_empty());
    }

    #[test]
    fn solo_type_dedup_keeps_only_the_newest_wake_microstamp() {
        let server = RegistryServer::new(local_config(0)).unwrap();
        let (requester_id, _) = server.registry.add_or_update(
            Some(AgentSocket::new(Ipv4Addr::new(10, 0, 0, 1), 40103)),
            Some(AgentSocket::new(Ipv4Addr::new(10, 0, 0, 1), 40103)),
            AgentType::Interactive,
            0,
            0,
        );
        let (old_id, _) = server.registry.add_or_update(
            Some(AgentSocket::new(Ipv4Addr::new(10, 0, 0, 2), 48000)),
            Some(AgentSocket::new(Ipv4Addr::new(10, 0, 0, 2), 48000)),
            AgentType::AudioMixer,
            1,
            0,
        );
        let (new_id, _) = server.registry.add_or_update(
            Some(AgentSocket::new(Ipv4Addr::new(10, 0, 0, 3), 48000)),
            Some(AgentSocket::new(Ipv4Addr::new(10, 0, 0, 3), 48000)),
            AgentType::AudioMixer,
            2,
            0,
        );
        server.registry.with_record_mut(old_id, |r| r.wake_micros = 100);
        server.registry.with_record_mut(new_id, |r| r.wake_micros = 200);

        let reply = server.build_reply(requester_id, AgentType::Interactive, &[AgentType::AudioMixer]);
        assert_eq!(reply.peers.len(), 1);
        assert_eq!(reply.peers[0].id, new_id);
    }

    #[test]
    fn empty_interest_set_yields_no_peers_but_still_assigns_an_id() {
        let server = RegistryServer::new(local_config(0)).unwrap();
        let (requester_id, _) =
            server.registry.add_or_update(Some(AgentSocket::new(Ipv4Addr::new(10, 0, 0, 1), 40103)), None, AgentType::Interactive, 0, 0);
        let reply = server.build_reply(requester_id, AgentType::Interactive, &[]);
        assert!(reply.peers.is_empty());
        assert_eq!(reply.assigned_id, requester_id);
    }

    #[test]
    fn run_stops_promptly_when_the_flag_is_set() {
        let server = RegistryServer::new(local_config(0)).unwrap();
        let stop = AtomicBool::new(true);
        server.run(&stop).unwrap();
    }
}
