// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client-side check-in loop: periodically announces this agent to the
//! registry and folds replies (and directly-addressed peer traffic) into
//! the same bucketed membership set the registry itself uses.

use crate::agent::{now_micros, LinkedDataFactory};
use crate::codec::{
    AgentId, AgentSocket, CheckIn, CodecError, ListReply, PacketHeader, UNKNOWN_AGENT_ID,
};
use crate::config::ClientConfig;
use crate::registry::Registry;
use crate::resolver::SocketResolver;
use crate::transport::{TransportError, UdpTransport};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

pub struct RegistryClient {
    transport: Arc<UdpTransport>,
    registry: Arc<Registry>,
    config: ClientConfig,
    own_id: AtomicU16,
    last_check_in: Mutex<Option<Instant>>,
    linked_data_factory: Option<Box<dyn LinkedDataFactory>>,
    _resolver: SocketResolver,
}

impl RegistryClient {
    pub fn new(config: ClientConfig, linked_data_factory: Option<Box<dyn LinkedDataFactory>>) -> Result<Self, ClientError> {
        config.validate().map_err(ClientError::Config)?;
        let bind_addr: SocketAddr = format!("0.0.0.0:{}", config.local_port).parse().unwrap();
        let transport = Arc::new(UdpTransport::bind(bind_addr).map_err(ClientError::Transport)?);
        let registry = Arc::new(Registry::new());
        let resolver = SocketResolver::start(Arc::clone(&registry), Arc::clone(&transport))
            .map_err(|e| ClientError::Io(e.to_string()))?;

        Ok(Self {
            transport,
            registry,
            config,
            own_id: AtomicU16::new(UNKNOWN_AGENT_ID),
            last_check_in: Mutex::new(None),
            linked_data_factory,
            _resolver: resolver,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn own_id(&self) -> AgentId {
        self.own_id.load(Ordering::Relaxed)
    }

    /// `true` once `check_in_interval` has elapsed since the last check-in
    /// (or immediately, if none has been sent yet).
    pub fn check_in_due(&self) -> bool {
        let last = self.last_check_in.lock().unwrap_or_else(|p| p.into_inner());
        match *last {
            None => true,
            Some(t) => t.elapsed() >= self.config.check_in_interval(),
        }
    }

    fn local_socket(&self) -> Result<AgentSocket, ClientError> {
        let addr = self.transport.local_addr().map_err(ClientError::Transport)?;
        match addr.ip() {
            IpAddr::V4(ip) => Ok(AgentSocket::new(ip, addr.port())),
            IpAddr::V6(_) => Err(ClientError::Io("IPv6 local address unsupported".into())),
        }
    }

    /// Send a check-in if due. `ReportForDuty` is used for solo agent types
    /// so the registry advances our wake microstamp; everyone else sends
    /// `ListRequest`.
    pub fn check_in_if_due(&self) -> Result<(), ClientError> {
        if !self.check_in_due() {
            return Ok(());
        }
        let header = if self.config.agent_type.is_solo() {
            PacketHeader::DomainReportForDuty
        } else {
            PacketHeader::DomainListRequest
        };
        let check_in = CheckIn {
            header,
            agent_type: self.config.agent_type,
            local_socket: self.local_socket()?,
            interest_types: self.config.interest_types.clone(),
        };
        self.transport
            .send_to_hostname(&check_in.encode(), &self.config.registry_host, self.config.registry_port)
            .map_err(ClientError::Transport)?;
        *self.last_check_in.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
        Ok(())
    }

    /// Process one inbound datagram: a list reply from the registry, a
    /// ping/ping-reply from the resolver's protocol, or directly-addressed
    /// peer data.
    pub fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) -> Result<(), ClientError> {
        let header = PacketHeader::peek(bytes).map_err(ClientError::Codec)?;
        match header {
            PacketHeader::DomainListReply => self.process_list_reply(bytes),
            PacketHeader::Ping => {
                self.transport.send_to(&crate::codec::encode_ping_reply(), from).map_err(ClientError::Transport)
            }
            PacketHeader::PingReply => {
                self.registry.activate_by_ping_reply(to_agent_socket(from)?);
                Ok(())
            }
            PacketHeader::HeadData | PacketHeader::BulkAvatarData => self.process_peer_data(from, bytes.len()),
            PacketHeader::DomainReportForDuty | PacketHeader::DomainListRequest => {
                Err(ClientError::Codec(CodecError::UnknownHeader(bytes[0])))
            }
        }
    }

    fn process_list_reply(&self, bytes: &[u8]) -> Result<(), ClientError> {
        let reply = ListReply::decode(bytes).map_err(ClientError::Codec)?;
        self.own_id.store(reply.assigned_id, Ordering::Relaxed);
        let now = now_micros();
        for peer in reply.peers {
            self.registry.add_or_update(
                Some(peer.public_socket),
                Some(peer.local_socket),
                peer.agent_type,
                peer.id,
                now,
            );
        }
        Ok(())
    }

    /// Data addressed directly from a peer. An unknown sender is created on
    /// the fly (the original bulk-avatar path does the same for inbound
    /// avatar data from ids the client hasn't seen in a list reply yet).
    fn process_peer_data(&self, from: SocketAddr, len: usize) -> Result<(), ClientError> {
        let sock = to_agent_socket(from)?;
        let now = now_micros();
        let id = match self.registry.lookup_id_by_address(sock) {
            Some(id) => id,
            None => {
                let (id, _) = self.registry.add_or_update(
                    Some(sock),
                    None,
                    crate::codec::AgentType::Interactive,
                    UNKNOWN_AGENT_ID,
                    now,
                );
                id
            }
        };
        self.registry.with_record_mut(id, |r| {
            r.touch(now, len);
            if r.linked_data.is_none() {
                if let Some(factory) = &self.linked_data_factory {
                    r.linked_data = Some(factory.create(r.agent_type));
                }
            }
        });
        Ok(())
    }

    /// Run forever: check in when due, otherwise drain inbound datagrams.
    pub fn run(&self, stop: &std::sync::atomic::AtomicBool) -> Result<(), ClientError> {
        let mut buf = [0u8; crate::codec::MAX_PACKET_SIZE];
        while !stop.load(Ordering::Relaxed) {
            self.check_in_if_due()?;
            if let Some((n, from)) = self.transport.receive(&mut buf).map_err(ClientError::Transport)? {
                if let Err(e) = self.handle_datagram(&buf[..n], from) {
                    tracing::debug!(%e, %from, "dropped malformed packet");
                }
            }
        }
        Ok(())
    }
}

fn to_agent_socket(addr: SocketAddr) -> Result<AgentSocket, ClientError> {
    match addr.ip() {
        IpAddr::V4(ip) => Ok(AgentSocket::new(ip, addr.port())),
        IpAddr::V6(_) => Err(ClientError::Io("IPv6 peer address unsupported".into())),
    }
}

#[derive(Debug)]
pub enum ClientError {
    Config(crate::config::ConfigError),
    Transport(TransportError),
    Codec(CodecError),
    Io(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "configuration error: {}", e),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::Codec(e) => write!(f, "codec error: {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AgentType;

    fn config(port: u16) -> ClientConfig {
        ClientConfig {
            registry_host: "127.0.0.1".into(),
            registry_port: 40102,
            agent_type: AgentType::Interactive,
            local_port: port,
            interest_types: vec![AgentType::Interactive],
            check_in_interval_secs: 1,
        }
    }

    #[test]
    fn check_in_is_due_before_the_first_send() {
        let client = RegistryClient::new(config(0), None).unwrap();
        assert!(client.check_in_due());
    }

    #[test]
    fn check_in_is_not_due_immediately_after_sending() {
        let client = RegistryClient::new(config(0), None).unwrap();
        client.check_in_if_due().unwrap();
        assert!(!client.check_in_due());
    }

    #[test]
    fn list_reply_populates_the_client_registry_and_own_id() {
        let client = RegistryClient::new(config(0), None).unwrap();
        let peer = crate::codec::PeerEntry {
            agent_type: AgentType::AvatarMixer,
            id: 3,
            public_socket: AgentSocket::new(std::net::Ipv4Addr::new(203, 0, 113, 5), 40103),
            local_socket: AgentSocket::new(std::net::Ipv4Addr::new(10, 0, 0, 5), 40103),
        };
        let reply = ListReply { peers: vec![peer], assigned_id: 9 };
        client.process_list_reply(&reply.encode()).unwrap();
        assert_eq!(client.own_id(), 9);
        assert_eq!(client.registry().len(), 1);
    }

    #[test]
    fn ping_is_answered_with_a_ping_reply() {
        let probe = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let client = RegistryClient::new(config(0), None).unwrap();
        let probe_addr = probe.local_addr().unwrap();
        client.handle_datagram(&crate::codec::encode_ping(), probe_addr).unwrap();

        let mut buf = [0u8; 8];
        let mut received = None;
        for _ in 0..10 {
            if let Some((n, _)) = probe.receive(&mut buf).unwrap() {
                received = Some(buf[..n].to_vec());
                break;
            }
        }
        assert_eq!(received.as_deref(), Some(&crate::codec::encode_ping_reply()[..]));
    }
}
