// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire codec for the domain registry protocol.
//!
//! Every multi-byte field except the agent id is network byte order. The
//! agent id is little-endian by explicit convention (not a byte-copy of
//! native storage). Nothing here is padded or aligned; fields are packed
//! back to back in the order they are produced.

use std::fmt;
use std::net::Ipv4Addr;

/// Ceiling on a single datagram, matching the original deployment's MTU budget.
pub const MAX_PACKET_SIZE: usize = 1500;

/// Sentinel meaning "no id assigned yet".
pub const UNKNOWN_AGENT_ID: AgentId = 0xFFFF;

pub type AgentId = u16;

/// Role of a participating process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentType {
    Domain,
    Interactive,
    AudioMixer,
    AvatarMixer,
    VoxelServer,
}

impl AgentType {
    /// Solo types: at most one live instance is of interest per registry.
    pub fn is_solo(self) -> bool {
        matches!(self, AgentType::AudioMixer | AgentType::AvatarMixer | AgentType::VoxelServer)
    }

    pub fn to_byte(self) -> u8 {
        match self {
            AgentType::Domain => b'D',
            AgentType::Interactive => b'I',
            AgentType::AudioMixer => b'M',
            AgentType::AvatarMixer => b'W',
            AgentType::VoxelServer => b'V',
        }
    }

    pub fn from_byte(b: u8) -> Result<Self, CodecError> {
        match b {
            b'D' => Ok(AgentType::Domain),
            b'I' => Ok(AgentType::Interactive),
            b'M' => Ok(AgentType::AudioMixer),
            b'W' => Ok(AgentType::AvatarMixer),
            b'V' => Ok(AgentType::VoxelServer),
            other => Err(CodecError::UnknownAgentType(other)),
        }
    }
}

/// First byte of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketHeader {
    DomainReportForDuty,
    DomainListRequest,
    DomainListReply,
    Ping,
    PingReply,
    HeadData,
    BulkAvatarData,
}

impl PacketHeader {
    pub fn to_byte(self) -> u8 {
        match self {
            PacketHeader::DomainReportForDuty => b'R',
            PacketHeader::DomainListRequest => b'L',
            PacketHeader::DomainListReply => b'l',
            PacketHeader::Ping => b'P',
            PacketHeader::PingReply => b'p',
            PacketHeader::HeadData => b'H',
            PacketHeader::BulkAvatarData => b'b',
        }
    }

    pub fn from_byte(b: u8) -> Result<Self, CodecError> {
        match b {
            b'R' => Ok(PacketHeader::DomainReportForDuty),
            b'L' => Ok(PacketHeader::DomainListRequest),
            b'l' => Ok(PacketHeader::DomainListReply),
            b'P' => Ok(PacketHeader::Ping),
            b'p' => Ok(PacketHeader::PingReply),
            b'H' => Ok(PacketHeader::HeadData),
            b'b' => Ok(PacketHeader::BulkAvatarData),
            other => Err(CodecError::UnknownHeader(other)),
        }
    }

    /// Peek the header byte without consuming the rest of the packet.
    pub fn peek(buf: &[u8]) -> Result<Self, CodecError> {
        let b = *buf.first().ok_or(CodecError::UnexpectedEof)?;
        Self::from_byte(b)
    }
}

/// An IPv4 socket, packed as 4 address bytes followed by 2 port bytes, both
/// in network order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgentSocket {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl AgentSocket {
    pub const WIRE_LEN: usize = 6;

    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ip.octets());
        out.extend_from_slice(&self.port.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        if buf.len() < Self::WIRE_LEN {
            return Err(CodecError::UnexpectedEof);
        }
        let (head, rest) = buf.split_at(Self::WIRE_LEN);
        let ip = Ipv4Addr::new(head[0], head[1], head[2], head[3]);
        let port = u16::from_be_bytes([head[4], head[5]]);
        Ok((Self { ip, port }, rest))
    }
}

fn encode_agent_id(id: AgentId, out: &mut Vec<u8>) {
    out.extend_from_slice(&id.to_le_bytes());
}

fn decode_agent_id(buf: &[u8]) -> Result<(AgentId, &[u8]), CodecError> {
    if buf.len() < 2 {
        return Err(CodecError::UnexpectedEof);
    }
    let (head, rest) = buf.split_at(2);
    Ok((u16::from_le_bytes([head[0], head[1]]), rest))
}

/// A check-in sent by an agent to the registry. `header` is either
/// `DomainReportForDuty` (solo types) or `DomainListRequest` (everyone else);
/// that distinction is the only thing that makes the registry advance the
/// sender's wake microstamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckIn {
    pub header: PacketHeader,
    pub agent_type: AgentType,
    pub local_socket: AgentSocket,
    pub interest_types: Vec<AgentType>,
}

impl CheckIn {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.interest_types.len());
        out.push(self.header.to_byte());
        out.push(self.agent_type.to_byte());
        self.local_socket.encode(&mut out);
        out.push(self.interest_types.len() as u8);
        for t in &self.interest_types {
            out.push(t.to_byte());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let header = PacketHeader::peek(buf)?;
        if !matches!(header, PacketHeader::DomainReportForDuty | PacketHeader::DomainListRequest) {
            return Err(CodecError::UnknownHeader(buf[0]));
        }
        let rest = &buf[1..];
        let agent_type_byte = *rest.first().ok_or(CodecError::UnexpectedEof)?;
        let agent_type = AgentType::from_byte(agent_type_byte)?;
        let rest = &rest[1..];
        let (local_socket, rest) = AgentSocket::decode(rest)?;
        let count = *rest.first().ok_or(CodecError::UnexpectedEof)? as usize;
        let rest = &rest[1..];
        if rest.len() != count {
            return Err(CodecError::TrailingBytes);
        }
        let mut interest_types = Vec::with_capacity(count);
        for &b in rest {
            interest_types.push(AgentType::from_byte(b)?);
        }
        Ok(Self { header, agent_type, local_socket, interest_types })
    }
}

/// One peer entry inside a list reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub agent_type: AgentType,
    pub id: AgentId,
    pub public_socket: AgentSocket,
    pub local_socket: AgentSocket,
}

/// The registry's reply to a check-in: zero or more peer entries followed by
/// the id it assigned (or already held) for the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListReply {
    pub peers: Vec<PeerEntry>,
    pub assigned_id: AgentId,
}

impl ListReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.peers.len() * 15 + 2);
        out.push(PacketHeader::DomainListReply.to_byte());
        for peer in &self.peers {
            out.push(peer.agent_type.to_byte());
            encode_agent_id(peer.id, &mut out);
            peer.public_socket.encode(&mut out);
            peer.local_socket.encode(&mut out);
        }
        encode_agent_id(self.assigned_id, &mut out);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let header = PacketHeader::peek(buf)?;
        if header != PacketHeader::DomainListReply {
            return Err(CodecError::UnknownHeader(buf[0]));
        }
        let mut rest = &buf[1..];
        // The trailing 2-byte assigned id means we can only tell a peer
        // entry from the sentinel by whether more than 2 bytes remain.
        let mut peers = Vec::new();
        while rest.len() > 2 {
            let type_byte = *rest.first().ok_or(CodecError::UnexpectedEof)?;
            let agent_type = AgentType::from_byte(type_byte)?;
            rest = &rest[1..];
            let (id, r) = decode_agent_id(rest)?;
            rest = r;
            let (public_socket, r) = AgentSocket::decode(rest)?;
            rest = r;
            let (local_socket, r) = AgentSocket::decode(rest)?;
            rest = r;
            peers.push(PeerEntry { agent_type, id, public_socket, local_socket });
        }
        let (assigned_id, rest) = decode_agent_id(rest)?;
        if !rest.is_empty() {
            return Err(CodecError::TrailingBytes);
        }
        Ok(Self { peers, assigned_id })
    }
}

/// `Ping` and `PingReply` carry no body.
pub fn encode_ping() -> [u8; 1] {
    [PacketHeader::Ping.to_byte()]
}

pub fn encode_ping_reply() -> [u8; 1] {
    [PacketHeader::PingReply.to_byte()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    UnexpectedEof,
    UnknownHeader(u8),
    UnknownAgentType(u8),
    TrailingBytes,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "packet truncated before a required field"),
            Self::UnknownHeader(b) => write!(f, "unrecognized packet header byte {:#04x}", b),
            Self::UnknownAgentType(b) => write!(f, "unrecognized agent type byte {:#04x}", b),
            Self::TrailingBytes => write!(f, "packet has trailing bytes inconsistent with its declared length"),
        }
    }
}

impl std::error::Error for CodecError {}
