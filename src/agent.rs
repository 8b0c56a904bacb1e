// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Agent records held by the registry.

use crate::codec::{AgentId, AgentSocket, AgentType};
use std::any::Any;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as microseconds since the epoch, the unit every timestamp
/// field in this module is kept in.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Produces the opaque per-agent payload on first data packet. The registry
/// never looks inside what this returns.
pub trait LinkedDataFactory: Send + Sync {
    fn create(&self, agent_type: AgentType) -> Box<dyn Any + Send + Sync>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActiveSocket {
    Public,
    Local,
}

/// One peer's identity, addressing, and liveness state.
pub struct AgentRecord {
    pub agent_type: AgentType,
    pub id: AgentId,
    pub public_socket: Option<AgentSocket>,
    pub local_socket: Option<AgentSocket>,
    active_socket: Option<ActiveSocket>,
    pub last_heard_micros: u64,
    pub wake_micros: u64,
    pub bytes_received: u64,
    pub alive: bool,
    pub linked_data: Option<Box<dyn Any + Send + Sync>>,
}

impl AgentRecord {
    pub fn new(
        agent_type: AgentType,
        id: AgentId,
        public_socket: Option<AgentSocket>,
        local_socket: Option<AgentSocket>,
        now: u64,
    ) -> Self {
        Self {
            agent_type,
            id,
            public_socket,
            local_socket,
            active_socket: None,
            last_heard_micros: now,
            wake_micros: now,
            bytes_received: 0,
            alive: true,
            linked_data: None,
        }
    }

    /// `true` when `public_socket`/`local_socket` (where set on both sides)
    /// and `agent_type` match. A null socket on either side is a wildcard.
    pub fn matches(
        &self,
        public_socket: Option<AgentSocket>,
        local_socket: Option<AgentSocket>,
        agent_type: AgentType,
    ) -> bool {
        if self.agent_type != agent_type {
            return false;
        }
        let public_ok = match (self.public_socket, public_socket) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        let local_ok = match (self.local_socket, local_socket) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        public_ok && local_ok
    }

    pub fn active_socket(&self) -> Option<AgentSocket> {
        match self.active_socket? {
            ActiveSocket::Public => self.public_socket,
            ActiveSocket::Local => self.local_socket,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_socket.is_some()
    }

    pub fn activate_public(&mut self) {
        if self.public_socket.is_some() {
            self.active_socket = Some(ActiveSocket::Public);
        }
    }

    pub fn activate_local(&mut self) {
        if self.local_socket.is_some() {
            self.active_socket = Some(ActiveSocket::Local);
        }
    }

    /// Loopback (public == local) or a trusted role activates immediately.
    pub fn apply_immediate_activation_rules(&mut self) {
        if let (Some(public), Some(local)) = (self.public_socket, self.local_socket) {
            if public == local {
                self.activate_public();
                return;
            }
        }
        if matches!(
            self.agent_type,
            AgentType::AvatarMixer | AgentType::AudioMixer | AgentType::VoxelServer
        ) {
            self.activate_public();
        }
    }

    pub fn touch(&mut self, now: u64, bytes: usize) {
        self.last_heard_micros = now;
        self.bytes_received += bytes as u64;
    }

    pub fn silent_for(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_heard_micros)
    }
}
