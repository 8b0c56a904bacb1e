// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bucketed membership set shared by the receive loop, the reaper thread,
//! and (client side) the socket resolver thread.
//!
//! Storage is a two-level array rather than a `HashMap` so that iteration
//! stays cache-friendly and a reaped record can act as a transparent gap
//! instead of forcing a compaction. This mirrors the original deployment's
//! bucket sizing; nothing about the wire protocol depends on it.

use crate::agent::AgentRecord;
use crate::codec::{AgentId, AgentSocket, AgentType};
use crate::transport::UdpTransport;
use std::sync::{Mutex, MutexGuard};

pub const MAX_NUM_AGENTS: usize = 10_000;
pub const AGENTS_PER_BUCKET: usize = 100;
pub const SILENCE_THRESHOLD_MICROS: u64 = 2_000_000;

type Bucket = [Option<AgentRecord>; AGENTS_PER_BUCKET];

struct RegistryInner {
    buckets: Vec<Box<Bucket>>,
    len: usize,
}

impl RegistryInner {
    fn new() -> Self {
        Self { buckets: Vec::new(), len: 0 }
    }

    fn iter(&self) -> impl Iterator<Item = &AgentRecord> {
        self.buckets.iter().flat_map(|b| b.iter()).filter_map(|slot| slot.as_ref())
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut AgentRecord> {
        self.buckets.iter_mut().flat_map(|b| b.iter_mut()).filter_map(|slot| slot.as_mut())
    }

    fn push(&mut self, record: AgentRecord) {
        if self.len >= MAX_NUM_AGENTS {
            panic!("domain registry is full ({MAX_NUM_AGENTS} agents); the deployment needs resizing");
        }
        let bucket_idx = self.len / AGENTS_PER_BUCKET;
        let slot_idx = self.len % AGENTS_PER_BUCKET;
        if bucket_idx == self.buckets.len() {
            self.buckets.push(Box::new(std::array::from_fn(|_| None)));
        }
        self.buckets[bucket_idx][slot_idx] = Some(record);
        self.len += 1;
    }
}

/// Shared, mutex-guarded membership set. One instance is created per
/// process and handed to the receive loop, the reaper, and (on the client
/// side) the socket resolver as an `Arc<Registry>`.
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self { inner: Mutex::new(RegistryInner::new()) }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        recover_lock(&self.inner, "Registry")
    }

    /// Find a live record matching `(public_socket, local_socket, agent_type)`
    /// and return its id, or create one. Returns `(id, newly_inserted)` so
    /// callers can decide whether to advance their own id counter.
    pub fn add_or_update(
        &self,
        public_socket: Option<AgentSocket>,
        local_socket: Option<AgentSocket>,
        agent_type: AgentType,
        id_hint: AgentId,
        now: u64,
    ) -> (AgentId, bool) {
        let mut inner = self.lock();
        for rec in inner.iter_mut() {
            if rec.alive && rec.matches(public_socket, local_socket, agent_type) {
                if matches!(agent_type, AgentType::AudioMixer | AgentType::VoxelServer) {
                    rec.last_heard_micros = now;
                }
                return (rec.id, false);
            }
        }
        let mut record = AgentRecord::new(agent_type, id_hint, public_socket, local_socket, now);
        record.apply_immediate_activation_rules();
        let id = record.id;
        inner.push(record);
        (id, true)
    }

    pub fn with_record_mut<R>(&self, id: AgentId, f: impl FnOnce(&mut AgentRecord) -> R) -> Option<R> {
        let mut inner = self.lock();
        let result = inner.iter_mut().find(|r| r.alive && r.id == id).map(f);
        result
    }

    pub fn lookup_id_by_address(&self, addr: AgentSocket) -> Option<AgentId> {
        let inner = self.lock();
        let result = inner.iter().find(|r| r.alive && r.active_socket() == Some(addr)).map(|r| r.id);
        result
    }

    /// Symmetric counterpart to `lookup_id_by_address`: the active socket
    /// for a live agent id, or `None` if unknown or not yet activated.
    pub fn lookup_by_id(&self, id: AgentId) -> Option<AgentSocket> {
        let inner = self.lock();
        let result = inner.iter().find(|r| r.alive && r.id == id).and_then(|r| r.active_socket());
        result
    }

    pub fn solo_of_type(&self, agent_type: AgentType) -> Option<AgentId> {
        let inner = self.lock();
        inner
            .iter()
            .filter(|r| r.alive && r.agent_type == agent_type && agent_type.is_solo())
            .max_by_key(|r| r.wake_micros)
            .map(|r| r.id)
    }

    /// Activate the local socket if `sender` matches it, else the public
    /// socket, for the first unactivated peer whose recorded sockets
    /// include `sender`. Used by the ping-based resolver; local wins a race.
    pub fn activate_by_ping_reply(&self, sender: AgentSocket) -> Option<AgentId> {
        let mut inner = self.lock();
        let rec = inner.iter_mut().find(|r| {
            r.alive && !r.is_active() && (r.local_socket == Some(sender) || r.public_socket == Some(sender))
        })?;
        if rec.local_socket == Some(sender) {
            rec.activate_local();
        } else {
            rec.activate_public();
        }
        Some(rec.id)
    }

    /// Sweep, marking silent non-exempt records dead. `VoxelServer` is exempt.
    pub fn reap_silent(&self, now: u64, threshold_micros: u64) -> usize {
        let mut inner = self.lock();
        let mut reaped = 0;
        for rec in inner.iter_mut() {
            if rec.alive && rec.agent_type != AgentType::VoxelServer && rec.silent_for(now) > threshold_micros {
                rec.alive = false;
                reaped += 1;
            }
        }
        reaped
    }

    pub fn for_each_live(&self, mut f: impl FnMut(&AgentRecord)) {
        let inner = self.lock();
        for rec in inner.iter() {
            if rec.alive {
                f(rec);
            }
        }
    }

    /// Send `buffer` to every live record whose active socket is set and
    /// whose type is in `types`.
    pub fn broadcast(&self, transport: &UdpTransport, buffer: &[u8], types: &[AgentType]) {
        let inner = self.lock();
        for rec in inner.iter() {
            if !rec.alive || !types.contains(&rec.agent_type) {
                continue;
            }
            let Some(sock) = rec.active_socket() else {
                continue;
            };
            let addr = std::net::SocketAddr::new(std::net::IpAddr::V4(sock.ip), sock.port);
            if let Err(e) = transport.send_to(buffer, addr) {
                tracing::debug!(%e, id = rec.id, "broadcast send failed");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().iter().filter(|r| r.alive).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Peers whose sockets are both set but neither has been activated yet —
    /// the resolver's ping targets.
    pub fn unactivated_dual_socket_ids(&self) -> Vec<(AgentId, AgentSocket, AgentSocket)> {
        let inner = self.lock();
        inner
            .iter()
            .filter(|r| r.alive && !r.is_active())
            .filter_map(|r| match (r.public_socket, r.local_socket) {
                (Some(p), Some(l)) => Some((r.id, p, l)),
                _ => None,
            })
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Recover a poisoned mutex instead of propagating the panic: one thread's
/// unwind while holding the registry lock should not take down its peers.
fn recover_lock<'a, T>(lock: &'a Mutex<T>, context: &str) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::debug!("{} mutex poisoned, recovering", context);
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sock(a: u8, b: u8, c: u8, d: u8, port: u16) -> AgentSocket {
        AgentSocket::new(Ipv4Addr::new(a, b, c, d), port)
    }

    #[test]
    fn add_or_update_creates_then_reuses_the_same_record() {
        let reg = Registry::new();
        let public = sock(203, 0, 113, 1, 40103);
        let local = sock(10, 0, 0, 1, 40103);
        let (id1, inserted1) = reg.add_or_update(Some(public), Some(local), AgentType::Interactive, 0, 0);
        assert!(inserted1);
        let (id2, inserted2) = reg.add_or_update(Some(public), Some(local), AgentType::Interactive, 99, 0);
        assert!(!inserted2);
        assert_eq!(id1, id2);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn ids_assigned_by_registry_are_unique_across_inserts() {
        let reg = Registry::new();
        let mut ids = std::collections::HashSet::new();
        for i in 0..50u16 {
            let (id, inserted) = reg.add_or_update(
                Some(sock(10, 0, 0, 1, 1000 + i)),
                None,
                AgentType::Interactive,
                i,
                0,
            );
            assert!(inserted);
            assert!(ids.insert(id));
        }
    }

    #[test]
    fn solo_of_type_prefers_largest_wake_microstamp() {
        let reg = Registry::new();
        let (older_id, _) =
            reg.add_or_update(Some(sock(1, 1, 1, 1, 1)), None, AgentType::AvatarMixer, 1, 100);
        let (newer_id, _) =
            reg.add_or_update(Some(sock(2, 2, 2, 2, 2)), None, AgentType::AvatarMixer, 2, 200);
        reg.with_record_mut(newer_id, |r| r.wake_micros = 200);
        reg.with_record_mut(older_id, |r| r.wake_micros = 100);
        assert_eq!(reg.solo_of_type(AgentType::AvatarMixer), Some(newer_id));
    }

    #[test]
    fn tie_in_wake_microstamp_keeps_the_first_seen_record() {
        let reg = Registry::new();
        let (first_id, _) =
            reg.add_or_update(Some(sock(1, 1, 1, 1, 1)), None, AgentType::AudioMixer, 1, 50);
        let (second_id, _) =
            reg.add_or_update(Some(sock(2, 2, 2, 2, 2)), None, AgentType::AudioMixer, 2, 50);
        reg.with_record_mut(first_id, |r| r.wake_micros = 50);
        reg.with_record_mut(second_id, |r| r.wake_micros = 50);
        assert_eq!(reg.solo_of_type(AgentType::AudioMixer), Some(first_id));
    }

    #[test]
    fn reap_silent_skips_voxel_server() {
        let reg = Registry::new();
        let (interactive_id, _) =
            reg.add_or_update(Some(sock(1, 1, 1, 1, 1)), None, AgentType::Interactive, 1, 0);
        let (voxel_id, _) =
            reg.add_or_update(Some(sock(2, 2, 2, 2, 2)), None, AgentType::VoxelServer, 2, 0);
        let reaped = reg.reap_silent(10_000_000, SILENCE_THRESHOLD_MICROS);
        assert_eq!(reaped, 1);
        reg.with_record_mut(interactive_id, |r| assert!(!r.alive));
        reg.with_record_mut(voxel_id, |r| assert!(r.alive));
    }

    #[test]
    fn dead_records_are_skipped_by_iteration_but_keep_their_slot() {
        let reg = Registry::new();
        let (id, _) = reg.add_or_update(Some(sock(1, 1, 1, 1, 1)), None, AgentType::Interactive, 1, 0);
        reg.with_record_mut(id, |r| r.alive = false);
        assert_eq!(reg.len(), 0);
        let mut seen = 0;
        reg.for_each_live(|_| seen += 1);
        assert_eq!(seen, 0);
    }

    #[test]
    fn ping_reply_activates_local_socket_when_it_matches() {
        let reg = Registry::new();
        let public = sock(203, 0, 113, 1, 40103);
        let local = sock(10, 0, 0, 1, 40103);
        let (id, _) = reg.add_or_update(Some(public), Some(local), AgentType::Interactive, 1, 0);
        let activated = reg.activate_by_ping_reply(local);
        assert_eq!(activated, Some(id));
        reg.with_record_mut(id, |r| assert_eq!(r.active_socket(), Some(local)));
    }

    #[test]
    fn lookup_by_id_returns_the_active_socket() {
        let reg = Registry::new();
        let public = sock(203, 0, 113, 1, 40103);
        let local = sock(10, 0, 0, 1, 40103);
        let (id, _) = reg.add_or_update(Some(public), Some(local), AgentType::AvatarMixer, 1, 0);
        // AvatarMixer activates its public socket immediately on insert.
        assert_eq!(reg.lookup_by_id(id), Some(public));
        assert_eq!(reg.lookup_by_id(id.wrapping_add(1)), None);
    }

    #[test]
    fn broadcast_sends_only_to_active_peers_of_the_requested_types() {
        let reg = Registry::new();
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let receiver_a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let receiver_b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        let a_addr = match receiver_a.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => AgentSocket::new(*a.ip(), a.port()),
            _ => unreachable!(),
        };
        let b_addr = match receiver_b.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => AgentSocket::new(*a.ip(), a.port()),
            _ => unreachable!(),
        };

        // AvatarMixer activates on insert; Interactive does not, so it
        // should never receive the broadcast even though its type matches.
        reg.add_or_update(Some(a_addr), Some(a_addr), AgentType::AvatarMixer, 1, 0);
        reg.add_or_update(Some(b_addr), Some(b_addr), AgentType::Interactive, 2, 0);

        reg.broadcast(&transport, b"hi", &[AgentType::AvatarMixer, AgentType::Interactive]);

        let mut buf = [0u8; 8];
        let mut received = None;
        for _ in 0..10 {
            if let Some((n, _)) = receiver_a.receive(&mut buf).unwrap() {
                received = Some(buf[..n].to_vec());
                break;
            }
        }
        assert_eq!(received.as_deref(), Some(&b"hi"[..]));
        assert!(receiver_b.receive(&mut buf).unwrap().is_none());
    }
}
