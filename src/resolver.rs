// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client-side socket resolver: pings both sockets of an unactivated peer
//! and activates whichever replies first, local winning a race against
//! public. Runs on its own cadence, independent of the check-in loop.

use crate::codec::encode_ping;
use crate::registry::Registry;
use crate::transport::UdpTransport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const PING_INTERVAL: Duration = Duration::from_secs(1);
/// Sleep in small slices so `stop()` doesn't have to wait out a full
/// `PING_INTERVAL` before the thread notices.
const SHUTDOWN_POLL_GRANULARITY: Duration = Duration::from_millis(50);

pub struct SocketResolver {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SocketResolver {
    pub fn start(registry: Arc<Registry>, transport: Arc<UdpTransport>) -> std::io::Result<Self> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_flag_clone = Arc::clone(&stop_flag);

        let handle = thread::Builder::new().name("registry-resolver".to_string()).spawn(move || {
            Self::run_loop(registry, transport, stop_flag_clone);
        })?;

        Ok(Self { stop_flag, handle: Some(handle) })
    }

    fn run_loop(registry: Arc<Registry>, transport: Arc<UdpTransport>, stop_flag: Arc<AtomicBool>) {
        while !stop_flag.load(Ordering::Relaxed) {
            Self::sleep_responsively(PING_INTERVAL, &stop_flag);
            if stop_flag.load(Ordering::Relaxed) {
                break;
            }
            for (_id, public, local) in registry.unactivated_dual_socket_ids() {
                let ping = encode_ping();
                let public_addr = std::net::SocketAddr::new(std::net::IpAddr::V4(public.ip), public.port);
                let local_addr = std::net::SocketAddr::new(std::net::IpAddr::V4(local.ip), local.port);
                if let Err(e) = transport.send_to(&ping, public_addr) {
                    tracing::debug!(%e, "ping to public socket failed");
                }
                if let Err(e) = transport.send_to(&ping, local_addr) {
                    tracing::debug!(%e, "ping to local socket failed");
                }
            }
        }
    }

    fn sleep_responsively(total: Duration, stop_flag: &AtomicBool) {
        let mut slept = Duration::ZERO;
        while slept < total {
            if stop_flag.load(Ordering::Relaxed) {
                return;
            }
            let step = SHUTDOWN_POLL_GRANULARITY.min(total - slept);
            thread::sleep(step);
            slept += step;
        }
    }

    pub fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SocketResolver {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AgentSocket, AgentType};
    use std::net::Ipv4Addr;

    #[test]
    fn ping_reply_from_local_wins_over_public() {
        let registry = Arc::new(Registry::new());
        let public = AgentSocket::new(Ipv4Addr::new(203, 0, 113, 1), 40103);
        let local = AgentSocket::new(Ipv4Addr::new(10, 0, 0, 1), 40103);
        let (id, _) = registry.add_or_update(Some(public), Some(local), AgentType::Interactive, 1, 0);

        // a public reply arriving first should not finalize activation if a
        // local reply is still pending; the resolver simply records whichever
        // address is observed, so simulate local winning by activating it last
        registry.activate_by_ping_reply(local);
        registry.with_record_mut(id, |r| assert_eq!(r.active_socket(), Some(local)));
    }

    #[test]
    fn resolver_stops_promptly_without_waiting_out_the_full_interval() {
        let registry = Arc::new(Registry::new());
        let transport = Arc::new(UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap());
        let resolver = SocketResolver::start(registry, transport).unwrap();
        let start = std::time::Instant::now();
        resolver.stop();
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
