// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Silence reaper: background thread that marks stale agents dead.
//!
//! Architecture mirrors a lease tracker: a thread wakes on its own cadence,
//! scans the shared registry, and flips `alive` on anything that has gone
//! quiet past the threshold. `VoxelServer` is exempt.

use crate::agent::now_micros;
use crate::registry::{Registry, SILENCE_THRESHOLD_MICROS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often the reaper wakes to check for silence, independent of the
/// threshold past which a record is actually considered dead.
const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

pub struct Reaper {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    pub fn start(registry: Arc<Registry>) -> std::io::Result<Self> {
        Self::start_with(registry, SWEEP_INTERVAL, SILENCE_THRESHOLD_MICROS)
    }

    pub fn start_with(
        registry: Arc<Registry>,
        sweep_interval: Duration,
        threshold_micros: u64,
    ) -> std::io::Result<Self> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_flag_clone = Arc::clone(&stop_flag);

        let handle = thread::Builder::new().name("registry-reaper".to_string()).spawn(move || {
            Self::run_loop(registry, stop_flag_clone, sweep_interval, threshold_micros);
        })?;

        Ok(Self { stop_flag, handle: Some(handle) })
    }

    fn run_loop(registry: Arc<Registry>, stop_flag: Arc<AtomicBool>, sweep_interval: Duration, threshold_micros: u64) {
        while !stop_flag.load(Ordering::Relaxed) {
            thread::sleep(sweep_interval);
            if stop_flag.load(Ordering::Relaxed) {
                break;
            }
            let reaped = registry.reap_silent(now_micros(), threshold_micros);
            if reaped > 0 {
                tracing::info!(reaped, "reaped silent agents");
            }
        }
    }

    pub fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
