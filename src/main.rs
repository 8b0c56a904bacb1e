// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Domain Registry Server
//!
//! Connectionless UDP rendezvous service for agent check-in and peer
//! discovery.
//!
//! # Usage
//!
//! ```bash
//! # Local development, no same-host address rewrite
//! domain-registry-server --local
//!
//! # Production, with the public IP same-host senders should be rewritten to
//! domain-registry-server --public-ip 203.0.113.4
//! ```

use clap::Parser;
use domain_registry::{RegistryServer, ServerConfig};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Domain Registry Server - UDP rendezvous for agent discovery
#[derive(Parser, Debug)]
#[command(name = "domain-registry-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// UDP port to listen on
    #[arg(short, long, default_value = "40102")]
    port: u16,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Skip the same-host source-address rewrite
    #[arg(long, default_value = "false")]
    local: bool,

    /// Public IPv4 substituted for same-host senders (required unless --local)
    #[arg(long)]
    public_ip: Option<IpAddr>,

    /// Silence threshold in seconds before a non-exempt agent is reaped
    #[arg(long, default_value = "2")]
    silence_threshold_secs: u64,

    /// Maximum number of agents the registry will track
    #[arg(long)]
    max_agents: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).with_target(true).with_thread_ids(true).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = if let Some(config_path) = args.config {
        info!("Loading config from {:?}", config_path);
        ServerConfig::from_file(&config_path)?
    } else {
        let mut config = ServerConfig {
            bind_address: args.bind.parse()?,
            port: args.port,
            local_mode: args.local,
            public_ip: args.public_ip,
            silence_threshold_secs: args.silence_threshold_secs,
            ..Default::default()
        };
        if let Some(max_agents) = args.max_agents {
            config.max_agents = max_agents;
        }
        config
    };
    config.validate()?;

    info!("+----------------------------------------------------+");
    info!("|              Domain Registry Server                |");
    info!("+----------------------------------------------------+");
    info!("|  Bind:    {:39} |", format!("{}:{}", config.bind_address, config.port));
    info!("|  Mode:    {:39} |", if config.local_mode { "local" } else { "production" });
    info!(
        "|  Silence: {:39} |",
        format!("{}s", config.silence_threshold_secs)
    );
    info!("+----------------------------------------------------+");

    let server = RegistryServer::new(config)?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_handler = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        info!("Shutdown signal received, stopping registry...");
        stop_for_handler.store(true, Ordering::Relaxed);
    })?;

    server.run(&stop)?;

    info!("Domain registry stopped");
    Ok(())
}
