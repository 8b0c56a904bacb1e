// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Domain registry: a connectionless UDP rendezvous service for agent
//! check-in and peer discovery.

pub mod agent;
pub mod client;
pub mod codec;
pub mod config;
pub mod reaper;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod transport;

pub use agent::{AgentRecord, LinkedDataFactory};
pub use client::{ClientError, RegistryClient};
pub use codec::{AgentId, AgentSocket, AgentType, CheckIn, ListReply, PacketHeader, PeerEntry};
pub use config::{ClientConfig, ServerConfig};
pub use registry::Registry;
pub use server::{RegistryServer, ServerError};
