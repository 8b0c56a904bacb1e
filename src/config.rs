// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registry and client configuration.

use crate::codec::AgentType;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Registry server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// UDP port to listen on (default: 40102)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Skip the same-host source rewrite (`--local` on the CLI).
    #[serde(default)]
    pub local_mode: bool,

    /// Public IPv4 substituted for same-host senders when not in local mode.
    #[serde(default)]
    pub public_ip: Option<IpAddr>,

    /// Silence threshold in seconds before a non-exempt agent is reaped.
    #[serde(default = "default_silence_threshold_secs")]
    pub silence_threshold_secs: u64,

    /// How often the reaper sweeps for silent agents, in seconds.
    #[serde(default = "default_reaper_sweep_secs")]
    pub reaper_sweep_secs: u64,

    /// Maximum number of agents the registry will track.
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
}

fn default_bind_address() -> IpAddr {
    "0.0.0.0".parse().unwrap()
}

fn default_port() -> u16 {
    40102
}

fn default_silence_threshold_secs() -> u64 {
    2
}

fn default_reaper_sweep_secs() -> u64 {
    2
}

fn default_max_agents() -> usize {
    crate::registry::MAX_NUM_AGENTS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            local_mode: false,
            public_ip: None,
            silence_threshold_secs: default_silence_threshold_secs(),
            reaper_sweep_secs: default_reaper_sweep_secs(),
            max_agents: default_max_agents(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    pub fn silence_threshold(&self) -> Duration {
        Duration::from_secs(self.silence_threshold_secs)
    }

    pub fn reaper_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_sweep_secs)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue("port cannot be 0".into()));
        }
        if self.silence_threshold_secs == 0 {
            return Err(ConfigError::InvalidValue("silence_threshold_secs cannot be 0".into()));
        }
        if self.reaper_sweep_secs == 0 {
            return Err(ConfigError::InvalidValue("reaper_sweep_secs cannot be 0".into()));
        }
        if self.max_agents == 0 {
            return Err(ConfigError::InvalidValue("max_agents cannot be 0".into()));
        }
        if !self.local_mode && self.public_ip.is_none() {
            return Err(ConfigError::InvalidValue(
                "public_ip is required unless local_mode is set".into(),
            ));
        }
        Ok(())
    }
}

/// Client-side check-in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Hostname or address of the registry.
    pub registry_host: String,

    /// Registry UDP port (default: 40102)
    #[serde(default = "default_registry_port")]
    pub registry_port: u16,

    /// This agent's own type.
    pub agent_type: AgentType,

    /// Local port to bind for this agent's own socket (default: 40103)
    #[serde(default = "default_agent_port")]
    pub local_port: u16,

    /// Types this agent wants to hear about in list replies.
    #[serde(default)]
    pub interest_types: Vec<AgentType>,

    /// Check-in cadence in seconds.
    #[serde(default = "default_check_in_interval_secs")]
    pub check_in_interval_secs: u64,
}

fn default_registry_port() -> u16 {
    40102
}

fn default_agent_port() -> u16 {
    40103
}

fn default_check_in_interval_secs() -> u64 {
    1
}

impl ClientConfig {
    pub fn check_in_interval(&self) -> Duration {
        Duration::from_secs(self.check_in_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry_host.is_empty() {
            return Err(ConfigError::InvalidValue("registry_host cannot be empty".into()));
        }
        if self.registry_port == 0 {
            return Err(ConfigError::InvalidValue("registry_port cannot be 0".into()));
        }
        if self.check_in_interval_secs == 0 {
            return Err(ConfigError::InvalidValue("check_in_interval_secs cannot be 0".into()));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, Clone)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoError(s) => write!(f, "I/O error: {}", s),
            Self::ParseError(s) => write!(f, "parse error: {}", s),
            Self::SerializeError(s) => write!(f, "serialize error: {}", s),
            Self::InvalidValue(s) => write!(f, "invalid value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Serialize for AgentType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let s = match self {
            AgentType::Domain => "domain",
            AgentType::Interactive => "interactive",
            AgentType::AudioMixer => "audio-mixer",
            AgentType::AvatarMixer => "avatar-mixer",
            AgentType::VoxelServer => "voxel-server",
        };
        serializer.serialize_str(s)
    }
}

impl<'de> Deserialize<'de> for AgentType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "domain" => Ok(AgentType::Domain),
            "interactive" => Ok(AgentType::Interactive),
            "audio-mixer" => Ok(AgentType::AudioMixer),
            "avatar-mixer" => Ok(AgentType::AvatarMixer),
            "voxel-server" => Ok(AgentType::VoxelServer),
            other => Err(serde::de::Error::custom(format!("unknown agent type: {other}"))),
        }
    }
}
