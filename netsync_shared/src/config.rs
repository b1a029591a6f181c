//! Configuration.
//!
//! Loads session configuration from JSON strings or files.
//! Every field has a serde default so partial documents are accepted.

use std::{path::Path, str::FromStr, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default router channel.
pub const DEFAULT_CHANNEL: &str = "netsync";

/// Category a peer announces in its handshake reply. The host picks the
/// player prefab from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ClientKind {
    Ar,
    Vr,
    #[default]
    Desktop,
}

impl ClientKind {
    pub fn as_u8(self) -> u8 {
        match self {
            ClientKind::Ar => 0,
            ClientKind::Vr => 1,
            ClientKind::Desktop => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ClientKind::Ar),
            1 => Some(ClientKind::Vr),
            2 => Some(ClientKind::Desktop),
            _ => None,
        }
    }
}

impl FromStr for ClientKind {
    type Err = ConfigError;

    /// Accepts `ar`, `vr` and `desktop`, in any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ar" => Ok(ClientKind::Ar),
            "vr" => Ok(ClientKind::Vr),
            "desktop" => Ok(ClientKind::Desktop),
            other => Err(ConfigError::Invalid(format!("unknown client kind `{other}`"))),
        }
    }
}

/// Setup errors. These are fatal at construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("channel `{0}` is already bound on this transport")]
    ChannelInUse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetConfig {
    /// Server listen/connect address, e.g. `127.0.0.1:40100`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// How often the transport is polled.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Broadcast cadence. Also used as the peer interpolation delay.
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default)]
    pub client_kind: ClientKind,
    /// Host spawns its own local player.
    #[serde(default)]
    pub server_is_player: bool,
    /// Peer ships its own player state in the handshake reply instead of
    /// taking the host's fresh instance.
    #[serde(default)]
    pub ignore_server_spawn_data: bool,
    #[serde(default = "default_file_chunk_size")]
    pub file_chunk_size: usize,
    #[serde(default = "default_file_send_interval_ms")]
    pub file_send_interval_ms: u64,
    /// Received files are written below this directory.
    #[serde(default = "default_file_dir")]
    pub file_dir: String,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_server_addr() -> String {
    "127.0.0.1:40100".to_string()
}

fn default_tick_hz() -> u32 {
    60
}

fn default_update_interval_ms() -> u64 {
    100
}

fn default_channel() -> String {
    DEFAULT_CHANNEL.to_string()
}

fn default_file_chunk_size() -> usize {
    16 * 1024
}

fn default_file_send_interval_ms() -> u64 {
    20
}

fn default_file_dir() -> String {
    "received".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            tick_hz: default_tick_hz(),
            update_interval_ms: default_update_interval_ms(),
            channel: default_channel(),
            client_kind: ClientKind::default(),
            server_is_player: false,
            ignore_server_spawn_data: false,
            file_chunk_size: default_file_chunk_size(),
            file_send_interval_ms: default_file_send_interval_ms(),
            file_dir: default_file_dir(),
            log_filter: default_log_filter(),
        }
    }
}

impl NetConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and validates a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg = Self::from_json_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects values the coordinators cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_hz == 0 {
            return Err(ConfigError::Invalid("tick_hz must be nonzero".into()));
        }
        if self.update_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "update_interval_ms must be nonzero".into(),
            ));
        }
        if self.file_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "file_chunk_size must be nonzero".into(),
            ));
        }
        if self.channel.is_empty() {
            return Err(ConfigError::Invalid("channel must not be empty".into()));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_hz.max(1) as f64)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn file_send_interval(&self) -> Duration {
        Duration::from_millis(self.file_send_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let cfg = NetConfig::from_json_str(r#"{ "channel": "lab", "client_kind": "Vr" }"#).unwrap();
        assert_eq!(cfg.channel, "lab");
        assert_eq!(cfg.client_kind, ClientKind::Vr);
        assert_eq!(cfg.update_interval_ms, 100);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_tick_rate_is_rejected() {
        let cfg = NetConfig {
            tick_hz: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn client_kind_byte_mapping() {
        for kind in [ClientKind::Ar, ClientKind::Vr, ClientKind::Desktop] {
            assert_eq!(ClientKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(ClientKind::from_u8(9), None);
        assert_eq!("VR".parse::<ClientKind>(), Ok(ClientKind::Vr));
        assert!("tablet".parse::<ClientKind>().is_err());
    }
}
