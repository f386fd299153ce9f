//! Engine and episode configuration.
//!
//! Every field has a default, so a TOML file only needs the values it wants
//! to change:
//!
//! ```toml
//! rpc_port = 2000
//! primary_address = "10.0.0.4"   # empty => this node is the primary
//!
//! [episode]
//! synchronous_mode = true
//! fixed_delta_seconds = 0.05
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

/// Minimum RPC worker count.
pub const MIN_RPC_THREADS: usize = 4;

/// Commands drained per `run_some` call.
pub const DEFAULT_MAX_COMMANDS_PER_DRAIN: usize = 10;

/// Per-session simulation settings, mutable at runtime through commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpisodeSettings {
    /// Ticks wait for a client tick-cue when set
    pub synchronous_mode: bool,

    /// Rendering disabled (forwarded to the simulation collaborator)
    pub no_rendering_mode: bool,

    /// Fixed simulation step; `None` uses the host's frame delta
    pub fixed_delta_seconds: Option<f64>,

    pub substepping: bool,
    pub max_substep_delta_time: f64,
    pub max_substeps: u32,

    /// Distance (m) at which map tiles are streamed in
    pub tile_streaming_distance: f64,

    /// Distance (m) at which actors are kept active
    pub actor_active_distance: f64,
}

impl Default for EpisodeSettings {
    fn default() -> Self {
        Self {
            synchronous_mode: false,
            no_rendering_mode: false,
            fixed_delta_seconds: None,
            substepping: true,
            max_substep_delta_time: 0.01,
            max_substeps: 10,
            tile_streaming_distance: 3000.0,
            actor_active_distance: 2000.0,
        }
    }
}

impl EpisodeSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(dt) = self.fixed_delta_seconds {
            if !dt.is_finite() || dt <= 0.0 {
                return Err(ConfigError::InvalidSetting {
                    name: "fixed_delta_seconds",
                    reason: format!("must be a positive number, got {}", dt),
                });
            }
        }

        if self.substepping {
            if !self.max_substep_delta_time.is_finite() || self.max_substep_delta_time <= 0.0 {
                return Err(ConfigError::InvalidSetting {
                    name: "max_substep_delta_time",
                    reason: format!("must be positive, got {}", self.max_substep_delta_time),
                });
            }
            if self.max_substeps == 0 {
                return Err(ConfigError::InvalidSetting {
                    name: "max_substeps",
                    reason: "must be at least 1".to_string(),
                });
            }
        }

        for (name, value) in [
            ("tile_streaming_distance", self.tile_streaming_distance),
            ("actor_active_distance", self.actor_active_distance),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidSetting {
                    name,
                    reason: format!("must be a non-negative distance, got {}", value),
                });
            }
        }

        Ok(())
    }
}

/// Process-level configuration read at session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Port remote clients send commands to
    pub rpc_port: u16,

    /// Port world snapshots are streamed on
    pub streaming_port: u16,

    /// Port a primary listens on for secondaries
    pub secondary_port: u16,

    /// Primary host; empty means this process is the primary
    pub primary_address: String,

    /// Port of the primary's secondary endpoint
    pub primary_port: u16,

    /// RPC worker threads; `None` derives it from the hardware
    pub rpc_threads: Option<usize>,

    pub max_commands_per_drain: usize,

    /// Commands buffered between RPC workers and the tick thread
    pub command_queue_capacity: usize,

    /// Frame counter value at session start
    pub base_frame: u64,

    pub episode: EpisodeSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rpc_port: 2000,
            streaming_port: 2001,
            secondary_port: 2002,
            primary_address: String::new(),
            primary_port: 2002,
            rpc_threads: None,
            max_commands_per_drain: DEFAULT_MAX_COMMANDS_PER_DRAIN,
            command_queue_capacity: 4096,
            base_frame: 0,
            episode: EpisodeSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Loads a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// True when a primary address is configured.
    pub fn has_primary(&self) -> bool {
        !self.primary_address.trim().is_empty()
    }

    /// Checks everything that must hold before any socket is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let listening = [
            ("rpc", self.rpc_port),
            ("streaming", self.streaming_port),
            ("secondary", self.secondary_port),
        ];
        for (name, port) in listening {
            if port == 0 {
                return Err(ConfigError::InvalidPort { name, port });
            }
        }
        for (i, (first, a)) in listening.iter().enumerate() {
            for (second, b) in &listening[i + 1..] {
                if a == b {
                    return Err(ConfigError::PortConflict {
                        first,
                        second,
                        port: *a,
                    });
                }
            }
        }

        if self.has_primary() {
            validate_host(self.primary_address.trim())?;
            if self.primary_port == 0 {
                return Err(ConfigError::InvalidPort {
                    name: "primary",
                    port: 0,
                });
            }
        }

        if self.max_commands_per_drain == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "max_commands_per_drain",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.command_queue_capacity == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "command_queue_capacity",
                reason: "must be at least 1".to_string(),
            });
        }

        self.episode.validate()
    }

    /// RPC worker count actually used.
    pub fn rpc_threads(&self) -> usize {
        resolve_rpc_threads(self.rpc_threads)
    }
}

/// `max(hardware concurrency, 4)` by default; configured values are clamped
/// up to [`MIN_RPC_THREADS`].
pub fn resolve_rpc_threads(configured: Option<usize>) -> usize {
    let wanted = configured.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MIN_RPC_THREADS)
    });
    wanted.max(MIN_RPC_THREADS)
}

fn validate_host(host: &str) -> Result<(), ConfigError> {
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    let malformed = || ConfigError::MalformedPrimaryAddress(host.to_string());
    if host.len() > 253 {
        return Err(malformed());
    }
    for label in host.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(malformed());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid_primary() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.has_primary());
    }

    #[test]
    fn test_zero_port_rejected() {
        let config = EngineConfig {
            rpc_port: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidPort {
                name: "rpc",
                port: 0
            })
        );
    }

    #[test]
    fn test_port_conflict_rejected() {
        let config = EngineConfig {
            streaming_port: 2000,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PortConflict { port: 2000, .. })
        ));
    }

    #[test]
    fn test_primary_address_forms() {
        for good in ["127.0.0.1", "::1", "render-node-3.lan", "localhost"] {
            let config = EngineConfig {
                primary_address: good.to_string(),
                ..Default::default()
            };
            assert!(config.validate().is_ok(), "{} should be accepted", good);
        }

        for bad in ["http://host", "host name", "-leading.example", "a..b", "host:2000"] {
            let config = EngineConfig {
                primary_address: bad.to_string(),
                ..Default::default()
            };
            assert!(
                matches!(
                    config.validate(),
                    Err(ConfigError::MalformedPrimaryAddress(_))
                ),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_invalid_fixed_delta_rejected() {
        let mut config = EngineConfig::default();
        config.episode.fixed_delta_seconds = Some(0.0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSetting {
                name: "fixed_delta_seconds",
                ..
            })
        ));
    }

    #[test]
    fn test_toml_partial_override() {
        let config = EngineConfig::from_toml_str(
            r#"
            rpc_port = 3000
            primary_address = "10.0.0.4"

            [episode]
            synchronous_mode = true
            fixed_delta_seconds = 0.05
            "#,
        )
        .unwrap();

        assert_eq!(config.rpc_port, 3000);
        assert_eq!(config.streaming_port, 2001);
        assert!(config.has_primary());
        assert!(config.episode.synchronous_mode);
        assert_eq!(config.episode.fixed_delta_seconds, Some(0.05));
        assert_eq!(config.episode.max_substeps, 10);
    }

    #[test]
    fn test_toml_parse_error() {
        assert!(matches!(
            EngineConfig::from_toml_str("rpc_port = \"nope\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_rpc_threads_minimum() {
        assert_eq!(resolve_rpc_threads(Some(1)), MIN_RPC_THREADS);
        assert_eq!(resolve_rpc_threads(Some(12)), 12);
        assert!(resolve_rpc_threads(None) >= MIN_RPC_THREADS);
    }
}
