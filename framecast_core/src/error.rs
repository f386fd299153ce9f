//! Error types for the frame engine.
//!
//! Only configuration problems (and the transport failures that happen while
//! opening endpoints at session start) ever reach a caller. Everything that
//! goes wrong inside a running tick is recovered where it is detected and
//! logged.

use crate::episode::SessionId;
use framecast_env::EnvError;
use thiserror::Error;

/// Invalid or unusable configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid {name} port: {port}")]
    InvalidPort { name: &'static str, port: u16 },

    #[error("{first} and {second} ports both use {port}")]
    PortConflict {
        first: &'static str,
        second: &'static str,
        port: u16,
    },

    #[error("malformed primary address: {0:?}")]
    MalformedPrimaryAddress(String),

    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("failed to read config: {0}")]
    Io(String),
}

/// Errors surfaced by the engine's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("session {0} is already active")]
    AlreadyActive(SessionId),

    #[error("no active session")]
    NoSession,

    #[error("transport error: {0}")]
    Transport(#[from] EnvError),

    #[error("rpc server error: {0}")]
    Rpc(String),
}

/// Frame delta stream errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad frame delta magic {0:?}")]
    BadMagic([u8; 4]),

    #[error("unsupported frame delta version {0}")]
    UnsupportedVersion(u16),

    #[error("frame delta body of {0} bytes exceeds limit")]
    TooLarge(usize),

    #[error("malformed frame delta: {0}")]
    Malformed(String),
}
