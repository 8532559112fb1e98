//! Error taxonomy.
//!
//! Only conditions that leave the caller without a protocol-native completion
//! are errors here. Device-side failures, timeouts included, come back as a
//! [`ProtocolCompletion`](crate::ProtocolCompletion) in the caller's protocol.

use thiserror::Error;

use crate::context::Protocol;
use crate::io::BusType;
use crate::profile::ProtocolFamily;
use crate::transport::{Dialect, WireProtocol};

/// Failure of the external device provider.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("no device matches {0}")]
    NotFound(String),

    #[error("failed to open {id}: {reason}")]
    Open { id: String, reason: String },

    #[error("unknown device handle {0}")]
    UnknownHandle(u64),

    #[error("device metadata unavailable: {0}")]
    Metadata(String),
}

/// The device cannot be used at all.
#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("bus metadata query failed: {0}")]
    Metadata(#[source] IoError),

    #[error("no transport dialect for {family:?} device on {bus:?} bus")]
    NoDialect { family: ProtocolFamily, bus: BusType },
}

/// A command has no allow-listed mapping onto a transport's wire protocol.
///
/// This is a permanent property of the (command, transport) pair: the
/// dispatcher moves on to the next transport and does not remember it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{protocol:?} opcode {opcode:#04x} cannot be carried as {wire:?}: {reason}")]
pub struct UnsupportedTranslation {
    pub protocol: Protocol,
    pub opcode: u8,
    pub wire: WireProtocol,
    pub reason: &'static str,
}

/// Terminal results of [`DeviceSession`](crate::DeviceSession) operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no viable transport for {protocol:?} command; tried {attempted:?}")]
    NoViableTransport {
        protocol: Protocol,
        attempted: Vec<Dialect>,
    },

    #[error(transparent)]
    Classification(#[from] ClassificationError),

    #[error(transparent)]
    Io(#[from] IoError),
}

/// A transport cannot take the request buffer as laid out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("transfer of {len} bytes exceeds transport limit of {max}")]
    TooLarge { len: usize, max: usize },

    #[error("caller buffer holds {have} bytes, transfer needs {need}")]
    Short { have: usize, need: usize },

    #[error("failed to allocate {len} byte staging buffer")]
    Alloc { len: usize },
}

#[derive(Debug, Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(#[from] pub Box<figment::Error>);

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self(Box::new(err))
    }
}
