//! Cross-protocol command dispatch for storage devices.
//!
//! A caller issues ATA, SCSI or NVMe commands through a [`DeviceSession`]. The
//! session knows, from a one-time probe, which OS-level transport dialects can
//! actually reach the device, translates each command into whatever the chosen
//! dialect speaks, and maps the raw completion back into the caller's own
//! protocol. When a dialect fails in a way that says "this path doesn't work
//! here" rather than "the device rejected the command", the next dialect is
//! tried and the failing one is remembered.
//!
//! The raw OS binding is a [`io::DeviceIo`] implementation supplied by the
//! caller. A USB mass-storage binding is available with the `usb` feature.

pub mod ata;
pub mod buffer;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod io;
pub mod nvme;
pub mod probe;
pub mod profile;
pub mod scsi;
pub mod translate;
pub mod transport;
pub mod usb;

#[cfg(test)]
pub(crate) mod mock;

pub use config::Config;
pub use context::{CommandContext, DataBuffer, DataDirection, Protocol, ProtocolCompletion};
pub use dispatch::DeviceSession;
pub use error::{ClassificationError, DispatchError, IoError};
pub use profile::{DeviceFeatures, DeviceProfile, ProtocolFamily};
pub use translate::TranslationTable;
pub use transport::Dialect;
