//! The boundary to the OS binding.
//!
//! Everything below [`DeviceIo`] is somebody else's problem: opening a device,
//! pushing one serialized request through one OS control path and reporting
//! what came back. The crate never performs raw I/O itself.

use std::fmt;
use std::time::{Duration, Instant};

use crate::ata::AtaRegisters;
use crate::context::DataDirection;
use crate::error::IoError;
use crate::nvme::NvmeStatus;
use crate::transport::Dialect;

/// Opaque provider-issued reference to an open device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u64);

/// Provider-defined device address (a path, a `bus:address` pair, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bus type as reported by the OS. Often wrong behind bridges and HBAs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusType {
    Ata,
    Sata,
    Atapi,
    Scsi,
    Sas,
    Usb,
    Nvme,
    Raid,
    Unknown,
}

impl BusType {
    /// Bus types that can host more than one protocol family behind a shim.
    pub fn is_ambiguous(self) -> bool {
        matches!(
            self,
            BusType::Scsi | BusType::Sas | BusType::Usb | BusType::Raid | BusType::Unknown
        )
    }
}

/// Control paths the adapter claims to offer, and its transfer limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterCaps {
    pub ata_passthrough: bool,
    pub scsi_passthrough: bool,
    pub nvme_passthrough: bool,
    /// Raw NVMe commands wrapped in a SCSI-shaped control request.
    pub nvme_tunnel: bool,
    pub ide_diagnostic: bool,
    pub smart_diagnostic: bool,
    pub usb_bulk_only: bool,
    pub block_io: bool,
    pub reset: bool,
    pub max_transfer: usize,
    pub alignment: usize,
    /// Logical block size, when the OS already knows it.
    pub block_size: Option<u32>,
}

impl Default for AdapterCaps {
    fn default() -> Self {
        Self {
            ata_passthrough: false,
            scsi_passthrough: false,
            nvme_passthrough: false,
            nvme_tunnel: false,
            ide_diagnostic: false,
            smart_diagnostic: false,
            usb_bulk_only: false,
            block_io: true,
            reset: false,
            max_transfer: 64 * 1024,
            alignment: 1,
            block_size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusInfo {
    pub bus_type: BusType,
    pub adapter: AdapterCaps,
}

/// Data phase of one submission.
#[derive(Debug)]
pub enum IoData<'a> {
    None,
    Out(&'a [u8]),
    In(&'a mut [u8]),
    Bidirectional(&'a mut [u8]),
}

impl IoData<'_> {
    pub fn direction(&self) -> DataDirection {
        match self {
            IoData::None => DataDirection::None,
            IoData::Out(_) => DataDirection::Out,
            IoData::In(_) => DataDirection::In,
            IoData::Bidirectional(_) => DataDirection::Bidirectional,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            IoData::None => 0,
            IoData::Out(buf) => buf.len(),
            IoData::In(buf) | IoData::Bidirectional(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One request handed to the provider.
#[derive(Debug)]
pub struct SubmitRequest<'a> {
    pub dialect: Dialect,
    /// Command bytes serialized for `dialect`.
    pub command: &'a [u8],
    pub data: IoData<'a>,
    pub timeout: Duration,
}

/// What the provider could tell about the submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawStatus {
    /// The command reached the device; inspect the native status.
    Completed,
    /// The driver or bridge does not implement this request.
    NotImplemented,
    /// The response framing was not what this dialect produces.
    SignatureMismatch,
    /// The driver refused the request before it reached the device.
    Rejected,
    TimedOut,
    /// The link failed after the command may have been delivered.
    LinkError,
}

/// Device status in the wire protocol's own terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeStatus {
    Ata(AtaRegisters),
    Scsi { status: u8, sense: Vec<u8> },
    Nvme { dword0: u32, status: NvmeStatus },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCompletion {
    pub status: RawStatus,
    pub native: Option<NativeStatus>,
    pub transferred: usize,
}

impl RawCompletion {
    /// Completed with no native status information beyond "it worked".
    pub fn completed(transferred: usize) -> Self {
        Self {
            status: RawStatus::Completed,
            native: None,
            transferred,
        }
    }

    /// Completed with native status information.
    pub fn native(native: NativeStatus, transferred: usize) -> Self {
        Self {
            status: RawStatus::Completed,
            native: Some(native),
            transferred,
        }
    }

    /// Did not complete on the device.
    pub fn failed(status: RawStatus) -> Self {
        Self {
            status,
            native: None,
            transferred: 0,
        }
    }
}

/// The OS binding.
pub trait DeviceIo: Send + Sync {
    fn open(&self, id: &DeviceId) -> Result<Handle, IoError>;

    fn close(&self, handle: Handle);

    /// Bus type and adapter capabilities, consulted once per open.
    fn query_bus_info(&self, handle: Handle) -> Result<BusInfo, IoError>;

    /// Submits one request and blocks until it completes or `timeout` elapses.
    fn submit(&self, handle: Handle, request: SubmitRequest<'_>) -> RawCompletion;
}

/// Elapsed time since a submission started, used against the caller's timeout.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn elapsed_since(&self, start: Instant) -> Duration {
        self.now().saturating_duration_since(start)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
