//! Transport dialects and the wire commands they carry.
//!
//! A dialect is one OS-level control path (ATA pass-through, SCSI
//! pass-through, a USB bulk-only pipe, ...). Each one speaks exactly one wire
//! protocol. A [`WireCommand`] is a command already expressed in that wire
//! protocol and is only serialized to bytes at the I/O boundary, through the
//! descriptor's `encode` function.

pub mod registry;

use std::fmt;

use crate::ata::TaskFile;
use crate::context::DataDirection;
use crate::nvme::NvmeCommand;
use crate::profile::{DeviceProfile, ProtocolFamily};
use crate::scsi::CommandBlock;

pub use registry::{REGISTRY, rank};

/// Command vocabulary a dialect carries on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireProtocol {
    Ata,
    Scsi,
    Nvme,
    /// Plain byte-offset reads, writes and flushes.
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    AtaPassThrough,
    ScsiPassThrough,
    NvmePassThrough,
    /// NVMe submission entries wrapped in a SCSI-shaped envelope, as some
    /// USB and RAID bridges accept them.
    NvmeTunnel,
    /// Legacy IDE diagnostic path: one sector, 28-bit PIO only.
    IdeDiagnostic,
    /// Legacy SMART diagnostic path: IDENTIFY and SMART only.
    SmartDiagnostic,
    UsbBulkOnly,
    BlockEmulation,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dialect::AtaPassThrough => "ata-passthrough",
            Dialect::ScsiPassThrough => "scsi-passthrough",
            Dialect::NvmePassThrough => "nvme-passthrough",
            Dialect::NvmeTunnel => "nvme-tunnel",
            Dialect::IdeDiagnostic => "ide-diagnostic",
            Dialect::SmartDiagnostic => "smart-diagnostic",
            Dialect::UsbBulkOnly => "usb-bulk-only",
            Dialect::BlockEmulation => "block-emulation",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    Read,
    Write,
    Flush,
}

/// A block emulation request, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub op: BlockOp,
    pub offset: u64,
    pub length: u64,
}

impl BlockRequest {
    /// Wire image: op (1 byte), 7 reserved, offset and length (LE u64).
    pub fn to_bytes(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[0] = match self.op {
            BlockOp::Read => 0,
            BlockOp::Write => 1,
            BlockOp::Flush => 2,
        };
        out[8..16].copy_from_slice(&self.offset.to_le_bytes());
        out[16..24].copy_from_slice(&self.length.to_le_bytes());
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireRequest {
    Ata(TaskFile),
    Scsi(CommandBlock),
    Nvme(NvmeCommand),
    Block(BlockRequest),
}

impl WireRequest {
    pub fn protocol(&self) -> WireProtocol {
        match self {
            WireRequest::Ata(_) => WireProtocol::Ata,
            WireRequest::Scsi(_) => WireProtocol::Scsi,
            WireRequest::Nvme(_) => WireProtocol::Nvme,
            WireRequest::Block(_) => WireProtocol::Block,
        }
    }
}

/// Where the data phase of a wire command comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    None,
    /// The caller's buffer, possibly staged.
    Caller,
    /// A parameter list built during translation (UNMAP, DSM ranges).
    Generated(Vec<u8>),
}

/// How a completion is mapped back to a SCSI caller when the wire was ATA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReverseMapping {
    /// Plain status translation.
    Status,
    /// Always return the ATA registers in sense data (CK_COND).
    ReturnRegisters,
}

/// A command expressed in a dialect's wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireCommand {
    pub request: WireRequest,
    pub direction: DataDirection,
    pub payload: Payload,
    /// Bytes moved in the data phase.
    pub transfer_len: usize,
    /// Name of the translation rule that produced this command; `None` for an
    /// identity repack.
    pub rule: Option<&'static str>,
    pub reverse: ReverseMapping,
}

impl WireCommand {
    /// A command whose data phase, if any, is the caller's buffer.
    pub fn new(request: WireRequest, direction: DataDirection, transfer_len: usize) -> Self {
        let payload = if direction == DataDirection::None {
            Payload::None
        } else {
            Payload::Caller
        };
        Self {
            request,
            direction,
            payload,
            transfer_len,
            rule: None,
            reverse: ReverseMapping::Status,
        }
    }

    /// A command sending a parameter list built during translation.
    pub fn generated(request: WireRequest, bytes: Vec<u8>) -> Self {
        Self {
            request,
            direction: DataDirection::Out,
            transfer_len: bytes.len(),
            payload: Payload::Generated(bytes),
            rule: None,
            reverse: ReverseMapping::Status,
        }
    }

    pub fn protocol(&self) -> WireProtocol {
        self.request.protocol()
    }

    pub fn is_translated(&self) -> bool {
        self.rule.is_some()
    }
}

/// Limits and the accepted command subset of one dialect.
#[derive(Clone, Copy)]
pub struct TransportFeatures {
    /// Per-request limit; `None` defers to the adapter's limit.
    pub max_transfer: Option<usize>,
    pub alignment: usize,
    pub accepts: fn(&WireCommand) -> bool,
}

impl fmt::Debug for TransportFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportFeatures")
            .field("max_transfer", &self.max_transfer)
            .field("alignment", &self.alignment)
            .finish_non_exhaustive()
    }
}

/// A static registry entry.
pub struct TransportDescriptor {
    pub family: ProtocolFamily,
    pub dialect: Dialect,
    pub wire: WireProtocol,
    /// Whether the dialect is usable for a given profile.
    pub predicate: fn(&DeviceProfile) -> bool,
    pub features: TransportFeatures,
    /// The dialect can carry a device reset.
    pub can_reset: bool,
    /// Serializes a wire command for the provider, or says why the framing
    /// can't express it.
    pub encode: fn(&WireCommand) -> Result<Vec<u8>, &'static str>,
}

impl fmt::Debug for TransportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportDescriptor")
            .field("family", &self.family)
            .field("dialect", &self.dialect)
            .field("wire", &self.wire)
            .field("features", &self.features)
            .field("can_reset", &self.can_reset)
            .finish_non_exhaustive()
    }
}

impl TransportDescriptor {
    pub fn accepts(&self, command: &WireCommand) -> bool {
        command.protocol() == self.wire && (self.features.accepts)(command)
    }
}

/// Serializes a wire command in its plain form.
pub fn encode_plain(command: &WireCommand) -> Result<Vec<u8>, &'static str> {
    Ok(plain_bytes(&command.request))
}

fn plain_bytes(request: &WireRequest) -> Vec<u8> {
    match request {
        WireRequest::Ata(tf) => tf.to_bytes().to_vec(),
        WireRequest::Scsi(cdb) => cdb.as_bytes().to_vec(),
        WireRequest::Nvme(cmd) => cmd.to_bytes().to_vec(),
        WireRequest::Block(req) => req.to_bytes().to_vec(),
    }
}

/// Signature opening an NVMe tunnel envelope.
pub const TUNNEL_SIGNATURE: [u8; 4] = *b"NVME";
pub const TUNNEL_HEADER_LEN: usize = 16;

/// Wraps a submission entry in the tunnel envelope: signature, direction
/// (0 none, 1 in, 2 out), 3 reserved, transfer length (LE u32), 4 reserved,
/// then the 64-byte entry.
pub fn encode_tunnel(command: &WireCommand) -> Result<Vec<u8>, &'static str> {
    let transfer_len = u32::try_from(command.transfer_len)
        .map_err(|_| "transfer length exceeds the tunnel's 32-bit field")?;
    let mut out = Vec::with_capacity(TUNNEL_HEADER_LEN + 64);
    out.extend_from_slice(&TUNNEL_SIGNATURE);
    out.push(match command.direction {
        DataDirection::None => 0,
        DataDirection::In => 1,
        DataDirection::Out => 2,
        DataDirection::Bidirectional => 3,
    });
    out.extend_from_slice(&[0; 3]);
    out.extend_from_slice(&transfer_len.to_le_bytes());
    out.extend_from_slice(&[0; 4]);
    out.extend_from_slice(&plain_bytes(&command.request));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvme;

    fn nvme_read() -> WireCommand {
        WireCommand {
            request: WireRequest::Nvme(NvmeCommand::read(1, 0, 8)),
            direction: DataDirection::In,
            payload: Payload::Caller,
            transfer_len: 4096,
            rule: None,
            reverse: ReverseMapping::Status,
        }
    }

    #[test]
    fn tunnel_envelope_wraps_the_submission_entry() {
        let bytes = encode_tunnel(&nvme_read()).expect("fits");
        assert_eq!(bytes.len(), TUNNEL_HEADER_LEN + 64);
        assert_eq!(&bytes[..4], b"NVME");
        assert_eq!(bytes[4], 1);
        assert_eq!(&bytes[8..12], &4096u32.to_le_bytes());
        assert_eq!(bytes[TUNNEL_HEADER_LEN], nvme::io::READ);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn tunnel_refuses_lengths_past_its_field() {
        let mut command = nvme_read();
        command.transfer_len = u32::MAX as usize + 1;
        assert!(encode_tunnel(&command).is_err());
        command.transfer_len = u32::MAX as usize;
        assert!(encode_tunnel(&command).is_ok());
    }

    #[test]
    fn block_request_image() {
        let req = BlockRequest {
            op: BlockOp::Write,
            offset: 4096,
            length: 512,
        };
        let bytes = req.to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[8..16], &4096u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &512u64.to_le_bytes());
    }

    #[test]
    fn dialect_names() {
        assert_eq!(Dialect::UsbBulkOnly.to_string(), "usb-bulk-only");
        assert_eq!(Dialect::NvmeTunnel.to_string(), "nvme-tunnel");
    }
}
