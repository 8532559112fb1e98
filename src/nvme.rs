//! NVMe submission entries, completion status and the Dataset Management
//! range format, per the NVM Express Base and NVM Command Set specifications.

use color_eyre::eyre::ensure;

/// Admin command set opcodes.
pub mod admin {
    pub const GET_LOG_PAGE: u8 = 0x02;
    pub const IDENTIFY: u8 = 0x06;
    pub const FIRMWARE_COMMIT: u8 = 0x10;
    pub const FIRMWARE_DOWNLOAD: u8 = 0x11;
}

/// NVM command set opcodes.
pub mod io {
    pub const FLUSH: u8 = 0x00;
    pub const WRITE: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE_ZEROES: u8 = 0x08;
    pub const DATASET_MANAGEMENT: u8 = 0x09;
}

/// Log page identifiers.
pub mod log {
    pub const SMART_HEALTH: u8 = 0x02;
    pub const FIRMWARE_SLOT: u8 = 0x03;
}

/// Dataset Management attribute: deallocate (CDW11 bit 2).
pub const DSM_DEALLOCATE: u32 = 1 << 2;

/// Namespace id addressing every namespace.
pub const NSID_ALL: u32 = 0xFFFF_FFFF;

/// Namespace SCSI commands and block size discovery address.
pub const DEFAULT_NSID: u32 = 1;

/// Size of the IDENTIFY data structures.
pub const IDENTIFY_LEN: usize = 4096;

/// Size of one Dataset Management range entry.
pub const DSM_RANGE_SIZE: usize = 16;

/// One submission queue entry, minus the fields the driver owns (command
/// id, PRP/SGL pointers, metadata pointer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvmeCommand {
    pub opcode: u8,
    /// Admin queue rather than an I/O queue.
    pub admin: bool,
    pub nsid: u32,
    /// CDW10 through CDW15.
    pub cdw: [u32; 6],
}

impl NvmeCommand {
    pub fn admin(opcode: u8) -> Self {
        Self {
            opcode,
            admin: true,
            nsid: 0,
            cdw: [0; 6],
        }
    }

    pub fn io(opcode: u8, nsid: u32) -> Self {
        Self {
            opcode,
            admin: false,
            nsid,
            cdw: [0; 6],
        }
    }

    pub fn cdw10(&self) -> u32 {
        self.cdw[0]
    }

    pub fn cdw11(&self) -> u32 {
        self.cdw[1]
    }

    pub fn cdw12(&self) -> u32 {
        self.cdw[2]
    }

    /// IDENTIFY with CNS 01h (controller data structure, 4096 bytes).
    pub fn identify_controller() -> Self {
        let mut cmd = Self::admin(admin::IDENTIFY);
        cmd.cdw[0] = 0x01;
        cmd
    }

    /// IDENTIFY with CNS 00h (namespace data structure of `nsid`).
    pub fn identify_namespace(nsid: u32) -> Self {
        let mut cmd = Self::admin(admin::IDENTIFY);
        cmd.nsid = nsid;
        cmd
    }

    /// GET LOG PAGE for `len` bytes (a multiple of 4) of log `lid`.
    pub fn get_log_page(lid: u8, len: u32) -> Self {
        let mut cmd = Self::admin(admin::GET_LOG_PAGE);
        cmd.nsid = NSID_ALL;
        let numd = (len / 4).saturating_sub(1);
        cmd.cdw[0] = u32::from(lid) | ((numd & 0xFFFF) << 16);
        cmd.cdw[1] = numd >> 16;
        cmd
    }

    /// READ of `blocks` logical blocks (one-based count).
    pub fn read(nsid: u32, slba: u64, blocks: u16) -> Self {
        Self::rw(io::READ, nsid, slba, blocks)
    }

    pub fn write(nsid: u32, slba: u64, blocks: u16) -> Self {
        Self::rw(io::WRITE, nsid, slba, blocks)
    }

    fn rw(opcode: u8, nsid: u32, slba: u64, blocks: u16) -> Self {
        let mut cmd = Self::io(opcode, nsid);
        cmd.cdw[0] = slba as u32;
        cmd.cdw[1] = (slba >> 32) as u32;
        cmd.cdw[2] = u32::from(blocks.saturating_sub(1));
        cmd
    }

    pub fn flush(nsid: u32) -> Self {
        Self::io(io::FLUSH, nsid)
    }

    /// DATASET MANAGEMENT over `ranges` entries with the given attributes.
    pub fn dataset_management(nsid: u32, ranges: u8, attributes: u32) -> Self {
        let mut cmd = Self::io(io::DATASET_MANAGEMENT, nsid);
        cmd.cdw[0] = u32::from(ranges.saturating_sub(1));
        cmd.cdw[1] = attributes;
        cmd
    }

    /// Starting LBA of a read/write (CDW10-11).
    pub fn slba(&self) -> u64 {
        u64::from(self.cdw10()) | (u64::from(self.cdw11()) << 32)
    }

    /// Block count of a read/write, converted from the zero-based NLB field.
    pub fn blocks(&self) -> u32 {
        (self.cdw12() & 0xFFFF) + 1
    }

    /// Range count of a Dataset Management command, from the zero-based NR field.
    pub fn dsm_ranges(&self) -> usize {
        (self.cdw10() & 0xFF) as usize + 1
    }

    /// 64-byte submission entry image. Command id and data pointers are left
    /// zero for the driver to fill; byte 1 bit 7 is set for admin commands so a
    /// tunnel can route the entry.
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[0] = self.opcode;
        out[1] = if self.admin { 0x80 } else { 0 };
        out[4..8].copy_from_slice(&self.nsid.to_le_bytes());
        for (i, dword) in self.cdw.iter().enumerate() {
            let at = 40 + i * 4;
            out[at..at + 4].copy_from_slice(&dword.to_le_bytes());
        }
        out
    }
}

/// LBA data size of the namespace's formatted LBA format, from an IDENTIFY
/// NAMESPACE data structure.
///
/// FLBAS (byte 26) selects the format: bits 3:0, plus bits 6:5 as the upper
/// two bits when more than 16 formats exist. LBA formats start at byte 128,
/// four bytes each, LBADS (a power of two) in the third.
pub fn namespace_block_size(buf: &[u8]) -> color_eyre::Result<u32> {
    ensure!(
        buf.len() >= 384,
        "namespace data is {} bytes, too short for the LBA format list",
        buf.len()
    );
    let formats = usize::from(buf[25]) + 1;
    let flbas = buf[26];
    let index = usize::from(flbas & 0x0F) | (usize::from((flbas >> 5) & 0x03) << 4);
    ensure!(index < formats, "FLBAS selects format {index} of {formats}");
    let lbads = buf[128 + index * 4 + 2];
    ensure!(
        (9..32).contains(&lbads),
        "implausible LBA data size 2^{lbads}"
    );
    Ok(1 << lbads)
}

/// One Dataset Management range entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DsmRange {
    pub attributes: u32,
    pub blocks: u32,
    pub slba: u64,
}

impl DsmRange {
    pub fn new(slba: u64, blocks: u32) -> Self {
        Self {
            attributes: 0,
            blocks,
            slba,
        }
    }

    /// Parses `count` entries from a Dataset Management data buffer.
    pub fn parse_list(buf: &[u8], count: usize) -> color_eyre::Result<Vec<DsmRange>> {
        ensure!(
            buf.len() >= count * DSM_RANGE_SIZE,
            "range list needs {} bytes, buffer has {}",
            count * DSM_RANGE_SIZE,
            buf.len()
        );
        let ranges = buf
            .chunks_exact(DSM_RANGE_SIZE)
            .take(count)
            .map(|entry| DsmRange {
                attributes: u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]),
                blocks: u32::from_le_bytes([entry[4], entry[5], entry[6], entry[7]]),
                slba: u64::from_le_bytes([
                    entry[8], entry[9], entry[10], entry[11], entry[12], entry[13], entry[14],
                    entry[15],
                ]),
            })
            .collect();
        Ok(ranges)
    }

    pub fn to_bytes(&self) -> [u8; DSM_RANGE_SIZE] {
        let mut out = [0u8; DSM_RANGE_SIZE];
        out[0..4].copy_from_slice(&self.attributes.to_le_bytes());
        out[4..8].copy_from_slice(&self.blocks.to_le_bytes());
        out[8..16].copy_from_slice(&self.slba.to_le_bytes());
        out
    }
}

/// Status code types.
pub mod sct {
    pub const GENERIC: u8 = 0x0;
    pub const COMMAND_SPECIFIC: u8 = 0x1;
    pub const MEDIA_ERROR: u8 = 0x2;
    pub const PATH_RELATED: u8 = 0x3;
}

/// Generic command status codes.
pub mod generic {
    pub const SUCCESS: u8 = 0x00;
    pub const INVALID_OPCODE: u8 = 0x01;
    pub const INVALID_FIELD: u8 = 0x02;
    pub const DATA_TRANSFER_ERROR: u8 = 0x04;
    pub const ABORTED_POWER_LOSS: u8 = 0x05;
    pub const INTERNAL_ERROR: u8 = 0x06;
    pub const ABORT_REQUESTED: u8 = 0x07;
    pub const ABORTED_SQ_DELETION: u8 = 0x08;
    pub const INVALID_NAMESPACE: u8 = 0x0B;
    pub const NAMESPACE_WRITE_PROTECTED: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x80;
    pub const CAPACITY_EXCEEDED: u8 = 0x81;
    pub const NAMESPACE_NOT_READY: u8 = 0x82;
}

/// Command specific status codes.
pub mod command_specific {
    pub const INVALID_FIRMWARE_SLOT: u8 = 0x06;
    pub const INVALID_FIRMWARE_IMAGE: u8 = 0x07;
    pub const ATTRIBUTE_CONFLICT: u8 = 0x80;
}

/// Media and data integrity errors.
pub mod media {
    pub const WRITE_FAULT: u8 = 0x80;
    pub const UNRECOVERED_READ: u8 = 0x81;
    pub const GUARD_CHECK: u8 = 0x82;
    pub const ACCESS_DENIED: u8 = 0x86;
}

/// Status field of a completion queue entry (DW3 bits 31:17).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvmeStatus {
    pub sct: u8,
    pub sc: u8,
    pub more: bool,
    pub dnr: bool,
}

impl NvmeStatus {
    pub const SUCCESS: NvmeStatus = NvmeStatus::new(sct::GENERIC, generic::SUCCESS);

    pub const fn new(sct: u8, sc: u8) -> Self {
        Self {
            sct,
            sc,
            more: false,
            dnr: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.sct == sct::GENERIC && self.sc == generic::SUCCESS
    }

    /// Packs into the upper half of DW3, phase tag cleared.
    pub fn to_field(&self) -> u16 {
        (u16::from(self.sc) << 1)
            | (u16::from(self.sct & 0x7) << 9)
            | (u16::from(self.more) << 14)
            | (u16::from(self.dnr) << 15)
    }

    pub fn from_field(field: u16) -> Self {
        Self {
            sc: (field >> 1) as u8,
            sct: ((field >> 9) & 0x7) as u8,
            more: field & (1 << 14) != 0,
            dnr: field & (1 << 15) != 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvmeCompletion {
    /// Command specific result; zero when it couldn't be determined.
    pub dword0: u32,
    pub status: NvmeStatus,
    pub transferred: usize,
}

impl NvmeCompletion {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
