//! Representations for SCSI commands.
//!
//! This module uses the term "command descriptor" to describe a struct and implementation specific
//! details behind a CDB, and uses the term "command block" to describe a "black box" containing
//! a valid CDB.
//!
//! Commands are exposed as a function that returns a [`CommandBlock`]. These functions wrap
//! the more granular descriptor structs in [`super::command_descriptor`].

use std::fmt;

use color_eyre::eyre::ensure;

use super::MAX_CDB_SIZE;
use super::command_descriptor::*;
use crate::ata::TaskFile;

/// A serialized command block ready to be submitted
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CommandBlock {
    command: [u8; MAX_CDB_SIZE],
    len: u8,
}

impl CommandBlock {
    /// Wraps raw CDB bytes. Returns `None` unless `bytes` is 1 to 16 bytes long.
    pub fn new(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() > MAX_CDB_SIZE {
            return None;
        }
        let mut command = [0; MAX_CDB_SIZE];
        command[..bytes.len()].copy_from_slice(bytes);
        Some(Self {
            command,
            len: bytes.len() as u8,
        })
    }

    fn from_descriptor<D: CommandDescriptor>(descriptor: &D) -> Self {
        let bytes = descriptor.as_slice();
        let mut command = [0; MAX_CDB_SIZE];
        command[..bytes.len()].copy_from_slice(bytes);
        Self {
            command,
            len: bytes.len() as u8,
        }
    }

    /// Returns the length of the underlying command block.
    ///
    /// Will always be at most 16 bytes.
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the command block zero padded to 16 bytes, as USB Mass Storage Class -
    /// Bulk Only Transport section 5.1 (CBWCB) wants it.
    pub fn get(&self) -> [u8; MAX_CDB_SIZE] {
        self.command
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.command[..self.len()]
    }

    pub fn opcode(&self) -> u8 {
        self.command[0]
    }

    /// Service action field (byte 1, bits 4:0) of service action opcodes.
    pub fn service_action(&self) -> u8 {
        self.command[1] & 0x1F
    }

    fn be_u16(&self, at: usize) -> u16 {
        u16::from_be_bytes([self.command[at], self.command[at + 1]])
    }

    fn be_u32(&self, at: usize) -> u32 {
        u32::from_be_bytes([
            self.command[at],
            self.command[at + 1],
            self.command[at + 2],
            self.command[at + 3],
        ])
    }

    fn be_u64(&self, at: usize) -> u64 {
        (u64::from(self.be_u32(at)) << 32) | u64::from(self.be_u32(at + 4))
    }
}

impl fmt::Debug for CommandBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandBlock({:02x?})", self.as_bytes())
    }
}

/// "The TEST UNIT READY command provides a means to check if the logical unit is ready.
///
/// If the logical unit is able to accept an appropriate medium access command without
/// returning CHECK CONDITION status, this command shall return a GOOD status. If the logical
/// unit is unable to become operational or is in a state such that an applicaton client action
/// (e.g START UNIT command) is required to make the unit ready, the device server shall return
/// CHECK CONDITION status with a sense key of NOT READY."
///
/// Defined in SPC2 7.25
pub fn test_unit_ready() -> CommandBlock {
    CommandBlock::from_descriptor(&X6CommandDescriptor {
        operation_code: OpCode::TestUnitReady,
        logical_block_address: [0, 0, 0],
        misc_len: 0,
        control: 0,
    })
}

/// "The REQUEST SENSE command requests that the device server transfer sense data
/// to the application client."
///
/// SPC-2 7.20
pub fn request_sense(allocation_len: u8) -> CommandBlock {
    CommandBlock::from_descriptor(&X6CommandDescriptor {
        operation_code: OpCode::RequestSense,
        logical_block_address: [0, 0, 0],
        misc_len: allocation_len,
        control: 0,
    })
}

/// "The INQUIRY command requests that information regarding parameters
/// of the target and a component logical unit be sent to the application client.
/// Options allow the client to request additional information."
///
/// Defined in SPC2 7.3.1 table 45. "The standard INQUIRY data shall contain at
/// least 36 bytes" (table 46)
pub fn inquiry(allocation_len: u8) -> CommandBlock {
    CommandBlock::from_descriptor(&X6CommandDescriptor {
        operation_code: OpCode::Inquiry,
        logical_block_address: [0, 0, 0],
        misc_len: allocation_len,
        control: 0,
    })
}

/// "The `READ CAPACITY` command provides a means for the application client
/// to request information regarding the capacity of the block device."
///
/// SBC-2 5.1.10. Returns 8 bytes.
pub fn read_capacity_10() -> CommandBlock {
    CommandBlock::from_descriptor(&X10CommandDescriptor {
        operation_code: OpCode::ReadCapacity10,
        service_action: 0,
        logical_block_address: [0; 4],
        group: 0,
        misc_len: [0; 2],
        control: 0,
    })
}

/// READ CAPACITY (16), for block lengths and capacities READ CAPACITY (10)
/// can't report.
///
/// SBC-3 5.16. Returns 32 bytes.
pub fn read_capacity_16(allocation_len: u32) -> CommandBlock {
    CommandBlock::from_descriptor(&X16CommandDescriptor {
        operation_code: OpCode::ServiceActionIn16,
        misc_info: 0x10,
        logical_block_address: [0; 8],
        param: allocation_len.to_be_bytes(),
        group: 0,
        control: 0,
    })
}

fn x10_block(operation_code: OpCode, lba: u32, blocks: u16) -> CommandBlock {
    CommandBlock::from_descriptor(&X10CommandDescriptor {
        operation_code,
        service_action: 0,
        logical_block_address: lba.to_be_bytes(),
        group: 0,
        misc_len: blocks.to_be_bytes(),
        control: 0,
    })
}

fn x16_block(operation_code: OpCode, lba: u64, blocks: u32) -> CommandBlock {
    CommandBlock::from_descriptor(&X16CommandDescriptor {
        operation_code,
        misc_info: 0,
        logical_block_address: lba.to_be_bytes(),
        param: blocks.to_be_bytes(),
        group: 0,
        control: 0,
    })
}

/// SBC-2 5.1.6
pub fn read_10(lba: u32, blocks: u16) -> CommandBlock {
    x10_block(OpCode::Read10, lba, blocks)
}

/// SBC-2 5.1.16
pub fn write_10(lba: u32, blocks: u16) -> CommandBlock {
    x10_block(OpCode::Write10, lba, blocks)
}

/// SBC-2 5.1.8
pub fn read_16(lba: u64, blocks: u32) -> CommandBlock {
    x16_block(OpCode::Read16, lba, blocks)
}

/// SBC-2 5.1.18
pub fn write_16(lba: u64, blocks: u32) -> CommandBlock {
    x16_block(OpCode::Write16, lba, blocks)
}

/// Flushes the whole medium (zero LBA and block count).
///
/// SBC-2 5.1.14
pub fn synchronize_cache_10() -> CommandBlock {
    x10_block(OpCode::SynchronizeCache10, 0, 0)
}

/// "The UNMAP command requests that the device server cause one or more LBAs to be unmapped."
///
/// SBC-3 5.25. The parameter list ([`UnmapList`]) goes in the Data-Out buffer.
pub fn unmap(parameter_list_len: u16) -> CommandBlock {
    CommandBlock::from_descriptor(&X10CommandDescriptor {
        operation_code: OpCode::Unmap,
        service_action: 0,
        logical_block_address: [0; 4],
        group: 0,
        misc_len: parameter_list_len.to_be_bytes(),
        control: 0,
    })
}

/// LOG SENSE for current cumulative values of `page`.
///
/// SPC-2 7.7
pub fn log_sense(page: u8, allocation_len: u16) -> CommandBlock {
    CommandBlock::from_descriptor(&X10CommandDescriptor {
        operation_code: OpCode::LogSense,
        service_action: 0,
        // PC = 01b (current cumulative values) in bits 7:6 of byte 2
        logical_block_address: [0x40 | (page & 0x3F), 0, 0, 0],
        group: 0,
        misc_len: allocation_len.to_be_bytes(),
        control: 0,
    })
}

/// REPORT SUPPORTED OPERATION CODES for a single opcode (reporting options 001b).
///
/// SPC-4 6.35
pub fn report_supported_operation_code(requested: u8, allocation_len: u32) -> CommandBlock {
    CommandBlock::from_descriptor(&X12CommandDescriptor {
        operation_code: OpCode::MaintenanceIn,
        service_action: 0x0C,
        misc_info: [0x01, requested, 0, 0],
        param: allocation_len.to_be_bytes(),
        group: 0,
        control: 0,
    })
}

/// Start LBA and block count of a READ/WRITE (10/16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAccess {
    pub lba: u64,
    pub blocks: u32,
    pub write: bool,
}

impl BlockAccess {
    pub fn parse(cdb: &CommandBlock) -> Option<Self> {
        let op = cdb.opcode();
        let (lba, blocks) = if op == OpCode::Read10 as u8 || op == OpCode::Write10 as u8 {
            (cdb.len() >= 10).then(|| (u64::from(cdb.be_u32(2)), u32::from(cdb.be_u16(7))))?
        } else if op == OpCode::Read16 as u8 || op == OpCode::Write16 as u8 {
            (cdb.len() >= 16).then(|| (cdb.be_u64(2), cdb.be_u32(10)))?
        } else {
            return None;
        };
        Some(Self {
            lba,
            blocks,
            write: op == OpCode::Write10 as u8 || op == OpCode::Write16 as u8,
        })
    }
}

/// `PROTOCOL` field of the ATA PASS-THROUGH commands (SAT-2 table 119).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtaProtocol {
    HardReset = 0,
    SoftReset = 1,
    NonData = 3,
    PioIn = 4,
    PioOut = 5,
    Dma = 6,
    Fpdma = 12,
}

impl AtaProtocol {
    fn from_field(field: u8) -> Option<Self> {
        Some(match field {
            0 => AtaProtocol::HardReset,
            1 => AtaProtocol::SoftReset,
            3 => AtaProtocol::NonData,
            4 => AtaProtocol::PioIn,
            5 => AtaProtocol::PioOut,
            6 => AtaProtocol::Dma,
            12 => AtaProtocol::Fpdma,
            _ => return None,
        })
    }
}

/// `CK_COND`: return the ATA registers in sense data even on success.
const CK_COND: u8 = 0x20;
/// `T_TYPE`: transfer length is in logical sectors rather than 512 bytes.
const T_TYPE_LOGICAL: u8 = 0x10;
/// `T_DIR`: transfer from the device.
const T_DIR_IN: u8 = 0x08;
/// `BYT_BLOK`: transfer length is in blocks.
const BYT_BLOK: u8 = 0x04;
/// `T_LENGTH` = 10b: transfer length is in the COUNT field.
const T_LENGTH_COUNT: u8 = 0x02;

/// An ATA command wrapped for a SCSI/ATA translation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtaPassThrough {
    pub taskfile: TaskFile,
    pub protocol: AtaProtocol,
    pub check_condition: bool,
    /// COUNT is in logical sectors (`T_TYPE`); otherwise 512-byte blocks.
    pub logical_sectors: bool,
}

impl AtaPassThrough {
    /// ATA PASS-THROUGH (16). Data transfers are counted by the COUNT
    /// register, in 512-byte blocks unless `logical_sectors` is set.
    ///
    /// A 28-bit command carries LBA (27:24) in DEVICE (3:0); the EXTEND-only
    /// bytes stay zero.
    pub fn to_command_block(&self) -> CommandBlock {
        let tf = &self.taskfile;
        let lba = tf.lba.to_le_bytes();
        let mut flags = if self.check_condition { CK_COND } else { 0 };
        let mut transfer = BYT_BLOK | T_LENGTH_COUNT;
        if self.logical_sectors {
            transfer |= T_TYPE_LOGICAL;
        }
        match self.protocol {
            AtaProtocol::PioIn | AtaProtocol::Dma | AtaProtocol::Fpdma if !self.is_write() => {
                flags |= T_DIR_IN | transfer
            }
            AtaProtocol::PioOut | AtaProtocol::Dma | AtaProtocol::Fpdma => flags |= transfer,
            _ => {}
        }
        let descriptor = if tf.extended {
            AtaPassThrough16Descriptor {
                operation_code: OpCode::AtaPassThrough16,
                protocol: ((self.protocol as u8) << 1) | 1,
                flags,
                features: tf.feature.to_be_bytes(),
                count: tf.count.to_be_bytes(),
                lba_low: [lba[3], lba[0]],
                lba_mid: [lba[4], lba[1]],
                lba_high: [lba[5], lba[2]],
                device: tf.device,
                command: tf.command,
                control: 0,
            }
        } else {
            AtaPassThrough16Descriptor {
                operation_code: OpCode::AtaPassThrough16,
                protocol: (self.protocol as u8) << 1,
                flags,
                features: [0, tf.feature as u8],
                count: [0, tf.count as u8],
                lba_low: [0, lba[0]],
                lba_mid: [0, lba[1]],
                lba_high: [0, lba[2]],
                device: (tf.device & 0xF0) | (lba[3] & 0x0F),
                command: tf.command,
                control: 0,
            }
        };
        CommandBlock::from_descriptor(&descriptor)
    }

    fn is_write(&self) -> bool {
        use crate::ata::opcode::*;
        matches!(
            self.taskfile.command,
            WRITE_DMA_EXT | WRITE_DMA | WRITE_SECTORS | WRITE_SECTORS_EXT | DOWNLOAD_MICROCODE
                | DATA_SET_MANAGEMENT
        )
    }

    /// Decodes ATA PASS-THROUGH (12) or (16). Returns `None` for other opcodes
    /// and for protocols outside the ones modeled here.
    pub fn parse(cdb: &CommandBlock) -> Option<Self> {
        let b = cdb.get();
        if cdb.opcode() == OpCode::AtaPassThrough16 as u8 && cdb.len() >= 16 {
            let protocol = AtaProtocol::from_field((b[1] >> 1) & 0x0F)?;
            let extended = b[1] & 1 != 0;
            let mut lba = u64::from(b[8]) | (u64::from(b[10]) << 8) | (u64::from(b[12]) << 16);
            let (feature, count, device) = if extended {
                lba |= (u64::from(b[7]) << 24) | (u64::from(b[9]) << 32) | (u64::from(b[11]) << 40);
                (
                    u16::from_be_bytes([b[3], b[4]]),
                    u16::from_be_bytes([b[5], b[6]]),
                    b[13],
                )
            } else {
                lba |= u64::from(b[13] & 0x0F) << 24;
                (u16::from(b[4]), u16::from(b[6]), b[13] & 0xF0)
            };
            Some(Self {
                taskfile: TaskFile {
                    feature,
                    count,
                    lba,
                    device,
                    command: b[14],
                    extended,
                },
                protocol,
                check_condition: b[2] & CK_COND != 0,
                logical_sectors: b[2] & T_TYPE_LOGICAL != 0,
            })
        } else if cdb.opcode() == OpCode::AtaPassThrough12 as u8 && cdb.len() >= 12 {
            let protocol = AtaProtocol::from_field((b[1] >> 1) & 0x0F)?;
            let lba = u64::from(b[5])
                | (u64::from(b[6]) << 8)
                | (u64::from(b[7]) << 16)
                | (u64::from(b[8] & 0x0F) << 24);
            Some(Self {
                taskfile: TaskFile {
                    feature: u16::from(b[3]),
                    count: u16::from(b[4]),
                    lba,
                    device: b[8] & 0xF0,
                    command: b[9],
                    extended: false,
                },
                protocol,
                check_condition: b[2] & CK_COND != 0,
                logical_sectors: b[2] & T_TYPE_LOGICAL != 0,
            })
        } else {
            None
        }
    }
}

/// One UNMAP block descriptor (SBC-3 table 97).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnmapDescriptor {
    pub lba: u64,
    pub blocks: u32,
}

/// UNMAP parameter list: an 8-byte header followed by 16-byte block descriptors.
///
/// Kept as a descriptor list and only serialized when it's handed to a transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnmapList {
    pub descriptors: Vec<UnmapDescriptor>,
}

impl UnmapList {
    pub const HEADER_LEN: usize = 8;
    pub const DESCRIPTOR_LEN: usize = 16;

    pub fn byte_len(&self) -> usize {
        Self::HEADER_LEN + self.descriptors.len() * Self::DESCRIPTOR_LEN
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let descriptor_bytes = self.descriptors.len() * Self::DESCRIPTOR_LEN;
        let mut out = Vec::with_capacity(self.byte_len());
        // UNMAP DATA LENGTH excludes its own two bytes.
        out.extend_from_slice(&((self.byte_len() - 2) as u16).to_be_bytes());
        out.extend_from_slice(&(descriptor_bytes as u16).to_be_bytes());
        out.extend_from_slice(&[0; 4]);
        for descriptor in &self.descriptors {
            out.extend_from_slice(&descriptor.lba.to_be_bytes());
            out.extend_from_slice(&descriptor.blocks.to_be_bytes());
            out.extend_from_slice(&[0; 4]);
        }
        out
    }

    pub fn parse(buf: &[u8]) -> color_eyre::Result<Self> {
        ensure!(buf.len() >= Self::HEADER_LEN, "UNMAP parameter list shorter than its header");
        let descriptor_bytes = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
        ensure!(
            descriptor_bytes % Self::DESCRIPTOR_LEN == 0,
            "block descriptor data length {descriptor_bytes} is not a multiple of 16"
        );
        ensure!(
            buf.len() >= Self::HEADER_LEN + descriptor_bytes,
            "UNMAP parameter list truncated"
        );
        let descriptors = buf[Self::HEADER_LEN..Self::HEADER_LEN + descriptor_bytes]
            .chunks_exact(Self::DESCRIPTOR_LEN)
            .map(|d| UnmapDescriptor {
                lba: u64::from_be_bytes([d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]]),
                blocks: u32::from_be_bytes([d[8], d[9], d[10], d[11]]),
            })
            .collect();
        Ok(Self { descriptors })
    }
}
