//! Sense data, SPC-4 4.5.
//!
//! Completions built by this crate use the fixed format (response code 70h),
//! except 48-bit ATA return registers, which only fit the descriptor format
//! (72h). Sense coming back from a device may be either.

use crate::ata::AtaRegisters;

/// Sense keys, SPC-4 table 27.
pub mod key {
    pub const NO_SENSE: u8 = 0x0;
    pub const RECOVERED_ERROR: u8 = 0x1;
    pub const NOT_READY: u8 = 0x2;
    pub const MEDIUM_ERROR: u8 = 0x3;
    pub const HARDWARE_ERROR: u8 = 0x4;
    pub const ILLEGAL_REQUEST: u8 = 0x5;
    pub const UNIT_ATTENTION: u8 = 0x6;
    pub const DATA_PROTECT: u8 = 0x7;
    pub const ABORTED_COMMAND: u8 = 0xB;
}

/// Additional sense codes used by the status tables.
pub mod asc {
    pub const NO_ADDITIONAL: u8 = 0x00;
    pub const WRITE_FAULT: u8 = 0x03;
    pub const NOT_READY: u8 = 0x04;
    pub const WRITE_ERROR: u8 = 0x0C;
    pub const UNRECOVERED_READ: u8 = 0x11;
    pub const RECOVERED_DATA: u8 = 0x17;
    pub const INVALID_OPCODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const INVALID_FIELD_IN_PARAMETERS: u8 = 0x26;
    pub const WRITE_PROTECTED: u8 = 0x27;
    pub const POWER_ON_RESET: u8 = 0x29;
    pub const LOGICAL_UNIT_FAILURE: u8 = 0x3E;
    pub const INTERNAL_TARGET_FAILURE: u8 = 0x44;
}

/// ASC/ASCQ 00h/1Dh, "ATA PASS-THROUGH INFORMATION AVAILABLE" (SAT-2).
pub const ATA_PASSTHROUGH_INFO: (u8, u8) = (0x00, 0x1D);

/// ASCQ paired with [`asc::LOGICAL_UNIT_FAILURE`] for "TIMEOUT ON LOGICAL UNIT".
pub const ASCQ_TIMEOUT_ON_LOGICAL_UNIT: u8 = 0x02;

/// Length of the fixed format sense this crate produces.
pub const FIXED_SENSE_LEN: usize = 18;

/// ATA Status Return sense data descriptor (SAT-2 12.2.2.6).
const ATA_RETURN_DESCRIPTOR: u8 = 0x09;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
    /// INFORMATION field; `Some` sets the VALID bit.
    pub information: Option<[u8; 4]>,
    pub command_specific: [u8; 4],
}

impl SenseData {
    pub fn new(key: u8, asc: u8, ascq: u8) -> Self {
        Self {
            key,
            asc,
            ascq,
            information: None,
            command_specific: [0; 4],
        }
    }

    /// Sense for an ATA command that went through a translation layer, with
    /// the return registers packed the way SAT-2 does for fixed format:
    /// ERROR, STATUS, DEVICE, COUNT (7:0) in the information field; flags
    /// and LBA (23:0) in the command specific information field.
    pub fn with_ata_registers(key: u8, regs: &AtaRegisters, extended: bool) -> Self {
        let (asc, ascq) = ATA_PASSTHROUGH_INFO;
        let lba = regs.lba.to_le_bytes();
        let mut flags = 0u8;
        if extended {
            flags |= 0x80;
        }
        if regs.count > 0xFF {
            flags |= 0x40;
        }
        if regs.lba > 0x00FF_FFFF {
            flags |= 0x20;
        }
        Self {
            key,
            asc,
            ascq,
            information: Some([regs.error, regs.status, regs.device, regs.count as u8]),
            command_specific: [flags, lba[0], lba[1], lba[2]],
        }
    }

    /// Descriptor format sense holding one ATA Status Return descriptor,
    /// which has room for all 48 LBA bits and both COUNT bytes.
    pub fn ata_return_sense(key: u8, regs: &AtaRegisters, extended: bool) -> Vec<u8> {
        let (asc, ascq) = ATA_PASSTHROUGH_INFO;
        let lba = regs.lba.to_le_bytes();
        let count = regs.count.to_be_bytes();
        let mut out = vec![0x72, key & 0x0F, asc, ascq, 0, 0, 0, 14];
        out.extend_from_slice(&[
            ATA_RETURN_DESCRIPTOR,
            0x0C,
            u8::from(extended),
            regs.error,
            count[0],
            count[1],
            lba[3],
            lba[0],
            lba[4],
            lba[1],
            lba[5],
            lba[2],
            regs.device,
            regs.status,
        ]);
        out
    }

    pub fn to_fixed(&self) -> [u8; FIXED_SENSE_LEN] {
        let mut out = [0u8; FIXED_SENSE_LEN];
        out[0] = 0x70;
        out[2] = self.key & 0x0F;
        if let Some(info) = self.information {
            out[0] |= 0x80;
            out[3..7].copy_from_slice(&info);
        }
        out[7] = (FIXED_SENSE_LEN - 8) as u8;
        out[8..12].copy_from_slice(&self.command_specific);
        out[12] = self.asc;
        out[13] = self.ascq;
        out
    }

    /// Parses fixed (70h/71h) or descriptor (72h/73h) format sense.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let code = buf.first()? & 0x7F;
        match code {
            0x70 | 0x71 => {
                if buf.len() < 14 {
                    return None;
                }
                let valid = buf[0] & 0x80 != 0;
                Some(Self {
                    key: buf[2] & 0x0F,
                    asc: buf[12],
                    ascq: buf[13],
                    information: valid.then(|| [buf[3], buf[4], buf[5], buf[6]]),
                    command_specific: [buf[8], buf[9], buf[10], buf[11]],
                })
            }
            0x72 | 0x73 => {
                if buf.len() < 4 {
                    return None;
                }
                Some(Self::new(buf[1] & 0x0F, buf[2], buf[3]))
            }
            _ => None,
        }
    }

    /// ATA return registers carried in sense, from either the descriptor
    /// format ATA Status Return descriptor or the fixed format layout built by
    /// [`SenseData::with_ata_registers`].
    pub fn ata_registers(buf: &[u8]) -> Option<AtaRegisters> {
        let code = buf.first()? & 0x7F;
        match code {
            0x72 | 0x73 => {
                let additional = usize::from(*buf.get(7)?);
                let end = (8 + additional).min(buf.len());
                let mut at = 8;
                while at + 2 <= end {
                    let len = usize::from(buf[at + 1]) + 2;
                    if buf[at] == ATA_RETURN_DESCRIPTOR && at + 14 <= end {
                        let d = &buf[at..at + 14];
                        let extended = d[2] & 1 != 0;
                        let mut lba = u64::from(d[7]) | (u64::from(d[9]) << 8) | (u64::from(d[11]) << 16);
                        let mut count = u16::from(d[5]);
                        if extended {
                            lba |= (u64::from(d[6]) << 24) | (u64::from(d[8]) << 32) | (u64::from(d[10]) << 40);
                            count |= u16::from(d[4]) << 8;
                        }
                        return Some(AtaRegisters {
                            error: d[3],
                            status: d[13],
                            count,
                            lba,
                            device: d[12],
                        });
                    }
                    at += len;
                }
                None
            }
            0x70 | 0x71 => {
                let sense = Self::parse(buf)?;
                if (sense.asc, sense.ascq) != ATA_PASSTHROUGH_INFO {
                    return None;
                }
                let info = sense.information?;
                let cs = sense.command_specific;
                Some(AtaRegisters {
                    error: info[0],
                    status: info[1],
                    count: u16::from(info[3]),
                    lba: u64::from(cs[1]) | (u64::from(cs[2]) << 8) | (u64::from(cs[3]) << 16),
                    device: info[2],
                })
            }
            _ => None,
        }
    }
}
