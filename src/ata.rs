//! ATA task-file commands and return registers, as described in ATA/ATAPI
//! Command Set - 3 (ACS-3).
//!
//! Only the subset this crate needs to translate or probe with is modeled.

use color_eyre::eyre::ensure;

/// ACS-3 command codes.
pub mod opcode {
    pub const DATA_SET_MANAGEMENT: u8 = 0x06;
    pub const READ_SECTORS: u8 = 0x20;
    pub const READ_SECTORS_EXT: u8 = 0x24;
    pub const READ_DMA_EXT: u8 = 0x25;
    pub const READ_LOG_EXT: u8 = 0x2F;
    pub const WRITE_SECTORS: u8 = 0x30;
    pub const WRITE_SECTORS_EXT: u8 = 0x34;
    pub const WRITE_DMA_EXT: u8 = 0x35;
    pub const DOWNLOAD_MICROCODE: u8 = 0x92;
    pub const PACKET: u8 = 0xA0;
    pub const IDENTIFY_PACKET_DEVICE: u8 = 0xA1;
    pub const SMART: u8 = 0xB0;
    pub const READ_DMA: u8 = 0xC8;
    pub const WRITE_DMA: u8 = 0xCA;
    pub const CHECK_POWER_MODE: u8 = 0xE5;
    pub const FLUSH_CACHE: u8 = 0xE7;
    pub const IDENTIFY_DEVICE: u8 = 0xEC;
    pub const FLUSH_CACHE_EXT: u8 = 0xEA;
}

/// SMART feature register values.
pub mod smart {
    pub const READ_DATA: u16 = 0xD0;
    pub const READ_THRESHOLDS: u16 = 0xD1;
    pub const ENABLE_OPERATIONS: u16 = 0xD8;
    pub const DISABLE_OPERATIONS: u16 = 0xD9;
    pub const READ_LOG: u16 = 0xD5;
    pub const RETURN_STATUS: u16 = 0xDA;
    /// LBA mid/high signature every SMART command carries.
    pub const SIGNATURE_LBA: u64 = 0x00C2_4F00;
    /// LBA mid/high returned by RETURN STATUS when a threshold is exceeded.
    pub const THRESHOLD_EXCEEDED_LBA: u64 = 0x002C_F400;
}

/// Status register bits.
pub mod status {
    pub const BSY: u8 = 0x80;
    pub const DRDY: u8 = 0x40;
    pub const DF: u8 = 0x20;
    pub const DSC: u8 = 0x10;
    pub const DRQ: u8 = 0x08;
    pub const CORR: u8 = 0x04;
    pub const ERR: u8 = 0x01;
}

/// Error register bits.
pub mod error {
    pub const ICRC: u8 = 0x80;
    pub const UNC: u8 = 0x40;
    pub const MC: u8 = 0x20;
    pub const IDNF: u8 = 0x10;
    pub const MCR: u8 = 0x08;
    pub const ABRT: u8 = 0x04;
    pub const NM: u8 = 0x02;
}

/// Device register value selecting LBA addressing.
pub const DEVICE_LBA: u8 = 0x40;

/// Registers written to issue a command.
///
/// Fields are wide enough for 48-bit commands; 28-bit commands only use the
/// low byte of `feature` and `count` and the low 28 bits of `lba`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskFile {
    pub feature: u16,
    pub count: u16,
    pub lba: u64,
    pub device: u8,
    pub command: u8,
    /// 48-bit (EXT) register layout.
    pub extended: bool,
}

impl TaskFile {
    pub fn new(command: u8) -> Self {
        Self {
            feature: 0,
            count: 0,
            lba: 0,
            device: DEVICE_LBA,
            command,
            extended: false,
        }
    }

    pub fn with_feature(mut self, feature: u16) -> Self {
        self.feature = feature;
        self
    }

    pub fn with_count(mut self, count: u16) -> Self {
        self.count = count;
        self
    }

    pub fn with_lba(mut self, lba: u64) -> Self {
        self.lba = lba & 0xFFFF_FFFF_FFFF;
        self
    }

    pub fn extended(mut self) -> Self {
        self.extended = true;
        self
    }

    pub fn identify_device() -> Self {
        Self::new(opcode::IDENTIFY_DEVICE).with_count(1)
    }

    pub fn identify_packet_device() -> Self {
        Self::new(opcode::IDENTIFY_PACKET_DEVICE).with_count(1)
    }

    pub fn smart(feature: u16) -> Self {
        Self::new(opcode::SMART)
            .with_feature(feature)
            .with_lba(smart::SIGNATURE_LBA)
    }

    pub fn read_dma_ext(lba: u64, count: u16) -> Self {
        Self::new(opcode::READ_DMA_EXT)
            .with_lba(lba)
            .with_count(count)
            .extended()
    }

    pub fn write_dma_ext(lba: u64, count: u16) -> Self {
        Self::new(opcode::WRITE_DMA_EXT)
            .with_lba(lba)
            .with_count(count)
            .extended()
    }

    pub fn read_sectors(lba: u32, count: u8) -> Self {
        Self::new(opcode::READ_SECTORS)
            .with_lba(u64::from(lba & 0x0FFF_FFFF))
            .with_count(u16::from(count))
    }

    pub fn read_log_ext(log: u8, page: u16, count: u16) -> Self {
        Self::new(opcode::READ_LOG_EXT)
            .with_lba(u64::from(log) | (u64::from(page & 0xFF) << 8) | (u64::from(page >> 8) << 40))
            .with_count(count)
            .extended()
    }

    pub fn flush_cache_ext() -> Self {
        Self::new(opcode::FLUSH_CACHE_EXT).extended()
    }

    pub fn check_power_mode() -> Self {
        Self::new(opcode::CHECK_POWER_MODE)
    }

    /// Number of 512-byte sectors the count field stands for.
    ///
    /// A zero count means 256 sectors for 28-bit commands and 65536 for
    /// 48-bit ones.
    pub fn sectors(&self) -> u32 {
        match (self.extended, self.count) {
            (false, _) if self.count & 0xFF == 0 => 256,
            (false, count) => u32::from(count & 0xFF),
            (true, 0) => 65536,
            (true, count) => u32::from(count),
        }
    }

    /// Register image handed to an ATA pass-through dialect.
    ///
    /// Layout: feature, count (LE u16 each), LBA (6 bytes LE), device,
    /// command, flags (bit 0: 48-bit), 3 reserved.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0; 16];
        out[0..2].copy_from_slice(&self.feature.to_le_bytes());
        out[2..4].copy_from_slice(&self.count.to_le_bytes());
        out[4..10].copy_from_slice(&self.lba.to_le_bytes()[..6]);
        out[10] = self.device;
        out[11] = self.command;
        out[12] = u8::from(self.extended);
        out
    }
}

/// Registers read back after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtaRegisters {
    pub error: u8,
    pub status: u8,
    pub count: u16,
    pub lba: u64,
    pub device: u8,
}

impl AtaRegisters {
    pub fn new(status: u8, error: u8) -> Self {
        Self {
            error,
            status,
            count: 0,
            lba: 0,
            device: 0,
        }
    }

    /// Ready and seek-complete, what a healthy device shows after a good command.
    pub fn ready() -> Self {
        Self::new(status::DRDY | status::DSC, 0)
    }

    pub fn is_error(&self) -> bool {
        self.status & (status::ERR | status::DF) != 0
    }

    /// An aborted command carrying the packet device signature (LBA mid 14h,
    /// high EBh) came from an ATAPI device.
    pub fn has_packet_signature(&self) -> bool {
        (self.lba >> 8) & 0xFFFF == 0xEB14
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtaCompletion {
    pub registers: AtaRegisters,
    pub transferred: usize,
}

impl AtaCompletion {
    pub fn is_success(&self) -> bool {
        !self.registers.is_error()
    }
}

/// A validated IDENTIFY DEVICE response.
pub struct IdentifyData<'a>(&'a [u8]);

impl<'a> IdentifyData<'a> {
    pub const SIZE: usize = 512;

    pub fn parse(buf: &'a [u8]) -> color_eyre::Result<Self> {
        ensure!(
            buf.len() == Self::SIZE,
            "IDENTIFY data must be {} bytes, was {}",
            Self::SIZE,
            buf.len()
        );
        let identify = Self(buf);
        ensure!(
            identify.word(0) & 0x8000 == 0,
            "general configuration word marks a non-ATA device"
        );
        // Word 255: signature A5h in the low byte means the high byte is a checksum.
        if buf[510] == 0xA5 {
            let sum = buf.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
            ensure!(sum == 0, "IDENTIFY integrity word checksum mismatch");
        }
        Ok(identify)
    }

    pub fn word(&self, index: usize) -> u16 {
        u16::from_le_bytes([self.0[index * 2], self.0[index * 2 + 1]])
    }

    /// Logical sector size in bytes (words 106 and 117-118).
    pub fn logical_sector_size(&self) -> u32 {
        let w106 = self.word(106);
        let valid = w106 & 0xC000 == 0x4000;
        if valid && w106 & 0x1000 != 0 {
            let words = u32::from(self.word(117)) | (u32::from(self.word(118)) << 16);
            if words >= 256 {
                return words * 2;
            }
        }
        512
    }

    pub fn supports_lba48(&self) -> bool {
        self.word(83) & 0x0400 != 0
    }

    /// DOWNLOAD MICROCODE supported and enabled (words 83 and 86, bit 0).
    pub fn supports_download_microcode(&self) -> bool {
        self.word(83) & 0x0001 != 0 && self.word(86) & 0x0001 != 0
    }

    /// Model number (words 27-46), byte-swapped per the ATA string convention.
    pub fn model(&self) -> String {
        let mut bytes = Vec::with_capacity(40);
        for pair in self.0[54..94].chunks_exact(2) {
            bytes.push(pair[1]);
            bytes.push(pair[0]);
        }
        String::from_utf8_lossy(&bytes).trim().to_string()
    }
}
