//! Representations for responses to SCSI commands.

use color_eyre::eyre::ensure;

/// Peripheral device type of a CD/DVD device (SPC-2 table 48).
pub const DEVICE_TYPE_CDROM: u8 = 0x05;

/// Standard INQUIRY data, SPC-2 7.3.2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inquiry {
    /// PERIPHERAL QUALIFIER (bits 7:5). Zero means "the specified device type
    /// is currently connected"; anything else is treated as no device.
    pub peripheral_qualifier: u8,
    /// PERIPHERAL DEVICE TYPE (bits 4:0), see SPC-2 table 48.
    pub device_type: u8,
    pub vendor: String,
    pub product: String,
}

impl Inquiry {
    pub fn is_connected(&self) -> bool {
        self.peripheral_qualifier == 0
    }
}

pub fn inquiry_response(buf: &[u8]) -> color_eyre::Result<Inquiry> {
    ensure!(
        buf.len() >= 36,
        "standard INQUIRY data is at least 36 bytes, got {}",
        buf.len()
    );
    Ok(Inquiry {
        peripheral_qualifier: buf[0] >> 5,
        device_type: buf[0] & 0x1F,
        vendor: ascii_field(&buf[8..16]),
        product: ascii_field(&buf[16..32]),
    })
}

/// READ CAPACITY (10) parameter data, SBC-2 table 30.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCapacity10 {
    pub last_lba: u32,
    pub block_length: u32,
}

pub fn read_capacity_10_response(buf: &[u8]) -> color_eyre::Result<ReadCapacity10> {
    ensure!(
        buf.len() >= 8,
        "READ CAPACITY (10) data is 8 bytes, got {}",
        buf.len()
    );
    let capacity = ReadCapacity10 {
        last_lba: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
        block_length: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
    };
    ensure!(
        capacity.block_length.is_power_of_two() && capacity.block_length >= 512,
        "implausible block length {}",
        capacity.block_length
    );
    Ok(capacity)
}

/// READ CAPACITY (16) parameter data, SBC-3 table 66. Only the fields the
/// probe uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCapacity16 {
    pub last_lba: u64,
    pub block_length: u32,
}

pub fn read_capacity_16_response(buf: &[u8]) -> color_eyre::Result<ReadCapacity16> {
    ensure!(
        buf.len() >= 12,
        "READ CAPACITY (16) data needs 12 bytes, got {}",
        buf.len()
    );
    let capacity = ReadCapacity16 {
        last_lba: u64::from_be_bytes([buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7]]),
        block_length: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
    };
    ensure!(
        capacity.block_length.is_power_of_two() && capacity.block_length >= 512,
        "implausible block length {}",
        capacity.block_length
    );
    Ok(capacity)
}

/// Whether a one-command REPORT SUPPORTED OPERATION CODES response says the
/// command is supported (SUPPORT field 011b or 101b, SPC-4 table 325).
pub fn supported_opcode_response(buf: &[u8]) -> color_eyre::Result<bool> {
    ensure!(buf.len() >= 2, "one-command parameter data is at least 2 bytes");
    Ok(matches!(buf[1] & 0x07, 0b011 | 0b101))
}

fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}
