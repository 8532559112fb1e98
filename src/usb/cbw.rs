//! Bulk-only transport framing: the command block wrapper that carries a CDB
//! to the device and the command status wrapper that comes back.
//!
//! See USB Mass Storage Class - Bulk Only Transport, sections 5.1 and 5.2.

use color_eyre::eyre::ensure;

use crate::context::DataDirection;
use crate::io::{NativeStatus, RawCompletion, RawStatus};
use crate::scsi::{self, CommandBlock};

/// Signature that identifies a packet as a CBW.
///
/// This packet contains the below magic number (little endian).
pub const CBW_SIGNATURE: u32 = 0x43425355;
/// Signature that identifies a packet as a CSW.
///
/// The packet will start with the below magic number (little endian).
pub const CSW_SIGNATURE: u32 = 0x53425355;

/// A command block wrapper is *always* 31 bytes in size.
pub const CBW_SIZE: usize = 31;
pub const CSW_SIZE: usize = 13;

/// `bmCBWFlags` bit 7. Ignored by the device when the transfer length is zero.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CbwDirection {
    /// Data-Out: from host to the device
    DataOut = 0x00,
    /// Data-In: from the device to the host
    DataIn = 0x80,
}

impl From<DataDirection> for CbwDirection {
    fn from(direction: DataDirection) -> Self {
        match direction {
            DataDirection::In => CbwDirection::DataIn,
            // Bulk-only has no bidirectional phase; callers reject it before framing.
            DataDirection::None | DataDirection::Out | DataDirection::Bidirectional => {
                CbwDirection::DataOut
            }
        }
    }
}

/// The CBW wraps a SCSI command.
///
/// The CBW is always exactly 31 bytes in size, and in little endian format.
#[repr(C, packed)]
pub struct CommandBlockWrapper {
    /// `dCBWSignature`, always [`CBW_SIGNATURE`].
    signature: [u8; 4],
    /// `dCBWTag` - "A Command Block Tag sent by the host. The device shall echo
    /// the contents of this field back to the host in the [tag] field of the associated CSW."
    ///
    /// See [`TagGenerator`] for tooling.
    pub tag: [u8; 4],
    /// `dCBWDataTransferLength` - "The number of bytes that the host expects
    /// to transfer on the Bulk-In or Bulk-Out endpoint (as indicated by the
    /// *Direction* bit) during the execution of this command."
    pub data_transfer_length: [u8; 4],
    /// `bmCBWFlags`
    pub direction: CbwDirection,
    /// `bCBWLUN`. Multiple LUNs are not supported, so this is always zero.
    pub lun: u8,
    /// `bCBWCBLength` - "The valid length of the *CBWCB* in bytes. The only
    /// legal values are 1 through 16 (01h through 10h)."
    pub command_block_length: u8,
    /// `CBWCB`, zero padded past `command_block_length`.
    pub command: [u8; scsi::MAX_CDB_SIZE],
}

impl CommandBlockWrapper {
    pub fn new(
        command: &CommandBlock,
        data_transfer_length: u32,
        direction: CbwDirection,
        tag: u32,
    ) -> Self {
        Self {
            signature: CBW_SIGNATURE.to_le_bytes(),
            tag: tag.to_le_bytes(),
            data_transfer_length: data_transfer_length.to_le_bytes(),
            direction,
            lun: 0,
            command_block_length: command.len() as u8,
            command: command.get(),
        }
    }

    /// Returns a slice containing the entirety of `self` that is exactly [`CBW_SIZE`] bytes in length
    pub fn as_slice(&'_ self) -> &[u8] {
        const {
            assert!(
                std::mem::size_of::<CommandBlockWrapper>() == CBW_SIZE,
                "CommandBlockWrapper not 31 bytes in size"
            );
        };
        // SAFETY: the const assertion above
        // guarantees that the size is as we expected,
        // and we know the lifetime of `self` is valid.
        let slice: &'_ [u8] = unsafe {
            let ptr = self as *const CommandBlockWrapper as *const u8;
            std::slice::from_raw_parts(ptr, CBW_SIZE)
        };
        slice
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CommandStatus {
    Passed = 0,
    Failed = 1,
    PhaseError = 2,
}

/// A packet containing the status/return value of a command block executed by the USB device.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug)]
pub struct CommandStatusWrapper {
    /// `dCSWSignature`, always [`CSW_SIGNATURE`].
    signature: u32,
    /// `dCSWTag` - "The device shall set this field to the value received in the *dCBWTag* of
    /// the associated CBW."
    pub tag: u32,
    /// `dCSWDataResidue` - the difference between `dCBWDataTransferLength` and
    /// the amount of data actually processed. Never exceeds the requested length.
    pub data_residue: u32,
    /// `bCSWStatus`
    ///
    /// | Value | Description                    |
    /// | ----- | ------------------------------ |
    /// | 0x00  | Command Passed ("good status") |
    /// | 0x01  | Command Failed                 |
    /// | 0x02  | Phase Error                    |
    /// | _     | All other values are reserved  |
    pub status: CommandStatus,
}

impl CommandStatusWrapper {
    /// Cast the provided slice into a command status wrapper.
    ///
    /// This function validates that the `signature` is correct.
    pub fn from_slice(buf: &[u8]) -> color_eyre::Result<&CommandStatusWrapper> {
        const {
            assert!(
                std::mem::size_of::<CommandStatusWrapper>() == CSW_SIZE,
                "CommandStatusWrapper not 13 bytes in size"
            );
        };
        ensure!(
            buf.len() == CSW_SIZE,
            "provided buffer *must* be same size as struct (CSW_SIZE), was instead {}",
            buf.len()
        );
        // Casting to an enum if it might be an invalid option is undefined behavior.
        // Valid options (as defined by the spec) are values between 0 and 2
        let last_byte = buf[CSW_SIZE - 1];
        ensure!(
            (0..=2).contains(&last_byte),
            "the command status field is invalid, should be in 0..=2, was {last_byte}"
        );

        // SAFETY: The buffer is the same size as the struct, the struct is
        // packed (alignment 1) and the status byte holds a valid discriminant.
        let csw: &'_ CommandStatusWrapper =
            unsafe { &*(buf.as_ptr() as *const CommandStatusWrapper) };
        let signature = csw.signature;
        ensure!(
            signature == CSW_SIGNATURE,
            "invalid magic number for command status wrapper, should be 0x53425355, is 0x{:X}",
            signature
        );

        Ok(csw)
    }

    /// Maps the status onto a raw completion for a command that asked for
    /// `requested` bytes.
    ///
    /// A failed command needs its sense data fetched with REQUEST SENSE
    /// first; pass it in `sense`.
    pub fn completion(&self, tag: u32, requested: usize, sense: Option<Vec<u8>>) -> RawCompletion {
        let echoed = self.tag;
        if echoed != tag {
            return RawCompletion::failed(RawStatus::SignatureMismatch);
        }
        let residue = self.data_residue as usize;
        match self.status {
            CommandStatus::Passed => RawCompletion::native(
                NativeStatus::Scsi {
                    status: scsi::status::GOOD,
                    sense: Vec::new(),
                },
                requested.saturating_sub(residue),
            ),
            CommandStatus::Failed => RawCompletion::native(
                NativeStatus::Scsi {
                    status: scsi::status::CHECK_CONDITION,
                    sense: sense.unwrap_or_default(),
                },
                requested.saturating_sub(residue),
            ),
            // The device needs a reset recovery before it takes another CBW.
            CommandStatus::PhaseError => RawCompletion::failed(RawStatus::LinkError),
        }
    }
}

/// Used for generating unique-ish command block tags.
#[derive(Debug)]
pub struct TagGenerator(u32);

impl TagGenerator {
    /// Initialize the tag generator.
    pub fn new() -> TagGenerator {
        // 123 was chosen as a distinct, human-readable pattern to differentiate it from the rest
        // of the packet
        Self(123)
    }

    /// Returns a unique-ish u32 that's different from the previously returned value.
    pub fn tag(&mut self) -> u32 {
        let output = self.0;
        self.0 = self.0.wrapping_add(1);
        output
    }
}

impl Default for TagGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::command as cdb;

    fn csw(tag: u32, residue: u32, status: u8) -> [u8; CSW_SIZE] {
        let mut packet = [0u8; CSW_SIZE];
        packet[..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        packet[4..8].copy_from_slice(&tag.to_le_bytes());
        packet[8..12].copy_from_slice(&residue.to_le_bytes());
        packet[12] = status;
        packet
    }

    #[test]
    fn catch_invalid_enum_repr() {
        // Captured from an actual USB device, with the last byte (command_status) modified to
        // an invalid value (0xaa)
        let input_packet = [0x55, 0x53, 0x42, 0x53, 0, 0, 0, 0, 0, 0, 0, 0, 0xaa];
        let r = CommandStatusWrapper::from_slice(&input_packet);
        let e = r.expect_err("should catch invalid command status");
        assert!(e.root_cause().to_string().contains("command status"));
    }

    #[test]
    fn catch_bad_signature() {
        let mut packet = csw(1, 0, 0);
        packet[0] = 0;
        let e = CommandStatusWrapper::from_slice(&packet).expect_err("bad magic");
        assert!(e.to_string().contains("magic number"));
    }

    #[test]
    fn wrapper_layout() {
        let cdb = cdb::read_10(0x1234, 8);
        let cbw = CommandBlockWrapper::new(&cdb, 4096, CbwDirection::DataIn, 0xA1B2_C3D4);
        let bytes = cbw.as_slice();
        assert_eq!(bytes.len(), CBW_SIZE);
        assert_eq!(&bytes[..4], b"USBC");
        assert_eq!(&bytes[4..8], &0xA1B2_C3D4u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &4096u32.to_le_bytes());
        assert_eq!(bytes[12], 0x80);
        assert_eq!(bytes[13], 0);
        assert_eq!(bytes[14], 10);
        assert_eq!(&bytes[15..25], cdb.as_bytes());
        assert!(bytes[25..].iter().all(|b| *b == 0));
    }

    #[test]
    fn direction_bits() {
        assert_eq!(CbwDirection::from(DataDirection::In) as u8, 0x80);
        assert_eq!(CbwDirection::from(DataDirection::Out) as u8, 0x00);
        assert_eq!(CbwDirection::from(DataDirection::None) as u8, 0x00);
    }

    #[test]
    fn passed_status_reports_residue() {
        let packet = csw(7, 512, 0);
        let status = CommandStatusWrapper::from_slice(&packet).expect("valid CSW");
        let raw = status.completion(7, 4096, None);
        assert_eq!(raw.status, RawStatus::Completed);
        assert_eq!(raw.transferred, 3584);
    }

    #[test]
    fn failed_status_carries_sense() {
        let packet = csw(7, 0, 1);
        let status = CommandStatusWrapper::from_slice(&packet).expect("valid CSW");
        let sense = scsi::SenseData::new(scsi::sense::key::NOT_READY, 0x3A, 0).to_fixed().to_vec();
        let raw = status.completion(7, 0, Some(sense.clone()));
        assert_eq!(
            raw.native,
            Some(NativeStatus::Scsi {
                status: scsi::status::CHECK_CONDITION,
                sense
            })
        );
    }

    #[test]
    fn phase_error_and_stale_tag() {
        let packet = csw(7, 0, 2);
        let status = CommandStatusWrapper::from_slice(&packet).expect("valid CSW");
        assert_eq!(status.completion(7, 0, None).status, RawStatus::LinkError);
        assert_eq!(
            status.completion(8, 0, None).status,
            RawStatus::SignatureMismatch
        );
    }

    #[test]
    fn tags_advance() {
        let mut tags = TagGenerator::default();
        let first = tags.tag();
        assert_ne!(first, tags.tag());
    }
}
