//! SCSI protocol and format implementation as described in:
//! - SCSI Primary Commands – 2 (SPC-2):
//!   <https://www.rockbox.org/wiki/pub/Main/DataSheets/spc2r20.pdf>
//!   This is an older version of the SCSI specification.
//!   It has enough information to describe almost every command we need to know,
//!   except for some information specific to block devices, which is described in the next SCSI
//!   specification linked below.
//! - SCSI Block Commands – 2 (SBC-2)
//!   <https://raw.githubusercontent.com/carmark/papers/master/storage/scsi/sbc2r16.pdf>
//!   This is an older version of the SCSI block commands specification. It contains information
//!   about commands specific to block devices.
//! - SCSI / ATA Translation – 2 (SAT-2), for the ATA PASS-THROUGH commands and the
//!   sense data they return.

pub mod command;
mod command_descriptor;
pub mod response;
pub mod sense;

pub use command::CommandBlock;
pub use command_descriptor::OpCode;
pub use sense::SenseData;

/// The largest CDB we build or accept, SPC-2 4.3.2 table 4.
pub const MAX_CDB_SIZE: usize = 16;

/// Status byte values, SAM-4 table 35.
pub mod status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const CONDITION_MET: u8 = 0x04;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const TASK_ABORTED: u8 = 0x40;
}

/// Completion of a SCSI command: the status byte and whatever sense came with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiCompletion {
    pub status: u8,
    /// Raw sense bytes; empty when the command completed without sense.
    pub sense: Vec<u8>,
    pub transferred: usize,
}

impl ScsiCompletion {
    pub fn sense_data(&self) -> Option<SenseData> {
        SenseData::parse(&self.sense)
    }

    /// GOOD or CONDITION MET, or CHECK CONDITION that only reports recovered
    /// or informational sense.
    pub fn is_success(&self) -> bool {
        match self.status {
            status::GOOD | status::CONDITION_MET => true,
            status::CHECK_CONDITION => self
                .sense_data()
                .is_some_and(|s| matches!(s.key, sense::key::NO_SENSE | sense::key::RECOVERED_ERROR)),
            _ => false,
        }
    }
}
