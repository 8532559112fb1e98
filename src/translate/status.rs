//! Protocol-neutral completion outcomes and the tables mapping them to and
//! from each protocol's status vocabulary.
//!
//! Every table is a total `match`: there is no outcome a protocol cannot
//! express, and no native status that fails to decode. Unknown native values
//! decode to [`TransportOutcome::Internal`].

use crate::ata::{self, AtaRegisters};
use crate::io::NativeStatus;
use crate::nvme::{NvmeStatus, generic, media, sct};
use crate::scsi::sense::{self, SenseData, asc, key};
use crate::scsi::status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportOutcome {
    Success,
    RecoveredError,
    NotReady,
    MediumError,
    WriteFault,
    HardwareError,
    InvalidCommand,
    InvalidField,
    LbaOutOfRange,
    WriteProtected,
    Aborted,
    Timeout,
    DeviceReset,
    /// Catch-all for anything that has no better name.
    Internal,
}

impl TransportOutcome {
    pub const ALL: [TransportOutcome; 14] = [
        TransportOutcome::Success,
        TransportOutcome::RecoveredError,
        TransportOutcome::NotReady,
        TransportOutcome::MediumError,
        TransportOutcome::WriteFault,
        TransportOutcome::HardwareError,
        TransportOutcome::InvalidCommand,
        TransportOutcome::InvalidField,
        TransportOutcome::LbaOutOfRange,
        TransportOutcome::WriteProtected,
        TransportOutcome::Aborted,
        TransportOutcome::Timeout,
        TransportOutcome::DeviceReset,
        TransportOutcome::Internal,
    ];

    pub fn is_success(self) -> bool {
        matches!(self, TransportOutcome::Success | TransportOutcome::RecoveredError)
    }
}

/// ATA status and error registers standing in for an outcome.
pub fn ata_registers(outcome: TransportOutcome) -> AtaRegisters {
    use ata::error::{ABRT, IDNF, UNC};
    use ata::status::{CORR, DF, DRDY, DSC, ERR};

    let failed = DRDY | DSC | ERR;
    let (status, error) = match outcome {
        TransportOutcome::Success => (DRDY | DSC, 0),
        TransportOutcome::RecoveredError => (DRDY | DSC | CORR, 0),
        TransportOutcome::NotReady => (ERR, ABRT),
        TransportOutcome::MediumError => (failed, UNC),
        TransportOutcome::WriteFault | TransportOutcome::HardwareError => (failed | DF, ABRT),
        TransportOutcome::LbaOutOfRange => (failed, IDNF),
        TransportOutcome::InvalidCommand
        | TransportOutcome::InvalidField
        | TransportOutcome::WriteProtected
        | TransportOutcome::Aborted
        | TransportOutcome::Timeout
        | TransportOutcome::DeviceReset
        | TransportOutcome::Internal => (failed, ABRT),
    };
    AtaRegisters::new(status, error)
}

/// SCSI status byte and, for anything but plain success, fixed-format sense.
pub fn scsi_sense(outcome: TransportOutcome) -> (u8, Option<SenseData>) {
    let (k, a, q) = match outcome {
        TransportOutcome::Success => return (status::GOOD, None),
        TransportOutcome::RecoveredError => (key::RECOVERED_ERROR, asc::RECOVERED_DATA, 0),
        TransportOutcome::NotReady => (key::NOT_READY, asc::NOT_READY, 0),
        TransportOutcome::MediumError => (key::MEDIUM_ERROR, asc::UNRECOVERED_READ, 0),
        TransportOutcome::WriteFault => (key::MEDIUM_ERROR, asc::WRITE_FAULT, 0),
        TransportOutcome::HardwareError => (key::HARDWARE_ERROR, asc::LOGICAL_UNIT_FAILURE, 0x01),
        TransportOutcome::InvalidCommand => (key::ILLEGAL_REQUEST, asc::INVALID_OPCODE, 0),
        TransportOutcome::InvalidField => (key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB, 0),
        TransportOutcome::LbaOutOfRange => (key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE, 0),
        TransportOutcome::WriteProtected => (key::DATA_PROTECT, asc::WRITE_PROTECTED, 0),
        TransportOutcome::Aborted => (key::ABORTED_COMMAND, asc::NO_ADDITIONAL, 0),
        TransportOutcome::Timeout => (
            key::ABORTED_COMMAND,
            asc::LOGICAL_UNIT_FAILURE,
            sense::ASCQ_TIMEOUT_ON_LOGICAL_UNIT,
        ),
        TransportOutcome::DeviceReset => (key::UNIT_ATTENTION, asc::POWER_ON_RESET, 0),
        TransportOutcome::Internal => (key::HARDWARE_ERROR, asc::INTERNAL_TARGET_FAILURE, 0),
    };
    (status::CHECK_CONDITION, Some(SenseData::new(k, a, q)))
}

/// The sense key alone, for sense built around returned ATA registers.
pub fn scsi_sense_key(outcome: TransportOutcome) -> u8 {
    scsi_sense(outcome).1.map_or(key::NO_SENSE, |s| s.key)
}

pub fn nvme_status(outcome: TransportOutcome) -> NvmeStatus {
    let (t, c) = match outcome {
        TransportOutcome::Success | TransportOutcome::RecoveredError => {
            (sct::GENERIC, generic::SUCCESS)
        }
        TransportOutcome::NotReady => (sct::GENERIC, generic::NAMESPACE_NOT_READY),
        TransportOutcome::MediumError => (sct::MEDIA_ERROR, media::UNRECOVERED_READ),
        TransportOutcome::WriteFault => (sct::MEDIA_ERROR, media::WRITE_FAULT),
        TransportOutcome::HardwareError => (sct::GENERIC, generic::DATA_TRANSFER_ERROR),
        TransportOutcome::InvalidCommand => (sct::GENERIC, generic::INVALID_OPCODE),
        TransportOutcome::InvalidField => (sct::GENERIC, generic::INVALID_FIELD),
        TransportOutcome::LbaOutOfRange => (sct::GENERIC, generic::LBA_OUT_OF_RANGE),
        TransportOutcome::WriteProtected => (sct::GENERIC, generic::NAMESPACE_WRITE_PROTECTED),
        TransportOutcome::Aborted | TransportOutcome::Timeout => {
            (sct::GENERIC, generic::ABORT_REQUESTED)
        }
        TransportOutcome::DeviceReset => (sct::GENERIC, generic::ABORTED_SQ_DELETION),
        TransportOutcome::Internal => (sct::GENERIC, generic::INTERNAL_ERROR),
    };
    NvmeStatus::new(t, c)
}

pub fn from_ata(regs: &AtaRegisters) -> TransportOutcome {
    use ata::error::{ABRT, ICRC, IDNF, MC, MCR, NM, UNC};
    use ata::status::{CORR, DF, DRDY};

    if !regs.is_error() {
        return if regs.status & CORR != 0 {
            TransportOutcome::RecoveredError
        } else {
            TransportOutcome::Success
        };
    }
    if regs.status & DF != 0 {
        return TransportOutcome::HardwareError;
    }
    let error = regs.error;
    if error & UNC != 0 {
        TransportOutcome::MediumError
    } else if error & IDNF != 0 {
        TransportOutcome::LbaOutOfRange
    } else if error & (MC | MCR | NM) != 0 || regs.status & DRDY == 0 {
        TransportOutcome::NotReady
    } else if error & ICRC != 0 {
        TransportOutcome::HardwareError
    } else if error & ABRT != 0 {
        TransportOutcome::Aborted
    } else {
        TransportOutcome::Internal
    }
}

pub fn from_scsi(status_byte: u8, sense_bytes: &[u8]) -> TransportOutcome {
    match status_byte {
        status::GOOD | status::CONDITION_MET => TransportOutcome::Success,
        status::CHECK_CONDITION => {
            if let Some(regs) = SenseData::ata_registers(sense_bytes) {
                return from_ata(&regs);
            }
            SenseData::parse(sense_bytes).map_or(TransportOutcome::Internal, |s| from_sense(&s))
        }
        status::BUSY | status::TASK_SET_FULL => TransportOutcome::NotReady,
        status::RESERVATION_CONFLICT | status::TASK_ABORTED => TransportOutcome::Aborted,
        _ => TransportOutcome::Internal,
    }
}

fn from_sense(sense: &SenseData) -> TransportOutcome {
    match (sense.key, sense.asc, sense.ascq) {
        (key::NO_SENSE, ..) => TransportOutcome::Success,
        (key::RECOVERED_ERROR, ..) => TransportOutcome::RecoveredError,
        (key::NOT_READY, ..) => TransportOutcome::NotReady,
        (key::MEDIUM_ERROR, asc::WRITE_FAULT | asc::WRITE_ERROR, _) => TransportOutcome::WriteFault,
        (key::MEDIUM_ERROR, ..) => TransportOutcome::MediumError,
        (key::HARDWARE_ERROR, asc::INTERNAL_TARGET_FAILURE, _) => TransportOutcome::Internal,
        (key::HARDWARE_ERROR, ..) => TransportOutcome::HardwareError,
        (key::ILLEGAL_REQUEST, asc::INVALID_OPCODE, _) => TransportOutcome::InvalidCommand,
        (key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE, _) => TransportOutcome::LbaOutOfRange,
        (key::ILLEGAL_REQUEST, ..) => TransportOutcome::InvalidField,
        (key::UNIT_ATTENTION, asc::POWER_ON_RESET, _) => TransportOutcome::DeviceReset,
        (key::UNIT_ATTENTION, ..) => TransportOutcome::Aborted,
        (key::DATA_PROTECT, ..) => TransportOutcome::WriteProtected,
        (key::ABORTED_COMMAND, asc::LOGICAL_UNIT_FAILURE, sense::ASCQ_TIMEOUT_ON_LOGICAL_UNIT) => {
            TransportOutcome::Timeout
        }
        (key::ABORTED_COMMAND, ..) => TransportOutcome::Aborted,
        _ => TransportOutcome::Internal,
    }
}

pub fn from_nvme(status: &NvmeStatus) -> TransportOutcome {
    if status.is_success() {
        return TransportOutcome::Success;
    }
    match (status.sct, status.sc) {
        (sct::GENERIC, generic::INVALID_OPCODE) => TransportOutcome::InvalidCommand,
        (sct::GENERIC, generic::INVALID_FIELD | generic::INVALID_NAMESPACE) => {
            TransportOutcome::InvalidField
        }
        (sct::GENERIC, generic::DATA_TRANSFER_ERROR) => TransportOutcome::HardwareError,
        (sct::GENERIC, generic::ABORTED_SQ_DELETION) => TransportOutcome::DeviceReset,
        (sct::GENERIC, generic::ABORT_REQUESTED | generic::ABORTED_POWER_LOSS) => {
            TransportOutcome::Aborted
        }
        (sct::GENERIC, generic::NAMESPACE_WRITE_PROTECTED) => TransportOutcome::WriteProtected,
        (sct::GENERIC, generic::LBA_OUT_OF_RANGE | generic::CAPACITY_EXCEEDED) => {
            TransportOutcome::LbaOutOfRange
        }
        (sct::GENERIC, generic::NAMESPACE_NOT_READY) => TransportOutcome::NotReady,
        (sct::COMMAND_SPECIFIC, _) => TransportOutcome::InvalidField,
        (sct::MEDIA_ERROR, media::WRITE_FAULT) => TransportOutcome::WriteFault,
        (sct::MEDIA_ERROR, media::ACCESS_DENIED) => TransportOutcome::WriteProtected,
        (sct::MEDIA_ERROR, _) => TransportOutcome::MediumError,
        (sct::PATH_RELATED, _) => TransportOutcome::Aborted,
        _ => TransportOutcome::Internal,
    }
}

pub fn from_native(native: &NativeStatus) -> TransportOutcome {
    match native {
        NativeStatus::Ata(regs) => from_ata(regs),
        NativeStatus::Scsi { status, sense } => from_scsi(*status, sense),
        NativeStatus::Nvme { status, .. } => from_nvme(status),
    }
}
