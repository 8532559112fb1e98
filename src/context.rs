//! Per-call records: what the caller submits and what it gets back.

use std::time::Duration;

use crate::ata::{AtaCompletion, TaskFile};
use crate::nvme::{self, NvmeCommand, NvmeCompletion};
use crate::scsi::{CommandBlock, OpCode, ScsiCompletion};

/// Command vocabulary a caller speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ata,
    Scsi,
    Nvme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataDirection {
    None,
    /// From the device to the host.
    In,
    /// From the host to the device.
    Out,
    Bidirectional,
}

/// A protocol-native command record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolCommand {
    Ata(TaskFile),
    Scsi(CommandBlock),
    Nvme(NvmeCommand),
}

impl ProtocolCommand {
    pub fn protocol(&self) -> Protocol {
        match self {
            ProtocolCommand::Ata(_) => Protocol::Ata,
            ProtocolCommand::Scsi(_) => Protocol::Scsi,
            ProtocolCommand::Nvme(_) => Protocol::Nvme,
        }
    }

    pub fn opcode(&self) -> u8 {
        match self {
            ProtocolCommand::Ata(tf) => tf.command,
            ProtocolCommand::Scsi(cdb) => cdb.opcode(),
            ProtocolCommand::Nvme(cmd) => cmd.opcode,
        }
    }

    /// The field that further selects an operation under the opcode: the ATA
    /// feature register, a SCSI service action, the NVMe Dataset Management
    /// attributes or log page id. Zero where the opcode has no such field.
    pub fn sub_opcode(&self) -> u16 {
        match self {
            ProtocolCommand::Ata(tf) => tf.feature & 0xFF,
            ProtocolCommand::Scsi(cdb) if cdb.opcode() == OpCode::MaintenanceIn as u8 => {
                u16::from(cdb.service_action())
            }
            ProtocolCommand::Scsi(_) => 0,
            ProtocolCommand::Nvme(cmd) if !cmd.admin && cmd.opcode == nvme::io::DATASET_MANAGEMENT => {
                (cmd.cdw11() & 0x7) as u16
            }
            ProtocolCommand::Nvme(cmd) if cmd.admin && cmd.opcode == nvme::admin::GET_LOG_PAGE => {
                (cmd.cdw10() & 0xFF) as u16
            }
            ProtocolCommand::Nvme(_) => 0,
        }
    }
}

/// The caller's data buffer, borrowed for one call.
#[derive(Debug)]
pub enum DataBuffer<'a> {
    None,
    In(&'a mut [u8]),
    Out(&'a [u8]),
    Bidirectional(&'a mut [u8]),
}

impl DataBuffer<'_> {
    pub fn direction(&self) -> DataDirection {
        match self {
            DataBuffer::None => DataDirection::None,
            DataBuffer::In(_) => DataDirection::In,
            DataBuffer::Out(_) => DataDirection::Out,
            DataBuffer::Bidirectional(_) => DataDirection::Bidirectional,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DataBuffer::None => 0,
            DataBuffer::Out(buf) => buf.len(),
            DataBuffer::In(buf) | DataBuffer::Bidirectional(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes headed to the device, for OUT and bidirectional buffers.
    pub fn outgoing(&self) -> Option<&[u8]> {
        match self {
            DataBuffer::Out(buf) => Some(buf),
            DataBuffer::Bidirectional(buf) => Some(buf),
            DataBuffer::None | DataBuffer::In(_) => None,
        }
    }
}

/// One command as the caller issued it.
///
/// The protocol is fixed by the command record given at construction and
/// cannot be changed afterwards.
#[derive(Debug)]
pub struct CommandContext<'a> {
    command: ProtocolCommand,
    data: DataBuffer<'a>,
    timeout: Option<Duration>,
}

impl<'a> CommandContext<'a> {
    pub fn ata(taskfile: TaskFile, data: DataBuffer<'a>) -> Self {
        Self::new(ProtocolCommand::Ata(taskfile), data)
    }

    pub fn scsi(cdb: CommandBlock, data: DataBuffer<'a>) -> Self {
        Self::new(ProtocolCommand::Scsi(cdb), data)
    }

    pub fn nvme(command: NvmeCommand, data: DataBuffer<'a>) -> Self {
        Self::new(ProtocolCommand::Nvme(command), data)
    }

    fn new(command: ProtocolCommand, data: DataBuffer<'a>) -> Self {
        Self {
            command,
            data,
            timeout: None,
        }
    }

    /// Overrides the session's default timeout for this command.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.command.protocol()
    }

    pub fn command(&self) -> &ProtocolCommand {
        &self.command
    }

    pub fn direction(&self) -> DataDirection {
        self.data.direction()
    }

    pub fn data(&self) -> &DataBuffer<'a> {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut DataBuffer<'a> {
        &mut self.data
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// A completion in the protocol the command was submitted in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolCompletion {
    Ata(AtaCompletion),
    Scsi(ScsiCompletion),
    Nvme(NvmeCompletion),
}

impl ProtocolCompletion {
    pub fn protocol(&self) -> Protocol {
        match self {
            ProtocolCompletion::Ata(_) => Protocol::Ata,
            ProtocolCompletion::Scsi(_) => Protocol::Scsi,
            ProtocolCompletion::Nvme(_) => Protocol::Nvme,
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            ProtocolCompletion::Ata(c) => c.is_success(),
            ProtocolCompletion::Scsi(c) => c.is_success(),
            ProtocolCompletion::Nvme(c) => c.is_success(),
        }
    }

    pub fn transferred(&self) -> usize {
        match self {
            ProtocolCompletion::Ata(c) => c.transferred,
            ProtocolCompletion::Scsi(c) => c.transferred,
            ProtocolCompletion::Nvme(c) => c.transferred,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ata, scsi};

    #[test]
    fn protocol_follows_the_command_record() {
        let mut buf = [0u8; 512];
        let ctx = CommandContext::ata(TaskFile::identify_device(), DataBuffer::In(&mut buf))
            .with_timeout(Duration::from_secs(1));
        assert_eq!(ctx.protocol(), Protocol::Ata);
        assert_eq!(ctx.direction(), DataDirection::In);
        assert_eq!(ctx.timeout(), Some(Duration::from_secs(1)));

        let ctx = CommandContext::scsi(scsi::command::test_unit_ready(), DataBuffer::None);
        assert_eq!(ctx.protocol(), Protocol::Scsi);
        assert_eq!(ctx.data().len(), 0);
    }

    #[test]
    fn sub_opcodes() {
        let smart = ProtocolCommand::Ata(TaskFile::smart(ata::smart::RETURN_STATUS));
        assert_eq!(smart.sub_opcode(), 0xDA);

        let dsm = ProtocolCommand::Nvme(NvmeCommand::dataset_management(1, 1, nvme::DSM_DEALLOCATE));
        assert_eq!(dsm.sub_opcode(), 0x4);

        let log = ProtocolCommand::Nvme(NvmeCommand::get_log_page(nvme::log::FIRMWARE_SLOT, 512));
        assert_eq!(log.sub_opcode(), 0x3);

        let rsoc = ProtocolCommand::Scsi(scsi::command::report_supported_operation_code(0x3B, 12));
        assert_eq!(rsoc.sub_opcode(), 0x0C);
    }
}
