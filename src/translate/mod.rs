//! Stateless mapping between the caller's protocol and a dialect's wire
//! protocol, in both directions.

pub mod rules;
pub mod status;

use crate::ata::AtaCompletion;
use crate::context::{CommandContext, Protocol, ProtocolCommand, ProtocolCompletion};
use crate::error::UnsupportedTranslation;
use crate::io::{NativeStatus, RawCompletion, RawStatus};
use crate::nvme::NvmeCompletion;
use crate::profile::DeviceProfile;
use crate::scsi::sense::{SenseData, key};
use crate::scsi::{ScsiCompletion, status as scsi_status};
use crate::transport::{
    Payload, ReverseMapping, TransportDescriptor, WireCommand, WireProtocol, WireRequest,
};

pub use rules::TranslationRule;
pub use status::TransportOutcome;

/// Device facts the field arithmetic depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslateEnv {
    pub block_size: u32,
    /// Namespace SCSI commands are routed to on an NVMe device.
    pub nsid: u32,
}

impl Default for TranslateEnv {
    fn default() -> Self {
        Self {
            block_size: crate::profile::DEFAULT_BLOCK_SIZE,
            nsid: crate::nvme::DEFAULT_NSID,
        }
    }
}

impl TranslateEnv {
    pub fn for_profile(profile: &DeviceProfile) -> Self {
        Self {
            block_size: profile.block_size(),
            ..Self::default()
        }
    }
}

/// The set of allow-listed rules a session translates with.
#[derive(Debug, Clone)]
pub struct TranslationTable {
    rules: Vec<TranslationRule>,
}

impl Default for TranslationTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl TranslationTable {
    pub fn standard() -> Self {
        Self {
            rules: rules::STANDARD.to_vec(),
        }
    }

    /// Identity repacks only.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_rule(mut self, rule: TranslationRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn without(mut self, name: &str) -> Self {
        self.rules.retain(|r| r.name != name);
        self
    }

    pub fn rules(&self) -> &[TranslationRule] {
        &self.rules
    }

    pub fn lookup(
        &self,
        source: Protocol,
        wire: WireProtocol,
        opcode: u8,
        sub_opcode: u16,
    ) -> Option<&TranslationRule> {
        self.rules
            .iter()
            .find(|r| r.matches(source, wire, opcode, sub_opcode))
    }
}

fn carries_natively(protocol: Protocol, wire: WireProtocol) -> bool {
    matches!(
        (protocol, wire),
        (Protocol::Ata, WireProtocol::Ata)
            | (Protocol::Scsi, WireProtocol::Scsi)
            | (Protocol::Nvme, WireProtocol::Nvme)
    )
}

/// Expresses the caller's command in the descriptor's wire protocol.
pub fn forward(
    table: &TranslationTable,
    ctx: &CommandContext<'_>,
    descriptor: &TransportDescriptor,
    env: &TranslateEnv,
) -> Result<WireCommand, UnsupportedTranslation> {
    let protocol = ctx.protocol();
    let opcode = ctx.command().opcode();
    let unsupported = |reason| UnsupportedTranslation {
        protocol,
        opcode,
        wire: descriptor.wire,
        reason,
    };

    let command = if carries_natively(protocol, descriptor.wire) {
        let request = match *ctx.command() {
            ProtocolCommand::Ata(tf) => WireRequest::Ata(tf),
            ProtocolCommand::Scsi(cdb) => WireRequest::Scsi(cdb),
            ProtocolCommand::Nvme(cmd) => WireRequest::Nvme(cmd),
        };
        WireCommand::new(request, ctx.direction(), ctx.data().len())
    } else {
        let rule = table
            .lookup(protocol, descriptor.wire, opcode, ctx.command().sub_opcode())
            .ok_or_else(|| unsupported("no translation rule"))?;
        let mut command = (rule.forward)(ctx, env).map_err(unsupported)?;
        command.rule = Some(rule.name);
        if rule.reverse == ReverseMapping::ReturnRegisters {
            command.reverse = ReverseMapping::ReturnRegisters;
        }
        command
    };

    if command.payload == Payload::Caller && command.direction != ctx.direction() {
        return Err(unsupported("caller buffer direction does not match the command"));
    }
    if !descriptor.accepts(&command) {
        return Err(unsupported("outside the dialect's command subset"));
    }
    Ok(command)
}

/// Outcome of a raw completion, from its native status when there is one.
pub fn outcome(raw: &RawCompletion) -> TransportOutcome {
    match raw.status {
        RawStatus::Completed => raw
            .native
            .as_ref()
            .map_or(TransportOutcome::Success, status::from_native),
        RawStatus::TimedOut => TransportOutcome::Timeout,
        RawStatus::NotImplemented
        | RawStatus::SignatureMismatch
        | RawStatus::Rejected
        | RawStatus::LinkError => TransportOutcome::Internal,
    }
}

/// A completion in `caller`'s protocol built from the outcome tables alone.
pub fn synthesize(caller: Protocol, outcome: TransportOutcome, transferred: usize) -> ProtocolCompletion {
    match caller {
        Protocol::Ata => ProtocolCompletion::Ata(AtaCompletion {
            registers: status::ata_registers(outcome),
            transferred,
        }),
        Protocol::Scsi => {
            let (status_byte, sense) = status::scsi_sense(outcome);
            ProtocolCompletion::Scsi(ScsiCompletion {
                status: status_byte,
                sense: sense.map(|s| s.to_fixed().to_vec()).unwrap_or_default(),
                transferred,
            })
        }
        Protocol::Nvme => ProtocolCompletion::Nvme(NvmeCompletion {
            dword0: 0,
            status: status::nvme_status(outcome),
            transferred,
        }),
    }
}

/// Maps what the transport reported back into the caller's protocol.
///
/// Native status in the caller's own protocol passes through untouched.
/// ATA registers reach an ATA caller even when they travelled inside SCSI
/// sense, and reach a SCSI caller as SAT-style sense when the command failed
/// or asked for them.
pub fn reverse(
    caller: Protocol,
    raw: &RawCompletion,
    outcome: TransportOutcome,
    command: &WireCommand,
) -> ProtocolCompletion {
    let transferred = if outcome.is_success() {
        raw.transferred.min(command.transfer_len)
    } else {
        0
    };

    match (caller, &raw.native) {
        (Protocol::Ata, Some(NativeStatus::Ata(registers))) => {
            ProtocolCompletion::Ata(AtaCompletion {
                registers: *registers,
                transferred,
            })
        }
        (Protocol::Ata, Some(NativeStatus::Scsi { sense, .. })) => {
            match SenseData::ata_registers(sense) {
                Some(registers) => ProtocolCompletion::Ata(AtaCompletion {
                    registers,
                    transferred,
                }),
                None => synthesize(caller, outcome, transferred),
            }
        }
        (Protocol::Scsi, Some(NativeStatus::Scsi { status, sense })) => {
            ProtocolCompletion::Scsi(ScsiCompletion {
                status: *status,
                sense: sense.clone(),
                transferred,
            })
        }
        (Protocol::Scsi, Some(NativeStatus::Ata(registers)))
            if command.reverse == ReverseMapping::ReturnRegisters || !outcome.is_success() =>
        {
            let sense_key = if outcome.is_success() {
                key::RECOVERED_ERROR
            } else {
                status::scsi_sense_key(outcome)
            };
            let extended = matches!(command.request, WireRequest::Ata(tf) if tf.extended);
            let sense = if extended {
                SenseData::ata_return_sense(sense_key, registers, true)
            } else {
                SenseData::with_ata_registers(sense_key, registers, false)
                    .to_fixed()
                    .to_vec()
            };
            ProtocolCompletion::Scsi(ScsiCompletion {
                status: scsi_status::CHECK_CONDITION,
                sense,
                transferred,
            })
        }
        (Protocol::Nvme, Some(NativeStatus::Nvme { dword0, status })) => {
            ProtocolCompletion::Nvme(NvmeCompletion {
                dword0: *dword0,
                status: *status,
                transferred,
            })
        }
        _ => synthesize(caller, outcome, transferred),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ata::{self, AtaRegisters, TaskFile};
    use crate::context::{DataBuffer, DataDirection};
    use crate::nvme::{self, NvmeCommand, NvmeStatus};
    use crate::scsi::command::{self as cdb, AtaPassThrough, AtaProtocol};
    use crate::scsi::sense::ATA_PASSTHROUGH_INFO;
    use crate::transport::{Dialect, REGISTRY};

    fn descriptor(dialect: Dialect, wire: WireProtocol) -> &'static TransportDescriptor {
        REGISTRY
            .iter()
            .find(|d| d.dialect == dialect && d.wire == wire)
            .expect("registered")
    }

    fn wire(request: WireRequest, transfer_len: usize) -> WireCommand {
        WireCommand::new(request, DataDirection::In, transfer_len)
    }

    #[test]
    fn same_protocol_is_repacked_as_is() {
        let mut buf = [0u8; 512];
        let ctx = CommandContext::ata(TaskFile::identify_device(), DataBuffer::In(&mut buf));
        let command = forward(
            &TranslationTable::empty(),
            &ctx,
            descriptor(Dialect::AtaPassThrough, WireProtocol::Ata),
            &TranslateEnv::default(),
        )
        .expect("identity");
        assert_eq!(command.request, WireRequest::Ata(TaskFile::identify_device()));
        assert_eq!(command.transfer_len, 512);
        assert!(!command.is_translated());
    }

    #[test]
    fn missing_rule_is_unsupported() {
        let ctx = CommandContext::nvme(NvmeCommand::flush(1), DataBuffer::None);
        let table = TranslationTable::standard().without("nvme-flush-sntl");
        let err = forward(
            &table,
            &ctx,
            descriptor(Dialect::ScsiPassThrough, WireProtocol::Scsi),
            &TranslateEnv::default(),
        )
        .expect_err("rule removed");
        assert_eq!(err.protocol, Protocol::Nvme);
        assert_eq!(err.wire, WireProtocol::Scsi);
        assert_eq!(err.reason, "no translation rule");
    }

    #[test]
    fn caller_buffer_direction_must_match() {
        let data = [0u8; 512];
        let ctx = CommandContext::scsi(cdb::read_10(0, 1), DataBuffer::Out(&data));
        let err = forward(
            &TranslationTable::standard(),
            &ctx,
            descriptor(Dialect::AtaPassThrough, WireProtocol::Ata),
            &TranslateEnv::default(),
        )
        .expect_err("READ with an OUT buffer");
        assert!(err.reason.contains("direction"));
    }

    #[test]
    fn legacy_dialect_refuses_dma() {
        let mut buf = [0u8; 512];
        let ctx = CommandContext::ata(TaskFile::read_dma_ext(0, 1), DataBuffer::In(&mut buf));
        let err = forward(
            &TranslationTable::standard(),
            &ctx,
            descriptor(Dialect::IdeDiagnostic, WireProtocol::Ata),
            &TranslateEnv::default(),
        )
        .expect_err("48-bit DMA");
        assert!(err.reason.contains("subset"));
    }

    #[test]
    fn ata_registers_pass_through_to_ata_callers() {
        let mut regs = AtaRegisters::new(0x50, 0);
        regs.lba = 0x00C2_4F00;
        let command = wire(WireRequest::Ata(TaskFile::smart(ata::smart::RETURN_STATUS)), 0);
        let raw = RawCompletion::native(NativeStatus::Ata(regs), 0);
        let completion = reverse(Protocol::Ata, &raw, outcome(&raw), &command);
        assert_eq!(
            completion,
            ProtocolCompletion::Ata(AtaCompletion {
                registers: regs,
                transferred: 0
            })
        );
    }

    #[test]
    fn success_without_registers_reports_ready() {
        let command = wire(WireRequest::Ata(TaskFile::flush_cache_ext()), 0);
        let raw = RawCompletion::completed(0);
        let ProtocolCompletion::Ata(completion) = reverse(Protocol::Ata, &raw, outcome(&raw), &command)
        else {
            panic!("ATA caller gets an ATA completion");
        };
        assert_eq!(completion.registers.status, 0x50);
    }

    #[test]
    fn ata_registers_travel_in_sense_to_ata_callers() {
        let regs = AtaRegisters::new(0x51, ata::error::ABRT);
        let sense = SenseData::with_ata_registers(key::ABORTED_COMMAND, &regs, false)
            .to_fixed()
            .to_vec();
        let raw = RawCompletion::native(
            NativeStatus::Scsi {
                status: scsi_status::CHECK_CONDITION,
                sense,
            },
            0,
        );
        let command = wire(WireRequest::Scsi(cdb::inquiry(36)), 36);
        let ProtocolCompletion::Ata(completion) = reverse(Protocol::Ata, &raw, outcome(&raw), &command)
        else {
            panic!("ATA caller gets an ATA completion");
        };
        assert_eq!(completion.registers.status, 0x51);
        assert_eq!(completion.registers.error, ata::error::ABRT);
    }

    #[test]
    fn satl_returns_registers_in_sense_when_asked() {
        let pass_through = AtaPassThrough {
            taskfile: TaskFile::check_power_mode(),
            protocol: AtaProtocol::NonData,
            check_condition: true,
            logical_sectors: false,
        };
        let mut command = wire(WireRequest::Ata(pass_through.taskfile), 0);
        command.reverse = ReverseMapping::ReturnRegisters;
        let mut regs = AtaRegisters::ready();
        regs.count = 0xFF;
        let raw = RawCompletion::native(NativeStatus::Ata(regs), 0);

        let ProtocolCompletion::Scsi(completion) = reverse(Protocol::Scsi, &raw, outcome(&raw), &command)
        else {
            panic!("SCSI caller gets a SCSI completion");
        };
        assert_eq!(completion.status, scsi_status::CHECK_CONDITION);
        assert!(completion.is_success());
        let sense = completion.sense_data().expect("fixed sense");
        assert_eq!(sense.key, key::RECOVERED_ERROR);
        assert_eq!((sense.asc, sense.ascq), ATA_PASSTHROUGH_INFO);
        assert_eq!(SenseData::ata_registers(&completion.sense), Some(regs));
    }

    #[test]
    fn satl_failure_carries_the_outcome_key() {
        let command = wire(WireRequest::Ata(TaskFile::read_dma_ext(0, 1)), 512);
        let regs = AtaRegisters::new(0x51, ata::error::UNC);
        let raw = RawCompletion::native(NativeStatus::Ata(regs), 512);
        let ProtocolCompletion::Scsi(completion) = reverse(Protocol::Scsi, &raw, outcome(&raw), &command)
        else {
            panic!("SCSI caller gets a SCSI completion");
        };
        assert!(!completion.is_success());
        assert_eq!(completion.transferred, 0);
        let sense = completion.sense_data().expect("descriptor sense");
        assert_eq!(sense.key, key::MEDIUM_ERROR);
        assert_eq!((sense.asc, sense.ascq), ATA_PASSTHROUGH_INFO);
    }

    #[test]
    fn wide_error_registers_keep_every_lba_bit() {
        let command = wire(WireRequest::Ata(TaskFile::read_dma_ext(0x0000_1234_5678_9ABC, 300)), 0);
        let mut regs = AtaRegisters::new(0x51, ata::error::UNC);
        regs.lba = 0x0000_1234_5678_9ABC;
        regs.count = 0x012C;
        let raw = RawCompletion::native(NativeStatus::Ata(regs), 0);
        let ProtocolCompletion::Scsi(completion) = reverse(Protocol::Scsi, &raw, outcome(&raw), &command)
        else {
            panic!("SCSI caller gets a SCSI completion");
        };
        assert_eq!(completion.sense[0], 0x72);
        assert_eq!(SenseData::ata_registers(&completion.sense), Some(regs));
    }

    #[test]
    fn plain_satl_success_is_good_status() {
        let command = wire(WireRequest::Ata(TaskFile::read_dma_ext(0, 1)), 512);
        let raw = RawCompletion::native(NativeStatus::Ata(AtaRegisters::ready()), 512);
        let completion = reverse(Protocol::Scsi, &raw, outcome(&raw), &command);
        assert_eq!(
            completion,
            ProtocolCompletion::Scsi(ScsiCompletion {
                status: scsi_status::GOOD,
                sense: Vec::new(),
                transferred: 512
            })
        );
    }

    #[test]
    fn nvme_status_passes_through_with_dword0() {
        let status = NvmeStatus::new(nvme::sct::GENERIC, nvme::generic::SUCCESS);
        let raw = RawCompletion::native(NativeStatus::Nvme { dword0: 0xABCD, status }, 0);
        let command = wire(WireRequest::Nvme(NvmeCommand::flush(1)), 0);
        let completion = reverse(Protocol::Nvme, &raw, outcome(&raw), &command);
        assert_eq!(
            completion,
            ProtocolCompletion::Nvme(NvmeCompletion {
                dword0: 0xABCD,
                status,
                transferred: 0
            })
        );
    }

    #[test]
    fn foreign_status_is_mapped_through_the_tables() {
        let sense = SenseData::new(key::ILLEGAL_REQUEST, 0x21, 0).to_fixed().to_vec();
        let raw = RawCompletion::native(
            NativeStatus::Scsi {
                status: scsi_status::CHECK_CONDITION,
                sense,
            },
            0,
        );
        let command = wire(WireRequest::Scsi(cdb::read_16(u64::MAX - 1, 1)), 512);
        let completion = reverse(Protocol::Nvme, &raw, outcome(&raw), &command);
        let ProtocolCompletion::Nvme(completion) = completion else {
            panic!("NVMe caller gets an NVMe completion");
        };
        assert_eq!(completion.dword0, 0);
        assert_eq!(completion.status.sc, nvme::generic::LBA_OUT_OF_RANGE);
    }
}
