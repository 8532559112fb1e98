//! The allow-listed cross-protocol mappings.
//!
//! A rule only says "this opcode (and sub-opcode) may be carried over that
//! wire protocol, like so". Anything without a rule is refused rather than
//! guessed at.

use super::TranslateEnv;
use crate::ata::opcode::*;
use crate::ata::{TaskFile, smart};
use crate::context::{CommandContext, DataDirection, Protocol, ProtocolCommand};
use crate::nvme::{self, DsmRange, NvmeCommand};
use crate::scsi::command::{
    self as cdb, AtaPassThrough, AtaProtocol, BlockAccess, UnmapDescriptor, UnmapList,
};
use crate::scsi::{CommandBlock, OpCode};
use crate::transport::{
    BlockOp, BlockRequest, ReverseMapping, WireCommand, WireProtocol, WireRequest,
};

/// Builds the wire command, or says why this particular command can't be.
pub type ForwardFn = fn(&CommandContext<'_>, &TranslateEnv) -> Result<WireCommand, &'static str>;

#[derive(Debug, Clone, Copy)]
pub struct TranslationRule {
    pub name: &'static str,
    pub source: Protocol,
    pub wire: WireProtocol,
    pub opcode: u8,
    /// Accepted sub-opcodes; `None` accepts any.
    pub sub_opcodes: Option<&'static [u16]>,
    pub forward: ForwardFn,
    /// Default completion mapping; a forward function may ask for register
    /// return on its own.
    pub reverse: ReverseMapping,
}

impl TranslationRule {
    pub fn matches(&self, source: Protocol, wire: WireProtocol, opcode: u8, sub_opcode: u16) -> bool {
        self.source == source
            && self.wire == wire
            && self.opcode == opcode
            && self.sub_opcodes.is_none_or(|subs| subs.contains(&sub_opcode))
    }
}

const fn rule(
    name: &'static str,
    source: Protocol,
    wire: WireProtocol,
    opcode: u8,
    sub_opcodes: Option<&'static [u16]>,
    forward: ForwardFn,
) -> TranslationRule {
    TranslationRule {
        name,
        source,
        wire,
        opcode,
        sub_opcodes,
        forward,
        reverse: ReverseMapping::Status,
    }
}

const SMART_SUBCOMMANDS: &[u16] = &[
    smart::READ_DATA,
    smart::READ_THRESHOLDS,
    smart::READ_LOG,
    smart::RETURN_STATUS,
    smart::ENABLE_OPERATIONS,
    smart::DISABLE_OPERATIONS,
];
/// Download with offsets (03h), full download (07h), deferred download
/// (0Eh) and activate (0Fh).
const MICROCODE_MODES: &[u16] = &[0x03, 0x07, 0x0E, 0x0F];
const DSM_TRIM: &[u16] = &[0x01];
/// Any attribute combination with the deallocate bit set.
const DSM_DEALLOCATE: &[u16] = &[0x4, 0x5, 0x6, 0x7];

use Protocol::{Ata, Nvme, Scsi};

pub static STANDARD: &[TranslationRule] = &[
    // ATA over a SCSI/ATA translation layer
    rule("ata-identify-sat", Ata, WireProtocol::Scsi, IDENTIFY_DEVICE, None, ata_to_sat),
    rule("ata-identify-packet-sat", Ata, WireProtocol::Scsi, IDENTIFY_PACKET_DEVICE, None, ata_to_sat),
    rule("ata-smart-sat", Ata, WireProtocol::Scsi, SMART, Some(SMART_SUBCOMMANDS), ata_to_sat),
    rule("ata-read-log-ext-sat", Ata, WireProtocol::Scsi, READ_LOG_EXT, None, ata_to_sat),
    rule("ata-read-sectors-sat", Ata, WireProtocol::Scsi, READ_SECTORS, None, ata_to_sat),
    rule("ata-read-sectors-ext-sat", Ata, WireProtocol::Scsi, READ_SECTORS_EXT, None, ata_to_sat),
    rule("ata-write-sectors-sat", Ata, WireProtocol::Scsi, WRITE_SECTORS, None, ata_to_sat),
    rule("ata-write-sectors-ext-sat", Ata, WireProtocol::Scsi, WRITE_SECTORS_EXT, None, ata_to_sat),
    rule("ata-read-dma-sat", Ata, WireProtocol::Scsi, READ_DMA, None, ata_to_sat),
    rule("ata-read-dma-ext-sat", Ata, WireProtocol::Scsi, READ_DMA_EXT, None, ata_to_sat),
    rule("ata-write-dma-sat", Ata, WireProtocol::Scsi, WRITE_DMA, None, ata_to_sat),
    rule("ata-write-dma-ext-sat", Ata, WireProtocol::Scsi, WRITE_DMA_EXT, None, ata_to_sat),
    rule("ata-flush-sat", Ata, WireProtocol::Scsi, FLUSH_CACHE, None, ata_to_sat),
    rule("ata-flush-ext-sat", Ata, WireProtocol::Scsi, FLUSH_CACHE_EXT, None, ata_to_sat),
    rule("ata-check-power-mode-sat", Ata, WireProtocol::Scsi, CHECK_POWER_MODE, None, ata_to_sat),
    rule("ata-download-microcode-sat", Ata, WireProtocol::Scsi, DOWNLOAD_MICROCODE, Some(MICROCODE_MODES), ata_to_sat),
    rule("ata-trim-sat", Ata, WireProtocol::Scsi, DATA_SET_MANAGEMENT, Some(DSM_TRIM), ata_to_sat),
    // ATA onto plain block I/O
    rule("ata-read-sectors-block", Ata, WireProtocol::Block, READ_SECTORS, None, ata_to_block),
    rule("ata-read-sectors-ext-block", Ata, WireProtocol::Block, READ_SECTORS_EXT, None, ata_to_block),
    rule("ata-write-sectors-block", Ata, WireProtocol::Block, WRITE_SECTORS, None, ata_to_block),
    rule("ata-write-sectors-ext-block", Ata, WireProtocol::Block, WRITE_SECTORS_EXT, None, ata_to_block),
    rule("ata-read-dma-block", Ata, WireProtocol::Block, READ_DMA, None, ata_to_block),
    rule("ata-read-dma-ext-block", Ata, WireProtocol::Block, READ_DMA_EXT, None, ata_to_block),
    rule("ata-write-dma-block", Ata, WireProtocol::Block, WRITE_DMA, None, ata_to_block),
    rule("ata-write-dma-ext-block", Ata, WireProtocol::Block, WRITE_DMA_EXT, None, ata_to_block),
    rule("ata-flush-block", Ata, WireProtocol::Block, FLUSH_CACHE, None, ata_to_block),
    rule("ata-flush-ext-block", Ata, WireProtocol::Block, FLUSH_CACHE_EXT, None, ata_to_block),
    // SCSI onto an ATA device
    rule("scsi-ata-pass-through-12", Scsi, WireProtocol::Ata, OpCode::AtaPassThrough12 as u8, None, scsi_pass_through_to_ata),
    rule("scsi-ata-pass-through-16", Scsi, WireProtocol::Ata, OpCode::AtaPassThrough16 as u8, None, scsi_pass_through_to_ata),
    rule("scsi-read-10-ata", Scsi, WireProtocol::Ata, OpCode::Read10 as u8, None, scsi_rw_to_ata),
    rule("scsi-read-16-ata", Scsi, WireProtocol::Ata, OpCode::Read16 as u8, None, scsi_rw_to_ata),
    rule("scsi-write-10-ata", Scsi, WireProtocol::Ata, OpCode::Write10 as u8, None, scsi_rw_to_ata),
    rule("scsi-write-16-ata", Scsi, WireProtocol::Ata, OpCode::Write16 as u8, None, scsi_rw_to_ata),
    rule("scsi-sync-cache-10-ata", Scsi, WireProtocol::Ata, OpCode::SynchronizeCache10 as u8, None, scsi_flush_to_ata),
    rule("scsi-sync-cache-16-ata", Scsi, WireProtocol::Ata, OpCode::SynchronizeCache16 as u8, None, scsi_flush_to_ata),
    rule("scsi-test-unit-ready-ata", Scsi, WireProtocol::Ata, OpCode::TestUnitReady as u8, None, scsi_tur_to_ata),
    // SCSI onto an NVMe device
    rule("scsi-read-10-nvme", Scsi, WireProtocol::Nvme, OpCode::Read10 as u8, None, scsi_rw_to_nvme),
    rule("scsi-read-16-nvme", Scsi, WireProtocol::Nvme, OpCode::Read16 as u8, None, scsi_rw_to_nvme),
    rule("scsi-write-10-nvme", Scsi, WireProtocol::Nvme, OpCode::Write10 as u8, None, scsi_rw_to_nvme),
    rule("scsi-write-16-nvme", Scsi, WireProtocol::Nvme, OpCode::Write16 as u8, None, scsi_rw_to_nvme),
    rule("scsi-sync-cache-10-nvme", Scsi, WireProtocol::Nvme, OpCode::SynchronizeCache10 as u8, None, scsi_flush_to_nvme),
    rule("scsi-sync-cache-16-nvme", Scsi, WireProtocol::Nvme, OpCode::SynchronizeCache16 as u8, None, scsi_flush_to_nvme),
    rule("scsi-unmap-nvme", Scsi, WireProtocol::Nvme, OpCode::Unmap as u8, None, scsi_unmap_to_nvme),
    // SCSI onto plain block I/O
    rule("scsi-read-10-block", Scsi, WireProtocol::Block, OpCode::Read10 as u8, None, scsi_to_block),
    rule("scsi-read-16-block", Scsi, WireProtocol::Block, OpCode::Read16 as u8, None, scsi_to_block),
    rule("scsi-write-10-block", Scsi, WireProtocol::Block, OpCode::Write10 as u8, None, scsi_to_block),
    rule("scsi-write-16-block", Scsi, WireProtocol::Block, OpCode::Write16 as u8, None, scsi_to_block),
    rule("scsi-sync-cache-10-block", Scsi, WireProtocol::Block, OpCode::SynchronizeCache10 as u8, None, scsi_to_block),
    rule("scsi-sync-cache-16-block", Scsi, WireProtocol::Block, OpCode::SynchronizeCache16 as u8, None, scsi_to_block),
    // NVMe over a SCSI/NVMe translation layer
    rule("nvme-read-sntl", Nvme, WireProtocol::Scsi, nvme::io::READ, None, nvme_rw_to_scsi),
    rule("nvme-write-sntl", Nvme, WireProtocol::Scsi, nvme::io::WRITE, None, nvme_rw_to_scsi),
    rule("nvme-flush-sntl", Nvme, WireProtocol::Scsi, nvme::io::FLUSH, None, nvme_flush_to_scsi),
    rule("nvme-deallocate-unmap", Nvme, WireProtocol::Scsi, nvme::io::DATASET_MANAGEMENT, Some(DSM_DEALLOCATE), nvme_deallocate_to_unmap),
    // NVMe onto plain block I/O
    rule("nvme-read-block", Nvme, WireProtocol::Block, nvme::io::READ, None, nvme_to_block),
    rule("nvme-write-block", Nvme, WireProtocol::Block, nvme::io::WRITE, None, nvme_to_block),
    rule("nvme-flush-block", Nvme, WireProtocol::Block, nvme::io::FLUSH, None, nvme_to_block),
];

fn ata_taskfile<'c>(ctx: &'c CommandContext<'_>) -> Result<&'c TaskFile, &'static str> {
    match ctx.command() {
        ProtocolCommand::Ata(tf) => Ok(tf),
        _ => Err("not an ATA command"),
    }
}

fn scsi_cdb<'c>(ctx: &'c CommandContext<'_>) -> Result<&'c CommandBlock, &'static str> {
    match ctx.command() {
        ProtocolCommand::Scsi(cdb) => Ok(cdb),
        _ => Err("not a SCSI command"),
    }
}

/// NVM command set commands only; admin opcodes overlap the I/O ones.
fn nvme_io_command<'c>(ctx: &'c CommandContext<'_>) -> Result<&'c NvmeCommand, &'static str> {
    match ctx.command() {
        ProtocolCommand::Nvme(cmd) if !cmd.admin => Ok(cmd),
        ProtocolCommand::Nvme(_) => Err("admin commands are not translated"),
        _ => Err("not an NVMe command"),
    }
}

fn is_ata_write(command: u8) -> bool {
    matches!(
        command,
        WRITE_SECTORS
            | WRITE_SECTORS_EXT
            | WRITE_DMA
            | WRITE_DMA_EXT
            | DOWNLOAD_MICROCODE
            | DATA_SET_MANAGEMENT
    )
}

fn is_ata_dma(command: u8) -> bool {
    matches!(
        command,
        READ_DMA | READ_DMA_EXT | WRITE_DMA | WRITE_DMA_EXT | DATA_SET_MANAGEMENT
    )
}

/// Reads and writes count logical sectors; everything else counts 512-byte
/// blocks whatever the medium's sector size.
fn counts_logical_sectors(command: u8) -> bool {
    matches!(
        command,
        READ_SECTORS | READ_SECTORS_EXT | WRITE_SECTORS | WRITE_SECTORS_EXT | READ_DMA
            | READ_DMA_EXT | WRITE_DMA | WRITE_DMA_EXT
    )
}

/// Bytes moved by an allow-listed ATA command.
fn ata_transfer_len(tf: &TaskFile, block_size: u32) -> usize {
    let sectors = tf.sectors() as usize;
    match tf.command {
        command if counts_logical_sectors(command) => sectors * block_size as usize,
        IDENTIFY_DEVICE | IDENTIFY_PACKET_DEVICE => 512,
        SMART => match tf.feature & 0xFF {
            smart::READ_DATA | smart::READ_THRESHOLDS => 512,
            smart::READ_LOG => usize::from(tf.count & 0xFF) * 512,
            _ => 0,
        },
        READ_LOG_EXT | DATA_SET_MANAGEMENT => sectors * 512,
        // Block count is split across COUNT (7:0) and LBA (7:0).
        DOWNLOAD_MICROCODE => match tf.feature & 0xFF {
            0x03 | 0x07 | 0x0E => {
                (usize::from(tf.count & 0xFF) | ((tf.lba as usize & 0xFF) << 8)) * 512
            }
            _ => 0,
        },
        _ => 0,
    }
}

fn ata_direction(tf: &TaskFile, transfer_len: usize) -> DataDirection {
    if transfer_len == 0 {
        DataDirection::None
    } else if is_ata_write(tf.command) {
        DataDirection::Out
    } else {
        DataDirection::In
    }
}

/// Wraps the task file in ATA PASS-THROUGH (16). Non-data commands set
/// CK_COND so their output registers come back in sense.
fn ata_to_sat(ctx: &CommandContext<'_>, env: &TranslateEnv) -> Result<WireCommand, &'static str> {
    let tf = ata_taskfile(ctx)?;
    let len = ata_transfer_len(tf, env.block_size);
    let direction = ata_direction(tf, len);
    let protocol = match direction {
        DataDirection::None => AtaProtocol::NonData,
        _ if is_ata_dma(tf.command) => AtaProtocol::Dma,
        DataDirection::Out => AtaProtocol::PioOut,
        _ => AtaProtocol::PioIn,
    };
    let pass_through = AtaPassThrough {
        taskfile: *tf,
        protocol,
        check_condition: protocol == AtaProtocol::NonData,
        logical_sectors: env.block_size != 512 && counts_logical_sectors(tf.command),
    };
    Ok(WireCommand::new(
        WireRequest::Scsi(pass_through.to_command_block()),
        direction,
        len,
    ))
}

fn block_flush() -> WireCommand {
    WireCommand::new(
        WireRequest::Block(BlockRequest {
            op: BlockOp::Flush,
            offset: 0,
            length: 0,
        }),
        DataDirection::None,
        0,
    )
}

fn block_access(op: BlockOp, lba: u64, blocks: u64, block_size: u32) -> Result<WireCommand, &'static str> {
    let block_size = u64::from(block_size);
    let offset = lba.checked_mul(block_size).ok_or("byte offset overflows")?;
    let length = blocks.checked_mul(block_size).ok_or("byte length overflows")?;
    let transfer_len = usize::try_from(length).map_err(|_| "byte length overflows")?;
    let direction = if op == BlockOp::Write {
        DataDirection::Out
    } else {
        DataDirection::In
    };
    Ok(WireCommand::new(
        WireRequest::Block(BlockRequest { op, offset, length }),
        direction,
        transfer_len,
    ))
}

fn ata_to_block(ctx: &CommandContext<'_>, env: &TranslateEnv) -> Result<WireCommand, &'static str> {
    let tf = ata_taskfile(ctx)?;
    let op = match tf.command {
        FLUSH_CACHE | FLUSH_CACHE_EXT => return Ok(block_flush()),
        READ_SECTORS | READ_SECTORS_EXT | READ_DMA | READ_DMA_EXT => BlockOp::Read,
        WRITE_SECTORS | WRITE_SECTORS_EXT | WRITE_DMA | WRITE_DMA_EXT => BlockOp::Write,
        _ => return Err("not a block access command"),
    };
    let lba = if tf.extended {
        tf.lba
    } else {
        tf.lba & 0x0FFF_FFFF
    };
    block_access(op, lba, u64::from(tf.sectors()), env.block_size)
}

fn scsi_pass_through_to_ata(
    ctx: &CommandContext<'_>,
    _env: &TranslateEnv,
) -> Result<WireCommand, &'static str> {
    let pass_through = AtaPassThrough::parse(scsi_cdb(ctx)?).ok_or("malformed ATA PASS-THROUGH")?;
    if matches!(
        pass_through.protocol,
        AtaProtocol::HardReset | AtaProtocol::SoftReset
    ) {
        return Err("reset protocols are not carried");
    }
    let direction = if pass_through.protocol == AtaProtocol::NonData {
        DataDirection::None
    } else {
        ctx.direction()
    };
    let len = if direction == DataDirection::None {
        0
    } else {
        ctx.data().len()
    };
    let mut command = WireCommand::new(WireRequest::Ata(pass_through.taskfile), direction, len);
    if pass_through.check_condition {
        command.reverse = ReverseMapping::ReturnRegisters;
    }
    Ok(command)
}

fn parse_access(ctx: &CommandContext<'_>) -> Result<BlockAccess, &'static str> {
    BlockAccess::parse(scsi_cdb(ctx)?).ok_or("malformed READ/WRITE")
}

fn rw_direction(write: bool) -> DataDirection {
    if write {
        DataDirection::Out
    } else {
        DataDirection::In
    }
}

/// READ/WRITE become READ/WRITE DMA EXT; a block count of 65536 is encoded
/// as a zero COUNT.
fn scsi_rw_to_ata(ctx: &CommandContext<'_>, env: &TranslateEnv) -> Result<WireCommand, &'static str> {
    let access = parse_access(ctx)?;
    if access.blocks == 0 {
        return Err("zero-length transfer has no ATA equivalent");
    }
    if access.blocks > 65536 {
        return Err("transfer exceeds one ATA command");
    }
    if access.lba.saturating_add(u64::from(access.blocks)) > 1 << 48 {
        return Err("LBA beyond 48-bit addressing");
    }
    let count = (access.blocks % 65536) as u16;
    let tf = if access.write {
        TaskFile::write_dma_ext(access.lba, count)
    } else {
        TaskFile::read_dma_ext(access.lba, count)
    };
    let len = access.blocks as usize * env.block_size as usize;
    Ok(WireCommand::new(WireRequest::Ata(tf), rw_direction(access.write), len))
}

fn scsi_flush_to_ata(_ctx: &CommandContext<'_>, _env: &TranslateEnv) -> Result<WireCommand, &'static str> {
    Ok(WireCommand::new(
        WireRequest::Ata(TaskFile::flush_cache_ext()),
        DataDirection::None,
        0,
    ))
}

/// TEST UNIT READY is answered by CHECK POWER MODE.
fn scsi_tur_to_ata(_ctx: &CommandContext<'_>, _env: &TranslateEnv) -> Result<WireCommand, &'static str> {
    Ok(WireCommand::new(
        WireRequest::Ata(TaskFile::check_power_mode()),
        DataDirection::None,
        0,
    ))
}

fn scsi_rw_to_nvme(ctx: &CommandContext<'_>, env: &TranslateEnv) -> Result<WireCommand, &'static str> {
    let access = parse_access(ctx)?;
    if access.blocks == 0 {
        return Err("zero-length transfer has no NVMe equivalent");
    }
    let blocks = u16::try_from(access.blocks).map_err(|_| "transfer exceeds one NVMe command")?;
    let command = if access.write {
        NvmeCommand::write(env.nsid, access.lba, blocks)
    } else {
        NvmeCommand::read(env.nsid, access.lba, blocks)
    };
    let len = usize::from(blocks) * env.block_size as usize;
    Ok(WireCommand::new(
        WireRequest::Nvme(command),
        rw_direction(access.write),
        len,
    ))
}

fn scsi_flush_to_nvme(_ctx: &CommandContext<'_>, env: &TranslateEnv) -> Result<WireCommand, &'static str> {
    Ok(WireCommand::new(
        WireRequest::Nvme(NvmeCommand::flush(env.nsid)),
        DataDirection::None,
        0,
    ))
}

/// Each UNMAP block descriptor becomes one deallocate range.
fn scsi_unmap_to_nvme(ctx: &CommandContext<'_>, env: &TranslateEnv) -> Result<WireCommand, &'static str> {
    let parameters = ctx
        .data()
        .outgoing()
        .ok_or("UNMAP without a parameter list")?;
    let list = UnmapList::parse(parameters).map_err(|_| "malformed UNMAP parameter list")?;
    if list.descriptors.is_empty() {
        return Err("UNMAP with no block descriptors");
    }
    let ranges = u8::try_from(list.descriptors.len())
        .map_err(|_| "too many block descriptors for one Dataset Management command")?;
    let bytes = list
        .descriptors
        .iter()
        .flat_map(|d| DsmRange::new(d.lba, d.blocks).to_bytes())
        .collect();
    Ok(WireCommand::generated(
        WireRequest::Nvme(NvmeCommand::dataset_management(
            env.nsid,
            ranges,
            nvme::DSM_DEALLOCATE,
        )),
        bytes,
    ))
}

fn scsi_to_block(ctx: &CommandContext<'_>, env: &TranslateEnv) -> Result<WireCommand, &'static str> {
    let cdb = scsi_cdb(ctx)?;
    if cdb.opcode() == OpCode::SynchronizeCache10 as u8
        || cdb.opcode() == OpCode::SynchronizeCache16 as u8
    {
        return Ok(block_flush());
    }
    let access = parse_access(ctx)?;
    let op = if access.write {
        BlockOp::Write
    } else {
        BlockOp::Read
    };
    block_access(op, access.lba, u64::from(access.blocks), env.block_size)
}

/// Picks the 10-byte CDB when LBA and length fit, the 16-byte one otherwise.
fn nvme_rw_to_scsi(ctx: &CommandContext<'_>, env: &TranslateEnv) -> Result<WireCommand, &'static str> {
    let command = nvme_io_command(ctx)?;
    let write = command.opcode == nvme::io::WRITE;
    let lba = command.slba();
    let blocks = command.blocks();
    let cdb = match (u32::try_from(lba), u16::try_from(blocks)) {
        (Ok(lba), Ok(blocks)) if write => cdb::write_10(lba, blocks),
        (Ok(lba), Ok(blocks)) => cdb::read_10(lba, blocks),
        _ if write => cdb::write_16(lba, blocks),
        _ => cdb::read_16(lba, blocks),
    };
    let len = blocks as usize * env.block_size as usize;
    Ok(WireCommand::new(WireRequest::Scsi(cdb), rw_direction(write), len))
}

fn nvme_flush_to_scsi(ctx: &CommandContext<'_>, _env: &TranslateEnv) -> Result<WireCommand, &'static str> {
    nvme_io_command(ctx)?;
    Ok(WireCommand::new(
        WireRequest::Scsi(cdb::synchronize_cache_10()),
        DataDirection::None,
        0,
    ))
}

/// Dataset Management ranges become UNMAP block descriptors one for one.
fn nvme_deallocate_to_unmap(
    ctx: &CommandContext<'_>,
    _env: &TranslateEnv,
) -> Result<WireCommand, &'static str> {
    let command = nvme_io_command(ctx)?;
    let data = ctx
        .data()
        .outgoing()
        .ok_or("Dataset Management without a range list")?;
    let ranges = DsmRange::parse_list(data, command.dsm_ranges())
        .map_err(|_| "range list shorter than its range count")?;
    let list = UnmapList {
        descriptors: ranges
            .iter()
            .map(|r| UnmapDescriptor {
                lba: r.slba,
                blocks: r.blocks,
            })
            .collect(),
    };
    let bytes = list.to_bytes();
    let parameter_len = u16::try_from(bytes.len()).map_err(|_| "UNMAP parameter list too long")?;
    Ok(WireCommand::generated(
        WireRequest::Scsi(cdb::unmap(parameter_len)),
        bytes,
    ))
}

fn nvme_to_block(ctx: &CommandContext<'_>, env: &TranslateEnv) -> Result<WireCommand, &'static str> {
    let command = nvme_io_command(ctx)?;
    let op = match command.opcode {
        nvme::io::FLUSH => return Ok(block_flush()),
        nvme::io::WRITE => BlockOp::Write,
        _ => BlockOp::Read,
    };
    block_access(op, command.slba(), u64::from(command.blocks()), env.block_size)
}
