//! Capability probe: works out what a freshly opened device is and which
//! dialects reach it.
//!
//! Bus metadata is trusted only where the bus can host a single protocol
//! family. Everywhere else identify-class trial commands decide, and a device
//! nothing can be learned about gets the conservative profile.

use tracing::{debug, info, warn};

use std::time::Duration;

use crate::ata::{AtaRegisters, IdentifyData, TaskFile, smart};
use crate::config::{DispatchConfig, ProbeConfig};
use crate::context::{CommandContext, DataBuffer, ProtocolCompletion};
use crate::dispatch::Dispatcher;
use crate::error::ClassificationError;
use crate::io::{BusInfo, BusType, Clock, DeviceIo, Handle};
use crate::nvme::{self, NvmeCommand};
use crate::profile::{DeviceFeatures, DeviceProfile, ProtocolFamily};
use crate::scsi::command as cdb;
use crate::scsi::response::{
    inquiry_response, read_capacity_10_response, read_capacity_16_response, supported_opcode_response,
};
use crate::scsi::OpCode;
use crate::translate::TranslationTable;

const IDENTIFY_LEN: usize = 512;
const INQUIRY_LEN: u8 = 36;
const READ_CAPACITY_16_LEN: u32 = 32;
const LOG_PAGE_LEN: u32 = 512;

/// Family suggested by the bus type alone, where it can be trusted.
fn trusted_family(bus: BusType) -> Option<ProtocolFamily> {
    match bus {
        BusType::Ata | BusType::Sata => Some(ProtocolFamily::Ata),
        BusType::Atapi => Some(ProtocolFamily::Atapi),
        BusType::Nvme => Some(ProtocolFamily::Nvme),
        _ => None,
    }
}

/// Issues probe commands against one candidate profile.
struct Prober<'a> {
    io: &'a dyn DeviceIo,
    handle: Handle,
    table: &'a TranslationTable,
    clock: &'a dyn Clock,
    config: DispatchConfig,
    timeout: Duration,
}

impl Prober<'_> {
    /// Runs one command; `None` when no dialect could carry it.
    fn run(&self, profile: &DeviceProfile, ctx: CommandContext<'_>) -> Option<ProtocolCompletion> {
        let mut ctx = ctx.with_timeout(self.timeout);
        let dispatcher = Dispatcher {
            io: self.io,
            handle: self.handle,
            profile,
            table: self.table,
            config: &self.config,
            clock: self.clock,
        };
        match dispatcher.execute(&mut ctx) {
            Ok(completion) => Some(completion),
            Err(e) => {
                debug!(error = %e, "probe command not carried");
                None
            }
        }
    }

    /// NVMe IDENTIFY CONTROLLER with a non-zero PCI vendor id.
    fn nvme_identify(&self, profile: &DeviceProfile) -> bool {
        let mut buf = vec![0u8; nvme::IDENTIFY_LEN];
        let ctx = CommandContext::nvme(NvmeCommand::identify_controller(), DataBuffer::In(&mut buf));
        let ok = self.run(profile, ctx).is_some_and(|c| c.is_success());
        ok && u16::from_le_bytes([buf[0], buf[1]]) != 0
    }

    /// ATA IDENTIFY DEVICE. Returns the page on success and the registers of
    /// a failed attempt.
    fn ata_identify(&self, profile: &DeviceProfile) -> Result<Vec<u8>, Option<AtaRegisters>> {
        let mut buf = vec![0u8; IDENTIFY_LEN];
        let ctx = CommandContext::ata(TaskFile::identify_device(), DataBuffer::In(&mut buf));
        match self.run(profile, ctx) {
            Some(ProtocolCompletion::Ata(c)) if c.is_success() => Ok(buf),
            Some(ProtocolCompletion::Ata(c)) => Err(Some(c.registers)),
            _ => Err(None),
        }
    }

    /// INQUIRY with peripheral qualifier 0.
    fn inquiry(&self, profile: &DeviceProfile) -> bool {
        let mut buf = vec![0u8; usize::from(INQUIRY_LEN)];
        let ctx = CommandContext::scsi(cdb::inquiry(INQUIRY_LEN), DataBuffer::In(&mut buf));
        if !self.run(profile, ctx).is_some_and(|c| c.is_success()) {
            return false;
        }
        match inquiry_response(&buf) {
            Ok(inquiry) => {
                debug!(vendor = %inquiry.vendor, product = %inquiry.product, "INQUIRY answered");
                inquiry.is_connected()
            }
            Err(e) => {
                debug!(error = %e, "malformed INQUIRY data");
                false
            }
        }
    }

    /// Block size of the formatted LBA format of the default namespace.
    fn nvme_block_size(&self, profile: &DeviceProfile) -> Option<u32> {
        let mut buf = vec![0u8; nvme::IDENTIFY_LEN];
        let ctx = CommandContext::nvme(
            NvmeCommand::identify_namespace(nvme::DEFAULT_NSID),
            DataBuffer::In(&mut buf),
        );
        if !self.succeeds(profile, ctx) {
            return None;
        }
        nvme::namespace_block_size(&buf)
            .map_err(|e| debug!(error = %e, "unusable IDENTIFY NAMESPACE data"))
            .ok()
    }

    fn read_capacity_10(&self, profile: &DeviceProfile) -> Option<u32> {
        let mut buf = [0u8; 8];
        let ctx = CommandContext::scsi(cdb::read_capacity_10(), DataBuffer::In(&mut buf));
        if !self.succeeds(profile, ctx) {
            return None;
        }
        read_capacity_10_response(&buf)
            .map(|capacity| capacity.block_length)
            .map_err(|e| debug!(error = %e, "unusable READ CAPACITY (10) data"))
            .ok()
    }

    fn read_capacity_16(&self, profile: &DeviceProfile) -> Option<u32> {
        let mut buf = [0u8; READ_CAPACITY_16_LEN as usize];
        let ctx = CommandContext::scsi(
            cdb::read_capacity_16(READ_CAPACITY_16_LEN),
            DataBuffer::In(&mut buf),
        );
        if !self.succeeds(profile, ctx) {
            return None;
        }
        read_capacity_16_response(&buf)
            .map(|capacity| capacity.block_length)
            .map_err(|e| debug!(error = %e, "unusable READ CAPACITY (16) data"))
            .ok()
    }

    fn succeeds(&self, profile: &DeviceProfile, ctx: CommandContext<'_>) -> bool {
        self.run(profile, ctx).is_some_and(|c| c.is_success())
    }
}

/// Builds the profile for an opened device.
#[tracing::instrument(skip(io, table, config, clock))]
pub fn classify(
    io: &dyn DeviceIo,
    handle: Handle,
    table: &TranslationTable,
    config: &ProbeConfig,
    clock: &dyn Clock,
) -> Result<DeviceProfile, ClassificationError> {
    let bus = io.query_bus_info(handle).map_err(ClassificationError::Metadata)?;
    debug!(bus_type = ?bus.bus_type, adapter = ?bus.adapter, "bus metadata");

    let prober = Prober {
        io,
        handle,
        table,
        clock,
        config: DispatchConfig {
            retry_on_timeout: false,
            negative_cache: true,
            ..DispatchConfig::default()
        },
        timeout: config.trial_timeout(),
    };

    // The ATA IDENTIFY page, once some step has read it.
    let (mut profile, mut identify) = match trusted_family(bus.bus_type) {
        Some(family) => (DeviceProfile::new(family, &bus, false), None),
        None if config.trials => run_trials(&prober, &bus).unwrap_or_else(|| {
            warn!(bus_type = ?bus.bus_type, "trials inconclusive, using the conservative profile");
            (DeviceProfile::conservative(&bus), None)
        }),
        None => (DeviceProfile::conservative(&bus), None),
    };

    if profile.transports().is_empty() && !profile.is_conservative() {
        return Err(ClassificationError::NoDialect {
            family: profile.family(),
            bus: bus.bus_type,
        });
    }

    if !profile.is_conservative() {
        if profile.family() == ProtocolFamily::Ata && identify.is_none() {
            identify = prober.ata_identify(&profile).ok();
        }
        let identify = identify.as_deref().and_then(|page| {
            IdentifyData::parse(page)
                .map_err(|e| debug!(error = %e, "unusable IDENTIFY DEVICE data"))
                .ok()
        });
        discover_block_size(&prober, &mut profile, identify.as_ref());
        if config.capability_queries {
            query_capabilities(&prober, &mut profile, identify.as_ref());
        }
    }
    if profile.adapter().reset && profile.primary().is_some_and(|d| d.can_reset) {
        profile.insert_features(DeviceFeatures::RESET);
    }

    info!(
        family = ?profile.family(),
        conservative = profile.is_conservative(),
        block_size = profile.block_size(),
        features = ?profile.features(),
        dialects = ?profile.transports().iter().map(|d| d.dialect).collect::<Vec<_>>(),
        "probe finished"
    );
    Ok(profile)
}

/// Identify-class trials in order: NVMe, ATA, SCSI. An ATA match comes back
/// with its IDENTIFY page.
fn run_trials(prober: &Prober<'_>, bus: &BusInfo) -> Option<(DeviceProfile, Option<Vec<u8>>)> {
    let nvme = DeviceProfile::new(ProtocolFamily::Nvme, bus, false);
    if !nvme.transports().is_empty() && prober.nvme_identify(&nvme) {
        debug!("NVMe identify answered");
        return Some((nvme, None));
    }

    let ata = DeviceProfile::new(ProtocolFamily::Ata, bus, false);
    if !ata.transports().is_empty() {
        match prober.ata_identify(&ata) {
            Ok(page) if IdentifyData::parse(&page).is_ok() => {
                debug!("ATA identify answered");
                return Some((ata, Some(page)));
            }
            Err(Some(registers)) if registers.has_packet_signature() => {
                debug!("ATA identify aborted with the packet signature");
                return Some((DeviceProfile::new(ProtocolFamily::Atapi, bus, false), None));
            }
            _ => {}
        }
    }

    let scsi = DeviceProfile::new(ProtocolFamily::Scsi, bus, false);
    if !scsi.transports().is_empty() && prober.inquiry(&scsi) {
        debug!("INQUIRY answered");
        return Some((scsi, None));
    }
    None
}

fn discover_block_size(prober: &Prober<'_>, profile: &mut DeviceProfile, identify: Option<&IdentifyData<'_>>) {
    let found = match profile.family() {
        ProtocolFamily::Ata => identify.map(|id| id.logical_sector_size()),
        ProtocolFamily::Atapi | ProtocolFamily::Scsi => prober.read_capacity_10(profile),
        // IDENTIFY NAMESPACE needs an NVMe path; a device only reached
        // through SCSI still answers READ CAPACITY.
        ProtocolFamily::Nvme => prober
            .nvme_block_size(profile)
            .or_else(|| prober.read_capacity_16(profile)),
    };
    match found {
        Some(block_size) => profile.set_block_size(block_size),
        None => debug!(block_size = profile.block_size(), "block size not reported, keeping the default"),
    }
}

fn query_capabilities(prober: &Prober<'_>, profile: &mut DeviceProfile, identify: Option<&IdentifyData<'_>>) {
    let mut features = DeviceFeatures::empty();
    match profile.family() {
        ProtocolFamily::Ata => {
            let ctx = CommandContext::ata(TaskFile::smart(smart::RETURN_STATUS), DataBuffer::None);
            if prober.succeeds(profile, ctx) {
                features |= DeviceFeatures::SMART;
            }
            if identify.is_some_and(|id| id.supports_download_microcode()) {
                features |= DeviceFeatures::FIRMWARE_DOWNLOAD;
            }
        }
        ProtocolFamily::Atapi | ProtocolFamily::Scsi => {
            let mut buf = [0u8; 64];
            let ctx = CommandContext::scsi(cdb::log_sense(0x00, 64), DataBuffer::In(&mut buf));
            if prober.succeeds(profile, ctx) {
                features |= DeviceFeatures::SMART;
            }
            let mut buf = [0u8; 20];
            let ctx = CommandContext::scsi(
                cdb::report_supported_operation_code(OpCode::WriteBuffer as u8, 20),
                DataBuffer::In(&mut buf),
            );
            if prober.succeeds(profile, ctx) && supported_opcode_response(&buf).unwrap_or(false) {
                features |= DeviceFeatures::FIRMWARE_DOWNLOAD;
            }
        }
        ProtocolFamily::Nvme => {
            let mut buf = vec![0u8; LOG_PAGE_LEN as usize];
            let ctx = CommandContext::nvme(
                NvmeCommand::get_log_page(nvme::log::SMART_HEALTH, LOG_PAGE_LEN),
                DataBuffer::In(&mut buf),
            );
            if prober.succeeds(profile, ctx) {
                features |= DeviceFeatures::SMART;
            }
            let ctx = CommandContext::nvme(
                NvmeCommand::get_log_page(nvme::log::FIRMWARE_SLOT, LOG_PAGE_LEN),
                DataBuffer::In(&mut buf),
            );
            if prober.succeeds(profile, ctx) {
                features |= DeviceFeatures::FIRMWARE_DOWNLOAD;
            }
        }
    }
    debug!(?features, "capability queries done");
    profile.insert_features(features);
}
