//! The ordered dialect table. Position within a family is preference: the
//! most direct path first, emulation last.

use super::{
    Dialect, TransportDescriptor, TransportFeatures, WireCommand, WireProtocol, WireRequest,
    encode_plain, encode_tunnel,
};
use crate::ata::opcode;
use crate::profile::{DeviceProfile, ProtocolFamily};

const SECTOR: usize = 512;

const UNRESTRICTED: TransportFeatures = TransportFeatures {
    max_transfer: None,
    alignment: 1,
    accepts: any_command,
};

fn any_command(_: &WireCommand) -> bool {
    true
}

/// 28-bit register layout and no DMA.
fn ide_diagnostic_command(command: &WireCommand) -> bool {
    match &command.request {
        WireRequest::Ata(tf) => {
            !tf.extended
                && !matches!(
                    tf.command,
                    opcode::READ_DMA | opcode::WRITE_DMA | opcode::DATA_SET_MANAGEMENT
                )
        }
        _ => false,
    }
}

fn smart_diagnostic_command(command: &WireCommand) -> bool {
    match &command.request {
        WireRequest::Ata(tf) => matches!(tf.command, opcode::IDENTIFY_DEVICE | opcode::SMART),
        _ => false,
    }
}

fn ata_passthrough(profile: &DeviceProfile) -> bool {
    profile.adapter.ata_passthrough
}

fn scsi_passthrough(profile: &DeviceProfile) -> bool {
    profile.adapter.scsi_passthrough
}

fn nvme_passthrough(profile: &DeviceProfile) -> bool {
    profile.adapter.nvme_passthrough
}

fn nvme_tunnel(profile: &DeviceProfile) -> bool {
    profile.adapter.nvme_tunnel
}

fn ide_diagnostic(profile: &DeviceProfile) -> bool {
    profile.adapter.ide_diagnostic
}

fn smart_diagnostic(profile: &DeviceProfile) -> bool {
    profile.adapter.smart_diagnostic
}

fn usb_bulk_only(profile: &DeviceProfile) -> bool {
    profile.adapter.usb_bulk_only
}

/// Conservative profiles always keep the block path.
fn block_emulation(profile: &DeviceProfile) -> bool {
    profile.adapter.block_io || profile.conservative
}

pub static REGISTRY: &[TransportDescriptor] = &[
    // ATA
    TransportDescriptor {
        family: ProtocolFamily::Ata,
        dialect: Dialect::AtaPassThrough,
        wire: WireProtocol::Ata,
        predicate: ata_passthrough,
        features: UNRESTRICTED,
        can_reset: true,
        encode: encode_plain,
    },
    TransportDescriptor {
        family: ProtocolFamily::Ata,
        dialect: Dialect::ScsiPassThrough,
        wire: WireProtocol::Scsi,
        predicate: scsi_passthrough,
        features: UNRESTRICTED,
        can_reset: true,
        encode: encode_plain,
    },
    TransportDescriptor {
        family: ProtocolFamily::Ata,
        dialect: Dialect::IdeDiagnostic,
        wire: WireProtocol::Ata,
        predicate: ide_diagnostic,
        features: TransportFeatures {
            max_transfer: Some(SECTOR),
            alignment: 1,
            accepts: ide_diagnostic_command,
        },
        can_reset: false,
        encode: encode_plain,
    },
    TransportDescriptor {
        family: ProtocolFamily::Ata,
        dialect: Dialect::SmartDiagnostic,
        wire: WireProtocol::Ata,
        predicate: smart_diagnostic,
        features: TransportFeatures {
            max_transfer: Some(SECTOR),
            alignment: 1,
            accepts: smart_diagnostic_command,
        },
        can_reset: false,
        encode: encode_plain,
    },
    TransportDescriptor {
        family: ProtocolFamily::Ata,
        dialect: Dialect::BlockEmulation,
        wire: WireProtocol::Block,
        predicate: block_emulation,
        features: UNRESTRICTED,
        can_reset: false,
        encode: encode_plain,
    },
    // ATAPI
    TransportDescriptor {
        family: ProtocolFamily::Atapi,
        dialect: Dialect::ScsiPassThrough,
        wire: WireProtocol::Scsi,
        predicate: scsi_passthrough,
        features: UNRESTRICTED,
        can_reset: true,
        encode: encode_plain,
    },
    TransportDescriptor {
        family: ProtocolFamily::Atapi,
        dialect: Dialect::BlockEmulation,
        wire: WireProtocol::Block,
        predicate: block_emulation,
        features: UNRESTRICTED,
        can_reset: false,
        encode: encode_plain,
    },
    // SCSI
    TransportDescriptor {
        family: ProtocolFamily::Scsi,
        dialect: Dialect::ScsiPassThrough,
        wire: WireProtocol::Scsi,
        predicate: scsi_passthrough,
        features: UNRESTRICTED,
        can_reset: true,
        encode: encode_plain,
    },
    TransportDescriptor {
        family: ProtocolFamily::Scsi,
        dialect: Dialect::UsbBulkOnly,
        wire: WireProtocol::Scsi,
        predicate: usb_bulk_only,
        features: UNRESTRICTED,
        can_reset: true,
        encode: encode_plain,
    },
    TransportDescriptor {
        family: ProtocolFamily::Scsi,
        dialect: Dialect::BlockEmulation,
        wire: WireProtocol::Block,
        predicate: block_emulation,
        features: UNRESTRICTED,
        can_reset: false,
        encode: encode_plain,
    },
    // NVMe
    TransportDescriptor {
        family: ProtocolFamily::Nvme,
        dialect: Dialect::NvmePassThrough,
        wire: WireProtocol::Nvme,
        predicate: nvme_passthrough,
        features: UNRESTRICTED,
        can_reset: true,
        encode: encode_plain,
    },
    TransportDescriptor {
        family: ProtocolFamily::Nvme,
        dialect: Dialect::NvmeTunnel,
        wire: WireProtocol::Nvme,
        predicate: nvme_tunnel,
        features: UNRESTRICTED,
        can_reset: false,
        encode: encode_tunnel,
    },
    TransportDescriptor {
        family: ProtocolFamily::Nvme,
        dialect: Dialect::ScsiPassThrough,
        wire: WireProtocol::Scsi,
        predicate: scsi_passthrough,
        features: UNRESTRICTED,
        can_reset: true,
        encode: encode_plain,
    },
    TransportDescriptor {
        family: ProtocolFamily::Nvme,
        dialect: Dialect::BlockEmulation,
        wire: WireProtocol::Block,
        predicate: block_emulation,
        features: UNRESTRICTED,
        can_reset: false,
        encode: encode_plain,
    },
];

/// Every descriptor of the profile's family whose predicate accepts it, in
/// registry order.
pub fn rank(profile: &DeviceProfile) -> Vec<&'static TransportDescriptor> {
    REGISTRY
        .iter()
        .filter(|d| d.family == profile.family && (d.predicate)(profile))
        .collect()
}
