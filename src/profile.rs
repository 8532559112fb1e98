//! Per-device capability state, built once by the probe.

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::io::{AdapterCaps, BusInfo, BusType};
use crate::transport::{Dialect, TransportDescriptor, rank};

/// Default logical block size when nothing better is known.
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// What the device fundamentally is, as opposed to the bus it hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolFamily {
    Ata,
    /// ATA packet device; speaks SCSI commands over ATA.
    Atapi,
    Scsi,
    Nvme,
}

bitflags! {
    /// Optional capabilities found while probing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceFeatures: u8 {
        /// SMART / health log access.
        const SMART = 1 << 0;
        /// Firmware download is supported.
        const FIRMWARE_DOWNLOAD = 1 << 1;
        /// A reset can be carried by the primary dialect.
        const RESET = 1 << 2;
    }
}

/// Classification result for one open device.
///
/// Everything but the negative cache is fixed once probing is done. The
/// negative cache only grows: a dialect that soft-failed stays demoted for the
/// life of the profile.
#[derive(Debug)]
pub struct DeviceProfile {
    pub(crate) family: ProtocolFamily,
    pub(crate) interface: BusType,
    pub(crate) conservative: bool,
    pub(crate) adapter: AdapterCaps,
    block_size: u32,
    features: DeviceFeatures,
    transports: Vec<&'static TransportDescriptor>,
    negative: Mutex<Vec<Dialect>>,
}

impl DeviceProfile {
    pub fn new(family: ProtocolFamily, bus: &BusInfo, conservative: bool) -> Self {
        let mut profile = Self {
            family,
            interface: bus.bus_type,
            conservative,
            adapter: bus.adapter.clone(),
            block_size: bus.adapter.block_size.unwrap_or(DEFAULT_BLOCK_SIZE),
            features: DeviceFeatures::empty(),
            transports: Vec::new(),
            negative: Mutex::new(Vec::new()),
        };
        profile.transports = rank(&profile);
        profile
    }

    /// The fallback profile for a device nothing could be learned about: SCSI
    /// family, block emulation always available.
    pub fn conservative(bus: &BusInfo) -> Self {
        Self::new(ProtocolFamily::Scsi, bus, true)
    }

    pub fn family(&self) -> ProtocolFamily {
        self.family
    }

    /// Bus type as the OS reported it.
    pub fn interface(&self) -> BusType {
        self.interface
    }

    pub fn is_conservative(&self) -> bool {
        self.conservative
    }

    pub fn adapter(&self) -> &AdapterCaps {
        &self.adapter
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn features(&self) -> DeviceFeatures {
        self.features
    }

    pub fn alignment(&self) -> usize {
        self.adapter.alignment.max(1)
    }

    pub fn max_transfer(&self) -> usize {
        self.adapter.max_transfer
    }

    /// All usable dialects, most preferred first.
    pub fn transports(&self) -> &[&'static TransportDescriptor] {
        &self.transports
    }

    pub fn primary(&self) -> Option<&'static TransportDescriptor> {
        self.transports.first().copied()
    }

    pub fn fallbacks(&self) -> &[&'static TransportDescriptor] {
        self.transports.get(1..).unwrap_or(&[])
    }

    /// The order the dispatcher walks: ranked dialects that haven't
    /// soft-failed, then the demoted ones, each group in rank order.
    pub fn dispatch_order(&self) -> Vec<&'static TransportDescriptor> {
        let negative = self.negative.lock();
        let (demoted, fresh): (Vec<_>, Vec<_>) = self
            .transports
            .iter()
            .partition(|d| negative.contains(&d.dialect));
        fresh.into_iter().chain(demoted).copied().collect()
    }

    /// Records a soft failure. Returns `true` when the dialect was not
    /// demoted before.
    pub fn demote(&self, dialect: Dialect) -> bool {
        let mut negative = self.negative.lock();
        if negative.contains(&dialect) {
            return false;
        }
        negative.push(dialect);
        true
    }

    pub fn is_demoted(&self, dialect: Dialect) -> bool {
        self.negative.lock().contains(&dialect)
    }

    /// Demoted dialects, in the order they failed.
    pub fn negative_cache(&self) -> Vec<Dialect> {
        self.negative.lock().clone()
    }

    pub(crate) fn set_block_size(&mut self, block_size: u32) {
        self.block_size = block_size;
    }

    pub(crate) fn insert_features(&mut self, features: DeviceFeatures) {
        self.features.insert(features);
    }
}
