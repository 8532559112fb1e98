use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::{ensure, eyre};
use nusb::descriptors::TransferType;
use nusb::io::{EndpointRead, EndpointWrite};
use nusb::transfer::{Bulk, ControlIn, ControlOut, ControlType, In, Out, Recipient};
use nusb::{DeviceInfo, Interface, list_devices};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Runtime;
use tracing::{debug, warn};

use super::cbw::{CSW_SIZE, CbwDirection, CommandBlockWrapper, CommandStatus, CommandStatusWrapper, TagGenerator};
use crate::context::DataDirection;
use crate::error::IoError;
use crate::io::{AdapterCaps, BusInfo, BusType, DeviceId, DeviceIo, Handle, IoData, RawCompletion, RawStatus, SubmitRequest};
use crate::scsi::command as cdb;
use crate::scsi::sense::FIXED_SENSE_LEN;
use crate::transport::Dialect;

/// https://www.usb.org/defined-class-codes
const MASS_STORAGE_USB_CLASS: u8 = 0x08;
/// SCSI transparent command set.
const SCSI_TRANSPARENT_SUBCLASS: u8 = 0x06;
/// Bulk-only transport.
const BULK_ONLY_PROTOCOL: u8 = 0x50;

/// Bytes per bulk transfer; a multiple of every bulk max packet size.
const TRANSFER_SIZE: usize = 16 * 1024;
const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);

/// As described by the USB Mass Storage Class - Bulk Only Transport spec,
/// section 3.2.
///
/// LUN stands for Logical Unit Number, and it's a number
/// used as a unique identifier for a storage device or logical volume.
///
/// <https://en.wikipedia.org/wiki/Logical_unit_number>
const MAX_LUN_REQUEST: ControlIn = ControlIn {
    control_type: ControlType::Class,
    recipient: Recipient::Interface,
    request: 0xfe,
    value: 0,
    index: 0,
    length: 1,
};

/// Returns a list of every USB storage device currently connected to the host machine
pub async fn enumerate_usb_storage_devices() -> Result<impl Iterator<Item = DeviceInfo>> {
    let all_usb_devices = list_devices().await?;

    // Each USB device typically exposes one or more *interfaces* as a
    // way to interact with specific functionality of the device.
    let usb_storage_devices = all_usb_devices.filter(|dev| {
        debug!("scanning usb device: {:#?}", dev);
        dev.class() == MASS_STORAGE_USB_CLASS
            || dev
                .interfaces()
                .any(|interface| interface.class() == MASS_STORAGE_USB_CLASS)
    });
    Ok(usb_storage_devices)
}

/// `bus:address`, the id a [`UsbBulkOnlyIo`] opens devices by.
pub fn device_id(info: &DeviceInfo) -> DeviceId {
    DeviceId::new(format!("{}:{}", info.bus_id(), info.device_address()))
}

/// A claimed bulk-only mass storage interface.
pub struct UsbDrive {
    interface: Interface,
    interface_number: u8,
    bulk_write: EndpointWrite<Bulk>,
    bulk_read: EndpointRead<Bulk>,
    tags: TagGenerator,
}

/// Opens the provided USB mass storage device.
///
/// This initialization sequence follows the order
/// described here: <https://www.downtowndougbrown.com/2018/12/usb-mass-storage-with-embedded-devices-tips-and-quirks/>.
/// The TEST UNIT READY / INQUIRY dance that follows is left to the probe.
#[tracing::instrument(skip_all, fields(bus = info.bus_id(), address = info.device_address()))]
pub async fn open_usb_device(info: &DeviceInfo) -> Result<UsbDrive> {
    let interface_number = info
        .interfaces()
        .find(|i| {
            i.class() == MASS_STORAGE_USB_CLASS
                && i.subclass() == SCSI_TRANSPARENT_SUBCLASS
                && i.protocol() == BULK_ONLY_PROTOCOL
        })
        .map(|i| i.interface_number())
        .ok_or_else(|| eyre!("no SCSI bulk-only mass storage interface"))?;

    // 1. Claim the USB device to read and write to it
    debug!(interface_number, "opening device");
    let device = info.open().await?;
    let interface = device.claim_interface(interface_number).await?;

    // 2. Request the maximum LUN. A stall here means the device only has LUN 0.
    let mut max_lun_request = MAX_LUN_REQUEST;
    max_lun_request.index = u16::from(interface_number);
    match interface.control_in(max_lun_request, CONTROL_TIMEOUT).await {
        Ok(max_lun) => ensure!(
            max_lun.first().copied().unwrap_or(0) == 0,
            "devices with more than one LUN are not supported"
        ),
        Err(e) => debug!(error = %e, "GET MAX LUN not answered, assuming a single LUN"),
    }

    // 3. Find the bulk pipes.
    let descriptor = interface
        .descriptor()
        .ok_or_else(|| eyre!("interface {interface_number} has no descriptor"))?;
    let mut bulk_in = None;
    let mut bulk_out = None;
    for endpoint in descriptor.endpoints() {
        if endpoint.transfer_type() != TransferType::Bulk {
            continue;
        }
        if endpoint.address() & 0x80 != 0 {
            bulk_in.get_or_insert(endpoint.address());
        } else {
            bulk_out.get_or_insert(endpoint.address());
        }
    }
    let (bulk_in, bulk_out) = bulk_in
        .zip(bulk_out)
        .ok_or_else(|| eyre!("interface {interface_number} lacks a bulk endpoint pair"))?;
    debug!(bulk_in, bulk_out, "bulk endpoints");

    let bulk_write = interface
        .endpoint::<Bulk, Out>(bulk_out)?
        .writer(TRANSFER_SIZE)
        .with_num_transfers(4);
    let bulk_read = interface
        .endpoint::<Bulk, In>(bulk_in)?
        .reader(TRANSFER_SIZE)
        .with_num_transfers(4);

    Ok(UsbDrive {
        interface,
        interface_number,
        bulk_write,
        bulk_read,
        tags: TagGenerator::new(),
    })
}

impl UsbDrive {
    /// CBW, data phase, CSW. Fetches sense with REQUEST SENSE when the
    /// command failed.
    async fn transact(&mut self, command: &cdb::CommandBlock, data: IoData<'_>) -> Result<RawCompletion> {
        let requested = data.len();
        let Some((tag, status)) = self.exchange(command, data).await? else {
            return Ok(RawCompletion::failed(RawStatus::SignatureMismatch));
        };
        let sense = if status.status == CommandStatus::Failed {
            let mut sense = vec![0u8; FIXED_SENSE_LEN];
            let request_sense = cdb::request_sense(FIXED_SENSE_LEN as u8);
            let fetched = matches!(
                self.exchange(&request_sense, IoData::In(&mut sense)).await?,
                Some((_, sense_status)) if sense_status.status == CommandStatus::Passed
            );
            fetched.then_some(sense)
        } else {
            None
        };
        Ok(status.completion(tag, requested, sense))
    }

    /// One CBW/data/CSW round. `None` when the CSW isn't one.
    async fn exchange(
        &mut self,
        command: &cdb::CommandBlock,
        data: IoData<'_>,
    ) -> Result<Option<(u32, CommandStatusWrapper)>> {
        let tag = self.tags.tag();
        let cbw = CommandBlockWrapper::new(
            command,
            data.len() as u32,
            CbwDirection::from(data.direction()),
            tag,
        );
        self.bulk_write.write_all(cbw.as_slice()).await?;
        self.bulk_write.flush().await?;

        match data {
            IoData::None => {}
            IoData::Out(buf) => {
                self.bulk_write.write_all(buf).await?;
                self.bulk_write.flush().await?;
            }
            IoData::In(buf) => self.read_data(buf).await?,
            IoData::Bidirectional(_) => {
                return Err(eyre!("bulk-only transport has no bidirectional data phase"));
            }
        }

        let mut csw = [0u8; CSW_SIZE];
        self.bulk_read.read_exact(&mut csw).await?;
        match CommandStatusWrapper::from_slice(&csw) {
            Ok(status) => Ok(Some((tag, *status))),
            Err(e) => {
                warn!(error = %e, "malformed command status wrapper");
                Ok(None)
            }
        }
    }

    /// Reads the data-in phase, which a short packet may end early.
    async fn read_data(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut reader = self.bulk_read.until_short_packet();
        let mut filled = 0;
        while filled < buf.len() {
            let n = reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled < buf.len() {
            reader
                .consume_end()
                .map_err(|_| eyre!("data phase did not end with a short packet"))?;
        }
        debug!(filled, requested = buf.len(), "data-in phase");
        Ok(())
    }

    /// Bulk-Only Mass Storage Reset, section 3.1.
    async fn reset_recovery(&mut self) -> Result<()> {
        let reset = ControlOut {
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            request: 0xff,
            value: 0,
            index: u16::from(self.interface_number),
            data: &[],
        };
        self.interface.control_out(reset, CONTROL_TIMEOUT).await?;
        Ok(())
    }
}

/// [`DeviceIo`] over USB bulk-only mass storage.
///
/// nusb is async; this owns a current-thread tokio runtime and blocks on it
/// for each request. Only the [`Dialect::UsbBulkOnly`] dialect is served.
pub struct UsbBulkOnlyIo {
    runtime: Runtime,
    drives: Mutex<HashMap<u64, Arc<Mutex<UsbDrive>>>>,
    next_handle: AtomicU64,
}

impl UsbBulkOnlyIo {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            runtime,
            drives: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    /// Every attached mass storage device.
    pub fn list(&self) -> Result<Vec<DeviceInfo>> {
        self.runtime
            .block_on(async { Ok(enumerate_usb_storage_devices().await?.collect()) })
    }

    fn drive(&self, handle: Handle) -> Option<Arc<Mutex<UsbDrive>>> {
        self.drives.lock().get(&handle.0).cloned()
    }
}

impl DeviceIo for UsbBulkOnlyIo {
    fn open(&self, id: &DeviceId) -> std::result::Result<Handle, IoError> {
        let open_error = |e: color_eyre::Report| IoError::Open {
            id: id.to_string(),
            reason: format!("{e:#}"),
        };
        let info = self
            .list()
            .map_err(open_error)?
            .into_iter()
            .find(|info| device_id(info) == *id)
            .ok_or_else(|| IoError::NotFound(id.to_string()))?;
        let drive = self
            .runtime
            .block_on(open_usb_device(&info))
            .map_err(open_error)?;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.drives.lock().insert(handle, Arc::new(Mutex::new(drive)));
        Ok(Handle(handle))
    }

    fn close(&self, handle: Handle) {
        self.drives.lock().remove(&handle.0);
    }

    fn query_bus_info(&self, handle: Handle) -> std::result::Result<BusInfo, IoError> {
        self.drive(handle).ok_or(IoError::UnknownHandle(handle.0))?;
        Ok(BusInfo {
            bus_type: BusType::Usb,
            adapter: AdapterCaps {
                usb_bulk_only: true,
                block_io: false,
                reset: true,
                ..AdapterCaps::default()
            },
        })
    }

    fn submit(&self, handle: Handle, request: SubmitRequest<'_>) -> RawCompletion {
        if request.dialect != Dialect::UsbBulkOnly {
            return RawCompletion::failed(RawStatus::NotImplemented);
        }
        if request.data.direction() == DataDirection::Bidirectional {
            return RawCompletion::failed(RawStatus::Rejected);
        }
        let Some(command) = cdb::CommandBlock::new(request.command) else {
            return RawCompletion::failed(RawStatus::Rejected);
        };
        let Some(drive) = self.drive(handle) else {
            warn!(?handle, "submit on a closed handle");
            return RawCompletion::failed(RawStatus::Rejected);
        };
        let mut drive = drive.lock();

        let outcome = self.runtime.block_on(tokio::time::timeout(
            request.timeout,
            drive.transact(&command, request.data),
        ));
        let raw = match outcome {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!(error = %e, "bulk-only transaction failed");
                RawCompletion::failed(RawStatus::LinkError)
            }
            Err(_) => {
                warn!(timeout = ?request.timeout, "bulk-only transaction timed out");
                RawCompletion::failed(RawStatus::TimedOut)
            }
        };
        if matches!(
            raw.status,
            RawStatus::LinkError | RawStatus::TimedOut | RawStatus::SignatureMismatch
        ) {
            if let Err(e) = self.runtime.block_on(drive.reset_recovery()) {
                warn!(error = %e, "reset recovery failed");
            }
        }
        raw
    }
}
