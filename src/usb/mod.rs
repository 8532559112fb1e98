//! Interactions with USB mass storage devices
//!
//! Flash drives and most USB-to-SATA enclosures use the mass storage class
//! (0x08), SCSI transparent command set subclass (0x06), and the bulk-only
//! transport protocol (0x50). There are two bulk endpoints, one per direction.
//! Each command is a 31-byte command block wrapper (CBW) sent to the drive,
//! an optional data phase, and a 13-byte command status wrapper (CSW) read
//! back. A couple of requests (GET MAX LUN, bulk-only reset) go over the
//! control endpoint.
//!
//! Scratchpad:
//! <https://www.downtowndougbrown.com/2018/12/usb-mass-storage-with-embedded-devices-tips-and-quirks/>
//!
//! The framing in [`cbw`] is always built; the nusb-backed provider needs the
//! `usb` feature.

pub mod cbw;

#[cfg(feature = "usb")]
mod bulk;

#[cfg(feature = "usb")]
pub use bulk::{UsbBulkOnlyIo, UsbDrive, device_id, enumerate_usb_storage_devices, open_usb_device};
