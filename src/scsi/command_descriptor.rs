//! Underlying structures that commands are issued in

/// Operation codes for a Command Descriptor Block, specifying what operation you want
/// to do as described in 7.1 of SPC-2.
///
/// This enum is not complete, and is intended to grow
/// as needed
#[repr(u8)]
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// SPC-2 7.25
    TestUnitReady = 0x00,
    /// SPC-2 7.20
    RequestSense = 0x03,
    /// SPC-2 7.3
    Inquiry = 0x12,
    /// SBC-2 5.1.10, table 27
    ReadCapacity10 = 0x25,
    /// SBC-2 5.1.6
    Read10 = 0x28,
    /// SBC-2 5.1.16
    Write10 = 0x2A,
    /// SBC-2 5.1.14
    SynchronizeCache10 = 0x35,
    /// SPC-2 7.30
    WriteBuffer = 0x3B,
    /// SBC-3 5.25
    Unmap = 0x42,
    /// SPC-2 7.7
    LogSense = 0x4D,
    /// SAT-2 12.2.2
    AtaPassThrough16 = 0x85,
    /// SBC-2 5.1.8
    Read16 = 0x88,
    /// SBC-2 5.1.18
    Write16 = 0x8A,
    /// SBC-2 5.1.15
    SynchronizeCache16 = 0x91,
    /// SBC-3 5.16, READ CAPACITY (16) lives under this service action opcode
    ServiceActionIn16 = 0x9E,
    /// SAT-2 12.2.3
    AtaPassThrough12 = 0xA1,
    /// SPC-4 6.35, REPORT SUPPORTED OPERATION CODES lives under this service action opcode
    MaintenanceIn = 0xA3,
}

/// As described in SPC-2 4.3.2 table 1, a typical CDB for 6 byte commands.
#[repr(C, packed)]
pub struct X6CommandDescriptor {
    ///"The `OPERATION CODE` field contains the code value identifying the operation
    /// being requested by the CDB. SAM-2 defines the general structure of the operation
    /// code value. The `OPERATION CODE` field has a consistently defined meaning across
    /// all commands. This standard specifies the operation code values used by the commands
    /// defined herein."
    pub operation_code: OpCode,
    /// "A six-byte CDB contains a 21-bit `LOGICAL BLOCK ADDRESS` field."
    /// The last 3 bits are reserved.
    ///
    /// The use of this field varies from command to command.
    pub logical_block_address: [u8; 3],
    /// Depending on the opcode, this field is one of `TRANSFER LENGTH`,
    /// `PARAMETER LIST LENGTH` or `ALLOCATION LENGTH`.
    ///
    ///More info can be found in SCSI SPC2 4.3
    pub misc_len: u8,
    /// "The contents of the `CONTROL` field are defined in SAM-2."
    pub control: u8,
}

impl CommandDescriptor for X6CommandDescriptor {}
const _: () = assert!(std::mem::size_of::<X6CommandDescriptor>() == 6);

/// As described in SPC-2 4.3.2 table 2, a typical CDB for 10 byte commands.
#[repr(C, packed)]
pub struct X10CommandDescriptor {
    pub operation_code: OpCode,
    /// (if required) the lower 5 bits identify a function to be performed under the
    /// more general command specified in the `OPERATION CODE` field
    pub service_action: u8,
    /// Big endian. The use of this field varies from command to command.
    pub logical_block_address: [u8; 4],
    /// `GROUP NUMBER` on most block commands, reserved otherwise.
    pub group: u8,
    /// Big endian `TRANSFER LENGTH`, `PARAMETER LIST LENGTH` or `ALLOCATION LENGTH`.
    pub misc_len: [u8; 2],
    pub control: u8,
}

impl CommandDescriptor for X10CommandDescriptor {}
const _: () = assert!(std::mem::size_of::<X10CommandDescriptor>() == 10);

/// SPC-2 4.3.2 table 3, a typical CDB for 12 byte commands.
#[repr(C, packed)]
pub struct X12CommandDescriptor {
    pub operation_code: OpCode,
    pub service_action: u8,
    /// Big endian, command dependent (LBA, or option bytes for service action commands).
    pub misc_info: [u8; 4],
    /// Big endian length field.
    pub param: [u8; 4],
    pub group: u8,
    pub control: u8,
}

impl CommandDescriptor for X12CommandDescriptor {}
const _: () = assert!(std::mem::size_of::<X12CommandDescriptor>() == 12);

/// "A command is communicated by sending a command descriptor block
/// to the device ...."
///
/// This struct implements the format described in
/// "SCSI Primary Commands - 2 (SPC-2)" 4.3.2 The fixed length CDB formats
/// Table 4 -- Typical CDB for 16-byte commands
#[repr(C, packed)]
pub struct X16CommandDescriptor {
    pub operation_code: OpCode,
    /// "Miscellaneous CDB information" (last 5 bits)
    pub misc_info: u8,
    /// "The logical block addresses on a logical unit or within a volume partition
    /// shall begin with block zero and be contiguous up to the last logical
    /// block of that logical unit or within that partition."
    ///
    /// Big endian.
    pub logical_block_address: [u8; 8],
    /// `TRANSFER_LENGTH` or `PARAMETER_LIST_LENGTH` or `ALLOCATION LENGTH`, big endian.
    ///
    /// "In commands that use multiple bytes for the `TRANSFER LENGTH` field, a transfer length
    /// of zero indicates that no data transfer shall take place."
    pub param: [u8; 4],
    pub group: u8,
    pub control: u8,
}

impl CommandDescriptor for X16CommandDescriptor {}
const _: () = assert!(std::mem::size_of::<X16CommandDescriptor>() == 16);

/// ATA PASS-THROUGH (16), SAT-2 12.2.2 table 117.
///
/// Register pairs hold the extended (48-bit) byte first, then the low byte.
#[repr(C, packed)]
pub struct AtaPassThrough16Descriptor {
    pub operation_code: OpCode,
    /// `MULTIPLE_COUNT` (7:5), `PROTOCOL` (4:1), `EXTEND` (0)
    pub protocol: u8,
    /// `OFF_LINE` (7:6), `CK_COND` (5), `T_TYPE` (4), `T_DIR` (3), `BYT_BLOK` (2), `T_LENGTH` (1:0)
    pub flags: u8,
    pub features: [u8; 2],
    pub count: [u8; 2],
    /// LBA (31:24), LBA (7:0)
    pub lba_low: [u8; 2],
    /// LBA (39:32), LBA (15:8)
    pub lba_mid: [u8; 2],
    /// LBA (47:40), LBA (23:16)
    pub lba_high: [u8; 2],
    pub device: u8,
    pub command: u8,
    pub control: u8,
}

impl CommandDescriptor for AtaPassThrough16Descriptor {}
const _: () = assert!(std::mem::size_of::<AtaPassThrough16Descriptor>() == 16);

pub trait CommandDescriptor: Sized {
    fn as_slice(&'_ self) -> &[u8] {
        // SAFETY: every implementor is `repr(C, packed)` over byte-sized fields,
        // so the struct is exactly its bytes, and the slice borrows `self`.
        let slice: &'_ [u8] = unsafe {
            let ptr = self as *const Self as *const u8;
            std::slice::from_raw_parts(ptr, std::mem::size_of::<Self>())
        };
        slice
    }
}
