// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! SCSI wire-format definitions shared by the multipath stack.
//!
//! Numeric values follow SPC-3/SBC-3. Several opcodes are overloaded by
//! peripheral device class; the aliases are all kept and
//! [`ScsiOp::name_for`] resolves the class-specific meaning.

#![expect(missing_docs)]

pub mod inquiry;
pub mod pr;
pub mod sense;
pub mod status;

pub use inquiry::*;
pub use sense::*;
pub use status::*;

use open_enum::open_enum;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Big-endian 16-bit wire integer.
pub type U16BE = zerocopy::byteorder::U16<zerocopy::byteorder::BigEndian>;
/// Big-endian 32-bit wire integer.
pub type U32BE = zerocopy::byteorder::U32<zerocopy::byteorder::BigEndian>;
/// Big-endian 64-bit wire integer.
pub type U64BE = zerocopy::byteorder::U64<zerocopy::byteorder::BigEndian>;

/// Maximum CDB length accepted by the stack.
pub const MAX_CDB_LEN: usize = 16;
/// Maximum sense buffer length carried with a completion.
pub const MAX_SENSE_LEN: usize = 64;

open_enum! {
    /// Peripheral device type from byte 0 of inquiry data.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    #[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
    pub enum PeripheralType: u8 {
        DISK = 0x00,
        TAPE = 0x01,
        PRINTER = 0x02,
        PROCESSOR = 0x03,
        WORM = 0x04,
        CDROM = 0x05,
        SCANNER = 0x06,
        OPTICAL = 0x07,
        MEDIUM_CHANGER = 0x08,
        COMMUNICATIONS = 0x09,
        ARRAY_CONTROLLER = 0x0C,
        ENCLOSURE = 0x0D,
        RBC = 0x0E,
        CARD_READER = 0x0F,
        BRIDGE = 0x10,
        OBJECT_STORE = 0x11,
        WELL_KNOWN_LUN = 0x1E,
        UNKNOWN = 0x1F,
    }
}

open_enum! {
    /// SCSI operation codes.
    ///
    /// Constants sharing a value are device-class overloads, not duplicates.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    #[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
    pub enum ScsiOp: u8 {
        TEST_UNIT_READY = 0x00,
        REZERO_UNIT = 0x01,
        REWIND = 0x01,
        REQUEST_SENSE = 0x03,
        FORMAT_UNIT = 0x04,
        FORMAT_MEDIUM = 0x04,
        READ_BLOCK_LIMITS = 0x05,
        REASSIGN_BLOCKS = 0x07,
        INIT_ELEMENT_STATUS = 0x07,
        READ6 = 0x08,
        RECEIVE = 0x08,
        WRITE6 = 0x0A,
        PRINT = 0x0A,
        SEND = 0x0A,
        SEEK6 = 0x0B,
        SLEW_PRINT = 0x0B,
        READ_REVERSE = 0x0F,
        WRITE_FILEMARKS = 0x10,
        SYNCHRONIZE_BUFFER = 0x10,
        SPACE = 0x11,
        INQUIRY = 0x12,
        VERIFY6 = 0x13,
        RECOVER_BUFFERED_DATA = 0x14,
        MODE_SELECT = 0x15,
        RESERVE_UNIT = 0x16,
        RELEASE_UNIT = 0x17,
        COPY = 0x18,
        ERASE = 0x19,
        MODE_SENSE = 0x1A,
        START_STOP_UNIT = 0x1B,
        LOAD_UNLOAD = 0x1B,
        STOP_PRINT = 0x1B,
        RECEIVE_DIAGNOSTIC = 0x1C,
        SEND_DIAGNOSTIC = 0x1D,
        MEDIUM_REMOVAL = 0x1E,
        READ_FORMAT_CAPACITIES = 0x23,
        READ_CAPACITY = 0x25,
        READ10 = 0x28,
        WRITE10 = 0x2A,
        SEEK10 = 0x2B,
        LOCATE = 0x2B,
        POSITION_TO_ELEMENT = 0x2B,
        WRITE_VERIFY = 0x2E,
        VERIFY10 = 0x2F,
        PREFETCH = 0x34,
        READ_POSITION = 0x34,
        SYNCHRONIZE_CACHE = 0x35,
        LOCK_UNLOCK_CACHE = 0x36,
        READ_DEFECT_DATA = 0x37,
        COMPARE = 0x39,
        WRITE_BUFFER = 0x3B,
        READ_BUFFER = 0x3C,
        READ_LONG = 0x3E,
        WRITE_LONG = 0x3F,
        WRITE_SAME = 0x41,
        UNMAP = 0x42,
        READ_SUB_CHANNEL = 0x42,
        READ_TOC = 0x43,
        REPORT_DENSITY_SUPPORT = 0x44,
        GET_CONFIGURATION = 0x46,
        SANITIZE = 0x48,
        GET_EVENT_STATUS = 0x4A,
        LOG_SELECT = 0x4C,
        LOG_SENSE = 0x4D,
        XDWRITE = 0x50,
        XPWRITE = 0x51,
        READ_DISC_INFORMATION = 0x51,
        XDREAD = 0x52,
        MODE_SELECT10 = 0x55,
        RESERVE_UNIT10 = 0x56,
        RESERVE_ELEMENT = 0x56,
        RELEASE_UNIT10 = 0x57,
        RELEASE_ELEMENT = 0x57,
        MODE_SENSE10 = 0x5A,
        PERSISTENT_RESERVE_IN = 0x5E,
        PERSISTENT_RESERVE_OUT = 0x5F,
        EXTENDED_CDB = 0x7E,
        VARIABLE_LENGTH_CDB = 0x7F,
        READ16 = 0x88,
        COMPARE_AND_WRITE = 0x89,
        WRITE16 = 0x8A,
        EXTENDED_COPY = 0x83,
        RECEIVE_COPY_RESULTS = 0x84,
        ATA_PASSTHROUGH16 = 0x85,
        VERIFY16 = 0x8F,
        SYNCHRONIZE_CACHE16 = 0x91,
        WRITE_SAME16 = 0x93,
        SERVICE_ACTION_IN16 = 0x9E,
        SERVICE_ACTION_OUT16 = 0x9F,
        REPORT_LUNS = 0xA0,
        ATA_PASSTHROUGH12 = 0xA1,
        BLANK = 0xA1,
        SECURITY_PROTOCOL_IN = 0xA2,
        SEND_EVENT = 0xA2,
        MAINTENANCE_IN = 0xA3,
        SEND_KEY = 0xA3,
        MAINTENANCE_OUT = 0xA4,
        REPORT_KEY = 0xA4,
        MOVE_MEDIUM = 0xA5,
        EXCHANGE_MEDIUM = 0xA6,
        LOAD_UNLOAD_SLOT = 0xA6,
        READ12 = 0xA8,
        GET_MESSAGE = 0xA8,
        SERVICE_ACTION_OUT12 = 0xA9,
        WRITE12 = 0xAA,
        SERVICE_ACTION_IN12 = 0xAB,
        SEND_MESSAGE = 0xAB,
        VERIFY12 = 0xAF,
        SECURITY_PROTOCOL_OUT = 0xB5,
        READ_ELEMENT_STATUS = 0xB8,
        READ_CD = 0xBE,
    }
}

impl ScsiOp {
    /// Returns the opcode name as understood by a device of class `class`.
    ///
    /// Falls back to the generic (first declared) name when the opcode is not
    /// overloaded for that class.
    pub fn name_for(self, class: PeripheralType) -> Option<&'static str> {
        let name = match (self, class) {
            (Self::REWIND, PeripheralType::TAPE) => "REWIND",
            (Self::FORMAT_MEDIUM, PeripheralType::TAPE) => "FORMAT_MEDIUM",
            (Self::INIT_ELEMENT_STATUS, PeripheralType::MEDIUM_CHANGER) => "INIT_ELEMENT_STATUS",
            (Self::RECEIVE, PeripheralType::PROCESSOR | PeripheralType::COMMUNICATIONS) => {
                "RECEIVE"
            }
            (Self::PRINT, PeripheralType::PRINTER) => "PRINT",
            (Self::SEND, PeripheralType::PROCESSOR | PeripheralType::COMMUNICATIONS) => "SEND",
            (Self::SLEW_PRINT, PeripheralType::PRINTER) => "SLEW_PRINT",
            (Self::SYNCHRONIZE_BUFFER, PeripheralType::PRINTER) => "SYNCHRONIZE_BUFFER",
            (Self::LOAD_UNLOAD, PeripheralType::TAPE) => "LOAD_UNLOAD",
            (Self::STOP_PRINT, PeripheralType::PRINTER) => "STOP_PRINT",
            (Self::LOCATE, PeripheralType::TAPE) => "LOCATE",
            (Self::POSITION_TO_ELEMENT, PeripheralType::MEDIUM_CHANGER) => "POSITION_TO_ELEMENT",
            (Self::READ_POSITION, PeripheralType::TAPE) => "READ_POSITION",
            (Self::READ_SUB_CHANNEL, PeripheralType::CDROM) => "READ_SUB_CHANNEL",
            (Self::READ_DISC_INFORMATION, PeripheralType::CDROM) => "READ_DISC_INFORMATION",
            (Self::RESERVE_ELEMENT, PeripheralType::MEDIUM_CHANGER) => "RESERVE_ELEMENT",
            (Self::RELEASE_ELEMENT, PeripheralType::MEDIUM_CHANGER) => "RELEASE_ELEMENT",
            (Self::BLANK, PeripheralType::CDROM) => "BLANK",
            (Self::SEND_EVENT, PeripheralType::CDROM) => "SEND_EVENT",
            (Self::SEND_KEY, PeripheralType::CDROM) => "SEND_KEY",
            (Self::REPORT_KEY, PeripheralType::CDROM) => "REPORT_KEY",
            (Self::EXCHANGE_MEDIUM, PeripheralType::MEDIUM_CHANGER) => "EXCHANGE_MEDIUM",
            (Self::LOAD_UNLOAD_SLOT, PeripheralType::CDROM) => "LOAD_UNLOAD_SLOT",
            (Self::GET_MESSAGE, PeripheralType::COMMUNICATIONS) => "GET_MESSAGE",
            (Self::SEND_MESSAGE, PeripheralType::COMMUNICATIONS) => "SEND_MESSAGE",
            _ => return self.name(),
        };
        Some(name)
    }

    /// Returns the CDB length implied by the opcode group code.
    pub fn cdb_len(self) -> Option<usize> {
        match self.0 >> 5 {
            0 => Some(6),
            1 | 2 => Some(10),
            4 => Some(16),
            5 => Some(12),
            _ => None,
        }
    }

    /// Whether the opcode is subject to SCSI-2 or persistent reservations
    /// in a way that a reservation change must invalidate.
    pub fn is_reservation_sensitive(self) -> bool {
        matches!(
            self,
            Self::RESERVE_UNIT
                | Self::RELEASE_UNIT
                | Self::RESERVE_UNIT10
                | Self::RELEASE_UNIT10
                | Self::PERSISTENT_RESERVE_OUT
        )
    }
}

/// TEST UNIT READY / generic six-byte CDB.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdb6 {
    pub operation_code: ScsiOp,
    pub lun_or_flags: u8,
    pub reserved: [u8; 2],
    pub length: u8,
    pub control: u8,
}

/// Ten-byte read/write CDB.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdb10 {
    pub operation_code: ScsiOp,
    pub flags: u8,
    pub logical_block: U32BE,
    pub group: u8,
    pub transfer_blocks: U16BE,
    pub control: u8,
}

/// Sixteen-byte read/write CDB.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdb16 {
    pub operation_code: ScsiOp,
    pub flags: u8,
    pub logical_block: U64BE,
    pub transfer_blocks: U32BE,
    pub group: u8,
    pub control: u8,
}
