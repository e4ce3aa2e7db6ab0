// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! INQUIRY command, standard inquiry data and vital product data pages.

use crate::PeripheralType;
use crate::ScsiOp;
use crate::U16BE;
use bitfield_struct::bitfield;
use open_enum::open_enum;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Supported VPD pages.
pub const VPD_SUPPORTED_PAGES: u8 = 0x00;
/// Unit serial number.
pub const VPD_SERIAL_NUMBER: u8 = 0x80;
/// Device identification.
pub const VPD_DEVICE_IDENTIFIERS: u8 = 0x83;
/// Extended inquiry data.
pub const VPD_EXTENDED_INQUIRY: u8 = 0x86;
/// Block limits.
pub const VPD_BLOCK_LIMITS: u8 = 0xB0;
/// Block device characteristics.
pub const VPD_BLOCK_DEVICE_CHARACTERISTICS: u8 = 0xB1;
/// Logical block provisioning.
pub const VPD_LOGICAL_BLOCK_PROVISIONING: u8 = 0xB2;

/// Length of the standard inquiry data the stack requests and caches.
pub const STANDARD_INQUIRY_LEN: usize = 36;

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CdbInquiry {
    pub operation_code: ScsiOp,
    pub flags: InquiryFlags,
    pub page_code: u8,
    pub allocation_length: U16BE,
    pub control: u8,
}

impl CdbInquiry {
    /// Standard inquiry of `len` bytes.
    pub fn standard(len: u16) -> Self {
        Self {
            operation_code: ScsiOp::INQUIRY,
            flags: InquiryFlags::new(),
            page_code: 0,
            allocation_length: len.into(),
            control: 0,
        }
    }

    /// Inquiry for VPD page `page`.
    pub fn vpd(page: u8, len: u16) -> Self {
        Self {
            operation_code: ScsiOp::INQUIRY,
            flags: InquiryFlags::new().with_vpd(true),
            page_code: page,
            allocation_length: len.into(),
            control: 0,
        }
    }
}

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct InquiryFlags {
    pub vpd: bool,
    pub csd: bool,
    #[bits(6)]
    _reserved: u8,
}

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PeripheralByte {
    #[bits(5)]
    pub device_type: u8,
    /// 0 = connected, 1 = capable but not connected, 3 = not supported.
    #[bits(3)]
    pub qualifier: u8,
}

impl PeripheralByte {
    /// The peripheral device class.
    pub fn peripheral_type(&self) -> PeripheralType {
        PeripheralType(self.device_type())
    }
}

/// Peripheral qualifier meaning "no logical unit at this LUN".
pub const PERIPHERAL_QUALIFIER_NOT_SUPPORTED: u8 = 3;

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct InquiryFlags5 {
    pub protect: bool,
    #[bits(2)]
    _reserved: u8,
    pub third_party_copy: bool,
    /// Asymmetric logical unit access support.
    #[bits(2)]
    pub tpgs: u8,
    pub acc: bool,
    pub sccs: bool,
}

/// The first 36 bytes of standard inquiry data.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct StandardInquiry {
    pub peripheral: PeripheralByte,
    /// Bit 7 is RMB.
    pub removable: u8,
    pub version: u8,
    pub response_format: u8,
    pub additional_length: u8,
    pub flags5: InquiryFlags5,
    pub flags6: u8,
    pub flags7: u8,
    pub vendor_id: [u8; 8],
    pub product_id: [u8; 16],
    pub product_revision: [u8; 4],
}

const _: () = assert!(size_of::<StandardInquiry>() == STANDARD_INQUIRY_LEN);

impl StandardInquiry {
    /// Vendor identification with trailing padding removed.
    pub fn vendor(&self) -> &[u8] {
        trim_ascii(&self.vendor_id)
    }

    /// Product identification with trailing padding removed.
    pub fn product(&self) -> &[u8] {
        trim_ascii(&self.product_id)
    }
}

fn trim_ascii(v: &[u8]) -> &[u8] {
    let end = v
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map_or(0, |p| p + 1);
    &v[..end]
}

/// Header of every VPD page.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VpdPageHeader {
    pub peripheral: PeripheralByte,
    pub page_code: u8,
    pub page_length: U16BE,
}

open_enum! {
    /// Code set of a device identification designator.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum CodeSet: u8 {
        BINARY = 1,
        ASCII = 2,
        UTF8 = 3,
    }
}

open_enum! {
    /// Designator type of a device identification designator.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum DesignatorType: u8 {
        VENDOR_SPECIFIC = 0,
        T10_VENDOR_ID = 1,
        EUI64 = 2,
        NAA = 3,
        RELATIVE_TARGET_PORT = 4,
        TARGET_PORT_GROUP = 5,
        LOGICAL_UNIT_GROUP = 6,
        MD5_LOGICAL_UNIT = 7,
        SCSI_NAME_STRING = 8,
    }
}

open_enum! {
    /// Entity a designator is associated with.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum Association: u8 {
        LOGICAL_UNIT = 0,
        TARGET_PORT = 1,
        TARGET_DEVICE = 2,
    }
}

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DesignatorByte0 {
    #[bits(4)]
    pub code_set: u8,
    #[bits(4)]
    pub protocol_identifier: u8,
}

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DesignatorByte1 {
    #[bits(4)]
    pub designator_type: u8,
    #[bits(2)]
    pub association: u8,
    _reserved: bool,
    pub piv: bool,
}

/// Four-byte header preceding each designator in VPD page 0x83.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DesignatorHeader {
    pub byte0: DesignatorByte0,
    pub byte1: DesignatorByte1,
    pub reserved: u8,
    pub length: u8,
}

/// A parsed designator borrowed from a VPD 0x83 page.
#[derive(Debug, Copy, Clone)]
pub struct Designator<'a> {
    pub code_set: CodeSet,
    pub designator_type: DesignatorType,
    pub association: Association,
    pub value: &'a [u8],
}

/// Iterates the designators of a device identification page, header
/// included. Stops at the first truncated descriptor.
pub fn designators(page: &[u8]) -> impl Iterator<Item = Designator<'_>> {
    let body = match VpdPageHeader::read_from_prefix(page) {
        Ok((header, rest)) if header.page_code == VPD_DEVICE_IDENTIFIERS => {
            let len = (header.page_length.get() as usize).min(rest.len());
            &rest[..len]
        }
        _ => &[][..],
    };
    let mut rest = body;
    core::iter::from_fn(move || {
        let (header, tail) = DesignatorHeader::read_from_prefix(rest).ok()?;
        let len = header.length as usize;
        let value = tail.get(..len)?;
        rest = &tail[len..];
        Some(Designator {
            code_set: CodeSet(header.byte0.code_set()),
            designator_type: DesignatorType(header.byte1.designator_type()),
            association: Association(header.byte1.association()),
            value,
        })
    })
}

/// Returns the serial number from a VPD 0x80 page, trimmed of padding.
pub fn unit_serial_number(page: &[u8]) -> Option<&[u8]> {
    let (header, rest) = VpdPageHeader::read_from_prefix(page).ok()?;
    if header.page_code != VPD_SERIAL_NUMBER {
        return None;
    }
    let len = (header.page_length.get() as usize).min(rest.len());
    Some(trim_ascii(&rest[..len]))
}

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ExtendedInquiryByte4 {
    pub ref_chk: bool,
    pub app_chk: bool,
    pub grd_chk: bool,
    #[bits(3)]
    pub spt: u8,
    #[bits(2)]
    pub activate_microcode: u8,
}

/// Leading fields of the extended inquiry data page (0x86).
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VpdExtendedInquiry {
    pub header: VpdPageHeader,
    pub protection: ExtendedInquiryByte4,
    /// Bit 0 SIMPSUP, bit 1 ORDSUP, bit 2 HEADSUP.
    pub task_attributes: u8,
    pub flags6: u8,
    pub flags7: u8,
}
