// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Sense data formats and codes.

use open_enum::open_enum;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

open_enum! {
    /// Sense key (SPC-3 table 27).
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    #[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
    pub enum SenseKey: u8 {
        NO_SENSE = 0x00,
        RECOVERED_ERROR = 0x01,
        NOT_READY = 0x02,
        MEDIUM_ERROR = 0x03,
        HARDWARE_ERROR = 0x04,
        ILLEGAL_REQUEST = 0x05,
        UNIT_ATTENTION = 0x06,
        DATA_PROTECT = 0x07,
        BLANK_CHECK = 0x08,
        VENDOR_SPECIFIC = 0x09,
        COPY_ABORTED = 0x0A,
        ABORTED_COMMAND = 0x0B,
        VOLUME_OVERFLOW = 0x0D,
        MISCOMPARE = 0x0E,
    }
}

open_enum! {
    /// Response code in byte 0 of sense data.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum SenseResponseCode: u8 {
        FIXED_CURRENT = 0x70,
        FIXED_DEFERRED = 0x71,
        DESCRIPTOR_CURRENT = 0x72,
        DESCRIPTOR_DEFERRED = 0x73,
    }
}

open_enum! {
    /// Additional sense code (ASC).
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    #[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
    pub enum AdditionalSenseCode: u8 {
        NO_ADDITIONAL_SENSE = 0x00,
        LUN_NOT_READY = 0x04,
        LUN_COMMUNICATION = 0x08,
        WRITE_ERROR = 0x0C,
        LOGICAL_BLOCK_PROTECTION = 0x10,
        UNRECOVERED_READ_ERROR = 0x11,
        MISCOMPARE_DURING_VERIFY = 0x1D,
        INVALID_COMMAND_OPCODE = 0x20,
        LBA_OUT_OF_RANGE = 0x21,
        INVALID_FIELD_IN_CDB = 0x24,
        LUN_NOT_SUPPORTED = 0x25,
        INVALID_FIELD_IN_PARAMETER_LIST = 0x26,
        WRITE_PROTECTED = 0x27,
        MEDIUM_CHANGED = 0x28,
        POWER_ON_OR_RESET = 0x29,
        PARAMETERS_CHANGED = 0x2A,
        COMMANDS_CLEARED = 0x2F,
        MEDIUM_NOT_PRESENT = 0x3A,
        TARGET_CONDITIONS_CHANGED = 0x3F,
        INTERNAL_TARGET_FAILURE = 0x44,
        THIN_PROVISIONING_THRESHOLD = 0x38,
        INSUFFICIENT_RESOURCES = 0x55,
    }
}

/// ASCQ values for [`AdditionalSenseCode::LUN_NOT_READY`].
pub mod lun_not_ready {
    /// Cause not reportable.
    pub const CAUSE_NOT_REPORTABLE: u8 = 0x00;
    /// Becoming ready.
    pub const BECOMING_READY: u8 = 0x01;
    /// Initializing command required.
    pub const INIT_COMMAND_REQUIRED: u8 = 0x02;
    /// Manual intervention required.
    pub const MANUAL_INTERVENTION: u8 = 0x03;
    /// Format in progress.
    pub const FORMAT_IN_PROGRESS: u8 = 0x04;
    /// Asymmetric access state transition.
    pub const ALUA_TRANSITION: u8 = 0x0A;
    /// Target port in standby state.
    pub const ALUA_STANDBY: u8 = 0x0B;
    /// Target port in unavailable state.
    pub const ALUA_UNAVAILABLE: u8 = 0x0C;
}

/// ASCQ values for [`AdditionalSenseCode::LUN_NOT_SUPPORTED`].
pub mod lun_not_supported {
    /// Logical unit not supported. Permanent device loss.
    pub const NOT_SUPPORTED: u8 = 0x00;
}

/// ASCQ values for [`AdditionalSenseCode::TARGET_CONDITIONS_CHANGED`].
pub mod target_conditions_changed {
    /// Inquiry data has changed.
    pub const INQUIRY_DATA_CHANGED: u8 = 0x03;
    /// Reported LUNs data has changed.
    pub const REPORTED_LUNS_DATA_CHANGED: u8 = 0x0E;
}

/// ASCQ values for [`AdditionalSenseCode::PARAMETERS_CHANGED`].
pub mod parameters_changed {
    /// Reservations preempted.
    pub const RESERVATIONS_PREEMPTED: u8 = 0x03;
    /// Reservations released.
    pub const RESERVATIONS_RELEASED: u8 = 0x04;
    /// Registrations preempted.
    pub const REGISTRATIONS_PREEMPTED: u8 = 0x05;
    /// Asymmetric access state changed.
    pub const ALUA_STATE_CHANGED: u8 = 0x06;
    /// Capacity data has changed.
    pub const CAPACITY_DATA_CHANGED: u8 = 0x09;
}

/// Fixed-format sense data.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SenseData {
    pub response_code: SenseResponseCode,
    pub obsolete: u8,
    /// Low four bits hold the sense key.
    pub flags_key: u8,
    pub information: [u8; 4],
    pub additional_sense_length: u8,
    pub command_specific_information: [u8; 4],
    pub additional_sense_code: AdditionalSenseCode,
    pub additional_sense_code_qualifier: u8,
    pub field_replaceable_unit_code: u8,
    pub sense_key_specific: [u8; 3],
}

impl SenseData {
    /// Builds current fixed-format sense data.
    pub const fn new(key: SenseKey, asc: AdditionalSenseCode, ascq: u8) -> Self {
        SenseData {
            response_code: SenseResponseCode::FIXED_CURRENT,
            obsolete: 0,
            flags_key: key.0 & 0xf,
            information: [0; 4],
            additional_sense_length: (size_of::<SenseData>() - 8) as u8,
            command_specific_information: [0; 4],
            additional_sense_code: asc,
            additional_sense_code_qualifier: ascq,
            field_replaceable_unit_code: 0,
            sense_key_specific: [0; 3],
        }
    }
}

/// The key/ASC/ASCQ triple, independent of the sense format it came from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SenseInfo {
    /// Sense key.
    pub key: SenseKey,
    /// Additional sense code.
    pub asc: AdditionalSenseCode,
    /// Additional sense code qualifier.
    pub ascq: u8,
}

impl SenseInfo {
    /// Extracts key, ASC and ASCQ from fixed or descriptor format sense.
    ///
    /// Returns `None` for an unrecognized response code or a truncated buffer.
    pub fn parse(sense: &[u8]) -> Option<Self> {
        let code = SenseResponseCode(*sense.first()? & 0x7f);
        match code {
            SenseResponseCode::FIXED_CURRENT | SenseResponseCode::FIXED_DEFERRED => {
                Some(Self {
                    key: SenseKey(sense.get(2)? & 0xf),
                    asc: AdditionalSenseCode(*sense.get(12)?),
                    ascq: *sense.get(13)?,
                })
            }
            SenseResponseCode::DESCRIPTOR_CURRENT | SenseResponseCode::DESCRIPTOR_DEFERRED => {
                Some(Self {
                    key: SenseKey(sense.get(1)? & 0xf),
                    asc: AdditionalSenseCode(*sense.get(2)?),
                    ascq: *sense.get(3)?,
                })
            }
            _ => None,
        }
    }

    /// Whether the sense reports permanent loss of the logical unit.
    pub fn is_lun_not_supported(&self) -> bool {
        self.key == SenseKey::ILLEGAL_REQUEST
            && self.asc == AdditionalSenseCode::LUN_NOT_SUPPORTED
            && self.ascq == lun_not_supported::NOT_SUPPORTED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fixed_and_descriptor() {
        let fixed = SenseData::new(
            SenseKey::UNIT_ATTENTION,
            AdditionalSenseCode::PARAMETERS_CHANGED,
            parameters_changed::CAPACITY_DATA_CHANGED,
        );
        let info = SenseInfo::parse(fixed.as_bytes()).unwrap();
        assert_eq!(info.key, SenseKey::UNIT_ATTENTION);
        assert_eq!(info.asc, AdditionalSenseCode::PARAMETERS_CHANGED);
        assert_eq!(info.ascq, 0x09);

        let descriptor = [0x72, 0x05, 0x25, 0x00, 0, 0, 0, 0];
        let info = SenseInfo::parse(&descriptor).unwrap();
        assert!(info.is_lun_not_supported());

        assert!(SenseInfo::parse(&[]).is_none());
        assert!(SenseInfo::parse(&[0x70, 0, 0x06]).is_none());
        assert!(SenseInfo::parse(&[0x12; 18]).is_none());
    }
}
