// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Persistent reservation service actions and reservation types.

use crate::ScsiOp;
use crate::U32BE;
use crate::U64BE;
use open_enum::open_enum;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

open_enum! {
    /// PERSISTENT RESERVE IN service actions.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum PrInServiceAction: u8 {
        READ_KEYS = 0x00,
        READ_RESERVATION = 0x01,
        REPORT_CAPABILITIES = 0x02,
        READ_FULL_STATUS = 0x03,
    }
}

open_enum! {
    /// PERSISTENT RESERVE OUT service actions.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum PrOutServiceAction: u8 {
        REGISTER = 0x00,
        RESERVE = 0x01,
        RELEASE = 0x02,
        CLEAR = 0x03,
        PREEMPT = 0x04,
        PREEMPT_AND_ABORT = 0x05,
        REGISTER_AND_IGNORE_EXISTING_KEY = 0x06,
        REGISTER_AND_MOVE = 0x07,
        REPLACE_LOST_RESERVATION = 0x08,
    }
}

open_enum! {
    /// Persistent reservation type.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum PrType: u8 {
        WRITE_EXCLUSIVE = 0x01,
        EXCLUSIVE_ACCESS = 0x03,
        WRITE_EXCLUSIVE_REGISTRANTS_ONLY = 0x05,
        EXCLUSIVE_ACCESS_REGISTRANTS_ONLY = 0x06,
        WRITE_EXCLUSIVE_ALL_REGISTRANTS = 0x07,
        EXCLUSIVE_ACCESS_ALL_REGISTRANTS = 0x08,
    }
}

impl PrOutServiceAction {
    /// Whether the action changes reservation ownership, which bumps the
    /// device's reservation generation.
    pub fn changes_reservation(self) -> bool {
        matches!(
            self,
            Self::RESERVE
                | Self::RELEASE
                | Self::CLEAR
                | Self::PREEMPT
                | Self::PREEMPT_AND_ABORT
                | Self::REGISTER_AND_MOVE
                | Self::REPLACE_LOST_RESERVATION
        )
    }
}

/// PERSISTENT RESERVE OUT CDB.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PersistentReserveOut {
    pub operation_code: ScsiOp,
    /// Low five bits hold the service action.
    pub service_action: u8,
    /// Scope in the high nibble, type in the low nibble.
    pub scope_type: u8,
    pub reserved: [u8; 2],
    pub parameter_list_length: U32BE,
    pub control: u8,
}

/// Basic PERSISTENT RESERVE OUT parameter list.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PrOutParameterList {
    pub reservation_key: U64BE,
    pub service_action_reservation_key: U64BE,
    pub obsolete: [u8; 4],
    pub flags: u8,
    pub reserved: u8,
    pub obsolete2: [u8; 2],
}
