// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Three-level command completion status codes.
//!
//! A completion carries a plugin status, a host (transport) status and the
//! device's SCSI status byte. They are evaluated in that order.

use open_enum::open_enum;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

open_enum! {
    /// SAM status byte returned by the logical unit.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    #[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
    pub enum ScsiStatus: u8 {
        GOOD = 0x00,
        CHECK_CONDITION = 0x02,
        CONDITION_MET = 0x04,
        BUSY = 0x08,
        INTERMEDIATE = 0x10,
        INTERMEDIATE_COND_MET = 0x14,
        RESERVATION_CONFLICT = 0x18,
        COMMAND_TERMINATED = 0x22,
        QUEUE_FULL = 0x28,
        ACA_ACTIVE = 0x30,
        TASK_ABORTED = 0x40,
    }
}

open_enum! {
    /// Status reported by the adapter/transport for a command.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    #[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
    pub enum HostStatus: u8 {
        OK = 0x00,
        /// The target could not be reached.
        NO_CONNECT = 0x01,
        BUS_BUSY = 0x02,
        TIMEOUT = 0x03,
        ABORT = 0x05,
        PARITY = 0x06,
        /// Generic transport error.
        ERROR = 0x07,
        RESET = 0x08,
        /// Deprecated alias of `RETRY`.
        SOFT_ERROR = 0x0b,
        RETRY = 0x0c,
        PI_GUARD_ERROR = 0x0d,
        PI_REF_TAG_ERROR = 0x0e,
        PI_GENERIC_ERROR = 0x0f,
    }
}

open_enum! {
    /// Status synthesized by the multipathing plugin or the stack itself.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    #[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
    pub enum PluginStatus: u8 {
        GOOD = 0,
        /// A transient condition; the stack retries.
        TRANSIENT = 1,
        SNAPSHOT = 2,
        /// The reservation held when the command was issued was lost.
        RESERVATION_LOST = 3,
        /// The plugin asks the stack to queue the command again.
        REQUEUE = 4,
        ATS_MISCOMPARE = 5,
        THINPROV_BUSY_GROWING = 6,
        THINPROV_ATQUOTA = 7,
        THINPROV_NOSPACE = 8,
    }
}

impl HostStatus {
    /// Whether the status names an end-to-end protection information error.
    pub fn is_protection_error(self) -> bool {
        matches!(
            self,
            Self::PI_GUARD_ERROR | Self::PI_REF_TAG_ERROR | Self::PI_GENERIC_ERROR
        )
    }
}
