// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Unique identifiers for paths and logical devices.
//!
//! The registry is a plain data structure. It never blocks and may be called
//! with other stack locks held.

use crate::device::DeviceId;
use crate::error::UidError;
use bitfield_struct::bitfield;
use scsi_defs::Association;
use scsi_defs::CodeSet;
use scsi_defs::DesignatorType;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Write;

/// Maximum length of a UID string in bytes.
pub const MAX_UID_LEN: usize = 256;

#[bitfield(u32)]
#[derive(PartialEq, Eq, Hash)]
pub struct UidFlags {
    /// The device's primary UID. Exactly one per device.
    pub primary: bool,
    /// A legacy UID kept for compatibility. Cannot be removed.
    pub legacy: bool,
    /// Unique across all devices reachable by the host.
    pub unique: bool,
    /// Stable across reboots.
    pub persistent: bool,
    #[bits(28)]
    _reserved: u32,
}

impl UidFlags {
    const DEFINED: u32 = 0xf;

    /// Flags a UID cached on a path may carry.
    pub const PATH_MASK: u32 = 0xc;

    /// Flags for a derived standard UID.
    pub fn standard() -> Self {
        Self::new().with_unique(true).with_persistent(true)
    }

    fn has_reserved_bits(&self) -> bool {
        self.into_bits() & !Self::DEFINED != 0
    }
}

/// A UID string and its flags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uid {
    pub id: String,
    pub flags: UidFlags,
}

impl Uid {
    pub fn new(id: impl Into<String>, flags: UidFlags) -> Self {
        Self {
            id: id.into(),
            flags,
        }
    }

    /// A primary, unique, persistent UID.
    pub fn primary(id: impl Into<String>) -> Self {
        Self::new(id, UidFlags::standard().with_primary(true))
    }

    fn is_read_only(&self) -> bool {
        self.flags.primary() || self.flags.legacy()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.id)
    }
}

/// Checks the UID string and flags.
pub fn validate(uid: &Uid) -> Result<(), UidError> {
    if uid.id.is_empty() {
        return Err(UidError::InvalidUid);
    }
    if uid.id.len() > MAX_UID_LEN {
        return Err(UidError::NameTooLong);
    }
    if !uid.id.bytes().all(is_uid_char) {
        return Err(UidError::InvalidUid);
    }
    if uid.flags.has_reserved_bits() {
        return Err(UidError::BadParam);
    }
    Ok(())
}

/// Checks a UID that is to be cached on a path.
pub fn validate_path_uid(uid: &Uid) -> Result<(), UidError> {
    validate(uid)?;
    if uid.flags.into_bits() & !UidFlags::PATH_MASK != 0 {
        return Err(UidError::BadParam);
    }
    Ok(())
}

fn is_uid_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'_' | b':' | b',' | b'.')
}

/// Whether two UIDs are the same identifier with the same meaning.
pub fn equal(a: &Uid, b: &Uid) -> bool {
    a.id == b.id && a.flags == b.flags
}

/// UID ownership across all devices.
#[derive(Debug, Default)]
pub struct UidRegistry {
    by_id: HashMap<String, DeviceId>,
    by_device: HashMap<DeviceId, Vec<Uid>>,
}

impl UidRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `uid` to `device`.
    pub fn register_uid(&mut self, device: DeviceId, uid: Uid) -> Result<(), UidError> {
        validate(&uid)?;
        self.check_new(device, &uid)?;
        self.insert(device, uid);
        Ok(())
    }

    /// Attaches all of `uids` to `device`, or none of them.
    pub fn register_all(&mut self, device: DeviceId, uids: &[Uid]) -> Result<(), UidError> {
        for (i, uid) in uids.iter().enumerate() {
            validate(uid)?;
            self.check_new(device, uid)?;
            let earlier = &uids[..i];
            if earlier.iter().any(|u| u.id == uid.id) {
                return Err(UidError::DuplicateUid);
            }
            if uid.flags.primary() && earlier.iter().any(|u| u.flags.primary()) {
                return Err(UidError::TooManyPrimary);
            }
        }
        for uid in uids {
            self.insert(device, uid.clone());
        }
        Ok(())
    }

    fn check_new(&self, device: DeviceId, uid: &Uid) -> Result<(), UidError> {
        if let Some(&owner) = self.by_id.get(&uid.id) {
            return Err(if owner == device {
                UidError::DuplicateUid
            } else {
                UidError::Exists
            });
        }
        if uid.flags.primary() && self.primary(device).is_some() {
            return Err(UidError::TooManyPrimary);
        }
        Ok(())
    }

    fn insert(&mut self, device: DeviceId, uid: Uid) {
        self.by_id.insert(uid.id.clone(), device);
        self.by_device.entry(device).or_default().push(uid);
    }

    /// Detaches a removable UID from `device`.
    pub fn remove_uid(&mut self, device: DeviceId, uid: &Uid) -> Result<(), UidError> {
        if uid.is_read_only() {
            return Err(UidError::ReadOnly);
        }
        let uids = self.by_device.get_mut(&device).ok_or(UidError::NotFound)?;
        let index = uids
            .iter()
            .position(|u| u.id == uid.id)
            .ok_or(UidError::NotFound)?;
        if uids[index].is_read_only() {
            return Err(UidError::ReadOnly);
        }
        uids.remove(index);
        self.by_id.remove(&uid.id);
        Ok(())
    }

    /// Detaches every UID of `device`, read-only ones included.
    pub fn remove_device(&mut self, device: DeviceId) -> Vec<Uid> {
        let uids = self.by_device.remove(&device).unwrap_or_default();
        for uid in &uids {
            self.by_id.remove(&uid.id);
        }
        uids
    }

    pub fn uids(&self, device: DeviceId) -> &[Uid] {
        self.by_device.get(&device).map_or(&[], |v| v.as_slice())
    }

    pub fn primary(&self, device: DeviceId) -> Option<&Uid> {
        self.uids(device).iter().find(|u| u.flags.primary())
    }

    /// Returns the device a UID string is attached to.
    pub fn lookup(&self, id: &str) -> Option<DeviceId> {
        self.by_id.get(id).copied()
    }
}

/// Derives a standard UID from a device identification VPD page.
///
/// Logical-unit designators are preferred in the order NAA, EUI-64, T10
/// vendor id.
pub fn uid_from_evpd83(page: &[u8]) -> Option<Uid> {
    let mut best: Option<(u8, String)> = None;
    for d in scsi_defs::designators(page) {
        if d.association != Association::LOGICAL_UNIT || d.value.is_empty() {
            continue;
        }
        let (rank, id) = match d.designator_type {
            DesignatorType::NAA if d.code_set == CodeSet::BINARY => {
                (0, format!("naa.{}", hex(d.value)))
            }
            DesignatorType::EUI64 if d.code_set == CodeSet::BINARY => {
                (1, format!("eui.{}", hex(d.value)))
            }
            DesignatorType::T10_VENDOR_ID => {
                let text = t10_text(d.value);
                if text.is_empty() {
                    continue;
                }
                (2, format!("t10.{text}"))
            }
            _ => continue,
        };
        if best.as_ref().is_none_or(|(r, _)| rank < *r) {
            best = Some((rank, id));
        }
    }
    let (_, mut id) = best?;
    id.truncate(MAX_UID_LEN);
    Some(Uid::new(id, UidFlags::standard()))
}

fn hex(v: &[u8]) -> String {
    let mut s = String::with_capacity(v.len() * 2);
    for b in v {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Maps T10 ASCII onto the UID character set, collapsing padding.
fn t10_text(v: &[u8]) -> String {
    let mut s = String::with_capacity(v.len());
    let mut pending_sep = false;
    for &c in v {
        if is_uid_char(c) {
            if pending_sep && !s.is_empty() {
                s.push('_');
            }
            pending_sep = false;
            s.push(c as char);
        } else {
            pending_sep = true;
        }
    }
    s
}
