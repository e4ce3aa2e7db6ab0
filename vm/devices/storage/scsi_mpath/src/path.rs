// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Physical paths to logical units.
//!
//! A path is one `(adapter, channel, target, lun)` route. Its state combines
//! the link state learned by probing with an administrative override, and it
//! caches the inquiry data and standard UID seen when it was last probed.

use crate::ScsiStack;
use crate::adapter::AdapterEntry;
use crate::adapter::ScanAction;
use crate::command::Cdb;
use crate::command::CommandCompletion;
use crate::command::ScsiCommand;
use crate::device::DeviceId;
use crate::drain::DrainCounter;
use crate::error::PathError;
use crate::error::ScanError;
use crate::error::ScheduleError;
use crate::plugin::PluginId;
use crate::uid;
use crate::uid::Uid;
use parking_lot::Mutex;
use scsi_defs::AdditionalSenseCode;
use scsi_defs::CdbInquiry;
use scsi_defs::STANDARD_INQUIRY_LEN;
use scsi_defs::ScsiStatus;
use scsi_defs::SenseInfo;
use scsi_defs::SenseKey;
use scsi_defs::StandardInquiry;
use scsi_defs::VPD_DEVICE_IDENTIFIERS;
use scsi_defs::lun_not_ready;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::Instrument;
use zerocopy::FromBytes;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathId(pub(crate) u64);

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathAddress {
    pub adapter: String,
    pub channel: u32,
    pub target: u32,
    pub lun: u32,
}

impl PathAddress {
    pub fn new(adapter: impl Into<String>, channel: u32, target: u32, lun: u32) -> Self {
        Self {
            adapter: adapter.into(),
            channel,
            target,
            lun,
        }
    }
}

impl fmt::Display for PathAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:C{}:T{}:L{}",
            self.adapter, self.channel, self.target, self.lun
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PathState {
    On,
    Off,
    Dead,
    Standby,
    /// The LUN behind the path answered with a different identity. Cleared
    /// when a probe sees the original identity again or the path is
    /// unclaimed.
    DeviceChanged,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AdminState {
    On,
    Off,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PathBoolAttr {
    /// The path leads to a protocol endpoint.
    ProtocolEndpoint,
}

/// Filter for [`ScsiStack::scan`]. `None` fields are wildcards.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub adapter: Option<String>,
    pub channel: Option<u32>,
    pub target: Option<u32>,
    pub lun: Option<u32>,
}

impl ScanFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn adapter(name: impl Into<String>) -> Self {
        Self {
            adapter: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn lun(name: impl Into<String>, channel: u32, target: u32, lun: u32) -> Self {
        Self {
            adapter: Some(name.into()),
            channel: Some(channel),
            target: Some(target),
            lun: Some(lun),
        }
    }
}

pub(crate) struct PathEntry {
    pub id: PathId,
    pub address: PathAddress,
    pub name: String,
    pub adapter: Arc<AdapterEntry>,
    /// Commands in flight on the path.
    pub io: DrainCounter,
    pub state: Mutex<PathInner>,
}

pub(crate) struct PathInner {
    pub link: PathState,
    pub admin_off: bool,
    pub owner: Option<PluginId>,
    pub device: Option<DeviceId>,
    pub inquiry: Option<StandardInquiry>,
    pub uid: Option<Uid>,
    /// Identity seen by a probe that reported `DeviceChanged`.
    pub changed_to: Option<(StandardInquiry, Option<Uid>)>,
    pub removing: bool,
}

impl PathInner {
    pub fn effective(&self) -> PathState {
        if self.admin_off {
            PathState::Off
        } else {
            self.link
        }
    }

    /// Adopts the identity a `DeviceChanged` probe saw.
    pub fn adopt_changed_identity(&mut self) {
        if let Some((inquiry, uid)) = self.changed_to.take() {
            self.inquiry = Some(inquiry);
            self.uid = uid;
        }
    }
}

#[derive(Default)]
pub(crate) struct PathTable {
    paths: HashMap<PathId, Arc<PathEntry>>,
    by_address: HashMap<PathAddress, PathId>,
    next_id: u64,
}

impl PathTable {
    pub fn get(&self, id: PathId) -> Option<Arc<PathEntry>> {
        self.paths.get(&id).cloned()
    }

    pub fn lookup(&self, address: &PathAddress) -> Option<PathId> {
        self.by_address.get(address).copied()
    }

    pub fn insert(
        &mut self,
        address: PathAddress,
        adapter: Arc<AdapterEntry>,
        limit: usize,
    ) -> Result<Arc<PathEntry>, ScanError> {
        if let Some(id) = self.lookup(&address) {
            return Ok(self.paths[&id].clone());
        }
        if self.paths.len() >= limit {
            return Err(ScanError::TooManyPaths { limit });
        }
        let id = PathId(self.next_id);
        self.next_id += 1;
        let entry = Arc::new(PathEntry {
            id,
            name: address.to_string(),
            address: address.clone(),
            adapter,
            io: DrainCounter::new(),
            state: Mutex::new(PathInner {
                link: PathState::Dead,
                admin_off: false,
                owner: None,
                device: None,
                inquiry: None,
                uid: None,
                changed_to: None,
                removing: false,
            }),
        });
        self.by_address.insert(address, id);
        self.paths.insert(id, entry.clone());
        Ok(entry)
    }

    pub fn remove(&mut self, id: PathId) {
        if let Some(entry) = self.paths.remove(&id) {
            self.by_address.remove(&entry.address);
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<PathEntry>> {
        self.paths.values()
    }
}

/// What a successful probe learned.
struct ProbeData {
    state: PathState,
    inquiry: StandardInquiry,
    uid: Option<Uid>,
}

fn same_device(a: &StandardInquiry, b: &StandardInquiry) -> bool {
    a.peripheral.peripheral_type() == b.peripheral.peripheral_type()
        && a.vendor() == b.vendor()
        && a.product() == b.product()
}

impl ScsiStack {
    pub(crate) fn path_entry(&self, path: PathId) -> Result<Arc<PathEntry>, PathError> {
        self.inner
            .paths
            .read()
            .get(path)
            .ok_or(PathError::NotFound(path))
    }

    /// All paths, in creation order.
    pub fn paths(&self) -> Vec<PathId> {
        let mut paths: Vec<_> = self.inner.paths.read().entries().map(|e| e.id).collect();
        paths.sort();
        paths
    }

    pub(crate) fn adapter_paths(&self, adapter: &str) -> Vec<PathId> {
        let mut paths: Vec<_> = self
            .inner
            .paths
            .read()
            .entries()
            .filter(|e| e.address.adapter == adapter)
            .map(|e| e.id)
            .collect();
        paths.sort();
        paths
    }

    pub fn find_path(&self, address: &PathAddress) -> Option<PathId> {
        self.inner.paths.read().lookup(address)
    }

    /// The effective state: `Off` while administratively disabled, the probed
    /// link state otherwise.
    pub fn path_state(&self, path: PathId) -> Result<PathState, PathError> {
        Ok(self.path_entry(path)?.state.lock().effective())
    }

    pub fn path_address(&self, path: PathId) -> Result<PathAddress, PathError> {
        Ok(self.path_entry(path)?.address.clone())
    }

    pub fn path_name(&self, path: PathId) -> Result<String, PathError> {
        Ok(self.path_entry(path)?.name.clone())
    }

    pub fn path_owner(&self, path: PathId) -> Result<Option<PluginId>, PathError> {
        Ok(self.path_entry(path)?.state.lock().owner)
    }

    /// The device the path currently backs, if any.
    pub fn path_device(&self, path: PathId) -> Result<Option<DeviceId>, PathError> {
        Ok(self.path_entry(path)?.state.lock().device)
    }

    pub fn path_inquiry(&self, path: PathId) -> Result<Option<StandardInquiry>, PathError> {
        Ok(self.path_entry(path)?.state.lock().inquiry)
    }

    /// The standard UID derived from the LUN's device identification page.
    pub fn path_uid(&self, path: PathId) -> Result<Option<Uid>, PathError> {
        Ok(self.path_entry(path)?.state.lock().uid.clone())
    }

    pub fn path_outstanding(&self, path: PathId) -> Result<usize, PathError> {
        Ok(self.path_entry(path)?.io.count())
    }

    pub fn path_bool_attr(&self, path: PathId, attr: PathBoolAttr) -> Result<bool, PathError> {
        let entry = self.path_entry(path)?;
        Ok(entry.adapter.adapter.path_bool_attr(&entry.address, attr))
    }

    /// Administratively enables or disables a path. The owning plugin is told
    /// about the resulting state.
    pub fn set_admin_state(&self, path: PathId, state: AdminState) -> Result<(), PathError> {
        let entry = self.path_entry(path)?;
        let (owner, effective) = {
            let mut inner = entry.state.lock();
            inner.admin_off = state == AdminState::Off;
            (inner.owner, inner.effective())
        };
        tracing::info!(path = %entry.name, ?state, ?effective, "path admin state changed");
        if let Some(plugin) = owner {
            self.notify_owner(plugin, &entry, effective);
        }
        Ok(())
    }

    /// Tells the owner about a state change it did not make itself.
    fn notify_owner(&self, plugin: PluginId, entry: &PathEntry, state: PathState) {
        let Some(mp) = self.enabled_multipath(plugin) else {
            return;
        };
        if let Err(err) = mp.path_set_state(self, plugin, entry.id, state) {
            tracing::warn!(
                path = %entry.name,
                error = &*err as &dyn std::error::Error,
                "plugin rejected path state notification"
            );
        }
    }

    /// Marks a path whose LUN stopped answering discovery as dead.
    pub(crate) fn mark_dead(&self, entry: &PathEntry) {
        let owner = {
            let mut inner = entry.state.lock();
            if inner.link == PathState::Dead {
                return;
            }
            inner.link = PathState::Dead;
            inner.owner
        };
        tracing::info!(path = %entry.name, "path dead");
        if let Some(plugin) = owner {
            self.notify_owner(plugin, entry, PathState::Dead);
        }
    }

    /// Publishes a link state learned by the owning plugin.
    pub fn set_path_state(
        &self,
        plugin: PluginId,
        path: PathId,
        state: PathState,
    ) -> Result<(), PathError> {
        let entry = self.path_entry(path)?;
        let mut inner = entry.state.lock();
        if inner.owner != Some(plugin) {
            return Err(PathError::NoPermission(path));
        }
        if inner.link != state {
            tracing::debug!(path = %entry.name, from = ?inner.link, to = ?state, "path state");
            inner.link = state;
        }
        Ok(())
    }

    /// Probes the path through its owner if it has an enabled one, otherwise
    /// directly.
    pub async fn probe(&self, path: PathId) -> Result<PathState, PathError> {
        let entry = self.path_entry(path)?;
        let (owner, admin_off) = {
            let inner = entry.state.lock();
            (inner.owner, inner.admin_off)
        };
        if admin_off {
            return Ok(PathState::Off);
        }
        let mp = owner.and_then(|plugin| Some((plugin, self.enabled_multipath(plugin)?)));
        let Some((plugin, mp)) = mp else {
            return self.probe_direct(path).await;
        };
        match mp.probe_path(self, plugin, path).await {
            Ok(state) => {
                // The plugin may have lost the path meanwhile.
                let _ = self.set_path_state(plugin, path, state);
                self.path_state(path)
            }
            Err(source) => Err(PathError::Probe { path, source }),
        }
    }

    /// Issues TEST UNIT READY and INQUIRY straight to the adapter and updates
    /// the cached state and identity.
    pub async fn probe_direct(&self, path: PathId) -> Result<PathState, PathError> {
        let entry = self.path_entry(path)?;
        {
            let inner = entry.state.lock();
            if inner.removing {
                return Err(PathError::Removing(path));
            }
            if inner.admin_off {
                return Ok(PathState::Off);
            }
        }

        let result = self.probe_io(path).await;
        let state = self.apply_probe(&entry, result);
        Ok(state)
    }

    fn apply_probe(&self, entry: &PathEntry, result: anyhow::Result<ProbeData>) -> PathState {
        let mut inner = entry.state.lock();
        let old = inner.link;
        match result {
            Ok(data) => {
                let inquiry_changed = inner
                    .inquiry
                    .as_ref()
                    .is_some_and(|cached| !same_device(cached, &data.inquiry));
                let uid_changed = match (&inner.uid, &data.uid) {
                    (Some(a), Some(b)) => !uid::equal(a, b),
                    _ => false,
                };
                if inquiry_changed || uid_changed {
                    inner.link = PathState::DeviceChanged;
                    inner.changed_to = Some((data.inquiry, data.uid));
                } else {
                    inner.link = data.state;
                    inner.changed_to = None;
                    inner.inquiry = Some(data.inquiry);
                    if data.uid.is_some() {
                        inner.uid = data.uid;
                    }
                }
            }
            Err(err) => {
                inner.link = PathState::Dead;
                tracing::debug!(
                    path = %entry.name,
                    error = &*err as &dyn std::error::Error,
                    "probe failed"
                );
            }
        }
        if old != inner.link {
            tracing::info!(path = %entry.name, from = ?old, to = ?inner.link, "path state");
        }
        inner.effective()
    }

    async fn probe_io(&self, path: PathId) -> anyhow::Result<ProbeData> {
        let tur = self
            .issue_sync_direct(path, ScsiCommand::new(self.internal_id(), Cdb::test_unit_ready()))
            .await?;
        let state = if tur.is_successful() {
            PathState::On
        } else if is_standby(&tur) {
            PathState::Standby
        } else {
            anyhow::bail!("test unit ready failed with {:?}", tur.status);
        };

        let cdb = Cdb::from_layout(&CdbInquiry::standard(STANDARD_INQUIRY_LEN as u16))?;
        let inquiry = self
            .issue_sync_direct(
                path,
                ScsiCommand::new(self.internal_id(), cdb).read(STANDARD_INQUIRY_LEN),
            )
            .await?;
        if !inquiry.is_successful() {
            anyhow::bail!("inquiry failed with {:?}", inquiry.status);
        }
        let (inquiry, _) = StandardInquiry::read_from_prefix(&inquiry.data)
            .map_err(|_| anyhow::anyhow!("short inquiry data"))?;

        let cdb = Cdb::from_layout(&CdbInquiry::vpd(VPD_DEVICE_IDENTIFIERS, 255))?;
        let uid = match self
            .issue_sync_direct(path, ScsiCommand::new(self.internal_id(), cdb).read(255))
            .await
        {
            Ok(page) if page.is_successful() => page_uid(&page),
            _ => None,
        };

        Ok(ProbeData {
            state,
            inquiry,
            uid,
        })
    }

    /// Schedules a probe on the stack's spawner, retrying failed probes.
    pub fn probe_async(&self, path: PathId) -> Result<(), ScheduleError> {
        let name = self
            .path_entry(path)
            .map_err(|_| ScheduleError::NotFound(path))?
            .name
            .clone();
        let stack = self.clone();
        let retries = self.inner.config.probe_retries;
        let task = async move {
            for attempt in 0..=retries {
                match stack.probe(path).await {
                    Ok(PathState::Dead) | Err(PathError::Probe { .. }) if attempt < retries => {}
                    Ok(state) => {
                        tracing::debug!(?state, "async probe done");
                        return;
                    }
                    Err(err) => {
                        tracing::debug!(
                            error = &err as &dyn std::error::Error,
                            "async probe abandoned"
                        );
                        return;
                    }
                }
            }
        };
        self.spawn(task.instrument(tracing::debug_span!("probe_async", path = %name)))
            .map_err(ScheduleError::Spawn)
    }

    /// Removes a path: unclaims it, waits for its commands to drain and drops
    /// it from the table. The owner must detach the path from its device
    /// while unclaiming it.
    ///
    /// Returns false if the path does not exist or unclaiming failed. A path
    /// that still backs a device keeps its owner.
    pub async fn remove_path(&self, path: PathId) -> bool {
        let Ok(entry) = self.path_entry(path) else {
            return false;
        };
        let owner = entry.state.lock().owner;
        if let Some(plugin) = owner {
            if let Err(err) = self.unclaim_path(plugin, path).await {
                tracing::warn!(
                    path = %entry.name,
                    error = &err as &dyn std::error::Error,
                    "path removal failed"
                );
                return false;
            }
        }

        {
            let mut inner = entry.state.lock();
            if inner.removing || inner.owner.is_some() || inner.device.is_some() {
                return false;
            }
            inner.removing = true;
        }

        entry.io.wait().await;
        self.inner.paths.write().remove(path);
        let PathAddress {
            channel,
            target,
            lun,
            ..
        } = entry.address;
        if let Err(err) = entry
            .adapter
            .adapter
            .discover(ScanAction::DestroyPath, channel, target, lun)
            .await
        {
            tracing::warn!(
                path = %entry.name,
                error = &*err as &dyn std::error::Error,
                "adapter failed to release path"
            );
        }
        tracing::info!(path = %entry.name, "path removed");
        true
    }

    /// Lets the owner adopt the new identity behind a `DeviceChanged` path
    /// and returns the path to `On`.
    pub fn clear_device_changed(&self, plugin: PluginId, path: PathId) -> Result<(), PathError> {
        let entry = self.path_entry(path)?;
        let mut inner = entry.state.lock();
        if inner.owner != Some(plugin) {
            return Err(PathError::NoPermission(path));
        }
        if inner.link == PathState::DeviceChanged {
            inner.adopt_changed_identity();
            inner.link = PathState::On;
        }
        Ok(())
    }

    /// Paths that are neither claimed nor being removed.
    pub(crate) fn unclaimed_paths(&self) -> Vec<PathId> {
        let mut paths: Vec<_> = self
            .inner
            .paths
            .read()
            .entries()
            .filter(|e| {
                let inner = e.state.lock();
                inner.owner.is_none() && !inner.removing
            })
            .map(|e| e.id)
            .collect();
        paths.sort();
        paths
    }

    pub(crate) fn owned_paths(&self, plugin: PluginId) -> Vec<PathId> {
        let mut paths: Vec<_> = self
            .inner
            .paths
            .read()
            .entries()
            .filter(|e| e.state.lock().owner == Some(plugin))
            .map(|e| e.id)
            .collect();
        paths.sort();
        paths
    }
}

fn is_standby(c: &CommandCompletion) -> bool {
    c.status.device == ScsiStatus::CHECK_CONDITION
        && SenseInfo::parse(&c.sense).is_some_and(|s| {
            s.key == SenseKey::NOT_READY
                && s.asc == AdditionalSenseCode::LUN_NOT_READY
                && s.ascq == lun_not_ready::ALUA_STANDBY
        })
}

fn page_uid(page: &CommandCompletion) -> Option<Uid> {
    let uid = uid::uid_from_evpd83(&page.data[..page.bytes_transferred.min(page.data.len())])?;
    uid::validate_path_uid(&uid).ok()?;
    Some(uid)
}
