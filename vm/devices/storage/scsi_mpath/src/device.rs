// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Logical devices built by multipath plugins from their claimed paths.
//!
//! A device slot is allocated by its plugin, registered with its UIDs, paths
//! and [`DeviceOps`], and later unregistered and freed. Registration makes
//! the device visible to [`ScsiStack::submit`].

use crate::ScsiStack;
use crate::command::Cdb;
use crate::command::CmdStatus;
use crate::command::InitiatorFilter;
use crate::command::TaskMgmt;
use crate::dispatch::Queued;
use crate::drain::DrainCounter;
use crate::error::DeviceError;
use crate::error::DumpError;
use crate::error::RegisterError;
use crate::path::PathId;
use crate::plugin::PluginEntry;
use crate::plugin::PluginId;
use crate::plugin::PluginKind;
use crate::plugin::VaaiPrimitives;
use crate::uid::Uid;
use parking_lot::Mutex;
use scsi_defs::HostStatus;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub(crate) u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceState {
    On,
    Off,
    /// All paths down. Commands stay queued until the device comes back or
    /// they are flushed.
    Apd,
    /// Draining for unregistration. New commands are refused.
    Quiesced,
    /// Terminal. Every command fails.
    PermanentLoss,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceStateInfo {
    None,
    HwError,
    UuidChange,
    Unmap,
    Other,
    Unregister,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceBoolAttr {
    Pseudo,
    Ssd,
    Local,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProbeRate {
    Default,
    Fast,
}

/// Device callbacks supplied by the owning multipath plugin.
#[async_trait::async_trait]
pub trait DeviceOps: Send + Sync {
    /// New work is queued on the device. The plugin pulls it with
    /// [`ScsiStack::get_next_command`] until that returns `None`; it is not
    /// notified again before then. Must not block.
    fn start_command(&self, stack: &ScsiStack, device: DeviceId);

    /// Carries out a task management request on the device's paths.
    async fn task_mgmt(
        &self,
        stack: &ScsiStack,
        device: DeviceId,
        request: &TaskMgmt,
    ) -> anyhow::Result<()>;

    async fn open(&self, stack: &ScsiStack, device: DeviceId) -> anyhow::Result<()> {
        let _ = (stack, device);
        Ok(())
    }

    async fn close(&self, stack: &ScsiStack, device: DeviceId) -> anyhow::Result<()> {
        let _ = (stack, device);
        Ok(())
    }

    /// Probes every path of the device.
    async fn probe(&self, stack: &ScsiStack, device: DeviceId) -> anyhow::Result<()>;

    /// Returns standard inquiry data, or the VPD page `page`.
    async fn get_inquiry(
        &self,
        stack: &ScsiStack,
        device: DeviceId,
        page: Option<u8>,
    ) -> anyhow::Result<Vec<u8>>;

    /// Runs a polled command without interrupts or scheduling.
    fn issue_dump_cmd(
        &self,
        stack: &ScsiStack,
        device: DeviceId,
        cdb: &Cdb,
        data: &mut [u8],
    ) -> anyhow::Result<CmdStatus>;

    fn get_bool_attr(&self, device: DeviceId, attr: DeviceBoolAttr) -> bool;

    /// Told when the device is administratively switched on or off.
    fn notify_device_event(&self, stack: &ScsiStack, device: DeviceId, state: DeviceState) {
        let _ = (stack, device, state);
    }

    fn path_names(&self, stack: &ScsiStack, device: DeviceId) -> Vec<String> {
        stack
            .device_paths(device)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|path| stack.path_name(path).ok())
            .collect()
    }
}

/// Everything needed to register an allocated device.
#[derive(Default)]
pub struct DeviceRegistration {
    /// Exactly one must be primary.
    pub uids: Vec<Uid>,
    /// Paths claimed by the device's plugin.
    pub paths: Vec<PathId>,
    pub ops: Option<Arc<dyn DeviceOps>>,
    pub block_size: u32,
    pub block_count: u64,
}

pub(crate) struct DeviceEntry {
    pub id: DeviceId,
    pub plugin: PluginId,
    pub reserve_generation: AtomicU64,
    /// Commands queued on or dispatched from the device.
    pub io: DrainCounter,
    /// Outstanding task management requests.
    pub tm: DrainCounter,
    pub inner: Mutex<DeviceInner>,
}

pub(crate) struct DeviceInner {
    pub registered: bool,
    pub unregistering: bool,
    pub state: DeviceState,
    pub info: DeviceStateInfo,
    pub paths: Vec<PathId>,
    pub ops: Option<Arc<dyn DeviceOps>>,
    pub open_count: u32,
    pub max_queue_depth: u32,
    /// Commands handed to the plugin and not yet completed.
    pub active: u32,
    pub block_size: u32,
    pub block_count: u64,
    pub probe_rate: ProbeRate,
    pub one_probe_only: bool,
    /// The filter or VAAI plugin attached to the device.
    pub filter: Option<PluginId>,
    pub queue: VecDeque<Queued>,
    /// Set once the plugin has seen `get_next_command` return `None`.
    pub start_armed: bool,
}

impl DeviceInner {
    /// Whether queued commands are handed to the plugin.
    pub fn dispatching(&self) -> bool {
        matches!(self.state, DeviceState::On | DeviceState::Quiesced)
    }

    /// Consumes the start notification if the plugin should be told about
    /// queued work.
    pub fn take_start(&mut self) -> bool {
        if self.start_armed
            && self.dispatching()
            && !self.queue.is_empty()
            && self.active < self.max_queue_depth
        {
            self.start_armed = false;
            true
        } else {
            false
        }
    }
}

impl DeviceEntry {
    pub fn ops(&self) -> Option<Arc<dyn DeviceOps>> {
        self.inner.lock().ops.clone()
    }

    pub fn generation(&self) -> u64 {
        self.reserve_generation.load(Ordering::Acquire)
    }
}

#[derive(Default)]
pub(crate) struct DeviceTable {
    devices: HashMap<DeviceId, Arc<DeviceEntry>>,
    next_id: u32,
}

impl DeviceTable {
    pub fn get(&self, id: DeviceId) -> Option<Arc<DeviceEntry>> {
        self.devices.get(&id).cloned()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<DeviceEntry>> {
        self.devices.values()
    }
}

fn no_connect() -> CmdStatus {
    CmdStatus::host(HostStatus::NO_CONNECT)
}

impl ScsiStack {
    pub(crate) fn device_entry(&self, device: DeviceId) -> Result<Arc<DeviceEntry>, DeviceError> {
        self.inner
            .devices
            .read()
            .get(device)
            .ok_or(DeviceError::NotFound(device))
    }

    fn registered_ops(&self, device: DeviceId) -> Result<Arc<dyn DeviceOps>, DeviceError> {
        let entry = self.device_entry(device)?;
        let inner = entry.inner.lock();
        match &inner.ops {
            Some(ops) if inner.registered => Ok(ops.clone()),
            _ => Err(DeviceError::NotRegistered),
        }
    }

    /// Reserves a device slot for `plugin`. A successful allocation
    /// guarantees that registering the device cannot run out of slots.
    pub fn allocate_device(&self, plugin: PluginId) -> Result<DeviceId, DeviceError> {
        let entry = self
            .plugin_entry(plugin)
            .map_err(|_| DeviceError::NotSupported)?;
        if entry.multipath().is_none() {
            return Err(DeviceError::NotSupported);
        }
        let limit = self.inner.config.max_devices;
        let mut devices = self.inner.devices.write();
        if devices.devices.len() >= limit {
            return Err(DeviceError::TooManyDevices { limit });
        }
        let id = DeviceId(devices.next_id);
        devices.next_id += 1;
        devices.devices.insert(
            id,
            Arc::new(DeviceEntry {
                id,
                plugin,
                reserve_generation: AtomicU64::new(0),
                io: DrainCounter::new(),
                tm: DrainCounter::new(),
                inner: Mutex::new(DeviceInner {
                    registered: false,
                    unregistering: false,
                    state: DeviceState::Off,
                    info: DeviceStateInfo::None,
                    paths: Vec::new(),
                    ops: None,
                    open_count: 0,
                    max_queue_depth: self.inner.config.default_queue_depth,
                    active: 0,
                    block_size: 0,
                    block_count: 0,
                    probe_rate: ProbeRate::Default,
                    one_probe_only: false,
                    filter: None,
                    queue: VecDeque::new(),
                    start_armed: true,
                }),
            }),
        );
        tracing::debug!(device = %id, plugin = %entry.name, "device allocated");
        Ok(id)
    }

    /// Attaches the UIDs and paths and makes the device available for I/O.
    /// Filter and VAAI plugins are then offered the device.
    pub async fn register_device(
        &self,
        device: DeviceId,
        registration: DeviceRegistration,
    ) -> Result<(), RegisterError> {
        let DeviceRegistration {
            uids,
            paths,
            ops,
            block_size,
            block_count,
        } = registration;

        let entry = self
            .device_entry(device)
            .map_err(|_| RegisterError::NoDevice(device))?;
        if entry.inner.lock().registered {
            return Err(RegisterError::AlreadyRegistered);
        }
        if uids.is_empty() {
            return Err(RegisterError::BadParam("no uids"));
        }
        if uids.iter().filter(|u| u.flags.primary()).count() != 1 {
            return Err(RegisterError::BadParam("exactly one primary uid is required"));
        }
        let Some(ops) = ops else {
            return Err(RegisterError::BadParam("device ops are unset"));
        };
        match self.plugin_entry(entry.plugin) {
            Ok(plugin) if plugin.multipath().is_some() => {}
            _ => return Err(RegisterError::NotSupported),
        }
        if paths.is_empty() {
            return Err(RegisterError::NotFound);
        }
        let mut path_entries = Vec::with_capacity(paths.len());
        for &path in &paths {
            let path_entry = self
                .path_entry(path)
                .map_err(|_| RegisterError::BadParam("unknown path"))?;
            {
                let inner = path_entry.state.lock();
                if inner.owner != Some(entry.plugin) {
                    return Err(RegisterError::BadParam("path is not claimed by the plugin"));
                }
                if inner.device.is_some_and(|d| d != device) {
                    return Err(RegisterError::BadParam("path backs another device"));
                }
            }
            path_entries.push(path_entry);
        }

        self.inner.uids.lock().register_all(device, &uids)?;
        for path_entry in &path_entries {
            path_entry.state.lock().device = Some(device);
        }
        {
            let mut inner = entry.inner.lock();
            inner.registered = true;
            inner.state = DeviceState::On;
            inner.info = DeviceStateInfo::None;
            inner.paths = paths;
            inner.ops = Some(ops);
            inner.block_size = block_size;
            inner.block_count = block_count;
            inner.start_armed = true;
        }
        let name = self.device_name(device);
        tracing::info!(device = %name, paths = path_entries.len(), "device registered");

        self.offer_device(&entry, &name).await;
        Ok(())
    }

    /// Offers a new device to filter and VAAI plugins until one attaches.
    async fn offer_device(&self, entry: &DeviceEntry, name: &str) {
        for plugin in self.device_claim_order() {
            let result = match &plugin.kind {
                PluginKind::Filter(f) => f.claim_device(self, plugin.id, entry.id).await,
                PluginKind::Vaai(v) => v.claim_device(self, plugin.id, entry.id).await,
                PluginKind::Multipath(_) => continue,
            };
            match result {
                Ok(true) => {
                    entry.inner.lock().filter = Some(plugin.id);
                    tracing::info!(device = name, plugin = %plugin.name, "device claimed by plugin");
                    return;
                }
                Ok(false) => {}
                Err(err) => tracing::warn!(
                    device = name,
                    plugin = %plugin.name,
                    error = &*err as &dyn std::error::Error,
                    "device claim failed"
                ),
            }
        }
    }

    pub(crate) async fn detach_filter(&self, plugin: &PluginEntry, device: DeviceId) {
        let result = match &plugin.kind {
            PluginKind::Filter(f) => f.unclaim_device(self, plugin.id, device).await,
            PluginKind::Vaai(v) => v.unclaim_device(self, plugin.id, device).await,
            PluginKind::Multipath(_) => Ok(()),
        };
        if let Err(err) = result {
            tracing::warn!(
                device = %device,
                plugin = %plugin.name,
                error = &*err as &dyn std::error::Error,
                "device unclaim failed"
            );
        }
        if let Ok(entry) = self.device_entry(device) {
            let mut inner = entry.inner.lock();
            if inner.filter == Some(plugin.id) {
                inner.filter = None;
            }
        }
    }

    /// Detaches the device from its UIDs, paths and filter after waiting for
    /// task management and I/O to drain. The slot stays reserved until
    /// [`ScsiStack::free_device`].
    pub async fn unregister_device(&self, device: DeviceId) -> Result<(), DeviceError> {
        let entry = self.device_entry(device)?;
        let stale: Vec<_> = {
            let mut inner = entry.inner.lock();
            if !inner.registered {
                return Err(DeviceError::NotRegistered);
            }
            if inner.open_count > 0 || inner.unregistering {
                return Err(DeviceError::Busy);
            }
            inner.unregistering = true;
            if inner.dispatching() {
                Vec::new()
            } else {
                inner.queue.drain(..).collect()
            }
        };
        let name = self.device_name(device);
        self.complete_queued(&entry, stale, no_connect());

        entry.tm.wait().await;
        entry.io.wait().await;

        let filter = entry.inner.lock().filter;
        if let Some(plugin) = filter.and_then(|p| self.plugin_entry(p).ok()) {
            self.detach_filter(&plugin, device).await;
        }
        self.inner.uids.lock().remove_device(device);
        let paths = {
            let mut inner = entry.inner.lock();
            inner.registered = false;
            inner.unregistering = false;
            inner.ops = None;
            std::mem::take(&mut inner.paths)
        };
        for path in paths {
            if let Ok(path_entry) = self.path_entry(path) {
                let mut inner = path_entry.state.lock();
                if inner.device == Some(device) {
                    inner.device = None;
                }
            }
        }
        tracing::info!(device = %name, "device unregistered");
        Ok(())
    }

    /// Releases the slot of an unregistered device.
    pub fn free_device(&self, device: DeviceId) -> Result<(), DeviceError> {
        let mut devices = self.inner.devices.write();
        let entry = devices.get(device).ok_or(DeviceError::NotFound(device))?;
        {
            let inner = entry.inner.lock();
            if inner.registered || inner.unregistering {
                return Err(DeviceError::Busy);
            }
        }
        devices.devices.remove(&device);
        tracing::debug!(device = %device, "device freed");
        Ok(())
    }

    /// Changes the device state. `Quiesced` is only reachable through
    /// [`ScsiStack::quiesce_device`].
    ///
    /// Entering `PermanentLoss` fails every queued and dispatched command
    /// with `NO_CONNECT` and sends the plugin a virtual reset. Nothing leaves
    /// `PermanentLoss`.
    pub fn set_device_state(
        &self,
        device: DeviceId,
        state: DeviceState,
        info: DeviceStateInfo,
    ) -> Result<(), DeviceError> {
        if state == DeviceState::Quiesced {
            return Err(DeviceError::BadParam("quiesce through quiesce_device"));
        }
        let entry = self.device_entry(device)?;
        let (old, failed, start) = {
            let mut inner = entry.inner.lock();
            if !inner.registered {
                return Err(DeviceError::NotRegistered);
            }
            if inner.state == DeviceState::PermanentLoss {
                return if state == DeviceState::PermanentLoss {
                    Ok(())
                } else {
                    Err(DeviceError::PermanentLoss)
                };
            }
            let old = inner.state;
            inner.state = state;
            inner.info = info;
            let failed: Vec<_> = if state == DeviceState::PermanentLoss {
                inner.queue.drain(..).collect()
            } else {
                Vec::new()
            };
            (old, failed, inner.take_start())
        };

        if old != state {
            tracing::info!(device = %self.device_name(device), from = ?old, to = ?state, ?info, "device state");
        }
        if state == DeviceState::PermanentLoss {
            self.complete_queued(&entry, failed, no_connect());
            self.fail_device_inflight(&entry, no_connect());
            self.send_loss_reset(&entry);
        }
        if start {
            self.notify_start(&entry);
        }
        Ok(())
    }

    /// Tells the plugin to drop everything it holds for a lost device.
    fn send_loss_reset(&self, entry: &Arc<DeviceEntry>) {
        let Some(ops) = entry.ops() else {
            return;
        };
        let request = TaskMgmt::virtual_reset(InitiatorFilter::Any).with_status(no_connect());
        entry.tm.enter();
        let stack = self.clone();
        let task_entry = entry.clone();
        let task = async move {
            if let Err(err) = ops.task_mgmt(&stack, task_entry.id, &request).await {
                tracing::warn!(
                    device = %task_entry.id,
                    error = &*err as &dyn std::error::Error,
                    "reset after permanent loss failed"
                );
            }
            task_entry.tm.exit();
        };
        if let Err(err) = self.spawn(task) {
            entry.tm.exit();
            tracing::warn!(
                device = %entry.id,
                error = &err as &dyn std::error::Error,
                "failed to schedule reset after permanent loss"
            );
        }
    }

    /// Moves the device to `Quiesced` and waits for its commands to drain.
    /// `info` must be [`DeviceStateInfo::Unregister`].
    pub async fn quiesce_device(
        &self,
        device: DeviceId,
        info: DeviceStateInfo,
    ) -> Result<(), DeviceError> {
        if info != DeviceStateInfo::Unregister {
            return Err(DeviceError::BadParam("quiesce requires the unregister reason"));
        }
        let entry = self.device_entry(device)?;
        {
            let mut inner = entry.inner.lock();
            if !inner.registered {
                return Err(DeviceError::NotRegistered);
            }
            if inner.state == DeviceState::PermanentLoss {
                return Err(DeviceError::PermanentLoss);
            }
            inner.state = DeviceState::Quiesced;
            inner.info = info;
        }
        tracing::info!(device = %self.device_name(device), "device quiescing");
        entry.io.wait().await;
        Ok(())
    }

    /// Bumps the reservation generation, invalidating reservation-sensitive
    /// commands dispatched before the bump. Returns the new generation.
    pub fn increment_reserve_generation(&self, device: DeviceId) -> Result<u64, DeviceError> {
        let entry = self.device_entry(device)?;
        Ok(entry.reserve_generation.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn reserve_generation(&self, device: DeviceId) -> Result<u64, DeviceError> {
        Ok(self.device_entry(device)?.generation())
    }

    fn require_registered(&self, device: DeviceId) -> Result<Arc<DeviceEntry>, DeviceError> {
        let entry = self.device_entry(device)?;
        if !entry.inner.lock().registered {
            return Err(DeviceError::NotRegistered);
        }
        Ok(entry)
    }

    /// Attaches an additional UID to a registered device.
    pub fn add_uid(&self, device: DeviceId, uid: Uid) -> Result<(), DeviceError> {
        self.require_registered(device)?;
        self.inner.uids.lock().register_uid(device, uid)?;
        Ok(())
    }

    /// Detaches a removable UID from a registered device.
    pub fn remove_uid(&self, device: DeviceId, uid: &Uid) -> Result<(), DeviceError> {
        self.require_registered(device)?;
        self.inner.uids.lock().remove_uid(device, uid)?;
        Ok(())
    }

    pub async fn open_device(&self, device: DeviceId) -> Result<(), DeviceError> {
        let entry = self.require_registered(device)?;
        let ops = {
            let inner = entry.inner.lock();
            match inner.state {
                DeviceState::Off => return Err(DeviceError::NoConnect),
                DeviceState::PermanentLoss => return Err(DeviceError::PermanentLoss),
                _ => {}
            }
            if inner.unregistering {
                return Err(DeviceError::Busy);
            }
            inner.ops.clone().ok_or(DeviceError::NotRegistered)?
        };
        ops.open(self, device).await.map_err(DeviceError::Plugin)?;
        entry.inner.lock().open_count += 1;
        Ok(())
    }

    pub async fn close_device(&self, device: DeviceId) -> Result<(), DeviceError> {
        let entry = self.require_registered(device)?;
        let ops = {
            let inner = entry.inner.lock();
            if inner.open_count == 0 {
                return Err(DeviceError::BadParam("device is not open"));
            }
            inner.ops.clone().ok_or(DeviceError::NotRegistered)?
        };
        ops.close(self, device).await.map_err(DeviceError::Plugin)?;
        let mut inner = entry.inner.lock();
        inner.open_count = inner.open_count.saturating_sub(1);
        Ok(())
    }

    /// Administratively switches a device on or off and tells its plugin.
    pub fn notify_device_event(&self, device: DeviceId, state: DeviceState) -> Result<(), DeviceError> {
        if !matches!(state, DeviceState::On | DeviceState::Off) {
            return Err(DeviceError::BadParam("device events are on or off"));
        }
        self.set_device_state(device, state, DeviceStateInfo::None)?;
        self.registered_ops(device)?
            .notify_device_event(self, device, state);
        Ok(())
    }

    pub fn set_max_queue_depth(&self, device: DeviceId, depth: u32) -> Result<(), DeviceError> {
        if depth == 0 {
            return Err(DeviceError::BadParam("queue depth must be non-zero"));
        }
        let entry = self.device_entry(device)?;
        let start = {
            let mut inner = entry.inner.lock();
            inner.max_queue_depth = depth;
            inner.take_start()
        };
        if start {
            self.notify_start(&entry);
        }
        Ok(())
    }

    pub fn max_queue_depth(&self, device: DeviceId) -> Result<u32, DeviceError> {
        Ok(self.device_entry(device)?.inner.lock().max_queue_depth)
    }

    /// Sets how often the device's paths are probed.
    pub fn switch_probe_rate(
        &self,
        device: DeviceId,
        rate: ProbeRate,
        one_probe_only: bool,
    ) -> Result<(), DeviceError> {
        let entry = self.require_registered(device)?;
        let mut inner = entry.inner.lock();
        inner.probe_rate = rate;
        inner.one_probe_only = one_probe_only;
        tracing::debug!(device = %device, ?rate, one_probe_only, "probe rate");
        Ok(())
    }

    pub fn probe_rate(&self, device: DeviceId) -> Result<(ProbeRate, bool), DeviceError> {
        let entry = self.device_entry(device)?;
        let inner = entry.inner.lock();
        Ok((inner.probe_rate, inner.one_probe_only))
    }

    pub fn device_bool_attr(&self, device: DeviceId, attr: DeviceBoolAttr) -> Result<bool, DeviceError> {
        Ok(self.registered_ops(device)?.get_bool_attr(device, attr))
    }

    /// Names of the device's paths, as reported by its plugin.
    pub fn device_path_names(&self, device: DeviceId) -> Result<Vec<String>, DeviceError> {
        Ok(self.registered_ops(device)?.path_names(self, device))
    }

    /// Adds a claimed path to a registered device.
    pub fn add_device_path(&self, device: DeviceId, path: PathId) -> Result<(), DeviceError> {
        let entry = self.require_registered(device)?;
        let path_entry = self
            .path_entry(path)
            .map_err(|_| DeviceError::BadParam("unknown path"))?;
        {
            let mut path_inner = path_entry.state.lock();
            if path_inner.owner != Some(entry.plugin) {
                return Err(DeviceError::BadParam("path is not claimed by the plugin"));
            }
            match path_inner.device {
                Some(d) if d == device => return Ok(()),
                Some(_) => return Err(DeviceError::BadParam("path backs another device")),
                None => path_inner.device = Some(device),
            }
        }
        entry.inner.lock().paths.push(path);
        tracing::debug!(device = %device, path = %path_entry.name, "path added to device");
        Ok(())
    }

    /// Removes a path from a device. The last path cannot be removed; the
    /// device has to be unregistered instead.
    pub fn remove_device_path(&self, device: DeviceId, path: PathId) -> Result<(), DeviceError> {
        let entry = self.require_registered(device)?;
        {
            let mut inner = entry.inner.lock();
            let Some(index) = inner.paths.iter().position(|&p| p == path) else {
                return Err(DeviceError::BadParam("path does not back the device"));
            };
            if inner.paths.len() == 1 {
                return Err(DeviceError::BadParam("cannot remove the last path"));
            }
            inner.paths.remove(index);
        }
        if let Ok(path_entry) = self.path_entry(path) {
            let mut path_inner = path_entry.state.lock();
            if path_inner.device == Some(device) {
                path_inner.device = None;
            }
        }
        tracing::debug!(device = %device, path = %path, "path removed from device");
        Ok(())
    }

    /// Fails every command queued on the device with `NO_CONNECT`. Returns
    /// how many were failed.
    pub fn flush_apd_commands(&self, device: DeviceId) -> Result<usize, DeviceError> {
        let entry = self.require_registered(device)?;
        let queued: Vec<_> = entry.inner.lock().queue.drain(..).collect();
        let count = queued.len();
        self.complete_queued(&entry, queued, no_connect());
        if count != 0 {
            tracing::info!(device = %self.device_name(device), count, "flushed queued commands");
        }
        Ok(count)
    }

    /// Standard inquiry data, or VPD page `page`, as returned by the plugin.
    pub async fn device_inquiry(&self, device: DeviceId, page: Option<u8>) -> Result<Vec<u8>, DeviceError> {
        let ops = self.registered_ops(device)?;
        ops.get_inquiry(self, device, page)
            .await
            .map_err(DeviceError::Plugin)
    }

    pub async fn probe_device(&self, device: DeviceId) -> Result<(), DeviceError> {
        let ops = self.registered_ops(device)?;
        ops.probe(self, device).await.map_err(DeviceError::Plugin)
    }

    /// Runs a polled command on the device through its plugin.
    pub fn issue_device_dump(
        &self,
        device: DeviceId,
        cdb: &Cdb,
        data: &mut [u8],
    ) -> Result<CmdStatus, DumpError> {
        let ops = self
            .registered_ops(device)
            .map_err(|_| DumpError::DeviceNotFound(device))?;
        ops.issue_dump_cmd(self, device, cdb, data)
            .map_err(DumpError::Failed)
    }

    pub fn device_state(&self, device: DeviceId) -> Result<(DeviceState, DeviceStateInfo), DeviceError> {
        let entry = self.device_entry(device)?;
        let inner = entry.inner.lock();
        Ok((inner.state, inner.info))
    }

    pub fn device_paths(&self, device: DeviceId) -> Result<Vec<PathId>, DeviceError> {
        Ok(self.device_entry(device)?.inner.lock().paths.clone())
    }

    pub fn device_plugin(&self, device: DeviceId) -> Result<PluginId, DeviceError> {
        Ok(self.device_entry(device)?.plugin)
    }

    pub fn device_uids(&self, device: DeviceId) -> Vec<Uid> {
        self.inner.uids.lock().uids(device).to_vec()
    }

    /// The device's primary UID, or its id before registration.
    pub fn device_name(&self, device: DeviceId) -> String {
        self.inner
            .uids
            .lock()
            .primary(device)
            .map_or_else(|| device.to_string(), |uid| uid.id.clone())
    }

    /// The device a UID string is attached to.
    pub fn find_device(&self, uid: &str) -> Option<DeviceId> {
        self.inner.uids.lock().lookup(uid)
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<_> = self.inner.devices.read().entries().map(|e| e.id).collect();
        devices.sort();
        devices
    }

    /// Block size and block count given at registration.
    pub fn device_capacity(&self, device: DeviceId) -> Result<(u32, u64), DeviceError> {
        let entry = self.device_entry(device)?;
        let inner = entry.inner.lock();
        Ok((inner.block_size, inner.block_count))
    }

    /// Commands queued on or dispatched from the device.
    pub fn device_outstanding(&self, device: DeviceId) -> Result<usize, DeviceError> {
        Ok(self.device_entry(device)?.io.count())
    }

    /// The filter or VAAI plugin attached to the device.
    pub fn device_filter(&self, device: DeviceId) -> Result<Option<PluginId>, DeviceError> {
        Ok(self.device_entry(device)?.inner.lock().filter)
    }

    /// Primitives offloaded by the device's VAAI plugin, if one is attached.
    pub fn device_vaai_primitives(&self, device: DeviceId) -> Option<VaaiPrimitives> {
        let filter = self.device_filter(device).ok()??;
        let plugin = self.plugin_entry(filter).ok()?;
        match &plugin.kind {
            PluginKind::Vaai(v) => Some(v.primitives()),
            _ => None,
        }
    }

    pub(crate) fn registered_devices_of(&self, plugin: PluginId) -> Vec<DeviceId> {
        self.inner
            .devices
            .read()
            .entries()
            .filter(|e| e.plugin == plugin && e.inner.lock().registered)
            .map(|e| e.id)
            .collect()
    }

    pub(crate) fn filtered_devices(&self, plugin: PluginId) -> Vec<DeviceId> {
        self.inner
            .devices
            .read()
            .entries()
            .filter(|e| e.inner.lock().filter == Some(plugin))
            .map(|e| e.id)
            .collect()
    }
}
