// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A minimal multipathing plugin.
//!
//! Claims every path that reports a standard UID, builds one device per UID
//! and spreads the device's commands across its usable paths in turn.

use crate::ActiveCommand;
use crate::ScsiStack;
use crate::command::Cdb;
use crate::command::CmdStatus;
use crate::command::ScsiCommand;
use crate::command::TaskMgmt;
use crate::device::DeviceBoolAttr;
use crate::device::DeviceId;
use crate::device::DeviceOps;
use crate::device::DeviceRegistration;
use crate::device::DeviceState;
use crate::device::DeviceStateInfo;
use crate::path::PathId;
use crate::path::PathState;
use crate::plugin::MultipathCapability;
use crate::plugin::PluginId;
use crate::uid::Uid;
use anyhow::Context;
use parking_lot::Mutex;
use scsi_defs::CdbInquiry;
use scsi_defs::HostStatus;
use scsi_defs::STANDARD_INQUIRY_LEN;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;

/// Block size reported for devices until the plugin reads their capacity.
const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Inquiry allocation length used for VPD pages.
const VPD_LEN: usize = 255;

pub struct RoundRobin {
    this: Weak<RoundRobin>,
    state: Mutex<RoundRobinState>,
}

#[derive(Default)]
struct RoundRobinState {
    /// Paths claimed in the current pass, not yet attached to a device.
    pending: Vec<PathId>,
    /// Device built for each primary UID.
    by_uid: HashMap<String, DeviceId>,
    /// Next path index for each device.
    cursor: HashMap<DeviceId, usize>,
}

impl RoundRobin {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            state: Mutex::new(RoundRobinState::default()),
        })
    }

    /// Devices built so far, by primary UID.
    pub fn devices(&self) -> Vec<(String, DeviceId)> {
        let mut devices: Vec<_> = self
            .state
            .lock()
            .by_uid
            .iter()
            .map(|(uid, &device)| (uid.clone(), device))
            .collect();
        devices.sort();
        devices
    }

    fn ops(&self) -> Option<Arc<dyn DeviceOps>> {
        Some(self.this.upgrade()?)
    }

    /// Picks the next `On` path of the device.
    fn select_path(&self, stack: &ScsiStack, device: DeviceId) -> Option<PathId> {
        let paths: Vec<_> = stack
            .device_paths(device)
            .ok()?
            .into_iter()
            .filter(|&p| stack.path_state(p).is_ok_and(|s| s == PathState::On))
            .collect();
        if paths.is_empty() {
            return None;
        }
        let mut state = self.state.lock();
        let cursor = state.cursor.entry(device).or_default();
        let path = paths[*cursor % paths.len()];
        *cursor = cursor.wrapping_add(1);
        Some(path)
    }

    async fn attach(
        &self,
        stack: &ScsiStack,
        plugin: PluginId,
        uid: String,
        paths: Vec<PathId>,
    ) -> anyhow::Result<()> {
        let existing = self.state.lock().by_uid.get(&uid).copied();
        if let Some(device) = existing {
            for path in paths {
                stack
                    .add_device_path(device, path)
                    .with_context(|| format!("failed to add path {path} to {uid}"))?;
            }
            return Ok(());
        }

        let ops = self.ops().context("plugin is shutting down")?;
        let device = stack.allocate_device(plugin)?;
        let registration = DeviceRegistration {
            uids: vec![Uid::primary(uid.clone())],
            paths,
            ops: Some(ops),
            block_size: DEFAULT_BLOCK_SIZE,
            block_count: 0,
        };
        if let Err(err) = stack.register_device(device, registration).await {
            if let Err(free_err) = stack.free_device(device) {
                tracing::warn!(
                    device = %device,
                    error = &free_err as &dyn std::error::Error,
                    "failed to free device slot"
                );
            }
            return Err(anyhow::Error::from(err).context(format!("failed to register {uid}")));
        }
        let mut state = self.state.lock();
        state.by_uid.insert(uid, device);
        state.cursor.insert(device, 0);
        Ok(())
    }

    fn forget(&self, device: DeviceId) {
        let mut state = self.state.lock();
        state.by_uid.retain(|_, d| *d != device);
        state.cursor.remove(&device);
    }

    /// Moves the device in and out of all-paths-down as its paths change.
    fn update_device_state(&self, stack: &ScsiStack, device: DeviceId) {
        let Ok((current, _)) = stack.device_state(device) else {
            return;
        };
        let any_on = stack.device_paths(device).is_ok_and(|paths| {
            paths
                .iter()
                .any(|&p| stack.path_state(p).is_ok_and(|s| s == PathState::On))
        });
        let next = match (current, any_on) {
            (DeviceState::On, false) => DeviceState::Apd,
            (DeviceState::Apd, true) => DeviceState::On,
            _ => return,
        };
        if let Err(err) = stack.set_device_state(device, next, DeviceStateInfo::None) {
            tracing::debug!(
                device = %device,
                error = &err as &dyn std::error::Error,
                "device state update failed"
            );
        }
    }
}

#[async_trait::async_trait]
impl MultipathCapability for RoundRobin {
    async fn claim(&self, stack: &ScsiStack, _plugin: PluginId, path: PathId) -> anyhow::Result<bool> {
        if stack.path_uid(path)?.is_none() {
            return Ok(false);
        }
        self.state.lock().pending.push(path);
        Ok(true)
    }

    async fn unclaim(&self, stack: &ScsiStack, _plugin: PluginId, path: PathId) -> anyhow::Result<()> {
        self.state.lock().pending.retain(|&p| p != path);
        let Some(device) = stack.path_device(path)? else {
            return Ok(());
        };
        if stack.device_paths(device)?.len() > 1 {
            stack.remove_device_path(device, path)?;
            return Ok(());
        }
        stack.unregister_device(device).await?;
        stack.free_device(device)?;
        self.forget(device);
        Ok(())
    }

    async fn claim_end(&self, stack: &ScsiStack, plugin: PluginId) -> anyhow::Result<()> {
        let pending = std::mem::take(&mut self.state.lock().pending);
        let mut groups = BTreeMap::<String, Vec<PathId>>::new();
        for path in pending {
            if let Err(err) = stack.probe_direct(path).await {
                tracing::debug!(
                    path = %path,
                    error = &err as &dyn std::error::Error,
                    "probe of claimed path failed"
                );
            }
            if let Ok(Some(uid)) = stack.path_uid(path) {
                groups.entry(uid.id).or_default().push(path);
            }
        }

        let mut result = Ok(());
        for (uid, paths) in groups {
            if let Err(err) = self.attach(stack, plugin, uid, paths).await {
                tracing::warn!(error = &*err as &dyn std::error::Error, "device setup failed");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        for (_, device) in self.devices() {
            self.update_device_state(stack, device);
        }
        result
    }
}

#[async_trait::async_trait]
impl DeviceOps for RoundRobin {
    fn start_command(&self, stack: &ScsiStack, device: DeviceId) {
        while let Some(cmd) = stack.get_next_command(device) {
            self.dispatch(stack, device, cmd);
        }
    }

    async fn task_mgmt(
        &self,
        stack: &ScsiStack,
        device: DeviceId,
        request: &TaskMgmt,
    ) -> anyhow::Result<()> {
        let paths = stack.device_paths(device)?;
        let mut last_err = None;
        let mut sent = false;
        for path in paths {
            match stack.issue_task_mgmt(path, request) {
                Ok(()) => sent = true,
                Err(err) => {
                    tracing::debug!(
                        path = %path,
                        error = &err as &dyn std::error::Error,
                        "task management failed on path"
                    );
                    last_err = Some(err);
                }
            }
        }
        match last_err {
            Some(err) if !sent => Err(err.into()),
            _ => Ok(()),
        }
    }

    async fn probe(&self, stack: &ScsiStack, device: DeviceId) -> anyhow::Result<()> {
        for path in stack.device_paths(device)? {
            stack.probe(path).await?;
        }
        self.update_device_state(stack, device);
        Ok(())
    }

    async fn get_inquiry(
        &self,
        stack: &ScsiStack,
        device: DeviceId,
        page: Option<u8>,
    ) -> anyhow::Result<Vec<u8>> {
        let path = self
            .select_path(stack, device)
            .context("no usable path")?;
        let (layout, len) = match page {
            None => (
                CdbInquiry::standard(STANDARD_INQUIRY_LEN as u16),
                STANDARD_INQUIRY_LEN,
            ),
            Some(page) => (CdbInquiry::vpd(page, VPD_LEN as u16), VPD_LEN),
        };
        let cmd = ScsiCommand::new(stack.internal_id(), Cdb::from_layout(&layout)?).read(len);
        let done = stack.issue_sync(path, cmd).await?;
        if !done.is_successful() {
            anyhow::bail!("inquiry failed with {:?}", done.status);
        }
        let mut data = done.data;
        data.truncate(done.bytes_transferred);
        Ok(data)
    }

    fn issue_dump_cmd(
        &self,
        stack: &ScsiStack,
        device: DeviceId,
        cdb: &Cdb,
        data: &mut [u8],
    ) -> anyhow::Result<CmdStatus> {
        let path = self
            .select_path(stack, device)
            .context("no usable path")?;
        Ok(stack.issue_sync_dump(path, cdb, data)?)
    }

    fn get_bool_attr(&self, _device: DeviceId, _attr: DeviceBoolAttr) -> bool {
        false
    }
}

impl RoundRobin {
    fn dispatch(&self, stack: &ScsiStack, device: DeviceId, cmd: ActiveCommand) {
        match self.select_path(stack, device) {
            Some(path) => {
                if let Err(err) = stack.issue_to_adapter(path, cmd) {
                    tracing::debug!(
                        device = %device,
                        path = %path,
                        error = &err as &dyn std::error::Error,
                        "dispatch failed"
                    );
                }
            }
            None => cmd.complete(CmdStatus::host(HostStatus::NO_CONNECT), &[], 0),
        }
    }
}
