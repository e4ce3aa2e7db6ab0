// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command routing, completion and retry.
//!
//! Every accepted command occupies a slot in the in-flight table until it
//! completes. The slot holds the completion callback, so whichever of the
//! adapter, the plugin or the stack (on timeout or permanent device loss)
//! removes the slot first delivers the completion; later attempts find a
//! stale token and are ignored.

use crate::ScsiStack;
use crate::StackInner;
use crate::command::Cdb;
use crate::command::CmdStatus;
use crate::command::CommandCompletion;
use crate::command::CommandId;
use crate::command::DataDirection;
use crate::command::Disposition;
use crate::command::DoneFn;
use crate::command::ScsiCommand;
use crate::command::TaskMgmt;
use crate::command::TaskMgmtAction;
use crate::command::WorldId;
use crate::device::DeviceEntry;
use crate::device::DeviceId;
use crate::device::DeviceState;
use crate::error::DumpError;
use crate::error::IssueError;
use crate::error::TaskMgmtError;
use crate::path::PathEntry;
use crate::path::PathId;
use crate::plugin::PluginEntry;
use crate::plugin::PluginState;
use futures::channel::oneshot;
use scsi_defs::HostStatus;
use scsi_defs::MAX_SENSE_LEN;
use scsi_defs::PluginStatus;
use slab::Slab;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Instant;

/// Retries consumed so far by a command.
#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct Retries {
    transient: u32,
    error: u32,
}

/// A command waiting on a device queue.
pub(crate) struct Queued {
    pub cmd: ScsiCommand,
    pub retries: Retries,
}

/// Names an in-flight slot. The sequence number detects completions for a
/// slot that has since been reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct CommandToken {
    slot: usize,
    seq: u64,
}

struct Inflight {
    seq: u64,
    id: CommandId,
    world: Option<WorldId>,
    deadline: Option<Instant>,
    /// The path the command is on. Its I/O counter includes the command.
    path: Option<Arc<PathEntry>>,
    /// The plugin a path command was routed through. Its I/O counter
    /// includes the command.
    plugin: Option<Arc<PluginEntry>>,
    /// Set for commands pulled from a device queue.
    device: Option<Arc<DeviceEntry>>,
    /// Reservation generation when a reservation-sensitive device command
    /// was dispatched.
    generation: Option<u64>,
    retries: Retries,
    /// Bypass the owner when reissuing a path command.
    direct: bool,
    done: DoneFn,
}

/// Where a new in-flight slot routes.
struct Route {
    path: Option<Arc<PathEntry>>,
    plugin: Option<Arc<PluginEntry>>,
    device: Option<Arc<DeviceEntry>>,
    generation: Option<u64>,
    retries: Retries,
    direct: bool,
}

pub(crate) struct InflightTable {
    slots: Slab<Inflight>,
    next_seq: u64,
    capacity: usize,
    /// Devices whose queued work was turned away by a full table.
    waiting: Vec<Arc<DeviceEntry>>,
}

impl InflightTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Slab::new(),
            next_seq: 0,
            capacity,
            waiting: Vec::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    fn wait_for_slot(&mut self, device: &Arc<DeviceEntry>) {
        if !self.waiting.iter().any(|d| Arc::ptr_eq(d, device)) {
            self.waiting.push(device.clone());
        }
    }

    /// Takes the waiting devices once a slot is free.
    fn take_waiting(&mut self) -> Vec<Arc<DeviceEntry>> {
        if self.is_full() {
            Vec::new()
        } else {
            std::mem::take(&mut self.waiting)
        }
    }

    fn insert(&mut self, mut inflight: Inflight) -> CommandToken {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        inflight.seq = seq;
        let slot = self.slots.insert(inflight);
        CommandToken { slot, seq }
    }

    fn get_mut(&mut self, token: CommandToken) -> Option<&mut Inflight> {
        self.slots.get_mut(token.slot).filter(|e| e.seq == token.seq)
    }

    fn remove(&mut self, token: CommandToken) -> Option<Inflight> {
        if self.slots.get(token.slot)?.seq != token.seq {
            return None;
        }
        self.slots.try_remove(token.slot)
    }

    fn remove_matching(&mut self, mut f: impl FnMut(&Inflight) -> bool) -> Vec<Inflight> {
        let keys: Vec<_> = self
            .slots
            .iter()
            .filter(|(_, e)| f(e))
            .map(|(key, _)| key)
            .collect();
        keys.into_iter().map(|key| self.slots.remove(key)).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

/// A command accepted by the stack and handed to a plugin or adapter.
///
/// The holder must eventually call [`ActiveCommand::complete`]. Dropping the
/// command instead completes it with host status `ERROR`.
pub struct ActiveCommand {
    stack: Weak<StackInner>,
    token: CommandToken,
    cmd: ScsiCommand,
    completed: bool,
}

impl ActiveCommand {
    pub fn id(&self) -> CommandId {
        self.cmd.id()
    }

    pub fn world_id(&self) -> Option<WorldId> {
        self.cmd.world_id()
    }

    pub fn cdb(&self) -> &Cdb {
        self.cmd.cdb()
    }

    pub fn direction(&self) -> DataDirection {
        self.cmd.direction()
    }

    pub fn data(&self) -> &[u8] {
        self.cmd.data()
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.cmd.data_mut()
    }

    /// Reports the outcome. `sense` is truncated to the maximum sense
    /// length.
    pub fn complete(mut self, status: CmdStatus, sense: &[u8], bytes_transferred: usize) {
        self.completed = true;
        let cmd = self.cmd.take();
        if let Some(stack) = ScsiStack::upgrade(&self.stack) {
            stack.finish(self.token, cmd, status, sense, bytes_transferred);
        }
    }
}

impl Drop for ActiveCommand {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Some(stack) = ScsiStack::upgrade(&self.stack) {
            tracing::warn!(id = %self.cmd.id(), "command dropped without completion");
            let cmd = self.cmd.take();
            stack.finish(
                self.token,
                cmd,
                CmdStatus::host(HostStatus::ERROR),
                &[],
                0,
            );
        }
    }
}

impl fmt::Debug for ActiveCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveCommand")
            .field("token", &self.token)
            .field("cmd", &self.cmd)
            .finish()
    }
}

fn no_connect() -> CmdStatus {
    CmdStatus::host(HostStatus::NO_CONNECT)
}

fn completion(cmd: ScsiCommand, status: CmdStatus, sense: &[u8], bytes: usize) -> CommandCompletion {
    CommandCompletion {
        id: cmd.id,
        status,
        sense: sense[..sense.len().min(MAX_SENSE_LEN)].to_vec(),
        bytes_transferred: bytes,
        data: cmd.data,
    }
}

/// Consumes one retry against `bound`.
fn consume(count: &mut u32, bound: u32) -> bool {
    if *count < bound {
        *count += 1;
        true
    } else {
        false
    }
}

impl ScsiStack {
    /// Takes an in-flight slot for `cmd`.
    fn begin(&self, mut cmd: ScsiCommand, route: Route) -> Result<ActiveCommand, (IssueError, ScsiCommand)> {
        let mut table = self.inner.inflight.lock();
        if table.is_full() {
            return Err((IssueError::NoMemory, cmd));
        }
        let Route {
            path,
            plugin,
            device,
            generation,
            retries,
            direct,
        } = route;
        if let Some(path) = &path {
            path.io.enter();
        }
        if let Some(plugin) = &plugin {
            plugin.io.enter();
        }
        let done: DoneFn = match cmd.done.take() {
            Some(done) => done,
            None => Box::new(|_: CommandCompletion| {}),
        };
        let token = table.insert(Inflight {
            seq: 0,
            id: cmd.id,
            world: cmd.world,
            deadline: cmd.deadline,
            path,
            plugin,
            device,
            generation,
            retries,
            direct,
            done,
        });
        Ok(ActiveCommand {
            stack: self.downgrade(),
            token,
            cmd,
            completed: false,
        })
    }

    /// Issues a command on a path. A claimed path hands the command to its
    /// owner; an unclaimed one sends it straight to the adapter.
    ///
    /// On error the command is dropped without its completion running.
    pub fn issue(&self, path: PathId, cmd: ScsiCommand) -> Result<(), IssueError> {
        self.issue_on(path, cmd, false, Retries::default())
            .map_err(|(err, _)| err)
    }

    /// Issues a command straight to the adapter, bypassing the owner.
    pub fn issue_direct(&self, path: PathId, cmd: ScsiCommand) -> Result<(), IssueError> {
        self.issue_on(path, cmd, true, Retries::default())
            .map_err(|(err, _)| err)
    }

    /// Issues a command and waits for its completion. Any completion
    /// callback already set on `cmd` is replaced.
    pub async fn issue_sync(
        &self,
        path: PathId,
        cmd: ScsiCommand,
    ) -> Result<CommandCompletion, IssueError> {
        let (send, recv) = oneshot::channel();
        self.issue(path, cmd.on_complete(move |c| drop(send.send(c))))?;
        recv.await.map_err(|_| IssueError::NoConnect)
    }

    /// [`ScsiStack::issue_sync`], bypassing the owner.
    pub async fn issue_sync_direct(
        &self,
        path: PathId,
        cmd: ScsiCommand,
    ) -> Result<CommandCompletion, IssueError> {
        let (send, recv) = oneshot::channel();
        self.issue_direct(path, cmd.on_complete(move |c| drop(send.send(c))))?;
        recv.await.map_err(|_| IssueError::NoConnect)
    }

    fn issue_on(
        &self,
        path: PathId,
        cmd: ScsiCommand,
        direct: bool,
        retries: Retries,
    ) -> Result<(), (IssueError, ScsiCommand)> {
        match self.path_entry(path) {
            Ok(entry) => self.start_on_path(&entry, cmd, direct, retries),
            Err(_) => Err((IssueError::PathNotFound(path), cmd)),
        }
    }

    fn start_on_path(
        &self,
        entry: &Arc<PathEntry>,
        cmd: ScsiCommand,
        direct: bool,
        retries: Retries,
    ) -> Result<(), (IssueError, ScsiCommand)> {
        if cmd.is_expired(Instant::now()) {
            return Err((IssueError::Timeout, cmd));
        }
        let (owner, removing, admin_off) = {
            let inner = entry.state.lock();
            (inner.owner, inner.removing, inner.admin_off)
        };
        if removing {
            return Err((IssueError::NoConnect, cmd));
        }

        let plugin = match owner.filter(|_| !direct) {
            Some(owner) => {
                let Some(plugin) = self.inner.plugins.read().get(owner) else {
                    return Err((IssueError::Busy, cmd));
                };
                if plugin.state() != PluginState::Enabled {
                    return Err((IssueError::Busy, cmd));
                }
                Some(plugin)
            }
            None if admin_off => return Err((IssueError::NoConnect, cmd)),
            None => None,
        };

        let active = self.begin(
            cmd,
            Route {
                path: Some(entry.clone()),
                plugin: plugin.clone(),
                device: None,
                generation: None,
                retries,
                direct,
            },
        )?;
        match plugin.as_ref().and_then(|p| Some((p.id, p.multipath()?.clone()))) {
            Some((id, mp)) => mp.path_issue_cmd(self, id, entry.id, active),
            None => entry.adapter.adapter.command(&entry.address, active),
        }
        Ok(())
    }

    /// Sends a command the caller holds down a path to the adapter. Used by
    /// plugins for commands pulled from a device or issued on their paths.
    ///
    /// If the path is unusable the command is completed with `NO_CONNECT`,
    /// which requeues a device command for another attempt.
    pub fn issue_to_adapter(&self, path: PathId, mut cmd: ActiveCommand) -> Result<(), IssueError> {
        let entry = match self.path_entry(path) {
            Ok(entry) => entry,
            Err(_) => {
                cmd.complete(no_connect(), &[], 0);
                return Err(IssueError::PathNotFound(path));
            }
        };
        let usable = {
            let inner = entry.state.lock();
            !inner.removing && !inner.admin_off
        };
        if !usable {
            cmd.complete(no_connect(), &[], 0);
            return Err(IssueError::NoConnect);
        }
        {
            let mut table = self.inner.inflight.lock();
            let Some(slot) = table.get_mut(cmd.token) else {
                // Already completed by the stack.
                cmd.completed = true;
                return Ok(());
            };
            if slot.path.as_ref().is_none_or(|p| p.id != path) {
                entry.io.enter();
                if let Some(old) = slot.path.replace(entry.clone()) {
                    old.io.exit();
                }
            }
        }
        entry.adapter.adapter.command(&entry.address, cmd);
        Ok(())
    }

    /// Completion entry point for [`ActiveCommand`].
    fn finish(
        &self,
        token: CommandToken,
        cmd: ScsiCommand,
        status: CmdStatus,
        sense: &[u8],
        bytes: usize,
    ) {
        self.finish_slot(token, cmd, status, sense, bytes);
        self.start_waiting();
    }

    /// Tells devices turned away by a full in-flight table to pull again.
    fn start_waiting(&self) {
        let waiting = self.inner.inflight.lock().take_waiting();
        for device in waiting {
            let start = device.inner.lock().take_start();
            if start {
                self.notify_start(&device);
            }
        }
    }

    fn finish_slot(
        &self,
        token: CommandToken,
        mut cmd: ScsiCommand,
        mut status: CmdStatus,
        sense: &[u8],
        bytes: usize,
    ) {
        let Some(entry) = self.inner.inflight.lock().remove(token) else {
            tracing::debug!(id = %cmd.id, "ignoring completion of a finished command");
            return;
        };
        let Inflight {
            path,
            plugin,
            device,
            generation,
            mut retries,
            direct,
            done,
            ..
        } = entry;
        if let Some(path) = &path {
            path.io.exit();
        }
        if let Some(plugin) = &plugin {
            plugin.io.exit();
        }
        cmd.done = Some(done);

        if let (Some(device), Some(generation)) = (&device, generation) {
            if device.generation() != generation {
                tracing::debug!(id = %cmd.id, "reservation changed while in flight");
                status = CmdStatus::plugin(PluginStatus::RESERVATION_LOST);
            }
        }

        let config = &self.inner.config;
        let disposition = status.disposition(sense);
        let retry = match disposition {
            Disposition::Complete => false,
            Disposition::RetryTransient => consume(&mut retries.transient, config.transient_retries),
            Disposition::RetryError => consume(&mut retries.error, config.error_retries),
            Disposition::Failover => {
                device.is_some() && consume(&mut retries.error, config.error_retries)
            }
        } && !cmd.is_expired(Instant::now());

        if retry {
            tracing::debug!(id = %cmd.id, ?status, ?disposition, "retrying command");
            if let Some(device) = &device {
                if disposition == Disposition::Failover {
                    if let Some(path) = &path {
                        if let Err(err) = self.probe_async(path.id) {
                            tracing::debug!(
                                path = %path.name,
                                error = &err as &dyn std::error::Error,
                                "failed to schedule probe"
                            );
                        }
                    }
                }
                self.requeue(device, cmd, retries);
                return;
            }
            if let Some(path) = &path {
                match self.start_on_path(path, cmd, direct, retries) {
                    Ok(()) => return,
                    Err((err, returned)) => {
                        tracing::debug!(
                            id = %returned.id,
                            error = &err as &dyn std::error::Error,
                            "retry failed"
                        );
                        cmd = returned;
                    }
                }
            }
        }

        self.deliver(cmd, status, sense, bytes, device.as_ref());
    }

    /// Runs the completion callback and, for device commands, releases the
    /// device's dispatch slot.
    fn deliver(
        &self,
        mut cmd: ScsiCommand,
        status: CmdStatus,
        sense: &[u8],
        bytes: usize,
        device: Option<&Arc<DeviceEntry>>,
    ) {
        if !status.is_good() {
            tracing::debug!(id = %cmd.id, ?status, "command completed with error");
        }
        if let Some(done) = cmd.done.take() {
            done(completion(cmd, status, sense, bytes));
        }
        if let Some(device) = device {
            self.device_command_done(device);
        }
    }

    fn device_command_done(&self, device: &Arc<DeviceEntry>) {
        let start = {
            let mut inner = device.inner.lock();
            inner.active = inner.active.saturating_sub(1);
            inner.take_start()
        };
        device.io.exit();
        if start {
            self.notify_start(device);
        }
    }

    fn requeue(&self, device: &Arc<DeviceEntry>, cmd: ScsiCommand, retries: Retries) {
        let (start, rejected) = {
            let mut inner = device.inner.lock();
            if inner.state == DeviceState::PermanentLoss {
                (false, Some(cmd))
            } else {
                inner.active = inner.active.saturating_sub(1);
                inner.queue.push_front(Queued { cmd, retries });
                (inner.take_start(), None)
            }
        };
        if let Some(cmd) = rejected {
            self.deliver(cmd, no_connect(), &[], 0, Some(device));
        }
        if start {
            self.notify_start(device);
        }
    }

    pub(crate) fn notify_start(&self, device: &DeviceEntry) {
        if let Some(ops) = device.ops() {
            ops.start_command(self, device.id);
        }
    }

    /// Queues a command on a device and notifies its plugin if it is waiting
    /// for work.
    ///
    /// On error the command is dropped without its completion running.
    pub fn submit(&self, device: DeviceId, cmd: ScsiCommand) -> Result<(), IssueError> {
        let entry = self
            .inner
            .devices
            .read()
            .get(device)
            .ok_or(IssueError::DeviceNotFound(device))?;
        if cmd.is_expired(Instant::now()) {
            return Err(IssueError::Timeout);
        }
        let start = {
            let mut inner = entry.inner.lock();
            if !inner.registered {
                return Err(IssueError::DeviceNotFound(device));
            }
            if inner.unregistering {
                return Err(IssueError::NoConnect);
            }
            match inner.state {
                DeviceState::PermanentLoss => return Err(IssueError::PermanentLoss),
                DeviceState::Off => return Err(IssueError::NoConnect),
                DeviceState::Quiesced => return Err(IssueError::Busy),
                DeviceState::On | DeviceState::Apd => {}
            }
            entry.io.enter();
            inner.queue.push_back(Queued {
                cmd,
                retries: Retries::default(),
            });
            inner.take_start()
        };
        if start {
            self.notify_start(&entry);
        }
        Ok(())
    }

    /// [`ScsiStack::submit`], waiting for the completion.
    pub async fn submit_sync(
        &self,
        device: DeviceId,
        cmd: ScsiCommand,
    ) -> Result<CommandCompletion, IssueError> {
        let (send, recv) = oneshot::channel();
        self.submit(device, cmd.on_complete(move |c| drop(send.send(c))))?;
        recv.await.map_err(|_| IssueError::NoConnect)
    }

    /// Pulls the next queued command of a device, if the queue depth allows.
    ///
    /// Returning `None` re-arms the device's start notification.
    pub fn get_next_command(&self, device: DeviceId) -> Option<ActiveCommand> {
        let entry = self.inner.devices.read().get(device)?;
        loop {
            let Queued { cmd, retries } = {
                let mut inner = entry.inner.lock();
                let next = if inner.dispatching() && inner.active < inner.max_queue_depth {
                    inner.queue.pop_front()
                } else {
                    None
                };
                let Some(next) = next else {
                    inner.start_armed = true;
                    return None;
                };
                inner.active += 1;
                next
            };

            if cmd.is_expired(Instant::now()) {
                self.deliver(cmd, CmdStatus::host(HostStatus::TIMEOUT), &[], 0, Some(&entry));
                continue;
            }

            let generation = cmd.reservation_sensitive.then(|| entry.generation());
            let route = Route {
                path: None,
                plugin: None,
                device: Some(entry.clone()),
                generation,
                retries,
                direct: false,
            };
            match self.begin(cmd, route) {
                Ok(active) => {
                    // Permanent loss may have failed the device's slots while
                    // this command was between the queue and the table.
                    if entry.inner.lock().state == DeviceState::PermanentLoss {
                        active.complete(no_connect(), &[], 0);
                        continue;
                    }
                    return Some(active);
                }
                Err((_, cmd)) => {
                    tracing::debug!(device = %device, "in-flight table full");
                    let lost = {
                        let mut inner = entry.inner.lock();
                        inner.start_armed = true;
                        if inner.state == DeviceState::PermanentLoss {
                            Some(cmd)
                        } else {
                            inner.active = inner.active.saturating_sub(1);
                            inner.queue.push_front(Queued { cmd, retries });
                            None
                        }
                    };
                    if let Some(cmd) = lost {
                        self.deliver(cmd, no_connect(), &[], 0, Some(&entry));
                        return None;
                    }
                    {
                        let mut table = self.inner.inflight.lock();
                        if table.is_full() {
                            table.wait_for_slot(&entry);
                            return None;
                        }
                    }
                    // A slot was freed before the device was recorded.
                    if !entry.inner.lock().take_start() {
                        return None;
                    }
                }
            }
        }
    }

    /// Decides whether `cmd` is affected by a task management request.
    pub fn query_task_mgmt(&self, request: &TaskMgmt, cmd: &ActiveCommand) -> TaskMgmtAction {
        request.query(&cmd.id(), cmd.world_id())
    }

    /// Sends a task management request to the adapter behind a path. Returns
    /// once the request is issued; affected commands complete on their own.
    pub fn issue_task_mgmt(&self, path: PathId, request: &TaskMgmt) -> Result<(), TaskMgmtError> {
        let entry = self
            .path_entry(path)
            .map_err(|_| TaskMgmtError::PathNotFound(path))?;
        if entry.state.lock().removing {
            return Err(TaskMgmtError::NoConnect);
        }
        tracing::debug!(path = %entry.name, kind = ?request.kind, "task management");
        entry
            .adapter
            .adapter
            .task_mgmt(&entry.address, request)
            .map_err(TaskMgmtError::Failed)
    }

    /// Applies a task management request to a device: matching queued
    /// commands complete with the request's status, then the plugin handles
    /// the dispatched ones.
    pub async fn issue_device_task_mgmt(
        &self,
        device: DeviceId,
        request: &TaskMgmt,
    ) -> Result<(), TaskMgmtError> {
        let entry = self
            .device_entry(device)
            .map_err(|_| TaskMgmtError::DeviceNotFound(device))?;
        let (ops, aborted) = {
            let mut inner = entry.inner.lock();
            let Some(ops) = inner.ops.clone().filter(|_| inner.registered) else {
                return Err(TaskMgmtError::DeviceNotFound(device));
            };
            let (aborted, kept): (Vec<_>, Vec<_>) = inner.queue.drain(..).partition(|q| {
                request.query(&q.cmd.id, q.cmd.world) == TaskMgmtAction::Abort
            });
            inner.queue = VecDeque::from(kept);
            (ops, aborted)
        };
        entry.tm.enter();
        tracing::debug!(device = %device, kind = ?request.kind, aborted = aborted.len(), "device task management");
        self.complete_queued(&entry, aborted, request.status);
        let result = ops.task_mgmt(self, device, request).await;
        entry.tm.exit();
        result.map_err(TaskMgmtError::Failed)
    }

    /// Completes commands taken off a device queue.
    pub(crate) fn complete_queued(&self, device: &DeviceEntry, queued: Vec<Queued>, status: CmdStatus) {
        for Queued { mut cmd, .. } in queued {
            if let Some(done) = cmd.done.take() {
                done(completion(cmd, status, &[], 0));
            }
            device.io.exit();
        }
    }

    /// Completes every dispatched command of a device with `status`.
    pub(crate) fn fail_device_inflight(&self, device: &Arc<DeviceEntry>, status: CmdStatus) {
        let failed = self
            .inner
            .inflight
            .lock()
            .remove_matching(|e| e.device.as_ref().is_some_and(|d| d.id == device.id));
        for entry in failed {
            self.force_complete(entry, status);
        }
        self.start_waiting();
    }

    /// Completes a slot the stack removed itself. A later completion from the
    /// holder of the command is ignored.
    fn force_complete(&self, entry: Inflight, status: CmdStatus) {
        let Inflight {
            id,
            path,
            plugin,
            device,
            done,
            ..
        } = entry;
        if let Some(path) = &path {
            path.io.exit();
        }
        if let Some(plugin) = &plugin {
            plugin.io.exit();
        }
        done(CommandCompletion {
            id,
            status,
            sense: Vec::new(),
            bytes_transferred: 0,
            data: Vec::new(),
        });
        if let Some(device) = &device {
            self.device_command_done(device);
        }
    }

    /// Completes every command whose deadline is at or before `now` with host
    /// status `TIMEOUT`. Dispatched commands are also aborted at the adapter.
    /// Returns how many commands expired.
    pub fn expire_deadlines(&self, now: Instant) -> usize {
        let expired = self
            .inner
            .inflight
            .lock()
            .remove_matching(|e| e.deadline.is_some_and(|d| d <= now));
        let mut count = expired.len();
        for entry in expired {
            if let Some(path) = &entry.path {
                let request = match entry.world {
                    Some(world) => TaskMgmt::abort(entry.id).with_world(world),
                    None => TaskMgmt::abort(entry.id),
                };
                if let Err(err) = path.adapter.adapter.task_mgmt(&path.address, &request) {
                    tracing::warn!(
                        path = %path.name,
                        error = &*err as &dyn std::error::Error,
                        "failed to abort expired command"
                    );
                }
            }
            tracing::info!(id = %entry.id, "command timed out");
            self.force_complete(entry, CmdStatus::host(HostStatus::TIMEOUT));
        }

        let devices: Vec<_> = self.inner.devices.read().entries().cloned().collect();
        for device in devices {
            let stale: Vec<_> = {
                let mut inner = device.inner.lock();
                let (stale, kept): (Vec<_>, Vec<_>) =
                    inner.queue.drain(..).partition(|q| q.cmd.is_expired(now));
                inner.queue = VecDeque::from(kept);
                stale
            };
            count += stale.len();
            self.complete_queued(&device, stale, CmdStatus::host(HostStatus::TIMEOUT));
        }
        self.start_waiting();
        count
    }

    /// Runs a polled command on a path without interrupts or scheduling.
    pub fn issue_sync_dump(
        &self,
        path: PathId,
        cdb: &Cdb,
        data: &mut [u8],
    ) -> Result<CmdStatus, DumpError> {
        let entry = self
            .path_entry(path)
            .map_err(|_| DumpError::PathNotFound(path))?;
        if entry.state.lock().removing {
            return Err(DumpError::NoConnect);
        }
        entry
            .adapter
            .adapter
            .dump_command(&entry.address, cdb, data)
            .map_err(DumpError::Failed)
    }

    /// Commands occupying in-flight slots.
    pub fn inflight_commands(&self) -> usize {
        self.inner.inflight.lock().len()
    }
}
