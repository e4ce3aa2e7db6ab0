// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Multipath SCSI path claiming and command dispatch.
//!
//! A [`ScsiStack`] tracks the physical paths exposed by registered host bus
//! adapters, offers unclaimed paths to multipathing plugins in priority
//! order, keeps the logical devices those plugins build from their paths,
//! and routes commands and task management requests through the owning
//! plugin.
//!
//! Operations that may wait for I/O or for outstanding work to drain are
//! `async`. Everything else is a plain function that only takes short
//! internal locks and never calls into a plugin or adapter while holding
//! them, so it may be called from any context, including plugin and adapter
//! callbacks.

#![expect(missing_docs)]
#![forbid(unsafe_code)]

pub mod adapter;
mod claim;
pub mod command;
pub mod config;
pub mod device;
mod dispatch;
mod drain;
pub mod error;
pub mod path;
pub mod plugin;
pub mod round_robin;
mod scan;
pub mod uid;

#[cfg(test)]
mod tests;

pub use dispatch::ActiveCommand;

use crate::adapter::AdapterEntry;
use crate::command::CommandId;
use crate::command::InitiatorId;
use crate::config::StackConfig;
use crate::device::DeviceTable;
use crate::dispatch::InflightTable;
use crate::path::PathTable;
use crate::plugin::PluginTable;
use crate::uid::UidRegistry;
use futures::task::Spawn;
use futures::task::SpawnExt;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Initiator used for commands the stack issues on its own behalf, such as
/// probes.
pub const STACK_INITIATOR: InitiatorId = InitiatorId(0);

/// The path, plugin and device registry.
///
/// Cloning produces another handle to the same stack.
#[derive(Clone)]
pub struct ScsiStack {
    inner: Arc<StackInner>,
}

pub(crate) struct StackInner {
    config: StackConfig,
    spawner: Arc<dyn Spawn + Send + Sync>,
    adapters: RwLock<HashMap<String, Arc<AdapterEntry>>>,
    paths: RwLock<PathTable>,
    plugins: RwLock<PluginTable>,
    devices: RwLock<DeviceTable>,
    uids: Mutex<UidRegistry>,
    inflight: Mutex<InflightTable>,
    /// Held for the duration of a claim pass or an unclaim. Serializes claim
    /// callbacks, including `claim_end`, across the whole stack.
    claim_lock: futures::lock::Mutex<()>,
    next_serial: AtomicU64,
}

impl ScsiStack {
    /// Creates an empty stack. Background work such as asynchronous probes
    /// runs on `spawner`.
    pub fn new(config: StackConfig, spawner: impl Spawn + Send + Sync + 'static) -> Self {
        tracing::debug!(?config, "creating scsi stack");
        Self {
            inner: Arc::new(StackInner {
                inflight: Mutex::new(InflightTable::new(config.max_inflight)),
                config,
                spawner: Arc::new(spawner),
                adapters: Default::default(),
                paths: Default::default(),
                plugins: Default::default(),
                devices: Default::default(),
                uids: Mutex::new(UidRegistry::new()),
                claim_lock: futures::lock::Mutex::new(()),
                next_serial: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.inner.config
    }

    /// A fresh identity for a command the stack issues itself.
    pub(crate) fn internal_id(&self) -> CommandId {
        CommandId {
            initiator: STACK_INITIATOR,
            serial: self.inner.next_serial.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<StackInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(inner: &Weak<StackInner>) -> Option<Self> {
        Some(Self {
            inner: inner.upgrade()?,
        })
    }

    /// Runs `task` on the stack's spawner.
    pub(crate) fn spawn(
        &self,
        task: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), futures::task::SpawnError> {
        self.inner.spawner.spawn(task)
    }
}
