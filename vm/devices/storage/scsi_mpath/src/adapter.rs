// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The host bus adapter interface consumed by the stack.

use crate::ActiveCommand;
use crate::ScsiStack;
use crate::command::Cdb;
use crate::command::CmdStatus;
use crate::command::TaskMgmt;
use crate::error::AdapterError;
use crate::path::PathAddress;
use crate::path::PathBoolAttr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

/// What a discovery call should do with the addressed LUN.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScanAction {
    /// Report whether a LUN is present so a path can be created.
    CreatePath,
    /// Re-confirm a LUN that already has a path.
    ConfigurePath,
    /// Release adapter state for a LUN whose path is going away.
    DestroyPath,
}

/// Address ranges an adapter enumerates during a full scan.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AdapterTopology {
    pub channels: u32,
    pub targets: u32,
    pub luns: u32,
}

/// A host bus adapter.
///
/// `discover` and `check_target` may block on I/O. The remaining methods are
/// called from non-blocking contexts and must not wait.
#[async_trait::async_trait]
pub trait Adapter: Send + Sync {
    fn topology(&self) -> AdapterTopology;

    /// Whether a target answers at `channel:target`.
    async fn check_target(&self, channel: u32, target: u32) -> anyhow::Result<bool>;

    /// Performs `action` for one LUN. Returns whether the LUN is present.
    async fn discover(
        &self,
        action: ScanAction,
        channel: u32,
        target: u32,
        lun: u32,
    ) -> anyhow::Result<bool>;

    /// Starts a command. The adapter completes it through
    /// [`ActiveCommand::complete`], possibly from another thread.
    fn command(&self, address: &PathAddress, cmd: ActiveCommand);

    /// Starts a task management request against the addressed LUN.
    fn task_mgmt(&self, address: &PathAddress, request: &TaskMgmt) -> anyhow::Result<()>;

    /// Runs a polled command synchronously, for use when interrupts and
    /// scheduling are unavailable.
    fn dump_command(
        &self,
        address: &PathAddress,
        cdb: &Cdb,
        data: &mut [u8],
    ) -> anyhow::Result<CmdStatus>;

    fn path_bool_attr(&self, address: &PathAddress, attr: PathBoolAttr) -> bool {
        let _ = (address, attr);
        false
    }
}

pub(crate) struct AdapterEntry {
    pub name: String,
    pub adapter: Arc<dyn Adapter>,
    scanning: AtomicBool,
}

/// Marks an adapter busy for the lifetime of the guard.
pub(crate) struct ScanGuard(Arc<AdapterEntry>);

impl ScanGuard {
    pub fn try_new(entry: Arc<AdapterEntry>) -> Option<Self> {
        entry
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self(entry))
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.0.scanning.store(false, Ordering::Release);
    }
}

impl ScsiStack {
    /// Makes an adapter available to scans.
    pub fn register_adapter(
        &self,
        name: impl Into<String>,
        adapter: Arc<dyn Adapter>,
    ) -> Result<(), AdapterError> {
        let name = name.into();
        let mut adapters = self.inner.adapters.write();
        if adapters.contains_key(&name) {
            return Err(AdapterError::Exists(name));
        }
        tracing::info!(adapter = %name, "adapter registered");
        adapters.insert(
            name.clone(),
            Arc::new(AdapterEntry {
                name,
                adapter,
                scanning: AtomicBool::new(false),
            }),
        );
        Ok(())
    }

    /// Removes every path of the adapter, then the adapter itself.
    pub async fn unregister_adapter(&self, name: &str) -> Result<(), AdapterError> {
        let entry = self
            .adapter_entry(name)
            .ok_or_else(|| AdapterError::NotFound(name.to_owned()))?;
        let _guard =
            ScanGuard::try_new(entry).ok_or_else(|| AdapterError::Scanning(name.to_owned()))?;

        let paths = self.adapter_paths(name);
        let mut busy = false;
        for path in paths {
            if !self.remove_path(path).await {
                busy = true;
            }
        }
        if busy {
            return Err(AdapterError::Busy(name.to_owned()));
        }
        self.inner.adapters.write().remove(name);
        tracing::info!(adapter = name, "adapter unregistered");
        Ok(())
    }

    pub(crate) fn adapter_entry(&self, name: &str) -> Option<Arc<AdapterEntry>> {
        self.inner.adapters.read().get(name).cloned()
    }

    pub(crate) fn adapter_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.adapters.read().keys().cloned().collect();
        names.sort();
        names
    }
}
