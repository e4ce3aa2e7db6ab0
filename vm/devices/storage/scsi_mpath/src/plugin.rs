// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Plugin registration and lifecycle.
//!
//! A plugin is allocated, registered (which enables it and places it in the
//! claim order), unregistered (which unclaims its paths and drains its I/O)
//! and finally freed. Its capabilities are selected by [`PluginKind`].

use crate::ActiveCommand;
use crate::ScsiStack;
use crate::device::DeviceId;
use crate::drain::DrainCounter;
use crate::error::PluginError;
use crate::path::PathId;
use crate::path::PathState;
use bitfield_struct::bitfield;
use open_enum::open_enum;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PluginId(pub(crate) u32);

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mp{}", self.0)
    }
}

open_enum! {
    /// Claim precedence. Lower values are offered paths and devices first.
    pub enum PluginPriority: u32 {
        UNKNOWN = 0,
        HIGHEST = 1,
        VIRUSSCAN = 0x2000_0000,
        VAAI = 0x4000_0000,
        DEDUPLICATION = 0x6000_0000,
        COMPRESSION = 0x8000_0000,
        ENCRYPTION = 0xa000_0000,
        REPLICATION = 0xc000_0000,
        LOWEST = 0xffff_ffff,
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PluginState {
    /// Registered and accepting I/O.
    Enabled,
    /// Inside a claim pass or an unclaim. Claim callbacks may run; path I/O
    /// through the plugin is refused.
    ClaimPaths,
    /// Being torn down.
    Disabling,
    /// Not registered.
    Disabled,
}

impl PluginState {
    fn can_move_to(self, to: PluginState) -> bool {
        use PluginState::*;
        matches!(
            (self, to),
            (Enabled, ClaimPaths)
                | (ClaimPaths, Enabled)
                | (Enabled | ClaimPaths, Disabling)
                | (Disabling, Disabled)
                | (Disabled, Enabled)
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PluginType {
    Multipath,
    Filter,
    Vaai,
}

/// Callbacks of a multipathing plugin.
///
/// The claim protocol callbacks (`claim_begin`, `claim`, `unclaim`,
/// `claim_end`) are only invoked while the plugin is in
/// [`PluginState::ClaimPaths`], one at a time across the whole stack.
#[async_trait::async_trait]
pub trait MultipathCapability: Send + Sync {
    /// Called once per claim pass before any path is offered.
    async fn claim_begin(&self, stack: &ScsiStack, plugin: PluginId) -> anyhow::Result<()> {
        let _ = (stack, plugin);
        Ok(())
    }

    /// Offers an unclaimed path. Returns whether the plugin takes it.
    ///
    /// I/O issued on the path while deciding is drained before the path is
    /// offered to the next plugin.
    async fn claim(&self, stack: &ScsiStack, plugin: PluginId, path: PathId)
    -> anyhow::Result<bool>;

    /// Gives up a claimed path. On failure the path stays claimed.
    async fn unclaim(
        &self,
        stack: &ScsiStack,
        plugin: PluginId,
        path: PathId,
    ) -> anyhow::Result<()>;

    /// Called once per claim pass after every path has been offered. Newly
    /// claimed paths may still be `Dead`; the plugin establishes their state
    /// here.
    async fn claim_end(&self, stack: &ScsiStack, plugin: PluginId) -> anyhow::Result<()> {
        let _ = (stack, plugin);
        Ok(())
    }

    /// Determines the state of a claimed path.
    async fn probe_path(
        &self,
        stack: &ScsiStack,
        plugin: PluginId,
        path: PathId,
    ) -> anyhow::Result<PathState> {
        let _ = plugin;
        Ok(stack.probe_direct(path).await?)
    }

    /// Told about a state change made by the stack, such as an
    /// administrative override.
    fn path_set_state(
        &self,
        stack: &ScsiStack,
        plugin: PluginId,
        path: PathId,
        state: PathState,
    ) -> anyhow::Result<()> {
        let _ = (stack, plugin, path, state);
        Ok(())
    }

    /// Takes a command issued on a claimed path. Must not block.
    fn path_issue_cmd(&self, stack: &ScsiStack, plugin: PluginId, path: PathId, cmd: ActiveCommand) {
        let _ = plugin;
        if let Err(err) = stack.issue_to_adapter(path, cmd) {
            tracing::debug!(path = %path, error = &err as &dyn std::error::Error, "path issue failed");
        }
    }
}

/// Callbacks of a plugin that layers on top of registered devices.
#[async_trait::async_trait]
pub trait FilterCapability: Send + Sync {
    /// Offers a newly registered device. Returns whether the plugin attaches.
    async fn claim_device(
        &self,
        stack: &ScsiStack,
        plugin: PluginId,
        device: DeviceId,
    ) -> anyhow::Result<bool>;

    /// Detaches from a device that is being unregistered.
    async fn unclaim_device(
        &self,
        stack: &ScsiStack,
        plugin: PluginId,
        device: DeviceId,
    ) -> anyhow::Result<()>;
}

/// Offloaded primitives a VAAI plugin implements for its devices.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct VaaiPrimitives {
    pub atomic_test_set: bool,
    pub clone_blocks: bool,
    pub zero_blocks: bool,
    pub delete_blocks: bool,
    #[bits(28)]
    _reserved: u32,
}

/// Callbacks of a VAAI plugin.
#[async_trait::async_trait]
pub trait VaaiCapability: Send + Sync {
    async fn claim_device(
        &self,
        stack: &ScsiStack,
        plugin: PluginId,
        device: DeviceId,
    ) -> anyhow::Result<bool>;

    async fn unclaim_device(
        &self,
        stack: &ScsiStack,
        plugin: PluginId,
        device: DeviceId,
    ) -> anyhow::Result<()>;

    fn primitives(&self) -> VaaiPrimitives;
}

#[derive(Clone)]
pub enum PluginKind {
    Multipath(Arc<dyn MultipathCapability>),
    Filter(Arc<dyn FilterCapability>),
    Vaai(Arc<dyn VaaiCapability>),
}

impl PluginKind {
    pub fn plugin_type(&self) -> PluginType {
        match self {
            PluginKind::Multipath(_) => PluginType::Multipath,
            PluginKind::Filter(_) => PluginType::Filter,
            PluginKind::Vaai(_) => PluginType::Vaai,
        }
    }
}

impl fmt::Debug for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.plugin_type(), f)
    }
}

pub(crate) struct PluginEntry {
    pub id: PluginId,
    pub name: String,
    pub priority: PluginPriority,
    pub kind: PluginKind,
    /// Commands routed through the plugin.
    pub io: DrainCounter,
    life: Mutex<PluginLife>,
}

struct PluginLife {
    state: PluginState,
    registered: bool,
    /// Registration order, for breaking priority ties.
    seq: u64,
}

impl PluginEntry {
    pub fn state(&self) -> PluginState {
        self.life.lock().state
    }

    pub fn is_registered(&self) -> bool {
        self.life.lock().registered
    }

    pub fn seq(&self) -> u64 {
        self.life.lock().seq
    }

    pub fn set_state(&self, to: PluginState) -> Result<(), PluginError> {
        let mut life = self.life.lock();
        if !life.state.can_move_to(to) {
            return Err(PluginError::InvalidTransition {
                from: life.state,
                to,
            });
        }
        tracing::trace!(plugin = %self.name, from = ?life.state, ?to, "plugin state");
        life.state = to;
        Ok(())
    }

    pub fn multipath(&self) -> Option<&Arc<dyn MultipathCapability>> {
        match &self.kind {
            PluginKind::Multipath(mp) => Some(mp),
            _ => None,
        }
    }
}

#[derive(Default)]
pub(crate) struct PluginTable {
    plugins: HashMap<PluginId, Arc<PluginEntry>>,
    next_id: u32,
    next_seq: u64,
}

impl PluginTable {
    pub fn get(&self, id: PluginId) -> Option<Arc<PluginEntry>> {
        self.plugins.get(&id).cloned()
    }

    /// Registered plugins in claim order.
    pub fn ordered(&self) -> Vec<Arc<PluginEntry>> {
        let mut plugins: Vec<_> = self
            .plugins
            .values()
            .filter(|p| p.is_registered())
            .cloned()
            .collect();
        plugins.sort_by_key(|p| (p.priority, p.seq()));
        plugins
    }
}

impl ScsiStack {
    pub(crate) fn plugin_entry(&self, plugin: PluginId) -> Result<Arc<PluginEntry>, PluginError> {
        self.inner
            .plugins
            .read()
            .get(plugin)
            .ok_or(PluginError::NotFound(plugin))
    }

    /// The multipath callbacks of `plugin` if it is enabled.
    pub(crate) fn enabled_multipath(
        &self,
        plugin: PluginId,
    ) -> Option<Arc<dyn MultipathCapability>> {
        let entry = self.inner.plugins.read().get(plugin)?;
        if entry.state() != PluginState::Enabled {
            return None;
        }
        entry.multipath().cloned()
    }

    /// Creates an unregistered plugin.
    pub fn allocate_plugin(
        &self,
        name: impl Into<String>,
        priority: PluginPriority,
        kind: PluginKind,
    ) -> Result<PluginId, PluginError> {
        let name = name.into();
        if name.is_empty() {
            return Err(PluginError::BadParam("plugin name is empty"));
        }
        if priority == PluginPriority::UNKNOWN {
            return Err(PluginError::BadParam("plugin priority is unset"));
        }
        let mut plugins = self.inner.plugins.write();
        let id = PluginId(plugins.next_id);
        plugins.next_id += 1;
        tracing::debug!(plugin = %name, ?priority, ?kind, "plugin allocated");
        plugins.plugins.insert(
            id,
            Arc::new(PluginEntry {
                id,
                name,
                priority,
                kind,
                io: DrainCounter::new(),
                life: Mutex::new(PluginLife {
                    state: PluginState::Disabled,
                    registered: false,
                    seq: 0,
                }),
            }),
        );
        Ok(id)
    }

    /// Enables a plugin and places it in the claim order. It takes part in
    /// the next claim pass.
    pub async fn register_plugin(&self, plugin: PluginId) -> Result<(), PluginError> {
        let _pass = self.inner.claim_lock.lock().await;
        let mut plugins = self.inner.plugins.write();
        let entry = plugins.get(plugin).ok_or(PluginError::NotFound(plugin))?;
        if entry.is_registered() {
            return Err(PluginError::Registered);
        }
        if plugins
            .plugins
            .values()
            .any(|p| p.is_registered() && p.name == entry.name)
        {
            return Err(PluginError::Exists(entry.name.clone()));
        }
        entry.set_state(PluginState::Enabled)?;
        let seq = plugins.next_seq;
        plugins.next_seq += 1;
        {
            let mut life = entry.life.lock();
            life.registered = true;
            life.seq = seq;
        }
        tracing::info!(plugin = %entry.name, priority = ?entry.priority, "plugin registered");
        Ok(())
    }

    /// Unclaims every path of the plugin, detaches it from the devices it
    /// filters, waits for its commands to drain and disables it.
    ///
    /// Fails with `Busy` and leaves the plugin enabled if a path cannot be
    /// unclaimed or the plugin still owns registered devices.
    pub async fn unregister_plugin(&self, plugin: PluginId) -> Result<(), PluginError> {
        let _pass = self.inner.claim_lock.lock().await;
        let entry = self.plugin_entry(plugin)?;
        if !entry.is_registered() {
            return Err(PluginError::NotRegistered);
        }

        match &entry.kind {
            PluginKind::Multipath(_) => {
                entry.set_state(PluginState::ClaimPaths)?;
                for path in self.owned_paths(plugin) {
                    if let Err(err) = self.unclaim_locked(&entry, path).await {
                        tracing::warn!(
                            plugin = %entry.name,
                            error = &err as &dyn std::error::Error,
                            "unregister failed to unclaim path"
                        );
                        entry.set_state(PluginState::Enabled)?;
                        return Err(PluginError::Busy);
                    }
                }
                if !self.registered_devices_of(plugin).is_empty() {
                    entry.set_state(PluginState::Enabled)?;
                    return Err(PluginError::Busy);
                }
            }
            PluginKind::Filter(_) | PluginKind::Vaai(_) => {
                for device in self.filtered_devices(plugin) {
                    self.detach_filter(&entry, device).await;
                }
            }
        }

        entry.set_state(PluginState::Disabling)?;
        entry.io.wait().await;
        entry.set_state(PluginState::Disabled)?;
        entry.life.lock().registered = false;
        tracing::info!(plugin = %entry.name, "plugin unregistered");
        Ok(())
    }

    /// Releases an unregistered plugin.
    pub fn free_plugin(&self, plugin: PluginId) -> Result<(), PluginError> {
        let mut plugins = self.inner.plugins.write();
        let entry = plugins.get(plugin).ok_or(PluginError::NotFound(plugin))?;
        if entry.is_registered() {
            return Err(PluginError::Registered);
        }
        plugins.plugins.remove(&plugin);
        tracing::debug!(plugin = %entry.name, "plugin freed");
        Ok(())
    }

    pub fn plugin_state(&self, plugin: PluginId) -> Result<PluginState, PluginError> {
        Ok(self.plugin_entry(plugin)?.state())
    }

    pub fn plugin_name(&self, plugin: PluginId) -> Result<String, PluginError> {
        Ok(self.plugin_entry(plugin)?.name.clone())
    }

    pub fn plugin_priority(&self, plugin: PluginId) -> Result<PluginPriority, PluginError> {
        Ok(self.plugin_entry(plugin)?.priority)
    }

    /// Commands currently routed through the plugin.
    pub fn plugin_outstanding(&self, plugin: PluginId) -> Result<usize, PluginError> {
        Ok(self.plugin_entry(plugin)?.io.count())
    }

    /// Registered multipath plugins in the order they are offered paths.
    pub(crate) fn claim_order(&self) -> Vec<Arc<PluginEntry>> {
        self.inner
            .plugins
            .read()
            .ordered()
            .into_iter()
            .filter(|p| p.multipath().is_some() && p.state() == PluginState::Enabled)
            .collect()
    }

    /// Registered filter and VAAI plugins in the order they are offered
    /// devices.
    pub(crate) fn device_claim_order(&self) -> Vec<Arc<PluginEntry>> {
        self.inner
            .plugins
            .read()
            .ordered()
            .into_iter()
            .filter(|p| p.multipath().is_none() && p.state() == PluginState::Enabled)
            .collect()
    }
}
