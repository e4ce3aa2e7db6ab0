// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The claim protocol.
//!
//! A pass runs `claim_begin` on every enabled multipath plugin, offers each
//! unclaimed path to the plugins in priority order until one takes it, then
//! runs `claim_end` on every plugin. Passes and unclaims hold the stack's
//! claim lock, so at most one claim callback runs at a time.

use crate::ScsiStack;
use crate::error::PathError;
use crate::path::PathEntry;
use crate::path::PathId;
use crate::path::PathState;
use crate::plugin::PluginEntry;
use crate::plugin::PluginId;
use crate::plugin::PluginState;
use std::sync::Arc;
use tracing::Instrument;

/// Scope of one claim attempt. A plugin that declines a path, or fails to
/// decide, has any I/O it issued on the path drained before the path moves
/// on to the next plugin.
#[must_use]
struct DrainGuard<'a> {
    path: &'a PathEntry,
}

impl<'a> DrainGuard<'a> {
    fn new(path: &'a PathEntry) -> Self {
        Self { path }
    }

    /// The plugin took the path; its I/O is its own business now.
    fn claimed(self) {}

    async fn join(self) {
        if self.path.io.count() != 0 {
            tracing::debug!(path = %self.path.name, "draining claim i/o");
        }
        self.path.io.wait().await;
    }
}

impl ScsiStack {
    /// Offers every unclaimed path to the enabled multipath plugins. Returns
    /// the number of paths claimed.
    pub async fn claim_unclaimed_paths(&self) -> usize {
        self.claim_pass()
            .instrument(tracing::info_span!("claim_pass"))
            .await
    }

    async fn claim_pass(&self) -> usize {
        let _pass = self.inner.claim_lock.lock().await;

        let mut plugins = Vec::new();
        for entry in self.claim_order() {
            let Some(mp) = entry.multipath().cloned() else {
                continue;
            };
            if entry.set_state(PluginState::ClaimPaths).is_err() {
                continue;
            }
            match mp.claim_begin(self, entry.id).await {
                Ok(()) => plugins.push((entry, mp)),
                Err(err) => {
                    tracing::warn!(
                        plugin = %entry.name,
                        error = &*err as &dyn std::error::Error,
                        "claim begin failed, skipping plugin for this pass"
                    );
                    restore_enabled(&entry);
                }
            }
        }

        let mut claimed = 0;
        if !plugins.is_empty() {
            for path in self.unclaimed_paths() {
                let Ok(entry) = self.path_entry(path) else {
                    continue;
                };
                for (plugin, mp) in &plugins {
                    let guard = DrainGuard::new(&entry);
                    match mp.claim(self, plugin.id, path).await {
                        Ok(true) => {
                            guard.claimed();
                            if self.take_ownership(&entry, plugin) {
                                claimed += 1;
                            } else if let Err(err) = mp.unclaim(self, plugin.id, path).await {
                                tracing::warn!(
                                    path = %entry.name,
                                    plugin = %plugin.name,
                                    error = &*err as &dyn std::error::Error,
                                    "failed to return path removed during claim"
                                );
                            }
                            break;
                        }
                        Ok(false) => guard.join().await,
                        Err(err) => {
                            tracing::warn!(
                                path = %entry.name,
                                plugin = %plugin.name,
                                error = &*err as &dyn std::error::Error,
                                "claim failed"
                            );
                            guard.join().await;
                        }
                    }
                }
            }
        }

        for (plugin, mp) in &plugins {
            if let Err(err) = mp.claim_end(self, plugin.id).await {
                tracing::warn!(
                    plugin = %plugin.name,
                    error = &*err as &dyn std::error::Error,
                    "claim end failed"
                );
            }
            restore_enabled(plugin);
        }

        if claimed != 0 {
            tracing::info!(claimed, "claim pass done");
        }
        claimed
    }

    /// Records `plugin` as the owner. Fails if the path started being removed
    /// while it was offered.
    fn take_ownership(&self, entry: &PathEntry, plugin: &PluginEntry) -> bool {
        let mut inner = entry.state.lock();
        if inner.removing || inner.owner.is_some() {
            return false;
        }
        inner.owner = Some(plugin.id);
        tracing::info!(path = %entry.name, plugin = %plugin.name, "path claimed");
        true
    }

    /// Asks the owner to give up a path.
    pub async fn unclaim_path(&self, plugin: PluginId, path: PathId) -> Result<(), PathError> {
        let _pass = self.inner.claim_lock.lock().await;
        let entry = self
            .plugin_entry(plugin)
            .map_err(|_| PathError::NoPermission(path))?;
        self.unclaim_locked(&entry, path).await
    }

    /// Unclaims with the claim lock already held.
    pub(crate) async fn unclaim_locked(
        &self,
        plugin: &Arc<PluginEntry>,
        path: PathId,
    ) -> Result<(), PathError> {
        let entry = self.path_entry(path)?;
        if entry.state.lock().owner != Some(plugin.id) {
            return Err(PathError::NoPermission(path));
        }
        let Some(mp) = plugin.multipath().cloned() else {
            return Err(PathError::NoPermission(path));
        };

        let entered = plugin.set_state(PluginState::ClaimPaths).is_ok();
        if !entered && plugin.state() != PluginState::ClaimPaths {
            return Err(PathError::Busy(path));
        }
        let result = mp.unclaim(self, plugin.id, path).await;
        if entered {
            restore_enabled(plugin);
        }

        match result {
            Ok(()) => {
                let mut inner = entry.state.lock();
                if let Some(device) = inner.device {
                    tracing::warn!(
                        path = %entry.name,
                        plugin = %plugin.name,
                        device = %device,
                        "unclaimed path still backs a device"
                    );
                    return Err(PathError::Busy(path));
                }
                inner.owner = None;
                inner.link = PathState::Dead;
                inner.adopt_changed_identity();
                tracing::info!(path = %entry.name, plugin = %plugin.name, "path unclaimed");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    path = %entry.name,
                    plugin = %plugin.name,
                    error = &*err as &dyn std::error::Error,
                    "unclaim failed"
                );
                Err(PathError::Busy(path))
            }
        }
    }
}

fn restore_enabled(plugin: &PluginEntry) {
    if let Err(err) = plugin.set_state(PluginState::Enabled) {
        tracing::warn!(
            plugin = %plugin.name,
            error = &err as &dyn std::error::Error,
            "plugin left claim state unexpectedly"
        );
    }
}
