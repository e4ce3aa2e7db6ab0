// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Adapter scanning.

use crate::ScsiStack;
use crate::adapter::AdapterEntry;
use crate::adapter::ScanAction;
use crate::adapter::ScanGuard;
use crate::error::ScanError;
use crate::path::PathAddress;
use crate::path::PathEntry;
use crate::path::PathState;
use crate::path::ScanFilter;
use std::ops::Range;
use std::sync::Arc;
use tracing::Instrument;

/// What one adapter's discovery turned up.
#[derive(Default)]
struct Discovered {
    created: Vec<Arc<PathEntry>>,
    /// Known paths that were dead and answer again.
    revived: Vec<Arc<PathEntry>>,
    error: Option<ScanError>,
}

impl Discovered {
    fn fail(&mut self, err: ScanError) {
        tracing::warn!(error = &err as &dyn std::error::Error, "scan error");
        self.error.get_or_insert(err);
    }
}

/// The indices to scan. A fixed index outside the adapter's topology
/// selects nothing.
fn range(fixed: Option<u32>, count: u32) -> Range<u32> {
    match fixed {
        Some(n) if n < count => n..n + 1,
        Some(_) => 0..0,
        None => 0..count,
    }
}

impl ScsiStack {
    /// Discovers LUNs on the adapters matching `filter`, creates paths for
    /// new ones, probes them and runs a claim pass.
    ///
    /// Adapters are scanned concurrently. A failure on one LUN or adapter
    /// does not stop the others; paths created before the failure stay, and
    /// the first error is returned after the claim pass. Returns the number
    /// of paths created.
    pub async fn scan(&self, filter: &ScanFilter) -> Result<usize, ScanError> {
        let adapters = match &filter.adapter {
            Some(name) => vec![
                self.adapter_entry(name)
                    .ok_or_else(|| ScanError::AdapterNotFound(name.clone()))?,
            ],
            None => self
                .adapter_names()
                .iter()
                .filter_map(|name| self.adapter_entry(name))
                .collect(),
        };

        let results = futures::future::join_all(adapters.into_iter().map(|entry| {
            let span = tracing::info_span!("scan", adapter = %entry.name);
            self.scan_adapter(entry, filter).instrument(span)
        }))
        .await;

        let mut created = 0;
        let mut error = None;
        for found in results {
            for path in &found.created {
                if let Err(err) = self.probe_direct(path.id).await {
                    tracing::debug!(
                        path = %path.name,
                        error = &err as &dyn std::error::Error,
                        "probe of new path failed"
                    );
                }
            }
            for path in &found.revived {
                if let Err(err) = self.probe(path.id).await {
                    tracing::debug!(
                        path = %path.name,
                        error = &err as &dyn std::error::Error,
                        "probe of revived path failed"
                    );
                }
            }
            created += found.created.len();
            if error.is_none() {
                error = found.error;
            }
        }

        self.claim_unclaimed_paths().await;

        match error {
            Some(err) => Err(err),
            None => Ok(created),
        }
    }

    async fn scan_adapter(&self, entry: Arc<AdapterEntry>, filter: &ScanFilter) -> Discovered {
        let mut found = Discovered::default();
        let Some(_guard) = ScanGuard::try_new(entry.clone()) else {
            found.fail(ScanError::Busy(entry.name.clone()));
            return found;
        };

        let topology = entry.adapter.topology();
        'scan: for channel in range(filter.channel, topology.channels) {
            for target in range(filter.target, topology.targets) {
                let present = match entry.adapter.check_target(channel, target).await {
                    Ok(present) => present,
                    Err(source) => {
                        found.fail(ScanError::Discover {
                            adapter: entry.name.clone(),
                            channel,
                            target,
                            source,
                        });
                        continue;
                    }
                };

                for lun in range(filter.lun, topology.luns) {
                    let address = PathAddress::new(entry.name.clone(), channel, target, lun);
                    let known = {
                        let paths = self.inner.paths.read();
                        paths.lookup(&address).and_then(|id| paths.get(id))
                    };

                    if !present {
                        if let Some(path) = &known {
                            self.mark_dead(path);
                        }
                        continue;
                    }

                    let action = if known.is_some() {
                        ScanAction::ConfigurePath
                    } else {
                        ScanAction::CreatePath
                    };
                    let answered = match entry.adapter.discover(action, channel, target, lun).await
                    {
                        Ok(answered) => answered,
                        Err(source) => {
                            found.fail(ScanError::Discover {
                                adapter: entry.name.clone(),
                                channel,
                                target,
                                source,
                            });
                            continue;
                        }
                    };

                    match (known, answered) {
                        (Some(path), false) => {
                            tracing::info!(path = %path.name, "lun no longer answers");
                            self.mark_dead(&path);
                        }
                        (Some(path), true) => {
                            let dead = {
                                let inner = path.state.lock();
                                !inner.removing && inner.link == PathState::Dead
                            };
                            if dead {
                                found.revived.push(path);
                            }
                        }
                        (None, false) => {}
                        (None, true) => {
                            let limit = self.inner.config.max_paths;
                            let inserted =
                                self.inner
                                    .paths
                                    .write()
                                    .insert(address, entry.clone(), limit);
                            match inserted {
                                Ok(path) => {
                                    tracing::info!(path = %path.name, "path created");
                                    found.created.push(path);
                                }
                                Err(err) => {
                                    found.fail(err);
                                    break 'scan;
                                }
                            }
                        }
                    }
                }
            }
        }
        found
    }
}
