// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod device_tests;
mod test_helpers;

use crate::ScsiStack;
use crate::path::PathId;
use crate::path::ScanFilter;
use crate::plugin::MultipathCapability;
use crate::plugin::PluginId;
use crate::plugin::PluginKind;
use crate::plugin::PluginPriority;
use crate::round_robin::RoundRobin;
use futures::executor::block_on;
use std::sync::Arc;
use test_helpers::MockAdapter;
use test_helpers::MockLun;
use test_helpers::QueueSpawner;

const ADAPTER: &str = "vmhba0";

fn add_multipath(
    stack: &ScsiStack,
    name: &str,
    priority: u32,
    plugin: Arc<dyn MultipathCapability>,
) -> PluginId {
    let id = stack
        .allocate_plugin(name, PluginPriority(priority), PluginKind::Multipath(plugin))
        .unwrap();
    block_on(stack.register_plugin(id)).unwrap();
    id
}

fn scan(stack: &ScsiStack) -> usize {
    block_on(stack.scan(&ScanFilter::all())).unwrap()
}

/// A stack with the round-robin plugin and one adapter.
struct Fixture {
    stack: ScsiStack,
    spawner: QueueSpawner,
    adapter: Arc<MockAdapter>,
    rr: Arc<RoundRobin>,
    plugin: PluginId,
}

impl Fixture {
    fn new() -> Self {
        let (stack, spawner) = test_helpers::new_stack();
        let adapter = MockAdapter::new(2, 2, 4);
        stack.register_adapter(ADAPTER, adapter.clone()).unwrap();
        let rr = RoundRobin::new();
        let plugin = add_multipath(&stack, "rr", 10, rr.clone());
        Self {
            stack,
            spawner,
            adapter,
            rr,
            plugin,
        }
    }

    /// Exposes the LUN `naa` on `paths` channel/target pairs and scans.
    fn with_device(naa: u64, paths: &[(u32, u32)]) -> (Self, crate::device::DeviceId) {
        let fixture = Self::new();
        for &(channel, target) in paths {
            fixture.adapter.add_lun(channel, target, 0, MockLun::disk(naa));
        }
        assert_eq!(scan(&fixture.stack), paths.len());
        let device = fixture
            .stack
            .find_device(&test_helpers::naa_uid(naa))
            .unwrap();
        (fixture, device)
    }

    fn path(&self, channel: u32, target: u32, lun: u32) -> PathId {
        self.stack
            .find_path(&crate::path::PathAddress::new(ADAPTER, channel, target, lun))
            .unwrap()
    }
}
