// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::ADAPTER;
use super::Fixture;
use super::add_multipath;
use super::scan;
use super::test_helpers::Completions;
use super::test_helpers::ManualOps;
use super::test_helpers::MockAdapter;
use super::test_helpers::MockLun;
use super::test_helpers::ScriptedPlugin;
use super::test_helpers::cmd_id;
use super::test_helpers::naa_page;
use super::test_helpers::naa_uid;
use super::test_helpers::new_stack;
use super::test_helpers::new_stack_with;
use super::test_helpers::read10;
use crate::ScsiStack;
use crate::command::Cdb;
use crate::command::CmdStatus;
use crate::command::ScsiCommand;
use crate::command::TaskMgmtType;
use crate::config::StackParameters;
use crate::device::DeviceId;
use crate::device::DeviceRegistration;
use crate::device::DeviceState;
use crate::device::DeviceStateInfo;
use crate::device::ProbeRate;
use crate::error::DeviceError;
use crate::error::IssueError;
use crate::error::RegisterError;
use crate::error::UidError;
use crate::path::PathState;
use crate::plugin::PluginId;
use crate::plugin::PluginKind;
use crate::plugin::PluginPriority;
use crate::plugin::VaaiCapability;
use crate::plugin::VaaiPrimitives;
use crate::round_robin::RoundRobin;
use crate::uid::Uid;
use crate::uid::UidFlags;
use futures::executor::block_on;
use parking_lot::Mutex;
use scsi_defs::HostStatus;
use scsi_defs::ScsiOp;
use std::sync::Arc;

/// A stack whose paths are owned by a scripted plugin, for driving device
/// registration by hand.
fn scripted_stack(luns: u32) -> (ScsiStack, PluginId, Vec<crate::path::PathId>) {
    let (stack, _spawner) = new_stack();
    let adapter = MockAdapter::new(1, 1, luns);
    for lun in 0..luns {
        adapter.add_lun(0, 0, lun, MockLun::disk(u64::from(lun) + 1));
    }
    stack.register_adapter(ADAPTER, adapter).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let plugin = add_multipath(&stack, "A", 1, ScriptedPlugin::accepting("A", log));
    scan(&stack);
    let paths = stack.paths();
    (stack, plugin, paths)
}

fn registration(uids: Vec<Uid>, paths: Vec<crate::path::PathId>) -> DeviceRegistration {
    DeviceRegistration {
        uids,
        paths,
        ops: Some(RoundRobin::new()),
        block_size: 512,
        block_count: 1 << 20,
    }
}

#[test]
fn primary_uid_is_unique_across_devices() {
    let (stack, plugin, paths) = scripted_stack(2);
    let uid = Uid::new("naa.123", UidFlags::new().with_primary(true).with_unique(true));

    let d1 = stack.allocate_device(plugin).unwrap();
    block_on(stack.register_device(d1, registration(vec![uid.clone()], vec![paths[0]]))).unwrap();
    assert_eq!(stack.device_state(d1).unwrap().0, DeviceState::On);
    assert_eq!(stack.path_device(paths[0]).unwrap(), Some(d1));

    let d2 = stack.allocate_device(plugin).unwrap();
    assert!(matches!(
        block_on(stack.register_device(d2, registration(vec![uid], vec![paths[1]]))),
        Err(RegisterError::Exists)
    ));
    assert!(stack.device_uids(d2).is_empty());
    assert_eq!(stack.path_device(paths[1]).unwrap(), None);
    assert_eq!(stack.find_device("naa.123"), Some(d1));
    assert_eq!(stack.device_name(d1), "naa.123");
    assert_eq!(stack.device_capacity(d1).unwrap(), (512, 1 << 20));
    stack.free_device(d2).unwrap();
}

#[test]
fn registration_validation() {
    let (stack, plugin, paths) = scripted_stack(1);
    let device = stack.allocate_device(plugin).unwrap();
    let primary = || Uid::primary("naa.1");

    assert!(matches!(
        block_on(stack.register_device(device, registration(vec![], paths.clone()))),
        Err(RegisterError::BadParam(_))
    ));
    assert!(matches!(
        block_on(stack.register_device(
            device,
            registration(vec![primary(), Uid::primary("naa.2")], paths.clone())
        )),
        Err(RegisterError::BadParam(_))
    ));
    assert!(matches!(
        block_on(stack.register_device(
            device,
            DeviceRegistration {
                ops: None,
                ..registration(vec![primary()], paths.clone())
            }
        )),
        Err(RegisterError::BadParam(_))
    ));
    assert!(matches!(
        block_on(stack.register_device(device, registration(vec![primary()], vec![]))),
        Err(RegisterError::NotFound)
    ));
    assert!(matches!(
        block_on(stack.register_device(
            device,
            registration(
                vec![primary(), Uid::new("bad uid", UidFlags::standard())],
                paths.clone()
            )
        )),
        Err(RegisterError::InvalidUid(UidError::InvalidUid))
    ));
    assert!(matches!(
        block_on(stack.register_device(
            device,
            registration(vec![primary(), Uid::new("naa.1", UidFlags::standard())], paths.clone())
        )),
        Err(RegisterError::DuplicateUid)
    ));

    // Nothing was attached by the failed attempts.
    assert!(stack.device_uids(device).is_empty());
    block_on(stack.register_device(device, registration(vec![primary()], paths.clone()))).unwrap();
    assert!(matches!(
        block_on(stack.register_device(device, registration(vec![primary()], paths))),
        Err(RegisterError::AlreadyRegistered)
    ));
}

#[test]
fn paths_must_belong_to_the_plugin() {
    let (stack, plugin, paths) = scripted_stack(1);
    let log = Arc::new(Mutex::new(Vec::new()));
    let other = add_multipath(&stack, "B", 2, ScriptedPlugin::declining("B", log));
    let device = stack.allocate_device(other).unwrap();
    assert!(matches!(
        block_on(stack.register_device(device, registration(vec![Uid::primary("naa.1")], paths))),
        Err(RegisterError::BadParam(_))
    ));
    assert!(stack.allocate_device(plugin).is_ok());
}

#[test]
fn device_slot_limits() {
    let (stack, _spawner) = new_stack_with(StackParameters {
        max_devices: Some(1),
        ..Default::default()
    });
    let log = Arc::new(Mutex::new(Vec::new()));
    let plugin = add_multipath(&stack, "A", 1, ScriptedPlugin::accepting("A", log));
    let vaai = stack
        .allocate_plugin(
            "vaai",
            PluginPriority::VAAI,
            PluginKind::Vaai(Arc::new(Vaai::default())),
        )
        .unwrap();

    assert!(matches!(
        stack.allocate_device(vaai),
        Err(DeviceError::NotSupported)
    ));
    let device = stack.allocate_device(plugin).unwrap();
    assert!(matches!(
        stack.allocate_device(plugin),
        Err(DeviceError::TooManyDevices { limit: 1 })
    ));
    stack.free_device(device).unwrap();
    assert!(matches!(
        stack.free_device(device),
        Err(DeviceError::NotFound(_))
    ));
    stack.allocate_device(plugin).unwrap();
}

#[test]
fn read_only_uids_stay_attached() {
    let (stack, plugin, paths) = scripted_stack(1);
    let device = stack.allocate_device(plugin).unwrap();
    let legacy = Uid::new("vml.0200", UidFlags::new().with_legacy(true));
    let primary = Uid::primary("naa.1");
    block_on(stack.register_device(
        device,
        registration(vec![primary.clone(), legacy.clone()], paths),
    ))
    .unwrap();

    assert!(matches!(
        stack.remove_uid(device, &legacy),
        Err(DeviceError::Uid(UidError::ReadOnly))
    ));
    assert!(matches!(
        stack.remove_uid(device, &primary),
        Err(DeviceError::Uid(UidError::ReadOnly))
    ));
    assert!(stack.device_uids(device).contains(&legacy));

    let extra = Uid::new("t10.MSFT_Disk", UidFlags::standard());
    stack.add_uid(device, extra.clone()).unwrap();
    assert_eq!(stack.find_device("t10.MSFT_Disk"), Some(device));
    stack.remove_uid(device, &extra).unwrap();
    assert!(matches!(
        stack.remove_uid(device, &extra),
        Err(DeviceError::Uid(UidError::NotFound))
    ));
    assert_eq!(stack.device_uids(device).len(), 2);
}

#[test]
fn device_paths_keep_their_owner() {
    let (stack, plugin, paths) = scripted_stack(1);
    let device = stack.allocate_device(plugin).unwrap();
    block_on(stack.register_device(
        device,
        registration(vec![Uid::primary("naa.1")], paths.clone()),
    ))
    .unwrap();

    // The plugin accepts the unclaim but leaves the path on the device.
    assert!(!block_on(stack.remove_path(paths[0])));
    assert_eq!(stack.path_owner(paths[0]).unwrap(), Some(plugin));
    assert_eq!(stack.path_device(paths[0]).unwrap(), Some(device));
    assert_eq!(stack.paths(), paths);

    block_on(stack.unregister_device(device)).unwrap();
    assert!(block_on(stack.remove_path(paths[0])));
    assert!(stack.paths().is_empty());
}

#[test]
fn unregister_and_free() {
    let (stack, plugin, paths) = scripted_stack(1);
    let device = stack.allocate_device(plugin).unwrap();
    block_on(stack.register_device(device, registration(vec![Uid::primary("naa.1")], paths.clone())))
        .unwrap();

    block_on(stack.open_device(device)).unwrap();
    assert!(matches!(
        block_on(stack.unregister_device(device)),
        Err(DeviceError::Busy)
    ));
    assert!(matches!(stack.free_device(device), Err(DeviceError::Busy)));
    block_on(stack.close_device(device)).unwrap();
    assert!(matches!(
        block_on(stack.close_device(device)),
        Err(DeviceError::BadParam(_))
    ));

    block_on(stack.unregister_device(device)).unwrap();
    assert!(stack.device_uids(device).is_empty());
    assert_eq!(stack.find_device("naa.1"), None);
    assert_eq!(stack.path_device(paths[0]).unwrap(), None);
    assert!(matches!(
        block_on(stack.unregister_device(device)),
        Err(DeviceError::NotRegistered)
    ));
    assert!(matches!(
        stack.submit(device, ScsiCommand::new(cmd_id(1), read10())),
        Err(IssueError::DeviceNotFound(_))
    ));
    stack.free_device(device).unwrap();
    assert!(stack.devices().is_empty());
}

#[test]
fn permanent_loss_fails_everything() {
    let (fixture, device) = Fixture::with_device(7, &[(0, 0), (0, 1)]);
    let Fixture {
        stack,
        spawner,
        adapter,
        ..
    } = &fixture;
    adapter.hold(true);

    let done = Completions::default();
    for _ in 0..3 {
        stack.submit(device, done.command(9)).unwrap();
    }
    assert_eq!(adapter.held(), 3);
    assert_eq!(stack.device_outstanding(device).unwrap(), 3);
    assert_eq!(done.len(), 0);

    stack
        .set_device_state(device, DeviceState::PermanentLoss, DeviceStateInfo::Other)
        .unwrap();
    assert_eq!(
        done.statuses(),
        [CmdStatus::host(HostStatus::NO_CONNECT); 3]
    );
    assert_eq!(stack.device_outstanding(device).unwrap(), 0);
    assert_eq!(stack.inflight_commands(), 0);
    assert_eq!(
        stack.submit(device, done.command(9)).unwrap_err(),
        IssueError::PermanentLoss
    );

    // The plugin is reset; the adapter's late completions are ignored.
    spawner.run_until_idle();
    assert!(
        adapter
            .task_mgmt_log()
            .iter()
            .any(|(_, tm)| tm.kind == TaskMgmtType::VirtualReset)
    );
    assert_eq!(adapter.held(), 0);
    assert_eq!(done.len(), 3);

    for state in [
        DeviceState::On,
        DeviceState::Off,
        DeviceState::Apd,
    ] {
        assert!(matches!(
            stack.set_device_state(device, state, DeviceStateInfo::None),
            Err(DeviceError::PermanentLoss)
        ));
    }
    assert!(matches!(
        block_on(stack.quiesce_device(device, DeviceStateInfo::Unregister)),
        Err(DeviceError::PermanentLoss)
    ));
    assert_eq!(
        stack.device_state(device).unwrap(),
        (DeviceState::PermanentLoss, DeviceStateInfo::Other)
    );
    assert!(matches!(
        block_on(stack.open_device(device)),
        Err(DeviceError::PermanentLoss)
    ));
}

#[test]
fn permanent_loss_catches_commands_being_pulled() {
    for _ in 0..32 {
        let (stack, plugin, paths) = scripted_stack(1);
        let device = stack.allocate_device(plugin).unwrap();
        block_on(stack.register_device(
            device,
            DeviceRegistration {
                ops: Some(Arc::new(ManualOps)),
                ..registration(vec![Uid::primary("naa.1")], paths)
            },
        ))
        .unwrap();
        stack.set_max_queue_depth(device, 256).unwrap();

        let done = Completions::default();
        for _ in 0..64 {
            stack.submit(device, done.command(3)).unwrap();
        }
        let pulled = std::thread::scope(|s| {
            let puller = s.spawn(|| {
                let mut pulled = Vec::new();
                while let Some(cmd) = stack.get_next_command(device) {
                    pulled.push(cmd);
                }
                pulled
            });
            stack
                .set_device_state(device, DeviceState::PermanentLoss, DeviceStateInfo::Other)
                .unwrap();
            puller.join().unwrap()
        });

        // Queued and pulled commands alike have failed.
        assert_eq!(
            done.statuses(),
            vec![CmdStatus::host(HostStatus::NO_CONNECT); 64]
        );
        assert_eq!(stack.inflight_commands(), 0);
        for cmd in pulled {
            cmd.complete(CmdStatus::GOOD, &[], 0);
        }
        assert_eq!(done.len(), 64);
        assert_eq!(stack.device_outstanding(device).unwrap(), 0);
    }
}

#[test]
fn quiesce_refuses_new_work() {
    let (fixture, device) = Fixture::with_device(7, &[(0, 0)]);
    let stack = &fixture.stack;

    assert!(matches!(
        stack.set_device_state(device, DeviceState::Quiesced, DeviceStateInfo::Unregister),
        Err(DeviceError::BadParam(_))
    ));
    assert!(matches!(
        block_on(stack.quiesce_device(device, DeviceStateInfo::Other)),
        Err(DeviceError::BadParam(_))
    ));
    block_on(stack.quiesce_device(device, DeviceStateInfo::Unregister)).unwrap();
    assert_eq!(stack.device_state(device).unwrap().0, DeviceState::Quiesced);
    assert_eq!(
        stack.submit(device, ScsiCommand::new(cmd_id(1), read10())),
        Err(IssueError::Busy)
    );
}

#[test]
fn off_device_refuses_io_and_open() {
    let (fixture, device) = Fixture::with_device(7, &[(0, 0)]);
    let stack = &fixture.stack;

    stack.notify_device_event(device, DeviceState::Off).unwrap();
    assert_eq!(
        stack.submit(device, ScsiCommand::new(cmd_id(1), read10())),
        Err(IssueError::NoConnect)
    );
    assert!(matches!(
        block_on(stack.open_device(device)),
        Err(DeviceError::NoConnect)
    ));
    assert!(matches!(
        stack.notify_device_event(device, DeviceState::Apd),
        Err(DeviceError::BadParam(_))
    ));
    stack.notify_device_event(device, DeviceState::On).unwrap();
    block_on(stack.open_device(device)).unwrap();
}

#[test]
fn reserve_generation_counts_up() {
    let (fixture, device) = Fixture::with_device(7, &[(0, 0)]);
    let stack = &fixture.stack;
    assert_eq!(stack.reserve_generation(device).unwrap(), 0);
    assert_eq!(stack.increment_reserve_generation(device).unwrap(), 1);
    assert_eq!(stack.increment_reserve_generation(device).unwrap(), 2);
    assert_eq!(stack.reserve_generation(device).unwrap(), 2);
}

#[test]
fn round_robin_builds_one_device_per_uid() {
    let fixture = Fixture::new();
    for target in 0..2 {
        fixture.adapter.add_lun(0, target, 0, MockLun::disk(0xa));
        fixture.adapter.add_lun(0, target, 1, MockLun::disk(0xb));
    }
    assert_eq!(scan(&fixture.stack), 4);

    let devices = fixture.rr.devices();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].0, naa_uid(0xa));
    for (uid, device) in devices {
        let paths = fixture.stack.device_paths(device).unwrap();
        assert_eq!(paths.len(), 2);
        for path in &paths {
            assert_eq!(fixture.stack.path_owner(*path).unwrap(), Some(fixture.plugin));
            assert_eq!(fixture.stack.path_uid(*path).unwrap().unwrap().id, uid);
        }
        assert_eq!(fixture.stack.device_path_names(device).unwrap().len(), 2);
        assert_eq!(fixture.stack.device_plugin(device).unwrap(), fixture.plugin);
    }

    // A path added later joins the existing device.
    fixture.adapter.add_lun(1, 0, 0, MockLun::disk(0xa));
    assert_eq!(scan(&fixture.stack), 1);
    let device = fixture.stack.find_device(&naa_uid(0xa)).unwrap();
    assert_eq!(fixture.stack.device_paths(device).unwrap().len(), 3);
}

#[test]
fn commands_alternate_between_paths() {
    let (fixture, device) = Fixture::with_device(7, &[(0, 0), (0, 1)]);
    let done = Completions::default();
    for _ in 0..4 {
        fixture.stack.submit(device, done.command(3)).unwrap();
    }
    assert_eq!(done.len(), 4);
    assert!(done.0.lock().iter().all(|c| c.is_good()));

    let targets: Vec<_> = fixture
        .adapter
        .io_commands()
        .iter()
        .map(|(a, _)| a.target)
        .collect();
    assert_eq!(targets.len(), 4);
    assert_ne!(targets[0], targets[1]);
    assert_eq!(targets[0], targets[2]);
    assert_eq!(targets[1], targets[3]);
}

#[test]
fn failover_to_surviving_path() {
    let (fixture, device) = Fixture::with_device(7, &[(0, 0), (0, 1)]);
    let Fixture {
        stack,
        spawner,
        adapter,
        ..
    } = &fixture;
    let lost = fixture.path(0, 0, 0);
    adapter.remove_lun(0, 0, 0);

    let done = Completions::default();
    for _ in 0..4 {
        stack.submit(device, done.command(3)).unwrap();
    }
    assert_eq!(done.len(), 4);
    assert!(done.0.lock().iter().all(|c| c.is_good()));

    // The failed path is probed in the background and marked dead.
    spawner.run_until_idle();
    assert_eq!(stack.path_state(lost).unwrap(), PathState::Dead);
    let before = adapter.io_commands().len();
    stack.submit(device, done.command(3)).unwrap();
    let after = adapter.io_commands();
    assert_eq!(after.len(), before + 1);
    assert_eq!(after.last().unwrap().0.target, 1);
}

#[test]
fn all_paths_down_holds_commands() {
    let (fixture, device) = Fixture::with_device(7, &[(0, 0)]);
    let stack = &fixture.stack;
    fixture.adapter.remove_lun(0, 0, 0);
    block_on(stack.probe_device(device)).unwrap();
    assert_eq!(stack.device_state(device).unwrap().0, DeviceState::Apd);

    let done = Completions::default();
    stack.submit(device, done.command(3)).unwrap();
    stack.submit(device, done.command(3)).unwrap();
    assert_eq!(done.len(), 0);
    assert_eq!(stack.device_outstanding(device).unwrap(), 2);

    assert_eq!(stack.flush_apd_commands(device).unwrap(), 2);
    assert_eq!(
        done.statuses(),
        [CmdStatus::host(HostStatus::NO_CONNECT); 2]
    );
    assert_eq!(stack.device_outstanding(device).unwrap(), 0);

    // The path comes back and so does the device; queued work drains.
    fixture.adapter.add_lun(0, 0, 0, MockLun::disk(7));
    stack.submit(device, done.command(3)).unwrap();
    block_on(stack.probe_device(device)).unwrap();
    assert_eq!(stack.device_state(device).unwrap().0, DeviceState::On);
    assert_eq!(done.len(), 3);
    assert!(done.0.lock()[2].is_good());
}

#[test]
fn queue_depth_limits_dispatch() {
    let (fixture, device) = Fixture::with_device(7, &[(0, 0)]);
    let stack = &fixture.stack;
    assert!(matches!(
        stack.set_max_queue_depth(device, 0),
        Err(DeviceError::BadParam(_))
    ));
    stack.set_max_queue_depth(device, 1).unwrap();
    assert_eq!(stack.max_queue_depth(device).unwrap(), 1);
    fixture.adapter.hold(true);

    let done = Completions::default();
    for _ in 0..3 {
        stack.submit(device, done.command(3)).unwrap();
    }
    assert_eq!(fixture.adapter.held(), 1);
    assert_eq!(stack.device_outstanding(device).unwrap(), 3);

    // Each completion pulls the next queued command.
    assert_eq!(fixture.adapter.complete_held(CmdStatus::GOOD), 1);
    assert_eq!(fixture.adapter.held(), 1);
    assert_eq!(fixture.adapter.complete_held(CmdStatus::GOOD), 1);
    assert_eq!(fixture.adapter.complete_held(CmdStatus::GOOD), 1);
    assert_eq!(fixture.adapter.held(), 0);
    assert_eq!(done.len(), 3);

    // Raising the depth releases waiting work at once.
    for _ in 0..3 {
        stack.submit(device, done.command(3)).unwrap();
    }
    stack.set_max_queue_depth(device, 8).unwrap();
    assert_eq!(fixture.adapter.held(), 3);
    fixture.adapter.complete_held(CmdStatus::GOOD);
}

#[test]
fn device_paths_can_change() {
    let fixture = Fixture::new();
    fixture.adapter.add_lun(0, 0, 0, MockLun::disk(7));
    fixture.adapter.add_lun(0, 1, 0, MockLun::disk(7));
    scan(&fixture.stack);
    let stack = &fixture.stack;
    let device = stack.find_device(&naa_uid(7)).unwrap();
    let p0 = fixture.path(0, 0, 0);
    let p1 = fixture.path(0, 1, 0);

    stack.remove_device_path(device, p1).unwrap();
    assert_eq!(stack.device_paths(device).unwrap(), [p0]);
    assert_eq!(stack.path_device(p1).unwrap(), None);
    assert!(matches!(
        stack.remove_device_path(device, p0),
        Err(DeviceError::BadParam(_))
    ));
    stack.add_device_path(device, p1).unwrap();
    assert_eq!(stack.device_paths(device).unwrap().len(), 2);

    // Removing a path the device still has hands it back through unclaim.
    assert!(block_on(stack.remove_path(p1)));
    assert_eq!(stack.device_paths(device).unwrap(), [p0]);

    // The last path takes the device with it.
    assert!(block_on(stack.remove_path(p0)));
    assert_eq!(stack.find_device(&naa_uid(7)), None);
    assert!(stack.devices().is_empty());
    assert!(fixture.rr.devices().is_empty());
}

#[test]
fn unregister_plugin_tears_down_devices() {
    let (fixture, device) = Fixture::with_device(7, &[(0, 0), (0, 1)]);
    let stack = &fixture.stack;

    block_on(stack.open_device(device)).unwrap();
    // An open device cannot go away, so neither can its plugin.
    assert!(block_on(stack.unregister_plugin(fixture.plugin)).is_err());
    assert_eq!(stack.device_state(device).unwrap().0, DeviceState::On);

    block_on(stack.close_device(device)).unwrap();
    block_on(stack.unregister_plugin(fixture.plugin)).unwrap();
    assert!(stack.devices().is_empty());
    assert!(
        stack
            .paths()
            .iter()
            .all(|&p| stack.path_owner(p).unwrap().is_none())
    );
}

#[test]
fn inquiry_and_dump_through_the_plugin() {
    let (fixture, device) = Fixture::with_device(0x60a9_8000, &[(0, 0)]);
    let stack = &fixture.stack;

    let standard = block_on(stack.device_inquiry(device, None)).unwrap();
    assert_eq!(standard.len(), scsi_defs::STANDARD_INQUIRY_LEN);
    assert_eq!(&standard[8..12], b"MSFT");
    let page = block_on(stack.device_inquiry(device, Some(0x83))).unwrap();
    assert_eq!(page, naa_page(0x60a9_8000));
    assert!(block_on(stack.device_inquiry(device, Some(0x80))).is_err());

    let mut data = [0u8; 16];
    let status = stack
        .issue_device_dump(
            device,
            &Cdb::new(&[ScsiOp::WRITE10.0, 0, 0, 0, 0, 0, 0, 0, 1, 0]).unwrap(),
            &mut data,
        )
        .unwrap();
    assert!(status.is_good());
    assert_eq!(data, [0xa5; 16]);

    stack
        .switch_probe_rate(device, ProbeRate::Fast, true)
        .unwrap();
    assert_eq!(stack.probe_rate(device).unwrap(), (ProbeRate::Fast, true));
    assert!(
        !stack
            .device_bool_attr(device, crate::device::DeviceBoolAttr::Ssd)
            .unwrap()
    );
}

#[derive(Default)]
struct Vaai {
    claimed: Mutex<Vec<DeviceId>>,
    released: Mutex<Vec<DeviceId>>,
}

#[async_trait::async_trait]
impl VaaiCapability for Vaai {
    async fn claim_device(
        &self,
        _stack: &ScsiStack,
        _plugin: PluginId,
        device: DeviceId,
    ) -> anyhow::Result<bool> {
        self.claimed.lock().push(device);
        Ok(true)
    }

    async fn unclaim_device(
        &self,
        _stack: &ScsiStack,
        _plugin: PluginId,
        device: DeviceId,
    ) -> anyhow::Result<()> {
        self.released.lock().push(device);
        Ok(())
    }

    fn primitives(&self) -> VaaiPrimitives {
        VaaiPrimitives::new()
            .with_atomic_test_set(true)
            .with_zero_blocks(true)
    }
}

#[test]
fn vaai_plugin_attaches_to_new_devices() {
    let fixture = Fixture::new();
    let stack = &fixture.stack;
    let vaai = Arc::new(Vaai::default());
    let vaai_id = stack
        .allocate_plugin("vaai", PluginPriority::VAAI, PluginKind::Vaai(vaai.clone()))
        .unwrap();
    block_on(stack.register_plugin(vaai_id)).unwrap();

    fixture.adapter.add_lun(0, 0, 0, MockLun::disk(7));
    scan(stack);
    let device = stack.find_device(&naa_uid(7)).unwrap();
    assert_eq!(*vaai.claimed.lock(), [device]);
    assert_eq!(stack.device_filter(device).unwrap(), Some(vaai_id));
    let primitives = stack.device_vaai_primitives(device).unwrap();
    assert!(primitives.atomic_test_set());
    assert!(!primitives.clone_blocks());

    block_on(stack.unregister_plugin(vaai_id)).unwrap();
    assert_eq!(*vaai.released.lock(), [device]);
    assert_eq!(stack.device_filter(device).unwrap(), None);
    assert!(stack.device_vaai_primitives(device).is_none());
}
