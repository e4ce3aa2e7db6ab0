// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mock adapter, scripted plugins and a deterministic spawner.

use crate::ActiveCommand;
use crate::ScsiStack;
use crate::adapter::Adapter;
use crate::adapter::AdapterTopology;
use crate::adapter::ScanAction;
use crate::command::Cdb;
use crate::command::CmdStatus;
use crate::command::CommandCompletion;
use crate::command::CommandId;
use crate::command::InitiatorId;
use crate::command::ScsiCommand;
use crate::command::TaskMgmt;
use crate::command::TaskMgmtAction;
use crate::config::StackParameters;
use crate::device::DeviceBoolAttr;
use crate::device::DeviceId;
use crate::device::DeviceOps;
use crate::path::PathAddress;
use crate::path::PathId;
use crate::plugin::MultipathCapability;
use crate::plugin::PluginId;
use futures::future::BoxFuture;
use futures::task::FutureObj;
use futures::task::Spawn;
use futures::task::SpawnError;
use parking_lot::Mutex;
use scsi_defs::AdditionalSenseCode;
use scsi_defs::HostStatus;
use scsi_defs::STANDARD_INQUIRY_LEN;
use scsi_defs::ScsiOp;
use scsi_defs::ScsiStatus;
use scsi_defs::SenseData;
use scsi_defs::SenseKey;
use scsi_defs::VPD_DEVICE_IDENTIFIERS;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;
use zerocopy::IntoBytes;

/// Installs a test-writer subscriber once per process. `RUST_LOG` overrides
/// the default debug filter.
pub fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let targets = match std::env::var("RUST_LOG") {
            Ok(var) => var.parse().unwrap(),
            Err(_) => Targets::new().with_default(LevelFilter::DEBUG),
        };
        tracing_subscriber::fmt()
            .pretty()
            .with_ansi(false)
            .log_internal_errors(true)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .finish()
            .with(targets)
            .init();
    });
}

/// Collects spawned tasks and runs them when asked, on the test thread.
#[derive(Clone, Default)]
pub struct QueueSpawner {
    tasks: Arc<Mutex<Vec<BoxFuture<'static, ()>>>>,
}

impl Spawn for QueueSpawner {
    fn spawn_obj(&self, future: FutureObj<'static, ()>) -> Result<(), SpawnError> {
        self.tasks.lock().push(Box::pin(future));
        Ok(())
    }
}

impl QueueSpawner {
    /// Runs queued tasks, including ones they spawn, until none are left.
    /// Must not be called from inside `block_on`.
    pub fn run_until_idle(&self) {
        loop {
            let tasks = std::mem::take(&mut *self.tasks.lock());
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                futures::executor::block_on(task);
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }
}

pub fn new_stack() -> (ScsiStack, QueueSpawner) {
    new_stack_with(StackParameters::default())
}

pub fn new_stack_with(params: StackParameters) -> (ScsiStack, QueueSpawner) {
    init_tracing();
    let spawner = QueueSpawner::default();
    let stack = ScsiStack::new(params.resolve().unwrap(), spawner.clone());
    (stack, spawner)
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// A fresh command identity for `initiator`.
pub fn cmd_id(initiator: u64) -> CommandId {
    CommandId {
        initiator: InitiatorId(initiator),
        serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
    }
}

/// A 10-byte READ.
pub fn read10() -> Cdb {
    Cdb::new(&[ScsiOp::READ10.0, 0, 0, 0, 0, 0, 0, 0, 8, 0]).unwrap()
}

/// Collects completions delivered to callbacks.
#[derive(Clone, Default)]
pub struct Completions(pub Arc<Mutex<Vec<CommandCompletion>>>);

impl Completions {
    /// Routes the completion of `cmd` here.
    pub fn on(&self, cmd: ScsiCommand) -> ScsiCommand {
        let sink = self.0.clone();
        cmd.on_complete(move |c| sink.lock().push(c))
    }

    /// A 4 KiB read from `initiator` that completes here.
    pub fn command(&self, initiator: u64) -> ScsiCommand {
        self.on(ScsiCommand::new(cmd_id(initiator), read10()).read(4096))
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn statuses(&self) -> Vec<CmdStatus> {
        self.0.lock().iter().map(|c| c.status).collect()
    }
}

pub fn sense(key: SenseKey, asc: AdditionalSenseCode, ascq: u8) -> Vec<u8> {
    SenseData::new(key, asc, ascq).as_bytes().to_vec()
}

/// Standard inquiry data for a disk.
pub fn inquiry_data(vendor: &str, product: &str) -> [u8; STANDARD_INQUIRY_LEN] {
    let mut data = [b' '; STANDARD_INQUIRY_LEN];
    data[..8].fill(0);
    data[2] = 6;
    data[3] = 2;
    data[4] = (STANDARD_INQUIRY_LEN - 5) as u8;
    data[8..8 + vendor.len().min(8)].copy_from_slice(&vendor.as_bytes()[..vendor.len().min(8)]);
    data[16..16 + product.len().min(16)]
        .copy_from_slice(&product.as_bytes()[..product.len().min(16)]);
    data
}

/// A device identification page holding one binary NAA designator.
pub fn naa_page(naa: u64) -> Vec<u8> {
    let mut page = vec![0, VPD_DEVICE_IDENTIFIERS, 0, 12];
    // Binary code set, NAA type, logical unit association.
    page.extend_from_slice(&[0x01, 0x03, 0, 8]);
    page.extend_from_slice(&naa.to_be_bytes());
    page
}

/// The UID a probe derives from [`naa_page`].
pub fn naa_uid(naa: u64) -> String {
    format!("naa.{naa:016x}")
}

#[derive(Clone)]
pub struct MockLun {
    pub inquiry: [u8; STANDARD_INQUIRY_LEN],
    pub naa: Option<u64>,
    pub tur: CmdStatus,
    pub tur_sense: Vec<u8>,
}

impl MockLun {
    pub fn disk(naa: u64) -> Self {
        Self {
            inquiry: inquiry_data("MSFT", "Virtual Disk"),
            naa: Some(naa),
            tur: CmdStatus::GOOD,
            tur_sense: Vec::new(),
        }
    }
}

#[derive(Default)]
struct MockState {
    luns: HashMap<(u32, u32, u32), MockLun>,
    /// Hold non-probe commands instead of completing them.
    hold: bool,
    held: Vec<(PathAddress, ActiveCommand)>,
    /// Statuses for non-probe commands, consumed in order. Good once empty.
    script: VecDeque<CmdStatus>,
    commands: Vec<(PathAddress, ScsiOp)>,
    task_mgmt: Vec<(PathAddress, TaskMgmt)>,
    destroyed: Vec<(u32, u32, u32)>,
    dead_targets: HashSet<(u32, u32)>,
}

/// An adapter whose LUNs answer from a script.
pub struct MockAdapter {
    topology: AdapterTopology,
    state: Mutex<MockState>,
}

impl MockAdapter {
    pub fn new(channels: u32, targets: u32, luns: u32) -> Arc<Self> {
        Arc::new(Self {
            topology: AdapterTopology {
                channels,
                targets,
                luns,
            },
            state: Mutex::default(),
        })
    }

    pub fn add_lun(&self, channel: u32, target: u32, lun: u32, data: MockLun) {
        self.state.lock().luns.insert((channel, target, lun), data);
    }

    pub fn remove_lun(&self, channel: u32, target: u32, lun: u32) {
        self.state.lock().luns.remove(&(channel, target, lun));
    }

    pub fn set_target_dead(&self, channel: u32, target: u32, dead: bool) {
        let mut state = self.state.lock();
        if dead {
            state.dead_targets.insert((channel, target));
        } else {
            state.dead_targets.remove(&(channel, target));
        }
    }

    pub fn update_lun(&self, channel: u32, target: u32, lun: u32, f: impl FnOnce(&mut MockLun)) {
        if let Some(data) = self.state.lock().luns.get_mut(&(channel, target, lun)) {
            f(data);
        }
    }

    pub fn hold(&self, hold: bool) {
        self.state.lock().hold = hold;
    }

    pub fn script(&self, statuses: impl IntoIterator<Item = CmdStatus>) {
        self.state.lock().script.extend(statuses);
    }

    pub fn held(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Completes every held command with `status`.
    pub fn complete_held(&self, status: CmdStatus) -> usize {
        let held = std::mem::take(&mut self.state.lock().held);
        let count = held.len();
        for (_, cmd) in held {
            let len = cmd.data().len();
            cmd.complete(status, &[], len);
        }
        count
    }

    /// Takes the held commands without completing them.
    pub fn take_held(&self) -> Vec<ActiveCommand> {
        std::mem::take(&mut self.state.lock().held)
            .into_iter()
            .map(|(_, cmd)| cmd)
            .collect()
    }

    /// Opcodes of the non-probe commands the adapter received.
    pub fn io_commands(&self) -> Vec<(PathAddress, ScsiOp)> {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|(_, op)| *op != ScsiOp::INQUIRY && *op != ScsiOp::TEST_UNIT_READY)
            .cloned()
            .collect()
    }

    pub fn task_mgmt_log(&self) -> Vec<(PathAddress, TaskMgmt)> {
        self.state.lock().task_mgmt.clone()
    }

    pub fn destroyed(&self) -> Vec<(u32, u32, u32)> {
        self.state.lock().destroyed.clone()
    }

    fn answer(lun: &MockLun, cmd: &mut ActiveCommand) -> (CmdStatus, Vec<u8>, usize) {
        let cdb = cmd.cdb().as_bytes().to_vec();
        match cmd.cdb().opcode() {
            ScsiOp::TEST_UNIT_READY => (lun.tur, lun.tur_sense.clone(), 0),
            ScsiOp::INQUIRY => {
                let reply = if cdb[1] & 1 != 0 {
                    match lun.naa {
                        Some(naa) if cdb[2] == VPD_DEVICE_IDENTIFIERS => naa_page(naa),
                        _ => {
                            return (
                                CmdStatus::device(ScsiStatus::CHECK_CONDITION),
                                sense(
                                    SenseKey::ILLEGAL_REQUEST,
                                    AdditionalSenseCode::INVALID_FIELD_IN_CDB,
                                    0,
                                ),
                                0,
                            );
                        }
                    }
                } else {
                    lun.inquiry.to_vec()
                };
                let data = cmd.data_mut();
                let len = reply.len().min(data.len());
                data[..len].copy_from_slice(&reply[..len]);
                (CmdStatus::GOOD, Vec::new(), len)
            }
            _ => unreachable!(),
        }
    }
}

#[async_trait::async_trait]
impl Adapter for MockAdapter {
    fn topology(&self) -> AdapterTopology {
        self.topology
    }

    async fn check_target(&self, channel: u32, target: u32) -> anyhow::Result<bool> {
        let state = self.state.lock();
        Ok(!state.dead_targets.contains(&(channel, target))
            && state
                .luns
                .keys()
                .any(|&(c, t, _)| c == channel && t == target))
    }

    async fn discover(
        &self,
        action: ScanAction,
        channel: u32,
        target: u32,
        lun: u32,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        if action == ScanAction::DestroyPath {
            state.destroyed.push((channel, target, lun));
            return Ok(false);
        }
        Ok(state.luns.contains_key(&(channel, target, lun)))
    }

    fn command(&self, address: &PathAddress, mut cmd: ActiveCommand) {
        let op = cmd.cdb().opcode();
        let result = {
            let mut state = self.state.lock();
            state.commands.push((address.clone(), op));
            match state
                .luns
                .get(&(address.channel, address.target, address.lun))
                .cloned()
            {
                None => Some((CmdStatus::host(HostStatus::NO_CONNECT), Vec::new(), 0)),
                Some(lun) if op == ScsiOp::TEST_UNIT_READY || op == ScsiOp::INQUIRY => {
                    Some(Self::answer(&lun, &mut cmd))
                }
                Some(_) if state.hold => None,
                Some(_) => {
                    let status = state.script.pop_front().unwrap_or(CmdStatus::GOOD);
                    let len = if status.is_good() { cmd.data().len() } else { 0 };
                    Some((status, Vec::new(), len))
                }
            }
        };
        match result {
            Some((status, sense, len)) => cmd.complete(status, &sense, len),
            None => self.state.lock().held.push((address.clone(), cmd)),
        }
    }

    fn task_mgmt(&self, address: &PathAddress, request: &TaskMgmt) -> anyhow::Result<()> {
        let aborted: Vec<_> = {
            let mut state = self.state.lock();
            state.task_mgmt.push((address.clone(), *request));
            let (aborted, kept) = std::mem::take(&mut state.held).into_iter().partition(
                |(a, cmd): &(PathAddress, ActiveCommand)| {
                    a == address
                        && request.query(&cmd.id(), cmd.world_id()) == TaskMgmtAction::Abort
                },
            );
            state.held = kept;
            aborted
        };
        for (_, cmd) in aborted {
            cmd.complete(request.status, &[], 0);
        }
        Ok(())
    }

    fn dump_command(
        &self,
        address: &PathAddress,
        cdb: &Cdb,
        data: &mut [u8],
    ) -> anyhow::Result<CmdStatus> {
        let mut state = self.state.lock();
        state.commands.push((address.clone(), cdb.opcode()));
        if !state
            .luns
            .contains_key(&(address.channel, address.target, address.lun))
        {
            anyhow::bail!("no lun at {address}");
        }
        data.fill(0xa5);
        Ok(CmdStatus::GOOD)
    }
}

/// A claim decision made by a [`ScriptedPlugin`].
pub type Decide = Box<dyn Fn(PathId) -> anyhow::Result<bool> + Send + Sync>;

/// A multipath plugin that records its callbacks in a shared log.
pub struct ScriptedPlugin {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
    decide: Decide,
    fail_unclaim: Mutex<bool>,
}

impl ScriptedPlugin {
    pub fn new(name: &'static str, log: Arc<Mutex<Vec<String>>>, decide: Decide) -> Arc<Self> {
        Arc::new(Self {
            name,
            log,
            decide,
            fail_unclaim: Mutex::new(false),
        })
    }

    pub fn accepting(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Self::new(name, log, Box::new(|_| Ok(true)))
    }

    pub fn declining(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Self::new(name, log, Box::new(|_| Ok(false)))
    }

    pub fn fail_unclaim(&self, fail: bool) {
        *self.fail_unclaim.lock() = fail;
    }

    fn record(&self, event: String) {
        self.log.lock().push(event);
    }
}

#[async_trait::async_trait]
impl MultipathCapability for ScriptedPlugin {
    async fn claim_begin(&self, _stack: &ScsiStack, _plugin: PluginId) -> anyhow::Result<()> {
        self.record(format!("{}:begin", self.name));
        Ok(())
    }

    async fn claim(&self, _stack: &ScsiStack, _plugin: PluginId, path: PathId) -> anyhow::Result<bool> {
        self.record(format!("{}:claim:{path}", self.name));
        (self.decide)(path)
    }

    async fn unclaim(&self, _stack: &ScsiStack, _plugin: PluginId, path: PathId) -> anyhow::Result<()> {
        self.record(format!("{}:unclaim:{path}", self.name));
        if *self.fail_unclaim.lock() {
            anyhow::bail!("path {path} is in use");
        }
        Ok(())
    }

    async fn claim_end(&self, _stack: &ScsiStack, _plugin: PluginId) -> anyhow::Result<()> {
        self.record(format!("{}:end", self.name));
        Ok(())
    }
}

/// Device callbacks that never dispatch; tests pull queued work themselves.
pub struct ManualOps;

#[async_trait::async_trait]
impl DeviceOps for ManualOps {
    fn start_command(&self, _stack: &ScsiStack, _device: DeviceId) {}

    async fn task_mgmt(
        &self,
        _stack: &ScsiStack,
        _device: DeviceId,
        _request: &TaskMgmt,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn probe(&self, _stack: &ScsiStack, _device: DeviceId) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_inquiry(
        &self,
        _stack: &ScsiStack,
        _device: DeviceId,
        _page: Option<u8>,
    ) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("no inquiry data")
    }

    fn issue_dump_cmd(
        &self,
        _stack: &ScsiStack,
        _device: DeviceId,
        _cdb: &Cdb,
        _data: &mut [u8],
    ) -> anyhow::Result<CmdStatus> {
        anyhow::bail!("no dump support")
    }

    fn get_bool_attr(&self, _device: DeviceId, _attr: DeviceBoolAttr) -> bool {
        false
    }
}
