// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Commands, completion status and task management requests.

use scsi_defs::HostStatus;
use scsi_defs::MAX_CDB_LEN;
use scsi_defs::PluginStatus;
use scsi_defs::ScsiOp;
use scsi_defs::ScsiStatus;
use scsi_defs::SenseInfo;
use scsi_defs::SenseKey;
use scsi_defs::pr::PrOutServiceAction;
use std::fmt;
use std::time::Instant;
use thiserror::Error;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// Opaque token naming the originator of a command.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct InitiatorId(pub u64);

/// The context (thread or world) a command was issued on behalf of.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct WorldId(pub u32);

/// Identity of a command: its initiator plus a per-initiator serial number.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CommandId {
    pub initiator: InitiatorId,
    pub serial: u64,
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{}", self.initiator.0, self.serial)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataDirection {
    Unknown,
    Write,
    Read,
    None,
}

#[derive(Debug, Error)]
#[error("cdb of {0} bytes exceeds the 16 byte limit")]
pub struct InvalidCdb(usize);

/// A command descriptor block of at most 16 bytes.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Cdb {
    bytes: [u8; MAX_CDB_LEN],
    len: u8,
}

impl Cdb {
    pub fn new(bytes: &[u8]) -> Result<Self, InvalidCdb> {
        if bytes.is_empty() || bytes.len() > MAX_CDB_LEN {
            return Err(InvalidCdb(bytes.len()));
        }
        let mut cdb = Self {
            bytes: [0; MAX_CDB_LEN],
            len: bytes.len() as u8,
        };
        cdb.bytes[..bytes.len()].copy_from_slice(bytes);
        Ok(cdb)
    }

    /// Builds a CDB from one of the wire layouts in `scsi_defs`.
    pub fn from_layout<T: IntoBytes + Immutable>(layout: &T) -> Result<Self, InvalidCdb> {
        Self::new(layout.as_bytes())
    }

    pub fn test_unit_ready() -> Self {
        Self {
            bytes: [0; MAX_CDB_LEN],
            len: 6,
        }
    }

    pub fn opcode(&self) -> ScsiOp {
        ScsiOp(self.bytes[0])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Whether the command's outcome depends on the reservation held when it
    /// was issued.
    pub fn is_reservation_sensitive(&self) -> bool {
        let op = self.opcode();
        if op == ScsiOp::PERSISTENT_RESERVE_OUT {
            return PrOutServiceAction(self.bytes[1] & 0x1f).changes_reservation();
        }
        op.is_reservation_sensitive()
    }
}

impl fmt::Debug for Cdb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}{:02x?}", self.opcode(), &self.as_bytes()[1..])
    }
}

/// Three-level completion status.
///
/// The plugin status is authoritative when not good, then the host status,
/// then the device status.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CmdStatus {
    pub plugin: PluginStatus,
    pub host: HostStatus,
    pub device: ScsiStatus,
}

/// What the stack does with a completed command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Hand the completion to the caller.
    Complete,
    /// Retry, counting against the transient bound.
    RetryTransient,
    /// Retry, counting against the error bound.
    RetryError,
    /// The path is unreachable. Device commands are requeued so the plugin
    /// can pick another path.
    Failover,
}

impl CmdStatus {
    pub const GOOD: Self = Self {
        plugin: PluginStatus::GOOD,
        host: HostStatus::OK,
        device: ScsiStatus::GOOD,
    };

    pub const fn host(host: HostStatus) -> Self {
        Self {
            host,
            ..Self::GOOD
        }
    }

    pub const fn device(device: ScsiStatus) -> Self {
        Self {
            device,
            ..Self::GOOD
        }
    }

    pub const fn plugin(plugin: PluginStatus) -> Self {
        Self {
            plugin,
            ..Self::GOOD
        }
    }

    /// All three levels report success.
    pub fn is_good(&self) -> bool {
        *self == Self::GOOD
    }

    /// Good, or a check condition reporting a recovered error.
    pub fn is_successful(&self, sense: &[u8]) -> bool {
        if self.plugin != PluginStatus::GOOD || self.host != HostStatus::OK {
            return false;
        }
        match self.device {
            ScsiStatus::GOOD | ScsiStatus::CONDITION_MET => true,
            ScsiStatus::CHECK_CONDITION => SenseInfo::parse(sense)
                .is_some_and(|info| info.key == SenseKey::RECOVERED_ERROR),
            _ => false,
        }
    }

    /// Classifies the status for the retry policy.
    pub fn disposition(&self, sense: &[u8]) -> Disposition {
        if self.plugin != PluginStatus::GOOD {
            return match self.plugin {
                PluginStatus::TRANSIENT
                | PluginStatus::REQUEUE
                | PluginStatus::THINPROV_BUSY_GROWING => Disposition::RetryTransient,
                _ => Disposition::Complete,
            };
        }
        if self.host != HostStatus::OK {
            return match self.host {
                HostStatus::BUS_BUSY | HostStatus::RETRY | HostStatus::SOFT_ERROR => {
                    Disposition::RetryTransient
                }
                HostStatus::ERROR => Disposition::RetryError,
                HostStatus::NO_CONNECT => Disposition::Failover,
                _ => Disposition::Complete,
            };
        }
        match self.device {
            ScsiStatus::BUSY | ScsiStatus::QUEUE_FULL => Disposition::RetryTransient,
            ScsiStatus::CHECK_CONDITION => match SenseInfo::parse(sense) {
                Some(info) if info.key == SenseKey::UNIT_ATTENTION => Disposition::RetryError,
                _ => Disposition::Complete,
            },
            _ => Disposition::Complete,
        }
    }
}

impl Default for CmdStatus {
    fn default() -> Self {
        Self::GOOD
    }
}

pub(crate) type DoneFn = Box<dyn FnOnce(CommandCompletion) + Send>;

/// A command on its way into the stack.
pub struct ScsiCommand {
    pub(crate) id: CommandId,
    pub(crate) world: Option<WorldId>,
    pub(crate) cdb: Cdb,
    pub(crate) direction: DataDirection,
    pub(crate) data: Vec<u8>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) reservation_sensitive: bool,
    pub(crate) done: Option<DoneFn>,
}

impl ScsiCommand {
    pub fn new(id: CommandId, cdb: Cdb) -> Self {
        let reservation_sensitive = cdb.is_reservation_sensitive();
        Self {
            id,
            world: None,
            cdb,
            direction: DataDirection::None,
            data: Vec::new(),
            deadline: None,
            reservation_sensitive,
            done: None,
        }
    }

    /// Expects `len` bytes from the target.
    pub fn read(mut self, len: usize) -> Self {
        self.direction = DataDirection::Read;
        self.data = vec![0; len];
        self
    }

    /// Sends `data` to the target.
    pub fn write(mut self, data: Vec<u8>) -> Self {
        self.direction = DataDirection::Write;
        self.data = data;
        self
    }

    pub fn world(mut self, world: WorldId) -> Self {
        self.world = Some(world);
        self
    }

    /// Fails the command with a host timeout once `deadline` passes.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Completes the command with `RESERVATION_LOST` if the device's
    /// reservation generation changes while it is in flight.
    pub fn reservation_sensitive(mut self, sensitive: bool) -> Self {
        self.reservation_sensitive = sensitive;
        self
    }

    /// Sets the completion callback. It runs exactly once, on whatever
    /// context completes the command, with no stack locks held.
    pub fn on_complete(mut self, f: impl FnOnce(CommandCompletion) + Send + 'static) -> Self {
        self.done = Some(Box::new(f));
        self
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn world_id(&self) -> Option<WorldId> {
        self.world
    }

    pub fn cdb(&self) -> &Cdb {
        &self.cdb
    }

    pub fn direction(&self) -> DataDirection {
        self.direction
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Moves the buffer and callback out, leaving an empty command behind.
    pub(crate) fn take(&mut self) -> Self {
        Self {
            data: std::mem::take(&mut self.data),
            done: self.done.take(),
            ..*self
        }
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}

impl fmt::Debug for ScsiCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScsiCommand")
            .field("id", &self.id)
            .field("cdb", &self.cdb)
            .field("direction", &self.direction)
            .field("len", &self.data.len())
            .finish()
    }
}

/// The outcome of a command, delivered to its completion callback.
#[derive(Debug, Clone)]
pub struct CommandCompletion {
    pub id: CommandId,
    pub status: CmdStatus,
    pub sense: Vec<u8>,
    pub bytes_transferred: usize,
    /// The data buffer; holds read data for read commands.
    pub data: Vec<u8>,
}

impl CommandCompletion {
    pub fn is_good(&self) -> bool {
        self.status.is_good()
    }

    pub fn is_successful(&self) -> bool {
        self.status.is_successful(&self.sense)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskMgmtType {
    Abort,
    VirtualReset,
    LunReset,
    DeviceReset,
    BusReset,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InitiatorFilter {
    Any,
    Exact(InitiatorId),
}

impl InitiatorFilter {
    fn matches(&self, initiator: InitiatorId) -> bool {
        match self {
            InitiatorFilter::Any => true,
            InitiatorFilter::Exact(i) => *i == initiator,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskMgmtAction {
    Ignore,
    Abort,
}

/// A task management request and the status to give matched commands.
#[derive(Debug, Copy, Clone)]
pub struct TaskMgmt {
    pub kind: TaskMgmtType,
    pub initiator: InitiatorFilter,
    /// Only consulted for [`TaskMgmtType::Abort`].
    pub serial: u64,
    /// Consulted for aborts and virtual resets when set.
    pub world: Option<WorldId>,
    pub status: CmdStatus,
}

impl TaskMgmt {
    /// Aborts the single command `id`.
    pub fn abort(id: CommandId) -> Self {
        Self {
            kind: TaskMgmtType::Abort,
            initiator: InitiatorFilter::Exact(id.initiator),
            serial: id.serial,
            world: None,
            status: CmdStatus::host(HostStatus::ABORT),
        }
    }

    /// Resets every command of `initiator`.
    pub fn virtual_reset(initiator: InitiatorFilter) -> Self {
        Self {
            kind: TaskMgmtType::VirtualReset,
            initiator,
            serial: 0,
            world: None,
            status: CmdStatus::host(HostStatus::RESET),
        }
    }

    pub fn reset(kind: TaskMgmtType) -> Self {
        Self {
            kind,
            initiator: InitiatorFilter::Any,
            serial: 0,
            world: None,
            status: CmdStatus::host(HostStatus::RESET),
        }
    }

    pub fn with_world(mut self, world: WorldId) -> Self {
        self.world = Some(world);
        self
    }

    pub fn with_status(mut self, status: CmdStatus) -> Self {
        self.status = status;
        self
    }

    /// Decides whether a command with identity `id`, issued by `world`, is
    /// affected by this request.
    pub fn query(&self, id: &CommandId, world: Option<WorldId>) -> TaskMgmtAction {
        let world_matches = || self.world.is_none() || self.world == world;
        let hit = match self.kind {
            TaskMgmtType::Abort => {
                self.initiator.matches(id.initiator) && self.serial == id.serial && world_matches()
            }
            TaskMgmtType::VirtualReset => self.initiator.matches(id.initiator) && world_matches(),
            TaskMgmtType::LunReset | TaskMgmtType::DeviceReset | TaskMgmtType::BusReset => true,
        };
        if hit {
            TaskMgmtAction::Abort
        } else {
            TaskMgmtAction::Ignore
        }
    }
}
