// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types returned by stack operations.
//!
//! Each enum maps onto an [`ErrorKind`] so that callers can decide whether
//! to fix their input, retry later or give up.

use crate::device::DeviceId;
use crate::path::PathId;
use crate::plugin::PluginId;
use crate::plugin::PluginState;
use futures::task::SpawnError;
use thiserror::Error;

/// Broad classification of a stack error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller-fixable input error. Nothing was changed.
    Validation,
    /// A uniqueness or cardinality invariant would be violated.
    Conflict,
    /// Capacity exhausted.
    Resource,
    /// The path or device is unreachable.
    Connectivity,
    /// A conflicting operation is in progress.
    Concurrency,
    /// The referenced object does not exist.
    NotFound,
    /// The caller does not own the object.
    Permission,
}

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum UidError {
    #[error("uid is empty or contains characters outside [A-Za-z0-9_:,.]")]
    InvalidUid,
    #[error("uid is longer than 256 bytes")]
    NameTooLong,
    #[error("uid flags contain reserved bits")]
    BadParam,
    #[error("uid belongs to another device")]
    Exists,
    #[error("uid is already attached to this device")]
    DuplicateUid,
    #[error("device already has a primary uid")]
    TooManyPrimary,
    #[error("primary and legacy uids are read-only")]
    ReadOnly,
    #[error("uid is not attached to the device")]
    NotFound,
}

impl UidError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UidError::InvalidUid | UidError::NameTooLong | UidError::BadParam => {
                ErrorKind::Validation
            }
            UidError::Exists | UidError::DuplicateUid | UidError::TooManyPrimary => {
                ErrorKind::Conflict
            }
            UidError::ReadOnly => ErrorKind::Permission,
            UidError::NotFound => ErrorKind::NotFound,
        }
    }
}

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path {0} not found")]
    NotFound(PathId),
    #[error("path {0} is being removed")]
    Removing(PathId),
    #[error("plugin does not own path {0}")]
    NoPermission(PathId),
    #[error("path {0} is busy")]
    Busy(PathId),
    #[error("probe of path {path} failed")]
    Probe {
        path: PathId,
        #[source]
        source: anyhow::Error,
    },
}

impl PathError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PathError::NotFound(_) => ErrorKind::NotFound,
            PathError::Removing(_) | PathError::Probe { .. } => ErrorKind::Connectivity,
            PathError::NoPermission(_) => ErrorKind::Permission,
            PathError::Busy(_) => ErrorKind::Concurrency,
        }
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("adapter {0} not found")]
    AdapterNotFound(String),
    #[error("adapter {0} is already being scanned")]
    Busy(String),
    #[error("path limit of {limit} reached")]
    TooManyPaths { limit: usize },
    #[error("discovery failed on {adapter}:C{channel}:T{target}")]
    Discover {
        adapter: String,
        channel: u32,
        target: u32,
        #[source]
        source: anyhow::Error,
    },
}

impl ScanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScanError::AdapterNotFound(_) => ErrorKind::NotFound,
            ScanError::Busy(_) => ErrorKind::Concurrency,
            ScanError::TooManyPaths { .. } => ErrorKind::Resource,
            ScanError::Discover { .. } => ErrorKind::Connectivity,
        }
    }
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("path {0} not found")]
    NotFound(PathId),
    #[error("failed to spawn probe")]
    Spawn(#[source] SpawnError),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter {0} is already registered")]
    Exists(String),
    #[error("adapter {0} not found")]
    NotFound(String),
    #[error("adapter {0} still has paths that could not be removed")]
    Busy(String),
    #[error("adapter {0} is being scanned")]
    Scanning(String),
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("invalid plugin parameter: {0}")]
    BadParam(&'static str),
    #[error("plugin {0} not found")]
    NotFound(PluginId),
    #[error("a plugin named {0} is already registered")]
    Exists(String),
    #[error("plugin cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: PluginState, to: PluginState },
    #[error("plugin is not registered")]
    NotRegistered,
    #[error("plugin is registered")]
    Registered,
    #[error("plugin still owns paths or devices")]
    Busy,
}

impl PluginError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PluginError::BadParam(_) => ErrorKind::Validation,
            PluginError::NotFound(_) => ErrorKind::NotFound,
            PluginError::Exists(_) => ErrorKind::Conflict,
            PluginError::InvalidTransition { .. }
            | PluginError::NotRegistered
            | PluginError::Registered
            | PluginError::Busy => ErrorKind::Concurrency,
        }
    }
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("invalid registration: {0}")]
    BadParam(&'static str),
    #[error("plugin is not a multipathing plugin")]
    NotSupported,
    #[error("no paths supplied")]
    NotFound,
    #[error("device {0} not found")]
    NoDevice(DeviceId),
    #[error("device is already registered")]
    AlreadyRegistered,
    #[error("uid belongs to another device")]
    Exists,
    #[error("uid listed more than once")]
    DuplicateUid,
    #[error("more than one primary uid")]
    TooManyElements,
    #[error("invalid uid")]
    InvalidUid(#[source] UidError),
}

impl From<UidError> for RegisterError {
    fn from(err: UidError) -> Self {
        match err {
            UidError::Exists => RegisterError::Exists,
            UidError::DuplicateUid => RegisterError::DuplicateUid,
            UidError::TooManyPrimary => RegisterError::TooManyElements,
            err => RegisterError::InvalidUid(err),
        }
    }
}

impl RegisterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegisterError::BadParam(_)
            | RegisterError::NotSupported
            | RegisterError::InvalidUid(_) => ErrorKind::Validation,
            RegisterError::NotFound | RegisterError::NoDevice(_) => ErrorKind::NotFound,
            RegisterError::AlreadyRegistered
            | RegisterError::Exists
            | RegisterError::DuplicateUid
            | RegisterError::TooManyElements => ErrorKind::Conflict,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device {0} not found")]
    NotFound(DeviceId),
    #[error("invalid device parameter: {0}")]
    BadParam(&'static str),
    #[error("plugin is not a multipathing plugin")]
    NotSupported,
    #[error("device slot limit of {limit} reached")]
    TooManyDevices { limit: usize },
    #[error("device is not registered")]
    NotRegistered,
    #[error("device is open or has operations in progress")]
    Busy,
    #[error("device is off")]
    NoConnect,
    #[error("device is permanently lost")]
    PermanentLoss,
    #[error("uid operation failed")]
    Uid(#[from] UidError),
    #[error("device plugin operation failed")]
    Plugin(#[source] anyhow::Error),
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::NotFound(_) => ErrorKind::NotFound,
            DeviceError::BadParam(_) | DeviceError::NotSupported => ErrorKind::Validation,
            DeviceError::TooManyDevices { .. } => ErrorKind::Resource,
            DeviceError::NotRegistered | DeviceError::Busy => ErrorKind::Concurrency,
            DeviceError::NoConnect | DeviceError::PermanentLoss | DeviceError::Plugin(_) => {
                ErrorKind::Connectivity
            }
            DeviceError::Uid(err) => err.kind(),
        }
    }
}

/// Errors returned when a command cannot be accepted. A command that was
/// accepted always reports its outcome through its completion instead.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum IssueError {
    #[error("path {0} not found")]
    PathNotFound(PathId),
    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),
    #[error("target is unreachable or being removed")]
    NoConnect,
    #[error("no command slots available")]
    NoMemory,
    #[error("command deadline already passed")]
    Timeout,
    #[error("target is busy")]
    Busy,
    #[error("device is permanently lost")]
    PermanentLoss,
}

impl IssueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IssueError::PathNotFound(_) | IssueError::DeviceNotFound(_) => ErrorKind::NotFound,
            IssueError::NoConnect | IssueError::Timeout | IssueError::PermanentLoss => {
                ErrorKind::Connectivity
            }
            IssueError::NoMemory => ErrorKind::Resource,
            IssueError::Busy => ErrorKind::Concurrency,
        }
    }
}

#[derive(Debug, Error)]
pub enum TaskMgmtError {
    #[error("path {0} not found")]
    PathNotFound(PathId),
    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),
    #[error("target is unreachable or being removed")]
    NoConnect,
    #[error("task management request failed")]
    Failed(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("path {0} not found")]
    PathNotFound(PathId),
    #[error("device {0} not found or not registered")]
    DeviceNotFound(DeviceId),
    #[error("path is being removed")]
    NoConnect,
    #[error("polled command failed")]
    Failed(#[source] anyhow::Error),
}
