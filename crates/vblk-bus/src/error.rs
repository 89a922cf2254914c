use thiserror::Error;

pub type Result<T> = std::result::Result<T, BusError>;

/// Completion status carried by every request.
///
/// Mirrors the subset of NT status codes the bus actually produces. `Pending` counts as a
/// success status, as it does for `NT_SUCCESS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    Pending,
    NotSupported,
    InvalidParameter,
    InvalidDeviceRequest,
    InsufficientResources,
    NoSuchDevice,
    Unsuccessful,
    Cancelled,
}

impl Status {
    pub const fn is_success(self) -> bool {
        matches!(self, Status::Success | Status::Pending)
    }
}

/// Recoverable failures produced by the bus core.
///
/// Every variant maps to the completion [`Status`] reported to the framework via
/// [`BusError::status`]; errors never travel further than the request that produced them.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid request buffer: need {needed} bytes, got {got}")]
    InvalidBuffer { needed: usize, got: usize },

    #[error("unit {0} not found")]
    UnitNotFound(u32),

    #[error("unit {0} is a boot-time device and cannot be detached")]
    BootDevice(u32),

    #[error("unit {0} is already linked")]
    DuplicateUnit(u32),

    #[error("insufficient resources")]
    InsufficientResources,

    #[error("bus device has been removed")]
    NoSuchDevice,

    #[error("request not supported by the bus")]
    NotSupported,

    #[error("invalid device request (control code {0:#010x})")]
    InvalidDeviceRequest(u32),

    #[error("lower device failed with {0:?}")]
    Lower(Status),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("failed to spawn bus worker: {0}")]
    Spawn(#[source] std::io::Error),
}

impl BusError {
    pub fn status(&self) -> Status {
        match self {
            BusError::InvalidBuffer { .. }
            | BusError::UnitNotFound(_)
            | BusError::BootDevice(_)
            | BusError::DuplicateUnit(_)
            | BusError::Backend(_) => Status::InvalidParameter,
            BusError::InsufficientResources | BusError::Spawn(_) => Status::InsufficientResources,
            BusError::NoSuchDevice => Status::NoSuchDevice,
            BusError::NotSupported => Status::NotSupported,
            BusError::InvalidDeviceRequest(_) => Status::InvalidDeviceRequest,
            BusError::Lower(status) => *status,
        }
    }
}

impl From<BusError> for Status {
    fn from(err: BusError) -> Self {
        err.status()
    }
}

impl From<std::collections::TryReserveError> for BusError {
    fn from(_: std::collections::TryReserveError) -> Self {
        BusError::InsufficientResources
    }
}
