//! Error types for the DRM hwcomposer shim

use crate::format::Fourcc;
use crate::hal::{HalError, HalPixelFormat};
use crate::model::{ObjectId, ObjectType};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("hwcomposer initialization failed: {0}")]
    HwcInit(String),

    #[error("hwcomposer display not found")]
    NoDisplay,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("object id space exhausted")]
    IdsExhausted,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("HAL error: {0}")]
    Hal(#[from] HalError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Problems with a property value, independent of which object it was set on
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PropertyError {
    #[error("unknown property {0}")]
    UnknownProperty(u32),

    #[error("property {property} is not attached to object {object}")]
    NotAttached {
        object: ObjectId,
        property: &'static str,
    },

    #[error("property {0} is immutable")]
    Immutable(&'static str),

    #[error("value {value} out of range for property {property}")]
    OutOfRange { property: &'static str, value: u64 },

    #[error("property {property} references unknown object {value}")]
    UnknownObject { property: &'static str, value: u64 },

    #[error("blob {blob} is not a valid value for property {property}")]
    InvalidBlob { property: &'static str, blob: u64 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("object {0} not found")]
    NotFound(u32),

    #[error("object {id} is a {actual:?}, expected {expected:?}")]
    WrongType {
        id: ObjectId,
        expected: ObjectType,
        actual: ObjectType,
    },

    #[error(transparent)]
    Property(#[from] PropertyError),

    #[error("invalid framebuffer: {0}")]
    Framebuffer(String),

    #[error("device is closed or lost")]
    DeviceGone,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("unsupported format {0:?}")]
    UnsupportedFormat(Fourcc),

    #[error("invalid buffer dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("HAL substituted incompatible format {actual} for {requested:?}")]
    IncompatibleSubstitution {
        requested: Fourcc,
        actual: HalPixelFormat,
    },

    #[error("HAL substituted {actual:?} for {requested:?}")]
    FormatSubstituted { requested: Fourcc, actual: Fourcc },

    #[error("gralloc error: {0}")]
    Hal(HalError),

    #[error("allocator is shut down")]
    DeviceClosed,
}

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("unsupported format {format:?} with modifier {modifier:#x}")]
    UnsupportedFormat { format: Fourcc, modifier: u64 },

    #[error("unsupported import: {0}")]
    Unsupported(String),

    #[error("bad buffer fd: {0}")]
    BadFd(#[source] std::io::Error),

    #[error("buffer layout does not fit: {0}")]
    BadLayout(String),

    #[error("gralloc error: {0}")]
    Hal(HalError),

    #[error("allocator is shut down")]
    DeviceClosed,
}

/// Fatal device conditions
///
/// Once one of these is reported the device accepts no further commits.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("commit on CRTC {crtc} did not complete within {elapsed:?}")]
    WatchdogTimeout { crtc: ObjectId, elapsed: Duration },

    #[error("HAL service died: {0}")]
    HalCrashed(String),

    #[error("device is closed")]
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    #[error("CRTC {crtc} already has a commit in flight")]
    Busy { crtc: ObjectId },

    #[error("invalid commit on object {object}: {reason}")]
    Invalid { object: u32, reason: String },

    #[error("HAL rejected commit on CRTC {crtc}: {reason}")]
    Rejected { crtc: ObjectId, reason: String },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl CommitError {
    pub(crate) fn invalid(object: impl Into<u32>, reason: impl ToString) -> Self {
        CommitError::Invalid {
            object: object.into(),
            reason: reason.to_string(),
        }
    }

    /// Negative errno as the kernel would report it from the atomic ioctl
    pub fn errno(&self) -> i32 {
        match self {
            CommitError::Busy { .. } => -libc::EBUSY,
            CommitError::Invalid { .. } => -libc::EINVAL,
            CommitError::Rejected { .. } => -libc::EINVAL,
            CommitError::Device(_) => -libc::ENODEV,
        }
    }
}

impl Error {
    /// Negative errno for the C API
    pub fn errno(&self) -> i32 {
        match self {
            Error::Commit(e) => e.errno(),
            Error::Validation(ValidationError::NotFound(_)) => -libc::ENOENT,
            Error::Validation(ValidationError::DeviceGone) => -libc::ENODEV,
            Error::Validation(_) => -libc::EINVAL,
            Error::Allocation(AllocationError::OutOfMemory) => -libc::ENOMEM,
            Error::Allocation(AllocationError::DeviceClosed) => -libc::ENODEV,
            Error::Allocation(_) => -libc::EINVAL,
            Error::Import(ImportError::BadFd(_)) => -libc::EBADF,
            Error::Import(ImportError::DeviceClosed) => -libc::ENODEV,
            Error::Import(_) => -libc::EINVAL,
            Error::Device(_) | Error::NoDisplay | Error::HwcInit(_) => -libc::ENODEV,
            Error::IdsExhausted => -libc::ENOSPC,
            Error::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
            Error::Hal(_) | Error::Config(_) => -libc::EIO,
        }
    }
}
