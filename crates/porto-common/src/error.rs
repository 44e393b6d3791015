//! Common error types for the Porto ecosystem.
//!
//! Every error that can cross the RPC boundary carries a stable numeric
//! code; syscall failures additionally carry the originating errno.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`PortoError`].
pub type PortoResult<T> = Result<T, PortoError>;

/// Errors surfaced by the Porto supervisor.
#[derive(Error, Diagnostic, Debug)]
pub enum PortoError {
    /// Catch-all for unexpected failures.
    #[error("Unknown error: {message}")]
    #[diagnostic(code(porto::unknown))]
    Unknown {
        /// Human readable description.
        message: String,
        /// Originating errno, zero if none.
        errno: i32,
    },

    /// Request does not carry exactly one method.
    #[error("Invalid method")]
    #[diagnostic(code(porto::invalid_method))]
    InvalidMethod,

    /// Container already exists.
    #[error("Container already exists: {name}")]
    #[diagnostic(code(porto::container::exists))]
    ContainerAlreadyExists {
        /// The conflicting container name.
        name: String,
    },

    /// Container not found.
    #[error("Container does not exist: {name}")]
    #[diagnostic(code(porto::container::not_found))]
    ContainerDoesNotExist {
        /// The container name that was not found.
        name: String,
    },

    /// Unknown property or data name.
    #[error("Invalid property: {property}")]
    #[diagnostic(code(porto::property::invalid))]
    InvalidProperty {
        /// The property name.
        property: String,
    },

    /// Value rejected by a property validator.
    #[error("Invalid value: {message}")]
    #[diagnostic(
        code(porto::value::invalid),
        help("Check the property documentation for the accepted format")
    )]
    InvalidValue {
        /// What was wrong with the value.
        message: String,
    },

    /// Operation not allowed in the container's current state.
    #[error("Invalid state: {message}")]
    #[diagnostic(code(porto::state::invalid))]
    InvalidState {
        /// The observed state and the rejected operation.
        message: String,
    },

    /// Feature not supported on this kernel or filesystem.
    #[error("Not supported: {feature}")]
    #[diagnostic(code(porto::unsupported))]
    NotSupported {
        /// The unsupported feature.
        feature: String,
    },

    /// A quantitative guarantee cannot be satisfied.
    #[error("Resource not available: {message}")]
    #[diagnostic(code(porto::resource_not_available))]
    ResourceNotAvailable {
        /// Which resource and why.
        message: String,
    },

    /// Caller may not perform this operation.
    #[error("Permission denied: {message}")]
    #[diagnostic(code(porto::permission))]
    Permission {
        /// The denied operation.
        message: String,
    },

    /// Volume already exists.
    #[error("Volume already exists: {path}")]
    #[diagnostic(code(porto::volume::exists))]
    VolumeAlreadyExists {
        /// The conflicting volume path.
        path: String,
    },

    /// Volume not found.
    #[error("Volume not found: {path}")]
    #[diagnostic(code(porto::volume::not_found))]
    VolumeNotFound {
        /// The volume path that was not found.
        path: String,
    },

    /// Not enough disk space or inodes.
    #[error("No space: {message}")]
    #[diagnostic(code(porto::no_space))]
    NoSpace {
        /// Which device ran short.
        message: String,
    },

    /// Resource is busy; retry may succeed.
    #[error("Busy: {message}")]
    #[diagnostic(code(porto::busy))]
    Busy {
        /// What is busy.
        message: String,
    },

    /// Layer already exists.
    #[error("Layer already exists: {name}")]
    #[diagnostic(code(porto::layer::exists))]
    LayerAlreadyExists {
        /// The conflicting layer name.
        name: String,
    },

    /// Layer not found.
    #[error("Layer not found: {name}")]
    #[diagnostic(code(porto::layer::not_found))]
    LayerNotFound {
        /// The layer name that was not found.
        name: String,
    },

    /// Knob read/write failed on a cgroup.
    #[error("Cgroup error on {knob}: {message}")]
    #[diagnostic(code(porto::cgroup))]
    Cgroup {
        /// The knob file that failed.
        knob: String,
        /// Description of the failure.
        message: String,
        /// Originating errno, zero if none.
        errno: i32,
    },

    /// Internal sentinel: the response will be delivered later.
    ///
    /// Never serialized to a client as an error.
    #[error("Queued")]
    #[diagnostic(code(porto::queued))]
    Queued,

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(porto::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(porto::serialization))]
    Serialization(String),
}

impl PortoError {
    /// Stable numeric code used on the wire.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::Unknown { .. } | Self::Io(_) | Self::Serialization(_) => 1,
            Self::InvalidMethod => 2,
            Self::ContainerAlreadyExists { .. } => 3,
            Self::ContainerDoesNotExist { .. } => 4,
            Self::InvalidProperty { .. } => 5,
            Self::InvalidValue { .. } => 7,
            Self::InvalidState { .. } => 8,
            Self::NotSupported { .. } => 9,
            Self::ResourceNotAvailable { .. } => 10,
            Self::Permission { .. } => 11,
            Self::VolumeAlreadyExists { .. } => 12,
            Self::VolumeNotFound { .. } => 13,
            Self::NoSpace { .. } => 14,
            Self::Busy { .. } => 15,
            Self::LayerAlreadyExists { .. } => 16,
            Self::LayerNotFound { .. } => 17,
            Self::Cgroup { .. } => 1,
            Self::Queued => 1000,
        }
    }

    /// Originating errno, zero when the error did not come from a syscall.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Unknown { errno, .. } | Self::Cgroup { errno, .. } => *errno,
            Self::Io(e) => e.raw_os_error().unwrap_or(0),
            _ => 0,
        }
    }

    /// Wrap the current errno with a description.
    #[must_use]
    pub fn from_errno(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }

    /// Unknown error without an errno.
    #[must_use]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
            errno: 0,
        }
    }
}

impl From<serde_json::Error> for PortoError {
    fn from(err: serde_json::Error) -> Self {
        PortoError::Serialization(err.to_string())
    }
}

impl From<nix::errno::Errno> for PortoError {
    fn from(err: nix::errno::Errno) -> Self {
        PortoError::Unknown {
            message: err.desc().to_string(),
            errno: err as i32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = PortoError::ContainerDoesNotExist {
            name: "a/b".to_string(),
        };
        assert_eq!(err.to_string(), "Container does not exist: a/b");
        assert_eq!(err.code(), 4);
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::from_raw_os_error(libc::ENOENT);
        let err: PortoError = io_err.into();
        assert!(matches!(err, PortoError::Io(_)));
        assert_eq!(err.errno(), libc::ENOENT);
        assert_eq!(err.code(), 1);
    }

    #[test]
    fn queued_is_not_a_client_error() {
        assert_eq!(PortoError::Queued.code(), 1000);
    }
}
