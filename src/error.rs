//! Error types for the allocator module.

use thiserror::Error;

/// Result type alias using the allocator's error.
pub type Result<T> = std::result::Result<T, AllocError>;

/// Failure signal returned by every module and device operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// The backend device context could not be created.
    #[error("device context could not be initialized")]
    Initialization,

    /// The handle does not resolve to live state in this module.
    #[error("invalid buffer handle")]
    InvalidHandle,

    /// Unsupported client name, operation code, dimensions or format.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The backend refused an operation; carries its native errno.
    #[error("{op} failed: {}", errno_name(.errno))]
    Backend { op: &'static str, errno: i32 },
}

fn errno_name(errno: &i32) -> nix::errno::Errno {
    nix::errno::Errno::from_i32(*errno)
}

impl AllocError {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        AllocError::InvalidArgument(msg.into())
    }

    pub(crate) fn backend(op: &'static str, errno: nix::errno::Errno) -> Self {
        AllocError::Backend {
            op,
            errno: errno as i32,
        }
    }

    pub(crate) fn backend_io(op: &'static str, err: &std::io::Error) -> Self {
        AllocError::Backend {
            op,
            errno: err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Negative errno as a C host expects it from the operation table.
    pub fn errno(&self) -> i32 {
        match self {
            AllocError::Initialization => -libc::ENODEV,
            AllocError::InvalidHandle | AllocError::InvalidArgument(_) => -libc::EINVAL,
            AllocError::Backend { errno, .. } => -errno.abs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_is_negative() {
        assert_eq!(AllocError::InvalidHandle.errno(), -libc::EINVAL);
        assert_eq!(AllocError::invalid_argument("x").errno(), -libc::EINVAL);
        assert_eq!(AllocError::Initialization.errno(), -libc::ENODEV);
        assert_eq!(
            AllocError::backend("map", nix::errno::Errno::EBUSY).errno(),
            -libc::EBUSY
        );
    }

    #[test]
    fn backend_message_names_operation() {
        let err = AllocError::backend("create buffer", nix::errno::Errno::ENOMEM);
        assert!(err.to_string().starts_with("create buffer failed"));
    }
}
