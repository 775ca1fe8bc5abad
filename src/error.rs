//! Error kinds shared between daemon and client.
//!
//! Daemon handlers map every fault to an errno carried in the response
//! status and never abort the process; the client maps the status back to
//! an [`FsError`] and, at the interception boundary, to `errno`.

use thiserror::Error;

pub type FsResult<T> = Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    /// Path is absent from the metadata KV store.
    #[error("no such entry")]
    NotFound,

    /// Create attempted on an existing path without truncation.
    #[error("entry already exists")]
    AlreadyExists,

    /// Disk or KV engine fault, carrying the underlying OS error code.
    #[error("storage fault: {msg} (errno {errno})")]
    StorageFault { errno: i32, msg: String },

    /// RPC timeout or network failure after retries.
    #[error("transport fault: {0}")]
    TransportFault(String),

    /// Operation disabled by build configuration.
    #[error("operation not supported")]
    NotSupported,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Directory removal attempted while entries remain.
    #[error("directory not empty")]
    NotEmpty,

    /// Descriptor index unknown to the open-file map.
    #[error("bad file descriptor")]
    BadDescriptor,
}

impl FsError {
    /// The errno this fault surfaces as at the syscall boundary.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::StorageFault { errno, .. } => {
                if *errno != 0 {
                    *errno
                } else {
                    libc::EIO
                }
            }
            FsError::TransportFault(_) => libc::EIO,
            FsError::NotSupported => libc::ENOTSUP,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::BadDescriptor => libc::EBADF,
        }
    }

    /// Rebuild a fault from a wire status code. The enumerated kinds map
    /// back onto themselves; anything else is treated as a storage fault
    /// with that errno.
    pub fn from_errno(errno: i32) -> FsError {
        match errno {
            libc::ENOENT => FsError::NotFound,
            libc::EEXIST => FsError::AlreadyExists,
            libc::ENOTSUP => FsError::NotSupported,
            libc::EINVAL => FsError::InvalidArgument("invalid argument".into()),
            libc::ENOTEMPTY => FsError::NotEmpty,
            libc::EBADF => FsError::BadDescriptor,
            other => FsError::StorageFault {
                errno: other,
                msg: "remote storage fault".into(),
            },
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            return FsError::NotFound;
        }
        FsError::StorageFault {
            errno: err.raw_os_error().unwrap_or(libc::EIO),
            msg: err.to_string(),
        }
    }
}

impl From<sled::Error> for FsError {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Io(io) => io.into(),
            other => FsError::StorageFault {
                errno: libc::EIO,
                msg: other.to_string(),
            },
        }
    }
}

impl From<nix::Error> for FsError {
    fn from(err: nix::Error) -> Self {
        FsError::StorageFault {
            errno: err.as_errno().map(|e| e as i32).unwrap_or(libc::EIO),
            msg: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for FsError {
    fn from(err: serde_json::Error) -> Self {
        FsError::InvalidArgument(format!("malformed message: {}", err))
    }
}
