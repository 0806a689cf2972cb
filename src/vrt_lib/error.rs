use thiserror::Error;

/// Errors surfaced by the virtualizer core.
///
/// Each kind maps to a stable negative integer code through [`VrtError::code`],
/// so callers speaking the historical errno-style protocol keep seeing the
/// values they expect.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VrtError {
    #[error("invalid argument")]
    InvalidArg,
    #[error("operation not supported")]
    NotSupported,
    #[error("no space left")]
    NoSpace,
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("I/O error")]
    Io,
    #[error("connection reset by peer")]
    ConnReset,
    #[error("bad file descriptor")]
    BadFd,
    #[error("operation interrupted")]
    Interrupted,
    #[error("superblock magic mismatch")]
    SbMagic,
    #[error("superblock format not handled")]
    SbFormat,
    #[error("superblock corrupted")]
    SbCorruption,
    #[error("superblock UUID mismatch")]
    SbUuidMismatch,
    #[error("group is not started")]
    GroupNotStarted,
    #[error("group is offline")]
    GroupOffline,
    #[error("real device is too small")]
    RdevTooSmall,
    #[error("too many chunks in group")]
    TooManyChunks,
}

pub type VrtResult<T> = Result<T, VrtError>;

impl VrtError {
    /// Negative integer code, errno-style for the generic kinds and in the
    /// private VRT range for superblock and group errors.
    pub fn code(self) -> i32 {
        match self {
            VrtError::InvalidArg => -22,      /* EINVAL */
            VrtError::NotSupported => -95,    /* EOPNOTSUPP */
            VrtError::NoSpace => -28,         /* ENOSPC */
            VrtError::NotFound => -2,         /* ENOENT */
            VrtError::AlreadyExists => -17,   /* EEXIST */
            VrtError::Io => -5,               /* EIO */
            VrtError::ConnReset => -104,      /* ECONNRESET */
            VrtError::BadFd => -9,            /* EBADF */
            VrtError::Interrupted => -4,      /* EINTR */
            VrtError::SbMagic => -1300,
            VrtError::SbFormat => -1301,
            VrtError::SbCorruption => -1302,
            VrtError::SbUuidMismatch => -1303,
            VrtError::GroupNotStarted => -1310,
            VrtError::GroupOffline => -1311,
            VrtError::RdevTooSmall => -1312,
            VrtError::TooManyChunks => -1313,
        }
    }

    /// Worst-error-wins rule for joining sub-request completions: any error
    /// beats success, and I/O errors beat everything else.
    pub fn worst(a: Option<VrtError>, b: Option<VrtError>) -> Option<VrtError> {
        match (a, b) {
            (None, e) => e,
            (e, None) => e,
            (Some(VrtError::Io), _) | (_, Some(VrtError::Io)) => Some(VrtError::Io),
            (Some(e), Some(_)) => Some(e),
        }
    }
}
