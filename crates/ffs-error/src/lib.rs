#![forbid(unsafe_code)]
//! Error types for the block-mapping stack.
//!
//! # Error Taxonomy
//!
//! | Variant | Class | errno | Raised by |
//! |---------|-------|-------|-----------|
//! | `HoleNotAllocated` | recoverable | `ENODATA` | resolve without `may_allocate` over a sparse hole |
//! | `NoSpace` | recoverable (caller policy) | `ENOSPC` | block allocator exhausted |
//! | `AddressOverflow` | fatal to the request | `EFBIG` | LBN beyond the last indirection level |
//! | `Io` | propagated verbatim | raw or `EIO` | device read/write/sync |
//! | `Corruption` | fatal | `EIO` | pointer outside the device, double free |
//! | `Format` | fatal | `EINVAL` | malformed encodings, buffer size mismatch |
//! | `InvalidGeometry` | fatal | `EINVAL` | bad `D` / `K` / block size at mount |
//! | `InvalidArgument` | fatal | `EINVAL` | caller passed an impossible request |
//! | `BufferBusy` | retryable | `EBUSY` | second checkout of the same block |
//! | `PermissionDenied` | fatal | `EACCES` | write to a read-only device |
//! | `ReadOnly` | fatal | `EROFS` | allocation on a read-only mount |
//!
//! `HoleNotAllocated` is never shown to end users: read paths translate it
//! into zero bytes for the hole.
//!
//! ## Design Constraints
//!
//! - `ffs-error` MUST NOT depend on `ffs-types` (no cyclic deps). Parse
//!   failures are converted into `Format` / `InvalidGeometry` where the
//!   context is known.
//! - All string payloads are owned (`String`).

use thiserror::Error;

/// Unified error type for block mapping and allocation.
#[derive(Debug, Error)]
pub enum FfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The logical block is a hole and the caller did not ask for allocation.
    #[error("logical block {lbn} is not allocated")]
    HoleNotAllocated { lbn: u64 },

    /// The logical block lies past the last indirection level.
    #[error("logical block {lbn} exceeds the addressable range ({max} blocks)")]
    AddressOverflow { lbn: u64, max: u64 },

    /// On-disk metadata corruption detected at a known block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Malformed encoding or mismatched buffer.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Map geometry is invalid or out of the supported range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The request itself is malformed (bad size, wrong mode).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The block is already checked out of the buffer cache.
    #[error("block {block} is busy")]
    BufferBusy { block: u64 },

    /// No free blocks available.
    #[error("no space left on device")]
    NoSpace,

    /// The device was opened without write access.
    #[error("permission denied")]
    PermissionDenied,

    /// Filesystem is mounted read-only and a mutation was attempted.
    #[error("read-only filesystem")]
    ReadOnly,
}

impl FfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive. Adding a new variant without updating this
    /// function is a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::HoleNotAllocated { .. } => libc::ENODATA,
            Self::AddressOverflow { .. } => libc::EFBIG,
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::InvalidGeometry(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::BufferBusy { .. } => libc::EBUSY,
            Self::NoSpace => libc::ENOSPC,
            Self::PermissionDenied => libc::EACCES,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// Whether an outer caller may reasonably retry the same request.
    ///
    /// Resolution is idempotent over an already-linked prefix, so retrying
    /// after `NoSpace` or an I/O failure resumes where the last call stopped.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::NoSpace | Self::BufferBusy { .. })
    }

    /// Whether this error only reports a sparse hole.
    #[must_use]
    pub fn is_hole(&self) -> bool {
        matches!(self, Self::HoleNotAllocated { .. })
    }
}

/// Result alias using `FfsError`.
pub type Result<T> = std::result::Result<T, FfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(FfsError, libc::c_int)> = vec![
            (FfsError::Io(std::io::Error::other("test")), libc::EIO),
            (FfsError::HoleNotAllocated { lbn: 3 }, libc::ENODATA),
            (FfsError::AddressOverflow { lbn: 300, max: 268 }, libc::EFBIG),
            (
                FfsError::Corruption {
                    block: 0,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (FfsError::Format("test".into()), libc::EINVAL),
            (FfsError::InvalidGeometry("block_size=0".into()), libc::EINVAL),
            (FfsError::InvalidArgument("size=0".into()), libc::EINVAL),
            (FfsError::BufferBusy { block: 7 }, libc::EBUSY),
            (FfsError::NoSpace, libc::ENOSPC),
            (FfsError::PermissionDenied, libc::EACCES),
            (FfsError::ReadOnly, libc::EROFS),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let ffs = FfsError::Io(raw);
        assert_eq!(ffs.to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = FfsError::Corruption {
            block: 42,
            detail: "pointer past end of device".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt metadata at block 42: pointer past end of device"
        );

        let hole = FfsError::HoleNotAllocated { lbn: 17 };
        assert_eq!(hole.to_string(), "logical block 17 is not allocated");

        let overflow = FfsError::AddressOverflow { lbn: 268, max: 268 };
        assert_eq!(
            overflow.to_string(),
            "logical block 268 exceeds the addressable range (268 blocks)"
        );

        assert_eq!(FfsError::NoSpace.to_string(), "no space left on device");
    }

    #[test]
    fn retry_classification() {
        assert!(FfsError::NoSpace.is_retryable());
        assert!(FfsError::Io(std::io::Error::other("disk")).is_retryable());
        assert!(FfsError::BufferBusy { block: 1 }.is_retryable());
        assert!(!FfsError::AddressOverflow { lbn: 1, max: 0 }.is_retryable());
        assert!(!FfsError::HoleNotAllocated { lbn: 1 }.is_retryable());
        assert!(FfsError::HoleNotAllocated { lbn: 1 }.is_hole());
        assert!(!FfsError::NoSpace.is_hole());
    }
}
