//! Errors returned by address space operations.

/// Why an address space operation failed.
///
/// None of these are fatal to the kernel. The trap path turns [`VmError::Unmapped`] and
/// [`VmError::AccessDenied`] from fault resolution into a signal for the faulting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// No gap fits the request, fixed placement was rejected, or growth would collide.
    #[error("no room in the address space")]
    OutOfSpace,
    /// No segment covers the address, or no frame could be produced for it.
    #[error("address is not mapped")]
    Unmapped,
    /// The segment's protection forbids the attempted access.
    #[error("access denied by segment protection")]
    AccessDenied,
    /// Misaligned address or length, empty range, or unknown segment.
    #[error("invalid argument")]
    InvalidArgument,
    /// The operation is not available for this address space.
    #[error("operation not supported")]
    NotSupported,
}

pub type Result<T> = core::result::Result<T, VmError>;
