//! Error types for RingLink

use rustix::io::Errno;
use std::io;
use thiserror::Error;

/// Result type for RingLink operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Errors that can occur in RingLink operations
#[derive(Debug, Error)]
pub enum LinkError {
    /// Build or configuration mismatch (non-power-of-two capacity, bad sizes)
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Failed to reserve a named shared region
    #[error("Failed to reserve shared region '{name}': {source}")]
    RegionUnavailable {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to look up a named shared region
    #[error("Shared region '{name}' not found: {source}")]
    NotFound {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to truncate shared memory
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// Region name too long for the registry
    #[error("Region name too long: max {max} chars, got {got}")]
    NameTooLong { max: usize, got: usize },

    /// Region does not hold the expected structure
    #[error("Invalid magic number in '{name}': expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic {
        name: String,
        expected: u32,
        got: u32,
    },

    /// Buffer pool is exhausted
    #[error("Buffer pool exhausted")]
    OutOfBuffers,

    /// Ring does not have room for the whole burst
    #[error("Ring has {free} free slots, {requested} requested")]
    NoSpace { requested: usize, free: usize },

    /// Burst would push ring occupancy above the producer watermark
    #[error("Ring quota exceeded: watermark {watermark}, occupancy would be {occupancy}")]
    QuotaExceeded { watermark: u32, occupancy: usize },

    /// Transmit ring is full, retry later
    #[error("Transmit ring is busy")]
    Busy,

    /// Packet does not fit in a transfer buffer
    #[error("Payload too large: max {max} bytes, got {got} bytes")]
    PayloadTooLarge { max: usize, got: usize },

    /// Non-blocking receive found nothing
    #[error("No message available")]
    WouldBlock,

    /// Caller passed an out-of-range argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Ring carried a handle the pool does not own
    #[error("Invalid buffer handle {0}")]
    InvalidHandle(u64),

    /// Received buffer is shorter than its fixed header
    #[error("Truncated message: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    /// Bounded wait expired
    #[error("Wait timed out")]
    TimedOut,

    /// Wait was cancelled through its token
    #[error("Wait cancelled")]
    Cancelled,
}

impl LinkError {
    /// Backpressure conditions the caller may retry after a delay
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkError::OutOfBuffers
                | LinkError::NoSpace { .. }
                | LinkError::QuotaExceeded { .. }
                | LinkError::Busy
                | LinkError::WouldBlock
                | LinkError::TimedOut
        )
    }

    /// Positive errno value for the C API
    pub fn errno(&self) -> i32 {
        let errno = match self {
            LinkError::Config(_) | LinkError::InvalidArgument(_) | LinkError::InvalidHandle(_) => {
                Errno::INVAL
            }
            LinkError::RegionUnavailable { .. } | LinkError::Mmap(_) | LinkError::Truncate(_) => {
                Errno::NOMEM
            }
            LinkError::NotFound { .. } => Errno::NOENT,
            LinkError::NameTooLong { .. } => Errno::NAMETOOLONG,
            LinkError::InvalidMagic { .. } => Errno::PROTO,
            LinkError::OutOfBuffers | LinkError::NoSpace { .. } | LinkError::Busy => Errno::NOBUFS,
            LinkError::QuotaExceeded { .. } => Errno::DQUOT,
            LinkError::PayloadTooLarge { .. } => Errno::NOMEM,
            LinkError::WouldBlock => Errno::AGAIN,
            LinkError::Truncated { .. } => Errno::BADMSG,
            LinkError::TimedOut => Errno::TIMEDOUT,
            LinkError::Cancelled => Errno::CANCELED,
        };
        errno.raw_os_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backpressure_is_retryable() {
        assert!(LinkError::Busy.is_retryable());
        assert!(LinkError::OutOfBuffers.is_retryable());
        assert!(LinkError::WouldBlock.is_retryable());
        assert!(!LinkError::Config("x".into()).is_retryable());
        assert!(!LinkError::PayloadTooLarge { max: 1, got: 2 }.is_retryable());
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(LinkError::Busy.errno(), Errno::NOBUFS.raw_os_error());
        assert_eq!(
            LinkError::QuotaExceeded { watermark: 1, occupancy: 2 }.errno(),
            Errno::DQUOT.raw_os_error()
        );
        assert_eq!(LinkError::WouldBlock.errno(), Errno::AGAIN.raw_os_error());
        assert!(LinkError::InvalidArgument("n".into()).errno() > 0);
    }
}
