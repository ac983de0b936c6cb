use std::io;

/// Error surface of the awaitable ops.
///
/// Kernel-reported op failures arrive as negative CQE results and are mapped
/// to [`IoError::Io`]; callers decide close-vs-continue. The ring/slab
/// capacity variants are worker-fatal and never returned to handler code.
#[derive(thiserror::Error, Debug)]
pub enum IoError {
    /// The submission queue ring is full. The ring is sized so that this is
    /// unreachable under design load; hitting it is fatal to the worker.
    #[error("submission queue ring is full, cannot submit op")]
    SqRingFull,

    /// The op-descriptor slab is at capacity.
    #[error("op descriptor slab is full, cannot track another in-flight op")]
    SlabFull,

    /// The kernel reported a failure for this op.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A catch-all for any other type of unexpected error.
    #[error("an unexpected error occurred: {0}")]
    Other(#[from] anyhow::Error),
}

impl IoError {
    /// Fatal errors take down the worker; they indicate the ring or slab is
    /// undersized for the offered load, and there is no recovery path.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IoError::SqRingFull | IoError::SlabFull)
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            IoError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl From<io_uring::squeue::PushError> for IoError {
    fn from(_: io_uring::squeue::PushError) -> Self {
        IoError::SqRingFull
    }
}

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::SqRingFull, Self::SqRingFull) => true,
            (Self::SlabFull, Self::SlabFull) => true,
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}
