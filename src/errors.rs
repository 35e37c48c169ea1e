use thiserror::Error as ThisError;

/// Reasons a set of CPU ids cannot be used for pinning.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum CpuSetError {
    #[error("cpu set must contain at least one cpu id")]
    Empty,

    #[error("cpu id {id} is out of range, host has {logical_cpus} logical cpus")]
    OutOfRange { id: usize, logical_cpus: usize },
}

#[derive(Debug, ThisError)]
pub enum AffinityError {
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The kernel reported a mask that doesn't fit the host's cpu count.
    #[error("kernel returned an unusable affinity mask: {0}")]
    InvalidMask(#[source] CpuSetError),

    /// The id is valid for the host but the native mask has no bit for it.
    #[error("cpu id {id} doesn't fit the native affinity mask of {max_cpu} cpus")]
    MaskTooSmall { id: usize, max_cpu: usize },

    #[error("thread affinity is not supported on this platform")]
    Unsupported,
}

impl AffinityError {
    pub fn os(op: &'static str, source: std::io::Error) -> Self {
        Self::Os { op, source }
    }
}

#[derive(Debug, ThisError)]
pub enum PinnedPoolError {
    #[error("a pinned pool needs at least one cpu id")]
    NoCpus,

    #[error("invalid pinned cpu: {0}")]
    InvalidCpu(#[from] CpuSetError),
}
