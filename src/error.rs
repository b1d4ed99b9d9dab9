use std::fmt;

/// Error taxonomy for the tracer. Kept as a flat, hand-rolled enum (no
/// `thiserror`) so every fallible call site can match on the kind without
/// pulling in a derive macro for what is a handful of variants.
#[derive(Debug)]
pub enum TraceError {
    /// Missing u-dma-buf, unknown board, trace-id lookup failure.
    Init(String),
    /// Device library rejected an enable/stop/drain request.
    Hardware(String),
    /// ptrace, waitpid, sched or mmap syscall failure.
    Os(nix::Error),
    /// sysfs/proc/file I/O failure.
    Io(std::io::Error),
    /// Decoder returned anything other than success.
    Decode(String),
    /// The executable range table is already full.
    Capacity,
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceError::Init(msg) => write!(f, "init error: {}", msg),
            TraceError::Hardware(msg) => write!(f, "hardware error: {}", msg),
            TraceError::Os(e) => write!(f, "os error: {}", e),
            TraceError::Io(e) => write!(f, "io error: {}", e),
            TraceError::Decode(msg) => write!(f, "decode error: {}", msg),
            TraceError::Capacity => write!(f, "executable range table is full"),
        }
    }
}

impl std::error::Error for TraceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TraceError::Os(e) => Some(e),
            TraceError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<nix::Error> for TraceError {
    fn from(e: nix::Error) -> Self {
        TraceError::Os(e)
    }
}

impl From<std::io::Error> for TraceError {
    fn from(e: std::io::Error) -> Self {
        TraceError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, TraceError>;
