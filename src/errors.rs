use std::fmt;

/// Error kinds produced by the virtual map and its subsystems.
#[derive(Debug)]
pub enum VirtualMapError {
    /// The requested key or path has no record.
    NotFound,
    /// A mutation was attempted against an immutable (sealed or archived) copy.
    ImmutableState,
    /// An operation was attempted against a released copy.
    ReleasedState,
    /// A second writing session was requested while one was already open.
    AlreadyWriting,
    /// A recoverable I/O error; the caller may retry.
    IoError(std::io::Error),
    /// An I/O error survived the retry budget and is now unrecoverable.
    FatalIoError(String),
    /// On-disk data failed a structural or checksum check.
    Corruption(String),
    /// A path arithmetic operation has no defined result (e.g. `parent(0)`, `u64::MAX`).
    PathOverflow,
    /// `copy()` was rejected because the flush queue is deeper than `maximum_map_size / flush_interval`.
    BackpressureExceeded,
    /// The current operation was interrupted before completing.
    Cancelled,
    /// A file-set merge could not proceed.
    MergeError(String),
    /// Hashing a sealed copy failed.
    HashingFailed(String),
    /// The supplied configuration is internally inconsistent.
    ConfigurationError(String),
    /// Serialization or deserialization of an on-disk record failed.
    SerializationError(String),
}

impl fmt::Display for VirtualMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VirtualMapError::NotFound => write!(f, "no record for the given key or path"),
            VirtualMapError::ImmutableState => write!(f, "copy is immutable"),
            VirtualMapError::ReleasedState => write!(f, "copy has been released"),
            VirtualMapError::AlreadyWriting => write!(f, "a writing session is already open"),
            VirtualMapError::IoError(err) => write!(f, "I/O error: {err}"),
            VirtualMapError::FatalIoError(msg) => write!(f, "fatal I/O error: {msg}"),
            VirtualMapError::Corruption(msg) => write!(f, "corruption: {msg}"),
            VirtualMapError::PathOverflow => write!(f, "path arithmetic overflow"),
            VirtualMapError::BackpressureExceeded => write!(f, "flush queue backpressure exceeded"),
            VirtualMapError::Cancelled => write!(f, "operation cancelled"),
            VirtualMapError::MergeError(msg) => write!(f, "merge error: {msg}"),
            VirtualMapError::HashingFailed(msg) => write!(f, "hashing failed: {msg}"),
            VirtualMapError::ConfigurationError(msg) => write!(f, "configuration error: {msg}"),
            VirtualMapError::SerializationError(msg) => write!(f, "serialization error: {msg}"),
        }
    }
}

impl std::error::Error for VirtualMapError {}

impl From<std::io::Error> for VirtualMapError {
    fn from(err: std::io::Error) -> Self {
        VirtualMapError::IoError(err)
    }
}

impl From<bincode::Error> for VirtualMapError {
    fn from(err: bincode::Error) -> Self {
        VirtualMapError::SerializationError(err.to_string())
    }
}

/// Result type alias used throughout the crate.
pub type VirtualMapResult<T> = Result<T, VirtualMapError>;
