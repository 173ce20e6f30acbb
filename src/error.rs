//! Error taxonomy for archive relays.
//!
//! Every failure that crosses a component boundary is an [`Error`]: an
//! [`ErrorKind`] naming where it happened plus the underlying cause. The kind
//! decides how the failure propagates:
//!
//! | Class | Kinds | Behaviour |
//! |-------|-------|-----------|
//! | Transient | `MetadataFetch`, `TailDownload`, `EntryRead` | retried locally, surfaced after exhaustion |
//! | Structural | `ArchiveParse`, `NotOpen`, `UnsupportedFileType`, `Config` | abort the run before scheduling |
//! | Per-task | `EntryTooLarge`, `StreamOpen`, `Upload`, `RangeRequest`, `Cancelled` | recorded on one task only |

use std::fmt;

/// Where a failure originated. Each variant maps to one stable trace id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrorKind {
    #[error("failed to fetch archive metadata")]
    MetadataFetch,
    #[error("failed to download archive tail")]
    TailDownload,
    #[error("archive is malformed or unsupported")]
    ArchiveParse,
    #[error("failed to read archive directory entry")]
    EntryRead,
    #[error("archive connection is closed")]
    NotOpen,
    #[error("source file is not a .zip archive")]
    UnsupportedFileType,
    #[error("sub-file exceeds the destination object size limit")]
    EntryTooLarge,
    #[error("failed to open sub-file stream")]
    StreamOpen,
    #[error("sub-file upload failed")]
    Upload,
    #[error("range request failed")]
    RangeRequest,
    #[error("local cache I/O failed")]
    LocalCache,
    #[error("task was cancelled")]
    Cancelled,
    #[error("task manager contract violated")]
    ContractViolation,
    #[error("invalid configuration")]
    Config,
}

impl ErrorKind {
    /// Stable identifier used in logs and summaries.
    pub fn trace(self) -> &'static str {
        match self {
            ErrorKind::MetadataFetch => "get_archive_meta_failed",
            ErrorKind::TailDownload => "download_archive_tail_failed",
            ErrorKind::ArchiveParse => "archive_malformed",
            ErrorKind::EntryRead => "read_entry_failed",
            ErrorKind::NotOpen => "archive_not_open",
            ErrorKind::UnsupportedFileType => "unsupported_file_type",
            ErrorKind::EntryTooLarge => "sub_file_too_large",
            ErrorKind::StreamOpen => "open_sub_file_failed",
            ErrorKind::Upload => "upload_sub_file_failed",
            ErrorKind::RangeRequest => "range_request_failed",
            ErrorKind::LocalCache => "local_cache_failed",
            ErrorKind::Cancelled => "task_cancelled",
            ErrorKind::ContractViolation => "contract_violation",
            ErrorKind::Config => "invalid_config",
        }
    }

    /// Whether a failure of this kind aborts the whole run.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::MetadataFetch
                | ErrorKind::TailDownload
                | ErrorKind::ArchiveParse
                | ErrorKind::EntryRead
                | ErrorKind::NotOpen
                | ErrorKind::UnsupportedFileType
                | ErrorKind::ContractViolation
                | ErrorKind::Config
        )
    }
}

/// A tagged failure: the kind plus whatever caused it.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {cause:#}")]
pub struct Error {
    kind: ErrorKind,
    #[source]
    cause: anyhow::Error,
}

impl Error {
    pub fn new(kind: ErrorKind, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            kind,
            cause: cause.into(),
        }
    }

    /// Build an error whose cause is only a message.
    pub fn msg(kind: ErrorKind, message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self::new(kind, anyhow::Error::msg(message))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }

    /// Human-readable reason: the kind's description followed by the cause.
    pub fn reason(&self) -> String {
        format!("{}: {:#}", self.kind, self.cause)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Tag a foreign error with an [`ErrorKind`].
pub trait ResultExt<T> {
    fn kind(self, kind: ErrorKind) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn kind(self, kind: ErrorKind) -> Result<T> {
        self.map_err(|e| Error::new(kind, e))
    }
}

/// Kind of the first tagged [`Error`] in `err`'s chain, if any.
pub fn kind_of(err: &anyhow::Error) -> Option<ErrorKind> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<Error>())
        .map(Error::kind)
}

/// Describe any error for a person reading a run report.
///
/// Known failures get their kind's message; anything else falls back to its
/// own string form.
pub fn describe_error(err: &anyhow::Error) -> String {
    match err.downcast_ref::<Error>() {
        Some(e) => e.reason(),
        None => format!("{err:#}"),
    }
}
