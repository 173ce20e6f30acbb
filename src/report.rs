//! Human-readable summary of an extraction run.

use std::fmt;

use crate::task::TaskState;
use crate::unzip::UnzipRecord;

/// Most task lines a summary shows.
pub const DETAIL_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Fail,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Success => "success",
            RunStatus::Fail => "fail",
        })
    }
}

/// One line of the summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDetail {
    pub name: String,
    pub state: TaskState,
    /// Destination key and byte count of a successful upload.
    pub uploaded: Option<(String, u64)>,
    /// Trace id and reason of a failure.
    pub error: Option<(&'static str, String)>,
}

impl fmt::Display for TaskDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.uploaded, &self.error) {
            (Some((key, bytes)), _) => write!(f, "{} -> {} ({} bytes)", self.name, key, bytes),
            (None, Some((trace, reason))) => {
                write!(f, "{} {} [{}]: {}", self.name, self.state, trace, reason)
            }
            (None, None) => write!(f, "{} {}", self.name, self.state),
        }
    }
}

/// Success count, total and the first few task lines of a run.
///
/// When there are more tasks than [`DETAIL_LIMIT`] and some failed, only
/// failures are listed.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub details: Vec<TaskDetail>,
    /// Tasks left out of `details`.
    pub omitted: usize,
}

impl RunSummary {
    pub fn from_records(records: &[UnzipRecord]) -> Self {
        let total = records.len();
        let succeeded = records.iter().filter(|r| r.succeeded()).count();
        let failures_only = total > DETAIL_LIMIT && succeeded < total;

        let shown: Vec<&UnzipRecord> = records
            .iter()
            .filter(|r| !failures_only || !r.succeeded())
            .collect();
        let omitted = total - shown.len().min(DETAIL_LIMIT);

        let details = shown
            .into_iter()
            .take(DETAIL_LIMIT)
            .map(|r| TaskDetail {
                name: r.params.name.clone(),
                state: r.state,
                uploaded: r.result.as_ref().map(|u| (u.key.clone(), u.bytes)),
                error: r.error.as_ref().map(|e| (e.kind().trace(), e.reason())),
            })
            .collect();

        Self {
            total,
            succeeded,
            details,
            omitted,
        }
    }

    pub fn status(&self) -> RunStatus {
        if self.succeeded < self.total {
            RunStatus::Fail
        } else {
            RunStatus::Success
        }
    }

    pub fn failed(&self) -> bool {
        self.status() == RunStatus::Fail
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: {}/{} uploaded", self.status(), self.succeeded, self.total)?;
        for detail in &self.details {
            writeln!(f, "  {detail}")?;
        }
        if self.omitted > 0 {
            writeln!(f, "  ... {} more", self.omitted)?;
        }
        Ok(())
    }
}
