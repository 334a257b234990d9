use crate::clock::{from_unix_ms, to_unix_ms};
use crate::ProgressToken;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

/// Name of a document type, as known to the cluster's schema catalog.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentType(String);

impl DocumentType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Running,
    Successful,
    Failed,
    Halted,
}

impl State {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::Halted => "halted",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Reindexing status of a single document type.
///
/// Values are only produced through the [`Status::ready`] chain:
///
/// ```text
/// ready(at) ──> running() ──┬──> successful(at)
///                 │   ▲     ├──> failed(at, message)
///                 └───┘     └──> halted()
///              progressed(token)
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StatusRecord", into = "StatusRecord")]
pub struct Status {
    ready_at: SystemTime,
    state: State,
    progress: Option<ProgressToken>,
    completed_at: Option<SystemTime>,
    message: Option<String>,
}

impl Status {
    /// Starts a new round which was judged due at `ready_at`.
    #[must_use]
    pub const fn ready(ready_at: SystemTime) -> Ready {
        Ready { ready_at }
    }

    #[must_use]
    pub const fn ready_at(&self) -> SystemTime {
        self.ready_at
    }

    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    #[must_use]
    pub const fn progress(&self) -> Option<&ProgressToken> {
        self.progress.as_ref()
    }

    #[must_use]
    pub const fn completed_at(&self) -> Option<SystemTime> {
        self.completed_at
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// A round that has been judged due but not yet started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    ready_at: SystemTime,
}

impl Ready {
    #[must_use]
    pub const fn running(self) -> Running {
        Running {
            ready_at: self.ready_at,
            progress: None,
        }
    }
}

/// An in-flight round. Only this stage accepts progress and terminal transitions.
#[derive(Debug, Clone, PartialEq)]
pub struct Running {
    ready_at: SystemTime,
    progress: Option<ProgressToken>,
}

impl Running {
    #[must_use]
    pub fn progressed(self, token: ProgressToken) -> Self {
        Self {
            progress: Some(token),
            ..self
        }
    }

    #[must_use]
    pub const fn progress(&self) -> Option<&ProgressToken> {
        self.progress.as_ref()
    }

    /// Snapshot of this round as a persistable RUNNING status.
    #[must_use]
    pub fn status(&self) -> Status {
        Status {
            ready_at: self.ready_at,
            state: State::Running,
            progress: self.progress.clone(),
            completed_at: None,
            message: None,
        }
    }

    /// A finished round has nothing left to resume, so the cursor is dropped.
    #[must_use]
    pub fn successful(self, completed_at: SystemTime) -> Status {
        Status {
            ready_at: self.ready_at,
            state: State::Successful,
            progress: None,
            completed_at: Some(completed_at),
            message: None,
        }
    }

    #[must_use]
    pub fn failed(self, completed_at: SystemTime, message: impl Into<String>) -> Status {
        Status {
            ready_at: self.ready_at,
            state: State::Failed,
            progress: self.progress,
            completed_at: Some(completed_at),
            message: Some(message.into()),
        }
    }

    #[must_use]
    pub fn halted(self) -> Status {
        Status {
            ready_at: self.ready_at,
            state: State::Halted,
            progress: self.progress,
            completed_at: None,
            message: None,
        }
    }
}

/// Reindexing status of every document type in a cluster. This is the full persisted payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reindexing {
    #[serde(default)]
    status: BTreeMap<DocumentType, Status>,
}

impl Reindexing {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns a copy with the status of `document_type` added or replaced.
    #[must_use]
    pub fn with(&self, document_type: DocumentType, status: Status) -> Self {
        let mut status_by_type = self.status.clone();
        status_by_type.insert(document_type, status);
        Self {
            status: status_by_type,
        }
    }

    #[must_use]
    pub fn status(&self, document_type: &DocumentType) -> Option<&Status> {
        self.status.get(document_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DocumentType, &Status)> {
        self.status.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.status.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.status.is_empty()
    }
}

#[derive(Serialize, Deserialize)]
struct StatusRecord {
    ready_at_unix_ms: u64,
    state: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    progress: Option<ProgressToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed_at_unix_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl From<Status> for StatusRecord {
    fn from(status: Status) -> Self {
        Self {
            ready_at_unix_ms: to_unix_ms(status.ready_at),
            state: status.state,
            progress: status.progress,
            completed_at_unix_ms: status.completed_at.map(to_unix_ms),
            message: status.message,
        }
    }
}

impl From<StatusRecord> for Status {
    fn from(record: StatusRecord) -> Self {
        Self {
            ready_at: from_unix_ms(record.ready_at_unix_ms),
            state: record.state,
            progress: record.progress,
            completed_at: record.completed_at_unix_ms.map(from_unix_ms),
            message: record.message,
        }
    }
}
