//! Boundary to the document visiting subsystem.
//!
//! The reindexer never talks to content nodes itself. It describes a visit with
//! [`VisitorParameters`], hands it to a [`VisitorSessionFactory`], and learns about the visit's
//! fate through the [`VisitorControl`] embedded in the parameters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Resumable cursor over the buckets of a visit.
///
/// A fresh token has no enumerated work yet, and counts as fully done.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressToken {
    #[serde(default)]
    finished_buckets: u64,
    #[serde(default)]
    total_buckets: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    position: Option<String>,
}

impl ProgressToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_buckets(finished_buckets: u64, total_buckets: u64) -> Self {
        Self {
            finished_buckets,
            total_buckets,
            position: None,
        }
    }

    /// Attaches the visitor's serialized resume position.
    #[must_use]
    pub fn with_position(self, position: impl Into<String>) -> Self {
        Self {
            position: Some(position.into()),
            ..self
        }
    }

    #[must_use]
    pub const fn finished_buckets(&self) -> u64 {
        self.finished_buckets
    }

    #[must_use]
    pub const fn total_buckets(&self) -> u64 {
        self.total_buckets
    }

    #[must_use]
    pub fn position(&self) -> Option<&str> {
        self.position.as_deref()
    }

    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished_buckets >= self.total_buckets
    }

    /// Completion in `[0, 100]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent_finished(&self) -> f64 {
        if self.total_buckets == 0 {
            return 100.0;
        }
        let finished = self.finished_buckets.min(self.total_buckets);
        finished as f64 * 100.0 / self.total_buckets as f64
    }
}

/// Message priority on the document protocol, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Highest,
    VeryHigh,
    High1,
    High2,
    High3,
    Normal1,
    Normal2,
    Normal3,
    Normal4,
    Normal5,
    Normal6,
    Low1,
    Low2,
    Low3,
    VeryLow,
    Lowest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionCode {
    Success,
    Failure,
    /// Only reported after the session was asked to stop.
    Aborted,
}

/// Receiver of visit session events.
///
/// A session never invokes the callbacks of one handler concurrently, and calls `on_done`
/// exactly once, also when it was stopped early.
pub trait ControlHandler: Send + Sync {
    fn on_progress(&self, token: ProgressToken);

    fn on_done(&self, code: CompletionCode, message: &str);
}

struct NoopControlHandler;

impl ControlHandler for NoopControlHandler {
    fn on_progress(&self, _token: ProgressToken) {}

    fn on_done(&self, _code: CompletionCode, _message: &str) {}
}

/// Cloneable handle to the [`ControlHandler`] of one visit.
#[derive(Clone)]
pub struct VisitorControl {
    handler: Arc<dyn ControlHandler>,
}

impl VisitorControl {
    pub fn new(handler: Arc<dyn ControlHandler>) -> Self {
        Self { handler }
    }

    pub fn on_progress(&self, token: ProgressToken) {
        self.handler.on_progress(token);
    }

    pub fn on_done(&self, code: CompletionCode, message: impl AsRef<str>) {
        self.handler.on_done(code, message.as_ref());
    }
}

impl Default for VisitorControl {
    fn default() -> Self {
        Self::new(Arc::new(NoopControlHandler))
    }
}

impl fmt::Debug for VisitorControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisitorControl").finish_non_exhaustive()
    }
}

/// Everything a session needs to visit the documents of one type.
#[derive(Debug, Clone)]
pub struct VisitorParameters {
    /// Fields to fetch, e.g. `music:[document]` for all stored fields of `music`.
    pub field_set: String,
    pub resume_token: ProgressToken,
    pub bucket_space: String,
    pub route: String,
    pub remote_data_handler: String,
    pub document_selection: String,
    pub priority: Priority,
    pub control: VisitorControl,
}

/// Stop operation of a started session.
///
/// Stopping asks the visit to end early; the session still reports completion through its
/// control handler, with [`CompletionCode::Aborted`] unless the visit had already finished.
pub struct SessionHandle {
    stop: Box<dyn FnOnce() + Send>,
}

impl SessionHandle {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop: Box::new(stop),
        }
    }

    pub fn stop(self) {
        (self.stop)();
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle").finish_non_exhaustive()
    }
}

/// Starts asynchronous visits.
///
/// A session which fails to start must still report `on_done` with [`CompletionCode::Failure`].
pub trait VisitorSessionFactory: Send + Sync {
    fn start(&self, parameters: VisitorParameters) -> SessionHandle;
}

impl<F> VisitorSessionFactory for F
where
    F: Fn(VisitorParameters) -> SessionHandle + Send + Sync,
{
    fn start(&self, parameters: VisitorParameters) -> SessionHandle {
        self(parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[test]
    fn fresh_token_counts_as_done() {
        let token = ProgressToken::new();
        assert!(token.is_finished());
        assert_eq!(token.percent_finished(), 100.0);
    }

    #[test]
    fn percent_follows_finished_buckets() {
        assert_eq!(ProgressToken::with_buckets(0, 8).percent_finished(), 0.0);
        assert_eq!(ProgressToken::with_buckets(2, 8).percent_finished(), 25.0);
        assert_eq!(ProgressToken::with_buckets(9, 8).percent_finished(), 100.0);
        assert!(!ProgressToken::with_buckets(7, 8).is_finished());
    }

    #[test]
    fn position_survives_serialization() {
        let token = ProgressToken::with_buckets(3, 16).with_position("bucket:0x4000000000000017");
        let json = serde_json::to_string(&token).unwrap();
        let parsed: ProgressToken = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.position(), Some("bucket:0x4000000000000017"));
        assert_eq!(parsed, token);
    }

    #[test]
    fn low_priority_ranks_below_normal() {
        assert!(Priority::Low1 > Priority::Normal6);
        assert!(Priority::Low1 < Priority::Lowest);
    }

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<String>>,
    }

    impl ControlHandler for Recording {
        fn on_progress(&self, token: ProgressToken) {
            self.events
                .lock()
                .unwrap()
                .push(format!("progress {}", token.percent_finished()));
        }

        fn on_done(&self, code: CompletionCode, message: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("done {code:?} {message}"));
        }
    }

    #[test]
    fn control_delegates_to_handler() {
        let recording = Arc::new(Recording::default());
        let control = VisitorControl::new(recording.clone());
        control.clone().on_progress(ProgressToken::with_buckets(1, 2));
        control.on_done(CompletionCode::Success, "OK");

        assert_eq!(
            *recording.events.lock().unwrap(),
            vec!["progress 50".to_string(), "done Success OK".to_string()]
        );
    }

    #[test]
    fn closures_act_as_session_factories() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let factory = move |parameters: VisitorParameters| {
            assert_eq!(parameters.document_selection, "music");
            let flag = flag.clone();
            SessionHandle::new(move || flag.store(true, Ordering::SeqCst))
        };

        let handle = factory.start(VisitorParameters {
            field_set: "music:[document]".into(),
            resume_token: ProgressToken::new(),
            bucket_space: "default".into(),
            route: "[Storage:cluster=cluster;clusterconfigid=id]".into(),
            remote_data_handler: "cluster".into(),
            document_selection: "music".into(),
            priority: Priority::Low1,
            control: VisitorControl::default(),
        });
        assert!(!stopped.load(Ordering::SeqCst));
        handle.stop();
        assert!(stopped.load(Ordering::SeqCst));
    }
}
