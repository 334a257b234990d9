use crate::clock::truncate_to_ms;
use crate::metrics::{Dimensions, Metric, PERCENT_DONE_METRIC};
use crate::store::{LockHandle, ReindexingStore};
use crate::visiting::{
    CompletionCode, ControlHandler, Priority, ProgressToken, VisitorControl, VisitorParameters,
    VisitorSessionFactory,
};
use crate::{
    Clock, Cluster, DocumentType, Reindexing, ReindexerConfig, ReindexerError, Result, Running,
    State, Status,
};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Drives reindexing of the document types of one cluster.
///
/// Each call to [`Reindexer::reindex`] takes the store's lock, then visits every document type
/// whose not-before instant has passed since its last round, one type at a time. Progress and
/// outcome of each round are persisted to the store and exported as metrics.
pub struct Reindexer {
    cluster: Cluster,
    ready: BTreeMap<DocumentType, SystemTime>,
    store: Arc<dyn ReindexingStore>,
    sessions: Arc<dyn VisitorSessionFactory>,
    metric: Arc<dyn Metric>,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
    shutdown: CancellationToken,
}

impl Reindexer {
    /// Fails if a document type in `ready` has no bucket space in `cluster`.
    ///
    /// Instants are kept at millisecond precision, as they are persisted: not-before instants in
    /// `ready` and round start times read from `clock` are truncated to whole milliseconds.
    pub fn new(
        cluster: Cluster,
        ready: BTreeMap<DocumentType, SystemTime>,
        store: Arc<dyn ReindexingStore>,
        sessions: Arc<dyn VisitorSessionFactory>,
        metric: Arc<dyn Metric>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if let Some(unknown) = ready
            .keys()
            .find(|document_type| cluster.bucket_space_of(document_type).is_none())
        {
            return Err(ReindexerError::UnknownBucketSpace(unknown.clone()));
        }

        Ok(Self {
            cluster,
            ready: ready
                .into_iter()
                .map(|(document_type, not_before)| (document_type, truncate_to_ms(not_before)))
                .collect(),
            store,
            sessions,
            metric,
            clock,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn from_config(
        config: &ReindexerConfig,
        store: Arc<dyn ReindexingStore>,
        sessions: Arc<dyn VisitorSessionFactory>,
        metric: Arc<dyn Metric>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let reindexer = Self::new(
            config.cluster.clone(),
            config.ready_at(),
            store,
            sessions,
            metric,
            clock,
        )?;
        Ok(reindexer.with_lock_timeout(config.lock_timeout()))
    }

    #[must_use]
    pub const fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    #[must_use]
    pub const fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Stops reindexing: no new rounds start, and the in-flight round, if any, is asked to stop.
    ///
    /// Safe to call from any thread, any number of times. A stopped round is recorded as halted,
    /// and [`Reindexer::reindex`] returns once the session acknowledges the stop.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Shutting down reindexing of cluster '{}'", self.cluster.name);
        }
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Document types due for a new round at `now`, in name order.
    ///
    /// A type is due when its not-before instant has passed, and lies after the start of its
    /// previous round, whatever the outcome of that round was.
    #[must_use]
    pub fn due(&self, reindexing: &Reindexing, now: SystemTime) -> Vec<DocumentType> {
        self.ready
            .iter()
            .filter(|(document_type, not_before)| {
                let after_previous = reindexing
                    .status(document_type)
                    .map_or(true, |previous| **not_before > previous.ready_at());
                after_previous && **not_before <= now
            })
            .map(|(document_type, _)| document_type.clone())
            .collect()
    }

    /// Runs one reindexing pass, failing only if the lock could not be taken, or the store
    /// could not be read or written from this task.
    pub async fn reindex(&self) -> Result<()> {
        let lock = self.lock().await?;
        let outcome = self.reindex_locked().await;
        lock.release().await;
        outcome
    }

    /// Parameters for visiting all documents of `document_type`, starting at `resume_token`.
    pub fn create_parameters(
        &self,
        document_type: &DocumentType,
        resume_token: ProgressToken,
    ) -> Result<VisitorParameters> {
        let bucket_space = self
            .cluster
            .bucket_space_of(document_type)
            .ok_or_else(|| ReindexerError::UnknownBucketSpace(document_type.clone()))?;

        Ok(VisitorParameters {
            field_set: format!("{document_type}:[document]"),
            resume_token,
            bucket_space: bucket_space.to_string(),
            route: self.cluster.route(),
            remote_data_handler: self.cluster.name.clone(),
            document_selection: document_type.name().to_string(),
            priority: Priority::Low1,
            control: VisitorControl::default(),
        })
    }

    async fn lock(&self) -> Result<ReindexingLock> {
        let store = self.store.clone();
        let timeout = self.lock_timeout;
        let handle = blocking("reindexing lock", move || store.lock(timeout)).await??;
        debug!("Acquired reindexing lock for cluster '{}'", self.cluster.name);

        let heartbeat = self.store.renewal_interval().map(|every| {
            spawn_lock_heartbeat(
                self.store.clone(),
                handle.clone(),
                every,
                self.cluster.name.clone(),
            )
        });
        Ok(ReindexingLock {
            store: self.store.clone(),
            cluster: self.cluster.name.clone(),
            handle: Some(handle),
            heartbeat,
        })
    }

    async fn reindex_locked(&self) -> Result<()> {
        let store = self.store.clone();
        let mut reindexing = blocking("reading reindexing status", move || store.read()).await??;
        let due = self.due(&reindexing, self.now());
        if due.is_empty() {
            debug!("Nothing to reindex in cluster '{}'", self.cluster.name);
            return Ok(());
        }

        info!(
            "Reindexing {} document type(s) in cluster '{}'",
            due.len(),
            self.cluster.name
        );
        for document_type in due {
            if self.shutdown.is_cancelled() {
                info!("Skipping reindexing of {document_type}, shutdown was requested");
                continue;
            }
            reindexing = self.reindex_type(&document_type, reindexing).await?;
        }
        Ok(())
    }

    /// Runs one round over `document_type` and returns the snapshot as of its completion.
    ///
    /// The round's RUNNING status starts without a cursor; the previous round's cursor, if any,
    /// is only handed to the session as its resume token. A round which ends before reporting
    /// progress therefore records no cursor of its own.
    async fn reindex_type(
        &self,
        document_type: &DocumentType,
        reindexing: Reindexing,
    ) -> Result<Reindexing> {
        let resume_token = reindexing
            .status(document_type)
            .and_then(Status::progress)
            .cloned();
        let running = Status::ready(self.now()).running();
        let reindexing = reindexing.with(document_type.clone(), running.status());
        let store = self.store.clone();
        let snapshot = reindexing.clone();
        blocking("writing reindexing status", move || store.write(&snapshot)).await??;

        match &resume_token {
            Some(token) => info!(
                "Resuming reindexing of {document_type} at {:.1}%",
                token.percent_finished()
            ),
            None => info!("Starting reindexing of {document_type}"),
        }

        let parameters = self.create_parameters(document_type, resume_token.unwrap_or_default())?;
        let (done_tx, mut done_rx) = oneshot::channel();
        let round = Round {
            document_type: document_type.clone(),
            cluster: self.cluster.name.clone(),
            store: self.store.clone(),
            metric: self.metric.clone(),
            clock: self.clock.clone(),
            state: Mutex::new(RoundState {
                reindexing,
                running: Some(running),
                done: Some(done_tx),
            }),
        };
        let parameters = VisitorParameters {
            control: VisitorControl::new(Arc::new(round)),
            ..parameters
        };
        let sessions = self.sessions.clone();
        let session = blocking("starting visit", move || sessions.start(parameters)).await?;

        let completed = tokio::select! {
            done = &mut done_rx => Some(done),
            () = self.shutdown.cancelled() => None,
        };
        if completed.is_none() {
            info!("Stopping visit of {document_type} for shutdown");
        }
        if let Err(err) = blocking("stopping visit", move || session.stop()).await {
            warn!("Failed to stop visit of {document_type}: {err}");
        }

        let done = match completed {
            Some(done) => done,
            None => done_rx.await,
        };
        done.map_err(|_| {
            ReindexerError::Other(format!(
                "visit of {document_type} ended without reporting completion"
            ))
        })
    }

    fn now(&self) -> SystemTime {
        truncate_to_ms(self.clock.now())
    }
}

impl fmt::Debug for Reindexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reindexer")
            .field("cluster", &self.cluster)
            .field("ready", &self.ready)
            .field("lock_timeout", &self.lock_timeout)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

/// Runs store and session calls, which may block, off the async workers.
async fn blocking<T, F>(what: &str, work: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ReindexerError::Other(format!("{what} task failed: {e}")))
}

/// Renews the lock lease every `every` until cancelled.
fn spawn_lock_heartbeat(
    store: Arc<dyn ReindexingStore>,
    handle: LockHandle,
    every: Duration,
    cluster: String,
) -> CancellationToken {
    let stop = CancellationToken::new();
    let stopped = stop.clone();
    tokio::spawn(async move {
        let mut ticker = time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = stopped.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let store = store.clone();
            let handle = handle.clone();
            match blocking("renewing reindexing lock", move || store.renew(&handle)).await {
                Ok(Ok(())) => debug!("Renewed reindexing lock for cluster '{cluster}'"),
                Ok(Err(err)) | Err(err) => {
                    warn!("Failed to renew reindexing lock for cluster '{cluster}': {err}");
                }
            }
        }
    });
    stop
}

/// Holds the store lock and keeps its lease alive. Released by [`ReindexingLock::release`], or
/// when dropped.
struct ReindexingLock {
    store: Arc<dyn ReindexingStore>,
    cluster: String,
    handle: Option<LockHandle>,
    heartbeat: Option<CancellationToken>,
}

impl ReindexingLock {
    async fn release(mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.cancel();
        }
        let Some(handle) = self.handle.take() else {
            return;
        };
        let store = self.store.clone();
        let outcome = blocking("releasing reindexing lock", move || store.unlock(handle)).await;
        match outcome {
            Ok(Ok(())) => debug!("Released reindexing lock for cluster '{}'", self.cluster),
            Ok(Err(err)) | Err(err) => warn!(
                "Failed to release reindexing lock for cluster '{}': {err}",
                self.cluster
            ),
        }
    }
}

impl Drop for ReindexingLock {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.cancel();
        }
        if let Some(handle) = self.handle.take() {
            match self.store.unlock(handle) {
                Ok(()) => debug!("Released reindexing lock for cluster '{}'", self.cluster),
                Err(err) => warn!(
                    "Failed to release reindexing lock for cluster '{}': {err}",
                    self.cluster
                ),
            }
        }
    }
}

/// Control handler of one round. Owns the cluster's snapshot until the round completes, at
/// which point the snapshot is handed back through `done`.
struct Round {
    document_type: DocumentType,
    cluster: String,
    store: Arc<dyn ReindexingStore>,
    metric: Arc<dyn Metric>,
    clock: Arc<dyn Clock>,
    state: Mutex<RoundState>,
}

struct RoundState {
    reindexing: Reindexing,
    running: Option<Running>,
    done: Option<oneshot::Sender<Reindexing>>,
}

impl Round {
    fn complete(&self, code: CompletionCode, message: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(running) = state.running.take() else {
            warn!(
                "Ignoring repeated completion ({code:?}) of visit of {}",
                self.document_type
            );
            return;
        };

        let now = truncate_to_ms(self.clock.now());
        let status = match code {
            CompletionCode::Success => {
                info!("Reindexing of {} completed successfully", self.document_type);
                running.successful(now)
            }
            CompletionCode::Failure => {
                warn!("Reindexing of {} failed: {message}", self.document_type);
                running.failed(now, message)
            }
            CompletionCode::Aborted => {
                info!("Reindexing of {} halted: {message}", self.document_type);
                running.halted()
            }
        };

        let percent = percent_done(&status);
        state.reindexing = state
            .reindexing
            .with(self.document_type.clone(), status.clone());
        self.persist(&state.reindexing);
        self.record(status.state(), percent);

        let reindexing = std::mem::take(&mut state.reindexing);
        if let Some(done) = state.done.take() {
            let _ = done.send(reindexing);
        }
    }

    fn persist(&self, reindexing: &Reindexing) {
        if let Err(err) = self.store.write(reindexing) {
            warn!(
                "Failed to persist reindexing status of {}: {err}",
                self.document_type
            );
        }
    }

    fn record(&self, state: State, percent: f64) {
        let dimensions: Dimensions = [
            ("documenttype", self.document_type.name()),
            ("clusterid", self.cluster.as_str()),
            ("state", metric_state_label(state)),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
        self.metric.set(PERCENT_DONE_METRIC, &dimensions, percent);
    }
}

impl ControlHandler for Round {
    fn on_progress(&self, token: ProgressToken) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(running) = state.running.take() else {
            warn!(
                "Ignoring progress of visit of {} after completion",
                self.document_type
            );
            return;
        };

        let percent = token.percent_finished();
        debug!("Reindexing of {} at {percent:.1}%", self.document_type);
        let running = running.progressed(token);
        state.reindexing = state
            .reindexing
            .with(self.document_type.clone(), running.status());
        state.running = Some(running);
        self.persist(&state.reindexing);
        self.record(State::Running, percent);
    }

    fn on_done(&self, code: CompletionCode, message: &str) {
        self.complete(code, message);
    }
}

impl Drop for Round {
    fn drop(&mut self) {
        let pending = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .running
            .is_some();
        if pending {
            warn!(
                "Visit of {} was dropped without reporting completion",
                self.document_type
            );
            self.complete(CompletionCode::Aborted, "session dropped");
        }
    }
}

/// In-flight rounds report as "ready" until they reach a terminal state.
const fn metric_state_label(state: State) -> &'static str {
    match state {
        State::Running => "ready",
        terminal => terminal.label(),
    }
}

fn percent_done(status: &Status) -> f64 {
    match status.state() {
        State::Successful => 100.0,
        _ => status
            .progress()
            .map_or(100.0, ProgressToken::percent_finished),
    }
}
