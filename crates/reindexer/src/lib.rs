//! # Cluster Reindexer
//!
//! Rewrites the stored documents of a content cluster, one document type at a time, whenever a
//! type's configured not-before instant moves past its last reindexing round.
//!
//! ## Pass
//!
//! ```text
//! reindex()
//!     │
//!     ├──> Store lock (bounded wait)
//!     │      └─> Reindexing snapshot
//!     │
//!     ├──> Due set (not-before passed, after last round start)
//!     │
//!     └──> For each due type, in name order
//!            ├─> persist RUNNING
//!            ├─> visit session ──progress──> persist + percent-done gauge
//!            └─> completion ──> persist SUCCESSFUL | FAILED | HALTED
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use cluster_reindexer::{
//!     InMemoryMetric, FileReindexingStore, Reindexer, ReindexerConfig, SessionHandle,
//!     SystemClock, VisitorParameters,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> cluster_reindexer::Result<()> {
//!     let config = ReindexerConfig::load(Path::new("reindexer.toml"))?;
//!     let store = FileReindexingStore::new(config.cluster.name.clone(), config.store_path.clone());
//!     let sessions = |parameters: VisitorParameters| {
//!         // Hand the parameters to the document visiting client here.
//!         SessionHandle::new(move || drop(parameters))
//!     };
//!     let reindexer = Reindexer::from_config(
//!         &config,
//!         Arc::new(store),
//!         Arc::new(sessions),
//!         Arc::new(InMemoryMetric::new()),
//!         Arc::new(SystemClock),
//!     )?;
//!     reindexer.reindex().await
//! }
//! ```

mod clock;
mod cluster;
mod config;
mod error;
mod file_store;
mod maintainer;
mod metrics;
mod reindexer;
mod status;
mod store;
mod visiting;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster::Cluster;
pub use config::ReindexerConfig;
pub use error::{ReindexerError, Result};
pub use file_store::{FileReindexingStore, LockInfo, DEFAULT_LOCK_STALE_AFTER};
pub use maintainer::{MaintainerHealth, ReindexingMaintainer};
pub use metrics::{Dimensions, InMemoryMetric, Metric, PrometheusMetric, PERCENT_DONE_METRIC};
pub use reindexer::{Reindexer, DEFAULT_LOCK_TIMEOUT};
pub use status::{DocumentType, Ready, Reindexing, Running, State, Status};
pub use store::{InMemoryReindexingStore, LockHandle, ReindexingStore};
pub use visiting::{
    CompletionCode, ControlHandler, Priority, ProgressToken, SessionHandle, VisitorControl,
    VisitorParameters, VisitorSessionFactory,
};
