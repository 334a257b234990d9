use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cluster_reindexer::{
    DocumentType, FileReindexingStore, ReindexerConfig, ReindexingStore, Status,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_CONFIG: &str = "reindexer.toml";

#[derive(Debug, Parser)]
#[command(name = "reindexer", version, about = "Inspect reindexing state of a content cluster")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the reindexing status of each document type
    Status(StatusArgs),
    /// Show who holds the store lock
    LockInfo(LockInfoArgs),
    /// Forcibly release the store lock, e.g. after a controller crashed
    Unlock(StoreArgs),
}

#[derive(Debug, Args)]
pub struct StoreArgs {
    /// Reindexer config naming the cluster and its store [default: reindexer.toml]
    #[arg(long, conflicts_with = "store")]
    pub config: Option<PathBuf>,

    /// Snapshot file of the store, bypassing the config
    #[arg(long)]
    pub store: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Print the raw snapshot as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct LockInfoArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long)]
    pub json: bool,
}

/// Store to operate on, plus the not-before instants when it came from a config.
struct Target {
    store: FileReindexingStore,
    ready_at: BTreeMap<DocumentType, SystemTime>,
}

impl StoreArgs {
    fn open(&self) -> Result<Target> {
        if let Some(path) = &self.store {
            let cluster = path
                .file_stem()
                .map_or_else(|| "unknown".to_string(), |stem| stem.to_string_lossy().into_owned());
            return Ok(Target {
                store: FileReindexingStore::new(cluster, path.clone()),
                ready_at: BTreeMap::new(),
            });
        }

        let path = self
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
        let config = ReindexerConfig::load(&path)
            .with_context(|| format!("failed to load config {}", path.display()))?;
        log::debug!(
            "Using store {} of cluster '{}'",
            config.store_path.display(),
            config.cluster.name
        );
        Ok(Target {
            store: FileReindexingStore::new(config.cluster.name.clone(), config.store_path.clone())
                .with_stale_after(config.lock_stale_after()),
            ready_at: config.ready_at(),
        })
    }
}

pub fn status(args: &StatusArgs) -> Result<()> {
    let target = args.store.open()?;
    let reindexing = target
        .store
        .read()
        .with_context(|| format!("failed to read {}", target.store.path().display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reindexing)?);
        return Ok(());
    }

    let pending: Vec<_> = target
        .ready_at
        .iter()
        .filter(|(document_type, _)| reindexing.status(document_type).is_none())
        .collect();
    if reindexing.is_empty() && pending.is_empty() {
        println!("No reindexing recorded in {}", target.store.path().display());
        return Ok(());
    }

    for (document_type, status) in reindexing.iter() {
        println!("{}", describe(document_type, status));
    }
    for (document_type, not_before) in pending {
        println!(
            "{document_type}: not started, due at {}",
            unix_ms(*not_before)
        );
    }
    Ok(())
}

pub fn lock_info(args: &LockInfoArgs) -> Result<()> {
    let target = args.store.open()?;
    let info = target.store.lock_info()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    match info {
        Some(info) => {
            let silent_ms = unix_ms(SystemTime::now()).saturating_sub(info.last_seen_unix_ms());
            println!(
                "Locked by {} since {}, {} renewal(s), last seen {silent_ms}ms ago",
                info.owner, info.acquired_at_unix_ms, info.renewals
            );
        }
        None => println!("Not locked: {}", display(target.store.lock_path())),
    }
    Ok(())
}

pub fn unlock(args: &StoreArgs) -> Result<()> {
    let target = args.open()?;
    let holder = target.store.lock_info().ok().flatten();
    if target.store.force_unlock()? {
        match holder {
            Some(info) => println!("Removed lock held by {}", info.owner),
            None => println!("Removed lock {}", display(target.store.lock_path())),
        }
    } else {
        println!("Not locked: {}", display(target.store.lock_path()));
    }
    Ok(())
}

fn describe(document_type: &DocumentType, status: &Status) -> String {
    let mut line = format!(
        "{document_type}: {} (ready at {}",
        status.state(),
        unix_ms(status.ready_at())
    );
    if let Some(completed_at) = status.completed_at() {
        line.push_str(&format!(", completed at {}", unix_ms(completed_at)));
    }
    if let Some(progress) = status.progress() {
        line.push_str(&format!(", {:.1}% done", progress.percent_finished()));
    }
    line.push(')');
    if let Some(message) = status.message() {
        line.push_str(&format!(": {message}"));
    }
    line
}

fn unix_ms(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|since| u64::try_from(since.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_reindexer::ProgressToken;
    use std::time::Duration;

    fn at(ms: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(ms)
    }

    #[test]
    fn describes_each_state() {
        let music = DocumentType::new("music");
        let running = Status::ready(at(10))
            .running()
            .progressed(ProgressToken::with_buckets(1, 4));

        assert_eq!(
            describe(&music, &running.status()),
            "music: running (ready at 10, 25.0% done)"
        );
        assert_eq!(
            describe(&music, &running.clone().failed(at(20), "Error")),
            "music: failed (ready at 10, completed at 20, 25.0% done): Error"
        );
        assert_eq!(
            describe(&music, &running.successful(at(30))),
            "music: successful (ready at 10, completed at 30)"
        );
    }

    #[test]
    fn config_and_store_are_exclusive() {
        let parsed = Cli::try_parse_from([
            "reindexer", "status", "--config", "a.toml", "--store", "b.json",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn store_file_names_the_cluster() {
        let args = StoreArgs {
            config: None,
            store: Some(PathBuf::from("/var/lib/music.json")),
        };
        let target = args.open().unwrap();
        assert_eq!(target.store.path(), Path::new("/var/lib/music.json"));
        assert!(target.ready_at.is_empty());
    }
}
