//! Reindexer CLI
//!
//! Inspects and repairs the state a file-backed reindexing store keeps on disk.
//!
//! ```text
//! reindexer status [--config FILE | --store FILE] [--json]
//! reindexer lock-info [--config FILE | --store FILE] [--json]
//! reindexer unlock [--config FILE | --store FILE]
//! ```

use anyhow::Result;
use clap::Parser;

mod command;

use command::{Cli, Command};

fn main() -> Result<()> {
    // stdout carries command output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Status(args) => command::status(&args),
        Command::LockInfo(args) => command::lock_info(&args),
        Command::Unlock(args) => command::unlock(&args),
    }
}
