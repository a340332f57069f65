use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use std::fs::OpenOptions;
use std::path::Path;

use crate::process;

/// Log to stderr, level from RUST_LOG (default warn). Used by one-shot commands.
pub fn init_stderr() {
    let _ = Builder::from_env(Env::default().default_filter_or("warn")).try_init();
}

/// Log to `path`, level from RUST_LOG (default info). Used while the
/// dashboard owns the terminal.
pub fn init_file(path: &Path, max_bytes: u64) -> Result<()> {
    process::rotate_log(path, max_bytes);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    Builder::from_env(Env::default().default_filter_or("info"))
        .target(Target::Pipe(Box::new(file)))
        .format_timestamp_secs()
        .try_init()
        .context("logger already initialized")
}
