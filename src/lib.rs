pub mod sluice;
#[cfg(test)]
mod tests;

pub use crate::sluice::*;

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

pub fn init_tracing(max_level: Level) {
    let subscriber = FmtSubscriber::builder()
        // all spans/events with a level higher than TRACE (e.g, debug, info, warn, etc.)
        // will be written to stderr.
        .with_max_level(max_level)
        .with_writer(io::stderr)
        // completes the builder.
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");
}

/// Daemon mode: the terminal is gone, so events go to a log file instead.
pub fn init_tracing_to_file(max_level: Level, path: &Path) -> io::Result<()> {
    let file = File::options().create(true).append(true).open(path)?;
    let subscriber = FmtSubscriber::builder()
        .with_max_level(max_level)
        .with_ansi(false)
        .with_writer(Arc::new(file))
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");
    Ok(())
}
