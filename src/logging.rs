//! Log output for the command-line tool.
//!
//! The library only emits `tracing` events; installing a subscriber is up to
//! the embedding application. The binary calls [`init`].

use std::io::{self, IsTerminal};
use tracing_subscriber::Layer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Verbosity requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Debug,
}

impl Verbosity {
    pub fn level(self) -> LevelFilter {
        match self {
            Verbosity::Quiet => LevelFilter::WARN,
            Verbosity::Normal => LevelFilter::INFO,
            Verbosity::Debug => LevelFilter::DEBUG,
        }
    }
}

/// Install a stderr subscriber. Stdout stays free for `-p` output.
///
/// Fails if a global subscriber is already set.
pub fn init(verbosity: Verbosity) -> Result<(), tracing_subscriber::util::TryInitError> {
    let layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(verbosity == Verbosity::Debug)
        .with_ansi(io::stderr().is_terminal())
        .without_time()
        .with_filter(verbosity.level());

    tracing_subscriber::registry().with(layer).try_init()
}
