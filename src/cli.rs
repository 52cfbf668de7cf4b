use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{CacheConfig, SessionConfig};
use crate::logging::Verbosity;

#[derive(Parser, Debug)]
#[command(name = "remotezip")]
#[command(version)]
#[command(about = "List and extract members of remote ZIP archives over HTTP Range requests", long_about = None)]
#[command(after_help = "Examples:\n  \
  remotezip -l https://example.com/archive.zip      list files from remote ZIP\n  \
  remotezip https://example.com/a.zip '*.md' -d out extract matching files into out/\n  \
  remotezip -p https://example.com/a.zip README.md  send one member to stdout\n  \
  remotezip --clear-cache                           remove cached archives")]
pub struct Cli {
    /// ZIP file path or HTTP URL
    #[arg(value_name = "FILE", required_unless_present = "clear_cache")]
    pub file: Option<String>,

    /// Files to extract (default: all)
    #[arg(value_name = "FILES")]
    pub files: Vec<String>,

    /// List files (short format)
    #[arg(short = 'l')]
    pub list: bool,

    /// List verbosely with sizes and dates
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Extract files to pipe, no messages
    #[arg(short = 'p')]
    pub pipe: bool,

    /// Extract files into exdir
    #[arg(short = 'd', value_name = "DIR")]
    pub extract_dir: Option<PathBuf>,

    /// Exclude files that follow
    #[arg(short = 'x', value_name = "FILE", num_args = 1..)]
    pub exclude: Vec<String>,

    /// Never overwrite existing files
    #[arg(short = 'n')]
    pub never_overwrite: bool,

    /// Overwrite files WITHOUT prompting
    #[arg(short = 'o')]
    pub overwrite: bool,

    /// Junk paths (do not make directories)
    #[arg(short = 'j')]
    pub junk_paths: bool,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', action = clap::ArgAction::Count)]
    pub quiet: u8,

    /// Cache directory [default: $XDG_CACHE_HOME/remotezip]
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Keep the cache in memory only
    #[arg(long, conflicts_with = "cache_dir")]
    pub no_cache: bool,

    /// Remove cached archives from the cache directory before doing anything else
    #[arg(long)]
    pub clear_cache: bool,

    /// Per-request timeout in seconds (0 disables it)
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub timeout: u64,

    /// Debug logging
    #[arg(long, conflicts_with = "quiet")]
    pub debug: bool,
}

impl Cli {
    pub fn is_http_url(&self) -> bool {
        self.file
            .as_deref()
            .is_some_and(|f| f.starts_with("http://") || f.starts_with("https://"))
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet > 0 || self.pipe
    }

    pub fn is_very_quiet(&self) -> bool {
        self.quiet > 1
    }

    pub fn verbosity(&self) -> Verbosity {
        if self.debug {
            Verbosity::Debug
        } else if self.is_quiet() {
            Verbosity::Quiet
        } else {
            Verbosity::Normal
        }
    }

    /// Cache root to use, or `None` for a memory-only cache.
    pub fn cache_root(&self) -> Option<PathBuf> {
        if self.no_cache {
            return None;
        }
        Some(self.cache_dir.clone().unwrap_or_else(default_cache_dir))
    }

    pub fn session_config(&self) -> SessionConfig {
        let cache = match self.cache_root() {
            Some(root) => CacheConfig::at(root),
            None => CacheConfig::memory_only(),
        };
        let timeout = (self.timeout > 0).then(|| Duration::from_secs(self.timeout));
        SessionConfig::default().with_cache(cache).with_timeout(timeout)
    }
}

/// Per-user cache location: `$XDG_CACHE_HOME/remotezip`, then
/// `$HOME/.cache/remotezip`, then the system temp directory.
pub fn default_cache_dir() -> PathBuf {
    let non_empty = |name| std::env::var_os(name).filter(|v| !v.is_empty());
    let base = non_empty("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| non_empty("HOME").map(|home| PathBuf::from(home).join(".cache")))
        .unwrap_or_else(std::env::temp_dir);
    base.join("remotezip")
}
