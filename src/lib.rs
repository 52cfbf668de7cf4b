//! # remotezip
//!
//! Browse a remote ZIP archive and fetch single members of it over HTTP
//! Range requests, without downloading the whole file.
//!
//! Listing an archive normally costs one request for its tail, which holds
//! the End of Central Directory record and the central directory. Each
//! entry then costs one request for its local header and compressed bytes
//! (more when it is larger than the configured segment size). Directories
//! and decompressed entries are kept in a two-tier memory + disk cache, so a
//! later session against the same URL can skip the network entirely.
//!
//! ## Features
//!
//! - ZIP64 archives and archives with prepended data
//! - STORED and DEFLATE entries, verified against their CRC-32
//! - Servers without range support (the archive is then downloaded once)
//! - Pausable, resumable and cancellable entry downloads
//! - Local files through the same interface
//!
//! ## Example
//!
//! ```no_run
//! use remotezip::{ArchiveSession, CacheConfig, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SessionConfig::default().with_cache(CacheConfig::at("/tmp/remotezip"));
//!     let session = ArchiveSession::open("https://example.com/archive.zip", config)?;
//!
//!     let directory = session.load_directory().await?;
//!     for (name, size) in directory.listing() {
//!         println!("{size:>10}  {name}");
//!     }
//!
//!     let readme = session.load_entry("README.md").await?;
//!     println!("{}", String::from_utf8_lossy(&readme));
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod io;
pub mod logging;
pub mod session;
pub mod zip;

pub use cache::{CacheKey, CacheLayer, CacheStore, Tier};
pub use cli::Cli;
pub use config::{CacheConfig, SessionConfig};
pub use error::{Error, ErrorKind, Result};
pub use io::{ByteRange, HttpRangeSource, LocalFileSource, MemorySource, RangeResponse, RangeSource};
pub use session::{ArchiveSession, SessionState};
pub use zip::{ArchiveDirectory, CompressionMethod, DownloadTask, TaskState, ZipEntry};
