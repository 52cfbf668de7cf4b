//! ZIP format handling over ranged reads.
//!
//! ## Architecture
//!
//! - [`structures`]: on-disk records (EOCD, ZIP64 records, file headers) and
//!   the parsed [`ArchiveDirectory`]
//! - [`parser`]: byte-level parsing of those records
//! - [`directory`]: locates and fetches the central directory with as few
//!   range requests as possible
//! - [`download`]: segmented, pausable download of a single entry
//!
//! ## ZIP Format Overview
//!
//! A ZIP file consists of:
//! 1. Local file headers and compressed data for each file
//! 2. Central Directory with metadata for all files
//! 3. End of Central Directory (EOCD) record at the end
//!
//! The EOCD is read first, from the tail of the archive, then the Central
//! Directory. Listing an archive therefore costs one request in the common
//! case, and each entry costs a request for its local header and payload.
//!
//! ## Supported Features
//!
//! - ZIP64 extensions for archives and entries > 4GB
//! - Archives with prepended data (self-extractor stubs)
//! - STORED and DEFLATE compression methods
//!
//! ## Limitations
//!
//! - No encryption support
//! - No multi-disk archive support
//! - No BZIP2, LZMA, or other compression methods

pub mod directory;
pub mod download;
pub mod parser;
pub mod structures;

pub use directory::{DirectoryFetcher, FetchedDirectory};
pub use download::{DownloadTask, EntryDownloader, TaskHandle, TaskState};
pub use structures::*;
