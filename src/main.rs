//! Command-line front end: list a remote (or local) archive and extract
//! selected members through an [`ArchiveSession`].

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use remotezip::{ArchiveSession, CacheConfig, CacheStore, Cli, LocalFileSource, ZipEntry, logging};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // reqwest's rustls backend needs a process-wide crypto provider.
    let _ = rustls::crypto::ring::default_provider().install_default();
    if let Err(err) = logging::init(cli.verbosity()) {
        eprintln!("logging disabled: {err}");
    }

    if cli.clear_cache {
        if let Some(root) = cli.cache_root() {
            CacheStore::new(&CacheConfig::at(&root))
                .clear_all()
                .await
                .with_context(|| format!("clearing cache at {}", root.display()))?;
            if !cli.is_quiet() {
                eprintln!("Cleared cache: {}", root.display());
            }
        }
    }

    let Some(file) = cli.file.as_deref() else {
        return Ok(());
    };

    let config = cli.session_config();
    let session = if cli.is_http_url() {
        ArchiveSession::open(file, config)?
    } else {
        let path = Path::new(file);
        let source = LocalFileSource::new(path)?;
        // Local archives are keyed by absolute path so the cache tells them apart.
        let absolute = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        ArchiveSession::new(
            format!("file://{}", absolute.display()),
            Arc::new(source),
            config,
        )
    };

    let result = process_zip(&session, &cli).await;

    // Display network transfer statistics for HTTP sources
    if cli.is_http_url() && !cli.is_quiet() {
        eprintln!(
            "\nTotal bytes transferred: {}",
            format_size(session.transferred_bytes())
        );
    }

    result
}

async fn process_zip(session: &ArchiveSession, cli: &Cli) -> Result<()> {
    let directory = session
        .load_directory()
        .await
        .context("reading the central directory")?;

    if cli.list || cli.verbose {
        list_files(&directory.entries, cli.verbose);
        return Ok(());
    }

    let selected: Vec<&ZipEntry> = directory
        .entries
        .iter()
        .filter(|e| !e.is_directory() && is_selected(&e.path, cli))
        .collect();

    if selected.is_empty() && !cli.files.is_empty() {
        bail!("no archive members match {}", cli.files.join(" "));
    }

    // A failed entry does not stop the others.
    let show_filename = cli.pipe && selected.len() > 1;
    let mut failed = 0usize;
    for entry in &selected {
        if let Err(err) = extract_file(session, entry, cli, show_filename).await {
            failed += 1;
            if !cli.is_very_quiet() {
                eprintln!("error: {}: {err:#}", entry.path);
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} files could not be extracted", selected.len());
    }
    Ok(())
}

/// Positional arguments select members (exact path, base name or glob);
/// `-x` patterns remove them again.
fn is_selected(path: &str, cli: &Cli) -> bool {
    if !cli.files.is_empty() {
        let matches = cli.files.iter().any(|f| {
            if has_glob_chars(f) {
                glob_match(f, path)
            } else {
                path == f.as_str() || base_name(path) == f.as_str()
            }
        });
        if !matches {
            return false;
        }
    }

    !cli
        .exclude
        .iter()
        .any(|x| path.contains(x.as_str()) || glob_match(x, path))
}

fn list_files(entries: &[ZipEntry], verbose: bool) {
    if !verbose {
        for entry in entries {
            println!("{}", entry.path);
        }
        return;
    }

    println!(
        "{:>10}  {:>10}  {:>5}  {:>10}  {:>5}  Name",
        "Length", "Size", "Cmpr", "Date", "Time"
    );
    println!("{}", "-".repeat(70));

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;
    let mut file_count = 0usize;

    for entry in entries {
        let (year, month, day) = entry.mod_date();
        let (hour, minute, _second) = entry.mod_time();
        println!(
            "{:>10}  {:>10}  {}  {:04}-{:02}-{:02}  {:02}:{:02}  {}",
            entry.uncompressed_size,
            entry.compressed_size,
            ratio(entry.compressed_size, entry.uncompressed_size),
            year,
            month,
            day,
            hour,
            minute,
            entry.path
        );

        if !entry.is_directory() {
            total_uncompressed += entry.uncompressed_size;
            total_compressed += entry.compressed_size;
            file_count += 1;
        }
    }

    println!("{}", "-".repeat(70));
    println!(
        "{:>10}  {:>10}  {}  {:>21}  {} files",
        total_uncompressed,
        total_compressed,
        ratio(total_compressed, total_uncompressed),
        "",
        file_count
    );
}

/// Space saved by compression, as a right-aligned percentage.
fn ratio(compressed: u64, uncompressed: u64) -> String {
    let saved = if uncompressed == 0 || compressed >= uncompressed {
        0
    } else {
        100 - compressed * 100 / uncompressed
    };
    format!("{saved:>4}%")
}

async fn extract_file(
    session: &ArchiveSession,
    entry: &ZipEntry,
    cli: &Cli,
    show_filename: bool,
) -> Result<()> {
    if cli.pipe {
        let data = session.load_entry(&entry.path).await?;
        let mut stdout = tokio::io::stdout();
        if show_filename {
            stdout
                .write_all(format!("--- {} ---\n", entry.path).as_bytes())
                .await?;
        }
        stdout.write_all(&data).await?;
        stdout.flush().await?;
        return Ok(());
    }

    let Some(output_path) = output_path(&entry.path, cli) else {
        warn!(path = %entry.path, "skipping member with an unsafe path");
        return Ok(());
    };

    if output_path.exists() {
        if cli.never_overwrite {
            if !cli.is_quiet() {
                eprintln!("Skipping: {} (file exists)", entry.path);
            }
            return Ok(());
        }
        if !cli.overwrite {
            if !cli.is_quiet() {
                eprintln!("Skipping: {} (use -o to overwrite)", entry.path);
            }
            return Ok(());
        }
    }

    if !cli.is_quiet() {
        println!("  extracting: {}", entry.path);
    }

    let data = session.load_entry(&entry.path).await?;
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    tokio::fs::write(&output_path, &data[..])
        .await
        .with_context(|| format!("writing {}", output_path.display()))?;
    Ok(())
}

/// Where a member lands on disk. `None` for names that would escape the
/// extraction directory.
fn output_path(member: &str, cli: &Cli) -> Option<PathBuf> {
    let relative = if cli.junk_paths {
        PathBuf::from(base_name(member))
    } else {
        PathBuf::from(member)
    };
    if relative.as_os_str().is_empty()
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return None;
    }

    Some(match &cli.extract_dir {
        Some(dir) => dir.join(relative),
        None => relative,
    })
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn has_glob_chars(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Glob matching with `*` (any run of characters) and `?` (one character).
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern_chars: Vec<char> = pattern.chars().collect();
    let text_chars: Vec<char> = text.chars().collect();

    fn do_match(pattern: &[char], text: &[char]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                do_match(&pattern[1..], text) || (!text.is_empty() && do_match(pattern, &text[1..]))
            }
            (Some('?'), Some(_)) => do_match(&pattern[1..], &text[1..]),
            (Some(p), Some(t)) if *p == *t => do_match(&pattern[1..], &text[1..]),
            _ => false,
        }
    }

    do_match(&pattern_chars, &text_chars)
}

/// Format a byte size into a human-readable string.
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
