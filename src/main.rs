//! Main entry point for the unzip-relay CLI application.
//!
//! Extracts one archive from object storage into object storage, or lists
//! its entries with `-l`.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use unzip_relay::zip::ArchiveEntry;
use unzip_relay::{Cli, FsObjectStore, HttpObjectStore, ObjectStore, RunSummary, Unzipper};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_directive())))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(&cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", unzip_relay::describe_error(&e));
            ExitCode::FAILURE
        }
    }
}

/// Run the requested mode. Returns whether every entry was handled.
async fn run(cli: &Cli) -> Result<bool> {
    let config = cli.to_config()?;
    let store = build_store(cli)?;
    let unzipper = Arc::new(Unzipper::new(config, store));

    if cli.list {
        let entries = unzipper.list().await?;
        list_files(&entries, cli.verbose);
        return Ok(true);
    }

    // Ctrl-C stops scheduling and closes the archive; streams already open finish.
    let on_signal = unzipper.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, cancelling");
            on_signal.cancel();
        }
    });

    let records = unzipper.run().await?;
    let summary = RunSummary::from_records(&records);
    if !cli.is_very_quiet() {
        print!("{summary}");
    }
    if !cli.is_quiet() {
        let bytes: u64 = records
            .iter()
            .filter_map(|r| r.result.as_ref())
            .map(|u| u.bytes)
            .sum();
        eprintln!("\nTotal bytes uploaded: {}", format_size(bytes));
    }
    Ok(!summary.failed())
}

fn build_store(cli: &Cli) -> Result<Arc<dyn ObjectStore>> {
    if let Some(root) = &cli.local_root {
        return Ok(Arc::new(FsObjectStore::new(root)));
    }

    let endpoint = cli
        .endpoint
        .as_deref()
        .context("either --endpoint or --local-root is required")?;
    let mut store = HttpObjectStore::new(endpoint)?;
    if let Some((name, value)) = cli.auth_header()? {
        store = store.with_header(name, value)?;
    }
    Ok(Arc::new(store))
}

/// Print archive entries.
///
/// Without `verbose`, one name per line. With it, a table with sizes,
/// compression ratio, timestamp and the charset each name was decoded with.
fn list_files(entries: &[ArchiveEntry], verbose: bool) {
    if verbose {
        println!(
            "{:>10}  {:>10}  {:>5}  {:>10}  {:>5}  {:<12}  Name",
            "Length", "Size", "Cmpr", "Date", "Time", "Charset"
        );
        println!("{}", "-".repeat(84));
    }

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;
    let mut file_count = 0usize;

    for entry in entries {
        if !verbose {
            println!("{}", entry.name);
            continue;
        }

        let header = &entry.header;
        let (year, month, day) = header.mod_date();
        let (hour, minute, _second) = header.mod_time();
        println!(
            "{:>10}  {:>10}  {}  {:04}-{:02}-{:02}  {:02}:{:02}  {:<12}  {}",
            header.uncompressed_size,
            header.compressed_size,
            ratio(header.compressed_size, header.uncompressed_size),
            year,
            month,
            day,
            hour,
            minute,
            entry.charset.encoding,
            entry.name
        );

        if !entry.is_directory {
            total_uncompressed += header.uncompressed_size;
            total_compressed += header.compressed_size;
            file_count += 1;
        }
    }

    if verbose {
        println!("{}", "-".repeat(84));
        println!(
            "{:>10}  {:>10}  {}  {:>35}  {} files",
            total_uncompressed,
            total_compressed,
            ratio(total_compressed, total_uncompressed),
            "",
            file_count
        );
    }
}

/// Percentage saved by compression, right-aligned to five columns.
fn ratio(compressed: u64, uncompressed: u64) -> String {
    if uncompressed > 0 && compressed <= uncompressed {
        format!("{:>4}%", 100 - compressed * 100 / uncompressed)
    } else {
        "  0%".to_string()
    }
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
