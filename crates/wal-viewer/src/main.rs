//! Command-line inspector for tusk write-ahead logs.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tabled::{Table, Tabled, settings::Style};
use wal::FrameSummary;

#[derive(Parser, Debug)]
#[command(name = "wal-viewer", about = "Inspect a tusk write-ahead log")]
struct Args {
    /// Path to the `-wal` file.
    wal_path: PathBuf,
    /// Only show frames for this 1-based page number.
    #[arg(long)]
    page: Option<u32>,
    /// Skip this many frames before printing.
    #[arg(long, default_value_t = 0)]
    offset: usize,
    /// Print at most this many frames.
    #[arg(long)]
    limit: Option<usize>,
    /// Skip the header summary and print only the frame table.
    #[arg(long)]
    frames_only: bool,
}

#[derive(Tabled)]
struct FrameRow {
    frame: usize,
    page: u32,
    kind: &'static str,
    db_size: u32,
}

impl FrameRow {
    fn new(index: usize, frame: &FrameSummary) -> Self {
        Self {
            frame: index,
            page: frame.page_no,
            kind: if frame.is_commit() { "commit" } else { "frame" },
            db_size: frame.db_size_after_commit,
        }
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let summary = wal::inspect(&args.wal_path)
        .with_context(|| format!("failed to read log at {}", args.wal_path.display()))?;

    if !args.frames_only {
        println!("page size:           {}", summary.page_size);
        println!("checkpoint sequence: {}", summary.checkpoint_seq);
        println!(
            "salts:               {:#010x} {:#010x}",
            summary.salt1, summary.salt2
        );
        println!("valid frames:        {}", summary.frames.len());
        println!();
    }

    let rows: Vec<FrameRow> = summary
        .frames
        .iter()
        .enumerate()
        .map(|(i, frame)| (i + 1, frame))
        .filter(|(_, frame)| args.page.is_none_or(|p| frame.page_no == p))
        .skip(args.offset)
        .take(args.limit.unwrap_or(usize::MAX))
        .map(|(i, frame)| FrameRow::new(i, frame))
        .collect();

    if rows.is_empty() {
        println!("no matching frames");
        return Ok(());
    }

    println!("{}", Table::new(rows).with(Style::rounded()));
    Ok(())
}
