// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! cobsfan-ingest - COBS datagrams from a serial device to shared memory
//! and rolling log files.
//!
//! Usage:
//!   cobsfan-ingest /dev/ttyUSB0,115200 /dev/shm/staging
//!   cobsfan-ingest /dev/ttyACM0
//!
//! Stdout carries exactly one line per closed log file: its path, intended
//! to be piped to a downstream mover (`... | xargs -n1 mv -t /final`).
//! Everything else goes to stderr. Omitting the staging directory disables
//! logging; fanout still runs.

use anyhow::Context;
use clap::Parser;
use cobsfan::frame::{HEADER_SIZE, MAX_PAYLOAD};
use cobsfan::pipeline::{BlockingReader, CobsSource, Pipeline};
use cobsfan::serial;
use cobsfan::shm::{RingWriter, DEFAULT_RING_CAPACITY, SEGMENT_NAME};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cobsfan-ingest")]
#[command(about = "Log and fan out COBS-framed datagrams arriving on serial")]
#[command(version)]
struct Args {
    /// Serial device, optionally with a baud rate (`/dev/ttyUSB0,115200`)
    endpoint: String,

    /// Staging directory for rotated log files. Must be fast volatile
    /// storage (tmpfs), not an sd card; omit to disable logging.
    staging_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Quiet mode (minimal output)
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Diagnostics on stderr; stdout belongs to the closed-file control
    // output.
    let filter = args.log_level.parse().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if !args.quiet {
        info!("cobsfan-ingest v{}", env!("CARGO_PKG_VERSION"));
        info!("serial endpoint: {}", args.endpoint);
        match &args.staging_dir {
            Some(dir) => info!("output files will be staged in {}", dir.display()),
            None => info!("logging is disabled"),
        }
    }

    let endpoint = serial::parse_endpoint(&args.endpoint)?;

    let ring = RingWriter::create(SEGMENT_NAME, DEFAULT_RING_CAPACITY, HEADER_SIZE + MAX_PAYLOAD)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let latch = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        latch.store(true, Ordering::SeqCst);
    })?;

    // Give simultaneously-started subscribers a chance to attach before the
    // first frame is published.
    std::thread::sleep(Duration::from_millis(200));

    let port = serial::open(&endpoint)?;
    let mut source = CobsSource::new(BlockingReader::new(port, Arc::clone(&shutdown)));

    let mut pipeline = Pipeline::new(ring, shutdown);
    if let Some(dir) = args.staging_dir {
        // The control output promises absolute paths.
        let dir = dir
            .canonicalize()
            .with_context(|| format!("staging directory {}", dir.display()))?;
        pipeline = pipeline.with_staging_dir(dir);
    }

    pipeline.run(&mut source)?;

    if !args.quiet {
        info!("exiting");
    }
    Ok(())
}
