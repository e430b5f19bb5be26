// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! cobsfan-replay - republish recorded frames from stdin to shared memory.
//!
//! Usage:
//!   cobsfan-replay < 20240115T143020Z.bin
//!   cat *.bin | cobsfan-replay /dev/shm/staging
//!
//! Consumes the on-disk record format (8-byte header, payload, zero padding
//! to 8 bytes) instead of a serial device; recorded timestamps are carried
//! through unchanged, so subscribers and any re-logged files see the
//! original arrival times.

use anyhow::Context;
use clap::Parser;
use cobsfan::frame::{HEADER_SIZE, MAX_PAYLOAD};
use cobsfan::pipeline::{BlockingReader, Pipeline, ReplaySource};
use cobsfan::shm::{RingWriter, DEFAULT_RING_CAPACITY, SEGMENT_NAME};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cobsfan-replay")]
#[command(about = "Fan out pre-decoded frames from stdin")]
#[command(version)]
struct Args {
    /// Staging directory for re-logged rotated files; omit to disable
    /// logging.
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

    let filter = args.log_level.parse().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if !args.quiet {
        info!("cobsfan-replay v{}", env!("CARGO_PKG_VERSION"));
    }

    let ring = RingWriter::create(SEGMENT_NAME, DEFAULT_RING_CAPACITY, HEADER_SIZE + MAX_PAYLOAD)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let latch = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        latch.store(true, Ordering::SeqCst);
    })?;

    // Same attach grace as the serial path.
    std::thread::sleep(Duration::from_millis(200));

    let stdin = std::io::stdin().lock();
    let mut source = ReplaySource::new(BlockingReader::new(stdin, Arc::clone(&shutdown)));

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
