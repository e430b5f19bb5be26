// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Serial COBS datagram logging and zero-copy shared-memory fanout.
//!
//! `cobsfan` ingests COBS-framed datagrams from a serial device, stamps each
//! with an arrival header, appends them to rolling files on fast local
//! storage, and simultaneously republishes them to any number of same-host
//! subscribers through a lock-free shared-memory ring. Think udp multicast
//! to localhost, but zero copy, and with no chance of a slow or crashed
//! subscriber blocking the writer or other subscribers.
//!
//! ```text
//! serial bytes -> cobs decode -> [header|payload|pad] in ring slot
//!                                       |-> subscribers (RingReader)
//!                                       '-> rolling .bin files
//! ```
//!
//! # Subscribing
//!
//! ```no_run
//! use cobsfan::shm::{Recv, RingReader, ShmError, SEGMENT_NAME};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), ShmError> {
//!     let Some(mut reader) = RingReader::attach(SEGMENT_NAME)? else {
//!         return Ok(()); // no live writer
//!     };
//!     loop {
//!         match reader.recv() {
//!             Recv::Payload(frame) => {
//!                 let result = frame.len(); // consume the view
//!                 if reader.kept_up() {
//!                     println!("{result}");
//!                 } // else: discard, the writer lapped us mid-read
//!             }
//!             Recv::Overrun => reader.skip_to_tail(), // slots lost, resume
//!             Recv::Empty => {
//!                 if reader.eof() {
//!                     break;
//!                 }
//!                 std::thread::sleep(Duration::from_millis(1));
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod cobs;
pub mod frame;
pub mod pipeline;
pub mod rotation;
pub mod serial;
pub mod shm;

pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD};
pub use pipeline::{
    BlockingReader, Clock, CobsSource, FrameSource, Pipeline, PipelineError, ReplaySource,
    SystemClock,
};
pub use shm::{Recv, RingReader, RingWriter, ShmError, DEFAULT_RING_CAPACITY, SEGMENT_NAME};
