// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Serial endpoint parsing and port setup.
//!
//! An endpoint is `path[,baud]`, e.g. `/dev/ttyUSB0,115200`. The port is
//! opened in raw 8N1 mode with no flow control and DTR raised; the upstream
//! device is expected to hold off transmitting until it sees DTR high, and
//! to reset itself when DTR drops (which happens automatically when this
//! process exits).
//!
//! Reads carry a short timeout so the ingest loop can poll its shutdown
//! latch; wrap the port in
//! [`BlockingReader`](crate::pipeline::BlockingReader) to get blocking
//! semantics back.

use serialport::{ClearBuffer, FlowControl, SerialPort};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Baud rates this tool accepts.
pub const RECOGNIZED_BAUDS: [u32; 10] = [
    2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600,
];

/// Baud rate used when the endpoint does not name one.
pub const DEFAULT_BAUD: u32 = 115200;

/// Receive timeout; the ingest loop polls its shutdown latch at this cadence.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Errors from endpoint parsing and port setup.
#[derive(Debug, Error)]
pub enum SerialError {
    /// The endpoint names a baud rate outside the recognized set.
    #[error("baud rate {0} not supported")]
    UnsupportedBaud(String),

    /// Opening or configuring the port failed.
    #[error("serial port: {0}")]
    Port(#[from] serialport::Error),
}

/// A parsed `path[,baud]` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialEndpoint {
    pub path: String,
    pub baud: Option<u32>,
}

/// Parse an endpoint string, validating any baud rate against
/// [`RECOGNIZED_BAUDS`].
///
/// # Errors
///
/// Returns [`SerialError::UnsupportedBaud`] for an unparseable or
/// unrecognized rate.
pub fn parse_endpoint(endpoint: &str) -> Result<SerialEndpoint, SerialError> {
    match endpoint.split_once(',') {
        None => Ok(SerialEndpoint {
            path: endpoint.to_string(),
            baud: None,
        }),
        Some((path, baud_text)) => {
            let baud: u32 = baud_text
                .parse()
                .map_err(|_| SerialError::UnsupportedBaud(baud_text.to_string()))?;
            if !RECOGNIZED_BAUDS.contains(&baud) {
                return Err(SerialError::UnsupportedBaud(baud_text.to_string()));
            }
            Ok(SerialEndpoint {
                path: path.to_string(),
                baud: Some(baud),
            })
        }
    }
}

/// Open the endpoint's device ready for framed ingest: raw 8N1, no flow
/// control, DTR raised, stale receive data discarded.
///
/// # Errors
///
/// Any open or configuration failure is fatal to startup.
pub fn open(endpoint: &SerialEndpoint) -> Result<Box<dyn SerialPort>, SerialError> {
    let baud = endpoint.baud.unwrap_or_else(|| {
        info!("no baud rate given, using {DEFAULT_BAUD}");
        DEFAULT_BAUD
    });

    let mut port = serialport::new(endpoint.path.as_str(), baud)
        .flow_control(FlowControl::None)
        .timeout(READ_TIMEOUT)
        .open()?;

    port.write_data_terminal_ready(true)?;
    port.clear(ClearBuffer::All)?;

    Ok(port)
}
