//! USB serial transport.
//!
//! The port is opened raw (8N1, no flow control, no echo, no line
//! buffering) so that bare 3-byte tokens arrive as soon as they are
//! written. The right device is picked by the `"correct port"` probe.

use std::path::{Path, PathBuf};

use tokio::io::WriteHalf;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use super::stream::{StreamOptions, StreamTransport};
use super::Transport;
use crate::error::{CandyError, Result};

/// Serial device transport.
pub type SerialTransport = StreamTransport<WriteHalf<SerialStream>>;

/// Line rate used when none is configured
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Device name prefixes kept by [`default_candidates`].
const DEVICE_PREFIXES: &[&str] = &["ttyACM", "ttyUSB", "cu.usbmodem"];

/// Open a serial device in raw 8N1 mode.
pub async fn open_serial(
    path: impl AsRef<Path>,
    baud_rate: u32,
    options: StreamOptions,
) -> Result<SerialTransport> {
    let path = path.as_ref();
    let port = tokio_serial::new(path.to_string_lossy(), baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .open_native_async()
        .map_err(|e| CandyError::Transport(format!("Failed to open {}: {e}", path.display())))?;
    tracing::debug!(port = %path.display(), baud_rate, "Serial port opened");
    Ok(StreamTransport::new("serial", port, options))
}

/// Serial ports the system reports, narrowed to USB-style device names.
pub fn default_candidates() -> Vec<PathBuf> {
    let ports = match tokio_serial::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            tracing::debug!(error = %e, "Port enumeration failed");
            return Vec::new();
        },
    };
    let mut found: Vec<PathBuf> = ports
        .into_iter()
        .map(|info| PathBuf::from(info.port_name))
        .filter(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy())
                .is_some_and(|name| DEVICE_PREFIXES.iter().any(|prefix| name.starts_with(prefix)))
        })
        .collect();
    found.sort();
    found
}

/// Probe each candidate and keep the first that echoes the probe literal.
///
/// The returned transport has already completed its probe, so a following
/// [`Transport::open`] only discards stale input.
pub async fn discover_serial(
    candidates: &[PathBuf],
    baud_rate: u32,
    options: StreamOptions,
) -> Result<(PathBuf, SerialTransport)> {
    let options = options.with_probe(true);
    for path in candidates {
        tracing::info!(port = %path.display(), "Trying port");
        let mut transport = match open_serial(path, baud_rate, options).await {
            Ok(transport) => transport,
            Err(e) => {
                tracing::debug!(port = %path.display(), error = %e, "Port unavailable");
                continue;
            },
        };
        match transport.open().await {
            Ok(()) => {
                tracing::info!(port = %path.display(), "Correct port found");
                return Ok((path.clone(), transport));
            },
            Err(e) => {
                tracing::debug!(port = %path.display(), error = %e, "Probe failed");
                let _ = transport.close().await;
            },
        }
    }
    Err(CandyError::PortNotFound(format!(
        "none of {} candidate(s) answered the probe",
        candidates.len()
    )))
}
