//! Transport layer abstraction for Candycom.
//!
//! The protocol engine only ever moves whole 3-byte tokens; a transport
//! supplies the bytes. Provided backends:
//! - **Serial**: a USB CDC device node, selected by the `"correct port"` probe
//! - **TCP**: serial-over-network bridges and local testing
//! - **Memory**: an in-process duplex pair for tests and simulations
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Host / Client engine             │
//! │         (Transport-Agnostic)            │
//! └──────────────────┬──────────────────────┘
//!                    │
//!          ┌─────────┴─────────┐
//!          ▼                   ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │ StreamTransport │ │  (BLE UART,     │
//! │ serial/tcp/mem  │ │   out of tree)  │
//! └─────────────────┘ └─────────────────┘
//! ```

mod serial;
mod stream;
mod tcp;

pub use serial::{
    default_candidates, discover_serial, open_serial, SerialTransport, DEFAULT_BAUD_RATE,
};
pub use stream::{memory_pair, MemoryTransport, StreamOptions, StreamTransport};
pub use tcp::{TcpLink, TcpTransport};

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::TOKEN_LEN;

/// Boxed future returned by transport operations.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Transport kind selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// USB serial device (default)
    #[default]
    Serial,
    /// TCP byte stream
    Tcp,
}

impl TransportKind {
    /// Get descriptive name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::Tcp => "tcp",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "serial" | "usb" => Ok(Self::Serial),
            "tcp" | "net" => Ok(Self::Tcp),
            _ => Err(format!("Unknown transport kind: {}", s)),
        }
    }
}

/// Byte link between host and client.
///
/// Every read is a whole token; the engine never asks for partial data.
/// Implementations own their medium and are driven from one task at a time.
pub trait Transport: Send + 'static {
    /// Get the transport name for logging.
    fn name(&self) -> &'static str;

    /// Host side: acquire or reset the link before the handshake.
    fn open(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Client side: wait for the medium-specific sign that a host is there.
    fn accept_peer(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Check, without blocking, whether a whole token is waiting.
    fn data_available(&mut self) -> bool;

    /// Read exactly one token's worth of bytes.
    ///
    /// Blocks up to the transport's own read timeout.
    fn read_token(&mut self) -> TransportFuture<'_, [u8; TOKEN_LEN]>;

    /// Write raw bytes.
    fn write<'a>(&'a mut self, bytes: &'a [u8]) -> TransportFuture<'a, ()>;

    /// Release the medium.
    fn close(&mut self) -> TransportFuture<'_, ()>;
}

impl Transport for Box<dyn Transport> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn open(&mut self) -> TransportFuture<'_, ()> {
        (**self).open()
    }

    fn accept_peer(&mut self) -> TransportFuture<'_, ()> {
        (**self).accept_peer()
    }

    fn data_available(&mut self) -> bool {
        (**self).data_available()
    }

    fn read_token(&mut self) -> TransportFuture<'_, [u8; TOKEN_LEN]> {
        (**self).read_token()
    }

    fn write<'a>(&'a mut self, bytes: &'a [u8]) -> TransportFuture<'a, ()> {
        (**self).write(bytes)
    }

    fn close(&mut self) -> TransportFuture<'_, ()> {
        (**self).close()
    }
}
