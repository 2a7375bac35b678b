//! # Candycom - Host/Dispenser Link Protocol
//!
//! Point-to-point protocol between a candy-dispensing client and the host
//! that controls it, over any byte link (USB serial, TCP bridge, in-memory
//! pair). Every message is a fixed 3-byte token; liveness is supervised by
//! a tick-counting watchdog on both ends.
//!
//! ## Features
//!
//! - **Fixed vocabulary**: 14 tokens, commands `~XX`, acks `@xx`, events `$FD`/`%JP`
//! - **Bounded buffers**: circular queues that drop the newest item when full
//! - **Cooperative engine**: comm scheduler and watchdog supervisor per session
//! - **Interchangeable transports**: serial with port probing, TCP, memory pair
//! - **Hardware seams**: actuator, device control and indicator traits
//!
//! ## Session Overview
//!
//! ```text
//! Host                                      Client (dispenser)
//!   |------ ~ES (every retry interval) ------->|
//!   |<----- @es -------------------------------|
//!   |                                          |
//!   |------ ~ID ------------------------------>|  rotate()
//!   |<----- @iD  (or %JP on a jam) ------------|
//!   |<----- $FD  (taken sensor edge) ----------|
//!   |------ @fd ------------------------------>|
//!   |                                          |
//!   |------ ~RS (silent watchdog tick) ------->|
//!   |<----- @rs -------------------------------|
//!   |                                          |
//!   |------ ~FL ------------------------------>|
//!   |<----- @fl -------------------------------|  restart()
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use candycom::{memory_pair, Client, Host, ProtocolConfig, SimulatedDispenser, SoftRestart, StreamOptions};
//!
//! let config = ProtocolConfig::default();
//! let (host_side, client_side) = memory_pair(StreamOptions::default());
//!
//! let client = Client::new(
//!     client_side,
//!     Arc::new(SimulatedDispenser::new()),
//!     Arc::new(SoftRestart::new()),
//!     &config,
//! )?;
//! tokio::spawn({
//!     let client = client.clone();
//!     async move { client.serve().await }
//! });
//!
//! let host = Host::new(host_side, &config)?;
//! host.connect().await?;
//! host.dispense_candy()?;
//! host.disconnect().await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod protocol;
pub mod transport;

// Re-exports for convenience
pub use config::{Config, ProtocolConfig, Timing, TransportConfig};
pub use engine::{Client, DispenseStats, Host};
pub use error::{CandyError, Result};
pub use hardware::{
    Actuator, DeviceControl, Dispensed, Indicator, Jammed, NullIndicator, SimulatedDispenser,
    SoftRestart,
};
pub use protocol::{ConnectionState, LinkStats, Semantic, Token};
pub use transport::{
    discover_serial, memory_pair, open_serial, MemoryTransport, SerialTransport, StreamOptions,
    StreamTransport, TcpLink, TcpTransport, Transport, TransportKind,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
