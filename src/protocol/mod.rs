//! Candycom wire vocabulary and session bookkeeping.
//!
//! # Protocol Overview
//!
//! One host talks to one dispenser (the client) over a byte link. Every
//! protocol unit is a fixed 3-byte token; there is no framing, length
//! prefix or checksum, so both sides always read and write whole tokens.
//!
//! ## Message Flow
//!
//! ```text
//! Host                              Client
//!    |                                |
//!    |-------- ~ES (retry 1u) ------->|  Establish
//!    |<------- @es -------------------|
//!    |                                |
//!    |-------- ~ID ------------------>|  Dispense
//!    |<------- @iD -------------------|  (or %JP on a jam)
//!    |<------- $FD -------------------|  Candy taken
//!    |-------- @fd ------------------>|
//!    |                                |
//!    |-------- ~RS ------------------>|  Keep-alive (host only)
//!    |<------- @rs -------------------|
//!    |                                |
//!    |-------- ~FL ------------------>|  Disconnect
//!    |<------- @fl -------------------|  client restarts
//! ```
//!
//! ## Vocabulary
//!
//! | Name                   | Token | Ack   |
//! |------------------------|-------|-------|
//! | `establish_connection` | `~ES` | `@es` |
//! | `dispense_candy`       | `~ID` | `@iD` |
//! | `reset_dispenser`      | `~QD` | `@qD` |
//! | `maintain_connection`  | `~RS` | `@rs` |
//! | `disconnect`           | `~FL` | `@fl` |
//! | `jam_or_empty`         | `%JP` | `@jp` |
//! | `candy_taken`          | `$FD` | `@fd` |
//!
//! ## State Machine
//!
//! | State           | Description                         | Valid Transitions |
//! |-----------------|-------------------------------------|-------------------|
//! | `Disconnected`  | No session (initial and terminal)   | → Handshaking     |
//! | `Handshaking`   | Host retrying `~ES` / client waiting| → Connected, Disconnected |
//! | `Connected`     | Scheduler and watchdog running      | → Disconnecting   |
//! | `Disconnecting` | Teardown in progress                | → Disconnected    |

mod buffer;
mod flags;
mod session;
mod token;

pub use buffer::{CircularBuffer, DEFAULT_CAPACITY};
pub use flags::{FlagLedger, FlagSnapshot};
pub use session::{ConnectionState, Link, LinkStats, WatchdogTick};
pub use token::{ack_for, decode, encode, Semantic, Token, TokenClass, TOKEN_LEN};

/// Default watchdog ceiling in ticks
pub const DEFAULT_WATCHDOG_TIMEOUT: u32 = 16;

/// Literal exchanged to pick the right serial device
pub const PORT_PROBE: &[u8; 12] = b"correct port";
