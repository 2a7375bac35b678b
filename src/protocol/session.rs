//! Per-role session state.
//!
//! A [`Link`] owns both message buffers, the flag ledger, the watchdog
//! counter and the statistics of one role instance. It is plain data; the
//! engine decides when each operation runs.

use serde::Serialize;

use super::buffer::CircularBuffer;
use super::flags::{FlagLedger, FlagSnapshot};
use super::token::{decode, Token};

/// Connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No session; initial and terminal state
    Disconnected,
    /// Handshake in progress
    Handshaking,
    /// Session established, scheduler and watchdog running
    Connected,
    /// Teardown requested, waiting for the peer or the tasks
    Disconnecting,
}

impl ConnectionState {
    /// Check if a session is live (connected or winding down)
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connected | Self::Disconnecting)
    }
}

/// Outcome of one watchdog tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogTick {
    /// Inbound traffic was seen since the last tick
    Fed,
    /// Nothing arrived; the timer advanced to the contained value
    Starved(u32),
    /// The timer reached its ceiling
    Expired,
}

/// One role's buffers, ledger and liveness counters
#[derive(Debug)]
pub struct Link {
    /// Session ID, regenerated on every connect
    id: String,
    incoming: CircularBuffer<Token>,
    outgoing: CircularBuffer<Token>,
    flags: FlagLedger,
    watchdog_timer: u32,
    watchdog_timeout: u32,
    /// Set by the receive path, cleared by each watchdog tick
    inbound_seen: bool,
    stats: LinkStats,
}

impl Link {
    /// Create link state with the given buffer capacity and watchdog ceiling
    pub fn new(buffer_capacity: usize, watchdog_timeout: u32) -> Self {
        Self {
            id: String::new(),
            incoming: CircularBuffer::new(buffer_capacity),
            outgoing: CircularBuffer::new(buffer_capacity),
            flags: FlagLedger::new(),
            watchdog_timer: 0,
            watchdog_timeout,
            inbound_seen: false,
            stats: LinkStats::default(),
        }
    }

    /// Get session ID (empty before the first connect)
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Start a fresh session: new ID, watchdog cleared.
    pub fn begin_session(&mut self) -> &str {
        self.id = uuid::Uuid::new_v4().to_string();
        self.watchdog_timer = 0;
        self.inbound_seen = false;
        self.stats.sessions += 1;
        &self.id
    }

    /// Full reset after a disconnect or watchdog expiry.
    pub fn reset(&mut self) {
        self.incoming.flush();
        self.outgoing.flush();
        self.flags.clear();
        self.watchdog_timer = 0;
        self.inbound_seen = false;
        self.stats.teardowns += 1;
    }

    /// Queue a token for transmission.
    ///
    /// Commands and events bump the ledger for their ack. Returns `false`
    /// if the outgoing buffer was full and the token was dropped.
    pub fn enqueue(&mut self, token: Token) -> bool {
        match self.outgoing.enqueue(token) {
            Ok(()) => {
                self.flags.note_sent(token);
                true
            },
            Err(_) => {
                self.stats.overflows += 1;
                false
            },
        }
    }

    /// Next token to transmit.
    pub fn next_outgoing(&mut self) -> Option<Token> {
        let token = self.outgoing.dequeue()?;
        self.stats.messages_sent += 1;
        Some(token)
    }

    /// Accept raw bytes from the wire into the incoming buffer.
    ///
    /// Unrecognized bytes are counted and dropped. Any arrival, recognized
    /// or not, counts as inbound traffic for the watchdog.
    pub fn receive(&mut self, raw: &[u8]) -> Option<Token> {
        self.inbound_seen = true;
        self.stats.messages_received += 1;
        let Some(token) = decode(raw) else {
            self.stats.unrecognized += 1;
            tracing::warn!(raw = %String::from_utf8_lossy(raw), "Unrecognized message dropped");
            return None;
        };
        if self.incoming.enqueue(token).is_err() {
            self.stats.overflows += 1;
            return None;
        }
        Some(token)
    }

    /// Pull the oldest received token, settling the ledger if it is an ack.
    pub fn dequeue_incoming(&mut self) -> Option<Token> {
        let token = self.incoming.dequeue()?;
        self.flags.note_acked(token);
        Some(token)
    }

    /// Check if anything is waiting to be transmitted
    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Check if anything is waiting to be interpreted
    pub fn has_incoming(&self) -> bool {
        !self.incoming.is_empty()
    }

    /// Drop queued outgoing tokens.
    pub fn flush_outgoing(&mut self) -> usize {
        self.outgoing.flush()
    }

    /// Drop queued incoming tokens.
    pub fn flush_incoming(&mut self) -> usize {
        self.incoming.flush()
    }

    /// Advance the watchdog by one tick.
    pub fn watchdog_tick(&mut self) -> WatchdogTick {
        let seen = std::mem::take(&mut self.inbound_seen);
        if !seen {
            self.watchdog_timer = self.watchdog_timer.saturating_add(1);
        }
        if self.watchdog_timer >= self.watchdog_timeout {
            self.stats.watchdog_expiries += 1;
            return WatchdogTick::Expired;
        }
        if seen {
            WatchdogTick::Fed
        } else {
            WatchdogTick::Starved(self.watchdog_timer)
        }
    }

    /// Keep-alive received.
    pub fn reset_watchdog(&mut self) {
        self.watchdog_timer = 0;
    }

    /// Current watchdog count
    pub fn watchdog_timer(&self) -> u32 {
        self.watchdog_timer
    }

    /// Watchdog ceiling
    pub fn watchdog_timeout(&self) -> u32 {
        self.watchdog_timeout
    }

    /// Outstanding-ack ledger
    pub fn flags(&self) -> &FlagLedger {
        &self.flags
    }

    /// Count a handler that exceeded its deadline
    pub fn note_handler_timeout(&mut self) {
        self.stats.handler_timeouts += 1;
    }

    /// Get link statistics
    pub fn stats(&self) -> LinkStats {
        LinkStats {
            flags: Some(self.flags.snapshot()),
            ..self.stats.clone()
        }
    }
}

/// Link statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkStats {
    /// Sessions established
    pub sessions: u64,
    /// Tokens handed to the transport
    pub messages_sent: u64,
    /// 3-byte units read from the transport
    pub messages_received: u64,
    /// Units that did not decode to a token
    pub unrecognized: u64,
    /// Tokens dropped on a full buffer
    pub overflows: u64,
    /// Host handler invocations cut off by the deadline
    pub handler_timeouts: u64,
    /// Watchdog expiries
    pub watchdog_expiries: u64,
    /// Session teardowns
    pub teardowns: u64,
    /// Ledger snapshot at the time of the call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<FlagSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::token::{encode, Semantic};

    #[test]
    fn test_receive_rejects_unknown() {
        let mut link = Link::new(4, 16);
        assert_eq!(link.receive(b"~XX"), None);
        assert!(!link.has_incoming());
        assert_eq!(link.stats().unrecognized, 1);

        let token = link.receive(b"~ID").unwrap();
        assert_eq!(token, encode(Semantic::DispenseCandy));
        assert_eq!(link.dequeue_incoming(), Some(token));
    }

    #[test]
    fn test_enqueue_tracks_flags() {
        let mut link = Link::new(4, 16);
        assert!(link.enqueue(encode(Semantic::DispenseCandy)));
        let ack = Token::Ack(Semantic::DispenseCandy);
        assert_eq!(link.flags().pending(ack), 1);

        link.receive(b"@iD");
        link.dequeue_incoming();
        assert_eq!(link.flags().pending(ack), 0);
    }

    #[test]
    fn test_outgoing_overflow_counted() {
        let mut link = Link::new(1, 16);
        assert!(link.enqueue(encode(Semantic::MaintainConnection)));
        assert!(!link.enqueue(encode(Semantic::MaintainConnection)));
        assert_eq!(link.stats().overflows, 1);
        assert_eq!(link.next_outgoing(), Some(encode(Semantic::MaintainConnection)));
        assert_eq!(link.next_outgoing(), None);
    }

    #[test]
    fn test_watchdog_counts_silent_ticks() {
        let mut link = Link::new(4, 3);
        assert_eq!(link.watchdog_tick(), WatchdogTick::Starved(1));
        link.receive(b"~RS");
        assert_eq!(link.watchdog_tick(), WatchdogTick::Fed);
        assert_eq!(link.watchdog_timer(), 1);
        assert_eq!(link.watchdog_tick(), WatchdogTick::Starved(2));
        assert_eq!(link.watchdog_tick(), WatchdogTick::Expired);
        assert_eq!(link.stats().watchdog_expiries, 1);
    }

    #[test]
    fn test_reset_watchdog_is_idempotent() {
        let mut link = Link::new(4, 16);
        link.reset_watchdog();
        link.reset_watchdog();
        assert_eq!(link.watchdog_timer(), 0);
        link.watchdog_tick();
        link.reset_watchdog();
        link.reset_watchdog();
        assert_eq!(link.watchdog_timer(), 0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut link = Link::new(4, 16);
        link.begin_session();
        let first_id = link.id().to_string();
        link.enqueue(encode(Semantic::DispenseCandy));
        link.receive(b"@rs");
        link.watchdog_tick();
        link.reset();

        assert!(!link.has_outgoing());
        assert!(!link.has_incoming());
        assert_eq!(link.flags().flag_count(), 0);
        assert_eq!(link.watchdog_timer(), 0);

        link.begin_session();
        assert_ne!(link.id(), first_id);
        let stats = link.stats();
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.teardowns, 1);
    }

    #[test]
    fn test_stats_serialize() {
        let link = Link::new(4, 16);
        let json = serde_json::to_value(link.stats()).unwrap();
        assert_eq!(json["messages_sent"], 0);
        assert_eq!(json["flags"]["flag_count"], 0);
    }
}
