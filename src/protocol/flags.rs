//! Outstanding-acknowledgment ledger.
//!
//! Advisory bookkeeping only: nothing ever waits on a flag. Counts are
//! signed because a peer may acknowledge something this side never sent.

use std::collections::HashMap;

use serde::Serialize;

use super::token::{ack_for, Semantic, Token};

/// Pending acknowledgment counts keyed by ack token.
#[derive(Debug, Clone, Default)]
pub struct FlagLedger {
    pending: HashMap<Semantic, i32>,
    flag_count: i32,
}

impl FlagLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outgoing command or event; acks are not tracked.
    pub fn note_sent(&mut self, token: Token) {
        if let Some(Token::Ack(sem)) = ack_for(token) {
            *self.pending.entry(sem).or_insert(0) += 1;
            self.flag_count += 1;
        }
    }

    /// Record an incoming ack. Returns the new pending count for it.
    pub fn note_acked(&mut self, token: Token) -> Option<i32> {
        let Token::Ack(sem) = token else {
            return None;
        };
        let count = self.pending.entry(sem).or_insert(0);
        *count -= 1;
        self.flag_count -= 1;
        if *count < 0 {
            tracing::debug!(ack = %token, count = *count, "Unexpected acknowledgment");
        }
        Some(*count)
    }

    /// Pending count for an ack token (zero if never seen).
    pub fn pending(&self, ack: Token) -> i32 {
        match ack {
            Token::Ack(sem) => self.pending.get(&sem).copied().unwrap_or(0),
            Token::Request(_) => 0,
        }
    }

    /// Sum over all acks.
    pub fn flag_count(&self) -> i32 {
        self.flag_count
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.flag_count = 0;
    }

    /// Snapshot keyed by ack wire text.
    pub fn snapshot(&self) -> FlagSnapshot {
        let mut pending: Vec<(String, i32)> = self
            .pending
            .iter()
            .map(|(sem, count)| (Token::Ack(*sem).as_str().to_string(), *count))
            .collect();
        pending.sort();
        FlagSnapshot {
            pending,
            flag_count: self.flag_count,
        }
    }
}

/// Serializable copy of a ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlagSnapshot {
    /// `(ack, count)` pairs sorted by ack text
    pub pending: Vec<(String, i32)>,
    /// Aggregate count
    pub flag_count: i32,
}
