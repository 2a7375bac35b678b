//! Host (controller) role.
//!
//! The host opens the session by repeating `~ES` until `@es` comes back,
//! sends dispense requests, keeps the link alive with `~RS` probes and
//! closes with `~FL`. Every handler runs under a deadline; one that runs
//! over is abandoned and logged without touching the session.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;

use super::{start_session, Core, Role, TaskKind};
use crate::config::ProtocolConfig;
use crate::error::{CandyError, Result};
use crate::protocol::{ConnectionState, LinkStats, Semantic, Token};
use crate::transport::Transport;

/// Dispense counters kept next to the status booleans
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispenseStats {
    /// Dispenses the client confirmed
    pub dispensed: u64,
    /// Taken events received
    pub taken: u64,
    /// Jam reports received
    pub jams: u64,
}

#[derive(Debug, Default)]
struct HostStatus {
    candy_dispensed: bool,
    candy_taken: bool,
    jammed: bool,
    /// `~ID` requests not yet acknowledged
    awaiting_dispense: u32,
    stats: DispenseStats,
}

struct HostInner<T> {
    core: Arc<Core<T>>,
    status: Mutex<HostStatus>,
}

/// Host side of a Candycom link.
///
/// Cloning yields another handle to the same session.
pub struct Host<T> {
    inner: Arc<HostInner<T>>,
}

impl<T> Clone for Host<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Host<T> {
    /// Create a host over `transport`.
    ///
    /// Fails if `config` does not validate.
    pub fn new(transport: T, config: &ProtocolConfig) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(HostInner {
                core: Arc::new(Core::new("host", transport, config)?),
                status: Mutex::new(HostStatus::default()),
            }),
        })
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        self.inner.core.state()
    }

    /// Check if the session is established
    pub fn is_connected(&self) -> bool {
        self.inner.core.is_connected()
    }

    /// Last dispense was confirmed by the client.
    pub fn candy_dispensed(&self) -> bool {
        self.inner.status().candy_dispensed
    }

    /// Candy from the last dispense was collected.
    pub fn candy_taken(&self) -> bool {
        self.inner.status().candy_taken
    }

    /// Client reported a jam or empty hopper.
    pub fn jammed(&self) -> bool {
        self.inner.status().jammed
    }

    /// Dispense counters
    pub fn dispense_stats(&self) -> DispenseStats {
        self.inner.status().stats
    }

    /// Link statistics
    pub fn stats(&self) -> LinkStats {
        self.inner.core.stats()
    }

    /// Current watchdog count
    pub fn watchdog_timer(&self) -> u32 {
        self.inner.core.link().watchdog_timer()
    }

    /// Pending count for an acknowledgment in the flag ledger
    pub fn pending_acks(&self, ack: Token) -> i32 {
        self.inner.core.link().flags().pending(ack)
    }

    /// Establish the session.
    ///
    /// Retries `~ES` every retry interval until the client answers; wrap in
    /// a timeout to bound it. A host whose session already ended cannot
    /// connect again because teardown released its transport.
    pub async fn connect(&self) -> Result<()> {
        let core = &self.inner.core;
        let handshake = core.begin_handshake()?;

        core.transport.lock().await.open().await?;
        tracing::info!("Attempting to establish connection");

        let establish = Token::Request(Semantic::EstablishConnection);
        let established = Token::Ack(Semantic::EstablishConnection);
        loop {
            core.enqueue(establish);
            core.transmit_next().await;
            if core.receive_next().await {
                let reply = core.link().dequeue_incoming();
                if reply == Some(established) {
                    break;
                }
                if let Some(other) = reply {
                    tracing::debug!(token = %other, "Ignored during handshake");
                }
            }
            tokio::time::sleep(core.timing().host_retry).await;
        }

        let id = {
            let mut link = core.link();
            link.flush_outgoing();
            link.begin_session().to_string()
        };
        handshake.complete();
        tracing::info!(session = %id, "Connection established");

        let span = tracing::info_span!("session", role = "host", id = %id);
        start_session(&self.inner, &span);
        Ok(())
    }

    /// Ask the client for one piece of candy.
    pub fn dispense_candy(&self) -> Result<()> {
        self.require_connected()?;
        {
            let mut status = self.inner.status();
            status.candy_dispensed = false;
            status.candy_taken = false;
            status.awaiting_dispense += 1;
        }
        self.inner.core.enqueue(Token::Request(Semantic::DispenseCandy));
        Ok(())
    }

    /// Ask the client to forget outstanding dispenses.
    pub fn reset_dispenser(&self) -> Result<()> {
        self.require_connected()?;
        self.inner.status().jammed = false;
        self.inner.core.enqueue(Token::Request(Semantic::ResetDispenser));
        Ok(())
    }

    /// Close the session.
    ///
    /// Sends `~FL` and waits for `@fl`; if it does not arrive within the
    /// grace period the session is torn down locally.
    pub async fn disconnect(&self) -> Result<()> {
        let core = &self.inner.core;
        if !core.is_connected() {
            return Ok(());
        }
        core.enqueue(Token::Request(Semantic::Disconnect));

        let grace = core.timing().disconnect_grace;
        let acked = tokio::time::timeout(
            grace,
            core.wait_for_state(|s| *s == ConnectionState::Disconnected),
        )
        .await;
        if acked.is_err() {
            tracing::warn!("No disconnect acknowledgment, closing locally");
            core.teardown(TaskKind::External, None).await;
        }
        Ok(())
    }

    /// Wait until the session has ended.
    pub async fn wait_disconnected(&self) {
        self.inner
            .core
            .wait_for_state(|s| *s == ConnectionState::Disconnected)
            .await;
    }

    fn require_connected(&self) -> Result<()> {
        if self.inner.core.is_connected() {
            Ok(())
        } else {
            Err(CandyError::NotConnected)
        }
    }
}

impl<T: Transport> HostInner<T> {
    fn status(&self) -> std::sync::MutexGuard<'_, HostStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispense_recognized(&self) {
        let mut status = self.status();
        if status.awaiting_dispense == 0 {
            tracing::debug!("Duplicate dispense acknowledgment ignored");
            return;
        }
        status.awaiting_dispense -= 1;
        status.candy_dispensed = true;
        status.stats.dispensed += 1;
        tracing::info!("Successful dispense");
    }

    fn taken_candy(&self) {
        self.core.enqueue(Token::Ack(Semantic::CandyTaken));
        let mut status = self.status();
        status.candy_taken = true;
        status.stats.taken += 1;
        tracing::info!("Candy taken");
    }

    fn jam_reported(&self) {
        self.core.enqueue(Token::Ack(Semantic::JamOrEmpty));
        let mut status = self.status();
        status.jammed = true;
        status.awaiting_dispense = status.awaiting_dispense.saturating_sub(1);
        status.stats.jams += 1;
        tracing::warn!("Dispenser reported a jam or empty hopper");
    }

    fn reset_watchdog(&self) {
        self.core.link().reset_watchdog();
    }

    async fn disconnect_recognized(self: Arc<Self>) {
        tracing::info!("Disconnect acknowledged by client");
        self.core.teardown(TaskKind::Scheduler, None).await;
    }

    async fn handle(self: &Arc<Self>, token: Token) {
        match token {
            Token::Ack(Semantic::DispenseCandy) => self.dispense_recognized(),
            Token::Request(Semantic::CandyTaken) => self.taken_candy(),
            Token::Request(Semantic::JamOrEmpty) => self.jam_reported(),
            Token::Ack(Semantic::MaintainConnection) => self.reset_watchdog(),
            Token::Ack(Semantic::Disconnect) => Arc::clone(self).disconnect_recognized().await,
            other => {
                tracing::trace!(token = %other, "No host handler");
                return;
            },
        }
        tracing::debug!(%token, "Message interpreted");
    }

    /// Run one handler under the handler deadline.
    ///
    /// An overrun cancels only this invocation; it is counted and the
    /// scheduler moves on to the next token.
    async fn bounded(&self, token: Token, handler: impl Future<Output = ()>) {
        let deadline = self.core.timing().handler_timeout;
        if tokio::time::timeout(deadline, handler).await.is_err() {
            self.core.link().note_handler_timeout();
            tracing::warn!(%token, "Handler did not complete in time and was cancelled");
        }
    }
}

impl<T: Transport> Role for HostInner<T> {
    type Link = T;

    const KEEPALIVE: bool = true;

    fn core(&self) -> &Arc<Core<T>> {
        &self.core
    }

    fn dispatch(self: Arc<Self>, token: Token) -> BoxFuture<'static, ()> {
        async move {
            self.bounded(token, self.handle(token)).await;
        }
        .boxed()
    }

    fn on_watchdog_expired(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            self.core.teardown(TaskKind::Watchdog, None).await;
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{memory_pair, StreamOptions};

    fn host() -> Host<crate::transport::MemoryTransport> {
        let (a, _b) = memory_pair(StreamOptions::default());
        Host::new(a, &ProtocolConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_new_host_is_disconnected() {
        let host = host();
        assert_eq!(host.state(), ConnectionState::Disconnected);
        assert!(!host.candy_dispensed());
        assert!(!host.candy_taken());
    }

    #[tokio::test]
    async fn test_commands_require_connection() {
        let host = host();
        assert!(matches!(host.dispense_candy(), Err(CandyError::NotConnected)));
        assert!(matches!(host.reset_dispenser(), Err(CandyError::NotConnected)));
        // Disconnecting an idle host is a no-op.
        host.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_dispense_ack_does_not_refire() {
        let host = host();
        host.inner.status().awaiting_dispense = 1;

        host.inner.dispense_recognized();
        host.inner.dispense_recognized();
        assert!(host.candy_dispensed());
        assert_eq!(host.dispense_stats().dispensed, 1);
    }

    #[tokio::test]
    async fn test_taken_candy_queues_ack() {
        let host = host();
        host.inner.taken_candy();
        assert!(host.candy_taken());
        let next = host.inner.core.link().next_outgoing();
        assert_eq!(next, Some(Token::Ack(Semantic::CandyTaken)));
    }

    #[tokio::test]
    async fn test_jam_report() {
        let host = host();
        host.inner.jam_reported();
        assert!(host.jammed());
        assert_eq!(host.dispense_stats().jams, 1);
        let next = host.inner.core.link().next_outgoing();
        assert_eq!(next, Some(Token::Ack(Semantic::JamOrEmpty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrunning_handler_is_cancelled() {
        let host = host();
        host.inner
            .bounded(Token::Ack(Semantic::Disconnect), std::future::pending())
            .await;
        assert_eq!(host.stats().handler_timeouts, 1);

        // The next token is still handled normally.
        host.inner.status().awaiting_dispense = 1;
        Arc::clone(&host.inner)
            .dispatch(Token::Ack(Semantic::DispenseCandy))
            .await;
        assert!(host.candy_dispensed());
        assert_eq!(host.stats().handler_timeouts, 1);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let (a, _b) = memory_pair(StreamOptions::default());
        let config = ProtocolConfig {
            host_retry: -1.0,
            ..ProtocolConfig::default()
        };
        assert!(matches!(Host::new(a, &config), Err(CandyError::Config(_))));
    }
}
