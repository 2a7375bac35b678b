//! Client (dispenser) role.
//!
//! The client waits passively for `~ES`, answers every command it knows
//! and never probes on its own: its watchdog only counts. A session ends
//! with a device restart whether the host said goodbye or went silent.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;

use super::{start_session, Core, Role, TaskKind};
use crate::config::ProtocolConfig;
use crate::error::Result;
use crate::hardware::{Actuator, DeviceControl, Indicator, NullIndicator};
use crate::protocol::{ConnectionState, LinkStats, Semantic, Token};
use crate::transport::Transport;

#[derive(Debug, Default)]
struct ClientStatus {
    candy_dispensed: bool,
    candy_taken: bool,
    /// When the dispense indicator goes dark
    indicator_until: Option<Instant>,
}

struct ClientInner<T, A, D> {
    core: Arc<Core<T>>,
    actuator: Arc<A>,
    device: Arc<D>,
    indicator: Arc<dyn Indicator>,
    status: Mutex<ClientStatus>,
    /// Dispensed but not yet collected
    outstanding: AtomicU32,
    watching: AtomicBool,
}

/// Dispenser side of a Candycom link.
pub struct Client<T, A, D> {
    inner: Arc<ClientInner<T, A, D>>,
}

impl<T, A, D> Clone for Client<T, A, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, A, D> Client<T, A, D>
where
    T: Transport,
    A: Actuator,
    D: DeviceControl,
{
    /// Create a client without status feedback.
    pub fn new(
        transport: T,
        actuator: Arc<A>,
        device: Arc<D>,
        config: &ProtocolConfig,
    ) -> Result<Self> {
        Self::with_indicator(transport, actuator, device, Arc::new(NullIndicator), config)
    }

    /// Create a client that reports status through `indicator`.
    ///
    /// Fails if `config` does not validate.
    pub fn with_indicator(
        transport: T,
        actuator: Arc<A>,
        device: Arc<D>,
        indicator: Arc<dyn Indicator>,
        config: &ProtocolConfig,
    ) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(ClientInner {
                core: Arc::new(Core::new("client", transport, config)?),
                actuator,
                device,
                indicator,
                status: Mutex::new(ClientStatus::default()),
                outstanding: AtomicU32::new(0),
                watching: AtomicBool::new(false),
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

    /// Last requested dispense succeeded.
    pub fn candy_dispensed(&self) -> bool {
        self.inner.status().candy_dispensed
    }

    /// A taken event was reported since the last dispense request.
    pub fn candy_taken(&self) -> bool {
        self.inner.status().candy_taken
    }

    /// Dispenses still waiting to be collected
    pub fn outstanding_dispenses(&self) -> u32 {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Link statistics
    pub fn stats(&self) -> LinkStats {
        self.inner.core.stats()
    }

    /// Current watchdog count
    pub fn watchdog_timer(&self) -> u32 {
        self.inner.core.link().watchdog_timer()
    }

    /// Wait for a host and complete the handshake.
    ///
    /// Runs the transport's peer check first, then polls for `~ES`.
    /// Anything else that arrives meanwhile is discarded.
    pub async fn listen(&self) -> Result<()> {
        let inner = &self.inner;
        let core = &inner.core;
        let handshake = core.begin_handshake()?;
        inner.indicator.set_connected(false);

        core.transport.lock().await.accept_peer().await?;
        tracing::info!("Waiting for host");

        let establish = Token::Request(Semantic::EstablishConnection);
        loop {
            if core.receive_next().await {
                let token = core.link().dequeue_incoming();
                match token {
                    Some(token) if token == establish => break,
                    Some(other) => tracing::debug!(token = %other, "Ignored before handshake"),
                    None => {},
                }
                continue;
            }
            tokio::time::sleep(core.timing().client_poll).await;
        }

        core.enqueue(Token::Ack(Semantic::EstablishConnection));
        core.transmit_next().await;
        let id = {
            let mut link = core.link();
            link.flush_incoming();
            link.begin_session().to_string()
        };
        handshake.complete();
        inner.indicator.set_connected(true);
        tracing::info!(session = %id, "Connection established");

        let span = tracing::info_span!("session", role = "client", id = %id);
        start_session(inner, &span);
        Ok(())
    }

    /// Run one whole session: handshake, then wait for it to end.
    pub async fn serve(&self) -> Result<()> {
        self.listen().await?;
        self.wait_disconnected().await;
        Ok(())
    }

    /// Wait until the session has ended.
    pub async fn wait_disconnected(&self) {
        self.inner
            .core
            .wait_for_state(|s| *s == ConnectionState::Disconnected)
            .await;
    }
}

impl<T, A, D> ClientInner<T, A, D>
where
    T: Transport,
    A: Actuator,
    D: DeviceControl,
{
    fn status(&self) -> MutexGuard<'_, ClientStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn dispense_candy(self: &Arc<Self>) {
        let hold = self.core.timing().indicator_hold;
        self.indicator.set_dispensing(true);
        {
            let mut status = self.status();
            status.indicator_until = Some(Instant::now() + hold);
            status.candy_dispensed = false;
            status.candy_taken = false;
        }

        if !self.actuator.is_ready() {
            tracing::warn!("Dispenser not ready, skipping rotation");
            self.core.enqueue(Token::Request(Semantic::JamOrEmpty));
            return;
        }

        let actuator = Arc::clone(&self.actuator);
        let outcome = tokio::task::spawn_blocking(move || actuator.rotate()).await;
        match outcome {
            Ok(Ok(_)) => {
                self.core.enqueue(Token::Ack(Semantic::DispenseCandy));
                self.status().candy_dispensed = true;
                let outstanding = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::info!(outstanding, "Candy dispensed");
                self.ensure_watcher();
            },
            Ok(Err(jammed)) => {
                tracing::warn!(error = %jammed, "Dispense failed");
                self.core.enqueue(Token::Request(Semantic::JamOrEmpty));
            },
            Err(e) => {
                tracing::warn!(error = %e, "Actuator task failed");
                self.core.enqueue(Token::Request(Semantic::JamOrEmpty));
            },
        }
    }

    /// Start the watch-for-taken task unless it is already running.
    fn ensure_watcher(self: &Arc<Self>) {
        if self.watching.swap(true, Ordering::SeqCst) {
            return;
        }
        self.core.spawn(
            TaskKind::WatchTaken,
            &tracing::Span::current(),
            Arc::clone(self).watch_for_taken(),
        );
    }

    async fn watch_for_taken(self: Arc<Self>) {
        let timing = *self.core.timing();
        let mut was_taken = false;
        tracing::debug!("Watching for taken candy");

        while self.core.is_connected() {
            let taken = self.actuator.candy_taken();
            let rising = taken && !was_taken;
            was_taken = taken;

            if rising && self.outstanding.load(Ordering::SeqCst) > 0 {
                self.core.enqueue(Token::Request(Semantic::CandyTaken));
                self.status().candy_taken = true;
                let left = self
                    .outstanding
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .map_or(0, |n| n - 1);
                tracing::info!(outstanding = left, "Candy taken");
                tokio::time::sleep(timing.taken_settle).await;
            } else {
                tokio::time::sleep(timing.taken_poll).await;
            }
        }

        self.watching.store(false, Ordering::SeqCst);
        tracing::debug!("Taken watcher exited");
    }

    fn reset_watchdog(&self) {
        self.core.link().reset_watchdog();
        self.core.enqueue(Token::Ack(Semantic::MaintainConnection));
    }

    fn reset_dispenser(&self) {
        let cleared = self.outstanding.swap(0, Ordering::SeqCst);
        self.core.enqueue(Token::Ack(Semantic::ResetDispenser));
        tracing::info!(cleared, "Dispenser reset");
    }

    /// Tear down as `caller` and restart the device if this call did it.
    async fn shut_down(self: Arc<Self>, caller: TaskKind, farewell: Option<Token>) {
        if self.core.teardown(caller, farewell).await {
            self.indicator.set_dispensing(false);
            self.indicator.set_connected(false);
            self.outstanding.store(0, Ordering::SeqCst);
            self.device.restart();
        }
    }
}

impl<T, A, D> Role for ClientInner<T, A, D>
where
    T: Transport,
    A: Actuator,
    D: DeviceControl,
{
    type Link = T;

    const KEEPALIVE: bool = false;

    fn core(&self) -> &Arc<Core<T>> {
        &self.core
    }

    fn dispatch(self: Arc<Self>, token: Token) -> BoxFuture<'static, ()> {
        async move {
            match token {
                Token::Request(Semantic::DispenseCandy) => self.dispense_candy().await,
                Token::Request(Semantic::MaintainConnection) => self.reset_watchdog(),
                Token::Request(Semantic::ResetDispenser) => self.reset_dispenser(),
                Token::Request(Semantic::Disconnect) => {
                    tracing::info!("Host requested disconnect");
                    self.shut_down(TaskKind::Scheduler, Some(Token::Ack(Semantic::Disconnect)))
                        .await;
                    return;
                },
                other => {
                    tracing::trace!(token = %other, "No client handler");
                    return;
                },
            }
            tracing::debug!(%token, "Message interpreted");
        }
        .boxed()
    }

    fn on_watchdog_expired(self: Arc<Self>) -> BoxFuture<'static, ()> {
        self.shut_down(TaskKind::Watchdog, None).boxed()
    }

    fn on_cycle(&self) {
        let expired = {
            let mut status = self.status();
            match status.indicator_until {
                Some(deadline) if Instant::now() >= deadline => {
                    status.indicator_until = None;
                    true
                },
                _ => false,
            }
        };
        if expired {
            self.indicator.set_dispensing(false);
        }
    }
}
