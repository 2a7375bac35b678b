//! Cooperative protocol engine shared by both roles.
//!
//! Once a handshake succeeds each role runs two tasks against its
//! [`Core`]: the comm scheduler (receive one token, transmit one token,
//! interpret one token) and the watchdog supervisor. Both run only while
//! the state is [`ConnectionState::Connected`]; cancelling them means
//! leaving that state and letting them reach their next checkpoint.
//!
//! Session state lives behind a `std` mutex that is never held across an
//! await point. The transport sits behind an async mutex because reads
//! block up to the transport's timeout.

mod client;
mod host;

pub use client::Client;
pub use host::{DispenseStats, Host};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::{ProtocolConfig, Timing};
use crate::error::{CandyError, Result};
use crate::protocol::{ConnectionState, Link, LinkStats, Semantic, Token, WatchdogTick};
use crate::transport::Transport;

/// Background task owned by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskKind {
    /// Comm scheduler
    Scheduler,
    /// Watchdog supervisor
    Watchdog,
    /// Client watch-for-taken poller
    WatchTaken,
    /// Public API call on the role handle
    External,
}

/// Role-specific behaviour plugged into the shared loops.
pub(crate) trait Role: Send + Sync + Sized + 'static {
    /// Transport type
    type Link: Transport;

    /// Send a keep-alive probe on every silent watchdog tick.
    const KEEPALIVE: bool;

    /// Shared engine state
    fn core(&self) -> &Arc<Core<Self::Link>>;

    /// Run the handler for one received token.
    fn dispatch(self: Arc<Self>, token: Token) -> BoxFuture<'static, ()>;

    /// Recovery once the watchdog gives up on the peer.
    fn on_watchdog_expired(self: Arc<Self>) -> BoxFuture<'static, ()>;

    /// Called once per scheduler round.
    fn on_cycle(&self) {}
}

/// State shared by a role handle and its tasks
pub(crate) struct Core<T> {
    role: &'static str,
    link: Mutex<Link>,
    transport: tokio::sync::Mutex<T>,
    state: watch::Sender<ConnectionState>,
    tasks: Mutex<Vec<(TaskKind, JoinHandle<()>)>>,
    timing: Timing,
    /// The transport was closed by a teardown
    released: AtomicBool,
}

impl<T: Transport> Core<T> {
    pub(crate) fn new(role: &'static str, transport: T, config: &ProtocolConfig) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            role,
            link: Mutex::new(Link::new(config.buffer_capacity, config.watchdog_timeout)),
            transport: tokio::sync::Mutex::new(transport),
            state,
            tasks: Mutex::new(Vec::new()),
            timing: config.timing(),
            released: AtomicBool::new(false),
        })
    }

    /// Move `Disconnected → Handshaking` for a fresh session.
    ///
    /// A role whose transport was released by an earlier teardown cannot
    /// start again; the embedding code builds a new one. Dropping the
    /// returned guard before [`Handshake::complete`] goes back to
    /// `Disconnected`.
    pub(crate) fn begin_handshake(&self) -> Result<Handshake<'_, T>> {
        if self.released.load(Ordering::SeqCst) {
            return Err(CandyError::Transport(format!(
                "{}: transport released by the previous session",
                self.role
            )));
        }
        let started = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Handshaking;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(CandyError::Transport(format!(
                "{}: cannot start a session in state {:?}",
                self.role,
                self.state()
            )));
        }
        tracing::info!(role = self.role, "State transition to Handshaking");
        Ok(Handshake {
            core: self,
            done: false,
        })
    }

    /// Lock session state. Never hold the guard across an await.
    pub(crate) fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn timing(&self) -> &Timing {
        &self.timing
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::info!(role = self.role, from = ?prev, to = ?next, "State transition");
        }
    }

    pub(crate) fn stats(&self) -> LinkStats {
        self.link().stats()
    }

    /// Wait until the state satisfies `pred`.
    pub(crate) async fn wait_for_state(&self, pred: impl FnMut(&ConnectionState) -> bool) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(pred).await;
    }

    /// Queue a token; returns `false` if it was dropped.
    pub(crate) fn enqueue(&self, token: Token) -> bool {
        let queued = self.link().enqueue(token);
        if queued {
            tracing::trace!(role = self.role, %token, "Enqueued");
        }
        queued
    }

    /// Transmit one queued token, if any.
    pub(crate) async fn transmit_next(&self) -> Option<Token> {
        let token = self.link().next_outgoing()?;
        let mut transport = self.transport.lock().await;
        match transport.write(&token.to_bytes()).await {
            Ok(()) => tracing::debug!(role = self.role, %token, "Transmitted"),
            Err(e) => tracing::warn!(role = self.role, %token, error = %e, "Transmit failed"),
        }
        Some(token)
    }

    /// Read one unit into the incoming buffer if one is waiting.
    ///
    /// Returns `false` when nothing was available.
    pub(crate) async fn receive_next(&self) -> bool {
        let read = {
            let mut transport = self.transport.lock().await;
            if !transport.data_available() {
                return false;
            }
            transport.read_token().await
        };
        match read {
            Ok(raw) => {
                let token = self.link().receive(&raw);
                if let Some(token) = token {
                    tracing::debug!(role = self.role, %token, "Received");
                }
            },
            Err(e) => tracing::warn!(role = self.role, error = %e, "Receive failed"),
        }
        true
    }

    /// Send everything still queued.
    async fn drain_outgoing(&self) {
        while self.transmit_next().await.is_some() {}
    }

    /// Spawn a session task inside `span`.
    pub(crate) fn spawn<F>(&self, kind: TaskKind, span: &tracing::Span, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut.instrument(span.clone()));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind, handle));
    }

    /// Start tearing the session down.
    ///
    /// Only the first caller wins the `Connected → Disconnecting`
    /// transition; everyone else gets `None`. The returned task stops the
    /// other session tasks (never the caller's own), queues `farewell`,
    /// transmits whatever is pending, releases the transport and resets
    /// the link before entering `Disconnected`.
    pub(crate) fn begin_teardown(
        self: &Arc<Self>,
        caller: TaskKind,
        farewell: Option<Token>,
    ) -> Option<JoinHandle<()>> {
        let won = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnecting;
                true
            } else {
                false
            }
        });
        if !won {
            return None;
        }
        tracing::info!(role = self.role, ?caller, "Tearing down session");

        let core = Arc::clone(self);
        let tasks: Vec<_> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        Some(tokio::spawn(
            async move {
                for (kind, handle) in tasks {
                    if kind == caller {
                        continue;
                    }
                    if let Err(e) = handle.await {
                        tracing::warn!(?kind, error = %e, "Session task ended abnormally");
                    }
                }
                if let Some(token) = farewell {
                    core.enqueue(token);
                }
                core.drain_outgoing().await;
                if let Err(e) = core.transport.lock().await.close().await {
                    tracing::warn!(error = %e, "Transport close failed");
                }
                core.released.store(true, Ordering::SeqCst);
                core.link().reset();
                core.set_state(ConnectionState::Disconnected);
            }
            .in_current_span(),
        ))
    }

    /// Tear down and wait for it.
    ///
    /// Returns `true` if this caller performed the teardown. An external
    /// caller that lost the race waits for the one in flight.
    pub(crate) async fn teardown(self: &Arc<Self>, caller: TaskKind, farewell: Option<Token>) -> bool {
        match self.begin_teardown(caller, farewell) {
            Some(handle) => {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "Teardown task failed");
                }
                true
            },
            None => {
                if caller == TaskKind::External {
                    self.wait_for_state(|s| *s == ConnectionState::Disconnected)
                        .await;
                }
                false
            },
        }
    }
}

/// An in-progress handshake.
pub(crate) struct Handshake<'a, T: Transport> {
    core: &'a Core<T>,
    done: bool,
}

impl<T: Transport> Handshake<'_, T> {
    /// Enter `Connected`.
    pub(crate) fn complete(mut self) {
        self.done = true;
        self.core.set_state(ConnectionState::Connected);
    }
}

impl<T: Transport> Drop for Handshake<'_, T> {
    fn drop(&mut self) {
        if !self.done {
            self.core.link().flush_outgoing();
            self.core.set_state(ConnectionState::Disconnected);
        }
    }
}

/// Comm scheduler: receive step, transmit step, then at most one dispatch.
pub(crate) async fn run_scheduler<R: Role>(role: Arc<R>) {
    let core = Arc::clone(role.core());
    let idle = core.timing().idle_yield;
    tracing::debug!("Comm scheduler running");

    while core.is_connected() {
        if !core.receive_next().await {
            tokio::time::sleep(idle).await;
        }
        if core.transmit_next().await.is_none() {
            tokio::time::sleep(idle).await;
        }

        role.on_cycle();

        let token = core.link().dequeue_incoming();
        if let Some(token) = token {
            Arc::clone(&role).dispatch(token).await;
        }
    }

    tracing::debug!("Comm scheduler exited");
}

/// Watchdog supervisor: one liveness tick per period while connected.
pub(crate) async fn run_watchdog<R: Role>(role: Arc<R>) {
    let core = Arc::clone(role.core());
    let period = core.timing().watchdog_period;
    let mut state = core.state.subscribe();

    while core.is_connected() {
        let tick = core.link().watchdog_tick();
        match tick {
            WatchdogTick::Fed => {},
            WatchdogTick::Starved(count) => {
                let timeout = core.link().watchdog_timeout();
                tracing::debug!("watchdog {count}/{timeout}");
                if R::KEEPALIVE {
                    core.enqueue(Token::Request(Semantic::MaintainConnection));
                }
            },
            WatchdogTick::Expired => {
                tracing::warn!("Watchdog expired, peer presumed dead");
                Arc::clone(&role).on_watchdog_expired().await;
                break;
            },
        }

        tokio::select! {
            () = tokio::time::sleep(period) => {},
            _ = state.wait_for(|s| *s != ConnectionState::Connected) => break,
        }
    }

    tracing::debug!("Watchdog exited");
}

/// Spawn both session tasks for `role`.
pub(crate) fn start_session<R: Role>(role: &Arc<R>, span: &tracing::Span) {
    let core = role.core();
    core.spawn(TaskKind::Scheduler, span, run_scheduler(Arc::clone(role)));
    core.spawn(TaskKind::Watchdog, span, run_watchdog(Arc::clone(role)));
}
