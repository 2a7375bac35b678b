//! End-to-end session tests.
//!
//! A host and a client (or a scripted raw peer) talk over an in-memory
//! pair on the paused tokio clock, so whole watchdog periods pass
//! instantly.

use std::sync::Arc;
use std::time::Duration;

use candycom::transport::TransportFuture;
use candycom::{
    memory_pair, CandyError, Client, ConnectionState, Host, MemoryTransport, ProtocolConfig,
    Semantic, SimulatedDispenser, SoftRestart, StreamOptions, Token, Transport,
};
use tokio::task::JoinHandle;

type TestClient = Client<MemoryTransport, SimulatedDispenser, SoftRestart>;

/// 10 ms time unit: watchdog tick every 50 ms, expiry after 800 ms.
fn config() -> ProtocolConfig {
    ProtocolConfig::default().with_time_unit(Duration::from_millis(10))
}

fn options() -> StreamOptions {
    StreamOptions::default().with_read_timeout(Duration::from_millis(10))
}

/// Poll `cond` until it holds; panics after 5 s of (paused) time.
async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for: {what}");
}

/// Read from a raw peer until `want` arrives; other tokens are skipped.
async fn expect_token(peer: &mut MemoryTransport, want: &[u8; 3]) {
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(raw) = peer.read_token().await {
                if &raw == want {
                    break;
                }
            }
        }
    })
    .await;
    assert!(
        found.is_ok(),
        "peer never received {}",
        String::from_utf8_lossy(want)
    );
}

/// Drain a raw peer until its link closes and return what it received.
async fn drain(peer: &mut MemoryTransport) -> Vec<[u8; 3]> {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match peer.read_token().await {
                Ok(raw) => seen.push(raw),
                Err(CandyError::Timeout(_)) => {},
                Err(_) => break,
            }
        }
    })
    .await;
    seen
}

struct Rig {
    host: Host<MemoryTransport>,
    client: TestClient,
    dispenser: Arc<SimulatedDispenser>,
    device: Arc<SoftRestart>,
    serving: JoinHandle<candycom::Result<()>>,
}

async fn connected() -> Rig {
    let (host_side, client_side) = memory_pair(options());
    let dispenser = Arc::new(SimulatedDispenser::new());
    let device = Arc::new(SoftRestart::new());

    let client = Client::new(
        client_side,
        Arc::clone(&dispenser),
        Arc::clone(&device),
        &config(),
    )
    .unwrap();
    let serving = tokio::spawn({
        let client = client.clone();
        async move { client.serve().await }
    });

    let host = Host::new(host_side, &config()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), host.connect())
        .await
        .expect("handshake timed out")
        .expect("handshake failed");
    eventually("client connected", || client.is_connected()).await;

    Rig {
        host,
        client,
        dispenser,
        device,
        serving,
    }
}

/// Host side connected to a scripted peer that answers the handshake.
async fn host_with_raw_peer() -> (Host<MemoryTransport>, MemoryTransport) {
    let (host_side, peer) = memory_pair(options());
    connect_to_raw_peer(Host::new(host_side, &config()).unwrap(), peer).await
}

/// Complete the host handshake against a scripted peer.
async fn connect_to_raw_peer<T: Transport>(
    host: Host<T>,
    mut peer: MemoryTransport,
) -> (Host<T>, MemoryTransport) {
    let connecting = tokio::spawn({
        let host = host.clone();
        async move { host.connect().await }
    });
    expect_token(&mut peer, b"~ES").await;
    peer.write(b"@es").await.unwrap();

    connecting.await.unwrap().unwrap();
    assert!(host.is_connected());
    (host, peer)
}

#[tokio::test(start_paused = true)]
async fn test_handshake_connects_both_roles() {
    let rig = connected().await;

    assert_eq!(rig.host.state(), ConnectionState::Connected);
    assert_eq!(rig.client.state(), ConnectionState::Connected);
    assert_eq!(rig.host.stats().sessions, 1);
    assert_eq!(rig.client.stats().sessions, 1);
    assert!(!rig.host.candy_dispensed());
    assert!(!rig.host.candy_taken());
}

#[tokio::test(start_paused = true)]
async fn test_dispense_and_taken_round_trip() {
    let rig = connected().await;

    rig.host.dispense_candy().unwrap();
    eventually("dispense confirmed", || rig.host.candy_dispensed()).await;
    assert_eq!(rig.dispenser.rotations(), 1);
    assert_eq!(rig.client.outstanding_dispenses(), 1);
    assert!(rig.client.candy_dispensed());
    assert!(!rig.host.candy_taken());
    assert_eq!(rig.host.pending_acks(Token::Ack(Semantic::DispenseCandy)), 0);

    rig.dispenser.take_candy();
    eventually("taken reported", || rig.host.candy_taken()).await;
    eventually("outstanding cleared", || {
        rig.client.outstanding_dispenses() == 0
    })
    .await;
    assert!(rig.client.candy_taken());

    let stats = rig.host.dispense_stats();
    assert_eq!(stats.dispensed, 1);
    assert_eq!(stats.taken, 1);
    assert_eq!(stats.jams, 0);
    assert!(rig.host.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_new_dispense_clears_status() {
    let rig = connected().await;

    rig.host.dispense_candy().unwrap();
    eventually("first dispense", || rig.host.candy_dispensed()).await;

    rig.host.dispense_candy().unwrap();
    assert!(!rig.host.candy_dispensed());
    eventually("second dispense", || rig.host.candy_dispensed()).await;
    assert_eq!(rig.dispenser.rotations(), 2);
    assert_eq!(rig.client.outstanding_dispenses(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_jam_is_reported() {
    let rig = connected().await;
    rig.dispenser.jam_next();

    rig.host.dispense_candy().unwrap();
    eventually("jam reported", || rig.host.jammed()).await;

    assert!(!rig.host.candy_dispensed());
    assert_eq!(rig.host.dispense_stats().jams, 1);
    assert_eq!(rig.client.outstanding_dispenses(), 0);
    assert!(rig.host.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_reset_dispenser_clears_outstanding() {
    let rig = connected().await;

    rig.host.dispense_candy().unwrap();
    eventually("dispensed", || rig.client.outstanding_dispenses() == 1).await;

    rig.host.reset_dispenser().unwrap();
    eventually("reset acknowledged", || {
        rig.client.outstanding_dispenses() == 0
            && rig.host.pending_acks(Token::Ack(Semantic::ResetDispenser)) == 0
    })
    .await;
    assert!(rig.host.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_restarts_client() {
    let rig = connected().await;

    rig.host.disconnect().await.unwrap();
    assert_eq!(rig.host.state(), ConnectionState::Disconnected);
    assert_eq!(rig.host.stats().teardowns, 1);

    rig.serving.await.unwrap().unwrap();
    assert_eq!(rig.client.state(), ConnectionState::Disconnected);
    assert_eq!(rig.device.count(), 1);
    assert!(matches!(
        rig.host.dispense_candy(),
        Err(CandyError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_link_survives_idle_periods() {
    let rig = connected().await;

    // Many watchdog timeouts worth of silence from the application.
    tokio::time::sleep(Duration::from_secs(4)).await;

    assert!(rig.host.is_connected());
    assert!(rig.client.is_connected());
    assert_eq!(rig.host.stats().watchdog_expiries, 0);
    assert_eq!(rig.client.stats().watchdog_expiries, 0);
    assert!(rig.host.watchdog_timer() < 16);
}

#[tokio::test(start_paused = true)]
async fn test_host_watchdog_expires_on_silent_peer() {
    let (host, mut peer) = host_with_raw_peer().await;

    eventually("host gave up", || {
        host.state() == ConnectionState::Disconnected
    })
    .await;
    let stats = host.stats();
    assert_eq!(stats.watchdog_expiries, 1);
    assert_eq!(stats.teardowns, 1);

    // One keep-alive probe per silent tick before expiry.
    let probes = drain(&mut peer)
        .await
        .iter()
        .filter(|raw| *raw == b"~RS")
        .count();
    assert!(probes >= 10, "only {probes} keep-alive probes");
}

#[tokio::test(start_paused = true)]
async fn test_client_watchdog_expires_and_restarts() {
    let (client_side, mut peer) = memory_pair(options());
    let device = Arc::new(SoftRestart::new());
    let client: TestClient = Client::new(
        client_side,
        Arc::new(SimulatedDispenser::new()),
        Arc::clone(&device),
        &config(),
    )
    .unwrap();
    let serving = tokio::spawn({
        let client = client.clone();
        async move { client.serve().await }
    });

    peer.write(b"~ES").await.unwrap();
    expect_token(&mut peer, b"@es").await;

    // The host goes silent; the client never probes on its own.
    serving.await.unwrap().unwrap();
    assert_eq!(client.stats().watchdog_expiries, 1);
    assert_eq!(device.count(), 1);
    assert!(drain(&mut peer).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_dispense_ack_counts_once() {
    let (host, mut peer) = host_with_raw_peer().await;

    host.dispense_candy().unwrap();
    expect_token(&mut peer, b"~ID").await;
    peer.write(b"@iD@iD").await.unwrap();

    eventually("dispense recognized", || host.candy_dispensed()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(host.dispense_stats().dispensed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unrecognized_tokens_are_dropped() {
    let (host, mut peer) = host_with_raw_peer().await;

    peer.write(b"xyz$FD").await.unwrap();
    eventually("taken event handled", || host.candy_taken()).await;
    expect_token(&mut peer, b"@fd").await;

    assert_eq!(host.stats().unrecognized, 1);
    assert!(host.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_without_ack_tears_down_locally() {
    let (host, mut peer) = host_with_raw_peer().await;

    host.disconnect().await.unwrap();
    assert_eq!(host.state(), ConnectionState::Disconnected);

    let seen = drain(&mut peer).await;
    assert!(seen.iter().any(|raw| raw == b"~FL"));
}

#[tokio::test(start_paused = true)]
async fn test_ended_host_refuses_to_reconnect() {
    let (host, _peer) = host_with_raw_peer().await;
    host.disconnect().await.unwrap();
    assert_eq!(host.state(), ConnectionState::Disconnected);

    let again = tokio::time::timeout(Duration::from_secs(5), host.connect()).await;
    assert!(matches!(again, Ok(Err(CandyError::Transport(_)))));
    assert_eq!(host.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_ended_client_refuses_to_listen() {
    let rig = connected().await;
    rig.host.disconnect().await.unwrap();
    rig.serving.await.unwrap().unwrap();

    let again = tokio::time::timeout(Duration::from_secs(5), rig.client.listen()).await;
    assert!(matches!(again, Ok(Err(CandyError::Transport(_)))));
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_handshake_can_be_retried() {
    let (host_side, mut peer) = memory_pair(options());
    let host = Host::new(host_side, &config()).unwrap();

    // Nobody answers; the caller gives up.
    let first = tokio::time::timeout(Duration::from_millis(50), host.connect()).await;
    assert!(first.is_err());
    assert_eq!(host.state(), ConnectionState::Disconnected);

    let connecting = tokio::spawn({
        let host = host.clone();
        async move { host.connect().await }
    });
    expect_token(&mut peer, b"~ES").await;
    peer.write(b"@es").await.unwrap();
    connecting.await.unwrap().unwrap();
    assert!(host.is_connected());
}

/// Memory link whose `close` hangs, like a wedged device driver.
struct StallingClose {
    inner: MemoryTransport,
    stall: Duration,
}

impl Transport for StallingClose {
    fn name(&self) -> &'static str {
        "stalling-close"
    }

    fn open(&mut self) -> TransportFuture<'_, ()> {
        self.inner.open()
    }

    fn data_available(&mut self) -> bool {
        self.inner.data_available()
    }

    fn read_token(&mut self) -> TransportFuture<'_, [u8; 3]> {
        self.inner.read_token()
    }

    fn write<'a>(&'a mut self, bytes: &'a [u8]) -> TransportFuture<'a, ()> {
        self.inner.write(bytes)
    }

    fn close(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            tokio::time::sleep(self.stall).await;
            self.inner.close().await
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_overrunning_handler_is_cancelled_and_counted() {
    let (host_side, peer) = memory_pair(options());
    let stalling = StallingClose {
        inner: host_side,
        // Well past the 20 ms handler deadline.
        stall: Duration::from_millis(100),
    };
    let host = Host::new(stalling, &config()).unwrap();
    let (host, mut peer) = connect_to_raw_peer(host, peer).await;

    // Handling `@fl` tears down, and the teardown blocks on `close`.
    peer.write(b"@fl").await.unwrap();
    eventually("handler deadline hit", || host.stats().handler_timeouts == 1).await;
    assert_ne!(host.state(), ConnectionState::Connected);

    // The cancelled handler does not take the teardown with it.
    eventually("teardown finished", || {
        host.state() == ConnectionState::Disconnected
    })
    .await;
    let stats = host.stats();
    assert_eq!(stats.handler_timeouts, 1);
    assert_eq!(stats.teardowns, 1);
    assert_eq!(stats.watchdog_expiries, 0);
}
