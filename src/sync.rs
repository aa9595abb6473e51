//! Background SNTP sync worker and the published clock offset.
//!
//! `TimeSyncClient` is a cheap cloneable handle. At most one worker thread
//! runs per client; it walks the configured servers in order, retries each a
//! bounded number of times and publishes either a fresh offset (`Synced`) or
//! `Failed`. Readers never block on the worker.

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::error::Result;
use crate::ntp::{self, UdpTransport};
use crate::status::{SyncState, SyncStatus};
use crate::traits::{NtpTransport, OffsetSource};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};

/// Outcome of one successful exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SntpSample {
    pub server: String,
    pub offset_ms: i64,
    pub round_trip_ms: i64,
}

pub struct TimeSyncClient<T, C> {
    inner: Arc<Inner<T, C>>,
}

struct Inner<T, C> {
    transport: T,
    clock: C,
    config: SyncConfig,
    status: RwLock<SyncStatus>,
    in_flight: AtomicBool,
}

impl<T, C> Clone for TimeSyncClient<T, C> {
    fn clone(&self) -> Self {
        TimeSyncClient {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl TimeSyncClient<UdpTransport, SystemClock> {
    /// Client talking real UDP with the system clock.
    pub fn from_config(config: SyncConfig) -> Self {
        let transport = UdpTransport::new(config.port, config.socket_timeout());
        TimeSyncClient::new(transport, SystemClock, config)
    }
}

impl<T, C> TimeSyncClient<T, C>
where
    T: NtpTransport + Send + Sync + 'static,
    C: Clock + Send + Sync + 'static,
{
    pub fn new(transport: T, clock: C, config: SyncConfig) -> Self {
        TimeSyncClient {
            inner: Arc::new(Inner {
                transport,
                clock,
                config,
                status: RwLock::new(SyncStatus::default()),
                in_flight: AtomicBool::new(false),
            }),
        }
    }

    /// Launch a sync worker unless one is already running.
    ///
    /// Returns immediately. The handle is only useful to callers that want
    /// to wait; dropping it detaches the worker.
    pub fn start_sync(&self) -> Option<JoinHandle<()>> {
        if self
            .inner
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("[TimeSync] Sync already in progress, ignoring trigger");
            return None;
        }

        self.inner.write_status().state = SyncState::Syncing;

        let inner = Arc::clone(&self.inner);
        match thread::Builder::new()
            .name("time-sync".to_string())
            .spawn(move || inner.run())
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("[TimeSync] Failed to spawn sync worker: {}", e);
                // The worker never ran, so its guard never will either.
                drop(SlotGuard {
                    inner: &*self.inner,
                });
                None
            }
        }
    }

    /// Back to `NotSynced` with a zero offset. Refused while a sync runs.
    pub fn reset_sync(&self) -> bool {
        let mut status = self.inner.write_status();
        if self.inner.in_flight.load(Ordering::SeqCst) {
            debug!("[TimeSync] Reset refused, sync in progress");
            return false;
        }
        *status = SyncStatus::default();
        info!("[TimeSync] Sync state reset");
        true
    }

    pub fn sync_state(&self) -> SyncState {
        self.inner.read_status().state
    }

    pub fn clock_offset_millis(&self) -> i64 {
        self.inner.read_status().offset_ms
    }

    /// Consistent snapshot of state, offset and where it came from.
    pub fn status(&self) -> SyncStatus {
        self.inner.read_status().clone()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.in_flight.load(Ordering::SeqCst)
    }
}

impl<T, C> OffsetSource for TimeSyncClient<T, C>
where
    T: NtpTransport + Send + Sync + 'static,
    C: Clock + Send + Sync + 'static,
{
    fn sync_state(&self) -> SyncState {
        TimeSyncClient::sync_state(self)
    }

    fn clock_offset_millis(&self) -> i64 {
        TimeSyncClient::clock_offset_millis(self)
    }
}

/// Releases the single-flight slot. If the worker dies before publishing a
/// terminal state, `Failed` is published on the way out.
struct SlotGuard<'a, T, C> {
    inner: &'a Inner<T, C>,
}

impl<T, C> Drop for SlotGuard<'_, T, C> {
    fn drop(&mut self) {
        {
            let mut status = self.inner.write_status();
            if status.state == SyncState::Syncing {
                status.state = SyncState::Failed;
            }
        }
        self.inner.in_flight.store(false, Ordering::SeqCst);
    }
}

impl<T, C> Inner<T, C> {
    fn read_status(&self) -> RwLockReadGuard<'_, SyncStatus> {
        self.status.read().unwrap_or_else(|poisoned| {
            warn!("[TimeSync] Status lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write_status(&self) -> RwLockWriteGuard<'_, SyncStatus> {
        self.status.write().unwrap_or_else(|poisoned| {
            warn!("[TimeSync] Status lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl<T, C> Inner<T, C>
where
    T: NtpTransport,
    C: Clock,
{
    fn run(&self) {
        let _slot = SlotGuard { inner: self };

        info!(
            "[TimeSync] Starting sync against {} server(s)",
            self.config.servers.len()
        );
        let outcome = self.attempt_servers();
        let now = self.clock.now_millis();

        let mut status = self.write_status();
        match outcome {
            Some(sample) => {
                info!(
                    "[TimeSync] Synced with {}: offset {} ms (rtt {} ms)",
                    sample.server, sample.offset_ms, sample.round_trip_ms
                );
                *status = SyncStatus {
                    state: SyncState::Synced,
                    offset_ms: sample.offset_ms,
                    server: Some(sample.server),
                    round_trip_ms: Some(sample.round_trip_ms),
                    updated_ts: now,
                };
            }
            None => {
                warn!(
                    "[TimeSync] All servers failed, keeping previous offset {} ms",
                    status.offset_ms
                );
                status.state = SyncState::Failed;
                status.updated_ts = now;
            }
        }
    }

    /// Servers in order, each retried up to `attempts_per_server` times.
    fn attempt_servers(&self) -> Option<SntpSample> {
        let attempts = self.config.attempts_per_server.max(1);
        let delay = self.config.retry_delay();

        for server in &self.config.servers {
            for attempt in 1..=attempts {
                match self.query(server) {
                    Ok(sample) => return Some(sample),
                    Err(e) => {
                        if e.is_protocol() {
                            warn!(
                                "[NTP-Client] {} attempt {}/{} sent a bad reply: {}",
                                server, attempt, attempts, e
                            );
                        } else {
                            info!(
                                "[NTP-Client] {} attempt {}/{} failed: {}",
                                server, attempt, attempts, e
                            );
                        }
                        if attempt < attempts {
                            self.clock.sleep(delay);
                        }
                    }
                }
            }
        }
        None
    }

    fn query(&self, server: &str) -> Result<SntpSample> {
        let request = ntp::build_request();

        let sent = self.clock.now_millis();
        let reply = self.transport.exchange(server, &request)?;
        let received = self.clock.now_millis();

        let server_millis = ntp::parse_reply(&reply)?;
        let round_trip_ms = (received - sent).max(0);

        Ok(SntpSample {
            server: server.to_string(),
            offset_ms: ntp::compute_offset(server_millis, received, round_trip_ms),
            round_trip_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::error::SyncError;
    use crate::ntp::{NTP_EPOCH_OFFSET, NTP_PACKET_SIZE};
    use crate::traits::MockNtpTransport;
    use mockall::Sequence;
    use std::io;
    use std::sync::atomic::{AtomicI64, AtomicUsize};
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::Mutex;
    use std::time::Duration;

    const START_MS: i64 = 1_600_000_000_000;
    const TICK_MS: i64 = 40;

    /// Advances by a fixed tick on every read; sleeping advances by the
    /// slept amount and is recorded.
    struct FakeClock {
        now: AtomicI64,
        sleeps: Mutex<Vec<Duration>>,
    }

    impl FakeClock {
        fn new() -> Self {
            FakeClock {
                now: AtomicI64::new(START_MS),
                sleeps: Mutex::new(Vec::new()),
            }
        }
    }

    impl Clock for FakeClock {
        fn now_millis(&self) -> i64 {
            self.now.fetch_add(TICK_MS, Ordering::SeqCst)
        }

        fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
            self.now
                .fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
        }
    }

    /// Reply whose transmit timestamp reads `unix_secs` (whole seconds).
    fn reply_at(unix_secs: i64) -> Vec<u8> {
        let mut reply = vec![0u8; NTP_PACKET_SIZE];
        reply[0] = 0x1C;
        let ntp_secs = (unix_secs + NTP_EPOCH_OFFSET) as u32;
        reply[40..44].copy_from_slice(&ntp_secs.to_be_bytes());
        reply
    }

    fn timeout() -> SyncError {
        SyncError::Network(io::Error::from(io::ErrorKind::TimedOut))
    }

    fn config(servers: &[&str]) -> SyncConfig {
        SyncConfig {
            servers: servers.iter().map(|s| s.to_string()).collect(),
            attempts_per_server: 3,
            retry_delay_ms: 2_000,
            ..SyncConfig::default()
        }
    }

    #[test]
    fn test_initial_state() {
        let client = TimeSyncClient::new(MockNtpTransport::new(), FakeClock::new(), config(&["a"]));
        assert_eq!(client.sync_state(), SyncState::NotSynced);
        assert_eq!(client.clock_offset_millis(), 0);
        assert!(!client.is_syncing());
    }

    #[test]
    fn test_first_success_publishes_offset() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut transport = MockNtpTransport::new();
        // Server is 3 s ahead of the local receive instant's second
        let reply = reply_at(START_MS / 1_000 + 3);
        transport
            .expect_exchange()
            .withf(|server, request| server == "a" && request[0] == 0x1B)
            .times(1)
            .returning(move |_, _| Ok(reply.clone()));

        let client = TimeSyncClient::new(transport, FakeClock::new(), config(&["a", "b"]));
        client.start_sync().unwrap().join().unwrap();

        let status = client.status();
        assert_eq!(status.state, SyncState::Synced);
        // received = START + 40, rtt = 40 -> 3000 - 40 - 20
        assert_eq!(status.offset_ms, 2_940);
        assert_eq!(status.server.as_deref(), Some("a"));
        assert_eq!(status.round_trip_ms, Some(TICK_MS));
        assert!(!client.is_syncing());
    }

    #[test]
    fn test_retries_same_server_with_delay() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut transport = MockNtpTransport::new();
        let mut seq = Sequence::new();
        transport
            .expect_exchange()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(timeout()));
        let reply = reply_at(START_MS / 1_000);
        transport
            .expect_exchange()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _| Ok(reply.clone()));

        let clock = Arc::new(FakeClock::new());
        let client = TimeSyncClient::new(transport, SharedClock(clock.clone()), config(&["a", "b"]));
        client.start_sync().unwrap().join().unwrap();

        assert_eq!(client.sync_state(), SyncState::Synced);
        assert_eq!(client.status().server.as_deref(), Some("a"));
        assert_eq!(
            *clock.sleeps.lock().unwrap(),
            vec![Duration::from_secs(2), Duration::from_secs(2)]
        );
    }

    #[test]
    fn test_fails_over_to_next_server() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut transport = MockNtpTransport::new();
        transport
            .expect_exchange()
            .withf(|server, _| server == "a")
            .times(3)
            .returning(|_, _| Ok(vec![0u8; 10]));
        let reply = reply_at(START_MS / 1_000 + 60);
        transport
            .expect_exchange()
            .withf(|server, _| server == "b")
            .times(1)
            .returning(move |_, _| Ok(reply.clone()));

        let clock = Arc::new(FakeClock::new());
        let client = TimeSyncClient::new(transport, SharedClock(clock.clone()), config(&["a", "b"]));
        client.start_sync().unwrap().join().unwrap();

        assert_eq!(client.sync_state(), SyncState::Synced);
        assert_eq!(client.status().server.as_deref(), Some("b"));
        // No delay after the final attempt against "a"
        assert_eq!(clock.sleeps.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_exhaustion_fails_without_sleeping_past_last_attempt() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut transport = MockNtpTransport::new();
        transport
            .expect_exchange()
            .times(6)
            .returning(|_, _| Err(timeout()));

        let mut clock = MockClock::new();
        clock.expect_now_millis().returning(|| START_MS);
        clock
            .expect_sleep()
            .withf(|d| *d == Duration::from_secs(2))
            .times(4)
            .return_const(());

        let client = TimeSyncClient::new(transport, clock, config(&["a", "b"]));
        client.start_sync().unwrap().join().unwrap();

        assert_eq!(client.sync_state(), SyncState::Failed);
        assert_eq!(client.clock_offset_millis(), 0);
        assert_eq!(client.status().updated_ts, START_MS);
    }

    #[test]
    fn test_failed_sync_keeps_previous_offset() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut transport = MockNtpTransport::new();
        let mut seq = Sequence::new();
        let reply = reply_at(START_MS / 1_000 - 5);
        transport
            .expect_exchange()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _| Ok(reply.clone()));
        transport
            .expect_exchange()
            .times(3)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(SyncError::ZeroTimestamp));

        let client = TimeSyncClient::new(transport, FakeClock::new(), config(&["a"]));
        client.start_sync().unwrap().join().unwrap();
        let offset = client.clock_offset_millis();
        assert_eq!(client.sync_state(), SyncState::Synced);
        assert_eq!(offset, -5_000 - TICK_MS - TICK_MS / 2);

        client.start_sync().unwrap().join().unwrap();
        assert_eq!(client.sync_state(), SyncState::Failed);
        assert_eq!(client.clock_offset_millis(), offset);
    }

    #[test]
    fn test_empty_server_list_fails_immediately() {
        let client = TimeSyncClient::new(MockNtpTransport::new(), FakeClock::new(), config(&[]));
        client.start_sync().unwrap().join().unwrap();
        assert_eq!(client.sync_state(), SyncState::Failed);
    }

    #[test]
    fn test_reset_after_sync() {
        let mut transport = MockNtpTransport::new();
        let reply = reply_at(START_MS / 1_000 + 1);
        transport
            .expect_exchange()
            .returning(move |_, _| Ok(reply.clone()));

        let client = TimeSyncClient::new(transport, FakeClock::new(), config(&["a"]));
        client.start_sync().unwrap().join().unwrap();
        assert_ne!(client.clock_offset_millis(), 0);

        assert!(client.reset_sync());
        assert_eq!(client.status(), SyncStatus::default());
    }

    struct PanickingTransport;

    impl NtpTransport for PanickingTransport {
        fn exchange(&self, _server: &str, _request: &[u8; NTP_PACKET_SIZE]) -> Result<Vec<u8>> {
            panic!("transport blew up");
        }
    }

    #[test]
    fn test_worker_panic_releases_slot() {
        let transport = PanickingTransport;
        let client = TimeSyncClient::new(transport, FakeClock::new(), config(&["a"]));
        assert!(client.start_sync().unwrap().join().is_err());

        assert_eq!(client.sync_state(), SyncState::Failed);
        assert!(!client.is_syncing());
    }

    // ------------------------------------------------------------------
    // Single-flight
    // ------------------------------------------------------------------

    struct SharedClock(Arc<FakeClock>);

    impl Clock for SharedClock {
        fn now_millis(&self) -> i64 {
            self.0.now_millis()
        }

        fn sleep(&self, duration: Duration) {
            self.0.sleep(duration)
        }
    }

    /// Blocks inside `exchange` until the test opens the gate.
    struct GatedTransport {
        calls: AtomicUsize,
        entered: Mutex<Sender<()>>,
        gate: Mutex<Receiver<()>>,
    }

    impl NtpTransport for GatedTransport {
        fn exchange(&self, _server: &str, _request: &[u8; NTP_PACKET_SIZE]) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.gate.lock().unwrap().recv();
            Ok(reply_at(START_MS / 1_000 + 10))
        }
    }

    struct SharedTransport(Arc<GatedTransport>);

    impl NtpTransport for SharedTransport {
        fn exchange(&self, server: &str, request: &[u8; NTP_PACKET_SIZE]) -> Result<Vec<u8>> {
            self.0.exchange(server, request)
        }
    }

    #[test]
    fn test_single_flight() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel();
        let transport = Arc::new(GatedTransport {
            calls: AtomicUsize::new(0),
            entered: Mutex::new(entered_tx),
            gate: Mutex::new(gate_rx),
        });

        let client = TimeSyncClient::new(
            SharedTransport(transport.clone()),
            FakeClock::new(),
            config(&["a"]),
        );

        let worker = client.start_sync().expect("first trigger launches a worker");
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Worker is parked inside the exchange
        assert_eq!(client.sync_state(), SyncState::Syncing);
        assert!(client.is_syncing());
        for _ in 0..10 {
            assert!(client.start_sync().is_none());
        }
        let other_handle = client.clone();
        assert!(other_handle.start_sync().is_none());
        assert!(!client.reset_sync());
        assert_eq!(client.sync_state(), SyncState::Syncing);

        gate_tx.send(()).unwrap();
        worker.join().unwrap();

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.sync_state(), SyncState::Synced);
        assert!(!client.is_syncing());

        // Slot is free again for the next cycle
        gate_tx.send(()).unwrap();
        client.start_sync().unwrap().join().unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_start_sync_returns_before_worker_finishes() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel();
        let transport = GatedTransport {
            calls: AtomicUsize::new(0),
            entered: Mutex::new(entered_tx),
            gate: Mutex::new(gate_rx),
        };
        let client = TimeSyncClient::new(transport, FakeClock::new(), config(&["a"]));

        let worker = client.start_sync().unwrap();
        // Returned while the worker is still blocked on the gate
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!worker.is_finished());

        gate_tx.send(()).unwrap();
        worker.join().unwrap();
        assert_eq!(client.sync_state(), SyncState::Synced);
    }

    #[test]
    fn test_offset_source_reads_published_pair() {
        let mut transport = MockNtpTransport::new();
        let reply = reply_at(START_MS / 1_000 + 2);
        transport
            .expect_exchange()
            .returning(move |_, _| Ok(reply.clone()));
        let client = TimeSyncClient::new(transport, FakeClock::new(), config(&["a"]));
        client.start_sync().unwrap().join().unwrap();

        let source: &dyn OffsetSource = &client;
        assert_eq!(source.sync_state(), SyncState::Synced);
        assert_eq!(source.clock_offset_millis(), 2_000 - TICK_MS - TICK_MS / 2);
    }
}
