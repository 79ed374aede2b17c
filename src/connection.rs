//! Connection lifecycle of the BLE link.
//!
//! `Disconnected -> Scanning -> Connecting -> Setup -> Polling`, with every failure edge
//! leading back to `Disconnected` and the retry pacing of [`crate::session::BackoffPolicy`].
//! The machine never blocks: each [`ConnectionMachine::tick`] does at most one step and
//! picks up where it left off on the next call.
//!
//! The station accepts a single BLE link. A phone app or another bridge holding that link is
//! the usual reason connect attempts fail.
use crate::config::BridgeConfig;
use crate::session::{ConnectionStatus, Session};
use crate::transport::{ConnectPoll, NotificationSink, PeerFilter, ScanPoll, Transport};
use bluest::Uuid;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ff00_0000_1000_8000_00805f9b34fb);
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000ff01_0000_1000_8000_00805f9b34fb);
pub const WRITE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000ff02_0000_1000_8000_00805f9b34fb);

/// Vendor command that wakes the station's MODBUS handler. Sent twice during setup.
pub const WAKE_COMMAND: [u8; 4] = [0xaa, 0x55, 0x90, 0xeb];
const WAKE_REPEATS: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimings {
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
    pub wake_spacing: Duration,
    pub max_reactivations: u32,
    pub use_bonding: bool,
}

impl From<&BridgeConfig> for ConnectionTimings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            scan_timeout: Duration::from_millis(config.scan_timeout_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            connect_attempts: config.connect_attempts.max(1),
            connect_retry_delay: Duration::from_millis(config.connect_retry_delay_ms),
            wake_spacing: Duration::from_millis(config.wake_spacing_ms),
            max_reactivations: config.max_reactivations,
            use_bonding: config.use_bonding,
        }
    }
}

/// The resolved notify/write characteristic pair.
#[derive(Debug, Clone)]
pub struct Characteristics<C> {
    pub notify: C,
    pub write: C,
}

enum Phase<P, C> {
    Idle,
    Scanning {
        started: Instant,
    },
    Connecting {
        peer: P,
        started: Instant,
        /// Set after a failed attempt while waiting to try again
        retry_at: Option<Instant>,
    },
    Setup {
        characteristics: Characteristics<C>,
        wakes_sent: u8,
        next_at: Instant,
    },
    Polling {
        characteristics: Characteristics<C>,
        window_start: Instant,
        reactivations: u32,
    },
}

/// What a tick changed that the rest of the engine must react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Entered `Polling` on a fresh link.
    Ready,
    /// No data for too long; the wake command was re-sent and a fresh read is wanted.
    Reactivated,
    /// Left `Polling` or `Setup`.
    Lost,
}

pub struct ConnectionMachine<T: Transport> {
    phase: Phase<T::Peer, T::Characteristic>,
    session: Session,
    filter: PeerFilter,
    timings: ConnectionTimings,
    enabled: bool,
}

impl<T: Transport> ConnectionMachine<T> {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            phase: Phase::Idle,
            session: Session::new(config.backoff()),
            filter: config.peer_filter(),
            timings: ConnectionTimings::from(config),
            enabled: config.enabled,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn status(&self) -> ConnectionStatus {
        self.session.status()
    }

    pub fn is_polling(&self) -> bool {
        matches!(self.phase, Phase::Polling { .. })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Characteristic to send commands to, available while polling.
    pub fn write_characteristic(&self) -> Option<&T::Characteristic> {
        match &self.phase {
            Phase::Polling { characteristics, .. } => Some(&characteristics.write),
            _ => None,
        }
    }

    pub fn set_filter(&mut self, filter: PeerFilter) {
        self.filter = filter;
    }

    /// Enable or disable the link. Disabling tears the link down; returns true if a link
    /// (or an attempt at one) was dropped.
    pub fn set_enabled(&mut self, enabled: bool, transport: &mut T, now: Instant) -> bool {
        self.enabled = enabled;
        if enabled {
            return false;
        }
        self.teardown(transport, now)
    }

    /// Note that a frame arrived from the peer.
    pub fn record_data(&mut self, now: Instant) {
        self.session.record_data(now);
        if let Phase::Polling { window_start, reactivations, .. } = &mut self.phase {
            *window_start = now;
            *reactivations = 0;
        }
    }

    /// Advance by at most one step. `stale_after` is how long polling may go without data
    /// before the wake command is re-sent.
    pub fn tick(
        &mut self,
        transport: &mut T,
        sink: &NotificationSink,
        stale_after: Duration,
        now: Instant,
    ) -> Option<LinkEvent> {
        if !self.enabled {
            return self.teardown(transport, now).then_some(LinkEvent::Lost);
        }

        if matches!(self.phase, Phase::Setup { .. } | Phase::Polling { .. }) && !transport.is_link_up() {
            warn!("Link to the power station lost");
            transport.disconnect();
            self.phase = Phase::Idle;
            self.session.record_link_loss(now);
            return Some(LinkEvent::Lost);
        }

        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {
                self.start_sequence(transport, now);
                None
            }
            Phase::Scanning { started } => {
                self.poll_scan(transport, started, now);
                None
            }
            Phase::Connecting { peer, started, retry_at } => {
                self.poll_connect(transport, peer, started, retry_at, now);
                None
            }
            Phase::Setup { characteristics, wakes_sent, next_at } => {
                self.advance_setup(transport, sink, characteristics, wakes_sent, next_at, now)
            }
            Phase::Polling { characteristics, window_start, reactivations } => {
                self.watch_staleness(transport, characteristics, window_start, reactivations, stale_after, now)
            }
        }
    }

    fn start_sequence(&mut self, transport: &mut T, now: Instant) {
        if self.filter.is_empty() || !self.session.retry_due(now) {
            return;
        }
        self.session.begin_sequence(now);
        if transport.start_scan(&self.filter) {
            info!("Scanning for the power station");
            self.session.set_status(ConnectionStatus::Scanning);
            self.phase = Phase::Scanning { started: now };
        } else {
            warn!("Transport refused to scan");
            self.fail_sequence(now);
        }
    }

    fn poll_scan(&mut self, transport: &mut T, started: Instant, now: Instant) {
        match transport.poll_scan() {
            ScanPoll::Found(peer) => {
                transport.stop_scan();
                info!("Found power station {peer:?}");
                self.start_attempt(transport, peer, now);
            }
            ScanPoll::Pending if now.saturating_duration_since(started) >= self.timings.scan_timeout => {
                transport.stop_scan();
                warn!("Power station not found within {:?}", self.timings.scan_timeout);
                self.fail_sequence(now);
            }
            ScanPoll::Pending => self.phase = Phase::Scanning { started },
        }
    }

    fn start_attempt(&mut self, transport: &mut T, peer: T::Peer, now: Instant) {
        let attempt = self.session.count_attempt();
        info!("Connecting to {peer:?} (attempt {attempt}/{})", self.timings.connect_attempts);
        self.session.set_status(ConnectionStatus::Connecting);
        let retry_at = if transport.start_connect(&peer, self.timings.use_bonding) {
            None
        } else {
            warn!("Transport refused to connect");
            Some(now + self.timings.connect_retry_delay)
        };
        if retry_at.is_some() && attempt >= self.timings.connect_attempts {
            self.fail_sequence(now);
            return;
        }
        self.phase = Phase::Connecting { peer, started: now, retry_at };
    }

    fn poll_connect(
        &mut self,
        transport: &mut T,
        peer: T::Peer,
        started: Instant,
        retry_at: Option<Instant>,
        now: Instant,
    ) {
        if let Some(at) = retry_at {
            if now >= at {
                self.start_attempt(transport, peer, now);
            } else {
                self.phase = Phase::Connecting { peer, started, retry_at };
            }
            return;
        }

        match transport.poll_connect() {
            ConnectPoll::Established => self.resolve(transport, now),
            ConnectPoll::Failed(reason) => {
                let attempt = self.session.attempts();
                if attempt < self.timings.connect_attempts {
                    warn!(
                        "Connection failed: {reason}. The station may be busy with another client, retrying in {:?} ({attempt}/{})",
                        self.timings.connect_retry_delay, self.timings.connect_attempts
                    );
                    let retry_at = Some(now + self.timings.connect_retry_delay);
                    self.phase = Phase::Connecting { peer, started, retry_at };
                } else {
                    warn!("Connection failed after {attempt} attempts: {reason}");
                    self.fail_sequence(now);
                }
            }
            ConnectPoll::Pending if now.saturating_duration_since(started) >= self.timings.connect_timeout => {
                warn!("Connection timed out after {:?}", self.timings.connect_timeout);
                transport.disconnect();
                self.fail_sequence(now);
            }
            ConnectPoll::Pending => self.phase = Phase::Connecting { peer, started, retry_at: None },
        }
    }

    fn resolve(&mut self, transport: &mut T, now: Instant) {
        self.session.set_status(ConnectionStatus::Setup);

        let Some(service) = transport.resolve_service(SERVICE_UUID) else {
            warn!("The power station does not expose service {SERVICE_UUID}");
            transport.disconnect();
            self.fail_sequence(now);
            return;
        };
        let notify = transport.resolve_characteristic(&service, NOTIFY_CHARACTERISTIC_UUID);
        let write = transport.resolve_characteristic(&service, WRITE_CHARACTERISTIC_UUID);
        let (Some(notify), Some(write)) = (notify, write) else {
            warn!("The power station is missing its notify or write characteristic");
            transport.disconnect();
            self.fail_sequence(now);
            return;
        };

        debug!("Characteristics resolved");
        self.phase = Phase::Setup {
            characteristics: Characteristics { notify, write },
            wakes_sent: 0,
            next_at: now,
        };
    }

    fn advance_setup(
        &mut self,
        transport: &mut T,
        sink: &NotificationSink,
        characteristics: Characteristics<T::Characteristic>,
        wakes_sent: u8,
        next_at: Instant,
        now: Instant,
    ) -> Option<LinkEvent> {
        if now < next_at {
            self.phase = Phase::Setup { characteristics, wakes_sent, next_at };
            return None;
        }

        if wakes_sent < WAKE_REPEATS {
            debug!("TX: {} (wake {}/{WAKE_REPEATS})", hex::encode(WAKE_COMMAND), wakes_sent + 1);
            if !transport.write_no_response(&characteristics.write, &WAKE_COMMAND) {
                warn!("Wake command was not accepted by the transport");
            }
            self.phase = Phase::Setup {
                characteristics,
                wakes_sent: wakes_sent + 1,
                next_at: now + self.timings.wake_spacing,
            };
            return None;
        }

        if !transport.subscribe(&characteristics.notify, sink.clone()) {
            warn!("Failed to subscribe to notifications");
            transport.disconnect();
            self.fail_sequence(now);
            return Some(LinkEvent::Lost);
        }

        self.session.record_success(now);
        self.session.set_status(ConnectionStatus::Polling);
        self.phase = Phase::Polling { characteristics, window_start: now, reactivations: 0 };
        Some(LinkEvent::Ready)
    }

    fn watch_staleness(
        &mut self,
        transport: &mut T,
        characteristics: Characteristics<T::Characteristic>,
        window_start: Instant,
        reactivations: u32,
        stale_after: Duration,
        now: Instant,
    ) -> Option<LinkEvent> {
        if now.saturating_duration_since(window_start) < stale_after {
            self.phase = Phase::Polling { characteristics, window_start, reactivations };
            return None;
        }

        if reactivations >= self.timings.max_reactivations {
            let silent_for = self.session.last_data_at().map(|at| now.saturating_duration_since(at));
            warn!("No data for {silent_for:?} after {reactivations} re-activations, reconnecting");
            transport.disconnect();
            self.session.record_link_loss(now);
            return Some(LinkEvent::Lost);
        }

        warn!("No data received for {stale_after:?}, re-activating");
        debug!("TX: {}", hex::encode(WAKE_COMMAND));
        transport.write_no_response(&characteristics.write, &WAKE_COMMAND);
        self.phase = Phase::Polling {
            characteristics,
            window_start: now,
            reactivations: reactivations + 1,
        };
        Some(LinkEvent::Reactivated)
    }

    fn fail_sequence(&mut self, now: Instant) {
        let took = self.session.last_attempt_at().map(|at| now.saturating_duration_since(at));
        self.phase = Phase::Idle;
        self.session.record_failure(now);
        debug!(
            "Connection sequence failed after {took:?}, next attempt in {:?} ({} consecutive failures)",
            self.session.retry_interval(),
            self.session.consecutive_failures()
        );
    }

    fn teardown(&mut self, transport: &mut T, now: Instant) -> bool {
        let was_active = match self.phase {
            Phase::Idle => false,
            Phase::Scanning { .. } => {
                transport.stop_scan();
                true
            }
            _ => {
                transport.disconnect();
                true
            }
        };
        if was_active {
            info!("Bridge disabled, dropping the link");
            self.phase = Phase::Idle;
            self.session.record_link_loss(now);
        }
        was_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    struct Rig {
        machine: ConnectionMachine<MockTransport>,
        transport: MockTransport,
        sink: NotificationSink,
        _rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
        now: Instant,
    }

    const STALE: Duration = Duration::from_secs(30);

    impl Rig {
        fn new(transport: MockTransport) -> Self {
            let (sink, rx) = NotificationSink::channel();
            Self {
                machine: ConnectionMachine::new(&BridgeConfig::default()),
                transport,
                sink,
                _rx: rx,
                now: Instant::now(),
            }
        }

        fn tick(&mut self) -> Option<LinkEvent> {
            self.machine.tick(&mut self.transport, &self.sink, STALE, self.now)
        }

        fn advance(&mut self, by: Duration) -> Option<LinkEvent> {
            self.now += by;
            self.tick()
        }

        /// Tick until polling, stepping past the wake spacing.
        fn run_to_polling(&mut self) {
            for _ in 0..10 {
                if self.advance(Duration::from_secs(2)) == Some(LinkEvent::Ready) {
                    return;
                }
            }
            panic!("never reached polling, status {:?}", self.machine.status());
        }
    }

    #[test]
    fn test_happy_path_reaches_polling() {
        let mut rig = Rig::new(MockTransport::default());
        assert_eq!(rig.tick(), None);
        assert_eq!(rig.machine.status(), ConnectionStatus::Scanning);
        assert_eq!(rig.tick(), None);
        assert_eq!(rig.machine.status(), ConnectionStatus::Connecting);
        assert_eq!(rig.tick(), None);
        assert_eq!(rig.machine.status(), ConnectionStatus::Setup);

        rig.run_to_polling();
        assert!(rig.machine.is_polling());
        assert_eq!(rig.machine.status(), ConnectionStatus::Polling);
        assert!(rig.machine.write_characteristic().is_some());

        let wakes = rig.transport.take_writes();
        assert_eq!(wakes, vec![WAKE_COMMAND.to_vec(), WAKE_COMMAND.to_vec()]);
        assert!(rig.transport.sink.is_some());
    }

    #[test]
    fn test_wake_commands_are_spaced() {
        let mut rig = Rig::new(MockTransport::default());
        for _ in 0..4 {
            rig.tick();
        }
        assert_eq!(rig.transport.writes.len(), 1);
        rig.advance(Duration::from_millis(500));
        assert_eq!(rig.transport.writes.len(), 1);
        rig.advance(Duration::from_millis(1500));
        assert_eq!(rig.transport.writes.len(), 2);
        assert!(!rig.machine.is_polling());
    }

    #[test]
    fn test_scan_timeout_fails_the_sequence() {
        let mut rig = Rig::new(MockTransport { peer_visible: false, ..Default::default() });
        rig.tick();
        assert_eq!(rig.machine.status(), ConnectionStatus::Scanning);
        rig.advance(Duration::from_secs(4));
        assert_eq!(rig.machine.status(), ConnectionStatus::Scanning);
        rig.advance(Duration::from_secs(1));
        assert_eq!(rig.machine.status(), ConnectionStatus::Disconnected);
        assert_eq!(rig.machine.session().consecutive_failures(), 1);
        assert!(!rig.transport.scanning);

        // No new scan until the fast retry interval has passed.
        rig.advance(Duration::from_secs(5));
        assert_eq!(rig.transport.scan_starts, 1);
        rig.advance(Duration::from_secs(5));
        assert_eq!(rig.transport.scan_starts, 2);
    }

    #[test]
    fn test_connect_retries_then_gives_up() {
        let mut rig = Rig::new(MockTransport {
            connect_default: ConnectPoll::Failed("busy".into()),
            ..Default::default()
        });
        rig.tick();
        rig.tick();
        for _ in 0..20 {
            rig.advance(Duration::from_secs(1));
            if rig.machine.status() == ConnectionStatus::Disconnected {
                break;
            }
        }
        assert_eq!(rig.transport.connect_starts, 5);
        assert_eq!(rig.machine.status(), ConnectionStatus::Disconnected);
        assert_eq!(rig.machine.session().consecutive_failures(), 1);
    }

    #[test]
    fn test_connect_recovers_on_retry() {
        let mut transport = MockTransport::default();
        transport.connect_script.push_back(ConnectPoll::Failed("busy".into()));
        let mut rig = Rig::new(transport);
        rig.run_to_polling();
        assert_eq!(rig.transport.connect_starts, 2);
        assert_eq!(rig.machine.session().consecutive_failures(), 0);
    }

    #[test]
    fn test_connect_timeout() {
        let mut rig = Rig::new(MockTransport { connect_default: ConnectPoll::Pending, ..Default::default() });
        rig.tick();
        rig.tick();
        rig.advance(Duration::from_secs(9));
        assert_eq!(rig.machine.status(), ConnectionStatus::Connecting);
        rig.advance(Duration::from_secs(1));
        assert_eq!(rig.machine.status(), ConnectionStatus::Disconnected);
        assert_eq!(rig.transport.disconnects, 1);
    }

    #[test]
    fn test_missing_service_fails_setup() {
        let mut rig = Rig::new(MockTransport { has_service: false, ..Default::default() });
        rig.tick();
        rig.tick();
        rig.tick();
        assert_eq!(rig.machine.status(), ConnectionStatus::Disconnected);
        assert_eq!(rig.machine.session().consecutive_failures(), 1);
        assert!(!rig.transport.link_up);
    }

    #[test]
    fn test_failed_subscription_fails_setup() {
        let mut rig = Rig::new(MockTransport { subscribe_ok: false, ..Default::default() });
        let mut events = Vec::new();
        for _ in 0..10 {
            events.extend(rig.advance(Duration::from_secs(2)));
        }
        assert!(events.contains(&LinkEvent::Lost));
        assert!(!events.contains(&LinkEvent::Ready));
        assert!(rig.machine.session().consecutive_failures() >= 1);
    }

    #[test]
    fn test_link_loss_while_polling() {
        let mut rig = Rig::new(MockTransport::default());
        rig.run_to_polling();
        rig.transport.link_up = false;
        assert_eq!(rig.advance(Duration::from_millis(100)), Some(LinkEvent::Lost));
        assert_eq!(rig.machine.status(), ConnectionStatus::Disconnected);
        assert_eq!(rig.machine.session().consecutive_failures(), 0);
        assert_eq!(rig.transport.disconnects, 1);
    }

    #[test]
    fn test_reactivation_once_per_window_then_reconnect() {
        let mut rig = Rig::new(MockTransport::default());
        rig.run_to_polling();
        rig.transport.take_writes();

        let mut reactivations = 0;
        for _ in 0..290 {
            match rig.advance(Duration::from_millis(100)) {
                Some(LinkEvent::Reactivated) => reactivations += 1,
                Some(other) => panic!("unexpected {other:?}"),
                None => {}
            }
        }
        // 29 s in: one window not yet elapsed.
        assert_eq!(reactivations, 0);
        assert_eq!(rig.advance(Duration::from_secs(1)), Some(LinkEvent::Reactivated));
        assert_eq!(rig.transport.take_writes(), vec![WAKE_COMMAND.to_vec()]);
        assert_eq!(rig.advance(Duration::from_secs(1)), None);

        assert_eq!(rig.advance(STALE), Some(LinkEvent::Reactivated));
        assert_eq!(rig.advance(STALE), Some(LinkEvent::Reactivated));
        assert_eq!(rig.advance(STALE), Some(LinkEvent::Lost));
        assert_eq!(rig.machine.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_data_resets_the_stale_window() {
        let mut rig = Rig::new(MockTransport::default());
        rig.run_to_polling();
        rig.advance(Duration::from_secs(25));
        rig.machine.record_data(rig.now);
        assert_eq!(rig.advance(Duration::from_secs(25)), None);
        assert_eq!(rig.advance(Duration::from_secs(5)), Some(LinkEvent::Reactivated));
    }

    #[test]
    fn test_disable_tears_down() {
        let mut rig = Rig::new(MockTransport::default());
        rig.run_to_polling();
        let dropped = rig.machine.set_enabled(false, &mut rig.transport, rig.now);
        assert!(dropped);
        assert_eq!(rig.transport.disconnects, 1);
        assert_eq!(rig.machine.status(), ConnectionStatus::Disconnected);
        assert_eq!(rig.advance(Duration::from_secs(60)), None);
        assert_eq!(rig.transport.scan_starts, 1);
    }
}
