use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Scanning,
    Connecting,
    Setup,
    Polling,
}

/// Retry pacing between connection sequences.
///
/// After `slow_after` consecutive failed sequences the interval switches from `fast` to
/// `slow`, which spares the radio when the station is simply powered off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub fast: Duration,
    pub slow: Duration,
    pub slow_after: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            fast: Duration::from_secs(10),
            slow: Duration::from_secs(5 * 60),
            slow_after: 6,
        }
    }
}

/// Connection bookkeeping. Mutated only by the connection state machine.
#[derive(Debug, Clone)]
pub struct Session {
    status: ConnectionStatus,
    /// Connect attempts within the current sequence.
    attempts: u32,
    last_attempt_at: Option<Instant>,
    last_data_at: Option<Instant>,
    consecutive_failures: u32,
    retry_interval: Duration,
    policy: BackoffPolicy,
}

impl Session {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            attempts: 0,
            last_attempt_at: None,
            last_data_at: None,
            consecutive_failures: 0,
            retry_interval: policy.fast,
            policy,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_attempt_at(&self) -> Option<Instant> {
        self.last_attempt_at
    }

    pub fn last_data_at(&self) -> Option<Instant> {
        self.last_data_at
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// True once the retry interval since the last sequence began or failed has passed.
    pub fn retry_due(&self, now: Instant) -> bool {
        self.last_attempt_at
            .map_or(true, |at| now.saturating_duration_since(at) >= self.retry_interval)
    }

    pub(crate) fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            info!("Connection {:?} -> {:?}", self.status, status);
            self.status = status;
        }
    }

    pub(crate) fn begin_sequence(&mut self, now: Instant) {
        self.attempts = 0;
        self.last_attempt_at = Some(now);
    }

    pub(crate) fn count_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub(crate) fn record_data(&mut self, now: Instant) {
        self.last_data_at = Some(now);
    }

    pub(crate) fn record_success(&mut self, now: Instant) {
        if self.consecutive_failures > 0 || self.retry_interval != self.policy.fast {
            info!("Connected, back to fast retries");
        }
        self.consecutive_failures = 0;
        self.attempts = 0;
        self.retry_interval = self.policy.fast;
        self.last_data_at = Some(now);
    }

    pub(crate) fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        self.attempts = 0;
        self.last_attempt_at = Some(now);
        self.set_status(ConnectionStatus::Disconnected);
        if self.consecutive_failures >= self.policy.slow_after && self.retry_interval != self.policy.slow {
            info!(
                "{} failed connection sequences, retrying every {:?}",
                self.consecutive_failures, self.policy.slow
            );
            self.retry_interval = self.policy.slow;
        }
    }

    /// Link went away without a failed sequence; allow a prompt retry.
    pub(crate) fn record_link_loss(&mut self, now: Instant) {
        self.attempts = 0;
        self.last_attempt_at = Some(now);
        self.set_status(ConnectionStatus::Disconnected);
    }
}

#[test]
fn test_backoff_escalates_and_resets() {
    let policy = BackoffPolicy::default();
    let mut session = Session::new(policy);
    let now = Instant::now();
    for _ in 0..5 {
        session.record_failure(now);
        assert_eq!(session.retry_interval(), policy.fast);
    }
    session.record_failure(now);
    assert_eq!(session.consecutive_failures(), 6);
    assert_eq!(session.retry_interval(), policy.slow);

    session.record_success(now);
    assert_eq!(session.consecutive_failures(), 0);
    assert_eq!(session.retry_interval(), policy.fast);
}

#[test]
fn test_retry_due() {
    let now = Instant::now();
    let mut session = Session::new(BackoffPolicy::default());
    assert!(session.retry_due(now));
    session.begin_sequence(now);
    assert!(!session.retry_due(now + Duration::from_secs(9)));
    assert!(session.retry_due(now + Duration::from_secs(10)));
}

#[test]
fn test_timestamps_follow_sequence_and_data() {
    let now = Instant::now();
    let mut session = Session::new(BackoffPolicy::default());
    assert_eq!(session.last_attempt_at(), None);
    assert_eq!(session.last_data_at(), None);

    session.begin_sequence(now);
    session.record_success(now + Duration::from_secs(8));
    assert_eq!(session.last_attempt_at(), Some(now));
    assert_eq!(session.last_data_at(), Some(now + Duration::from_secs(8)));

    session.record_data(now + Duration::from_secs(30));
    session.record_link_loss(now + Duration::from_secs(40));
    assert_eq!(session.last_data_at(), Some(now + Duration::from_secs(30)));
    assert_eq!(session.last_attempt_at(), Some(now + Duration::from_secs(40)));
}
