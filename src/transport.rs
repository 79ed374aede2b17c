//! The radio operations the session engine needs from a BLE stack.
//!
//! Every method must return immediately. Operations that take time on the air (scan,
//! connect) are started and then polled from later ticks. Notifications are pushed into
//! the [`NotificationSink`] handed over at subscribe time, which keeps arrival order.
use bluest::Uuid;
use tokio::sync::mpsc;

/// Which peer to look for: a MAC address, name fragments seen in advertisements, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerFilter {
    pub address: Option<String>,
    pub name_patterns: Vec<String>,
}

fn normalize_address(address: &str) -> String {
    address
        .chars()
        .filter(|c| !matches!(c, ':' | '-'))
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

impl PeerFilter {
    /// True when nothing identifies a peer.
    pub fn is_empty(&self) -> bool {
        self.address.as_deref().map_or(true, |a| a.trim().is_empty())
            && self.name_patterns.iter().all(|p| p.trim().is_empty())
    }

    /// Match an advertisement. `address` is the platform's identifier for the peer and
    /// matches when it contains the wanted address, case-insensitive and ignoring
    /// separators. Names match when they contain any pattern (case-insensitive).
    pub fn matches(&self, name: Option<&str>, address: &str) -> bool {
        let address_match = self
            .address
            .as_deref()
            .filter(|a| !a.trim().is_empty())
            .is_some_and(|wanted| normalize_address(address).contains(&normalize_address(wanted)));
        let name_match = name.is_some_and(|name| {
            let name = name.to_ascii_uppercase();
            self.name_patterns
                .iter()
                .filter(|p| !p.trim().is_empty())
                .any(|p| name.contains(&p.to_ascii_uppercase()))
        });
        address_match || name_match
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanPoll<P> {
    Pending,
    Found(P),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectPoll {
    Pending,
    /// Link up and, when requested, bonded.
    Established,
    Failed(String),
}

/// Where a subscribed characteristic delivers its notifications.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl NotificationSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Hand a notification to the engine. False once the engine is gone.
    pub fn deliver(&self, data: Vec<u8>) -> bool {
        self.tx.send(data).is_ok()
    }
}

pub trait Transport {
    type Peer: Clone + std::fmt::Debug;
    type Service;
    type Characteristic: Clone;

    fn start_scan(&mut self, filter: &PeerFilter) -> bool;
    fn poll_scan(&mut self) -> ScanPoll<Self::Peer>;
    fn stop_scan(&mut self);

    fn start_connect(&mut self, peer: &Self::Peer, use_bonding: bool) -> bool;
    fn poll_connect(&mut self) -> ConnectPoll;

    fn resolve_service(&mut self, uuid: Uuid) -> Option<Self::Service>;
    fn resolve_characteristic(&mut self, service: &Self::Service, uuid: Uuid) -> Option<Self::Characteristic>;

    fn subscribe(&mut self, characteristic: &Self::Characteristic, sink: NotificationSink) -> bool;
    /// Queue a write-without-response. True when the stack accepted the bytes.
    fn write_no_response(&mut self, characteristic: &Self::Characteristic, bytes: &[u8]) -> bool;

    fn is_link_up(&self) -> bool;
    fn disconnect(&mut self);
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;

    /// A scripted transport. Tests flip its fields to simulate the peer.
    pub struct MockTransport {
        pub peer_visible: bool,
        pub scanning: bool,
        pub scan_starts: u32,
        pub connect_script: VecDeque<ConnectPoll>,
        pub connect_default: ConnectPoll,
        pub connecting: bool,
        pub connect_starts: u32,
        pub has_service: bool,
        pub has_characteristics: bool,
        pub subscribe_ok: bool,
        pub sink: Option<NotificationSink>,
        pub link_up: bool,
        pub writes: Vec<Vec<u8>>,
        pub disconnects: u32,
    }

    impl Default for MockTransport {
        fn default() -> Self {
            Self {
                peer_visible: true,
                scanning: false,
                scan_starts: 0,
                connect_script: VecDeque::new(),
                connect_default: ConnectPoll::Established,
                connecting: false,
                connect_starts: 0,
                has_service: true,
                has_characteristics: true,
                subscribe_ok: true,
                sink: None,
                link_up: false,
                writes: Vec::new(),
                disconnects: 0,
            }
        }
    }

    impl MockTransport {
        /// Push bytes as if the peer had notified them.
        pub fn notify(&self, bytes: &[u8]) {
            if let Some(sink) = &self.sink {
                sink.deliver(bytes.to_vec());
            }
        }

        pub fn take_writes(&mut self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.writes)
        }
    }

    impl Transport for MockTransport {
        type Peer = String;
        type Service = Uuid;
        type Characteristic = Uuid;

        fn start_scan(&mut self, _filter: &PeerFilter) -> bool {
            self.scanning = true;
            self.scan_starts += 1;
            true
        }

        fn poll_scan(&mut self) -> ScanPoll<String> {
            if self.scanning && self.peer_visible {
                ScanPoll::Found("EB3A".to_string())
            } else {
                ScanPoll::Pending
            }
        }

        fn stop_scan(&mut self) {
            self.scanning = false;
        }

        fn start_connect(&mut self, _peer: &String, _use_bonding: bool) -> bool {
            self.connecting = true;
            self.connect_starts += 1;
            true
        }

        fn poll_connect(&mut self) -> ConnectPoll {
            if !self.connecting {
                return ConnectPoll::Pending;
            }
            let outcome = self
                .connect_script
                .pop_front()
                .unwrap_or_else(|| self.connect_default.clone());
            match outcome {
                ConnectPoll::Established => {
                    self.connecting = false;
                    self.link_up = true;
                }
                ConnectPoll::Failed(_) => self.connecting = false,
                ConnectPoll::Pending => {}
            }
            outcome
        }

        fn resolve_service(&mut self, uuid: Uuid) -> Option<Uuid> {
            self.has_service.then_some(uuid)
        }

        fn resolve_characteristic(&mut self, _service: &Uuid, uuid: Uuid) -> Option<Uuid> {
            self.has_characteristics.then_some(uuid)
        }

        fn subscribe(&mut self, _characteristic: &Uuid, sink: NotificationSink) -> bool {
            self.sink = Some(sink);
            self.subscribe_ok
        }

        fn write_no_response(&mut self, _characteristic: &Uuid, bytes: &[u8]) -> bool {
            if !self.link_up {
                return false;
            }
            self.writes.push(bytes.to_vec());
            true
        }

        fn is_link_up(&self) -> bool {
            self.link_up
        }

        fn disconnect(&mut self) {
            self.link_up = false;
            self.connecting = false;
            self.scanning = false;
            self.disconnects += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches_address_ignoring_format() {
        let filter = PeerFilter { address: Some("aa:bb:cc:dd:ee:ff".into()), name_patterns: vec![] };
        assert!(filter.matches(None, "AABBCCDDEEFF"));
        assert!(filter.matches(Some("whatever"), "AA-BB-CC-DD-EE-FF"));
        assert!(filter.matches(None, "DeviceId(AA:BB:CC:DD:EE:FF)"));
        assert!(!filter.matches(Some("EB3A"), "11:22:33:44:55:66"));
    }

    #[test]
    fn test_filter_matches_name_patterns() {
        let filter = PeerFilter { address: None, name_patterns: vec!["EB3A".into(), "BLUETTI".into()] };
        assert!(filter.matches(Some("EB3A2237000123"), "x"));
        assert!(filter.matches(Some("bluetti-ac180"), "x"));
        assert!(!filter.matches(Some("AC200"), "x"));
        assert!(!filter.matches(None, "x"));
    }

    #[test]
    fn test_empty_filter() {
        assert!(PeerFilter::default().is_empty());
        assert!(PeerFilter { address: Some(" ".into()), name_patterns: vec![String::new()] }.is_empty());
        assert!(!PeerFilter { address: None, name_patterns: vec!["EB3A".into()] }.is_empty());
    }

    #[test]
    fn test_sink_preserves_order() {
        let (sink, mut rx) = NotificationSink::channel();
        assert!(sink.deliver(vec![1]));
        assert!(sink.deliver(vec![2]));
        assert_eq!(rx.try_recv().unwrap(), vec![1]);
        assert_eq!(rx.try_recv().unwrap(), vec![2]);
        drop(rx);
        assert!(!sink.deliver(vec![3]));
    }
}
