//! Write capability learned from the peer at runtime.
//!
//! Which control registers accept writes is undocumented and varies by firmware (eco mode
//! is refused on some units). A register is only marked rejected on an explicit exception
//! response attributed to it, and is never written again for the rest of the session.
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Unknown,
    Accepted,
    Rejected { exception_code: u8 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CapabilityLedger {
    registers: BTreeMap<u16, Capability>,
}

impl CapabilityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: u16) -> Capability {
        self.registers.get(&address).copied().unwrap_or(Capability::Unknown)
    }

    pub fn may_write(&self, address: u16) -> bool {
        !matches!(self.get(address), Capability::Rejected { .. })
    }

    pub fn record_rejection(&mut self, address: u16, exception_code: u8) {
        info!("Register {address:#06x} rejected writes (exception {exception_code:#04x}), suppressing further writes");
        self.registers.insert(address, Capability::Rejected { exception_code });
    }

    /// A write ack never overrides an earlier rejection.
    pub fn record_acceptance(&mut self, address: u16) {
        if self.may_write(address) {
            debug!("Register {address:#06x} accepted a write");
            self.registers.insert(address, Capability::Accepted);
        }
    }

    /// Registers known to reject writes.
    pub fn rejected(&self) -> impl Iterator<Item = u16> + '_ {
        self.registers
            .iter()
            .filter(|(_, capability)| matches!(capability, Capability::Rejected { .. }))
            .map(|(&address, _)| address)
    }

    pub fn clear(&mut self) {
        self.registers.clear();
    }
}

#[test]
fn test_unknown_registers_may_be_written() {
    let ledger = CapabilityLedger::new();
    assert_eq!(ledger.get(0x0bf7), Capability::Unknown);
    assert!(ledger.may_write(0x0bf7));
}

#[test]
fn test_rejection_is_permanent() {
    let mut ledger = CapabilityLedger::new();
    ledger.record_rejection(0x0bf7, 0x02);
    ledger.record_acceptance(0x0bf7);
    assert!(!ledger.may_write(0x0bf7));
    assert_eq!(ledger.get(0x0bf7), Capability::Rejected { exception_code: 0x02 });
    assert_eq!(ledger.rejected().collect::<Vec<_>>(), vec![0x0bf7]);
}

#[test]
fn test_clear_forgets_rejections() {
    let mut ledger = CapabilityLedger::new();
    ledger.record_acceptance(0x0bbf);
    ledger.record_rejection(0x0bf7, 0x02);
    ledger.clear();
    assert!(ledger.may_write(0x0bf7));
    assert_eq!(ledger.get(0x0bbf), Capability::Unknown);
}
