//! Decides which read goes on the air next and matches responses back to it.
//!
//! Only one read is ever outstanding: the wire format does not echo the start register of
//! a read, so a one-register response can only be attributed by remembering what was asked.
//! Writes are not held back by an outstanding read. They are tracked in their own FIFO so
//! an exception can be charged to the control that caused it.
use crate::frame::{build_read_block, CommandFrame, FunctionCode, ResponseFrame};
use crate::registers::{ControlRegister, CORE_BLOCK_LEN, CORE_BLOCK_START};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Settings read one per poll cycle, in turn.
const ROUND_ROBIN: [ControlRegister; 4] = [
    ControlRegister::EcoMode,
    ControlRegister::PowerLifting,
    ControlRegister::LedMode,
    ControlRegister::EcoShutdown,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadRequest {
    /// The 40 register telemetry block.
    Block,
    Single(u16),
}

impl ReadRequest {
    fn frame(self) -> CommandFrame {
        match self {
            Self::Block => build_read_block(CORE_BLOCK_START, CORE_BLOCK_LEN),
            Self::Single(address) => build_read_block(address, 1),
        }
    }
}

/// Position in the settings round robin and the register most recently asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollCursor {
    next: usize,
    last_requested: Option<u16>,
}

impl PollCursor {
    pub fn last_requested(&self) -> Option<u16> {
        self.last_requested
    }

    /// The register due this cycle. Moves the cursor on by one.
    fn advance(&mut self) -> ControlRegister {
        let register = ROUND_ROBIN[self.next % ROUND_ROBIN.len()];
        self.next = (self.next + 1) % ROUND_ROBIN.len();
        register
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingRead {
    request: ReadRequest,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy)]
struct UnackedWrite {
    register: u16,
    deadline: Instant,
}

/// What an inbound frame turned out to be, once matched against what was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Block(Vec<u16>),
    Single { address: u16, value: u16 },
    WriteAccepted { register: u16, value: u16 },
    WriteRejected { register: u16, exception_code: u8 },
    ReadRejected { request: Option<ReadRequest>, exception_code: u8 },
    Discarded,
}

#[derive(Debug)]
pub struct PollScheduler {
    interval: Duration,
    request_gap: Duration,
    request_timeout: Duration,
    running: bool,
    cycle_started: Option<Instant>,
    queue: VecDeque<ReadRequest>,
    pending: Option<PendingRead>,
    next_send_at: Option<Instant>,
    cursor: PollCursor,
    unacked: VecDeque<UnackedWrite>,
    last_write_register: Option<u16>,
}

impl PollScheduler {
    pub fn new(interval: Duration, request_gap: Duration, request_timeout: Duration) -> Self {
        Self {
            interval,
            request_gap,
            request_timeout,
            running: false,
            cycle_started: None,
            queue: VecDeque::new(),
            pending: None,
            next_send_at: None,
            cursor: PollCursor::default(),
            unacked: VecDeque::new(),
            last_write_register: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Measured from the start of the current cycle.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn cursor(&self) -> &PollCursor {
        &self.cursor
    }

    pub fn last_write_register(&self) -> Option<u16> {
        self.last_write_register
    }

    pub fn has_pending_read(&self) -> bool {
        self.pending.is_some()
    }

    /// Begin polling. The first cycle, block read first, is due immediately.
    pub fn start(&mut self, now: Instant) {
        self.stop();
        self.running = true;
        self.next_send_at = Some(now);
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.cycle_started = None;
        self.queue.clear();
        self.pending = None;
        self.next_send_at = None;
        self.cursor.last_requested = None;
        self.unacked.clear();
        self.last_write_register = None;
    }

    /// Drop whatever read is in flight and put a block read at the front of the queue.
    pub fn request_block_now(&mut self, now: Instant) {
        if let Some(pending) = self.pending.take() {
            debug!("Abandoning outstanding {:?} read", pending.request);
        }
        self.queue.retain(|request| *request != ReadRequest::Block);
        self.queue.push_front(ReadRequest::Block);
        self.next_send_at = Some(now);
    }

    /// Queue a read of `register` to confirm a setting that was just written.
    pub fn queue_confirm(&mut self, register: u16) {
        let request = ReadRequest::Single(register);
        if !self.queue.contains(&request) {
            self.queue.push_back(request);
        }
    }

    /// Remember a write that went out so a later exception can be attributed to it.
    pub fn record_write(&mut self, register: u16, now: Instant) {
        self.unacked.push_back(UnackedWrite { register, deadline: now + self.request_timeout });
        self.last_write_register = Some(register);
    }

    /// The next read to send, if one is due and nothing is outstanding.
    pub fn next_frame(&mut self, now: Instant) -> Option<CommandFrame> {
        if !self.running {
            return None;
        }
        self.expire(now);

        if self.cycle_started.map_or(true, |at| now.saturating_duration_since(at) >= self.interval) {
            self.cycle_started = Some(now);
            self.enqueue_cycle();
        }

        if self.pending.is_some() || self.next_send_at.is_some_and(|at| now < at) {
            return None;
        }
        let request = self.queue.pop_front()?;
        self.pending = Some(PendingRead { request, deadline: now + self.request_timeout });
        self.cursor.last_requested = Some(match request {
            ReadRequest::Block => CORE_BLOCK_START,
            ReadRequest::Single(address) => address,
        });
        Some(request.frame())
    }

    fn enqueue_cycle(&mut self) {
        let round_robin = self.cursor.advance();
        for request in [
            ReadRequest::Block,
            ReadRequest::Single(ControlRegister::ChargingMode.address()),
            ReadRequest::Single(round_robin.address()),
        ] {
            if !self.queue.contains(&request) {
                self.queue.push_back(request);
            }
        }
    }

    fn expire(&mut self, now: Instant) {
        if let Some(pending) = self.pending {
            if now >= pending.deadline {
                warn!("No response to {:?} read within {:?}", pending.request, self.request_timeout);
                self.pending = None;
                self.next_send_at = Some(now);
            }
        }
        while self.unacked.front().is_some_and(|write| now >= write.deadline) {
            if let Some(write) = self.unacked.pop_front() {
                debug!("Write to {:#06x} was never acknowledged", write.register);
            }
        }
    }

    fn complete_read(&mut self, now: Instant) {
        self.pending = None;
        self.next_send_at = Some(now + self.request_gap);
    }

    /// Match a parsed frame against the outstanding read or the unacked writes.
    pub fn on_response(&mut self, frame: ResponseFrame, now: Instant) -> Routed {
        match frame {
            ResponseFrame::DataBlock { registers } => self.route_data(registers, now),
            ResponseFrame::SingleRegister { address, value } => {
                self.complete_read(now);
                Routed::Single { address, value }
            }
            ResponseFrame::WriteAck { address, value } => {
                match self.unacked.iter().position(|write| write.register == address) {
                    Some(index) => {
                        self.unacked.remove(index);
                    }
                    None => debug!("Ack for a write to {address:#06x} that is no longer tracked"),
                }
                Routed::WriteAccepted { register: address, value }
            }
            ResponseFrame::Exception { function_code, exception_code }
                if function_code == FunctionCode::WriteSingleRegister as u8 =>
            {
                let register = self
                    .unacked
                    .pop_front()
                    .map(|write| write.register)
                    .or(self.last_write_register);
                match register {
                    Some(register) => Routed::WriteRejected { register, exception_code },
                    None => {
                        warn!("Write exception {exception_code:#04x} with no write to attribute it to");
                        Routed::Discarded
                    }
                }
            }
            ResponseFrame::Exception { exception_code, .. } => {
                let request = self.pending.map(|pending| pending.request);
                self.complete_read(now);
                Routed::ReadRejected { request, exception_code }
            }
            ResponseFrame::Malformed { reason } => {
                warn!("Discarding malformed frame: {reason}");
                Routed::Discarded
            }
        }
    }

    /// Blocks are told apart by length: every block read has the same base, so a
    /// multi-register payload is telemetry whatever is pending. A one-register payload is
    /// only meaningful against a pending single read.
    fn route_data(&mut self, registers: Vec<u16>, now: Instant) -> Routed {
        let pending = self.pending.map(|pending| pending.request);

        if registers.len() > 1 {
            if pending == Some(ReadRequest::Block) {
                self.complete_read(now);
            } else {
                debug!("Block response outside a block read accepted");
            }
            return Routed::Block(registers);
        }

        if let Some(ReadRequest::Single(requested)) = pending {
            if let ResponseFrame::SingleRegister { address, value } =
                (ResponseFrame::DataBlock { registers }).attribute(requested)
            {
                self.complete_read(now);
                return Routed::Single { address, value };
            }
        }
        debug!("Single register response with no single read outstanding, discarded");
        Routed::Discarded
    }
}
