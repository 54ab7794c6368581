use std::collections::VecDeque;

use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::base::mem::HasMemory;
use crate::memunit::{line_of, MemMessage, MemUnit, MessageKind, Paddr};
use crate::sim::config::MemSystemConfig;
use crate::sim::sparse_mem::SparseMemory;
use crate::timeq::{Cycle, ServiceRequest, TimedServer};

const RECENT_LINES: usize = 16;

/// Single-level coherent memory seen by one core. Requests are timed by a `TimedServer` and
/// performed against the backing store when they mature; unsolicited snoops to recently touched
/// lines stand in for the other agents of the system.
pub struct CoherentMemory {
    config: MemSystemConfig,
    coherence_unit: u64,
    server: TimedServer<MemMessage>,
    backing: SparseMemory,
    rng: StdRng,
    recent_lines: VecDeque<Paddr>,
    outbox: VecDeque<MemMessage>,
    acks: u64,
    performed: u64,
    snoops_sent: u64,
}

impl CoherentMemory {
    pub fn new(config: MemSystemConfig, coherence_unit: u64, seed: u64) -> Self {
        Self {
            server: TimedServer::new(config.server()),
            config,
            coherence_unit,
            backing: SparseMemory::new(),
            rng: StdRng::seed_from_u64(seed),
            recent_lines: VecDeque::with_capacity(RECENT_LINES),
            outbox: VecDeque::new(),
            acks: 0,
            performed: 0,
            snoops_sent: 0,
        }
    }

    /// Take one message from the core. Snoop responses are absorbed immediately; requests
    /// are handed back when the server queue is full.
    pub fn accept(&mut self, now: Cycle, message: MemMessage) -> Result<(), MemMessage> {
        match message.kind {
            MessageKind::InvalidateAck
            | MessageKind::DowngradeAck
            | MessageKind::ProbeAck
            | MessageKind::ReturnReply => {
                self.acks += 1;
                return Ok(());
            }
            _ => {}
        }
        let size = message.size.max(1) as u32;
        let line = line_of(message.paddr, self.coherence_unit);
        match self.server.try_enqueue(now, ServiceRequest::new(message, size)) {
            Ok(ticket) => {
                trace!("mem accepted request, ready at {}", ticket.ready_at());
                self.touch(line);
                Ok(())
            }
            Err(backpressure) => Err(backpressure.into_request().payload),
        }
    }

    fn touch(&mut self, line: Paddr) {
        if self.recent_lines.contains(&line) {
            return;
        }
        if self.recent_lines.len() == RECENT_LINES {
            self.recent_lines.pop_front();
        }
        self.recent_lines.push_back(line);
    }

    /// Perform matured requests, inject snoops and deliver as many replies as the unit will
    /// take this cycle.
    pub fn tick(&mut self, now: Cycle, unit: &mut MemUnit) -> anyhow::Result<()> {
        let mut matured = Vec::new();
        self.server
            .service_ready(now, |result| matured.push(result.payload));
        for request in matured {
            if let Some(reply) = self.perform(&request)? {
                self.outbox.push_back(reply);
            }
        }
        self.inject_snoops();

        while unit.can_push_reply() {
            let Some(message) = self.outbox.pop_front() else {
                break;
            };
            unit.push_reply(message)?;
        }
        Ok(())
    }

    fn perform(&mut self, request: &MemMessage) -> anyhow::Result<Option<MemMessage>> {
        let Some(kind) = request.kind.reply_kind() else {
            debug!("mem ignoring {:?}", request.kind);
            return Ok(None);
        };
        let (paddr, size) = (request.paddr, request.size);
        let reply = request.answered(kind);
        self.performed += 1;
        let reply = match request.kind {
            MessageKind::LoadRequest => {
                let value = self.backing.read(paddr, size)?;
                reply.with_value(value).with_extended(value)
            }
            MessageKind::AtomicPreloadRequest => {
                let old = self.backing.read(paddr, size)?;
                reply.with_value(old).with_extended(old)
            }
            MessageKind::StoreRequest => {
                self.backing.write(paddr, size, request.value)?;
                reply
            }
            MessageKind::RmwRequest => {
                let old = self.backing.read(paddr, size)?;
                self.backing.write(paddr, size, request.value)?;
                reply.with_extended(old)
            }
            MessageKind::CasRequest => {
                let old = self.backing.read(paddr, size)?;
                if request.compare_value == Some(old) {
                    self.backing.write(paddr, size, request.value)?;
                }
                reply.with_value(old).with_extended(old)
            }
            _ => reply,
        };
        Ok(Some(reply))
    }

    fn inject_snoops(&mut self) {
        if self.recent_lines.is_empty() {
            return;
        }
        for (kind, rate) in [
            (MessageKind::Invalidate, self.config.invalidate_rate),
            (MessageKind::Downgrade, self.config.downgrade_rate),
            (MessageKind::Probe, self.config.probe_rate),
        ] {
            if rate <= 0.0 || !self.rng.gen_bool(rate) {
                continue;
            }
            let pick = self.rng.gen_range(0..self.recent_lines.len());
            let Some(&line) = self.recent_lines.get(pick) else {
                continue;
            };
            trace!("mem injects {kind:?} to {line:#x}");
            self.snoops_sent += 1;
            self.outbox.push_back(MemMessage::new(kind, line, 8));
        }
    }

    /// Stores that the unit completed without a transaction go straight to the backing store.
    pub fn write_deferred(&mut self, paddr: Paddr, size: u8, value: u64) -> anyhow::Result<()> {
        self.backing.write(paddr, size, value)
    }

    pub fn read(&self, paddr: Paddr, size: u8) -> anyhow::Result<u64> {
        self.backing.read(paddr, size)
    }

    pub fn is_idle(&self) -> bool {
        self.server.is_empty() && self.outbox.is_empty()
    }

    pub fn acks(&self) -> u64 {
        self.acks
    }

    pub fn performed(&self) -> u64 {
        self.performed
    }

    pub fn snoops_sent(&self) -> u64 {
        self.snoops_sent
    }
}
