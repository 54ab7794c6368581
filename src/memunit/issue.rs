use log::{debug, trace};

use super::message::TransactionTracker;
use super::mshr::MshrEntry;
use super::queue::EntryHandle;
use super::types::{InsnId, MemOpKind, PhysAddr, Segment, Status};
use super::{Effect, MemMessage, MemUnit, MessageKind};

impl MemUnit {
    /// Ask the arbiter for a memory port on behalf of `handle`.
    pub(super) fn request_port(&mut self, handle: EntryHandle) {
        let Some(entry) = self.queue.get(handle) else {
            return;
        };
        let status = entry.status();
        if !matches!(status, Status::AwaitingIssue | Status::AwaitingPort) {
            // the store half of a speculatively retired atomic may still go out
            let store_half = entry.is_atomic()
                && ((!entry.store_complete && status == Status::Complete)
                    || status == Status::AwaitingValue);
            if !store_half {
                trace!("port request by {} ignored in {status:?}", entry.insn());
                return;
            }
        }
        if entry.partial_snoop && self.queue.segment_head(Segment::Active) != Some(handle) {
            trace!("partial snoop {} waits for the active head", entry.insn());
            return;
        }
        let (op, age, insn) = (entry.op(), entry.seq(), entry.insn());
        self.arbiter.request(op, age, insn);
        if let Some(entry) = self.queue.get_mut(handle) {
            entry.issued = true;
        }
        self.arbiter.kill_store_prefetch(insn);
    }

    /// Port granted: build the request and send it, unless an outstanding miss to the same
    /// address absorbs or blocks it.
    pub(super) fn issue(&mut self, insn: InsnId) {
        let Some(handle) = self.queue.find(insn) else {
            trace!("port grant for {insn} ignored, entry gone");
            return;
        };
        let Some(entry) = self.queue.get(handle) else {
            return;
        };
        let status = entry.status();
        let spec_write = entry.is_atomic() && status == Status::Complete && !entry.store_complete;
        if status != Status::AwaitingPort && !spec_write {
            trace!("port grant for {insn} ignored in {status:?}");
            return;
        }

        let kind = match entry.op() {
            MemOpKind::Load => MessageKind::LoadRequest,
            MemOpKind::Store => MessageKind::StoreRequest,
            MemOpKind::Rmw | MemOpKind::Cas
                if !self.config.speculative_order || entry.is_abnormal() =>
            {
                if entry.op() == MemOpKind::Rmw {
                    MessageKind::RmwRequest
                } else {
                    MessageKind::CasRequest
                }
            }
            MemOpKind::Rmw | MemOpKind::Cas if entry.segment() == Segment::Active => {
                MessageKind::AtomicPreloadRequest
            }
            MemOpKind::Rmw | MemOpKind::Cas => MessageKind::StoreRequest,
            MemOpKind::Fence => return,
        };

        let Some(paddr) = entry.paddr().usable() else {
            self.issue_unmapped(handle, kind);
            return;
        };
        let size = entry.size();
        let blocked = match kind {
            MessageKind::LoadRequest => {
                if self.mshrs.scan_and_attach(paddr, size, handle) {
                    if let Some(entry) = self.queue.get_mut(handle) {
                        entry.mshr = Some(paddr);
                    }
                    self.stats.mshr_attached += 1;
                    trace!("{insn} attached to outstanding load at {paddr:#x}");
                    return;
                }
                self.mshrs.scan_and_block(paddr, insn)
            }
            _ => self.mshrs.scan_and_block(paddr, insn),
        };
        if blocked {
            self.stats.mshr_blocked += 1;
            trace!("{insn} stalled behind outstanding miss at {paddr:#x}");
            return;
        }

        let mut tracker =
            TransactionTracker::new(self.ctx.next_transaction_id(), paddr, Some(insn), self.now);
        tracker.speculative_atomic_load = kind == MessageKind::AtomicPreloadRequest;
        let mut mshr = MshrEntry::new(paddr, kind, size, tracker);
        mshr.waiting.push(handle);
        self.mshrs.allocate(mshr);

        let Some(entry) = self.queue.get_mut(handle) else {
            return;
        };
        entry.mshr = Some(paddr);
        let message = MemMessage {
            value: entry.value.unwrap_or(0),
            compare_value: entry.compare_value,
            insn: Some(insn),
            tracker: Some(tracker),
            side_effect: entry.side_effect,
            non_cacheable: entry.non_cacheable,
            naw: entry.bypass_sb(),
            atomic: kind == MessageKind::StoreRequest && entry.is_atomic(),
            ..MemMessage::new(kind, paddr, size)
        };
        match kind {
            MessageKind::LoadRequest => self.stats.issued_loads += 1,
            MessageKind::StoreRequest => self.stats.issued_stores += 1,
            MessageKind::AtomicPreloadRequest => self.stats.issued_preloads += 1,
            _ => self.stats.issued_atomics += 1,
        }
        debug!("{insn} issues {kind:?} to {paddr:#x}");
        self.send(message);
    }

    /// Accesses without a usable address never reach memory.
    fn issue_unmapped(&mut self, handle: EntryHandle, kind: MessageKind) {
        let Some(entry) = self.queue.get_mut(handle) else {
            return;
        };
        let insn = entry.insn();
        match kind {
            MessageKind::LoadRequest | MessageKind::AtomicPreloadRequest => {
                entry.set_load_value(Some(0));
                if entry.is_atomic() {
                    entry.value.get_or_insert(0);
                }
                self.satisfy(insn);
            }
            _ if entry.is_atomic() => self.satisfy(insn),
            _ => {
                debug!("dropping store {insn} without a usable address");
                self.erase_entry(handle);
            }
        }
    }

    /// Committed-send head store: short-circuit it when RMO lets it complete against on-chip
    /// permission, otherwise ask for a port.
    pub(super) fn issue_store(&mut self) {
        let Some(front) = self.queue.front() else {
            return;
        };
        let Some(entry) = self.queue.get(front) else {
            return;
        };
        if entry.segment() != Segment::CommittedSend
            || entry.status() != Status::AwaitingIssue
            || entry.is_abnormal()
        {
            return;
        }
        if self.config.is_rmo() && !entry.is_atomic() && !entry.non_cacheable {
            if let Some(paddr) = entry.paddr().usable() {
                if self.holds_write_permission(paddr) {
                    let (size, value) = (entry.size(), entry.value.unwrap_or(0));
                    trace!("short-circuit store {}", entry.insn());
                    if let Some(entry) = self.queue.get_mut(front) {
                        entry.issued = true;
                    }
                    self.stats.short_circuit_stores += 1;
                    self.effects.push(Effect::DeferredWrite { paddr, size, value });
                    let reply = MemMessage::new(MessageKind::StoreReply, paddr, size).with_value(value);
                    self.complete_lsq(front, &reply);
                    return;
                }
            }
        }
        self.request_port(front);
    }

    pub(super) fn issue_atomic_spec_write(&mut self) {
        let Some(front) = self.queue.front() else {
            return;
        };
        let Some(entry) = self.queue.get_mut(front) else {
            return;
        };
        if entry.segment() == Segment::CommittedSend
            && entry.is_atomic()
            && !entry.issued
            && entry.status() == Status::Complete
        {
            debug_assert!(self.config.speculative_order);
            entry.issued = false;
            self.request_port(front);
        }
    }

    pub(super) fn issue_partial_snoop(&mut self) {
        if self.partial_snoops == 0 {
            return;
        }
        let Some(head) = self.queue.segment_head(Segment::Active) else {
            return;
        };
        let ready = self.queue.get(head).is_some_and(|entry| {
            entry.partial_snoop
                && matches!(entry.status(), Status::AwaitingIssue | Status::AwaitingPort)
        });
        if ready {
            self.request_port(head);
        }
    }

    /// Atomics that could not go out speculatively issue from the queue front once they reach
    /// the head of the ROB.
    pub(super) fn issue_atomic(&mut self) {
        let Some(front) = self.queue.front() else {
            return;
        };
        let Some(entry) = self.queue.get_mut(front) else {
            return;
        };
        let insn = entry.insn();
        if !entry.is_atomic()
            || entry.status() != Status::AwaitingIssue
            || entry.value.is_none()
            || !self.core.is_head(insn)
        {
            return;
        }
        if entry.partial_snoop {
            entry.partial_snoop = false;
            self.partial_snoops -= 1;
        }
        if entry.paddr() == PhysAddr::Invalid {
            entry.issued = true;
            entry.extended_value = Some(0);
            entry.store_complete = true;
            self.resolve_speculation(insn);
            self.satisfy(insn);
        } else {
            self.request_port(front);
        }
    }

    /// Start the serialization delay of an abnormal access at the active head.
    pub(super) fn issue_special(&mut self) {
        let Some(head) = self.queue.segment_head(Segment::Active) else {
            return;
        };
        let now = self.now;
        let latency = self.config.side_effect_latency;
        let speculating = self.spec.speculating;
        let Some(entry) = self.queue.get_mut(head) else {
            return;
        };
        if !entry.is_abnormal()
            || entry.is_marker()
            || entry.status() != Status::AwaitingIssue
            || entry.extra_latency_timeout.is_some()
            || !self.core.is_head(entry.insn())
        {
            return;
        }
        if entry.exception || entry.bypass_sb() {
            entry.extra_latency_timeout = Some(now);
        } else if !speculating {
            entry.extra_latency_timeout = Some(now + latency);
        }
    }

    pub(super) fn check_extra_latency_timeout(&mut self) {
        let Some(head) = self.queue.segment_head(Segment::Active) else {
            return;
        };
        let now = self.now;
        let Some(entry) = self.queue.get_mut(head) else {
            return;
        };
        let expired = entry.extra_latency_timeout.is_some_and(|t| t <= now);
        if !expired || entry.status() != Status::AwaitingIssue {
            return;
        }
        let insn = entry.insn();
        debug!("abnormal access {insn} completes");
        entry.issued = true;
        if entry.is_load() {
            entry.set_load_value(Some(0));
        }
        if entry.is_store() {
            entry.store_complete = true;
        }
        if !entry.exception && entry.is_load() {
            entry.force_resync = true;
            self.effects.push(Effect::ForceResync(insn));
        }
        self.satisfy(insn);
    }

    /// Guess the old value of the head atomic while its preload is outstanding.
    pub(super) fn value_predict_atomic(&mut self) {
        if !self.config.speculate_on_atomic_value || self.value_predict_inhibit {
            return;
        }
        let Some(head) = self.queue.segment_head(Segment::Active) else {
            return;
        };
        let Some(entry) = self.queue.get_mut(head) else {
            return;
        };
        let insn = entry.insn();
        let cas = entry.op() == MemOpKind::Cas;
        if !entry.is_atomic()
            || entry.is_abnormal()
            || entry.extended_value.is_some()
            || entry.partial_snoop
            || (cas && entry.compare_value.is_none())
            || entry.status() != Status::IssuedToMemory
            || !self.core.is_head(insn)
        {
            return;
        }
        entry.extended_value = if cas { entry.compare_value } else { Some(0) };
        entry.speculated_value = true;
        self.stats.value_predictions += 1;
        trace!("value-predicting {insn}");
        self.satisfy(insn);
    }

    pub(super) fn request_store_prefetch(&mut self, handle: EntryHandle) {
        let Some(entry) = self.queue.get(handle) else {
            return;
        };
        if entry.paddr().usable().is_some() && !entry.is_abnormal() && !entry.bypass_sb() {
            self.arbiter.request_store_prefetch(entry.seq(), entry.insn());
        }
    }

    pub(super) fn issue_store_prefetch(&mut self, insn: InsnId) {
        let Some(handle) = self.queue.find(insn) else {
            return;
        };
        let Some(entry) = self.queue.get(handle) else {
            return;
        };
        let Some(paddr) = entry.paddr().usable() else {
            return;
        };
        if entry.is_abnormal() || entry.bypass_sb() {
            return;
        }
        let (size, op) = (entry.size(), entry.op());
        let line = self.line_of(paddr);
        match self.spec.sb_lines.get(&line) {
            Some(permission) if permission.held => {
                trace!("prefetch by {insn} ignored, permission on chip");
                return;
            }
            None if !self.config.prefetch_early => {
                debug!("prefetch by {insn} to untracked line {line:#x}");
            }
            _ => {}
        }
        if self.mshrs.scan_and_block_prefetch(paddr, insn) {
            self.stats.store_prefetch_conflicts += 1;
            return;
        }
        if self.outstanding_prefetches.contains_key(&line) {
            self.stats.store_prefetch_duplicates += 1;
            return;
        }
        self.outstanding_prefetches.insert(line, insn);

        let tracker =
            TransactionTracker::new(self.ctx.next_transaction_id(), paddr, Some(insn), self.now);
        let message = MemMessage {
            insn: Some(insn),
            tracker: Some(tracker),
            ..MemMessage::new(MessageKind::StorePrefetchRequest, paddr, size)
        };
        if op == MemOpKind::Store {
            self.stats.store_prefetches += 1;
        } else {
            self.stats.atomic_prefetches += 1;
        }
        trace!("{insn} prefetches write permission for {line:#x}");
        self.send(message);
    }
}
