use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use log::trace;

use super::types::{InsnClass, InsnId, MemOpKind, Segment, Status};
use super::MemUnit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortRequest {
    /// Memory sequence number; smaller is older.
    pub age: u64,
    pub insn: InsnId,
}

/// Pending port requests in three classes. Stores and atomics always beat reads; store prefetches
/// are slotted in according to core state.
#[derive(Debug, Default)]
pub struct PortArbiter {
    priority: BinaryHeap<Reverse<PortRequest>>,
    reads: BinaryHeap<Reverse<PortRequest>>,
    prefetches: BTreeSet<PortRequest>,
    prefetch_age: HashMap<InsnId, u64>,
    in_order: bool,
}

impl PortArbiter {
    pub fn new(in_order: bool) -> Self {
        Self {
            in_order,
            ..Self::default()
        }
    }

    pub fn request(&mut self, op: MemOpKind, age: u64, insn: InsnId) {
        if self.in_order {
            return;
        }
        let request = Reverse(PortRequest { age, insn });
        match op {
            MemOpKind::Load => self.reads.push(request),
            MemOpKind::Store | MemOpKind::Rmw | MemOpKind::Cas => self.priority.push(request),
            MemOpKind::Fence => {}
        }
    }

    /// At most one pending prefetch per instruction.
    pub fn request_store_prefetch(&mut self, age: u64, insn: InsnId) {
        if self.prefetch_age.contains_key(&insn) {
            return;
        }
        self.prefetch_age.insert(insn, age);
        self.prefetches.insert(PortRequest { age, insn });
    }

    pub fn kill_store_prefetch(&mut self, insn: InsnId) {
        if let Some(age) = self.prefetch_age.remove(&insn) {
            self.prefetches.remove(&PortRequest { age, insn });
        }
    }

    pub fn pop_priority(&mut self) -> Option<PortRequest> {
        self.priority.pop().map(|Reverse(request)| request)
    }

    pub fn pop_read(&mut self) -> Option<PortRequest> {
        self.reads.pop().map(|Reverse(request)| request)
    }

    pub fn pop_prefetch(&mut self) -> Option<PortRequest> {
        let request = self.prefetches.pop_first()?;
        self.prefetch_age.remove(&request.insn);
        Some(request)
    }

    pub fn has_priority(&self) -> bool {
        !self.priority.is_empty()
    }

    pub fn has_reads(&self) -> bool {
        !self.reads.is_empty()
    }

    pub fn pending_prefetches(&self) -> usize {
        self.prefetches.len()
    }

    pub fn has_prefetch(&self, insn: InsnId) -> bool {
        self.prefetch_age.contains_key(&insn)
    }

    pub fn is_empty(&self) -> bool {
        self.priority.is_empty() && self.reads.is_empty() && self.prefetches.is_empty()
    }

    pub fn clear(&mut self) {
        self.priority.clear();
        self.reads.clear();
        self.prefetches.clear();
        self.prefetch_age.clear();
    }
}

impl MemUnit {
    pub(super) fn arbitrate(&mut self) {
        if self.config.in_order_memory {
            self.arbitrate_in_order();
            return;
        }
        let max_prefetches = self.config.max_store_prefetches;
        while !self.arbiter.is_empty() && self.has_memory_port() {
            if let Some(grant) = self.arbiter.pop_priority() {
                trace!("priority grant {}", grant.insn);
                self.issue(grant.insn);
                continue;
            }

            let warranted = self.arbiter.pending_prefetches() > 0
                && (self.core.spinning
                    || matches!(
                        self.core.head_class(),
                        InsnClass::Atomic | InsnClass::Fence(_) | InsnClass::Synchronizing
                    )
                    || self.arbiter.pending_prefetches() > max_prefetches);
            if warranted && self.outstanding_prefetches.len() < max_prefetches {
                if let Some(grant) = self.arbiter.pop_prefetch() {
                    self.issue_store_prefetch(grant.insn);
                    continue;
                }
            }

            if let Some(grant) = self.arbiter.pop_read() {
                trace!("read grant {}", grant.insn);
                self.issue(grant.insn);
                continue;
            }

            if self.outstanding_prefetches.len() < max_prefetches {
                if let Some(grant) = self.arbiter.pop_prefetch() {
                    self.issue_store_prefetch(grant.insn);
                    continue;
                }
            }
            break;
        }
    }

    fn arbitrate_in_order(&mut self) {
        let head = self
            .queue
            .segment_handles(Segment::Active)
            .into_iter()
            .filter_map(|h| self.queue.get(h))
            .find(|entry| entry.status() != Status::Complete)
            .map(|entry| (entry.insn(), entry.status(), entry.op()));
        if let Some((insn, status, op)) = head {
            if self.has_memory_port() && status == Status::AwaitingPort && op != MemOpKind::Store {
                self.issue(insn);
            }
        }

        let sb_head = self
            .queue
            .segment_head(Segment::CommittedSend)
            .and_then(|h| self.queue.get(h))
            .map(|entry| (entry.insn(), entry.status()));
        if let Some((insn, Status::AwaitingPort)) = sb_head {
            if self.has_memory_port() {
                self.issue(insn);
            }
        }

        while self.has_memory_port()
            && self.outstanding_prefetches.len() < self.config.max_store_prefetches
        {
            let Some(grant) = self.arbiter.pop_prefetch() else {
                break;
            };
            self.issue_store_prefetch(grant.insn);
        }
    }
}
