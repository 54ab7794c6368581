use crate::memunit::types::{align8, InsnId, MemOpKind, Paddr, PhysAddr, Segment, Status, Vaddr};
use crate::timeq::Cycle;

/// One in-flight memory operation. Fields that key one of the queue's indices are private and
/// only change through `MemQueue`, which keeps the indices in step.
#[derive(Debug, Clone)]
pub struct MemQueueEntry {
    insn: InsnId,
    seq: u64,
    op: MemOpKind,
    size: u8,
    segment: Segment,
    paddr: PhysAddr,
    bypass_sb: bool,
    pub vaddr: Option<Vaddr>,
    pub side_effect: bool,
    pub non_cacheable: bool,
    pub exception: bool,
    pub annulled: bool,
    /// Set only by a squash; withdrawing a store's data annuls it without squashing it.
    pub squashed: bool,
    pub partial_snoop: bool,
    pub issued: bool,
    pub speculated_value: bool,
    pub store_complete: bool,
    pub coalesced: bool,
    pub force_resync: bool,
    pub value: Option<u64>,
    pub extended_value: Option<u64>,
    pub compare_value: Option<u64>,
    /// Key of the miss-tracking entry this operation waits on.
    pub mshr: Option<Paddr>,
    pub extra_latency_timeout: Option<Cycle>,
}

impl MemQueueEntry {
    pub(super) fn new(insn: InsnId, seq: u64, op: MemOpKind, size: u8, bypass_sb: bool) -> Self {
        Self {
            insn,
            seq,
            op,
            size,
            segment: Segment::Active,
            paddr: PhysAddr::Unresolved,
            bypass_sb,
            vaddr: None,
            side_effect: false,
            non_cacheable: false,
            exception: false,
            annulled: false,
            squashed: false,
            partial_snoop: false,
            issued: false,
            speculated_value: false,
            store_complete: false,
            coalesced: false,
            force_resync: false,
            value: None,
            extended_value: None,
            compare_value: None,
            mshr: None,
            extra_latency_timeout: None,
        }
    }

    pub fn insn(&self) -> InsnId {
        self.insn
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn op(&self) -> MemOpKind {
        self.op
    }

    pub fn size(&self) -> u8 {
        self.size
    }

    pub fn segment(&self) -> Segment {
        self.segment
    }

    pub fn paddr(&self) -> PhysAddr {
        self.paddr
    }

    pub fn bypass_sb(&self) -> bool {
        self.bypass_sb
    }

    pub(super) fn set_segment(&mut self, segment: Segment) {
        self.segment = segment;
    }

    pub(super) fn set_paddr(&mut self, paddr: PhysAddr) {
        self.paddr = paddr;
    }

    pub(super) fn set_bypass_sb(&mut self, bypass: bool) {
        self.bypass_sb = bypass;
    }

    /// 8-byte aligned address used by the address index.
    pub fn aligned(&self) -> Option<Paddr> {
        self.paddr.resolved().map(align8)
    }

    pub fn is_load(&self) -> bool {
        self.op.is_load()
    }

    pub fn is_store(&self) -> bool {
        self.op.is_store()
    }

    pub fn is_atomic(&self) -> bool {
        self.op.is_atomic()
    }

    pub fn is_marker(&self) -> bool {
        self.op.is_marker()
    }

    pub fn is_abnormal(&self) -> bool {
        self.side_effect || self.non_cacheable || self.exception
    }

    /// The value a load-like consumer sees: atomics return the old memory value, which lives
    /// in the extended slot.
    pub fn load_value(&self) -> Option<u64> {
        if self.is_atomic() {
            self.extended_value
        } else {
            self.value
        }
    }

    pub fn set_load_value(&mut self, value: Option<u64>) {
        if self.is_atomic() {
            self.extended_value = value;
        } else {
            self.value = value;
        }
    }

    pub fn status(&self) -> Status {
        if self.annulled {
            return Status::Annulled;
        }
        if self.is_marker() {
            return Status::IssuedToMemory;
        }
        if self.paddr.is_unresolved() {
            return Status::AwaitingAddress;
        }
        match self.op {
            MemOpKind::Load => {
                if self.value.is_some() {
                    Status::Complete
                } else if self.mshr.is_some() {
                    Status::IssuedToMemory
                } else if self.issued {
                    Status::AwaitingPort
                } else {
                    Status::AwaitingIssue
                }
            }
            MemOpKind::Store => {
                if self.value.is_none() {
                    Status::AwaitingValue
                } else if self.mshr.is_some() {
                    Status::IssuedToMemory
                } else if self.issued {
                    Status::AwaitingPort
                } else {
                    Status::AwaitingIssue
                }
            }
            MemOpKind::Rmw | MemOpKind::Cas => {
                if self.value.is_some() && self.extended_value.is_some() {
                    Status::Complete
                } else if self.mshr.is_some() {
                    Status::IssuedToMemory
                } else if self.issued {
                    Status::AwaitingPort
                } else if self.extended_value.is_some() {
                    // preload done, store half still waits for its operand
                    Status::AwaitingValue
                } else {
                    Status::AwaitingIssue
                }
            }
            MemOpKind::Fence => Status::IssuedToMemory,
        }
    }
}
