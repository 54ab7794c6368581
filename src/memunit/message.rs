use serde::Serialize;

use super::types::{InsnId, MemOpKind, Paddr};
use crate::timeq::Cycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MessageKind {
    // outbound requests
    LoadRequest,
    StoreRequest,
    AtomicPreloadRequest,
    RmwRequest,
    CasRequest,
    StorePrefetchRequest,
    // outbound snoop responses
    InvalidateAck,
    DowngradeAck,
    ProbeAck,
    ReturnReply,
    // inbound
    LoadReply,
    AtomicPreloadReply,
    StoreReply,
    RmwReply,
    CasReply,
    StorePrefetchReply,
    Invalidate,
    Downgrade,
    Probe,
    ReturnRequest,
}

impl MessageKind {
    pub fn is_inbound(self) -> bool {
        matches!(
            self,
            Self::LoadReply
                | Self::AtomicPreloadReply
                | Self::StoreReply
                | Self::RmwReply
                | Self::CasReply
                | Self::StorePrefetchReply
                | Self::Invalidate
                | Self::Downgrade
                | Self::Probe
                | Self::ReturnRequest
        )
    }

    pub fn is_snoop(self) -> bool {
        matches!(self, Self::Invalidate | Self::Downgrade | Self::Probe)
    }

    /// Request kind that a queue entry of `op` issues when sent as-is.
    pub fn request_for(op: MemOpKind) -> Option<Self> {
        match op {
            MemOpKind::Load => Some(Self::LoadRequest),
            MemOpKind::Store => Some(Self::StoreRequest),
            MemOpKind::Rmw => Some(Self::RmwRequest),
            MemOpKind::Cas => Some(Self::CasRequest),
            MemOpKind::Fence => None,
        }
    }

    /// Reply a memory system answers this request with.
    pub fn reply_kind(self) -> Option<Self> {
        match self {
            Self::LoadRequest => Some(Self::LoadReply),
            Self::StoreRequest => Some(Self::StoreReply),
            Self::AtomicPreloadRequest => Some(Self::AtomicPreloadReply),
            Self::RmwRequest => Some(Self::RmwReply),
            Self::CasRequest => Some(Self::CasReply),
            Self::StorePrefetchRequest => Some(Self::StorePrefetchReply),
            _ => None,
        }
    }
}

/// Whether `reply` completes an outstanding `request`. With speculative ordering, atomics are
/// split into a preload and a store and either half may close the entry.
pub fn satisfies(reply: MessageKind, request: MessageKind, speculative_order: bool) -> bool {
    use MessageKind::*;
    match request {
        LoadRequest => reply == LoadReply,
        StoreRequest => reply == StoreReply,
        RmwRequest => {
            reply == RmwReply
                || (speculative_order && (reply == AtomicPreloadReply || reply == StoreReply))
        }
        CasRequest => {
            reply == CasReply
                || (speculative_order && (reply == AtomicPreloadReply || reply == StoreReply))
        }
        AtomicPreloadRequest => reply == AtomicPreloadReply,
        _ => false,
    }
}

/// Accounting context that follows one memory transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransactionTracker {
    pub id: u64,
    pub paddr: Paddr,
    pub initiator: Option<InsnId>,
    pub issued_at: Cycle,
    pub completed_at: Option<Cycle>,
    pub wrong_path: bool,
    pub speculative_atomic_load: bool,
}

impl TransactionTracker {
    pub fn new(id: u64, paddr: Paddr, initiator: Option<InsnId>, issued_at: Cycle) -> Self {
        Self {
            id,
            paddr,
            initiator,
            issued_at,
            completed_at: None,
            wrong_path: false,
            speculative_atomic_load: false,
        }
    }

    pub fn complete(&mut self, now: Cycle) {
        if self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
    }

    pub fn latency(&self) -> Option<Cycle> {
        self.completed_at
            .map(|done| done.saturating_sub(self.issued_at))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemMessage {
    pub kind: MessageKind,
    pub paddr: Paddr,
    pub size: u8,
    pub value: u64,
    pub extended_value: u64,
    pub compare_value: Option<u64>,
    pub insn: Option<InsnId>,
    pub tracker: Option<TransactionTracker>,
    pub side_effect: bool,
    pub non_cacheable: bool,
    /// Non-allocating write.
    pub naw: bool,
    /// Store half of a split atomic.
    pub atomic: bool,
}

impl MemMessage {
    pub fn new(kind: MessageKind, paddr: Paddr, size: u8) -> Self {
        Self {
            kind,
            paddr,
            size,
            value: 0,
            extended_value: 0,
            compare_value: None,
            insn: None,
            tracker: None,
            side_effect: false,
            non_cacheable: false,
            naw: false,
            atomic: false,
        }
    }

    /// Copy of this message with a different kind, as used for acknowledgements.
    pub fn answered(&self, kind: MessageKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }

    pub fn with_value(mut self, value: u64) -> Self {
        self.value = value;
        self
    }

    pub fn with_extended(mut self, value: u64) -> Self {
        self.extended_value = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_requests_accept_split_replies_only_when_speculating() {
        use MessageKind::*;
        assert!(satisfies(RmwReply, RmwRequest, false));
        assert!(!satisfies(AtomicPreloadReply, RmwRequest, false));
        assert!(satisfies(AtomicPreloadReply, CasRequest, true));
        assert!(satisfies(StoreReply, CasRequest, true));
        assert!(!satisfies(LoadReply, StoreRequest, true));
        assert!(!satisfies(StoreReply, AtomicPreloadRequest, true));
    }

    #[test]
    fn outbound_kinds_are_not_inbound() {
        assert!(!MessageKind::LoadRequest.is_inbound());
        assert!(!MessageKind::ProbeAck.is_inbound());
        assert!(MessageKind::ReturnRequest.is_inbound());
        assert_eq!(
            MessageKind::StorePrefetchRequest.reply_kind(),
            Some(MessageKind::StorePrefetchReply)
        );
    }
}
