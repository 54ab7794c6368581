use std::error::Error;
use std::fmt;

use super::message::MessageKind;
use super::types::InsnId;

/// Misuse of the memory unit API by the execution engine or transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemUnitError {
    UnknownInstruction(InsnId),
    DuplicateInstruction(InsnId),
    /// The operation does not apply to this entry's kind.
    WrongKind { insn: InsnId, expected: &'static str },
    ValueNotReady(InsnId),
    /// `push_reply` was handed a message that only ever travels outbound.
    NotInbound(MessageKind),
    /// The inbound reply queue has no free slot this cycle.
    RepliesFull { capacity: usize },
}

impl fmt::Display for MemUnitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownInstruction(insn) => write!(f, "no memory queue entry for {insn}"),
            Self::DuplicateInstruction(insn) => {
                write!(f, "{insn} already owns a memory queue entry")
            }
            Self::WrongKind { insn, expected } => {
                write!(f, "{insn} is not a {expected} operation")
            }
            Self::ValueNotReady(insn) => write!(f, "value for {insn} is not available yet"),
            Self::NotInbound(kind) => write!(f, "{kind:?} is not an inbound message"),
            Self::RepliesFull { capacity } => {
                write!(f, "reply queue full ({capacity} slots)")
            }
        }
    }
}

impl Error for MemUnitError {}

/// Conditions that invalidate the unit's speculative state. The driver recovers by calling
/// `reset` and re-seeding execution from committed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncReason {
    RunawayInstructions { live: usize },
    SideEffectAccess(InsnId),
    StrandedActiveSegment { entries: usize },
    MissingCheckpoint(InsnId),
}

impl fmt::Display for ResyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunawayInstructions { live } => {
                write!(f, "too many live instructions ({live})")
            }
            Self::SideEffectAccess(insn) => write!(f, "side-effect access by {insn} committed"),
            Self::StrandedActiveSegment { entries } => {
                write!(f, "{entries} entries left in the active segment at trap")
            }
            Self::MissingCheckpoint(insn) => {
                write!(f, "violating instruction {insn} has no retired checkpoint")
            }
        }
    }
}

impl Error for ResyncReason {}

/// Why the instruction at the head of the ROB may not retire this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireStall {
    ReplayStall { remaining: u32 },
    CheckpointLimit,
    SendBufferFull,
    SendBufferNotEmpty,
    ValueNotReady,
    AbnormalAccessPending,
    ResyncWhileSpeculating,
}

impl fmt::Display for RetireStall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReplayStall { remaining } => write!(f, "replaying after rollback ({remaining})"),
            Self::CheckpointLimit => write!(f, "checkpoint limit reached"),
            Self::SendBufferFull => write!(f, "store buffer full"),
            Self::SendBufferNotEmpty => write!(f, "store buffer not drained"),
            Self::ValueNotReady => write!(f, "value not ready"),
            Self::AbnormalAccessPending => write!(f, "abnormal access not serialized yet"),
            Self::ResyncWhileSpeculating => write!(f, "resync pending while speculating"),
        }
    }
}

impl Error for RetireStall {}
