use super::types::{ArchState, InsnId, Paddr};

/// Notifications from the memory unit back to the execution engine, drained once per cycle
/// with `MemUnit::take_effects`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// The instruction's memory value is available.
    Satisfy(InsnId),
    /// A value previously delivered to the instruction was withdrawn.
    Squash(InsnId),
    /// A completed load was raced by a coherence event but is already ordered; the engine
    /// should adopt the architecturally visible value instead of re-executing.
    OverrideResult(InsnId),
    ForceResync(InsnId),
    /// A store completed locally because write permission was already held; the value must
    /// still reach memory.
    DeferredWrite { paddr: Paddr, size: u8, value: u64 },
    /// Speculation failed. Everything from `checkpoint` onward is discarded and execution
    /// restarts from `state`.
    Rollback { checkpoint: InsnId, state: ArchState },
    Committed(InsnId),
}

impl Effect {
    pub fn insn(&self) -> Option<InsnId> {
        match self {
            Effect::Satisfy(insn)
            | Effect::Squash(insn)
            | Effect::OverrideResult(insn)
            | Effect::ForceResync(insn)
            | Effect::Committed(insn) => Some(*insn),
            Effect::Rollback { checkpoint, .. } => Some(*checkpoint),
            Effect::DeferredWrite { .. } => None,
        }
    }
}
