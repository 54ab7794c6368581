use std::fmt;

use serde::{Deserialize, Serialize};

pub type Paddr = u64;
pub type Vaddr = u64;

/// Program-order identity of an instruction. Ids are never reused within a run, so comparing two
/// ids tells which instruction is older.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct InsnId(pub u64);

impl fmt::Display for InsnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemOpKind {
    Load,
    Store,
    Rmw,
    Cas,
    /// Ordering marker left in the queue by a fence.
    Fence,
}

impl MemOpKind {
    pub fn is_load(self) -> bool {
        matches!(self, Self::Load | Self::Rmw | Self::Cas)
    }

    pub fn is_store(self) -> bool {
        matches!(self, Self::Store | Self::Rmw | Self::Cas)
    }

    pub fn is_atomic(self) -> bool {
        matches!(self, Self::Rmw | Self::Cas)
    }

    pub fn is_marker(self) -> bool {
        matches!(self, Self::Fence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FenceKind {
    StoreStore,
    StoreLoad,
    Sync,
}

/// Lifecycle segment of a queue entry. The derived ordering (`Active < SpeculativeSend <
/// CommittedSend`) keys the segment index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Segment {
    Active,
    SpeculativeSend,
    CommittedSend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Status {
    AwaitingAddress,
    AwaitingIssue,
    AwaitingPort,
    AwaitingValue,
    IssuedToMemory,
    Complete,
    Annulled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhysAddr {
    Unresolved,
    /// Translation produced no usable address (e.g. the access faulted).
    Invalid,
    At(Paddr),
}

impl PhysAddr {
    pub fn resolved(self) -> Option<Paddr> {
        match self {
            PhysAddr::At(addr) => Some(addr),
            _ => None,
        }
    }

    pub fn is_unresolved(self) -> bool {
        matches!(self, PhysAddr::Unresolved)
    }

    /// Address that can actually be sent to memory; address zero counts as unusable.
    pub fn usable(self) -> Option<Paddr> {
        match self {
            PhysAddr::At(addr) if addr != 0 => Some(addr),
            _ => None,
        }
    }
}

/// Result of address translation, supplied by the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Translation {
    pub vaddr: Vaddr,
    /// `None` when the address did not translate.
    pub paddr: Option<Paddr>,
    pub side_effect: bool,
    pub non_cacheable: bool,
    pub exception: bool,
}

impl Translation {
    pub fn identity(vaddr: Vaddr) -> Self {
        Self {
            vaddr,
            paddr: Some(vaddr),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsnClass {
    Computation,
    Load,
    Store,
    Atomic,
    Fence(FenceKind),
    Synchronizing,
}

impl InsnClass {
    pub fn is_fence(self) -> bool {
        matches!(self, InsnClass::Fence(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RobHead {
    pub insn: InsnId,
    pub class: InsnClass,
}

/// Per-cycle snapshot of the core state the memory unit cannot observe itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoreView {
    pub rob_head: Option<RobHead>,
    pub rob_len: usize,
    pub live_instructions: usize,
    pub spinning: bool,
}

impl CoreView {
    pub fn head_class(&self) -> InsnClass {
        self.rob_head
            .map(|head| head.class)
            .unwrap_or(InsnClass::Computation)
    }

    pub fn is_head(&self, insn: InsnId) -> bool {
        self.rob_head.map(|head| head.insn == insn).unwrap_or(true)
    }
}

/// Architectural state captured by a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArchState {
    pub pc: u64,
    pub regs: Vec<u64>,
}

pub fn line_of(addr: Paddr, coherence_unit: u64) -> Paddr {
    addr & !(coherence_unit - 1)
}

pub fn align8(addr: Paddr) -> Paddr {
    addr & !7
}
