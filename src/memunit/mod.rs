//! Speculative memory-ordering unit of one out-of-order core.
//!
//! `MemUnit` tracks every in-flight load, store, atomic and fence, forwards store data to younger
//! loads, arbitrates memory ports, and lets stores and loads retire past ordering points by
//! opening checkpoints that are rolled back when a coherence event proves the speculation wrong.
//! The execution engine drives it one cycle at a time and learns about completions through
//! [`Effect`]s.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::sim::config::MemUnitConfig;
use crate::sim::perf_log::RunContext;
use crate::timeq::Cycle;

mod arbiter;
mod coherence;
mod core;
pub mod effect;
pub mod error;
mod forward;
mod issue;
pub mod message;
mod mshr;
pub mod queue;
mod retire;
mod speculation;
pub mod stats;
pub mod types;

#[cfg(test)]
mod unit_tests;

pub use arbiter::{PortArbiter, PortRequest};
pub use effect::Effect;
pub use error::{MemUnitError, ResyncReason, RetireStall};
pub use message::{MemMessage, MessageKind, TransactionTracker};
pub use mshr::{MshrEntry, MshrTable};
pub use queue::{EntryHandle, MemQueue, MemQueueEntry};
pub use speculation::{Checkpoint, LossReason};
pub use stats::MemUnitStats;
pub use types::*;

use speculation::Speculation;

pub struct MemUnit {
    config: MemUnitConfig,
    ctx: Arc<RunContext>,
    now: Cycle,
    core: CoreView,
    queue: MemQueue,
    mshrs: MshrTable,
    arbiter: PortArbiter,
    spec: Speculation,
    /// Store prefetches in flight, by coherence line.
    outstanding_prefetches: HashMap<Paddr, InsnId>,
    replies: VecDeque<MemMessage>,
    memory_ports: VecDeque<MemMessage>,
    snoop_ports: VecDeque<MemMessage>,
    effects: Vec<Effect>,
    partial_snoops: usize,
    replay_stalls: u32,
    value_predict_inhibit: bool,
    stats: MemUnitStats,
}
