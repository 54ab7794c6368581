use log::{debug, trace};

use super::message::{satisfies, TransactionTracker};
use super::mshr::Released;
use super::queue::EntryHandle;
use super::speculation::LossReason;
use super::types::{MemOpKind, Paddr, Segment};
use super::{MemMessage, MemUnit, MessageKind};

impl MemUnit {
    /// Drain inbound messages in arrival order. A snoop that cannot be answered this cycle
    /// holds back everything behind it.
    pub(super) fn process_replies(&mut self) {
        while let Some(message) = self.replies.front() {
            if message.kind.is_snoop() && !self.has_snoop_buffer() {
                self.stats.snoop_deferrals += 1;
                trace!("deferring {:?} to {:#x}", message.kind, message.paddr);
                break;
            }
            let Some(message) = self.replies.pop_front() else {
                break;
            };
            self.process_reply(message);
        }
    }

    fn process_reply(&mut self, message: MemMessage) {
        let line = self.line_of(message.paddr);
        match message.kind {
            MessageKind::StoreReply | MessageKind::RmwReply | MessageKind::CasReply => {
                self.acquire_write_permission(line);
                self.complete(&message);
            }
            MessageKind::LoadReply | MessageKind::AtomicPreloadReply => self.complete(&message),
            MessageKind::StorePrefetchReply => {
                self.record_latency(message.tracker);
                self.acquire_write_permission(line);
                self.outstanding_prefetches.remove(&line);
            }
            MessageKind::Invalidate => {
                self.stats.invalidates += 1;
                self.lose_write_permission(LossReason::Invalidate, line);
                self.invalidate(line);
                self.send(message.answered(MessageKind::InvalidateAck));
            }
            MessageKind::Downgrade => {
                self.stats.downgrades += 1;
                self.lose_write_permission(LossReason::Downgrade, line);
                self.send(message.answered(MessageKind::DowngradeAck));
            }
            MessageKind::Probe => {
                self.stats.probes += 1;
                self.send(message.answered(MessageKind::ProbeAck));
            }
            MessageKind::ReturnRequest => self.send(message.answered(MessageKind::ReturnReply)),
            kind => debug!("ignoring outbound {kind:?} on the reply path"),
        }
    }

    fn record_latency(&mut self, tracker: Option<TransactionTracker>) {
        let Some(mut tracker) = tracker else {
            return;
        };
        tracker.complete(self.now);
        if let Some(latency) = tracker.latency() {
            self.stats.transactions_completed += 1;
            self.stats.transaction_latency_total += latency;
        }
    }

    /// The cache evicted `line`; any send-buffer write permission on it is gone.
    pub fn replace_line(&mut self, paddr: Paddr) {
        let line = self.line_of(paddr);
        self.lose_write_permission(LossReason::Replacement, line);
    }

    /// Deliver a reply to the matching miss entry and everything waiting on it.
    fn complete(&mut self, message: &MemMessage) {
        let matched = self.mshrs.get(message.paddr).is_some_and(|entry| {
            satisfies(message.kind, entry.op, self.config.speculative_order)
                && entry.size == message.size
        });
        if !matched {
            self.stats.stale_replies += 1;
            debug!(
                "no matching miss entry for {:?} to {:#x}",
                message.kind, message.paddr
            );
            return;
        }
        let Some(entry) = self.mshrs.remove(message.paddr) else {
            return;
        };
        self.record_latency(Some(entry.tracker));
        for waiter in entry.waiting {
            self.complete_lsq(waiter, message);
        }
        self.wake(Released {
            blocked_ops: entry.blocked_ops,
            blocked_prefetches: entry.blocked_prefetches,
        });
    }

    pub(super) fn complete_lsq(&mut self, handle: EntryHandle, message: &MemMessage) {
        let speculate_on_value = self.config.speculate_on_atomic_value;
        let Some(entry) = self.queue.get_mut(handle) else {
            return;
        };
        let insn = entry.insn();
        let mut squash = false;
        let mut mispredicted = false;
        let mut update_dependants = false;
        let mut resolve = false;

        match message.kind {
            MessageKind::AtomicPreloadReply => {
                if speculate_on_value && entry.speculated_value && entry.segment() != Segment::Active
                {
                    if entry.extended_value != Some(message.value) {
                        debug!(
                            "{insn} value mispredicted ({:?} vs {:#x})",
                            entry.extended_value, message.value
                        );
                        mispredicted = true;
                    } else {
                        entry.speculated_value = false;
                        self.stats.value_predictions_successful += 1;
                    }
                } else {
                    squash = entry.extended_value.is_some_and(|old| old != message.value);
                    entry.extended_value = Some(message.value);
                    entry.speculated_value = false;
                    let compare_failed = entry.op() == MemOpKind::Cas
                        && entry.compare_value.is_some_and(|c| c != message.value);
                    if compare_failed {
                        entry.value = Some(message.value);
                        update_dependants = true;
                    }
                }
            }
            MessageKind::LoadReply => {
                entry.value = Some(message.value);
                entry.extended_value = Some(message.extended_value);
            }
            MessageKind::CasReply => {
                debug_assert!(!entry.partial_snoop);
                entry.extended_value = Some(message.extended_value);
                if entry.compare_value != Some(message.extended_value) {
                    // compare failed, memory still holds the old value
                    entry.value = Some(message.extended_value);
                    update_dependants = true;
                }
                entry.store_complete = true;
                resolve = true;
                self.stats.non_speculative_atomics += 1;
            }
            MessageKind::RmwReply => {
                debug_assert!(!entry.partial_snoop);
                entry.extended_value = Some(message.extended_value);
                entry.store_complete = true;
                resolve = true;
                self.stats.non_speculative_atomics += 1;
            }
            MessageKind::StoreReply => entry.store_complete = true,
            _ => return,
        }

        let partial = matches!(
            message.kind,
            MessageKind::AtomicPreloadReply | MessageKind::LoadReply
        ) && entry.partial_snoop;
        entry.mshr = None;
        let committed_store =
            message.kind == MessageKind::StoreReply && entry.segment() == Segment::CommittedSend;
        let notify = entry.is_load() || entry.segment() == Segment::Active;

        if mispredicted {
            self.stats.value_predictions_failed += 1;
            self.value_predict_inhibit = true;
            self.request_abort(insn);
        }
        if squash {
            self.squash(insn);
        }
        if update_dependants {
            self.update_dependant_loads(handle);
        }
        if partial {
            self.apply_all_stores(handle);
            if let Some(entry) = self.queue.get_mut(handle) {
                entry.partial_snoop = false;
            }
            self.partial_snoops -= 1;
        }
        if resolve {
            self.resolve_speculation(insn);
        }
        if notify {
            self.satisfy(insn);
        }
        if committed_store {
            trace!("store {insn} performed");
            self.erase_entry(handle);
        }
    }
}
