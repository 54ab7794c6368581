use serde::Serialize;
use std::ops::AddAssign;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MemUnitStats {
    pub inserted: u64,
    pub retired: u64,
    pub committed: u64,
    pub issued_loads: u64,
    pub issued_stores: u64,
    pub issued_atomics: u64,
    pub issued_preloads: u64,
    pub store_prefetches: u64,
    pub atomic_prefetches: u64,
    pub store_prefetch_conflicts: u64,
    pub store_prefetch_duplicates: u64,
    pub mshr_attached: u64,
    pub mshr_blocked: u64,
    pub stale_replies: u64,
    pub transactions_completed: u64,
    pub transaction_latency_total: u64,
    pub forwarded_loads: u64,
    pub partial_snoop_loads: u64,
    pub composed_loads: u64,
    pub coalesced_stores: u64,
    pub short_circuit_stores: u64,
    pub races: u64,
    pub races_replayed: u64,
    pub races_overridden: u64,
    pub slat_hits_load: u64,
    pub slat_hits_atomic: u64,
    pub slat_hits_atomic_avoided: u64,
    pub invalidate_hit_sb: u64,
    pub downgrade_hit_sb: u64,
    pub replacement_hit_sb: u64,
    pub checkpoints_created: u64,
    pub max_checkpoints: u64,
    pub rollbacks: u64,
    pub required_discards: u64,
    pub saved_discards: u64,
    pub nearest_checkpoint_discards: u64,
    pub checkpoints_discarded: u64,
    pub permission_aborts: u64,
    pub value_predictions: u64,
    pub value_predictions_successful: u64,
    pub value_predictions_failed: u64,
    pub non_speculative_atomics: u64,
    pub replay_stall_cycles: u64,
    pub snoop_deferrals: u64,
    pub invalidates: u64,
    pub downgrades: u64,
    pub probes: u64,
    pub resyncs: u64,
}

impl MemUnitStats {
    pub fn average_latency(&self) -> f64 {
        if self.transactions_completed == 0 {
            0.0
        } else {
            self.transaction_latency_total as f64 / self.transactions_completed as f64
        }
    }
}

impl AddAssign<&MemUnitStats> for MemUnitStats {
    fn add_assign(&mut self, other: &MemUnitStats) {
        self.inserted = self.inserted.saturating_add(other.inserted);
        self.retired = self.retired.saturating_add(other.retired);
        self.committed = self.committed.saturating_add(other.committed);
        self.issued_loads = self.issued_loads.saturating_add(other.issued_loads);
        self.issued_stores = self.issued_stores.saturating_add(other.issued_stores);
        self.issued_atomics = self.issued_atomics.saturating_add(other.issued_atomics);
        self.issued_preloads = self.issued_preloads.saturating_add(other.issued_preloads);
        self.store_prefetches = self.store_prefetches.saturating_add(other.store_prefetches);
        self.atomic_prefetches = self.atomic_prefetches.saturating_add(other.atomic_prefetches);
        self.store_prefetch_conflicts = self
            .store_prefetch_conflicts
            .saturating_add(other.store_prefetch_conflicts);
        self.store_prefetch_duplicates = self
            .store_prefetch_duplicates
            .saturating_add(other.store_prefetch_duplicates);
        self.mshr_attached = self.mshr_attached.saturating_add(other.mshr_attached);
        self.mshr_blocked = self.mshr_blocked.saturating_add(other.mshr_blocked);
        self.stale_replies = self.stale_replies.saturating_add(other.stale_replies);
        self.transactions_completed = self
            .transactions_completed
            .saturating_add(other.transactions_completed);
        self.transaction_latency_total = self
            .transaction_latency_total
            .saturating_add(other.transaction_latency_total);
        self.forwarded_loads = self.forwarded_loads.saturating_add(other.forwarded_loads);
        self.partial_snoop_loads = self
            .partial_snoop_loads
            .saturating_add(other.partial_snoop_loads);
        self.composed_loads = self.composed_loads.saturating_add(other.composed_loads);
        self.coalesced_stores = self.coalesced_stores.saturating_add(other.coalesced_stores);
        self.short_circuit_stores = self
            .short_circuit_stores
            .saturating_add(other.short_circuit_stores);
        self.races = self.races.saturating_add(other.races);
        self.races_replayed = self.races_replayed.saturating_add(other.races_replayed);
        self.races_overridden = self.races_overridden.saturating_add(other.races_overridden);
        self.slat_hits_load = self.slat_hits_load.saturating_add(other.slat_hits_load);
        self.slat_hits_atomic = self.slat_hits_atomic.saturating_add(other.slat_hits_atomic);
        self.slat_hits_atomic_avoided = self
            .slat_hits_atomic_avoided
            .saturating_add(other.slat_hits_atomic_avoided);
        self.invalidate_hit_sb = self.invalidate_hit_sb.saturating_add(other.invalidate_hit_sb);
        self.downgrade_hit_sb = self.downgrade_hit_sb.saturating_add(other.downgrade_hit_sb);
        self.replacement_hit_sb = self
            .replacement_hit_sb
            .saturating_add(other.replacement_hit_sb);
        self.checkpoints_created = self
            .checkpoints_created
            .saturating_add(other.checkpoints_created);
        self.max_checkpoints = self.max_checkpoints.max(other.max_checkpoints);
        self.rollbacks = self.rollbacks.saturating_add(other.rollbacks);
        self.required_discards = self.required_discards.saturating_add(other.required_discards);
        self.saved_discards = self.saved_discards.saturating_add(other.saved_discards);
        self.nearest_checkpoint_discards = self
            .nearest_checkpoint_discards
            .saturating_add(other.nearest_checkpoint_discards);
        self.checkpoints_discarded = self
            .checkpoints_discarded
            .saturating_add(other.checkpoints_discarded);
        self.permission_aborts = self.permission_aborts.saturating_add(other.permission_aborts);
        self.value_predictions = self.value_predictions.saturating_add(other.value_predictions);
        self.value_predictions_successful = self
            .value_predictions_successful
            .saturating_add(other.value_predictions_successful);
        self.value_predictions_failed = self
            .value_predictions_failed
            .saturating_add(other.value_predictions_failed);
        self.non_speculative_atomics = self
            .non_speculative_atomics
            .saturating_add(other.non_speculative_atomics);
        self.replay_stall_cycles = self
            .replay_stall_cycles
            .saturating_add(other.replay_stall_cycles);
        self.snoop_deferrals = self.snoop_deferrals.saturating_add(other.snoop_deferrals);
        self.invalidates = self.invalidates.saturating_add(other.invalidates);
        self.downgrades = self.downgrades.saturating_add(other.downgrades);
        self.probes = self.probes.saturating_add(other.probes);
        self.resyncs = self.resyncs.saturating_add(other.resyncs);
    }
}
