use super::support::{answer_loads, committed, drain_requests, load, reply_to, sc, store, tick, unit};
use crate::memunit::{
    ArchState, Effect, InsnClass, InsnId, MemMessage, MemUnit, MessageKind, ResyncReason,
    RetireStall, Segment,
};
use crate::sim::config::MemUnitConfig;

fn state(pc: u64) -> ArchState {
    ArchState {
        pc,
        regs: vec![pc; 4],
    }
}

/// SC with a store in the send buffer, a load that opens a checkpoint and a younger load
/// retired under it.
fn speculating_sc_unit() -> MemUnit {
    let mut unit = unit(sc());
    store(&mut unit, 1, 0x100, 8, 0x1);
    load(&mut unit, 2, 0x200, 8);
    load(&mut unit, 3, 0x300, 8);
    tick(&mut unit, 1);
    answer_loads(&mut unit);
    tick(&mut unit, 2);

    unit.retire(InsnId(1), InsnClass::Store, &state(1)).unwrap();
    unit.retire(InsnId(2), InsnClass::Load, &state(2)).unwrap();
    unit.retire(InsnId(3), InsnClass::Load, &state(3)).unwrap();
    unit.take_effects();
    unit
}

#[test]
fn sc_load_past_buffered_store_opens_a_checkpoint() {
    let unit = speculating_sc_unit();
    assert!(unit.is_speculating());
    assert_eq!(unit.checkpoint_count(), 1);
    let checkpoint = unit.checkpoint(InsnId(2)).expect("checkpoint on the first load");
    assert_eq!(checkpoint.state(), &state(2));
    assert_eq!(unit.srb_len(), 3);
    assert_eq!(unit.slat_len(), 2);

    // the checkpointed load stays in the queue, the younger one does not
    let kept = unit.entry(InsnId(2)).expect("checkpointed load");
    assert_eq!(kept.segment(), Segment::SpeculativeSend);
    assert!(kept.bypass_sb());
    assert!(unit.entry(InsnId(3)).is_none());
}

#[test]
fn violation_rolls_back_to_the_nearest_older_checkpoint() {
    let mut unit = speculating_sc_unit();
    unit.push_reply(MemMessage::new(MessageKind::Invalidate, 0x300, 8))
        .unwrap();
    tick(&mut unit, 3);

    let effects = unit.take_effects();
    let rollbacks: Vec<&Effect> = effects
        .iter()
        .filter(|e| matches!(e, Effect::Rollback { .. }))
        .collect();
    assert_eq!(
        rollbacks,
        vec![&Effect::Rollback {
            checkpoint: InsnId(2),
            state: state(2),
        }]
    );
    assert_eq!(committed(&effects), vec![InsnId(1)]);

    let stats = unit.stats();
    assert_eq!(stats.slat_hits_load, 1);
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(stats.nearest_checkpoint_discards, 1);
    assert_eq!(stats.saved_discards, 1);
    assert_eq!(stats.required_discards, 1);

    assert!(!unit.is_speculating());
    assert_eq!(unit.checkpoint_count(), 0);
    assert_eq!(unit.slat_len(), 0);
    assert_eq!(unit.srb_len(), 0);
    assert!(unit.entry(InsnId(2)).is_none());
}

#[test]
fn invalidate_of_an_unspeculated_line_does_not_roll_back() {
    let mut unit = speculating_sc_unit();
    unit.push_reply(MemMessage::new(MessageKind::Invalidate, 0x400, 8))
        .unwrap();
    tick(&mut unit, 3);
    assert!(unit.is_speculating());
    assert_eq!(unit.stats().rollbacks, 0);
}

#[test]
fn checkpoint_commits_once_buffered_stores_drain() {
    let mut unit = speculating_sc_unit();
    tick(&mut unit, 3);
    assert_eq!(committed(&unit.take_effects()), vec![InsnId(1)]);

    let store = drain_requests(&mut unit)
        .into_iter()
        .find(|r| r.kind == MessageKind::StoreRequest)
        .expect("store request");
    assert_eq!(store.value, 0x1);
    unit.push_reply(reply_to(&store, 0)).unwrap();
    tick(&mut unit, 4);

    assert_eq!(
        committed(&unit.take_effects()),
        vec![InsnId(2), InsnId(3)]
    );
    assert!(!unit.is_speculating());
    assert_eq!(unit.checkpoint_count(), 0);
    assert_eq!(unit.slat_len(), 0);
    assert!(unit.is_empty());
}

#[test]
fn repeated_permission_loss_aborts_the_checkpoint() {
    let mut unit = speculating_sc_unit();
    store(&mut unit, 4, 0x400, 8, 0x4);
    unit.retire(InsnId(4), InsnClass::Store, &state(4)).unwrap();
    let checkpoint = unit.checkpoint(InsnId(2)).expect("open checkpoint");
    assert!(checkpoint.requires(0x400));
    assert!(!checkpoint.is_satisfied());

    let prefetch = MemMessage::new(MessageKind::StorePrefetchReply, 0x400, 8);
    let downgrade = MemMessage::new(MessageKind::Downgrade, 0x400, 8);
    let mut now = 3;
    for round in 1..=6 {
        unit.push_reply(prefetch.clone()).unwrap();
        unit.push_reply(downgrade.clone()).unwrap();
        tick(&mut unit, now);
        now += 1;
        drain_requests(&mut unit);
        while unit.pop_snoop_op().is_some() {}

        let rolled_back = unit
            .take_effects()
            .iter()
            .any(|e| matches!(e, Effect::Rollback { checkpoint, .. } if *checkpoint == InsnId(2)));
        assert_eq!(rolled_back, round == 6, "round {round}");
    }
    assert_eq!(unit.stats().permission_aborts, 1);
    assert_eq!(unit.stats().downgrade_hit_sb, 6);
    assert!(!unit.is_speculating());
}

#[test]
fn checkpoint_budget_limits_speculative_fences() {
    let mut unit = unit(MemUnitConfig {
        allowed_checkpoints: 1,
        ..MemUnitConfig::default()
    });
    store(&mut unit, 1, 0x100, 8, 0x1);
    unit.insert(InsnId(2), crate::memunit::MemOpKind::Fence, 0, false)
        .unwrap();
    unit.insert(InsnId(3), crate::memunit::MemOpKind::Fence, 0, false)
        .unwrap();
    let fence = InsnClass::Fence(crate::memunit::FenceKind::StoreLoad);

    unit.retire(InsnId(1), InsnClass::Store, &state(1)).unwrap();
    unit.retire(InsnId(2), fence, &state(2)).unwrap();
    assert!(unit.is_speculating());
    assert_eq!(
        unit.check_retire(InsnId(3), fence),
        Err(RetireStall::CheckpointLimit)
    );
    assert_eq!(
        unit.check_retire(InsnId(9), InsnClass::Synchronizing),
        Err(RetireStall::ResyncWhileSpeculating)
    );
}

#[test]
fn replay_stall_counts_down_after_rollback() {
    let mut unit = unit(MemUnitConfig::default());
    unit.replay_stalls = 2;
    assert_eq!(
        unit.check_retire(InsnId(1), InsnClass::Computation),
        Err(RetireStall::ReplayStall { remaining: 2 })
    );
    tick(&mut unit, 1);
    tick(&mut unit, 2);
    assert_eq!(unit.check_retire(InsnId(1), InsnClass::Computation), Ok(()));
    assert_eq!(unit.stats().replay_stall_cycles, 2);
}

#[test]
fn violator_without_checkpoint_forces_resync() {
    let mut unit = unit(MemUnitConfig::default());
    unit.spec.violator = Some(InsnId(5));
    let result = unit.cycle(1, Default::default());
    assert_eq!(result, Err(ResyncReason::MissingCheckpoint(InsnId(5))));
    assert_eq!(unit.stats().resyncs, 1);
}

#[test]
fn reset_reports_committed_stores_still_owed_to_memory() {
    let mut unit = speculating_sc_unit();
    unit.reset();
    assert_eq!(
        unit.take_effects(),
        vec![Effect::DeferredWrite {
            paddr: 0x100,
            size: 8,
            value: 0x1,
        }]
    );
    assert!(unit.is_empty());
    assert!(!unit.is_speculating());
    assert_eq!(unit.srb_len(), 0);
}
