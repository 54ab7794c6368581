use super::support::{answer_loads, drain_requests, load, reply_to, store, tick, unit};
use crate::memunit::{
    ArchState, Effect, InsnClass, InsnId, MemMessage, MemOpKind, MemUnitError, MessageKind,
    Status, Translation,
};
use crate::sim::config::MemUnitConfig;

fn snoop(kind: MessageKind, paddr: u64) -> MemMessage {
    MemMessage::new(kind, paddr, 8)
}

#[test]
fn invalidate_replays_completed_unordered_load() {
    let mut unit = unit(MemUnitConfig::default());
    load(&mut unit, 1, 0x500, 8);
    tick(&mut unit, 1);
    answer_loads(&mut unit);
    tick(&mut unit, 2);
    assert_eq!(unit.status(InsnId(1)), Some(Status::Complete));
    unit.take_effects();

    unit.push_reply(snoop(MessageKind::Invalidate, 0x520)).unwrap();
    tick(&mut unit, 3);

    assert!(unit.take_effects().contains(&Effect::Squash(InsnId(1))));
    assert_eq!(unit.stats().races, 1);
    assert_eq!(unit.stats().races_replayed, 1);
    let reissued = drain_requests(&mut unit);
    assert_eq!(reissued.len(), 1);
    assert_eq!(reissued[0].insn, Some(InsnId(1)));

    let ack = unit.pop_snoop_op().expect("invalidate ack");
    assert_eq!(ack.kind, MessageKind::InvalidateAck);
    assert_eq!(ack.paddr, 0x520);
}

#[test]
fn invalidate_overrides_load_older_than_every_incomplete_access() {
    let mut unit = unit(MemUnitConfig::default());
    load(&mut unit, 1, 0x500, 8);
    tick(&mut unit, 1);
    answer_loads(&mut unit);
    tick(&mut unit, 2);
    load(&mut unit, 2, 0x508, 8);
    unit.take_effects();

    unit.push_reply(snoop(MessageKind::Invalidate, 0x500)).unwrap();
    tick(&mut unit, 3);

    let effects = unit.take_effects();
    assert!(effects.contains(&Effect::OverrideResult(InsnId(1))));
    assert!(!effects.contains(&Effect::Squash(InsnId(1))));
    assert_eq!(unit.stats().races_overridden, 1);
    assert_eq!(unit.retrieve_load_value(InsnId(1)), Ok(0x500));
}

#[test]
fn invalidate_outside_the_line_is_ignored() {
    let mut unit = unit(MemUnitConfig::default());
    load(&mut unit, 1, 0x500, 8);
    tick(&mut unit, 1);
    answer_loads(&mut unit);
    tick(&mut unit, 2);

    unit.push_reply(snoop(MessageKind::Invalidate, 0x540)).unwrap();
    tick(&mut unit, 3);
    assert_eq!(unit.stats().races, 0);
    assert_eq!(unit.status(InsnId(1)), Some(Status::Complete));
}

#[test]
fn snoops_wait_for_a_free_snoop_port() {
    let mut unit = unit(MemUnitConfig::default());
    unit.push_reply(snoop(MessageKind::Probe, 0x100)).unwrap();
    unit.push_reply(snoop(MessageKind::Downgrade, 0x200)).unwrap();

    tick(&mut unit, 1);
    assert_eq!(unit.stats().probes, 1);
    assert_eq!(unit.stats().downgrades, 0);
    assert_eq!(unit.stats().snoop_deferrals, 1);
    assert_eq!(
        unit.pop_snoop_op().map(|m| m.kind),
        Some(MessageKind::ProbeAck)
    );

    tick(&mut unit, 2);
    assert_eq!(unit.stats().downgrades, 1);
    assert_eq!(
        unit.pop_snoop_op().map(|m| m.kind),
        Some(MessageKind::DowngradeAck)
    );
}

#[test]
fn reply_queue_rejects_outbound_and_overflow() {
    let mut unit = unit(MemUnitConfig::default());
    assert_eq!(
        unit.push_reply(snoop(MessageKind::LoadRequest, 0x100)),
        Err(MemUnitError::NotInbound(MessageKind::LoadRequest))
    );
    for _ in 0..3 {
        unit.push_reply(snoop(MessageKind::Probe, 0x100)).unwrap();
    }
    assert!(!unit.can_push_reply());
    assert_eq!(
        unit.push_reply(snoop(MessageKind::Probe, 0x100)),
        Err(MemUnitError::RepliesFull { capacity: 3 })
    );
}

#[test]
fn downgrade_takes_permission_from_the_send_buffer() {
    let mut unit = unit(MemUnitConfig::default());
    store(&mut unit, 1, 0x100, 8, 0x1);
    store(&mut unit, 2, 0x200, 8, 0x2);
    for insn in [1, 2] {
        unit.retire(InsnId(insn), InsnClass::Store, &ArchState::default())
            .unwrap();
    }
    tick(&mut unit, 1);
    let prefetch = drain_requests(&mut unit)
        .into_iter()
        .find(|r| r.kind == MessageKind::StorePrefetchRequest)
        .expect("prefetch for the second store");
    unit.push_reply(reply_to(&prefetch, 0)).unwrap();
    tick(&mut unit, 2);
    assert!(unit.holds_write_permission(0x200));

    unit.push_reply(snoop(MessageKind::Downgrade, 0x200)).unwrap();
    tick(&mut unit, 3);
    assert!(!unit.holds_write_permission(0x200));
    assert_eq!(unit.stats().downgrade_hit_sb, 1);

    unit.replace_line(0x100);
    assert_eq!(unit.stats().replacement_hit_sb, 0);
}

#[test]
fn cas_reply_with_failed_compare_keeps_old_value() {
    let mut unit = unit(MemUnitConfig {
        speculative_order: false,
        ..MemUnitConfig::default()
    });
    unit.insert(InsnId(1), MemOpKind::Cas, 8, false).unwrap();
    unit.resolve_address(InsnId(1), Translation::identity(0x600))
        .unwrap();
    unit.update_cas_value(InsnId(1), 5, 3).unwrap();

    tick(&mut unit, 1);
    let requests = drain_requests(&mut unit);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].kind, MessageKind::CasRequest);
    assert_eq!(requests[0].compare_value, Some(3));
    unit.push_reply(reply_to(&requests[0], 9).with_extended(9))
        .unwrap();

    tick(&mut unit, 2);
    assert_eq!(unit.retrieve_load_value(InsnId(1)), Ok(9));
    let entry = unit.entry(InsnId(1)).expect("entry");
    assert_eq!(entry.value, Some(9));
    assert!(entry.store_complete);
    assert_eq!(unit.status(InsnId(1)), Some(Status::Complete));
    assert_eq!(unit.stats().non_speculative_atomics, 1);
}
