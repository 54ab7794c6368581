use super::support::{drain_requests, load, reply_to, tick, unit};
use crate::memunit::{Effect, InsnId, MessageKind, Status};
use crate::sim::config::MemUnitConfig;

#[test]
fn same_size_loads_share_one_miss() {
    let mut unit = unit(MemUnitConfig::default());
    load(&mut unit, 1, 0x400, 8);
    load(&mut unit, 2, 0x400, 8);
    tick(&mut unit, 1);

    let requests = drain_requests(&mut unit);
    assert_eq!(requests.len(), 1);
    assert_eq!(unit.mshr_count(), 1);
    assert_eq!(unit.stats().mshr_attached, 1);
    assert_eq!(unit.status(InsnId(2)), Some(Status::IssuedToMemory));

    unit.push_reply(reply_to(&requests[0], 0x77)).unwrap();
    tick(&mut unit, 5);
    assert_eq!(unit.retrieve_load_value(InsnId(1)), Ok(0x77));
    assert_eq!(unit.retrieve_load_value(InsnId(2)), Ok(0x77));
    assert_eq!(unit.mshr_count(), 0);

    let stats = unit.stats();
    assert_eq!(stats.transactions_completed, 1);
    assert_eq!(stats.transaction_latency_total, 4);
}

#[test]
fn different_size_load_waits_for_the_outstanding_miss() {
    let mut unit = unit(MemUnitConfig::default());
    load(&mut unit, 1, 0x400, 8);
    load(&mut unit, 2, 0x400, 4);
    tick(&mut unit, 1);

    let requests = drain_requests(&mut unit);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].insn, Some(InsnId(1)));
    assert_eq!(unit.stats().mshr_blocked, 1);

    unit.push_reply(reply_to(&requests[0], 0x55)).unwrap();
    tick(&mut unit, 2);
    let retried = drain_requests(&mut unit);
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].insn, Some(InsnId(2)));
    assert_eq!(retried[0].size, 4);
}

#[test]
fn squashed_sole_waiter_drops_the_miss() {
    let mut unit = unit(MemUnitConfig::default());
    load(&mut unit, 1, 0x400, 8);
    tick(&mut unit, 1);
    let requests = drain_requests(&mut unit);
    assert_eq!(unit.mshr_count(), 1);

    unit.annul(InsnId(1)).unwrap();
    assert_eq!(unit.mshr_count(), 0);

    // the reply arrives for nobody
    unit.push_reply(reply_to(&requests[0], 0x1)).unwrap();
    tick(&mut unit, 2);
    assert_eq!(unit.stats().stale_replies, 1);
    assert!(unit.is_empty());
}

#[test]
fn reply_wakes_only_matching_miss() {
    let mut unit = unit(MemUnitConfig::default());
    load(&mut unit, 1, 0x400, 8);
    load(&mut unit, 2, 0x800, 8);
    tick(&mut unit, 1);
    assert_eq!(unit.mshr_count(), 2);
    let requests = drain_requests(&mut unit);
    let second = requests
        .iter()
        .find(|r| r.paddr == 0x800)
        .expect("request for 0x800");
    unit.push_reply(reply_to(second, 0x88)).unwrap();
    unit.take_effects();
    tick(&mut unit, 2);

    assert_eq!(unit.take_effects(), vec![Effect::Satisfy(InsnId(2))]);
    assert_eq!(unit.status(InsnId(1)), Some(Status::IssuedToMemory));
    assert_eq!(unit.mshr_count(), 1);
}

#[test]
fn transaction_ids_come_from_the_run_context() {
    let mut unit = unit(MemUnitConfig::default());
    load(&mut unit, 1, 0x400, 8);
    load(&mut unit, 2, 0x800, 8);
    tick(&mut unit, 1);
    let ids: Vec<u64> = drain_requests(&mut unit)
        .iter()
        .filter_map(|r| r.tracker.map(|t| t.id))
        .collect();
    assert_eq!(ids, vec![1, 2]);
    assert!(unit
        .take_effects()
        .iter()
        .all(|effect| !matches!(effect, Effect::Satisfy(_))));

    // a second unit gets its own id space
    let mut other = super::support::unit(MemUnitConfig::default());
    load(&mut other, 7, 0x400, 8);
    tick(&mut other, 1);
    let request = other.pop_memory_op().expect("request");
    assert_eq!(request.kind, MessageKind::LoadRequest);
    assert_eq!(request.tracker.map(|t| t.id), Some(1));
}
