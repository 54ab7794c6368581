use std::sync::Arc;

use crate::memunit::{
    CoreView, Effect, InsnId, MemMessage, MemOpKind, MemUnit, MessageKind, Paddr, Translation,
};
use crate::sim::config::{ConsistencyModel, MemUnitConfig};
use crate::sim::perf_log::RunContext;

pub fn unit(config: MemUnitConfig) -> MemUnit {
    MemUnit::new(config, Arc::new(RunContext::new()))
}

pub fn sc() -> MemUnitConfig {
    MemUnitConfig {
        consistency_model: ConsistencyModel::Sc,
        ..MemUnitConfig::default()
    }
}

pub fn tick(unit: &mut MemUnit, now: u64) {
    unit.cycle(now, CoreView::default())
        .expect("cycle should not resync");
}

pub fn load(unit: &mut MemUnit, insn: u64, paddr: Paddr, size: u8) {
    unit.insert(InsnId(insn), MemOpKind::Load, size, false).unwrap();
    unit.resolve_address(InsnId(insn), Translation::identity(paddr))
        .unwrap();
}

pub fn store(unit: &mut MemUnit, insn: u64, paddr: Paddr, size: u8, value: u64) {
    unit.insert(InsnId(insn), MemOpKind::Store, size, false)
        .unwrap();
    unit.resolve_address(InsnId(insn), Translation::identity(paddr))
        .unwrap();
    unit.update_store_value(InsnId(insn), value, None).unwrap();
}

pub fn reply_to(request: &MemMessage, value: u64) -> MemMessage {
    let kind = request.kind.reply_kind().expect("request kind");
    MemMessage {
        insn: request.insn,
        tracker: request.tracker,
        ..MemMessage::new(kind, request.paddr, request.size)
    }
    .with_value(value)
}

pub fn drain_requests(unit: &mut MemUnit) -> Vec<MemMessage> {
    std::iter::from_fn(|| unit.pop_memory_op()).collect()
}

/// Answer every outstanding load request with its own address as data.
pub fn answer_loads(unit: &mut MemUnit) {
    for request in drain_requests(unit) {
        assert_eq!(request.kind, MessageKind::LoadRequest);
        let value = request.paddr;
        unit.push_reply(reply_to(&request, value)).unwrap();
    }
}

pub fn committed(effects: &[Effect]) -> Vec<InsnId> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            Effect::Committed(insn) => Some(*insn),
            _ => None,
        })
        .collect()
}
