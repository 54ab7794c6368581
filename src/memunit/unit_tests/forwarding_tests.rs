use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::support::{load, store, tick, unit};
use crate::memunit::{Effect, InsnId, MemOpKind, Status, Translation};
use crate::sim::config::MemUnitConfig;

#[test]
fn load_takes_value_of_covering_store() {
    let mut unit = unit(MemUnitConfig::default());
    store(&mut unit, 1, 0x100, 8, 0xdead_beef);
    load(&mut unit, 2, 0x100, 8);

    assert_eq!(unit.retrieve_load_value(InsnId(2)), Ok(0xdead_beef));
    assert!(unit.take_effects().contains(&Effect::Satisfy(InsnId(2))));
    assert_eq!(unit.stats().forwarded_loads, 1);

    tick(&mut unit, 1);
    assert!(unit.pop_memory_op().is_none(), "forwarded load must not reach memory");
}

#[test]
fn narrow_load_extracts_bytes_from_wide_store() {
    let mut unit = unit(MemUnitConfig::default());
    store(&mut unit, 1, 0x100, 8, 0x8877_6655_4433_2211);
    load(&mut unit, 2, 0x104, 2);
    assert_eq!(unit.retrieve_load_value(InsnId(2)), Ok(0x6655));
}

#[test]
fn youngest_older_store_wins() {
    let mut unit = unit(MemUnitConfig::default());
    store(&mut unit, 1, 0x100, 8, 0x11);
    store(&mut unit, 2, 0x100, 8, 0x22);
    load(&mut unit, 3, 0x100, 8);
    store(&mut unit, 4, 0x100, 8, 0x44);

    assert_eq!(unit.retrieve_load_value(InsnId(3)), Ok(0x22));
}

#[test]
fn partial_overlap_composes_once_every_byte_is_known() {
    let mut unit = unit(MemUnitConfig::default());
    store(&mut unit, 1, 0x100, 4, 0xAABB_CCDD);
    unit.insert(InsnId(2), MemOpKind::Store, 4, false).unwrap();
    load(&mut unit, 3, 0x102, 4);

    // bytes 0x104..0x106 are still owned by nobody
    assert_eq!(unit.status(InsnId(3)), Some(Status::AwaitingIssue));
    assert_eq!(unit.partial_snoops_outstanding(), 1);

    unit.resolve_address(InsnId(2), Translation::identity(0x104))
        .unwrap();
    assert_eq!(unit.status(InsnId(3)), Some(Status::AwaitingIssue));

    unit.update_store_value(InsnId(2), 0x1122_3344, None).unwrap();
    assert_eq!(unit.retrieve_load_value(InsnId(3)), Ok(0x3344_AABB));
    assert_eq!(unit.partial_snoops_outstanding(), 0);
    assert_eq!(unit.stats().composed_loads, 1);
}

#[test]
fn partially_covered_load_issues_from_active_head() {
    let mut unit = unit(MemUnitConfig::default());
    store(&mut unit, 1, 0x100, 2, 0xbeef);
    load(&mut unit, 2, 0x100, 8);
    tick(&mut unit, 1);
    assert!(unit.pop_memory_op().is_none());

    // once the store is squashed the load heads the active segment and goes to memory
    unit.annul(InsnId(1)).unwrap();
    tick(&mut unit, 2);
    tick(&mut unit, 3);
    let request = unit.pop_memory_op().expect("load request");
    assert_eq!(request.insn, Some(InsnId(2)));
}

#[test]
fn withdrawn_store_value_resnoops_dependants() {
    let mut unit = unit(MemUnitConfig::default());
    store(&mut unit, 1, 0x100, 8, 0x11);
    store(&mut unit, 2, 0x100, 8, 0x22);
    load(&mut unit, 3, 0x100, 8);
    unit.take_effects();

    unit.annul_store_value(InsnId(2)).unwrap();
    assert_eq!(unit.retrieve_load_value(InsnId(3)), Ok(0x11));
    assert_eq!(
        unit.take_effects(),
        vec![Effect::Squash(InsnId(3)), Effect::Satisfy(InsnId(3))]
    );
}

#[test]
fn moved_store_address_releases_forwarded_load() {
    let mut unit = unit(MemUnitConfig::default());
    store(&mut unit, 1, 0x100, 8, 0x11);
    load(&mut unit, 2, 0x100, 8);
    unit.take_effects();

    unit.resolve_address(InsnId(1), Translation::identity(0x200))
        .unwrap();
    assert!(unit.retrieve_load_value(InsnId(2)).is_err());
    assert!(unit.take_effects().contains(&Effect::Squash(InsnId(2))));

    tick(&mut unit, 1);
    let request = unit.pop_memory_op().expect("load goes to memory");
    assert_eq!(request.paddr, 0x100);
}

#[test]
fn composed_load_follows_a_partially_shadowed_older_store() {
    let mut unit = unit(MemUnitConfig::default());
    store(&mut unit, 1, 0x100, 8, 0x1111_1111_1111_1111);
    store(&mut unit, 2, 0x100, 2, 0xbbbb);
    load(&mut unit, 3, 0x100, 8);
    assert_eq!(unit.retrieve_load_value(InsnId(3)), Ok(0x1111_1111_1111_bbbb));
    unit.take_effects();

    unit.update_store_value(InsnId(1), 0x2222_2222_2222_2222, None)
        .unwrap();
    assert_eq!(unit.retrieve_load_value(InsnId(3)), Ok(0x2222_2222_2222_bbbb));
    assert_eq!(
        unit.take_effects(),
        vec![Effect::Squash(InsnId(3)), Effect::Satisfy(InsnId(3))]
    );
}

#[test]
fn composed_load_drops_bytes_of_a_store_that_moved_away() {
    let mut unit = unit(MemUnitConfig::default());
    store(&mut unit, 1, 0x100, 8, 0x1111_1111_1111_1111);
    store(&mut unit, 2, 0x100, 2, 0xbbbb);
    load(&mut unit, 3, 0x100, 8);
    unit.take_effects();

    unit.resolve_address(InsnId(1), Translation::identity(0x800))
        .unwrap();
    assert!(unit.retrieve_load_value(InsnId(3)).is_err());
    assert_eq!(unit.status(InsnId(3)), Some(Status::AwaitingIssue));
    assert_eq!(unit.partial_snoops_outstanding(), 1);
    assert!(unit.take_effects().contains(&Effect::Squash(InsnId(3))));

    // moving it back restores the composition
    unit.resolve_address(InsnId(1), Translation::identity(0x100))
        .unwrap();
    assert_eq!(unit.retrieve_load_value(InsnId(3)), Ok(0x1111_1111_1111_bbbb));
    assert_eq!(unit.partial_snoops_outstanding(), 0);
}

/// Addresses confined to two doublewords, aligned to the access size.
fn random_paddr(rng: &mut StdRng, size: u8) -> u64 {
    let base = [0x100u64, 0x108][rng.gen_range(0..2)];
    base + rng.gen_range(0..8 / size as u64) * size as u64
}

fn random_access(rng: &mut StdRng) -> (u64, u8) {
    let size = [1u8, 2, 4, 8][rng.gen_range(0..4)];
    (random_paddr(rng, size), size)
}

fn random_value(rng: &mut StdRng, size: u8) -> u64 {
    let value: u64 = rng.gen();
    if size == 8 {
        value
    } else {
        value & ((1u64 << (size as u32 * 8)) - 1)
    }
}

/// Byte-wise reference: each byte comes from the youngest older store writing it; a load with
/// any byte left to memory has no forwarded value.
fn reference_value(stores: &[(u64, u64, u8, u64)], insn: u64, paddr: u64, size: u8) -> Option<u64> {
    let mut value = 0u64;
    for byte in 0..size as u64 {
        let addr = paddr + byte;
        let &(_, store_paddr, _, store_value) = stores
            .iter()
            .rev()
            .filter(|(older, ..)| *older < insn)
            .find(|(_, store_paddr, store_size, _)| {
                (*store_paddr..*store_paddr + *store_size as u64).contains(&addr)
            })?;
        let shifted = (store_value >> ((addr - store_paddr) * 8)) & 0xff;
        value |= shifted << (byte * 8);
    }
    Some(value)
}

#[test]
fn forwarded_values_match_bytewise_composition_under_random_updates() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..200 {
        let mut unit = unit(MemUnitConfig::default());
        let mut stores = Vec::new();
        let mut loads = Vec::new();
        for insn in 1..=rng.gen_range(4..12u64) {
            let (paddr, size) = random_access(&mut rng);
            if rng.gen_bool(0.6) {
                let value = random_value(&mut rng, size);
                store(&mut unit, insn, paddr, size, value);
                stores.push((insn, paddr, size, value));
            } else {
                load(&mut unit, insn, paddr, size);
                loads.push((insn, paddr, size));
            }
        }
        if stores.is_empty() {
            continue;
        }

        for _ in 0..20 {
            let pick = rng.gen_range(0..stores.len());
            let (insn, paddr, size, _) = stores[pick];
            if rng.gen_bool(0.5) {
                let value = random_value(&mut rng, size);
                unit.update_store_value(InsnId(insn), value, None).unwrap();
                stores[pick].3 = value;
            } else {
                let moved = random_paddr(&mut rng, size);
                unit.resolve_address(InsnId(insn), Translation::identity(moved))
                    .unwrap();
                stores[pick].1 = moved;
            }
            for &(load_insn, load_paddr, load_size) in &loads {
                assert_eq!(
                    unit.retrieve_load_value(InsnId(load_insn)).ok(),
                    reference_value(&stores, load_insn, load_paddr, load_size),
                    "load {load_insn} at {load_paddr:#x}/{load_size} after updating {insn} \
                     (was {paddr:#x}) with stores {stores:x?}"
                );
            }
        }
    }
}
