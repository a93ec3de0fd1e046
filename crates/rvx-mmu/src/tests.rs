use super::*;

use crate::pmp::{cfg_byte, napot_addr, AddressMatch};
use crate::test_util::{PageTables, TestMemory};

const RWX_AD: PteFlags = PageTables::RWX_AD;

fn sv39_with(config: MmuConfig) -> (Mmu, TestMemory, PageTables) {
    let mut mmu = Mmu::new(config);
    let mem = TestMemory::new(0x80_0000);
    let tables = PageTables::sv39(0x40_0000);
    mmu.set_satp(tables.satp(1));
    mmu.set_privilege(PrivilegeMode::Supervisor);
    (mmu, mem, tables)
}

/// Sv39 in S-mode with no PMP regions implemented, so physical checks always pass.
fn sv39() -> (Mmu, TestMemory, PageTables) {
    sv39_with(MmuConfig {
        pmp_regions: 0,
        ..MmuConfig::rv64()
    })
}

fn read_through_generic<B: MemoryBus>(mut bus: B, paddr: u64) -> u32 {
    bus.read_u32(paddr).unwrap()
}

#[test]
fn memory_bus_is_implemented_for_mut_refs() {
    let mut mem = TestMemory::new(0x10);
    mem.data[0..4].copy_from_slice(&0xdead_beefu32.to_le_bytes());

    // `B` is inferred as `&mut TestMemory`.
    assert_eq!(read_through_generic(&mut mem, 0), 0xdead_beef);
    assert_eq!(mem.reads(), 1);
}

#[test]
fn machine_mode_is_untranslated() {
    let mut mmu = Mmu::new(MmuConfig::rv64());
    let mut mem = TestMemory::new(0x10);
    assert_eq!(mmu.privilege(), PrivilegeMode::Machine);
    assert_eq!(
        mmu.translate(&mut mem, 0xdead_beef, 4, AccessType::Write),
        Ok(0xdead_beef)
    );

    let mut rv32 = Mmu::new(MmuConfig::rv32());
    assert_eq!(
        rv32.translate(&mut mem, 0x1_0000_5678, 4, AccessType::Read),
        Ok(0x5678)
    );
}

#[test]
fn sv39_load_reads_mapped_bytes() {
    let (mut mmu, mut mem, mut pt) = sv39();
    pt.map(&mut mem, 0x8000_0000, 0x1000, RWX_AD);
    mem.data[0x1004..0x100c].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

    let mut buf = [0u8; 8];
    mmu.load(&mut mem, 0x8000_0004, &mut buf).unwrap();
    assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(
        mmu.translate(&mut mem, 0x8000_0004, 8, AccessType::Read),
        Ok(0x1004)
    );
    assert_eq!(mmu.last_trap(), None);
}

#[test]
fn tlb_hit_avoids_page_walk_and_sfence_forces_miss() {
    let (mut mmu, mut mem, mut pt) = sv39();
    pt.map(&mut mem, 0x8000_0000, 0x1000, RWX_AD);

    let pa = mmu
        .translate(&mut mem, 0x8000_0123, 4, AccessType::Read)
        .unwrap();
    assert_eq!(pa, 0x1123);

    mem.reset_counters();
    assert_eq!(
        mmu.translate(&mut mem, 0x8000_0123, 4, AccessType::Read),
        Ok(pa)
    );
    assert_eq!(
        mmu.translate(&mut mem, 0x8000_0ff0, 8, AccessType::Write),
        Ok(0x1ff0)
    );
    assert_eq!(mem.reads(), 0);
    assert_eq!(mmu.tlb(TranslationStage::NonVirtual).len(), 1);

    assert_eq!(mmu.sfence_vma(Some(0x8000_0000), None), 1);
    assert_eq!(mmu.virtual_alias_count(PrivilegeMode::Supervisor), 0);
    assert_eq!(
        mmu.translate(&mut mem, 0x8000_0123, 4, AccessType::Read),
        Ok(pa)
    );
    // Three levels of Sv39.
    assert_eq!(mem.reads(), 3);
}

#[test]
fn asid_isolation_and_global_entries() {
    let (mut mmu, mut mem, mut a) = sv39();
    let mut b = PageTables::sv39(0x50_0000);
    a.map(&mut mem, 0x1000, 0x5000, RWX_AD);
    a.map(&mut mem, 0x2000, 0x7000, RWX_AD | PteFlags::G);
    b.map(&mut mem, 0x1000, 0x6000, RWX_AD);

    mmu.set_satp(a.satp(1));
    assert_eq!(mmu.translate(&mut mem, 0x1000, 4, AccessType::Read), Ok(0x5000));
    assert_eq!(mmu.translate(&mut mem, 0x2000, 4, AccessType::Read), Ok(0x7000));

    mmu.set_satp(b.satp(2));
    assert_eq!(mmu.translate(&mut mem, 0x1000, 4, AccessType::Read), Ok(0x6000));

    mem.reset_counters();
    // B has no mapping at 0x2000; the global entry from A is visible anyway.
    assert_eq!(mmu.translate(&mut mem, 0x2000, 4, AccessType::Read), Ok(0x7000));
    mmu.set_satp(a.satp(1));
    assert_eq!(mmu.translate(&mut mem, 0x1000, 4, AccessType::Read), Ok(0x5000));
    assert_eq!(mem.reads(), 0);

    // ASID-specific fences leave global entries and other address spaces alone.
    assert_eq!(mmu.sfence_vma(None, Some(1)), 1);
    assert_eq!(mmu.tlb(TranslationStage::NonVirtual).len(), 2);
    assert!(mmu.tlb_lookup(TranslationStage::NonVirtual, 0x2000).is_some());
}

#[test]
fn clean_entry_rejects_write_without_hardware_update() {
    let (mut mmu, mut mem, mut pt) = sv39();
    let pte_addr = pt.map(&mut mem, 0x3000, 0x8000, PteFlags::R | PteFlags::W | PteFlags::A);
    let before = mem.read_raw_u64(pte_addr);

    let mut buf = [0u8; 4];
    mmu.load(&mut mem, 0x3000, &mut buf).unwrap();

    mem.reset_counters();
    let trap = mmu.store(&mut mem, 0x3000, &[1]).unwrap_err();
    assert_eq!(mem.writes(), 0);
    assert_eq!(trap.exception, Exception::StorePageFault);
    assert_eq!(trap.code(), 15);
    assert_eq!(trap.kind, FaultKind::AccessedOrDirtyBitMissing);
    assert_eq!(trap.tval, 0x3000);
    assert_eq!(mmu.last_trap(), Some(trap));
    assert_eq!(mem.read_raw_u64(pte_addr), before);
    assert_eq!(mem.data[0x8000], 0);
}

#[test]
fn hardware_update_sets_dirty_on_tlb_hit() {
    let (mut mmu, mut mem, mut pt) = sv39();
    let pte_addr = pt.map(&mut mem, 0x3000, 0x8000, PteFlags::R | PteFlags::W | PteFlags::A);
    mmu.set_adue(true);

    let mut buf = [0u8; 4];
    mmu.load(&mut mem, 0x3000, &mut buf).unwrap();
    assert!(!mmu.tlb_lookup(TranslationStage::NonVirtual, 0x3000).unwrap().dirty);

    mmu.store(&mut mem, 0x3000, &[0xaa]).unwrap();
    assert_eq!(mem.data[0x8000], 0xaa);
    assert_ne!(mem.read_raw_u64(pte_addr) & PteFlags::D.bits(), 0);
    assert!(mmu.tlb_lookup(TranslationStage::NonVirtual, 0x3000).unwrap().dirty);
    assert_eq!(mmu.tlb(TranslationStage::NonVirtual).len(), 1);
}

#[test]
fn asid_eviction_drops_exactly_the_lru_address_space() {
    let (mut mmu, mut mem, mut pt) = sv39_with(MmuConfig {
        pmp_regions: 0,
        asid_cache_size: 2,
        asid_cache_max: 2,
        ..MmuConfig::rv64()
    });
    pt.map(&mut mem, 0x1000, 0x5000, RWX_AD);

    for asid in 1..=3 {
        mmu.set_satp(pt.satp(asid));
        assert_eq!(mmu.translate(&mut mem, 0x1000, 4, AccessType::Read), Ok(0x5000));
    }

    let mut asids: Vec<u16> = mmu
        .tlb(TranslationStage::NonVirtual)
        .iter()
        .map(|(_, e)| e.sim_asid.asid())
        .collect();
    asids.sort_unstable();
    assert_eq!(asids, vec![2, 3]);
    assert_eq!(
        mmu.asid_cache(TranslationStage::NonVirtual).keys(),
        &[AsidKey { vmid: 0, asid: 3 }, AsidKey { vmid: 0, asid: 2 }]
    );
    assert_eq!(mmu.virtual_alias_count(PrivilegeMode::Supervisor), 2);
}

#[test]
fn mprv_translates_machine_loads_with_mpp() {
    let (mut mmu, mut mem, mut pt) = sv39();
    pt.map(&mut mem, 0x8000_0000, 0x1000, RWX_AD);

    mmu.set_privilege(PrivilegeMode::Machine);
    assert_eq!(
        mmu.translate(&mut mem, 0x8000_0000, 4, AccessType::Read),
        Ok(0x8000_0000)
    );

    mmu.set_status(StatusFlags {
        mprv: true,
        mpp: 1,
        ..Default::default()
    });
    assert_eq!(
        mmu.translate(&mut mem, 0x8000_0000, 4, AccessType::Read),
        Ok(0x1000)
    );
    // Fetches ignore MPRV.
    assert_eq!(
        mmu.translate(&mut mem, 0x8000_0000, 4, AccessType::Execute),
        Ok(0x8000_0000)
    );
}

#[test]
fn user_pages_need_sum_and_are_never_executable_from_supervisor() {
    let (mut mmu, mut mem, mut pt) = sv39();
    pt.map(&mut mem, 0x4000, 0x9000, RWX_AD | PteFlags::U);
    pt.map(&mut mem, 0x5000, 0xa000, RWX_AD);

    let trap = mmu
        .translate(&mut mem, 0x4000, 4, AccessType::Read)
        .unwrap_err();
    assert_eq!(trap.exception, Exception::LoadPageFault);
    assert_eq!(trap.kind, FaultKind::PrivilegeDenied);

    mmu.set_status(StatusFlags {
        sum: true,
        ..Default::default()
    });
    assert_eq!(mmu.translate(&mut mem, 0x4000, 4, AccessType::Read), Ok(0x9000));
    assert_eq!(
        mmu.translate(&mut mem, 0x4000, 4, AccessType::Execute)
            .unwrap_err()
            .exception,
        Exception::InstructionPageFault
    );

    mmu.set_privilege(PrivilegeMode::User);
    assert_eq!(mmu.translate(&mut mem, 0x4000, 4, AccessType::Execute), Ok(0x9000));
    assert_eq!(
        mmu.translate(&mut mem, 0x5000, 4, AccessType::Read)
            .unwrap_err()
            .exception,
        Exception::LoadPageFault
    );
}

#[test]
fn mxr_makes_execute_only_pages_readable() {
    let (mut mmu, mut mem, mut pt) = sv39();
    pt.map(&mut mem, 0x6000, 0xb000, PteFlags::X | PteFlags::A);

    assert!(mmu.translate(&mut mem, 0x6000, 4, AccessType::Read).is_err());
    mmu.set_status(StatusFlags {
        mxr: true,
        ..Default::default()
    });
    assert_eq!(mmu.translate(&mut mem, 0x6000, 4, AccessType::Read), Ok(0xb000));
}

#[test]
fn pum_inverts_sum_on_priv_1_9() {
    let (mut mmu, mut mem, mut pt) = sv39_with(MmuConfig {
        pmp_regions: 0,
        priv_version: PrivVersion::V1_9,
        ..MmuConfig::rv64()
    });
    pt.map(&mut mem, 0x4000, 0x9000, RWX_AD | PteFlags::U);

    // PUM clear: supervisor may touch user pages.
    assert_eq!(mmu.translate(&mut mem, 0x4000, 4, AccessType::Read), Ok(0x9000));
    mmu.set_status(StatusFlags {
        sum: true,
        ..Default::default()
    });
    assert!(mmu.translate(&mut mem, 0x4000, 4, AccessType::Read).is_err());
}

#[test]
fn access_crossing_a_page_is_split() {
    let (mut mmu, mut mem, mut pt) = sv39();
    pt.map(&mut mem, 0x1000, 0x5000, RWX_AD);
    pt.map(&mut mem, 0x2000, 0x9000, RWX_AD);
    mem.data[0x5ffc..0x6000].copy_from_slice(&[1, 2, 3, 4]);
    mem.data[0x9000..0x9004].copy_from_slice(&[5, 6, 7, 8]);

    let mut buf = [0u8; 8];
    mmu.load(&mut mem, 0x1ffc, &mut buf).unwrap();
    assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn store_faulting_on_second_page_writes_nothing() {
    let (mut mmu, mut mem, mut pt) = sv39();
    pt.map(&mut mem, 0x1000, 0x5000, RWX_AD);

    let trap = mmu.store(&mut mem, 0x1ffc, &[0xff; 8]).unwrap_err();
    assert_eq!(trap.tval, 0x2000);
    assert_eq!(trap.exception, Exception::StorePageFault);
    assert_eq!(&mem.data[0x5ffc..0x6000], &[0, 0, 0, 0]);
}

#[test]
fn backing_store_failure_is_access_fault() {
    let (mut mmu, mut mem, mut pt) = sv39();
    pt.map(&mut mem, 0x1000, 0x5000, RWX_AD);
    mem.fail_range(0x5000, 0x5fff);

    let mut buf = [0u8; 4];
    let trap = mmu.load(&mut mem, 0x1000, &mut buf).unwrap_err();
    assert_eq!(trap.exception, Exception::LoadAccessFault);
    assert_eq!(trap.kind, FaultKind::BackingStoreAccessFault);
}

#[test]
fn probes_never_raise_or_leave_real_entries() {
    let (mut mmu, mut mem, mut pt) = sv39();

    let trap = mmu
        .translate_probe(&mut mem, 0x7777_0000, 4, AccessType::Read)
        .unwrap_err();
    assert_eq!(trap.exception, Exception::LoadPageFault);
    let mut buf = [0u8; 4];
    assert!(mmu.debug_read(&mut mem, 0x7777_0000, &mut buf).is_err());
    assert_eq!(mmu.last_trap(), None);

    pt.map(&mut mem, 0x8000_0000, 0x1000, RWX_AD);
    assert_eq!(
        mmu.translate_probe(&mut mem, 0x8000_0000, 4, AccessType::Read),
        Ok(0x1000)
    );
    let tlb = mmu.tlb(TranslationStage::NonVirtual);
    assert_eq!(tlb.len(), 1);
    assert!(tlb.iter().all(|(_, e)| e.artifact));
    assert_eq!(mmu.virtual_alias_count(PrivilegeMode::Supervisor), 0);

    // The next real lookup discards the artifact and walks.
    mem.reset_counters();
    assert_eq!(
        mmu.translate(&mut mem, 0x8000_0000, 4, AccessType::Read),
        Ok(0x1000)
    );
    assert_eq!(mem.reads(), 3);
    let tlb = mmu.tlb(TranslationStage::NonVirtual);
    assert_eq!(tlb.len(), 1);
    assert!(tlb.iter().all(|(_, e)| !e.artifact));
}

#[test]
fn custom_entries_survive_fences_until_removed() {
    let (mut mmu, mut mem, _pt) = sv39();
    let id = mmu.inject_tlb_entry(
        TranslationStage::NonVirtual,
        CustomMapping {
            va: 0x9000_0000,
            size_log2: 12,
            pa: 0x2000,
            priv_: Priv::R | Priv::W,
            user: false,
            global: false,
        },
    );

    mem.reset_counters();
    assert_eq!(
        mmu.translate(&mut mem, 0x9000_0010, 4, AccessType::Write),
        Ok(0x2010)
    );
    assert_eq!(mem.reads(), 0);

    assert_eq!(mmu.sfence_vma(None, None), 0);
    mmu.flush_all();
    assert_eq!(
        mmu.translate(&mut mem, 0x9000_0010, 4, AccessType::Write),
        Ok(0x2010)
    );

    assert!(mmu.remove_custom_entry(id));
    assert!(!mmu.remove_custom_entry(id));
    let trap = mmu
        .translate(&mut mem, 0x9000_0010, 4, AccessType::Write)
        .unwrap_err();
    assert_eq!(trap.exception, Exception::StorePageFault);
}

#[test]
fn custom_entry_carves_out_of_walked_superpage() {
    let (mut mmu, mut mem, mut pt) = sv39();
    pt.map_at_level(&mut mem, 0x4000_0000, 0, 2, RWX_AD);
    assert_eq!(
        mmu.translate(&mut mem, 0x4000_1000, 4, AccessType::Read),
        Ok(0x1000)
    );

    mmu.inject_tlb_entry(
        TranslationStage::NonVirtual,
        CustomMapping {
            va: 0x4000_1000,
            size_log2: 12,
            pa: 0x3_0000,
            priv_: Priv::R,
            user: false,
            global: false,
        },
    );
    assert_eq!(
        mmu.translate(&mut mem, 0x4000_1000, 4, AccessType::Read),
        Ok(0x3_0000)
    );
    assert_eq!(
        mmu.translate(&mut mem, 0x4000_2000, 4, AccessType::Read),
        Ok(0x2000)
    );
    assert_eq!(
        mmu.translate(&mut mem, 0x4000_1008, 4, AccessType::Read),
        Ok(0x3_0008)
    );
}

#[test]
fn satp_writes_are_warl() {
    let mut mmu = Mmu::new(MmuConfig {
        asid_bits: 4,
        ..MmuConfig::rv64()
    });
    // Sv57 is not implemented by default.
    assert_eq!(mmu.set_satp((10u64 << 60) | 0x1234), 0);
    assert_eq!(
        mmu.set_satp((8u64 << 60) | (0x1f << 44) | 0x1234),
        (8u64 << 60) | (0xf << 44) | 0x1234
    );
    assert_eq!(mmu.satp().id, 0xf);
    // No hypervisor: vsatp/hgatp read as zero.
    assert_eq!(mmu.set_vsatp(8u64 << 60), 0);
    assert_eq!(mmu.set_hgatp(8u64 << 60), 0);
}

#[test]
fn satp_mode_change_flushes_the_stage() {
    let (mut mmu, mut mem, mut pt) = sv39();
    pt.map(&mut mem, 0x1000, 0x5000, RWX_AD);
    mmu.translate(&mut mem, 0x1000, 4, AccessType::Read).unwrap();

    // Changing only the ASID keeps the entry.
    mmu.set_satp(pt.satp(2));
    assert_eq!(mmu.tlb(TranslationStage::NonVirtual).len(), 1);

    mmu.set_satp(0);
    assert!(mmu.tlb(TranslationStage::NonVirtual).is_empty());
    assert_eq!(mmu.virtual_alias_count(PrivilegeMode::Supervisor), 0);
    assert_eq!(mmu.translate(&mut mem, 0x1000, 4, AccessType::Read), Ok(0x1000));
}

#[test]
fn sv32_pages_and_megapages() {
    let mut mmu = Mmu::new(MmuConfig {
        pmp_regions: 0,
        ..MmuConfig::rv32()
    });
    let mut mem = TestMemory::new(0x20_0000);
    let mut pt = PageTables::sv32(0x10_0000);
    pt.map(&mut mem, 0x4000_1000, 0x3000, RWX_AD);
    pt.map_at_level(&mut mem, 0x8040_0000, 0x40_0000, 1, RWX_AD);
    mmu.set_satp(pt.satp(3));
    mmu.set_privilege(PrivilegeMode::Supervisor);

    assert_eq!(
        mmu.translate(&mut mem, 0x4000_1234, 4, AccessType::Read),
        Ok(0x3234)
    );
    assert_eq!(
        mmu.translate(&mut mem, 0x8045_6788, 4, AccessType::Read),
        Ok(0x45_6788)
    );
    let entry = mmu
        .tlb_lookup(TranslationStage::NonVirtual, 0x8045_6788)
        .unwrap();
    assert_eq!(entry.size_log2, 22);
}

#[test]
fn invalidate_filter_all_keeps_other_stages() {
    let (mut mmu, mut mem, mut pt) = sv39();
    pt.map(&mut mem, 0x1000, 0x5000, RWX_AD);
    pt.map(&mut mem, 0x2000, 0x6000, RWX_AD);
    mmu.translate(&mut mem, 0x1000, 4, AccessType::Read).unwrap();
    mmu.translate(&mut mem, 0x2000, 4, AccessType::Read).unwrap();

    assert_eq!(
        mmu.invalidate(InvalidateFilter::all(TranslationStage::GuestStage1)),
        0
    );
    assert_eq!(
        mmu.invalidate(InvalidateFilter {
            asid: Match::Current,
            ..InvalidateFilter::all(TranslationStage::NonVirtual)
        }),
        2
    );

    // Non-virtual entries carry no VMID; a VMID filter does not narrow the fence.
    mmu.translate(&mut mem, 0x1000, 4, AccessType::Read).unwrap();
    assert_eq!(
        mmu.invalidate(InvalidateFilter {
            vmid: Match::Only(3),
            ..InvalidateFilter::all(TranslationStage::NonVirtual)
        }),
        1
    );
    assert!(mmu.tlb(TranslationStage::NonVirtual).is_empty());
}

fn pmp_supervisor(config: MmuConfig) -> (Mmu, TestMemory) {
    let mut mmu = Mmu::new(config);
    mmu.set_privilege(PrivilegeMode::Supervisor);
    (mmu, TestMemory::new(0x1_0000))
}

/// Region 0: NA4 read-only at 0x1000. Region 1: RWX over the low 4 GiB.
fn program_two_regions(mmu: &mut Mmu) -> u64 {
    let cfg = u64::from(cfg_byte(AddressMatch::NaturallyAligned4, Priv::R, false))
        | u64::from(cfg_byte(AddressMatch::NaturallyAlignedPow2, Priv::all(), false)) << 8;
    mmu.write_protection_register(RegisterKind::PmpAddr, 0, 0x1000 >> 2);
    mmu.write_protection_register(RegisterKind::PmpAddr, 1, napot_addr(0, 1 << 32));
    mmu.write_protection_register(RegisterKind::PmpCfg, 0, cfg)
}

#[test]
fn pmp_denies_supervisor_without_matching_region() {
    let (mut mmu, mut mem) = pmp_supervisor(MmuConfig::rv64());
    let trap = mmu
        .translate(&mut mem, 0x100, 4, AccessType::Read)
        .unwrap_err();
    assert_eq!(trap.exception, Exception::LoadAccessFault);
    assert_eq!(trap.kind, FaultKind::PmpDenied);
}

#[test]
fn pmp_straddle_rules() {
    let (mut mmu, mut mem) = pmp_supervisor(MmuConfig::rv64());
    let cfg = program_two_regions(&mut mmu);
    assert_eq!(mmu.read_protection_register(RegisterKind::PmpCfg, 0), cfg);

    let trap = mmu
        .translate(&mut mem, 0x1000, 8, AccessType::Read)
        .unwrap_err();
    assert_eq!(trap.kind, FaultKind::StraddledProtectionRegions);
    assert_eq!(trap.exception, Exception::LoadAccessFault);

    // Misaligned, two regions, both readable.
    assert_eq!(mmu.translate(&mut mem, 0x1002, 4, AccessType::Read), Ok(0x1002));

    let trap = mmu
        .translate(&mut mem, 0x1000, 4, AccessType::Write)
        .unwrap_err();
    assert_eq!(trap.exception, Exception::StoreAccessFault);
    assert_eq!(trap.kind, FaultKind::PmpDenied);
    assert_eq!(mmu.translate(&mut mem, 0x1004, 4, AccessType::Write), Ok(0x1004));

    let (mut strict, mut mem) = pmp_supervisor(MmuConfig {
        unaligned_decompose: false,
        ..MmuConfig::rv64()
    });
    program_two_regions(&mut strict);
    assert_eq!(
        strict
            .translate(&mut mem, 0x1002, 4, AccessType::Read)
            .unwrap_err()
            .kind,
        FaultKind::StraddledProtectionRegions
    );
}

#[test]
fn pmp_reprogramming_drops_cached_ranges() {
    let (mut mmu, mut mem) = pmp_supervisor(MmuConfig::rv64());
    program_two_regions(&mut mmu);
    assert_eq!(mmu.translate(&mut mem, 0x2000, 4, AccessType::Write), Ok(0x2000));

    let read_only = u64::from(cfg_byte(AddressMatch::NaturallyAligned4, Priv::R, false))
        | u64::from(cfg_byte(AddressMatch::NaturallyAlignedPow2, Priv::R, false)) << 8;
    mmu.write_protection_register(RegisterKind::PmpCfg, 0, read_only);
    assert_eq!(
        mmu.translate(&mut mem, 0x2000, 4, AccessType::Write)
            .unwrap_err()
            .kind,
        FaultKind::PmpDenied
    );
    assert_eq!(mmu.translate(&mut mem, 0x2000, 4, AccessType::Read), Ok(0x2000));
}

#[test]
fn locked_region_ignores_writes_and_binds_machine_mode() {
    let (mut mmu, mut mem) = pmp_supervisor(MmuConfig::rv64());
    let locked = u64::from(cfg_byte(AddressMatch::NaturallyAligned4, Priv::R, true));
    mmu.write_protection_register(RegisterKind::PmpAddr, 0, 0x1000 >> 2);
    assert_eq!(mmu.write_protection_register(RegisterKind::PmpCfg, 0, locked), locked);

    assert_eq!(
        mmu.write_protection_register(RegisterKind::PmpCfg, 0, 0x07),
        locked
    );
    assert_eq!(
        mmu.write_protection_register(RegisterKind::PmpAddr, 0, 0x2000 >> 2),
        0x1000 >> 2
    );

    mmu.set_privilege(PrivilegeMode::Machine);
    assert_eq!(mmu.translate(&mut mem, 0x1000, 4, AccessType::Read), Ok(0x1000));
    assert_eq!(
        mmu.translate(&mut mem, 0x1000, 4, AccessType::Write)
            .unwrap_err()
            .exception,
        Exception::StoreAccessFault
    );
    // Unmatched machine accesses stay open.
    assert_eq!(mmu.translate(&mut mem, 0x3000, 4, AccessType::Write), Ok(0x3000));
}

#[test]
fn unimplemented_protection_registers_read_as_zero() {
    let (mut mmu, _mem) = pmp_supervisor(MmuConfig::rv64());
    // RV64 has no odd pmpcfg registers.
    assert_eq!(mmu.write_protection_register(RegisterKind::PmpCfg, 1, 0x1f), 0);
    assert_eq!(mmu.write_protection_register(RegisterKind::PmpAddr, 64, 0x1234), 0);
    assert_eq!(mmu.write_protection_register(RegisterKind::MpuCfg, 0, 0x1f), 0);
    assert_eq!(mmu.read_protection_register(RegisterKind::MpuAddr, 0), 0);
    // Without Smepmp, mseccfg is hardwired to zero.
    assert_eq!(mmu.write_protection_register(RegisterKind::Mseccfg, 0, 0b11), 0);
}

#[test]
fn mpu_gates_user_and_supervisor_accesses() {
    let mut mmu = Mmu::new(MmuConfig {
        pmp_regions: 0,
        mpu_regions: 4,
        ..MmuConfig::rv64()
    });
    let mut mem = TestMemory::new(0x1_0000);
    mmu.set_privilege(PrivilegeMode::User);

    let trap = mmu
        .translate(&mut mem, 0x100, 4, AccessType::Read)
        .unwrap_err();
    assert_eq!(trap.kind, FaultKind::MpuDenied);
    assert_eq!(trap.code(), 25);

    // User region, read/write.
    let user_rw = cfg_byte(AddressMatch::NaturallyAlignedPow2, Priv::R | Priv::W, false) | 0x40;
    mmu.write_protection_register(RegisterKind::MpuAddr, 0, napot_addr(0, 0x1_0000));
    mmu.write_protection_register(RegisterKind::MpuCfg, 0, u64::from(user_rw));
    assert_eq!(
        mmu.protection_region(UnitKind::Mpu, 0).map(|r| r.user),
        Some(true)
    );

    assert_eq!(mmu.translate(&mut mem, 0x100, 4, AccessType::Read), Ok(0x100));
    assert_eq!(
        mmu.translate(&mut mem, 0x100, 4, AccessType::Execute)
            .unwrap_err()
            .code(),
        24
    );

    mmu.set_privilege(PrivilegeMode::Supervisor);
    assert_eq!(
        mmu.translate(&mut mem, 0x100, 4, AccessType::Write)
            .unwrap_err()
            .code(),
        26
    );
    mmu.set_status(StatusFlags {
        sum: true,
        ..Default::default()
    });
    assert_eq!(mmu.translate(&mut mem, 0x100, 4, AccessType::Write), Ok(0x100));

    // Supervisor accesses outside every region are allowed.
    assert_eq!(mmu.translate(&mut mem, 0x2_0000, 4, AccessType::Read), Ok(0x2_0000));
}

#[derive(Debug)]
struct RejectUserPtes;

impl MmuExtension for RejectUserPtes {
    fn validate_pte(&self, _stage: TranslationStage, pte: &PageTableEntry, _level: u32) -> bool {
        !pte.user()
    }
}

#[test]
fn extension_can_reject_ptes() {
    let (mut mmu, mut mem, mut pt) = sv39();
    pt.map(&mut mem, 0x4000, 0x9000, RWX_AD | PteFlags::U);
    mmu.set_privilege(PrivilegeMode::User);
    assert_eq!(mmu.translate(&mut mem, 0x4000, 4, AccessType::Read), Ok(0x9000));

    mmu.register_extension(Box::new(RejectUserPtes));
    assert!(mmu.tlb(TranslationStage::NonVirtual).is_empty());
    let trap = mmu
        .translate(&mut mem, 0x4000, 4, AccessType::Read)
        .unwrap_err();
    assert_eq!(trap.kind, FaultKind::CustomValidationRejected);
    assert_eq!(trap.exception, Exception::LoadPageFault);
}

#[derive(Debug)]
struct OpenPmpDefault;

impl MmuExtension for OpenPmpDefault {
    fn pmp_priv_override(
        &self,
        unit: UnitKind,
        region: Option<usize>,
        _requester: Requester,
        priv_: Priv,
    ) -> Priv {
        if unit == UnitKind::Pmp && region.is_none() {
            Priv::all()
        } else {
            priv_
        }
    }
}

#[test]
fn extension_can_override_pmp_priv() {
    let (mut mmu, mut mem) = pmp_supervisor(MmuConfig::rv64());
    assert!(mmu.translate(&mut mem, 0x100, 4, AccessType::Read).is_err());

    mmu.register_extension(Box::new(OpenPmpDefault));
    assert_eq!(mmu.translate(&mut mem, 0x100, 4, AccessType::Read), Ok(0x100));
}

#[derive(Debug)]
struct LowMemoryOnly;

impl MmuExtension for LowMemoryOnly {
    fn pma_enable(&self, _domain: PmaDomain, low: u64, _high: u64) -> bool {
        low < 0x10_0000
    }
}

#[test]
fn pma_windows_and_control_block() {
    let mut mmu = Mmu::new(MmuConfig::rv64());
    let mut mem = TestMemory::new(0x10);
    mmu.register_extension(Box::new(LowMemoryOnly));

    assert_eq!(mmu.translate(&mut mem, 0x8, 4, AccessType::Read), Ok(0x8));
    let trap = mmu
        .translate(&mut mem, 0x20_0000, 4, AccessType::Read)
        .unwrap_err();
    assert_eq!(trap.kind, FaultKind::CustomValidationRejected);
    assert_eq!(trap.exception, Exception::LoadAccessFault);

    let cluster = Cluster::new();
    mmu.attach_control_block(cluster.control_block(0x20_0000, 0x1000));
    assert_eq!(
        mmu.translate(&mut mem, 0x20_0000, 4, AccessType::Read),
        Ok(0x20_0000)
    );
    assert!(mmu.control_block().is_some());
}

#[cfg(feature = "stats")]
#[test]
fn stats_count_hits_walks_and_alias_hits() {
    let (mut mmu, mut mem, mut pt) = sv39();
    pt.map(&mut mem, 0x1000, 0x5000, RWX_AD);

    mmu.translate(&mut mem, 0x1000, 4, AccessType::Read).unwrap();
    mmu.translate(&mut mem, 0x1000, 4, AccessType::Read).unwrap();
    let stats = mmu.stats().unwrap();
    assert_eq!(stats.page_walks(), 1);
    assert_eq!(stats.tlb_misses(), 1);
    assert_eq!(stats.alias_hits(), 1);

    mmu.reset_stats();
    assert_eq!(mmu.stats().unwrap(), MmuStats::default());
}

#[cfg(not(feature = "stats"))]
#[test]
fn stats_are_disabled_without_feature() {
    let mmu = Mmu::default();
    assert!(mmu.stats().is_none());
}
