//! Page-table walker shared by all three translation stages.

use tracing::{debug, trace};

use crate::csr::{PrivilegeMode, SimAsid, TranslationStage};
use crate::fault::{Fault, FaultKind};
use crate::index::align_down;
use crate::pte::{
    Layout, PageTableEntry, Priv, PteFlags, NAPOT_PPN_MASK, NAPOT_PPN_PATTERN, NAPOT_SIZE_LOG2,
};
use crate::tlb::TlbEntry;
use crate::{AccessType, MemoryBus, Mmu, Request, PAGE_SHIFT};

/// PBMT value 3 is reserved.
const PBMT_RESERVED: u8 = 3;

impl Mmu {
    /// Walks `stage`'s tables for `addr` and returns the entry to cache.
    ///
    /// `addr` is a virtual address for the non-virtual and VS stages and a guest-physical address
    /// for the G-stage. Accessed/dirty bits are set in memory here when hardware update is
    /// enabled and the access is not a probe.
    pub(crate) fn walk<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        stage: TranslationStage,
        addr: u64,
        req: Request,
    ) -> Result<TlbEntry, Fault> {
        bump!(self, page_walks);

        let root = match stage {
            TranslationStage::NonVirtual => self.satp,
            TranslationStage::GuestStage1 => self.vsatp,
            TranslationStage::GuestStage2 => self.hgatp,
        };
        let gpa = (stage == TranslationStage::GuestStage2).then_some(addr);
        let fault = |kind| Fault::translation(kind, stage, gpa);

        let Some(layout) = root.mode.layout(stage == TranslationStage::GuestStage2) else {
            // Callers only walk active stages.
            return Err(fault(FaultKind::MalformedPageTableEntry));
        };

        if stage == TranslationStage::GuestStage2 {
            if layout.va_bits < 64 && addr >> layout.va_bits != 0 {
                return Err(fault(FaultKind::GuestAddressExtensionInvalid));
            }
        } else if !root.mode.is_canonical(addr) {
            return Err(fault(FaultKind::NonCanonicalAddress));
        }

        debug!(?stage, addr, mode = ?root.mode, "page walk");

        let mut table = root.root_addr();
        let mut global = false;
        let mut level = layout.levels - 1;
        loop {
            let pte_addr = table + layout.vpn(addr, level) * u64::from(layout.pte_bytes);
            let pte = self.read_pte(bus, stage, pte_addr, &layout, req)?;
            trace!(?stage, level, pte_addr, raw = pte.raw(), "PTE");

            if !self.well_formed(&pte) {
                return Err(fault(FaultKind::MalformedPageTableEntry));
            }
            global |= pte.global();

            if pte.is_leaf() {
                return self.leaf(bus, stage, addr, pte, pte_addr, level, &layout, global, req);
            }

            let flags = pte.flags();
            if level == 0
                || flags.intersects(PteFlags::A | PteFlags::D | PteFlags::U)
                || pte.napot()
                || pte.pbmt() != 0
            {
                return Err(fault(FaultKind::MalformedPageTableEntry));
            }
            table = pte.ppn() << PAGE_SHIFT;
            level -= 1;
        }
    }

    /// Encoding checks common to leaf and pointer entries.
    fn well_formed(&self, pte: &PageTableEntry) -> bool {
        let rw = pte.priv_() & (Priv::R | Priv::W);
        let pbmt = pte.pbmt();
        pte.valid()
            && rw != Priv::W
            && pte.reserved() == 0
            && (pbmt == 0 || (self.config.svpbmt && pbmt != PBMT_RESERVED))
            && (!pte.napot() || self.config.svnapot)
    }

    #[allow(clippy::too_many_arguments)]
    fn leaf<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        stage: TranslationStage,
        addr: u64,
        pte: PageTableEntry,
        pte_addr: u64,
        level: u32,
        layout: &Layout,
        global: bool,
        req: Request,
    ) -> Result<TlbEntry, Fault> {
        let gpa = (stage == TranslationStage::GuestStage2).then_some(addr);
        let fault = |kind| Fault::translation(kind, stage, gpa);

        let mut ppn = pte.ppn();
        let mut size_log2 = layout.page_size_log2(level);
        if level > 0 {
            let superpage_mask = (1u64 << (level * layout.vpn_bits)) - 1;
            if ppn & superpage_mask != 0 {
                return Err(fault(FaultKind::SuperpageMisaligned));
            }
        }
        if pte.napot() {
            if level != 0 || ppn & NAPOT_PPN_MASK != NAPOT_PPN_PATTERN {
                return Err(fault(FaultKind::MalformedPageTableEntry));
            }
            ppn &= !NAPOT_PPN_MASK;
            size_log2 = NAPOT_SIZE_LOG2;
        }

        if !self
            .extensions
            .iter()
            .all(|ext| ext.validate_pte(stage, &pte, level))
        {
            debug!(?stage, addr, raw = pte.raw(), "PTE rejected by extension");
            return Err(fault(FaultKind::CustomValidationRejected));
        }

        let granted = match stage {
            TranslationStage::NonVirtual => self.stage1_priv(pte.priv_(), pte.user(), req.mode, false),
            TranslationStage::GuestStage1 => self.stage1_priv(pte.priv_(), pte.user(), req.mode, true),
            TranslationStage::GuestStage2 => self.stage2_priv(pte.priv_(), pte.user()),
        };
        if !granted.contains(req.access.required_priv()) {
            return Err(fault(FaultKind::PrivilegeDenied));
        }

        let mut pte = pte;
        let needs_dirty = req.access.is_write() && !pte.dirty();
        if !pte.accessed() || needs_dirty {
            if !self.adue {
                return Err(fault(FaultKind::AccessedOrDirtyBitMissing));
            }
            let mut set = PteFlags::A;
            if req.access.is_write() {
                set |= PteFlags::D;
            }
            pte = pte.with_flags(set);
            if !req.probe {
                self.write_pte(bus, stage, pte_addr, layout, pte, req)?;
            }
        }

        let global = global && stage != TranslationStage::GuestStage2;
        Ok(TlbEntry {
            low: align_down(addr, size_log2),
            size_log2,
            pa: ppn << PAGE_SHIFT,
            stage,
            priv_: pte.priv_(),
            global,
            user: pte.user(),
            accessed: pte.accessed(),
            dirty: pte.dirty(),
            sim_asid: self.sim_asid,
            asid_mask: SimAsid::mask(stage, global),
            mapped_modes: 0,
            artifact: req.probe,
            custom: None,
            pte_addr: Some(pte_addr),
        })
    }

    /// Physical address of a PTE. VS-stage tables live in guest-physical memory.
    fn pte_physical<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        stage: TranslationStage,
        pte_addr: u64,
        access: AccessType,
        req: Request,
    ) -> Result<u64, Fault> {
        if stage != TranslationStage::GuestStage1 || !self.hgatp.is_active() {
            return Ok(pte_addr);
        }
        let implicit = Request {
            access,
            mode: PrivilegeMode::VirtualSupervisor,
            probe: req.probe,
        };
        let (_, entry) = self.stage_lookup(bus, TranslationStage::GuestStage2, pte_addr, implicit)?;
        Ok(entry.translate(pte_addr))
    }

    fn read_pte<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        stage: TranslationStage,
        pte_addr: u64,
        layout: &Layout,
        req: Request,
    ) -> Result<PageTableEntry, Fault> {
        let pa = self.pte_physical(bus, stage, pte_addr, AccessType::Read, req)?;
        let bytes = u64::from(layout.pte_bytes);
        self.check_implicit(pa, bytes, AccessType::Read, req.probe)?;

        let raw = if bytes == 4 {
            bus.read_u32(pa).map(u64::from)
        } else {
            bus.read_u64(pa)
        };
        match raw {
            Ok(raw) => Ok(PageTableEntry::new(raw, self.config.xlen)),
            Err(err) => {
                debug!(%err, ?stage, "PTE read failed");
                Err(Fault::physical(FaultKind::BackingStoreAccessFault))
            }
        }
    }

    fn write_pte<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        stage: TranslationStage,
        pte_addr: u64,
        layout: &Layout,
        pte: PageTableEntry,
        req: Request,
    ) -> Result<(), Fault> {
        let pa = self.pte_physical(bus, stage, pte_addr, AccessType::Write, req)?;
        let bytes = u64::from(layout.pte_bytes);
        self.check_implicit(pa, bytes, AccessType::Write, req.probe)?;

        let written = if bytes == 4 {
            bus.write_u32(pa, pte.raw() as u32)
        } else {
            bus.write_u64(pa, pte.raw())
        };
        written.map_err(|err| {
            debug!(%err, ?stage, "PTE write-back failed");
            Fault::physical(FaultKind::BackingStoreAccessFault)
        })?;
        trace!(?stage, pte_addr, raw = pte.raw(), "PTE accessed/dirty update");
        Ok(())
    }
}
