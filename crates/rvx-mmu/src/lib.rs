//! RISC-V MMU: virtual → physical translation with a software TLB and physical memory
//! protection.
//!
//! This crate implements the memory-management core of a RISC-V hart:
//! - Sv32/Sv39/Sv48/Sv57 page-table walks, including Svnapot and Svpbmt encodings
//! - Two-stage (hypervisor) translation through `vsatp` and `hgatp`
//! - One TLB per translation stage, tagged with a composite ASID/VMID context and bounded by an
//!   adaptive MRU cache of address spaces
//! - PMP (with Smepmp) and an optional MPU, both cached as uniform-permission physical ranges
//! - Lazily established PMA windows with pluggable attribute checks
//!
//! Successful translations are also materialized as per-mode virtual aliases, so a repeated
//! access skips the TLB entirely. Tearing down a TLB entry tears down every alias derived from it
//! within the same call.

#[cfg(feature = "stats")]
macro_rules! bump {
    ($mmu:expr, $field:ident) => {
        $mmu.stats.$field = $mmu.stats.$field.wrapping_add(1)
    };
}

#[cfg(not(feature = "stats"))]
macro_rules! bump {
    ($mmu:expr, $field:ident) => {
        ()
    };
}

pub mod asid;
pub mod cluster;
pub mod config;
pub mod csr;
pub mod domain;
pub mod extension;
pub mod fault;
pub mod pma;
pub mod pmp;
pub mod pte;
pub mod snapshot;
pub mod tlb;

mod index;
mod walker;

#[cfg(test)]
mod test_util;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};

use crate::index::align_down;

pub use crate::asid::{AsidCache, AsidKey};
pub use crate::cluster::{Cluster, ControlBlock};
pub use crate::config::{MmuConfig, PrivVersion, VmModes};
pub use crate::csr::{PrivilegeMode, RootRegister, SimAsid, StatusFlags, TranslationStage, Xlen};
pub use crate::domain::{Alias, AliasOwner, DomainSet, PhysAlias, PhysDomain};
pub use crate::extension::{MmuExtension, PmaDomain};
pub use crate::fault::{Exception, Fault, FaultKind, FaultSite, Trap};
pub use crate::pma::PmaLayer;
pub use crate::pmp::{Mseccfg, ProtectionUnit, Region, Requester, UnitKind};
pub use crate::pte::{PageTableEntry, Priv, PteFlags, VmMode};
pub use crate::snapshot::SnapshotError;
pub use crate::tlb::{CustomEntryId, EntryId, Tlb, TlbEntry, TlbSelector};

const PAGE_SHIFT: u32 = 12;
const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Raw backing-store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("bus error at physical address {addr:#x}")]
pub struct BusError {
    pub addr: u64,
}

/// Physical memory access used for guest data and for page-table walking.
///
/// Only the byte-slice methods are required; the fixed-width helpers are little-endian wrappers
/// that backends may override with faster paths.
pub trait MemoryBus {
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) -> Result<(), BusError>;
    fn write_bytes(&mut self, paddr: u64, src: &[u8]) -> Result<(), BusError>;

    #[inline]
    fn read_u32(&mut self, paddr: u64) -> Result<u32, BusError> {
        let mut buf = [0u8; 4];
        self.read_bytes(paddr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    #[inline]
    fn read_u64(&mut self, paddr: u64) -> Result<u64, BusError> {
        let mut buf = [0u8; 8];
        self.read_bytes(paddr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    #[inline]
    fn write_u32(&mut self, paddr: u64, value: u32) -> Result<(), BusError> {
        self.write_bytes(paddr, &value.to_le_bytes())
    }

    #[inline]
    fn write_u64(&mut self, paddr: u64, value: u64) -> Result<(), BusError> {
        self.write_bytes(paddr, &value.to_le_bytes())
    }
}

impl<T: MemoryBus + ?Sized> MemoryBus for &mut T {
    #[inline]
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) -> Result<(), BusError> {
        <T as MemoryBus>::read_bytes(&mut **self, paddr, dst)
    }

    #[inline]
    fn write_bytes(&mut self, paddr: u64, src: &[u8]) -> Result<(), BusError> {
        <T as MemoryBus>::write_bytes(&mut **self, paddr, src)
    }

    #[inline]
    fn read_u32(&mut self, paddr: u64) -> Result<u32, BusError> {
        <T as MemoryBus>::read_u32(&mut **self, paddr)
    }

    #[inline]
    fn read_u64(&mut self, paddr: u64) -> Result<u64, BusError> {
        <T as MemoryBus>::read_u64(&mut **self, paddr)
    }

    #[inline]
    fn write_u32(&mut self, paddr: u64, value: u32) -> Result<(), BusError> {
        <T as MemoryBus>::write_u32(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u64(&mut self, paddr: u64, value: u64) -> Result<(), BusError> {
        <T as MemoryBus>::write_u64(&mut **self, paddr, value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl AccessType {
    #[inline]
    pub fn is_write(self) -> bool {
        matches!(self, AccessType::Write)
    }

    #[inline]
    pub fn is_execute(self) -> bool {
        matches!(self, AccessType::Execute)
    }

    #[inline]
    pub fn required_priv(self) -> Priv {
        match self {
            AccessType::Read => Priv::R,
            AccessType::Write => Priv::W,
            AccessType::Execute => Priv::X,
        }
    }

    /// Column of [`fault::EXCEPTION_TABLE`].
    #[inline]
    pub(crate) fn index(self) -> usize {
        match self {
            AccessType::Read => 0,
            AccessType::Write => 1,
            AccessType::Execute => 2,
        }
    }
}

/// One axis of an invalidation filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match<T> {
    Any,
    /// The identifier currently installed in the stage's root register.
    Current,
    Only(T),
}

/// Fence filter for [`Mmu::invalidate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidateFilter {
    pub stage: TranslationStage,
    /// Single address (virtual, or guest-physical for the G-stage); `None` for all.
    pub address: Option<u64>,
    /// Ignored for the G-stage.
    pub asid: Match<u16>,
    /// Ignored for the non-virtual stage.
    pub vmid: Match<u16>,
}

impl InvalidateFilter {
    pub fn all(stage: TranslationStage) -> Self {
        Self {
            stage,
            address: None,
            asid: Match::Any,
            vmid: Match::Any,
        }
    }
}

/// Protection register files reachable through [`Mmu::write_protection_register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    PmpCfg,
    PmpAddr,
    Mseccfg,
    MpuCfg,
    MpuAddr,
}

/// An externally supplied translation, bypassing the page tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomMapping {
    pub va: u64,
    /// Raised to at least a 4 KiB page.
    pub size_log2: u8,
    pub pa: u64,
    pub priv_: Priv,
    pub user: bool,
    pub global: bool,
}

macro_rules! mmu_stats {
    ($($(#[$doc:meta])* $name:ident,)*) => {
        /// Optional MMU/TLB statistics.
        ///
        /// When the `stats` feature is disabled, this type contains no fields and
        /// [`Mmu::stats`] will always return `None`.
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
        pub struct MmuStats {
            $(
                $(#[$doc])*
                #[cfg(feature = "stats")]
                pub $name: u64,
            )*
        }

        impl MmuStats {
            $(
                $(#[$doc])*
                #[inline]
                pub fn $name(&self) -> u64 {
                    #[cfg(feature = "stats")]
                    {
                        self.$name
                    }
                    #[cfg(not(feature = "stats"))]
                    {
                        0
                    }
                }
            )*
        }
    };
}

mmu_stats! {
    /// TLB lookups, across all stages.
    tlb_lookups,
    /// TLB lookups that found a usable entry.
    tlb_hits,
    /// TLB lookups that fell through to a walk.
    tlb_misses,
    /// Page-table walks, including G-stage walks for VS-stage PTE addresses.
    page_walks,
    /// Accesses served by a virtual alias without consulting the TLB.
    alias_hits,
    /// PMP/MPU checks.
    phys_checks,
    /// PMP/MPU checks served by a cached physical range.
    phys_alias_hits,
    /// Fence operations.
    invalidations,
}

/// Everything that shapes one access.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Request {
    pub(crate) access: AccessType,
    /// Effective privilege (after `MPRV`).
    pub(crate) mode: PrivilegeMode,
    /// Diagnostic access: no exceptions recorded, no architectural side effects.
    pub(crate) probe: bool,
}

/// Protection decisions gathered over every page of one access, so the straddle rule sees the
/// whole access rather than each page on its own.
#[derive(Debug, Default)]
struct Spans {
    pmp: Vec<pmp::Decision>,
    mpu: Vec<pmp::Decision>,
}

impl Spans {
    fn unit(&mut self, kind: UnitKind) -> &mut Vec<pmp::Decision> {
        match kind {
            UnitKind::Pmp => &mut self.pmp,
            UnitKind::Mpu => &mut self.mpu,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PhysCheck {
    kind: UnitKind,
    domain: PhysDomain,
    requester: Requester,
    low: u64,
    high: u64,
}

/// Per-hart MMU. Owns its TLBs, protection units and address-space domains.
#[derive(Debug)]
pub struct Mmu {
    config: MmuConfig,
    mode: PrivilegeMode,
    status: StatusFlags,
    satp: RootRegister,
    vsatp: RootRegister,
    hgatp: RootRegister,
    sim_asid: SimAsid,
    /// Hardware accessed/dirty update (`menvcfg.ADUE`).
    adue: bool,
    instret: u64,
    next_custom: u32,
    tlbs: [Tlb; 3],
    pmp: ProtectionUnit,
    mpu: Option<ProtectionUnit>,
    pma: PmaLayer,
    domains: DomainSet,
    extensions: Vec<Box<dyn MmuExtension>>,
    control_block: Option<Arc<ControlBlock>>,
    last_trap: Option<Trap>,
    #[cfg(feature = "stats")]
    stats: MmuStats,
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new(MmuConfig::default())
    }
}

impl Mmu {
    pub fn new(config: MmuConfig) -> Self {
        let config = config.validated();
        let tlb = |stage| Tlb::new(stage, config.asid_cache_size, config.asid_cache_max);
        let mut mmu = Self {
            mode: PrivilegeMode::Machine,
            status: StatusFlags::default(),
            satp: RootRegister::default(),
            vsatp: RootRegister::default(),
            hgatp: RootRegister::default(),
            sim_asid: SimAsid::default(),
            adue: config.svadu,
            instret: 0,
            next_custom: 0,
            tlbs: [
                tlb(TranslationStage::NonVirtual),
                tlb(TranslationStage::GuestStage1),
                tlb(TranslationStage::GuestStage2),
            ],
            pmp: ProtectionUnit::new(UnitKind::Pmp, config.pmp_regions, &config),
            mpu: (config.mpu_regions > 0)
                .then(|| ProtectionUnit::new(UnitKind::Mpu, config.mpu_regions, &config)),
            pma: PmaLayer::new(config.pma_window_bits, config.split_code_domain),
            domains: DomainSet::new(),
            extensions: Vec::new(),
            control_block: None,
            last_trap: None,
            #[cfg(feature = "stats")]
            stats: MmuStats::default(),
            config,
        };
        mmu.refresh_context();
        mmu
    }

    #[inline]
    pub fn config(&self) -> &MmuConfig {
        &self.config
    }

    /// Returns current MMU/TLB statistics when the `stats` feature is enabled.
    #[inline]
    pub fn stats(&self) -> Option<MmuStats> {
        #[cfg(feature = "stats")]
        {
            Some(self.stats)
        }

        #[cfg(not(feature = "stats"))]
        {
            None
        }
    }

    /// Resets statistics counters back to 0 when the `stats` feature is enabled.
    #[inline]
    pub fn reset_stats(&mut self) {
        #[cfg(feature = "stats")]
        {
            self.stats = MmuStats::default();
        }
    }

    #[inline]
    pub fn privilege(&self) -> PrivilegeMode {
        self.mode
    }

    #[inline]
    pub fn status(&self) -> StatusFlags {
        self.status
    }

    #[inline]
    pub fn satp(&self) -> RootRegister {
        self.satp
    }

    #[inline]
    pub fn vsatp(&self) -> RootRegister {
        self.vsatp
    }

    #[inline]
    pub fn hgatp(&self) -> RootRegister {
        self.hgatp
    }

    #[inline]
    pub fn sim_asid(&self) -> SimAsid {
        self.sim_asid
    }

    #[inline]
    pub fn adue(&self) -> bool {
        self.adue
    }

    #[inline]
    pub fn instret(&self) -> u64 {
        self.instret
    }

    /// Last exception requested by a real (non-diagnostic) access.
    #[inline]
    pub fn last_trap(&self) -> Option<Trap> {
        self.last_trap
    }

    pub fn take_trap(&mut self) -> Option<Trap> {
        self.last_trap.take()
    }

    pub fn set_privilege(&mut self, mode: PrivilegeMode) {
        if mode.is_virtual() && !self.config.hypervisor {
            debug!(?mode, "virtualized mode without hypervisor support ignored");
            return;
        }
        self.mode = mode;
    }

    pub fn set_status(&mut self, status: StatusFlags) {
        let old_sum = self.effective_sum();
        self.status = status;
        if self.effective_sum() != old_sum {
            // Supervisor access to MPU user regions depends on SUM.
            self.domains.flush_phys(PhysDomain::MpuSupervisor);
        }
        self.refresh_context();
    }

    /// `satp` write (WARL). Returns the value the register reads back as.
    pub fn set_satp(&mut self, raw: u64) -> u64 {
        match self.decode_root(raw, false) {
            Some(next) => {
                if next.mode != self.satp.mode {
                    self.flush_stage(TranslationStage::NonVirtual);
                }
                self.satp = next;
                self.refresh_context();
            }
            None => debug!(raw, "satp write with unsupported mode ignored"),
        }
        self.satp.encode_satp(self.config.xlen)
    }

    pub fn set_vsatp(&mut self, raw: u64) -> u64 {
        if !self.config.hypervisor {
            return 0;
        }
        match self.decode_root(raw, false) {
            Some(next) => {
                if next.mode != self.vsatp.mode {
                    self.flush_stage(TranslationStage::GuestStage1);
                }
                self.vsatp = next;
                self.refresh_context();
            }
            None => debug!(raw, "vsatp write with unsupported mode ignored"),
        }
        self.vsatp.encode_satp(self.config.xlen)
    }

    pub fn set_hgatp(&mut self, raw: u64) -> u64 {
        if !self.config.hypervisor {
            return 0;
        }
        match self.decode_root(raw, true) {
            Some(next) => {
                if next.mode != self.hgatp.mode {
                    self.flush_stage(TranslationStage::GuestStage2);
                }
                self.hgatp = next;
                self.refresh_context();
            }
            None => debug!(raw, "hgatp write with unsupported mode ignored"),
        }
        self.hgatp.encode_hgatp(self.config.xlen)
    }

    /// Enables or disables hardware accessed/dirty updates.
    pub fn set_adue(&mut self, enabled: bool) {
        self.adue = enabled;
    }

    /// Reports retired instructions; drives ASID cache growth.
    #[inline]
    pub fn retire(&mut self, count: u64) {
        self.instret = self.instret.wrapping_add(count);
    }

    fn decode_root(&self, raw: u64, stage2: bool) -> Option<RootRegister> {
        let xlen = self.config.xlen;
        let mut reg = if stage2 {
            RootRegister::decode_hgatp(xlen, raw)?
        } else {
            RootRegister::decode_satp(xlen, raw)?
        };
        if !self.config.vm_modes.supports(reg.mode) {
            return None;
        }
        let id_bits = if stage2 {
            self.config.vmid_bits
        } else {
            self.config.asid_bits
        };
        reg.id &= ((1u32 << id_bits) - 1) as u16;
        reg.ppn &= self.config.phys_addr_mask() >> PAGE_SHIFT;
        Some(reg)
    }

    fn refresh_context(&mut self) {
        self.sim_asid = SimAsid::new(csr::SimAsidFields {
            asid: self.satp.id,
            vs_asid: self.vsatp.id,
            vmid: self.hgatp.id,
            mxr: self.status.mxr,
            sum: self.effective_sum(),
            vs_mxr: self.status.vs_mxr,
            vs_sum: self.effective_vs_sum(),
            stage1: self.vsatp.is_active(),
            stage2: self.hgatp.is_active(),
        });
    }

    /// Privilege that loads and stores execute with, after `mstatus.MPRV`.
    pub fn effective_mode(&self, access: AccessType) -> PrivilegeMode {
        if self.mode.is_machine() && self.status.mprv && !access.is_execute() {
            PrivilegeMode::from_mpp(self.status.mpp, self.status.mpv && self.config.hypervisor)
        } else {
            self.mode
        }
    }

    #[inline]
    fn effective_sum(&self) -> bool {
        self.status.sum != self.config.priv_version.uses_pum()
    }

    #[inline]
    fn effective_vs_sum(&self) -> bool {
        self.status.vs_sum != self.config.priv_version.uses_pum()
    }

    fn translates(&self, mode: PrivilegeMode) -> bool {
        match mode {
            PrivilegeMode::Machine => false,
            PrivilegeMode::User | PrivilegeMode::Supervisor => self.satp.is_active(),
            PrivilegeMode::VirtualUser | PrivilegeMode::VirtualSupervisor => {
                self.vsatp.is_active() || self.hgatp.is_active()
            }
        }
    }

    /// Translates `[vaddr, vaddr + len)` for `access` and returns the physical address of
    /// `vaddr`.
    ///
    /// Every page the access touches is translated and checked; an access crossing a page
    /// boundary may map to discontiguous physical pages, so callers moving data should use
    /// [`Mmu::load`]/[`Mmu::store`]/[`Mmu::fetch`].
    pub fn translate(
        &mut self,
        bus: &mut impl MemoryBus,
        vaddr: u64,
        len: usize,
        access: AccessType,
    ) -> Result<u64, Trap> {
        let mut first = None;
        self.translate_range(bus, vaddr, len, access, false, |pa, _, _| {
            first.get_or_insert(pa);
        })?;
        Ok(first.unwrap_or_default())
    }

    /// Like [`Mmu::translate`], but diagnostic: no exception is recorded, accessed/dirty bits
    /// are not written back and TLB entries it creates are discarded by the next real lookup.
    pub fn translate_probe(
        &mut self,
        bus: &mut impl MemoryBus,
        vaddr: u64,
        len: usize,
        access: AccessType,
    ) -> Result<u64, Trap> {
        let mut first = None;
        self.translate_range(bus, vaddr, len, access, true, |pa, _, _| {
            first.get_or_insert(pa);
        })?;
        Ok(first.unwrap_or_default())
    }

    pub fn load(&mut self, bus: &mut impl MemoryBus, vaddr: u64, dst: &mut [u8]) -> Result<(), Trap> {
        self.read_into(bus, vaddr, dst, AccessType::Read, false)
    }

    pub fn fetch(&mut self, bus: &mut impl MemoryBus, vaddr: u64, dst: &mut [u8]) -> Result<(), Trap> {
        self.read_into(bus, vaddr, dst, AccessType::Execute, false)
    }

    /// Diagnostic read (debugger, tracer): never raises a real exception.
    pub fn debug_read(
        &mut self,
        bus: &mut impl MemoryBus,
        vaddr: u64,
        dst: &mut [u8],
    ) -> Result<(), Trap> {
        self.read_into(bus, vaddr, dst, AccessType::Read, true)
    }

    pub fn store(&mut self, bus: &mut impl MemoryBus, vaddr: u64, src: &[u8]) -> Result<(), Trap> {
        let pieces = self.collect_pieces(bus, vaddr, src.len(), AccessType::Write, false)?;
        for (pa, offset, len) in pieces {
            if let Err(err) = bus.write_bytes(pa, &src[offset..offset + len]) {
                debug!(%err, "store to backing store failed");
                let va = vaddr.wrapping_add(offset as u64);
                let fault = Fault::physical(FaultKind::BackingStoreAccessFault);
                return Err(self.raise(fault, va, AccessType::Write, false));
            }
        }
        Ok(())
    }

    fn read_into<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        vaddr: u64,
        dst: &mut [u8],
        access: AccessType,
        probe: bool,
    ) -> Result<(), Trap> {
        let pieces = self.collect_pieces(bus, vaddr, dst.len(), access, probe)?;
        for (pa, offset, len) in pieces {
            if let Err(err) = bus.read_bytes(pa, &mut dst[offset..offset + len]) {
                debug!(%err, "read from backing store failed");
                let va = vaddr.wrapping_add(offset as u64);
                let fault = Fault::physical(FaultKind::BackingStoreAccessFault);
                return Err(self.raise(fault, va, access, probe));
            }
        }
        Ok(())
    }

    fn collect_pieces<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        vaddr: u64,
        len: usize,
        access: AccessType,
        probe: bool,
    ) -> Result<Vec<(u64, usize, usize)>, Trap> {
        let mut pieces = Vec::with_capacity(2);
        if len == 0 {
            return Ok(pieces);
        }
        self.translate_range(bus, vaddr, len, access, probe, |pa, offset, len| {
            pieces.push((pa, offset, len));
        })?;
        Ok(pieces)
    }

    /// Translates and checks each page-sized piece of an access, handing
    /// `(pa, offset, len)` to `sink`.
    fn translate_range<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        vaddr: u64,
        len: usize,
        access: AccessType,
        probe: bool,
        mut sink: impl FnMut(u64, usize, usize),
    ) -> Result<(), Trap> {
        let xmask = self.config.xlen.addr_mask();
        let vaddr = vaddr & xmask;
        let len = len.max(1);
        let aligned = len.is_power_of_two() && vaddr % len as u64 == 0;
        let req = Request {
            access,
            mode: self.effective_mode(access),
            probe,
        };

        let mut spans = Spans::default();
        let mut offset = 0usize;
        while offset < len {
            let va = vaddr.wrapping_add(offset as u64) & xmask;
            let page_left = (PAGE_SIZE - (va & (PAGE_SIZE - 1))) as usize;
            let chunk = page_left.min(len - offset);
            match self.translate_piece(&mut *bus, va, chunk as u64, req, aligned, &mut spans) {
                Ok(pa) => sink(pa, offset, chunk),
                Err(fault) => return Err(self.raise(fault, va, access, probe)),
            }
            offset += chunk;
        }
        Ok(())
    }

    fn translate_piece<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        vaddr: u64,
        len: u64,
        req: Request,
        aligned: bool,
        spans: &mut Spans,
    ) -> Result<u64, Fault> {
        let pa = if !self.translates(req.mode) {
            vaddr
        } else if let Some(pa) = self.alias_fast_path(vaddr, len, req) {
            pa
        } else {
            self.resolve(bus, vaddr, req)?
        };
        self.check_physical(pa, len, req, aligned, spans)?;
        Ok(pa)
    }

    fn alias_fast_path(&mut self, vaddr: u64, len: u64, req: Request) -> Option<u64> {
        if req.probe {
            return None;
        }
        let alias = self.domains.lookup_virtual(req.mode, vaddr, self.sim_asid)?;
        if !alias.covers(vaddr, len) || !alias.priv_.contains(req.access.required_priv()) {
            return None;
        }
        bump!(self, alias_hits);
        trace!(vaddr, pa = alias.translate(vaddr), "alias hit");
        Some(alias.translate(vaddr))
    }

    /// Translates through the TLBs (walking on miss) and materializes the result as an alias.
    fn resolve<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        vaddr: u64,
        req: Request,
    ) -> Result<u64, Fault> {
        let mut parts: [Option<(TranslationStage, EntryId)>; 2] = [None, None];

        let pa = if req.mode.is_virtual() {
            let mut gpa = vaddr;
            if self.vsatp.is_active() {
                let stage = TranslationStage::GuestStage1;
                let (id, entry) = self.stage_lookup(bus, stage, vaddr, req)?;
                parts[0] = Some((stage, id));
                gpa = entry.translate(vaddr);
            }
            if self.hgatp.is_active() {
                let stage = TranslationStage::GuestStage2;
                let (id, entry) = self.stage_lookup(bus, stage, gpa, req)?;
                parts[1] = Some((stage, id));
                entry.translate(gpa)
            } else {
                gpa
            }
        } else {
            let stage = TranslationStage::NonVirtual;
            let (id, entry) = self.stage_lookup(bus, stage, vaddr, req)?;
            parts[0] = Some((stage, id));
            entry.translate(vaddr)
        };

        if !req.probe {
            self.map_alias(vaddr, req, &parts);
        }
        Ok(pa)
    }

    /// Installs the virtual alias for a completed translation: the intersection of the parts'
    /// ranges, re-expressed in the original address space, with the AND of their privileges.
    fn map_alias(
        &mut self,
        vaddr: u64,
        req: Request,
        parts: &[Option<(TranslationStage, EntryId)>; 2],
    ) {
        let mut live: Vec<(TranslationStage, EntryId, TlbEntry)> = Vec::with_capacity(2);
        for &(stage, id) in parts.iter().flatten() {
            // A later stage's install may have evicted an earlier part.
            let Some(entry) = self.tlbs[stage.index()].get(id) else {
                return;
            };
            live.push((stage, id, *entry));
        }
        let Some(&(first_stage, first_id, first)) = live.first() else {
            return;
        };

        let mut size_log2 = live.iter().map(|(_, _, e)| e.size_log2).min().unwrap_or(12);
        // Keep walked aliases clear of injected mappings that shadow parts of the entry.
        if first.custom.is_none() {
            let low = align_down(vaddr, size_log2);
            let high = low.wrapping_add((1u64 << size_log2) - 1);
            if self.tlbs[first_stage.index()].custom_overlaps(low, high, self.sim_asid) {
                size_log2 = PAGE_SHIFT as u8;
            }
        }
        let low = align_down(vaddr, size_log2);

        let mut pa = low;
        let mut priv_ = Priv::all();
        let mut asid_mask = 0;
        for (_, _, entry) in &live {
            pa = entry.translate(pa);
            let mut granted = self.entry_priv(entry, req.mode);
            if !entry.dirty {
                granted.remove(Priv::W);
            }
            priv_ &= granted;
            asid_mask |= entry.asid_mask;
        }
        if priv_.is_empty() {
            return;
        }

        let owner = AliasOwner {
            primary: (first_stage, first_id),
            secondary: live.get(1).map(|&(_, id, _)| id),
        };
        self.domains.alias_virtual(
            req.mode,
            Alias {
                low,
                size_log2,
                pa,
                priv_,
                asid_mask,
                asid_value: self.sim_asid,
                owner,
            },
        );
        for (stage, id, _) in live {
            self.tlbs[stage.index()].mark_mapped(id, req.mode);
        }
    }

    /// One stage of translation: TLB lookup, walking on miss.
    pub(crate) fn stage_lookup<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        stage: TranslationStage,
        addr: u64,
        req: Request,
    ) -> Result<(EntryId, TlbEntry), Fault> {
        bump!(self, tlb_lookups);
        let gpa = (stage == TranslationStage::GuestStage2).then_some(addr);

        if let Some((id, entry)) = self.tlbs[stage.index()].lookup(addr, self.sim_asid, !req.probe) {
            bump!(self, tlb_hits);
            trace!(?stage, addr, "TLB hit");
            let granted = self.entry_priv(&entry, req.mode);
            if !granted.contains(req.access.required_priv()) {
                return Err(Fault::translation(FaultKind::PrivilegeDenied, stage, gpa));
            }
            if !req.access.is_write() || entry.dirty || entry.custom.is_some() {
                return Ok((id, entry));
            }
            if !self.adue {
                return Err(Fault::translation(
                    FaultKind::AccessedOrDirtyBitMissing,
                    stage,
                    gpa,
                ));
            }
            if req.probe {
                // A real write would succeed after setting D; do not touch the PTE.
                return Ok((id, entry));
            }
            trace!(?stage, addr, "write to clean entry, re-walking to set D");
        } else {
            bump!(self, tlb_misses);
            trace!(?stage, addr, "TLB miss");
        }

        let entry = self.walk(bus, stage, addr, req)?;
        Ok(self.install_entry(entry))
    }

    fn install_entry(&mut self, entry: TlbEntry) -> (EntryId, TlbEntry) {
        let stage = entry.stage;
        let (id, removed) = self.tlbs[stage.index()].insert(entry, self.instret);
        for (old_id, _) in removed {
            self.domains.unalias_owner(stage, old_id);
        }
        (id, entry)
    }

    /// Effective permission of a cached entry for an access made in `mode`.
    pub(crate) fn entry_priv(&self, entry: &TlbEntry, mode: PrivilegeMode) -> Priv {
        match entry.stage {
            TranslationStage::NonVirtual => self.stage1_priv(entry.priv_, entry.user, mode, false),
            TranslationStage::GuestStage1 => self.stage1_priv(entry.priv_, entry.user, mode, true),
            TranslationStage::GuestStage2 => self.stage2_priv(entry.priv_, entry.user),
        }
    }

    pub(crate) fn stage1_priv(
        &self,
        raw: Priv,
        user_page: bool,
        mode: PrivilegeMode,
        virt: bool,
    ) -> Priv {
        let mut granted = raw;
        let mxr = self.status.mxr || (virt && self.status.vs_mxr);
        if mxr && granted.contains(Priv::X) {
            granted |= Priv::R;
        }

        if mode.is_user() {
            return if user_page { granted } else { Priv::empty() };
        }
        if user_page {
            let sum = if virt {
                self.effective_vs_sum()
            } else {
                self.effective_sum()
            };
            if !sum {
                return Priv::empty();
            }
            // Supervisor never executes from user pages.
            granted.remove(Priv::X);
        }
        granted
    }

    /// G-stage accesses are always treated as user accesses.
    pub(crate) fn stage2_priv(&self, raw: Priv, user_page: bool) -> Priv {
        if !user_page {
            return Priv::empty();
        }
        let mut granted = raw;
        if self.status.mxr && granted.contains(Priv::X) {
            granted |= Priv::R;
        }
        granted
    }

    fn check_physical(
        &mut self,
        pa: u64,
        len: u64,
        req: Request,
        aligned: bool,
        spans: &mut Spans,
    ) -> Result<(), Fault> {
        let high = pa.saturating_add(len.max(1) - 1);

        if self.mpu.is_some() && !req.mode.is_machine() {
            let (domain, requester) = if req.mode.is_user() {
                (PhysDomain::MpuUser, Requester::User)
            } else {
                let sum = self.effective_sum();
                (PhysDomain::MpuSupervisor, Requester::Supervisor { sum })
            };
            self.check_unit(
                PhysCheck {
                    kind: UnitKind::Mpu,
                    domain,
                    requester,
                    low: pa,
                    high,
                },
                req,
                aligned,
                spans,
            )?;
        }

        self.pma.ensure(pa, high, req.access, &self.extensions)?;

        let (domain, requester) = if req.mode.is_machine() {
            (PhysDomain::PmpMachine, Requester::Machine)
        } else {
            (PhysDomain::PmpSupervisor, Requester::Supervisor { sum: false })
        };
        self.check_unit(
            PhysCheck {
                kind: UnitKind::Pmp,
                domain,
                requester,
                low: pa,
                high,
            },
            req,
            aligned,
            spans,
        )
    }

    /// PMA and PMP check of an implicit supervisor access (page-table reads and writes).
    pub(crate) fn check_implicit(
        &mut self,
        pa: u64,
        bytes: u64,
        access: AccessType,
        probe: bool,
    ) -> Result<(), Fault> {
        let high = pa.saturating_add(bytes - 1);
        self.pma.ensure(pa, high, access, &self.extensions)?;
        let req = Request {
            access,
            mode: PrivilegeMode::Supervisor,
            probe,
        };
        self.check_unit(
            PhysCheck {
                kind: UnitKind::Pmp,
                domain: PhysDomain::PmpSupervisor,
                requester: Requester::Supervisor { sum: false },
                low: pa,
                high,
            },
            req,
            true,
            &mut Spans::default(),
        )
    }

    fn check_unit(
        &mut self,
        check: PhysCheck,
        req: Request,
        aligned: bool,
        spans: &mut Spans,
    ) -> Result<(), Fault> {
        let needed = req.access.required_priv();
        let denied = match check.kind {
            UnitKind::Pmp => Fault::physical(FaultKind::PmpDenied),
            UnitKind::Mpu => Fault {
                kind: FaultKind::MpuDenied,
                site: FaultSite::Mpu,
                gpa: None,
            },
        };
        bump!(self, phys_checks);

        let cached = self
            .domains
            .lookup_phys(check.domain, check.low)
            .filter(|range| range.high >= check.high);
        let pieces = match cached {
            Some(range) => {
                bump!(self, phys_alias_hits);
                vec![pmp::Decision {
                    low: check.low,
                    high: check.high,
                    priv_: range.priv_,
                    region: range.region,
                }]
            }
            None => {
                let unit = match check.kind {
                    UnitKind::Pmp => &self.pmp,
                    UnitKind::Mpu => match &self.mpu {
                        Some(mpu) => mpu,
                        None => return Ok(()),
                    },
                };
                let mut pieces = unit.decisions(check.low, check.high, check.requester);
                for piece in &mut pieces {
                    piece.priv_ = self.extensions.iter().fold(piece.priv_, |granted, ext| {
                        ext.pmp_priv_override(check.kind, piece.region, check.requester, granted)
                    });
                }
                pieces
            }
        };

        let seen = spans.unit(check.kind);
        seen.extend_from_slice(&pieces);
        if !pmp::straddle_allowed(
            seen,
            aligned,
            self.config.unaligned_decompose,
            self.config.straddle_limit(),
        ) {
            debug!(
                kind = ?check.kind,
                low = check.low,
                high = check.high,
                pieces = seen.len(),
                "access straddles protection regions"
            );
            return Err(Fault {
                kind: FaultKind::StraddledProtectionRegions,
                ..denied
            });
        }

        if cached.is_none() {
            for piece in &pieces {
                self.domains.alias_range(
                    check.domain,
                    PhysAlias {
                        low: piece.low,
                        high: piece.high,
                        priv_: piece.priv_,
                        region: piece.region,
                    },
                );
            }
        }

        if pieces.iter().all(|piece| piece.priv_.contains(needed)) {
            Ok(())
        } else {
            Err(denied)
        }
    }

    fn raise(&mut self, fault: Fault, vaddr: u64, access: AccessType, probe: bool) -> Trap {
        let trap = Trap {
            exception: fault::classify(&fault, access),
            tval: vaddr,
            gpa: fault.gpa,
            kind: fault.kind,
        };
        if probe {
            debug!(?trap, "suppressed fault on diagnostic access");
        } else {
            debug!(?trap, site = ?fault.site, "translation fault");
            self.last_trap = Some(trap);
        }
        trap
    }

    /// Generic fence over one stage's TLB. Returns the number of entries removed.
    pub fn invalidate(&mut self, filter: InvalidateFilter) -> usize {
        bump!(self, invalidations);
        let stage = filter.stage;
        let resolve = |m: Match<u16>, current: u16| match m {
            Match::Any => None,
            Match::Current => Some(current),
            Match::Only(id) => Some(id),
        };
        let current_asid = match stage {
            TranslationStage::NonVirtual => self.satp.id,
            TranslationStage::GuestStage1 => self.vsatp.id,
            TranslationStage::GuestStage2 => 0,
        };
        let asid = match stage {
            TranslationStage::GuestStage2 => None,
            _ => resolve(filter.asid, current_asid),
        };
        let vmid = match stage {
            TranslationStage::NonVirtual => None,
            _ => resolve(filter.vmid, self.hgatp.id),
        };
        let selector = TlbSelector {
            address: filter.address.map(|addr| (addr, addr)),
            asid,
            vmid,
        };

        let removed = self.tlbs[stage.index()].invalidate(&selector);
        for (id, _) in &removed {
            self.domains.unalias_owner(stage, *id);
        }
        let mut count = removed.len();

        if stage == TranslationStage::GuestStage2 && self.config.couple_stage2_invalidation {
            // An all-address fence covers every guest-physical address, cached or not.
            let ranges: Vec<(u64, u64, Option<u16>)> = match filter.address {
                Some(gpa) => removed
                    .iter()
                    .map(|(_, e)| (e.low, e.high(), Some(e.sim_asid.vmid())))
                    .chain(std::iter::once((gpa, gpa, vmid)))
                    .collect(),
                None => vec![(0, u64::MAX, vmid)],
            };
            for (low, high, vmid) in ranges {
                let dependents = self.tlbs[TranslationStage::GuestStage1.index()].remove_where(|e| {
                    e.custom.is_none()
                        && vmid.map_or(true, |vmid| e.sim_asid.vmid() == vmid)
                        && e.pa <= high
                        && low <= e.pa.wrapping_add(e.size() - 1)
                });
                for (id, _) in &dependents {
                    self.domains
                        .unalias_owner(TranslationStage::GuestStage1, *id);
                }
                count += dependents.len();
            }
        }

        debug!(?stage, address = ?filter.address, ?asid, ?vmid, count, "invalidate");
        count
    }

    /// `SFENCE.VMA`: the VS-stage when virtualized, the non-virtual stage otherwise.
    pub fn sfence_vma(&mut self, vaddr: Option<u64>, asid: Option<u16>) -> usize {
        let virt = self.mode.is_virtual();
        self.invalidate(InvalidateFilter {
            stage: if virt {
                TranslationStage::GuestStage1
            } else {
                TranslationStage::NonVirtual
            },
            address: vaddr,
            asid: asid.map_or(Match::Any, Match::Only),
            vmid: if virt { Match::Current } else { Match::Any },
        })
    }

    /// `HFENCE.VVMA`: VS-stage entries of the current VMID.
    pub fn hfence_vvma(&mut self, vaddr: Option<u64>, asid: Option<u16>) -> usize {
        self.invalidate(InvalidateFilter {
            stage: TranslationStage::GuestStage1,
            address: vaddr,
            asid: asid.map_or(Match::Any, Match::Only),
            vmid: Match::Current,
        })
    }

    /// `HFENCE.GVMA`: G-stage entries, plus dependent VS-stage entries when coupling is enabled.
    pub fn hfence_gvma(&mut self, gpa: Option<u64>, vmid: Option<u16>) -> usize {
        self.invalidate(InvalidateFilter {
            stage: TranslationStage::GuestStage2,
            address: gpa,
            asid: Match::Any,
            vmid: vmid.map_or(Match::Any, Match::Only),
        })
    }

    /// Drops every walked entry of every stage. Injected entries survive.
    pub fn flush_all(&mut self) {
        for stage in TranslationStage::ALL {
            self.flush_stage(stage);
        }
        self.domains.flush_virtual();
    }

    fn flush_stage(&mut self, stage: TranslationStage) {
        let removed = self.tlbs[stage.index()].flush();
        for (id, _) in removed {
            self.domains.unalias_owner(stage, id);
        }
    }

    /// Writes a protection register and returns its effective (read-back) value.
    ///
    /// Writes to unimplemented registers are ignored and read back as zero.
    pub fn write_protection_register(&mut self, kind: RegisterKind, index: usize, raw: u64) -> u64 {
        let slack = self.config.max_access_bytes - 1;
        match kind {
            RegisterKind::PmpCfg | RegisterKind::PmpAddr => write_unit_register(
                &mut self.pmp,
                &mut self.domains,
                [PhysDomain::PmpMachine, PhysDomain::PmpSupervisor],
                kind,
                index,
                raw,
                slack,
            ),
            RegisterKind::MpuCfg | RegisterKind::MpuAddr => match self.mpu.as_mut() {
                Some(mpu) => write_unit_register(
                    mpu,
                    &mut self.domains,
                    [PhysDomain::MpuSupervisor, PhysDomain::MpuUser],
                    kind,
                    index,
                    raw,
                    slack,
                ),
                None => {
                    debug!(?kind, index, "MPU register write without an MPU ignored");
                    0
                }
            },
            RegisterKind::Mseccfg => {
                if self.pmp.write_mseccfg(raw) {
                    debug!(mseccfg = ?self.pmp.mseccfg(), "mseccfg changed");
                    self.domains.flush_phys(PhysDomain::PmpMachine);
                    self.domains.flush_phys(PhysDomain::PmpSupervisor);
                }
                self.pmp.mseccfg().bits()
            }
        }
    }

    pub fn read_protection_register(&self, kind: RegisterKind, index: usize) -> u64 {
        match kind {
            RegisterKind::PmpCfg => self.pmp.read_cfg(index),
            RegisterKind::PmpAddr => self.pmp.read_addr(index),
            RegisterKind::Mseccfg => self.pmp.mseccfg().bits(),
            RegisterKind::MpuCfg => self.mpu.as_ref().map_or(0, |mpu| mpu.read_cfg(index)),
            RegisterKind::MpuAddr => self.mpu.as_ref().map_or(0, |mpu| mpu.read_addr(index)),
        }
    }

    pub fn protection_region(&self, unit: UnitKind, index: usize) -> Option<Region> {
        match unit {
            UnitKind::Pmp => self.pmp.region(index),
            UnitKind::Mpu => self.mpu.as_ref()?.region(index),
        }
    }

    /// Installs an externally supplied translation in `stage`'s TLB, tagged with the current
    /// context. It shadows walked entries, survives fences and ASID eviction and is only removed
    /// by [`Mmu::remove_custom_entry`].
    pub fn inject_tlb_entry(&mut self, stage: TranslationStage, mapping: CustomMapping) -> CustomEntryId {
        let id = CustomEntryId(self.next_custom);
        self.next_custom = self.next_custom.wrapping_add(1);

        let size_log2 = mapping.size_log2.clamp(PAGE_SHIFT as u8, 63);
        let global = mapping.global && stage != TranslationStage::GuestStage2;
        let entry = TlbEntry {
            low: align_down(mapping.va, size_log2),
            size_log2,
            pa: align_down(mapping.pa, size_log2),
            stage,
            priv_: mapping.priv_,
            global,
            user: mapping.user,
            accessed: true,
            dirty: true,
            sim_asid: self.sim_asid,
            asid_mask: SimAsid::mask(stage, global),
            mapped_modes: 0,
            artifact: false,
            custom: Some(id),
            pte_addr: None,
        };

        // Walked aliases over the range would bypass the new mapping.
        let (low, high) = (entry.low, entry.high());
        let shadowed = self.tlbs[stage.index()].remove_where(|e| {
            e.custom.is_none()
                && e.overlaps(low, high)
                && e.sim_asid.matches(entry.sim_asid, e.asid_mask | entry.asid_mask)
        });
        for (old, _) in shadowed {
            self.domains.unalias_owner(stage, old);
        }

        self.install_entry(entry);
        debug!(?stage, ?id, low, size_log2, "injected TLB entry");
        id
    }

    pub fn remove_custom_entry(&mut self, id: CustomEntryId) -> bool {
        let mut found = false;
        for stage in TranslationStage::ALL {
            let removed = self.tlbs[stage.index()].remove_where(|e| e.custom == Some(id));
            for (entry_id, _) in &removed {
                self.domains.unalias_owner(stage, *entry_id);
            }
            found |= !removed.is_empty();
        }
        found
    }

    /// Registers a capability. Everything derived from earlier capability answers is dropped.
    pub fn register_extension(&mut self, extension: Box<dyn MmuExtension>) {
        debug!(?extension, "registering MMU extension");
        self.extensions.push(extension);
        for stage in TranslationStage::ALL {
            self.flush_stage(stage);
        }
        self.domains.flush();
        self.pma.flush();
    }

    /// Aliases a cluster control block into this hart. Its PMA windows are always enabled.
    pub fn attach_control_block(&mut self, block: Arc<ControlBlock>) {
        self.pma.pin(block.base, block.high());
        self.control_block = Some(block);
    }

    #[inline]
    pub fn control_block(&self) -> Option<&Arc<ControlBlock>> {
        self.control_block.as_ref()
    }

    #[inline]
    pub fn tlb(&self, stage: TranslationStage) -> &Tlb {
        &self.tlbs[stage.index()]
    }

    /// Diagnostic TLB lookup in the current context. Does not promote or drop anything.
    pub fn tlb_lookup(&mut self, stage: TranslationStage, addr: u64) -> Option<TlbEntry> {
        self.tlbs[stage.index()]
            .lookup(addr, self.sim_asid, false)
            .map(|(_, entry)| entry)
    }

    #[inline]
    pub fn asid_cache(&self, stage: TranslationStage) -> &AsidCache {
        self.tlbs[stage.index()].asid_cache()
    }

    #[inline]
    pub fn virtual_alias_count(&self, mode: PrivilegeMode) -> usize {
        self.domains.virtual_len(mode)
    }

    #[inline]
    pub fn pma(&self) -> &PmaLayer {
        &self.pma
    }
}

/// Applies a cfg/addr write to `unit`: drop the cached ranges the affected regions covered,
/// write, then drop the ranges they cover now. Cached ranges are rebuilt on the next access.
fn write_unit_register(
    unit: &mut ProtectionUnit,
    domains: &mut DomainSet,
    phys: [PhysDomain; 2],
    kind: RegisterKind,
    index: usize,
    raw: u64,
    slack: u64,
) -> u64 {
    let is_cfg = matches!(kind, RegisterKind::PmpCfg | RegisterKind::MpuCfg);
    let regions = if is_cfg {
        unit.cfg_regions(index)
    } else {
        (index < unit.regions()).then(|| index..index + 1)
    };
    let Some(regions) = regions else {
        debug!(?kind, index, "write to unimplemented protection register ignored");
        return 0;
    };

    let mut unalias = |ranges: Vec<(u64, u64)>| {
        for (low, high) in ranges {
            let low = low.saturating_sub(slack);
            let high = high.saturating_add(slack);
            for domain in phys {
                domains.unalias_range(domain, low, high);
            }
        }
    };

    unalias(unit.dependent_ranges(regions.clone()));
    if is_cfg {
        unit.write_cfg(index, raw);
    } else {
        unit.write_addr(index, raw);
    }
    unalias(unit.dependent_ranges(regions));

    if is_cfg {
        unit.read_cfg(index)
    } else {
        unit.read_addr(index)
    }
}
