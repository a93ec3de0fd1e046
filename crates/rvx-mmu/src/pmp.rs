//! PMP/MPU region engine.
//!
//! Regions are evaluated from the highest index (lowest priority) down to index 0. Each region
//! either matches the probed address, replacing the candidate permission and clipping the
//! candidate range to its bounds, or trims the candidate range on the side it lies. The result
//! is the largest range around the address over which the decision is uniform, which is what the
//! physical domains cache.

use std::ops::Range;

use bitflags::bitflags;
use tracing::debug;

use crate::config::MmuConfig;
use crate::csr::Xlen;
use crate::pte::Priv;

bitflags! {
    /// Smepmp machine security configuration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Mseccfg: u64 {
        /// Machine mode lockdown.
        const MML = 1 << 0;
        /// Machine mode whitelist policy.
        const MMWP = 1 << 1;
        /// Rule locking bypass.
        const RLB = 1 << 2;
    }
}

const CFG_RWX: u8 = 0b111;
const CFG_R: u8 = 1 << 0;
const CFG_W: u8 = 1 << 1;
const CFG_A_SHIFT: u32 = 3;
const CFG_A_MASK: u8 = 0b11 << CFG_A_SHIFT;
/// MPU only: region belongs to user mode.
const CFG_U: u8 = 1 << 6;
const CFG_L: u8 = 1 << 7;

const PMP_CFG_WRITABLE: u8 = !0b0110_0000;
const MPU_CFG_WRITABLE: u8 = !0b0010_0000;

// Remap tables indexed by the raw R/W/X value (R=1, W=2, X=4).
const LEGACY: [u8; 8] = [0, 1, 0, 3, 4, 5, 4, 7];
const MML_MACHINE: [u8; 8] = [0, 0, 3, 0, 0, 0, 3, 0];
const MML_USER: [u8; 8] = [0, 1, 1, 3, 4, 5, 3, 7];
const MML_MACHINE_LOCKED: [u8; 8] = [0, 1, 4, 3, 4, 5, 5, 1];
const MML_USER_LOCKED: [u8; 8] = [0, 0, 4, 0, 0, 0, 4, 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Pmp,
    Mpu,
}

/// Address-matching mode of a region (`A` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMatch {
    Off,
    TopOfRange,
    NaturallyAligned4,
    NaturallyAlignedPow2,
}

impl AddressMatch {
    fn from_cfg(cfg: u8) -> Self {
        match (cfg & CFG_A_MASK) >> CFG_A_SHIFT {
            0 => AddressMatch::Off,
            1 => AddressMatch::TopOfRange,
            2 => AddressMatch::NaturallyAligned4,
            _ => AddressMatch::NaturallyAlignedPow2,
        }
    }
}

/// Who is asking. The MPU distinguishes supervisor from user and depends on `SUM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requester {
    Machine,
    Supervisor { sum: bool },
    User,
}

/// Decoded view of one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub index: usize,
    pub mode: AddressMatch,
    pub raw_priv: Priv,
    pub locked: bool,
    /// MPU user bit; always false for PMP.
    pub user: bool,
    pub bounds: Option<(u64, u64)>,
}

/// Outcome of classifying one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub low: u64,
    pub high: u64,
    pub priv_: Priv,
    pub region: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ProtectionUnit {
    kind: UnitKind,
    xlen: Xlen,
    grain: u32,
    addr_mask: u64,
    smepmp: bool,
    cfg: Vec<u8>,
    addr: Vec<u64>,
    bounds: Vec<Option<(u64, u64)>>,
    mseccfg: Mseccfg,
}

impl ProtectionUnit {
    pub fn new(kind: UnitKind, regions: usize, config: &MmuConfig) -> Self {
        let addr_bits = config.phys_addr_bits.saturating_sub(2);
        Self {
            kind,
            xlen: config.xlen,
            grain: config.pmp_grain,
            addr_mask: if addr_bits >= 64 {
                u64::MAX
            } else {
                (1u64 << addr_bits) - 1
            },
            smepmp: config.smepmp && kind == UnitKind::Pmp,
            cfg: vec![0; regions],
            addr: vec![0; regions],
            bounds: vec![None; regions],
            mseccfg: Mseccfg::empty(),
        }
    }

    #[inline]
    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    #[inline]
    pub fn regions(&self) -> usize {
        self.cfg.len()
    }

    #[inline]
    pub fn mseccfg(&self) -> Mseccfg {
        self.mseccfg
    }

    pub fn region(&self, index: usize) -> Option<Region> {
        let cfg = *self.cfg.get(index)?;
        Some(Region {
            index,
            mode: AddressMatch::from_cfg(cfg),
            raw_priv: Priv::from_bits_truncate(cfg & CFG_RWX),
            locked: cfg & CFG_L != 0,
            user: self.kind == UnitKind::Mpu && cfg & CFG_U != 0,
            bounds: self.bounds[index],
        })
    }

    /// Region indices covered by configuration register `index`.
    ///
    /// RV64 only implements the even-numbered registers, each holding eight regions.
    pub fn cfg_regions(&self, index: usize) -> Option<Range<usize>> {
        let per_reg = (self.xlen.bits() / 8) as usize;
        if self.xlen == Xlen::Rv64 && index % 2 != 0 {
            return None;
        }
        let base = index.checked_mul(4)?;
        if base >= self.regions() {
            return None;
        }
        Some(base..(base + per_reg).min(self.regions()))
    }

    /// Regions whose effective bounds depend on the given registers: themselves and any
    /// top-of-range successor.
    pub fn dependent_ranges(&self, regions: Range<usize>) -> Vec<(u64, u64)> {
        let end = regions.end;
        let mut out: Vec<(u64, u64)> = regions.filter_map(|i| self.bounds[i]).collect();
        if end < self.regions()
            && AddressMatch::from_cfg(self.cfg[end]) == AddressMatch::TopOfRange
        {
            out.extend(self.bounds[end]);
        }
        out
    }

    pub fn read_cfg(&self, index: usize) -> u64 {
        let Some(range) = self.cfg_regions(index) else {
            return 0;
        };
        range
            .enumerate()
            .fold(0u64, |acc, (k, i)| acc | (u64::from(self.cfg[i]) << (8 * k)))
    }

    pub fn write_cfg(&mut self, index: usize, raw: u64) {
        let Some(range) = self.cfg_regions(index) else {
            debug!(kind = ?self.kind, index, "write to unimplemented cfg register ignored");
            return;
        };
        for (k, i) in range.enumerate() {
            self.write_cfg_byte(i, (raw >> (8 * k)) as u8);
        }
        self.recompute_bounds();
    }

    fn write_cfg_byte(&mut self, i: usize, value: u8) {
        if self.is_locked(i) {
            if self.cfg[i] != value {
                debug!(kind = ?self.kind, region = i, "write to locked region ignored");
            }
            return;
        }

        let mut v = value
            & match self.kind {
                UnitKind::Pmp => PMP_CFG_WRITABLE,
                UnitKind::Mpu => MPU_CFG_WRITABLE,
            };
        let mml = self.mseccfg.contains(Mseccfg::MML);

        // R=0/W=1 is reserved outside MML.
        if !mml && v & (CFG_R | CFG_W) == CFG_W {
            v &= !CFG_W;
        }
        if self.grain >= 1 && AddressMatch::from_cfg(v) == AddressMatch::NaturallyAligned4 {
            v &= !CFG_A_MASK;
        }
        if mml
            && !self.mseccfg.contains(Mseccfg::RLB)
            && v & CFG_L != 0
            && matches!(v & CFG_RWX, 2 | 4 | 5 | 6)
        {
            debug!(region = i, cfg = v, "locked executable rule rejected under MML");
            return;
        }
        self.cfg[i] = v;
    }

    /// `pmpaddr` read-back, including the grain-dependent bits.
    pub fn read_addr(&self, i: usize) -> u64 {
        let Some(&raw) = self.addr.get(i) else {
            return 0;
        };
        match AddressMatch::from_cfg(self.cfg[i]) {
            AddressMatch::NaturallyAlignedPow2 if self.grain >= 2 => {
                raw | ((1u64 << (self.grain - 1)) - 1)
            }
            AddressMatch::Off | AddressMatch::TopOfRange if self.grain >= 1 => {
                raw & !((1u64 << self.grain) - 1)
            }
            _ => raw,
        }
    }

    pub fn write_addr(&mut self, i: usize, raw: u64) {
        if i >= self.regions() {
            debug!(kind = ?self.kind, index = i, "write to unimplemented address register ignored");
            return;
        }
        if self.is_locked(i) {
            debug!(kind = ?self.kind, region = i, "write to locked address ignored");
            return;
        }
        if i + 1 < self.regions()
            && AddressMatch::from_cfg(self.cfg[i + 1]) == AddressMatch::TopOfRange
            && self.is_locked(i + 1)
        {
            debug!(kind = ?self.kind, region = i, "address locked by top-of-range successor");
            return;
        }
        self.addr[i] = raw & self.addr_mask;
        self.recompute_bounds();
    }

    /// Returns whether the effective value changed.
    pub fn write_mseccfg(&mut self, raw: u64) -> bool {
        if !self.smepmp {
            return false;
        }
        let requested = Mseccfg::from_bits_truncate(raw);
        let sticky = Mseccfg::MML | Mseccfg::MMWP;
        let mut next = (self.mseccfg & sticky) | (requested & sticky);

        let any_locked = self.cfg.iter().any(|c| c & CFG_L != 0);
        if requested.contains(Mseccfg::RLB)
            && (self.mseccfg.contains(Mseccfg::RLB) || !any_locked)
        {
            next |= Mseccfg::RLB;
        }

        let changed = next != self.mseccfg;
        self.mseccfg = next;
        changed
    }

    #[inline]
    fn is_locked(&self, i: usize) -> bool {
        self.cfg[i] & CFG_L != 0 && !self.mseccfg.contains(Mseccfg::RLB)
    }

    fn tor_addr(&self, i: usize) -> u64 {
        let grain_mask = if self.grain >= 64 {
            u64::MAX
        } else {
            (1u64 << self.grain) - 1
        };
        self.addr[i] & !grain_mask
    }

    fn compute_bounds(&self, i: usize) -> Option<(u64, u64)> {
        match AddressMatch::from_cfg(self.cfg[i]) {
            AddressMatch::Off => None,
            AddressMatch::TopOfRange => {
                let low = if i == 0 { 0 } else { self.tor_addr(i - 1) << 2 };
                let top = self.tor_addr(i) << 2;
                (top > low).then(|| (low, top - 1))
            }
            AddressMatch::NaturallyAligned4 => {
                let low = self.addr[i] << 2;
                Some((low, low + 3))
            }
            AddressMatch::NaturallyAlignedPow2 => {
                let a = self.read_addr(i);
                let ones = a.trailing_ones();
                if ones + 3 >= 64 {
                    return Some((0, u64::MAX));
                }
                let size = 1u64 << (ones + 3);
                let low = (a & !((1u64 << ones) - 1)) << 2;
                Some((low, low + (size - 1)))
            }
        }
    }

    fn recompute_bounds(&mut self) {
        for i in 0..self.regions() {
            self.bounds[i] = self.compute_bounds(i);
        }
    }

    fn default_priv(&self, req: Requester) -> Priv {
        match (self.kind, req) {
            (UnitKind::Pmp, Requester::Machine) => {
                if self.mseccfg.contains(Mseccfg::MMWP) {
                    Priv::empty()
                } else if self.mseccfg.contains(Mseccfg::MML) {
                    Priv::R | Priv::W
                } else {
                    Priv::all()
                }
            }
            (UnitKind::Pmp, _) => {
                if self.regions() == 0 {
                    Priv::all()
                } else {
                    Priv::empty()
                }
            }
            (UnitKind::Mpu, Requester::User) => Priv::empty(),
            (UnitKind::Mpu, _) => Priv::all(),
        }
    }

    /// Permission region `i` grants `req`.
    pub fn region_priv(&self, i: usize, req: Requester) -> Priv {
        let cfg = self.cfg[i];
        let rwx = (cfg & CFG_RWX) as usize;
        let locked = cfg & CFG_L != 0;

        let bits = match self.kind {
            UnitKind::Pmp => {
                let machine = req == Requester::Machine;
                if self.mseccfg.contains(Mseccfg::MML) {
                    match (machine, locked) {
                        (true, false) => MML_MACHINE[rwx],
                        (false, false) => MML_USER[rwx],
                        (true, true) => MML_MACHINE_LOCKED[rwx],
                        (false, true) => MML_USER_LOCKED[rwx],
                    }
                } else if machine && !locked {
                    CFG_RWX
                } else {
                    LEGACY[rwx]
                }
            }
            UnitKind::Mpu => {
                let user_region = cfg & CFG_U != 0;
                match (req, user_region) {
                    (Requester::Machine, _) => CFG_RWX,
                    (Requester::User, true) | (Requester::Supervisor { .. }, false) => {
                        LEGACY[rwx]
                    }
                    (Requester::User, false) => 0,
                    (Requester::Supervisor { sum }, true) => {
                        if sum {
                            LEGACY[rwx] & (CFG_R | CFG_W)
                        } else {
                            0
                        }
                    }
                }
            }
        };
        Priv::from_bits_truncate(bits)
    }

    /// Largest range around `addr` with a uniform decision.
    pub fn classify(&self, addr: u64, req: Requester) -> Decision {
        let mut d = Decision {
            low: 0,
            high: u64::MAX,
            priv_: self.default_priv(req),
            region: None,
        };

        for i in (0..self.regions()).rev() {
            let Some((lo, hi)) = self.bounds[i] else {
                continue;
            };
            if (lo..=hi).contains(&addr) {
                d.low = d.low.max(lo);
                d.high = d.high.min(hi);
                d.priv_ = self.region_priv(i, req);
                d.region = Some(i);
            } else if hi < addr {
                d.low = d.low.max(hi + 1);
            } else {
                d.high = d.high.min(lo - 1);
            }
        }
        d
    }

    /// Decisions covering `[low, high]`, in address order.
    pub fn decisions(&self, low: u64, high: u64, req: Requester) -> Vec<Decision> {
        let mut out = Vec::new();
        let mut addr = low;
        loop {
            let d = self.classify(addr, req);
            out.push(d);
            if d.high >= high {
                break;
            }
            addr = d.high + 1;
        }
        out
    }

    pub(crate) fn raw_cfg(&self) -> &[u8] {
        &self.cfg
    }

    pub(crate) fn raw_addr(&self) -> &[u64] {
        &self.addr
    }

    pub(crate) fn restore(&mut self, cfg: Vec<u8>, addr: Vec<u64>, mseccfg: Mseccfg) {
        self.cfg = cfg;
        self.addr = addr;
        self.bounds = vec![None; self.cfg.len()];
        self.mseccfg = if self.smepmp {
            mseccfg
        } else {
            Mseccfg::empty()
        };
        self.recompute_bounds();
    }
}

/// Whether an access whose decisions are `pieces` may proceed.
///
/// Aligned accesses must fall in one region; unaligned ones may span up to `limit` regions when
/// decomposition is allowed.
pub fn straddle_allowed(pieces: &[Decision], aligned: bool, decompose: bool, limit: usize) -> bool {
    let mut seen: Vec<Option<usize>> = pieces.iter().map(|piece| piece.region).collect();
    seen.sort_unstable();
    seen.dedup();
    let regions = seen.len();
    if regions <= 1 {
        return true;
    }
    !aligned && decompose && regions <= limit
}

/// `pmpcfg` byte for a region.
pub fn cfg_byte(mode: AddressMatch, priv_: Priv, locked: bool) -> u8 {
    let a = match mode {
        AddressMatch::Off => 0,
        AddressMatch::TopOfRange => 1,
        AddressMatch::NaturallyAligned4 => 2,
        AddressMatch::NaturallyAlignedPow2 => 3,
    };
    let l = if locked { CFG_L } else { 0 };
    priv_.bits() | (a << CFG_A_SHIFT) | l
}

/// `pmpaddr` value describing the NAPOT region `[base, base + size)`.
///
/// `size` must be a power of two of at least 8 and `base` aligned to it.
pub fn napot_addr(base: u64, size: u64) -> u64 {
    (base >> 2) | ((size >> 3) - 1)
}
