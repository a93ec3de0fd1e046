//! Per-hart address-space composition.
//!
//! Each privilege mode has a virtual domain holding aliases derived from TLB entries (the fast
//! path for already-translated accesses). Protection units keep physical domains holding
//! uniform-permission ranges derived from region classification, so repeated physical checks
//! do not re-evaluate every region.

use std::collections::{BTreeMap, HashMap};

use tracing::trace;

use crate::csr::{PrivilegeMode, SimAsid, TranslationStage};
use crate::index::SizeClassIndex;
use crate::pte::Priv;
use crate::tlb::EntryId;

/// TLB entries an alias was derived from. Tearing down either removes the alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliasOwner {
    pub primary: (TranslationStage, EntryId),
    /// G-stage entry of a two-stage translation.
    pub secondary: Option<EntryId>,
}

impl AliasOwner {
    fn owners(&self) -> impl Iterator<Item = (TranslationStage, EntryId)> {
        std::iter::once(self.primary).chain(
            self.secondary
                .map(|id| (TranslationStage::GuestStage2, id)),
        )
    }

    fn is_owned_by(&self, stage: TranslationStage, id: EntryId) -> bool {
        self.owners().any(|owner| owner == (stage, id))
    }
}

/// A virtual-to-physical fast-path mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alias {
    pub low: u64,
    pub size_log2: u8,
    pub pa: u64,
    pub priv_: Priv,
    pub asid_mask: u64,
    pub asid_value: SimAsid,
    pub owner: AliasOwner,
}

impl Alias {
    #[inline]
    pub fn translate(&self, addr: u64) -> u64 {
        self.pa.wrapping_add(addr.wrapping_sub(self.low))
    }

    /// Whether `[addr, addr + len)` lies inside this alias.
    #[inline]
    pub fn covers(&self, addr: u64, len: u64) -> bool {
        let offset = addr.wrapping_sub(self.low);
        self.size_log2 >= 64 || offset.saturating_add(len) <= (1u64 << self.size_log2)
    }
}

/// Physical domains kept by the protection units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PhysDomain {
    PmpMachine = 0,
    PmpSupervisor = 1,
    MpuSupervisor = 2,
    MpuUser = 3,
}

impl PhysDomain {
    pub const ALL: [PhysDomain; 4] = [
        PhysDomain::PmpMachine,
        PhysDomain::PmpSupervisor,
        PhysDomain::MpuSupervisor,
        PhysDomain::MpuUser,
    ];
}

/// A range with uniform protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysAlias {
    pub low: u64,
    pub high: u64,
    pub priv_: Priv,
    /// Deciding region, `None` for the no-match default.
    pub region: Option<usize>,
}

#[derive(Debug, Default)]
pub struct DomainSet {
    virt: [SizeClassIndex<Alias>; 5],
    owners: HashMap<(TranslationStage, EntryId), Vec<(PrivilegeMode, u64, u8)>>,
    phys: [BTreeMap<u64, PhysAlias>; 4],
}

impl DomainSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `alias`, replacing any alias of the same slot reachable from the same context.
    pub fn alias_virtual(&mut self, mode: PrivilegeMode, alias: Alias) {
        trace!(
            ?mode,
            low = alias.low,
            size_log2 = alias.size_log2,
            pa = alias.pa,
            "alias"
        );
        let replaced = self.virt[mode.index()].remove_where(alias.low, alias.size_log2, |old| {
            old.asid_value
                .matches(alias.asid_value, old.asid_mask | alias.asid_mask)
        });
        for old in replaced {
            for owner in old.owner.owners() {
                self.forget_slot(owner, mode, old.low, old.size_log2);
            }
        }

        self.virt[mode.index()].insert(alias.low, alias.size_log2, alias);
        for owner in alias.owner.owners() {
            self.owners
                .entry(owner)
                .or_default()
                .push((mode, alias.low, alias.size_log2));
        }
    }

    /// Removes every virtual alias derived from `(stage, id)`. Returns the number removed.
    pub fn unalias_owner(&mut self, stage: TranslationStage, id: EntryId) -> usize {
        let Some(slots) = self.owners.remove(&(stage, id)) else {
            return 0;
        };

        let mut count = 0;
        for (mode, low, size_log2) in slots {
            let removed = self.virt[mode.index()].remove_where(low, size_log2, |alias| {
                alias.owner.is_owned_by(stage, id)
            });
            for alias in removed {
                count += 1;
                for other in alias.owner.owners().filter(|o| *o != (stage, id)) {
                    self.forget_slot(other, mode, low, size_log2);
                }
            }
        }
        if count > 0 {
            trace!(?stage, count, "unalias");
        }
        count
    }

    fn forget_slot(
        &mut self,
        owner: (TranslationStage, EntryId),
        mode: PrivilegeMode,
        low: u64,
        size_log2: u8,
    ) {
        if let Some(list) = self.owners.get_mut(&owner) {
            list.retain(|&(m, l, s)| !(m == mode && l == low && s == size_log2));
            if list.is_empty() {
                self.owners.remove(&owner);
            }
        }
    }

    pub fn lookup_virtual(&self, mode: PrivilegeMode, addr: u64, ctx: SimAsid) -> Option<Alias> {
        self.virt[mode.index()]
            .candidates(addr)
            .find(|alias| alias.asid_value.matches(ctx, alias.asid_mask))
            .copied()
    }

    pub fn virtual_len(&self, mode: PrivilegeMode) -> usize {
        self.virt[mode.index()].len()
    }

    /// Installs `[low, high]` in `domain`, replacing anything it overlaps.
    pub fn alias_range(&mut self, domain: PhysDomain, alias: PhysAlias) {
        self.unalias_range(domain, alias.low, alias.high);
        trace!(?domain, low = alias.low, high = alias.high, priv_ = ?alias.priv_, "alias range");
        self.phys[domain as usize].insert(alias.low, alias);
    }

    /// Removes every range in `domain` overlapping `[low, high]`.
    pub fn unalias_range(&mut self, domain: PhysDomain, low: u64, high: u64) {
        let map = &mut self.phys[domain as usize];
        let doomed: Vec<u64> = map
            .range(..=high)
            .rev()
            .take_while(|(_, a)| a.high >= low)
            .map(|(&start, _)| start)
            .collect();
        for start in doomed {
            map.remove(&start);
        }
    }

    pub fn lookup_phys(&self, domain: PhysDomain, addr: u64) -> Option<PhysAlias> {
        self.phys[domain as usize]
            .range(..=addr)
            .next_back()
            .map(|(_, a)| *a)
            .filter(|a| a.high >= addr)
    }

    pub fn flush_phys(&mut self, domain: PhysDomain) {
        self.phys[domain as usize].clear();
    }

    pub fn flush_virtual(&mut self) {
        for index in &mut self.virt {
            index.clear();
        }
        self.owners.clear();
    }

    pub fn flush(&mut self) {
        self.flush_virtual();
        for map in &mut self.phys {
            map.clear();
        }
    }
}
