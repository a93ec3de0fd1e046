use tracing::{debug, trace};

use crate::asid::{AsidCache, AsidKey};
use crate::csr::{PrivilegeMode, SimAsid, TranslationStage};
use crate::index::{align_down, SizeClassIndex};
use crate::pte::Priv;

/// Stable handle to a TLB entry.
///
/// The generation makes handles to freed slots fail to resolve instead of aliasing whichever
/// entry reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId {
    index: u32,
    gen: u32,
}

/// Identifier of an externally injected mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CustomEntryId(pub u32);

/// A validated translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub low: u64,
    pub size_log2: u8,
    /// Output base (guest-physical for the VS-stage, physical otherwise).
    pub pa: u64,
    pub stage: TranslationStage,
    /// R/W/X as encoded in the leaf PTE.
    pub priv_: Priv,
    pub global: bool,
    pub user: bool,
    pub accessed: bool,
    pub dirty: bool,
    /// Context the entry was created in.
    pub sim_asid: SimAsid,
    /// Fields of `sim_asid` that must match for reuse.
    pub asid_mask: u64,
    /// Modes with a live virtual alias derived from this entry (see [`PrivilegeMode::bit`]).
    pub mapped_modes: u8,
    /// Created by a diagnostic access; never promoted and dropped by the next real lookup.
    pub artifact: bool,
    pub custom: Option<CustomEntryId>,
    /// Physical address of the leaf PTE, if the entry came from a walk.
    pub pte_addr: Option<u64>,
}

impl TlbEntry {
    #[inline]
    pub fn size(&self) -> u64 {
        if self.size_log2 >= 64 {
            u64::MAX
        } else {
            1u64 << self.size_log2
        }
    }

    /// Last address covered (inclusive).
    #[inline]
    pub fn high(&self) -> u64 {
        self.low.wrapping_add(self.size() - 1)
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        align_down(addr, self.size_log2) == self.low
    }

    #[inline]
    pub fn overlaps(&self, low: u64, high: u64) -> bool {
        self.low <= high && low <= self.high()
    }

    #[inline]
    pub fn translate(&self, addr: u64) -> u64 {
        self.pa.wrapping_add(addr.wrapping_sub(self.low))
    }

    /// Key this entry is accounted under in the ASID MRU cache.
    pub fn asid_key(&self) -> AsidKey {
        asid_key(self.stage, self.sim_asid)
    }

    #[inline]
    pub fn is_mapped_in(&self, mode: PrivilegeMode) -> bool {
        self.mapped_modes & mode.bit() != 0
    }

    /// Entries outside the ASID MRU accounting.
    #[inline]
    fn pinned(&self) -> bool {
        self.global || self.artifact || self.custom.is_some()
    }
}

pub(crate) fn asid_key(stage: TranslationStage, ctx: SimAsid) -> AsidKey {
    match stage {
        TranslationStage::NonVirtual => AsidKey {
            vmid: 0,
            asid: ctx.asid(),
        },
        TranslationStage::GuestStage1 => AsidKey {
            vmid: ctx.vmid(),
            asid: ctx.vs_asid(),
        },
        TranslationStage::GuestStage2 => AsidKey {
            vmid: ctx.vmid(),
            asid: 0,
        },
    }
}

/// Invalidation filter over one TLB. `None` means "any".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbSelector {
    pub address: Option<(u64, u64)>,
    pub asid: Option<u16>,
    pub vmid: Option<u16>,
}

#[derive(Debug, Clone)]
struct Slot {
    gen: u32,
    entry: Option<TlbEntry>,
}

/// Translation cache for one stage.
#[derive(Debug, Clone)]
pub struct Tlb {
    stage: TranslationStage,
    slots: Vec<Slot>,
    free: Vec<u32>,
    index: SizeClassIndex<EntryId>,
    asids: AsidCache,
    customs: usize,
}

/// Entries removed by an operation, for alias teardown by the caller.
pub type Removed = Vec<(EntryId, TlbEntry)>;

impl Tlb {
    pub fn new(stage: TranslationStage, asid_cache_size: usize, asid_cache_max: usize) -> Self {
        Self {
            stage,
            slots: Vec::new(),
            free: Vec::new(),
            index: SizeClassIndex::default(),
            asids: AsidCache::new(asid_cache_size, asid_cache_max),
            customs: 0,
        }
    }

    #[inline]
    pub fn stage(&self) -> TranslationStage {
        self.stage
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[inline]
    pub fn asid_cache(&self) -> &AsidCache {
        &self.asids
    }

    #[inline]
    pub(crate) fn asid_cache_mut(&mut self) -> &mut AsidCache {
        &mut self.asids
    }

    #[inline]
    pub fn get(&self, id: EntryId) -> Option<&TlbEntry> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.gen == id.gen)
            .and_then(|slot| slot.entry.as_ref())
    }

    #[inline]
    fn get_mut(&mut self, id: EntryId) -> Option<&mut TlbEntry> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.gen == id.gen)
            .and_then(|slot| slot.entry.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &TlbEntry)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|entry| {
                (
                    EntryId {
                        index: index as u32,
                        gen: slot.gen,
                    },
                    entry,
                )
            })
        })
    }

    /// Finds an entry covering `addr` usable in context `ctx`.
    ///
    /// Real (non-diagnostic) lookups drop any artifact entries they traverse.
    pub fn lookup(&mut self, addr: u64, ctx: SimAsid, real: bool) -> Option<(EntryId, TlbEntry)> {
        let mut stale = Vec::new();
        let mut hit = None;

        for &id in self.index.candidates(addr) {
            let Some(entry) = self.get(id) else {
                continue;
            };
            if real && entry.artifact {
                stale.push(id);
                continue;
            }
            if entry.sim_asid.matches(ctx, entry.asid_mask) {
                // Injected mappings shadow walked ones, whatever their size.
                if entry.custom.is_some() {
                    hit = Some((id, *entry));
                    break;
                }
                if hit.is_none() {
                    hit = Some((id, *entry));
                    if self.customs == 0 {
                        break;
                    }
                }
            }
        }

        for id in stale {
            trace!(stage = ?self.stage, "dropping artifact TLB entry");
            self.remove(id);
        }

        if let Some((_, entry)) = &hit {
            if real && !entry.pinned() {
                self.asids.touch(entry.asid_key());
            }
        }
        hit
    }

    /// Installs `entry`, returning its handle and every entry removed as a consequence
    /// (duplicates it replaces and entries of an evicted address space).
    pub fn insert(&mut self, entry: TlbEntry, instret: u64) -> (EntryId, Removed) {
        let mut removed = Vec::new();

        // Replace any entry for the same range that would match in the same context.
        let dupes: Vec<EntryId> = self
            .index
            .candidates(entry.low)
            .copied()
            .filter(|&id| {
                self.get(id).is_some_and(|e| {
                    e.low == entry.low
                        && e.size_log2 == entry.size_log2
                        && e.custom == entry.custom
                        && e.sim_asid.matches(entry.sim_asid, e.asid_mask | entry.asid_mask)
                })
            })
            .collect();
        for id in dupes {
            if let Some(old) = self.remove(id) {
                removed.push((id, old));
            }
        }

        let id = self.alloc(entry);

        if !entry.pinned() {
            if let Some(evicted) = self.asids.promote(entry.asid_key(), instret) {
                debug!(stage = ?self.stage, ?evicted, "evicting address space from TLB");
                removed.extend(self.remove_where(|e| !e.pinned() && e.asid_key() == evicted));
            }
        }

        (id, removed)
    }

    /// Re-creates an entry from a snapshot without touching the ASID cache.
    pub(crate) fn restore_entry(&mut self, entry: TlbEntry) -> EntryId {
        self.alloc(entry)
    }

    fn alloc(&mut self, entry: TlbEntry) -> EntryId {
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.gen = slot.gen.wrapping_add(1);
                slot.entry = Some(entry);
                EntryId {
                    index,
                    gen: slot.gen,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    gen: 0,
                    entry: Some(entry),
                });
                EntryId { index, gen: 0 }
            }
        };
        self.index.insert(entry.low, entry.size_log2, id);
        if entry.custom.is_some() {
            self.customs += 1;
        }
        id
    }

    pub fn remove(&mut self, id: EntryId) -> Option<TlbEntry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        let entry = slot.entry.take()?;
        self.free.push(id.index);
        self.index.remove(entry.low, entry.size_log2, &id);
        if entry.custom.is_some() {
            self.customs -= 1;
        }
        Some(entry)
    }

    pub fn remove_where(&mut self, mut pred: impl FnMut(&TlbEntry) -> bool) -> Removed {
        let ids: Vec<EntryId> = self
            .iter()
            .filter(|(_, e)| pred(e))
            .map(|(id, _)| id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.remove(id).map(|e| (id, e)))
            .collect()
    }

    /// Fence. Custom entries are never affected; global entries survive ASID-specific fences.
    pub fn invalidate(&mut self, sel: &TlbSelector) -> Removed {
        let stage = self.stage;
        self.remove_where(|e| {
            if e.custom.is_some() {
                return false;
            }
            if let Some((low, high)) = sel.address {
                if !e.overlaps(low, high) {
                    return false;
                }
            }
            if let Some(asid) = sel.asid {
                if e.global {
                    return false;
                }
                let entry_asid = match stage {
                    TranslationStage::NonVirtual => e.sim_asid.asid(),
                    TranslationStage::GuestStage1 => e.sim_asid.vs_asid(),
                    TranslationStage::GuestStage2 => asid,
                };
                if entry_asid != asid {
                    return false;
                }
            }
            if let Some(vmid) = sel.vmid {
                if stage != TranslationStage::NonVirtual && e.sim_asid.vmid() != vmid {
                    return false;
                }
            }
            true
        })
    }

    /// Whether an injected entry usable in `ctx` overlaps `[low, high]`.
    pub fn custom_overlaps(&self, low: u64, high: u64, ctx: SimAsid) -> bool {
        self.customs > 0
            && self.iter().any(|(_, e)| {
                e.custom.is_some() && e.overlaps(low, high) && e.sim_asid.matches(ctx, e.asid_mask)
            })
    }

    pub(crate) fn mark_mapped(&mut self, id: EntryId, mode: PrivilegeMode) {
        if let Some(entry) = self.get_mut(id) {
            entry.mapped_modes |= mode.bit();
        }
    }

    /// Drops every entry except externally injected ones.
    pub fn flush(&mut self) -> Removed {
        self.remove_where(|e| e.custom.is_none())
    }

    /// Drops everything, including custom entries and the ASID cache.
    pub(crate) fn reset(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.asids.clear();
        self.customs = 0;
    }
}
