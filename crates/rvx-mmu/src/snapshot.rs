//! Checkpoint/restore of translation state.
//!
//! The format is little-endian throughout:
//!
//! ```text
//! magic "RVXM" | version u16 | xlen u8
//! mode u8 | status u8 | mpp u8 | satp u64 | vsatp u64 | hgatp u64 | adue u8 | instret u64
//! next_custom u32
//! 3 × stage { asid capacity u32 | window start u64 | window evictions u32
//!             key count u32 | keys (vmid u16, asid u16)...
//!             entry count u32 | entries... }
//! pmp { count u32 | cfg bytes | addr u64s | mseccfg u64 }
//! mpu present u8 [ same as pmp ]
//! ```
//!
//! Artifact TLB entries are not persisted. Aliases and cached physical ranges are rebuilt lazily
//! after a restore.

use std::io::{self, Read, Write};

use thiserror::Error;
use tracing::debug;

use crate::asid::AsidKey;
use crate::csr::{PrivilegeMode, SimAsid, StatusFlags, TranslationStage, Xlen};
use crate::pmp::{Mseccfg, ProtectionUnit};
use crate::pte::Priv;
use crate::tlb::{CustomEntryId, TlbEntry};
use crate::Mmu;

pub const SNAPSHOT_MAGIC: &[u8; 4] = b"RVXM";
pub const SNAPSHOT_VERSION: u16 = 1;

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("out of memory allocating {len} entries")]
    OutOfMemory { len: usize },

    #[error("invalid snapshot magic")]
    InvalidMagic,

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u16),

    #[error("corrupt snapshot: {0}")]
    Corrupt(&'static str),
}

const STATUS_MXR: u8 = 1 << 0;
const STATUS_SUM: u8 = 1 << 1;
const STATUS_MPRV: u8 = 1 << 2;
const STATUS_MPV: u8 = 1 << 3;
const STATUS_VS_MXR: u8 = 1 << 4;
const STATUS_VS_SUM: u8 = 1 << 5;

const ENTRY_GLOBAL: u8 = 1 << 0;
const ENTRY_USER: u8 = 1 << 1;
const ENTRY_ACCESSED: u8 = 1 << 2;
const ENTRY_DIRTY: u8 = 1 << 3;
const ENTRY_HAS_PTE: u8 = 1 << 4;
const ENTRY_CUSTOM: u8 = 1 << 5;

trait WriteLeExt: Write {
    fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_all(&[v])?;
        Ok(())
    }

    fn write_u16_le(&mut self, v: u16) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u32_le(&mut self, v: u32) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u64_le(&mut self, v: u64) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_len(&mut self, len: usize) -> Result<()> {
        let len: u32 = len
            .try_into()
            .map_err(|_| SnapshotError::Corrupt("length does not fit in u32"))?;
        self.write_u32_le(len)
    }
}

impl<T: Write + ?Sized> WriteLeExt for T {}

trait ReadLeExt: Read {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_le(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(SnapshotError::Corrupt("invalid boolean")),
        }
    }

    /// Reads a `u32` count followed by that many items.
    fn read_vec<T>(&mut self, mut item: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let len = self.read_u32_le()? as usize;
        let mut out = Vec::new();
        out.try_reserve_exact(len)
            .map_err(|_| SnapshotError::OutOfMemory { len })?;
        for _ in 0..len {
            out.push(item(self)?);
        }
        Ok(out)
    }
}

impl<T: Read + ?Sized> ReadLeExt for T {}

/// Per-stage TLB state as persisted.
#[derive(Debug)]
struct StageState {
    capacity: u32,
    window_start: u64,
    window_evictions: u32,
    keys: Vec<AsidKey>,
    entries: Vec<TlbEntry>,
}

#[derive(Debug)]
struct UnitState {
    cfg: Vec<u8>,
    addr: Vec<u64>,
    mseccfg: Mseccfg,
}

fn xlen_tag(xlen: Xlen) -> u8 {
    match xlen {
        Xlen::Rv32 => 32,
        Xlen::Rv64 => 64,
    }
}

fn encode_status(status: StatusFlags) -> u8 {
    let mut bits = 0;
    for (set, bit) in [
        (status.mxr, STATUS_MXR),
        (status.sum, STATUS_SUM),
        (status.mprv, STATUS_MPRV),
        (status.mpv, STATUS_MPV),
        (status.vs_mxr, STATUS_VS_MXR),
        (status.vs_sum, STATUS_VS_SUM),
    ] {
        if set {
            bits |= bit;
        }
    }
    bits
}

fn decode_status(bits: u8, mpp: u8) -> StatusFlags {
    StatusFlags {
        mxr: bits & STATUS_MXR != 0,
        sum: bits & STATUS_SUM != 0,
        mprv: bits & STATUS_MPRV != 0,
        mpp: mpp & 0b11,
        mpv: bits & STATUS_MPV != 0,
        vs_mxr: bits & STATUS_VS_MXR != 0,
        vs_sum: bits & STATUS_VS_SUM != 0,
    }
}

fn write_entry<W: Write + ?Sized>(w: &mut W, entry: &TlbEntry) -> Result<()> {
    let mut flags = 0;
    for (set, bit) in [
        (entry.global, ENTRY_GLOBAL),
        (entry.user, ENTRY_USER),
        (entry.accessed, ENTRY_ACCESSED),
        (entry.dirty, ENTRY_DIRTY),
        (entry.pte_addr.is_some(), ENTRY_HAS_PTE),
        (entry.custom.is_some(), ENTRY_CUSTOM),
    ] {
        if set {
            flags |= bit;
        }
    }

    w.write_u64_le(entry.low)?;
    w.write_u8(entry.size_log2)?;
    w.write_u64_le(entry.pa)?;
    w.write_u8(entry.priv_.bits())?;
    w.write_u8(flags)?;
    w.write_u64_le(entry.sim_asid.raw())?;
    w.write_u64_le(entry.asid_mask)?;
    if let Some(pte_addr) = entry.pte_addr {
        w.write_u64_le(pte_addr)?;
    }
    if let Some(CustomEntryId(id)) = entry.custom {
        w.write_u32_le(id)?;
    }
    Ok(())
}

fn read_entry<R: Read + ?Sized>(r: &mut R, stage: TranslationStage) -> Result<TlbEntry> {
    let low = r.read_u64_le()?;
    let size_log2 = r.read_u8()?;
    let pa = r.read_u64_le()?;
    let priv_ = Priv::from_bits(r.read_u8()?).ok_or(SnapshotError::Corrupt("invalid entry permissions"))?;
    let flags = r.read_u8()?;
    let sim_asid = SimAsid::from_raw(r.read_u64_le()?);
    let asid_mask = r.read_u64_le()?;
    let pte_addr = if flags & ENTRY_HAS_PTE != 0 {
        Some(r.read_u64_le()?)
    } else {
        None
    };
    let custom = if flags & ENTRY_CUSTOM != 0 {
        Some(CustomEntryId(r.read_u32_le()?))
    } else {
        None
    };

    if !(crate::PAGE_SHIFT as u8..=64).contains(&size_log2) {
        return Err(SnapshotError::Corrupt("invalid entry size"));
    }
    let entry = TlbEntry {
        low,
        size_log2,
        pa,
        stage,
        priv_,
        global: flags & ENTRY_GLOBAL != 0,
        user: flags & ENTRY_USER != 0,
        accessed: flags & ENTRY_ACCESSED != 0,
        dirty: flags & ENTRY_DIRTY != 0,
        sim_asid,
        asid_mask,
        mapped_modes: 0,
        artifact: false,
        custom,
        pte_addr,
    };
    if entry.size() != u64::MAX && low & (entry.size() - 1) != 0 {
        return Err(SnapshotError::Corrupt("misaligned entry"));
    }
    Ok(entry)
}

fn write_unit<W: Write + ?Sized>(w: &mut W, unit: &ProtectionUnit) -> Result<()> {
    w.write_len(unit.regions())?;
    w.write_all(unit.raw_cfg())?;
    for &addr in unit.raw_addr() {
        w.write_u64_le(addr)?;
    }
    w.write_u64_le(unit.mseccfg().bits())?;
    Ok(())
}

fn read_unit<R: Read + ?Sized>(r: &mut R, unit: &ProtectionUnit) -> Result<UnitState> {
    let count = r.read_u32_le()? as usize;
    if count != unit.regions() {
        return Err(SnapshotError::Corrupt("protection region count mismatch"));
    }
    let mut cfg = vec![0u8; count];
    r.read_exact(&mut cfg)?;
    let mut addr = Vec::with_capacity(count);
    for _ in 0..count {
        addr.push(r.read_u64_le()?);
    }
    let mseccfg = Mseccfg::from_bits(r.read_u64_le()?)
        .ok_or(SnapshotError::Corrupt("invalid mseccfg"))?;
    Ok(UnitState { cfg, addr, mseccfg })
}

impl Mmu {
    /// Serializes the hart's translation state: control registers, TLB contents, ASID caches and
    /// protection registers.
    pub fn save_state<W: Write>(&self, mut w: W) -> Result<()> {
        let xlen = self.config.xlen;
        w.write_all(SNAPSHOT_MAGIC)?;
        w.write_u16_le(SNAPSHOT_VERSION)?;
        w.write_u8(xlen_tag(xlen))?;

        w.write_u8(self.mode.index() as u8)?;
        w.write_u8(encode_status(self.status))?;
        w.write_u8(self.status.mpp)?;
        w.write_u64_le(self.satp.encode_satp(xlen))?;
        w.write_u64_le(self.vsatp.encode_satp(xlen))?;
        w.write_u64_le(self.hgatp.encode_hgatp(xlen))?;
        w.write_u8(self.adue as u8)?;
        w.write_u64_le(self.instret)?;
        w.write_u32_le(self.next_custom)?;

        for tlb in &self.tlbs {
            let asids = tlb.asid_cache();
            let (window_start, window_evictions) = asids.window();
            w.write_len(asids.capacity())?;
            w.write_u64_le(window_start)?;
            w.write_u32_le(window_evictions)?;
            w.write_len(asids.keys().len())?;
            for key in asids.keys() {
                w.write_u16_le(key.vmid)?;
                w.write_u16_le(key.asid)?;
            }

            let entries: Vec<&TlbEntry> = tlb
                .iter()
                .map(|(_, entry)| entry)
                .filter(|entry| !entry.artifact)
                .collect();
            w.write_len(entries.len())?;
            for entry in entries {
                write_entry(&mut w, entry)?;
            }
        }

        write_unit(&mut w, &self.pmp)?;
        match &self.mpu {
            Some(mpu) => {
                w.write_u8(1)?;
                write_unit(&mut w, mpu)?;
            }
            None => w.write_u8(0)?,
        }
        w.flush()?;
        Ok(())
    }

    /// Restores state written by [`Mmu::save_state`] on an identically configured MMU.
    ///
    /// The snapshot is decoded and validated in full before anything is modified, so a failed
    /// restore leaves the MMU untouched.
    pub fn load_state<R: Read>(&mut self, mut r: R) -> Result<()> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }
        let version = r.read_u16_le()?;
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }
        if r.read_u8()? != xlen_tag(self.config.xlen) {
            return Err(SnapshotError::Corrupt("xlen mismatch"));
        }

        let mode = PrivilegeMode::ALL
            .get(r.read_u8()? as usize)
            .copied()
            .ok_or(SnapshotError::Corrupt("invalid privilege mode"))?;
        if mode.is_virtual() && !self.config.hypervisor {
            return Err(SnapshotError::Corrupt("virtualized mode without hypervisor"));
        }
        let status_bits = r.read_u8()?;
        let status = decode_status(status_bits, r.read_u8()?);
        let satp = self
            .decode_root(r.read_u64_le()?, false)
            .ok_or(SnapshotError::Corrupt("unsupported satp mode"))?;
        let vsatp = self
            .decode_root(r.read_u64_le()?, false)
            .ok_or(SnapshotError::Corrupt("unsupported vsatp mode"))?;
        let hgatp = self
            .decode_root(r.read_u64_le()?, true)
            .ok_or(SnapshotError::Corrupt("unsupported hgatp mode"))?;
        let adue = r.read_bool()?;
        let instret = r.read_u64_le()?;
        let next_custom = r.read_u32_le()?;

        let mut stages = Vec::with_capacity(TranslationStage::ALL.len());
        for stage in TranslationStage::ALL {
            let capacity = r.read_u32_le()?;
            let window_start = r.read_u64_le()?;
            let window_evictions = r.read_u32_le()?;
            let keys = r.read_vec(|r| {
                Ok(AsidKey {
                    vmid: r.read_u16_le()?,
                    asid: r.read_u16_le()?,
                })
            })?;
            let entries = r.read_vec(|r| read_entry(r, stage))?;
            if entries
                .iter()
                .filter_map(|e| e.custom)
                .any(|CustomEntryId(id)| id >= next_custom)
            {
                return Err(SnapshotError::Corrupt("custom entry id out of range"));
            }
            stages.push(StageState {
                capacity,
                window_start,
                window_evictions,
                keys,
                entries,
            });
        }

        let pmp = read_unit(&mut r, &self.pmp)?;
        let mpu = match (r.read_bool()?, &self.mpu) {
            (true, Some(unit)) => Some(read_unit(&mut r, unit)?),
            (false, None) => None,
            _ => return Err(SnapshotError::Corrupt("MPU presence mismatch")),
        };

        // Everything decoded; commit.
        self.mode = mode;
        self.status = status;
        self.satp = satp;
        self.vsatp = vsatp;
        self.hgatp = hgatp;
        self.adue = adue;
        self.instret = instret;
        self.next_custom = next_custom;
        self.last_trap = None;

        self.domains.flush();
        self.pma.flush();

        let mut restored = 0usize;
        for (tlb, state) in self.tlbs.iter_mut().zip(stages) {
            tlb.reset();
            restored += state.entries.len();
            for entry in state.entries {
                tlb.restore_entry(entry);
            }
            tlb.asid_cache_mut().restore(
                state.keys,
                state.capacity as usize,
                state.window_start,
                state.window_evictions,
            );
        }

        self.pmp.restore(pmp.cfg, pmp.addr, pmp.mseccfg);
        if let (Some(unit), Some(state)) = (&mut self.mpu, mpu) {
            unit.restore(state.cfg, state.addr, state.mseccfg);
        }

        self.refresh_context();
        debug!(entries = restored, ?mode, "restored MMU snapshot");
        Ok(())
    }
}
