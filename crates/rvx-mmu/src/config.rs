//! Already-resolved MMU configuration.

use bitflags::bitflags;
use tracing::warn;

use crate::csr::Xlen;
use crate::pte::VmMode;

/// Privileged-architecture revision. Only the SUM/PUM polarity depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PrivVersion {
    /// `mstatus.PUM`: set means supervisor may *not* touch user pages.
    V1_9,
    V1_10,
    V1_11,
    V1_12,
}

impl PrivVersion {
    #[inline]
    pub fn uses_pum(self) -> bool {
        self == PrivVersion::V1_9
    }
}

bitflags! {
    /// Translation modes the hart implements. `satp` writes selecting anything else are ignored.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmModes: u8 {
        const SV32 = 1 << 0;
        const SV39 = 1 << 1;
        const SV48 = 1 << 2;
        const SV57 = 1 << 3;
    }
}

impl VmModes {
    pub fn supports(self, mode: VmMode) -> bool {
        match mode {
            VmMode::Bare => true,
            VmMode::Sv32 => self.contains(VmModes::SV32),
            VmMode::Sv39 => self.contains(VmModes::SV39),
            VmMode::Sv48 => self.contains(VmModes::SV48),
            VmMode::Sv57 => self.contains(VmModes::SV57),
        }
    }
}

pub const MAX_PMP_REGIONS: usize = 64;
const MIN_PMA_WINDOW_BITS: u32 = 12;
const MAX_PMA_WINDOW_BITS: u32 = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmuConfig {
    pub xlen: Xlen,
    pub priv_version: PrivVersion,
    pub vm_modes: VmModes,
    pub hypervisor: bool,
    pub svnapot: bool,
    pub svpbmt: bool,
    /// Hardware update of accessed/dirty bits at reset (`menvcfg.ADUE`).
    pub svadu: bool,
    pub pmp_regions: usize,
    /// PMP granularity `G`; the smallest region is `2^(G+2)` bytes.
    pub pmp_grain: u32,
    pub smepmp: bool,
    pub mpu_regions: usize,
    pub max_access_bytes: u64,
    pub unaligned_decompose: bool,
    pub pma_window_bits: u32,
    pub split_code_domain: bool,
    pub asid_cache_size: usize,
    pub asid_cache_max: usize,
    pub couple_stage2_invalidation: bool,
    pub asid_bits: u32,
    pub vmid_bits: u32,
    pub phys_addr_bits: u32,
}

impl Default for MmuConfig {
    fn default() -> Self {
        Self::rv64()
    }
}

impl MmuConfig {
    pub fn rv64() -> Self {
        Self {
            xlen: Xlen::Rv64,
            priv_version: PrivVersion::V1_12,
            vm_modes: VmModes::SV39 | VmModes::SV48,
            hypervisor: false,
            svnapot: false,
            svpbmt: false,
            svadu: false,
            pmp_regions: 16,
            pmp_grain: 0,
            smepmp: false,
            mpu_regions: 0,
            max_access_bytes: 8,
            unaligned_decompose: true,
            pma_window_bits: 20,
            split_code_domain: false,
            asid_cache_size: 8,
            asid_cache_max: 256,
            couple_stage2_invalidation: true,
            asid_bits: 16,
            vmid_bits: 14,
            phys_addr_bits: 56,
        }
    }

    pub fn rv32() -> Self {
        Self {
            xlen: Xlen::Rv32,
            vm_modes: VmModes::SV32,
            asid_bits: 9,
            vmid_bits: 7,
            phys_addr_bits: 34,
            ..Self::rv64()
        }
    }

    /// Returns a copy with every out-of-range field clamped.
    pub fn validated(&self) -> Self {
        let mut cfg = self.clone();

        if cfg.pmp_regions > MAX_PMP_REGIONS {
            warn!(requested = cfg.pmp_regions, "clamping PMP region count");
            cfg.pmp_regions = MAX_PMP_REGIONS;
        }
        if cfg.mpu_regions > MAX_PMP_REGIONS {
            warn!(requested = cfg.mpu_regions, "clamping MPU region count");
            cfg.mpu_regions = MAX_PMP_REGIONS;
        }

        let max_phys_bits = match cfg.xlen {
            Xlen::Rv32 => 34,
            Xlen::Rv64 => 56,
        };
        if cfg.phys_addr_bits < 12 || cfg.phys_addr_bits > max_phys_bits {
            warn!(requested = cfg.phys_addr_bits, "clamping physical address width");
            cfg.phys_addr_bits = cfg.phys_addr_bits.clamp(12, max_phys_bits);
        }

        // pmpaddr holds PA[phys_addr_bits-1:2]; the grain cannot exceed it.
        let max_grain = cfg.phys_addr_bits - 2;
        if cfg.pmp_grain > max_grain {
            warn!(requested = cfg.pmp_grain, "clamping PMP grain");
            cfg.pmp_grain = max_grain;
        }

        if !cfg.max_access_bytes.is_power_of_two() || cfg.max_access_bytes < 2 {
            let clamped = cfg.max_access_bytes.max(2).next_power_of_two();
            warn!(requested = cfg.max_access_bytes, clamped, "clamping maximum access width");
            cfg.max_access_bytes = clamped;
        }

        if !(MIN_PMA_WINDOW_BITS..=MAX_PMA_WINDOW_BITS).contains(&cfg.pma_window_bits) {
            warn!(requested = cfg.pma_window_bits, "clamping PMA window size");
            cfg.pma_window_bits = cfg
                .pma_window_bits
                .clamp(MIN_PMA_WINDOW_BITS, MAX_PMA_WINDOW_BITS);
        }

        if cfg.asid_cache_size == 0 {
            warn!("ASID cache size of zero raised to one");
            cfg.asid_cache_size = 1;
        }
        if cfg.asid_cache_max < cfg.asid_cache_size {
            warn!(
                max = cfg.asid_cache_max,
                size = cfg.asid_cache_size,
                "raising ASID cache ceiling to its initial size"
            );
            cfg.asid_cache_max = cfg.asid_cache_size;
        }

        let (max_asid, max_vmid) = match cfg.xlen {
            Xlen::Rv32 => (9, 7),
            Xlen::Rv64 => (16, 14),
        };
        if cfg.asid_bits > max_asid {
            warn!(requested = cfg.asid_bits, "clamping ASID width");
            cfg.asid_bits = max_asid;
        }
        if cfg.vmid_bits > max_vmid {
            warn!(requested = cfg.vmid_bits, "clamping VMID width");
            cfg.vmid_bits = max_vmid;
        }

        if cfg.xlen == Xlen::Rv32 {
            if cfg.vm_modes.intersects(VmModes::SV39 | VmModes::SV48 | VmModes::SV57) {
                warn!("RV32 harts only support Sv32");
            }
            cfg.vm_modes &= VmModes::SV32;
            if cfg.svnapot || cfg.svpbmt {
                warn!("Svnapot/Svpbmt require RV64");
                cfg.svnapot = false;
                cfg.svpbmt = false;
            }
        } else {
            cfg.vm_modes.remove(VmModes::SV32);
        }

        cfg
    }

    /// Granule of a protection region in bytes.
    #[inline]
    pub fn grain_bytes(&self) -> u64 {
        4u64 << self.pmp_grain
    }

    /// Maximum number of distinct protection regions one access may span.
    ///
    /// An access of `max_access_bytes` can touch at most this many granules.
    pub fn straddle_limit(&self) -> usize {
        let span = self.max_access_bytes.saturating_sub(2) / self.grain_bytes();
        span as usize + 2
    }

    #[inline]
    pub(crate) fn phys_addr_mask(&self) -> u64 {
        if self.phys_addr_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.phys_addr_bits) - 1
        }
    }
}
