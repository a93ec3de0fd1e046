use bitflags::bitflags;

use crate::csr::Xlen;

bitflags! {
    /// Read/write/execute permission triple shared by PTEs, TLB entries and protection regions.
    ///
    /// The bit values match the R/W/X encoding of `pmpcfg` (R=1, W=2, X=4).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Priv: u8 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
    }
}

bitflags! {
    /// Flag bits of a page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
        /// Svnapot contiguous-range bit (RV64 only).
        const N = 1 << 63;
    }
}

const PTE_PPN_SHIFT: u32 = 10;
const PTE_PPN_MASK_32: u64 = (1 << 22) - 1;
const PTE_PPN_MASK_64: u64 = (1 << 44) - 1;
const PTE_RESERVED_SHIFT: u32 = 54;
const PTE_RESERVED_MASK: u64 = 0x7f;
const PTE_PBMT_SHIFT: u32 = 61;

/// Size of the contiguous range encoded by a Svnapot PTE (`PPN[3:0] = 0b1000`).
pub const NAPOT_SIZE_LOG2: u8 = 16;
pub(crate) const NAPOT_PPN_MASK: u64 = 0xf;
pub(crate) const NAPOT_PPN_PATTERN: u64 = 0b1000;

/// One page-table entry as read from guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    raw: u64,
    xlen: Xlen,
}

impl PageTableEntry {
    #[inline]
    pub fn new(raw: u64, xlen: Xlen) -> Self {
        let raw = match xlen {
            Xlen::Rv32 => raw & 0xffff_ffff,
            Xlen::Rv64 => raw,
        };
        Self { raw, xlen }
    }

    /// Builds the raw encoding of an entry pointing at `ppn`.
    #[inline]
    pub fn encode(ppn: u64, flags: PteFlags) -> u64 {
        (ppn << PTE_PPN_SHIFT) | flags.bits()
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.raw
    }

    #[inline]
    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.raw)
    }

    #[inline]
    pub fn valid(&self) -> bool {
        self.flags().contains(PteFlags::V)
    }

    /// The R/W/X triple.
    #[inline]
    pub fn priv_(&self) -> Priv {
        Priv::from_bits_truncate(((self.raw >> 1) & 0b111) as u8)
    }

    /// A PTE with any of R/W/X set is a leaf.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        !self.priv_().is_empty()
    }

    #[inline]
    pub fn user(&self) -> bool {
        self.flags().contains(PteFlags::U)
    }

    #[inline]
    pub fn global(&self) -> bool {
        self.flags().contains(PteFlags::G)
    }

    #[inline]
    pub fn accessed(&self) -> bool {
        self.flags().contains(PteFlags::A)
    }

    #[inline]
    pub fn dirty(&self) -> bool {
        self.flags().contains(PteFlags::D)
    }

    #[inline]
    pub fn ppn(&self) -> u64 {
        let mask = match self.xlen {
            Xlen::Rv32 => PTE_PPN_MASK_32,
            Xlen::Rv64 => PTE_PPN_MASK_64,
        };
        (self.raw >> PTE_PPN_SHIFT) & mask
    }

    /// Bits [60:54]; always zero on RV32.
    #[inline]
    pub fn reserved(&self) -> u64 {
        match self.xlen {
            Xlen::Rv32 => 0,
            Xlen::Rv64 => (self.raw >> PTE_RESERVED_SHIFT) & PTE_RESERVED_MASK,
        }
    }

    /// Svpbmt memory type, bits [62:61].
    #[inline]
    pub fn pbmt(&self) -> u8 {
        match self.xlen {
            Xlen::Rv32 => 0,
            Xlen::Rv64 => ((self.raw >> PTE_PBMT_SHIFT) & 0b11) as u8,
        }
    }

    #[inline]
    pub fn napot(&self) -> bool {
        self.xlen == Xlen::Rv64 && self.flags().contains(PteFlags::N)
    }

    #[inline]
    pub fn with_flags(&self, flags: PteFlags) -> Self {
        Self {
            raw: self.raw | flags.bits(),
            xlen: self.xlen,
        }
    }
}

/// Translation scheme selected by a root register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VmMode {
    #[default]
    Bare,
    Sv32,
    Sv39,
    Sv48,
    Sv57,
}

/// Shape of a page-table hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub levels: u32,
    pub vpn_bits: u32,
    pub pte_bytes: u32,
    /// Width of the input address. Bits above it must be a sign extension (stage 1) or zero
    /// (stage 2).
    pub va_bits: u32,
    /// Extra index bits of the root table (2 for the x4 stage-2 forms).
    pub root_extra_bits: u32,
}

impl Layout {
    /// Index into the table at `level` for `addr`.
    #[inline]
    pub fn vpn(&self, addr: u64, level: u32) -> u64 {
        let mut bits = self.vpn_bits;
        if level + 1 == self.levels {
            bits += self.root_extra_bits;
        }
        (addr >> (12 + level * self.vpn_bits)) & ((1u64 << bits) - 1)
    }

    /// log2 of the region mapped by a leaf at `level`.
    #[inline]
    pub fn page_size_log2(&self, level: u32) -> u8 {
        (12 + level * self.vpn_bits) as u8
    }
}

impl VmMode {
    /// MODE field value of `satp` on RV64 (`hgatp` uses the same values for the x4 forms).
    pub const fn satp_encoding(self) -> u64 {
        match self {
            VmMode::Bare => 0,
            VmMode::Sv32 => 1,
            VmMode::Sv39 => 8,
            VmMode::Sv48 => 9,
            VmMode::Sv57 => 10,
        }
    }

    /// Table shape for this mode; `widened` selects the x4 stage-2 variant.
    pub const fn layout(self, widened: bool) -> Option<Layout> {
        let (levels, vpn_bits, pte_bytes, va_bits) = match self {
            VmMode::Bare => return None,
            VmMode::Sv32 => (2, 10, 4, 32),
            VmMode::Sv39 => (3, 9, 8, 39),
            VmMode::Sv48 => (4, 9, 8, 48),
            VmMode::Sv57 => (5, 9, 8, 57),
        };
        let root_extra_bits = if widened { 2 } else { 0 };
        Some(Layout {
            levels,
            vpn_bits,
            pte_bytes,
            va_bits: va_bits + root_extra_bits,
            root_extra_bits,
        })
    }

    /// Sign-extension check of a stage-1 virtual address.
    pub fn is_canonical(self, addr: u64) -> bool {
        let va_bits = match self {
            VmMode::Bare | VmMode::Sv32 => return true,
            VmMode::Sv39 => 39,
            VmMode::Sv48 => 48,
            VmMode::Sv57 => 57,
        };
        let shift = 64 - va_bits;
        (((addr << shift) as i64) >> shift) as u64 == addr
    }
}
