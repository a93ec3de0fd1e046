use crate::csr::Xlen;
use crate::pte::{PageTableEntry, PteFlags};
use crate::{BusError, MemoryBus};

#[derive(Clone, Debug)]
pub(crate) struct TestMemory {
    pub(crate) data: Vec<u8>,
    reads: usize,
    writes: usize,
    failing: Vec<(u64, u64)>,
}

impl TestMemory {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            reads: 0,
            writes: 0,
            failing: Vec::new(),
        }
    }

    pub(crate) fn reset_counters(&mut self) {
        self.reads = 0;
        self.writes = 0;
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads
    }

    pub(crate) fn writes(&self) -> usize {
        self.writes
    }

    /// Every access touching `[low, high]` fails with a bus error.
    pub(crate) fn fail_range(&mut self, low: u64, high: u64) {
        self.failing.push((low, high));
    }

    pub(crate) fn write_raw_u64(&mut self, paddr: u64, value: u64) {
        let off = paddr as usize;
        self.data[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn read_raw_u64(&self, paddr: u64) -> u64 {
        let off = paddr as usize;
        u64::from_le_bytes(self.data[off..off + 8].try_into().unwrap())
    }

    fn check(&self, paddr: u64, len: usize) -> Result<usize, BusError> {
        let end = paddr.saturating_add(len as u64);
        let failing = self
            .failing
            .iter()
            .any(|&(low, high)| paddr <= high && low < end);
        if failing || end > self.data.len() as u64 {
            return Err(BusError { addr: paddr });
        }
        Ok(paddr as usize)
    }
}

impl MemoryBus for TestMemory {
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) -> Result<(), BusError> {
        self.reads += 1;
        let off = self.check(paddr, dst.len())?;
        dst.copy_from_slice(&self.data[off..off + dst.len()]);
        Ok(())
    }

    fn write_bytes(&mut self, paddr: u64, src: &[u8]) -> Result<(), BusError> {
        self.writes += 1;
        let off = self.check(paddr, src.len())?;
        self.data[off..off + src.len()].copy_from_slice(src);
        Ok(())
    }
}

/// Builds page tables in a [`TestMemory`], allocating tables upward from the root.
#[derive(Clone, Debug)]
pub(crate) struct PageTables {
    pub(crate) root: u64,
    next: u64,
    xlen: Xlen,
    mode: u64,
    levels: u32,
    vpn_bits: u32,
    pte_bytes: u64,
    root_extra_bits: u32,
}

impl PageTables {
    pub(crate) const RWX_AD: PteFlags = PteFlags::R
        .union(PteFlags::W)
        .union(PteFlags::X)
        .union(PteFlags::A)
        .union(PteFlags::D);

    pub(crate) fn sv32(root: u64) -> Self {
        Self::with_shape(root, Xlen::Rv32, 1, 2, 10, 4, 0)
    }

    pub(crate) fn sv39(root: u64) -> Self {
        Self::with_shape(root, Xlen::Rv64, 8, 3, 9, 8, 0)
    }

    pub(crate) fn sv48(root: u64) -> Self {
        Self::with_shape(root, Xlen::Rv64, 9, 4, 9, 8, 0)
    }

    /// Stage-2 Sv39x4: the root table is 16 KiB.
    pub(crate) fn sv39x4(root: u64) -> Self {
        Self::with_shape(root, Xlen::Rv64, 8, 3, 9, 8, 2)
    }

    fn with_shape(
        root: u64,
        xlen: Xlen,
        mode: u64,
        levels: u32,
        vpn_bits: u32,
        pte_bytes: u64,
        root_extra_bits: u32,
    ) -> Self {
        Self {
            root,
            next: root + (0x1000 << root_extra_bits),
            xlen,
            mode,
            levels,
            vpn_bits,
            pte_bytes,
            root_extra_bits,
        }
    }

    /// `satp`/`vsatp` value selecting these tables.
    pub(crate) fn satp(&self, asid: u16) -> u64 {
        match self.xlen {
            Xlen::Rv32 => (1 << 31) | (u64::from(asid) << 22) | (self.root >> 12),
            Xlen::Rv64 => (self.mode << 60) | (u64::from(asid) << 44) | (self.root >> 12),
        }
    }

    pub(crate) fn hgatp(&self, vmid: u16) -> u64 {
        self.satp(vmid)
    }

    fn vpn(&self, va: u64, level: u32) -> u64 {
        let mut bits = self.vpn_bits;
        if level + 1 == self.levels {
            bits += self.root_extra_bits;
        }
        (va >> (12 + level * self.vpn_bits)) & ((1 << bits) - 1)
    }

    fn read(&self, mem: &TestMemory, addr: u64) -> u64 {
        if self.pte_bytes == 4 {
            let off = addr as usize;
            u64::from(u32::from_le_bytes(mem.data[off..off + 4].try_into().unwrap()))
        } else {
            mem.read_raw_u64(addr)
        }
    }

    fn write(&self, mem: &mut TestMemory, addr: u64, raw: u64) {
        if self.pte_bytes == 4 {
            let off = addr as usize;
            mem.data[off..off + 4].copy_from_slice(&(raw as u32).to_le_bytes());
        } else {
            mem.write_raw_u64(addr, raw);
        }
    }

    /// Address of the PTE for `va` at `level`, creating intermediate tables as needed.
    fn slot(&mut self, mem: &mut TestMemory, va: u64, level: u32) -> u64 {
        let mut table = self.root;
        let mut l = self.levels - 1;
        while l > level {
            let addr = table + self.vpn(va, l) * self.pte_bytes;
            let pte = PageTableEntry::new(self.read(mem, addr), self.xlen);
            table = if pte.valid() {
                pte.ppn() << 12
            } else {
                let next = self.next;
                self.next += 0x1000;
                self.write(mem, addr, PageTableEntry::encode(next >> 12, PteFlags::V));
                next
            };
            l -= 1;
        }
        table + self.vpn(va, level) * self.pte_bytes
    }

    /// Maps a 4 KiB page and returns the leaf PTE's address. `V` is always set.
    pub(crate) fn map(&mut self, mem: &mut TestMemory, va: u64, pa: u64, flags: PteFlags) -> u64 {
        self.map_at_level(mem, va, pa, 0, flags)
    }

    pub(crate) fn map_at_level(
        &mut self,
        mem: &mut TestMemory,
        va: u64,
        pa: u64,
        level: u32,
        flags: PteFlags,
    ) -> u64 {
        let addr = self.slot(mem, va, level);
        self.write(mem, addr, PageTableEntry::encode(pa >> 12, flags | PteFlags::V));
        addr
    }

    /// ORs `flags` into the pointer PTE at `level` on the path to `va`.
    pub(crate) fn set_pointer_flags(
        &mut self,
        mem: &mut TestMemory,
        va: u64,
        level: u32,
        flags: PteFlags,
    ) {
        let addr = self.slot(mem, va, level);
        let raw = self.read(mem, addr);
        self.write(mem, addr, raw | flags.bits());
    }
}
