#![allow(dead_code)]

use rvx_mmu::{BusError, MemoryBus, PageTableEntry, PteFlags};

pub const RWX_AD: PteFlags = PteFlags::R
    .union(PteFlags::W)
    .union(PteFlags::X)
    .union(PteFlags::A)
    .union(PteFlags::D);

/// Routes the crate's `tracing` output to the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Flat little-endian RAM. Accesses past the end fail.
#[derive(Clone, Debug)]
pub struct Ram {
    pub data: Vec<u8>,
    pub reads: usize,
}

impl Ram {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            reads: 0,
        }
    }

    pub fn write_u64_raw(&mut self, paddr: u64, value: u64) {
        let off = paddr as usize;
        self.data[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_u64_raw(&self, paddr: u64) -> u64 {
        let off = paddr as usize;
        u64::from_le_bytes(self.data[off..off + 8].try_into().unwrap())
    }
}

impl MemoryBus for Ram {
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) -> Result<(), BusError> {
        self.reads += 1;
        let off = paddr as usize;
        let src = self
            .data
            .get(off..off + dst.len())
            .ok_or(BusError { addr: paddr })?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn write_bytes(&mut self, paddr: u64, src: &[u8]) -> Result<(), BusError> {
        let off = paddr as usize;
        let dst = self
            .data
            .get_mut(off..off + src.len())
            .ok_or(BusError { addr: paddr })?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

/// 64-bit page-table builder.
///
/// Table addresses are in the translated-from space of the next stage: `offset` is added when
/// writing to RAM, so VS-stage tables can be laid out in guest-physical memory that the G-stage
/// maps at `gpa + offset`.
#[derive(Clone, Debug)]
pub struct Tables {
    pub root: u64,
    next: u64,
    mode: u64,
    levels: u32,
    root_extra_bits: u32,
    offset: u64,
}

impl Tables {
    pub fn sv39(root: u64) -> Self {
        Self::with_shape(root, 8, 3, 0)
    }

    pub fn sv48(root: u64) -> Self {
        Self::with_shape(root, 9, 4, 0)
    }

    /// G-stage Sv39x4 with its 16 KiB root.
    pub fn sv39x4(root: u64) -> Self {
        Self::with_shape(root, 8, 3, 2)
    }

    fn with_shape(root: u64, mode: u64, levels: u32, root_extra_bits: u32) -> Self {
        Self {
            root,
            next: root + (0x1000 << root_extra_bits),
            mode,
            levels,
            root_extra_bits,
            offset: 0,
        }
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn satp(&self, id: u16) -> u64 {
        (self.mode << 60) | (u64::from(id) << 44) | (self.root >> 12)
    }

    fn vpn(&self, va: u64, level: u32) -> u64 {
        let bits = if level + 1 == self.levels {
            9 + self.root_extra_bits
        } else {
            9
        };
        (va >> (12 + level * 9)) & ((1 << bits) - 1)
    }

    fn slot(&mut self, ram: &mut Ram, va: u64, level: u32) -> u64 {
        let mut table = self.root;
        let mut l = self.levels - 1;
        while l > level {
            let addr = table + self.vpn(va, l) * 8;
            let raw = ram.read_u64_raw(addr + self.offset);
            table = if raw & PteFlags::V.bits() != 0 {
                (raw >> 10) << 12
            } else {
                let next = self.next;
                self.next += 0x1000;
                ram.write_u64_raw(
                    addr + self.offset,
                    PageTableEntry::encode(next >> 12, PteFlags::V),
                );
                next
            };
            l -= 1;
        }
        table + self.vpn(va, level) * 8
    }

    /// Maps `va` to `pa` with a leaf at `level` (0 = 4 KiB) and returns the PTE's table address.
    pub fn map_at_level(&mut self, ram: &mut Ram, va: u64, pa: u64, level: u32, flags: PteFlags) -> u64 {
        let addr = self.slot(ram, va, level);
        ram.write_u64_raw(
            addr + self.offset,
            PageTableEntry::encode(pa >> 12, flags | PteFlags::V),
        );
        addr
    }

    pub fn map(&mut self, ram: &mut Ram, va: u64, pa: u64, flags: PteFlags) -> u64 {
        self.map_at_level(ram, va, pa, 0, flags)
    }
}
