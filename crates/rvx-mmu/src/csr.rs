//! Read-only views of the architectural state the MMU consumes.
//!
//! The CPU-state subsystem owns the real CSRs; the MMU keeps decoded copies of the fields it
//! needs (`satp`, `vsatp`, `hgatp` and a handful of `mstatus`/`vsstatus` bits). Register layouts
//! differ between RV32 and RV64, so every decoder is tagged with an explicit [`Xlen`] instead of
//! relying on overlapping bitfields.

use crate::pte::VmMode;

/// Register width of the simulated hart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Xlen {
    Rv32,
    Rv64,
}

impl Xlen {
    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            Xlen::Rv32 => 32,
            Xlen::Rv64 => 64,
        }
    }

    /// Mask applied to untranslated (bare-mode) addresses.
    #[inline]
    pub const fn addr_mask(self) -> u64 {
        match self {
            Xlen::Rv32 => 0xffff_ffff,
            Xlen::Rv64 => u64::MAX,
        }
    }
}

/// Privilege mode of an access, including the virtualized (V=1) modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PrivilegeMode {
    User = 0,
    Supervisor = 1,
    Machine = 2,
    VirtualUser = 3,
    VirtualSupervisor = 4,
}

impl PrivilegeMode {
    pub const ALL: [PrivilegeMode; 5] = [
        PrivilegeMode::User,
        PrivilegeMode::Supervisor,
        PrivilegeMode::Machine,
        PrivilegeMode::VirtualUser,
        PrivilegeMode::VirtualSupervisor,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Bit used in per-entry "mapped in mode" masks.
    #[inline]
    pub const fn bit(self) -> u8 {
        1 << (self as u8)
    }

    #[inline]
    pub const fn is_virtual(self) -> bool {
        matches!(
            self,
            PrivilegeMode::VirtualUser | PrivilegeMode::VirtualSupervisor
        )
    }

    #[inline]
    pub const fn is_machine(self) -> bool {
        matches!(self, PrivilegeMode::Machine)
    }

    /// U-mode or VU-mode.
    #[inline]
    pub const fn is_user(self) -> bool {
        matches!(self, PrivilegeMode::User | PrivilegeMode::VirtualUser)
    }

    /// Decode the (MPP, MPV) pair used by `mstatus.MPRV`.
    pub fn from_mpp(mpp: u8, mpv: bool) -> Self {
        match (mpp & 0b11, mpv) {
            (0, false) => PrivilegeMode::User,
            (1, false) => PrivilegeMode::Supervisor,
            (0, true) => PrivilegeMode::VirtualUser,
            (1, true) => PrivilegeMode::VirtualSupervisor,
            _ => PrivilegeMode::Machine,
        }
    }
}

/// Which translation stage a table walk, TLB or fault belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TranslationStage {
    /// Single-stage translation through `satp` (HS/S/U modes).
    NonVirtual = 0,
    /// VS-stage translation through `vsatp` (VS/VU modes).
    GuestStage1 = 1,
    /// G-stage translation through `hgatp`.
    GuestStage2 = 2,
}

impl TranslationStage {
    pub const ALL: [TranslationStage; 3] = [
        TranslationStage::NonVirtual,
        TranslationStage::GuestStage1,
        TranslationStage::GuestStage2,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub(crate) fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }
}

/// Decoded `satp`/`vsatp`/`hgatp`.
///
/// `id` holds the ASID for `satp`/`vsatp` and the VMID for `hgatp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RootRegister {
    pub mode: VmMode,
    pub id: u16,
    pub ppn: u64,
}

const SATP64_MODE_SHIFT: u32 = 60;
const SATP64_ASID_SHIFT: u32 = 44;
const SATP64_PPN_MASK: u64 = (1 << 44) - 1;
const HGATP64_VMID_MASK: u64 = (1 << 14) - 1;

const SATP32_MODE_BIT: u64 = 1 << 31;
const SATP32_ASID_SHIFT: u32 = 22;
const SATP32_ASID_MASK: u64 = (1 << 9) - 1;
const HGATP32_VMID_MASK: u64 = (1 << 7) - 1;
const SATP32_PPN_MASK: u64 = (1 << 22) - 1;

impl RootRegister {
    /// Decode `satp`/`vsatp`. Returns `None` for reserved MODE encodings.
    pub fn decode_satp(xlen: Xlen, raw: u64) -> Option<Self> {
        match xlen {
            Xlen::Rv32 => {
                let mode = if raw & SATP32_MODE_BIT != 0 {
                    VmMode::Sv32
                } else {
                    VmMode::Bare
                };
                Some(Self {
                    mode,
                    id: ((raw >> SATP32_ASID_SHIFT) & SATP32_ASID_MASK) as u16,
                    ppn: raw & SATP32_PPN_MASK,
                })
            }
            Xlen::Rv64 => {
                let mode = match raw >> SATP64_MODE_SHIFT {
                    0 => VmMode::Bare,
                    8 => VmMode::Sv39,
                    9 => VmMode::Sv48,
                    10 => VmMode::Sv57,
                    _ => return None,
                };
                Some(Self {
                    mode,
                    id: ((raw >> SATP64_ASID_SHIFT) & 0xffff) as u16,
                    ppn: raw & SATP64_PPN_MASK,
                })
            }
        }
    }

    /// Decode `hgatp`. The x4 modes share the encodings of their single-stage counterparts.
    pub fn decode_hgatp(xlen: Xlen, raw: u64) -> Option<Self> {
        match xlen {
            Xlen::Rv32 => {
                let mode = if raw & SATP32_MODE_BIT != 0 {
                    VmMode::Sv32
                } else {
                    VmMode::Bare
                };
                Some(Self {
                    mode,
                    id: ((raw >> SATP32_ASID_SHIFT) & HGATP32_VMID_MASK) as u16,
                    ppn: raw & SATP32_PPN_MASK & !0b11,
                })
            }
            Xlen::Rv64 => {
                let mode = match raw >> SATP64_MODE_SHIFT {
                    0 => VmMode::Bare,
                    8 => VmMode::Sv39,
                    9 => VmMode::Sv48,
                    10 => VmMode::Sv57,
                    _ => return None,
                };
                Some(Self {
                    mode,
                    id: ((raw >> SATP64_ASID_SHIFT) & HGATP64_VMID_MASK) as u16,
                    ppn: raw & SATP64_PPN_MASK & !0b11,
                })
            }
        }
    }

    pub fn encode_satp(&self, xlen: Xlen) -> u64 {
        match xlen {
            Xlen::Rv32 => {
                let mode = if self.mode == VmMode::Bare {
                    0
                } else {
                    SATP32_MODE_BIT
                };
                mode | ((self.id as u64 & SATP32_ASID_MASK) << SATP32_ASID_SHIFT)
                    | (self.ppn & SATP32_PPN_MASK)
            }
            Xlen::Rv64 => {
                (self.mode.satp_encoding() << SATP64_MODE_SHIFT)
                    | ((self.id as u64) << SATP64_ASID_SHIFT)
                    | (self.ppn & SATP64_PPN_MASK)
            }
        }
    }

    pub fn encode_hgatp(&self, xlen: Xlen) -> u64 {
        match xlen {
            Xlen::Rv32 => {
                let mode = if self.mode == VmMode::Bare {
                    0
                } else {
                    SATP32_MODE_BIT
                };
                mode | ((self.id as u64 & HGATP32_VMID_MASK) << SATP32_ASID_SHIFT)
                    | (self.ppn & SATP32_PPN_MASK)
            }
            Xlen::Rv64 => {
                (self.mode.satp_encoding() << SATP64_MODE_SHIFT)
                    | ((self.id as u64 & HGATP64_VMID_MASK) << SATP64_ASID_SHIFT)
                    | (self.ppn & SATP64_PPN_MASK)
            }
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.mode != VmMode::Bare
    }

    /// Physical (or guest-physical) address of the root table.
    #[inline]
    pub fn root_addr(&self) -> u64 {
        self.ppn << 12
    }
}

/// The status bits that influence translation.
///
/// On `PrivVersion::V1_9` harts the `sum` field carries the inverted PUM bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusFlags {
    /// `mstatus.MXR`
    pub mxr: bool,
    /// `mstatus.SUM` (or PUM)
    pub sum: bool,
    /// `mstatus.MPRV`
    pub mprv: bool,
    /// `mstatus.MPP`
    pub mpp: u8,
    /// `mstatus.MPV`
    pub mpv: bool,
    /// `vsstatus.MXR`
    pub vs_mxr: bool,
    /// `vsstatus.SUM`
    pub vs_sum: bool,
}

/// Composite translation-context key.
///
/// Layout (bit ranges of the packed `u64`):
/// - `[15:0]` ASID from `satp`
/// - `[31:16]` ASID from `vsatp`
/// - `[47:32]` VMID from `hgatp`
/// - `48` MXR, `49` SUM, `50` vsstatus.MXR, `51` vsstatus.SUM
/// - `52` VS-stage enabled, `53` G-stage enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SimAsid(u64);

const SIM_ASID_SHIFT: u32 = 0;
const SIM_VS_ASID_SHIFT: u32 = 16;
const SIM_VMID_SHIFT: u32 = 32;
const SIM_MXR: u64 = 1 << 48;
const SIM_SUM: u64 = 1 << 49;
const SIM_VMXR: u64 = 1 << 50;
const SIM_VSUM: u64 = 1 << 51;
const SIM_S1: u64 = 1 << 52;
const SIM_S2: u64 = 1 << 53;

const SIM_ASID_FIELD: u64 = 0xffff << SIM_ASID_SHIFT;
const SIM_VS_ASID_FIELD: u64 = 0xffff << SIM_VS_ASID_SHIFT;
const SIM_VMID_FIELD: u64 = 0xffff << SIM_VMID_SHIFT;

/// Unpacked form of [`SimAsid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimAsidFields {
    pub asid: u16,
    pub vs_asid: u16,
    pub vmid: u16,
    pub mxr: bool,
    pub sum: bool,
    pub vs_mxr: bool,
    pub vs_sum: bool,
    pub stage1: bool,
    pub stage2: bool,
}

impl SimAsid {
    pub fn new(f: SimAsidFields) -> Self {
        let mut raw = ((f.asid as u64) << SIM_ASID_SHIFT)
            | ((f.vs_asid as u64) << SIM_VS_ASID_SHIFT)
            | ((f.vmid as u64) << SIM_VMID_SHIFT);
        for (set, bit) in [
            (f.mxr, SIM_MXR),
            (f.sum, SIM_SUM),
            (f.vs_mxr, SIM_VMXR),
            (f.vs_sum, SIM_VSUM),
            (f.stage1, SIM_S1),
            (f.stage2, SIM_S2),
        ] {
            if set {
                raw |= bit;
            }
        }
        Self(raw)
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn asid(self) -> u16 {
        (self.0 >> SIM_ASID_SHIFT) as u16
    }

    #[inline]
    pub const fn vs_asid(self) -> u16 {
        (self.0 >> SIM_VS_ASID_SHIFT) as u16
    }

    #[inline]
    pub const fn vmid(self) -> u16 {
        (self.0 >> SIM_VMID_SHIFT) as u16
    }

    /// Fields that must match for an entry created at `stage` to be reused.
    ///
    /// Global entries drop the address-space identifier of their own stage.
    pub const fn mask(stage: TranslationStage, global: bool) -> u64 {
        match stage {
            TranslationStage::NonVirtual => {
                let asid = if global { 0 } else { SIM_ASID_FIELD };
                asid | SIM_MXR | SIM_SUM
            }
            TranslationStage::GuestStage1 => {
                let asid = if global { 0 } else { SIM_VS_ASID_FIELD };
                asid | SIM_VMID_FIELD | SIM_MXR | SIM_VMXR | SIM_VSUM | SIM_S1 | SIM_S2
            }
            TranslationStage::GuestStage2 => SIM_VMID_FIELD | SIM_MXR | SIM_S1 | SIM_S2,
        }
    }

    /// Returns `true` when `self` agrees with `other` on every bit selected by `mask`.
    #[inline]
    pub const fn matches(self, other: SimAsid, mask: u64) -> bool {
        (self.0 ^ other.0) & mask == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satp_rv64_round_trips_through_decode() {
        let raw = (8u64 << 60) | (0x1234u64 << 44) | 0x8_0000;
        let satp = RootRegister::decode_satp(Xlen::Rv64, raw).unwrap();
        assert_eq!(satp.mode, VmMode::Sv39);
        assert_eq!(satp.id, 0x1234);
        assert_eq!(satp.ppn, 0x8_0000);
        assert_eq!(satp.encode_satp(Xlen::Rv64), raw);
    }

    #[test]
    fn satp_rv64_reserved_mode_is_rejected() {
        assert_eq!(RootRegister::decode_satp(Xlen::Rv64, 1u64 << 60), None);
    }

    #[test]
    fn satp_rv32_fields() {
        let raw = (1u64 << 31) | (0x1ffu64 << 22) | 0x3f_ffff;
        let satp = RootRegister::decode_satp(Xlen::Rv32, raw).unwrap();
        assert_eq!(satp.mode, VmMode::Sv32);
        assert_eq!(satp.id, 0x1ff);
        assert_eq!(satp.ppn, 0x3f_ffff);
    }

    #[test]
    fn hgatp_root_is_16k_aligned() {
        let raw = (8u64 << 60) | (5u64 << 44) | 0x103;
        let hgatp = RootRegister::decode_hgatp(Xlen::Rv64, raw).unwrap();
        assert_eq!(hgatp.id, 5);
        assert_eq!(hgatp.ppn, 0x100);
    }

    #[test]
    fn global_mask_ignores_asid_only() {
        let a = SimAsid::new(SimAsidFields {
            asid: 1,
            ..Default::default()
        });
        let b = SimAsid::new(SimAsidFields {
            asid: 2,
            ..Default::default()
        });
        let stage = TranslationStage::NonVirtual;
        assert!(!a.matches(b, SimAsid::mask(stage, false)));
        assert!(a.matches(b, SimAsid::mask(stage, true)));

        let c = SimAsid::new(SimAsidFields {
            asid: 2,
            mxr: true,
            ..Default::default()
        });
        assert!(!a.matches(c, SimAsid::mask(stage, true)));
    }

    #[test]
    fn mprv_mode_decoding() {
        assert_eq!(PrivilegeMode::from_mpp(0, false), PrivilegeMode::User);
        assert_eq!(
            PrivilegeMode::from_mpp(1, true),
            PrivilegeMode::VirtualSupervisor
        );
        assert_eq!(PrivilegeMode::from_mpp(3, true), PrivilegeMode::Machine);
    }
}
