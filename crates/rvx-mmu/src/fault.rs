//! Fault classification.
//!
//! Every internal failure is a [`Fault`]: a [`FaultKind`] plus the place it was detected. The
//! guest-visible exception is a pure function of that pair and the original access type, looked
//! up in [`EXCEPTION_TABLE`].

use thiserror::Error;

use crate::csr::TranslationStage;
use crate::AccessType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FaultKind {
    #[error("malformed page-table entry")]
    MalformedPageTableEntry,
    #[error("access not permitted by page-table entry")]
    PrivilegeDenied,
    #[error("accessed or dirty bit clear")]
    AccessedOrDirtyBitMissing,
    #[error("misaligned superpage")]
    SuperpageMisaligned,
    #[error("access straddles protection regions")]
    StraddledProtectionRegions,
    #[error("backing store access failed")]
    BackingStoreAccessFault,
    #[error("guest-physical address exceeds the stage-2 address width")]
    GuestAddressExtensionInvalid,
    #[error("rejected by an extension capability")]
    CustomValidationRejected,
    #[error("non-canonical virtual address")]
    NonCanonicalAddress,
    #[error("denied by physical memory protection")]
    PmpDenied,
    #[error("denied by memory protection unit")]
    MpuDenied,
}

/// Where a fault was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultSite {
    /// While translating through the tables of a stage.
    Translation(TranslationStage),
    /// While checking or accessing a physical address (PMP, PMA, bus).
    Physical,
    /// While checking the MPU.
    Mpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub site: FaultSite,
    /// Faulting guest-physical address, for stage-2 faults.
    pub gpa: Option<u64>,
}

impl Fault {
    #[inline]
    pub(crate) fn physical(kind: FaultKind) -> Self {
        Self {
            kind,
            site: FaultSite::Physical,
            gpa: None,
        }
    }

    #[inline]
    pub(crate) fn translation(kind: FaultKind, stage: TranslationStage, gpa: Option<u64>) -> Self {
        Self {
            kind,
            site: FaultSite::Translation(stage),
            gpa,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Family {
    Access = 0,
    Page = 1,
    GuestPage = 2,
    Mpu = 3,
}

/// Guest-visible exceptions the MMU can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exception {
    InstructionAccessFault,
    LoadAccessFault,
    StoreAccessFault,
    InstructionPageFault,
    LoadPageFault,
    StorePageFault,
    InstructionGuestPageFault,
    LoadGuestPageFault,
    StoreGuestPageFault,
    InstructionMpuFault,
    LoadMpuFault,
    StoreMpuFault,
}

impl Exception {
    /// Architectural `mcause` code. The MPU family lives in the custom range.
    pub const fn code(self) -> u64 {
        match self {
            Exception::InstructionAccessFault => 1,
            Exception::LoadAccessFault => 5,
            Exception::StoreAccessFault => 7,
            Exception::InstructionPageFault => 12,
            Exception::LoadPageFault => 13,
            Exception::StorePageFault => 15,
            Exception::InstructionGuestPageFault => 20,
            Exception::LoadGuestPageFault => 21,
            Exception::StoreGuestPageFault => 23,
            Exception::InstructionMpuFault => 24,
            Exception::LoadMpuFault => 25,
            Exception::StoreMpuFault => 26,
        }
    }
}

/// `EXCEPTION_TABLE[family][access]`, with access ordered read, write, execute.
pub const EXCEPTION_TABLE: [[Exception; 3]; 4] = [
    [
        Exception::LoadAccessFault,
        Exception::StoreAccessFault,
        Exception::InstructionAccessFault,
    ],
    [
        Exception::LoadPageFault,
        Exception::StorePageFault,
        Exception::InstructionPageFault,
    ],
    [
        Exception::LoadGuestPageFault,
        Exception::StoreGuestPageFault,
        Exception::InstructionGuestPageFault,
    ],
    [
        Exception::LoadMpuFault,
        Exception::StoreMpuFault,
        Exception::InstructionMpuFault,
    ],
];

/// Which exception family a fault belongs to.
pub fn family(kind: FaultKind, site: FaultSite) -> Family {
    match (kind, site) {
        // A failed PTE fetch is reported as an access fault of the original access.
        (FaultKind::BackingStoreAccessFault | FaultKind::PmpDenied, _) => Family::Access,
        (FaultKind::MpuDenied, _) | (_, FaultSite::Mpu) => Family::Mpu,
        (FaultKind::GuestAddressExtensionInvalid, _) => Family::GuestPage,
        (_, FaultSite::Physical) => Family::Access,
        (_, FaultSite::Translation(TranslationStage::GuestStage2)) => Family::GuestPage,
        (_, FaultSite::Translation(_)) => Family::Page,
    }
}

pub fn classify(fault: &Fault, access: AccessType) -> Exception {
    EXCEPTION_TABLE[family(fault.kind, fault.site) as usize][access.index()]
}

/// A classified fault, ready for the exception subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{exception:?} at {tval:#x}: {kind}")]
pub struct Trap {
    pub exception: Exception,
    /// Faulting virtual address (`xtval`).
    pub tval: u64,
    /// Faulting guest-physical address for guest-page faults.
    pub gpa: Option<u64>,
    pub kind: FaultKind,
}

impl Trap {
    /// Value for `htval`/`mtval2`: the guest-physical address shifted right by two.
    #[inline]
    pub fn htval(&self) -> u64 {
        self.gpa.map_or(0, |gpa| gpa >> 2)
    }

    #[inline]
    pub fn code(&self) -> u64 {
        self.exception.code()
    }
}
