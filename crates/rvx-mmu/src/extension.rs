use std::fmt;

use crate::csr::TranslationStage;
use crate::pmp::{Requester, UnitKind};
use crate::pte::{PageTableEntry, Priv};
use crate::AccessType;

/// PMA domain an access is checked in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PmaDomain {
    Data,
    /// Instruction fetches, when the hart keeps a separate code domain.
    Code,
}

/// Optional capability hooks a hart can plug into its MMU.
///
/// Every method has a permissive default, so an extension only overrides the hooks it cares
/// about. Registered extensions are consulted in registration order and the first rejection
/// wins.
pub trait MmuExtension: fmt::Debug {
    /// Replaces the permission a protection region (or the no-match default, `region = None`)
    /// grants. The result is cached per physical domain until the unit is reprogrammed, so it
    /// must depend only on its arguments.
    fn pmp_priv_override(
        &self,
        unit: UnitKind,
        region: Option<usize>,
        requester: Requester,
        priv_: Priv,
    ) -> Priv {
        let _ = (unit, region, requester);
        priv_
    }

    /// Decides whether a PMA window is accessible. Called once per window on first touch.
    fn pma_enable(&self, domain: PmaDomain, low: u64, high: u64) -> bool {
        let _ = (domain, low, high);
        true
    }

    /// Per-access attribute check, run after the window is established.
    fn pma_check(&self, domain: PmaDomain, low: u64, high: u64, access: AccessType) -> bool {
        let _ = (domain, low, high, access);
        true
    }

    /// Extra validation of a leaf PTE found at `level`.
    fn validate_pte(&self, stage: TranslationStage, pte: &PageTableEntry, level: u32) -> bool {
        let _ = (stage, pte, level);
        true
    }
}
