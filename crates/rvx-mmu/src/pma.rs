//! Lazily established physical-memory-attribute windows.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::extension::{MmuExtension, PmaDomain};
use crate::fault::{Fault, FaultKind};
use crate::AccessType;

#[derive(Debug, Clone)]
pub struct PmaLayer {
    window_bits: u32,
    data: HashMap<u64, bool>,
    code: Option<HashMap<u64, bool>>,
    /// Ranges whose windows are always enabled (cluster control blocks).
    pinned: Vec<(u64, u64)>,
}

impl PmaLayer {
    pub fn new(window_bits: u32, split_code_domain: bool) -> Self {
        Self {
            window_bits,
            data: HashMap::new(),
            code: split_code_domain.then(HashMap::new),
            pinned: Vec::new(),
        }
    }

    #[inline]
    pub fn window_bits(&self) -> u32 {
        self.window_bits
    }

    /// Number of windows established so far in `domain`.
    pub fn established(&self, domain: PmaDomain) -> usize {
        match (domain, &self.code) {
            (PmaDomain::Code, Some(code)) => code.len(),
            _ => self.data.len(),
        }
    }

    /// Domains an access is checked in: always the data domain, plus the code domain when split.
    pub fn domains(&self) -> &'static [PmaDomain] {
        if self.code.is_some() {
            &[PmaDomain::Data, PmaDomain::Code]
        } else {
            &[PmaDomain::Data]
        }
    }

    pub fn pin(&mut self, low: u64, high: u64) {
        self.pinned.push((low, high));
        self.flush();
    }

    /// Ensures the windows covering `[low, high]` are established and runs the per-access checks,
    /// in every domain the access belongs to.
    pub fn ensure(
        &mut self,
        low: u64,
        high: u64,
        access: AccessType,
        extensions: &[Box<dyn MmuExtension>],
    ) -> Result<(), Fault> {
        for &domain in self.domains() {
            self.ensure_windows(domain, low, high, extensions)?;
            if extensions
                .iter()
                .any(|ext| !ext.pma_check(domain, low, high, access))
            {
                debug!(?domain, low, high, ?access, "PMA check rejected access");
                return Err(Fault::physical(FaultKind::CustomValidationRejected));
            }
        }
        Ok(())
    }

    fn ensure_windows(
        &mut self,
        domain: PmaDomain,
        low: u64,
        high: u64,
        extensions: &[Box<dyn MmuExtension>],
    ) -> Result<(), Fault> {
        let bits = self.window_bits;
        let pinned = &self.pinned;
        let windows = match (domain, self.code.as_mut()) {
            (PmaDomain::Code, Some(code)) => code,
            _ => &mut self.data,
        };

        let mut window = low >> bits;
        let last = high >> bits;
        loop {
            let enabled = *windows.entry(window).or_insert_with(|| {
                let w_low = window << bits;
                let w_high = w_low | ((1u64 << bits) - 1);
                let forced = pinned.iter().any(|&(lo, hi)| lo <= w_high && w_low <= hi);
                let enabled =
                    forced || extensions.iter().all(|ext| ext.pma_enable(domain, w_low, w_high));
                trace!(?domain, low = w_low, high = w_high, enabled, "PMA window established");
                enabled
            });
            if !enabled {
                debug!(?domain, low, high, "access to disabled PMA window");
                return Err(Fault::physical(FaultKind::CustomValidationRejected));
            }
            if window == last {
                break;
            }
            window += 1;
        }
        Ok(())
    }

    pub fn flush(&mut self) {
        self.data.clear();
        if let Some(code) = &mut self.code {
            code.clear();
        }
    }
}
