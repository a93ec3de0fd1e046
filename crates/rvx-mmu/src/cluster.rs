//! Resources shared by every hart of a cluster.

use std::sync::{Arc, OnceLock};

use tracing::debug;

/// Memory-mapped control block aliased into every hart of a cluster.
#[derive(Debug, PartialEq, Eq)]
pub struct ControlBlock {
    pub base: u64,
    pub size: u64,
}

impl ControlBlock {
    #[inline]
    pub fn high(&self) -> u64 {
        self.base.saturating_add(self.size.saturating_sub(1))
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        (self.base..=self.high()).contains(&addr)
    }
}

#[derive(Debug, Default)]
pub struct Cluster {
    control: OnceLock<Arc<ControlBlock>>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cluster's control block, creating it on first use.
    ///
    /// Later calls return the existing block regardless of the arguments.
    pub fn control_block(&self, base: u64, size: u64) -> Arc<ControlBlock> {
        self.control
            .get_or_init(|| {
                debug!(base, size, "creating cluster control block");
                Arc::new(ControlBlock { base, size })
            })
            .clone()
    }

    pub fn existing_control_block(&self) -> Option<Arc<ControlBlock>> {
        self.control.get().cloned()
    }
}
