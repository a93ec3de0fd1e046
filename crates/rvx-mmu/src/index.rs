use std::collections::{BTreeMap, HashMap};

#[inline]
pub(crate) fn align_down(addr: u64, size_log2: u8) -> u64 {
    if size_log2 >= 64 {
        0
    } else {
        addr & !((1u64 << size_log2) - 1)
    }
}

/// Naturally aligned power-of-two ranges bucketed by size.
///
/// A lookup probes one hash bucket per size class that is present, largest first, so the cost
/// scales with the number of distinct page sizes in use rather than the number of entries.
#[derive(Debug, Clone)]
pub(crate) struct SizeClassIndex<T> {
    classes: BTreeMap<u8, HashMap<u64, Vec<T>>>,
    len: usize,
}

impl<T> Default for SizeClassIndex<T> {
    fn default() -> Self {
        Self {
            classes: BTreeMap::new(),
            len: 0,
        }
    }
}

impl<T: Clone + PartialEq> SizeClassIndex<T> {
    pub(crate) fn insert(&mut self, low: u64, size_log2: u8, value: T) {
        self.classes
            .entry(size_log2)
            .or_default()
            .entry(align_down(low, size_log2))
            .or_default()
            .push(value);
        self.len += 1;
    }

    /// Removes every value in the bucket `(low, size_log2)` for which `pred` holds.
    pub(crate) fn remove_where(
        &mut self,
        low: u64,
        size_log2: u8,
        mut pred: impl FnMut(&T) -> bool,
    ) -> Vec<T> {
        let mut removed = Vec::new();
        let Some(class) = self.classes.get_mut(&size_log2) else {
            return removed;
        };
        let low = align_down(low, size_log2);
        if let Some(bucket) = class.get_mut(&low) {
            let mut i = 0;
            while i < bucket.len() {
                if pred(&bucket[i]) {
                    removed.push(bucket.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            if bucket.is_empty() {
                class.remove(&low);
            }
        }
        if class.is_empty() {
            self.classes.remove(&size_log2);
        }
        self.len -= removed.len();
        removed
    }

    pub(crate) fn remove(&mut self, low: u64, size_log2: u8, value: &T) -> bool {
        let mut found = false;
        let removed = self.remove_where(low, size_log2, |v| {
            if !found && v == value {
                found = true;
                true
            } else {
                false
            }
        });
        !removed.is_empty()
    }

    /// Values whose range contains `addr`, largest ranges first.
    pub(crate) fn candidates(&self, addr: u64) -> impl Iterator<Item = &T> + '_ {
        self.classes.iter().rev().flat_map(move |(&size_log2, class)| {
            class
                .get(&align_down(addr, size_log2))
                .into_iter()
                .flat_map(|bucket| bucket.iter())
        })
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.classes
            .values()
            .flat_map(|class| class.values().flat_map(|bucket| bucket.iter()))
    }

    pub(crate) fn clear(&mut self) {
        self.classes.clear();
        self.len = 0;
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }
}
