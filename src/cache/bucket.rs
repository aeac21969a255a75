//! Bounded fan-out layout for the persistent store.
//!
//! Entries occupy numbered slots. Slot `s` lives in the leaf bucket named by
//! the base-`bucket_size` digits of `s / bucket_size`, as entry node
//! `e{s % bucket_size}`. Every bucket therefore holds at most `bucket_size`
//! children, whether it is an inner bucket or a leaf.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("bucket size must be at least 2, got {0}")]
    BucketSizeTooSmall(u32),
    #[error("layout capacity overflows with bucket size {bucket_size} and depth {depth}")]
    Overflow { bucket_size: u32, depth: u32 },
}

/// Shape of the bucket tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketLayout {
    bucket_size: u32,
    depth: u32,
}

impl BucketLayout {
    /// Layout sized for `expected_entries`.
    pub fn for_entries(bucket_size: u32, expected_entries: u64) -> Result<Self, LayoutError> {
        Self::with_depth(bucket_size, Self::depth_for(expected_entries, bucket_size))
    }

    pub fn with_depth(bucket_size: u32, depth: u32) -> Result<Self, LayoutError> {
        if bucket_size < 2 {
            return Err(LayoutError::BucketSizeTooSmall(bucket_size));
        }
        let depth = depth.max(1);
        let layout = Self { bucket_size, depth };
        if layout.checked_capacity().is_none() {
            return Err(LayoutError::Overflow { bucket_size, depth });
        }
        Ok(layout)
    }

    /// Number of ceiling divisions of `expected_entries` by `bucket_size`
    /// needed to reach a value no larger than `bucket_size`, at least 1.
    pub fn depth_for(expected_entries: u64, bucket_size: u32) -> u32 {
        let bucket_size = u64::from(bucket_size.max(2));
        let mut remaining = expected_entries;
        let mut depth = 0;
        while remaining > bucket_size {
            remaining = remaining.div_ceil(bucket_size);
            depth += 1;
        }
        depth.max(1)
    }

    pub fn bucket_size(&self) -> u32 {
        self.bucket_size
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Total number of entry slots.
    pub fn capacity(&self) -> u64 {
        self.checked_capacity().unwrap_or(u64::MAX)
    }

    fn checked_capacity(&self) -> Option<u64> {
        u64::from(self.bucket_size).checked_pow(self.depth + 1)
    }

    /// Bucket digits of the leaf holding `slot`.
    pub fn leaf_digits(&self, slot: u64) -> Vec<u32> {
        let base = u64::from(self.bucket_size);
        let mut leaf = slot / base;
        let mut digits = vec![0; self.depth as usize];
        for digit in digits.iter_mut().rev() {
            *digit = (leaf % base) as u32;
            leaf /= base;
        }
        digits
    }

    /// Path segments from the store root to the entry node for `slot`.
    pub fn slot_path(&self, slot: u64) -> Vec<String> {
        let mut segments: Vec<String> = self
            .leaf_digits(slot)
            .into_iter()
            .map(|digit| digit.to_string())
            .collect();
        segments.push(entry_name((slot % u64::from(self.bucket_size)) as u32));
        segments
    }

    /// Inverse of [`BucketLayout::slot_path`]. `None` for paths outside the layout.
    pub fn slot_of<S: AsRef<str>>(&self, segments: &[S]) -> Option<u64> {
        let (entry, buckets) = segments.split_last()?;
        if buckets.len() != self.depth as usize {
            return None;
        }
        let index = parse_entry_name(entry.as_ref())?;
        if index >= self.bucket_size {
            return None;
        }
        let base = u64::from(self.bucket_size);
        let mut leaf = 0u64;
        for bucket in buckets {
            let digit: u32 = bucket.as_ref().parse().ok()?;
            if digit >= self.bucket_size {
                return None;
            }
            leaf = leaf * base + u64::from(digit);
        }
        Some(leaf * base + u64::from(index))
    }

    /// Cursor positioned at the first free slot after `next_slot - 1`.
    pub fn cursor_at(&self, next_slot: u64) -> BucketCursor {
        let base = u64::from(self.bucket_size);
        BucketCursor {
            bucket_size: self.bucket_size,
            digits: self.leaf_digits(next_slot),
            filled: (next_slot % base) as u32,
            exhausted: next_slot >= self.capacity(),
        }
    }
}

impl fmt::Display for BucketLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}^{}", self.bucket_size, self.depth)
    }
}

pub fn entry_name(index: u32) -> String {
    format!("e{index}")
}

pub fn parse_entry_name(name: &str) -> Option<u32> {
    name.strip_prefix('e')?.parse().ok()
}

/// Position of the next fresh slot, as a digit vector naming the current
/// leaf bucket plus the number of entries already placed under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketCursor {
    bucket_size: u32,
    digits: Vec<u32>,
    filled: u32,
    exhausted: bool,
}

impl BucketCursor {
    pub fn digits(&self) -> &[u32] {
        &self.digits
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Slot number the cursor points at.
    pub fn slot(&self) -> u64 {
        let base = u64::from(self.bucket_size);
        let leaf = self
            .digits
            .iter()
            .fold(0u64, |acc, digit| acc * base + u64::from(*digit));
        leaf * base + u64::from(self.filled)
    }

    /// Record one entry under the current leaf. After the `bucket_size`-th
    /// entry the digit vector moves to the next leaf, carrying left.
    pub fn advance(&mut self) {
        if self.exhausted {
            return;
        }
        self.filled += 1;
        if self.filled < self.bucket_size {
            return;
        }
        self.filled = 0;

        let top = self.bucket_size - 1;
        match self.digits.iter().rposition(|digit| *digit < top) {
            Some(index) => {
                self.digits[index] += 1;
                for digit in &mut self.digits[index + 1..] {
                    *digit = 0;
                }
            }
            None => self.exhausted = true,
        }
    }
}
