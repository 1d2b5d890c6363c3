// Range partitioner - splits the account-id domain into contiguous sub-ranges
//
// Pure and deterministic: the same (min, max, count) always yields the same
// descriptors, and their union covers [min, max] exactly once.

use crate::error::{BatchError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inclusive account-id range handled by one unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDescriptor {
    pub index: usize,
    pub min_key: i64,
    pub max_key: i64,
}

impl PartitionDescriptor {
    /// Empty descriptor: covers no key, whatever the domain
    fn empty(index: usize) -> Self {
        Self {
            index,
            min_key: i64::MAX,
            max_key: i64::MIN,
        }
    }

    /// Leading partitions are empty when the span is smaller than the count
    pub fn is_empty(&self) -> bool {
        self.min_key > self.max_key
    }

    /// Number of keys covered; u128 because the full i64 domain has 2^64 keys
    pub fn len(&self) -> u128 {
        if self.is_empty() {
            0
        } else {
            u128::from(self.max_key.abs_diff(self.min_key)) + 1
        }
    }

    pub fn contains(&self, key: i64) -> bool {
        self.min_key <= key && key <= self.max_key
    }

    pub fn name(&self) -> String {
        format!("partition{}", self.index)
    }
}

impl fmt::Display for PartitionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}-{}]", self.name(), self.min_key, self.max_key)
    }
}

/// Split [min_key, max_key] into exactly `partition_count` descriptors.
///
/// Every partition gets `(max_key - min_key) / partition_count` keys; the last
/// one absorbs the remainder of the integer division and always ends at
/// `max_key`.
pub fn partition_range(
    min_key: i64,
    max_key: i64,
    partition_count: usize,
) -> Result<Vec<PartitionDescriptor>> {
    if partition_count == 0 {
        return Err(BatchError::Config("partition count must be at least 1".to_string()));
    }
    if min_key > max_key {
        return Err(BatchError::Config(format!(
            "min_key ({min_key}) must not exceed max_key ({max_key})"
        )));
    }

    // i128 keeps the arithmetic exact across the whole i64 domain
    let span = max_key as i128 - min_key as i128;
    let target_size = span / partition_count as i128;

    let mut partitions = Vec::with_capacity(partition_count);
    let mut start = min_key as i128;

    for index in 0..partition_count {
        let end = if index == partition_count - 1 {
            max_key as i128
        } else {
            start + target_size - 1
        };

        if end < start {
            partitions.push(PartitionDescriptor::empty(index));
            continue;
        }

        partitions.push(PartitionDescriptor {
            index,
            min_key: to_key(start)?,
            max_key: to_key(end)?,
        });

        start = end + 1;
    }

    Ok(partitions)
}

fn to_key(value: i128) -> Result<i64> {
    i64::try_from(value).map_err(|_| BatchError::Config(format!("partition bound {value} is outside the key domain")))
}
