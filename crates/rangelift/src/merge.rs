//! Range-merge planner.
//!
//! A backup of many small tables produces far more file ranges than the
//! cluster needs regions. Merging adjacent ranges up to one region's size
//! and key budgets cuts the number of split and scatter round-trips
//! proportionally. Merging never crosses a table boundary, so the per-table
//! rewrite rules keep applying to whole ranges.

use std::collections::BTreeMap;

use crate::codec;
use crate::errors::{Error, Result};
use crate::manifest::BackupFile;

/// A contiguous slice of the target keyspace with the backup files that
/// materialize it. Constructed only when its files fit one region's budget;
/// immutable once planning finishes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergedRange {
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub files: Vec<BackupFile>,
}

impl MergedRange {
    /// Aggregate byte and key totals across this range's files.
    pub fn bytes_and_keys(&self) -> (u64, u64) {
        self.files.iter().fold((0, 0), |(bytes, keys), f| {
            (bytes + f.total_bytes, keys + f.total_kvs)
        })
    }
}

/// Statistics of one planning run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub total_files: usize,
    pub total_write_cf_files: usize,
    pub total_default_cf_files: usize,
    /// Regions the backup would need without merging (= write-cf files).
    pub total_regions: usize,
    pub region_keys_avg: u64,
    pub region_bytes_avg: u64,
    pub merged_regions: usize,
    pub merged_region_keys_avg: u64,
    pub merged_region_bytes_avg: u64,
}

/// Merge the backup's file ranges into the minimum number of ranges that
/// respect the per-region `split_size_bytes` and `split_key_count` budgets.
///
/// Files sharing a start key (the write/default cf pair of one region) form
/// one range. Overlapping or duplicated ranges mean the backup metadata is
/// corrupt and fail the whole plan.
pub fn merge_file_ranges(
    files: &[BackupFile],
    split_size_bytes: u64,
    split_key_count: u64,
) -> Result<(Vec<MergedRange>, MergeStats)> {
    if files.is_empty() {
        return Ok((Vec::new(), MergeStats::default()));
    }

    let mut stats = MergeStats {
        total_files: files.len(),
        ..Default::default()
    };
    let mut total_bytes = 0u64;
    let mut total_kvs = 0u64;

    let mut files_by_start: BTreeMap<&[u8], Vec<&BackupFile>> = BTreeMap::new();
    for file in files {
        files_by_start
            .entry(file.start_key.as_slice())
            .or_default()
            .push(file);
        if file.is_write_cf() {
            stats.total_write_cf_files += 1;
        } else {
            stats.total_default_cf_files += 1;
        }
        total_bytes += file.total_bytes;
        total_kvs += file.total_kvs;
    }

    let mut tree = RangeTree::default();
    for group in files_by_start.values() {
        let first = group[0];
        let end_key = if first.end_key.is_empty() {
            // A file without an end extends to its table's upper bound.
            let table_id = codec::decode_table_id(&first.start_key)?;
            codec::table_prefix(table_id + 1)
        } else {
            first.end_key.clone()
        };
        tree.insert(MergedRange {
            start_key: first.start_key.clone(),
            end_key,
            files: group.iter().map(|f| (*f).clone()).collect(),
        })?;
    }

    let mut merged: Vec<MergedRange> = Vec::with_capacity(tree.len());
    for range in tree.into_sorted() {
        match merged.last_mut() {
            Some(last) if can_merge(last, &range, split_size_bytes, split_key_count)? => {
                last.end_key = range.end_key;
                last.files.extend(range.files);
            }
            _ => merged.push(range),
        }
    }

    stats.total_regions = stats.total_write_cf_files;
    stats.merged_regions = merged.len();
    if stats.total_write_cf_files > 0 {
        stats.region_bytes_avg = total_bytes / stats.total_write_cf_files as u64;
        stats.region_keys_avg = total_kvs / stats.total_write_cf_files as u64;
    }
    stats.merged_region_bytes_avg = total_bytes / merged.len() as u64;
    stats.merged_region_keys_avg = total_kvs / merged.len() as u64;

    tracing::debug!(
        total_files = stats.total_files,
        regions = stats.total_regions,
        merged_regions = stats.merged_regions,
        "merged backup file ranges"
    );
    Ok((merged, stats))
}

fn can_merge(
    left: &MergedRange,
    right: &MergedRange,
    split_size_bytes: u64,
    split_key_count: u64,
) -> Result<bool> {
    let (left_bytes, left_keys) = left.bytes_and_keys();
    let (right_bytes, right_keys) = right.bytes_and_keys();
    if right_bytes == 0 {
        return Ok(true);
    }
    if left_bytes + right_bytes > split_size_bytes {
        return Ok(false);
    }
    if left_keys + right_keys > split_key_count {
        return Ok(false);
    }
    // Never merge across a table boundary, even when the budgets allow it.
    Ok(codec::decode_table_id(&left.start_key)? == codec::decode_table_id(&right.start_key)?)
}

/// Start-key ordered interval map that rejects overlap on insert.
#[derive(Default)]
struct RangeTree {
    ranges: BTreeMap<Vec<u8>, MergedRange>,
}

impl RangeTree {
    fn insert(&mut self, range: MergedRange) -> Result<()> {
        if !range.end_key.is_empty() && range.start_key >= range.end_key {
            return Err(Error::InvalidRange(format!(
                "inverted range for file {:?}",
                range.files.first().map(|f| f.name.as_str())
            )));
        }
        if let Some((_, prev)) = self.ranges.range::<Vec<u8>, _>(..=&range.start_key).next_back() {
            if prev.start_key == range.start_key || prev.end_key > range.start_key {
                return Err(Error::InvalidRange(format!(
                    "duplicate or overlapping range, files {:?} and {:?}",
                    prev.files.first().map(|f| f.name.as_str()),
                    range.files.first().map(|f| f.name.as_str())
                )));
            }
        }
        if let Some((next_start, next)) = self.ranges.range::<Vec<u8>, _>(&range.start_key..).next()
        {
            if &range.end_key > next_start {
                return Err(Error::InvalidRange(format!(
                    "overlapping range, files {:?} and {:?}",
                    range.files.first().map(|f| f.name.as_str()),
                    next.files.first().map(|f| f.name.as_str())
                )));
            }
        }
        self.ranges.insert(range.start_key.clone(), range);
        Ok(())
    }

    fn len(&self) -> usize {
        self.ranges.len()
    }

    fn into_sorted(self) -> impl Iterator<Item = MergedRange> {
        self.ranges.into_values()
    }
}
