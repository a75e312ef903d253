//! Region split and scatter coordination.
//!
//! Given the merged ranges a restore is about to write, the splitter makes
//! the cluster contain a region boundary at every range bound, batching
//! split keys under the cluster's per-request limits, then asks the
//! placement driver to scatter the new regions across stores.
//!
//! A split attempt is an explicit retry state machine: scan, group keys by
//! the region that currently contains them, fan out batch splits, and feed
//! every key whose region moved underneath us back into the next round.
//! Scatter is advisory: an operator that never reaches a terminal state is
//! logged and skipped, never failed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::config::RestoreConfig;
use crate::errors::{Error, Result};
use crate::merge::MergedRange;
use crate::pool::{Backoff, WorkerPool};
use crate::region::{paginate_scan_regions, PlacementClient, RegionInfo};
use crate::rewrite::RewriteRules;

const SPLIT_BACKOFF_CAP: Duration = Duration::from_secs(2);
const SCATTER_POLL_BASE: Duration = Duration::from_millis(50);
const SCATTER_POLL_CAP: Duration = Duration::from_secs(2);
const SCATTER_OPERATOR_DESC: &str = "scatter-region";

/// Counters of one split-and-scatter run.
#[derive(Clone, Copy, Debug, Default)]
pub struct SplitStats {
    /// New regions produced by batch splits.
    pub regions_created: usize,
    /// Keys that went through at least one extra round after a retryable
    /// split failure.
    pub key_retries: u64,
    /// Regions whose scatter operator reached a terminal state in time.
    pub scattered: usize,
    /// Regions whose scatter operator was still running at the wait limit.
    pub scatter_timeouts: usize,
}

/// The region that `key` would split into two non-empty halves, if any.
///
/// A key lying on an existing boundary (or outside the scanned regions)
/// needs no split and yields `None`. `key` is a decoded user key; region
/// bounds are encoded.
pub fn need_split<'a>(key: &[u8], regions: &'a [RegionInfo]) -> Option<&'a RegionInfo> {
    if key.is_empty() {
        return None;
    }
    let encoded = codec::encode_bytes(key);
    regions.iter().find(|info| {
        encoded.as_slice() > info.region.start_key.as_slice()
            && codec::before_end(&encoded, &info.region.end_key)
    })
}

/// Pre-splits and scatters regions so that every merged range fits inside a
/// region of its own.
#[derive(Clone)]
pub struct RegionSplitter {
    client: Arc<dyn PlacementClient>,
    cfg: RestoreConfig,
}

impl RegionSplitter {
    pub fn new(client: Arc<dyn PlacementClient>, cfg: RestoreConfig) -> Self {
        Self { client, cfg }
    }

    /// Make the cluster contain a boundary at every bound of `ranges`, then
    /// scatter the regions created along the way.
    ///
    /// When `rules` are given, every boundary is rewritten into the target
    /// table's key space first; the data will land there, not at the
    /// backup's original prefixes.
    pub async fn split_and_scatter(
        &self,
        ranges: &[MergedRange],
        rules: Option<&RewriteRules>,
        token: &CancellationToken,
    ) -> Result<SplitStats> {
        let mut stats = SplitStats::default();
        if ranges.is_empty() {
            return Ok(stats);
        }

        let mut keys: Vec<Vec<u8>> = Vec::with_capacity(ranges.len() + 1);
        for range in ranges {
            if !range.start_key.is_empty() {
                keys.push(rewrite_boundary(&range.start_key, rules)?);
            }
            if !range.end_key.is_empty() {
                keys.push(rewrite_boundary(&range.end_key, rules)?);
            }
        }
        keys.sort();
        keys.dedup();
        if keys.is_empty() {
            return Ok(stats);
        }

        let scan_start = codec::encode_bytes(keys.first().expect("non-empty"));
        let scan_end = codec::encode_bytes(&codec::next_key(keys.last().expect("non-empty")));

        let mut to_scatter: Vec<RegionInfo> = Vec::new();
        let mut pending = keys;
        let mut backoff = Backoff::new(self.cfg.split_region_base_backoff, SPLIT_BACKOFF_CAP);
        let mut last_err: Option<Error> = None;

        for attempt in 0..self.cfg.split_retry_limit {
            if attempt > 0 {
                sleep_or_cancel(backoff.next_delay(), token).await?;
            }
            if token.is_cancelled() {
                return Err(Error::Canceled);
            }

            let regions = paginate_scan_regions(
                self.client.as_ref(),
                &scan_start,
                &scan_end,
                self.cfg.scan_region_page_size,
            )
            .await?;

            let mut by_region: HashMap<u64, (RegionInfo, Vec<Vec<u8>>)> = HashMap::new();
            for key in pending.drain(..) {
                // Keys whose boundary already exists fall out here.
                if let Some(info) = need_split(&key, &regions) {
                    by_region
                        .entry(info.region.id)
                        .or_insert_with(|| (info.clone(), Vec::new()))
                        .1
                        .push(key);
                }
            }
            if by_region.is_empty() {
                break;
            }

            let pool = WorkerPool::new(self.cfg.split_concurrency, "region-split");
            let mut tasks = JoinSet::new();
            for (_, (region, region_keys)) in by_region {
                let permit = pool.acquire().await;
                let splitter = self.clone();
                let task_token = token.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    let result = splitter
                        .split_region_with_keys(region, region_keys.clone(), &task_token)
                        .await;
                    (region_keys, result)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (region_keys, result) = joined
                    .map_err(|err| Error::Rpc(anyhow::anyhow!("split worker died: {err}")))?;
                match result {
                    Ok(mut new_regions) => {
                        stats.regions_created += new_regions.len();
                        to_scatter.append(&mut new_regions);
                    }
                    Err(err) if err.is_retryable() => {
                        tracing::warn!(
                            error = %err,
                            keys = region_keys.len(),
                            "batch split failed, queueing keys for retry"
                        );
                        stats.key_retries += region_keys.len() as u64;
                        pending.extend(region_keys);
                        last_err = Some(err);
                    }
                    Err(err) => {
                        tasks.abort_all();
                        return Err(err);
                    }
                }
            }

            if pending.is_empty() {
                break;
            }
        }

        if !pending.is_empty() {
            let cause = last_err.unwrap_or(Error::ScanRegionEmpty);
            return Err(Error::BatchSplit {
                cause: Box::new(cause),
            });
        }

        self.scatter_regions(&to_scatter, token, &mut stats).await?;
        Ok(stats)
    }

    /// Split one region at every key of `keys`, batching under the key-count
    /// and payload-size limits. Returns the regions created.
    ///
    /// Keys are decoded; bounds checks run on their encoded form. A key on
    /// or outside the region bounds is discarded — equal to the end key
    /// means it belongs to the next region, not this one.
    async fn split_region_with_keys(
        &self,
        mut region: RegionInfo,
        mut keys: Vec<Vec<u8>>,
        token: &CancellationToken,
    ) -> Result<Vec<RegionInfo>> {
        keys.sort();
        keys.dedup();
        let valid: Vec<Vec<u8>> = keys
            .into_iter()
            .filter(|key| {
                let encoded = codec::encode_bytes(key);
                encoded.as_slice() > region.region.start_key.as_slice()
                    && codec::before_end(&encoded, &region.region.end_key)
            })
            .collect();
        if valid.is_empty() {
            tracing::debug!(region = region.region.id, "no valid key to split, skipping");
            return Ok(Vec::new());
        }

        let mut created = Vec::new();
        let mut batch: Vec<Vec<u8>> = Vec::new();
        let mut batch_bytes = 0usize;
        for key in valid {
            let full = batch.len() >= self.cfg.max_batch_split_keys
                || batch_bytes + key.len() > self.cfg.max_batch_split_size;
            if full && !batch.is_empty() {
                region = self
                    .send_split_batch(&mut created, region, std::mem::take(&mut batch), token)
                    .await?;
                batch_bytes = 0;
            }
            batch_bytes += key.len();
            batch.push(key);
        }
        if !batch.is_empty() {
            self.send_split_batch(&mut created, region, batch, token)
                .await?;
        }
        Ok(created)
    }

    async fn send_split_batch(
        &self,
        created: &mut Vec<RegionInfo>,
        region: RegionInfo,
        batch: Vec<Vec<u8>>,
        token: &CancellationToken,
    ) -> Result<RegionInfo> {
        if token.is_cancelled() {
            return Err(Error::Canceled);
        }
        let (origin, new_regions) = self.client.batch_split_regions(&region, &batch).await?;
        tracing::debug!(
            region = origin.region.id,
            keys = batch.len(),
            new_regions = new_regions.len(),
            "batch split succeeded"
        );
        created.extend(new_regions);
        // The updated origin now starts at the last emitted boundary; the
        // next batch continues against it.
        Ok(origin)
    }

    /// Request a scatter operator for every new region, then wait for the
    /// operators to reach a terminal state. Best-effort by design.
    async fn scatter_regions(
        &self,
        regions: &[RegionInfo],
        token: &CancellationToken,
        stats: &mut SplitStats,
    ) -> Result<()> {
        let mut requested: Vec<&RegionInfo> = Vec::with_capacity(regions.len());
        for info in regions {
            if token.is_cancelled() {
                return Err(Error::Canceled);
            }
            match self.client.scatter_region(info).await {
                Ok(()) => requested.push(info),
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        region = info.region.id,
                        "scatter request failed, skipping region"
                    );
                }
            }
        }

        let deadline = Instant::now() + self.cfg.scatter_wait_limit;
        for info in requested {
            if self.wait_scatter_finished(info, deadline, token).await? {
                stats.scattered += 1;
            } else {
                stats.scatter_timeouts += 1;
                tracing::warn!(
                    region = info.region.id,
                    "scatter operator still running at wait limit, moving on"
                );
            }
        }
        Ok(())
    }

    async fn wait_scatter_finished(
        &self,
        info: &RegionInfo,
        deadline: Instant,
        token: &CancellationToken,
    ) -> Result<bool> {
        let mut backoff = Backoff::new(SCATTER_POLL_BASE, SCATTER_POLL_CAP);
        loop {
            if token.is_cancelled() {
                return Err(Error::Canceled);
            }
            match self.client.get_operator(info.region.id).await {
                // Another operator replaced ours, or ours finished: either
                // way the driver is done with this region.
                Ok(op) if op.desc != SCATTER_OPERATOR_DESC => return Ok(true),
                Ok(op) if op.status.is_terminal() => return Ok(true),
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(
                        error = %err,
                        region = info.region.id,
                        "get operator failed, polling again"
                    );
                }
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep_or_cancel(backoff.next_delay(), token).await?;
        }
    }
}

fn rewrite_boundary(key: &[u8], rules: Option<&RewriteRules>) -> Result<Vec<u8>> {
    match rules {
        None => Ok(key.to_vec()),
        Some(rules) => rules.rewrite_key(key).ok_or_else(|| Error::RewriteRuleNotFound {
            table_id: crate::codec::decode_table_id(key).unwrap_or(0),
            key_len: key.len(),
        }),
    }
}

async fn sleep_or_cancel(delay: Duration, token: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = token.cancelled() => Err(Error::Canceled),
    }
}
