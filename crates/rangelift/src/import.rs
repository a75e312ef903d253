//! The per-store import contract and the backup-file importer.
//!
//! Stores expose two surfaces: a streaming `write` that turns KV chunks
//! into SST handles, and an `ingest` that atomically installs a handle into
//! a region. The importer drives backup files through download + ingest per
//! covering region, re-deriving coverage whenever the region map shifts
//! underneath it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec;
use crate::config::RestoreConfig;
use crate::errors::{Error, Result};
use crate::ingest::{classify_ingest, IngestVerdict, Pair};
use crate::manifest::BackupFile;
use crate::pool::Backoff;
use crate::region::{
    paginate_scan_regions, PlacementClient, Region, RegionEpoch, RegionInfo, StoreId,
};
use crate::rewrite::{rewrite_file_range, RewriteRule, RewriteRules};

const IMPORT_BACKOFF_BASE: Duration = Duration::from_millis(100);
const IMPORT_BACKOFF_CAP: Duration = Duration::from_secs(8);
const DOWNLOAD_PEER_RETRIES: usize = 3;

/// Encoded key interval. For SST handles `end` is the last key written
/// (inclusive), not an exclusive bound.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

/// Ingestion handle for one SST produced by a write stream or download.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SstMeta {
    pub uuid: Uuid,
    pub region_id: u64,
    pub region_epoch: RegionEpoch,
    pub range: KeyRange,
    pub cf: String,
}

/// `not leader` payload: the store may hint at the current leader.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NotLeaderHint {
    pub region_id: u64,
    pub leader: Option<crate::region::Peer>,
}

/// `epoch not match` payload: the store reports the descriptors it now has.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EpochNotMatchState {
    pub current_regions: Vec<Region>,
}

/// Structured store-side error, at most one field set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreError {
    pub message: String,
    pub not_leader: Option<NotLeaderHint>,
    pub epoch_not_match: Option<EpochNotMatchState>,
    pub server_is_busy: bool,
    pub region_not_found: bool,
    pub disk_full: bool,
}

/// Response of an ingest RPC. `error == None` means the SST is installed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngestResponse {
    pub error: Option<StoreError>,
}

/// Store operating mode during a restore.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchMode {
    Import,
    Normal,
}

/// Ask a store to fetch one backup file, rewrite its keys, and keep the
/// part intersecting `sst.range` ready for ingestion.
#[derive(Clone, Debug)]
pub struct DownloadRequest {
    pub sst: SstMeta,
    pub file_name: String,
    pub rewrite_rule: RewriteRule,
}

/// What the store actually materialized for a download.
#[derive(Clone, Debug, Default)]
pub struct DownloadResponse {
    /// Encoded range of the downloaded data; meaningless when `is_empty`.
    pub range: KeyRange,
    /// The file had no keys inside the requested range.
    pub is_empty: bool,
}

/// Streaming write of KV chunks to one store. Dropping the stream releases
/// the store-side resources, so every exit path is covered.
#[async_trait]
pub trait SstWriteStream: Send {
    /// Append one chunk; chunks of one stream are applied in send order.
    async fn write_batch(&mut self, pairs: &[Pair]) -> Result<()>;

    /// Close the stream and collect the SST handles the store built.
    async fn finish(self: Box<Self>) -> Result<Vec<SstMeta>>;
}

/// Per-store import service client.
#[async_trait]
pub trait ImportClient: Send + Sync {
    async fn download(&self, store_id: StoreId, req: &DownloadRequest) -> Result<DownloadResponse>;

    /// Open a write stream bound to `meta`'s uuid and region; every batch is
    /// stamped with `commit_ts`.
    async fn open_write_stream(
        &self,
        store_id: StoreId,
        meta: &SstMeta,
        commit_ts: u64,
    ) -> Result<Box<dyn SstWriteStream>>;

    /// Ingest a downloaded/written SST into the region, addressed at one
    /// peer (normally the leader).
    async fn ingest(
        &self,
        store_id: StoreId,
        region: &RegionInfo,
        meta: &SstMeta,
    ) -> Result<IngestResponse>;

    async fn switch_mode(&self, store_id: StoreId, mode: SwitchMode) -> Result<()>;

    async fn set_download_speed_limit(&self, store_id: StoreId, bytes_per_sec: u64)
        -> Result<()>;
}

/// Imports backup files into the cluster, one file at a time, fanning out
/// across covering regions.
#[derive(Clone)]
pub struct FileImporter {
    placement: Arc<dyn PlacementClient>,
    import: Arc<dyn ImportClient>,
    cfg: RestoreConfig,
    is_raw_kv: bool,
    raw_range: Option<(Vec<u8>, Vec<u8>)>,
    token: CancellationToken,
}

impl FileImporter {
    pub fn new(
        placement: Arc<dyn PlacementClient>,
        import: Arc<dyn ImportClient>,
        cfg: RestoreConfig,
        is_raw_kv: bool,
        token: CancellationToken,
    ) -> Self {
        Self {
            placement,
            import,
            cfg,
            is_raw_kv,
            raw_range: None,
            token,
        }
    }

    /// Restrict a raw-kv import to the backed-up range. Rejected outside raw
    /// mode.
    pub fn set_raw_range(&mut self, start: Vec<u8>, end: Vec<u8>) -> Result<()> {
        if !self.is_raw_kv {
            return Err(Error::InvalidRange(
                "raw range set on a transactional restore".into(),
            ));
        }
        self.raw_range = Some((start, end));
        Ok(())
    }

    /// Import one backup file: resolve its rewritten target range, then for
    /// every covering region download to all peers and ingest on the
    /// leader. Any region-shape change re-derives coverage and restarts the
    /// file's import.
    pub async fn import(&self, file: &BackupFile, rules: &RewriteRules) -> Result<()> {
        let Some((start, end)) = self.target_range(file, rules)? else {
            tracing::debug!(file = %file.name, "file has no keys inside the restore range");
            return Ok(());
        };
        let scan_start = codec::encode_bytes(&start);
        // An empty end bound means +inf and must stay empty once encoded.
        let scan_end = if end.is_empty() {
            Vec::new()
        } else {
            codec::encode_bytes(&end)
        };

        let mut backoff = Backoff::new(IMPORT_BACKOFF_BASE, IMPORT_BACKOFF_CAP);
        let mut last_err = Error::ScanRegionEmpty;
        for attempt in 0..self.cfg.import_retry_limit {
            if self.token.is_cancelled() {
                return Err(Error::Canceled);
            }
            if attempt > 0 {
                sleep_or_cancel(backoff.next_delay(), &self.token).await?;
            }

            let regions = match paginate_scan_regions(
                self.placement.as_ref(),
                &scan_start,
                &scan_end,
                self.cfg.scan_region_page_size,
            )
            .await
            {
                Ok(regions) => regions,
                Err(err) if err.is_retryable() => {
                    tracing::warn!(error = %err, file = %file.name, "scan failed, retrying import");
                    last_err = err;
                    continue;
                }
                Err(err) => return Err(err),
            };

            match self
                .import_into_regions(file, rules, &scan_start, &scan_end, regions)
                .await
            {
                Ok(()) => return Ok(()),
                Err(Error::Canceled) => return Err(Error::Canceled),
                Err(err) if err.is_retryable() => {
                    tracing::warn!(
                        error = %err,
                        file = %file.name,
                        attempt,
                        "import round failed, re-deriving region coverage"
                    );
                    last_err = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    /// Broadcast an operating-mode switch to every live store.
    pub async fn switch_mode(&self, mode: SwitchMode) -> Result<()> {
        let stores = self.placement.all_stores().await?;
        future::try_join_all(
            stores
                .iter()
                .map(|store| self.import.switch_mode(store.id, mode)),
        )
        .await?;
        Ok(())
    }

    /// Apply the configured download rate limit on every live store, if set.
    pub async fn apply_download_speed_limit(&self) -> Result<()> {
        if self.cfg.rate_limit_bytes_per_sec == 0 {
            return Ok(());
        }
        let stores = self.placement.all_stores().await?;
        future::try_join_all(stores.iter().map(|store| {
            self.import
                .set_download_speed_limit(store.id, self.cfg.rate_limit_bytes_per_sec)
        }))
        .await?;
        Ok(())
    }

    /// Decoded target range of `file` after rewriting (or raw-range
    /// clipping); `None` when nothing of the file falls inside the restore.
    fn target_range(
        &self,
        file: &BackupFile,
        rules: &RewriteRules,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if !self.is_raw_kv {
            return rewrite_file_range(file, rules).map(Some);
        }
        let (raw_start, raw_end) = self.raw_range.as_ref().ok_or_else(|| {
            Error::InvalidRange("raw restore without a configured raw range".into())
        })?;
        let start = if file.start_key.as_slice() > raw_start.as_slice() {
            file.start_key.clone()
        } else {
            raw_start.clone()
        };
        let end = match (file.end_key.is_empty(), raw_end.is_empty()) {
            (true, true) => Vec::new(),
            (true, false) => raw_end.clone(),
            (false, true) => file.end_key.clone(),
            (false, false) => file.end_key.clone().min(raw_end.clone()),
        };
        if !end.is_empty() && start >= end {
            return Ok(None);
        }
        Ok(Some((start, end)))
    }

    async fn import_into_regions(
        &self,
        file: &BackupFile,
        rules: &RewriteRules,
        scan_start: &[u8],
        scan_end: &[u8],
        regions: Vec<RegionInfo>,
    ) -> Result<()> {
        for mut info in regions {
            if self.token.is_cancelled() {
                return Err(Error::Canceled);
            }
            let Some(meta) = self
                .download_to_peers(file, rules, scan_start, scan_end, &mut info)
                .await?
            else {
                continue;
            };
            self.ingest_with_retries(&meta, info).await?;
        }
        Ok(())
    }

    /// Download the region-clipped slice of `file` to every peer's store.
    /// Returns `None` when the slice is empty on every store.
    async fn download_to_peers(
        &self,
        file: &BackupFile,
        rules: &RewriteRules,
        scan_start: &[u8],
        scan_end: &[u8],
        info: &mut RegionInfo,
    ) -> Result<Option<SstMeta>> {
        let range = KeyRange {
            start: max_slice(scan_start, &info.region.start_key).to_vec(),
            end: min_end(scan_end, &info.region.end_key).to_vec(),
        };
        let rule = if self.is_raw_kv {
            RewriteRule::default()
        } else {
            rules
                .find(&file.start_key)
                .cloned()
                .ok_or_else(|| Error::RewriteRuleNotFound {
                    table_id: codec::decode_table_id(&file.start_key).unwrap_or(0),
                    key_len: file.start_key.len(),
                })?
        };
        let sst = SstMeta {
            uuid: Uuid::new_v4(),
            region_id: info.region.id,
            region_epoch: info.region.epoch,
            range,
            cf: file.cf.clone(),
        };
        let req = DownloadRequest {
            sst: sst.clone(),
            file_name: file.name.clone(),
            rewrite_rule: rule,
        };

        let mut downloaded: Option<KeyRange> = None;
        let peers = info.region.peers.clone();
        for peer in peers {
            let mut busy_backoff = Backoff::new(IMPORT_BACKOFF_BASE, IMPORT_BACKOFF_CAP);
            let mut attempt = 0;
            let resp = loop {
                if self.token.is_cancelled() {
                    return Err(Error::Canceled);
                }
                match self.import.download(peer.store_id, &req).await {
                    Ok(resp) => break resp,
                    Err(Error::NotLeader { leader, .. }) if attempt + 1 < DOWNLOAD_PEER_RETRIES => {
                        // Follow the hint and ask the same store again.
                        if let Some(leader) = leader {
                            info.leader = Some(leader);
                        }
                        attempt += 1;
                    }
                    Err(err @ (Error::ServerIsBusy(_) | Error::DiskFull(_)))
                        if attempt + 1 < DOWNLOAD_PEER_RETRIES =>
                    {
                        tracing::warn!(
                            error = %err,
                            store = peer.store_id,
                            "store pushed back on download, backing off"
                        );
                        sleep_or_cancel(busy_backoff.next_delay(), &self.token).await?;
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            };
            if resp.is_empty {
                continue;
            }
            // Every peer downloads the same slice; remember one range.
            downloaded.get_or_insert(resp.range);
        }

        Ok(downloaded.map(|range| SstMeta { range, ..sst }))
    }

    async fn ingest_with_retries(&self, meta: &SstMeta, mut info: RegionInfo) -> Result<()> {
        let mut attempt = 0;
        loop {
            if self.token.is_cancelled() {
                return Err(Error::Canceled);
            }
            let leader = info
                .leader_or_first_peer()
                .ok_or_else(|| Error::Rpc(anyhow::anyhow!("region {} has no peers", info.region.id)))?;
            let resp = match self.import.ingest(leader.store_id, &info, meta).await {
                Ok(resp) => resp,
                Err(err) if err.is_retryable() && attempt + 1 < DOWNLOAD_PEER_RETRIES => {
                    attempt += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };
            match classify_ingest(&resp, &info, meta) {
                IngestVerdict::Success => return Ok(()),
                IngestVerdict::Fatal(err) => return Err(err),
                IngestVerdict::Retry { new_region, cause } => {
                    attempt += 1;
                    if attempt >= DOWNLOAD_PEER_RETRIES {
                        return Err(cause);
                    }
                    match new_region {
                        Some(region) => info = region,
                        // No usable descriptor in the response: force the
                        // caller to re-scan coverage.
                        None => return Err(cause),
                    }
                }
            }
        }
    }
}

fn max_slice<'a>(a: &'a [u8], b: &'a [u8]) -> &'a [u8] {
    if a > b {
        a
    } else {
        b
    }
}

/// Smaller of two encoded end bounds, where empty means +inf.
fn min_end<'a>(a: &'a [u8], b: &'a [u8]) -> &'a [u8] {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b,
        (_, true) => a,
        _ => {
            if a < b {
                a
            } else {
                b
            }
        }
    }
}

async fn sleep_or_cancel(delay: Duration, token: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = token.cancelled() => Err(Error::Canceled),
    }
}
