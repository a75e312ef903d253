//! KV write/ingest pipeline used by log restore and any streaming import.
//!
//! One `write_and_ingest` call streams a sorted run of pairs to every peer
//! of a region over pipelined chunks, then ingests the SST handles the
//! leader returned. The byte arena recycles its backing buffer between
//! chunks so a large batch does not allocate per pair.
//!
//! The outer `write_rows` driver owns the region bookkeeping: it scans
//! covering regions, fans out per-region slices, and on any failure
//! refreshes the regions and retries the whole range.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec;
use crate::config::RestoreConfig;
use crate::errors::{Error, Result};
use crate::import::{ImportClient, IngestResponse, KeyRange, SstMeta};
use crate::manifest::CF_DEFAULT;
use crate::region::{paginate_scan_regions, PlacementClient, RegionInfo};

/// Rounds of scan + write + ingest before a range is declared failed.
const MAX_RETRY_TIMES: usize = 3;
/// Pause between whole-range retries.
const RETRY_PAUSE: Duration = Duration::from_secs(1);
/// Regions fetched per scan round-trip on the write path.
const WRITE_SCAN_PAGE_SIZE: usize = 128;
/// Initial arena block, recycled across chunks.
const ARENA_BLOCK: usize = 256 * 1024;

/// One row-change KV pair.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pair {
    pub key: Bytes,
    pub value: Bytes,
    pub is_delete: bool,
}

impl Pair {
    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            is_delete: false,
        }
    }

    pub fn delete(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Bytes::new(),
            is_delete: true,
        }
    }
}

/// Byte arena shared by the pairs of one write call. Thread-confined.
struct PairArena {
    buf: BytesMut,
}

impl PairArena {
    fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(ARENA_BLOCK),
        }
    }

    fn append(&mut self, data: &[u8]) -> Bytes {
        self.buf.extend_from_slice(data);
        self.buf.split().freeze()
    }

    /// Reclaim the block once the previous chunk's pairs are dropped.
    fn recycle(&mut self) {
        let _ = self.buf.try_reclaim(ARENA_BLOCK);
    }
}

/// Outcome of classifying one ingest response.
#[derive(Debug)]
pub enum IngestVerdict {
    Success,
    /// Worth retrying; `new_region` carries a corrected descriptor when the
    /// response contained one, otherwise the caller must re-scan.
    Retry {
        new_region: Option<RegionInfo>,
        cause: Error,
    },
    Fatal(Error),
}

/// Central ingest-error classifier.
///
/// `not leader` with a hinted leader retries against the hint. `epoch not
/// match` looks for the reported descriptor that still contains the SST's
/// range and the peer on the old leader's store; without both, the retry
/// goes back through a scan. Anything else is fatal.
pub fn classify_ingest(resp: &IngestResponse, region: &RegionInfo, meta: &SstMeta) -> IngestVerdict {
    let Some(err) = &resp.error else {
        return IngestVerdict::Success;
    };

    if let Some(hint) = &err.not_leader {
        if let Some(leader) = hint.leader {
            return IngestVerdict::Retry {
                new_region: Some(RegionInfo::new(region.region.clone(), Some(leader))),
                cause: Error::NotLeader {
                    region_id: region.region.id,
                    leader: Some(leader),
                },
            };
        }
        // No hint: fall through to the unknown-error path below.
    } else if let Some(state) = &err.epoch_not_match {
        let new_region = state
            .current_regions
            .iter()
            .find(|r| r.contains_range(&meta.range.start, &meta.range.end))
            .and_then(|current| {
                let old_leader = region.leader?;
                let peer = current
                    .peers
                    .iter()
                    .find(|p| p.store_id == old_leader.store_id)?;
                Some(RegionInfo::new(current.clone(), Some(*peer)))
            });
        return IngestVerdict::Retry {
            new_region,
            cause: Error::EpochNotMatch {
                message: err.message.clone(),
                current_regions: state.current_regions.clone(),
            },
        };
    }

    IngestVerdict::Fatal(Error::KvUnknown(err.message.clone()))
}

/// Streams sorted KV runs into the cluster with region-aware retries.
#[derive(Clone)]
pub struct KvIngestor {
    placement: Arc<dyn PlacementClient>,
    import: Arc<dyn ImportClient>,
    cfg: RestoreConfig,
    token: CancellationToken,
}

impl KvIngestor {
    pub fn new(
        placement: Arc<dyn PlacementClient>,
        import: Arc<dyn ImportClient>,
        cfg: RestoreConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            placement,
            import,
            cfg,
            token,
        }
    }

    /// Write a batch of row changes. Sorts, drops duplicate keys keeping the
    /// last occurrence, and drives the result through the region-retry
    /// protocol. Empty input is a no-op.
    pub async fn write_rows(&self, kvs: Vec<Pair>) -> Result<()> {
        if kvs.is_empty() {
            tracing::warn!("no rows to write");
            return Ok(());
        }
        let mut kvs = kvs;
        kvs.sort_by(|a, b| a.key.cmp(&b.key));

        // Last writer wins on identical keys.
        let mut deduped: Vec<Pair> = Vec::with_capacity(kvs.len());
        for kv in kvs {
            match deduped.last_mut() {
                Some(last) if last.key == kv.key => *last = kv,
                _ => deduped.push(kv),
            }
        }

        self.write_and_ingest_pairs(Arc::new(deduped)).await
    }

    async fn write_and_ingest_pairs(&self, kvs: Arc<Vec<Pair>>) -> Result<()> {
        let scan_start = codec::encode_bytes(&kvs[0].key);
        let scan_end =
            codec::encode_bytes(&codec::next_key(&kvs[kvs.len() - 1].key));

        let mut last_err: Option<Error> = None;
        for retry in 0..MAX_RETRY_TIMES {
            if retry > 0 {
                sleep_or_cancel(RETRY_PAUSE, &self.token).await?;
            }
            if self.token.is_cancelled() {
                return Err(Error::Canceled);
            }

            let regions = match paginate_scan_regions(
                self.placement.as_ref(),
                &scan_start,
                &scan_end,
                WRITE_SCAN_PAGE_SIZE,
            )
            .await
            {
                Ok(regions) => regions,
                Err(err) => {
                    tracing::warn!(error = %err, retry, "scan region failed on write path");
                    last_err = Some(err);
                    continue;
                }
            };

            if regions.len() == 1 {
                match self
                    .do_write_and_ingest(&kvs, regions.into_iter().next().expect("one region"))
                    .await
                {
                    Ok(()) => return Ok(()),
                    Err(Error::Canceled) => return Err(Error::Canceled),
                    Err(err) => {
                        tracing::warn!(error = %err, retry, "write and ingest round failed");
                        last_err = Some(err);
                        continue;
                    }
                }
            }

            // Multiple regions: per-region workers share the pair run and
            // clip their own slice. First failure cancels the group and the
            // whole range is retried against fresh regions.
            let group = self.token.child_token();
            let mut tasks = JoinSet::new();
            for info in regions {
                let ingestor = self.clone_with_token(group.clone());
                let run = kvs.clone();
                tasks.spawn(async move { ingestor.do_write_and_ingest(&run, info).await });
            }

            let mut round_err: Option<Error> = None;
            while let Some(joined) = tasks.join_next().await {
                let result = joined
                    .map_err(|err| Error::Rpc(anyhow::anyhow!("write worker died: {err}")))?;
                match result {
                    Ok(()) => {}
                    Err(Error::Canceled) if !self.token.is_cancelled() => {
                        // Collateral of cancelling the group; the primary
                        // failure is already recorded.
                    }
                    Err(Error::Canceled) => return Err(Error::Canceled),
                    Err(err) => {
                        if round_err.is_none() {
                            group.cancel();
                            round_err = Some(err);
                        }
                    }
                }
            }
            match round_err {
                None => return Ok(()),
                Some(err) => {
                    tracing::warn!(error = %err, retry, "write and ingest group failed");
                    last_err = Some(err);
                }
            }
        }

        Err(Error::WriteAndIngest(match last_err {
            Some(err) => format!("all retry failed: {err}"),
            None => "all retry failed".into(),
        }))
    }

    fn clone_with_token(&self, token: CancellationToken) -> Self {
        Self {
            placement: self.placement.clone(),
            import: self.import.clone(),
            cfg: self.cfg.clone(),
            token,
        }
    }

    /// Write the slice of `kvs` owned by `region` and ingest the resulting
    /// SSTs. Pairs outside the region's interval are not written.
    async fn do_write_and_ingest(&self, kvs: &[Pair], region: RegionInfo) -> Result<()> {
        let start_bound = if region.region.start_key.is_empty() {
            Vec::new()
        } else {
            codec::decode_bytes(&region.region.start_key)?
        };
        let end_bound = if region.region.end_key.is_empty() {
            Vec::new()
        } else {
            codec::decode_bytes(&region.region.end_key)?
        };

        let begin = kvs.partition_point(|kv| kv.key.as_ref() < start_bound.as_slice());
        let end = if end_bound.is_empty() {
            kvs.len()
        } else {
            kvs.partition_point(|kv| kv.key.as_ref() < end_bound.as_slice())
        };
        if begin >= end {
            return Ok(());
        }

        let metas = self.write_to_peers(&kvs[begin..end], &region).await?;
        for meta in metas {
            self.ingest_with_retries(&meta, region.clone()).await?;
        }
        Ok(())
    }

    /// Stream `kvs` to every peer of the region; returns the SST handles
    /// reported by the leader's stream.
    async fn write_to_peers(&self, kvs: &[Pair], info: &RegionInfo) -> Result<Vec<SstMeta>> {
        let meta = SstMeta {
            uuid: Uuid::new_v4(),
            region_id: info.region.id,
            region_epoch: info.region.epoch,
            range: KeyRange {
                start: codec::encode_bytes(&kvs[0].key),
                end: codec::encode_bytes(&kvs[kvs.len() - 1].key),
            },
            cf: CF_DEFAULT.into(),
        };
        let commit_ts = codec::current_ts();
        let leader_id = info.leader_or_first_peer().map(|p| p.id);

        let mut streams = Vec::with_capacity(info.region.peers.len());
        for peer in &info.region.peers {
            let stream = self
                .import
                .open_write_stream(peer.store_id, &meta, commit_ts)
                .await?;
            streams.push((peer.id, stream));
        }

        let mut arena = PairArena::new();
        let mut chunk: Vec<Pair> = Vec::with_capacity(self.cfg.batch_write_kv_pairs.min(kvs.len()));
        let mut total_bytes = 0u64;
        for kv in kvs {
            if self.token.is_cancelled() {
                return Err(Error::Canceled);
            }
            total_bytes += (kv.key.len() + kv.value.len()) as u64;
            chunk.push(Pair {
                key: arena.append(&kv.key),
                value: arena.append(&kv.value),
                is_delete: kv.is_delete,
            });
            if chunk.len() >= self.cfg.batch_write_kv_pairs {
                for (_, stream) in &mut streams {
                    stream.write_batch(&chunk).await?;
                }
                chunk.clear();
                arena.recycle();
            }
        }
        if !chunk.is_empty() {
            for (_, stream) in &mut streams {
                stream.write_batch(&chunk).await?;
            }
        }

        let mut leader_metas = Vec::new();
        for (peer_id, stream) in streams {
            let metas = stream.finish().await?;
            if Some(peer_id) == leader_id {
                leader_metas = metas;
            }
        }
        tracing::debug!(
            region = info.region.id,
            pairs = kvs.len(),
            bytes = total_bytes,
            metas = leader_metas.len(),
            "streamed kv run to region peers"
        );
        Ok(leader_metas)
    }

    async fn ingest_with_retries(&self, meta: &SstMeta, mut info: RegionInfo) -> Result<()> {
        let mut attempt = 0;
        loop {
            if self.token.is_cancelled() {
                return Err(Error::Canceled);
            }
            let leader = info.leader_or_first_peer().ok_or_else(|| {
                Error::Rpc(anyhow::anyhow!("region {} has no peers", info.region.id))
            })?;
            let resp = match self.import.ingest(leader.store_id, &info, meta).await {
                Ok(resp) => resp,
                Err(err) if err.is_retryable() && attempt + 1 < MAX_RETRY_TIMES => {
                    tracing::warn!(error = %err, region = info.region.id, "ingest rpc failed");
                    attempt += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };
            match classify_ingest(&resp, &info, meta) {
                IngestVerdict::Success => return Ok(()),
                IngestVerdict::Fatal(err) => {
                    tracing::warn!(error = %err, region = info.region.id, "ingest failed, no retry");
                    return Err(err);
                }
                IngestVerdict::Retry { new_region, cause } => {
                    attempt += 1;
                    if attempt >= MAX_RETRY_TIMES {
                        return Err(cause);
                    }
                    match new_region {
                        Some(region) => info = region,
                        None => return Err(cause),
                    }
                }
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
