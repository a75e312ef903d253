//! In-memory mock cluster shared by the integration tests: a placement
//! driver over a mutable region map plus import-service stores that commit
//! written pairs on ingest. Hooks inject faults around scans, splits, and
//! ingests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use rangelift::codec;
use rangelift::errors::{Error, Result};
use rangelift::import::{
    DownloadRequest, DownloadResponse, EpochNotMatchState, ImportClient, IngestResponse, KeyRange,
    NotLeaderHint, SstMeta, SstWriteStream, StoreError, SwitchMode,
};
use rangelift::ingest::Pair;
use rangelift::region::{
    OperatorInfo, OperatorStatus, Peer, PlacementClient, PlacementRule, Region, RegionEpoch,
    RegionId, RegionInfo, Store, StoreId,
};

/// Install a test logger once; respects `RUST_LOG`.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Fault-injection hooks around mock cluster calls.
pub trait ClusterHook: Send + Sync {
    /// Rewrite the descriptor/keys a batch split sees.
    fn before_batch_split(
        &self,
        region: &RegionInfo,
        keys: &[Vec<u8>],
    ) -> (RegionInfo, Vec<Vec<u8>>) {
        (region.clone(), keys.to_vec())
    }

    /// Observe a successful batch split.
    fn after_batch_split(&self, _origin: &RegionInfo, _new_regions: &[RegionInfo]) {}

    /// Rewrite a scan page before it is returned.
    fn after_scan(&self, regions: Vec<RegionInfo>) -> Vec<RegionInfo> {
        regions
    }
}

struct NoopHook;

impl ClusterHook for NoopHook {}

struct ClusterState {
    regions: BTreeMap<RegionId, RegionInfo>,
    next_region_id: RegionId,
}

/// Mock placement driver over an in-memory region map.
pub struct MockCluster {
    state: Mutex<ClusterState>,
    stores: HashMap<StoreId, Store>,
    hook: Arc<dyn ClusterHook>,
    pub split_calls: AtomicUsize,
    pub scatter_calls: AtomicUsize,
    pub scan_calls: AtomicUsize,
    ts: AtomicUsize,
}

impl MockCluster {
    /// Build a cluster whose regions are delimited by `boundaries`
    /// (decoded keys; empty first/last entries mean -inf/+inf). Every
    /// region has one peer on store 1, which is also the leader.
    pub fn with_boundaries(boundaries: &[&[u8]]) -> Arc<Self> {
        Self::with_boundaries_and_hook(boundaries, Arc::new(NoopHook))
    }

    pub fn with_boundaries_and_hook(
        boundaries: &[&[u8]],
        hook: Arc<dyn ClusterHook>,
    ) -> Arc<Self> {
        let peers = vec![Peer { id: 1, store_id: 1 }];
        let mut regions = BTreeMap::new();
        for i in 1..boundaries.len() {
            let encode = |key: &[u8]| {
                if key.is_empty() {
                    Vec::new()
                } else {
                    codec::encode_bytes(key)
                }
            };
            let region = Region {
                id: i as RegionId,
                start_key: encode(boundaries[i - 1]),
                end_key: encode(boundaries[i]),
                epoch: RegionEpoch {
                    version: 1,
                    conf_ver: 1,
                },
                peers: peers.clone(),
            };
            regions.insert(
                region.id,
                RegionInfo::new(region, Some(Peer { id: 1, store_id: 1 })),
            );
        }
        let mut stores = HashMap::new();
        stores.insert(
            1,
            Store {
                id: 1,
                address: "127.0.0.1:20160".into(),
                labels: Vec::new(),
            },
        );
        Arc::new(Self {
            state: Mutex::new(ClusterState {
                next_region_id: boundaries.len() as RegionId,
                regions,
            }),
            stores,
            hook,
            split_calls: AtomicUsize::new(0),
            scatter_calls: AtomicUsize::new(0),
            scan_calls: AtomicUsize::new(0),
            ts: AtomicUsize::new(1),
        })
    }

    /// Every region sorted by start key.
    pub fn all_regions(&self) -> Vec<RegionInfo> {
        let state = self.state.lock().unwrap();
        let mut regions: Vec<RegionInfo> = state.regions.values().cloned().collect();
        regions.sort_by(|a, b| a.region.start_key.cmp(&b.region.start_key));
        regions
    }

    /// Update one region in place (test setup only).
    pub fn put_region(&self, info: RegionInfo) {
        let mut state = self.state.lock().unwrap();
        state.regions.insert(info.region.id, info);
    }
}

#[async_trait]
impl PlacementClient for MockCluster {
    async fn get_region(&self, key: &[u8]) -> Result<RegionInfo> {
        let state = self.state.lock().unwrap();
        state
            .regions
            .values()
            .find(|info| info.region.contains(key))
            .cloned()
            .ok_or_else(|| Error::Rpc(anyhow::anyhow!("region not found for key")))
    }

    async fn get_region_by_id(&self, region_id: RegionId) -> Result<RegionInfo> {
        let state = self.state.lock().unwrap();
        state
            .regions
            .get(&region_id)
            .cloned()
            .ok_or(Error::RegionNotFound(region_id))
    }

    async fn scan_regions(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<RegionInfo>> {
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        let mut regions: Vec<RegionInfo> = {
            let state = self.state.lock().unwrap();
            state
                .regions
                .values()
                .filter(|info| {
                    let r = &info.region;
                    (r.end_key.is_empty() || r.end_key.as_slice() > start)
                        && (end.is_empty() || r.start_key.as_slice() < end)
                })
                .cloned()
                .collect()
        };
        regions.sort_by(|a, b| a.region.start_key.cmp(&b.region.start_key));
        regions.truncate(limit);
        Ok(self.hook.after_scan(regions))
    }

    async fn get_store(&self, store_id: StoreId) -> Result<Store> {
        self.stores
            .get(&store_id)
            .cloned()
            .ok_or_else(|| Error::Rpc(anyhow::anyhow!("store {store_id} not found")))
    }

    async fn all_stores(&self) -> Result<Vec<Store>> {
        Ok(self.stores.values().cloned().collect())
    }

    async fn split_region(&self, region: &RegionInfo, key: &[u8]) -> Result<RegionInfo> {
        let (_, mut new_regions) = self
            .batch_split_regions(region, std::slice::from_ref(&key.to_vec()))
            .await?;
        new_regions
            .pop()
            .ok_or_else(|| Error::NoValidKey(region.region.id))
    }

    async fn batch_split_regions(
        &self,
        region: &RegionInfo,
        keys: &[Vec<u8>],
    ) -> Result<(RegionInfo, Vec<RegionInfo>)> {
        let (region, keys) = self.hook.before_batch_split(region, keys);
        if keys.is_empty() {
            return Err(Error::NoValidKey(region.region.id));
        }
        self.split_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();
        let mut target = state
            .regions
            .get(&region.region.id)
            .cloned()
            .ok_or(Error::RegionNotFound(region.region.id))?;
        if target.region.epoch != region.region.epoch {
            return Err(Error::EpochNotMatch {
                message: format!("region {} epoch changed", region.region.id),
                current_regions: vec![target.region.clone()],
            });
        }

        let mut split_keys: Vec<Vec<u8>> = keys.iter().map(|k| codec::encode_bytes(k)).collect();
        split_keys.sort();

        let mut new_regions = Vec::new();
        let mut start_key = target.region.start_key.clone();
        for key in split_keys {
            if key <= start_key || !codec::before_end(&key, &target.region.end_key) {
                continue;
            }
            let new_region = RegionInfo::new(
                Region {
                    id: state.next_region_id,
                    start_key: start_key.clone(),
                    end_key: key.clone(),
                    epoch: RegionEpoch {
                        version: 1,
                        conf_ver: 1,
                    },
                    peers: target.region.peers.clone(),
                },
                target.leader,
            );
            state.next_region_id += 1;
            state.regions.insert(new_region.region.id, new_region.clone());
            start_key = key;
            new_regions.push(new_region);
        }
        if target.region.start_key != start_key {
            target.region.start_key = start_key;
            state.regions.insert(target.region.id, target.clone());
        }
        drop(state);

        if new_regions.is_empty() {
            return Err(Error::NoValidKey(target.region.id));
        }
        self.hook.after_batch_split(&target, &new_regions);
        Ok((target, new_regions))
    }

    async fn scatter_region(&self, _region: &RegionInfo) -> Result<()> {
        self.scatter_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_operator(&self, _region_id: RegionId) -> Result<OperatorInfo> {
        Ok(OperatorInfo {
            status: OperatorStatus::Success,
            desc: "scatter-region".into(),
        })
    }

    async fn get_ts(&self) -> Result<u64> {
        Ok(self.ts.fetch_add(1, Ordering::SeqCst) as u64)
    }

    async fn get_placement_rule(
        &self,
        _group_id: &str,
        _rule_id: &str,
    ) -> Result<Option<PlacementRule>> {
        Ok(None)
    }

    async fn set_placement_rule(&self, _rule: PlacementRule) -> Result<()> {
        Ok(())
    }

    async fn delete_placement_rule(&self, _group_id: &str, _rule_id: &str) -> Result<()> {
        Ok(())
    }

    async fn set_stores_label(&self, _stores: &[StoreId], _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }
}

/// Decode a scanned region list back to user keys and compare against the
/// expected boundary sequence.
pub fn check_region_ranges(regions: &[RegionInfo], boundaries: &[&[u8]]) {
    assert_eq!(
        regions.len() + 1,
        boundaries.len(),
        "boundary count mismatch: {} regions",
        regions.len()
    );
    for (i, info) in regions.iter().enumerate() {
        let start = codec::decode_bytes(&info.region.start_key).unwrap();
        let end = codec::decode_bytes(&info.region.end_key).unwrap();
        assert_eq!(start, boundaries[i], "start of region {i}");
        assert_eq!(end, boundaries[i + 1], "end of region {i}");
    }
}

type IngestHook = dyn FnMut(&SstMeta, &RegionInfo) -> Option<IngestResponse> + Send;

/// Mock import service backed by [`MockCluster`]'s region map. Written
/// pairs commit into `committed` when the matching SST is ingested at the
/// leader.
pub struct MockStores {
    cluster: Arc<MockCluster>,
    pub committed: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    pending: Arc<Mutex<HashMap<(StoreId, Uuid), Vec<Pair>>>>,
    /// Decoded ranges of registered backup files, keyed by name.
    file_ranges: Mutex<HashMap<String, (Vec<u8>, Vec<u8>)>>,
    pub write_streams: AtomicUsize,
    pub ingest_calls: AtomicUsize,
    pub download_calls: AtomicUsize,
    pub switch_mode_calls: AtomicUsize,
    pub speed_limit_calls: AtomicUsize,
    /// Ingested downloads as `(file name or "", region id)`.
    pub ingested: Mutex<Vec<(String, RegionId)>>,
    ingest_hook: Mutex<Option<Box<IngestHook>>>,
}

impl MockStores {
    pub fn new(cluster: Arc<MockCluster>) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            committed: Mutex::new(BTreeMap::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            file_ranges: Mutex::new(HashMap::new()),
            write_streams: AtomicUsize::new(0),
            ingest_calls: AtomicUsize::new(0),
            download_calls: AtomicUsize::new(0),
            switch_mode_calls: AtomicUsize::new(0),
            speed_limit_calls: AtomicUsize::new(0),
            ingested: Mutex::new(Vec::new()),
            ingest_hook: Mutex::new(None),
        })
    }

    /// Register a backup file's decoded key range so downloads can report
    /// emptiness.
    pub fn register_file(&self, name: &str, start: &[u8], end: &[u8]) {
        self.file_ranges
            .lock()
            .unwrap()
            .insert(name.into(), (start.to_vec(), end.to_vec()));
    }

    /// Install a hook that may override the next ingest responses.
    pub fn set_ingest_hook(
        &self,
        hook: impl FnMut(&SstMeta, &RegionInfo) -> Option<IngestResponse> + Send + 'static,
    ) {
        *self.ingest_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn committed_keys(&self) -> Vec<Vec<u8>> {
        self.committed.lock().unwrap().keys().cloned().collect()
    }
}

struct MockWriteStream {
    pending: Arc<Mutex<HashMap<(StoreId, Uuid), Vec<Pair>>>>,
    store_id: StoreId,
    meta: SstMeta,
    pairs: Vec<Pair>,
}

#[async_trait]
impl SstWriteStream for MockWriteStream {
    async fn write_batch(&mut self, pairs: &[Pair]) -> Result<()> {
        self.pairs.extend(pairs.iter().cloned());
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<Vec<SstMeta>> {
        self.pending
            .lock()
            .unwrap()
            .insert((self.store_id, self.meta.uuid), self.pairs);
        Ok(vec![self.meta])
    }
}

#[async_trait]
impl ImportClient for MockStores {
    async fn download(&self, _store_id: StoreId, req: &DownloadRequest) -> Result<DownloadResponse> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        let ranges = self.file_ranges.lock().unwrap();
        let Some((file_start, file_end)) = ranges.get(&req.file_name) else {
            return Err(Error::KvUnknown(format!("unknown file {}", req.file_name)));
        };
        // Rewrite the file's bounds, then intersect with the requested
        // slice, mirroring what a store does after fetching the file.
        let rewrite = |key: &[u8]| -> Vec<u8> {
            if key.starts_with(&req.rewrite_rule.old_key_prefix) {
                let mut out = req.rewrite_rule.new_key_prefix.clone();
                out.extend_from_slice(&key[req.rewrite_rule.old_key_prefix.len()..]);
                out
            } else {
                key.to_vec()
            }
        };
        let enc_start = codec::encode_bytes(&rewrite(file_start));
        let enc_end = codec::encode_bytes(&rewrite(file_end));
        let start = enc_start.max(req.sst.range.start.clone());
        let end = if req.sst.range.end.is_empty() {
            enc_end
        } else {
            enc_end.min(req.sst.range.end.clone())
        };
        if start >= end {
            return Ok(DownloadResponse {
                range: KeyRange::default(),
                is_empty: true,
            });
        }
        Ok(DownloadResponse {
            range: KeyRange { start, end },
            is_empty: false,
        })
    }

    async fn open_write_stream(
        &self,
        store_id: StoreId,
        meta: &SstMeta,
        _commit_ts: u64,
    ) -> Result<Box<dyn SstWriteStream>> {
        self.write_streams.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockWriteStream {
            pending: self.pending.clone(),
            store_id,
            meta: meta.clone(),
            pairs: Vec::new(),
        }))
    }

    async fn ingest(
        &self,
        store_id: StoreId,
        region: &RegionInfo,
        meta: &SstMeta,
    ) -> Result<IngestResponse> {
        self.ingest_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.ingest_hook.lock().unwrap().as_mut() {
            if let Some(resp) = hook(meta, region) {
                return Ok(resp);
            }
        }

        // The store rejects stale descriptors before touching data.
        let current = self.cluster.get_region_by_id(region.region.id).await;
        match current {
            Ok(current) => {
                if current.region.epoch != region.region.epoch {
                    let overlapping: Vec<_> = self
                        .cluster
                        .all_regions()
                        .into_iter()
                        .map(|info| info.region)
                        .filter(|r| {
                            r.contains(&meta.range.start) || r.contains(&meta.range.end)
                        })
                        .collect();
                    return Ok(IngestResponse {
                        error: Some(StoreError {
                            message: format!("region {} epoch changed", region.region.id),
                            epoch_not_match: Some(EpochNotMatchState {
                                current_regions: overlapping,
                            }),
                            ..Default::default()
                        }),
                    });
                }
                if let Some(leader) = current.leader {
                    if leader.store_id != store_id {
                        return Ok(IngestResponse {
                            error: Some(StoreError {
                                message: format!("peer on store {store_id} is not leader"),
                                not_leader: Some(NotLeaderHint {
                                    region_id: region.region.id,
                                    leader: Some(leader),
                                }),
                                ..Default::default()
                            }),
                        });
                    }
                }
            }
            Err(_) => {
                return Ok(IngestResponse {
                    error: Some(StoreError {
                        message: format!("region {} not found", region.region.id),
                        region_not_found: true,
                        ..Default::default()
                    }),
                });
            }
        }

        let pending = self
            .pending
            .lock()
            .unwrap()
            .remove(&(store_id, meta.uuid));
        match pending {
            Some(pairs) => {
                let mut committed = self.committed.lock().unwrap();
                for pair in pairs {
                    let key = pair.key.to_vec();
                    if pair.is_delete {
                        committed.remove(&key);
                    } else {
                        committed.insert(key, pair.value.to_vec());
                    }
                }
            }
            None => {
                // No streamed pairs: this is a downloaded backup file.
                self.ingested
                    .lock()
                    .unwrap()
                    .push((String::new(), region.region.id));
            }
        }
        Ok(IngestResponse::default())
    }

    async fn switch_mode(&self, _store_id: StoreId, _mode: SwitchMode) -> Result<()> {
        self.switch_mode_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_download_speed_limit(
        &self,
        _store_id: StoreId,
        _bytes_per_sec: u64,
    ) -> Result<()> {
        self.speed_limit_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
