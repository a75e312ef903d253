//! Region descriptors and the placement-driver contract.
//!
//! Region descriptors are owned snapshots, never shared mutable state: a
//! worker holds the copy it scanned, and any `epoch not match` throws the
//! copy away and re-fetches. Keys inside descriptors are memcomparable
//! encoded; callers crossing from decoded user keys must go through
//! [`crate::codec`].

use async_trait::async_trait;

use crate::codec;
use crate::errors::{Error, Result};

/// Identifier of a region.
pub type RegionId = u64;
/// Identifier of a storage node.
pub type StoreId = u64;

/// `{version, conf_ver}` pair bumped on split/merge and membership change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegionEpoch {
    pub version: u64,
    pub conf_ver: u64,
}

/// One replica of a region on one store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Peer {
    pub id: u64,
    pub store_id: StoreId,
}

/// Contiguous key-range replication unit. Key interval is half-open
/// `[start_key, end_key)` over encoded keys; an empty `end_key` means +inf.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Region {
    pub id: RegionId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub epoch: RegionEpoch,
    pub peers: Vec<Peer>,
}

impl Region {
    /// Whether an encoded key falls inside this region.
    pub fn contains(&self, key: &[u8]) -> bool {
        codec::key_in_range(key, &self.start_key, &self.end_key)
    }

    /// Whether both encoded keys fall inside this region. Used for SST
    /// handles, whose `end` is the last key written rather than an exclusive
    /// bound.
    pub fn contains_range(&self, start: &[u8], end: &[u8]) -> bool {
        self.contains(start) && self.contains(end)
    }
}

/// A region snapshot together with its leader, if known.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegionInfo {
    pub region: Region,
    pub leader: Option<Peer>,
}

impl RegionInfo {
    pub fn new(region: Region, leader: Option<Peer>) -> Self {
        Self { region, leader }
    }

    /// The leader if reported, else the first peer. Regions always carry at
    /// least one peer by cluster invariant.
    pub fn leader_or_first_peer(&self) -> Option<Peer> {
        self.leader.or_else(|| self.region.peers.first().copied())
    }
}

/// A storage node hosting many peers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Store {
    pub id: StoreId,
    pub address: String,
    pub labels: Vec<(String, String)>,
}

/// State of a placement-driver operator. Terminal iff not `Running`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatorStatus {
    Running,
    Success,
    Timeout,
    Cancel,
    Replace,
}

impl OperatorStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperatorStatus::Running)
    }
}

/// Response of a `get_operator` poll.
#[derive(Clone, Debug)]
pub struct OperatorInfo {
    pub status: OperatorStatus,
    /// Operator description, e.g. `scatter-region`.
    pub desc: String,
}

/// A placement rule consumed/produced by the placement-rule surface.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlacementRule {
    pub group_id: String,
    pub id: String,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub role: String,
    pub count: usize,
}

/// Thin contract over the cluster's placement driver.
///
/// All keys are encoded. Implementations must be cheaply cloneable behind an
/// `Arc` and safe to call from many workers at once.
#[async_trait]
pub trait PlacementClient: Send + Sync {
    /// Region currently containing `key`.
    async fn get_region(&self, key: &[u8]) -> Result<RegionInfo>;

    /// Region by id; `Error::RegionNotFound` if it was merged away.
    async fn get_region_by_id(&self, region_id: RegionId) -> Result<RegionInfo>;

    /// Up to `limit` regions intersecting `[start, end)`, in key order.
    async fn scan_regions(&self, start: &[u8], end: &[u8], limit: usize)
        -> Result<Vec<RegionInfo>>;

    /// Store descriptor by id.
    async fn get_store(&self, store_id: StoreId) -> Result<Store>;

    /// All live (non-tombstone) stores.
    async fn all_stores(&self) -> Result<Vec<Store>>;

    /// Split `region` at a single key; returns the new left-hand region.
    async fn split_region(&self, region: &RegionInfo, key: &[u8]) -> Result<RegionInfo>;

    /// Split `region` at every key of `keys`; returns the updated origin and
    /// the new regions. Keys must lie strictly inside the region.
    async fn batch_split_regions(
        &self,
        region: &RegionInfo,
        keys: &[Vec<u8>],
    ) -> Result<(RegionInfo, Vec<RegionInfo>)>;

    /// Ask the placement driver to scatter a region's peers and leader.
    async fn scatter_region(&self, region: &RegionInfo) -> Result<()>;

    /// Poll the operator currently attached to a region.
    async fn get_operator(&self, region_id: RegionId) -> Result<OperatorInfo>;

    /// A fresh cluster timestamp.
    async fn get_ts(&self) -> Result<u64>;

    async fn get_placement_rule(
        &self,
        group_id: &str,
        rule_id: &str,
    ) -> Result<Option<PlacementRule>>;

    async fn set_placement_rule(&self, rule: PlacementRule) -> Result<()>;

    async fn delete_placement_rule(&self, group_id: &str, rule_id: &str) -> Result<()>;

    async fn set_stores_label(&self, stores: &[StoreId], key: &str, value: &str) -> Result<()>;
}

/// Scan every region intersecting `[start, end)`, `limit` per round-trip.
///
/// Stops once the last returned region is unbounded or reaches `end`. A scan
/// that yields no regions at all for a non-empty interval is reported as
/// [`Error::ScanRegionEmpty`]; the call site decides whether to retry.
pub async fn paginate_scan_regions(
    client: &dyn PlacementClient,
    start: &[u8],
    end: &[u8],
    limit: usize,
) -> Result<Vec<RegionInfo>> {
    if !end.is_empty() && start >= end {
        return Err(Error::InvalidRange(format!(
            "scan interval is empty or inverted ({} >= {} bytes)",
            start.len(),
            end.len()
        )));
    }

    let mut regions = Vec::new();
    let mut cursor = start.to_vec();
    loop {
        let batch = client.scan_regions(&cursor, end, limit).await?;
        if batch.is_empty() {
            // A page came back empty while the interval was not exhausted:
            // either the keyspace has a gap or the driver raced us.
            return Err(Error::ScanRegionEmpty);
        }
        let last_end = batch.last().expect("non-empty batch").region.end_key.clone();
        regions.extend(batch);
        if last_end.is_empty() || !codec::before_end(&last_end, end) {
            break;
        }
        cursor = last_end;
    }
    Ok(regions)
}
