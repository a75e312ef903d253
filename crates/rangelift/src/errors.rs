//! Error taxonomy for the restore engine.
//!
//! The innermost layer classifies, the call-site loop decides retry versus
//! surface. Variants therefore carry enough context (region ids, range
//! bounds, attempt counts) for a one-line category + chain report, and
//! [`Error::is_retryable`] encodes the classification the retry loops rely
//! on.

use thiserror::Error;

use crate::region::{Peer, RegionId};

/// Result type alias used across the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Primary error type for restore operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Backup metadata is inconsistent (overlapping or duplicated ranges).
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// A paginated region scan produced no regions for a non-empty interval.
    #[error("paginate scan region returns empty result")]
    ScanRegionEmpty,

    /// The region descriptor used for an RPC is stale.
    #[error("epoch not match: {message}")]
    EpochNotMatch {
        message: String,
        /// Fresh descriptors reported by the store, if any.
        current_regions: Vec<crate::region::Region>,
    },

    /// The addressed peer is no longer the region leader.
    #[error("not leader: region {region_id}")]
    NotLeader {
        region_id: RegionId,
        /// Hinted new leader, usable for an immediate retry.
        leader: Option<Peer>,
    },

    /// The region disappeared between scan and RPC (merged away).
    #[error("region {0} not found")]
    RegionNotFound(RegionId),

    /// The store asked us to back off.
    #[error("server is busy: {0}")]
    ServerIsBusy(String),

    /// The store has no room for the download or ingest.
    #[error("disk full: {0}")]
    DiskFull(String),

    /// Every candidate split key fell on or outside the region bounds.
    #[error("no valid key for region {0}")]
    NoValidKey(RegionId),

    /// Batch split gave up after exhausting its retry budget.
    #[error("batch split regions failed: {cause}")]
    BatchSplit {
        #[source]
        cause: Box<Error>,
    },

    /// Write-and-ingest gave up after exhausting its retry budget.
    #[error("write and ingest failed: {0}")]
    WriteAndIngest(String),

    /// Neither the data nor the index rule set covers a key.
    #[error("cannot find rewrite rule for key of len {key_len} in table {table_id}")]
    RewriteRuleNotFound { table_id: i64, key_len: usize },

    /// A key does not parse as a table-encoded key.
    #[error("invalid table key: {0}")]
    InvalidKey(String),

    /// Restore start ts lies beyond the log backup's resolved ts.
    #[error("start ts {start_ts} is greater than resolved ts {resolved_ts}")]
    RestoreTsConstrain { start_ts: u64, resolved_ts: u64 },

    /// Collaborator reported a missing schema.
    #[error("schema {0} not exists")]
    SchemaNotExists(String),

    /// Collaborator reported the target table already exists.
    #[error("table {0} already exists")]
    TableExists(String),

    /// The operation observed a cancelled token. Never retried.
    #[error("context canceled")]
    Canceled,

    /// Transport-level failure talking to the placement driver or a store.
    #[error("rpc failed: {0}")]
    Rpc(#[from] anyhow::Error),

    /// Store responded with an error we have no classification for. Fatal.
    #[error("unknown kv error: {0}")]
    KvUnknown(String),
}

impl Error {
    /// Whether a retry loop may attempt the operation again after a region
    /// refresh and/or backoff. Cancellation and metadata corruption never
    /// are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ScanRegionEmpty
            | Error::EpochNotMatch { .. }
            | Error::NotLeader { .. }
            | Error::RegionNotFound(_)
            | Error::ServerIsBusy(_)
            | Error::DiskFull(_)
            | Error::Rpc(_) => true,
            Error::InvalidRange(_)
            | Error::NoValidKey(_)
            | Error::BatchSplit { .. }
            | Error::WriteAndIngest(_)
            | Error::RewriteRuleNotFound { .. }
            | Error::InvalidKey(_)
            | Error::RestoreTsConstrain { .. }
            | Error::SchemaNotExists(_)
            | Error::TableExists(_)
            | Error::Canceled
            | Error::KvUnknown(_) => false,
        }
    }
}
