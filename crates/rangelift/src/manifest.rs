//! Backup manifest records and the table metadata consumed by the rewrite
//! engine.
//!
//! The manifest is produced by the backup side and arrives as one serialized
//! record: logical tables, DDL history, the backed-up files keyed by range
//! and column family, and either a transactional snapshot timestamp pair or
//! a set of raw key ranges.

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Column family of row data whose values are short enough to inline.
pub const CF_WRITE: &str = "write";
/// Column family of large values referenced from the write cf.
pub const CF_DEFAULT: &str = "default";

/// One immutable sorted-key backup file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    pub name: String,
    /// Decoded start key of the file's data.
    pub start_key: Vec<u8>,
    /// Decoded end key; empty means the file runs to its table's upper bound.
    pub end_key: Vec<u8>,
    pub cf: String,
    pub total_kvs: u64,
    pub total_bytes: u64,
    pub crc64_xor: u64,
}

impl BackupFile {
    /// Whether this file belongs to the write column family. Some backup
    /// producers only record the cf in the file name.
    pub fn is_write_cf(&self) -> bool {
        self.cf == CF_WRITE || self.name.contains(CF_WRITE)
    }
}

/// A backed-up raw key range (raw-kv mode only).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRange {
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub cf: String,
}

/// Index metadata of a backed-up table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub id: i64,
    pub name: String,
}

/// Table metadata, both as backed up and as recreated on the target.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub id: i64,
    pub db_name: String,
    pub name: String,
    pub indexes: Vec<IndexMeta>,
}

/// One DDL job from the backup's history, replayed in schema-version order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DdlJob {
    pub schema_version: i64,
    pub db_name: String,
    pub table_name: String,
    pub query: String,
}

/// The manifest of a whole backup.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BackupManifest {
    pub is_raw_kv: bool,
    pub start_version: u64,
    pub end_version: u64,
    pub files: Vec<BackupFile>,
    pub raw_ranges: Vec<RawRange>,
    pub tables: Vec<TableMeta>,
    /// Serialized DDL history, decoded lazily via [`BackupManifest::ddl_jobs`].
    pub ddls: Vec<u8>,
    pub path: String,
}

impl BackupManifest {
    /// Decode the serialized DDL history.
    pub fn ddl_jobs(&self) -> Result<Vec<DdlJob>> {
        if self.ddls.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&self.ddls)
            .map_err(|err| Error::InvalidRange(format!("undecodable ddl history: {err}")))
    }

    /// Whether the backup covers a span of versions rather than a single
    /// snapshot.
    pub fn is_incremental(&self) -> bool {
        !(self.start_version == self.end_version || self.start_version == 0)
    }
}
