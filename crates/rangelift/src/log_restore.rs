//! Log restore: replaying a row-change log backup through the KV
//! write/ingest pipeline.
//!
//! A log backup lays out storage as `ddls/ddl.<reverseTs>` files (reverse
//! timestamps, so a lexicographic listing yields newest first) plus one
//! `t_<tableId>/` directory per table holding `cdclog.<ts>` segments and a
//! bare `cdclog` sentinel that sorts last. Decoding the segment payloads is
//! the [`RowEventDecoder`] collaborator's problem; this module owns file
//! selection, timestamp filtering, per-table buffering, and the flush into
//! [`KvIngestor::write_rows`].

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::client::SchemaEngine;
use crate::config::RestoreConfig;
use crate::errors::{Error, Result};
use crate::ingest::{KvIngestor, Pair};
use crate::manifest::DdlJob;
use crate::pool::WorkerPool;

const TABLE_LOG_PREFIX: &str = "t_";
const LOG_FILE_PREFIX: &str = "cdclog";
const META_FILE: &str = "log.meta";
const DDL_EVENTS_DIR: &str = "ddls";
const DDL_FILE_PREFIX: &str = "ddl";

/// The `log.meta` record written by the log backup.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LogMeta {
    /// Backed-up table id to quoted `` `schema`.`table` `` name.
    #[serde(default)]
    pub names: BTreeMap<i64, String>,
    #[serde(default)]
    pub global_resolved_ts: u64,
}

/// Whether a decoded pair belongs to row data or to an index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowEventKind {
    Data,
    Index,
}

/// One decoded row change.
#[derive(Clone, Debug)]
pub struct RowEvent {
    pub ts: u64,
    pub kind: RowEventKind,
    pub pair: Pair,
}

/// Storage holding the log backup.
#[async_trait]
pub trait LogStorage: Send + Sync {
    /// Visit every file under `prefix` in lexicographic path order.
    fn walk<'a>(
        &'a self,
        prefix: &'a str,
        visit: &'a mut (dyn FnMut(&str, u64) + Send + 'a),
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    async fn read(&self, path: &str) -> Result<Vec<u8>>;
}

/// External decoder turning one row-change segment into KV events.
pub trait RowEventDecoder: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<Vec<RowEvent>>;
}

/// Split a quoted `` `schema`.`table` `` name into its parts.
pub fn parse_quoted_name(name: &str) -> (String, String) {
    match name.split_once("`.`") {
        Some((schema, table)) => (
            schema.trim_start_matches('`').to_string(),
            table.trim_end_matches('`').to_string(),
        ),
        None => (String::new(), name.trim_matches('`').to_string()),
    }
}

/// Buffered row changes of one table, flushed by pair count or byte size.
struct TableBuffer {
    data_kvs: Vec<Pair>,
    index_kvs: Vec<Pair>,
    bytes: u64,
    flush_pairs: usize,
    flush_bytes: u64,
}

impl TableBuffer {
    fn new(flush_pairs: usize, flush_bytes: u64) -> Self {
        Self {
            data_kvs: Vec::new(),
            index_kvs: Vec::new(),
            bytes: 0,
            flush_pairs: flush_pairs.max(1),
            flush_bytes: flush_bytes.max(1),
        }
    }

    fn push(&mut self, event: RowEvent) {
        self.bytes += (event.pair.key.len() + event.pair.value.len()) as u64;
        match event.kind {
            RowEventKind::Data => self.data_kvs.push(event.pair),
            RowEventKind::Index => self.index_kvs.push(event.pair),
        }
    }

    fn should_flush(&self) -> bool {
        self.data_kvs.len() + self.index_kvs.len() >= self.flush_pairs
            || self.bytes >= self.flush_bytes
    }

    fn is_empty(&self) -> bool {
        self.data_kvs.is_empty() && self.index_kvs.is_empty()
    }
}

/// Restores a timestamp slice of a row-change log backup.
pub struct LogRestorer {
    storage: Arc<dyn LogStorage>,
    decoder: Arc<dyn RowEventDecoder>,
    schema: Arc<dyn SchemaEngine>,
    ingestor: KvIngestor,
    cfg: RestoreConfig,
    start_ts: u64,
    end_ts: u64,
    table_filter: Arc<dyn Fn(&str, &str) -> bool + Send + Sync>,
    /// Serializes every schema-changing call; data ingest never takes it.
    ddl_lock: Arc<Mutex<()>>,
    meta: LogMeta,
}

impl LogRestorer {
    /// `end_ts == 0` means "up to the backup's resolved timestamp".
    pub fn new(
        storage: Arc<dyn LogStorage>,
        decoder: Arc<dyn RowEventDecoder>,
        schema: Arc<dyn SchemaEngine>,
        ingestor: KvIngestor,
        cfg: RestoreConfig,
        start_ts: u64,
        end_ts: u64,
        table_filter: Arc<dyn Fn(&str, &str) -> bool + Send + Sync>,
    ) -> Self {
        Self {
            storage,
            decoder,
            schema,
            ingestor,
            cfg,
            start_ts,
            end_ts: if end_ts == 0 { u64::MAX } else { end_ts },
            table_filter,
            ddl_lock: Arc::new(Mutex::new(())),
            meta: LogMeta::default(),
        }
    }

    fn ts_in_range(&self, ts: u64) -> bool {
        self.start_ts <= ts && ts <= self.end_ts
    }

    /// Restore the whole slice: load `log.meta`, apply the DDL history, then
    /// replay every selected table's row changes concurrently.
    pub async fn restore(&mut self) -> Result<()> {
        let data = self.storage.read(META_FILE).await?;
        self.meta = serde_json::from_slice(&data)
            .map_err(|err| Error::InvalidRange(format!("undecodable {META_FILE}: {err}")))?;

        if self.start_ts > self.meta.global_resolved_ts {
            return Err(Error::RestoreTsConstrain {
                start_ts: self.start_ts,
                resolved_ts: self.meta.global_resolved_ts,
            });
        }
        if self.end_ts > self.meta.global_resolved_ts {
            tracing::info!(
                end_ts = self.end_ts,
                resolved_ts = self.meta.global_resolved_ts,
                "clamping end ts to the resolved ts to keep consistency"
            );
            self.end_ts = self.meta.global_resolved_ts;
        }

        let ddl_files = self.collect_ddl_files().await?;
        tracing::info!(files = ddl_files.len(), "collected ddl files");
        self.apply_ddl_files(&ddl_files).await?;

        let row_files = self.collect_row_change_files().await?;
        tracing::info!(tables = row_files.len(), "collected row change files");

        let pool = WorkerPool::new(self.cfg.importer_concurrency, "table-log-restore");
        let mut tasks = JoinSet::new();
        for (table_id, files) in row_files {
            let permit = pool.acquire().await;
            let worker = self.worker();
            tasks.spawn(async move {
                let _permit = permit;
                worker.restore_table(table_id, files).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|err| Error::Rpc(anyhow::anyhow!("table restore died: {err}")))??;
        }
        Ok(())
    }

    /// DDL files whose (reverse-encoded) timestamp falls inside the restore
    /// slice, in chronological (oldest commit first) replay order.
    pub async fn collect_ddl_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        let (start_ts, end_ts) = (self.start_ts, self.end_ts);
        self.storage
            .walk(DDL_EVENTS_DIR, &mut |path, _size| {
                let name = base_name(path);
                match ddl_file_ts(name) {
                    Some(ts) if start_ts <= ts && ts <= end_ts => files.push(path.to_string()),
                    Some(ts) => {
                        tracing::debug!(file = name, ts, "filtered ddl file by ts");
                    }
                    None => {
                        tracing::warn!(file = name, "malformed ddl file name, skipping");
                    }
                }
            })
            .await?;
        // File names carry reverse timestamps so listings yield newest
        // first; descending path order flips that back to chronological.
        files.sort_by(|a, b| b.cmp(a));
        Ok(files)
    }

    /// Row-change files per selected table, in replay order (sentinel file
    /// last).
    pub async fn collect_row_change_files(&self) -> Result<BTreeMap<i64, Vec<String>>> {
        let mut by_table: BTreeMap<i64, Vec<String>> = BTreeMap::new();
        for (&table_id, name) in &self.meta.names {
            let (schema, table) = parse_quoted_name(name);
            if !(self.table_filter)(&schema, &table) {
                tracing::info!(schema, table, table_id, "filtered table");
                continue;
            }
            let dir = format!("{TABLE_LOG_PREFIX}{table_id}");
            let mut files = Vec::new();
            let (start_ts, end_ts) = (self.start_ts, self.end_ts);
            self.storage
                .walk(&dir, &mut |path, _size| {
                    let file_name = base_name(path);
                    if file_name == LOG_FILE_PREFIX {
                        // Sentinel written by the file sink; always included.
                        files.push(path.to_string());
                        return;
                    }
                    match row_change_file_ts(file_name) {
                        Some(ts) if start_ts <= ts && ts <= end_ts => {
                            files.push(path.to_string());
                        }
                        Some(ts) => {
                            tracing::debug!(file = file_name, ts, "filtered row change file by ts");
                        }
                        None => {
                            tracing::warn!(
                                file = file_name,
                                "malformed row change file name, skipping"
                            );
                        }
                    }
                })
                .await?;
            if !files.is_empty() {
                files.sort_by(|a, b| {
                    // The bare sentinel holds the newest changes; replay it
                    // after every timestamped segment.
                    match (base_name(a) == LOG_FILE_PREFIX, base_name(b) == LOG_FILE_PREFIX) {
                        (true, false) => std::cmp::Ordering::Greater,
                        (false, true) => std::cmp::Ordering::Less,
                        _ => a.cmp(b),
                    }
                });
                by_table.insert(table_id, files);
            }
        }
        Ok(by_table)
    }

    async fn apply_ddl_files(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            tracing::info!("no ddls to restore");
            return Ok(());
        }
        for path in paths {
            let data = self.storage.read(path).await?;
            let jobs: Vec<DdlJob> = serde_json::from_slice(&data)
                .map_err(|err| Error::InvalidRange(format!("undecodable ddl file {path}: {err}")))?;
            for job in &jobs {
                let _guard = self.ddl_lock.lock().await;
                self.schema.execute_ddl(job).await?;
                tracing::info!(
                    db = %job.db_name,
                    query = %job.query,
                    schema_version = job.schema_version,
                    "executed ddl from log backup"
                );
            }
        }
        Ok(())
    }

    fn worker(&self) -> TableWorker {
        TableWorker {
            storage: self.storage.clone(),
            decoder: self.decoder.clone(),
            ingestor: self.ingestor.clone(),
            start_ts: self.start_ts,
            end_ts: self.end_ts,
            flush_pairs: self.cfg.batch_flush_kv_pairs,
            flush_bytes: self.cfg.batch_flush_kv_size,
        }
    }
}

/// Per-table replay state shared with the worker pool.
struct TableWorker {
    storage: Arc<dyn LogStorage>,
    decoder: Arc<dyn RowEventDecoder>,
    ingestor: KvIngestor,
    start_ts: u64,
    end_ts: u64,
    flush_pairs: usize,
    flush_bytes: u64,
}

impl TableWorker {
    async fn restore_table(&self, table_id: i64, files: Vec<String>) -> Result<()> {
        let mut buffer = TableBuffer::new(self.flush_pairs, self.flush_bytes);
        for path in &files {
            let data = self.storage.read(path).await?;
            for event in self.decoder.decode(&data)? {
                if event.ts < self.start_ts || event.ts > self.end_ts {
                    continue;
                }
                buffer.push(event);
                if buffer.should_flush() {
                    self.flush(&mut buffer, table_id).await?;
                }
            }
        }
        self.flush(&mut buffer, table_id).await?;
        Ok(())
    }

    async fn flush(&self, buffer: &mut TableBuffer, table_id: i64) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        tracing::info!(
            table = table_id,
            data_kvs = buffer.data_kvs.len(),
            index_kvs = buffer.index_kvs.len(),
            "applying kv changes"
        );
        self.ingestor
            .write_rows(std::mem::take(&mut buffer.data_kvs))
            .await?;
        self.ingestor
            .write_rows(std::mem::take(&mut buffer.index_kvs))
            .await?;
        buffer.bytes = 0;
        Ok(())
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Timestamp of a `ddl.<reverseTs>` file name. Listings return UTF-8 binary
/// order, so the backup stores `u64::MAX - commit_ts` to get newest-first.
fn ddl_file_ts(file_name: &str) -> Option<u64> {
    let (prefix, rest) = file_name.split_once('.')?;
    if prefix != DDL_FILE_PREFIX {
        return None;
    }
    let reversed: u64 = rest.parse().ok()?;
    Some(u64::MAX - reversed)
}

/// Timestamp of a `cdclog.<ts>` file name.
fn row_change_file_ts(file_name: &str) -> Option<u64> {
    let (prefix, rest) = file_name.split_once('.')?;
    if prefix != LOG_FILE_PREFIX {
        return None;
    }
    rest.parse().ok()
}
