//! Top-level restore orchestration.
//!
//! The client ties the pipeline together: it loads the backup manifest,
//! recreates the schema through the external SQL engine, derives rewrite
//! rules from old and new table metadata, and fans the backup files out over
//! a bounded worker pool into the [`FileImporter`]. Schema-changing calls
//! serialize on one process-wide lock; data ingest never touches it.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::config::RestoreConfig;
use crate::errors::{Error, Result};
use crate::import::{FileImporter, ImportClient, SwitchMode};
use crate::manifest::{BackupFile, BackupManifest, DdlJob, TableMeta};
use crate::merge::MergedRange;
use crate::pool::WorkerPool;
use crate::region::PlacementClient;
use crate::rewrite::{table_rewrite_rules, RewriteRules};
use crate::split::{RegionSplitter, SplitStats};

/// External SQL engine recreating schema on the target cluster. DDL
/// execution itself is out of scope; the engine only reports the metadata
/// the target allocated.
#[async_trait]
pub trait SchemaEngine: Send + Sync {
    async fn create_database(&self, db_name: &str) -> Result<()>;

    /// Recreate `table`; returns the metadata with the newly allocated table
    /// and index ids.
    async fn create_table(&self, table: &TableMeta) -> Result<TableMeta>;

    async fn execute_ddl(&self, job: &DdlJob) -> Result<()>;
}

/// Drives one restore job against one cluster.
pub struct RestoreClient {
    cfg: RestoreConfig,
    placement: Arc<dyn PlacementClient>,
    import: Arc<dyn ImportClient>,
    schema: Arc<dyn SchemaEngine>,
    token: CancellationToken,
    manifest: Option<BackupManifest>,
    importer: Option<FileImporter>,
    ddl_lock: Arc<Mutex<()>>,
    speed_limited: AtomicBool,
}

impl RestoreClient {
    pub fn new(
        placement: Arc<dyn PlacementClient>,
        import: Arc<dyn ImportClient>,
        schema: Arc<dyn SchemaEngine>,
        cfg: RestoreConfig,
    ) -> Self {
        Self {
            cfg,
            placement,
            import,
            schema,
            token: CancellationToken::new(),
            manifest: None,
            importer: None,
            ddl_lock: Arc::new(Mutex::new(())),
            speed_limited: AtomicBool::new(false),
        }
    }

    /// Token cancelling the whole restore; cancelled automatically on the
    /// first fatal file failure.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Load the manifest and build the importer for its mode.
    pub fn init_manifest(&mut self, manifest: BackupManifest) -> Result<()> {
        let ddl_jobs = manifest.ddl_jobs()?;
        tracing::info!(
            files = manifest.files.len(),
            tables = manifest.tables.len(),
            ddl_jobs = ddl_jobs.len(),
            raw_kv = manifest.is_raw_kv,
            "loaded backup manifest"
        );
        self.importer = Some(FileImporter::new(
            self.placement.clone(),
            self.import.clone(),
            self.cfg.clone(),
            manifest.is_raw_kv,
            self.token.clone(),
        ));
        self.manifest = Some(manifest);
        Ok(())
    }

    pub fn manifest(&self) -> Option<&BackupManifest> {
        self.manifest.as_ref()
    }

    /// Raw-kv backups forbid transactional recovery.
    pub fn is_raw_kv_mode(&self) -> bool {
        self.manifest.as_ref().is_some_and(|m| m.is_raw_kv)
    }

    pub fn is_incremental(&self) -> bool {
        self.manifest.as_ref().is_some_and(|m| m.is_incremental())
    }

    /// A fresh restore timestamp from the placement driver.
    pub async fn get_ts(&self) -> Result<u64> {
        self.placement.get_ts().await
    }

    /// Recreate every table and accumulate the rewrite rules mapping the
    /// backup's keys onto the new ids.
    pub async fn create_tables(
        &self,
        tables: &[TableMeta],
        new_ts: u64,
    ) -> Result<(RewriteRules, Vec<TableMeta>)> {
        let mut rules = RewriteRules::default();
        let mut new_tables = Vec::with_capacity(tables.len());
        for table in tables {
            let new_table = {
                let _guard = self.ddl_lock.lock().await;
                self.schema.create_table(table).await?
            };
            rules.extend(table_rewrite_rules(table, &new_table, new_ts));
            new_tables.push(new_table);
        }
        Ok((rules, new_tables))
    }

    /// Replay the backup's DDL history in schema-version order.
    pub async fn exec_ddls(&self, mut jobs: Vec<DdlJob>) -> Result<()> {
        jobs.sort_by_key(|job| job.schema_version);
        for job in &jobs {
            {
                let _guard = self.ddl_lock.lock().await;
                self.schema.execute_ddl(job).await?;
            }
            tracing::info!(
                db = %job.db_name,
                query = %job.query,
                schema_version = job.schema_version,
                "executed ddl"
            );
        }
        Ok(())
    }

    /// Pre-split and scatter regions for the merged ranges about to be
    /// restored. Rules retarget the boundaries into the recreated tables'
    /// key space; pass `None` in raw mode.
    pub async fn split_and_scatter(
        &self,
        ranges: &[MergedRange],
        rules: Option<&RewriteRules>,
    ) -> Result<SplitStats> {
        RegionSplitter::new(self.placement.clone(), self.cfg.clone())
            .split_and_scatter(ranges, rules, &self.token)
            .await
    }

    /// Import backup files on the worker pool. One progress tick is emitted
    /// per restored file. The first failure cancels the run and surfaces.
    pub async fn restore_files(
        &self,
        files: &[BackupFile],
        rules: &RewriteRules,
        progress: Option<mpsc::Sender<()>>,
    ) -> Result<()> {
        let importer = self.importer()?;
        self.apply_speed_limit_once(importer).await?;

        let start = Instant::now();
        tracing::debug!(files = files.len(), "start to restore files");
        let result = self
            .run_file_imports(importer, files, Arc::new(rules.clone()), progress)
            .await;
        match &result {
            Ok(()) => tracing::info!(
                files = files.len(),
                take = ?start.elapsed(),
                "restored files"
            ),
            Err(err) => tracing::error!(error = %err, "restore files failed"),
        }
        result
    }

    /// Restore raw-mode files covering `[start_key, end_key)`. No rewrite
    /// rules apply in raw mode.
    pub async fn restore_raw(
        &mut self,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        files: &[BackupFile],
        progress: Option<mpsc::Sender<()>>,
    ) -> Result<()> {
        {
            let importer = self
                .importer
                .as_mut()
                .ok_or_else(|| Error::InvalidRange("manifest not initialized".into()))?;
            importer.set_raw_range(start_key, end_key)?;
        }
        let importer = self.importer()?;
        self.apply_speed_limit_once(importer).await?;
        self.run_file_imports(importer, files, Arc::new(RewriteRules::default()), progress)
            .await
    }

    /// Switch every store into import mode (weaker compactions, faster
    /// ingestion).
    pub async fn switch_to_import_mode(&self) -> Result<()> {
        self.importer()?.switch_mode(SwitchMode::Import).await
    }

    /// Switch every store back to normal serving mode.
    pub async fn switch_to_normal_mode(&self) -> Result<()> {
        self.importer()?.switch_mode(SwitchMode::Normal).await
    }

    /// Backup files intersecting the raw range `[start_key, end_key)` of one
    /// column family. The range must be fully covered by a single backed-up
    /// raw range.
    pub fn files_in_raw_range(
        &self,
        start_key: &[u8],
        end_key: &[u8],
        cf: &str,
    ) -> Result<Vec<BackupFile>> {
        let manifest = self
            .manifest
            .as_ref()
            .ok_or_else(|| Error::InvalidRange("manifest not initialized".into()))?;
        if !manifest.is_raw_kv {
            return Err(Error::InvalidRange(
                "the backup data is not in raw kv mode".into(),
            ));
        }

        for raw_range in &manifest.raw_ranges {
            if raw_range.cf != cf {
                continue;
            }
            let disjoint = (!raw_range.end_key.is_empty() && start_key >= raw_range.end_key.as_slice())
                || (!end_key.is_empty() && raw_range.start_key.as_slice() >= end_key);
            if disjoint {
                continue;
            }
            if start_key < raw_range.start_key.as_slice()
                || codec::cmp_end_key(end_key, &raw_range.end_key) == Ordering::Greater
            {
                // Only part of the requested range was backed up.
                return Err(Error::InvalidRange("no backup data in the range".into()));
            }

            let mut files = Vec::new();
            for file in &manifest.files {
                if file.cf != cf {
                    continue;
                }
                if !file.end_key.is_empty() && file.end_key.as_slice() < start_key {
                    continue;
                }
                // The end bound is exclusive: a file starting there is out.
                if !end_key.is_empty() && end_key <= file.start_key.as_slice() {
                    continue;
                }
                files.push(file.clone());
            }
            // At most one backed-up range covers the request.
            return Ok(files);
        }

        Err(Error::InvalidRange("no backup data in the range".into()))
    }

    fn importer(&self) -> Result<&FileImporter> {
        self.importer
            .as_ref()
            .ok_or_else(|| Error::InvalidRange("manifest not initialized".into()))
    }

    async fn apply_speed_limit_once(&self, importer: &FileImporter) -> Result<()> {
        if self.cfg.rate_limit_bytes_per_sec == 0 {
            return Ok(());
        }
        if self
            .speed_limited
            .compare_exchange(false, true, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
            .is_ok()
        {
            if let Err(err) = importer.apply_download_speed_limit().await {
                self.speed_limited.store(false, AtomicOrdering::SeqCst);
                return Err(err);
            }
        }
        Ok(())
    }

    async fn run_file_imports(
        &self,
        importer: &FileImporter,
        files: &[BackupFile],
        rules: Arc<RewriteRules>,
        progress: Option<mpsc::Sender<()>>,
    ) -> Result<()> {
        let pool = WorkerPool::new(self.cfg.importer_concurrency, "file-import");
        let mut tasks = JoinSet::new();
        for file in files.iter().cloned() {
            let permit = pool.acquire().await;
            let importer = importer.clone();
            let rules = rules.clone();
            let progress = progress.clone();
            let token = self.token.clone();
            tasks.spawn(async move {
                let _permit = permit;
                if token.is_cancelled() {
                    return Err(Error::Canceled);
                }
                importer.import(&file, &rules).await?;
                if let Some(tx) = progress {
                    let _ = tx.send(()).await;
                }
                Ok(())
            });
        }

        let mut first_err: Option<Error> = None;
        while let Some(joined) = tasks.join_next().await {
            let result =
                joined.map_err(|err| Error::Rpc(anyhow::anyhow!("import worker died: {err}")))?;
            match result {
                Ok(()) => {}
                Err(Error::Canceled) if first_err.is_some() => {
                    // Collateral of cancelling the run below.
                }
                Err(err) => {
                    if first_err.is_none() {
                        // Stop handing out new work; in-flight RPCs surface
                        // cancellation on their next check.
                        self.token.cancel();
                        first_err = Some(err);
                    }
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
