//! End-to-end pipeline test: manifest in, merged ranges planned, regions
//! pre-split and scattered, files downloaded and ingested per region, one
//! progress tick per file.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use common::{MockCluster, MockStores};
use rangelift::client::{RestoreClient, SchemaEngine};
use rangelift::codec;
use rangelift::config::RestoreConfig;
use rangelift::errors::Result;
use rangelift::manifest::{BackupFile, BackupManifest, DdlJob, TableMeta, CF_WRITE};
use rangelift::merge::merge_file_ranges;

struct IdShiftSchema;

#[async_trait]
impl SchemaEngine for IdShiftSchema {
    async fn create_database(&self, _db_name: &str) -> Result<()> {
        Ok(())
    }

    async fn create_table(&self, table: &TableMeta) -> Result<TableMeta> {
        let mut new_table = table.clone();
        new_table.id += 1000;
        Ok(new_table)
    }

    async fn execute_ddl(&self, _job: &DdlJob) -> Result<()> {
        Ok(())
    }
}

fn table(id: i64, name: &str) -> TableMeta {
    TableMeta {
        id,
        db_name: "test".into(),
        name: name.into(),
        indexes: Vec::new(),
    }
}

fn file(name: &str, table_id: i64, start: i64, end: i64) -> BackupFile {
    BackupFile {
        name: name.into(),
        start_key: codec::row_key_with_handle(table_id, start),
        end_key: codec::row_key_with_handle(table_id, end),
        cf: CF_WRITE.into(),
        total_kvs: 100,
        total_bytes: 1 << 20,
        crc64_xor: 0,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn full_restore_pipeline_splits_then_imports_every_file() {
    common::init_tracing();
    let cluster = MockCluster::with_boundaries(&[b"", b""]);
    let stores = MockStores::new(cluster.clone());

    let tables = vec![table(10, "orders"), table(11, "lines")];
    let files = vec![
        file("t10_a.sst", 10, 0, 50),
        file("t10_b.sst", 10, 50, 100),
        file("t11_a.sst", 11, 0, 100),
    ];
    for f in &files {
        stores.register_file(&f.name, &f.start_key, &f.end_key);
    }

    let manifest = BackupManifest {
        is_raw_kv: false,
        start_version: 0,
        end_version: 400,
        files: files.clone(),
        raw_ranges: Vec::new(),
        tables: tables.clone(),
        ddls: Vec::new(),
        path: "local:///backup".into(),
    };

    let mut client = RestoreClient::new(
        cluster.clone(),
        stores.clone(),
        Arc::new(IdShiftSchema),
        RestoreConfig::default(),
    );
    client.init_manifest(manifest).unwrap();
    assert!(!client.is_raw_kv_mode());
    assert!(!client.is_incremental());

    let new_ts = client.get_ts().await.unwrap();
    let (rules, new_tables) = client.create_tables(&tables, new_ts).await.unwrap();
    assert_eq!(new_tables[0].id, 1010);
    assert_eq!(rules.data.len(), 2);

    // Plan ranges: per-table files merge, tables never merge together.
    let (ranges, stats) = merge_file_ranges(
        &files,
        RestoreConfig::default().merge_region_size_bytes,
        RestoreConfig::default().merge_region_key_count,
    )
    .unwrap();
    assert_eq!(stats.total_files, 3);
    assert_eq!(ranges.len(), 2);

    client.switch_to_import_mode().await.unwrap();

    let split_stats = client.split_and_scatter(&ranges, Some(&rules)).await.unwrap();
    // Boundaries land at the four rewritten range bounds.
    assert_eq!(split_stats.regions_created, 4);
    assert_eq!(split_stats.scattered, 4);
    let boundaries: Vec<Vec<u8>> = cluster
        .all_regions()
        .iter()
        .filter(|info| !info.region.start_key.is_empty())
        .map(|info| codec::decode_bytes(&info.region.start_key).unwrap())
        .collect();
    assert!(boundaries.contains(&codec::row_key_with_handle(1010, 0)));
    assert!(boundaries.contains(&codec::row_key_with_handle(1010, 100)));
    assert!(boundaries.contains(&codec::row_key_with_handle(1011, 0)));
    assert!(boundaries.contains(&codec::row_key_with_handle(1011, 100)));

    let (progress_tx, mut progress_rx) = mpsc::channel(16);
    client
        .restore_files(&files, &rules, Some(progress_tx))
        .await
        .unwrap();

    let mut ticks = 0;
    while progress_rx.try_recv().is_ok() {
        ticks += 1;
    }
    assert_eq!(ticks, 3, "one progress tick per file");

    // Each file covers exactly one post-split region.
    assert_eq!(stores.download_calls.load(Ordering::SeqCst), 3);
    assert_eq!(stores.ingested.lock().unwrap().len(), 3);

    client.switch_to_normal_mode().await.unwrap();
    assert_eq!(stores.switch_mode_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn raw_range_lookup_requires_full_coverage() {
    let cluster = MockCluster::with_boundaries(&[b"", b""]);
    let stores = MockStores::new(cluster.clone());
    let manifest = BackupManifest {
        is_raw_kv: true,
        raw_ranges: vec![rangelift::manifest::RawRange {
            start_key: b"a".to_vec(),
            end_key: b"m".to_vec(),
            cf: "default".into(),
        }],
        files: vec![BackupFile {
            name: "raw_1.sst".into(),
            start_key: b"b".to_vec(),
            end_key: b"h".to_vec(),
            cf: "default".into(),
            total_kvs: 1,
            total_bytes: 1,
            crc64_xor: 0,
        }],
        ..Default::default()
    };

    let mut client = RestoreClient::new(
        cluster,
        stores,
        Arc::new(IdShiftSchema),
        RestoreConfig::default(),
    );
    client.init_manifest(manifest).unwrap();
    assert!(client.is_raw_kv_mode());

    let files = client.files_in_raw_range(b"b", b"h", "default").unwrap();
    assert_eq!(files.len(), 1);

    // Partially covered request: the backup cannot satisfy it.
    assert!(client.files_in_raw_range(b"b", b"z", "default").is_err());
    // Wrong column family: no covering range at all.
    assert!(client.files_in_raw_range(b"b", b"h", "write").is_err());
}
