//! End-to-end chunking and execution scenarios on generated databases

use partask::chunk::Chunk;
use partask::coordinator::{Coordinator, JobSpec};
use partask::database::artificial::ArtificialDataset;
use partask::database::{DatabaseSpec, Schema, TableSpec};
use partask::error::Outcome;
use partask::indexer::{self, IndexerSettings};
use partask::resource::MIB;
use partask::task::TaskRegistry;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

fn coordinator() -> Coordinator {
    Coordinator::new(TaskRegistry::with_builtin(), Arc::new(AtomicBool::new(false)))
}

fn plan(db: &DatabaseSpec, settings: &IndexerSettings, workers: usize) -> Vec<Chunk> {
    let schema = Schema::discover(db).unwrap().compile().unwrap();
    indexer::build_plan(db, &schema, settings, workers, None)
        .unwrap()
        .iter()
        .cloned()
        .collect()
}

/// Chunks tile every table and carry running record indexes
fn assert_contiguous(db: &DatabaseSpec, chunks: &[Chunk]) {
    for table in 0..db.tables.len() {
        let mut seen = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            let range = &chunk.ranges[table];
            assert_eq!(range.previous_record_index, seen, "chunk {} table {}", i, table);
            seen += range.records;
            if let Some(next) = chunks.get(i + 1) {
                assert_eq!(range.end, next.ranges[table].begin, "gap after chunk {} table {}", i, table);
            }
        }
        let len = std::fs::metadata(&db.tables[table].path).unwrap().len();
        assert_eq!(chunks.last().unwrap().ranges[table].end, len);
    }
}

fn line_at(path: &Path, offset: u64) -> String {
    let mut file = std::fs::File::open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    let mut line = String::new();
    BufReader::new(file.take(4096)).read_line(&mut line).unwrap();
    line
}

#[tokio::test]
async fn forced_record_limit_gives_four_contiguous_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let db = ArtificialDataset { root_records: 10_000, secondary_tables: 0, ..Default::default() }
        .generate(&dir.path().join("db"))
        .unwrap();
    let settings = IndexerSettings { max_chunk_records: Some(2500), ..Default::default() };

    let chunks = plan(&db, &settings, 4);
    assert_eq!(chunks.len(), 4);
    assert!(chunks.iter().all(|c| c.root_records() == 2500));
    assert_contiguous(&db, &chunks);

    let mut job = JobSpec::new(db, "record-count", dir.path().to_path_buf());
    job.indexer = settings;
    let summary = coordinator().run_simulated(&job, 4).await;
    assert!(summary.is_success(), "{:?}", summary.message);
    assert_eq!(summary.chunks_planned, 4);
    assert_eq!(summary.totals.records, vec![10_000]);
}

#[test]
fn secondary_ranges_follow_root_keys() {
    let dir = tempfile::tempdir().unwrap();
    let db = ArtificialDataset {
        root_records: 1000,
        secondary_tables: 1,
        max_rows_per_key: 10,
        fixed_rows_per_key: true,
        ..Default::default()
    }
    .generate(&dir.path().join("db"))
    .unwrap();
    let settings = IndexerSettings { max_chunk_records: Some(500), ..Default::default() };

    let chunks = plan(&db, &settings, 2);
    assert_eq!(chunks.len(), 2);
    assert_contiguous(&db, &chunks);

    assert_eq!(chunks[0].ranges[1].records, 5000);
    assert_eq!(chunks[1].ranges[1].records, 5000);
    assert_eq!(chunks[1].ranges[1].previous_record_index, 5000);

    // the second chunk's secondary range starts at the 501st root key
    let first = line_at(&db.tables[1].path, chunks[1].ranges[1].begin);
    assert!(first.starts_with(&ArtificialDataset::key(500)), "{}", first);
    let root = line_at(&db.tables[0].path, chunks[1].ranges[0].begin);
    assert!(root.starts_with(&ArtificialDataset::key(500)), "{}", root);
}

#[test]
fn oversized_chunk_splits_into_three() {
    let dir = tempfile::tempdir().unwrap();
    let db = ArtificialDataset { root_records: 900, secondary_tables: 2, ..Default::default() }
        .generate(&dir.path().join("db"))
        .unwrap();
    let schema = Schema::discover(&db).unwrap().compile().unwrap();
    let chunks = plan(&db, &IndexerSettings::default(), 1);
    assert_eq!(chunks.len(), 1);

    let pieces = indexer::split_chunk(&db, &schema, &chunks[0], 3).unwrap();
    assert_eq!(pieces.len(), 3);
    assert!(pieces.iter().all(|p| p.root_records() == 300));
    assert_contiguous(&db, &pieces);
    for table in 0..3 {
        let total: u64 = pieces.iter().map(|p| p.ranges[table].records).sum();
        assert_eq!(total, chunks[0].ranges[table].records);
    }
}

#[tokio::test]
async fn forced_splits_terminate_and_conserve_records() {
    let dir = tempfile::tempdir().unwrap();
    let db = ArtificialDataset { root_records: 3000, secondary_tables: 1, ..Default::default() }
        .generate(&dir.path().join("db"))
        .unwrap();
    let mut job = JobSpec::new(db, "record-count", dir.path().to_path_buf());
    job.indexer.max_chunk_records = Some(600);
    job.rebalance.force_split_above_records = Some(100);

    let summary = coordinator().run_local(&job, 3).await;
    assert!(summary.is_success(), "{:?}", summary.message);
    assert!(summary.totals.chunks_split > 0);
    assert_eq!(summary.totals.records, summary.expected_records);
    assert_eq!(summary.totals.records[0], 3000);
}

#[tokio::test]
async fn plans_and_results_are_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let db = ArtificialDataset { root_records: 4000, secondary_tables: 2, ..Default::default() }
        .generate(&dir.path().join("db"))
        .unwrap();
    let settings = IndexerSettings { micro_chunk_bytes: 16 * 1024, ..Default::default() };
    assert_eq!(plan(&db, &settings, 3), plan(&db, &settings, 3));

    let mut job = JobSpec::new(db, "record-count", dir.path().to_path_buf());
    job.indexer = settings;
    let first = coordinator().run_local(&job, 3).await;
    let second = coordinator().run_simulated(&job, 3).await;
    assert!(first.is_success() && second.is_success());
    assert_eq!(first.totals.records, second.totals.records);
    assert_eq!(first.task_summary["tables"], second.task_summary["tables"]);
}

#[test]
fn grant_fits_the_host() {
    let dir = tempfile::tempdir().unwrap();
    let db = ArtificialDataset { root_records: 2000, ..Default::default() }
        .generate(&dir.path().join("db"))
        .unwrap();
    let mut job = JobSpec::new(db, "record-count", dir.path().to_path_buf());
    job.limits.memory = Some(512 * MIB);

    let (_, prepared) = coordinator().prepare(&job, 8).unwrap();
    assert!(prepared.grant.worker_count >= 1);
    assert!(prepared.grant.total_memory() <= prepared.host.memory);
    prepared.release().unwrap();
}

#[tokio::test]
async fn interrupted_job_is_a_warning_and_leaves_no_files() {
    let dir = tempfile::tempdir().unwrap();
    let db = ArtificialDataset { root_records: 500, ..Default::default() }
        .generate(&dir.path().join("db"))
        .unwrap();
    let mut job = JobSpec::new(db, "column-extract", dir.path().to_path_buf());
    job.params = serde_json::json!({ "output": dir.path().join("out.tsv") });

    let cancel = Arc::new(AtomicBool::new(true));
    let summary = Coordinator::new(TaskRegistry::with_builtin(), cancel)
        .run_local(&job, 2)
        .await;

    assert_eq!(summary.outcome, Outcome::Interrupted);
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("partask-"))
        .collect();
    assert!(leftovers.is_empty());
    assert!(!dir.path().join("out.tsv").exists());
}

#[tokio::test]
async fn duplicate_root_keys_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("root.txt");
    let detail = dir.path().join("detail.txt");
    std::fs::write(&root, "id\tv\na\t1\na\t2\nb\t3\nc\t4\nc\t5\nd\t6\n").unwrap();
    std::fs::write(&detail, "id\tw\na\tx\nb\ty\nb\tz\nd\tq\n").unwrap();
    let db = DatabaseSpec {
        tables: vec![
            TableSpec { name: "root".into(), path: root, key_fields: vec!["id".into()] },
            TableSpec { name: "detail".into(), path: detail, key_fields: vec!["id".into()] },
        ],
        separator: '\t',
        header: true,
    };
    let mut job = JobSpec::new(db, "record-count", dir.path().to_path_buf());
    job.indexer.max_chunk_records = Some(1);

    let summary = coordinator().run_simulated(&job, 2).await;
    assert!(summary.is_success(), "{:?}", summary.message);
    assert_eq!(summary.chunks_planned, 4);
    assert_eq!(summary.totals.records, vec![6, 4]);
    assert_eq!(summary.totals.duplicates, 2);
    assert_eq!(summary.task_summary["tables"][0]["records"], 4);
    assert_eq!(summary.task_summary["tables"][1]["records"], 4);
}
