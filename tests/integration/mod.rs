//! End-to-end tests for the custody pipelines
//!
//! Every backend is in memory except where a test talks HTTP, in which case
//! a scripted [`MockServer`] stands in for the remote service.

use crate::support::{MockResponse, MockServer, ReplayArchive, CAPTURE_TIMESTAMP};
use ::custody::*;
use ::custody::types::{fields, ARCHIVE_PLACEHOLDER, FILES_TABLE, METADATA_PLACEHOLDER, MUSICS_TABLE};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing_test::traced_test;
use url::Url;

const TEST_CONTENT_SHA256: &str = "6ae8a75555209fd6c44157c0aed8016e763ff435a19cf186f76863140143ff72";

/// Test harness holding a fully in-memory custody context
pub struct CustodyTestHarness {
    pub temp_dir: TempDir,
    pub custody: Custody,
    pub backup: Arc<ObjectStorage>,
    pub archive: Arc<ReplayArchive>,
}

impl CustodyTestHarness {
    pub fn new() -> Self {
        Self::with(|builder| builder)
    }

    /// Harness with extra builder settings applied on top of the defaults
    pub fn with(configure: impl FnOnce(CustodyBuilder) -> CustodyBuilder) -> Self {
        let backup = Arc::new(ObjectStorage::memory("Backup Files"));
        let archive = ReplayArchive::new();
        let builder = CustodyBuilder::new()
            .storage(Arc::new(ObjectStorage::memory("Files")))
            .storage(backup.clone())
            .default_storage("Files")
            .archive(archive.clone())
            .shards(1);
        let custody = configure(builder).build().unwrap();

        Self {
            temp_dir: TempDir::new().unwrap(),
            custody,
            backup,
            archive,
        }
    }

    pub fn write_file(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Ingest a file and give it a backup copy and an archive copy
    pub async fn ingest_with_copies(&self, name: &str, content: &[u8]) -> Record {
        let path = self.write_file(name, content);
        let record = self.custody.ingest(&path).await.unwrap();
        self.backup.put_bytes(name, content.to_vec()).await.unwrap();
        self.archive.store(name, content.to_vec());
        self.custody.archive(&record.id).await.unwrap();
        self.custody.files().await.unwrap().get(&record.id).await.unwrap()
    }

    pub async fn all_files(&self) -> Vec<Record> {
        self.custody
            .files()
            .await
            .unwrap()
            .get_all(None, &[])
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap()
    }
}

fn wayback_config(server: &MockServer) -> ArchiveConfig {
    ArchiveConfig {
        api_base: server.url(),
        access_key: "key".to_string(),
        secret_key: "secret".to_string(),
        poll_interval: Duration::from_millis(10),
        timeout: Duration::from_secs(5),
        max_retries: 0,
        retry_backoff: Duration::from_millis(10),
        ..ArchiveConfig::default()
    }
}

/// Captures through the real client, serves archived bytes from memory
#[derive(Debug)]
struct CaptureThenReplay {
    wayback: WaybackClient,
    content: Bytes,
}

#[async_trait]
impl Archive for CaptureThenReplay {
    async fn capture(&self, url: &Url) -> Result<String> {
        self.wayback.capture(url).await
    }

    async fn retrieve(&self, _archive_url: &str) -> Result<storage::ByteStream> {
        let content = self.content.clone();
        Ok(futures::stream::once(async move { Ok(content) }).boxed())
    }
}

#[tokio::test]
async fn test_ingest_archive_verify_end_to_end() {
    let server = MockServer::start(vec![
        MockResponse::json(json!({ "url": "memory:///Files/t.txt", "job_id": "123" })),
        MockResponse::json(json!({ "status": "pending" })),
        MockResponse::json(json!({
            "status": "success",
            "timestamp": "20230101123456",
            "original_url": "http://example.com/t.txt"
        })),
    ])
    .await;
    let backup = Arc::new(ObjectStorage::memory("Backup Files"));
    let archive = CaptureThenReplay {
        wayback: WaybackClient::new(wayback_config(&server)).unwrap(),
        content: Bytes::from_static(b"test content"),
    };
    let custody = CustodyBuilder::new()
        .storage(Arc::new(ObjectStorage::memory("Files")))
        .storage(backup.clone())
        .default_storage("Files")
        .archive(Arc::new(archive))
        .build()
        .unwrap();

    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("t.txt");
    std::fs::write(&path, b"test content").unwrap();

    // Ingest
    let record = custody.ingest(&path).await.unwrap();
    assert_eq!(record.text(fields::NAME), Some("t.txt"));
    assert_eq!(record.integer(fields::SIZE), Some(12));
    assert_eq!(record.text(fields::SHA256), Some(TEST_CONTENT_SHA256));
    assert_eq!(record.text(fields::STORAGE), Some("Files"));
    assert_eq!(record.text(fields::INTERNET_ARCHIVE), Some(ARCHIVE_PLACEHOLDER));
    assert!(custody.storage("Files").unwrap().file_exists("t.txt").await.unwrap());

    // Archive
    let url = custody.archive(&record.id).await.unwrap();
    assert_eq!(url, "https://web.archive.org/web/20230101123456/http://example.com/t.txt");
    let stored = custody.files().await.unwrap().get(&record.id).await.unwrap();
    assert_eq!(stored.text(fields::INTERNET_ARCHIVE), Some(url.as_str()));

    let requests = server.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].path, "/save");
    assert_eq!(requests[0].header("authorization"), Some("LOW key:secret"));
    assert!(requests[0].body.contains("url=memory"));
    assert!(requests[0].body.contains("skip_first_archive=1"));
    assert_eq!(requests[1].path, "/save/status/123");

    // Verify
    backup.put_bytes("t.txt", &b"test content"[..]).await.unwrap();
    assert!(custody.verify(&record.id).await.unwrap());
}

#[tokio::test]
async fn test_duplicate_ingest_is_rejected() {
    let harness = CustodyTestHarness::new();
    let path = harness.write_file("t.txt", b"test content");

    harness.custody.ingest(&path).await.unwrap();
    let err = harness.custody.ingest(&path).await.unwrap_err();

    assert!(matches!(err, CustodyError::FileExists(ref name) if name == "t.txt"));
    assert_eq!(harness.all_files().await.len(), 1);
}

#[tokio::test]
#[traced_test]
async fn test_verification_isolates_failing_file() {
    let harness = CustodyTestHarness::new();
    for i in 1..=5 {
        let name = format!("file{}.txt", i);
        let content = format!("content of file {}", i);
        if i == 3 {
            // No backup copy: fetching it fails.
            let path = harness.write_file(&name, content.as_bytes());
            let record = harness.custody.ingest(&path).await.unwrap();
            harness.archive.store(&name, content.into_bytes());
            harness.custody.archive(&record.id).await.unwrap();
        } else {
            harness.ingest_with_copies(&name, content.as_bytes()).await;
        }
    }

    let err = harness.custody.verify_shard(0).await.unwrap_err();
    match err {
        CustodyError::Verification { failed } => assert_eq!(failed, vec!["file3.txt".to_string()]),
        other => panic!("unexpected error: {}", other),
    }

    for name in ["file1.txt", "file2.txt", "file4.txt", "file5.txt"] {
        assert!(logs_contain(&format!("Verified file `{}`", name)));
    }
    assert!(!logs_contain("Verified file `file3.txt`"));
    assert!(logs_contain("Error while verifying file `file3.txt`"));
    assert!(logs_contain("Verification failed for the following files: file3.txt"));
}

#[tokio::test]
async fn test_verify_detects_corrupted_archive_copy() {
    let harness = CustodyTestHarness::new();
    let record = harness.ingest_with_copies("a.txt", b"original bytes").await;
    assert!(harness.custody.verify(&record.id).await.unwrap());

    harness.archive.store("a.txt", &b"tampered bytes"[..]);
    assert!(!harness.custody.verify(&record.id).await.unwrap());
    match harness.custody.verify_file(&record).await.unwrap() {
        FileCheck::Mismatch { expected, primary, backup, archive } => {
            assert_eq!(expected, primary);
            assert_eq!(expected, backup);
            assert_ne!(expected, archive);
        }
        other => panic!("unexpected check: {:?}", other),
    }
}

#[tokio::test]
async fn test_unarchived_file_is_skipped() {
    let harness = CustodyTestHarness::new();
    let path = harness.write_file("new.txt", b"fresh");
    let record = harness.custody.ingest(&path).await.unwrap();

    assert!(harness.custody.verify(&record.id).await.unwrap());
    let summary = harness.custody.verify_shard(0).await.unwrap();
    assert_eq!(summary.checked, 1);
    assert!(summary.passed.is_empty());
    assert_eq!(summary.skipped, vec!["new.txt".to_string()]);
    assert!(harness.archive.captures().is_empty());
}

#[tokio::test]
async fn test_archive_missing_captures_before_verifying() {
    let harness = CustodyTestHarness::with(|builder| builder.archive_missing(true));
    let path = harness.write_file("late.txt", b"archive me");
    let record = harness.custody.ingest(&path).await.unwrap();
    harness.backup.put_bytes("late.txt", &b"archive me"[..]).await.unwrap();
    harness.archive.store("late.txt", &b"archive me"[..]);

    assert!(harness.custody.verify(&record.id).await.unwrap());
    assert_eq!(harness.archive.captures().len(), 1);

    let stored = harness.custody.files().await.unwrap().get(&record.id).await.unwrap();
    assert_eq!(
        stored.text(fields::INTERNET_ARCHIVE),
        Some(format!("https://web.archive.org/web/{}/http://example.com/late.txt", CAPTURE_TIMESTAMP).as_str())
    );
}

#[tokio::test]
async fn test_shards_cover_newest_first() {
    let harness = CustodyTestHarness::with(|builder| builder.shards(2));
    for name in ["a.txt", "b.txt", "c.txt"] {
        harness.ingest_with_copies(name, name.as_bytes()).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let first = harness.custody.verify_shard(0).await.unwrap();
    let second = harness.custody.verify_shard(1).await.unwrap();
    assert_eq!(first.passed, vec!["b.txt".to_string(), "c.txt".to_string()]);
    assert_eq!(second.passed, vec!["a.txt".to_string()]);
    assert_eq!(first.total_records, 3);

    let err = harness.custody.verify_shard(2).await.unwrap_err();
    assert!(matches!(err, CustodyError::InvalidConfiguration(_)));
}

#[tokio::test]
async fn test_archive_pending_archives_only_placeholders() {
    let harness = CustodyTestHarness::new();
    harness.ingest_with_copies("done.txt", b"done").await;
    for name in ["x.txt", "y.txt"] {
        let path = harness.write_file(name, name.as_bytes());
        harness.custody.ingest(&path).await.unwrap();
    }

    let urls = harness.custody.archive_pending().await.unwrap();
    assert_eq!(urls.len(), 2);
    assert_eq!(harness.archive.captures().len(), 3);
    assert!(harness
        .all_files()
        .await
        .iter()
        .all(|r| r.text(fields::INTERNET_ARCHIVE) != Some(ARCHIVE_PLACEHOLDER)));
}

#[tokio::test]
async fn test_wayback_error_is_reported_with_body() {
    let server = MockServer::start(vec![MockResponse::status(400, "bad request")]).await;
    let client = WaybackClient::new(wayback_config(&server)).unwrap();

    let err = client.capture(&Url::parse("http://example.com/t.txt").unwrap()).await.unwrap_err();
    assert!(matches!(err, CustodyError::Archive(ref msg) if msg == "Error: bad request"));
}

#[tokio::test]
async fn test_wayback_failed_job_is_reported() {
    let failed = json!({ "status": "error", "message": "Too many captures" });
    let server = MockServer::start(vec![
        MockResponse::json(json!({ "job_id": 7 })),
        MockResponse::json(failed.clone()),
    ])
    .await;
    let client = WaybackClient::new(wayback_config(&server)).unwrap();

    let err = client.capture(&Url::parse("http://example.com/t.txt").unwrap()).await.unwrap_err();
    assert!(matches!(err, CustodyError::Archive(ref msg) if msg == &format!("Error: {}", failed)));
    assert_eq!(server.requests()[1].path, "/save/status/7");
}

#[tokio::test]
async fn test_wayback_poll_times_out() {
    let pending: Vec<MockResponse> = std::iter::once(MockResponse::json(json!({ "job_id": "slow" })))
        .chain((0..50).map(|_| MockResponse::json(json!({ "status": "pending" }))))
        .collect();
    let server = MockServer::start(pending).await;
    let config = ArchiveConfig {
        timeout: Duration::from_millis(60),
        poll_interval: Duration::from_millis(20),
        ..wayback_config(&server)
    };
    let client = WaybackClient::new(config).unwrap();

    let err = client.capture(&Url::parse("http://example.com/t.txt").unwrap()).await.unwrap_err();
    assert!(matches!(err, CustodyError::ArchiveTimedOut(d) if d == Duration::from_millis(60)));
}

#[tokio::test]
async fn test_wayback_retries_transient_failures() {
    let server = MockServer::start(vec![
        MockResponse::status(503, "busy"),
        MockResponse::json(json!({ "job_id": "123" })),
        MockResponse::status(429, "slow down"),
        MockResponse::json(json!({
            "status": "success",
            "timestamp": "20230101123456",
            "original_url": "http://example.com/t.txt"
        })),
    ])
    .await;
    let config = ArchiveConfig { max_retries: 2, ..wayback_config(&server) };
    let client = WaybackClient::new(config).unwrap();

    let url = client.capture(&Url::parse("http://example.com/t.txt").unwrap()).await.unwrap();
    assert_eq!(url, "https://web.archive.org/web/20230101123456/http://example.com/t.txt");
    assert_eq!(server.requests().len(), 4);
}

#[tokio::test]
async fn test_wayback_capture_is_retrieved_for_verification() {
    let server = MockServer::start(vec![
        MockResponse::json(json!({ "job_id": "123" })),
        MockResponse::json(json!({
            "status": "success",
            "timestamp": CAPTURE_TIMESTAMP,
            "original_url": "http://example.com/t.txt"
        })),
        MockResponse::status(200, "test content"),
        MockResponse::status(200, "tampered bytes"),
    ])
    .await;
    let config = ArchiveConfig {
        web_base: format!("{}/web/", server.url()),
        ..wayback_config(&server)
    };
    let backup = Arc::new(ObjectStorage::memory("Backup Files"));
    let custody = CustodyBuilder::new()
        .storage(Arc::new(ObjectStorage::memory("Files")))
        .storage(backup.clone())
        .default_storage("Files")
        .archive(Arc::new(WaybackClient::new(config).unwrap()))
        .build()
        .unwrap();
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("t.txt");
    std::fs::write(&path, b"test content").unwrap();
    let record = custody.ingest(&path).await.unwrap();
    backup.put_bytes("t.txt", &b"test content"[..]).await.unwrap();

    let url = custody.archive(&record.id).await.unwrap();
    assert_eq!(url, format!("{}/web/{}/http://example.com/t.txt", server.url(), CAPTURE_TIMESTAMP));
    let record = custody.files().await.unwrap().get(&record.id).await.unwrap();

    assert_eq!(custody.verify_file(&record).await.unwrap(), FileCheck::Verified);
    match custody.verify_file(&record).await.unwrap() {
        FileCheck::Mismatch { expected, primary, backup, archive } => {
            assert_eq!(expected, TEST_CONTENT_SHA256);
            assert_eq!(primary, TEST_CONTENT_SHA256);
            assert_eq!(backup, TEST_CONTENT_SHA256);
            assert_eq!(archive, hash::hash_bytes(b"tampered bytes", HashAlgorithm::Sha256));
        }
        other => panic!("unexpected check: {:?}", other),
    }

    let requests = server.requests();
    assert_eq!(requests.len(), 4);
    assert_eq!(requests[2].method, "GET");
    assert_eq!(requests[2].path, format!("/web/{}/http://example.com/t.txt", CAPTURE_TIMESTAMP));
    assert!(requests[2].header("authorization").is_none());
}

#[tokio::test]
async fn test_stalled_capture_download_times_out() {
    let server = MockServer::start(vec![MockResponse::stalled("partial")]).await;
    let config = ArchiveConfig {
        download_timeout: Duration::from_millis(200),
        ..wayback_config(&server)
    };
    let client = WaybackClient::new(config).unwrap();

    let stream = client
        .retrieve(&format!("{}/web/{}/http://example.com/t.txt", server.url(), CAPTURE_TIMESTAMP))
        .await
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), calculate_hash(stream, HashAlgorithm::Sha256))
        .await
        .expect("a stalled body must hit the read timeout");
    assert!(matches!(outcome, Err(CustodyError::Http(_))));
}

#[tokio::test]
async fn test_failed_archive_leaves_placeholder() {
    let server = MockServer::start(vec![MockResponse::status(400, "bad request")]).await;
    let custody = CustodyBuilder::new()
        .storage(Arc::new(ObjectStorage::memory("Files")))
        .default_storage("Files")
        .archive(Arc::new(WaybackClient::new(wayback_config(&server)).unwrap()))
        .build()
        .unwrap();
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("t.txt");
    std::fs::write(&path, b"test content").unwrap();
    let record = custody.ingest(&path).await.unwrap();

    assert!(custody.archive(&record.id).await.is_err());
    let stored = custody.files().await.unwrap().get(&record.id).await.unwrap();
    assert_eq!(stored.text(fields::INTERNET_ARCHIVE), Some(ARCHIVE_PLACEHOLDER));
}

async fn seatable(server: &MockServer) -> SeaTableDatabase {
    let config = SeaTableConfig {
        server_url: server.url(),
        api_token: "api-token".to_string(),
        ..SeaTableConfig::default()
    };
    SeaTableDatabase::connect("Primary", &config).await.unwrap()
}

/// Mock SeaTable deployment: the token exchange followed by `responses`
async fn seatable_server(responses: Vec<MockResponse>) -> MockServer {
    MockServer::start_with(|url| std::iter::once(access_token(url)).chain(responses).collect()).await
}

fn access_token(server_url: &str) -> MockResponse {
    MockResponse::json(json!({
        "access_token": "access",
        "dtable_uuid": "base-uuid",
        "dtable_server": format!("{}/dtable-server/", server_url)
    }))
}

#[tokio::test]
async fn test_seatable_reports_incomplete_batches() {
    let server = seatable_server(vec![MockResponse::json(json!({
        "inserted_row_count": 1,
        "row_ids": [{ "_id": "r1" }]
    }))])
    .await;
    let database = seatable(&server).await;
    let table = database.table(FILES_TABLE).await.unwrap();

    let mut first = Fields::new();
    first.insert("Name".to_string(), json!("a.txt"));
    let mut second = Fields::new();
    second.insert("Name".to_string(), json!("b.txt"));
    let err = table.batch_create(vec![first, second]).await.unwrap_err();

    assert!(matches!(
        err,
        CustodyError::BatchIncomplete { expected: 2, actual: 1, .. }
    ));
    let requests = server.requests();
    assert_eq!(requests[0].path, "/api/v2.1/dtable/app-access-token/");
    assert_eq!(requests[0].header("authorization"), Some("Token api-token"));
    assert_eq!(requests[1].path, "/dtable-server/api/v1/dtables/base-uuid/batch-append-rows/");
    assert_eq!(requests[1].header("authorization"), Some("Token access"));
}

#[tokio::test]
async fn test_seatable_rows_are_filtered_and_sorted() {
    let server = seatable_server(vec![MockResponse::json(json!({
        "rows": [
            { "_id": "r1", "_ctime": "2024-01-02T00:00:00Z", "Name": "b.txt", "Metadata": METADATA_PLACEHOLDER },
            { "_id": "r2", "_ctime": "2024-01-01T00:00:00Z", "Name": "a.txt", "Metadata": METADATA_PLACEHOLDER },
            { "_id": "r3", "_ctime": "2024-01-03T00:00:00Z", "Name": "c.txt", "Metadata": "{}" }
        ]
    }))])
    .await;
    let database = seatable(&server).await;
    let table = database.table(FILES_TABLE).await.unwrap();

    let mut pending = Filter::new();
    pending.insert(fields::METADATA.to_string(), json!(METADATA_PLACEHOLDER));
    let records: Vec<Record> = table
        .get_all(Some(&pending), &[SortKey::asc(fields::CREATED)])
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["r2", "r1"]);
    assert_eq!(records[0].text(fields::CREATED), Some("2024-01-01T00:00:00Z"));
    assert!(server.requests()[1].path.contains("table_name=Files"));
}

/// `count` rows named after their position, starting at `first`
fn seatable_rows(first: usize, count: usize) -> Vec<Value> {
    (first..first + count)
        .map(|i| json!({ "_id": format!("r{}", i), "Name": format!("{}.txt", i) }))
        .collect()
}

#[tokio::test]
async fn test_seatable_pages_past_a_full_page() {
    let server = seatable_server(vec![
        MockResponse::json(json!({ "rows": seatable_rows(0, 1000) })),
        MockResponse::json(json!({ "rows": seatable_rows(1000, 5) })),
    ])
    .await;
    let database = seatable(&server).await;
    let table = database.table(FILES_TABLE).await.unwrap();

    let records: Vec<Record> = table.get_all(None, &[]).await.unwrap().try_collect().await.unwrap();
    assert_eq!(records.len(), 1005);
    assert_eq!(records[0].id, "r0");
    assert_eq!(records[1004].id, "r1004");

    // A short page ends the listing without another round trip
    let requests = server.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[1].path.contains("start=0"));
    assert!(requests[1].path.contains("limit=1000"));
    assert!(requests[2].path.contains("start=1000"));
}

#[tokio::test]
async fn test_seatable_batches_are_split_and_checked_per_chunk() {
    let full: Vec<Value> = (0..1000).map(|i| json!({ "_id": format!("r{}", i) })).collect();
    let server = seatable_server(vec![
        MockResponse::json(json!({ "inserted_row_count": 1000, "row_ids": full })),
        MockResponse::json(json!({ "inserted_row_count": 0, "row_ids": [] })),
    ])
    .await;
    let database = seatable(&server).await;
    let table = database.table(FILES_TABLE).await.unwrap();

    let rows: Vec<Fields> = (0..1001)
        .map(|i| {
            let mut fields = Fields::new();
            fields.insert("Name".to_string(), json!(format!("{}.txt", i)));
            fields
        })
        .collect();
    let err = table.batch_create(rows).await.unwrap_err();
    assert!(matches!(
        err,
        CustodyError::BatchIncomplete { expected: 1, actual: 0, .. }
    ));

    let requests = server.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[1].json()["rows"].as_array().unwrap().len(), 1000);
    assert_eq!(requests[2].json()["rows"].as_array().unwrap().len(), 1);
    assert_eq!(requests[2].json()["rows"][0]["Name"], "1000.txt");
}

#[tokio::test]
async fn test_seatable_add_link_writes_the_union() {
    let server = seatable_server(vec![
        MockResponse::json(json!({
            "metadata": { "tables": [
                { "_id": "T_F", "name": "Files", "columns": [] },
                { "_id": "T_M", "name": "Musics", "columns": [{
                    "key": "k1",
                    "name": "Files",
                    "type": "link",
                    "data": { "link_id": "L1", "table_id": "T_F", "other_table_id": "T_M" }
                }] }
            ] }
        })),
        MockResponse::json(json!({ "m1": [{ "row_id": "f1", "display_value": "a.flac" }] })),
        MockResponse::json(json!({ "success": true })),
        MockResponse::json(json!({ "m1": [{ "row_id": "f1" }, { "row_id": "f2" }], "m2": [] })),
    ])
    .await;
    let database = seatable(&server).await;
    let musics = database.table(MUSICS_TABLE).await.unwrap();

    musics.add_link(fields::FILES, "m1", "f2").await.unwrap();

    let requests = server.requests();
    assert_eq!(requests[1].path, "/dtable-server/api/v1/dtables/base-uuid/metadata/");
    assert_eq!(requests[2].method, "POST");
    assert_eq!(requests[2].path, "/dtable-server/api/v1/linked-records/base-uuid");
    assert_eq!(
        requests[2].json(),
        json!({
            "table_id": "T_M",
            "link_column": "k1",
            "rows": [{ "row_id": "m1", "offset": 0, "limit": 1000 }]
        })
    );
    assert_eq!(requests[3].method, "PUT");
    assert_eq!(requests[3].path, "/dtable-server/api/v1/dtables/base-uuid/batch-update-links/");
    assert_eq!(
        requests[3].json(),
        json!({
            "link_id": "L1",
            "table_id": "T_M",
            "other_table_id": "T_F",
            "row_id_list": ["m1"],
            "other_rows_ids_map": { "m1": ["f1", "f2"] }
        })
    );

    // Metadata is fetched once per base
    let ids = vec!["m1".to_string(), "m2".to_string()];
    let linked = musics.get_linked_records(fields::FILES, &ids).await.unwrap();
    assert_eq!(linked["m1"], vec!["f1".to_string(), "f2".to_string()]);
    assert!(linked["m2"].is_empty());
    assert_eq!(server.requests().len(), 5);
}

#[tokio::test]
async fn test_seatable_rejected_link_update_is_incomplete() {
    let server = seatable_server(vec![
        MockResponse::json(json!({
            "metadata": { "tables": [{ "_id": "T_M", "name": "Musics", "columns": [{
                "key": "k1",
                "name": "Files",
                "type": "link",
                "data": { "link_id": "L1", "table_id": "T_M", "other_table_id": "T_F" }
            }] }] }
        })),
        MockResponse::json(json!({ "success": false })),
    ])
    .await;
    let database = seatable(&server).await;
    let musics = database.table(MUSICS_TABLE).await.unwrap();

    let err = musics
        .update_link(fields::FILES, "m1", vec!["f1".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, CustodyError::BatchIncomplete { expected: 1, actual: 0, .. }));
}

#[tokio::test]
async fn test_seatable_missing_row_is_record_not_found() {
    let server = seatable_server(vec![MockResponse::status(404, "{}")]).await;
    let database = seatable(&server).await;
    let table = database.table(FILES_TABLE).await.unwrap();

    let err = table.get("missing").await.unwrap_err();
    assert!(matches!(err, CustodyError::RecordNotFound(ref id) if id == "missing"));
}

fn airtable(server: &MockServer) -> AirtableDatabase {
    let config = AirtableConfig {
        api_url: server.url(),
        api_key: "pat-key".to_string(),
        base_id: "appBase".to_string(),
        ..AirtableConfig::default()
    };
    AirtableDatabase::connect("Archive", &config).unwrap()
}

fn airtable_records(ids: std::ops::Range<usize>) -> Value {
    let records: Vec<Value> = ids
        .map(|i| json!({ "id": format!("rec{}", i), "createdTime": "2024-01-01T00:00:00.000Z", "fields": {} }))
        .collect();
    json!({ "records": records })
}

#[tokio::test]
async fn test_airtable_writes_are_chunked_by_ten() {
    let server = MockServer::start(vec![
        MockResponse::json(airtable_records(0..10)),
        MockResponse::json(airtable_records(10..11)),
    ])
    .await;
    let database = airtable(&server);
    let table = database.table(FILES_TABLE).await.unwrap();

    let rows: Vec<Fields> = (0..12)
        .map(|i| {
            let mut fields = Fields::new();
            fields.insert("Name".to_string(), json!(format!("{}.txt", i)));
            fields
        })
        .collect();
    let err = table.batch_create(rows).await.unwrap_err();
    assert!(matches!(
        err,
        CustodyError::BatchIncomplete { expected: 2, actual: 1, .. }
    ));

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].path, "/appBase/Files");
    assert_eq!(requests[0].header("authorization"), Some("Bearer pat-key"));
    assert_eq!(requests[0].json()["records"].as_array().unwrap().len(), 10);
    assert_eq!(requests[1].json()["records"][1]["fields"]["Name"], "11.txt");
}

#[tokio::test]
async fn test_airtable_lists_pages_by_offset() {
    let server = MockServer::start(vec![
        MockResponse::json(json!({
            "records": [
                { "id": "rec2", "createdTime": "2024-01-02T00:00:00.000Z", "fields": { "Metadata": METADATA_PLACEHOLDER } },
                { "id": "rec1", "createdTime": "2024-01-01T00:00:00.000Z", "fields": { "Metadata": METADATA_PLACEHOLDER } }
            ],
            "offset": "itr1/rec1"
        })),
        MockResponse::json(json!({
            "records": [
                { "id": "rec3", "createdTime": "2024-01-03T00:00:00.000Z", "fields": { "Metadata": "{}" } },
                { "id": "rec0", "createdTime": "2023-12-31T00:00:00.000Z", "fields": { "Metadata": METADATA_PLACEHOLDER } }
            ]
        })),
    ])
    .await;
    let database = airtable(&server);
    let table = database.table("Backup Files").await.unwrap();

    let mut pending = Filter::new();
    pending.insert(fields::METADATA.to_string(), json!(METADATA_PLACEHOLDER));
    let records: Vec<Record> = table
        .get_all(Some(&pending), &[SortKey::asc(fields::CREATED)])
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["rec0", "rec1", "rec2"]);
    assert_eq!(records[0].text(fields::CREATED), Some("2023-12-31T00:00:00.000Z"));

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].path.starts_with("/appBase/Backup%20Files?"));
    assert!(requests[0].path.contains("pageSize=100"));
    assert!(requests[0].path.contains("filterByFormula="));
    assert!(!requests[0].path.contains("offset="));
    assert!(requests[1].path.contains("offset=itr1%2Frec1"));
}

#[tokio::test]
async fn test_airtable_add_link_updates_the_field() {
    let linked = json!({ "id": "m1", "fields": { "Title": "Song", "Files": ["f1"] } });
    let server = MockServer::start(vec![
        MockResponse::json(linked.clone()),
        MockResponse::json(linked),
        MockResponse::json(json!({ "records": [{ "id": "m1", "fields": { "Title": "Song", "Files": ["f1", "f2"] } }] })),
    ])
    .await;
    let database = airtable(&server);
    let musics = database.table(MUSICS_TABLE).await.unwrap();

    musics.add_link(fields::FILES, "m1", "f2").await.unwrap();

    let requests = server.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].path, "/appBase/Musics/m1");
    assert_eq!(requests[2].method, "PATCH");
    assert_eq!(
        requests[2].json(),
        json!({ "records": [{ "id": "m1", "fields": { "Files": ["f1", "f2"] } }] })
    );
}

#[tokio::test]
async fn test_airtable_missing_record_is_record_not_found() {
    let not_found = json!({ "error": "NOT_FOUND" });
    let server = MockServer::start(vec![
        MockResponse::status(404, &not_found.to_string()),
        MockResponse::status(404, &not_found.to_string()),
    ])
    .await;
    let database = airtable(&server);
    let table = database.table(FILES_TABLE).await.unwrap();

    let err = table.get("recMissing").await.unwrap_err();
    assert!(matches!(err, CustodyError::RecordNotFound(ref id) if id == "recMissing"));
    let err = table.delete("recGone").await.unwrap_err();
    assert!(matches!(err, CustodyError::RecordNotFound(ref id) if id == "recGone"));
    // Nothing was deleted: both requests were lookups
    assert!(server.requests().iter().all(|r| r.method == "GET"));
}

/// Extractor returning canned metadata, failing for one file
#[derive(Debug)]
struct CannedExtractor {
    metadata: Value,
    fail_for: Option<&'static str>,
}

#[async_trait]
impl MetadataExtractor for CannedExtractor {
    async fn extract(&self, path: &Path) -> Result<Value> {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if self.fail_for.is_some_and(|bad| name.ends_with(bad)) {
            return Err(CustodyError::MetadataExtraction(format!("cannot read {}", name)));
        }
        Ok(self.metadata.clone())
    }
}

#[tokio::test]
async fn test_add_metadata_links_music_rows() {
    let database = Arc::new(MemoryDatabase::new("Primary"));
    let extractor = CannedExtractor {
        metadata: json!({ "Title": "Song", "Artist": "Band", "Album": "Record" }),
        fail_for: Some("broken.mp3"),
    };
    let harness = CustodyTestHarness::with(|builder| {
        builder
            .database(database.clone())
            .metadata_extractor(Arc::new(extractor))
    });
    let song = harness.custody.ingest(&harness.write_file("song.flac", b"flac")).await.unwrap();
    let note = harness.custody.ingest(&harness.write_file("note.txt", b"text")).await.unwrap();
    harness.custody.ingest(&harness.write_file("broken.mp3", b"mp3")).await.unwrap();

    let summary = harness.custody.add_metadata(None).await.unwrap();
    assert_eq!(summary.processed, vec!["note.txt".to_string(), "song.flac".to_string()]);
    assert_eq!(summary.failed, vec!["broken.mp3".to_string()]);

    let files = harness.custody.files().await.unwrap();
    let song = files.get(&song.id).await.unwrap();
    let stored: Value = serde_json::from_str(song.text(fields::METADATA).unwrap()).unwrap();
    assert_eq!(stored["Artist"], "Band");
    assert_ne!(files.get(&note.id).await.unwrap().text(fields::METADATA), Some(METADATA_PLACEHOLDER));

    let musics = database.memory_table(MUSICS_TABLE);
    assert_eq!(musics.len(), 1);
    let rows: Vec<Record> = musics.get_all(None, &[]).await.unwrap().try_collect().await.unwrap();
    assert_eq!(rows[0].text("Title"), Some("Song"));
    assert_eq!(rows[0].links(fields::FILES), vec![song.id.clone()]);

    // Only the failed file is still pending.
    let again = harness.custody.add_metadata(Some(10)).await.unwrap();
    assert!(again.processed.is_empty());
    assert_eq!(again.failed, vec!["broken.mp3".to_string()]);
}

#[tokio::test]
async fn test_add_metadata_reuses_linked_music_row() {
    let database = Arc::new(MemoryDatabase::new("Primary"));
    let extractor = CannedExtractor { metadata: json!({ "Title": "Song" }), fail_for: None };
    let harness = CustodyTestHarness::with(|builder| {
        builder
            .database(database.clone())
            .metadata_extractor(Arc::new(extractor))
    });
    let song = harness.custody.ingest(&harness.write_file("song.flac", b"flac")).await.unwrap();

    // State left by a run that linked the Musics row but never stored Metadata
    let musics = database.memory_table(MUSICS_TABLE);
    let mut title = Fields::new();
    title.insert("Title".to_string(), json!("Song"));
    let earlier = musics.create(title).await.unwrap();
    musics.add_link(fields::FILES, &earlier.id, &song.id).await.unwrap();

    let summary = harness.custody.add_metadata(None).await.unwrap();
    assert_eq!(summary.processed, vec!["song.flac".to_string()]);
    assert_eq!(musics.len(), 1);
    let rows: Vec<Record> = musics.get_all(None, &[]).await.unwrap().try_collect().await.unwrap();
    assert_eq!(rows[0].id, earlier.id);
    assert_eq!(rows[0].links(fields::FILES), vec![song.id.clone()]);
    let stored = harness.custody.files().await.unwrap().get(&song.id).await.unwrap();
    assert_ne!(stored.text(fields::METADATA), Some(METADATA_PLACEHOLDER));
}

#[tokio::test]
async fn test_add_metadata_respects_limit() {
    let extractor = CannedExtractor { metadata: json!({}), fail_for: None };
    let harness = CustodyTestHarness::with(|builder| builder.metadata_extractor(Arc::new(extractor)));
    for name in ["1.txt", "2.txt", "3.txt"] {
        harness.custody.ingest(&harness.write_file(name, name.as_bytes())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let summary = harness.custody.add_metadata(Some(2)).await.unwrap();
    assert_eq!(summary.processed, vec!["1.txt".to_string(), "2.txt".to_string()]);
}

#[tokio::test]
async fn test_export_and_reload() {
    let harness = CustodyTestHarness::new();
    let record = harness.ingest_with_copies("t.txt", b"test content").await;
    let out = harness.temp_dir.path().join("export");

    let path = harness.custody.export_table(FILES_TABLE, &out).await.unwrap();
    let exported: Vec<Record> = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
    assert_eq!(exported.len(), 1);
    assert_eq!(exported[0].id, record.id);
    assert_eq!(exported[0].text(fields::SHA256), Some(TEST_CONTENT_SHA256));
}
