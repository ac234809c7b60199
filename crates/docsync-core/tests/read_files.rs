//! Read-path integration tests
//!
//! Freshness, batching, deduplication and recorded (non-thrown) failures of
//! `read_files` and `read_files_by_criteria` against the in-memory service.

use docsync_core::{FileChanges, FileCriteria, FileId, LoadErrorCode, ReadOptions, SyncConfig};
use docsync_test_utils::{error_response, fixtures, Failure, Route, TestEnv};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;

fn query_of(env: &TestEnv, id: i64) -> String {
    let state = env.files.get(FileId(id)).expect("file in store");
    state.effective_content().unwrap().as_question().unwrap().query.clone()
}

async fn settle<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn edit_is_visible_locally_but_not_remotely_until_published() {
    let env = TestEnv::new([fixtures::question(1, "Revenue", "SELECT 1")]);
    env.files.read_files(&[FileId(1)], ReadOptions::default()).await;

    env.files
        .edit_file(FileId(1), FileChanges::default().set("query", json!("SELECT 2")))
        .unwrap();

    let read = env.files.read_files(&[FileId(1)], ReadOptions::default()).await;
    let effective = read[0].file_state.effective_content().unwrap();
    assert_eq!(effective.as_question().unwrap().query, "SELECT 2");

    let remote = env.files.api().load_files(&[FileId(1)]).await.unwrap();
    assert_eq!(remote.files[0].content.as_question().unwrap().query, "SELECT 1");

    env.files.publish_file(FileId(1)).await.unwrap();

    let remote = env.files.api().load_files(&[FileId(1)]).await.unwrap();
    assert_eq!(remote.files[0].content.as_question().unwrap().query, "SELECT 2");
    assert_eq!(query_of(&env, 1), "SELECT 2");
    assert!(!env.files.is_dirty(FileId(1)));
}

#[tokio::test]
async fn ttl_boundary() {
    let env = TestEnv::new([fixtures::question(1, "Revenue", "SELECT 1")]);
    let ttl = Duration::from_secs(10);
    let options = ReadOptions::default().with_ttl(ttl);

    env.files.read_files(&[FileId(1)], options).await;
    assert_eq!(env.service.call_count(Route::LoadFiles), 1);

    env.clock.advance(ttl - Duration::from_millis(1));
    env.files.read_files(&[FileId(1)], options).await;
    assert_eq!(env.service.call_count(Route::LoadFiles), 1);

    env.clock.advance(Duration::from_millis(2));
    env.files.read_files(&[FileId(1)], options).await;
    assert_eq!(env.service.call_count(Route::LoadFiles), 2);
}

#[tokio::test]
async fn type_default_ttl_applies_without_override() {
    let env = TestEnv::new([fixtures::folder(5, "analytics", "/org")]);
    env.files.read_files(&[FileId(5)], ReadOptions::default()).await;

    env.clock.advance(Duration::from_secs(29));
    env.files.read_files(&[FileId(5)], ReadOptions::default()).await;
    assert_eq!(env.service.call_count(Route::LoadFiles), 1);

    env.clock.advance(Duration::from_secs(2));
    env.files.read_files(&[FileId(5)], ReadOptions::default()).await;
    assert_eq!(env.service.call_count(Route::LoadFiles), 2);
}

#[tokio::test]
async fn only_missing_and_stale_ids_are_fetched_in_one_batch() {
    let env = TestEnv::new([
        fixtures::question(1, "a", "SELECT 1"),
        fixtures::question(2, "b", "SELECT 2"),
        fixtures::question(3, "c", "SELECT 3"),
    ]);
    env.files.read_files(&[FileId(1)], ReadOptions::default()).await;

    let read = env
        .files
        .read_files(&[FileId(1), FileId(2), FileId(3)], ReadOptions::default())
        .await;
    assert_eq!(read.len(), 3);

    let calls = env.service.calls_to(Route::LoadFiles);
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].body.as_ref().unwrap()["ids"], json!([2, 3]));
    assert_eq!(calls[1].body.as_ref().unwrap()["include"], "references");
}

#[tokio::test]
async fn concurrent_overlapping_reads_fetch_each_id_once() {
    let env = TestEnv::new([
        fixtures::question(1, "a", "SELECT 1"),
        fixtures::question(2, "b", "SELECT 2"),
        fixtures::question(3, "c", "SELECT 3"),
    ]);
    env.service.set_latency(Duration::from_millis(30));

    let (left, right) = tokio::join!(
        env.files.read_files(&[FileId(1), FileId(2)], ReadOptions::default()),
        env.files.read_files(&[FileId(2), FileId(3)], ReadOptions::default()),
    );

    let mut requested: Vec<i64> = env
        .service
        .calls_to(Route::LoadFiles)
        .iter()
        .flat_map(|c| c.body.as_ref().unwrap()["ids"].as_array().unwrap().clone())
        .map(|v| v.as_i64().unwrap())
        .collect();
    requested.sort_unstable();
    assert_eq!(requested, vec![1, 2, 3]);

    assert_eq!(left[1].file_state, right[0].file_state);
    assert!(left.iter().chain(&right).all(|f| f.file_state.base.is_some()));
}

#[tokio::test]
async fn identical_concurrent_reads_share_one_request() {
    let env = TestEnv::new([fixtures::question(1, "a", "SELECT 1")]);
    env.service.set_latency(Duration::from_millis(30));

    let reads = futures::future::join_all(
        (0..5).map(|_| env.files.read_files(&[FileId(1)], ReadOptions::default())),
    )
    .await;

    assert_eq!(env.service.call_count(Route::LoadFiles), 1);
    assert!(reads.iter().all(|r| r.len() == 1 && r[0].file_state.base.is_some()));
}

#[tokio::test]
async fn missing_id_is_recorded_as_not_found_in_isolation() {
    let env = TestEnv::new([fixtures::question(1, "a", "SELECT 1")]);

    let read = env
        .files
        .read_files(&[FileId(1), FileId(2)], ReadOptions::default())
        .await;

    assert_eq!(read.len(), 2);
    assert!(read[0].file_state.load_error.is_none());
    assert_eq!(query_of(&env, 1), "SELECT 1");

    let missing = &read[1].file_state;
    assert_eq!(missing.id, FileId(2));
    assert!(missing.base.is_none());
    assert_eq!(missing.load_error.as_ref().unwrap().code, LoadErrorCode::NotFound);
    assert!(!missing.loading);
}

#[tokio::test]
async fn batch_failure_is_recorded_on_every_id_and_retried_later() {
    let env = TestEnv::new([
        fixtures::question(1, "a", "SELECT 1"),
        fixtures::question(2, "b", "SELECT 2"),
    ]);
    env.service
        .fail_next(Route::LoadFiles, Failure::Network("connection reset".into()));

    let read = env
        .files
        .read_files(&[FileId(1), FileId(2)], ReadOptions::default())
        .await;
    for file in &read {
        let error = file.file_state.load_error.as_ref().unwrap();
        assert_eq!(error.code, LoadErrorCode::Network);
        assert!(error.message.contains("connection reset"));
    }

    let read = env
        .files
        .read_files(&[FileId(1), FileId(2)], ReadOptions::default())
        .await;
    assert!(read.iter().all(|f| f.file_state.load_error.is_none()));
    assert_eq!(env.service.call_count(Route::LoadFiles), 2);
}

#[tokio::test]
async fn server_error_body_is_classified() {
    let env = TestEnv::new([fixtures::question(1, "a", "SELECT 1")]);
    env.service.fail_next(
        Route::LoadFiles,
        Failure::Response(error_response(403, "Access denied for this company")),
    );

    let read = env.files.read_files(&[FileId(1)], ReadOptions::default()).await;
    let error = read[0].file_state.load_error.as_ref().unwrap();
    assert_eq!(error.code, LoadErrorCode::Permission);
}

#[tokio::test]
async fn skip_serves_cache_only() {
    let env = TestEnv::new([fixtures::question(1, "a", "SELECT 1")]);

    let read = env
        .files
        .read_files(&[FileId(1)], ReadOptions::cached_only())
        .await;
    assert!(read.is_empty());
    assert_eq!(env.service.total_calls(), 0);

    env.files.read_files(&[FileId(1)], ReadOptions::default()).await;
    env.clock.advance(Duration::from_secs(3_600));

    let read = env
        .files
        .read_files(&[FileId(1), FileId(2)], ReadOptions::cached_only())
        .await;
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].file_state.id, FileId(1));
    assert_eq!(env.service.call_count(Route::LoadFiles), 1);
}

#[tokio::test]
async fn stale_file_is_served_then_refreshed_in_background() {
    let config = SyncConfig::new()
        .with_company_id(1)
        .with_stale_while_revalidate(Duration::from_secs(30));
    let env = TestEnv::with_config([fixtures::question(1, "a", "SELECT 1")], config);
    env.files.read_files(&[FileId(1)], ReadOptions::default()).await;

    env.service.set_content(1, "query", json!("SELECT 9"));
    env.clock.advance(Duration::from_secs(70));

    let read = env.files.read_files(&[FileId(1)], ReadOptions::default()).await;
    assert_eq!(
        read[0].file_state.effective_content().unwrap().as_question().unwrap().query,
        "SELECT 1"
    );

    settle(|| query_of(&env, 1) == "SELECT 9").await;
    assert_eq!(env.service.call_count(Route::LoadFiles), 2);
    assert_eq!(env.files.get(FileId(1)).unwrap().fetched_at, Some(TestEnv::START_MS + 70_000));
}

#[tokio::test]
async fn failed_background_refresh_keeps_stale_value_without_error() {
    let config = SyncConfig::new().with_stale_while_revalidate(Duration::from_secs(30));
    let env = TestEnv::with_config([fixtures::question(1, "a", "SELECT 1")], config);
    env.files.read_files(&[FileId(1)], ReadOptions::default()).await;

    env.service
        .fail_next(Route::LoadFiles, Failure::Network("timeout".into()));
    env.clock.advance(Duration::from_secs(70));
    env.files.read_files(&[FileId(1)], ReadOptions::default()).await;

    settle(|| env.service.call_count(Route::LoadFiles) == 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let state = env.files.get(FileId(1)).unwrap();
    assert!(state.load_error.is_none());
    assert_eq!(query_of(&env, 1), "SELECT 1");
}

#[tokio::test]
async fn blocking_read_during_revalidation_records_its_failure() {
    let config = SyncConfig::new().with_stale_while_revalidate(Duration::from_secs(30));
    let env = TestEnv::with_config([fixtures::question(1, "a", "SELECT 1")], config);
    env.files.read_files(&[FileId(1)], ReadOptions::default()).await;

    for _ in 0..2 {
        env.service
            .fail_next(Route::LoadFiles, Failure::Network("timeout".into()));
    }
    env.service.set_latency(Duration::from_millis(30));
    env.clock.advance(Duration::from_secs(70));
    env.files.read_files(&[FileId(1)], ReadOptions::default()).await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let strict = ReadOptions::default().with_ttl(Duration::from_millis(1));
    let read = env.files.read_files(&[FileId(1)], strict).await;

    let error = read[0].file_state.load_error.clone().expect("blocking read records failure");
    assert_eq!(error.code, LoadErrorCode::Network);
    assert!(!env.files.get(FileId(1)).unwrap().loading);
    assert_eq!(query_of(&env, 1), "SELECT 1");
}

#[tokio::test]
async fn beyond_the_revalidate_window_reads_block_on_fetch() {
    let config = SyncConfig::new().with_stale_while_revalidate(Duration::from_secs(30));
    let env = TestEnv::with_config([fixtures::question(1, "a", "SELECT 1")], config);
    env.files.read_files(&[FileId(1)], ReadOptions::default()).await;

    env.service.set_content(1, "query", json!("SELECT 9"));
    env.clock.advance(Duration::from_secs(91));

    let read = env.files.read_files(&[FileId(1)], ReadOptions::default()).await;
    assert_eq!(
        read[0].file_state.effective_content().unwrap().as_question().unwrap().query,
        "SELECT 9"
    );
}

#[tokio::test]
async fn refresh_keeps_unpublished_edits() {
    let env = TestEnv::new([fixtures::question(1, "a", "SELECT 1")]);
    env.files.read_files(&[FileId(1)], ReadOptions::default()).await;
    env.files
        .edit_file(FileId(1), FileChanges::default().with_name("renamed"))
        .unwrap();

    env.clock.advance(Duration::from_secs(120));
    env.files.read_files(&[FileId(1)], ReadOptions::default()).await;

    assert_eq!(env.service.call_count(Route::LoadFiles), 2);
    assert!(env.files.is_dirty(FileId(1)));
    assert_eq!(env.files.get(FileId(1)).unwrap().effective_name(), "renamed");
}

#[tokio::test]
async fn dashboard_read_includes_references_and_cached_results() {
    let env = TestEnv::new([
        fixtures::question(1, "a", "SELECT 1"),
        fixtures::question(2, "b", "SELECT 2"),
        fixtures::dashboard(10, "Board", &[1, 2]),
    ]);

    let read = env.files.read_files(&[FileId(10)], ReadOptions::default()).await;
    let ids: Vec<FileId> = read[0].references.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![FileId(1), FileId(2)]);
    assert!(read[0].query_results.is_empty());
    assert_eq!(env.service.call_count(Route::LoadFiles), 1);

    env.files.execute_question(FileId(1)).await.unwrap();

    let read = env.files.read_files(&[FileId(10)], ReadOptions::default()).await;
    assert_eq!(read[0].query_results.len(), 1);
    assert_eq!(read[0].query_results[0].file_id, FileId(1));
    assert_eq!(env.service.call_count(Route::LoadFiles), 1);
    assert_eq!(env.service.call_count(Route::Query), 1);
}

#[tokio::test]
async fn question_read_looks_up_result_for_edited_query() {
    let env = TestEnv::new([fixtures::question(1, "a", "SELECT 1")]);
    env.files.read_files(&[FileId(1)], ReadOptions::default()).await;
    env.files.execute_question(FileId(1)).await.unwrap();

    env.files
        .edit_file(FileId(1), FileChanges::default().set("query", json!("SELECT  2")))
        .unwrap();
    let read = env.files.read_files(&[FileId(1)], ReadOptions::default()).await;
    assert!(read[0].query_results.is_empty());

    env.files
        .edit_file(FileId(1), FileChanges::default().set("query", json!("SELECT 1")))
        .unwrap();
    let read = env.files.read_files(&[FileId(1)], ReadOptions::default()).await;
    assert_eq!(read[0].query_results.len(), 1);
    assert_eq!(env.service.call_count(Route::Query), 1);
}

#[tokio::test]
async fn reference_cycles_terminate() {
    let env = TestEnv::new([
        fixtures::dashboard(20, "A", &[21]),
        fixtures::dashboard(21, "B", &[20]),
    ]);

    let read = env.files.read_files(&[FileId(20)], ReadOptions::default()).await;
    let ids: Vec<FileId> = read[0].references.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![FileId(21)]);
}

#[tokio::test]
async fn references_missing_from_the_response_are_loaded() {
    let env = TestEnv::new([
        fixtures::question(1, "a", "SELECT 1"),
        fixtures::dashboard(10, "Board", &[1]),
    ]);
    env.files.read_files(&[FileId(10)], ReadOptions::default()).await;
    env.files.clear();
    env.service.reset_calls();

    env.service.hide(1);
    let read = env.files.read_files(&[FileId(10)], ReadOptions::default()).await;
    assert_eq!(env.service.call_count(Route::LoadFiles), 2);
    let reference = &read[0].references[0];
    assert_eq!(reference.load_error.as_ref().unwrap().code, LoadErrorCode::NotFound);
}

#[tokio::test]
async fn criteria_listing_partial_and_full() {
    let env = TestEnv::new([
        fixtures::question(1, "a", "SELECT 1"),
        fixtures::question(2, "b", "SELECT 2"),
        fixtures::folder(5, "analytics", "/org"),
    ]);
    let criteria = FileCriteria::under("/org/analytics");

    let partial = env.files.read_files_by_criteria(&criteria, true).await;
    assert!(partial.error.is_none());
    assert_eq!(partial.listing.files.len(), 2);
    assert!(partial.files.is_empty());
    assert_eq!(env.service.call_count(Route::LoadFiles), 0);

    let full = env.files.read_files_by_criteria(&criteria, false).await;
    assert_eq!(full.files.len(), 2);
    assert_eq!(env.service.call_count(Route::LoadFiles), 1);
    assert_eq!(env.service.call_count(Route::ListFiles), 1);

    let url = &env.service.calls_to(Route::ListFiles)[0].url;
    assert_eq!(url, "/api/files?paths=%2Forg%2Fanalytics");
}

#[tokio::test]
async fn criteria_listing_failure_is_returned_not_thrown() {
    let env = TestEnv::new([fixtures::question(1, "a", "SELECT 1")]);
    env.service
        .fail_next(Route::ListFiles, Failure::Response(error_response(500, "listing exploded")));

    let result = env
        .files
        .read_files_by_criteria(&FileCriteria::under("/org"), false)
        .await;
    let error = result.error.unwrap();
    assert_eq!(error.code, LoadErrorCode::Server);
    assert!(error.message.contains("listing exploded"));
    assert!(result.files.is_empty());
}
