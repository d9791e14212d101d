use std::path::PathBuf;
use std::time::Duration;

use super::test_helpers::{
    MockArchive, StatusPlan, TransferPlan, existing_item, file_content, file_url, test_config,
    test_pipeline,
};
use super::*;
use crate::error::Error;
use crate::rapi::RemoteState;
use crate::recorder;
use crate::types::{OrderId, RecordStatus};

const RCM: &str = "RCMImageProducts";

fn key(id: &str) -> RecordKey {
    RecordKey::new(RCM, id)
}

fn search(collections: &[&str]) -> SearchRequest {
    SearchRequest {
        collections: collections.iter().map(|c| c.to_string()).collect(),
        ..Default::default()
    }
}

fn status_of(store: &RecordStore, id: &str) -> RecordStatus {
    store.get(&key(id)).unwrap().status().clone()
}

fn secs(sleeps: &[Duration]) -> Vec<u64> {
    sleeps.iter().map(Duration::as_secs).collect()
}

#[tokio::test]
async fn full_run_downloads_every_record() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results(RCM, &["1", "2", "3"]);
    let (pipeline, _) = test_pipeline(test_config(dir.path()), &mock);
    let mut events = pipeline.subscribe();

    let (summary, store) = pipeline.execute(RunRequest::Full(search(&[RCM]))).await.unwrap();

    assert_eq!(summary.total, 3);
    assert_eq!(summary.downloaded, 3);
    assert!(!summary.interrupted);
    assert_eq!(mock.order_calls(), vec![vec![key("1"), key("2"), key("3")]]);

    for id in ["1", "2", "3"] {
        let record = store.get(&key(id)).unwrap();
        assert!(record.is_downloaded());
        let expected = dir
            .path()
            .join("downloads")
            .join(RCM)
            .join(format!("{id}_100_{id}.zip"));
        assert_eq!(record.local_path(), Some(expected.as_path()));
        assert_eq!(std::fs::read_to_string(&expected).unwrap(), file_content(id));
    }

    let results = summary.results_file.unwrap();
    let reloaded = recorder::load(&results).unwrap();
    assert_eq!(reloaded.summary().downloaded, 3);
    assert!(results.with_extension("json").exists());

    let mut finished = false;
    while let Ok(event) = events.try_recv() {
        if event == (Event::Finished { interrupted: false }) {
            finished = true;
        }
    }
    assert!(finished);
}

#[tokio::test]
async fn failed_batch_does_not_stop_later_batches() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results(RCM, &["1", "2", "3", "4", "5"]);
    mock.fail_orders_containing("3");
    let mut config = test_config(dir.path());
    config.order.max_items_per_order = 2;
    let (pipeline, _) = test_pipeline(config, &mock);

    let (summary, store) = pipeline
        .execute(RunRequest::OrderOnly(search(&[RCM])))
        .await
        .unwrap();

    // Second batch tried once plus one retry
    let calls = mock.order_calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[1], calls[2]);
    assert_eq!(calls[3], vec![key("5")]);

    for id in ["3", "4"] {
        assert_eq!(
            status_of(&store, id),
            RecordStatus::Failed("order submission failed".into())
        );
    }
    assert_eq!(store.get(&key("1")).unwrap().order_id(), Some(OrderId(100)));
    assert_eq!(store.get(&key("5")).unwrap().order_id(), Some(OrderId(101)));
    assert_eq!(status_of(&store, "5"), RecordStatus::Submitted);

    // Order-only runs never poll
    assert!(mock.status_calls().is_empty());
    assert_eq!(summary.pending, 3);
    assert_eq!(summary.failed, 2);
}

#[tokio::test]
async fn rejected_items_fail_while_the_rest_proceed() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results(RCM, &["1", "2", "3"]);
    mock.reject("2");
    let (pipeline, _) = test_pipeline(test_config(dir.path()), &mock);

    let (summary, store) = pipeline.execute(RunRequest::Full(search(&[RCM]))).await.unwrap();

    assert_eq!(
        status_of(&store, "2"),
        RecordStatus::Failed("image not orderable".into())
    );
    assert_eq!(summary.downloaded, 2);
    assert_eq!(summary.failures, vec![(key("2"), "image not orderable".to_string())]);
}

#[tokio::test]
async fn pending_record_is_abandoned_on_the_last_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results(RCM, &["1"]);
    mock.plan("1", StatusPlan::Pending);
    let (pipeline, sleeper) = test_pipeline(test_config(dir.path()), &mock);

    let (summary, store) = pipeline.execute(RunRequest::Full(search(&[RCM]))).await.unwrap();

    let record = store.get(&key("1")).unwrap();
    assert_eq!(record.status(), &RecordStatus::Abandoned);
    assert_eq!(record.poll_attempts(), 5);
    assert_eq!(mock.status_calls().len(), 5);
    assert_eq!(summary.abandoned, 1);
    // No wait after the final cycle
    assert_eq!(secs(&sleeper.recorded()), vec![10, 20, 30, 30]);
    assert!(mock.download_calls().is_empty());
}

#[tokio::test]
async fn poll_interval_backs_off_until_something_is_available() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results(RCM, &["1"]);
    mock.plan("1", StatusPlan::AvailableAfter(4));
    let (pipeline, sleeper) = test_pipeline(test_config(dir.path()), &mock);

    let (summary, _) = pipeline.execute(RunRequest::Full(search(&[RCM]))).await.unwrap();

    assert_eq!(summary.downloaded, 1);
    assert_eq!(secs(&sleeper.recorded()), vec![10, 20, 30]);
}

#[tokio::test]
async fn permanent_status_failure_fails_the_record() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results(RCM, &["1", "2"]);
    mock.plan("1", StatusPlan::FailAfter(2, "Order expired".into()));
    let (pipeline, _) = test_pipeline(test_config(dir.path()), &mock);

    let (summary, store) = pipeline.execute(RunRequest::Full(search(&[RCM]))).await.unwrap();

    assert_eq!(
        status_of(&store, "1"),
        RecordStatus::Failed("Order expired".into())
    );
    assert!(store.get(&key("2")).unwrap().is_downloaded());
    assert_eq!(summary.failed, 1);
    assert!(
        mock.download_calls()
            .iter()
            .all(|url| !url.ends_with("/1.zip"))
    );
}

#[tokio::test]
async fn status_errors_count_as_unresolved_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results(RCM, &["1"]);
    mock.fail_status_calls();
    let mut config = test_config(dir.path());
    config.poll.max_attempts = 3;
    let (pipeline, _) = test_pipeline(config, &mock);

    let (summary, store) = pipeline.execute(RunRequest::Full(search(&[RCM]))).await.unwrap();

    assert_eq!(status_of(&store, "1"), RecordStatus::Abandoned);
    assert_eq!(summary.abandoned, 1);
    // Three cycles, each one call plus one retry
    assert_eq!(mock.status_calls().len(), 6);
}

#[tokio::test]
async fn download_failure_does_not_block_others() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results(RCM, &["1", "2", "3"]);
    mock.fail_download("2");
    let (pipeline, _) = test_pipeline(test_config(dir.path()), &mock);

    let (summary, store) = pipeline.execute(RunRequest::Full(search(&[RCM]))).await.unwrap();

    assert_eq!(summary.downloaded, 2);
    let reason = status_of(&store, "2").failure_reason().unwrap().to_string();
    assert!(reason.contains("404"), "unexpected reason: {reason}");
    assert!(
        !dir.path()
            .join("downloads")
            .join(RCM)
            .join("2_100_2.zip")
            .exists()
    );
}

#[tokio::test]
async fn disabled_collection_is_never_ordered() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results("NAPL", &["9"]);
    mock.add_search_results(RCM, &["1"]);
    let (pipeline, _) = test_pipeline(test_config(dir.path()), &mock);

    let (summary, store) = pipeline
        .execute(RunRequest::Full(search(&["NAPL", RCM])))
        .await
        .unwrap();

    let napl = store.get(&RecordKey::new("NAPL", "9")).unwrap();
    assert_eq!(
        napl.status(),
        &RecordStatus::Failed("collection cannot be ordered".into())
    );
    assert_eq!(mock.order_calls(), vec![vec![key("1")]]);
    assert_eq!(summary.downloaded, 1);
}

#[tokio::test]
async fn authentication_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results(RCM, &["1"]);
    mock.fail_auth();
    let (pipeline, _) = test_pipeline(test_config(dir.path()), &mock);

    let err = pipeline.run(RunRequest::Full(search(&[RCM]))).await.unwrap_err();

    assert!(matches!(err, Error::Authentication(_)));
    assert!(err.is_fatal());
    assert!(mock.order_calls().is_empty());
}

#[tokio::test]
async fn failing_search_skips_only_that_collection() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results(RCM, &["1"]);
    mock.fail_search("Radarsat2");
    let (pipeline, _) = test_pipeline(test_config(dir.path()), &mock);

    let summary = pipeline
        .run(RunRequest::Full(search(&["Radarsat2", RCM])))
        .await
        .unwrap();

    assert_eq!(summary.total, 1);
    assert_eq!(summary.downloaded, 1);
}

#[tokio::test]
async fn maximum_applies_per_collection_when_searching_several() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results(RCM, &["1", "2", "3"]);
    mock.add_search_results("Radarsat2", &["7", "8", "9"]);
    let mut config = test_config(dir.path());
    config.order.max_images = Some(2);
    let (pipeline, _) = test_pipeline(config, &mock);

    let (summary, store) = pipeline
        .execute(RunRequest::OrderOnly(search(&[RCM, "Radarsat2"])))
        .await
        .unwrap();

    let ordered: Vec<String> = mock.order_calls()[0].iter().map(|k| k.to_string()).collect();
    assert_eq!(
        ordered,
        vec![
            "RCMImageProducts:1",
            "RCMImageProducts:2",
            "Radarsat2:7",
            "Radarsat2:8"
        ]
    );
    // Truncated records stay Found
    assert_eq!(status_of(&store, "3"), RecordStatus::Found);
    assert_eq!(summary.found, 2);
}

#[tokio::test]
async fn most_recent_existing_order_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results(RCM, &["1", "2"]);
    mock.add_existing(existing_item(
        RCM,
        "1",
        40,
        RemoteState::Pending,
        Some("2024-01-03T00:00:00Z"),
    ));
    mock.add_existing(existing_item(
        RCM,
        "1",
        50,
        RemoteState::Available,
        Some("2024-01-09T00:00:00Z"),
    ));
    let (pipeline, _) = test_pipeline(test_config(dir.path()), &mock);
    let mut events = pipeline.subscribe();

    let (summary, store) = pipeline.execute(RunRequest::Full(search(&[RCM]))).await.unwrap();

    // Only the record without an existing order is ordered again
    assert_eq!(mock.order_calls(), vec![vec![key("2")]]);
    let reused = store.get(&key("1")).unwrap();
    assert_eq!(reused.order_id(), Some(OrderId(50)));
    assert!(
        reused
            .local_path()
            .unwrap()
            .ends_with(PathBuf::from(RCM).join("1_50_1.zip"))
    );
    assert_eq!(summary.downloaded, 2);

    let mut linked = None;
    while let Ok(event) = events.try_recv() {
        if let Event::ExistingOrdersLinked { count } = event {
            linked = Some(count);
        }
    }
    assert_eq!(linked, Some(1));
}

#[tokio::test]
async fn record_id_run_orders_the_given_records() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    let (pipeline, _) = test_pipeline(test_config(dir.path()), &mock);

    let (summary, _) = pipeline
        .execute(RunRequest::RecordIds(vec![key("5"), key("6")]))
        .await
        .unwrap();

    assert_eq!(mock.order_calls(), vec![vec![key("5"), key("6")]]);
    assert_eq!(summary.downloaded, 2);
}

#[tokio::test]
async fn download_available_fetches_ready_items_of_existing_orders() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_existing(existing_item(RCM, "1", 70, RemoteState::Available, None));
    mock.add_existing(existing_item(RCM, "2", 71, RemoteState::Pending, None));
    let (pipeline, _) = test_pipeline(test_config(dir.path()), &mock);

    let (summary, store) = pipeline
        .execute(RunRequest::DownloadAvailable { max_orders: 10 })
        .await
        .unwrap();

    assert_eq!(summary.total, 1);
    assert!(store.get(&key("1")).unwrap().is_downloaded());
    assert!(mock.order_calls().is_empty());
}

#[tokio::test]
async fn interrupt_mid_cycle_keeps_the_last_whole_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results(RCM, &["1", "2"]);
    mock.plan("1", StatusPlan::Pending);
    mock.plan("2", StatusPlan::Pending);
    let mut config = test_config(dir.path());
    config.order.max_items_per_order = 1;
    let (pipeline, _) = test_pipeline(config.clone(), &mock);
    // Two orders per cycle: the third call lands in the middle of cycle two
    mock.cancel_on_status_call(3, pipeline.cancellation_token());

    let (summary, _) = pipeline.execute(RunRequest::Full(search(&[RCM]))).await.unwrap();

    assert!(summary.interrupted);
    assert_eq!(mock.status_calls().len(), 3);
    let results = summary.results_file.unwrap();
    let saved = recorder::load(&results).unwrap();
    for id in ["1", "2"] {
        let record = saved.get(&key(id)).unwrap();
        assert_eq!(record.status(), &RecordStatus::Submitted);
        assert_eq!(record.poll_attempts(), 1);
    }

    // Resuming from the table picks the orders up again
    mock.plan("1", StatusPlan::AvailableAfter(1));
    mock.plan("2", StatusPlan::AvailableAfter(1));
    config.paths.results = dir.path().join("resumed");
    let (resumed, _) = test_pipeline(config, &mock);

    let summary = resumed.run(RunRequest::DownloadResults(results)).await.unwrap();

    assert_eq!(summary.downloaded, 2);
    assert_eq!(mock.order_calls().len(), 2);
}

#[tokio::test]
async fn resume_skips_downloaded_records_unless_forced() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results(RCM, &["1", "2"]);
    let mut config = test_config(dir.path());
    let (first, _) = test_pipeline(config.clone(), &mock);
    let results = first
        .run(RunRequest::Full(search(&[RCM])))
        .await
        .unwrap()
        .results_file
        .unwrap();
    assert_eq!(mock.download_calls().len(), 2);

    config.paths.results = dir.path().join("second");
    let (second, _) = test_pipeline(config.clone(), &mock);
    let summary = second
        .run(RunRequest::DownloadResults(results.clone()))
        .await
        .unwrap();
    assert_eq!(summary.downloaded, 2);
    assert_eq!(mock.download_calls().len(), 2);

    config.paths.results = dir.path().join("third");
    config.download.force = true;
    let (third, _) = test_pipeline(config, &mock);
    let summary = third.run(RunRequest::DownloadResults(results)).await.unwrap();
    assert_eq!(summary.downloaded, 2);
    assert_eq!(mock.download_calls().len(), 4);
    assert_eq!(mock.order_calls().len(), 1);
}

#[tokio::test]
async fn missing_results_table_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    let (pipeline, _) = test_pipeline(test_config(dir.path()), &mock);

    let err = pipeline
        .run(RunRequest::DownloadResults(dir.path().join("nope.csv")))
        .await
        .unwrap_err();

    assert!(err.is_fatal());
}

fn partial_file(dir: &std::path::Path, id: &str) -> PathBuf {
    dir.join("downloads")
        .join(RCM)
        .join(format!("{id}_100_{id}.zip.partial"))
}

#[tokio::test]
async fn short_transfer_resumes_from_the_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results(RCM, &["1"]);
    mock.transfer_plan("1", TransferPlan::ShortFirst);
    let (pipeline, _) = test_pipeline(test_config(dir.path()), &mock);

    let (summary, store) = pipeline.execute(RunRequest::Full(search(&[RCM]))).await.unwrap();

    assert_eq!(summary.downloaded, 1);
    let half = (file_content("1").len() / 2) as u64;
    assert_eq!(mock.download_offsets(), vec![0, half]);
    let path = store.get(&key("1")).unwrap().local_path().unwrap().to_path_buf();
    assert_eq!(std::fs::read_to_string(path).unwrap(), file_content("1"));
    assert!(!partial_file(dir.path(), "1").exists());
}

#[tokio::test]
async fn stalled_transfer_times_out_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results(RCM, &["1"]);
    mock.transfer_plan("1", TransferPlan::StallFirst);
    let mut config = test_config(dir.path());
    config.rapi.timeout_download = Duration::from_millis(100);
    let (pipeline, _) = test_pipeline(config, &mock);

    let summary = tokio::time::timeout(
        Duration::from_secs(10),
        pipeline.run(RunRequest::Full(search(&[RCM]))),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(summary.downloaded, 1);
    let half = (file_content("1").len() / 2) as u64;
    assert_eq!(mock.download_offsets(), vec![0, half]);
}

#[tokio::test]
async fn slow_transfer_that_keeps_progressing_is_not_cut_off() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results(RCM, &["1"]);
    // Every byte arrives well inside the idle limit, the whole file does not
    mock.transfer_plan("1", TransferPlan::Slow(Duration::from_millis(40)));
    let mut config = test_config(dir.path());
    config.rapi.timeout_download = Duration::from_millis(150);
    let (pipeline, _) = test_pipeline(config, &mock);

    let summary = pipeline.run(RunRequest::Full(search(&[RCM]))).await.unwrap();

    assert_eq!(summary.downloaded, 1);
    assert_eq!(mock.download_offsets(), vec![0]);
}

#[tokio::test]
async fn cancelled_download_is_resumed_by_the_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results(RCM, &["1"]);
    let mut config = test_config(dir.path());
    let (pipeline, _) = test_pipeline(config.clone(), &mock);
    mock.transfer_plan("1", TransferPlan::CancelMidway(pipeline.cancellation_token()));

    let (summary, store) = pipeline.execute(RunRequest::Full(search(&[RCM]))).await.unwrap();

    assert!(summary.interrupted);
    assert_eq!(status_of(&store, "1"), RecordStatus::Downloading);
    let content = file_content("1");
    let half = content.len() / 2;
    let partial = partial_file(dir.path(), "1");
    assert_eq!(std::fs::read_to_string(&partial).unwrap(), content[..half]);

    let results = summary.results_file.unwrap();
    let saved = recorder::load(&results).unwrap();
    assert_eq!(saved.get(&key("1")).unwrap().status(), &RecordStatus::Available);

    config.paths.results = dir.path().join("resumed");
    let (resumed, _) = test_pipeline(config, &mock);
    let (summary, store) = resumed
        .execute(RunRequest::DownloadResults(results))
        .await
        .unwrap();

    assert_eq!(summary.downloaded, 1);
    assert_eq!(mock.download_offsets(), vec![0, half as u64]);
    let path = store.get(&key("1")).unwrap().local_path().unwrap().to_path_buf();
    assert_eq!(std::fs::read_to_string(path).unwrap(), content);
    assert_eq!(mock.order_calls().len(), 1);
}

#[tokio::test]
async fn complete_partial_file_is_finished_without_a_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results(RCM, &["1"]);
    let partial = partial_file(dir.path(), "1");
    std::fs::create_dir_all(partial.parent().unwrap()).unwrap();
    std::fs::write(&partial, file_content("1")).unwrap();
    let (pipeline, _) = test_pipeline(test_config(dir.path()), &mock);

    let (summary, store) = pipeline.execute(RunRequest::Full(search(&[RCM]))).await.unwrap();

    assert_eq!(summary.downloaded, 1);
    assert!(mock.download_calls().is_empty());
    let path = store.get(&key("1")).unwrap().local_path().unwrap().to_path_buf();
    assert_eq!(std::fs::read_to_string(path).unwrap(), file_content("1"));
    assert!(!partial.exists());
}

#[tokio::test]
async fn range_past_the_end_means_the_partial_file_is_complete() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results(RCM, &["1"]);
    mock.r#unsized("1");
    let partial = partial_file(dir.path(), "1");
    std::fs::create_dir_all(partial.parent().unwrap()).unwrap();
    std::fs::write(&partial, file_content("1")).unwrap();
    let (pipeline, _) = test_pipeline(test_config(dir.path()), &mock);

    let (summary, store) = pipeline.execute(RunRequest::Full(search(&[RCM]))).await.unwrap();

    assert_eq!(summary.downloaded, 1);
    assert_eq!(mock.download_calls(), vec![file_url("1")]);
    assert_eq!(mock.download_offsets(), vec![file_content("1").len() as u64]);
    assert!(store.get(&key("1")).unwrap().is_downloaded());
}

#[tokio::test]
async fn cancelling_during_status_retries_stops_polling() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results(RCM, &["1"]);
    mock.fail_status_calls();
    let mut config = test_config(dir.path());
    config.retry.max_attempts = 6;
    let (pipeline, sleeper) = test_pipeline(config, &mock);
    mock.cancel_on_status_call(1, pipeline.cancellation_token());

    let (summary, store) = pipeline.execute(RunRequest::Full(search(&[RCM]))).await.unwrap();

    assert!(summary.interrupted);
    assert_eq!(mock.status_calls().len(), 1);
    assert!(sleeper.recorded().is_empty());
    let record = store.get(&key("1")).unwrap();
    assert_eq!(record.status(), &RecordStatus::Submitted);
    assert_eq!(record.poll_attempts(), 0);
    assert!(mock.download_calls().is_empty());
}

#[tokio::test]
async fn unwritable_results_table_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.add_search_results(RCM, &["1"]);
    let mut config = test_config(dir.path());
    let blocker = dir.path().join("not_a_directory");
    std::fs::write(&blocker, "").unwrap();
    config.paths.results = blocker;
    let (pipeline, _) = test_pipeline(config, &mock);

    let result = pipeline.run(RunRequest::Full(search(&[RCM]))).await;

    assert!(result.is_err());
    // The work itself still happened
    assert_eq!(mock.download_calls().len(), 1);
}

#[tokio::test]
async fn export_run_orders_the_listed_records() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    let export = dir.path().join("export.csv");
    std::fs::write(
        &export,
        format!("Record ID,Collection ID,Title\n5,{RCM},first\n6,{RCM},second\n5,{RCM},again\n"),
    )
    .unwrap();
    let (pipeline, _) = test_pipeline(test_config(dir.path()), &mock);

    let (summary, store) = pipeline.execute(RunRequest::OrderCsv(export)).await.unwrap();

    assert_eq!(summary.total, 2);
    assert_eq!(summary.downloaded, 2);
    assert_eq!(mock.order_calls(), vec![vec![key("5"), key("6")]]);
    assert!(store.get(&key("6")).unwrap().is_downloaded());
}

#[tokio::test]
async fn unusable_export_is_fatal_before_signing_in() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockArchive::new();
    mock.fail_auth();
    let export = dir.path().join("export.csv");
    std::fs::write(&export, format!("Collection ID,Title\n{RCM},scene\n")).unwrap();
    let (pipeline, _) = test_pipeline(test_config(dir.path()), &mock);

    let err = pipeline.run(RunRequest::OrderCsv(export)).await.unwrap_err();

    assert!(matches!(err, Error::InvalidInput(_)));
    assert!(err.is_fatal());
    assert!(mock.order_calls().is_empty());
}
