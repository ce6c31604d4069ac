//! Job pipeline tests against fake renderer, decoder and load sampler.
//!
//! Run with: cargo test --test pipeline_test

mod fixtures;
mod helpers;

use fixtures::*;
use helpers::*;
use std::time::{Duration, Instant};
use uuid::Uuid;

use codescan::models::api::{SubmitOptions, Submission};
use codescan::models::error::ErrorKind;
use codescan::models::job::JobState;
use codescan::models::load::{JobCounts, LoadSample};
use codescan::services::pipeline::ServiceError;

fn async_options() -> SubmitOptions {
    SubmitOptions::default()
}

fn sync_options(timeout: u64) -> SubmitOptions {
    SubmitOptions {
        timeout: Some(timeout),
        run_async: Some(false),
    }
}

async fn submit_async(h: &Harness, fixture: &DocumentFixture) -> Uuid {
    match h
        .service
        .submit(fixture.filename, &fixture.bytes(), async_options())
        .await
        .expect("submission accepted")
    {
        Submission::Accepted(accepted) => {
            assert_eq!(accepted.state, JobState::Queued);
            accepted.job_id
        }
        Submission::Finished(view) => panic!("async submission returned a finished job: {view:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_twenty_five_pages_run_in_three_sequential_batches() {
    let h = harness(FakeRenderer::new(Duration::from_millis(20)), FakeDetector::new(2));
    h.service.start(calm());

    let view = match h
        .service
        .submit(
            TWENTY_FIVE_PAGES.filename,
            &TWENTY_FIVE_PAGES.bytes(),
            sync_options(30),
        )
        .await
        .expect("job finished")
    {
        Submission::Finished(view) => view,
        Submission::Accepted(_) => panic!("synchronous submission was not awaited"),
    };

    assert_state(&view, JobState::Completed);
    let report = view.result.expect("completed job has a result");
    assert_eq!(report.pages_total, 25);
    assert!(report.failed_pages.is_empty());

    // ceil(25 / 10) batches of 10, 10 and 5 pages.
    let sizes: Vec<usize> = report.batches.iter().map(|b| b.page_count).collect();
    assert_eq!(sizes, vec![10, 10, 5]);
    let firsts: Vec<u32> = report.batches.iter().map(|b| b.first_page).collect();
    assert_eq!(firsts, vec![1, 11, 21]);
    for pair in report.batches.windows(2) {
        assert!(pair[0].finished_at <= pair[1].started_at, "batches overlapped");
    }

    // Every page of batch N finished rendering before any page of batch N+1 started.
    let windows = h.renderer.windows();
    assert_eq!(windows.len(), 25);
    for batch in 0..2 {
        let last_end = windows
            .iter()
            .filter(|(i, _, _)| i / 10 == batch)
            .map(|(_, _, end)| *end)
            .max()
            .unwrap();
        let next_start = windows
            .iter()
            .filter(|(i, _, _)| i / 10 == batch + 1)
            .map(|(_, start, _)| *start)
            .min()
            .unwrap();
        assert!(last_end <= next_start, "batch {batch} overlapped the next one");
    }

    // Pages within a batch ran concurrently, never above the hardware limit.
    let peak = h.renderer.peak_concurrency();
    assert!(peak > 1, "pages were not processed concurrently");
    assert!(peak <= 4, "pool exceeded hardware limit: {peak}");

    // Aggregate count is the sum over pages; every result lies inside its page.
    assert_eq!(report.detections.len(), 50);
    for d in &report.detections {
        assert!((1..=25).contains(&d.page));
        assert!(d.bbox.x1 <= d.center.x && d.center.x <= d.bbox.x2);
        assert!(d.bbox.y1 <= d.center.y && d.center.y <= d.bbox.y2);
        assert!(d.bbox.x2 <= LETTER.width && d.bbox.y2 <= LETTER.height);
        let payload = d.content.payload().expect("decoded payload");
        assert!(payload.starts_with(&format!("page-{}-", d.page)));
    }

    assert_eq!(view.progress.pages_total, 25);
    assert_eq!(view.progress.pages_done, 25);
    assert_eq!(view.progress.pages_failed, 0);

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_async_submission_transitions_to_completed() {
    let h = harness(FakeRenderer::new(Duration::from_millis(5)), FakeDetector::new(1));
    h.service.start(calm());

    let job_id = submit_async(&h, &SIX_PAGES).await;
    let view = wait_terminal(&h.service, job_id, Duration::from_secs(5)).await;

    assert_state(&view, JobState::Completed);
    assert!(view.completed_at.is_some());
    assert!(view.elapsed_ms.is_some());
    assert_eq!(view.result.unwrap().detections.len(), 6);
    assert_eq!(view.source, SIX_PAGES.filename);

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_every_page_failing_fails_the_job() {
    let h = harness(
        FakeRenderer::new(Duration::ZERO).failing(&[0, 1, 2, 3, 4, 5]),
        FakeDetector::new(1),
    );
    h.service.start(calm());

    let job_id = submit_async(&h, &SIX_PAGES).await;
    let view = wait_terminal(&h.service, job_id, Duration::from_secs(5)).await;

    assert_state(&view, JobState::Failed);
    assert!(view.result.is_none());
    let error = view.error.expect("failed job has an error");
    assert_eq!(error.kind, ErrorKind::AllPagesFailed);
    assert!(error.message.contains("page 1"));
    assert_eq!(view.progress.pages_failed, 6);

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_partial_failures_are_recorded_not_fatal() {
    let h = harness(
        FakeRenderer::new(Duration::ZERO).failing(&[1]),
        FakeDetector::new(2).failing(&[4]),
    );
    h.service.start(calm());

    let job_id = submit_async(&h, &SIX_PAGES).await;
    let view = wait_terminal(&h.service, job_id, Duration::from_secs(5)).await;

    assert_state(&view, JobState::Completed);
    let report = view.result.unwrap();
    assert_eq!(report.detections.len(), 8);
    assert!(report.detections.iter().all(|d| d.page != 2 && d.page != 5));

    let failed: Vec<(u32, ErrorKind)> = report.failed_pages.iter().map(|f| (f.page, f.kind)).collect();
    assert_eq!(
        failed,
        vec![(2, ErrorKind::PageRender), (5, ErrorKind::PageDecode)]
    );
    assert_eq!(view.progress.pages_failed, 2);

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_unmeasurable_page_fails_alone() {
    let h = harness(FakeRenderer::new(Duration::ZERO), FakeDetector::new(1));
    h.service.start(calm());

    let job_id = submit_async(&h, &WITH_UNMEASURABLE_PAGE).await;
    let view = wait_terminal(&h.service, job_id, Duration::from_secs(5)).await;

    assert_state(&view, JobState::Completed);
    let report = view.result.unwrap();
    assert_eq!(report.detections.len(), 3);
    assert_eq!(report.failed_pages.len(), 1);
    assert_eq!(report.failed_pages[0].page, 3);

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_document_errors_fail_the_job() {
    let h = harness(FakeRenderer::new(Duration::ZERO), FakeDetector::new(1));
    h.service.start(calm());

    let job_id = submit_async(&h, &EMPTY_DOCUMENT).await;
    let view = wait_terminal(&h.service, job_id, Duration::from_secs(5)).await;

    assert_state(&view, JobState::Failed);
    assert_eq!(view.error.unwrap().kind, ErrorKind::Document);

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_job_timeout_fails_promptly() {
    let h = harness(
        FakeRenderer::new(Duration::ZERO).hanging(&[0]),
        FakeDetector::new(1),
    );
    h.service.start(calm());

    let options = SubmitOptions {
        timeout: Some(1),
        run_async: Some(true),
    };
    let started = Instant::now();
    let job_id = match h
        .service
        .submit(SINGLE_PAGE.filename, &SINGLE_PAGE.bytes(), options)
        .await
        .unwrap()
    {
        Submission::Accepted(accepted) => accepted.job_id,
        Submission::Finished(_) => panic!("expected an accepted job"),
    };

    let view = wait_terminal(&h.service, job_id, Duration::from_secs(5)).await;
    let elapsed = started.elapsed();

    assert_state(&view, JobState::Failed);
    assert_eq!(view.error.unwrap().kind, ErrorKind::Timeout);
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_millis(2500), "timeout took {elapsed:?}");

    // The abandoned job's upload is gone.
    assert!(wait_work_dir_empty(h.work.path(), Duration::from_secs(2)).await);

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_hung_page_becomes_page_timeout() {
    let h = harness_with(
        FakeRenderer::new(Duration::ZERO).hanging(&[2]),
        FakeDetector::new(1),
        |config| config.page_timeout = Duration::from_millis(100),
    );
    h.service.start(calm());

    let job_id = submit_async(&h, &SIX_PAGES).await;
    let view = wait_terminal(&h.service, job_id, Duration::from_secs(5)).await;

    assert_state(&view, JobState::Completed);
    let report = view.result.unwrap();
    assert_eq!(report.detections.len(), 5);
    assert_eq!(report.failed_pages.len(), 1);
    assert_eq!(report.failed_pages[0].page, 3);
    assert_eq!(report.failed_pages[0].kind, ErrorKind::PageTimeout);

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_overloaded_system_rejects_without_creating_a_job() {
    let h = harness(FakeRenderer::new(Duration::ZERO), FakeDetector::new(1));
    h.service.load_state().record(LoadSample::new(97.0, 30.0));

    let err = h
        .service
        .submit(SINGLE_PAGE.filename, &SINGLE_PAGE.bytes(), async_options())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SystemOverloaded);
    assert!(matches!(err, ServiceError::SystemOverloaded { .. }));
    let stats = h.service.stats();
    assert!(stats.overloaded);
    assert_eq!(stats.queue_depth, 0);
    assert_eq!(stats.jobs.queued, 0);
    assert!(wait_work_dir_empty(h.work.path(), Duration::from_millis(100)).await);
}

#[tokio::test]
async fn test_monitor_feeds_admission_control() {
    let h = harness(FakeRenderer::new(Duration::ZERO), FakeDetector::new(1));
    h.service.start(FixedSampler(LoadSample::new(20.0, 99.0)));

    // Each tick above the watermark halves the pool: 4, 2, 1.
    let deadline = Instant::now() + Duration::from_secs(2);
    while h.service.stats().memory_percent < 99.0 || h.service.stats().pool_capacity > 1 {
        assert!(Instant::now() < deadline, "monitor never shrank the pool");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let err = h
        .service
        .submit(SINGLE_PAGE.filename, &SINGLE_PAGE.bytes(), async_options())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SystemOverloaded);

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_full_queue_rejects() {
    let h = harness_with(
        FakeRenderer::new(Duration::ZERO),
        FakeDetector::new(1),
        |config| config.queue_capacity = 1,
    );
    // Not started: nothing drains the queue.
    submit_async(&h, &SINGLE_PAGE).await;

    let err = h
        .service
        .submit(SINGLE_PAGE.filename, &SINGLE_PAGE.bytes(), async_options())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::QueueFull));
    assert_eq!(err.kind(), ErrorKind::SystemOverloaded);
    assert_eq!(h.service.stats().jobs.queued, 1);
}

#[tokio::test]
async fn test_synchronous_wait_times_out_but_job_survives() {
    let h = harness(FakeRenderer::new(Duration::ZERO), FakeDetector::new(1));
    // Not started: the job stays queued past the wait.

    let err = h
        .service
        .submit(SINGLE_PAGE.filename, &SINGLE_PAGE.bytes(), sync_options(1))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RequestTimeout);
    let job_id = err.job_id().expect("request timeout names the job");
    assert_eq!(h.service.status(job_id).unwrap().state, JobState::Queued);

    h.service.start(calm());
    let view = wait_terminal(&h.service, job_id, Duration::from_secs(5)).await;
    assert_state(&view, JobState::Completed);

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let h = harness(FakeRenderer::new(Duration::ZERO), FakeDetector::new(1));
    let err = h.service.status(Uuid::new_v4()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_invalid_submissions_are_rejected() {
    let h = harness(FakeRenderer::new(Duration::ZERO), FakeDetector::new(1));

    let empty = h.service.submit("a.pdf", b"", async_options()).await.unwrap_err();
    assert_eq!(empty.kind(), ErrorKind::Validation);

    let not_pdf = h
        .service
        .submit("a.png", b"\x89PNG\r\n", async_options())
        .await
        .unwrap_err();
    assert_eq!(not_pdf.kind(), ErrorKind::Validation);

    let zero_timeout = SubmitOptions {
        timeout: Some(0),
        run_async: None,
    };
    let err = h
        .service
        .submit("a.pdf", &SINGLE_PAGE.bytes(), zero_timeout)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert_eq!(h.service.stats().jobs, JobCounts::default());
}

#[tokio::test]
async fn test_sweeper_keeps_unfinished_jobs() {
    let h = harness_with(
        FakeRenderer::new(Duration::ZERO).hanging(&[0]),
        FakeDetector::new(1),
        |config| {
            config.job_workers = 1;
            config.retention = Duration::ZERO;
        },
    );
    h.service.start(calm());

    let running = submit_async(&h, &SINGLE_PAGE).await;
    let deadline = Instant::now() + Duration::from_secs(2);
    while h.service.status(running).unwrap().state != JobState::Processing {
        assert!(Instant::now() < deadline, "job never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // The only worker is stuck, so this one stays queued.
    let waiting = submit_async(&h, &SINGLE_PAGE).await;

    // Several sweeps with zero retention.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.service.status(running).unwrap().state, JobState::Processing);
    assert_eq!(h.service.status(waiting).unwrap().state, JobState::Queued);

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_terminal_job_is_swept_after_retention() {
    let h = harness_with(
        FakeRenderer::new(Duration::ZERO),
        FakeDetector::new(1),
        |config| config.retention = Duration::from_millis(100),
    );
    h.service.start(calm());

    let job_id = submit_async(&h, &SINGLE_PAGE).await;
    let view = wait_terminal(&h.service, job_id, Duration::from_secs(5)).await;
    assert_state(&view, JobState::Completed);

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        match h.service.status(job_id) {
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::NotFound);
                break;
            }
            Ok(_) => {
                assert!(Instant::now() < deadline, "completed job was never swept");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_job_artifacts_are_removed() {
    let h = harness(
        FakeRenderer::new(Duration::ZERO).failing(&[0]),
        FakeDetector::new(1),
    );
    h.service.start(calm());

    let ok = submit_async(&h, &SIX_PAGES).await;
    let failed = submit_async(&h, &SINGLE_PAGE).await;
    wait_terminal(&h.service, ok, Duration::from_secs(5)).await;
    let failed_view = wait_terminal(&h.service, failed, Duration::from_secs(5)).await;
    assert_state(&failed_view, JobState::Failed);

    assert!(
        wait_work_dir_empty(h.work.path(), Duration::from_secs(2)).await,
        "job directories left behind"
    );

    h.service.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_background_tasks() {
    let h = harness(FakeRenderer::new(Duration::ZERO), FakeDetector::new(1));
    h.service.start(calm());
    assert!(h.service.health().started);

    tokio::time::timeout(Duration::from_secs(2), h.service.shutdown())
        .await
        .expect("shutdown hung");
    assert!(!h.service.health().started);
}
