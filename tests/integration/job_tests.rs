/*!
 * End-to-end tests for translation jobs
 */

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use yastq::app_config::keys;
use yastq::database::models::{MediaState, MediaType, NewTranslationRequest, RequestStatus};
use yastq::providers::{MockBackend, MockBehavior};
use yastq::scheduler::{JobExecutor, JobOutcome};
use yastq::subtitle_processor::{SrtSubtitleIo, SubtitleEntry, SubtitleIo};
use yastq::translation::{JobServices, TranslationJob};

use crate::common::{self, subtitle_content, FakeExtractor, Harness};

/// Subtitle I/O that reads normally but cannot write anywhere
struct ReadOnlySubtitleIo;

#[async_trait]
impl SubtitleIo for ReadOnlySubtitleIo {
    async fn read_subtitles(&self, path: &Path) -> Result<Vec<SubtitleEntry>> {
        SrtSubtitleIo.read_subtitles(path).await
    }

    async fn write_subtitles(&self, path: &Path, _entries: &[SubtitleEntry]) -> Result<()> {
        Err(anyhow!("read-only filesystem: {}", path.display()))
    }
}

/// Test a line-by-line job from claim to written file
#[tokio::test]
async fn test_execute_adHocFile_shouldWriteTranslationAndRecordEverything() {
    let h = Harness::new(MockBackend::working());
    h.enqueue_file(3).await.unwrap();

    let (id, outcome) = h.run_next().await.unwrap();

    assert_eq!(outcome, JobOutcome::Completed);
    let written = fs::read_to_string(h.dir.path().join("clip0.fr.srt")).unwrap();
    assert!(written.contains("[fr] Line 0"));
    assert!(written.contains("[fr] Line 2"));

    let request = h.repo.get_request(id).await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Completed);
    assert_eq!(request.progress, 100);
    assert_eq!(h.progress.percents_for(id).last(), Some(&100));
    assert!(h.progress.statuses.lock().contains(&(id, RequestStatus::Completed)));

    let logs = h.repo.get_logs(id).await.unwrap();
    assert!(logs.iter().any(|l| l.message.starts_with("Translation completed")));

    let stats = h.repo.get_statistics().await.unwrap();
    assert_eq!(stats.total_files, 1);
    assert_eq!(stats.total_lines, 3);
    assert_eq!(stats.total_characters, 18);

    assert_eq!(h.limiter.available(), 1);
    assert!(h.cancellations.is_empty());
}

/// Test that a media job stores the source hash and completes the media
#[tokio::test]
async fn test_execute_movieWithExternalSubtitle_shouldCompleteMedia() {
    let h = Harness::new(MockBackend::working());
    h.set(keys::USE_BATCH_TRANSLATION, "true");
    h.set(keys::MAX_BATCH_SIZE, "2");
    let (media_id, _) = h.enqueue_movie(Some(5)).await.unwrap();

    let (_, outcome) = h.run_next().await.unwrap();

    assert_eq!(outcome, JobOutcome::Completed);
    assert!(h.dir.path().join("movie.fr.srt").exists());
    assert_eq!(h.backend.batch_calls().len(), 3);

    let media = h.repo.get_media(media_id, MediaType::Movie).await.unwrap().unwrap();
    assert_eq!(media.content_hash.as_ref().map(String::len), Some(64));
    assert_eq!(media.translation_state, MediaState::Complete);
}

/// Test that cancelling during a slow batch call stops the job cleanly
#[tokio::test]
async fn test_execute_cancelledMidBatch_shouldReleaseSlotAndClearHash() {
    let h = Harness::new(MockBackend::new(MockBehavior::Slow { delay_ms: 5_000 }));
    h.set(keys::USE_BATCH_TRANSLATION, "true");
    h.set(keys::MAX_BATCH_SIZE, "2");
    let (media_id, id) = h.enqueue_movie(Some(6)).await.unwrap();
    h.repo
        .set_content_hash(media_id, MediaType::Movie, Some("previous".to_string()))
        .await
        .unwrap();

    let request = h.repo.claim_next("job-1", 1).await.unwrap().unwrap();
    let job = h.job();
    let running = tokio::spawn(async move { job.execute(request, "job-1".to_string()).await });

    common::wait_for(|| h.backend.call_count() == 1).await;
    assert!(h.cancellations.cancel(id));
    let outcome = running.await.unwrap().unwrap();

    assert_eq!(outcome, JobOutcome::Cancelled);
    assert_eq!(h.repo.get_request(id).await.unwrap().unwrap().status, RequestStatus::Cancelled);
    assert_eq!(h.limiter.available(), 1);
    assert!(h.cancellations.is_empty());
    assert!(!h.dir.path().join("movie.fr.srt").exists());

    let media = h.repo.get_media(media_id, MediaType::Movie).await.unwrap().unwrap();
    assert_eq!(media.content_hash, None);
    assert_eq!(media.translation_state, MediaState::NotStarted);
}

/// Test that a subtitle rejected by validation cancels the request
#[tokio::test]
async fn test_execute_validationRejects_shouldCancelWithoutTranslating() {
    let h = Harness::new(MockBackend::working());
    h.set(keys::SUBTITLE_VALIDATION_ENABLED, "true");
    h.set(keys::VALIDATION_MAX_LINE_LENGTH, "3");
    h.enqueue_file(2).await.unwrap();

    let (id, outcome) = h.run_next().await.unwrap();

    assert_eq!(outcome, JobOutcome::Cancelled);
    assert_eq!(h.backend.call_count(), 0);
    assert!(!h.dir.path().join("clip0.fr.srt").exists());
    let logs = h.repo.get_logs(id).await.unwrap();
    assert!(logs.iter().any(|l| l.level == "warn" && l.message.contains("validation")));
}

/// Test that a movie without an external subtitle uses the embedded stream
#[tokio::test]
async fn test_execute_withoutExternalSubtitle_shouldExtractEmbeddedTrack() {
    let h = Harness::with_extractor(
        MockBackend::working(),
        FakeExtractor::with_track("eng", subtitle_content(2)),
    );
    let (media_id, id) = h.enqueue_movie(None).await.unwrap();

    let (_, outcome) = h.run_next().await.unwrap();

    assert_eq!(outcome, JobOutcome::Completed);
    assert_eq!(h.extractor.extract_calls.load(Ordering::SeqCst), 1);
    let written = fs::read_to_string(h.dir.path().join("movie.fr.srt")).unwrap();
    assert!(written.contains("[fr] Line 1"));

    let logs = h.repo.get_logs(id).await.unwrap();
    assert!(logs.iter().any(|l| l.message.contains("embedded")));
    let media = h.repo.get_media(media_id, MediaType::Movie).await.unwrap().unwrap();
    assert!(media.content_hash.is_some());
}

/// Test that two languages of one movie extracted at once do not share a file
#[tokio::test]
async fn test_execute_concurrentExtractionsForSameMedia_shouldBothComplete() {
    let h = Harness::with_extractor(
        MockBackend::working(),
        FakeExtractor::with_track("eng", subtitle_content(3)),
    );
    h.set(keys::MAX_CONCURRENT_JOBS, "2");
    h.set(keys::MAX_EXTRACTION_RETRIES, "1");
    let (media_id, _) = h.enqueue_movie(None).await.unwrap();
    h.repo
        .insert_request(&NewTranslationRequest {
            media_id: Some(media_id),
            media_type: Some(MediaType::Movie),
            title: "Movie".to_string(),
            source_language: "en".to_string(),
            target_language: "de".to_string(),
            subtitle_path: None,
            is_priority: false,
        })
        .await
        .unwrap();

    let first = h.repo.claim_next("job-1", 1).await.unwrap().unwrap();
    let second = h.repo.claim_next("job-2", 1).await.unwrap().unwrap();
    let (job_a, job_b) = (h.job(), h.job());
    let (a, b) = tokio::join!(
        job_a.execute(first, "job-1".to_string()),
        job_b.execute(second, "job-2".to_string())
    );

    assert_eq!(a.unwrap(), JobOutcome::Completed);
    assert_eq!(b.unwrap(), JobOutcome::Completed);
    assert!(h.dir.path().join("movie.fr.srt").exists());
    assert!(h.dir.path().join("movie.de.srt").exists());

    let dirs = h.extractor.out_dirs.lock().clone();
    assert_eq!(dirs.len(), 2);
    assert_ne!(dirs[0], dirs[1]);
    assert!(dirs.iter().all(|dir| !dir.exists()));
}

/// Test that extraction failing on every attempt fails the request
#[tokio::test]
async fn test_execute_extractionAlwaysFails_shouldFailAfterRetries() {
    let h = Harness::with_extractor(MockBackend::working(), FakeExtractor::broken("en"));
    let (media_id, id) = h.enqueue_movie(None).await.unwrap();

    let (_, outcome) = h.run_next().await.unwrap();

    assert_eq!(outcome, JobOutcome::Failed);
    assert_eq!(h.extractor.extract_calls.load(Ordering::SeqCst), 2);
    let logs = h.repo.get_logs(id).await.unwrap();
    assert!(logs.iter().any(|l| l.level == "error" && l.message.starts_with("Translation failed")));

    let media = h.repo.get_media(media_id, MediaType::Movie).await.unwrap().unwrap();
    assert_eq!(media.translation_state, MediaState::Failed);
}

/// Test that lines lost in the first pass are recovered by deferred repair
#[tokio::test]
async fn test_execute_deferredRepair_shouldRecoverFailedBatch() {
    let h = Harness::new(MockBackend::new(MockBehavior::FailFirst { failures: 1 }));
    h.set(keys::USE_BATCH_TRANSLATION, "true");
    h.set(keys::USE_DEFERRED_REPAIR, "true");
    h.set(keys::MAX_SPLIT_ATTEMPTS, "1");
    h.enqueue_file(4).await.unwrap();

    let (id, outcome) = h.run_next().await.unwrap();

    assert_eq!(outcome, JobOutcome::Completed);
    let percents = h.progress.percents_for(id);
    assert_eq!(percents.last(), Some(&100));
    assert!(percents[..percents.len() - 1].iter().all(|&p| p <= 95));
    let written = fs::read_to_string(h.dir.path().join("clip0.fr.srt")).unwrap();
    assert_eq!(written.matches("[fr] ").count(), 4);
}

/// Test that lines the backend never returns fail the job after repair
#[tokio::test]
async fn test_execute_deferredRepairExhausted_shouldFailWithExamples() {
    let h = Harness::new(MockBackend::new(MockBehavior::OmitPositions(vec![1])));
    h.set(keys::USE_BATCH_TRANSLATION, "true");
    h.set(keys::USE_DEFERRED_REPAIR, "true");
    h.enqueue_file(4).await.unwrap();

    let (id, outcome) = h.run_next().await.unwrap();

    assert_eq!(outcome, JobOutcome::Failed);
    assert!(!h.dir.path().join("clip0.fr.srt").exists());
    let logs = h.repo.get_logs(id).await.unwrap();
    assert!(logs.iter().any(|l| l.level == "error" && l.message.contains("Line 1")));
}

/// Test that an execution for an already finished request does nothing
#[tokio::test]
async fn test_execute_requestAlreadyCancelled_shouldSkip() {
    let h = Harness::new(MockBackend::working());
    let id = h.enqueue_file(2).await.unwrap();
    let request = h.repo.claim_next("job-1", 1).await.unwrap().unwrap();
    h.repo.finish_request(id, RequestStatus::Cancelled).await.unwrap();

    let outcome = h.job().execute(request, "job-1".to_string()).await.unwrap();

    assert_eq!(outcome, JobOutcome::Skipped);
    assert_eq!(h.backend.call_count(), 0);
    assert!(h.cancellations.is_empty());
    assert_eq!(h.repo.get_request(id).await.unwrap().unwrap().status, RequestStatus::Cancelled);
}

/// Test that a job whose output cannot be written never reports full progress
#[tokio::test]
async fn test_execute_outputUnwritable_shouldFailBelowFullProgress() {
    let h = Harness::new(MockBackend::working());
    let id = h.enqueue_file(3).await.unwrap();
    let job = Arc::new(TranslationJob::new(JobServices {
        subtitles: Arc::new(ReadOnlySubtitleIo),
        ..h.services()
    }));

    let request = h.repo.claim_next("job-1", 1).await.unwrap().unwrap();
    let outcome = job.execute(request, "job-1".to_string()).await.unwrap();

    assert_eq!(outcome, JobOutcome::Failed);
    assert_eq!(h.backend.call_count(), 3);
    assert!(!h.progress.percents_for(id).contains(&100));
    let request = h.repo.get_request(id).await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Failed);
    assert!(request.progress < 100);
    let logs = h.repo.get_logs(id).await.unwrap();
    assert!(logs.iter().any(|l| l.level == "warn" && l.message.starts_with("Cannot write")));
}
