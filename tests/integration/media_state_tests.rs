/*!
 * Media state recomputation and media-level request management
 */

use std::sync::Arc;

use tokio::sync::Notify;
use yastq::database::models::{MediaState, MediaType, RequestStatus};
use yastq::errors::QueueError;
use yastq::media::{MediaStateService, RepositoryMediaState};
use yastq::providers::MockBackend;
use yastq::requests::{RequestManager, RequestParams};

use crate::common::{create_test_file, create_test_subtitle, Harness};

fn manager(h: &Harness) -> RequestManager {
    RequestManager::new(
        h.repo.clone(),
        h.settings(),
        h.cancellations.clone(),
        Arc::new(RepositoryMediaState::new(h.repo.clone(), h.settings())),
        h.progress.clone(),
        Arc::new(Notify::new()),
    )
}

async fn movie(h: &Harness, name: &str, is_priority: bool) -> i64 {
    let video = create_test_file(h.dir.path(), &format!("{}.mkv", name), "").unwrap();
    h.repo
        .insert_media(MediaType::Movie, name, &video.to_string_lossy(), is_priority)
        .await
        .unwrap()
}

/// Test that recomputing the state twice changes nothing
#[tokio::test]
async fn test_updateState_calledRepeatedly_shouldBeIdempotent() {
    let h = Harness::new(MockBackend::working());
    let (media_id, _) = h.enqueue_movie(Some(2)).await.unwrap();
    let service = RepositoryMediaState::new(h.repo.clone(), h.settings());

    let first = service.update_state(media_id, MediaType::Movie).await.unwrap();
    let second = service.update_state(media_id, MediaType::Movie).await.unwrap();

    assert_eq!(first, MediaState::Pending);
    assert_eq!(second, first);
    assert_eq!(h.repo.requests_for_media(media_id, MediaType::Movie).await.unwrap().len(), 1);
}

/// Test the state while a request runs and after it completes
#[tokio::test]
async fn test_updateState_followingAJob_shouldMoveToComplete() {
    let h = Harness::new(MockBackend::working());
    let (media_id, _) = h.enqueue_movie(Some(2)).await.unwrap();
    let service = RepositoryMediaState::new(h.repo.clone(), h.settings());

    h.repo.claim_next("job", 1).await.unwrap();
    assert_eq!(service.update_state(media_id, MediaType::Movie).await.unwrap(), MediaState::InProgress);

    h.repo.reset_in_progress_requests().await.unwrap();
    let (_, outcome) = h.run_next().await.unwrap();
    assert_eq!(outcome, yastq::scheduler::JobOutcome::Completed);

    let stored = h.repo.get_media(media_id, MediaType::Movie).await.unwrap().unwrap();
    assert_eq!(stored.translation_state, MediaState::Complete);
}

/// Test that an unknown media item is not an error
#[tokio::test]
async fn test_updateState_unknownMedia_shouldReportNotStarted() {
    let h = Harness::new(MockBackend::working());
    let service = RepositoryMediaState::new(h.repo.clone(), h.settings());

    let state = service.update_state(999, MediaType::Episode).await.unwrap();

    assert_eq!(state, MediaState::NotStarted);
}

/// Test that queueing missing translations prefers the external subtitle
#[tokio::test]
async fn test_queueMissingTranslations_withExternalSource_shouldQueueOnce() {
    let h = Harness::new(MockBackend::working());
    let media_id = movie(&h, "Feature", false).await;
    let source = create_test_subtitle(h.dir.path(), "Feature.en.srt", 2).unwrap();
    let requests = manager(&h);

    let first = requests.queue_missing_translations(media_id, MediaType::Movie).await.unwrap();
    let second = requests.queue_missing_translations(media_id, MediaType::Movie).await.unwrap();

    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id(), first[0].id());
    let request = h.repo.get_request(first[0].id()).await.unwrap().unwrap();
    assert_eq!(request.target_language, "fr");
    assert_eq!(request.subtitle_path.as_deref(), Some(source.to_string_lossy().as_ref()));

    let stored = h.repo.get_media(media_id, MediaType::Movie).await.unwrap().unwrap();
    assert_eq!(stored.translation_state, MediaState::Pending);
}

/// Test that raising media priority reaches requests already queued
#[tokio::test]
async fn test_setMediaPriority_withQueuedRequest_shouldReorderQueue() {
    let h = Harness::new(MockBackend::working());
    let requests = manager(&h);
    let ad_hoc = h.enqueue_file(1).await.unwrap();
    let media_id = movie(&h, "Urgent", false).await;
    let queued = requests
        .create_request(RequestParams {
            media: Some((media_id, MediaType::Movie)),
            source_language: "en".to_string(),
            target_language: "de".to_string(),
            ..RequestParams::default()
        })
        .await
        .unwrap()
        .id();

    let updated = requests.set_media_priority(media_id, MediaType::Movie, true).await.unwrap();

    assert_eq!(updated, 1);
    assert_eq!(h.repo.claim_next("job", 1).await.unwrap().map(|r| r.id), Some(queued));
    assert_eq!(h.repo.claim_next("job-2", 1).await.unwrap().map(|r| r.id), Some(ad_hoc));
}

/// Test that a request for media that does not exist is refused
#[tokio::test]
async fn test_createRequest_unknownMedia_shouldBeInvalid() {
    let h = Harness::new(MockBackend::working());
    let requests = manager(&h);

    let err = requests
        .create_request(RequestParams {
            media: Some((42, MediaType::Movie)),
            source_language: "en".to_string(),
            target_language: "fr".to_string(),
            ..RequestParams::default()
        })
        .await
        .unwrap_err();

    assert!(matches!(err.downcast_ref::<QueueError>(), Some(QueueError::InvalidRequest(_))));
    assert!(h.repo.list_requests(Some(RequestStatus::Pending)).await.unwrap().is_empty());
}
