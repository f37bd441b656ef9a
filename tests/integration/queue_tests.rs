/*!
 * Integration tests for the persistent request queue
 */

use std::collections::HashSet;

use yastq::database::models::{MediaType, NewTranslationRequest, RequestStatus};
use yastq::database::{DatabaseConnection, InsertOutcome, Repository};
use yastq::errors::QueueError;

use crate::common;

fn ad_hoc(path: &str, target: &str) -> NewTranslationRequest {
    NewTranslationRequest {
        media_id: None,
        media_type: None,
        title: path.to_string(),
        source_language: "en".to_string(),
        target_language: target.to_string(),
        subtitle_path: Some(path.to_string()),
        is_priority: false,
    }
}

/// Test that two connections to the same file never claim the same request
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_claimNext_twoConnectionsRacing_shouldNeverDoubleClaim() {
    let dir = common::create_temp_dir().unwrap();
    let path = dir.path().join("queue.db");
    let first = Repository::new(DatabaseConnection::new(&path).unwrap());
    let second = Repository::new(DatabaseConnection::new(&path).unwrap());

    for i in 0..20 {
        first.insert_request(&ad_hoc(&format!("/subs/{}.srt", i), "fr")).await.unwrap();
    }

    let worker = |repo: Repository, name: &'static str| {
        tokio::spawn(async move {
            let mut claimed = Vec::new();
            let mut n = 0;
            while let Some(request) = repo.claim_next(&format!("{}-{}", name, n), 10).await.unwrap() {
                claimed.push(request.id);
                n += 1;
            }
            claimed
        })
    };

    let a = worker(first.clone(), "a");
    let b = worker(second, "b");
    let mut all = a.await.unwrap();
    all.extend(b.await.unwrap());

    let unique: HashSet<i64> = all.iter().copied().collect();
    assert_eq!(all.len(), 20);
    assert_eq!(unique.len(), 20);
    assert!(first.list_requests(Some(RequestStatus::Pending)).await.unwrap().is_empty());
}

/// Test that an active tuple is reused and a finished one can be queued again
#[tokio::test]
async fn test_insertRequest_activeTuple_shouldDeduplicateUntilFinished() {
    let repo = Repository::new_in_memory().unwrap();
    let media_id = repo.insert_media(MediaType::Episode, "Pilot", "/tv/Show/S01E01.mkv", false).await.unwrap();
    let request = NewTranslationRequest {
        media_id: Some(media_id),
        media_type: Some(MediaType::Episode),
        title: "Pilot".to_string(),
        source_language: "en".to_string(),
        target_language: "de".to_string(),
        subtitle_path: None,
        is_priority: false,
    };

    let created = repo.insert_request(&request).await.unwrap();
    assert!(matches!(created, InsertOutcome::Created(_)));

    let again = repo.insert_request(&request).await.unwrap();
    assert_eq!(again, InsertOutcome::Existing(created.id()));

    repo.claim_next("job", 1).await.unwrap();
    assert_eq!(repo.insert_request(&request).await.unwrap(), InsertOutcome::Existing(created.id()));

    repo.finish_request(created.id(), RequestStatus::Failed).await.unwrap();
    let fresh = repo.insert_request(&request).await.unwrap();
    assert!(matches!(fresh, InsertOutcome::Created(id) if id != created.id()));
    assert_eq!(repo.requests_for_media(media_id, MediaType::Episode).await.unwrap().len(), 2);
}

/// Test that ad-hoc requests are told apart by subtitle path and language
#[tokio::test]
async fn test_insertRequest_adHoc_shouldDeduplicateOnSubtitlePath() {
    let repo = Repository::new_in_memory().unwrap();

    let first = repo.insert_request(&ad_hoc("/subs/a.srt", "fr")).await.unwrap();
    let same = repo.insert_request(&ad_hoc("/subs/a.srt", "fr")).await.unwrap();
    let other_file = repo.insert_request(&ad_hoc("/subs/b.srt", "fr")).await.unwrap();
    let other_language = repo.insert_request(&ad_hoc("/subs/a.srt", "es")).await.unwrap();

    assert_eq!(same, InsertOutcome::Existing(first.id()));
    assert!(matches!(other_file, InsertOutcome::Created(_)));
    assert!(matches!(other_language, InsertOutcome::Created(_)));
    assert_eq!(repo.active_request_count().await.unwrap(), 3);
}

/// Test that priority requests are claimed first, then the oldest
#[tokio::test]
async fn test_claimNext_mixedPriority_shouldPreferPriorityThenAge() {
    let repo = Repository::new_in_memory().unwrap();
    let old = repo.insert_request(&ad_hoc("/subs/old.srt", "fr")).await.unwrap().id();
    let newer = repo.insert_request(&ad_hoc("/subs/new.srt", "fr")).await.unwrap().id();
    let urgent = repo
        .insert_request(&NewTranslationRequest {
            is_priority: true,
            ..ad_hoc("/subs/urgent.srt", "fr")
        })
        .await
        .unwrap()
        .id();

    let order: Vec<i64> = [
        repo.claim_next("1", 1).await.unwrap(),
        repo.claim_next("2", 1).await.unwrap(),
        repo.claim_next("3", 1).await.unwrap(),
    ]
    .into_iter()
    .map(|r| r.unwrap().id)
    .collect();

    assert_eq!(order, vec![urgent, old, newer]);
    assert!(repo.claim_next("4", 1).await.unwrap().is_none());
}

/// Test recovery of requests stranded by a crash
#[tokio::test]
async fn test_resetInProgressRequests_afterCrash_shouldRequeueOnlyInProgress() {
    let repo = Repository::new_in_memory().unwrap();
    let stranded = repo.insert_request(&ad_hoc("/subs/1.srt", "fr")).await.unwrap().id();
    let done = repo.insert_request(&ad_hoc("/subs/2.srt", "fr")).await.unwrap().id();
    repo.claim_next("crashed", 1).await.unwrap();
    repo.claim_next("finished", 1).await.unwrap();
    repo.update_progress(stranded, 40).await.unwrap();
    repo.finish_request(done, RequestStatus::Completed).await.unwrap();

    assert_eq!(repo.reset_in_progress_requests().await.unwrap(), 1);

    let request = repo.get_request(stranded).await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Pending);
    assert_eq!(request.job_id, None);
    assert_eq!(request.progress, 0);
    assert_eq!(repo.get_request(done).await.unwrap().unwrap().status, RequestStatus::Completed);
}

/// Test that a finished request refuses a late execution
#[tokio::test]
async fn test_beginExecution_afterCancellation_shouldReportStaleExecution() {
    let repo = Repository::new_in_memory().unwrap();
    let id = repo.insert_request(&ad_hoc("/subs/1.srt", "fr")).await.unwrap().id();
    repo.finish_request(id, RequestStatus::Cancelled).await.unwrap();

    let err = repo.begin_execution(id, "late-job").await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<QueueError>(),
        Some(QueueError::StaleExecution { status, .. }) if status == "cancelled"
    ));
    assert!(!repo.finish_request(id, RequestStatus::Completed).await.unwrap());
}

/// Test that finishing a deleted request is reported as not found
#[tokio::test]
async fn test_finishRequest_deletedRow_shouldReturnNotFound() {
    let repo = Repository::new_in_memory().unwrap();
    let id = repo.insert_request(&ad_hoc("/subs/1.srt", "fr")).await.unwrap().id();
    assert!(repo.delete_request(id).await.unwrap());

    let err = repo.finish_request(id, RequestStatus::Completed).await.unwrap_err();

    assert!(matches!(err.downcast_ref::<QueueError>(), Some(QueueError::NotFound(_))));
}
