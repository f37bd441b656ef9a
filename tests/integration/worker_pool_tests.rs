/*!
 * Worker pool lifecycle with real translation jobs
 */

use std::sync::Arc;
use std::time::Duration;

use yastq::app_config::keys;
use yastq::database::models::RequestStatus;
use yastq::database::Repository;
use yastq::media::RepositoryMediaState;
use yastq::providers::{MockBackend, MockBehavior};
use yastq::requests::{RequestManager, RequestParams};
use yastq::scheduler::{PoolOptions, WorkerPool};

use crate::common::{self, create_test_subtitle, Harness};

fn options() -> PoolOptions {
    PoolOptions {
        active_poll_interval: Duration::from_millis(10),
        idle_poll_interval: Duration::from_millis(20),
        shutdown_timeout: Duration::from_millis(100),
        max_claim_attempts: 3,
    }
}

fn start_pool(h: &Harness, options: PoolOptions) -> (Arc<WorkerPool>, tokio::task::JoinHandle<yastq::scheduler::PoolReport>) {
    let pool = Arc::new(WorkerPool::new(h.repo.clone(), h.settings(), h.job(), options));
    let runner = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.run().await.unwrap() })
    };
    (pool, runner)
}

fn manager(h: &Harness, pool: &WorkerPool) -> RequestManager {
    RequestManager::new(
        h.repo.clone(),
        h.settings(),
        h.cancellations.clone(),
        Arc::new(RepositoryMediaState::new(h.repo.clone(), h.settings())),
        h.progress.clone(),
        pool.waker(),
    )
}

async fn status_of(repo: &Repository, id: i64) -> Option<RequestStatus> {
    repo.get_request(id).await.unwrap().map(|r| r.status)
}

async fn wait_for_status(repo: &Repository, id: i64, status: RequestStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while status_of(repo, id).await != Some(status) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("request {} never reached {}", id, status));
}

/// Test that queued files are all translated with more workers than slots
#[tokio::test]
async fn test_pool_severalRequests_shouldCompleteAllThroughOneSlot() {
    let h = Harness::new(MockBackend::working());
    h.set(keys::MAX_WORKERS, "3");
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(h.enqueue_file(4).await.unwrap());
    }

    let (pool, runner) = start_pool(&h, options());
    for id in &ids {
        wait_for_status(&h.repo, *id, RequestStatus::Completed).await;
    }
    pool.shutdown();
    let report = runner.await.unwrap();

    assert_eq!(report.completed, 3);
    for i in 0..3 {
        assert!(h.dir.path().join(format!("clip{}.fr.srt", i)).exists());
    }
    assert_eq!(h.limiter.available(), 1);
    assert!(h.cancellations.is_empty());
}

/// Test that a new request wakes an idle pool without waiting for the poll
#[tokio::test]
async fn test_pool_requestCreatedThroughManager_shouldStartImmediately() {
    let h = Harness::new(MockBackend::working());
    let idle = PoolOptions {
        idle_poll_interval: Duration::from_secs(60),
        ..options()
    };
    let (pool, runner) = start_pool(&h, idle);
    let requests = manager(&h, &pool);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let path = create_test_subtitle(h.dir.path(), "talk.en.srt", 2).unwrap();
    let outcome = requests
        .create_request(RequestParams {
            title: "Talk".to_string(),
            source_language: "en".to_string(),
            target_language: "fr".to_string(),
            subtitle_path: Some(path.to_string_lossy().into_owned()),
            ..RequestParams::default()
        })
        .await
        .unwrap();

    wait_for_status(&h.repo, outcome.id(), RequestStatus::Completed).await;
    assert!(h.dir.path().join("talk.fr.srt").exists());

    pool.shutdown();
    runner.await.unwrap();
}

/// Test cancelling a running request through the manager
#[tokio::test]
async fn test_pool_cancelRunningRequest_shouldFinishCancelled() {
    let h = Harness::new(MockBackend::new(MockBehavior::Slow { delay_ms: 5_000 }));
    let id = h.enqueue_file(3).await.unwrap();
    let (pool, runner) = start_pool(&h, options());
    let requests = manager(&h, &pool);

    common::wait_for(|| h.backend.call_count() == 1).await;
    assert!(requests.cancel_request(id).await.unwrap());
    wait_for_status(&h.repo, id, RequestStatus::Cancelled).await;

    pool.shutdown();
    let report = runner.await.unwrap();
    assert_eq!(report.cancelled, 1);
    assert_eq!(report.abandoned, 0);
    assert!(h.progress.statuses.lock().contains(&(id, RequestStatus::Cancelled)));
}

/// Test that shutdown hands a job stuck in a backend call back to the queue
#[tokio::test]
async fn test_pool_shutdownDuringSlowJob_shouldRequeueRequest() {
    let h = Harness::new(MockBackend::new(MockBehavior::Slow { delay_ms: 5_000 }));
    let id = h.enqueue_file(2).await.unwrap();
    let (pool, runner) = start_pool(&h, options());

    common::wait_for(|| h.backend.call_count() == 1).await;
    pool.shutdown();
    let report = runner.await.unwrap();

    assert_eq!(report.abandoned, 1);
    let request = h.repo.get_request(id).await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Pending);
    assert_eq!(request.job_id, None);
    assert_eq!(h.limiter.available(), 1);
    assert!(h.cancellations.is_empty());
}

/// Test that a restarted pool recovers what the previous run left behind
#[tokio::test]
async fn test_pool_restartAfterCrash_shouldRecoverAndTranslate() {
    let h = Harness::new(MockBackend::working());
    let id = h.enqueue_file(2).await.unwrap();
    h.repo.claim_next("job-from-crashed-run", 1).await.unwrap();

    let (pool, runner) = start_pool(&h, options());
    wait_for_status(&h.repo, id, RequestStatus::Completed).await;
    pool.shutdown();
    let report = runner.await.unwrap();

    assert_eq!(report.recovered, 1);
    assert_eq!(report.completed, 1);
}
