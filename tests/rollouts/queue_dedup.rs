use rollouts::rollouts::controller::error::ControllerError;
use rollouts::rollouts::controller::worker::run_workers;
use rollouts::rollouts::controller::workqueue::WorkQueue;
use rollouts::rollouts::k8s::meta::ObjectKey;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn repeated_adds_before_dequeue_reconcile_once() {
    let queue = WorkQueue::new("dedup-scenario");
    let key = ObjectKey::new(Some("prod"), "web");
    for _ in 0..25 {
        queue.add(key.clone());
    }
    assert_eq!(queue.len(), 1);

    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = Arc::clone(&calls);
        Arc::new(move |_: &ObjectKey| -> Result<(), ControllerError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    };

    let shutdown = CancellationToken::new();
    let workers = tokio::spawn(run_workers(
        "dedup-scenario",
        queue.clone(),
        4,
        handler,
        shutdown.clone(),
    ));

    tokio::time::timeout(Duration::from_secs(5), async {
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("reconciled");
    tokio::time::sleep(Duration::from_millis(50)).await;

    shutdown.cancel();
    workers.await.expect("workers");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn failed_reconcile_is_retried_with_backoff() {
    let queue = WorkQueue::with_rate_limits(
        "retry-scenario",
        Duration::from_millis(1),
        Duration::from_millis(20),
    );
    let key = ObjectKey::new(Some("prod"), "flaky");
    queue.add(key.clone());

    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = Arc::clone(&calls);
        Arc::new(move |_: &ObjectKey| -> Result<(), ControllerError> {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ControllerError::InvalidSpec("not yet".into()))
            } else {
                Ok(())
            }
        })
    };

    let shutdown = CancellationToken::new();
    let workers = tokio::spawn(run_workers(
        "retry-scenario",
        queue.clone(),
        1,
        handler,
        shutdown.clone(),
    ));

    tokio::time::timeout(Duration::from_secs(5), async {
        while calls.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("retried until success");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(queue.num_requeues(&key), 0);

    shutdown.cancel();
    workers.await.expect("workers");
}
