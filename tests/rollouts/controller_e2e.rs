use rollouts::rollouts::client::ResourceClient;
use rollouts::rollouts::config::ControllerSettings;
use rollouts::rollouts::controller::manager::RolloutController;
use rollouts::rollouts::k8s::meta::Resource;
use rollouts::rollouts::k8s::rollout::RolloutPhase;
use rollouts::rollouts::k8s::statefulset::StatefulSetStatus;
use rollouts::rollouts::test_support::{rollout, MemoryCluster};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn settings() -> ControllerSettings {
    ControllerSettings {
        rollout_threads: 2,
        ingress_threads: 1,
        queue_base_delay: Duration::from_millis(1),
        queue_max_delay: Duration::from_millis(50),
        ..ControllerSettings::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn controller_creates_workload_and_tracks_readiness() {
    let cluster = MemoryCluster::new();
    let clients = cluster.clients();
    let controller = RolloutController::new(&clients, settings()).expect("controller");

    let web = cluster.rollouts.create(&rollout("prod", "web")).expect("rollout");
    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { controller.run(shutdown).await }
    });

    eventually("workload creation", || {
        cluster.statefulsets.peek("prod", "web").is_some()
            && cluster
                .rollouts
                .peek("prod", "web")
                .is_some_and(|r| r.status().stateful_set_status.name == "web")
    })
    .await;

    let workload = cluster.statefulsets.peek("prod", "web").expect("workload");
    assert!(workload
        .metadata
        .is_controlled_by(web.uid().unwrap_or_default()));
    assert_eq!(
        cluster.rollouts.peek("prod", "web").and_then(|r| r.phase()),
        Some(RolloutPhase::Progressing)
    );

    let mut ready = workload.clone();
    ready.status = Some(StatefulSetStatus {
        replicas: 3,
        ready_replicas: Some(3),
        ..Default::default()
    });
    cluster.statefulsets.update(&ready).expect("mark ready");

    eventually("healthy phase", || {
        cluster.rollouts.peek("prod", "web").and_then(|r| r.phase()) == Some(RolloutPhase::Healthy)
    })
    .await;
    assert_eq!(cluster.statefulsets.len(), 1);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("controller stops")
        .expect("controller task");
}

#[tokio::test]
async fn controller_stops_before_sync_when_cancelled() {
    let cluster = MemoryCluster::new();
    let clients = cluster.clients();
    let controller = RolloutController::new(&clients, settings()).expect("controller");

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), controller.run(shutdown))
        .await
        .expect("returns promptly");
    assert!(controller.rollout_queue().shutting_down());
}
