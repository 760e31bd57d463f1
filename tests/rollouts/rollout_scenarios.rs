use rollouts::rollouts::client::{Operation, ResourceClient};
use rollouts::rollouts::controller::error::ErrorKind;
use rollouts::rollouts::controller::registry::InformerRegistry;
use rollouts::rollouts::controller::scale::{scale_workload, ScaleOutcome};
use rollouts::rollouts::controller::statefulrollout::{StatefulSetRollout, CONDITION_INVALID_SPEC};
use rollouts::rollouts::k8s::rollout::{Rollout, RolloutPhase};
use rollouts::rollouts::k8s::statefulset::StatefulSet;
use rollouts::rollouts::test_support::{rollout, statefulset_with_labels, MemoryCluster};
use std::sync::Arc;
use std::time::Duration;

struct RolloutHarness {
    cluster: MemoryCluster,
    registry: Arc<InformerRegistry>,
    machine: StatefulSetRollout,
}

impl RolloutHarness {
    fn new() -> Self {
        let cluster = MemoryCluster::new();
        let clients = cluster.clients();
        let registry = InformerRegistry::new(&clients, Some("prod"), Duration::from_secs(1));
        let machine = StatefulSetRollout::new(&clients, &registry);
        Self {
            cluster,
            registry,
            machine,
        }
    }

    async fn refresh(&self) {
        self.registry.statefulsets().resync().await.expect("statefulsets");
        self.registry.revisions().resync().await.expect("revisions");
    }

    fn rollout(&self, name: &str) -> Rollout {
        self.cluster.rollouts.peek("prod", name).expect("rollout")
    }

    fn workload(&self, name: &str, replicas: i32) {
        let mut set = statefulset_with_labels("prod", name, &[("app", name)]);
        set.spec.replicas = Some(replicas);
        self.cluster.statefulsets.create(&set).expect("workload");
    }
}

#[test]
fn scaling_twice_to_the_same_target_writes_once() {
    let harness = RolloutHarness::new();
    harness.workload("db", 1);
    let client: &dyn ResourceClient<StatefulSet> = harness.cluster.statefulsets.as_ref();

    assert_eq!(
        scale_workload(client, "prod", "db", 4).expect("first"),
        ScaleOutcome::Scaled { from: 1, to: 4 }
    );
    assert_eq!(
        scale_workload(client, "prod", "db", 4).expect("second"),
        ScaleOutcome::Unchanged { replicas: 4 }
    );
    assert_eq!(harness.cluster.statefulsets.calls(Operation::Update), 1);
}

#[test]
fn negative_target_clamps_to_zero() {
    let harness = RolloutHarness::new();
    harness.workload("db", 3);
    let client: &dyn ResourceClient<StatefulSet> = harness.cluster.statefulsets.as_ref();

    scale_workload(client, "prod", "db", -1).expect("clamp");
    assert_eq!(harness.cluster.statefulsets.calls(Operation::Update), 1);
    let stored = harness.cluster.statefulsets.peek("prod", "db").expect("db");
    assert_eq!(stored.spec.replicas, Some(0));

    scale_workload(client, "prod", "db", 0).expect("noop");
    assert_eq!(harness.cluster.statefulsets.calls(Operation::Update), 1);
}

#[tokio::test]
async fn reconcile_before_cache_catches_up_creates_once() {
    let harness = RolloutHarness::new();
    let web = harness.cluster.rollouts.create(&rollout("prod", "web")).expect("seed");
    harness.refresh().await;

    harness.machine.reconcile(&web).expect("first pass");
    // The cache has not seen the new StatefulSet; the live check must.
    let web = harness.rollout("web");
    harness.machine.reconcile(&web).expect("second pass");

    assert_eq!(harness.cluster.statefulsets.calls(Operation::Create), 1);
    assert_eq!(harness.cluster.statefulsets.len(), 1);
    assert_eq!(harness.rollout("web").phase(), Some(RolloutPhase::Progressing));
}

#[tokio::test]
async fn orphan_matching_workload_is_adopted_instead_of_recreated() {
    let harness = RolloutHarness::new();
    harness.workload("legacy", 3);
    let mut web = rollout("prod", "web");
    web.spec.selector = Some(
        rollouts::rollouts::k8s::selector::LabelSelector::from_labels([("app", "legacy")]),
    );
    web.spec.template.metadata.labels =
        [("app".to_string(), "legacy".to_string())].into_iter().collect();
    let web = harness.cluster.rollouts.create(&web).expect("seed");
    harness.refresh().await;
    harness.cluster.statefulsets.reset_calls();

    harness.machine.reconcile(&web).expect("reconcile");

    assert_eq!(harness.cluster.statefulsets.calls(Operation::Create), 0);
    let legacy = harness.cluster.statefulsets.peek("prod", "legacy").expect("legacy");
    assert!(legacy
        .metadata
        .is_controlled_by(web.metadata.uid.as_deref().unwrap_or_default()));
    let status = harness.rollout("web").status();
    assert_eq!(status.stateful_set_status.name, "legacy");
    assert_eq!(status.phase, Some(RolloutPhase::Progressing));
}

#[tokio::test]
async fn template_change_records_a_new_revision() {
    let harness = RolloutHarness::new();
    let web = harness.cluster.rollouts.create(&rollout("prod", "web")).expect("seed");
    harness.refresh().await;
    harness.machine.reconcile(&web).expect("first pass");
    let first_hash = harness.rollout("web").status().current_pod_hash;

    let mut web = harness.rollout("web");
    web.spec.template.spec.containers[0].image = Some("registry.example/app:2.0".into());
    let web = harness.cluster.rollouts.update(&web).expect("new template");
    harness.refresh().await;
    harness.machine.reconcile(&web).expect("second pass");

    let second_hash = harness.rollout("web").status().current_pod_hash;
    assert_ne!(first_hash, second_hash);
    assert_eq!(harness.cluster.revisions.len(), 2);
}

#[tokio::test]
async fn selector_missing_template_labels_never_creates_a_workload() {
    let harness = RolloutHarness::new();
    let mut web = rollout("prod", "web");
    web.spec.template.metadata.labels =
        [("app".to_string(), "other".to_string())].into_iter().collect();
    harness.cluster.rollouts.create(&web).expect("seed");
    harness.refresh().await;

    for pass in ["first pass", "second pass"] {
        let current = harness.rollout("web");
        let err = harness.machine.reconcile(&current).expect_err(pass);
        assert_eq!(err.kind(), ErrorKind::InvalidSpec);
        harness.refresh().await;
    }

    let status = harness.rollout("web").status();
    assert_eq!(status.phase, Some(RolloutPhase::Degraded));
    let condition = status.condition(CONDITION_INVALID_SPEC).expect("condition");
    assert_eq!(condition.status, "True");
    assert_eq!(harness.cluster.statefulsets.calls(Operation::Create), 0);
    assert!(harness.cluster.statefulsets.is_empty());
}
