use rollouts::rollouts::client::{MemoryClient, Operation, ResourceClient};
use rollouts::rollouts::controller::claim::{claim_statefulsets, recheck_owner};
use rollouts::rollouts::controller::error::ErrorKind;
use rollouts::rollouts::k8s::meta::{OwnerReference, Resource};
use rollouts::rollouts::k8s::rollout::Rollout;
use rollouts::rollouts::k8s::selector::LabelSelector;
use rollouts::rollouts::k8s::statefulset::StatefulSet;
use rollouts::rollouts::test_support::{rollout, statefulset_with_labels};
use std::sync::Arc;

struct ClaimHarness {
    rollouts: MemoryClient<Rollout>,
    statefulsets: MemoryClient<StatefulSet>,
    owner: Rollout,
}

impl ClaimHarness {
    fn new() -> Self {
        let rollouts = MemoryClient::new();
        let mut foo = rollout("prod", "foo");
        foo.spec.selector = Some(LabelSelector::from_labels([("app", "foo")]));
        let owner = rollouts.create(&foo).expect("owner");
        Self {
            rollouts,
            statefulsets: MemoryClient::new(),
            owner,
        }
    }

    fn seed(&self, name: &str, app: &str, owned: bool) -> Arc<StatefulSet> {
        let mut set = statefulset_with_labels("prod", name, &[("app", app)]);
        if owned {
            set.metadata
                .owner_references
                .push(OwnerReference::controller_for(&self.owner));
        }
        Arc::new(self.statefulsets.create(&set).expect("seed"))
    }

    fn owner_uid(&self) -> String {
        self.owner.uid().unwrap_or_default().to_string()
    }
}

#[test]
fn claim_keeps_matching_releases_stale_and_adopts_orphans() {
    let harness = ClaimHarness::new();
    let a = harness.seed("a", "foo", true);
    let b = harness.seed("b", "bar", true);
    let c = harness.seed("c", "foo", false);
    harness.statefulsets.reset_calls();

    let selector = LabelSelector::from_labels([("app", "foo")]);
    let claimed = claim_statefulsets(
        &harness.owner,
        &selector,
        &[a, b, c],
        &harness.statefulsets,
        recheck_owner(&harness.rollouts, &harness.owner),
    )
    .expect("valid selector")
    .into_result()
    .expect("no errors");

    let mut names: Vec<&str> = claimed.iter().map(|set| set.name()).collect();
    names.sort();
    assert_eq!(names, vec!["a", "c"]);
    assert_eq!(harness.statefulsets.calls(Operation::Update), 2);

    let uid = harness.owner_uid();
    let released = harness.statefulsets.peek("prod", "b").expect("b");
    assert!(released.metadata.controller_ref().is_none());
    let adopted = harness.statefulsets.peek("prod", "c").expect("c");
    assert!(adopted.metadata.is_controlled_by(&uid));
    let kept = harness.statefulsets.peek("prod", "a").expect("a");
    assert!(kept.metadata.is_controlled_by(&uid));
}

#[test]
fn recreated_owner_blocks_adoption() {
    let harness = ClaimHarness::new();
    let orphan = harness.seed("orphan", "foo", false);

    // Same name, new identity: the owner was deleted and created again.
    harness.rollouts.delete("prod", "foo").expect("delete owner");
    let mut again = rollout("prod", "foo");
    again.spec.selector = Some(LabelSelector::from_labels([("app", "foo")]));
    harness.rollouts.create(&again).expect("recreate owner");
    harness.statefulsets.reset_calls();

    let selector = LabelSelector::from_labels([("app", "foo")]);
    let outcome = claim_statefulsets(
        &harness.owner,
        &selector,
        &[orphan],
        &harness.statefulsets,
        recheck_owner(&harness.rollouts, &harness.owner),
    )
    .expect("valid selector");

    assert!(outcome.claimed.is_empty());
    assert_eq!(harness.statefulsets.calls(Operation::Update), 0);
    let err = outcome.into_result().expect_err("stale owner");
    assert_eq!(err.kind(), ErrorKind::StaleOwner);
    let orphan = harness.statefulsets.peek("prod", "orphan").expect("orphan");
    assert!(orphan.metadata.owner_references.is_empty());
}

#[test]
fn deleting_owner_blocks_adoption() {
    let harness = ClaimHarness::new();
    let orphan = harness.seed("orphan", "foo", false);

    let mut deleting = harness.rollouts.get("prod", "foo").expect("owner");
    deleting.metadata.deletion_timestamp = Some(chrono::Utc::now());
    harness.rollouts.update(&deleting).expect("mark deleting");
    harness.statefulsets.reset_calls();

    let selector = LabelSelector::from_labels([("app", "foo")]);
    let outcome = claim_statefulsets(
        &harness.owner,
        &selector,
        &[orphan],
        &harness.statefulsets,
        recheck_owner(&harness.rollouts, &harness.owner),
    )
    .expect("valid selector");

    assert_eq!(harness.statefulsets.calls(Operation::Update), 0);
    assert_eq!(
        outcome.into_result().expect_err("deleting").kind(),
        ErrorKind::StaleOwner
    );
}
