use rollouts::rollouts::client::{MemoryClient, ResourceClient};
use rollouts::rollouts::controller::informer::Informer;
use rollouts::rollouts::controller::ingress::{rollout_ingress_keys, ROLLOUT_INGRESS_INDEX};
use rollouts::rollouts::k8s::meta::Resource;
use rollouts::rollouts::k8s::rollout::Rollout;
use rollouts::rollouts::test_support::rollout_with_ingress;

fn names(rollouts: &[std::sync::Arc<Rollout>]) -> Vec<String> {
    rollouts.iter().map(|r| r.name().to_string()).collect()
}

#[tokio::test]
async fn lookup_follows_the_referenced_ingress() {
    let client = MemoryClient::<Rollout>::shared();
    let informer = Informer::<Rollout>::new(client.clone(), Some("ns"));
    informer
        .add_indexer(ROLLOUT_INGRESS_INDEX, rollout_ingress_keys)
        .expect("indexer");

    client
        .create(&rollout_with_ingress("ns", "web", "ingressA"))
        .expect("seed");
    informer.resync().await.expect("list");

    let found = informer
        .by_index(ROLLOUT_INGRESS_INDEX, "ns/ingressA")
        .expect("lookup");
    assert_eq!(names(&found), vec!["web"]);

    let mut web = client.peek("ns", "web").expect("stored");
    if let Some(nginx) = web
        .spec
        .strategy
        .canary
        .as_mut()
        .and_then(|canary| canary.traffic_routing.as_mut())
        .and_then(|routing| routing.nginx.as_mut())
    {
        nginx.stable_ingress = "ingressB".to_string();
    }
    client.update(&web).expect("retarget");
    informer.resync().await.expect("relist");

    assert!(informer
        .by_index(ROLLOUT_INGRESS_INDEX, "ns/ingressA")
        .expect("lookup")
        .is_empty());
    let found = informer
        .by_index(ROLLOUT_INGRESS_INDEX, "ns/ingressB")
        .expect("lookup");
    assert_eq!(names(&found), vec!["web"]);
}

#[tokio::test]
async fn indexer_added_after_sync_covers_cached_rollouts() {
    let client = MemoryClient::<Rollout>::shared();
    let informer = Informer::<Rollout>::new(client.clone(), None);
    client
        .create(&rollout_with_ingress("ns", "web", "front"))
        .expect("web");
    client
        .create(&rollout_with_ingress("other", "api", "front"))
        .expect("api");
    informer.resync().await.expect("list");

    informer
        .add_indexer(ROLLOUT_INGRESS_INDEX, rollout_ingress_keys)
        .expect("indexer");
    let found = informer
        .by_index(ROLLOUT_INGRESS_INDEX, "ns/front")
        .expect("lookup");
    assert_eq!(names(&found), vec!["web"]);
    let canary = informer
        .by_index(ROLLOUT_INGRESS_INDEX, "other/api-front-canary")
        .expect("lookup");
    assert_eq!(names(&canary), vec!["api"]);
}
