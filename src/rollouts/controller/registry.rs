/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::rollouts::client::SharedClient;
use crate::rollouts::config::ControllerSettings;
use crate::rollouts::controller::informer::Informer;
use crate::rollouts::k8s::controllerrevision::ControllerRevision;
use crate::rollouts::k8s::deployment::Deployment;
use crate::rollouts::k8s::ingress::Ingress;
use crate::rollouts::k8s::rollout::Rollout;
use crate::rollouts::k8s::statefulset::StatefulSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// API clients for every kind the rollout controllers touch.
#[derive(Clone)]
pub struct ClusterClients {
    pub rollouts: SharedClient<Rollout>,
    pub statefulsets: SharedClient<StatefulSet>,
    pub deployments: SharedClient<Deployment>,
    pub revisions: SharedClient<ControllerRevision>,
    pub ingresses: SharedClient<Ingress>,
}

/// Process-scoped set of informers, built once at startup and handed to
/// each controller explicitly.
pub struct InformerRegistry {
    rollouts: Arc<Informer<Rollout>>,
    statefulsets: Arc<Informer<StatefulSet>>,
    revisions: Arc<Informer<ControllerRevision>>,
    ingresses: Arc<Informer<Ingress>>,
}

impl InformerRegistry {
    pub fn new(clients: &ClusterClients, namespace: Option<&str>, backoff_max: Duration) -> Arc<Self> {
        Arc::new(Self {
            rollouts: Informer::with_backoff_max(clients.rollouts.clone(), namespace, backoff_max),
            statefulsets: Informer::with_backoff_max(
                clients.statefulsets.clone(),
                namespace,
                backoff_max,
            ),
            revisions: Informer::with_backoff_max(clients.revisions.clone(), namespace, backoff_max),
            ingresses: Informer::with_backoff_max(clients.ingresses.clone(), namespace, backoff_max),
        })
    }

    /// Informers scoped to the settings' namespace, reconnecting with its
    /// watch backoff ceiling.
    pub fn from_settings(clients: &ClusterClients, settings: &ControllerSettings) -> Arc<Self> {
        Self::new(
            clients,
            settings.namespace.as_deref(),
            settings.watch_backoff_max,
        )
    }

    pub fn rollouts(&self) -> &Arc<Informer<Rollout>> {
        &self.rollouts
    }

    pub fn statefulsets(&self) -> &Arc<Informer<StatefulSet>> {
        &self.statefulsets
    }

    pub fn revisions(&self) -> &Arc<Informer<ControllerRevision>> {
        &self.revisions
    }

    pub fn ingresses(&self) -> &Arc<Informer<Ingress>> {
        &self.ingresses
    }

    /// Spawns one list-and-watch loop per kind.
    pub fn start(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(&self.rollouts).run(shutdown.clone())),
            tokio::spawn(Arc::clone(&self.statefulsets).run(shutdown.clone())),
            tokio::spawn(Arc::clone(&self.revisions).run(shutdown.clone())),
            tokio::spawn(Arc::clone(&self.ingresses).run(shutdown.clone())),
        ]
    }

    /// Waits until every informer has listed once.
    pub async fn wait_for_sync(&self, shutdown: &CancellationToken) -> bool {
        self.rollouts.wait_for_sync(shutdown).await
            && self.statefulsets.wait_for_sync(shutdown).await
            && self.revisions.wait_for_sync(shutdown).await
            && self.ingresses.wait_for_sync(shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollouts::client::ResourceClient;
    use crate::rollouts::k8s::meta::Resource;
    use crate::rollouts::k8s::selector::Selector;
    use crate::rollouts::test_support::{rollout, MemoryCluster};

    #[tokio::test]
    async fn settings_namespace_scopes_every_informer() {
        let cluster = MemoryCluster::new();
        cluster.rollouts.create(&rollout("prod", "web")).expect("prod");
        cluster.rollouts.create(&rollout("staging", "web")).expect("staging");

        let settings = ControllerSettings {
            namespace: Some("prod".into()),
            ..ControllerSettings::default()
        };
        let registry = InformerRegistry::from_settings(&cluster.clients(), &settings);
        registry.rollouts().resync().await.expect("resync");

        let cached = registry.rollouts().list(None, &Selector::everything());
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].namespace(), "prod");
    }
}
