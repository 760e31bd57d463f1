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

//! Wiring for the rollout controllers: informer events feed the work queues,
//! worker pools drain them.

use crate::rollouts::config::ControllerSettings;
use crate::rollouts::controller::error::ControllerError;
use crate::rollouts::controller::index::IndexError;
use crate::rollouts::controller::informer::{Informer, InformerEvent, InformerSubscription};
use crate::rollouts::controller::ingress::{
    rollout_ingress_keys, IngressController, ROLLOUT_INGRESS_INDEX,
};
use crate::rollouts::controller::registry::{ClusterClients, InformerRegistry};
use crate::rollouts::controller::statefulrollout::StatefulSetRollout;
use crate::rollouts::controller::worker::{join_logged, run_workers, SyncHandler};
use crate::rollouts::controller::workqueue::WorkQueue;
use crate::rollouts::k8s::ingress::Ingress;
use crate::rollouts::k8s::meta::{ObjectKey, Resource};
use crate::rollouts::k8s::rollout::Rollout;
use crate::rollouts::logger::{log_debug, log_info, log_warn, set_log_format};
use crate::rollouts::observability::{metrics, tracing};
use std::error::Error;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "rollout-controller";
const ROLLOUT_QUEUE: &str = "rollouts";
const INGRESS_QUEUE: &str = "ingresses";
const ROLLOUT_WORKERS: &str = "rollout-workers";
const INGRESS_WORKERS: &str = "ingress-workers";

/// Looks the Rollout up in the cache and runs the state machine on it.
pub struct RolloutSync {
    rollouts: Arc<Informer<Rollout>>,
    statefulset_rollout: StatefulSetRollout,
}

impl RolloutSync {
    pub fn new(registry: &InformerRegistry, clients: &ClusterClients) -> Self {
        Self {
            rollouts: Arc::clone(registry.rollouts()),
            statefulset_rollout: StatefulSetRollout::new(clients, registry),
        }
    }
}

impl SyncHandler<ObjectKey> for RolloutSync {
    fn sync(&self, key: &ObjectKey) -> Result<(), ControllerError> {
        match self.rollouts.get_by_key(key) {
            Some(rollout) => self.statefulset_rollout.reconcile(&rollout),
            None => {
                let key_text = key.to_string();
                log_debug(
                    COMPONENT,
                    "Rollout no longer exists",
                    &[("rollout", key_text.as_str())],
                );
                Ok(())
            }
        }
    }
}

pub struct RolloutController {
    registry: Arc<InformerRegistry>,
    settings: ControllerSettings,
    rollout_queue: WorkQueue<ObjectKey>,
    ingress_queue: WorkQueue<ObjectKey>,
    rollout_sync: Arc<RolloutSync>,
    ingress_sync: Arc<IngressController>,
}

impl RolloutController {
    pub fn new(clients: &ClusterClients, settings: ControllerSettings) -> Result<Self, IndexError> {
        let registry = InformerRegistry::from_settings(clients, &settings);
        registry
            .rollouts()
            .add_indexer(ROLLOUT_INGRESS_INDEX, rollout_ingress_keys)?;

        let rollout_queue = WorkQueue::with_rate_limits(
            ROLLOUT_QUEUE,
            settings.queue_base_delay,
            settings.queue_max_delay,
        );
        let ingress_queue = WorkQueue::with_rate_limits(
            INGRESS_QUEUE,
            settings.queue_base_delay,
            settings.queue_max_delay,
        );
        let rollout_sync = Arc::new(RolloutSync::new(&registry, clients));
        let ingress_sync = Arc::new(IngressController::new(&registry, rollout_queue.clone()));

        Ok(Self {
            registry,
            settings,
            rollout_queue,
            ingress_queue,
            rollout_sync,
            ingress_sync,
        })
    }

    /// Builds the controller from `ROLLOUTS_*` environment settings.
    pub fn from_env(clients: &ClusterClients) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let settings = ControllerSettings::from_env()?;
        Ok(Self::new(clients, settings)?)
    }

    pub fn rollout_queue(&self) -> &WorkQueue<ObjectKey> {
        &self.rollout_queue
    }

    /// Runs until `shutdown` is cancelled. Items being reconciled when the
    /// token fires are finished before this returns.
    pub async fn run(&self, shutdown: CancellationToken) {
        set_log_format(self.settings.log_format);
        tracing::init();
        log_info(COMPONENT, "Starting rollout controller", &[]);

        let mut tasks = vec![
            spawn_pump(self.registry.rollouts().subscribe(), shutdown.clone(), {
                let queue = self.rollout_queue.clone();
                move |event| enqueue_rollout(&queue, event)
            }),
            spawn_pump(self.registry.statefulsets().subscribe(), shutdown.clone(), {
                let queue = self.rollout_queue.clone();
                move |event| enqueue_owner(&queue, event)
            }),
            spawn_pump(self.registry.revisions().subscribe(), shutdown.clone(), {
                let queue = self.rollout_queue.clone();
                move |event| enqueue_owner(&queue, event)
            }),
            spawn_pump(self.registry.ingresses().subscribe(), shutdown.clone(), {
                let queue = self.ingress_queue.clone();
                move |event: InformerEvent<Ingress>| {
                    enqueue_object(&queue, event.object().as_ref())
                }
            }),
        ];
        tasks.extend(self.registry.start(&shutdown));

        if self.registry.wait_for_sync(&shutdown).await {
            log_info(COMPONENT, "Caches synced, starting workers", &[]);
            tokio::join!(
                run_workers(
                    ROLLOUT_WORKERS,
                    self.rollout_queue.clone(),
                    self.settings.rollout_threads,
                    Arc::clone(&self.rollout_sync),
                    shutdown.clone(),
                ),
                run_workers(
                    INGRESS_WORKERS,
                    self.ingress_queue.clone(),
                    self.settings.ingress_threads,
                    Arc::clone(&self.ingress_sync),
                    shutdown.clone(),
                ),
            );
        } else {
            log_warn(COMPONENT, "Shutdown requested before caches synced", &[]);
        }

        self.rollout_queue.shut_down_with_drain().await;
        self.ingress_queue.shut_down_with_drain().await;
        for task in tasks {
            join_logged(COMPONENT, task).await;
        }
        log_info(COMPONENT, "Rollout controller stopped", &[]);
    }
}

fn spawn_pump<K, F>(
    mut events: InformerSubscription<K>,
    shutdown: CancellationToken,
    mut handle: F,
) -> JoinHandle<()>
where
    K: Resource,
    F: FnMut(InformerEvent<K>) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            handle(event);
        }
    })
}

fn enqueue_object<K: Resource>(queue: &WorkQueue<ObjectKey>, object: &K) {
    if let Some(key) = object.object_key() {
        queue.add(key);
    }
}

fn enqueue_rollout(queue: &WorkQueue<ObjectKey>, event: InformerEvent<Rollout>) {
    if let InformerEvent::Deleted(rollout) = &event {
        metrics::clear_rollout_phase(&rollout.namespace(), rollout.name());
    }
    enqueue_object(queue, event.object().as_ref());
}

/// Key of the Rollout controlling `object`, if any.
pub fn owning_rollout<K: Resource>(object: &K) -> Option<ObjectKey> {
    let reference = object.metadata().controller_ref()?;
    if reference.kind != Rollout::KIND {
        return None;
    }
    Some(ObjectKey::new(
        object.metadata().namespace.as_deref(),
        &reference.name,
    ))
}

fn enqueue_owner<K: Resource>(queue: &WorkQueue<ObjectKey>, event: InformerEvent<K>) {
    if let InformerEvent::Updated { old, new } = &event {
        if let Some(previous) = owning_rollout(old.as_ref()) {
            if owning_rollout(new.as_ref()).as_ref() != Some(&previous) {
                queue.add(previous);
            }
        }
    }
    if let Some(key) = owning_rollout(event.object().as_ref()) {
        queue.add(key);
    }
}
