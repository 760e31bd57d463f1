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

//! Fan-out from Ingress changes to the Rollouts that reference them.

use crate::rollouts::controller::error::ControllerError;
use crate::rollouts::controller::informer::Informer;
use crate::rollouts::controller::registry::InformerRegistry;
use crate::rollouts::controller::worker::SyncHandler;
use crate::rollouts::controller::workqueue::WorkQueue;
use crate::rollouts::k8s::ingress::{canary_ingress_name, is_canary_ingress, Ingress};
use crate::rollouts::k8s::meta::{ObjectKey, Resource};
use crate::rollouts::k8s::rollout::Rollout;
use crate::rollouts::logger::{log_debug, log_error, log_warn};
use std::sync::Arc;

const COMPONENT: &str = "ingress-controller";

/// Rollout index keyed by every `ns/ingress` a Rollout routes traffic through.
pub const ROLLOUT_INGRESS_INDEX: &str = "byStatefulRolloutIngress";

/// Index keys for `rollout`: stable ingresses plus the canary ingresses the
/// controller derives from them.
pub fn rollout_ingress_keys(rollout: &Rollout) -> Vec<String> {
    let Some(routing) = rollout.spec.traffic_routing() else {
        return Vec::new();
    };
    let namespace = rollout.namespace();
    let mut names: Vec<String> = Vec::new();

    if let Some(nginx) = routing.nginx.as_ref() {
        let stable = std::iter::once(&nginx.stable_ingress)
            .chain(nginx.additional_stable_ingresses.iter())
            .filter(|name| !name.is_empty());
        for ingress in stable {
            names.push(ingress.clone());
            if let Some(canary) = canary_ingress_name(rollout.name(), ingress) {
                names.push(canary);
            }
        }
    }
    if let Some(alb) = routing.alb.as_ref() {
        names.extend(
            std::iter::once(&alb.ingress)
                .chain(alb.ingresses.iter())
                .filter(|name| !name.is_empty())
                .cloned(),
        );
    }

    let mut keys: Vec<String> = names
        .into_iter()
        .map(|name| format!("{}/{}", namespace, name))
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

/// Sync handler for the ingress queue: every Rollout referencing the ingress
/// is put back on the Rollout queue.
pub struct IngressController {
    ingresses: Arc<Informer<Ingress>>,
    rollouts: Arc<Informer<Rollout>>,
    rollout_queue: WorkQueue<ObjectKey>,
}

impl IngressController {
    pub fn new(registry: &InformerRegistry, rollout_queue: WorkQueue<ObjectKey>) -> Self {
        Self {
            ingresses: Arc::clone(registry.ingresses()),
            rollouts: Arc::clone(registry.rollouts()),
            rollout_queue,
        }
    }

    pub fn sync_ingress(&self, key: &ObjectKey) -> Result<(), ControllerError> {
        let key_text = key.to_string();
        let Some(ingress) = self.ingresses.get_by_key(key) else {
            if !is_canary_ingress(&key.name) {
                log_warn(
                    COMPONENT,
                    "Primary ingress has been deleted",
                    &[("ingress", key_text.as_str())],
                );
            }
            return Ok(());
        };

        let index_key = format!("{}/{}", ingress.namespace(), ingress.name());
        let rollouts = match self.rollouts.by_index(ROLLOUT_INGRESS_INDEX, &index_key) {
            Ok(rollouts) => rollouts,
            Err(err) => {
                let error_text = err.to_string();
                log_error(
                    COMPONENT,
                    "Failed to look up rollouts for ingress",
                    &[("ingress", key_text.as_str()), ("error", error_text.as_str())],
                );
                return Ok(());
            }
        };

        for rollout in rollouts {
            if let Some(rollout_key) = rollout.object_key() {
                let rollout_text = rollout_key.to_string();
                log_debug(
                    COMPONENT,
                    "Enqueueing rollout for ingress change",
                    &[("ingress", key_text.as_str()), ("rollout", rollout_text.as_str())],
                );
                self.rollout_queue.add(rollout_key);
            }
        }
        Ok(())
    }
}

impl SyncHandler<ObjectKey> for IngressController {
    fn sync(&self, key: &ObjectKey) -> Result<(), ControllerError> {
        self.sync_ingress(key)
    }
}
