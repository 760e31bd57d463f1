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

//! Fixtures shared by unit and integration tests.

#![allow(dead_code)]

use crate::rollouts::client::MemoryClient;
use crate::rollouts::controller::registry::ClusterClients;
use crate::rollouts::k8s::controllerrevision::ControllerRevision;
use crate::rollouts::k8s::deployment::Deployment;
use crate::rollouts::k8s::ingress::{Ingress, IngressSpec};
use crate::rollouts::k8s::meta::ObjectMeta;
use crate::rollouts::k8s::pod::{ContainerSpec, PodSpec, PodTemplateSpec};
use crate::rollouts::k8s::rollout::{
    CanaryStrategy, NginxTrafficRouting, Rollout, RolloutSpec, RolloutStrategy, TrafficRouting,
};
use crate::rollouts::k8s::selector::LabelSelector;
use crate::rollouts::k8s::statefulset::{StatefulSet, StatefulSetSpec};
use serde_json::json;
use std::sync::Arc;

pub fn pod_template(labels: &[(&str, &str)]) -> PodTemplateSpec {
    let mut metadata = ObjectMeta::default();
    metadata.labels = labels
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    PodTemplateSpec {
        metadata,
        spec: PodSpec {
            containers: vec![ContainerSpec {
                name: "app".to_string(),
                image: Some("registry.example/app:1.0".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        },
    }
}

/// Three-replica Rollout selecting and labelling pods with `app=<name>`.
/// The UID is derived from the key so tests can build owner references
/// without a round trip through a client.
pub fn rollout(namespace: &str, name: &str) -> Rollout {
    let mut metadata = ObjectMeta::named(namespace, name);
    metadata.uid = Some(format!("uid-{}-{}", namespace, name));
    Rollout::new(
        metadata,
        RolloutSpec {
            replicas: Some(3),
            selector: Some(LabelSelector::from_labels([("app", name)])),
            template: pod_template(&[("app", name)]),
            ..Default::default()
        },
    )
}

/// Like [`rollout`], routing canary traffic through the nginx ingress `stable`.
pub fn rollout_with_ingress(namespace: &str, name: &str, stable: &str) -> Rollout {
    let mut rollout = rollout(namespace, name);
    rollout.spec.strategy = RolloutStrategy {
        canary: Some(CanaryStrategy {
            traffic_routing: Some(TrafficRouting {
                nginx: Some(NginxTrafficRouting {
                    stable_ingress: stable.to_string(),
                    additional_stable_ingresses: Vec::new(),
                }),
                alb: None,
            }),
        }),
    };
    rollout
}

pub fn statefulset_with_labels(namespace: &str, name: &str, labels: &[(&str, &str)]) -> StatefulSet {
    let mut metadata = ObjectMeta::named(namespace, name);
    metadata.labels = labels
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    StatefulSet::new(
        metadata,
        StatefulSetSpec {
            replicas: Some(1),
            selector: Some(LabelSelector::from_labels(labels.iter().copied())),
            template: pod_template(labels),
            ..Default::default()
        },
    )
}

pub fn controller_revision(
    namespace: &str,
    name: &str,
    labels: &[(&str, &str)],
    revision: i64,
) -> ControllerRevision {
    let mut metadata = ObjectMeta::named(namespace, name);
    metadata.labels = labels
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    ControllerRevision::new(metadata, json!({ "revision": revision }), revision)
}

pub fn ingress(namespace: &str, name: &str) -> Ingress {
    Ingress::new(
        ObjectMeta::named(namespace, name),
        IngressSpec {
            ingress_class_name: Some("nginx".to_string()),
            ..Default::default()
        },
    )
}

/// One in-memory API server per kind, with handles kept for assertions.
pub struct MemoryCluster {
    pub rollouts: Arc<MemoryClient<Rollout>>,
    pub statefulsets: Arc<MemoryClient<StatefulSet>>,
    pub deployments: Arc<MemoryClient<Deployment>>,
    pub revisions: Arc<MemoryClient<ControllerRevision>>,
    pub ingresses: Arc<MemoryClient<Ingress>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            rollouts: MemoryClient::shared(),
            statefulsets: MemoryClient::shared(),
            deployments: MemoryClient::shared(),
            revisions: MemoryClient::shared(),
            ingresses: MemoryClient::shared(),
        }
    }

    pub fn clients(&self) -> ClusterClients {
        ClusterClients {
            rollouts: self.rollouts.clone(),
            statefulsets: self.statefulsets.clone(),
            deployments: self.deployments.clone(),
            revisions: self.revisions.clone(),
            ingresses: self.ingresses.clone(),
        }
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}
