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

use crate::rollouts::client::ResourceClient;
use crate::rollouts::controller::error::ControllerError;
use crate::rollouts::k8s::deployment::Deployment;
use crate::rollouts::k8s::meta::Resource;
use crate::rollouts::k8s::rollout::Rollout;
use crate::rollouts::k8s::statefulset::StatefulSet;
use crate::rollouts::logger::{log_info, log_warn};

const COMPONENT: &str = "rollout-scale";

/// Workload kinds with a replica count.
pub trait Scalable: Resource {
    fn replicas(&self) -> i32;

    fn set_replicas(&mut self, replicas: i32);
}

impl Scalable for StatefulSet {
    fn replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(1)
    }

    fn set_replicas(&mut self, replicas: i32) {
        self.spec.replicas = Some(replicas);
    }
}

impl Scalable for Deployment {
    fn replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(1)
    }

    fn set_replicas(&mut self, replicas: i32) {
        self.spec.replicas = Some(replicas);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleOutcome {
    Unchanged { replicas: i32 },
    Scaled { from: i32, to: i32 },
}

/// Sets the replica count of `namespace/name` to `target`. Negative targets
/// mean zero; a workload already at the target is not written.
pub fn scale_workload<K: Scalable>(
    client: &dyn ResourceClient<K>,
    namespace: &str,
    name: &str,
    target: i32,
) -> Result<ScaleOutcome, ControllerError> {
    let mut workload = client.get(namespace, name).map_err(|err| {
        let error_text = err.to_string();
        log_warn(
            COMPONENT,
            "Failed to fetch workload",
            &[
                ("kind", K::KIND),
                ("namespace", namespace),
                ("name", name),
                ("error", error_text.as_str()),
            ],
        );
        ControllerError::api(format!("get {} {}/{}", K::KIND, namespace, name), err)
    })?;

    let desired = target.max(0);
    let current = workload.replicas();
    if desired == current {
        return Ok(ScaleOutcome::Unchanged { replicas: current });
    }

    let desired_text = desired.to_string();
    log_info(
        COMPONENT,
        "Scaling workload",
        &[
            ("kind", K::KIND),
            ("namespace", namespace),
            ("name", name),
            ("replicas", desired_text.as_str()),
        ],
    );
    workload.set_replicas(desired);
    client.update(&workload).map_err(|err| {
        let error_text = err.to_string();
        log_warn(
            COMPONENT,
            "Failed to update workload",
            &[
                ("kind", K::KIND),
                ("namespace", namespace),
                ("name", name),
                ("error", error_text.as_str()),
            ],
        );
        ControllerError::api(format!("update {} {}/{}", K::KIND, namespace, name), err)
    })?;
    Ok(ScaleOutcome::Scaled {
        from: current,
        to: desired,
    })
}

/// Workload a Rollout scales: its `workloadRef`, or the StatefulSet it manages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleTarget {
    StatefulSet(String),
    Deployment(String),
}

pub fn scale_target(rollout: &Rollout) -> Result<ScaleTarget, ControllerError> {
    if let Some(reference) = rollout.spec.workload_ref.as_ref() {
        if reference.name.is_empty() {
            return Err(ControllerError::InvalidSpec(
                "workloadRef.name must not be empty".to_string(),
            ));
        }
        return match reference.kind.as_str() {
            "StatefulSet" => Ok(ScaleTarget::StatefulSet(reference.name.clone())),
            "Deployment" => Ok(ScaleTarget::Deployment(reference.name.clone())),
            other => Err(ControllerError::InvalidSpec(format!(
                "workloadRef kind {:?} cannot be scaled",
                other
            ))),
        };
    }

    let managed = rollout
        .status
        .as_ref()
        .map(|status| status.stateful_set_status.name.clone())
        .unwrap_or_default();
    if managed.is_empty() {
        return Err(ControllerError::InvalidSpec(format!(
            "rollout {}/{} has no workload to scale",
            rollout.namespace(),
            rollout.name()
        )));
    }
    Ok(ScaleTarget::StatefulSet(managed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollouts::client::{MemoryClient, Operation};
    use crate::rollouts::k8s::deployment::DeploymentSpec;
    use crate::rollouts::k8s::meta::ObjectMeta;
    use crate::rollouts::k8s::rollout::WorkloadRef;
    use crate::rollouts::test_support::rollout;

    #[test]
    fn deployments_scale_like_statefulsets() {
        let client = MemoryClient::<Deployment>::new();
        let spec = DeploymentSpec {
            replicas: Some(2),
            ..Default::default()
        };
        client
            .create(&Deployment::new(ObjectMeta::named("prod", "api"), spec))
            .expect("seed");

        let outcome = scale_workload(&client, "prod", "api", 5).expect("scale");
        assert_eq!(outcome, ScaleOutcome::Scaled { from: 2, to: 5 });
        assert_eq!(client.peek("prod", "api").and_then(|d| d.spec.replicas), Some(5));
    }

    #[test]
    fn missing_workload_is_reported() {
        let client = MemoryClient::<StatefulSet>::new();
        let err = scale_workload(&client, "prod", "web", 1).expect_err("missing");
        assert!(err.api_error().is_some_and(|api| api.is_not_found()));
        assert_eq!(client.calls(Operation::Update), 0);
    }

    #[test]
    fn target_prefers_workload_ref() {
        let mut web = rollout("prod", "web");
        assert!(scale_target(&web).is_err());

        let mut status = web.status();
        status.stateful_set_status.name = "web".into();
        web.status = Some(status);
        assert_eq!(
            scale_target(&web).expect("managed"),
            ScaleTarget::StatefulSet("web".into())
        );

        web.spec.workload_ref = Some(WorkloadRef {
            api_version: None,
            kind: "Deployment".into(),
            name: "legacy".into(),
        });
        assert_eq!(
            scale_target(&web).expect("ref"),
            ScaleTarget::Deployment("legacy".into())
        );

        web.spec.workload_ref = Some(WorkloadRef {
            api_version: None,
            kind: "DaemonSet".into(),
            name: "x".into(),
        });
        assert!(scale_target(&web).is_err());
    }
}
