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

//! Per-Rollout reconcile for StatefulSet-backed rollouts.
//!
//! Reads come from the informer caches. The only live reads are the
//! adoption recheck inside the claim manager and the existence check before
//! a workload is created, where the create call itself is the final guard
//! against duplicates.

use crate::rollouts::client::{ApiError, SharedClient};
use crate::rollouts::controller::claim::{
    claim_controller_revisions, claim_statefulsets, recheck_owner,
};
use crate::rollouts::controller::error::ControllerError;
use crate::rollouts::controller::informer::Informer;
use crate::rollouts::controller::registry::{ClusterClients, InformerRegistry};
use crate::rollouts::controller::revision::sync_revision;
use crate::rollouts::controller::scale::{
    scale_target, scale_workload, ScaleOutcome, ScaleTarget, Scalable,
};
use crate::rollouts::k8s::controllerrevision::ControllerRevision;
use crate::rollouts::k8s::deployment::Deployment;
use crate::rollouts::k8s::meta::{ObjectMeta, OwnerReference, Resource};
use crate::rollouts::k8s::rollout::{Rollout, RolloutPhase, RolloutStatus};
use crate::rollouts::k8s::selector::{LabelSelector, Selector};
use crate::rollouts::k8s::statefulset::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use crate::rollouts::logger::{log_debug, log_info, log_warn};
use crate::rollouts::observability::metrics;
use std::sync::Arc;

const COMPONENT: &str = "statefulset-rollout";

pub const CONDITION_INVALID_SPEC: &str = "InvalidSpec";
const REASON_INVALID_SELECTOR: &str = "InvalidSelector";

/// What `ensure_workload` found or did.
#[derive(Debug, Clone, PartialEq)]
pub enum EnsureOutcome {
    Found(StatefulSet),
    Created(StatefulSet),
    /// Create reported the name as taken. Treated as success.
    AlreadyExists(String),
}

impl EnsureOutcome {
    pub fn name(&self) -> &str {
        match self {
            EnsureOutcome::Found(workload) | EnsureOutcome::Created(workload) => workload.name(),
            EnsureOutcome::AlreadyExists(name) => name,
        }
    }

    pub fn created(&self) -> bool {
        matches!(self, EnsureOutcome::Created(_))
    }
}

pub struct StatefulSetRollout {
    rollouts: SharedClient<Rollout>,
    statefulsets: SharedClient<StatefulSet>,
    deployments: SharedClient<Deployment>,
    revisions: SharedClient<ControllerRevision>,
    statefulset_cache: Arc<Informer<StatefulSet>>,
    revision_cache: Arc<Informer<ControllerRevision>>,
}

impl StatefulSetRollout {
    pub fn new(clients: &ClusterClients, registry: &InformerRegistry) -> Self {
        Self {
            rollouts: clients.rollouts.clone(),
            statefulsets: clients.statefulsets.clone(),
            deployments: clients.deployments.clone(),
            revisions: clients.revisions.clone(),
            statefulset_cache: Arc::clone(registry.statefulsets()),
            revision_cache: Arc::clone(registry.revisions()),
        }
    }

    /// One level-triggered pass over `rollout`.
    pub fn reconcile(&self, rollout: &Rollout) -> Result<(), ControllerError> {
        let namespace = rollout.namespace();
        let mut status = rollout.status();

        if is_paused(rollout) {
            log_debug(
                COMPONENT,
                "Rollout is paused, skipping",
                &[("namespace", namespace.as_str()), ("rollout", rollout.name())],
            );
            status.phase = Some(RolloutPhase::Paused);
            return self.write_status(rollout, status);
        }

        let label_selector = match valid_selector(rollout) {
            Ok(selector) => selector,
            Err(err) => {
                status.set_condition(
                    CONDITION_INVALID_SPEC,
                    true,
                    REASON_INVALID_SELECTOR,
                    err.to_string(),
                );
                status.phase = Some(RolloutPhase::Degraded);
                self.write_status(rollout, status)?;
                return Err(err);
            }
        };
        status.remove_condition(CONDITION_INVALID_SPEC);

        let candidates = self
            .statefulset_cache
            .list(Some(&namespace), &Selector::everything());
        let claimed = claim_statefulsets(
            rollout,
            label_selector,
            &candidates,
            self.statefulsets.as_ref(),
            recheck_owner(self.rollouts.as_ref(), rollout),
        )?
        .into_result()?;

        if claimed.is_empty() {
            self.ensure_workload(rollout, &mut status)?;
        } else {
            let workload = pick_workload(rollout, &status, &claimed);
            if claimed.len() > 1 {
                let count = claimed.len().to_string();
                log_warn(
                    COMPONENT,
                    "Rollout owns more than one StatefulSet",
                    &[
                        ("namespace", namespace.as_str()),
                        ("rollout", rollout.name()),
                        ("count", count.as_str()),
                        ("using", workload.name()),
                    ],
                );
            }
            status.stateful_set_status.name = workload.name().to_string();
            status.phase = Some(if workload.ready_replicas() == workload.replicas() {
                RolloutPhase::Healthy
            } else {
                RolloutPhase::Progressing
            });
        }

        if let Err(err) = self.sync_revisions(rollout, label_selector, &mut status) {
            self.write_status(rollout, status)?;
            return Err(err);
        }

        status.observed_generation = rollout.metadata.generation;
        self.write_status(rollout, status)
    }

    /// Creates the Rollout's StatefulSet unless a live read finds it. A
    /// failed read counts as "absent"; a create that races with another
    /// writer counts as success.
    pub fn ensure_workload(
        &self,
        rollout: &Rollout,
        status: &mut RolloutStatus,
    ) -> Result<EnsureOutcome, ControllerError> {
        let namespace = rollout.namespace();
        let name = if status.stateful_set_status.name.is_empty() {
            rollout.name().to_string()
        } else {
            status.stateful_set_status.name.clone()
        };

        match self.statefulsets.get(&namespace, &name) {
            Ok(existing) => {
                status.stateful_set_status.name = name;
                if status.phase.is_none() {
                    status.phase = Some(RolloutPhase::Progressing);
                }
                return Ok(EnsureOutcome::Found(existing));
            }
            Err(ApiError::NotFound { .. }) => {}
            Err(err) => {
                let error_text = err.to_string();
                log_debug(
                    COMPONENT,
                    "Existence check failed, attempting create",
                    &[
                        ("namespace", namespace.as_str()),
                        ("statefulset", name.as_str()),
                        ("error", error_text.as_str()),
                    ],
                );
            }
        }

        let desired = desired_workload(rollout, &namespace, &name);
        let outcome = match self.statefulsets.create(&desired) {
            Ok(created) => {
                log_info(
                    COMPONENT,
                    "Created StatefulSet for rollout",
                    &[
                        ("namespace", namespace.as_str()),
                        ("rollout", rollout.name()),
                        ("statefulset", created.name()),
                    ],
                );
                EnsureOutcome::Created(created)
            }
            Err(err) if err.is_already_exists() || err.is_conflict() => {
                log_debug(
                    COMPONENT,
                    "StatefulSet already exists",
                    &[("namespace", namespace.as_str()), ("statefulset", name.as_str())],
                );
                EnsureOutcome::AlreadyExists(name.clone())
            }
            Err(err) => {
                return Err(ControllerError::api(
                    format!("create StatefulSet {}/{}", namespace, name),
                    err,
                ))
            }
        };

        status.stateful_set_status.name = outcome.name().to_string();
        status.phase = Some(RolloutPhase::Progressing);
        Ok(outcome)
    }

    /// Scales the Rollout's workload to `target`; negative targets mean zero.
    pub fn scale_to(&self, rollout: &Rollout, target: i32) -> Result<ScaleOutcome, ControllerError> {
        let namespace = rollout.namespace();
        match scale_target(rollout)? {
            ScaleTarget::StatefulSet(name) => {
                scale_workload(self.statefulsets.as_ref(), &namespace, &name, target)
            }
            ScaleTarget::Deployment(name) => {
                scale_workload(self.deployments.as_ref(), &namespace, &name, target)
            }
        }
    }

    /// Writes `status` back when it differs from what the Rollout carries.
    pub fn write_status(
        &self,
        rollout: &Rollout,
        status: RolloutStatus,
    ) -> Result<(), ControllerError> {
        let namespace = rollout.namespace();
        if let Some(phase) = status.phase {
            metrics::record_rollout_phase(&namespace, rollout.name(), phase);
        }
        if rollout.status.as_ref() == Some(&status) {
            return Ok(());
        }

        let mut updated = rollout.clone();
        updated.status = Some(status);
        self.rollouts.update(&updated).map_err(|err| {
            ControllerError::api(
                format!("update status of Rollout {}/{}", namespace, rollout.name()),
                err,
            )
        })?;
        Ok(())
    }

    fn sync_revisions(
        &self,
        rollout: &Rollout,
        label_selector: &LabelSelector,
        status: &mut RolloutStatus,
    ) -> Result<(), ControllerError> {
        let namespace = rollout.namespace();
        let candidates = self
            .revision_cache
            .list(Some(&namespace), &Selector::everything());
        let claimed = claim_controller_revisions(
            rollout,
            label_selector,
            &candidates,
            self.revisions.as_ref(),
            recheck_owner(self.rollouts.as_ref(), rollout),
        )?
        .into_result()?;
        let synced = sync_revision(rollout, &claimed, self.revisions.as_ref(), status)?;
        status.current_pod_hash = Some(synced.hash);
        Ok(())
    }
}

pub fn is_paused(rollout: &Rollout) -> bool {
    rollout.spec.paused
        || rollout
            .status
            .as_ref()
            .is_some_and(|status| !status.pause_conditions.is_empty())
}

fn valid_selector(rollout: &Rollout) -> Result<&LabelSelector, ControllerError> {
    let selector = rollout
        .spec
        .selector
        .as_ref()
        .filter(|selector| !selector.is_empty())
        .ok_or_else(|| {
            ControllerError::InvalidSpec(format!(
                "rollout {}/{} has an empty selector",
                rollout.namespace(),
                rollout.name()
            ))
        })?;
    let parsed = selector.to_selector().map_err(|err| {
        ControllerError::InvalidSpec(format!(
            "rollout {}/{} has invalid label selector: {}",
            rollout.namespace(),
            rollout.name(),
            err
        ))
    })?;
    // The created workload carries the template labels and must stay claimable.
    if !parsed.matches(&rollout.spec.template.metadata.labels) {
        return Err(ControllerError::InvalidSpec(format!(
            "rollout {}/{} selector `{}` does not match template labels",
            rollout.namespace(),
            rollout.name(),
            parsed
        )));
    }
    Ok(selector)
}

fn pick_workload<'a>(
    rollout: &Rollout,
    status: &RolloutStatus,
    claimed: &'a [StatefulSet],
) -> &'a StatefulSet {
    let preferred = if status.stateful_set_status.name.is_empty() {
        rollout.name()
    } else {
        status.stateful_set_status.name.as_str()
    };
    claimed
        .iter()
        .find(|workload| workload.name() == preferred)
        .unwrap_or(&claimed[0])
}

fn desired_workload(rollout: &Rollout, namespace: &str, name: &str) -> StatefulSet {
    let mut metadata = ObjectMeta::named(namespace, name);
    metadata.labels = rollout.spec.template.metadata.labels.clone();
    metadata
        .owner_references
        .push(OwnerReference::controller_for(rollout));
    StatefulSet::new(
        metadata,
        StatefulSetSpec {
            replicas: rollout.spec.replicas,
            selector: rollout.spec.selector.clone(),
            template: rollout.spec.template.clone(),
            service_name: None,
            update_strategy: StatefulSetUpdateStrategy::on_delete(),
        },
    )
}
