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

//! Adopt/release bookkeeping between an owner and candidate dependents.
//!
//! A candidate whose controller reference carries the owner's UID is claimed
//! while it matches the owner's selector and released once it stops matching.
//! An orphan that matches is adopted, but only after a live read confirms the
//! owner still exists under the same UID and is not being deleted. Objects
//! controlled by someone else are never touched.

use crate::rollouts::client::ResourceClient;
use crate::rollouts::controller::error::ControllerError;
use crate::rollouts::k8s::controllerrevision::ControllerRevision;
use crate::rollouts::k8s::meta::{OwnerReference, Resource};
use crate::rollouts::k8s::rollout::Rollout;
use crate::rollouts::k8s::selector::{LabelSelector, Selector};
use crate::rollouts::k8s::statefulset::StatefulSet;
use crate::rollouts::logger::{log_debug, log_info};
use std::sync::Arc;

const COMPONENT: &str = "claim-manager";

/// Result of a claim pass. Per-candidate failures never abort the pass.
#[derive(Debug)]
pub struct ClaimOutcome<K> {
    pub claimed: Vec<K>,
    pub errors: Vec<ControllerError>,
}

impl<K> ClaimOutcome<K> {
    pub fn into_result(self) -> Result<Vec<K>, ControllerError> {
        ControllerError::aggregate(self.errors)?;
        Ok(self.claimed)
    }
}

/// Builds the adoption gate for `owner`: a live read that must return the
/// same UID with no deletion timestamp. Captures only the owner's identity.
pub fn recheck_owner<'a, O: Resource>(
    client: &'a dyn ResourceClient<O>,
    owner: &O,
) -> impl FnOnce() -> Result<(), ControllerError> + 'a {
    let namespace = owner.namespace();
    let name = owner.name().to_string();
    let uid = owner.uid().unwrap_or_default().to_string();
    move || {
        let fresh = client.get(&namespace, &name).map_err(|err| {
            ControllerError::api(format!("recheck {} {}/{}", O::KIND, namespace, name), err)
        })?;
        if fresh.uid().unwrap_or_default() != uid {
            return Err(ControllerError::StaleOwner(format!(
                "original {} {}/{} is gone: got uid {}, wanted {}",
                O::KIND,
                namespace,
                name,
                fresh.uid().unwrap_or_default(),
                uid
            )));
        }
        if let Some(deleted_at) = fresh.metadata().deletion_timestamp {
            return Err(ControllerError::StaleOwner(format!(
                "{} {}/{} has just been deleted at {}",
                O::KIND,
                namespace,
                name,
                deleted_at.to_rfc3339()
            )));
        }
        Ok(())
    }
}

/// Claims `candidates` for `owner`. An invalid selector fails before any
/// candidate is looked at; `can_adopt` runs at most once per pass.
pub fn claim<O, K, F>(
    owner: &O,
    label_selector: &LabelSelector,
    candidates: &[Arc<K>],
    client: &dyn ResourceClient<K>,
    can_adopt: F,
) -> Result<ClaimOutcome<K>, ControllerError>
where
    O: Resource,
    K: Resource,
    F: FnOnce() -> Result<(), ControllerError>,
{
    let selector = label_selector.to_selector()?;
    let mut manager = ClaimPass {
        owner,
        owner_uid: owner.uid().unwrap_or_default(),
        selector,
        client,
        gate: AdoptGate::Pending(can_adopt),
        outcome: ClaimOutcome {
            claimed: Vec::new(),
            errors: Vec::new(),
        },
    };
    for candidate in candidates {
        manager.claim_one(candidate);
    }
    Ok(manager.outcome)
}

pub fn claim_statefulsets<F>(
    rollout: &Rollout,
    label_selector: &LabelSelector,
    candidates: &[Arc<StatefulSet>],
    client: &dyn ResourceClient<StatefulSet>,
    can_adopt: F,
) -> Result<ClaimOutcome<StatefulSet>, ControllerError>
where
    F: FnOnce() -> Result<(), ControllerError>,
{
    claim(rollout, label_selector, candidates, client, can_adopt)
}

pub fn claim_controller_revisions<F>(
    rollout: &Rollout,
    label_selector: &LabelSelector,
    candidates: &[Arc<ControllerRevision>],
    client: &dyn ResourceClient<ControllerRevision>,
    can_adopt: F,
) -> Result<ClaimOutcome<ControllerRevision>, ControllerError>
where
    F: FnOnce() -> Result<(), ControllerError>,
{
    claim(rollout, label_selector, candidates, client, can_adopt)
}

enum AdoptGate<F> {
    Pending(F),
    Open,
    Closed,
}

struct ClaimPass<'a, O, K: Resource, F> {
    owner: &'a O,
    owner_uid: &'a str,
    selector: Selector,
    client: &'a dyn ResourceClient<K>,
    gate: AdoptGate<F>,
    outcome: ClaimOutcome<K>,
}

impl<'a, O, K, F> ClaimPass<'a, O, K, F>
where
    O: Resource,
    K: Resource,
    F: FnOnce() -> Result<(), ControllerError>,
{
    fn claim_one(&mut self, candidate: &K) {
        let matches = self.selector.matches(&candidate.metadata().labels);
        match candidate.metadata().controller_ref() {
            Some(reference) if reference.uid == self.owner_uid => {
                if matches {
                    self.outcome.claimed.push(candidate.clone());
                } else if !self.owner.metadata().is_being_deleted() {
                    self.release(candidate);
                }
            }
            Some(_) => {}
            None => {
                if matches
                    && !self.owner.metadata().is_being_deleted()
                    && !candidate.metadata().is_being_deleted()
                {
                    self.adopt(candidate);
                }
            }
        }
    }

    fn release(&mut self, candidate: &K) {
        let mut released = candidate.clone();
        released
            .metadata_mut()
            .owner_references
            .retain(|reference| reference.uid != self.owner_uid);
        let key = candidate.object_key().map(|key| key.to_string()).unwrap_or_default();
        match self.client.update(&released) {
            Ok(_) => log_info(
                COMPONENT,
                "Released dependent that no longer matches selector",
                &[("kind", K::KIND), ("key", key.as_str()), ("owner", self.owner.name())],
            ),
            Err(err) if err.is_not_found() || err.is_conflict() => {
                let error_text = err.to_string();
                log_debug(
                    COMPONENT,
                    "Dependent changed before release, skipping",
                    &[("kind", K::KIND), ("key", key.as_str()), ("error", error_text.as_str())],
                );
            }
            Err(err) => self
                .outcome
                .errors
                .push(ControllerError::api(format!("release {} {}", K::KIND, key), err)),
        }
    }

    fn adopt(&mut self, candidate: &K) {
        if !self.adoption_allowed() {
            return;
        }
        let mut adopted = candidate.clone();
        adopted
            .metadata_mut()
            .owner_references
            .push(OwnerReference::controller_for(self.owner));
        let key = candidate.object_key().map(|key| key.to_string()).unwrap_or_default();
        match self.client.update(&adopted) {
            Ok(updated) => {
                log_info(
                    COMPONENT,
                    "Adopted orphaned dependent",
                    &[("kind", K::KIND), ("key", key.as_str()), ("owner", self.owner.name())],
                );
                self.outcome.claimed.push(updated);
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => self
                .outcome
                .errors
                .push(ControllerError::api(format!("adopt {} {}", K::KIND, key), err)),
        }
    }

    fn adoption_allowed(&mut self) -> bool {
        match std::mem::replace(&mut self.gate, AdoptGate::Closed) {
            AdoptGate::Pending(check) => match check() {
                Ok(()) => {
                    self.gate = AdoptGate::Open;
                    true
                }
                Err(err) => {
                    self.outcome.errors.push(err);
                    false
                }
            },
            AdoptGate::Open => {
                self.gate = AdoptGate::Open;
                true
            }
            AdoptGate::Closed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollouts::client::{MemoryClient, Operation};
    use crate::rollouts::controller::error::ErrorKind;
    use crate::rollouts::test_support::{rollout, statefulset_with_labels};
    use std::cell::Cell;

    fn stored(client: &MemoryClient<StatefulSet>, set: StatefulSet) -> Arc<StatefulSet> {
        Arc::new(client.create(&set).expect("seed statefulset"))
    }

    #[test]
    fn invalid_selector_touches_nothing() {
        let owner = rollout("prod", "web");
        let client = MemoryClient::<StatefulSet>::new();
        let candidate = stored(&client, statefulset_with_labels("prod", "a", &[("app", "web")]));
        client.reset_calls();

        let bad = LabelSelector::from_labels([("bad key!", "x")]);
        let err = claim(&owner, &bad, &[candidate], &client, || Ok(()))
            .expect_err("invalid selector");
        assert_eq!(err.kind(), ErrorKind::InvalidSpec);
        assert_eq!(client.calls(Operation::Update), 0);
    }

    #[test]
    fn foreign_controller_is_skipped_and_gate_runs_once() {
        let owner = rollout("prod", "web");
        let other = rollout("prod", "other");
        let client = MemoryClient::<StatefulSet>::new();

        let mut foreign = statefulset_with_labels("prod", "foreign", &[("app", "web")]);
        foreign
            .metadata
            .owner_references
            .push(OwnerReference::controller_for(&other));
        let foreign = stored(&client, foreign);
        let first = stored(&client, statefulset_with_labels("prod", "o1", &[("app", "web")]));
        let second = stored(&client, statefulset_with_labels("prod", "o2", &[("app", "web")]));
        client.reset_calls();

        let checks = Cell::new(0);
        let selector = LabelSelector::from_labels([("app", "web")]);
        let outcome = claim(&owner, &selector, &[foreign, first, second], &client, || {
            checks.set(checks.get() + 1);
            Ok(())
        })
        .expect("claim");

        let claimed = outcome.into_result().expect("no errors");
        assert_eq!(claimed.len(), 2);
        assert_eq!(checks.get(), 1);
        assert_eq!(client.calls(Operation::Update), 2);
        assert!(client
            .peek("prod", "foreign")
            .expect("foreign")
            .metadata
            .is_controlled_by(other.uid().unwrap_or_default()));
    }

    #[test]
    fn release_tolerates_conflicts() {
        let owner = rollout("prod", "web");
        let client = MemoryClient::<StatefulSet>::new();
        let mut owned = statefulset_with_labels("prod", "a", &[("app", "api")]);
        owned
            .metadata
            .owner_references
            .push(OwnerReference::controller_for(&owner));
        let owned = stored(&client, owned);
        client.fail_next(
            Operation::Update,
            crate::rollouts::client::ApiError::conflict("StatefulSet", "prod/a", "stale"),
        );

        let selector = LabelSelector::from_labels([("app", "web")]);
        let outcome = claim(&owner, &selector, &[owned], &client, || Ok(())).expect("claim");
        assert!(outcome.claimed.is_empty());
        assert!(outcome.errors.is_empty());
    }

    #[test]
    fn deleting_candidates_are_not_adopted() {
        let owner = rollout("prod", "web");
        let client = MemoryClient::<StatefulSet>::new();
        let mut dying = statefulset_with_labels("prod", "a", &[("app", "web")]);
        dying.metadata.deletion_timestamp = Some(chrono::Utc::now());
        let dying = stored(&client, dying);
        client.reset_calls();

        let selector = LabelSelector::from_labels([("app", "web")]);
        let outcome = claim(&owner, &selector, &[dying], &client, || Ok(())).expect("claim");
        assert!(outcome.claimed.is_empty());
        assert_eq!(client.calls(Operation::Update), 0);
    }
}
