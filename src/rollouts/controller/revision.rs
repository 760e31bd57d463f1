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

use crate::rollouts::client::{ApiError, ResourceClient};
use crate::rollouts::controller::error::ControllerError;
use crate::rollouts::k8s::controllerrevision::ControllerRevision;
use crate::rollouts::k8s::meta::{ObjectMeta, OwnerReference, Resource};
use crate::rollouts::k8s::pod::PodTemplateSpec;
use crate::rollouts::k8s::rollout::{Rollout, RolloutStatus};
use crate::rollouts::logger::{log_info, log_warn};
use sha1::{Digest, Sha1};
use std::fmt::Write;

const COMPONENT: &str = "revision-history";

pub const POD_TEMPLATE_HASH_LABEL: &str = "rollouts.nanocloud.io/pod-template-hash";
pub const POD_HASH_LEN: usize = 10;
const MAX_OBJECT_NAME_LEN: usize = 253;

/// Short content hash of `template`, salted with `collision_count` so a
/// collision can be escaped by bumping the count.
pub fn compute_pod_hash(
    template: &PodTemplateSpec,
    collision_count: Option<i32>,
) -> Result<String, ControllerError> {
    // Going through `Value` sorts map keys, so label order never changes the hash.
    let canonical = serde_json::to_value(template)?;
    let payload = serde_json::to_vec(&canonical)?;
    let mut hasher = Sha1::new();
    hasher.update(&payload);
    if let Some(count) = collision_count {
        hasher.update(count.to_le_bytes());
    }
    let digest = hasher.finalize();
    let mut hash = String::with_capacity(POD_HASH_LEN);
    for byte in digest.iter() {
        let _ = write!(&mut hash, "{:02x}", byte);
        if hash.len() >= POD_HASH_LEN {
            break;
        }
    }
    hash.truncate(POD_HASH_LEN);
    Ok(hash)
}

/// `<rollout>-<hash>`, trimming the rollout name so the result stays a valid
/// object name.
pub fn revision_name(rollout_name: &str, hash: &str) -> String {
    let max_prefix_len = MAX_OBJECT_NAME_LEN.saturating_sub(hash.len() + 1);
    let prefix = if rollout_name.len() > max_prefix_len {
        let truncated: String = rollout_name.chars().take(max_prefix_len).collect();
        let trimmed = truncated.trim_end_matches('-');
        if trimmed.is_empty() {
            truncated
        } else {
            trimmed.to_string()
        }
    } else {
        rollout_name.to_string()
    };
    format!("{}-{}", prefix, hash)
}

pub fn revision_hash(revision: &ControllerRevision) -> Option<&str> {
    revision
        .metadata
        .labels
        .get(POD_TEMPLATE_HASH_LABEL)
        .map(String::as_str)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RevisionSync {
    pub hash: String,
    pub revision: ControllerRevision,
    pub created: bool,
}

/// Makes sure a revision for the Rollout's current template exists.
///
/// `claimed` are the revisions the Rollout already owns. A name clash with
/// different contents is a hash collision: `status.collisionCount` is bumped
/// and a conflict returned so the next attempt hashes differently.
pub fn sync_revision(
    rollout: &Rollout,
    claimed: &[ControllerRevision],
    client: &dyn ResourceClient<ControllerRevision>,
    status: &mut RolloutStatus,
) -> Result<RevisionSync, ControllerError> {
    let template = &rollout.spec.template;
    let hash = compute_pod_hash(template, status.collision_count)?;

    if let Some(existing) = claimed
        .iter()
        .find(|revision| revision_hash(revision) == Some(hash.as_str()))
    {
        return Ok(RevisionSync {
            hash,
            revision: existing.clone(),
            created: false,
        });
    }

    let data = serde_json::to_value(template)?;
    let next_number = claimed
        .iter()
        .map(|revision| revision.revision)
        .max()
        .unwrap_or(0)
        + 1;

    let namespace = rollout.namespace();
    let name = revision_name(rollout.name(), &hash);
    let mut metadata = ObjectMeta::named(&namespace, &name);
    metadata.labels = template.metadata.labels.clone();
    metadata
        .labels
        .insert(POD_TEMPLATE_HASH_LABEL.to_string(), hash.clone());
    metadata
        .owner_references
        .push(OwnerReference::controller_for(rollout));
    let desired = ControllerRevision::new(metadata, data, next_number);

    match client.create(&desired) {
        Ok(created) => {
            let number = next_number.to_string();
            log_info(
                COMPONENT,
                "Created revision for pod template",
                &[
                    ("namespace", namespace.as_str()),
                    ("rollout", rollout.name()),
                    ("revision", name.as_str()),
                    ("number", number.as_str()),
                ],
            );
            Ok(RevisionSync {
                hash,
                revision: created,
                created: true,
            })
        }
        Err(ApiError::AlreadyExists { .. }) => {
            let existing = client.get(&namespace, &name).map_err(|err| {
                ControllerError::api(format!("get ControllerRevision {}/{}", namespace, name), err)
            })?;
            if existing.data == desired.data {
                return Ok(RevisionSync {
                    hash,
                    revision: existing,
                    created: false,
                });
            }

            let count = status.collision_count.unwrap_or(0).saturating_add(1);
            status.collision_count = Some(count);
            let count_text = count.to_string();
            log_warn(
                COMPONENT,
                "Pod template hash collision",
                &[
                    ("namespace", namespace.as_str()),
                    ("rollout", rollout.name()),
                    ("revision", name.as_str()),
                    ("collision_count", count_text.as_str()),
                ],
            );
            Err(ControllerError::api(
                format!("create ControllerRevision {}/{}", namespace, name),
                ApiError::conflict(
                    ControllerRevision::KIND,
                    format!("{}/{}", namespace, name),
                    "hash collision with an existing revision",
                ),
            ))
        }
        Err(err) => Err(ControllerError::api(
            format!("create ControllerRevision {}/{}", namespace, name),
            err,
        )),
    }
}
