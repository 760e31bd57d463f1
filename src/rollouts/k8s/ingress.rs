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

use super::meta::{ObjectMeta, Resource};
use serde::{Deserialize, Serialize};

/// Suffix appended to the name of canary ingresses derived from a stable ingress.
pub const CANARY_INGRESS_SUFFIX: &str = "-canary";
const MAX_RESOURCE_NAME_LEN: usize = 253;

/// Name of the canary ingress the controller derives for `stable_ingress`.
///
/// The `<rollout>-<stable>` prefix is truncated so the full name stays within
/// the 253 character resource name limit.
pub fn canary_ingress_name(rollout_name: &str, stable_ingress: &str) -> Option<String> {
    if rollout_name.is_empty() || stable_ingress.is_empty() {
        return None;
    }
    let mut prefix = format!("{}-{}", rollout_name, stable_ingress);
    let limit = MAX_RESOURCE_NAME_LEN - CANARY_INGRESS_SUFFIX.len();
    if prefix.len() > limit {
        let mut cut = limit;
        while !prefix.is_char_boundary(cut) {
            cut -= 1;
        }
        prefix.truncate(cut);
    }
    Some(format!("{}{}", prefix, CANARY_INGRESS_SUFFIX))
}

pub fn is_canary_ingress(name: &str) -> bool {
    name.ends_with(CANARY_INGRESS_SUFFIX)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<IngressRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngressRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// Ingress-like object a Rollout routes traffic through.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ingress {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: IngressSpec,
}

impl Ingress {
    pub fn new(metadata: ObjectMeta, spec: IngressSpec) -> Self {
        Self {
            api_version: Self::API_VERSION.to_string(),
            kind: Self::KIND.to_string(),
            metadata,
            spec,
        }
    }
}

impl Resource for Ingress {
    const KIND: &'static str = "Ingress";
    const API_VERSION: &'static str = "networking.k8s.io/v1";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canary_name_combines_rollout_and_stable_ingress() {
        assert_eq!(
            canary_ingress_name("web", "web-ingress").as_deref(),
            Some("web-web-ingress-canary")
        );
        assert!(canary_ingress_name("", "web-ingress").is_none());
        assert!(is_canary_ingress("web-web-ingress-canary"));
        assert!(!is_canary_ingress("web-ingress"));
    }

    #[test]
    fn canary_name_is_truncated_to_resource_limit() {
        let rollout = "r".repeat(200);
        let stable = "s".repeat(200);
        let name = canary_ingress_name(&rollout, &stable).expect("name");
        assert_eq!(name.len(), MAX_RESOURCE_NAME_LEN);
        assert!(name.ends_with(CANARY_INGRESS_SUFFIX));
    }
}
