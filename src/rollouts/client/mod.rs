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

//! Boundary to the cluster API. Every call is synchronous and returns a typed
//! [`ApiError`]; watch streams are delivered over a channel so the informers
//! can consume them from async tasks.

pub mod memory;

use crate::rollouts::k8s::meta::Resource;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use memory::{MemoryClient, Operation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    NotFound { kind: String, key: String },
    AlreadyExists { kind: String, key: String },
    Conflict { kind: String, key: String, message: String },
    /// The requested watch version is older than the retained history.
    Expired { resource_version: String },
    Transport(String),
}

impl ApiError {
    pub fn not_found(kind: &str, key: impl Into<String>) -> Self {
        ApiError::NotFound {
            kind: kind.to_string(),
            key: key.into(),
        }
    }

    pub fn conflict(kind: &str, key: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError::Conflict {
            kind: kind.to_string(),
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ApiError::AlreadyExists { .. })
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::NotFound { kind, key } => write!(f, "{kind} '{key}' not found"),
            ApiError::AlreadyExists { kind, key } => write!(f, "{kind} '{key}' already exists"),
            ApiError::Conflict { kind, key, message } => {
                write!(f, "conflict updating {kind} '{key}': {message}")
            }
            ApiError::Expired { resource_version } => {
                write!(f, "resource version {resource_version} is too old")
            }
            ApiError::Transport(message) => write!(f, "transport error: {message}"),
        }
    }
}

impl Error for ApiError {}

/// Snapshot returned by `list`, tagged with the version a watch resumes from.
#[derive(Debug, Clone)]
pub struct ObjectList<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

impl<K: Resource> WatchEvent<K> {
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Added(object)
            | WatchEvent::Modified(object)
            | WatchEvent::Deleted(object) => object,
        }
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.object().metadata().resource_version.as_deref()
    }
}

/// Incremental change feed. `next` yields `None` once the server closes the
/// stream; callers reconnect from the last version they saw.
pub struct WatchStream<K> {
    receiver: mpsc::UnboundedReceiver<Result<WatchEvent<K>, ApiError>>,
}

impl<K> WatchStream<K> {
    pub fn new(receiver: mpsc::UnboundedReceiver<Result<WatchEvent<K>, ApiError>>) -> Self {
        Self { receiver }
    }

    pub async fn next(&mut self) -> Option<Result<WatchEvent<K>, ApiError>> {
        self.receiver.recv().await
    }
}

/// Namespaced CRUD and watch access to one resource kind.
pub trait ResourceClient<K: Resource>: Send + Sync {
    /// Lists objects in `namespace`, or in every namespace for `None`.
    fn list(&self, namespace: Option<&str>) -> Result<ObjectList<K>, ApiError>;

    fn get(&self, namespace: &str, name: &str) -> Result<K, ApiError>;

    fn create(&self, object: &K) -> Result<K, ApiError>;

    /// Replaces the stored object. A resource version on `object` that no
    /// longer matches the stored one yields [`ApiError::Conflict`].
    fn update(&self, object: &K) -> Result<K, ApiError>;

    fn watch(&self, namespace: Option<&str>, since_version: &str)
        -> Result<WatchStream<K>, ApiError>;
}

pub type SharedClient<K> = Arc<dyn ResourceClient<K>>;
