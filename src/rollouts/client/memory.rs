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

use super::{ApiError, ObjectList, ResourceClient, WatchEvent, WatchStream};
use crate::rollouts::k8s::meta::{normalize_namespace, ObjectKey, Resource};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

const HISTORY_LIMIT: usize = 512;

/// Client calls tracked by [`MemoryClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Get,
    Create,
    Update,
    Delete,
    Watch,
}

type WatchSender<K> = mpsc::UnboundedSender<Result<WatchEvent<K>, ApiError>>;

struct Watcher<K> {
    namespace: Option<String>,
    sender: WatchSender<K>,
}

struct State<K> {
    objects: BTreeMap<ObjectKey, K>,
    version: u64,
    history: VecDeque<(u64, WatchEvent<K>)>,
    compacted: u64,
    watchers: Vec<Watcher<K>>,
    faults: HashMap<Operation, ApiError>,
    calls: HashMap<Operation, usize>,
}

/// In-process API server for one resource kind: optimistic concurrency on
/// resource versions, a bounded replayable event history, per-operation call
/// counters and one-shot fault injection.
pub struct MemoryClient<K> {
    state: Mutex<State<K>>,
}

impl<K: Resource> Default for MemoryClient<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Resource> MemoryClient<K> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                version: 0,
                history: VecDeque::new(),
                compacted: 0,
                watchers: Vec::new(),
                faults: HashMap::new(),
                calls: HashMap::new(),
            }),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Makes the next call of `operation` fail with `error`.
    pub fn fail_next(&self, operation: Operation, error: ApiError) {
        self.lock().faults.insert(operation, error);
    }

    pub fn calls(&self, operation: Operation) -> usize {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        self.lock().calls.clear();
    }

    /// Reads an object without counting a call.
    pub fn peek(&self, namespace: &str, name: &str) -> Option<K> {
        let key = ObjectKey::new(Some(namespace), name);
        self.lock().objects.get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn delete(&self, namespace: &str, name: &str) -> Result<K, ApiError> {
        let mut state = self.lock();
        begin(&mut state, Operation::Delete)?;
        let key = ObjectKey::new(Some(namespace), name);
        let mut removed = state
            .objects
            .remove(&key)
            .ok_or_else(|| ApiError::not_found(K::KIND, key.to_string()))?;
        let version = next_version(&mut state);
        removed.metadata_mut().resource_version = Some(version.to_string());
        publish(&mut state, version, WatchEvent::Deleted(removed.clone()));
        Ok(removed)
    }

    /// Closes every open watch stream, as a server restart would.
    pub fn disconnect_watchers(&self) {
        self.lock().watches_closed();
    }

    /// Drops the retained history so older watch versions report `Expired`.
    pub fn compact(&self) {
        let mut state = self.lock();
        state.history.clear();
        state.compacted = state.version;
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<K> State<K> {
    fn watches_closed(&mut self) {
        self.watchers.clear();
    }
}

fn begin<K>(state: &mut State<K>, operation: Operation) -> Result<(), ApiError> {
    *state.calls.entry(operation).or_insert(0) += 1;
    match state.faults.remove(&operation) {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

fn next_version<K>(state: &mut State<K>) -> u64 {
    state.version += 1;
    state.version
}

fn publish<K: Resource>(state: &mut State<K>, version: u64, event: WatchEvent<K>) {
    let namespace = event.object().namespace();
    state.watchers.retain(|watcher| {
        if watcher
            .namespace
            .as_deref()
            .is_some_and(|scope| scope != namespace)
        {
            return !watcher.sender.is_closed();
        }
        watcher.sender.send(Ok(event.clone())).is_ok()
    });
    state.history.push_back((version, event));
    while state.history.len() > HISTORY_LIMIT {
        if let Some((dropped, _)) = state.history.pop_front() {
            state.compacted = dropped;
        }
    }
}

fn object_key<K: Resource>(object: &K) -> Result<ObjectKey, ApiError> {
    object
        .object_key()
        .ok_or_else(|| ApiError::Transport(format!("{} without a name", K::KIND)))
}

fn generate_uid() -> String {
    format!("{:032x}", rand::random::<u128>())
}

impl<K: Resource> ResourceClient<K> for MemoryClient<K> {
    fn list(&self, namespace: Option<&str>) -> Result<ObjectList<K>, ApiError> {
        let mut state = self.lock();
        begin(&mut state, Operation::List)?;
        let scope = namespace.map(|ns| normalize_namespace(Some(ns)));
        let items = state
            .objects
            .iter()
            .filter(|(key, _)| scope.as_deref().map_or(true, |ns| key.namespace == ns))
            .map(|(_, object)| object.clone())
            .collect();
        Ok(ObjectList {
            items,
            resource_version: state.version.to_string(),
        })
    }

    fn get(&self, namespace: &str, name: &str) -> Result<K, ApiError> {
        let mut state = self.lock();
        begin(&mut state, Operation::Get)?;
        let key = ObjectKey::new(Some(namespace), name);
        state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ApiError::not_found(K::KIND, key.to_string()))
    }

    fn create(&self, object: &K) -> Result<K, ApiError> {
        let mut state = self.lock();
        begin(&mut state, Operation::Create)?;
        let key = object_key(object)?;
        if state.objects.contains_key(&key) {
            return Err(ApiError::AlreadyExists {
                kind: K::KIND.to_string(),
                key: key.to_string(),
            });
        }

        let version = next_version(&mut state);
        let mut stored = object.clone();
        let meta = stored.metadata_mut();
        meta.namespace = Some(key.namespace.clone());
        meta.uid = Some(generate_uid());
        meta.resource_version = Some(version.to_string());
        meta.generation = Some(1);
        meta.creation_timestamp = Some(Utc::now());

        state.objects.insert(key, stored.clone());
        publish(&mut state, version, WatchEvent::Added(stored.clone()));
        Ok(stored)
    }

    fn update(&self, object: &K) -> Result<K, ApiError> {
        let mut state = self.lock();
        begin(&mut state, Operation::Update)?;
        let key = object_key(object)?;
        let current = state
            .objects
            .get(&key)
            .ok_or_else(|| ApiError::not_found(K::KIND, key.to_string()))?;

        let current_meta = current.metadata();
        if let Some(expected) = object.metadata().resource_version.as_deref() {
            if current_meta.resource_version.as_deref() != Some(expected) {
                return Err(ApiError::conflict(
                    K::KIND,
                    key.to_string(),
                    "the object has been modified; apply your changes to the latest version",
                ));
            }
        }
        if object.metadata().uid.is_some() && object.metadata().uid != current_meta.uid {
            return Err(ApiError::conflict(
                K::KIND,
                key.to_string(),
                "uid precondition failed",
            ));
        }

        let uid = current_meta.uid.clone();
        let created = current_meta.creation_timestamp;
        let generation = current_meta.generation;
        let version = next_version(&mut state);
        let mut stored = object.clone();
        let meta = stored.metadata_mut();
        meta.namespace = Some(key.namespace.clone());
        meta.uid = uid;
        meta.creation_timestamp = created;
        meta.generation = generation;
        meta.resource_version = Some(version.to_string());

        state.objects.insert(key, stored.clone());
        publish(&mut state, version, WatchEvent::Modified(stored.clone()));
        Ok(stored)
    }

    fn watch(
        &self,
        namespace: Option<&str>,
        since_version: &str,
    ) -> Result<WatchStream<K>, ApiError> {
        let mut state = self.lock();
        begin(&mut state, Operation::Watch)?;
        let since = if since_version.is_empty() {
            state.version
        } else {
            since_version
                .parse::<u64>()
                .map_err(|_| ApiError::Transport(format!("invalid resource version {since_version:?}")))?
        };
        if since < state.compacted {
            return Err(ApiError::Expired {
                resource_version: since_version.to_string(),
            });
        }

        let scope = namespace.map(|ns| normalize_namespace(Some(ns)));
        let (sender, receiver) = mpsc::unbounded_channel();
        for (version, event) in state.history.iter() {
            if *version <= since {
                continue;
            }
            if scope
                .as_deref()
                .is_some_and(|ns| event.object().namespace() != ns)
            {
                continue;
            }
            let _ = sender.send(Ok(event.clone()));
        }
        state.watchers.push(Watcher {
            namespace: scope,
            sender,
        });
        Ok(WatchStream::new(receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollouts::k8s::meta::ObjectMeta;
    use crate::rollouts::k8s::statefulset::{StatefulSet, StatefulSetSpec};
    use tokio::time::{timeout, Duration};

    fn statefulset(namespace: &str, name: &str) -> StatefulSet {
        StatefulSet::new(ObjectMeta::named(namespace, name), StatefulSetSpec::default())
    }

    #[test]
    fn create_assigns_identity_and_rejects_duplicates() {
        let client = MemoryClient::<StatefulSet>::new();
        let created = client.create(&statefulset("prod", "web")).expect("create");
        assert!(created.metadata.uid.is_some());
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));

        let err = client
            .create(&statefulset("prod", "web"))
            .expect_err("duplicate create");
        assert!(err.is_already_exists());
        assert_eq!(client.calls(Operation::Create), 2);
    }

    #[test]
    fn stale_update_conflicts() {
        let client = MemoryClient::<StatefulSet>::new();
        let created = client.create(&statefulset("prod", "web")).expect("create");

        let mut first = created.clone();
        first.spec.replicas = Some(2);
        let updated = client.update(&first).expect("first update");
        assert_eq!(updated.metadata.uid, created.metadata.uid);

        let mut stale = created;
        stale.spec.replicas = Some(5);
        let err = client.update(&stale).expect_err("stale update");
        assert!(err.is_conflict());
        assert_eq!(client.peek("prod", "web").and_then(|s| s.spec.replicas), Some(2));
    }

    #[test]
    fn injected_fault_fires_once() {
        let client = MemoryClient::<StatefulSet>::new();
        client.fail_next(Operation::Get, ApiError::Transport("boom".into()));
        assert!(matches!(
            client.get("prod", "web"),
            Err(ApiError::Transport(_))
        ));
        assert!(client.get("prod", "web").expect_err("absent").is_not_found());
    }

    #[tokio::test]
    async fn watch_replays_history_after_version() {
        let client = MemoryClient::<StatefulSet>::new();
        client.create(&statefulset("prod", "a")).expect("create a");
        client.create(&statefulset("other", "b")).expect("create b");
        client.create(&statefulset("prod", "c")).expect("create c");

        let mut stream = client.watch(Some("prod"), "1").expect("watch");
        let event = timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("event in time")
            .expect("stream open")
            .expect("event");
        assert_eq!(event.object().name(), "c");

        client.delete("prod", "a").expect("delete");
        let event = timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("event in time")
            .expect("stream open")
            .expect("event");
        assert!(matches!(event, WatchEvent::Deleted(ref obj) if obj.name() == "a"));
    }

    #[test]
    fn compacted_history_expires_old_versions() {
        let client = MemoryClient::<StatefulSet>::new();
        client.create(&statefulset("prod", "a")).expect("create");
        client.create(&statefulset("prod", "b")).expect("create");
        client.compact();

        assert!(matches!(
            client.watch(None, "1"),
            Err(ApiError::Expired { .. })
        ));
        assert!(client.watch(None, "2").is_ok());
    }
}
