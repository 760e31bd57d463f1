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

//! Watch-fed local cache of one resource kind.
//!
//! An [`Informer`] lists the kind once, then follows the watch stream from
//! the listed version, reconnecting with exponential backoff. A watch whose
//! version has expired forces a relist, which is diffed against the cache so
//! subscribers still see `Added`/`Updated`/`Deleted` for every change.
//! Reads hand out `Arc` snapshots and never block on the network.

use crate::rollouts::client::{ApiError, ObjectList, SharedClient, WatchEvent, WatchStream};
use crate::rollouts::controller::index::{IndexError, IndexFunc, ObjectIndex};
use crate::rollouts::k8s::meta::{normalize_namespace, ObjectKey, Resource};
use crate::rollouts::k8s::selector::Selector;
use crate::rollouts::logger::{log_debug, log_warn};
use crate::rollouts::observability::{metrics, tracing};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "informer";
const EVENT_BUFFER_SIZE: usize = 1024;
const BACKOFF_INITIAL_MS: u64 = 200;
const BACKOFF_MAX_MS: u64 = 10_000;

/// Cache change delivered to subscribers, in the order it was applied.
#[derive(Debug, Clone)]
pub enum InformerEvent<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

impl<K> InformerEvent<K> {
    /// The object's state after the event (the last known state for deletes).
    pub fn object(&self) -> &Arc<K> {
        match self {
            InformerEvent::Added(object) | InformerEvent::Deleted(object) => object,
            InformerEvent::Updated { new, .. } => new,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            InformerEvent::Added(_) => "added",
            InformerEvent::Updated { .. } => "updated",
            InformerEvent::Deleted(_) => "deleted",
        }
    }
}

pub struct InformerSubscription<K> {
    receiver: broadcast::Receiver<InformerEvent<K>>,
}

impl<K: Resource> InformerSubscription<K> {
    /// Next event, or `None` once the informer is gone. Lagging subscribers
    /// skip ahead; reconciliation is level-triggered so nothing is lost.
    pub async fn recv(&mut self) -> Option<InformerEvent<K>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    let skipped = skipped.to_string();
                    log_warn(
                        COMPONENT,
                        "Subscriber lagged behind cache events",
                        &[("kind", K::KIND), ("skipped", skipped.as_str())],
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

struct Store<K> {
    objects: HashMap<ObjectKey, Arc<K>>,
    index: ObjectIndex<K>,
}

pub struct Informer<K: Resource> {
    client: SharedClient<K>,
    namespace: Option<String>,
    store: RwLock<Store<K>>,
    events: broadcast::Sender<InformerEvent<K>>,
    synced: AtomicBool,
    sync_notify: Notify,
    backoff_max: Duration,
}

impl<K: Resource> Informer<K> {
    /// Creates an informer over `namespace`, or every namespace for `None`.
    pub fn new(client: SharedClient<K>, namespace: Option<&str>) -> Arc<Self> {
        Self::with_backoff_max(client, namespace, Duration::from_millis(BACKOFF_MAX_MS))
    }

    pub fn with_backoff_max(
        client: SharedClient<K>,
        namespace: Option<&str>,
        backoff_max: Duration,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Arc::new(Self {
            client,
            namespace: namespace.map(|ns| normalize_namespace(Some(ns))),
            store: RwLock::new(Store {
                objects: HashMap::new(),
                index: ObjectIndex::default(),
            }),
            events,
            synced: AtomicBool::new(false),
            sync_notify: Notify::new(),
            backoff_max: backoff_max.max(Duration::from_millis(BACKOFF_INITIAL_MS)),
        })
    }

    pub fn kind(&self) -> &'static str {
        K::KIND
    }

    pub fn subscribe(&self) -> InformerSubscription<K> {
        InformerSubscription {
            receiver: self.events.subscribe(),
        }
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.get_by_key(&ObjectKey::new(Some(namespace), name))
    }

    pub fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.read().objects.get(key).cloned()
    }

    /// Cached objects in `namespace` (all namespaces for `None`) whose labels
    /// match `selector`, sorted by key.
    pub fn list(&self, namespace: Option<&str>, selector: &Selector) -> Vec<Arc<K>> {
        let scope = namespace.map(|ns| normalize_namespace(Some(ns)));
        let store = self.read();
        let mut matched: Vec<(&ObjectKey, &Arc<K>)> = store
            .objects
            .iter()
            .filter(|(key, _)| scope.as_deref().map_or(true, |ns| key.namespace == ns))
            .filter(|(_, object)| selector.matches(&object.metadata().labels))
            .collect();
        matched.sort_by(|a, b| a.0.cmp(b.0));
        matched.into_iter().map(|(_, object)| object.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a named index; objects already cached are indexed at once.
    pub fn add_indexer<F>(&self, name: &str, func: F) -> Result<(), IndexError>
    where
        F: Fn(&K) -> Vec<String> + Send + Sync + 'static,
    {
        let func: IndexFunc<K> = Arc::new(func);
        let mut guard = self.write();
        let store = &mut *guard;
        let existing = store
            .objects
            .iter()
            .map(|(key, object)| (key, object.as_ref()));
        store.index.add_indexer(name, func, existing)
    }

    /// Objects whose index function produced `index_key` under `name`.
    pub fn by_index(&self, name: &str, index_key: &str) -> Result<Vec<Arc<K>>, IndexError> {
        let store = self.read();
        let keys = store.index.lookup(name, index_key)?;
        Ok(keys
            .iter()
            .filter_map(|key| store.objects.get(key).cloned())
            .collect())
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// Relists out of band, emitting the difference like a watch reconnect.
    pub async fn resync(&self) -> Result<(), ApiError> {
        self.relist().await.map(|_| ())
    }

    /// Waits for the first successful list. Returns `false` if `shutdown`
    /// fires first.
    pub async fn wait_for_sync(&self, shutdown: &CancellationToken) -> bool {
        loop {
            let notified = self.sync_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.has_synced() {
                return true;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return self.has_synced(),
                _ = &mut notified => {}
            }
        }
    }

    /// List-then-watch loop. Runs until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut backoff = Duration::from_millis(BACKOFF_INITIAL_MS);
        let mut resume_from: Option<String> = None;

        loop {
            if shutdown.is_cancelled() {
                return;
            }

            let version = match resume_from.take() {
                Some(version) => version,
                None => match tracing::with_span(COMPONENT, "relist", self.relist()).await {
                    Ok(version) => {
                        backoff = Duration::from_millis(BACKOFF_INITIAL_MS);
                        version
                    }
                    Err(err) => {
                        self.log_stream_error("List failed", &err);
                        if !self.pause(&shutdown, &mut backoff).await {
                            return;
                        }
                        continue;
                    }
                },
            };

            match self.open_watch(&version).await {
                Ok(stream) => {
                    match self.follow(stream, version, &shutdown, &mut backoff).await {
                        WatchOutcome::Shutdown => return,
                        WatchOutcome::Closed(last) => resume_from = Some(last),
                        WatchOutcome::Expired => {
                            resume_from = None;
                            continue;
                        }
                    }
                }
                Err(ApiError::Expired { .. }) => {
                    log_debug(
                        COMPONENT,
                        "Watch version expired, relisting",
                        &[("kind", K::KIND), ("resource_version", version.as_str())],
                    );
                    continue;
                }
                Err(err) => {
                    self.log_stream_error("Watch failed", &err);
                    resume_from = Some(version);
                }
            }

            if !self.pause(&shutdown, &mut backoff).await {
                return;
            }
        }
    }

    async fn follow(
        &self,
        mut stream: WatchStream<K>,
        mut version: String,
        shutdown: &CancellationToken,
        backoff: &mut Duration,
    ) -> WatchOutcome {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return WatchOutcome::Shutdown,
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        *backoff = Duration::from_millis(BACKOFF_INITIAL_MS);
                        if let Some(next) = event.resource_version() {
                            version = next.to_string();
                        }
                        self.apply(event);
                    }
                    Some(Err(ApiError::Expired { .. })) => return WatchOutcome::Expired,
                    Some(Err(err)) => {
                        self.log_stream_error("Watch stream error", &err);
                        return WatchOutcome::Closed(version);
                    }
                    None => return WatchOutcome::Closed(version),
                }
            }
        }
    }

    /// Sleeps for the current backoff and doubles it. Returns `false` when
    /// shutdown interrupted the wait.
    async fn pause(&self, shutdown: &CancellationToken, backoff: &mut Duration) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => return false,
            _ = sleep(*backoff) => {}
        }
        let next = *backoff * 2;
        *backoff = if next > self.backoff_max {
            self.backoff_max
        } else {
            next
        };
        true
    }

    async fn relist(&self) -> Result<String, ApiError> {
        let client = Arc::clone(&self.client);
        let namespace = self.namespace.clone();
        let list: ObjectList<K> =
            blocking(move || client.list(namespace.as_deref())).await?;
        let version = list.resource_version.clone();
        self.replace(list.items);
        if !self.synced.swap(true, Ordering::SeqCst) {
            self.sync_notify.notify_waiters();
            log_debug(
                COMPONENT,
                "Cache synced",
                &[("kind", K::KIND), ("resource_version", version.as_str())],
            );
        }
        Ok(version)
    }

    async fn open_watch(&self, version: &str) -> Result<WatchStream<K>, ApiError> {
        let client = Arc::clone(&self.client);
        let namespace = self.namespace.clone();
        let version = version.to_string();
        blocking(move || client.watch(namespace.as_deref(), &version)).await
    }

    fn replace(&self, items: Vec<K>) {
        let mut fresh: HashMap<ObjectKey, Arc<K>> = HashMap::with_capacity(items.len());
        for item in items {
            if let Some(key) = item.object_key() {
                fresh.insert(key, Arc::new(item));
            }
        }

        let mut pending = Vec::new();
        {
            let mut guard = self.write();
            let store = &mut *guard;
            let stale: Vec<ObjectKey> = store
                .objects
                .keys()
                .filter(|key| !fresh.contains_key(*key))
                .cloned()
                .collect();
            for key in stale {
                if let Some(old) = store.objects.remove(&key) {
                    store.index.update(&key, Some(old.as_ref()), None);
                    pending.push(InformerEvent::Deleted(old));
                }
            }
            for (key, new) in fresh {
                match store.objects.insert(key.clone(), Arc::clone(&new)) {
                    Some(old) if same_version(old.as_ref(), new.as_ref()) => {}
                    Some(old) => {
                        store.index.update(&key, Some(old.as_ref()), Some(new.as_ref()));
                        pending.push(InformerEvent::Updated { old, new });
                    }
                    None => {
                        store.index.update(&key, None, Some(new.as_ref()));
                        pending.push(InformerEvent::Added(new));
                    }
                }
            }
        }
        for event in pending {
            self.emit(event);
        }
    }

    fn apply(&self, event: WatchEvent<K>) {
        let (object, deleted) = match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => (object, false),
            WatchEvent::Deleted(object) => (object, true),
        };
        let Some(key) = object.object_key() else {
            return;
        };
        let new = Arc::new(object);

        let emitted = {
            let mut guard = self.write();
            let store = &mut *guard;
            if deleted {
                let old = store.objects.remove(&key);
                store.index.update(&key, old.as_deref(), None);
                Some(InformerEvent::Deleted(old.unwrap_or(new)))
            } else {
                match store.objects.insert(key.clone(), Arc::clone(&new)) {
                    Some(old) if same_version(old.as_ref(), new.as_ref()) => None,
                    Some(old) => {
                        store.index.update(&key, Some(old.as_ref()), Some(new.as_ref()));
                        Some(InformerEvent::Updated { old, new })
                    }
                    None => {
                        store.index.update(&key, None, Some(new.as_ref()));
                        Some(InformerEvent::Added(new))
                    }
                }
            }
        };
        if let Some(event) = emitted {
            self.emit(event);
        }
    }

    fn emit(&self, event: InformerEvent<K>) {
        metrics::record_informer_event(K::KIND, event.label());
        // No subscribers is fine; the cache is still current.
        let _ = self.events.send(event);
    }

    fn log_stream_error(&self, message: &str, err: &ApiError) {
        let error_text = err.to_string();
        log_warn(
            COMPONENT,
            message,
            &[("kind", K::KIND), ("error", error_text.as_str())],
        );
    }

    fn read(&self) -> RwLockReadGuard<'_, Store<K>> {
        self.store
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Store<K>> {
        self.store
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

enum WatchOutcome {
    Shutdown,
    Closed(String),
    Expired,
}

fn same_version<K: Resource>(old: &K, new: &K) -> bool {
    let old_version = old.metadata().resource_version.as_deref();
    old_version.is_some() && old_version == new.metadata().resource_version.as_deref()
}

/// Runs a synchronous client call on the blocking pool.
async fn blocking<T, F>(call: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|err| ApiError::Transport(format!("client call failed: {}", err)))?
}
