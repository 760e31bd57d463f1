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

use crate::rollouts::controller::error::{log_controller_error, ControllerError};
use crate::rollouts::controller::workqueue::WorkQueue;
use crate::rollouts::logger::{log_debug, log_error, log_info};
use crate::rollouts::observability::metrics::{self, ControllerReconcileResult};
use crate::rollouts::observability::tracing;
use std::any::Any;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

/// Reconcile function registered for a queue. Runs on the blocking pool.
pub trait SyncHandler<T>: Send + Sync + 'static {
    fn sync(&self, key: &T) -> Result<(), ControllerError>;
}

impl<T, F> SyncHandler<T> for F
where
    F: Fn(&T) -> Result<(), ControllerError> + Send + Sync + 'static,
{
    fn sync(&self, key: &T) -> Result<(), ControllerError> {
        self(key)
    }
}

/// Runs `threads` workers against `queue` until `shutdown` is cancelled. A
/// worker always finishes the item it holds before observing shutdown.
pub async fn run_workers<T, H>(
    controller: &'static str,
    queue: WorkQueue<T>,
    threads: usize,
    handler: Arc<H>,
    shutdown: CancellationToken,
) where
    T: Clone + Eq + Hash + Display + Send + Sync + 'static,
    H: SyncHandler<T> + ?Sized,
{
    let threads = threads.max(1);
    let thread_count = threads.to_string();
    log_info(
        controller,
        "Starting workers",
        &[("queue", queue.name()), ("threads", thread_count.as_str())],
    );

    let mut workers = Vec::with_capacity(threads);
    for _ in 0..threads {
        let queue = queue.clone();
        let handler = Arc::clone(&handler);
        let shutdown = shutdown.clone();
        workers.push(tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    item = queue.get() => match item {
                        Some(item) => item,
                        None => break,
                    },
                };
                process_item(controller, &queue, &handler, item).await;
            }
        }));
    }

    for worker in workers {
        join_logged(controller, worker).await;
    }
    log_info(controller, "Workers stopped", &[("queue", queue.name())]);
}

/// Awaits a background task, logging it if it panicked or was aborted.
pub async fn join_logged(component: &str, task: JoinHandle<()>) {
    if let Err(err) = task.await {
        let error = err.to_string();
        log_error(
            component,
            "Background task ended abnormally",
            &[("error", error.as_str())],
        );
    }
}

/// Reconciles one item: success forgets its backoff, failure or panic
/// requeues it rate limited. The item is always marked done.
pub async fn process_item<T, H>(
    controller: &'static str,
    queue: &WorkQueue<T>,
    handler: &Arc<H>,
    item: T,
) where
    T: Clone + Eq + Hash + Display + Send + Sync + 'static,
    H: SyncHandler<T> + ?Sized,
{
    let started = Instant::now();
    let key = item.clone();
    let handler = Arc::clone(handler);
    let joined = tokio::task::spawn_blocking(move || {
        tracing::in_span(controller, "reconcile", || handler.sync(&key))
    })
    .await;
    let result = joined.unwrap_or_else(|err| Err(panicked(err)));
    metrics::observe_reconcile_duration(controller, started.elapsed());

    let key_label = item.to_string();
    match result {
        Ok(()) => {
            queue.forget(&item);
            metrics::record_controller_reconcile(controller, ControllerReconcileResult::Success);
            log_debug(
                controller,
                "Successfully synced",
                &[("key", key_label.as_str())],
            );
        }
        Err(err) => {
            metrics::record_controller_reconcile(controller, ControllerReconcileResult::Error);
            let requeues = (queue.num_requeues(&item) + 1).to_string();
            log_controller_error(
                controller,
                "Error syncing, requeuing",
                &err,
                &[("key", key_label.as_str()), ("requeues", requeues.as_str())],
            );
            queue.add_rate_limited(item.clone());
        }
    }
    queue.done(&item);
}

fn panicked(err: JoinError) -> ControllerError {
    if !err.is_panic() {
        return ControllerError::Panicked("reconcile task cancelled".to_string());
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    ControllerError::Panicked(message)
}
