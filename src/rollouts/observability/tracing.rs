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

//! Span helpers for the rollout controllers. Spans are backed by the
//! `tracing` crate while a task-local [`TraceContext`] carries the
//! identifiers the logger attaches to every line emitted inside a reconcile.

use rand::{rngs::OsRng, RngCore};
use std::fmt::Write;
use std::future::Future;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::task_local;
use tracing::Instrument;
use tracing_subscriber::registry::Registry;

#[derive(Clone, Debug)]
pub struct TraceContext {
    trace_id: Arc<str>,
    span_id: Arc<str>,
}

impl TraceContext {
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }
}

task_local! {
    static ACTIVE_TRACE: TraceContext;
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Initialize the global tracing subscriber exactly once.
pub fn init() {
    TRACING_INIT.get_or_init(|| {
        let subscriber = Registry::default();
        // Another component may already have installed a subscriber.
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Returns the currently active [`TraceContext`], if any.
pub fn current_context() -> Option<TraceContext> {
    ACTIVE_TRACE.try_with(|ctx| ctx.clone()).ok()
}

/// Runs `fut` inside a span. Nested calls keep the enclosing trace id and
/// mint a fresh span id.
pub async fn with_span<T>(
    component: &'static str,
    span_name: impl Into<String>,
    fut: impl Future<Output = T>,
) -> T {
    let context = child_context();
    let name = span_name.into();
    let span = tracing::info_span!(
        "rollouts",
        component = component,
        span = name.as_str(),
        trace_id = context.trace_id(),
        span_id = context.span_id(),
    );

    ACTIVE_TRACE.scope(context, fut.instrument(span)).await
}

/// Synchronous counterpart of [`with_span`] for work running on the
/// blocking pool, where no task-local scope is inherited.
pub fn in_span<T>(component: &'static str, span_name: &str, f: impl FnOnce() -> T) -> T {
    let context = child_context();
    let span = tracing::info_span!(
        "rollouts",
        component = component,
        span = span_name,
        trace_id = context.trace_id(),
        span_id = context.span_id(),
    );
    let _entered = span.enter();
    ACTIVE_TRACE.sync_scope(context, f)
}

fn child_context() -> TraceContext {
    let trace_id = current_context()
        .map(|ctx| ctx.trace_id)
        .unwrap_or_else(|| Arc::<str>::from(random_hex(16)));
    TraceContext {
        trace_id,
        span_id: Arc::<str>::from(random_hex(8)),
    }
}

fn random_hex(bytes: usize) -> String {
    let mut data = vec![0u8; bytes];
    OsRng.fill_bytes(&mut data);
    let mut output = String::with_capacity(bytes * 2);
    for byte in data {
        let _ = write!(&mut output, "{:02x}", byte);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nested_spans_share_trace_id() {
        init();
        assert!(current_context().is_none());
        let (outer, inner) = with_span("test", "outer", async {
            let outer = current_context().expect("outer context");
            let inner = with_span("test", "inner", async {
                current_context().expect("inner context")
            })
            .await;
            (outer, inner)
        })
        .await;
        assert_eq!(outer.trace_id(), inner.trace_id());
        assert_ne!(outer.span_id(), inner.span_id());
        assert_eq!(outer.trace_id().len(), 32);
    }

    #[test]
    fn sync_span_exposes_context() {
        let span_id = in_span("test", "blocking", || {
            current_context().map(|ctx| ctx.span_id().to_string())
        });
        assert_eq!(span_id.map(|id| id.len()), Some(16));
        assert!(current_context().is_none());
    }
}
