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

use crate::rollouts::observability::tracing;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
#[cfg(not(test))]
use std::io::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};
#[cfg(test)]
use std::sync::{Mutex, OnceLock};

const SERVICE_NAME: &str = "rollouts-controller";

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Text = 0,
    Json = 1,
}

static LOG_FORMAT: AtomicU8 = AtomicU8::new(LogFormat::Text as u8);

pub fn set_log_format(format: LogFormat) {
    LOG_FORMAT.store(format as u8, Ordering::Relaxed);
}

fn current_log_format() -> LogFormat {
    match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

impl LogFormat {
    /// Parses `text` or `json`, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Some(LogFormat::Text),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    #[cfg(not(test))]
    fn is_stderr(self) -> bool {
        matches!(self, LogLevel::Warn | LogLevel::Error)
    }
}

fn encode_field_value(value: &str) -> String {
    let needs_quotes = value.chars().any(|c| {
        c.is_whitespace()
            || matches!(
                c,
                '"' | '\\' | '=' | '[' | ']' | '{' | '}' | ',' | '\n' | '\r' | '\t'
            )
    });

    if !needs_quotes {
        return value.to_string();
    }

    let mut encoded = String::with_capacity(value.len() + 2);
    encoded.push('"');
    for ch in value.chars() {
        match ch {
            '"' => encoded.push_str("\\\""),
            '\\' => encoded.push_str("\\\\"),
            '\n' => encoded.push_str("\\n"),
            '\r' => encoded.push_str("\\r"),
            '\t' => encoded.push_str("\\t"),
            _ => encoded.push(ch),
        }
    }
    encoded.push('"');
    encoded
}

fn push_field(buffer: &mut String, key: &str, value: &str) {
    if !buffer.is_empty() {
        buffer.push(' ');
    }
    buffer.push_str(key);
    buffer.push('=');
    buffer.push_str(&encode_field_value(value));
}

pub fn log_event(level: LogLevel, component: &str, message: &str, metadata: &[(&str, &str)]) {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let pid = std::process::id().to_string();
    let trace_context = tracing::current_context();

    match current_log_format() {
        LogFormat::Text => {
            let mut line = String::new();
            push_field(&mut line, "ts", &timestamp);
            push_field(&mut line, "level", level.as_str());
            push_field(&mut line, "service", SERVICE_NAME);
            push_field(&mut line, "component", component);
            push_field(&mut line, "pid", &pid);
            push_field(&mut line, "msg", message);
            if let Some(ctx) = trace_context.as_ref() {
                push_field(&mut line, "trace_id", ctx.trace_id());
                push_field(&mut line, "span_id", ctx.span_id());
            }

            for (key, value) in metadata {
                if key.is_empty() {
                    continue;
                }
                push_field(&mut line, key, value);
            }

            write_line(level, &line);
        }
        LogFormat::Json => {
            let mut payload = serde_json::Map::new();
            payload.insert("ts".into(), Value::String(timestamp));
            payload.insert("level".into(), Value::String(level.as_str().to_string()));
            payload.insert("service".into(), Value::String(SERVICE_NAME.to_string()));
            payload.insert("component".into(), Value::String(component.to_string()));
            payload.insert("pid".into(), Value::String(pid));
            payload.insert("msg".into(), Value::String(message.to_string()));
            if let Some(ctx) = trace_context {
                payload.insert("trace_id".into(), Value::String(ctx.trace_id().to_string()));
                payload.insert("span_id".into(), Value::String(ctx.span_id().to_string()));
            }
            for (key, value) in metadata {
                if key.is_empty() {
                    continue;
                }
                payload.insert((*key).to_string(), Value::String((*value).to_string()));
            }
            let line = Value::Object(payload).to_string();
            write_line(level, &line);
        }
    }
}

pub fn log_debug(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Debug, component, message, metadata);
}

pub fn log_info(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Info, component, message, metadata);
}

pub fn log_warn(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Warn, component, message, metadata);
}

pub fn log_error(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Error, component, message, metadata);
}

#[cfg(not(test))]
fn write_line(level: LogLevel, line: &str) {
    let write_result = if level.is_stderr() {
        let mut stderr = io::stderr().lock();
        writeln!(stderr, "{}", line)
    } else {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", line)
    };

    if let Err(error) = write_result {
        let mut stderr = io::stderr().lock();
        let _ = writeln!(
            stderr,
            "rollouts: failed to write log line: {} (original: {})",
            error, line
        );
    }
}

#[cfg(test)]
fn write_line(level: LogLevel, line: &str) {
    let store = test_log_store();
    let mut guard = store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.push((level, line.to_string()));
}

#[cfg(test)]
fn test_log_store() -> &'static Mutex<Vec<(LogLevel, String)>> {
    static STORE: OnceLock<Mutex<Vec<(LogLevel, String)>>> = OnceLock::new();
    STORE.get_or_init(|| Mutex::new(Vec::new()))
}

/// Returns the captured lines containing `needle`. Other tests log
/// concurrently, so callers filter on something unique to them.
#[cfg(test)]
pub(crate) fn captured_logs(needle: &str) -> Vec<(LogLevel, String)> {
    let store = test_log_store();
    let guard = store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard
        .iter()
        .filter(|(_, line)| line.contains(needle))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollouts::observability::tracing;
    use serial_test::serial;

    #[tokio::test]
    #[serial]
    async fn text_logs_include_trace_ids() {
        tracing::init();
        set_log_format(LogFormat::Text);
        tracing::with_span("test.component", "text-log", async {
            log_info("unit", "text-log-marker", &[("namespace", "default")]);
        })
        .await;

        let logs = captured_logs("text-log-marker");
        assert_eq!(logs.len(), 1);
        let (level, line) = &logs[0];
        assert_eq!(*level, LogLevel::Info);
        assert!(
            line.contains("trace_id=") && line.contains("span_id="),
            "trace metadata missing: {line}"
        );
        assert!(line.contains("namespace=default"), "metadata not propagated: {line}");
    }

    #[tokio::test]
    #[serial]
    async fn json_logs_include_trace_ids() {
        tracing::init();
        set_log_format(LogFormat::Json);
        tracing::with_span("test.component", "json-log", async {
            log_warn("unit", "json-log-marker", &[("key", "value")]);
        })
        .await;
        set_log_format(LogFormat::Text);

        let logs = captured_logs("json-log-marker");
        assert_eq!(logs.len(), 1);
        let payload: Value = serde_json::from_str(&logs[0].1).expect("valid json log");
        let trace_id = payload
            .get("trace_id")
            .and_then(|v| v.as_str())
            .expect("trace_id present");
        assert_eq!(payload.get("component").and_then(|v| v.as_str()), Some("unit"));
        assert_eq!(payload.get("key").and_then(|v| v.as_str()), Some("value"));
        assert_eq!(
            payload.get("service").and_then(|v| v.as_str()),
            Some(SERVICE_NAME)
        );
        assert!(!trace_id.is_empty());
    }

    #[test]
    fn values_with_separators_are_quoted() {
        assert_eq!(encode_field_value("plain"), "plain");
        assert_eq!(encode_field_value("a b"), "\"a b\"");
        assert_eq!(encode_field_value("k=v"), "\"k=v\"");
    }

    #[test]
    fn log_format_parses_known_names() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse(" text "), Some(LogFormat::Text));
        assert_eq!(LogFormat::parse("yaml"), None);
    }
}
