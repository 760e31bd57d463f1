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

use crate::rollouts::client::ApiError;
use crate::rollouts::k8s::selector::SelectorError;
use crate::rollouts::logger::{log_event, LogLevel};
use std::error::Error;
use std::fmt::{self, Display, Formatter};

/// Coarse classification used for retry and log-level decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidSpec,
    TransportError,
    StaleOwner,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidSpec => "invalid_spec",
            ErrorKind::TransportError => "transport",
            ErrorKind::StaleOwner => "stale_owner",
        }
    }
}

/// Errors raised while reconciling Rollouts and their dependents.
#[derive(Debug)]
pub enum ControllerError {
    Api { action: String, source: ApiError },
    InvalidSpec(String),
    StaleOwner(String),
    Serialization(serde_json::Error),
    Aggregate(Vec<ControllerError>),
    Panicked(String),
}

impl ControllerError {
    pub fn api(action: impl Into<String>, source: ApiError) -> Self {
        ControllerError::Api {
            action: action.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ControllerError::Api { source, .. } => match source {
                ApiError::NotFound { .. } => ErrorKind::NotFound,
                ApiError::AlreadyExists { .. } | ApiError::Conflict { .. } => ErrorKind::Conflict,
                ApiError::Expired { .. } | ApiError::Transport(_) => ErrorKind::TransportError,
            },
            ControllerError::InvalidSpec(_) | ControllerError::Serialization(_) => {
                ErrorKind::InvalidSpec
            }
            ControllerError::StaleOwner(_) => ErrorKind::StaleOwner,
            ControllerError::Aggregate(errors) => errors
                .first()
                .map(ControllerError::kind)
                .unwrap_or(ErrorKind::TransportError),
            ControllerError::Panicked(_) => ErrorKind::TransportError,
        }
    }

    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            ControllerError::Api { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Collapses a list of errors into `Ok`, the single error, or an aggregate.
    pub fn aggregate(mut errors: Vec<ControllerError>) -> Result<(), ControllerError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ControllerError::Aggregate(errors)),
        }
    }
}

impl Display for ControllerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::Api { action, source } => write!(f, "failed to {}: {}", action, source),
            ControllerError::InvalidSpec(message) => write!(f, "invalid spec: {}", message),
            ControllerError::StaleOwner(message) => write!(f, "stale owner: {}", message),
            ControllerError::Serialization(err) => write!(f, "serialization error: {}", err),
            ControllerError::Aggregate(errors) => {
                let joined = errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                write!(f, "[{}]", joined)
            }
            ControllerError::Panicked(message) => write!(f, "reconcile panicked: {}", message),
        }
    }
}

impl Error for ControllerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ControllerError::Api { source, .. } => Some(source),
            ControllerError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SelectorError> for ControllerError {
    fn from(err: SelectorError) -> Self {
        ControllerError::InvalidSpec(format!("invalid selector: {}", err))
    }
}

impl From<serde_json::Error> for ControllerError {
    fn from(err: serde_json::Error) -> Self {
        ControllerError::Serialization(err)
    }
}

/// Logs `err` at the level its kind calls for.
pub fn log_controller_error(
    component: &str,
    message: &str,
    err: &ControllerError,
    metadata: &[(&str, &str)],
) {
    let error_text = err.to_string();
    let kind = err.kind();
    let mut fields: Vec<(&str, &str)> = metadata.to_vec();
    fields.push(("error_kind", kind.as_str()));
    fields.push(("error", error_text.as_str()));
    let level = match kind {
        ErrorKind::NotFound => LogLevel::Debug,
        ErrorKind::Conflict => LogLevel::Info,
        ErrorKind::InvalidSpec => LogLevel::Warn,
        ErrorKind::TransportError | ErrorKind::StaleOwner => LogLevel::Error,
    };
    log_event(level, component, message, &fields);
}
