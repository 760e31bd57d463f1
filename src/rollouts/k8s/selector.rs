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

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::error::Error;
use std::fmt::{Display, Formatter};

const MAX_LABEL_NAME_LEN: usize = 63;
const MAX_LABEL_PREFIX_LEN: usize = 253;

/// Label selector as written in resource specs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub match_labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl LabelSelector {
    pub fn from_labels<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: labels
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    /// Parses the selector into a matcher, validating keys, values and operators.
    pub fn to_selector(&self) -> Result<Selector, SelectorError> {
        let mut requirements =
            Vec::with_capacity(self.match_labels.len() + self.match_expressions.len());

        let mut exact: Vec<(&String, &String)> = self.match_labels.iter().collect();
        exact.sort();
        for (key, value) in exact {
            validate_key(key)?;
            validate_value(key, value)?;
            requirements.push(Requirement {
                key: key.clone(),
                operator: Operator::In,
                values: BTreeSet::from([value.clone()]),
            });
        }

        for expression in &self.match_expressions {
            validate_key(&expression.key)?;
            let operator = Operator::parse(&expression.operator)?;
            match operator {
                Operator::In | Operator::NotIn if expression.values.is_empty() => {
                    return Err(SelectorError::MissingValues {
                        key: expression.key.clone(),
                        operator: expression.operator.clone(),
                    });
                }
                Operator::Exists | Operator::DoesNotExist if !expression.values.is_empty() => {
                    return Err(SelectorError::UnexpectedValues {
                        key: expression.key.clone(),
                        operator: expression.operator.clone(),
                    });
                }
                _ => {}
            }
            for value in &expression.values {
                validate_value(&expression.key, value)?;
            }
            requirements.push(Requirement {
                key: expression.key.clone(),
                operator,
                values: expression.values.iter().cloned().collect(),
            });
        }

        Ok(Selector { requirements })
    }
}

/// Parsed selector; an empty requirement list matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Requirement {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl Operator {
    fn parse(raw: &str) -> Result<Self, SelectorError> {
        match raw {
            "In" => Ok(Operator::In),
            "NotIn" => Ok(Operator::NotIn),
            "Exists" => Ok(Operator::Exists),
            "DoesNotExist" => Ok(Operator::DoesNotExist),
            other => Err(SelectorError::UnknownOperator(other.to_string())),
        }
    }
}

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.requirements.iter().all(|requirement| {
            let value = labels.get(&requirement.key);
            match requirement.operator {
                Operator::In => value
                    .map(|value| requirement.values.contains(value))
                    .unwrap_or(false),
                Operator::NotIn => value
                    .map(|value| !requirement.values.contains(value))
                    .unwrap_or(true),
                Operator::Exists => value.is_some(),
                Operator::DoesNotExist => value.is_none(),
            }
        })
    }
}

impl Display for Selector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> = self
            .requirements
            .iter()
            .map(|requirement| {
                let values: Vec<&str> = requirement.values.iter().map(String::as_str).collect();
                match requirement.operator {
                    Operator::In if values.len() == 1 => {
                        format!("{}={}", requirement.key, values[0])
                    }
                    Operator::In => format!("{} in ({})", requirement.key, values.join(",")),
                    Operator::NotIn => format!("{} notin ({})", requirement.key, values.join(",")),
                    Operator::Exists => requirement.key.clone(),
                    Operator::DoesNotExist => format!("!{}", requirement.key),
                }
            })
            .collect();
        write!(f, "{}", rendered.join(","))
    }
}

fn validate_key(key: &str) -> Result<(), SelectorError> {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };
    if let Some(prefix) = prefix {
        if prefix.is_empty()
            || prefix.len() > MAX_LABEL_PREFIX_LEN
            || !prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        {
            return Err(SelectorError::InvalidKey(key.to_string()));
        }
    }
    if name.is_empty() || !is_label_token(name) {
        return Err(SelectorError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<(), SelectorError> {
    if value.is_empty() || is_label_token(value) {
        Ok(())
    } else {
        Err(SelectorError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

fn is_label_token(token: &str) -> bool {
    let bytes = token.as_bytes();
    token.len() <= MAX_LABEL_NAME_LEN
        && bytes.first().is_some_and(u8::is_ascii_alphanumeric)
        && bytes.last().is_some_and(u8::is_ascii_alphanumeric)
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(*b, b'-' | b'_' | b'.'))
}

/// Errors raised while parsing a label selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    InvalidKey(String),
    InvalidValue { key: String, value: String },
    UnknownOperator(String),
    MissingValues { key: String, operator: String },
    UnexpectedValues { key: String, operator: String },
}

impl Display for SelectorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectorError::InvalidKey(key) => write!(f, "invalid label key {:?}", key),
            SelectorError::InvalidValue { key, value } => {
                write!(f, "invalid label value {:?} for key {:?}", value, key)
            }
            SelectorError::UnknownOperator(operator) => {
                write!(f, "{:?} is not a valid label selector operator", operator)
            }
            SelectorError::MissingValues { key, operator } => {
                write!(f, "operator {} on key {:?} requires values", operator, key)
            }
            SelectorError::UnexpectedValues { key, operator } => {
                write!(f, "operator {} on key {:?} must not have values", operator, key)
            }
        }
    }
}

impl Error for SelectorError {}
