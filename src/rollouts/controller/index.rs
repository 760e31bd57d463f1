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

//! Named secondary indexes over an informer cache. Each index maps the keys
//! produced by an index function back to the objects that produced them.

use crate::rollouts::k8s::meta::ObjectKey;
use std::collections::{BTreeSet, HashMap};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

pub type IndexFunc<K> = Arc<dyn Fn(&K) -> Vec<String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    UnknownIndex(String),
    DuplicateIndex(String),
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::UnknownIndex(name) => write!(f, "index '{}' does not exist", name),
            IndexError::DuplicateIndex(name) => write!(f, "index '{}' already registered", name),
        }
    }
}

impl Error for IndexError {}

pub struct ObjectIndex<K> {
    funcs: HashMap<String, IndexFunc<K>>,
    entries: HashMap<String, HashMap<String, BTreeSet<ObjectKey>>>,
}

impl<K> Default for ObjectIndex<K> {
    fn default() -> Self {
        Self {
            funcs: HashMap::new(),
            entries: HashMap::new(),
        }
    }
}

impl<K> ObjectIndex<K> {
    /// Registers `func` under `name` and indexes the objects already cached.
    pub fn add_indexer<'a, I>(
        &mut self,
        name: &str,
        func: IndexFunc<K>,
        existing: I,
    ) -> Result<(), IndexError>
    where
        I: IntoIterator<Item = (&'a ObjectKey, &'a K)>,
        K: 'a,
    {
        if self.funcs.contains_key(name) {
            return Err(IndexError::DuplicateIndex(name.to_string()));
        }
        let mut entries: HashMap<String, BTreeSet<ObjectKey>> = HashMap::new();
        for (key, object) in existing {
            for index_key in func(object) {
                entries.entry(index_key).or_default().insert(key.clone());
            }
        }
        self.entries.insert(name.to_string(), entries);
        self.funcs.insert(name.to_string(), func);
        Ok(())
    }

    /// Replaces the index entries of `key` computed from `old` with those
    /// computed from `new`. `None` on either side means absent.
    pub fn update(&mut self, key: &ObjectKey, old: Option<&K>, new: Option<&K>) {
        for (name, func) in &self.funcs {
            let entries = self.entries.entry(name.clone()).or_default();
            if let Some(old) = old {
                for index_key in func(old) {
                    let now_empty = match entries.get_mut(&index_key) {
                        Some(members) => {
                            members.remove(key);
                            members.is_empty()
                        }
                        None => false,
                    };
                    if now_empty {
                        entries.remove(&index_key);
                    }
                }
            }
            if let Some(new) = new {
                for index_key in func(new) {
                    entries.entry(index_key).or_default().insert(key.clone());
                }
            }
        }
    }

    pub fn lookup(&self, name: &str, index_key: &str) -> Result<Vec<ObjectKey>, IndexError> {
        let entries = self
            .entries
            .get(name)
            .ok_or_else(|| IndexError::UnknownIndex(name.to_string()))?;
        Ok(entries
            .get(index_key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

}
