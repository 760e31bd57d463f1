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

//! Reconciliation machinery: caches, indexes, queues, workers, and the
//! rollout state machine built on top of them.

pub mod claim;
pub mod error;
pub mod index;
pub mod informer;
pub mod ingress;
pub mod manager;
pub mod registry;
pub mod revision;
pub mod scale;
pub mod statefulrollout;
pub mod worker;
pub mod workqueue;
