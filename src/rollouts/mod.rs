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

//! Reconciliation core for StatefulSet-backed Rollouts.
//!
//! Resources flow from the transport (`client`) into per-kind mirrors
//! (`controller::informer`), which feed secondary indexes and work queues.
//! Workers drain the queues and run the rollout state machine, which reads
//! from the mirrors and mutates the cluster through the transport.

pub mod client;
pub mod config;
pub mod controller;
pub mod k8s;
pub mod logger;
pub mod observability;
pub mod test_support;
pub mod util;
