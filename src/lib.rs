// Copyright 2024 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Admission plugins for managed-cluster (shoot) resources.
//!
//! The crate provides an ordered chain of admission plugins that default and
//! validate shoots before they are persisted: DNS and hosted-zone resolution,
//! toleration restriction, kubelet resource reservation and quota accounting.
//! External state is read from informer caches the host process keeps up to
//! date.

pub mod admission;
pub mod api;
pub mod informers;
pub mod plugins;

// Re-export commonly used types
pub use admission::{
    AdmissionConfiguration, AdmissionError, AdmissionResponse, AdmissionResult, Attributes,
    AttributesRecord, Chain, Decision, Handler, Interface, MutationInterface, Operation,
    ValidationInterface,
};
pub use api::garden::Shoot;
pub use informers::SharedInformers;
pub use plugins::{all_plugins, default_enabled_plugins, new_chain};
