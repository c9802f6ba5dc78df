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

//! Admission controller interfaces and types.
//!
//! This module provides the traits admission plugins implement, the request
//! record they operate on, the plugin registry and the chain that runs them.

pub mod attributes;
pub mod chain;
pub mod config;
pub mod errors;
mod handler;
mod interfaces;
mod plugins;

pub use attributes::{Attributes, AttributesRecord};
pub use chain::{validate_order, AdmissionResponse, Chain, Decision, PluginSpec, Stage};
pub use config::{AdmissionConfiguration, PluginConfiguration};
pub use errors::{AdmissionError, AdmissionResult, FieldError, FieldErrorType, ForbiddenError};
pub use handler::{is_shoot_request, Handler};
pub use interfaces::{Interface, MutationInterface, Operation, ValidationInterface};
pub use plugins::{read_plugin_config, Capabilities, Factory, PluginInstance, Plugins};
