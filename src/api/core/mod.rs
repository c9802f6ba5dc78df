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

//! Core API types shared by every admission plugin (object metadata, secrets,
//! label selectors and resource quantities).

mod resource;

pub use resource::{Quantity, QuantityError, ResourceList};

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use thiserror::Error;

/// ApiObject is a trait for API objects that can be used in admission.
pub trait ApiObject: Send + Sync {
    /// Returns the object as Any for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Returns the object as mutable Any for downcasting.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Returns the kind of this object.
    fn kind(&self) -> &str;
}

/// Object gives access to the metadata every stored object carries.
pub trait Object {
    fn metadata(&self) -> &ObjectMeta;

    /// Cache key in the form `namespace/name`, or `name` for cluster-scoped objects.
    fn key(&self) -> String {
        object_key(&self.metadata().namespace, &self.metadata().name)
    }
}

/// Builds the cache key for an object.
pub fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

// ============================================================================
// Metadata
// ============================================================================

/// ObjectMeta is the subset of object metadata the plugins read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }
}

// ============================================================================
// Secret
// ============================================================================

/// Secret holds credential material or operator-provisioned records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, Vec<u8>>,
}

impl Secret {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            data: BTreeMap::new(),
        }
    }

    pub fn with_data(mut self, key: &str, value: &str) -> Self {
        self.data.insert(key.to_string(), value.as_bytes().to_vec());
        self
    }

    /// Returns true if `key` is present with a non-empty value.
    pub fn has_non_empty(&self, key: &str) -> bool {
        self.data.get(key).is_some_and(|v| !v.is_empty())
    }
}

impl Object for Secret {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

// ============================================================================
// Label Selector
// ============================================================================

/// SelectorOperator is the relationship between a label key and its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// LabelSelectorRequirement is a single match expression of a selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

/// LabelSelector selects objects by their labels. The requirements are ANDed;
/// an empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

/// SelectorError describes a malformed label selector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("matchLabels: label key must not be empty")]
    EmptyLabelKey,
    #[error("matchExpressions[{index}].key: must not be empty")]
    EmptyExpressionKey { index: usize },
    #[error("matchExpressions[{index}].values: must be non-empty for operator {operator:?}")]
    MissingValues {
        index: usize,
        operator: SelectorOperator,
    },
    #[error("matchExpressions[{index}].values: must be empty for operator {operator:?}")]
    UnexpectedValues {
        index: usize,
        operator: SelectorOperator,
    },
}

impl LabelSelector {
    pub fn match_labels<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }

    /// Checks the selector is well formed.
    pub fn validate(&self) -> Result<(), SelectorError> {
        if self.match_labels.keys().any(|k| k.is_empty()) {
            return Err(SelectorError::EmptyLabelKey);
        }
        for (index, req) in self.match_expressions.iter().enumerate() {
            if req.key.is_empty() {
                return Err(SelectorError::EmptyExpressionKey { index });
            }
            match req.operator {
                SelectorOperator::In | SelectorOperator::NotIn if req.values.is_empty() => {
                    return Err(SelectorError::MissingValues {
                        index,
                        operator: req.operator,
                    });
                }
                SelectorOperator::Exists | SelectorOperator::DoesNotExist
                    if !req.values.is_empty() =>
                {
                    return Err(SelectorError::UnexpectedValues {
                        index,
                        operator: req.operator,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Returns true if the labels satisfy every requirement of the selector.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let labels_match = self
            .match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v));

        labels_match
            && self.match_expressions.iter().all(|req| {
                let value = labels.get(&req.key);
                match req.operator {
                    SelectorOperator::In => value.is_some_and(|v| req.values.contains(v)),
                    SelectorOperator::NotIn => !value.is_some_and(|v| req.values.contains(v)),
                    SelectorOperator::Exists => value.is_some(),
                    SelectorOperator::DoesNotExist => value.is_none(),
                }
            })
    }
}
