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

//! Cluster-management API types: shoots (the admitted subject), secret
//! bindings and quotas.

use super::core::{ApiObject, Object, ObjectMeta, Quantity, ResourceList};
use serde::{Deserialize, Serialize};
use std::any::Any;

/// API group of the cluster-management resources.
pub const GROUP_NAME: &str = "core.gardener.cloud";

/// API version served for the cluster-management resources.
pub const VERSION: &str = "v1beta1";

/// Resource name of shoots.
pub const SHOOTS_RESOURCE: &str = "shoots";

/// DNS provider value that opts a shoot out of managed DNS.
pub const DNS_UNMANAGED: &str = "unmanaged";

// ============================================================================
// Shoot
// ============================================================================

/// Shoot is the specification of a managed cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shoot {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ShootSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShootSpec {
    /// Name of the SecretBinding in the shoot's namespace holding the infrastructure credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_binding_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Dns>,
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
}

/// Dns holds the DNS settings of a shoot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dns {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(
        rename = "hostedZoneID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub hosted_zone_id: Option<String>,
}

impl Dns {
    /// Returns true if the shoot opted out of managed DNS.
    pub fn is_unmanaged(&self) -> bool {
        self.provider.as_deref() == Some(DNS_UNMANAGED)
    }
}

/// Provider holds the infrastructure settings of a shoot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    #[serde(rename = "type", default)]
    pub type_: String,
    #[serde(default)]
    pub workers: Vec<Worker>,
}

/// Worker is a node pool of a shoot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub name: String,
    pub machine: Machine,
    #[serde(default)]
    pub minimum: i32,
    #[serde(default)]
    pub maximum: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<WorkerKubernetes>,
}

impl Worker {
    /// Returns the kubelet reservation block, if the worker declares one.
    pub fn kube_reserved(&self) -> Option<&KubeReserved> {
        self.kubernetes
            .as_ref()?
            .kubelet
            .as_ref()?
            .kube_reserved
            .as_ref()
    }

    /// Returns the kubelet reservation block, creating empty parents on the way.
    pub fn kube_reserved_mut(&mut self) -> &mut KubeReserved {
        self.kubernetes
            .get_or_insert_with(Default::default)
            .kubelet
            .get_or_insert_with(Default::default)
            .kube_reserved
            .get_or_insert_with(Default::default)
    }
}

/// Machine declares the machine type of a worker pool and its capacity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Quantity>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerKubernetes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubelet: Option<KubeletConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeletConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_reserved: Option<KubeReserved>,
}

/// KubeReserved is the capacity the kubelet withholds from workloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeReserved {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_storage: Option<Quantity>,
}

/// Toleration lets a shoot be scheduled onto seeds carrying a matching taint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Toleration {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            value: None,
        }
    }

    pub fn with_value(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: Some(value.to_string()),
        }
    }
}

impl Shoot {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: ShootSpec::default(),
        }
    }
}

impl Object for Shoot {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

impl ApiObject for Shoot {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn kind(&self) -> &str {
        "Shoot"
    }
}

// ============================================================================
// SecretBinding
// ============================================================================

/// SecretReference points at a secret in a possibly different namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

/// ObjectReference points at an object by namespace and name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

/// SecretBinding binds a project to cloud-provider credentials and the quotas
/// limiting what may be provisioned with them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretBinding {
    pub metadata: ObjectMeta,
    pub secret_ref: SecretReference,
    #[serde(default)]
    pub quotas: Vec<ObjectReference>,
}

impl SecretBinding {
    /// Creates a binding to the secret `secret_name` in the binding's own namespace.
    pub fn new(namespace: &str, name: &str, secret_name: &str) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            secret_ref: SecretReference {
                name: secret_name.to_string(),
                namespace: namespace.to_string(),
            },
            quotas: Vec::new(),
        }
    }

    /// Namespace of the referenced secret, defaulting to the binding's namespace.
    pub fn secret_namespace(&self) -> &str {
        if self.secret_ref.namespace.is_empty() {
            &self.metadata.namespace
        } else {
            &self.secret_ref.namespace
        }
    }

    /// Namespace of a quota reference, defaulting to the binding's namespace.
    pub fn quota_namespace<'a>(&'a self, quota: &'a ObjectReference) -> &'a str {
        if quota.namespace.is_empty() {
            &self.metadata.namespace
        } else {
            &quota.namespace
        }
    }

    /// Returns true if the binding references the given quota.
    pub fn references_quota(&self, namespace: &str, name: &str) -> bool {
        self.quotas
            .iter()
            .any(|q| self.quota_namespace(q) == namespace && q.name == name)
    }
}

impl Object for SecretBinding {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

// ============================================================================
// Quota
// ============================================================================

/// Quota limits the resources that may be provisioned through a binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quota {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: QuotaSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSpec {
    #[serde(default)]
    pub metrics: ResourceList,
}

impl Object for Quota {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}
