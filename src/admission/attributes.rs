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

//! Admission attributes that describe an admission request.

use super::interfaces::Operation;
use crate::api::core::ApiObject;
use crate::api::garden::{Shoot, GROUP_NAME, SHOOTS_RESOURCE, VERSION};

/// GroupVersionResource identifies a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GroupVersionResource {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
        }
    }
}

/// GroupVersionKind identifies a kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }
}

/// Attributes is an interface used by AdmissionController to get information about a request
/// that is used to make an admission decision.
pub trait Attributes {
    /// Returns the name of the object as presented in the request.
    fn get_name(&self) -> &str;

    /// Returns the namespace associated with the request (if any).
    fn get_namespace(&self) -> &str;

    /// Returns the resource being requested.
    fn get_resource(&self) -> &GroupVersionResource;

    /// Returns the name of the subresource being requested.
    fn get_subresource(&self) -> &str;

    /// Returns the operation being performed.
    fn get_operation(&self) -> Operation;

    /// Returns the object from the incoming request.
    fn get_object(&self) -> Option<&dyn ApiObject>;

    /// Returns the object as a mutable reference.
    fn get_object_mut(&mut self) -> Option<&mut (dyn ApiObject + 'static)>;

    /// Returns the existing object (only populated for UPDATE and DELETE requests).
    fn get_old_object(&self) -> Option<&dyn ApiObject>;

    /// Returns the kind of object being manipulated.
    fn get_kind(&self) -> &GroupVersionKind;
}

/// Returns the shoot carried by the request, if the object is a shoot.
pub fn get_shoot(attributes: &dyn Attributes) -> Option<&Shoot> {
    attributes
        .get_object()
        .and_then(|obj| obj.as_any().downcast_ref::<Shoot>())
}

/// Returns a mutable reference to the shoot carried by the request.
pub fn get_shoot_mut(attributes: &mut dyn Attributes) -> Option<&mut Shoot> {
    attributes
        .get_object_mut()
        .and_then(|obj| obj.as_any_mut().downcast_mut::<Shoot>())
}

/// Returns the stored shoot an update replaces.
pub fn get_old_shoot(attributes: &dyn Attributes) -> Option<&Shoot> {
    attributes
        .get_old_object()
        .and_then(|obj| obj.as_any().downcast_ref::<Shoot>())
}

/// AttributesRecord is a concrete implementation of Attributes.
pub struct AttributesRecord {
    pub name: String,
    pub namespace: String,
    pub resource: GroupVersionResource,
    pub subresource: String,
    pub operation: Operation,
    pub object: Option<Box<dyn ApiObject>>,
    pub old_object: Option<Box<dyn ApiObject>>,
    pub kind: GroupVersionKind,
}

impl AttributesRecord {
    /// Create a new AttributesRecord for testing or general use.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        namespace: &str,
        resource: GroupVersionResource,
        subresource: &str,
        operation: Operation,
        object: Option<Box<dyn ApiObject>>,
        old_object: Option<Box<dyn ApiObject>>,
        kind: GroupVersionKind,
    ) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            resource,
            subresource: subresource.to_string(),
            operation,
            object,
            old_object,
            kind,
        }
    }

    /// Helper to create attributes for a Shoot resource.
    pub fn new_shoot(operation: Operation, shoot: Shoot, old_shoot: Option<Shoot>) -> Self {
        Self {
            name: shoot.metadata.name.clone(),
            namespace: shoot.metadata.namespace.clone(),
            resource: GroupVersionResource::new(GROUP_NAME, VERSION, SHOOTS_RESOURCE),
            subresource: String::new(),
            operation,
            object: Some(Box::new(shoot)),
            old_object: old_shoot.map(|s| Box::new(s) as Box<dyn ApiObject>),
            kind: GroupVersionKind::new(GROUP_NAME, VERSION, "Shoot"),
        }
    }

    /// Get the shoot from the object, if it is a shoot.
    pub fn get_shoot(&self) -> Option<&Shoot> {
        get_shoot(self)
    }

    /// Get a mutable reference to the shoot from the object.
    pub fn get_shoot_mut(&mut self) -> Option<&mut Shoot> {
        get_shoot_mut(self)
    }

    /// Consumes the record, returning the (possibly mutated) object.
    pub fn into_object(self) -> Option<Box<dyn ApiObject>> {
        self.object
    }
}

impl Attributes for AttributesRecord {
    fn get_name(&self) -> &str {
        &self.name
    }

    fn get_namespace(&self) -> &str {
        &self.namespace
    }

    fn get_resource(&self) -> &GroupVersionResource {
        &self.resource
    }

    fn get_subresource(&self) -> &str {
        &self.subresource
    }

    fn get_operation(&self) -> Operation {
        self.operation
    }

    fn get_object(&self) -> Option<&dyn ApiObject> {
        self.object.as_ref().map(|o| o.as_ref())
    }

    fn get_object_mut(&mut self) -> Option<&mut (dyn ApiObject + 'static)> {
        self.object.as_mut().map(|o| &mut **o)
    }

    fn get_old_object(&self) -> Option<&dyn ApiObject> {
        self.old_object.as_ref().map(|o| o.as_ref())
    }

    fn get_kind(&self) -> &GroupVersionKind {
        &self.kind
    }
}
