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

//! Admission error types.
//!
//! Errors fall into three classes: policy violations (`Forbidden`,
//! `BadRequest`, `NotFound`) deny the request, `NotReady` asks the client to
//! retry, and `Configuration` defects stop the chain from being built at all.

use std::fmt;
use thiserror::Error;

/// Result type for admission operations.
pub type AdmissionResult<T> = Result<T, AdmissionError>;

/// AdmissionError represents errors that can occur during admission.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// BadRequest indicates a malformed request.
    #[error("{0}")]
    BadRequest(String),

    /// Forbidden indicates the request violates a policy.
    #[error("{0}")]
    Forbidden(ForbiddenError),

    /// NotFound indicates a referenced resource was not found.
    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: String, name: String },

    /// NotReady indicates a cache the plugin depends on has not synced yet.
    #[error("{plugin}: not yet ready to handle request")]
    NotReady { plugin: String },

    /// Configuration indicates malformed static configuration.
    #[error("invalid admission configuration: {0}")]
    Configuration(String),
}

impl AdmissionError {
    /// Create a new BadRequest error.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        AdmissionError::BadRequest(msg.into())
    }

    /// Create a Forbidden error carrying a single field error.
    pub fn forbidden(
        name: impl Into<String>,
        resource: impl Into<String>,
        field_error: FieldError,
    ) -> Self {
        Self::forbidden_all(name, resource, vec![field_error])
    }

    /// Create a Forbidden error carrying every violation found.
    pub fn forbidden_all(
        name: impl Into<String>,
        resource: impl Into<String>,
        field_errors: Vec<FieldError>,
    ) -> Self {
        AdmissionError::Forbidden(ForbiddenError {
            name: name.into(),
            resource: resource.into(),
            field_errors,
        })
    }

    /// Create a NotFound error.
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        AdmissionError::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a NotReady error for the named plugin.
    pub fn not_ready(plugin: impl Into<String>) -> Self {
        AdmissionError::NotReady {
            plugin: plugin.into(),
        }
    }

    /// Create a Configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        AdmissionError::Configuration(msg.into())
    }

    /// Returns true if the client should retry the request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdmissionError::NotReady { .. })
    }

    /// Returns true if the error is a permanent, user-facing rejection.
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            AdmissionError::Forbidden(_)
                | AdmissionError::BadRequest(_)
                | AdmissionError::NotFound { .. }
        )
    }

    /// Field errors of a Forbidden error; empty for every other kind.
    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            AdmissionError::Forbidden(forbidden) => &forbidden.field_errors,
            _ => &[],
        }
    }
}

/// ForbiddenError represents a forbidden admission error with field details.
#[derive(Debug)]
pub struct ForbiddenError {
    pub name: String,
    pub resource: String,
    pub field_errors: Vec<FieldError>,
}

impl fmt::Display for ForbiddenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} \"{}\" is forbidden: ", self.resource, self.name)?;
        match self.field_errors.as_slice() {
            [single] => write!(f, "{}", single),
            errors => {
                let error_strings: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                write!(f, "[{}]", error_strings.join(", "))
            }
        }
    }
}

/// FieldError represents a field-level error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub error_type: FieldErrorType,
    pub value: String,
    pub detail: String,
}

impl FieldError {
    fn new(field: &str, error_type: FieldErrorType, value: &str, detail: &str) -> Self {
        Self {
            field: field.to_string(),
            error_type,
            value: value.to_string(),
            detail: detail.to_string(),
        }
    }

    pub fn required(field: &str, detail: &str) -> Self {
        Self::new(field, FieldErrorType::Required, "", detail)
    }

    pub fn invalid(field: &str, value: &str, detail: &str) -> Self {
        Self::new(field, FieldErrorType::Invalid, value, detail)
    }

    pub fn duplicate(field: &str, value: &str) -> Self {
        Self::new(field, FieldErrorType::Duplicate, value, "")
    }

    pub fn forbidden(field: &str, detail: &str) -> Self {
        Self::new(field, FieldErrorType::Forbidden, "", detail)
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_type {
            FieldErrorType::Required => write!(f, "{}: Required value", self.field)?,
            FieldErrorType::Invalid => {
                write!(f, "{}: Invalid value: \"{}\"", self.field, self.value)?
            }
            FieldErrorType::Duplicate => {
                write!(f, "{}: Duplicate value: \"{}\"", self.field, self.value)?
            }
            FieldErrorType::Forbidden => write!(f, "{}: Forbidden", self.field)?,
        }
        if !self.detail.is_empty() {
            write!(f, ": {}", self.detail)?;
        }
        Ok(())
    }
}

/// FieldErrorType represents the type of field error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldErrorType {
    /// Required indicates a required field is missing.
    Required,
    /// Invalid indicates an invalid value.
    Invalid,
    /// Duplicate indicates a value that must be unique appears more than once.
    Duplicate,
    /// Forbidden indicates a value the configured policy does not allow.
    Forbidden,
}
