// Copyright 2024 The Kubernetes Authors.
// Licensed under the Apache License, Version 2.0

//! ShootTolerationRestriction admission controller.
//!
//! This admission controller merges the configured default tolerations into
//! every shoot and rejects shoots declaring tolerations that are neither a
//! default nor whitelisted.

use crate::admission::attributes::{get_shoot, get_shoot_mut};
use crate::admission::{
    is_shoot_request, read_plugin_config, AdmissionError, AdmissionResult, Attributes,
    FieldError, Handler, Interface, MutationInterface, Operation, PluginInstance, Plugins,
    ValidationInterface,
};
use crate::api::garden::{Toleration, SHOOTS_RESOURCE};
use crate::informers::SharedInformers;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::Arc;
use tracing::debug;

/// Plugin name for ShootTolerationRestriction admission controller.
pub const PLUGIN_NAME: &str = "ShootTolerationRestriction";

/// Register the ShootTolerationRestriction plugin.
pub fn register(plugins: &mut Plugins) {
    plugins.register(PLUGIN_NAME, new_plugin);
}

fn new_plugin(
    config: Option<&mut dyn Read>,
    _informers: &SharedInformers,
) -> AdmissionResult<PluginInstance> {
    let config: Configuration = read_plugin_config(PLUGIN_NAME, config)?;
    config.validate()?;
    Ok(PluginInstance::mutating_and_validating(Arc::new(
        ShootTolerationRestriction::with_config(config),
    )))
}

/// Configuration for the ShootTolerationRestriction plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    /// Tolerations added to every shoot that does not tolerate their key yet.
    #[serde(default)]
    pub defaults: Vec<Toleration>,
    /// Tolerations a shoot may declare beyond the defaults.
    #[serde(default)]
    pub whitelist: Vec<Toleration>,
}

impl Configuration {
    /// Rejects entries without a key and defaults repeating a key.
    pub fn validate(&self) -> AdmissionResult<()> {
        let lists = [("defaults", &self.defaults), ("whitelist", &self.whitelist)];
        for (list, tolerations) in lists {
            if let Some(index) = tolerations.iter().position(|t| t.key.is_empty()) {
                return Err(AdmissionError::configuration(format!(
                    "{}: {}[{}].key must not be empty",
                    PLUGIN_NAME, list, index
                )));
            }
        }
        let mut keys = HashSet::new();
        for toleration in &self.defaults {
            if !keys.insert(toleration.key.as_str()) {
                return Err(AdmissionError::configuration(format!(
                    "{}: default toleration key {:?} is listed twice",
                    PLUGIN_NAME, toleration.key
                )));
            }
        }
        Ok(())
    }

    /// Returns true if the toleration appears in the defaults or the whitelist.
    /// Entries without a value permit every value of their key.
    pub fn permits(&self, toleration: &Toleration) -> bool {
        self.defaults
            .iter()
            .chain(&self.whitelist)
            .any(|allowed| {
                allowed.key == toleration.key
                    && (allowed.value.is_none() || allowed.value == toleration.value)
            })
    }
}

/// Appends every default whose key is not tolerated yet. Returns the number of
/// tolerations added.
pub fn merge_defaults(tolerations: &mut Vec<Toleration>, defaults: &[Toleration]) -> usize {
    let present: HashSet<String> = tolerations.iter().map(|t| t.key.clone()).collect();
    let before = tolerations.len();
    tolerations.extend(
        defaults
            .iter()
            .filter(|t| !present.contains(&t.key))
            .cloned(),
    );
    tolerations.len() - before
}

/// Checks a toleration list against the configuration, collecting every
/// violation.
pub fn validate_tolerations(tolerations: &[Toleration], config: &Configuration) -> Vec<FieldError> {
    let mut errors = Vec::new();

    let mut occurrences: HashMap<&str, usize> = HashMap::new();
    for toleration in tolerations {
        *occurrences.entry(toleration.key.as_str()).or_default() += 1;
    }

    for (index, toleration) in tolerations.iter().enumerate() {
        let path = format!("spec.tolerations[{}]", index);
        if toleration.key.is_empty() {
            errors.push(FieldError::required(&format!("{}.key", path), ""));
            continue;
        }
        if occurrences[toleration.key.as_str()] > 1 {
            errors.push(FieldError::duplicate(&format!("{}.key", path), &toleration.key));
        }
        if !config.permits(toleration) {
            let detail = match &toleration.value {
                Some(value) => format!(
                    "toleration {}={} is not allowed by the whitelist",
                    toleration.key, value
                ),
                None => format!("toleration {} is not allowed by the whitelist", toleration.key),
            };
            errors.push(FieldError::forbidden(&path, &detail));
        }
    }
    errors
}

/// ShootTolerationRestriction plugin.
pub struct ShootTolerationRestriction {
    handler: Handler,
    config: Configuration,
}

impl ShootTolerationRestriction {
    pub fn new() -> Self {
        Self::with_config(Configuration::default())
    }

    pub fn with_config(config: Configuration) -> Self {
        Self {
            handler: Handler::new_create_update(),
            config,
        }
    }
}

impl Default for ShootTolerationRestriction {
    fn default() -> Self {
        Self::new()
    }
}

impl Interface for ShootTolerationRestriction {
    fn handles(&self, operation: Operation) -> bool {
        self.handler.handles(operation)
    }
}

impl MutationInterface for ShootTolerationRestriction {
    fn admit(&self, attributes: &mut dyn Attributes) -> AdmissionResult<()> {
        if !is_shoot_request(attributes) || self.config.defaults.is_empty() {
            return Ok(());
        }
        let shoot = get_shoot_mut(attributes)
            .ok_or_else(|| AdmissionError::bad_request("could not convert resource into Shoot object"))?;

        let added = merge_defaults(&mut shoot.spec.tolerations, &self.config.defaults);
        if added > 0 {
            debug!(shoot = %shoot.metadata.name, added, "added default tolerations");
        }
        Ok(())
    }
}

impl ValidationInterface for ShootTolerationRestriction {
    fn validate(&self, attributes: &dyn Attributes) -> AdmissionResult<()> {
        if !is_shoot_request(attributes) {
            return Ok(());
        }
        let shoot = get_shoot(attributes)
            .ok_or_else(|| AdmissionError::bad_request("could not convert resource into Shoot object"))?;

        let errors = validate_tolerations(&shoot.spec.tolerations, &self.config);
        if errors.is_empty() {
            return Ok(());
        }
        Err(AdmissionError::forbidden_all(
            &shoot.metadata.name,
            SHOOTS_RESOURCE,
            errors,
        ))
    }
}
