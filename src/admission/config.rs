// Copyright 2024 The Kubernetes Authors.
// Licensed under the Apache License, Version 2.0

//! Static admission configuration, loaded once at start-up.

use super::errors::{AdmissionError, AdmissionResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Read;

/// PluginConfiguration is the configuration block of a single plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfiguration {
    pub name: String,
    #[serde(default)]
    pub configuration: Option<serde_yaml::Value>,
}

/// AdmissionConfiguration selects the enabled plugins and carries their
/// configuration blocks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionConfiguration {
    /// Plugins to enable on top of the default-enabled set.
    #[serde(default)]
    pub enable_plugins: Vec<String>,
    /// Plugins to remove from the enabled set. Wins over `enable_plugins`.
    #[serde(default)]
    pub disable_plugins: Vec<String>,
    #[serde(default)]
    pub plugins: Vec<PluginConfiguration>,
}

impl AdmissionConfiguration {
    pub fn from_yaml(raw: &str) -> AdmissionResult<Self> {
        serde_yaml::from_str(raw).map_err(|e| {
            AdmissionError::configuration(format!("decoding admission configuration: {}", e))
        })
    }

    pub fn from_reader(reader: impl Read) -> AdmissionResult<Self> {
        serde_yaml::from_reader(reader).map_err(|e| {
            AdmissionError::configuration(format!("decoding admission configuration: {}", e))
        })
    }

    /// Resolves the enabled set: `defaults ∪ enable_plugins − disable_plugins`.
    /// Every name must be one of `known`.
    pub fn enabled_plugins(
        &self,
        known: &[&str],
        defaults: &BTreeSet<&str>,
    ) -> AdmissionResult<BTreeSet<String>> {
        let configured = self
            .enable_plugins
            .iter()
            .chain(&self.disable_plugins)
            .chain(self.plugins.iter().map(|p| &p.name));
        for name in configured {
            if !known.contains(&name.as_str()) {
                return Err(AdmissionError::configuration(format!(
                    "unknown admission plugin: {}",
                    name
                )));
            }
        }

        let mut enabled: BTreeSet<String> = defaults.iter().map(|s| s.to_string()).collect();
        enabled.extend(self.enable_plugins.iter().cloned());
        for name in &self.disable_plugins {
            enabled.remove(name);
        }
        Ok(enabled)
    }

    /// Returns the plugin's configuration block re-encoded as YAML, or `None`
    /// when the plugin has no block.
    pub fn plugin_config(&self, name: &str) -> AdmissionResult<Option<Vec<u8>>> {
        let mut blocks = self.plugins.iter().filter(|p| p.name == name);
        let block = match (blocks.next(), blocks.next()) {
            (None, _) => return Ok(None),
            (Some(_), Some(_)) => {
                return Err(AdmissionError::configuration(format!(
                    "plugin {} is configured more than once",
                    name
                )))
            }
            (Some(block), None) => block,
        };
        let Some(value) = &block.configuration else {
            return Ok(None);
        };
        serde_yaml::to_string(value)
            .map(|raw| Some(raw.into_bytes()))
            .map_err(|e| {
                AdmissionError::configuration(format!("encoding configuration of {}: {}", name, e))
            })
    }
}
