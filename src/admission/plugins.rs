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

//! Plugin registry for admission controllers.

use super::errors::{AdmissionError, AdmissionResult};
use super::interfaces::{Interface, MutationInterface, Operation, ValidationInterface};
use crate::informers::{SharedInformers, SyncState};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

/// Factory is a function that creates an admission plugin instance from its
/// optional configuration block and the shared informer caches.
pub type Factory = fn(
    config: Option<&mut dyn Read>,
    informers: &SharedInformers,
) -> AdmissionResult<PluginInstance>;

/// Capabilities is the subset of {mutate, validate} a plugin implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub mutate: bool,
    pub validate: bool,
}

/// PluginInstance is a constructed plugin together with its capability set.
/// The capabilities are fixed at construction, so the chain never has to
/// inspect a plugin's type at request time.
#[derive(Clone)]
pub struct PluginInstance {
    interface: Arc<dyn Interface>,
    mutator: Option<Arc<dyn MutationInterface>>,
    validator: Option<Arc<dyn ValidationInterface>>,
}

impl PluginInstance {
    /// A plugin that only validates.
    pub fn validating<P: ValidationInterface + 'static>(plugin: Arc<P>) -> Self {
        Self {
            interface: plugin.clone(),
            mutator: None,
            validator: Some(plugin),
        }
    }

    /// A plugin that mutates first and then validates the result.
    pub fn mutating_and_validating<P>(plugin: Arc<P>) -> Self
    where
        P: MutationInterface + ValidationInterface + 'static,
    {
        Self {
            interface: plugin.clone(),
            mutator: Some(plugin.clone()),
            validator: Some(plugin),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            mutate: self.mutator.is_some(),
            validate: self.validator.is_some(),
        }
    }

    pub fn handles(&self, operation: Operation) -> bool {
        self.interface.handles(operation)
    }

    pub fn sync_states(&self) -> Vec<SyncState> {
        self.interface.sync_states()
    }

    pub fn mutator(&self) -> Option<&Arc<dyn MutationInterface>> {
        self.mutator.as_ref()
    }

    pub fn validator(&self) -> Option<&Arc<dyn ValidationInterface>> {
        self.validator.as_ref()
    }
}

/// Plugins is a registry of admission plugin factories. It is filled once at
/// start-up and only read afterwards.
#[derive(Default)]
pub struct Plugins {
    registry: BTreeMap<String, Factory>,
}

impl Plugins {
    /// Create a new empty plugin registry.
    pub fn new() -> Self {
        Self {
            registry: BTreeMap::new(),
        }
    }

    /// Register a new admission plugin with the given name and factory.
    pub fn register(&mut self, name: &str, factory: Factory) {
        self.registry.insert(name.to_string(), factory);
    }

    /// Check if a plugin is registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.registry.contains_key(name)
    }

    /// Create a new instance of the named plugin.
    pub fn new_from_plugins(
        &self,
        name: &str,
        config: Option<&mut dyn Read>,
        informers: &SharedInformers,
    ) -> AdmissionResult<PluginInstance> {
        let factory = self
            .registry
            .get(name)
            .copied()
            .ok_or_else(|| AdmissionError::configuration(format!("unknown admission plugin: {}", name)))?;
        factory(config, informers)
    }
}

/// Decodes a plugin configuration block, falling back to the default
/// configuration when none is given.
pub fn read_plugin_config<C>(plugin: &str, config: Option<&mut dyn Read>) -> AdmissionResult<C>
where
    C: DeserializeOwned + Default,
{
    let Some(reader) = config else {
        return Ok(C::default());
    };
    let mut raw = String::new();
    reader
        .read_to_string(&mut raw)
        .map_err(|e| AdmissionError::configuration(format!("{}: reading configuration: {}", plugin, e)))?;
    if raw.trim().is_empty() {
        return Ok(C::default());
    }
    serde_yaml::from_str(&raw)
        .map_err(|e| AdmissionError::configuration(format!("{}: decoding configuration: {}", plugin, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{Attributes, Handler};
    use serde::Deserialize;

    struct TestPlugin {
        handler: Handler,
    }

    impl Interface for TestPlugin {
        fn handles(&self, operation: Operation) -> bool {
            self.handler.handles(operation)
        }
    }

    impl ValidationInterface for TestPlugin {
        fn validate(&self, _attributes: &dyn Attributes) -> AdmissionResult<()> {
            Ok(())
        }
    }

    fn test_factory(
        _config: Option<&mut dyn Read>,
        _informers: &SharedInformers,
    ) -> AdmissionResult<PluginInstance> {
        Ok(PluginInstance::validating(Arc::new(TestPlugin {
            handler: Handler::new_create_update(),
        })))
    }

    #[test]
    fn test_plugins_register() {
        let mut plugins = Plugins::new();
        plugins.register("TestPlugin", test_factory);

        assert!(plugins.is_registered("TestPlugin"));
        assert!(!plugins.is_registered("Unknown"));
    }

    #[test]
    fn test_plugins_new_from_plugins() {
        let mut plugins = Plugins::new();
        plugins.register("TestPlugin", test_factory);

        let plugin = plugins
            .new_from_plugins("TestPlugin", None, &SharedInformers::synced())
            .unwrap();
        assert!(plugin.handles(Operation::Create));
        assert!(plugin.handles(Operation::Update));
        assert!(!plugin.handles(Operation::Delete));
        assert_eq!(
            plugin.capabilities(),
            Capabilities {
                mutate: false,
                validate: true
            }
        );
        assert!(plugin.mutator().is_none());
    }

    #[test]
    fn test_plugins_unknown_plugin() {
        let plugins = Plugins::new();
        let result = plugins.new_from_plugins("Unknown", None, &SharedInformers::new());
        assert!(matches!(result, Err(AdmissionError::Configuration(_))));
    }

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct Sample {
        #[serde(default)]
        enabled: bool,
    }

    #[test]
    fn test_read_plugin_config() {
        let absent: Sample = read_plugin_config("Sample", None).unwrap();
        assert_eq!(absent, Sample::default());

        let mut raw: &[u8] = b"enabled: true\n";
        let parsed: Sample = read_plugin_config("Sample", Some(&mut raw)).unwrap();
        assert!(parsed.enabled);

        let mut broken: &[u8] = b"enabled: [\n";
        let err = read_plugin_config::<Sample>("Sample", Some(&mut broken)).unwrap_err();
        assert!(err.to_string().contains("Sample: decoding configuration"));
    }
}
