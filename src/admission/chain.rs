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

//! Admission chain orchestrator.
//!
//! A [`Chain`] is built once at start-up from the ordered plugin table, the
//! plugin registry and the static configuration. For every request it runs
//! the enabled plugins in table order: first the plugin's mutation, then its
//! validation against the mutated object. The first failure stops the chain.

use super::attributes::{Attributes, AttributesRecord};
use super::config::AdmissionConfiguration;
use super::errors::{AdmissionError, AdmissionResult};
use super::plugins::{PluginInstance, Plugins};
use crate::api::core::ApiObject;
use crate::informers::SharedInformers;
use std::collections::{BTreeSet, HashSet};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

/// Stage places a plugin in one of the ordered sections of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Regular policy plugins.
    Policy,
    /// Plugins dispatching to admission webhooks.
    Webhook,
    /// Plugins accounting the request against quotas.
    QuotaAccounting,
}

/// PluginSpec is one row of the ordered plugin table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginSpec {
    pub name: &'static str,
    pub stage: Stage,
    pub default_enabled: bool,
}

impl PluginSpec {
    pub const fn new(name: &'static str, stage: Stage, default_enabled: bool) -> Self {
        Self {
            name,
            stage,
            default_enabled,
        }
    }
}

/// Checks the ordering rules of a plugin table. Names are unique, webhook
/// plugins come after every policy plugin and a non-empty table ends in
/// quota accounting.
pub fn validate_order(order: &[PluginSpec]) -> AdmissionResult<()> {
    let mut seen = HashSet::new();
    let mut previous = Stage::Policy;
    for spec in order {
        if !seen.insert(spec.name) {
            return Err(AdmissionError::configuration(format!(
                "admission plugin {} is listed more than once",
                spec.name
            )));
        }
        let misplaced = match spec.stage {
            Stage::Policy => previous != Stage::Policy,
            Stage::Webhook => previous == Stage::QuotaAccounting,
            Stage::QuotaAccounting => false,
        };
        if misplaced {
            return Err(AdmissionError::configuration(format!(
                "admission plugin {} ({:?}) must not follow {:?} plugins",
                spec.name, spec.stage, previous
            )));
        }
        previous = spec.stage;
    }
    match order.last() {
        Some(last) if last.stage != Stage::QuotaAccounting => {
            Err(AdmissionError::configuration(format!(
                "admission plugin order must end in quota accounting, found {} ({:?})",
                last.name, last.stage
            )))
        }
        _ => Ok(()),
    }
}

/// Decision is the outcome of running the chain.
#[derive(Debug)]
pub enum Decision {
    /// Every plugin admitted the request.
    Allow,
    /// A plugin rejected the request on policy grounds.
    Deny(AdmissionError),
    /// The request could not be decided; see [`AdmissionError::is_retryable`].
    Error(AdmissionError),
}

/// AdmissionResponse carries the decision together with the request as the
/// chain left it. On denial the object reflects the mutations of the plugins
/// that ran before the rejecting one; it must not be persisted.
pub struct AdmissionResponse {
    pub attributes: AttributesRecord,
    pub decision: Decision,
}

impl AdmissionResponse {
    pub fn is_allowed(&self) -> bool {
        matches!(self.decision, Decision::Allow)
    }

    /// Returns true if the request should be retried unchanged.
    pub fn is_retryable(&self) -> bool {
        match &self.decision {
            Decision::Error(err) => err.is_retryable(),
            _ => false,
        }
    }

    pub fn error(&self) -> Option<&AdmissionError> {
        match &self.decision {
            Decision::Allow => None,
            Decision::Deny(err) | Decision::Error(err) => Some(err),
        }
    }

    /// Hands out the mutated object for persistence. `None` unless allowed.
    pub fn into_allowed_object(self) -> Option<Box<dyn ApiObject>> {
        match self.decision {
            Decision::Allow => self.attributes.into_object(),
            _ => None,
        }
    }
}

struct ChainEntry {
    name: &'static str,
    plugin: PluginInstance,
}

/// Chain runs the enabled admission plugins in order.
pub struct Chain {
    entries: Vec<ChainEntry>,
}

impl Chain {
    /// Builds the chain from an ordered plugin table. Ordering violations,
    /// unknown or unregistered plugins and malformed plugin configuration,
    /// including that of disabled plugins, are reported here before any
    /// request is served.
    pub fn new(
        order: &[PluginSpec],
        registry: &Plugins,
        config: &AdmissionConfiguration,
        informers: &SharedInformers,
    ) -> AdmissionResult<Self> {
        validate_order(order)?;

        let known: Vec<&str> = order.iter().map(|spec| spec.name).collect();
        let defaults: BTreeSet<&str> = order
            .iter()
            .filter(|spec| spec.default_enabled)
            .map(|spec| spec.name)
            .collect();
        let enabled = config.enabled_plugins(&known, &defaults)?;

        let mut entries = Vec::new();
        for spec in order {
            let raw = config.plugin_config(spec.name)?;
            if !enabled.contains(spec.name) {
                // Configuration of a disabled plugin is still decoded so a
                // malformed block fails start-up.
                if raw.is_some() && registry.is_registered(spec.name) {
                    build_plugin(registry, spec.name, raw.as_deref(), informers)?;
                    debug!(plugin = spec.name, "checked configuration of disabled admission plugin");
                }
                continue;
            }
            if !registry.is_registered(spec.name) {
                return Err(AdmissionError::configuration(format!(
                    "admission plugin {} is enabled but not registered",
                    spec.name
                )));
            }
            let plugin = build_plugin(registry, spec.name, raw.as_deref(), informers)?;

            let capabilities = plugin.capabilities();
            if !capabilities.mutate && !capabilities.validate {
                return Err(AdmissionError::configuration(format!(
                    "admission plugin {} neither mutates nor validates",
                    spec.name
                )));
            }
            debug!(plugin = spec.name, ?capabilities, "enabled admission plugin");
            entries.push(ChainEntry {
                name: spec.name,
                plugin,
            });
        }

        Ok(Self { entries })
    }

    /// Names of the enabled plugins in execution order.
    pub fn plugin_names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|entry| entry.name).collect()
    }

    /// Runs the request through the chain. Waiting for unsynced caches is
    /// bounded by `deadline`; expiry yields a retryable error.
    #[instrument(
        skip_all,
        fields(
            operation = %attributes.get_operation(),
            namespace = attributes.get_namespace(),
            name = attributes.get_name(),
        )
    )]
    pub async fn admit(&self, mut attributes: AttributesRecord, deadline: Instant) -> AdmissionResponse {
        let operation = attributes.get_operation();
        for entry in &self.entries {
            if !entry.plugin.handles(operation) {
                continue;
            }

            if let Err(err) = wait_for_ready(entry, deadline).await {
                warn!(plugin = entry.name, error = %err, "admission plugin not ready");
                return AdmissionResponse {
                    attributes,
                    decision: Decision::Error(err),
                };
            }

            debug!(plugin = entry.name, "running admission plugin");
            let mut result = Ok(());
            if let Some(mutator) = entry.plugin.mutator() {
                result = mutator.admit(&mut attributes);
            }
            if result.is_ok() {
                if let Some(validator) = entry.plugin.validator() {
                    result = validator.validate(&attributes);
                }
            }

            if let Err(err) = result {
                let decision = if err.is_policy_violation() {
                    info!(plugin = entry.name, error = %err, "admission denied");
                    Decision::Deny(err)
                } else {
                    warn!(plugin = entry.name, error = %err, "admission failed");
                    Decision::Error(err)
                };
                return AdmissionResponse {
                    attributes,
                    decision,
                };
            }
        }

        AdmissionResponse {
            attributes,
            decision: Decision::Allow,
        }
    }
}

fn build_plugin(
    registry: &Plugins,
    name: &str,
    raw: Option<&[u8]>,
    informers: &SharedInformers,
) -> AdmissionResult<PluginInstance> {
    let mut reader = raw;
    registry.new_from_plugins(
        name,
        reader.as_mut().map(|r| r as &mut dyn std::io::Read),
        informers,
    )
}

async fn wait_for_ready(entry: &ChainEntry, deadline: Instant) -> AdmissionResult<()> {
    for state in entry.plugin.sync_states() {
        if state.has_synced() {
            continue;
        }
        match timeout_at(deadline, state.wait_synced()).await {
            Ok(true) => {}
            Ok(false) | Err(_) => return Err(AdmissionError::not_ready(entry.name)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{
        Handler, Interface, MutationInterface, Operation, ValidationInterface,
    };
    use crate::admission::errors::FieldError;
    use crate::api::core::Secret;
    use crate::api::garden::{Shoot, Toleration};
    use crate::informers::SyncState;
    use rstest::rstest;
    use std::io::Read;
    use std::sync::Arc;
    use std::time::Duration;

    /// Appends a toleration named after itself and optionally denies.
    struct Marker {
        handler: Handler,
        index: usize,
        deny: bool,
        sync: Option<SyncState>,
    }

    impl Interface for Marker {
        fn handles(&self, operation: Operation) -> bool {
            self.handler.handles(operation)
        }

        fn sync_states(&self) -> Vec<SyncState> {
            self.sync.iter().cloned().collect()
        }
    }

    impl MutationInterface for Marker {
        fn admit(&self, attributes: &mut dyn Attributes) -> AdmissionResult<()> {
            if let Some(shoot) = crate::admission::attributes::get_shoot_mut(attributes) {
                shoot
                    .spec
                    .tolerations
                    .push(Toleration::new(&format!("marker-{}", self.index)));
            }
            Ok(())
        }
    }

    impl ValidationInterface for Marker {
        fn validate(&self, attributes: &dyn Attributes) -> AdmissionResult<()> {
            if self.deny {
                return Err(AdmissionError::forbidden(
                    attributes.get_name(),
                    "shoots",
                    FieldError::forbidden("spec", "denied by marker"),
                ));
            }
            Ok(())
        }
    }

    fn marker(index: usize, deny: bool, sync: Option<SyncState>) -> PluginInstance {
        PluginInstance::mutating_and_validating(Arc::new(Marker {
            handler: Handler::new_create_update(),
            index,
            deny,
            sync,
        }))
    }

    fn first(_: Option<&mut dyn Read>, _: &SharedInformers) -> AdmissionResult<PluginInstance> {
        Ok(marker(0, false, None))
    }

    fn second_denies(_: Option<&mut dyn Read>, _: &SharedInformers) -> AdmissionResult<PluginInstance> {
        Ok(marker(1, true, None))
    }

    fn third(_: Option<&mut dyn Read>, _: &SharedInformers) -> AdmissionResult<PluginInstance> {
        Ok(marker(2, false, None))
    }

    fn waits_for_secrets(
        _: Option<&mut dyn Read>,
        informers: &SharedInformers,
    ) -> AdmissionResult<PluginInstance> {
        Ok(marker(0, false, Some(informers.secrets.sync_state())))
    }

    const ORDER: &[PluginSpec] = &[
        PluginSpec::new("First", Stage::Policy, true),
        PluginSpec::new("Second", Stage::Policy, true),
        PluginSpec::new("Third", Stage::QuotaAccounting, true),
    ];

    fn registry() -> Plugins {
        let mut plugins = Plugins::new();
        plugins.register("First", first);
        plugins.register("Second", second_denies);
        plugins.register("Third", third);
        plugins
    }

    fn request() -> AttributesRecord {
        AttributesRecord::new_shoot(Operation::Create, Shoot::new("garden-dev", "s"), None)
    }

    fn tolerations(response: &AdmissionResponse) -> Vec<String> {
        response
            .attributes
            .get_shoot()
            .unwrap()
            .spec
            .tolerations
            .iter()
            .map(|t| t.key.clone())
            .collect()
    }

    #[test]
    fn test_validate_order_accepts_policy_webhook_quota() {
        let order = [
            PluginSpec::new("A", Stage::Policy, true),
            PluginSpec::new("B", Stage::Webhook, false),
            PluginSpec::new("C", Stage::QuotaAccounting, true),
        ];
        assert!(validate_order(&order).is_ok());
    }

    #[test]
    fn test_validate_order_rejects_policy_after_quota() {
        let order = [
            PluginSpec::new("Quota", Stage::QuotaAccounting, true),
            PluginSpec::new("Late", Stage::Policy, true),
        ];
        let err = validate_order(&order).unwrap_err();
        assert!(matches!(err, AdmissionError::Configuration(_)));
        assert!(err.to_string().contains("Late"));
    }

    #[test]
    fn test_validate_order_rejects_webhook_after_quota() {
        let order = [
            PluginSpec::new("Quota", Stage::QuotaAccounting, true),
            PluginSpec::new("Hook", Stage::Webhook, true),
        ];
        assert!(validate_order(&order).is_err());
    }

    #[test]
    fn test_validate_order_rejects_policy_after_webhook() {
        let order = [
            PluginSpec::new("Hook", Stage::Webhook, true),
            PluginSpec::new("Late", Stage::Policy, true),
        ];
        assert!(validate_order(&order).is_err());
    }

    #[rstest]
    #[case::ends_in_webhook(&[
        PluginSpec::new("A", Stage::Policy, true),
        PluginSpec::new("Hook", Stage::Webhook, true),
    ])]
    #[case::ends_in_policy(&[PluginSpec::new("A", Stage::Policy, true)])]
    #[case::quota_not_last(&[
        PluginSpec::new("A", Stage::Policy, true),
        PluginSpec::new("Quota", Stage::QuotaAccounting, true),
        PluginSpec::new("B", Stage::Policy, true),
    ])]
    fn test_validate_order_rejects_missing_quota_tail(#[case] order: &[PluginSpec]) {
        let err = validate_order(order).unwrap_err();
        assert!(matches!(err, AdmissionError::Configuration(_)));
    }

    #[test]
    fn test_validate_order_accepts_empty_table() {
        assert!(validate_order(&[]).is_ok());
    }

    #[test]
    fn test_validate_order_rejects_duplicates() {
        let order = [
            PluginSpec::new("A", Stage::Policy, true),
            PluginSpec::new("A", Stage::Policy, true),
        ];
        assert!(validate_order(&order).is_err());
    }

    #[test]
    fn test_new_rejects_unregistered_plugin() {
        let order = [
            PluginSpec::new("Missing", Stage::Policy, true),
            PluginSpec::new("Third", Stage::QuotaAccounting, true),
        ];
        let mut plugins = Plugins::new();
        plugins.register("Third", third);
        let result = Chain::new(
            &order,
            &plugins,
            &AdmissionConfiguration::default(),
            &SharedInformers::synced(),
        );
        let err = result.err().unwrap();
        assert!(matches!(err, AdmissionError::Configuration(_)));
        assert!(err.to_string().contains("Missing is enabled but not registered"));
    }

    #[test]
    fn test_new_respects_enabled_set_and_order() {
        let config = AdmissionConfiguration::from_yaml("disablePlugins: [Second]\n").unwrap();
        let chain = Chain::new(ORDER, &registry(), &config, &SharedInformers::synced()).unwrap();
        assert_eq!(chain.plugin_names(), vec!["First", "Third"]);
    }

    #[tokio::test]
    async fn test_admit_short_circuits_on_deny() {
        let chain = Chain::new(
            ORDER,
            &registry(),
            &AdmissionConfiguration::default(),
            &SharedInformers::synced(),
        )
        .unwrap();

        let response = chain
            .admit(request(), Instant::now() + Duration::from_secs(5))
            .await;

        assert!(matches!(response.decision, Decision::Deny(_)));
        assert!(!response.is_retryable());
        // Mutations of plugins 1..=2 are retained, nothing from plugin 3.
        assert_eq!(tolerations(&response), vec!["marker-0", "marker-1"]);
        assert!(response.into_allowed_object().is_none());
    }

    #[tokio::test]
    async fn test_admit_allows_with_all_mutations() {
        let mut plugins = Plugins::new();
        plugins.register("First", first);
        plugins.register("Second", third);
        plugins.register("Third", third);
        let chain = Chain::new(
            ORDER,
            &plugins,
            &AdmissionConfiguration::default(),
            &SharedInformers::synced(),
        )
        .unwrap();

        let response = chain
            .admit(request(), Instant::now() + Duration::from_secs(5))
            .await;

        assert!(response.is_allowed());
        assert!(response.error().is_none());
        assert_eq!(tolerations(&response), vec!["marker-0", "marker-2", "marker-2"]);
        assert!(response.into_allowed_object().is_some());
    }

    #[tokio::test]
    async fn test_admit_skips_unhandled_operations() {
        let chain = Chain::new(
            ORDER,
            &registry(),
            &AdmissionConfiguration::default(),
            &SharedInformers::synced(),
        )
        .unwrap();
        let mut attributes = request();
        attributes.operation = Operation::Delete;

        let response = chain
            .admit(attributes, Instant::now() + Duration::from_secs(5))
            .await;
        assert!(response.is_allowed());
        assert!(tolerations(&response).is_empty());
    }

    #[tokio::test]
    async fn test_admit_times_out_waiting_for_cache() {
        let order = [
            PluginSpec::new("Waits", Stage::Policy, true),
            PluginSpec::new("Third", Stage::QuotaAccounting, true),
        ];
        let mut plugins = Plugins::new();
        plugins.register("Waits", waits_for_secrets);
        plugins.register("Third", third);
        let informers = SharedInformers::new();
        let chain = Chain::new(&order, &plugins, &AdmissionConfiguration::default(), &informers)
            .unwrap();

        let response = chain
            .admit(request(), Instant::now() + Duration::from_millis(20))
            .await;

        assert!(matches!(
            response.decision,
            Decision::Error(AdmissionError::NotReady { .. })
        ));
        assert!(response.is_retryable());
        assert!(tolerations(&response).is_empty());
    }

    #[tokio::test]
    async fn test_admit_waits_for_cache_sync() {
        let order = [
            PluginSpec::new("Waits", Stage::Policy, true),
            PluginSpec::new("Third", Stage::QuotaAccounting, true),
        ];
        let mut plugins = Plugins::new();
        plugins.register("Waits", waits_for_secrets);
        plugins.register("Third", third);
        let informers = SharedInformers::new();
        let chain = Chain::new(&order, &plugins, &AdmissionConfiguration::default(), &informers)
            .unwrap();

        let secrets = Arc::clone(&informers.secrets);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            secrets.replace(vec![Secret::new("garden", "any")]);
        });

        let response = chain
            .admit(request(), Instant::now() + Duration::from_secs(5))
            .await;
        assert!(response.is_allowed());
    }
}
