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

//! Admission plugins module.

pub mod shootdns;
pub mod shootquotavalidator;
pub mod shootresourcereservation;
pub mod shoottolerationrestriction;

use crate::admission::{
    AdmissionConfiguration, AdmissionResult, Chain, PluginSpec, Plugins, Stage,
};
use crate::informers::SharedInformers;
use std::collections::BTreeSet;

/// Name of the host-dispatched mutating webhook stage.
pub const MUTATING_ADMISSION_WEBHOOK: &str = "MutatingAdmissionWebhook";

/// Name of the host-dispatched validating webhook stage.
pub const VALIDATING_ADMISSION_WEBHOOK: &str = "ValidatingAdmissionWebhook";

/// All plugins in execution order.
///
/// New policy plugins are inserted before the webhook entries; webhook and
/// quota plugins must go at the end.
pub const ALL_PLUGINS: &[PluginSpec] = &[
    PluginSpec::new(shootdns::PLUGIN_NAME, Stage::Policy, true),
    PluginSpec::new(shoottolerationrestriction::PLUGIN_NAME, Stage::Policy, true),
    PluginSpec::new(shootresourcereservation::PLUGIN_NAME, Stage::Policy, true),
    // webhook and quota plugins must go at the end
    PluginSpec::new(MUTATING_ADMISSION_WEBHOOK, Stage::Webhook, false),
    PluginSpec::new(VALIDATING_ADMISSION_WEBHOOK, Stage::Webhook, false),
    PluginSpec::new(shootquotavalidator::PLUGIN_NAME, Stage::QuotaAccounting, true),
];

/// Returns the ordered plugin table.
pub fn all_plugins() -> &'static [PluginSpec] {
    ALL_PLUGINS
}

/// Returns the names of all known plugins in execution order.
pub fn plugin_names() -> Vec<&'static str> {
    ALL_PLUGINS.iter().map(|spec| spec.name).collect()
}

/// Returns the plugins that are enabled unless configuration disables them.
pub fn default_enabled_plugins() -> BTreeSet<&'static str> {
    ALL_PLUGINS
        .iter()
        .filter(|spec| spec.default_enabled)
        .map(|spec| spec.name)
        .collect()
}

/// Returns the known plugins that stay off unless configuration enables them.
pub fn default_off_plugins() -> BTreeSet<&'static str> {
    ALL_PLUGINS
        .iter()
        .filter(|spec| !spec.default_enabled)
        .map(|spec| spec.name)
        .collect()
}

/// Register all admission plugins implemented by this crate. The webhook
/// stages are dispatched by the host, which registers their factories itself.
pub fn register_all_admission_plugins(plugins: &mut Plugins) {
    shootdns::register(plugins);
    shoottolerationrestriction::register(plugins);
    shootresourcereservation::register(plugins);
    shootquotavalidator::register(plugins);
}

/// Builds the chain over [`ALL_PLUGINS`] with every plugin of this crate
/// registered. Extra factories, such as the webhook stages, can be added
/// through `extend`.
pub fn new_chain(
    config: &AdmissionConfiguration,
    informers: &SharedInformers,
    extend: impl FnOnce(&mut Plugins),
) -> AdmissionResult<Chain> {
    let mut plugins = Plugins::new();
    register_all_admission_plugins(&mut plugins);
    extend(&mut plugins);
    Chain::new(ALL_PLUGINS, &plugins, config, informers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{
        validate_order, AdmissionError, AttributesRecord, Decision, Operation,
    };
    use crate::api::core::{ObjectMeta, Secret};
    use crate::api::garden::{Dns, Shoot, Toleration};
    use std::time::Duration;
    use tokio::time::Instant;

    #[test]
    fn test_all_plugins_satisfy_ordering_rules() {
        assert!(validate_order(all_plugins()).is_ok());
        assert_eq!(
            all_plugins().last().map(|spec| spec.stage),
            Some(Stage::QuotaAccounting)
        );
    }

    #[test]
    fn test_webhooks_directly_precede_quota() {
        let stages: Vec<Stage> = all_plugins().iter().map(|spec| spec.stage).collect();
        let first_webhook = stages.iter().position(|s| *s == Stage::Webhook).unwrap();
        assert!(stages[first_webhook..]
            .iter()
            .all(|s| *s != Stage::Policy));
    }

    #[test]
    fn test_default_sets_partition_known_plugins() {
        let on = default_enabled_plugins();
        let off = default_off_plugins();
        assert!(on.is_disjoint(&off));
        assert_eq!(on.len() + off.len(), plugin_names().len());
        assert!(off.contains(MUTATING_ADMISSION_WEBHOOK));
        assert!(on.contains(shootquotavalidator::PLUGIN_NAME));
    }

    #[test]
    fn test_register_all_admission_plugins() {
        let mut plugins = Plugins::new();
        register_all_admission_plugins(&mut plugins);
        for name in default_enabled_plugins() {
            assert!(plugins.is_registered(name), "{} is not registered", name);
        }
        assert!(!plugins.is_registered(VALIDATING_ADMISSION_WEBHOOK));
    }

    #[test]
    fn test_enabling_unregistered_webhook_is_configuration_defect() {
        let config = AdmissionConfiguration::from_yaml("enablePlugins: [MutatingAdmissionWebhook]\n")
            .unwrap();
        let result = new_chain(&config, &SharedInformers::synced(), |_| {});
        assert!(matches!(result, Err(AdmissionError::Configuration(_))));
    }

    #[test]
    fn test_disabled_plugin_configuration_is_checked() {
        let config = AdmissionConfiguration::from_yaml(
            "disablePlugins: [ShootResourceReservation]\nplugins:\n- name: ShootResourceReservation\n  configuration:\n    useGKEFormula: true\n    selector:\n      matchExpressions:\n      - {key: tier, operator: In}\n",
        )
        .unwrap();
        let result = new_chain(&config, &SharedInformers::synced(), |_| {});
        let err = result.err().unwrap();
        assert!(matches!(err, AdmissionError::Configuration(_)));
        assert!(err.to_string().contains(shootresourcereservation::PLUGIN_NAME));
    }

    #[test]
    fn test_disabled_plugin_with_valid_configuration_stays_out() {
        let config = AdmissionConfiguration::from_yaml(
            "disablePlugins: [ShootResourceReservation]\nplugins:\n- name: ShootResourceReservation\n  configuration:\n    useGKEFormula: true\n",
        )
        .unwrap();
        let chain = new_chain(&config, &SharedInformers::synced(), |_| {}).unwrap();
        assert!(!chain
            .plugin_names()
            .contains(&shootresourcereservation::PLUGIN_NAME));
    }

    #[test]
    fn test_default_chain_order() {
        let chain = new_chain(
            &AdmissionConfiguration::default(),
            &SharedInformers::synced(),
            |_| {},
        )
        .unwrap();
        assert_eq!(
            chain.plugin_names(),
            vec![
                shootdns::PLUGIN_NAME,
                shoottolerationrestriction::PLUGIN_NAME,
                shootresourcereservation::PLUGIN_NAME,
                shootquotavalidator::PLUGIN_NAME,
            ]
        );
    }

    fn default_domain_secret() -> Secret {
        let mut secret = Secret::new("garden", "default-domain-example");
        secret.metadata = ObjectMeta::new("garden", "default-domain-example")
            .with_label(shootdns::ROLE_LABEL, shootdns::ROLE_DEFAULT_DOMAIN)
            .with_annotation(shootdns::DOMAIN_ANNOTATION, "example.com")
            .with_annotation(shootdns::PROVIDER_ANNOTATION, "aws-route53")
            .with_annotation(shootdns::ZONE_ANNOTATION, "Z1");
        secret
    }

    #[tokio::test]
    async fn test_full_chain_defaults_and_allows() {
        let informers = SharedInformers::synced();
        informers.secrets.replace(vec![default_domain_secret()]);
        let config = AdmissionConfiguration::from_yaml(
            "disablePlugins: [ShootQuotaValidator]\nplugins:\n- name: ShootTolerationRestriction\n  configuration:\n    defaults: [{key: foo}]\n    whitelist: [{key: bar, value: baz}]\n",
        )
        .unwrap();
        let chain = new_chain(&config, &informers, |_| {}).unwrap();

        let mut shoot = Shoot::new("garden-dev", "crazy-botany");
        shoot.spec.tolerations = vec![Toleration::with_value("bar", "baz")];
        let request = AttributesRecord::new_shoot(Operation::Create, shoot, None);

        let response = chain
            .admit(request, Instant::now() + Duration::from_secs(5))
            .await;
        assert!(response.is_allowed(), "{:?}", response.error());

        let admitted = response.attributes.get_shoot().unwrap();
        assert_eq!(
            admitted.spec.dns,
            Some(Dns {
                provider: Some("aws-route53".to_string()),
                domain: Some("crazy-botany.dev.example.com".to_string()),
                hosted_zone_id: Some("Z1".to_string()),
            })
        );
        assert_eq!(
            admitted.spec.tolerations,
            vec![Toleration::with_value("bar", "baz"), Toleration::new("foo")]
        );
    }

    #[tokio::test]
    async fn test_full_chain_denies_zone_mismatch() {
        let informers = SharedInformers::synced();
        informers.secrets.replace(vec![default_domain_secret()]);
        let chain = new_chain(&AdmissionConfiguration::default(), &informers, |_| {}).unwrap();

        let mut shoot = Shoot::new("garden-dev", "s");
        shoot.spec.dns = Some(Dns {
            provider: Some("aws-route53".to_string()),
            domain: Some("s.dev.example.com".to_string()),
            hosted_zone_id: Some("Z9".to_string()),
        });
        let request = AttributesRecord::new_shoot(Operation::Create, shoot, None);

        let response = chain
            .admit(request, Instant::now() + Duration::from_secs(5))
            .await;
        match response.decision {
            Decision::Deny(err) => assert!(err.to_string().contains("Z9")),
            other => panic!("expected deny, got {:?}", other),
        }
    }
}
