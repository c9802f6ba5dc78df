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

//! ShootDNS admission controller.
//!
//! Defaults the DNS block of a shoot from the operator-provisioned default
//! domains and resolves the hosted zone the shoot's domain lives in. A hosted
//! zone requested explicitly must agree with the default domain covering the
//! shoot's domain. Domains no default domain covers are only accepted when the
//! project's credentials plausibly support the declared DNS provider.
//!
//! When several default domains cover a domain, the longest suffix wins and
//! equal suffixes are ordered by secret namespace/name.

use crate::admission::attributes::{get_shoot, get_shoot_mut};
use crate::admission::{
    is_shoot_request, AdmissionError, AdmissionResult, Attributes, FieldError, Handler,
    Interface, MutationInterface, Operation, PluginInstance, Plugins, ValidationInterface,
};
use crate::api::core::{object_key, Secret};
use crate::api::garden::{Dns, Shoot, SHOOTS_RESOURCE};
use crate::informers::{SecretBindingLister, SecretLister, SharedInformers, SyncState};
use std::cmp::Reverse;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, warn};

/// Plugin name for ShootDNS admission controller.
pub const PLUGIN_NAME: &str = "ShootDNS";

/// Label marking the role of an operator-provisioned secret.
pub const ROLE_LABEL: &str = "gardener.cloud/role";

/// Role of secrets describing a default domain.
pub const ROLE_DEFAULT_DOMAIN: &str = "default-domain";

/// Annotation carrying the domain suffix of a default domain.
pub const DOMAIN_ANNOTATION: &str = "dns.gardener.cloud/domain";

/// Annotation carrying the DNS provider type of a default domain.
pub const PROVIDER_ANNOTATION: &str = "dns.gardener.cloud/provider";

/// Annotation carrying the hosted zone identifier of a default domain.
pub const ZONE_ANNOTATION: &str = "dns.gardener.cloud/zone";

const PROJECT_NAMESPACE_PREFIX: &str = "garden-";

/// Register the ShootDNS plugin.
pub fn register(plugins: &mut Plugins) {
    plugins.register(PLUGIN_NAME, new_plugin);
}

fn new_plugin(
    _config: Option<&mut dyn Read>,
    informers: &SharedInformers,
) -> AdmissionResult<PluginInstance> {
    Ok(PluginInstance::mutating_and_validating(Arc::new(
        ShootDns::new(informers.secrets.clone(), informers.secret_bindings.clone()),
    )))
}

/// DefaultDomain is the record a default-domain secret describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultDomain {
    /// Domain suffix, without a leading dot.
    pub domain: String,
    pub provider: Option<String>,
    pub zone: Option<String>,
    /// `namespace/name` of the secret the record was read from.
    pub secret: String,
}

impl DefaultDomain {
    /// Reads the record from the secret's annotations. Returns `None` when the
    /// secret carries no usable domain.
    pub fn from_secret(secret: &Secret) -> Option<Self> {
        let annotations = &secret.metadata.annotations;
        let domain = annotations
            .get(DOMAIN_ANNOTATION)?
            .trim_start_matches('.')
            .to_string();
        if domain.is_empty() {
            return None;
        }
        let non_empty = |key: &str| annotations.get(key).filter(|v| !v.is_empty()).cloned();
        Some(Self {
            domain,
            provider: non_empty(PROVIDER_ANNOTATION),
            zone: non_empty(ZONE_ANNOTATION),
            secret: object_key(&secret.metadata.namespace, &secret.metadata.name),
        })
    }

    /// Returns true if `domain` is this default domain or one of its subdomains.
    pub fn covers(&self, domain: &str) -> bool {
        domain
            .strip_suffix(self.domain.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.ends_with('.'))
    }
}

/// Builds the default-domain records from a secret snapshot, skipping
/// malformed secrets.
pub fn collect_default_domains(secrets: &[Secret]) -> Vec<DefaultDomain> {
    secrets
        .iter()
        .filter_map(|secret| {
            let record = DefaultDomain::from_secret(secret);
            if record.is_none() {
                warn!(
                    secret = %object_key(&secret.metadata.namespace, &secret.metadata.name),
                    "default domain secret has no {} annotation, ignoring it",
                    DOMAIN_ANNOTATION
                );
            }
            record
        })
        .collect()
}

/// Returns the default domain covering `domain` with the longest suffix.
pub fn resolve_default_domain<'a>(
    domain: &str,
    candidates: &'a [DefaultDomain],
) -> Option<&'a DefaultDomain> {
    candidates
        .iter()
        .filter(|candidate| candidate.covers(domain))
        .min_by_key(|candidate| (Reverse(candidate.domain.len()), candidate.secret.as_str()))
}

/// Returns the default domain a shoot without a domain is placed under: the
/// first one ordered by domain and secret whose provider matches `provider`.
pub fn default_domain_for_provider<'a>(
    provider: Option<&str>,
    candidates: &'a [DefaultDomain],
) -> Option<&'a DefaultDomain> {
    candidates
        .iter()
        .filter(|candidate| provider.is_none() || candidate.provider.as_deref() == provider)
        .min_by_key(|candidate| (candidate.domain.as_str(), candidate.secret.as_str()))
}

/// Data keys the credentials of well-known DNS providers must carry.
pub fn required_credential_keys(provider: &str) -> Option<&'static [&'static str]> {
    let keys: &'static [&'static str] = match provider {
        "aws-route53" => &["accessKeyID", "secretAccessKey"],
        "azure-dns" => &["clientID", "clientSecret", "subscriptionID", "tenantID"],
        "google-clouddns" => &["serviceaccount.json"],
        "openstack-designate" => &[
            "username",
            "password",
            "tenantName",
            "authURL",
            "domainName",
        ],
        "alicloud-dns" => &["accessKeyID", "accessKeySecret"],
        _ => return None,
    };
    Some(keys)
}

/// Returns the credential keys `secret` lacks for `provider`. Unknown
/// providers only need some non-empty credential.
pub fn missing_credentials(provider: &str, secret: &Secret) -> Vec<String> {
    match required_credential_keys(provider) {
        Some(keys) => keys
            .iter()
            .filter(|key| !secret.has_non_empty(key))
            .map(|key| key.to_string())
            .collect(),
        None if secret.data.values().any(|v| !v.is_empty()) => Vec::new(),
        None => vec!["<any>".to_string()],
    }
}

/// Project name of a project namespace.
fn project_name(namespace: &str) -> &str {
    namespace
        .strip_prefix(PROJECT_NAMESPACE_PREFIX)
        .unwrap_or(namespace)
}

/// ShootDNS plugin.
pub struct ShootDns {
    handler: Handler,
    secrets: Arc<dyn SecretLister>,
    bindings: Arc<dyn SecretBindingLister>,
}

impl ShootDns {
    pub fn new(secrets: Arc<dyn SecretLister>, bindings: Arc<dyn SecretBindingLister>) -> Self {
        Self {
            handler: Handler::new_create_update(),
            secrets,
            bindings,
        }
    }

    fn ensure_ready(&self) -> AdmissionResult<()> {
        if self.sync_states().iter().all(SyncState::has_synced) {
            Ok(())
        } else {
            Err(AdmissionError::not_ready(PLUGIN_NAME))
        }
    }

    fn default_domains(&self) -> Vec<DefaultDomain> {
        collect_default_domains(&self.secrets.list_by_label(ROLE_LABEL, ROLE_DEFAULT_DOMAIN))
    }

    /// Checks that the project's credentials can serve a domain no default
    /// domain covers.
    fn verify_credentials(&self, shoot: &Shoot, dns: &Dns) -> AdmissionResult<()> {
        let forbidden = |err| AdmissionError::forbidden(&shoot.metadata.name, SHOOTS_RESOURCE, err);

        let Some(provider) = dns.provider.as_deref() else {
            return Err(forbidden(FieldError::required(
                "spec.dns.provider",
                "a DNS provider is required for domains outside the default domains",
            )));
        };
        let Some(binding_name) = shoot.spec.secret_binding_name.as_deref() else {
            return Err(forbidden(FieldError::required(
                "spec.secretBindingName",
                &format!("credentials for DNS provider {} are required", provider),
            )));
        };

        let namespace = &shoot.metadata.namespace;
        let binding = self
            .bindings
            .get(namespace, binding_name)
            .ok_or_else(|| AdmissionError::not_found("SecretBinding", object_key(namespace, binding_name)))?;
        let secret_name = &binding.secret_ref.name;
        let secret = self
            .secrets
            .get(binding.secret_namespace(), secret_name)
            .ok_or_else(|| {
                AdmissionError::not_found("Secret", object_key(binding.secret_namespace(), secret_name))
            })?;

        let missing = missing_credentials(provider, &secret);
        if !missing.is_empty() {
            return Err(forbidden(FieldError::invalid(
                "spec.dns.provider",
                provider,
                &format!(
                    "secret {} lacks credentials for the provider: {}",
                    object_key(binding.secret_namespace(), secret_name),
                    missing.join(", ")
                ),
            )));
        }
        Ok(())
    }
}

impl Interface for ShootDns {
    fn handles(&self, operation: Operation) -> bool {
        self.handler.handles(operation)
    }

    fn sync_states(&self) -> Vec<SyncState> {
        vec![self.secrets.sync_state(), self.bindings.sync_state()]
    }
}

impl MutationInterface for ShootDns {
    fn admit(&self, attributes: &mut dyn Attributes) -> AdmissionResult<()> {
        if !is_shoot_request(attributes) {
            return Ok(());
        }
        self.ensure_ready()?;

        let candidates = self.default_domains();
        let shoot = get_shoot_mut(attributes)
            .ok_or_else(|| AdmissionError::bad_request("could not convert resource into Shoot object"))?;
        let name = shoot.metadata.name.clone();
        let project = project_name(&shoot.metadata.namespace).to_string();

        let dns = shoot.spec.dns.get_or_insert_with(Dns::default);
        if dns.is_unmanaged() {
            return Ok(());
        }

        if dns.domain.is_none() {
            if let Some(default) = default_domain_for_provider(dns.provider.as_deref(), &candidates) {
                let domain = format!("{}.{}.{}", name, project, default.domain);
                debug!(shoot = %name, %domain, "defaulted shoot domain");
                dns.domain = Some(domain);
            }
        }

        let Some(domain) = dns.domain.as_deref() else {
            return Ok(());
        };
        if let Some(default) = resolve_default_domain(domain, &candidates) {
            if dns.provider.is_none() {
                dns.provider = default.provider.clone();
            }
            if dns.hosted_zone_id.is_none() {
                if let Some(zone) = &default.zone {
                    debug!(shoot = %name, %zone, secret = %default.secret, "defaulted hosted zone");
                    dns.hosted_zone_id = Some(zone.clone());
                }
            }
        }
        Ok(())
    }
}

impl ValidationInterface for ShootDns {
    fn validate(&self, attributes: &dyn Attributes) -> AdmissionResult<()> {
        if !is_shoot_request(attributes) {
            return Ok(());
        }
        self.ensure_ready()?;

        let shoot = get_shoot(attributes)
            .ok_or_else(|| AdmissionError::bad_request("could not convert resource into Shoot object"))?;
        let dns = shoot.spec.dns.clone().unwrap_or_default();
        if dns.is_unmanaged() {
            return Ok(());
        }

        let candidates = self.default_domains();
        let Some(domain) = dns.domain.as_deref() else {
            return Err(AdmissionError::forbidden(
                &shoot.metadata.name,
                SHOOTS_RESOURCE,
                FieldError::required("spec.dns.domain", "no default domain is available"),
            ));
        };

        let Some(default) = resolve_default_domain(domain, &candidates) else {
            if dns.hosted_zone_id.is_none() {
                return Err(AdmissionError::forbidden(
                    &shoot.metadata.name,
                    SHOOTS_RESOURCE,
                    FieldError::required(
                        "spec.dns.hostedZoneID",
                        &format!("no default domain matches {}, no hosted zone found", domain),
                    ),
                ));
            }
            return self.verify_credentials(shoot, &dns);
        };

        let mut errors = Vec::new();
        if let (Some(declared), Some(recorded)) = (dns.provider.as_deref(), default.provider.as_deref()) {
            if declared != recorded {
                errors.push(FieldError::invalid(
                    "spec.dns.provider",
                    declared,
                    &format!("default domain {} is served by provider {}", default.domain, recorded),
                ));
            }
        }
        match (dns.hosted_zone_id.as_deref(), default.zone.as_deref()) {
            (Some(requested), Some(recorded)) if requested != recorded => {
                errors.push(FieldError::invalid(
                    "spec.dns.hostedZoneID",
                    requested,
                    &format!(
                        "does not match hosted zone {} of default domain {}",
                        recorded, default.domain
                    ),
                ));
            }
            (None, _) => errors.push(FieldError::required(
                "spec.dns.hostedZoneID",
                &format!("default domain {} records no hosted zone", default.domain),
            )),
            _ => {}
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AdmissionError::forbidden_all(
                &shoot.metadata.name,
                SHOOTS_RESOURCE,
                errors,
            ))
        }
    }
}
