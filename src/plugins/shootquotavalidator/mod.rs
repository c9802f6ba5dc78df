// Copyright 2024 The Kubernetes Authors.
// Licensed under the Apache License, Version 2.0

//! ShootQuotaValidator admission controller.
//!
//! Accounts the capacity a shoot may provision against the quotas referenced
//! by its secret binding. Capacity is the maximum size of every worker pool
//! times the machine's declared CPU and memory. Must run last in the chain.

use crate::admission::attributes::{get_old_shoot, get_shoot};
use crate::admission::{
    is_shoot_request, AdmissionError, AdmissionResult, Attributes, FieldError, Handler,
    Interface, Operation, PluginInstance, Plugins, ValidationInterface,
};
use crate::api::core::{object_key, Quantity};
use crate::api::garden::{Quota, SecretBinding, Shoot, SHOOTS_RESOURCE};
use crate::informers::{QuotaLister, SecretBindingLister, SharedInformers, ShootLister, SyncState};
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, warn};

/// Plugin name for ShootQuotaValidator admission controller.
pub const PLUGIN_NAME: &str = "ShootQuotaValidator";

const METRIC_CPU: &str = "cpu";
const METRIC_MEMORY: &str = "memory";

/// Register the ShootQuotaValidator plugin.
pub fn register(plugins: &mut Plugins) {
    plugins.register(PLUGIN_NAME, new_plugin);
}

fn new_plugin(
    _config: Option<&mut dyn Read>,
    informers: &SharedInformers,
) -> AdmissionResult<PluginInstance> {
    Ok(PluginInstance::validating(Arc::new(ShootQuotaValidator::new(
        informers.secret_bindings.clone(),
        informers.quotas.clone(),
        informers.shoots.clone(),
    ))))
}

/// Demand is the capacity a shoot may provision at its maximum size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Demand {
    pub cpu_millis: i64,
    pub memory_bytes: i64,
}

impl Demand {
    fn plus(self, other: Demand) -> Demand {
        Demand {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
        }
    }

    /// Returns true if neither metric is larger than in `other`.
    pub fn fits_within(&self, other: &Demand) -> bool {
        self.cpu_millis <= other.cpu_millis && self.memory_bytes <= other.memory_bytes
    }

    fn metric(&self, name: &str) -> Option<i64> {
        match name {
            METRIC_CPU => Some(self.cpu_millis),
            METRIC_MEMORY => Some(self.memory_bytes),
            _ => None,
        }
    }
}

/// Computes the demand of a shoot. Workers without declared capacity demand
/// nothing.
pub fn shoot_demand(shoot: &Shoot) -> Result<Demand, FieldError> {
    let mut demand = Demand::default();
    for (index, worker) in shoot.spec.provider.workers.iter().enumerate() {
        let maximum = i64::from(worker.maximum.max(0));
        let parse = |field: &str, quantity: &Option<Quantity>, millis: bool| -> Result<i64, FieldError> {
            let Some(quantity) = quantity else {
                return Ok(0);
            };
            let value = if millis {
                quantity.milli_value()
            } else {
                quantity.value()
            };
            value.map(|v| v.saturating_mul(maximum)).map_err(|e| {
                FieldError::invalid(
                    &format!("spec.provider.workers[{}].machine.{}", index, field),
                    quantity.as_str(),
                    &e.to_string(),
                )
            })
        };
        demand = demand.plus(Demand {
            cpu_millis: parse(METRIC_CPU, &worker.machine.cpu, true)?,
            memory_bytes: parse(METRIC_MEMORY, &worker.machine.memory, false)?,
        });
    }
    Ok(demand)
}

/// Metrics of the quota the given usage exceeds.
pub fn exceeded_metrics(quota: &Quota, usage: &Demand) -> Vec<String> {
    let mut exceeded = Vec::new();
    for (metric, limit) in &quota.spec.metrics {
        let Some(used) = usage.metric(metric) else {
            debug!(quota = %quota.metadata.name, %metric, "quota metric is not accounted");
            continue;
        };
        let limit = if metric == METRIC_CPU {
            limit.milli_value()
        } else {
            limit.value()
        };
        match limit {
            Ok(limit) if used > limit => exceeded.push(metric.clone()),
            Ok(_) => {}
            Err(e) => warn!(
                quota = %object_key(&quota.metadata.namespace, &quota.metadata.name),
                %metric,
                error = %e,
                "ignoring malformed quota limit"
            ),
        }
    }
    exceeded
}

/// ShootQuotaValidator plugin.
pub struct ShootQuotaValidator {
    handler: Handler,
    bindings: Arc<dyn SecretBindingLister>,
    quotas: Arc<dyn QuotaLister>,
    shoots: Arc<dyn ShootLister>,
}

impl ShootQuotaValidator {
    pub fn new(
        bindings: Arc<dyn SecretBindingLister>,
        quotas: Arc<dyn QuotaLister>,
        shoots: Arc<dyn ShootLister>,
    ) -> Self {
        Self {
            handler: Handler::new_create_update(),
            bindings,
            quotas,
            shoots,
        }
    }

    fn ensure_ready(&self) -> AdmissionResult<()> {
        if self.sync_states().iter().all(SyncState::has_synced) {
            Ok(())
        } else {
            Err(AdmissionError::not_ready(PLUGIN_NAME))
        }
    }

    fn binding_of(&self, shoot: &Shoot) -> Option<SecretBinding> {
        let name = shoot.spec.secret_binding_name.as_deref()?;
        self.bindings.get(&shoot.metadata.namespace, name)
    }

    /// Demand of every other admitted shoot bound to the quota.
    fn usage_of_others(&self, subject: &Shoot, quota: &Quota) -> Demand {
        let namespace = &quota.metadata.namespace;
        let name = &quota.metadata.name;
        self.shoots
            .list()
            .iter()
            .filter(|other| {
                other.metadata.namespace != subject.metadata.namespace
                    || other.metadata.name != subject.metadata.name
            })
            .filter(|other| {
                self.binding_of(other)
                    .is_some_and(|binding| binding.references_quota(namespace, name))
            })
            .filter_map(|other| match shoot_demand(other) {
                Ok(demand) => Some(demand),
                Err(e) => {
                    warn!(
                        shoot = %object_key(&other.metadata.namespace, &other.metadata.name),
                        error = %e,
                        "ignoring shoot with malformed capacity"
                    );
                    None
                }
            })
            .fold(Demand::default(), Demand::plus)
    }
}

impl Interface for ShootQuotaValidator {
    fn handles(&self, operation: Operation) -> bool {
        self.handler.handles(operation)
    }

    fn sync_states(&self) -> Vec<SyncState> {
        vec![
            self.bindings.sync_state(),
            self.quotas.sync_state(),
            self.shoots.sync_state(),
        ]
    }
}

impl ValidationInterface for ShootQuotaValidator {
    fn validate(&self, attributes: &dyn Attributes) -> AdmissionResult<()> {
        if !is_shoot_request(attributes) {
            return Ok(());
        }
        self.ensure_ready()?;

        let shoot = get_shoot(attributes)
            .ok_or_else(|| AdmissionError::bad_request("could not convert resource into Shoot object"))?;
        let forbidden = |err| AdmissionError::forbidden(&shoot.metadata.name, SHOOTS_RESOURCE, err);

        let Some(binding_name) = shoot.spec.secret_binding_name.as_deref() else {
            return Ok(());
        };
        let binding = self
            .bindings
            .get(&shoot.metadata.namespace, binding_name)
            .ok_or_else(|| {
                AdmissionError::not_found(
                    "SecretBinding",
                    object_key(&shoot.metadata.namespace, binding_name),
                )
            })?;
        if binding.quotas.is_empty() {
            return Ok(());
        }

        let demand = shoot_demand(shoot).map_err(forbidden)?;
        if attributes.get_operation() == Operation::Update {
            let old_demand = get_old_shoot(attributes).and_then(|old| shoot_demand(old).ok());
            if old_demand.is_some_and(|old| demand.fits_within(&old)) {
                debug!(shoot = %shoot.metadata.name, "demand did not grow, skipping quota check");
                return Ok(());
            }
        }

        for reference in &binding.quotas {
            let namespace = binding.quota_namespace(reference);
            let quota = self
                .quotas
                .get(namespace, &reference.name)
                .ok_or_else(|| AdmissionError::not_found("Quota", object_key(namespace, &reference.name)))?;

            let usage = self.usage_of_others(shoot, &quota).plus(demand);
            let exceeded = exceeded_metrics(&quota, &usage);
            if !exceeded.is_empty() {
                return Err(forbidden(FieldError::forbidden(
                    "spec.provider.workers",
                    &format!(
                        "quota limits exceeded. Unable to allocate further {} (quota {})",
                        exceeded.join(", "),
                        object_key(namespace, &reference.name)
                    ),
                )));
            }
        }
        Ok(())
    }
}
