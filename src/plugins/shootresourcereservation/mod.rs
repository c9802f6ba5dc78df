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

//! ShootResourceReservation admission controller.
//!
//! Fills the kubelet reservation of every worker pool from the machine's
//! declared capacity, using the tiered reservation curve known from GKE.
//! Reservations set by the user are never overwritten. Explicit reservations
//! are validated against the declared capacity.

use crate::admission::attributes::{get_shoot, get_shoot_mut};
use crate::admission::{
    is_shoot_request, read_plugin_config, AdmissionError, AdmissionResult, Attributes,
    FieldError, Handler, Interface, MutationInterface, Operation, PluginInstance, Plugins,
    ValidationInterface,
};
use crate::api::core::{LabelSelector, Quantity, QuantityError};
use crate::api::garden::{KubeReserved, Shoot, Worker, SHOOTS_RESOURCE};
use crate::informers::SharedInformers;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::Arc;
use tracing::debug;

/// Plugin name for ShootResourceReservation admission controller.
pub const PLUGIN_NAME: &str = "ShootResourceReservation";

/// PID reservation applied alongside the formula.
pub const RESERVED_PID: &str = "20k";

const MI: i64 = 1024 * 1024;

/// (millicores in tier, reservation in basis points)
const CPU_TIERS: &[(i64, i64)] = &[(1000, 600), (1000, 100), (2000, 50), (i64::MAX, 25)];

/// (MiB in tier, reservation in percent)
const MEMORY_TIERS: &[(i64, i64)] = &[
    (4 * 1024, 25),
    (4 * 1024, 20),
    (8 * 1024, 10),
    (112 * 1024, 6),
    (i64::MAX, 2),
];

/// Reservation for machines with less than 1Gi of memory.
const SMALL_MACHINE_MEMORY_MIB: i64 = 255;

/// Register the ShootResourceReservation plugin.
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
        ShootResourceReservation::with_config(config),
    )))
}

/// Configuration for the ShootResourceReservation plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    #[serde(rename = "useGKEFormula", default)]
    pub use_gke_formula: bool,
    /// Restricts the shoots the formula applies to. Absent matches every shoot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

impl Configuration {
    pub fn validate(&self) -> AdmissionResult<()> {
        if let Some(selector) = &self.selector {
            selector.validate().map_err(|e| {
                AdmissionError::configuration(format!("{}: selector: {}", PLUGIN_NAME, e))
            })?;
        }
        Ok(())
    }

    /// Returns true if the formula applies to the shoot.
    pub fn applies_to(&self, shoot: &Shoot) -> bool {
        self.use_gke_formula
            && self
                .selector
                .as_ref()
                .map_or(true, |selector| selector.matches(&shoot.metadata.labels))
    }
}

/// Sums `amount` weighted per tier, divided by `scale`. Saturates at
/// `i64::MAX`.
fn tiered(amount: i64, tiers: &[(i64, i64)], scale: i128) -> i64 {
    let mut remaining = amount.max(0) as i128;
    let mut weighted: i128 = 0;
    for &(size, rate) in tiers {
        if remaining == 0 {
            break;
        }
        let portion = remaining.min(size as i128);
        weighted += portion * rate as i128;
        remaining -= portion;
    }
    i64::try_from(weighted / scale).unwrap_or(i64::MAX)
}

/// Reserved millicores for a machine with `capacity_millis` millicores.
pub fn reserved_cpu_millis(capacity_millis: i64) -> i64 {
    tiered(capacity_millis, CPU_TIERS, 10_000)
}

/// Reserved MiB for a machine with `capacity_bytes` of memory.
pub fn reserved_memory_mebibytes(capacity_bytes: i64) -> i64 {
    if capacity_bytes < 1024 * MI {
        return SMALL_MACHINE_MEMORY_MIB;
    }
    tiered(capacity_bytes / MI, MEMORY_TIERS, 100)
}

/// Computes the (cpu, memory) reservation for the given machine capacity.
pub fn calculate_reservation(
    cpu: &Quantity,
    memory: &Quantity,
) -> Result<(Quantity, Quantity), QuantityError> {
    let cpu = reserved_cpu_millis(cpu.milli_value()?);
    let memory = reserved_memory_mebibytes(memory.value()?);
    Ok((Quantity::from_millis(cpu), Quantity::from_mebibytes(memory)))
}

/// Fills the unset reservation fields of the worker. Returns false when the
/// worker declares no usable capacity.
fn reserve(worker: &mut Worker) -> bool {
    let (Some(cpu), Some(memory)) = (&worker.machine.cpu, &worker.machine.memory) else {
        return false;
    };
    let Ok((cpu, memory)) = calculate_reservation(cpu, memory) else {
        return false;
    };

    let complete = worker
        .kube_reserved()
        .is_some_and(|r| r.cpu.is_some() && r.memory.is_some() && r.pid.is_some());
    if complete {
        return true;
    }

    let reserved = worker.kube_reserved_mut();
    reserved.cpu.get_or_insert(cpu);
    reserved.memory.get_or_insert(memory);
    reserved.pid.get_or_insert_with(|| Quantity::new(RESERVED_PID));
    true
}

fn validate_worker(index: usize, worker: &Worker) -> Vec<FieldError> {
    let mut errors = Vec::new();
    let machine = format!("spec.provider.workers[{}].machine", index);
    let reserved_path = format!("spec.provider.workers[{}].kubernetes.kubelet.kubeReserved", index);

    let capacity = |field: &str, quantity: &Option<Quantity>, errors: &mut Vec<FieldError>| {
        let path = format!("{}.{}", machine, field);
        match quantity {
            None => {
                errors.push(FieldError::required(
                    &path,
                    "machine capacity is needed to reserve resources",
                ));
                None
            }
            Some(q) => match parse(field, q) {
                Ok(v) => Some(v),
                Err(e) => {
                    errors.push(FieldError::invalid(&path, q.as_str(), &e.to_string()));
                    None
                }
            },
        }
    };
    let cpu_capacity = capacity("cpu", &worker.machine.cpu, &mut errors);
    let memory_capacity = capacity("memory", &worker.machine.memory, &mut errors);

    let default = KubeReserved::default();
    let reserved = worker.kube_reserved().unwrap_or(&default);
    let fields = [
        ("cpu", &reserved.cpu, cpu_capacity),
        ("memory", &reserved.memory, memory_capacity),
        ("pid", &reserved.pid, None),
        ("ephemeralStorage", &reserved.ephemeral_storage, None),
    ];
    for (field, quantity, limit) in fields {
        let Some(quantity) = quantity else {
            continue;
        };
        let path = format!("{}.{}", reserved_path, field);
        match parse(field, quantity) {
            Err(e) => errors.push(FieldError::invalid(&path, quantity.as_str(), &e.to_string())),
            Ok(v) if v < 0 => {
                errors.push(FieldError::invalid(&path, quantity.as_str(), "must not be negative"))
            }
            Ok(v) if limit.is_some_and(|limit| v >= limit) => errors.push(FieldError::invalid(
                &path,
                quantity.as_str(),
                "must be less than the machine capacity",
            )),
            Ok(_) => {}
        }
    }
    errors
}

/// CPU in millicores, everything else in base units.
fn parse(field: &str, quantity: &Quantity) -> Result<i64, QuantityError> {
    if field == "cpu" {
        quantity.milli_value()
    } else {
        quantity.value()
    }
}

/// ShootResourceReservation plugin.
pub struct ShootResourceReservation {
    handler: Handler,
    config: Configuration,
}

impl ShootResourceReservation {
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

impl Default for ShootResourceReservation {
    fn default() -> Self {
        Self::new()
    }
}

impl Interface for ShootResourceReservation {
    fn handles(&self, operation: Operation) -> bool {
        self.handler.handles(operation)
    }
}

impl MutationInterface for ShootResourceReservation {
    fn admit(&self, attributes: &mut dyn Attributes) -> AdmissionResult<()> {
        if !is_shoot_request(attributes) || !self.config.use_gke_formula {
            return Ok(());
        }
        let shoot = get_shoot_mut(attributes)
            .ok_or_else(|| AdmissionError::bad_request("could not convert resource into Shoot object"))?;
        if !self.config.applies_to(shoot) {
            return Ok(());
        }

        for worker in &mut shoot.spec.provider.workers {
            if !reserve(worker) {
                debug!(worker = %worker.name, "no machine capacity declared, skipping reservation");
            }
        }
        Ok(())
    }
}

impl ValidationInterface for ShootResourceReservation {
    fn validate(&self, attributes: &dyn Attributes) -> AdmissionResult<()> {
        if !is_shoot_request(attributes) || !self.config.use_gke_formula {
            return Ok(());
        }
        let shoot = get_shoot(attributes)
            .ok_or_else(|| AdmissionError::bad_request("could not convert resource into Shoot object"))?;
        if !self.config.applies_to(shoot) {
            return Ok(());
        }

        let errors: Vec<FieldError> = shoot
            .spec
            .provider
            .workers
            .iter()
            .enumerate()
            .flat_map(|(index, worker)| validate_worker(index, worker))
            .collect();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AttributesRecord, FieldErrorType};
    use crate::api::garden::Machine;
    use rstest::rstest;
    use serde_json::json;

    fn worker(name: &str, cpu: Option<&str>, memory: Option<&str>) -> Worker {
        Worker {
            name: name.to_string(),
            machine: Machine {
                type_: "m5.large".to_string(),
                cpu: cpu.map(Quantity::from),
                memory: memory.map(Quantity::from),
            },
            minimum: 1,
            maximum: 3,
            kubernetes: None,
        }
    }

    fn shoot(workers: Vec<Worker>) -> Shoot {
        let mut shoot = Shoot::new("garden-dev", "crazy-botany");
        shoot.spec.provider.workers = workers;
        shoot
    }

    fn enabled() -> ShootResourceReservation {
        ShootResourceReservation::with_config(Configuration {
            use_gke_formula: true,
            selector: None,
        })
    }

    fn run(plugin: &ShootResourceReservation, shoot: Shoot) -> (Shoot, AdmissionResult<()>) {
        let mut attrs = AttributesRecord::new_shoot(Operation::Create, shoot, None);
        let result = plugin
            .admit(&mut attrs)
            .and_then(|_| plugin.validate(&attrs));
        (attrs.get_shoot().cloned().unwrap(), result)
    }

    #[rstest]
    #[case(1000, 60)]
    #[case(2000, 70)]
    #[case(4000, 80)]
    #[case(8000, 90)]
    #[case(64000, 230)]
    #[case(500, 30)]
    #[case(9_000_000_000_000_000_000, 22_500_000_000_000_070)]
    fn test_reserved_cpu(#[case] capacity: i64, #[case] expected: i64) {
        assert_eq!(reserved_cpu_millis(capacity), expected);
    }

    #[rstest]
    #[case(512 * MI, 255)]
    #[case(1024 * MI, 256)]
    #[case(4096 * MI, 1024)]
    #[case(8192 * MI, 1843)]
    #[case(16384 * MI, 2662)]
    #[case(131072 * MI, 9543)]
    #[case(262144 * MI, 12165)]
    fn test_reserved_memory(#[case] capacity: i64, #[case] expected: i64) {
        assert_eq!(reserved_memory_mebibytes(capacity), expected);
    }

    #[test]
    fn test_calculate_reservation_is_deterministic() {
        let cpu = Quantity::from("4");
        let memory = Quantity::from("16Gi");
        let first = calculate_reservation(&cpu, &memory).unwrap();
        let second = calculate_reservation(&cpu, &memory).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, (Quantity::from("80m"), Quantity::from("2662Mi")));
    }

    #[test]
    fn test_fills_unset_reservation() {
        let (admitted, result) = run(&enabled(), shoot(vec![worker("a", Some("4"), Some("16Gi"))]));
        assert!(result.is_ok());
        assert_eq!(
            admitted.spec.provider.workers[0].kube_reserved(),
            Some(&KubeReserved {
                cpu: Some(Quantity::from("80m")),
                memory: Some(Quantity::from("2662Mi")),
                pid: Some(Quantity::from(RESERVED_PID)),
                ephemeral_storage: None,
            })
        );
    }

    #[test]
    fn test_keeps_explicit_reservation() {
        let mut pool = worker("a", Some("4"), Some("16Gi"));
        pool.kube_reserved_mut().cpu = Some(Quantity::from("200m"));

        let (admitted, result) = run(&enabled(), shoot(vec![pool]));
        assert!(result.is_ok());
        let reserved = admitted.spec.provider.workers[0].kube_reserved().unwrap();
        assert_eq!(reserved.cpu, Some(Quantity::from("200m")));
        assert_eq!(reserved.memory, Some(Quantity::from("2662Mi")));
    }

    #[test]
    fn test_readmission_is_idempotent() {
        let plugin = enabled();
        let (once, _) = run(&plugin, shoot(vec![worker("a", Some("2"), Some("8Gi"))]));
        let (twice, result) = run(&plugin, once.clone());
        assert!(result.is_ok());
        assert_eq!(once, twice);
    }

    #[rstest]
    #[case(Configuration::default())]
    #[case(Configuration {
        use_gke_formula: true,
        selector: Some(LabelSelector::match_labels([("reserve", "true")])),
    })]
    fn test_noop_when_disabled_or_unselected(#[case] config: Configuration) {
        let plugin = ShootResourceReservation::with_config(config);
        let input = shoot(vec![worker("a", None, None)]);
        let (admitted, result) = run(&plugin, input.clone());
        assert!(result.is_ok());
        assert_eq!(admitted, input);
    }

    #[test]
    fn test_selector_match_applies_formula() {
        let plugin = ShootResourceReservation::with_config(Configuration {
            use_gke_formula: true,
            selector: Some(LabelSelector::match_labels([("reserve", "true")])),
        });
        let mut input = shoot(vec![worker("a", Some("1"), Some("4Gi"))]);
        input.metadata = input.metadata.with_label("reserve", "true");

        let (admitted, result) = run(&plugin, input);
        assert!(result.is_ok());
        let reserved = admitted.spec.provider.workers[0].kube_reserved().unwrap();
        assert_eq!(reserved.cpu, Some(Quantity::from("60m")));
        assert_eq!(reserved.memory, Some(Quantity::from("1024Mi")));
    }

    #[test]
    fn test_missing_capacity_denied() {
        let (_, result) = run(&enabled(), shoot(vec![worker("a", Some("2"), None)]));
        let err = result.unwrap_err();
        assert_eq!(err.field_errors().len(), 1);
        assert_eq!(
            err.field_errors()[0].field,
            "spec.provider.workers[0].machine.memory"
        );
        assert_eq!(err.field_errors()[0].error_type, FieldErrorType::Required);
    }

    #[test]
    fn test_reservation_exceeding_capacity_denied() {
        let mut pool = worker("a", Some("2"), Some("4Gi"));
        pool.kube_reserved_mut().cpu = Some(Quantity::from("2"));
        pool.kube_reserved_mut().ephemeral_storage = Some(Quantity::from("lots"));

        let (_, result) = run(&enabled(), shoot(vec![pool]));
        let fields: Vec<String> = result
            .unwrap_err()
            .field_errors()
            .iter()
            .map(|e| e.field.clone())
            .collect();
        assert_eq!(
            fields,
            vec![
                "spec.provider.workers[0].kubernetes.kubelet.kubeReserved.cpu",
                "spec.provider.workers[0].kubernetes.kubelet.kubeReserved.ephemeralStorage",
            ]
        );
    }

    #[test]
    fn test_configuration_from_yaml() {
        let mut reader: &[u8] =
            b"useGKEFormula: true\nselector:\n  matchExpressions:\n  - {key: tier, operator: In, values: [gold]}\n";
        let config: Configuration = read_plugin_config(PLUGIN_NAME, Some(&mut reader)).unwrap();
        assert!(config.use_gke_formula);
        assert!(config.validate().is_ok());

        let selected: Shoot = serde_json::from_value(json!({
            "metadata": {"name": "s", "namespace": "garden-dev", "labels": {"tier": "gold"}},
        }))
        .unwrap();
        assert!(config.applies_to(&selected));
        assert!(!config.applies_to(&Shoot::new("garden-dev", "s")));
    }

    #[test]
    fn test_malformed_selector_is_configuration_defect() {
        let mut reader: &[u8] =
            b"useGKEFormula: true\nselector:\n  matchExpressions:\n  - {key: tier, operator: In}\n";
        let result = new_plugin(Some(&mut reader), &SharedInformers::new());
        assert!(matches!(result, Err(AdmissionError::Configuration(_))));
    }
}
