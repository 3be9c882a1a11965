//! Mutating side of pod admission: scheduling constraints that steer the
//! pod onto the pool's nodes.
//!
//! All mutations are computed on a copy and shipped back as a JSON patch;
//! anything already set by the user is either normalized, accepted, or —
//! when it points at another pool — rejected.

use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelectorRequirement, NodeSelectorTerm, Pod, Taint, Toleration,
    TopologySpreadConstraint,
};
use k8s_openapi::api::core::v1::NodeSelector as KubeNodeSelector;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use tracing::{debug, instrument};

use crate::api::{POOL_NAME_LABEL, POOL_SCOPE_LABEL, STRATEGY_SPREAD};
use crate::client::collect_node_taints;
use crate::pool::PoolScope;

use super::super::review::{AdmissionRequest, AdmissionResponse};
use super::super::{AdmissionError, Webhooks};
use super::validator::effective_namespace;
use super::{pool_reference, load_pool_for};

const NO_SCHEDULE: &str = "NoSchedule";

/// Everything the pure defaulting step needs to know about the pool and
/// the module configuration.
#[derive(Clone, Debug)]
pub struct DefaulterInput {
    pub pool_name: String,
    pub scope: PoolScope,
    pub taints_enabled: bool,
    pub strategy: Option<String>,
    pub topology_key: Option<String>,
    pub node_taints: Vec<Taint>,
    pub custom_toleration_keys: Vec<String>,
}

/// Applies the defaulting rules in place. An `Err` is a policy denial with
/// the contained reason.
pub fn apply_defaults(pod: &mut Pod, input: &DefaulterInput) -> Result<(), String> {
    let label_key = format!("{}/{}", input.scope.prefix(), input.pool_name);

    // 1. pool identity labels
    let labels = pod.metadata.labels.get_or_insert_with(Default::default);
    for (key, value) in [
        (POOL_NAME_LABEL, input.pool_name.as_str()),
        (POOL_SCOPE_LABEL, input.scope.as_str()),
    ] {
        match labels.get(key) {
            Some(existing) if existing != value => {
                return Err(format!(
                    "label {} is already set to {:?}, refusing to relabel to {:?}",
                    key, existing, value
                ));
            }
            _ => {
                labels.insert(key.to_string(), value.to_string());
            }
        }
    }

    let spec = pod
        .spec
        .as_mut()
        .ok_or_else(|| "pod has no spec".to_string())?;

    // 2. nodeSelector pin
    let selector = spec.node_selector.get_or_insert_with(Default::default);
    match selector.get(&label_key) {
        Some(existing) if existing != &input.pool_name => {
            return Err(format!(
                "nodeSelector {} is already set to {:?}",
                label_key, existing
            ));
        }
        _ => {
            selector.insert(label_key.clone(), input.pool_name.clone());
        }
    }

    if input.taints_enabled {
        // 3a. pool taint toleration, normalizing what the user left blank
        let tolerations = spec.tolerations.get_or_insert_with(Vec::new);
        match tolerations
            .iter_mut()
            .find(|t| t.key.as_deref() == Some(label_key.as_str()))
        {
            None => tolerations.push(Toleration {
                key: Some(label_key.clone()),
                operator: Some("Equal".to_string()),
                value: Some(input.pool_name.clone()),
                effect: Some(NO_SCHEDULE.to_string()),
                ..Default::default()
            }),
            Some(toleration) => {
                let operator = toleration.operator.as_deref().unwrap_or("");
                match operator {
                    "Exists" => {}
                    "" | "Equal" => {
                        toleration.operator = Some("Equal".to_string());
                        match toleration.value.as_deref() {
                            None | Some("") => toleration.value = Some(input.pool_name.clone()),
                            Some(value) if value == input.pool_name => {}
                            Some(value) => {
                                return Err(format!(
                                    "toleration for {} carries value {:?}, expected {:?}",
                                    label_key, value, input.pool_name
                                ));
                            }
                        }
                        match toleration.effect.as_deref() {
                            None | Some("") => toleration.effect = Some(NO_SCHEDULE.to_string()),
                            Some(NO_SCHEDULE) => {}
                            Some(effect) => {
                                return Err(format!(
                                    "toleration for {} carries unsupported effect {:?}",
                                    label_key, effect
                                ));
                            }
                        }
                    }
                    other => {
                        return Err(format!(
                            "toleration for {} carries unsupported operator {:?}",
                            label_key, other
                        ));
                    }
                }
            }
        }

        // 3b. required node affinity on the pool label
        let affinity = spec.affinity.get_or_insert_with(Affinity::default);
        let node_affinity = affinity.node_affinity.get_or_insert_with(NodeAffinity::default);
        let required = node_affinity
            .required_during_scheduling_ignored_during_execution
            .get_or_insert_with(|| KubeNodeSelector {
                node_selector_terms: Vec::new(),
            });
        if required.node_selector_terms.is_empty() {
            required.node_selector_terms.push(NodeSelectorTerm::default());
        }
        for term in &mut required.node_selector_terms {
            let expressions = term.match_expressions.get_or_insert_with(Vec::new);
            match expressions.iter().find(|e| e.key == label_key) {
                None => expressions.push(NodeSelectorRequirement {
                    key: label_key.clone(),
                    operator: "In".to_string(),
                    values: Some(vec![input.pool_name.clone()]),
                }),
                Some(expr) if expr.operator == "In" => {
                    let values = expr.values.clone().unwrap_or_default();
                    if !values.iter().any(|v| v == &input.pool_name) {
                        return Err(format!(
                            "node affinity already requires {} In {:?}",
                            label_key, values
                        ));
                    }
                }
                Some(expr) => {
                    return Err(format!(
                        "node affinity on {} uses operator {:?}, expected In",
                        label_key, expr.operator
                    ));
                }
            }
        }

        // 3c. tolerate whatever else is tainted on the pool's nodes
        let tolerations = spec.tolerations.get_or_insert_with(Vec::new);
        let mut seen = std::collections::HashSet::new();
        for taint in &input.node_taints {
            if taint.key == label_key {
                continue;
            }
            let fingerprint = format!(
                "{}|{}|{}",
                taint.key,
                taint.value.as_deref().unwrap_or(""),
                taint.effect
            );
            if !seen.insert(fingerprint) {
                continue;
            }
            let already = tolerations.iter().any(|t| {
                if t.key.as_deref() != Some(taint.key.as_str()) {
                    return false;
                }
                match t.effect.as_deref() {
                    None | Some("") => true,
                    Some(effect) => effect == taint.effect,
                }
            });
            if !already {
                tolerations.push(Toleration {
                    key: Some(taint.key.clone()),
                    operator: Some("Exists".to_string()),
                    effect: Some(taint.effect.clone()),
                    ..Default::default()
                });
            }
        }
    }

    // 4. topology spread for Spread pools
    if input.strategy.as_deref() == Some(STRATEGY_SPREAD) {
        if let Some(topology_key) = input.topology_key.as_deref().filter(|k| !k.is_empty()) {
            let constraints = spec.topology_spread_constraints.get_or_insert_with(Vec::new);
            let mut add = true;
            for constraint in constraints.iter() {
                if constraint.topology_key != topology_key {
                    continue;
                }
                let pinned = constraint
                    .label_selector
                    .as_ref()
                    .and_then(|s| s.match_labels.as_ref())
                    .and_then(|m| m.get(&label_key));
                match pinned {
                    Some(value) if value == &input.pool_name => add = false,
                    Some(value) => {
                        return Err(format!(
                            "topology spread constraint on {} already pins pool {:?}",
                            topology_key, value
                        ));
                    }
                    None => {}
                }
            }
            if add {
                constraints.push(TopologySpreadConstraint {
                    max_skew: 1,
                    topology_key: topology_key.to_string(),
                    when_unsatisfiable: "DoNotSchedule".to_string(),
                    label_selector: Some(LabelSelector {
                        match_labels: Some(
                            [(label_key.clone(), input.pool_name.clone())]
                                .into_iter()
                                .collect(),
                        ),
                        ..Default::default()
                    }),
                });
            }
        }
    }

    // 5. custom toleration keys from the module config
    let tolerations = spec.tolerations.get_or_insert_with(Vec::new);
    for key in &input.custom_toleration_keys {
        if !tolerations.iter().any(|t| t.key.as_deref() == Some(key.as_str())) {
            tolerations.push(Toleration {
                key: Some(key.clone()),
                operator: Some("Exists".to_string()),
                ..Default::default()
            });
        }
    }

    Ok(())
}

#[instrument(level = "info", skip_all, fields(pod = %request.name))]
pub(crate) async fn mutate(
    webhooks: &Webhooks,
    request: &AdmissionRequest,
    pod: &Pod,
) -> Result<AdmissionResponse, AdmissionError> {
    let reference = match pool_reference(pod) {
        Ok(Some(reference)) => reference,
        Ok(None) => return Ok(AdmissionResponse::allow(&request.uid)),
        Err(e) => return Ok(AdmissionResponse::deny(&request.uid, e)),
    };

    let namespace = effective_namespace(request, pod);
    let pool = match load_pool_for(webhooks, &reference, &namespace).await? {
        Some(pool) => pool,
        None => {
            return Ok(AdmissionResponse::deny(
                &request.uid,
                format!("GPU pool {:?} not found", reference.name),
            ))
        }
    };

    let settings = webhooks.settings.current();
    let scheduling = &pool.spec().scheduling;
    let node_names: Vec<String> = pool
        .status()
        .map(|s| s.nodes.iter().map(|n| n.name.clone()).collect())
        .unwrap_or_default();
    let node_taints = collect_node_taints(&webhooks.client, &node_names).await?;

    let input = DefaulterInput {
        pool_name: reference.name.clone(),
        scope: reference.scope,
        taints_enabled: scheduling.taints_enabled(),
        strategy: scheduling
            .strategy
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| settings.scheduling.default_strategy.clone()),
        topology_key: scheduling
            .topology_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| settings.scheduling.topology_key.clone()),
        node_taints,
        custom_toleration_keys: settings.placement.custom_toleration_keys.clone(),
    };

    let mut mutated = pod.clone();
    if let Err(reason) = apply_defaults(&mut mutated, &input) {
        return Ok(AdmissionResponse::deny(&request.uid, reason));
    }

    let before = serde_json::to_value(pod)
        .map_err(|e| AdmissionError::Unprocessable(format!("cannot re-encode pod: {}", e)))?;
    let after = serde_json::to_value(&mutated)
        .map_err(|e| AdmissionError::Unprocessable(format!("cannot encode mutated pod: {}", e)))?;
    let patch = json_patch::diff(&before, &after);
    if patch.0.is_empty() {
        return Ok(AdmissionResponse::allow(&request.uid));
    }
    debug!(operations = patch.0.len(), "pod defaulted");
    AdmissionResponse::allow(&request.uid)
        .with_patch(&patch)
        .map_err(|e| AdmissionError::Unprocessable(format!("cannot encode patch: {}", e)))
}

#[cfg(test)]
mod test {
    use super::super::test_fixtures::*;
    use super::*;

    fn input() -> DefaulterInput {
        DefaulterInput {
            pool_name: "shared".to_string(),
            scope: PoolScope::Cluster,
            taints_enabled: true,
            strategy: None,
            topology_key: None,
            node_taints: Vec::new(),
            custom_toleration_keys: Vec::new(),
        }
    }

    const LABEL_KEY: &str = "cluster.gpu.deckhouse.io/shared";

    fn gpu_pod() -> Pod {
        pod_with(vec![container_with_limit(LABEL_KEY, 1)], vec![])
    }

    #[test]
    fn defaults_inject_labels_selector_toleration_affinity() {
        let mut pod = gpu_pod();
        apply_defaults(&mut pod, &input()).unwrap();

        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels[POOL_NAME_LABEL], "shared");
        assert_eq!(labels[POOL_SCOPE_LABEL], "cluster");

        let spec = pod.spec.unwrap();
        assert_eq!(spec.node_selector.unwrap()[LABEL_KEY], "shared");

        let tolerations = spec.tolerations.unwrap();
        assert_eq!(tolerations.len(), 1);
        assert_eq!(tolerations[0].key.as_deref(), Some(LABEL_KEY));
        assert_eq!(tolerations[0].operator.as_deref(), Some("Equal"));
        assert_eq!(tolerations[0].effect.as_deref(), Some(NO_SCHEDULE));

        let node_selector_term = spec
            .affinity
            .unwrap()
            .node_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap()
            .node_selector_terms[0]
            .clone();
        let expr = &node_selector_term.match_expressions.as_ref().unwrap()[0];
        assert_eq!(expr.key, LABEL_KEY);
        assert_eq!(expr.operator, "In");
        assert_eq!(expr.values.as_deref(), Some(&["shared".to_string()][..]));
    }

    #[test]
    fn defaults_are_idempotent() {
        let mut pod = gpu_pod();
        apply_defaults(&mut pod, &input()).unwrap();
        let once = pod.clone();
        apply_defaults(&mut pod, &input()).unwrap();
        assert_eq!(
            serde_json::to_value(&once).unwrap(),
            serde_json::to_value(&pod).unwrap()
        );
    }

    #[test]
    fn foreign_pool_label_is_rejected() {
        let mut pod = gpu_pod();
        pod.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(POOL_NAME_LABEL.into(), "other".into());
        assert!(apply_defaults(&mut pod, &input()).is_err());
    }

    #[test]
    fn conflicting_node_selector_is_rejected() {
        let mut pod = gpu_pod();
        pod.spec
            .as_mut()
            .unwrap()
            .node_selector
            .get_or_insert_with(Default::default)
            .insert(LABEL_KEY.into(), "other".into());
        assert!(apply_defaults(&mut pod, &input()).is_err());
    }

    #[test]
    fn blank_toleration_fields_are_normalized() {
        let mut pod = gpu_pod();
        pod.spec.as_mut().unwrap().tolerations = Some(vec![Toleration {
            key: Some(LABEL_KEY.into()),
            ..Default::default()
        }]);
        apply_defaults(&mut pod, &input()).unwrap();
        let toleration = &pod.spec.unwrap().tolerations.unwrap()[0];
        assert_eq!(toleration.operator.as_deref(), Some("Equal"));
        assert_eq!(toleration.value.as_deref(), Some("shared"));
        assert_eq!(toleration.effect.as_deref(), Some(NO_SCHEDULE));
    }

    #[test]
    fn exists_toleration_is_accepted_untouched() {
        let mut pod = gpu_pod();
        pod.spec.as_mut().unwrap().tolerations = Some(vec![Toleration {
            key: Some(LABEL_KEY.into()),
            operator: Some("Exists".into()),
            ..Default::default()
        }]);
        apply_defaults(&mut pod, &input()).unwrap();
        let toleration = &pod.spec.unwrap().tolerations.unwrap()[0];
        assert_eq!(toleration.operator.as_deref(), Some("Exists"));
        assert_eq!(toleration.value, None);
    }

    #[test]
    fn unsupported_toleration_effect_is_rejected() {
        let mut pod = gpu_pod();
        pod.spec.as_mut().unwrap().tolerations = Some(vec![Toleration {
            key: Some(LABEL_KEY.into()),
            operator: Some("Equal".into()),
            value: Some("shared".into()),
            effect: Some("PreferNoSchedule".into()),
            ..Default::default()
        }]);
        assert!(apply_defaults(&mut pod, &input()).is_err());
    }

    #[test]
    fn node_taints_become_exists_tolerations_deduped() {
        let mut spec_input = input();
        let taint = Taint {
            key: "dedicated".into(),
            value: Some("gpu".into()),
            effect: NO_SCHEDULE.into(),
            time_added: None,
        };
        spec_input.node_taints = vec![taint.clone(), taint];
        let mut pod = gpu_pod();
        apply_defaults(&mut pod, &spec_input).unwrap();
        let tolerations = pod.spec.unwrap().tolerations.unwrap();
        let dedicated: Vec<_> = tolerations
            .iter()
            .filter(|t| t.key.as_deref() == Some("dedicated"))
            .collect();
        assert_eq!(dedicated.len(), 1);
        assert_eq!(dedicated[0].operator.as_deref(), Some("Exists"));
    }

    #[test]
    fn spread_strategy_adds_topology_constraint() {
        let mut spread = input();
        spread.strategy = Some(STRATEGY_SPREAD.into());
        spread.topology_key = Some("topology.kubernetes.io/zone".into());
        let mut pod = gpu_pod();
        apply_defaults(&mut pod, &spread).unwrap();
        let constraints = pod.spec.unwrap().topology_spread_constraints.unwrap();
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].max_skew, 1);
        assert_eq!(constraints[0].when_unsatisfiable, "DoNotSchedule");
        assert_eq!(
            constraints[0]
                .label_selector
                .as_ref()
                .unwrap()
                .match_labels
                .as_ref()
                .unwrap()[LABEL_KEY],
            "shared"
        );
    }

    #[test]
    fn conflicting_topology_constraint_is_rejected() {
        let mut spread = input();
        spread.strategy = Some(STRATEGY_SPREAD.into());
        spread.topology_key = Some("topology.kubernetes.io/zone".into());
        let mut pod = gpu_pod();
        pod.spec.as_mut().unwrap().topology_spread_constraints =
            Some(vec![TopologySpreadConstraint {
                max_skew: 1,
                topology_key: "topology.kubernetes.io/zone".into(),
                when_unsatisfiable: "DoNotSchedule".into(),
                label_selector: Some(LabelSelector {
                    match_labels: Some(
                        [(LABEL_KEY.to_string(), "other".to_string())]
                            .into_iter()
                            .collect(),
                    ),
                    ..Default::default()
                }),
            }]);
        assert!(apply_defaults(&mut pod, &spread).is_err());
    }

    #[test]
    fn custom_toleration_keys_are_appended_once() {
        let mut custom = input();
        custom.custom_toleration_keys = vec!["drained".to_string()];
        let mut pod = gpu_pod();
        apply_defaults(&mut pod, &custom).unwrap();
        apply_defaults(&mut pod, &custom).unwrap();
        let tolerations = pod.spec.unwrap().tolerations.unwrap();
        let drained: Vec<_> = tolerations
            .iter()
            .filter(|t| t.key.as_deref() == Some("drained"))
            .collect();
        assert_eq!(drained.len(), 1);
    }
}
