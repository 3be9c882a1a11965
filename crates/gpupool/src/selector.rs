//! Compiled node selectors.
//!
//! Pool node selectors are compiled before any inventory is walked so a
//! malformed operator fails the reconcile up front instead of matching
//! nothing.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::api::NodeSelector;

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("invalid selector: unknown operator {operator:?} for key {key:?}")]
    UnknownOperator { key: String, operator: String },
    #[error("invalid selector: operator {operator} for key {key:?} requires values")]
    MissingValues { key: String, operator: String },
    #[error("invalid selector: operator {operator} for key {key:?} takes no values")]
    UnexpectedValues { key: String, operator: String },
}

enum Requirement {
    In { key: String, values: Vec<String> },
    NotIn { key: String, values: Vec<String> },
    Exists { key: String },
    DoesNotExist { key: String },
}

/// A validated selector ready to evaluate against node labels.
pub struct CompiledSelector {
    match_labels: BTreeMap<String, String>,
    requirements: Vec<Requirement>,
}

impl CompiledSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        for (key, value) in &self.match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
        self.requirements.iter().all(|req| match req {
            Requirement::In { key, values } => {
                labels.get(key).map_or(false, |v| values.contains(v))
            }
            Requirement::NotIn { key, values } => {
                labels.get(key).map_or(true, |v| !values.contains(v))
            }
            Requirement::Exists { key } => labels.contains_key(key),
            Requirement::DoesNotExist { key } => !labels.contains_key(key),
        })
    }
}

pub fn compile(selector: &NodeSelector) -> Result<CompiledSelector, SelectorError> {
    let mut requirements = Vec::with_capacity(selector.match_expressions.len());
    for expr in &selector.match_expressions {
        let key = expr.key.clone();
        let req = match expr.operator.as_str() {
            "In" | "NotIn" => {
                if expr.values.is_empty() {
                    return Err(SelectorError::MissingValues {
                        key,
                        operator: expr.operator.clone(),
                    });
                }
                if expr.operator == "In" {
                    Requirement::In {
                        key,
                        values: expr.values.clone(),
                    }
                } else {
                    Requirement::NotIn {
                        key,
                        values: expr.values.clone(),
                    }
                }
            }
            "Exists" | "DoesNotExist" => {
                if !expr.values.is_empty() {
                    return Err(SelectorError::UnexpectedValues {
                        key,
                        operator: expr.operator.clone(),
                    });
                }
                if expr.operator == "Exists" {
                    Requirement::Exists { key }
                } else {
                    Requirement::DoesNotExist { key }
                }
            }
            other => {
                return Err(SelectorError::UnknownOperator {
                    key,
                    operator: other.to_string(),
                })
            }
        };
        requirements.push(req);
    }
    Ok(CompiledSelector {
        match_labels: selector.match_labels.clone(),
        requirements,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::NodeSelectorRequirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn match_labels_and_expressions_are_anded() {
        let selector = NodeSelector {
            match_labels: labels(&[("zone", "a")]),
            match_expressions: vec![NodeSelectorRequirement {
                key: "gpu".into(),
                operator: "Exists".into(),
                values: vec![],
            }],
        };
        let compiled = compile(&selector).unwrap();
        assert!(compiled.matches(&labels(&[("zone", "a"), ("gpu", "yes")])));
        assert!(!compiled.matches(&labels(&[("zone", "a")])));
        assert!(!compiled.matches(&labels(&[("zone", "b"), ("gpu", "yes")])));
    }

    #[test]
    fn not_in_matches_absent_key() {
        let selector = NodeSelector {
            match_labels: Default::default(),
            match_expressions: vec![NodeSelectorRequirement {
                key: "tier".into(),
                operator: "NotIn".into(),
                values: vec!["spot".into()],
            }],
        };
        let compiled = compile(&selector).unwrap();
        assert!(compiled.matches(&labels(&[])));
        assert!(!compiled.matches(&labels(&[("tier", "spot")])));
    }

    #[test]
    fn bad_operator_fails_compilation() {
        let selector = NodeSelector {
            match_labels: Default::default(),
            match_expressions: vec![NodeSelectorRequirement {
                key: "tier".into(),
                operator: "Near".into(),
                values: vec![],
            }],
        };
        assert!(matches!(
            compile(&selector),
            Err(SelectorError::UnknownOperator { .. })
        ));
    }

    #[test]
    fn in_requires_values() {
        let selector = NodeSelector {
            match_labels: Default::default(),
            match_expressions: vec![NodeSelectorRequirement {
                key: "tier".into(),
                operator: "In".into(),
                values: vec![],
            }],
        };
        assert!(matches!(
            compile(&selector),
            Err(SelectorError::MissingValues { .. })
        ));
    }
}
