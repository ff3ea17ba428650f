//! Forwarding rules.
//!
//! Each destination carries a predicate over a small projection of the
//! received instance. Rules are stored in the catalog as a tagged JSON
//! expression, never as code.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The instance-metadata projection rules are evaluated against
#[derive(Debug, Clone, Default)]
pub struct InstanceFacts {
    pub modality: Option<String>,
    pub sop_class_uid: String,
    /// AE title of the association that delivered the instance
    pub calling_aet: String,
    /// Operator-supplied labels on the originating association or study
    pub labels: BTreeSet<String>,
}

/// Predicate deciding whether an instance is forwarded to a destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ForwardRule {
    /// Forward everything
    Always,
    /// Forward nothing (destination kept configured but quiet)
    Never,
    /// Modality is one of the listed values
    ModalityIn { values: Vec<String> },
    /// SOP class UID is one of the listed values
    SopClassIn { values: Vec<String> },
    /// Calling AE title is one of the listed values
    CallingAeIn { values: Vec<String> },
    /// The label set contains the given label
    HasLabel { label: String },
    /// All sub-rules match
    AllOf { rules: Vec<ForwardRule> },
    /// At least one sub-rule matches
    AnyOf { rules: Vec<ForwardRule> },
    /// The sub-rule does not match
    Not { rule: Box<ForwardRule> },
}

impl Default for ForwardRule {
    fn default() -> Self {
        ForwardRule::Always
    }
}

impl ForwardRule {
    /// Evaluate this rule against the projection.
    pub fn matches(&self, facts: &InstanceFacts) -> bool {
        match self {
            ForwardRule::Always => true,
            ForwardRule::Never => false,
            ForwardRule::ModalityIn { values } => facts
                .modality
                .as_deref()
                .map(|m| values.iter().any(|v| v.eq_ignore_ascii_case(m)))
                .unwrap_or(false),
            ForwardRule::SopClassIn { values } => {
                values.iter().any(|v| v == &facts.sop_class_uid)
            }
            ForwardRule::CallingAeIn { values } => {
                values.iter().any(|v| v == &facts.calling_aet)
            }
            ForwardRule::HasLabel { label } => facts.labels.contains(label),
            ForwardRule::AllOf { rules } => rules.iter().all(|r| r.matches(facts)),
            ForwardRule::AnyOf { rules } => rules.iter().any(|r| r.matches(facts)),
            ForwardRule::Not { rule } => !rule.matches(facts),
        }
    }

    /// Parse the catalog's JSON column. `None` (no rule configured) means
    /// forward everything; an unparseable rule matches nothing and is the
    /// caller's cue to log.
    pub fn from_column(value: Option<&serde_json::Value>) -> Result<ForwardRule, serde_json::Error> {
        match value {
            None | Some(serde_json::Value::Null) => Ok(ForwardRule::Always),
            Some(v) => serde_json::from_value(v.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ct_facts() -> InstanceFacts {
        InstanceFacts {
            modality: Some("CT".into()),
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".into(),
            calling_aet: "MODALITY_A".into(),
            labels: ["urgent".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn basic_predicates() {
        let facts = ct_facts();
        assert!(ForwardRule::Always.matches(&facts));
        assert!(!ForwardRule::Never.matches(&facts));
        assert!(ForwardRule::ModalityIn { values: vec!["ct".into(), "MR".into()] }.matches(&facts));
        assert!(!ForwardRule::ModalityIn { values: vec!["MR".into()] }.matches(&facts));
        assert!(ForwardRule::CallingAeIn { values: vec!["MODALITY_A".into()] }.matches(&facts));
        assert!(ForwardRule::HasLabel { label: "urgent".into() }.matches(&facts));
        assert!(!ForwardRule::HasLabel { label: "routine".into() }.matches(&facts));
    }

    #[test]
    fn missing_modality_never_matches_modality_rule() {
        let mut facts = ct_facts();
        facts.modality = None;
        assert!(!ForwardRule::ModalityIn { values: vec!["CT".into()] }.matches(&facts));
    }

    #[test]
    fn combinators() {
        let facts = ct_facts();
        let rule = ForwardRule::AllOf {
            rules: vec![
                ForwardRule::ModalityIn { values: vec!["CT".into()] },
                ForwardRule::Not {
                    rule: Box::new(ForwardRule::CallingAeIn {
                        values: vec!["MODALITY_B".into()],
                    }),
                },
            ],
        };
        assert!(rule.matches(&facts));

        let rule = ForwardRule::AnyOf {
            rules: vec![
                ForwardRule::Never,
                ForwardRule::HasLabel { label: "urgent".into() },
            ],
        };
        assert!(rule.matches(&facts));
    }

    #[test]
    fn json_roundtrip() {
        let rule = ForwardRule::AllOf {
            rules: vec![
                ForwardRule::ModalityIn { values: vec!["CT".into(), "MR".into()] },
                ForwardRule::AnyOf {
                    rules: vec![
                        ForwardRule::CallingAeIn { values: vec!["MODALITY_A".into()] },
                        ForwardRule::HasLabel { label: "route-all".into() },
                    ],
                },
            ],
        };
        let json = serde_json::to_value(&rule).expect("serialize");
        assert_eq!(json["op"], "all_of");
        let back: ForwardRule = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, rule);
    }

    #[test]
    fn column_parsing() {
        assert_eq!(ForwardRule::from_column(None).unwrap(), ForwardRule::Always);
        assert_eq!(
            ForwardRule::from_column(Some(&serde_json::Value::Null)).unwrap(),
            ForwardRule::Always
        );
        let v = serde_json::json!({"op": "modality_in", "values": ["CT"]});
        assert_eq!(
            ForwardRule::from_column(Some(&v)).unwrap(),
            ForwardRule::ModalityIn { values: vec!["CT".into()] }
        );
        assert!(ForwardRule::from_column(Some(&serde_json::json!({"op": "bogus"}))).is_err());
    }
}
