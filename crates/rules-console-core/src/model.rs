use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::RulesError;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RulesetId(pub String);

impl RulesetId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RulesetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RulesetId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RulesetId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RuleId(pub String);

impl RuleId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RuleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RuleId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RuleId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Derived classification used for list bullets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Inactive,
    Active,
    LowTrust,
    FraudSuspect,
}

impl RuleStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::LowTrust => "low_trust",
            Self::FraudSuspect => "fraud_suspect",
        }
    }
}

/// One of the fields whose divergence from the pristine snapshot is tracked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ChangedField {
    Active,
    MarkAsUnauthorized,
    MarkAsFraud,
    CustomParameters,
}

impl ChangedField {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::MarkAsUnauthorized => "markAsUnauthorized",
            Self::MarkAsFraud => "markAsFraud",
            Self::CustomParameters => "customParameters",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActionFlags {
    pub active: bool,
    pub mark_as_unauthorized: bool,
    pub mark_as_fraud: bool,
}

impl ActionFlags {
    /// `true` when no mark is set on an inactive rule and the two marks are exclusive.
    #[must_use]
    pub fn is_consistent(self) -> bool {
        let inactive_ok = self.active || (!self.mark_as_unauthorized && !self.mark_as_fraud);
        inactive_ok && !(self.mark_as_unauthorized && self.mark_as_fraud)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub rule_id: RuleId,
    #[serde(default)]
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codename: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub premium: bool,
    pub active: bool,
    pub mark_as_unauthorized: bool,
    pub mark_as_fraud: bool,
    #[serde(default)]
    pub custom_parameters: String,
    #[serde(default)]
    pub is_changed: bool,
    /// Rule fields the console does not interpret, kept so a save hands them back.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Rule {
    #[must_use]
    pub fn action_flags(&self) -> ActionFlags {
        ActionFlags {
            active: self.active,
            mark_as_unauthorized: self.mark_as_unauthorized,
            mark_as_fraud: self.mark_as_fraud,
        }
    }

    #[must_use]
    pub fn status(&self) -> RuleStatus {
        if !self.active {
            RuleStatus::Inactive
        } else if self.mark_as_fraud {
            RuleStatus::FraudSuspect
        } else if self.mark_as_unauthorized {
            RuleStatus::LowTrust
        } else {
            RuleStatus::Active
        }
    }

    /// Compare only the user-editable fields, ignoring display data and `is_changed`.
    #[must_use]
    pub fn tracked_fields_eq(&self, other: &Self) -> bool {
        self.changed_fields(other).is_empty()
    }

    /// Tracked fields whose value differs between `self` and `baseline`.
    #[must_use]
    pub fn changed_fields(&self, baseline: &Self) -> Vec<ChangedField> {
        let mut changed = Vec::new();
        if self.active != baseline.active {
            changed.push(ChangedField::Active);
        }
        if self.mark_as_unauthorized != baseline.mark_as_unauthorized {
            changed.push(ChangedField::MarkAsUnauthorized);
        }
        if self.mark_as_fraud != baseline.mark_as_fraud {
            changed.push(ChangedField::MarkAsFraud);
        }
        if self.custom_parameters != baseline.custom_parameters {
            changed.push(ChangedField::CustomParameters);
        }
        changed
    }

    /// Copy the tracked fields of `edited` onto `self`. Identity and display data are kept.
    pub(crate) fn adopt_tracked_fields(&mut self, edited: &Self) {
        self.active = edited.active;
        self.mark_as_unauthorized = edited.mark_as_unauthorized;
        self.mark_as_fraud = edited.mark_as_fraud;
        self.custom_parameters.clone_from(&edited.custom_parameters);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ruleset {
    pub id: RulesetId,
    #[serde(default)]
    pub name: String,
    /// Absent on the wire stays absent on save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Ruleset-level tuning values. Opaque here; carried through fetch and save untouched.
    #[serde(flatten)]
    pub tuning: Map<String, Value>,
}

impl Ruleset {
    #[must_use]
    pub fn rule(&self, rule_id: &RuleId) -> Option<&Rule> {
        self.rules.iter().find(|rule| &rule.rule_id == rule_id)
    }

    pub(crate) fn rule_mut(&mut self, rule_id: &RuleId) -> Option<&mut Rule> {
        self.rules.iter_mut().find(|rule| &rule.rule_id == rule_id)
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.rules.iter().any(|rule| rule.is_changed)
    }
}

/// Validate a whole rules document before it is persisted.
///
/// # Errors
/// Returns [`RulesError::Validation`] when identities are empty or duplicated, or when a
/// rule's action flags contradict each other.
pub fn validate_document(rulesets: &[Ruleset]) -> Result<(), RulesError> {
    let mut ruleset_ids = BTreeSet::new();
    for ruleset in rulesets {
        if ruleset.id.as_str().trim().is_empty() {
            return Err(RulesError::Validation("ruleset id MUST be non-empty".to_string()));
        }
        if !ruleset_ids.insert(&ruleset.id) {
            return Err(RulesError::Validation(format!(
                "ruleset id `{}` MUST be unique",
                ruleset.id
            )));
        }

        let mut rule_ids = BTreeSet::new();
        for rule in &ruleset.rules {
            if rule.rule_id.as_str().trim().is_empty() {
                return Err(RulesError::Validation(format!(
                    "rule id MUST be non-empty in ruleset `{}`",
                    ruleset.id
                )));
            }
            if !rule_ids.insert(&rule.rule_id) {
                return Err(RulesError::Validation(format!(
                    "rule id `{}` MUST be unique within ruleset `{}`",
                    rule.rule_id, ruleset.id
                )));
            }
            if !rule.active && (rule.mark_as_unauthorized || rule.mark_as_fraud) {
                return Err(RulesError::Validation(format!(
                    "inactive rule `{}` in ruleset `{}` MUST NOT carry unauthorized/fraud marks",
                    rule.rule_id, ruleset.id
                )));
            }
            if rule.mark_as_unauthorized && rule.mark_as_fraud {
                return Err(RulesError::Validation(format!(
                    "rule `{}` in ruleset `{}` MUST NOT be marked both unauthorized and fraud",
                    rule.rule_id, ruleset.id
                )));
            }
        }
    }

    Ok(())
}
