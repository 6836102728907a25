//! Pure update functions over a rules document.
//!
//! Every function here leaves its input untouched and returns the next document.
//! Misses on unknown identities are silent no-ops: callers only address ids they
//! obtained from the store.

use serde::{Deserialize, Serialize};

use crate::model::{ActionFlags, RuleId, Ruleset, RulesetId};

/// Partial update over the three action flags. `None` leaves a flag as it is.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mark_as_unauthorized: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mark_as_fraud: Option<bool>,
}

impl ActionChanges {
    #[must_use]
    pub fn active(value: bool) -> Self {
        Self { active: Some(value), ..Self::default() }
    }

    #[must_use]
    pub fn mark_as_unauthorized(value: bool) -> Self {
        Self { mark_as_unauthorized: Some(value), ..Self::default() }
    }

    #[must_use]
    pub fn mark_as_fraud(value: bool) -> Self {
        Self { mark_as_fraud: Some(value), ..Self::default() }
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.active.is_none() && self.mark_as_unauthorized.is_none() && self.mark_as_fraud.is_none()
    }

    /// Merge onto `current` and settle the flags.
    ///
    /// Deactivation clears both marks even when a mark is set in the same call. Otherwise a
    /// mark being switched on clears the other one, with the unauthorized mark winning a tie.
    #[must_use]
    pub fn resolve(self, current: ActionFlags) -> ActionFlags {
        let mut next = ActionFlags {
            active: self.active.unwrap_or(current.active),
            mark_as_unauthorized: self.mark_as_unauthorized.unwrap_or(current.mark_as_unauthorized),
            mark_as_fraud: self.mark_as_fraud.unwrap_or(current.mark_as_fraud),
        };

        if !next.active {
            next.mark_as_unauthorized = false;
            next.mark_as_fraud = false;
        } else if self.mark_as_unauthorized == Some(true) {
            next.mark_as_fraud = false;
        } else if self.mark_as_fraud == Some(true) {
            next.mark_as_unauthorized = false;
        } else if next.mark_as_unauthorized && next.mark_as_fraud {
            // Both marks came in from the snapshot itself; settle it like a same-call tie.
            next.mark_as_fraud = false;
        }

        next
    }
}

/// Apply `changes` to one rule addressed by ruleset and rule id.
#[must_use]
pub fn apply_action(
    mirror: &[Ruleset],
    ruleset_id: &RulesetId,
    rule_id: &RuleId,
    changes: ActionChanges,
) -> Vec<Ruleset> {
    let mut next = mirror.to_vec();
    apply_action_in_place(&mut next, ruleset_id, rule_id, changes);
    next
}

/// Replace the serialized parameters of every rule carrying `rule_id`, in any ruleset.
#[must_use]
pub fn apply_parameters(mirror: &[Ruleset], rule_id: &RuleId, serialized: &str) -> Vec<Ruleset> {
    let mut next = mirror.to_vec();
    apply_parameters_in_place(&mut next, rule_id, serialized);
    next
}

pub(crate) fn apply_action_in_place(
    mirror: &mut [Ruleset],
    ruleset_id: &RulesetId,
    rule_id: &RuleId,
    changes: ActionChanges,
) -> bool {
    if changes.is_empty() {
        return false;
    }

    let Some(rule) = mirror
        .iter_mut()
        .find(|ruleset| &ruleset.id == ruleset_id)
        .and_then(|ruleset| ruleset.rule_mut(rule_id))
    else {
        return false;
    };

    let flags = changes.resolve(rule.action_flags());
    rule.active = flags.active;
    rule.mark_as_unauthorized = flags.mark_as_unauthorized;
    rule.mark_as_fraud = flags.mark_as_fraud;
    rule.is_changed = true;
    true
}

pub(crate) fn apply_parameters_in_place(
    mirror: &mut [Ruleset],
    rule_id: &RuleId,
    serialized: &str,
) -> usize {
    let mut touched = 0;
    for rule in mirror.iter_mut().flat_map(|ruleset| ruleset.rules.iter_mut()) {
        if &rule.rule_id == rule_id {
            serialized.clone_into(&mut rule.custom_parameters);
            rule.is_changed = true;
            touched += 1;
        }
    }
    touched
}
