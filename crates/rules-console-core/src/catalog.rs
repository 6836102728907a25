//! Presentation helpers: rule sections for list views and the current selection.

use serde::{Deserialize, Serialize};

use crate::model::{Rule, RuleId, Ruleset, RulesetId};

const CUSTOM_CODENAME_MARKER: &str = "CUSTOM";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSections<'a> {
    pub premium: Vec<&'a Rule>,
    pub normal: Vec<&'a Rule>,
    pub custom: Vec<&'a Rule>,
}

impl RuleSections<'_> {
    /// Rules counted in the ruleset header. Custom rules are listed apart.
    #[must_use]
    pub fn listed_total(&self) -> usize {
        self.premium.len() + self.normal.len()
    }
}

/// Split a ruleset's rules into display sections, keeping document order within each.
///
/// `custom` holds every rule whose codename contains `CUSTOM`, premium or not, so a
/// premium custom rule shows up in both `premium` and `custom`. `normal` takes the
/// non-premium rules that are not custom.
#[must_use]
pub fn partition_rules(ruleset: &Ruleset) -> RuleSections<'_> {
    let mut sections = RuleSections::default();
    for rule in &ruleset.rules {
        let custom = is_custom(rule);
        if rule.premium {
            sections.premium.push(rule);
        } else if !custom {
            sections.normal.push(rule);
        }
        if custom {
            sections.custom.push(rule);
        }
    }
    sections
}

fn is_custom(rule: &Rule) -> bool {
    rule.codename.as_deref().is_some_and(|codename| codename.contains(CUSTOM_CODENAME_MARKER))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub ruleset_id: Option<RulesetId>,
    pub rule_id: Option<RuleId>,
}

impl Selection {
    /// Point the selection at something that exists in `rulesets`.
    ///
    /// A missing or vanished ruleset falls back to the first one; a missing or vanished
    /// rule falls back to the first rule of the selected ruleset.
    pub fn reconcile(&mut self, rulesets: &[Ruleset]) {
        let ruleset = self
            .ruleset_id
            .as_ref()
            .and_then(|id| rulesets.iter().find(|ruleset| &ruleset.id == id))
            .or_else(|| rulesets.first());

        let Some(ruleset) = ruleset else {
            *self = Self::default();
            return;
        };

        if self.ruleset_id.as_ref() != Some(&ruleset.id) {
            self.ruleset_id = Some(ruleset.id.clone());
            self.rule_id = None;
        }

        let rule_exists = self.rule_id.as_ref().is_some_and(|id| ruleset.rule(id).is_some());
        if !rule_exists {
            self.rule_id = ruleset.rules.first().map(|rule| rule.rule_id.clone());
        }
    }

    pub fn select_ruleset(&mut self, ruleset_id: RulesetId) {
        self.ruleset_id = Some(ruleset_id);
        self.rule_id = None;
    }

    pub fn select_rule(&mut self, rule_id: RuleId) {
        self.rule_id = Some(rule_id);
    }

    #[must_use]
    pub fn selected_ruleset<'a>(&self, rulesets: &'a [Ruleset]) -> Option<&'a Ruleset> {
        let id = self.ruleset_id.as_ref()?;
        rulesets.iter().find(|ruleset| &ruleset.id == id)
    }

    #[must_use]
    pub fn selected_rule<'a>(&self, rulesets: &'a [Ruleset]) -> Option<&'a Rule> {
        let rule_id = self.rule_id.as_ref()?;
        self.selected_ruleset(rulesets)?.rule(rule_id)
    }
}
