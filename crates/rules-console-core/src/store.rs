use crate::model::{ChangedField, Rule, RuleId, Ruleset, RulesetId};
use crate::mutation::{apply_action_in_place, apply_parameters_in_place, ActionChanges};

/// Editable mirror of the rules document next to the last server-confirmed snapshot.
///
/// The two documents are separately owned, so edits to the mirror can never leak
/// into the pristine snapshot. The dirty flag is derived from the per-rule
/// `is_changed` markers rather than stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleStore {
    mirror: Vec<Ruleset>,
    pristine: Vec<Ruleset>,
}

impl RuleStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt fresh server data as both mirror and pristine snapshot.
    ///
    /// Change markers coming from the server are cleared: server data is clean by
    /// definition.
    pub fn seed(&mut self, mut server_data: Vec<Ruleset>) {
        for rule in server_data.iter_mut().flat_map(|ruleset| ruleset.rules.iter_mut()) {
            rule.is_changed = false;
        }
        self.mirror.clone_from(&server_data);
        self.pristine = server_data;
    }

    #[must_use]
    pub fn mirror(&self) -> &[Ruleset] {
        &self.mirror
    }

    #[must_use]
    pub fn pristine(&self) -> &[Ruleset] {
        &self.pristine
    }

    #[must_use]
    pub fn ruleset(&self, ruleset_id: &RulesetId) -> Option<&Ruleset> {
        self.mirror.iter().find(|ruleset| &ruleset.id == ruleset_id)
    }

    #[must_use]
    pub fn get_rule(&self, ruleset_id: &RulesetId, rule_id: &RuleId) -> Option<&Rule> {
        self.ruleset(ruleset_id).and_then(|ruleset| ruleset.rule(rule_id))
    }

    #[must_use]
    pub fn pristine_rule(&self, ruleset_id: &RulesetId, rule_id: &RuleId) -> Option<&Rule> {
        self.pristine
            .iter()
            .find(|ruleset| &ruleset.id == ruleset_id)
            .and_then(|ruleset| ruleset.rule(rule_id))
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.mirror.iter().any(Ruleset::has_changes)
    }

    /// Every rule currently flagged as changed, in document order.
    #[must_use]
    pub fn changed_rules(&self) -> Vec<(&RulesetId, &Rule)> {
        self.mirror
            .iter()
            .flat_map(|ruleset| {
                ruleset.rules.iter().filter(|rule| rule.is_changed).map(move |rule| (&ruleset.id, rule))
            })
            .collect()
    }

    /// Fields of one rule whose mirror value differs from the pristine snapshot.
    ///
    /// Unlike `is_changed`, this compares values, so a flag toggled back to its original
    /// value is not reported. A rule absent from either side reports nothing.
    #[must_use]
    pub fn changed_fields(&self, ruleset_id: &RulesetId, rule_id: &RuleId) -> Vec<ChangedField> {
        match (self.get_rule(ruleset_id, rule_id), self.pristine_rule(ruleset_id, rule_id)) {
            (Some(current), Some(pristine)) => current.changed_fields(pristine),
            _ => Vec::new(),
        }
    }

    /// Returns `true` when a rule was found and updated.
    pub fn apply_action(
        &mut self,
        ruleset_id: &RulesetId,
        rule_id: &RuleId,
        changes: ActionChanges,
    ) -> bool {
        apply_action_in_place(&mut self.mirror, ruleset_id, rule_id, changes)
    }

    /// Returns how many rules carried `rule_id` and were updated.
    pub fn apply_parameters(&mut self, rule_id: &RuleId, serialized: &str) -> usize {
        apply_parameters_in_place(&mut self.mirror, rule_id, serialized)
    }

    pub fn discard(&mut self) {
        self.mirror.clone_from(&self.pristine);
    }

    pub fn mark_saved(&mut self) {
        for rule in self.mirror.iter_mut().flat_map(|ruleset| ruleset.rules.iter_mut()) {
            rule.is_changed = false;
        }
    }

    /// Copy of the mirror as it stands now.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Ruleset> {
        self.mirror.clone()
    }

    /// Re-apply a local edit on top of freshly seeded data and keep it flagged.
    ///
    /// Returns `false` when the rule no longer exists in the mirror.
    pub(crate) fn restore_local_edit(&mut self, ruleset_id: &RulesetId, edited: &Rule) -> bool {
        let Some(rule) = self
            .mirror
            .iter_mut()
            .find(|ruleset| &ruleset.id == ruleset_id)
            .and_then(|ruleset| ruleset.rule_mut(&edited.rule_id))
        else {
            return false;
        };
        rule.adopt_tracked_fields(edited);
        rule.is_changed = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::model::fixtures::{rule, ruleset};

    fn seeded() -> RuleStore {
        let mut store = RuleStore::new();
        store.seed(vec![
            ruleset("int-1", vec![rule("R1", true, false, false), rule("R2", true, true, false)]),
            ruleset("int-2", vec![rule("R3", false, false, false)]),
        ]);
        store
    }

    #[test]
    fn seed_starts_clean_and_clears_incoming_markers() {
        let mut incoming = vec![ruleset("int-1", vec![rule("R1", true, false, false)])];
        incoming[0].rules[0].is_changed = true;

        let mut store = RuleStore::new();
        store.seed(incoming);

        assert!(!store.is_dirty());
        assert_eq!(store.mirror(), store.pristine());
        assert!(store.changed_rules().is_empty());
    }

    #[test]
    fn empty_seed_yields_empty_clean_store() {
        let mut store = seeded();
        store.seed(Vec::new());
        assert!(store.mirror().is_empty());
        assert!(!store.is_dirty());
    }

    #[test]
    fn edits_do_not_leak_into_pristine() {
        let mut store = seeded();
        let before = store.pristine().to_vec();

        assert!(store.apply_action(&"int-1".into(), &"R1".into(), ActionChanges::active(false)));
        assert_eq!(store.apply_parameters(&"R2".into(), r#"[{"name":"a","value":"1"}]"#), 1);

        assert_eq!(store.pristine(), before.as_slice());
        assert!(store.is_dirty());
        assert_eq!(store.changed_rules().len(), 2);
    }

    #[test]
    fn get_rule_reads_the_mirror_and_misses_on_unknown_ids() {
        let mut store = seeded();
        store.apply_action(&"int-1".into(), &"R1".into(), ActionChanges::mark_as_fraud(true));

        let current = store.get_rule(&"int-1".into(), &"R1".into());
        assert!(current.is_some_and(|rule| rule.mark_as_fraud));
        assert!(store.get_rule(&"int-1".into(), &"R3".into()).is_none());
        assert!(store.get_rule(&"missing".into(), &"R1".into()).is_none());
    }

    #[test]
    fn changed_fields_compare_against_pristine_values() {
        let mut store = seeded();
        store.apply_action(&"int-1".into(), &"R2".into(), ActionChanges::mark_as_fraud(true));
        assert_eq!(
            store.changed_fields(&"int-1".into(), &"R2".into()),
            vec![ChangedField::MarkAsUnauthorized, ChangedField::MarkAsFraud]
        );

        store.apply_action(&"int-1".into(), &"R2".into(), ActionChanges::mark_as_unauthorized(true));
        assert!(store.changed_fields(&"int-1".into(), &"R2".into()).is_empty());
        assert!(store.get_rule(&"int-1".into(), &"R2".into()).is_some_and(|rule| rule.is_changed));
    }

    #[test]
    fn discard_after_two_edits_restores_pristine_exactly() {
        let mut store = seeded();
        let pristine = store.pristine().to_vec();

        store.apply_action(&"int-1".into(), &"R1".into(), ActionChanges::active(false));
        store.apply_action(&"int-1".into(), &"R2".into(), ActionChanges::mark_as_fraud(true));
        store.discard();

        assert_eq!(store.mirror(), pristine.as_slice());
        assert!(!store.is_dirty());

        store.discard();
        assert_eq!(store.mirror(), pristine.as_slice());
    }

    #[test]
    fn mark_saved_clears_markers_but_keeps_values() {
        let mut store = seeded();
        store.apply_action(&"int-1".into(), &"R1".into(), ActionChanges::active(false));
        store.mark_saved();

        assert!(!store.is_dirty());
        assert!(store.get_rule(&"int-1".into(), &"R1".into()).is_some_and(|rule| !rule.active));
    }

    proptest! {
        #[test]
        fn property_discard_reverts_any_edit_sequence(
            steps in prop::collection::vec(
                (0_usize..3, 0_usize..4, any::<Option<bool>>(), any::<Option<bool>>(), any::<Option<bool>>(), any::<bool>()),
                0..32,
            )
        ) {
            let ruleset_ids = ["int-1", "int-2", "missing"];
            let rule_ids = ["R1", "R2", "R3", "missing"];
            let mut store = seeded();
            let pristine = store.pristine().to_vec();

            for (ruleset_index, rule_index, active, unauthorized, fraud, edit_parameters) in steps {
                let rule_id = RuleId::from(rule_ids[rule_index]);
                if edit_parameters {
                    store.apply_parameters(&rule_id, "[]");
                } else {
                    store.apply_action(
                        &ruleset_ids[ruleset_index].into(),
                        &rule_id,
                        ActionChanges { active, mark_as_unauthorized: unauthorized, mark_as_fraud: fraud },
                    );
                }

                let any_marked = store
                    .mirror()
                    .iter()
                    .flat_map(|ruleset| ruleset.rules.iter())
                    .any(|rule| rule.is_changed);
                prop_assert_eq!(store.is_dirty(), any_marked);
            }

            store.discard();
            prop_assert_eq!(store.mirror(), pristine.as_slice());
            prop_assert!(!store.is_dirty());
        }
    }
}
