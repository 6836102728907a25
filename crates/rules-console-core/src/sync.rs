//! Save/discard orchestration over one rules document.
//!
//! A [`SyncController`] owns the session's [`RuleStore`] and moves between
//! `Clean`, `Dirty`, `Saving` and `SaveFailed`. Saves push the whole mirror and
//! adopt the server's echo; discards are local only.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::{Rule, RuleId, Ruleset, RulesetId};
use crate::mutation::ActionChanges;
use crate::store::RuleStore;

/// Server side of the session: the read endpoint and the whole-document write endpoint.
pub trait RulesRemote {
    /// Fetch the current document. `Ok(None)` means the server has nothing to offer yet.
    ///
    /// # Errors
    /// Returns a [`RemoteError`] when the server cannot be reached or answers badly.
    fn fetch_rulesets(&self) -> Result<Option<Vec<Ruleset>>, RemoteError>;

    /// Replace the server document with `rulesets` and return what the server stored.
    ///
    /// # Errors
    /// Returns a [`RemoteError`] when the write is not confirmed.
    fn save_rulesets(&self, rulesets: &[Ruleset]) -> Result<Vec<Ruleset>, RemoteError>;
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RemoteError {
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    #[error("remote did not answer within {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    #[error("remote rejected the request: {0}")]
    Rejected(String),
    #[error("remote contract mismatch: expected {expected}, got {actual}")]
    ContractMismatch { expected: String, actual: String },
    #[error("malformed remote payload: {0}")]
    MalformedPayload(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SyncError {
    #[error("there are no local changes to save")]
    NothingToSave,
    #[error("a save is already in flight")]
    SaveInFlight,
    #[error("save ticket {0} does not match the save in flight")]
    UnknownSaveTicket(SaveTicket),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct SaveTicket(pub Ulid);

impl Display for SaveTicket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Clean,
    Dirty,
    Saving,
    SaveFailed,
}

impl SyncState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Dirty => "dirty",
            Self::Saving => "saving",
            Self::SaveFailed => "save_failed",
        }
    }
}

/// Payload of one outbound save, tagged so the answer can be matched to it.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveRequest {
    pub ticket: SaveTicket,
    pub rulesets: Vec<Ruleset>,
}

#[derive(Debug)]
struct InFlightSave {
    ticket: SaveTicket,
    captured: Vec<Ruleset>,
}

#[derive(Debug, Default)]
pub struct SyncController {
    store: RuleStore,
    in_flight: Option<InFlightSave>,
    failure: Option<RemoteError>,
    last_synced_at: Option<OffsetDateTime>,
}

impl SyncController {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session seeded from the remote's current document.
    ///
    /// # Errors
    /// Returns the remote's error when the initial fetch fails.
    pub fn open(remote: &impl RulesRemote) -> Result<Self, SyncError> {
        let mut controller = Self::new();
        controller.refresh(remote)?;
        Ok(controller)
    }

    #[must_use]
    pub fn state(&self) -> SyncState {
        if self.in_flight.is_some() {
            SyncState::Saving
        } else if self.failure.is_some() {
            SyncState::SaveFailed
        } else if self.store.is_dirty() {
            SyncState::Dirty
        } else {
            SyncState::Clean
        }
    }

    #[must_use]
    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.store.is_dirty()
    }

    #[must_use]
    pub fn get_rule(&self, ruleset_id: &RulesetId, rule_id: &RuleId) -> Option<&Rule> {
        self.store.get_rule(ruleset_id, rule_id)
    }

    /// Error of the last failed save, kept until a retry succeeds or the edits are discarded.
    #[must_use]
    pub fn last_error(&self) -> Option<&RemoteError> {
        self.failure.as_ref()
    }

    #[must_use]
    pub fn last_synced_at(&self) -> Option<OffsetDateTime> {
        self.last_synced_at
    }

    /// Fetch from the remote and adopt the result.
    ///
    /// # Errors
    /// Returns [`SyncError::SaveInFlight`] while saving, or the remote's error; the
    /// session is left untouched in both cases.
    pub fn refresh(&mut self, remote: &impl RulesRemote) -> Result<(), SyncError> {
        if self.in_flight.is_some() {
            return Err(SyncError::SaveInFlight);
        }
        let fetched = remote.fetch_rulesets()?;
        self.adopt_fetched(fetched)
    }

    /// Adopt fetched server data. An absent result seeds an empty document.
    ///
    /// # Errors
    /// Returns [`SyncError::SaveInFlight`] while a save is outstanding.
    pub fn adopt_fetched(&mut self, fetched: Option<Vec<Ruleset>>) -> Result<(), SyncError> {
        if self.in_flight.is_some() {
            return Err(SyncError::SaveInFlight);
        }
        if self.store.is_dirty() {
            warn!(
                changed_rules = self.store.changed_rules().len(),
                "fresh server data replaces unsaved local edits"
            );
        }

        let rulesets = fetched.unwrap_or_default();
        debug!(rulesets = rulesets.len(), "seeding rules session");
        self.store.seed(rulesets);
        self.failure = None;
        self.last_synced_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    /// Returns `true` when the addressed rule exists and was updated.
    pub fn apply_action(
        &mut self,
        ruleset_id: &RulesetId,
        rule_id: &RuleId,
        changes: ActionChanges,
    ) -> bool {
        let applied = self.store.apply_action(ruleset_id, rule_id, changes);
        if applied {
            debug!(%ruleset_id, %rule_id, ?changes, "applied rule action");
        } else {
            debug!(%ruleset_id, %rule_id, "rule action addressed no rule");
        }
        applied
    }

    /// Returns how many rules carried `rule_id` and were updated.
    pub fn apply_parameters(&mut self, rule_id: &RuleId, serialized: &str) -> usize {
        let touched = self.store.apply_parameters(rule_id, serialized);
        debug!(%rule_id, touched, "applied rule parameters");
        touched
    }

    /// Capture the mirror and enter `Saving`.
    ///
    /// # Errors
    /// Returns [`SyncError::SaveInFlight`] for a re-entrant request and
    /// [`SyncError::NothingToSave`] when there is neither an edit nor a failed save to retry.
    pub fn begin_save(&mut self) -> Result<SaveRequest, SyncError> {
        if self.in_flight.is_some() {
            return Err(SyncError::SaveInFlight);
        }
        if !self.store.is_dirty() && self.failure.is_none() {
            return Err(SyncError::NothingToSave);
        }

        let ticket = SaveTicket(Ulid::new());
        let captured = self.store.snapshot();
        info!(
            %ticket,
            rulesets = captured.len(),
            changed_rules = self.store.changed_rules().len(),
            retry = self.failure.is_some(),
            "save started"
        );
        self.in_flight = Some(InFlightSave { ticket, captured: captured.clone() });
        Ok(SaveRequest { ticket, rulesets: captured })
    }

    /// Settle the save identified by `ticket` with the remote's answer.
    ///
    /// On success the server's document becomes both mirror and pristine snapshot. Rules
    /// edited after the save was issued keep their local values and stay flagged.
    ///
    /// # Errors
    /// Returns [`SyncError::UnknownSaveTicket`] when `ticket` is not the save in flight,
    /// and [`SyncError::Remote`] when `outcome` is a failure (the session is then in
    /// `SaveFailed` with all local edits preserved).
    pub fn complete_save(
        &mut self,
        ticket: SaveTicket,
        outcome: Result<Vec<Ruleset>, RemoteError>,
    ) -> Result<(), SyncError> {
        let in_flight = match self.in_flight.take() {
            Some(in_flight) if in_flight.ticket == ticket => in_flight,
            other => {
                self.in_flight = other;
                return Err(SyncError::UnknownSaveTicket(ticket));
            }
        };

        match outcome {
            Ok(saved) => {
                let carried = self.adopt_saved(saved, &in_flight.captured);
                info!(%ticket, carried_edits = carried, "save confirmed");
                Ok(())
            }
            Err(err) => {
                warn!(%ticket, error = %err, "save failed; local edits kept");
                self.failure = Some(err.clone());
                Err(SyncError::Remote(err))
            }
        }
    }

    /// Issue a save through `remote` and settle it.
    ///
    /// # Errors
    /// Propagates the errors of [`Self::begin_save`] and [`Self::complete_save`].
    pub fn save(&mut self, remote: &impl RulesRemote) -> Result<(), SyncError> {
        let request = self.begin_save()?;
        let outcome = remote.save_rulesets(&request.rulesets);
        self.complete_save(request.ticket, outcome)
    }

    /// Revert the mirror to the pristine snapshot and forget any failed save.
    ///
    /// # Errors
    /// Returns [`SyncError::SaveInFlight`] while a save is outstanding.
    pub fn discard(&mut self) -> Result<(), SyncError> {
        if self.in_flight.is_some() {
            return Err(SyncError::SaveInFlight);
        }
        if self.store.is_dirty() {
            info!(changed_rules = self.store.changed_rules().len(), "discarding local edits");
        }
        self.store.discard();
        self.failure = None;
        Ok(())
    }

    fn adopt_saved(&mut self, saved: Vec<Ruleset>, captured: &[Ruleset]) -> usize {
        let local = self.store.snapshot();
        self.store.seed(saved);
        self.failure = None;
        self.last_synced_at = Some(OffsetDateTime::now_utc());

        let mut carried = 0;
        for ruleset in &local {
            for rule in &ruleset.rules {
                let diverged = match find_rule(captured, &ruleset.id, &rule.rule_id) {
                    Some(sent) => !rule.tracked_fields_eq(sent),
                    None => rule.is_changed,
                };
                if diverged && self.store.restore_local_edit(&ruleset.id, rule) {
                    carried += 1;
                }
            }
        }
        carried
    }
}

fn find_rule<'a>(document: &'a [Ruleset], ruleset_id: &RulesetId, rule_id: &RuleId) -> Option<&'a Rule> {
    document.iter().find(|ruleset| &ruleset.id == ruleset_id).and_then(|ruleset| ruleset.rule(rule_id))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::model::fixtures::{rule, ruleset};

    struct ScriptedRemote {
        document: Option<Vec<Ruleset>>,
        save_answers: RefCell<Vec<Result<Option<Vec<Ruleset>>, RemoteError>>>,
        saved_payloads: RefCell<Vec<Vec<Ruleset>>>,
    }

    impl ScriptedRemote {
        fn new(document: Option<Vec<Ruleset>>) -> Self {
            Self { document, save_answers: RefCell::new(Vec::new()), saved_payloads: RefCell::new(Vec::new()) }
        }

        /// Answers are consumed in order; `Ok(None)` echoes the request back.
        fn answer(self, answer: Result<Option<Vec<Ruleset>>, RemoteError>) -> Self {
            self.save_answers.borrow_mut().push(answer);
            self
        }
    }

    impl RulesRemote for ScriptedRemote {
        fn fetch_rulesets(&self) -> Result<Option<Vec<Ruleset>>, RemoteError> {
            Ok(self.document.clone())
        }

        fn save_rulesets(&self, rulesets: &[Ruleset]) -> Result<Vec<Ruleset>, RemoteError> {
            self.saved_payloads.borrow_mut().push(rulesets.to_vec());
            let mut answers = self.save_answers.borrow_mut();
            let answer = if answers.is_empty() { Ok(None) } else { answers.remove(0) };
            answer.map(|saved| saved.unwrap_or_else(|| rulesets.to_vec()))
        }
    }

    fn server_document() -> Vec<Ruleset> {
        vec![
            ruleset("int-1", vec![rule("R1", true, false, false), rule("R2", true, true, false)]),
            ruleset("int-2", vec![rule("R3", true, false, true)]),
        ]
    }

    fn open(remote: &ScriptedRemote) -> SyncController {
        match SyncController::open(remote) {
            Ok(controller) => controller,
            Err(err) => panic!("session should open: {err}"),
        }
    }

    #[test]
    fn open_with_absent_document_seeds_empty_clean_session() {
        let controller = open(&ScriptedRemote::new(None));
        assert!(controller.store().mirror().is_empty());
        assert_eq!(controller.state(), SyncState::Clean);
        assert!(controller.last_synced_at().is_some());
    }

    #[test]
    fn mutation_moves_clean_to_dirty_and_misses_do_not() {
        let remote = ScriptedRemote::new(Some(server_document()));
        let mut controller = open(&remote);

        assert!(!controller.apply_action(&"int-1".into(), &"nope".into(), ActionChanges::active(false)));
        assert_eq!(controller.state(), SyncState::Clean);

        assert!(controller.apply_action(&"int-1".into(), &"R1".into(), ActionChanges::active(false)));
        assert_eq!(controller.state(), SyncState::Dirty);
    }

    #[test]
    fn save_on_clean_session_is_rejected_without_network() {
        let remote = ScriptedRemote::new(Some(server_document()));
        let mut controller = open(&remote);

        assert_eq!(controller.save(&remote), Err(SyncError::NothingToSave));
        assert!(remote.saved_payloads.borrow().is_empty());
    }

    #[test]
    fn successful_save_pushes_whole_document_and_adopts_server_truth() {
        let remote = ScriptedRemote::new(Some(server_document()));
        let mut controller = open(&remote);
        controller.apply_action(&"int-1".into(), &"R2".into(), ActionChanges::mark_as_fraud(true));

        let mut stored = controller.store().snapshot();
        for rule in stored.iter_mut().flat_map(|ruleset| ruleset.rules.iter_mut()) {
            rule.is_changed = false;
        }
        let remote = remote.answer(Ok(Some(stored.clone())));

        assert_eq!(controller.save(&remote), Ok(()));
        assert_eq!(remote.saved_payloads.borrow().len(), 1);
        assert_eq!(remote.saved_payloads.borrow()[0].len(), 2);
        assert_eq!(controller.store().mirror(), stored.as_slice());
        assert_eq!(controller.store().pristine(), stored.as_slice());
        assert!(!controller.is_dirty());
        assert_eq!(controller.state(), SyncState::Clean);
    }

    #[test]
    fn failed_save_keeps_edits_and_enters_save_failed() {
        let remote = ScriptedRemote::new(Some(server_document()))
            .answer(Err(RemoteError::Unavailable("connection refused".to_string())));
        let mut controller = open(&remote);
        controller.apply_action(&"int-1".into(), &"R1".into(), ActionChanges::active(false));
        let edited = controller.store().snapshot();

        let result = controller.save(&remote);

        assert!(matches!(result, Err(SyncError::Remote(RemoteError::Unavailable(_)))));
        assert_eq!(controller.state(), SyncState::SaveFailed);
        assert_eq!(controller.store().mirror(), edited.as_slice());
        assert!(controller.is_dirty());
        assert!(controller.last_error().is_some());
    }

    #[test]
    fn retry_after_failure_moves_back_to_clean() {
        let remote = ScriptedRemote::new(Some(server_document()))
            .answer(Err(RemoteError::Timeout { timeout_ms: 5_000 }))
            .answer(Ok(None));
        let mut controller = open(&remote);
        controller.apply_action(&"int-1".into(), &"R1".into(), ActionChanges::active(false));

        assert!(controller.save(&remote).is_err());
        assert_eq!(controller.save(&remote), Ok(()));
        assert_eq!(controller.state(), SyncState::Clean);
        assert!(controller.last_error().is_none());
        assert!(controller.get_rule(&"int-1".into(), &"R1".into()).is_some_and(|rule| !rule.active));
    }

    #[test]
    fn discard_from_save_failed_restores_pristine() {
        let remote = ScriptedRemote::new(Some(server_document()))
            .answer(Err(RemoteError::Rejected("ruleset id MUST be non-empty".to_string())));
        let mut controller = open(&remote);
        controller.apply_action(&"int-1".into(), &"R1".into(), ActionChanges::active(false));
        assert!(controller.save(&remote).is_err());

        assert_eq!(controller.discard(), Ok(()));
        assert_eq!(controller.state(), SyncState::Clean);
        assert_eq!(controller.store().mirror(), server_document().as_slice());
    }

    #[test]
    fn server_response_wins_wholesale_over_local_fields() {
        let remote = ScriptedRemote::new(Some(server_document()));
        let mut controller = open(&remote);
        controller.apply_parameters(&"R1".into(), r#"[{"name":"minScore","value":"90"}]"#);

        let mut response = server_document();
        response[0].rules[0].description = None;
        response[0].rules.truncate(1);
        response[0].tuning.clear();
        let remote = remote.answer(Ok(Some(response.clone())));

        assert_eq!(controller.save(&remote), Ok(()));
        assert_eq!(controller.store().mirror(), response.as_slice());
        assert!(controller.get_rule(&"int-1".into(), &"R2".into()).is_none());
        assert_eq!(
            controller.get_rule(&"int-1".into(), &"R1".into()).map(|rule| rule.custom_parameters.as_str()),
            Some("")
        );
    }

    #[test]
    fn re_entrant_save_and_discard_are_rejected_while_saving() {
        let remote = ScriptedRemote::new(Some(server_document()));
        let mut controller = open(&remote);
        controller.apply_action(&"int-1".into(), &"R1".into(), ActionChanges::active(false));

        let request = match controller.begin_save() {
            Ok(request) => request,
            Err(err) => panic!("save should start: {err}"),
        };
        assert_eq!(controller.state(), SyncState::Saving);
        assert_eq!(controller.begin_save(), Err(SyncError::SaveInFlight));
        assert_eq!(controller.discard(), Err(SyncError::SaveInFlight));
        assert_eq!(controller.adopt_fetched(None), Err(SyncError::SaveInFlight));

        let stray = SaveTicket(Ulid::new());
        assert_eq!(controller.complete_save(stray, Ok(Vec::new())), Err(SyncError::UnknownSaveTicket(stray)));
        assert_eq!(controller.state(), SyncState::Saving);

        assert_eq!(controller.complete_save(request.ticket, Ok(request.rulesets.clone())), Ok(()));
        assert_eq!(controller.state(), SyncState::Clean);
    }

    #[test]
    fn edits_made_during_save_survive_the_success_response() {
        let remote = ScriptedRemote::new(Some(server_document()));
        let mut controller = open(&remote);
        controller.apply_action(&"int-1".into(), &"R1".into(), ActionChanges::active(false));

        let request = match controller.begin_save() {
            Ok(request) => request,
            Err(err) => panic!("save should start: {err}"),
        };
        controller.apply_action(&"int-2".into(), &"R3".into(), ActionChanges::mark_as_unauthorized(true));

        let mut echo = request.rulesets.clone();
        for rule in echo.iter_mut().flat_map(|ruleset| ruleset.rules.iter_mut()) {
            rule.is_changed = false;
        }
        assert_eq!(controller.complete_save(request.ticket, Ok(echo.clone())), Ok(()));

        assert_eq!(controller.state(), SyncState::Dirty);
        assert_eq!(controller.store().pristine(), echo.as_slice());
        let saved = controller.get_rule(&"int-1".into(), &"R1".into());
        assert!(saved.is_some_and(|rule| !rule.active && !rule.is_changed));
        let pending = controller.get_rule(&"int-2".into(), &"R3".into());
        assert!(pending.is_some_and(|rule| rule.mark_as_unauthorized && !rule.mark_as_fraud && rule.is_changed));
        assert_eq!(controller.store().changed_rules().len(), 1);
    }

    #[test]
    fn mutation_after_failure_stays_in_save_failed_until_retry() {
        let remote = ScriptedRemote::new(Some(server_document()))
            .answer(Err(RemoteError::MalformedPayload("truncated".to_string())));
        let mut controller = open(&remote);
        controller.apply_action(&"int-1".into(), &"R1".into(), ActionChanges::active(false));
        assert!(controller.save(&remote).is_err());

        controller.apply_action(&"int-1".into(), &"R2".into(), ActionChanges::active(false));
        assert_eq!(controller.state(), SyncState::SaveFailed);
        assert_eq!(controller.store().changed_rules().len(), 2);
    }
}
