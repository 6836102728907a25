//! Local rule-state reconciliation for the rules console.
//!
//! The crate keeps an editable mirror of the server's rulesets next to the last
//! server-confirmed snapshot, applies flag and parameter edits through the
//! mutation engine, and synchronizes the mirror back through a [`RulesRemote`].

pub mod catalog;
pub mod model;
pub mod mutation;
pub mod parameters;
pub mod store;
pub mod sync;

pub use catalog::{partition_rules, RuleSections, Selection};
pub use model::{
    validate_document, ActionFlags, ChangedField, Rule, RuleId, RuleStatus, Ruleset, RulesetId,
};
pub use mutation::{apply_action, apply_parameters, ActionChanges};
pub use parameters::{
    apply_parameter_edits, has_editable_parameters, parse_custom_parameters,
    serialize_custom_parameters, CustomParameter,
};
pub use store::RuleStore;
pub use sync::{RemoteError, RulesRemote, SaveRequest, SaveTicket, SyncController, SyncError, SyncState};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RulesError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("codec error: {0}")]
    Codec(String),
}
