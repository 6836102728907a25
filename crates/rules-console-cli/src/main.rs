use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use rules_console_api::{HttpRulesRemote, RemoteConfig, RulesConsoleApi};
use rules_console_core::{
    apply_parameter_edits, has_editable_parameters, parse_custom_parameters, partition_rules,
    ActionChanges, RemoteError, Rule, RuleId, Ruleset, RulesRemote, RulesetId, Selection,
    SyncController,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "rc")]
#[command(about = "Rules Console CLI")]
struct Cli {
    #[arg(long, default_value = "./rules_console.sqlite3")]
    db: PathBuf,

    /// Talk to a running rules console service instead of the local database.
    #[arg(long)]
    server: Option<String>,

    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Rules {
        #[command(subcommand)]
        command: Box<RulesCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Import(DbImportArgs),
    State,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum RulesCommand {
    List(ListArgs),
    Show(ShowArgs),
    Apply(ApplyArgs),
    ApplyPlan(ApplyPlanArgs),
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long)]
    ruleset: Option<String>,
}

#[derive(Debug, Args)]
struct ShowArgs {
    #[arg(long)]
    ruleset: Option<String>,
    #[arg(long, requires = "ruleset")]
    rule: Option<String>,
}

#[derive(Debug, Args)]
struct ApplyArgs {
    #[arg(long)]
    ruleset: String,
    #[arg(long)]
    rule: String,
    #[arg(long, action = ArgAction::Set)]
    active: Option<bool>,
    #[arg(long, action = ArgAction::Set)]
    mark_as_unauthorized: Option<bool>,
    #[arg(long, action = ArgAction::Set)]
    mark_as_fraud: Option<bool>,
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct ApplyPlanArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanStep {
    ruleset_id: RulesetId,
    rule_id: RuleId,
    #[serde(default)]
    changes: ActionChanges,
    #[serde(default)]
    parameters: BTreeMap<String, String>,
}

/// Where the session reads from and saves to.
enum Backend {
    Local(RulesConsoleApi),
    Http(HttpRulesRemote),
}

impl Backend {
    fn from_cli(cli: &Cli) -> Self {
        match &cli.server {
            Some(server) => {
                let config = RemoteConfig::from_env()
                    .with_base_url(Some(server))
                    .with_timeout_ms(cli.timeout_ms);
                Self::Http(HttpRulesRemote::new(config))
            }
            None => Self::Local(RulesConsoleApi::new(cli.db.clone())),
        }
    }

    fn describe(&self, db: &Path) -> Value {
        match self {
            Self::Local(_) => json!({ "kind": "local", "db": db.display().to_string() }),
            Self::Http(remote) => json!({
                "kind": "http",
                "base_url": remote.config().base_url,
                "timeout_ms": remote.config().timeout_ms,
            }),
        }
    }
}

impl RulesRemote for Backend {
    fn fetch_rulesets(&self) -> Result<Option<Vec<Ruleset>>, RemoteError> {
        match self {
            Self::Local(api) => RulesRemote::fetch_rulesets(api),
            Self::Http(remote) => remote.fetch_rulesets(),
        }
    }

    fn save_rulesets(&self, rulesets: &[Ruleset]) -> Result<Vec<Ruleset>, RemoteError> {
        match self {
            Self::Local(api) => RulesRemote::save_rulesets(api, rulesets),
            Self::Http(remote) => remote.save_rulesets(rulesets),
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    let (name, value) =
        raw.split_once('=').ok_or_else(|| format!("parameter `{raw}` MUST be name=value"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("parameter `{raw}` MUST have a non-empty name"));
    }
    Ok((name.to_string(), value.to_string()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let backend = Backend::from_cli(&cli);
    match cli.command {
        Command::Db { command } => run_db(command, &RulesConsoleApi::new(cli.db.clone())),
        Command::Rules { command } => run_rules(*command, &backend, &backend.describe(&cli.db)),
    }
}

fn run_db(command: DbCommand, api: &RulesConsoleApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
        DbCommand::Import(args) => {
            let summary = api.import_document(&args.input)?;
            info!(source = %summary.source, revision = summary.state.revision, "imported rules document");
            emit_json(serde_json::to_value(summary)?)
        }
        DbCommand::State => emit_json(serde_json::to_value(api.document_state()?)?),
    }
}

fn run_rules(command: RulesCommand, backend: &Backend, backend_info: &Value) -> Result<()> {
    let mut controller = SyncController::open(backend).context("failed to load rules document")?;
    debug!(rulesets = controller.store().mirror().len(), "opened rules session");

    match command {
        RulesCommand::List(args) => run_rules_list(&args, &controller, backend_info),
        RulesCommand::Show(args) => run_rules_show(&args, &controller),
        RulesCommand::Apply(args) => run_rules_apply(args, &mut controller, backend),
        RulesCommand::ApplyPlan(args) => run_rules_apply_plan(&args, &mut controller, backend),
    }
}

fn rule_summary(rule: &Rule) -> Value {
    json!({
        "rule_id": rule.rule_id,
        "code": rule.code,
        "codename": rule.codename,
        "name": rule.name,
        "premium": rule.premium,
        "status": rule.status().as_str(),
        "editable_parameters": has_editable_parameters(&rule.custom_parameters),
    })
}

fn run_rules_list(args: &ListArgs, controller: &SyncController, backend_info: &Value) -> Result<()> {
    let mirror = controller.store().mirror();
    let mut selection = Selection::default();
    if let Some(ruleset) = &args.ruleset {
        let ruleset_id = RulesetId::from(ruleset.as_str());
        if controller.store().ruleset(&ruleset_id).is_none() {
            bail!("ruleset `{ruleset_id}` does not exist");
        }
        selection.select_ruleset(ruleset_id);
    }
    selection.reconcile(mirror);

    let listed = mirror.iter().filter(|ruleset| {
        args.ruleset.is_none() || selection.ruleset_id.as_ref() == Some(&ruleset.id)
    });
    let rulesets = listed
        .map(|ruleset| {
            let sections = partition_rules(ruleset);
            json!({
                "id": ruleset.id,
                "name": ruleset.name,
                "active": ruleset.active,
                "listed_total": sections.listed_total(),
                "premium": sections.premium.iter().map(|rule| rule_summary(rule)).collect::<Vec<_>>(),
                "normal": sections.normal.iter().map(|rule| rule_summary(rule)).collect::<Vec<_>>(),
                "custom": sections.custom.iter().map(|rule| rule_summary(rule)).collect::<Vec<_>>(),
            })
        })
        .collect::<Vec<_>>();

    emit_json(json!({
        "backend": backend_info,
        "selection": selection,
        "rulesets": rulesets,
    }))
}

fn run_rules_show(args: &ShowArgs, controller: &SyncController) -> Result<()> {
    let mirror = controller.store().mirror();
    let mut selection = Selection::default();
    if let Some(ruleset) = &args.ruleset {
        selection.select_ruleset(RulesetId::from(ruleset.as_str()));
    }
    if let Some(rule) = &args.rule {
        selection.select_rule(RuleId::from(rule.as_str()));
    }

    let requested = selection.clone();
    selection.reconcile(mirror);
    if requested.ruleset_id.is_some() && requested.ruleset_id != selection.ruleset_id {
        bail!("ruleset `{}` does not exist", args.ruleset.as_deref().unwrap_or_default());
    }
    if requested.rule_id.is_some() && requested.rule_id != selection.rule_id {
        bail!(
            "rule `{}` does not exist in ruleset `{}`",
            args.rule.as_deref().unwrap_or_default(),
            selection.ruleset_id.as_ref().map(RulesetId::as_str).unwrap_or_default()
        );
    }

    let (Some(ruleset), Some(rule)) =
        (selection.selected_ruleset(mirror), selection.selected_rule(mirror))
    else {
        bail!("the rules document has no rule to show");
    };

    emit_json(json!({
        "ruleset_id": ruleset.id,
        "ruleset_name": ruleset.name,
        "status": rule.status().as_str(),
        "parameters": parse_custom_parameters(&rule.custom_parameters),
        "rule": rule,
    }))
}

/// Apply one edit to the session mirror. Fails when the rule is unknown, nothing is
/// requested, or parameters are edited on a rule that has none.
fn apply_step(
    controller: &mut SyncController,
    ruleset_id: &RulesetId,
    rule_id: &RuleId,
    changes: ActionChanges,
    edits: &BTreeMap<String, String>,
) -> Result<()> {
    let Some(rule) = controller.get_rule(ruleset_id, rule_id) else {
        bail!("rule `{rule_id}` does not exist in ruleset `{ruleset_id}`");
    };
    if changes.is_empty() && edits.is_empty() {
        bail!("nothing to apply to rule `{rule_id}`; pass an action flag or --param");
    }

    let serialized = if edits.is_empty() {
        None
    } else {
        let edited = apply_parameter_edits(&rule.custom_parameters, edits)
            .with_context(|| format!("failed to edit parameters of rule `{rule_id}`"))?;
        Some(edited.ok_or_else(|| anyhow!("rule `{rule_id}` has no editable parameters"))?)
    };

    if !changes.is_empty() {
        controller.apply_action(ruleset_id, rule_id, changes);
    }
    if let Some(serialized) = serialized {
        controller.apply_parameters(rule_id, &serialized);
    }
    Ok(())
}

fn finish_session(
    controller: &mut SyncController,
    backend: &Backend,
    dry_run: bool,
) -> Result<Vec<Value>> {
    let changed = controller
        .store()
        .changed_rules()
        .into_iter()
        .map(|(ruleset_id, rule)| {
            json!({
                "ruleset_id": ruleset_id,
                "rule_id": rule.rule_id,
                "changed_fields": controller.store().changed_fields(ruleset_id, &rule.rule_id),
                "status": rule.status().as_str(),
            })
        })
        .collect::<Vec<_>>();

    if dry_run {
        controller.discard()?;
    } else {
        controller.save(backend).context("failed to save rules document")?;
        info!(changed_rules = changed.len(), "saved rules document");
    }
    Ok(changed)
}

fn run_rules_apply(args: ApplyArgs, controller: &mut SyncController, backend: &Backend) -> Result<()> {
    let ruleset_id = RulesetId::from(args.ruleset);
    let rule_id = RuleId::from(args.rule);
    let changes = ActionChanges {
        active: args.active,
        mark_as_unauthorized: args.mark_as_unauthorized,
        mark_as_fraud: args.mark_as_fraud,
    };
    let edits = args.params.into_iter().collect::<BTreeMap<_, _>>();

    apply_step(controller, &ruleset_id, &rule_id, changes, &edits)?;
    let preview = controller.get_rule(&ruleset_id, &rule_id).cloned();
    let changed = finish_session(controller, backend, args.dry_run)?;
    let rule = if args.dry_run { preview } else { controller.get_rule(&ruleset_id, &rule_id).cloned() };

    emit_json(json!({
        "dry_run": args.dry_run,
        "saved": !args.dry_run,
        "state": controller.state().as_str(),
        "changed": changed,
        "rule": rule,
    }))
}

fn run_rules_apply_plan(
    args: &ApplyPlanArgs,
    controller: &mut SyncController,
    backend: &Backend,
) -> Result<()> {
    let bytes = fs::read(&args.input)
        .with_context(|| format!("failed to read plan file {}", args.input.display()))?;
    let steps: Vec<PlanStep> = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse plan file {}", args.input.display()))?;
    if steps.is_empty() {
        bail!("plan file {} contains no steps", args.input.display());
    }

    for (index, step) in steps.iter().enumerate() {
        apply_step(controller, &step.ruleset_id, &step.rule_id, step.changes, &step.parameters)
            .with_context(|| format!("plan step {} failed", index + 1))?;
    }
    let changed = finish_session(controller, backend, args.dry_run)?;

    emit_json(json!({
        "dry_run": args.dry_run,
        "saved": !args.dry_run,
        "steps": steps.len(),
        "state": controller.state().as_str(),
        "changed": changed,
    }))
}
