use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cookgate::audit::{Action, Auditor, Change, ChangeDetails};
use cookgate::config::{ConfigHandle, OrgOption};
use cookgate::error::{Fault, Framing, GateError};
use cookgate::gate::{upload_change, GateReport, Gatekeeper, UploadRequest};
use cookgate::{constraints, logging, Backends, IgnoreRules, TracingNotifier};
use cookgate_contracts::{
    CONSTRAINTS_REPORT_SCHEMA_VERSION, IGNORED_REPORT_SCHEMA_VERSION, RECORD_REPORT_SCHEMA_VERSION,
};
use cookgate_pkg::CookbookVersion;
use cookgate_vcs::LockTable;
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "cookgate")]
#[command(about = "Cookbook upload gatekeeping.", long_about = None)]
#[command(version)]
struct Cli {
    /// Append logs to this file instead of stderr.
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Raise the log level (repeatable).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the upload gate for a cookbook version document.
    Gate(GateArgs),
    /// Validate the cookbook pins and run-lists of an environment or role.
    Constraints(ConstraintsArgs),
    /// Show which paths a comparison would ignore.
    Ignored(IgnoredArgs),
    /// Commit a configuration change to the audit trail.
    Record(RecordArgs),
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[arg(long, value_name = "PATH")]
    config: PathBuf,

    /// Organization the request was made for.
    #[arg(long)]
    org: Option<String>,
}

#[derive(Args, Debug)]
struct GateArgs {
    #[command(flatten)]
    common: ConfigArgs,

    #[arg(long)]
    user: String,

    /// The upload was forced by the client.
    #[arg(long)]
    force: bool,

    /// Client user agent.
    #[arg(long)]
    agent: Option<String>,

    #[arg(value_name = "COOKBOOK_JSON")]
    cookbook: PathBuf,
}

#[derive(Args, Debug)]
struct ConstraintsArgs {
    #[command(flatten)]
    common: ConfigArgs,

    #[arg(value_name = "ITEM_JSON")]
    item: PathBuf,
}

#[derive(Args, Debug)]
struct IgnoredArgs {
    #[arg(long, value_name = "PATH")]
    gitignore: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    chefignore: Option<PathBuf>,

    #[arg(required = true)]
    paths: Vec<String>,
}

#[derive(Args, Debug)]
struct RecordArgs {
    #[command(flatten)]
    common: ConfigArgs,

    #[arg(long)]
    user: String,

    /// Object type, e.g. `roles`, `environments`, `nodes` or `data_bags`.
    #[arg(long)]
    kind: String,

    /// Item name; `<bag>` or `<bag>/<item>` for data bags. Taken from the body when omitted.
    #[arg(long)]
    item: Option<String>,

    /// HTTP method of the change: POST, PUT or DELETE.
    #[arg(long)]
    action: String,

    #[arg(value_name = "BODY_JSON")]
    body: Option<PathBuf>,
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Command::Gate(args) => cmd_gate(cli.log_file.as_deref(), cli.verbose, args),
        Command::Constraints(args) => cmd_constraints(cli.log_file.as_deref(), cli.verbose, args),
        Command::Ignored(args) => {
            logging::init(cli.log_file.as_deref(), cli.verbose)?;
            cmd_ignored(args)
        }
        Command::Record(args) => cmd_record(cli.log_file.as_deref(), cli.verbose, args),
    }
}

/// Loads the configuration, then starts logging so `default.log_file` can take effect.
fn load_config(args: &ConfigArgs, log_file: Option<&Path>, verbosity: u8) -> Result<Arc<ConfigHandle>> {
    let handle = ConfigHandle::load(&args.config)?;
    let cfg = handle.snapshot();
    logging::init(log_file.or(cfg.default.log_file.as_deref()), verbosity)?;
    Ok(Arc::new(handle))
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("read: {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_for(fault: Option<Fault>) -> ExitCode {
    match fault {
        None => ExitCode::SUCCESS,
        Some(Fault::Client) => ExitCode::from(1),
        Some(Fault::Backend) => ExitCode::from(2),
    }
}

fn cmd_gate(log_file: Option<&Path>, verbosity: u8, args: GateArgs) -> Result<ExitCode> {
    let config = load_config(&args.common, log_file, verbosity)?;
    let cfg = config.snapshot();
    let backends = Backends::from_config(&cfg)?;
    let cookbook = CookbookVersion::from_json(&read_file(&args.cookbook)?)
        .with_context(|| format!("load cookbook: {}", args.cookbook.display()))?;
    let req = UploadRequest {
        organization: args.common.org.clone(),
        user: args.user.clone(),
        cookbook,
        forced: args.force,
        client_agent: args.agent.clone(),
    };

    let gate = Gatekeeper::new(Arc::clone(&config), backends.clone());
    let result = gate.process(&req);
    match &result {
        Ok(outcome) => {
            let org = req.organization.as_deref();
            if cfg.flag(org, OrgOption::CommitChanges) && cfg.default.git_organization.is_some() {
                let auditor = Auditor::new(
                    Arc::clone(&config),
                    backends,
                    Arc::new(LockTable::new()),
                    Arc::new(TracingNotifier),
                );
                let change = upload_change(&req, outcome.source.as_ref())?;
                if let Err(err) = auditor.record(&change) {
                    tracing::error!(cookbook = %req.cookbook.cookbook_name, "Failed to record upload: {err:#}");
                }
            }
        }
        Err(err) => err.log(&req.cookbook.cookbook_name, &req.user),
    }

    let report = GateReport::new(&req.cookbook, &result);
    print_json(&report)?;
    Ok(exit_for(report.fault))
}

#[derive(Debug, Serialize)]
struct ConstraintsReport {
    schema_version: &'static str,
    ok: bool,
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    fault: Option<Fault>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

fn cmd_constraints(log_file: Option<&Path>, verbosity: u8, args: ConstraintsArgs) -> Result<ExitCode> {
    let config = load_config(&args.common, log_file, verbosity)?;
    let cfg = config.snapshot();
    let backends = Backends::from_config(&cfg)?;
    let body = read_file(&args.item)?;

    let result = constraints::validate_constraints(
        backends.chef.as_ref(),
        &cfg,
        args.common.org.as_deref(),
        &body,
    );
    let report = match result {
        Ok(()) => ConstraintsReport {
            schema_version: CONSTRAINTS_REPORT_SCHEMA_VERSION,
            ok: true,
            status: 200,
            fault: None,
            message: None,
        },
        // Permissive mode reports, but the change goes through.
        Err(err @ GateError::Constraints {
            framing: Framing::PermissiveConstraints,
            ..
        }) => ConstraintsReport {
            schema_version: CONSTRAINTS_REPORT_SCHEMA_VERSION,
            ok: true,
            status: 200,
            fault: None,
            message: Some(err.to_string()),
        },
        Err(err) => {
            err.log(&args.item.display().to_string(), "");
            ConstraintsReport {
                schema_version: CONSTRAINTS_REPORT_SCHEMA_VERSION,
                ok: false,
                status: err.status(),
                fault: Some(err.fault()),
                message: Some(err.to_string()),
            }
        }
    };
    print_json(&report)?;
    Ok(exit_for(report.fault))
}

#[derive(Debug, Serialize)]
struct IgnoredPath {
    path: String,
    ignored: bool,
}

#[derive(Debug, Serialize)]
struct IgnoredReport {
    schema_version: &'static str,
    paths: Vec<IgnoredPath>,
}

fn cmd_ignored(args: IgnoredArgs) -> Result<ExitCode> {
    let gitignore = args.gitignore.as_deref().map(read_file).transpose()?;
    let chefignore = args.chefignore.as_deref().map(read_file).transpose()?;
    let rules = IgnoreRules::new(gitignore.as_deref(), chefignore.as_deref())?;
    let report = IgnoredReport {
        schema_version: IGNORED_REPORT_SCHEMA_VERSION,
        paths: args
            .paths
            .into_iter()
            .map(|path| IgnoredPath {
                ignored: rules.is_ignored(&path),
                path,
            })
            .collect(),
    };
    print_json(&report)?;
    Ok(ExitCode::SUCCESS)
}

#[derive(Debug, Serialize)]
struct RecordReport {
    schema_version: &'static str,
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    commit: Option<String>,
}

fn record_details(args: &RecordArgs, body: &[u8]) -> Result<ChangeDetails> {
    match (args.kind.as_str(), args.item.as_deref()) {
        ("data_bags", Some(item)) => Ok(match item.split_once('/') {
            Some((bag, item)) => ChangeDetails::data_bag(bag, Some(item)),
            None => ChangeDetails::data_bag(item, None),
        }),
        (kind, Some(item)) => Ok(ChangeDetails::new(kind, &format!("{item}.json"))),
        (kind, None) => ChangeDetails::from_body(kind, body),
    }
}

fn cmd_record(log_file: Option<&Path>, verbosity: u8, args: RecordArgs) -> Result<ExitCode> {
    let config = load_config(&args.common, log_file, verbosity)?;
    let cfg = config.snapshot();
    let backends = Backends::from_config(&cfg)?;
    let body = match &args.body {
        Some(path) => read_file(path)?,
        None => Vec::new(),
    };
    let change = Change {
        organization: args.common.org.clone(),
        user: args.user.clone(),
        action: Action::from_method(&args.action)?,
        details: record_details(&args, &body)?,
        body,
    };
    let auditor = Auditor::new(
        config,
        backends,
        Arc::new(LockTable::new()),
        Arc::new(TracingNotifier),
    );
    let commit = auditor.record(&change)?;
    print_json(&RecordReport {
        schema_version: RECORD_REPORT_SCHEMA_VERSION,
        path: change.details.path(),
        commit,
    })?;
    Ok(ExitCode::SUCCESS)
}
