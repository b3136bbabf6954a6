use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context as _;
use serde::Serialize;

use crate::error::GateError;

/// Foodcritic exits with this code when it found violations.
const FOODCRITIC_VIOLATIONS: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LintTool {
    Foodcritic,
    Rubocop,
}

impl LintTool {
    pub fn title(self) -> &'static str {
        match self {
            Self::Foodcritic => "Foodcritic",
            Self::Rubocop => "Rubocop",
        }
    }
}

/// Counters for failed checks that were let through or not.
#[derive(Debug, Default)]
pub struct GateMetrics {
    checks_bypassed: AtomicU64,
    checks_denied: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub checks_bypassed: u64,
    pub checks_denied: u64,
}

impl GateMetrics {
    pub fn record_bypass(&self, tool: LintTool, cookbook: &str) {
        self.checks_bypassed.fetch_add(1, Ordering::Relaxed);
        tracing::info!(event = "check_bypassed", tool = tool.title(), cookbook);
    }

    pub fn record_denied(&self, tool: LintTool, cookbook: &str) {
        self.checks_denied.fetch_add(1, Ordering::Relaxed);
        tracing::info!(event = "check_denied", tool = tool.title(), cookbook);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            checks_bypassed: self.checks_bypassed.load(Ordering::Relaxed),
            checks_denied: self.checks_denied.load(Ordering::Relaxed),
        }
    }
}

/// Tool locations and options for one organization.
#[derive(Debug, Clone, Default)]
pub struct LintSettings {
    pub foodcritic: Option<PathBuf>,
    pub rubocop: Option<PathBuf>,
    pub include_fcs: Option<String>,
    pub exclude_fcs: Vec<String>,
    /// `HOME` for rubocop, so it does not pick up a user configuration.
    pub home: PathBuf,
}

pub fn foodcritic_args(settings: &LintSettings, cookbook_dir: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    if !settings.exclude_fcs.is_empty() {
        let tags: Vec<String> = settings
            .exclude_fcs
            .iter()
            .map(|fc| format!("~{fc}"))
            .collect();
        args.push("--tags".into());
        args.push(tags.join(",").into());
    }
    if let Some(include) = settings.include_fcs.as_deref().filter(|s| !s.is_empty()) {
        args.push("--include".into());
        args.push(include.into());
    }
    args.push("--no-progress".into());
    args.push("--cookbook-path".into());
    args.push(cookbook_dir.as_os_str().to_owned());
    args
}

/// stdout and stderr, with the bundle directory prefix removed from reported paths.
fn tool_output(output: &std::process::Output, cookbook_dir: &Path) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    let prefix = format!("{}/", cookbook_dir.display());
    text.replace(&prefix, "").trim().to_string()
}

fn run_foodcritic(
    tool: &Path,
    settings: &LintSettings,
    cookbook_dir: &Path,
) -> Result<(), GateError> {
    let args = foodcritic_args(settings, cookbook_dir);
    let output = Command::new(tool)
        .args(&args)
        .env("RUBY_THREAD_VM_STACK_SIZE", "2097152")
        .output()
        .with_context(|| format!("Failed to execute \"{}\"", tool.display()))?;
    let text = tool_output(&output, cookbook_dir);
    if !output.status.success() && output.status.code() != Some(FOODCRITIC_VIOLATIONS) {
        return Err(GateError::Backend(anyhow::anyhow!(
            "Failed to execute \"{} {}\": {text} - {}",
            tool.display(),
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" "),
            output.status
        )));
    }
    // Newer foodcritic releases exit 0 even when they report violations.
    if output.status.code() == Some(FOODCRITIC_VIOLATIONS) || !text.is_empty() {
        return Err(GateError::LintFailed {
            tool: LintTool::Foodcritic,
            output: text,
        });
    }
    Ok(())
}

fn run_rubocop(tool: &Path, settings: &LintSettings, cookbook_dir: &Path) -> Result<(), GateError> {
    let output = Command::new(tool)
        .arg(cookbook_dir)
        .env_clear()
        .env("HOME", &settings.home)
        .output()
        .with_context(|| format!("Failed to execute \"{}\"", tool.display()))?;
    if output.status.success() {
        return Ok(());
    }
    let text = tool_output(&output, cookbook_dir);
    if text.contains("offense") {
        return Err(GateError::LintFailed {
            tool: LintTool::Rubocop,
            output: text,
        });
    }
    Err(GateError::Backend(anyhow::anyhow!(
        "Failed to execute \"rubocop {}\": {text} - {}",
        cookbook_dir.display(),
        output.status
    )))
}

/// Runs the configured tools against the bundle directory. A lint failure is let through when
/// `bypass_allowed` is set (a forced upload under permissive mode); tool failures never are.
/// Returns the tools whose failures were bypassed.
pub fn run_checks(
    settings: &LintSettings,
    cookbook_dir: &Path,
    bypass_allowed: bool,
    metrics: &GateMetrics,
    cookbook: &str,
    user: &str,
) -> Result<Vec<LintTool>, GateError> {
    let mut bypassed = Vec::new();
    let tools = [
        (LintTool::Foodcritic, settings.foodcritic.as_deref()),
        (LintTool::Rubocop, settings.rubocop.as_deref()),
    ];
    for (kind, tool) in tools {
        let Some(tool) = tool else {
            continue;
        };
        let result = match kind {
            LintTool::Foodcritic => run_foodcritic(tool, settings, cookbook_dir),
            LintTool::Rubocop => run_rubocop(tool, settings, cookbook_dir),
        };
        match result {
            Ok(()) => {}
            Err(err @ GateError::LintFailed { .. }) => {
                tracing::warn!(
                    cookbook,
                    user,
                    "{} errors when uploading cookbook '{cookbook}' for '{user}'",
                    kind.title()
                );
                if !bypass_allowed {
                    metrics.record_denied(kind, cookbook);
                    return Err(err);
                }
                metrics.record_bypass(kind, cookbook);
                bypassed.push(kind);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(bypassed)
}
