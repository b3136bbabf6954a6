use cookgate_pathspec::PatternError;
use cookgate_pkg::LimitExceeded;
use cookgate_vcs::VcsError;
use serde::Serialize;

use crate::checks::LintTool;
use crate::compare::DiscrepancyKind;
use crate::resolve::Origin;

/// Who has to act on a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Fault {
    /// The upload itself is wrong; retrying the same upload will fail again.
    Client,
    /// A collaborator could not be reached or answered unexpectedly.
    Backend,
}

/// How constraint failures are framed for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Dependencies declared in the uploaded cookbook's metadata.
    Dependencies,
    /// Pins and run-lists of an environment or role.
    Constraints,
    /// As [`Framing::Constraints`], but the change was saved anyway.
    PermissiveConstraints,
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("{}", frozen_overwrite_text())]
    FrozenOverwrite { cookbook: String, version: String },

    #[error("{}", discrepancy_text(.kind, .paths, .source_url, .origin))]
    Discrepancy {
        kind: DiscrepancyKind,
        paths: Vec<String>,
        source_url: String,
        origin: Origin,
    },

    #[error("{}", constraints_text(.failures, .framing))]
    Constraints {
        failures: Vec<String>,
        framing: Framing,
    },

    #[error("{}", source_not_found_text(.cookbook))]
    SourceNotFound { cookbook: String },

    #[error("{}", compare_frame(&unknown_version_text(.cookbook, .version)))]
    UnknownCommunityVersion { cookbook: String, version: String },

    #[error("{}", lint_text(.tool, .output))]
    LintFailed { tool: LintTool, output: String },

    #[error("bundle rejected: {0}")]
    BundleTooLarge(#[from] LimitExceeded),

    #[error("malformed ignore file: {0}")]
    InvalidPattern(#[from] PatternError),

    /// An upstream token was refused; an operator has to replace it.
    #[error("{0}")]
    InvalidToken(String),

    #[error("{message}{}", rollback_note(.rollback_failed))]
    Publish {
        message: String,
        rollback_failed: bool,
    },

    #[error("{0:#}")]
    Backend(anyhow::Error),
}

impl GateError {
    pub fn fault(&self) -> Fault {
        match self {
            Self::FrozenOverwrite { .. }
            | Self::Discrepancy { .. }
            | Self::Constraints { .. }
            | Self::SourceNotFound { .. }
            | Self::UnknownCommunityVersion { .. }
            | Self::LintFailed { .. }
            | Self::BundleTooLarge(_) => Fault::Client,
            Self::InvalidPattern(_)
            | Self::InvalidToken(_)
            | Self::Publish { .. }
            | Self::Backend(_) => Fault::Backend,
        }
    }

    /// HTTP status the proxy answers with.
    pub fn status(&self) -> u16 {
        match self {
            Self::FrozenOverwrite { .. } => 409,
            Self::BundleTooLarge(_) => 413,
            _ if self.fault() == Fault::Client => 412,
            _ => 502,
        }
    }

    /// 412s are the expected outcome of gating and are not logged; everything else is.
    pub fn log(&self, cookbook: &str, user: &str) {
        match self.status() {
            412 => {}
            404 => tracing::warn!(cookbook, user, status = 404, "{self}"),
            status => tracing::error!(cookbook, user, status, "{self}"),
        }
    }
}

impl From<VcsError> for GateError {
    fn from(err: VcsError) -> Self {
        match err {
            VcsError::InvalidToken { .. } => Self::InvalidToken(err.to_string()),
            other => Self::Backend(anyhow::Error::new(other)),
        }
    }
}

impl From<anyhow::Error> for GateError {
    fn from(err: anyhow::Error) -> Self {
        // Bounds enforced deep inside archive plumbing still classify as a client fault.
        match err.downcast::<LimitExceeded>() {
            Ok(limit) => Self::BundleTooLarge(limit),
            Err(err) => Self::Backend(err),
        }
    }
}

fn frozen_overwrite_text() -> &'static str {
    "\n=== Cookbook Upload error found ===\n\
     The cookbook you are trying to upload is frozen!\n\
     It is not allowed to overwrite a frozen cookbook,\n\
     so please bump the version and try again.\n\
     ===================================\n"
}

fn compare_frame(body: &str) -> String {
    format!(
        "\n=== Cookbook Compare errors found ===\n{body}\n=====================================\n"
    )
}

fn source_not_found_text(cookbook: &str) -> String {
    compare_frame(&format!(
        "Failed to locate the source of the {cookbook} cookbook!"
    ))
}

fn lint_text(tool: &LintTool, output: &str) -> String {
    let heading = format!("=== {} errors found ===", tool.title());
    format!("\n{heading}\n{output}\n{}\n", "=".repeat(heading.len()))
}

fn rollback_note(rollback_failed: &bool) -> &'static str {
    if *rollback_failed {
        " - NOTE: Failed to untag the repo during cleanup!"
    } else {
        ""
    }
}

fn unknown_version_text(cookbook: &str, version: &str) -> String {
    format!(
        "You are trying to upload '{cookbook}' version '{version}' which is a\n\
         non-existing version of a community cookbook! Make sure you are using\n\
         an existing community version, or a fork with a pending pull request."
    )
}

pub(crate) fn bullet_list(items: &[String]) -> String {
    format!(" - {}", items.join("\n - "))
}

fn discrepancy_text(
    kind: &DiscrepancyKind,
    paths: &[String],
    source_url: &str,
    origin: &Origin,
) -> String {
    let heading = match kind {
        DiscrepancyKind::Changed => "The following file(s) are changed:",
        DiscrepancyKind::Extra => "Your upload contains more files than the source cookbook:",
        DiscrepancyKind::Missing => "The source cookbook contains more files than your upload:",
    };
    let report = format!("{heading}\n{}", bullet_list(paths));
    let remediation = match origin {
        Origin::Community => {
            "\nMake sure you are using an unchanged community version\n\
             or, if you really need to change something, make a fork to\n\
             https://github.com and create a pull request back to the\n\
             community cookbook before trying to upload the cookbook again.\n"
        }
        Origin::Vcs => {
            "\nMake sure all your changes are merged into the central\n\
             repositories before trying to upload the cookbook again.\n"
        }
        Origin::PrivateRegistry => "",
    };
    format!(
        "\n=== Cookbook Compare errors found ===\n{report}\n\nSource: {source_url}\n{remediation}=====================================\n"
    )
}

fn constraints_text(failures: &[String], framing: &Framing) -> String {
    let list = bullet_list(failures);
    match framing {
        Framing::Dependencies => format!(
            "\n=== Dependency errors found ===\n{list}\n=================================\n"
        ),
        Framing::Constraints => format!(
            "\n=== Cookbook Constraints errors found ===\n{list}\n=========================================\n"
        ),
        Framing::PermissiveConstraints => format!(
            "\n==== Cookbook Constraints errors found ====\n\
             RUNNNING PERMISSIVE MODE: CHANGES ARE SAVED\n\
             \n{list}\n===========================================\n"
        ),
    }
}
