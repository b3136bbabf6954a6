//! Cookbook upload gatekeeping.
//!
//! An upload of a frozen cookbook version is only let through when its content matches the
//! source it was released from, its lint checks pass and every dependency it pins is frozen
//! itself. Accepted uploads may be tagged and republished, and configuration changes are
//! recorded in version control.

pub mod audit;
pub mod backends;
pub mod bundle;
pub mod checks;
pub mod compare;
pub mod config;
pub mod constraints;
pub mod error;
pub mod gate;
pub mod logging;
pub mod notify;
pub mod resolve;

pub use audit::{Action, Auditor, Change, ChangeDetails};
pub use backends::Backends;
pub use bundle::{build_bundle, CandidateBundle};
pub use checks::{GateMetrics, LintTool, MetricsSnapshot};
pub use compare::{compare, DiscrepancyKind, DiscrepancyReport, FileHashMap, IgnoreRules};
pub use config::{Config, ConfigHandle, Mode, OrgOption, OptionValue, ValidateChanges};
pub use constraints::{check_dependencies, validate_constraints, ConstraintSet, VersionSpec};
pub use error::{Fault, GateError};
pub use gate::{Decision, GateOutcome, GateReport, Gatekeeper, UploadRequest};
pub use notify::{Notice, Notifier, TracingNotifier};
pub use resolve::{Origin, Resolver, SourceReference};
