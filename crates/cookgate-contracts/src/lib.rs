//! Shared, version-pinned document identifiers.
//!
//! These constants are the single source of truth for schema/version strings that
//! appear in machine-readable I/O (config files, gate reports, audit records).

pub const CONFIG_SCHEMA_VERSION: &str = "cookgate.config@0.1.0";

pub const GATE_REPORT_SCHEMA_VERSION: &str = "cookgate.gate.report@0.1.0";
pub const CONSTRAINTS_REPORT_SCHEMA_VERSION: &str = "cookgate.constraints.report@0.1.0";
pub const IGNORED_REPORT_SCHEMA_VERSION: &str = "cookgate.ignored.report@0.1.0";
pub const RECORD_REPORT_SCHEMA_VERSION: &str = "cookgate.record.report@0.1.0";

/// Fixed commit-message signature used for every version-control write.
pub const COMMITTER_SIGNATURE: &str = "cookgate";

/// Placeholder checksum used to derive an organization id from a sandbox reply.
pub const PLACEHOLDER_CHECKSUM: &str = "00000000000000000000000000000000";

/// Name of the package manifest that is always excluded from content comparison.
pub const METADATA_JSON: &str = "metadata.json";
pub const METADATA_RB: &str = "metadata.rb";

pub const GITIGNORE_FILE: &str = ".gitignore";
pub const CHEFIGNORE_FILE: &str = "chefignore";
