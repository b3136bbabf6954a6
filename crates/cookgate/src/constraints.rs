//! Version-freeze validation for cookbook dependencies and for the pins/run-lists of
//! environments and roles.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::Context as _;
use cookgate_pkg::ChefServer;
use regex::Regex;
use serde::Deserialize;

use crate::config::{Config, ValidateChanges};
use crate::error::{Framing, GateError};

/// The version that stands for "any version".
pub const NO_CONSTRAINT: &str = "0.0.0";

static EXACT_VERSION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:= )?(\d+\.\d+\.\d+)$").expect("exact version regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSpec {
    Exact(String),
    /// Anything but `x.y.z` / `= x.y.z`; keeps the raw constraint.
    Malformed(String),
}

impl VersionSpec {
    pub fn parse(constraint: &str) -> Self {
        match EXACT_VERSION_REGEX.captures(constraint) {
            Some(caps) => Self::Exact(caps[1].to_string()),
            None => Self::Malformed(constraint.to_string()),
        }
    }

    /// Constraints that never need checking.
    fn is_unconstrained(&self) -> bool {
        match self {
            Self::Exact(v) => v == NO_CONSTRAINT,
            Self::Malformed(raw) => raw == ">= 0.0.0",
        }
    }
}

/// Cookbook name to the versions required of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstraintSet(BTreeMap<String, Vec<VersionSpec>>);

impl ConstraintSet {
    pub fn from_cookbook_versions(pins: &BTreeMap<String, String>) -> Self {
        Self(
            pins.iter()
                .map(|(name, c)| (name.clone(), vec![VersionSpec::parse(c)]))
                .collect(),
        )
    }

    /// Collects `recipe[name::recipe@x.y.z]` entries. Entries without a version pin are not
    /// constraints and are skipped.
    pub fn from_run_list(entries: &[String]) -> Result<Self, GateError> {
        let re = Regex::new(r"^.*\[(\w+).*@(\d+\.\d+\.\d+)\]$")
            .context("compile run-list pattern")?;
        let mut out: BTreeMap<String, Vec<VersionSpec>> = BTreeMap::new();
        for entry in entries {
            let Some(caps) = re.captures(entry) else {
                continue;
            };
            let spec = VersionSpec::Exact(caps[2].to_string());
            let versions = out.entry(caps[1].to_string()).or_default();
            if !versions.contains(&spec) {
                versions.push(spec);
            }
        }
        Ok(Self(out))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VersionSpec)> {
        self.0
            .iter()
            .flat_map(|(name, specs)| specs.iter().map(move |s| (name.as_str(), s)))
    }
}

/// Whether `name` `version` is frozen on the server. A version the server does not know is
/// not frozen.
pub fn cookbook_frozen(
    chef: &dyn ChefServer,
    org: Option<&str>,
    name: &str,
    version: &str,
) -> Result<bool, GateError> {
    let found = chef
        .cookbook_version(org, name, version)
        .with_context(|| format!("Failed to get info for cookbook {name} version {version}"))?;
    Ok(found.is_some_and(|cb| cb.frozen))
}

/// Checks every constraint and returns all failures together. Malformed constraints only fail
/// when `strict` is set.
pub fn check_dependencies(
    chef: &dyn ChefServer,
    org: Option<&str>,
    constraints: &ConstraintSet,
    strict: bool,
) -> Result<Vec<String>, GateError> {
    let mut failures = Vec::new();
    for (name, spec) in constraints.iter() {
        if spec.is_unconstrained() {
            continue;
        }
        match spec {
            VersionSpec::Malformed(raw) => {
                if strict {
                    failures.push(format!(
                        "constraint '{raw}' for {name} needs to be more specific (= x.x.x)"
                    ));
                }
            }
            VersionSpec::Exact(version) => {
                if !cookbook_frozen(chef, org, name, version)? {
                    failures.push(format!("{name} version {version} needs to be frozen"));
                }
            }
        }
    }
    Ok(failures)
}

/// The constraint-bearing parts of an environment or role document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigItemConstraints {
    #[serde(default)]
    pub cookbook_versions: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub run_list: Option<Vec<String>>,
    #[serde(default)]
    pub env_run_lists: Option<BTreeMap<String, Vec<String>>>,
}

impl ConfigItemConstraints {
    /// Per-environment run-lists are folded into `run_list`.
    pub fn from_json(body: &[u8]) -> anyhow::Result<Self> {
        let mut item: Self = serde_json::from_slice(body).with_context(|| {
            format!("Failed to unmarshal body {}", String::from_utf8_lossy(body))
        })?;
        if let Some(env_lists) = item.env_run_lists.take() {
            let run_list = item.run_list.get_or_insert_with(Vec::new);
            for entries in env_lists.into_values() {
                run_list.extend(entries);
            }
        }
        Ok(item)
    }
}

/// Validates an environment or role for `org` according to its `validate_changes` mode.
/// Pins are checked before run-lists; the first group with failures is reported.
pub fn validate_constraints(
    chef: &dyn ChefServer,
    config: &Config,
    org: Option<&str>,
    body: &[u8],
) -> Result<(), GateError> {
    let framing = match config.validate_changes(org) {
        ValidateChanges::Silent => return Ok(()),
        ValidateChanges::Enforced => Framing::Constraints,
        ValidateChanges::Permissive => Framing::PermissiveConstraints,
    };
    let item = ConfigItemConstraints::from_json(body)?;

    let mut groups = Vec::new();
    if let Some(pins) = &item.cookbook_versions {
        groups.push(ConstraintSet::from_cookbook_versions(pins));
    }
    if let Some(run_list) = &item.run_list {
        groups.push(ConstraintSet::from_run_list(run_list)?);
    }
    for set in groups {
        let failures = check_dependencies(chef, org, &set, true)?;
        if !failures.is_empty() {
            return Err(GateError::Constraints { failures, framing });
        }
    }
    Ok(())
}
