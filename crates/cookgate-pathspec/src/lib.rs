//! Ignore-file matching for cookbook content comparison.
//!
//! Two grammars are understood:
//! - [`Grammar::GitIgnore`]: path-segment globs with `**`, leading-slash anchoring and
//!   trailing-slash directory matching (`.gitignore`).
//! - [`Grammar::ChefIgnore`]: whole-path globs where `*` also crosses `/` (`chefignore`).
//!
//! Both grammars evaluate patterns in file order and the last matching pattern decides, so a
//! later `!pattern` re-includes a path excluded earlier. A path no pattern matches is not ignored.

mod chefignore;
mod gitignore;

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Grammar {
    GitIgnore,
    ChefIgnore,
}

impl Grammar {
    pub fn as_str(self) -> &'static str {
        match self {
            Grammar::GitIgnore => ".gitignore",
            Grammar::ChefIgnore => "chefignore",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{grammar} line {line}: invalid pattern {pattern:?}: {reason}")]
pub struct PatternError {
    pub grammar: &'static str,
    pub line: usize,
    pub pattern: String,
    pub reason: String,
}

#[derive(Debug)]
enum Matcher {
    Regex(regex::Regex),
    Glob(globset::GlobMatcher),
}

impl Matcher {
    fn is_match(&self, path: &str) -> bool {
        match self {
            Matcher::Regex(re) => re.is_match(path),
            Matcher::Glob(glob) => glob.is_match(path),
        }
    }
}

#[derive(Debug)]
struct Rule {
    matcher: Matcher,
    negated: bool,
}

/// A parsed ignore file. Parsing fails on the first malformed pattern.
#[derive(Debug, Default)]
pub struct IgnoreFile {
    rules: Vec<Rule>,
}

impl IgnoreFile {
    pub fn parse(grammar: Grammar, source: &str) -> Result<Self, PatternError> {
        let mut rules = Vec::new();
        for (idx, raw) in source.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (negated, body) = match line.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, line),
            };
            // `\#` and `\!` start literal patterns.
            let body = match body.strip_prefix('\\') {
                Some(rest) if rest.starts_with('#') || rest.starts_with('!') => rest,
                _ => body,
            };
            if body.is_empty() {
                return Err(PatternError {
                    grammar: grammar.as_str(),
                    line: idx + 1,
                    pattern: line.to_string(),
                    reason: "empty pattern after negation".to_string(),
                });
            }
            let compiled = match grammar {
                Grammar::GitIgnore => gitignore::compile(body).map(Matcher::Regex),
                Grammar::ChefIgnore => chefignore::compile(body).map(Matcher::Glob),
            };
            let matcher = compiled.map_err(|reason| PatternError {
                grammar: grammar.as_str(),
                line: idx + 1,
                pattern: line.to_string(),
                reason,
            })?;
            rules.push(Rule { matcher, negated });
        }
        Ok(Self { rules })
    }

    /// Parses raw ignore-file bytes; invalid UTF-8 is replaced rather than rejected.
    pub fn parse_bytes(grammar: Grammar, source: &[u8]) -> Result<Self, PatternError> {
        Self::parse(grammar, &String::from_utf8_lossy(source))
    }

    /// Ignores nothing; stands in for an absent ignore file.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_ignored(&self, path: &str) -> bool {
        let mut ignored = false;
        for rule in &self.rules {
            if rule.matcher.is_match(path) {
                ignored = !rule.negated;
            }
        }
        ignored
    }
}

/// One-shot form of [`IgnoreFile::parse`] + [`IgnoreFile::is_ignored`].
pub fn is_ignored(grammar: Grammar, source: &str, path: &str) -> Result<bool, PatternError> {
    Ok(IgnoreFile::parse(grammar, source)?.is_ignored(path))
}
