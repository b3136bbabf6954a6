//! `chefignore` grammar: each line is a glob over the whole relative path.
//!
//! Unlike `.gitignore`, `*` and `?` also match `/`, so `test*` covers `test/foo/bar.rb`.

use globset::{GlobBuilder, GlobMatcher};

pub(crate) fn compile(pattern: &str) -> Result<GlobMatcher, String> {
    let pattern = pattern.strip_prefix('/').unwrap_or(pattern);
    if pattern.is_empty() {
        return Err("pattern matches nothing".to_string());
    }
    let glob = GlobBuilder::new(pattern)
        .literal_separator(false)
        .backslash_escape(true)
        .build()
        .map_err(|e| e.kind().to_string())?;
    Ok(glob.compile_matcher())
}
