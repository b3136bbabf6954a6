//! `.gitignore` grammar, translated to an anchored regular expression.
//!
//! - no leading `/`: the pattern may match below any directory (`**/` is implied);
//! - leading `/`: anchored to the root of the cookbook;
//! - trailing `/`: matches everything inside that directory;
//! - `**` as a whole segment spans zero or more directories, anywhere else it is invalid;
//! - `*`, `?` and `[...]` never cross a `/`.

use regex::Regex;

pub(crate) fn compile(pattern: &str) -> Result<Regex, String> {
    let mut segs: Vec<&str> = pattern.split('/').collect();

    if segs.first() == Some(&"") {
        segs.remove(0);
    } else if segs.first() != Some(&"**") {
        segs.insert(0, "**");
    }
    match segs.last_mut() {
        Some(last) if last.is_empty() => *last = "**",
        None => segs.push("**"),
        _ => {}
    }

    let last = segs.len() - 1;
    let mut expr = String::from("^");
    let mut need_slash = false;
    for (i, seg) in segs.iter().enumerate() {
        match *seg {
            "**" if i == 0 && i == last => expr.push_str(".+"),
            "**" if i == 0 => {
                expr.push_str("(?:.+/)?");
                need_slash = false;
            }
            "**" if i == last => expr.push_str("/.+"),
            "**" => {
                expr.push_str("(?:/.+)?");
                need_slash = true;
            }
            "*" => {
                if need_slash {
                    expr.push('/');
                }
                expr.push_str("[^/]+");
                need_slash = true;
            }
            "" => return Err("empty path segment".to_string()),
            seg => {
                if seg.contains("**") {
                    return Err("'**' must be a whole path segment".to_string());
                }
                if need_slash {
                    expr.push('/');
                }
                expr.push_str(&translate_glob(seg)?);
                need_slash = true;
            }
        }
    }
    expr.push('$');

    Regex::new(&expr).map_err(|e| format!("compile {expr:?}: {e}"))
}

/// fnmatch(3) with `FNM_PATHNAME` for a single path segment.
fn translate_glob(glob: &str) -> Result<String, String> {
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let Some(next) = chars.get(i + 1) else {
                    return Err("dangling escape at end of pattern".to_string());
                };
                out.push_str(&regex::escape(&next.to_string()));
                i += 2;
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => {
                let (class, end) = bracket_class(&chars, i)?;
                out.push_str(&class);
                i = end + 1;
                continue;
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    Ok(out)
}

/// Translates the bracket expression starting at `start` (which holds `[`) and returns it with
/// the index of its closing `]`. A `]` directly after the opening (or after `!`/`^`) is literal.
pub(crate) fn bracket_class(chars: &[char], start: usize) -> Result<(String, usize), String> {
    let mut j = start + 1;
    let negated = matches!(chars.get(j), Some('!') | Some('^'));
    if negated {
        j += 1;
    }
    let body_start = j;
    if chars.get(j) == Some(&']') {
        j += 1;
    }
    while j < chars.len() && chars[j] != ']' {
        j += 1;
    }
    if j >= chars.len() {
        return Err("unclosed character class".to_string());
    }

    let mut class = String::from("[");
    if negated {
        class.push('^');
    }
    for &c in &chars[body_start..j] {
        if matches!(c, '\\' | '[' | ']' | '&' | '~' | '^') {
            class.push('\\');
        }
        class.push(c);
    }
    if negated {
        // Class members never cross a path separator.
        class.push('/');
    }
    class.push(']');
    Ok((class, j))
}
