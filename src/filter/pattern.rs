//! The frame-name pattern language used by filters.
//!
//! Patterns are deliberately simpler than regular expressions, since they are typed by people
//! looking at method names full of dots, brackets and generics:
//!
//! - `*` matches any run of characters,
//! - `%` matches a run of word characters (letters, digits and `_`),
//! - `^` anchors at the start of the name and `|` separates alternatives,
//! - `{` and `}` delimit a capture group,
//! - every other character matches itself.
//!
//! Matching ignores case and is unanchored unless `^` is used.
//!
//! Group patterns have the form `pattern->group` or `pattern=>group`. The group side may refer to
//! captures with `$1` through `$9`, and to the whole match with `$&`.

use regex::{Regex, RegexBuilder};

use crate::error::{Error, Result};

/// Splits a `;`-separated pattern list into its non-empty, trimmed entries.
pub fn split_list(patterns: &str) -> impl Iterator<Item = &str> {
    patterns.split(';').map(str::trim).filter(|p| !p.is_empty())
}

/// Translates a pattern into regular expression syntax.
pub fn to_regex(pattern: &str) -> String {
    let mut re = String::with_capacity(pattern.len() * 2);
    let mut buf = [0; 4];
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '%' => re.push_str(r"\w*"),
            '{' => re.push('('),
            '}' => re.push(')'),
            '^' | '|' => re.push(c),
            _ => re.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    re
}

/// Compiles a pattern into a case-insensitive [`Regex`].
pub fn compile(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(&to_regex(pattern))
        .case_insensitive(true)
        .build()
        .map_err(|error| Error::Pattern {
            pattern: pattern.to_string(),
            error,
        })
}

/// Compiles every entry of a `;`-separated list.
pub fn compile_list(patterns: &str) -> Result<Vec<Regex>> {
    split_list(patterns).map(compile).collect()
}

/// A rule that renames matching frames to a group.
#[derive(Clone, Debug)]
pub struct GroupPattern {
    regex: Regex,
    replacement: String,
    entry: bool,
}

impl GroupPattern {
    /// Parses `pattern->group` or `pattern=>group`.
    pub fn parse(spec: &str) -> Result<Self> {
        let arrow = match (spec.find("->"), spec.find("=>")) {
            (Some(plain), Some(entry)) => plain.min(entry),
            (Some(at), None) | (None, Some(at)) => at,
            (None, None) => return Err(Error::GroupPattern(spec.to_string())),
        };
        let entry = spec[arrow..].starts_with("=>");
        let pattern = spec[..arrow].trim();
        let group = spec[arrow + 2..].trim();
        if pattern.is_empty() || group.is_empty() {
            return Err(Error::GroupPattern(spec.to_string()));
        }
        Ok(GroupPattern {
            regex: compile(pattern)?,
            replacement: to_expansion(group),
            entry,
        })
    }

    /// Whether the pattern used `=>`, so that entering the group is kept distinct per frame.
    pub fn is_entry(&self) -> bool {
        self.entry
    }

    /// The group name for `name`, if the pattern matches it.
    pub fn apply(&self, name: &str) -> Option<String> {
        let captures = self.regex.captures(name)?;
        let mut group = String::new();
        captures.expand(&self.replacement, &mut group);
        Some(group)
    }
}

/// Parses every entry of a `;`-separated list of group patterns.
pub fn parse_group_list(patterns: &str) -> Result<Vec<GroupPattern>> {
    split_list(patterns).map(GroupPattern::parse).collect()
}

// Rewrites `$&` and `$1`..`$9` into the braced form `Captures::expand` understands, so a group
// name like `$1Lib` does not turn into a reference to a capture named `1Lib`. Any other `$` is
// literal.
fn to_expansion(group: &str) -> String {
    let mut out = String::with_capacity(group.len() + 8);
    let mut chars = group.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('&') => {
                chars.next();
                out.push_str("${0}");
            }
            Some(&d) if d.is_ascii_digit() && d != '0' => {
                chars.next();
                out.push_str("${");
                out.push(d);
                out.push('}');
            }
            _ => out.push_str("$$"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_wildcards() {
        assert_eq!(to_regex("System.*"), r"System\..*");
        assert_eq!(to_regex("^mscorlib!%"), r"^mscorlib!\w*");
        assert_eq!(to_regex("{%}!*"), r"(\w*)!.*");
        assert_eq!(to_regex("a|b(x)"), r"a|b\(x\)");
    }

    #[test]
    fn matches_ignore_case() {
        let re = compile("^ntdll!*").unwrap();
        assert!(re.is_match("NTDLL!RtlUserThreadStart"));
        assert!(!re.is_match("kernel32!ntdll!x"));
        let re = compile("List<T>.Add").unwrap();
        assert!(re.is_match("System.Collections.Generic.List<T>.Add(T)"));
        assert!(!re.is_match("ListxT>.Add"));
    }

    #[test]
    fn lists_skip_blanks() {
        let res = compile_list(" a ;; b* ;").unwrap();
        assert_eq!(res.len(), 2);
        assert!(res[1].is_match("bcd"));
    }

    #[test]
    fn group_patterns() {
        let g = GroupPattern::parse("{%}!->module $1").unwrap();
        assert!(!g.is_entry());
        assert_eq!(g.apply("clr!JIT_New").as_deref(), Some("module clr"));
        assert_eq!(g.apply("no module here"), None);

        let g = GroupPattern::parse("^System.*=>$&Lib").unwrap();
        assert!(g.is_entry());
        assert_eq!(g.apply("system.io.read").as_deref(), Some("system.io.readLib"));

        let g = GroupPattern::parse("*->costs $5").unwrap();
        assert_eq!(g.apply("x").as_deref(), Some("costs "));
    }

    #[test]
    fn malformed_group_patterns() {
        assert!(matches!(
            GroupPattern::parse("no arrow"),
            Err(Error::GroupPattern(_))
        ));
        assert!(matches!(
            GroupPattern::parse("->group"),
            Err(Error::GroupPattern(_))
        ));
        assert!(matches!(
            GroupPattern::parse("x{->group"),
            Err(Error::Pattern { .. })
        ));
    }
}
