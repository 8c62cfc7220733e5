//! Skill pattern matching.
//!
//! Patterns are plain text with two wildcards: `*` matches any run of
//! characters and `?` matches exactly one. Matching is case-insensitive
//! and unanchored, so `weather*` matches "what's the weather like".

use regex::{Regex, RegexBuilder};

use crate::manifest::SkillDefinition;

/// Compiled patterns for one plugin, in declaration order.
#[derive(Debug, Clone)]
pub struct SkillMatcher {
    entries: Vec<(String, Vec<Regex>)>,
}

impl SkillMatcher {
    /// Compile every skill's patterns.
    ///
    /// Patterns cannot fail to compile because everything except the two
    /// wildcards is escaped; a pattern that somehow does is skipped with a
    /// warning.
    #[must_use]
    pub fn new(skills: &[SkillDefinition]) -> Self {
        let entries = skills
            .iter()
            .map(|skill| {
                let compiled = skill
                    .patterns
                    .iter()
                    .filter_map(|p| match compile_pattern(p) {
                        Ok(re) => Some(re),
                        Err(e) => {
                            tracing::warn!(skill = %skill.name, pattern = %p, error = %e, "Skipping skill pattern");
                            None
                        },
                    })
                    .collect();
                (skill.name.clone(), compiled)
            })
            .collect();
        Self { entries }
    }

    /// First skill, in declaration order, with a pattern matching `query`.
    #[must_use]
    pub fn find(&self, query: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|re| re.is_match(query)))
            .map(|(name, _)| name.as_str())
    }
}

/// Translate a wildcard pattern into a case-insensitive regex.
///
/// # Errors
///
/// Returns the regex compile error.
pub fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let mut source = String::with_capacity(pattern.len().saturating_mul(2));
    let mut literal = String::new();
    for c in pattern.chars() {
        match c {
            '*' | '?' => {
                source.push_str(&regex::escape(&literal));
                literal.clear();
                source.push_str(if c == '*' { ".*" } else { "." });
            },
            _ => literal.push(c),
        }
    }
    source.push_str(&regex::escape(&literal));
    RegexBuilder::new(&source)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
}
