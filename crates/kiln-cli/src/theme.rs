//! Terminal styling for kiln's human-readable output.
//!
//! Handler results go to stdout as JSON and are never styled. Colors
//! follow `colored`'s own detection, so `NO_COLOR` and non-tty output get
//! plain text.

use colored::Colorize;

/// Width of table rules under column headings.
const RULE_WIDTH: usize = 64;

/// Formatters for kiln's status lines and plugin tables.
pub(crate) struct Theme;

impl Theme {
    /// Section heading.
    pub(crate) fn header(text: &str) -> String {
        text.bold().cyan().to_string()
    }

    /// A completed step.
    pub(crate) fn success(text: &str) -> String {
        format!("{} {text}", "✓".green())
    }

    /// The fatal error a command exits with.
    pub(crate) fn error(text: &str) -> String {
        format!("{} {}", "✗".red(), text.red())
    }

    /// Something the user should look at, such as a lockfile violation.
    pub(crate) fn warning(text: &str) -> String {
        format!("{} {}", "!".yellow(), text.yellow())
    }

    /// A step about to start.
    pub(crate) fn step(text: &str) -> String {
        format!("{} {text}", "→".blue())
    }

    /// Secondary detail.
    pub(crate) fn dimmed(text: &str) -> String {
        text.dimmed().to_string()
    }

    /// `Key: value` detail line.
    pub(crate) fn kv(key: &str, value: &str) -> String {
        format!("{}: {value}", key.bold())
    }

    /// Column headings followed by a rule.
    pub(crate) fn table_head(columns: &str) -> String {
        format!("  {}\n{}", columns.bold(), "─".repeat(RULE_WIDTH).dimmed())
    }

    /// One row of `kiln list`.
    pub(crate) fn plugin_row(
        id: &str,
        version: &str,
        tools: usize,
        skills: usize,
        source: &str,
    ) -> String {
        format!(
            "  {:<28} {:<10} {tools:>5} {skills:>6}  {}",
            id.bold(),
            version,
            source.dimmed()
        )
    }

    /// Build stages an install ran, or `None` for a verbatim copy.
    pub(crate) fn build_stages(transformed: bool, bundled: bool) -> Option<String> {
        match (transformed, bundled) {
            (false, false) => None,
            (true, false) => Some("transformed".into()),
            (false, true) => Some("bundled".into()),
            (true, true) => Some("transformed, bundled".into()),
        }
    }

    /// Checksum detail for an install report.
    pub(crate) fn checksum(sum: Option<&str>, verified: bool) -> String {
        match sum {
            Some(sum) if verified => format!("sha256:{sum} {}", "(verified)".green()),
            Some(sum) => format!("sha256:{sum}"),
            None => Self::dimmed("not applicable (no registry download)"),
        }
    }

    /// A permission grant, or `none` when the list is empty.
    pub(crate) fn grant(kind: &str, values: &[String]) -> String {
        if values.is_empty() {
            Self::kv(kind, &Self::dimmed("none"))
        } else {
            Self::kv(kind, &values.join(", "))
        }
    }
}
