//! Query text rewriting for frozen time
//!
//! Each rule matches a time-producing SQL function or keyword (case
//! insensitive, on word boundaries) and replaces it with a typed literal.
//! Rules run in table order on the output of the previous rule.
//!
//! This is plain text substitution. Keywords inside string constants and
//! quoted aliases are rewritten too, so
//! `SELECT CURRENT_DATE AS "current_date"` keeps working but
//! `SELECT 'CURRENT_DATE'` does not. Triggers and stored functions are not
//! rewritten at all and still see the server clock.

use chrono::{DateTime, FixedOffset, Utc};
use once_cell::sync::Lazy;
use regex::{NoExpand, Regex};
use std::borrow::Cow;

struct RewriteRule {
    pattern: Regex,
    format: &'static str,
    cast: &'static str,
    /// Rendered in the session-local offset instead of UTC
    local: bool,
}

impl RewriteRule {
    fn new(pattern: &str, format: &'static str, cast: &'static str, local: bool) -> Self {
        Self {
            pattern: Regex::new(&format!("(?i){}", pattern)).expect("invalid rewrite pattern"),
            format,
            cast,
            local,
        }
    }

    fn literal(&self, now: &DateTime<Utc>, local_offset: &FixedOffset) -> String {
        let rendered = if self.local {
            now.with_timezone(local_offset).format(self.format).to_string()
        } else {
            now.format(self.format).to_string()
        };
        format!("'{}'::{}", rendered, self.cast)
    }
}

static RULES: Lazy<Vec<RewriteRule>> = Lazy::new(|| {
    vec![
        // Functions
        RewriteRule::new(
            r"\b(?:NOW|CLOCK_TIMESTAMP|STATEMENT_TIMESTAMP|TRANSACTION_TIMESTAMP)\s*\(\s*\)",
            "%Y-%m-%d %H:%M:%S%.6f %z",
            "TIMESTAMPTZ",
            false,
        ),
        // timeofday() returns text; keep it castable back to a timestamp
        RewriteRule::new(
            r"\bTIMEOFDAY\s*\(\s*\)",
            "%Y-%m-%d %H:%M:%S%.6f %z",
            "TEXT",
            false,
        ),
        // Keywords
        RewriteRule::new(r"\bCURRENT_DATE\b", "%Y-%m-%d", "DATE", false),
        RewriteRule::new(r"\bCURRENT_TIME\b", "%H:%M:%S%.6f %z", "TIMETZ", false),
        RewriteRule::new(
            r"\bCURRENT_TIMESTAMP\b",
            "%Y-%m-%d %H:%M:%S%.6f %z",
            "TIMESTAMPTZ",
            false,
        ),
        RewriteRule::new(r"\bLOCALTIME\b", "%H:%M:%S%.6f", "TIME", true),
        RewriteRule::new(r"\bLOCALTIMESTAMP\b", "%Y-%m-%d %H:%M:%S%.6f", "TIMESTAMP", true),
    ]
});

/// Replace every time-producing expression in `sql` with a literal for `now`.
///
/// `local_offset` is the session time zone offset used for `LOCALTIME` and
/// `LOCALTIMESTAMP`. Returns the input untouched when nothing matches.
pub fn rewrite_time_functions<'a>(
    sql: &'a str,
    now: DateTime<Utc>,
    local_offset: FixedOffset,
) -> Cow<'a, str> {
    let mut statement = Cow::Borrowed(sql);

    for rule in RULES.iter() {
        if !rule.pattern.is_match(&statement) {
            continue;
        }
        let literal = rule.literal(&now, &local_offset);
        let replaced = rule.pattern.replace_all(&statement, NoExpand(&literal)).into_owned();
        statement = Cow::Owned(replaced);
    }

    statement
}
