//! Per-service endpoint whitelist.
//!
//! A whitelist is an ordered list of rules written as either a bare regular
//! expression (`^/api/v3/system/status$`, any method) or a method-restricted
//! entry (`GET,POST:^/api/v3/movie$`).
//!
//! # Evaluation
//!
//! Rules are evaluated in configured order and the **first rule whose path
//! pattern matches is authoritative**. If that rule restricts methods and the
//! request method is not listed, the request is denied even when a later,
//! broader rule would have allowed it. No matching rule means deny.
//!
//! ```text
//! GET:^/api/v3/readonly$     <- narrow read-only carve-out, must come first
//! ^/api/v3/.*$               <- broader rule
//! ```
//!
//! # Method prefix disambiguation
//!
//! Patterns may legitimately contain a colon (`^/api/v3/movie:\d+$`). The text
//! before the first colon is only treated as a method list when *every*
//! comma-separated token is an uppercase HTTP verb; otherwise the whole entry,
//! colon included, is the regular expression.

use axum::http::Method;
use regex::Regex;
use tracing::warn;

use crate::{Error, Result};

/// HTTP verbs accepted in a rule's method list. Matching is case-sensitive.
const VALID_METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "OPTIONS", "CONNECT", "TRACE",
];

/// One compiled whitelist entry.
#[derive(Debug, Clone)]
pub struct WhitelistRule {
    /// Allowed methods; `None` allows every method.
    methods: Option<Vec<Method>>,
    /// Compiled path pattern.
    pattern: Regex,
}

impl WhitelistRule {
    /// Parse and compile a single rule string.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the path pattern is not a valid regular
    /// expression.
    pub fn parse(entry: &str) -> Result<Self> {
        let (methods, pattern) = split_method_spec(entry);

        let pattern = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("invalid whitelist pattern '{entry}': {e}")))?;

        Ok(Self { methods, pattern })
    }

    /// Whether the rule's path pattern matches `path`, ignoring methods.
    #[must_use]
    pub fn matches_path(&self, path: &str) -> bool {
        self.pattern.is_match(path)
    }

    /// Whether `method` is allowed by this rule's method restriction.
    #[must_use]
    pub fn allows_method(&self, method: &Method) -> bool {
        self.methods
            .as_ref()
            .is_none_or(|allowed| allowed.contains(method))
    }

    /// Allowed methods, `None` when unrestricted.
    #[must_use]
    pub fn methods(&self) -> Option<&[Method]> {
        self.methods.as_deref()
    }

    /// Source text of the compiled path pattern.
    #[must_use]
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

/// Ordered, compiled whitelist for one service.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    rules: Vec<WhitelistRule>,
}

impl Whitelist {
    /// Compile a list of rule strings.
    ///
    /// Entries whose pattern fails to compile are dropped with a warning. If
    /// at least one entry was supplied and none survived, the whitelist is
    /// rejected as a configuration error; an empty input compiles to an empty
    /// whitelist that denies everything.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when every supplied pattern failed to compile.
    pub fn compile(entries: &[String]) -> Result<Self> {
        let mut rules = Vec::with_capacity(entries.len());

        for entry in entries {
            match WhitelistRule::parse(entry) {
                Ok(rule) => rules.push(rule),
                Err(e) => {
                    warn!(pattern = %entry, error = %e, "Failed to compile whitelist regex, skipping");
                }
            }
        }

        if !entries.is_empty() && rules.is_empty() {
            return Err(Error::Config(
                "all whitelist patterns failed to compile".to_string(),
            ));
        }

        Ok(Self { rules })
    }

    /// Check whether `method` on `path` is whitelisted.
    ///
    /// The first rule whose pattern matches decides; its method restriction
    /// is final.
    #[must_use]
    pub fn is_whitelisted(&self, method: &Method, path: &str) -> bool {
        self.rules
            .iter()
            .find(|rule| rule.matches_path(path))
            .is_some_and(|rule| rule.allows_method(method))
    }

    /// Number of compiled rules
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no rule compiled (denies everything)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Compiled rules in evaluation order
    #[must_use]
    pub fn rules(&self) -> &[WhitelistRule] {
        &self.rules
    }
}

/// Check whether `spec` is a comma-separated list of uppercase HTTP verbs.
///
/// Whitespace around each token is ignored. An empty spec, an empty token,
/// a lowercase verb or an unknown verb makes the whole spec invalid.
#[must_use]
pub fn is_valid_method_spec(spec: &str) -> bool {
    !spec.is_empty()
        && spec
            .split(',')
            .map(str::trim)
            .all(|token| VALID_METHODS.contains(&token))
}

/// Split an entry into its method restriction and path pattern.
fn split_method_spec(entry: &str) -> (Option<Vec<Method>>, &str) {
    let Some((spec, pattern)) = entry.split_once(':') else {
        return (None, entry);
    };

    if !is_valid_method_spec(spec) {
        return (None, entry);
    }

    let methods = spec
        .split(',')
        .map(str::trim)
        .filter_map(|token| Method::from_bytes(token.as_bytes()).ok())
        .collect();

    (Some(methods), pattern)
}
