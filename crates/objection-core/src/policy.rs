//! Access control policy evaluation.
//!
//! Buckets carry an ordered list of [`Statement`]s (the bucket policy);
//! individual object versions may carry additional statements (the object
//! ACL). [`evaluate`] combines every applicable statement with explicit
//! deny precedence: one matching deny rejects the request no matter how
//! many allows also match, and a request no statement matches is denied.
//!
//! Statement `action` and `resource` fields accept `*` wildcards;
//! `principal` is an exact identity or the literal `*`.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Effect / Decision
// ---------------------------------------------------------------------------

/// The effect a statement applies when it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    /// The statement permits the request.
    Allow,
    /// The statement rejects the request, overriding any allow.
    Deny,
}

/// The outcome of evaluating a request against a set of statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// At least one allow matched and no deny matched.
    Allow,
    /// A deny matched, or nothing matched at all.
    Deny,
}

impl Decision {
    /// Whether the decision permits the request.
    #[must_use]
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allow)
    }
}

// ---------------------------------------------------------------------------
// Statement
// ---------------------------------------------------------------------------

/// A single access rule.
///
/// A statement matches a request when all three of principal, action, and
/// resource match. Matching statements contribute their [`Effect`] to the
/// final [`Decision`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statement {
    /// Identity the rule applies to; `*` matches any principal.
    pub principal: String,
    /// Action pattern, e.g. `GetObject` or `*`.
    pub action: String,
    /// Resource pattern, e.g. `images/*` or `images/logo.png`.
    pub resource: String,
    /// Whether a match allows or denies.
    pub effect: Effect,
}

impl Statement {
    /// Create a statement.
    #[must_use]
    pub fn new(
        principal: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        effect: Effect,
    ) -> Self {
        Self {
            principal: principal.into(),
            action: action.into(),
            resource: resource.into(),
            effect,
        }
    }

    /// Shorthand for an allow statement.
    #[must_use]
    pub fn allow(
        principal: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self::new(principal, action, resource, Effect::Allow)
    }

    /// Shorthand for a deny statement.
    #[must_use]
    pub fn deny(
        principal: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self::new(principal, action, resource, Effect::Deny)
    }

    /// Whether this statement applies to the given request.
    #[must_use]
    pub fn matches(&self, principal: &str, action: &str, resource: &str) -> bool {
        (self.principal == "*" || self.principal == principal)
            && wildcard_match(&self.action, action)
            && wildcard_match(&self.resource, resource)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate a request against an ordered set of statements.
///
/// Explicit deny overrides allow: a single matching deny yields
/// [`Decision::Deny`] regardless of matching allows. With no matching
/// statement at all the default is deny.
///
/// Callers combine statement sources (bucket policy first, then object
/// ACL) by chaining them into one iterator; precedence is effect-based,
/// not order-based, so the combination order does not change the outcome.
///
/// # Examples
///
/// ```
/// use objection_core::policy::{evaluate, Decision, Statement};
///
/// let statements = vec![
///     Statement::allow("*", "GetObject", "public/*"),
///     Statement::deny("*", "*", "public/internal/*"),
/// ];
///
/// assert_eq!(
///     evaluate(&statements, "alice", "GetObject", "public/logo.png"),
///     Decision::Allow
/// );
/// assert_eq!(
///     evaluate(&statements, "alice", "GetObject", "public/internal/key.pem"),
///     Decision::Deny
/// );
/// ```
pub fn evaluate<'a>(
    statements: impl IntoIterator<Item = &'a Statement>,
    principal: &str,
    action: &str,
    resource: &str,
) -> Decision {
    let mut has_allow = false;
    for statement in statements {
        if !statement.matches(principal, action, resource) {
            continue;
        }
        match statement.effect {
            Effect::Deny => return Decision::Deny,
            Effect::Allow => has_allow = true,
        }
    }
    if has_allow {
        Decision::Allow
    } else {
        Decision::Deny
    }
}

/// Glob matching with `*` wildcards.
///
/// `*` matches any run of characters, including the empty run and path
/// separators. Iterative two-pointer algorithm with backtracking to the
/// most recent star, so pathological patterns stay linear-ish.
#[must_use]
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();

    let (mut p, mut v) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while v < value.len() {
        if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, v));
            p += 1;
        } else if p < pattern.len() && pattern[p] == value[v] {
            p += 1;
            v += 1;
        } else if let Some((star_p, star_v)) = star {
            // Backtrack: let the star absorb one more character.
            p = star_p + 1;
            v = star_v + 1;
            star = Some((star_p, star_v + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}
