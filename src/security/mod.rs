//! Security collaborator seam.
//!
//! The router consults an application's [`SecurityHook`] after the request
//! has been matched to the application and before any filter runs. The hook
//! can allow the request (optionally attaching a [`Principal`]) or deny it
//! with a status and challenge. Credentials are checked against an
//! [`IdentityStore`] that the hook owns; there is no process-wide user table.

use std::collections::HashSet;

use dashmap::DashMap;
use subtle::ConstantTimeEq;

use crate::context::Context;

mod basic;

pub use basic::{BasicAuthHook, SecurityConstraint};

/// Session attribute holding the name of the principal that authenticated on it.
pub const PRINCIPAL_SESSION_ATTRIBUTE: &str = "security.principal";

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    name: String,
    roles: HashSet<String>,
}

impl Principal {
    pub fn new<I, S>(name: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.iter().map(String::as_str)
    }
}

/// Outcome of a pre-dispatch security check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityDecision {
    Allow,
    /// Answer with `status` (and a `WWW-Authenticate` challenge, if any)
    /// without running any filter or servlet.
    Deny { status: u16, challenge: Option<String> },
}

/// Pre- and post-dispatch hook for constrained resources.
pub trait SecurityHook: Send + Sync {
    /// Decides whether the request may proceed. May modify the exchange,
    /// e.g. to attach a principal or rotate the session id.
    fn check(&self, ctx: &mut Context) -> SecurityDecision;

    /// Runs after the request dispatch completed.
    fn after(&self, _ctx: &mut Context) {}
}

/// Validates credentials. Implementations are injected into the hooks that need them.
pub trait IdentityStore: Send + Sync {
    fn validate(&self, username: &str, password: &str) -> Option<Principal>;
}

/// Identity store backed by an in-memory user table.
///
/// # Examples
///
/// ```
/// use servlette::security::{IdentityStore, InMemoryIdentityStore};
///
/// let store = InMemoryIdentityStore::new();
/// store.add_user("alice", "s3cret", ["admin"]);
/// assert!(store.validate("alice", "s3cret").unwrap().has_role("admin"));
/// assert!(store.validate("alice", "wrong").is_none());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryIdentityStore {
    users: DashMap<String, (String, Vec<String>)>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a user.
    pub fn add_user<I, S>(&self, username: impl Into<String>, password: impl Into<String>, roles: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.users.insert(
            username.into(),
            (password.into(), roles.into_iter().map(Into::into).collect()),
        );
    }

    pub fn remove_user(&self, username: &str) -> bool {
        self.users.remove(username).is_some()
    }
}

impl IdentityStore for InMemoryIdentityStore {
    fn validate(&self, username: &str, password: &str) -> Option<Principal> {
        let entry = self.users.get(username)?;
        let (expected, roles) = entry.value();
        let matched: bool = expected.as_bytes().ct_eq(password.as_bytes()).into();
        matched.then(|| Principal::new(username, roles.iter().cloned()))
    }
}
